//! Text command link to the remote servers (camera, analog input).
//!
//! ## Protocol
//!
//! Every command opens its own TCP connection, writes one UTF-8 payload and, if a response is
//! expected, reads until the server closes the connection:
//!
//! ```text
//! command;arg1:arg2:...      e.g. acquireSeries;0.01:0:250:im_pos(0, 0)_rep0:fly/pos(0, 0):send
//! command                    commands without arguments, e.g. get_cameras
//! ```
//!
//! A response containing `:` is a list of fields, anything else is plain text.
//!
//! ## Retries
//!
//! Connection failures are retried up to `retries` times with a fixed `retry_interval` in
//! between. The interval is not slept after the final attempt, so `retries = 0` fails after a
//! single refused connection without delay.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::RemoteError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Text(String),
    Fields(Vec<String>),
}

impl Response {
    fn parse(raw: String) -> Self {
        if raw.contains(':') {
            Response::Fields(raw.split(':').map(str::to_string).collect())
        } else {
            Response::Text(raw)
        }
    }

    /// Response as a single string, fields re-joined with `:`.
    pub fn text(&self) -> String {
        match self {
            Response::Text(text) => text.clone(),
            Response::Fields(fields) => fields.join(":"),
        }
    }

    pub fn fields(&self) -> Vec<String> {
        match self {
            Response::Text(text) if text.is_empty() => Vec::new(),
            Response::Text(text) => vec![text.clone()],
            Response::Fields(fields) => fields.clone(),
        }
    }
}

/// Starts a remote server process on the local machine.
pub trait ServerLauncher {
    fn launch(&self, port: u16) -> Result<(), RemoteError>;
}

/// Launches the server by spawning `program args... --port <port>` with stdout discarded.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Launcher for a `[program, args...]` command line, `None` if it is empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ServerLauncher for CommandLauncher {
    fn launch(&self, port: u16) -> Result<(), RemoteError> {
        info!("Starting server `{}` on port {}", self.program, port);
        Command::new(&self.program)
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| RemoteError::Launch {
                program: self.program.clone(),
                source,
            })?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RemoteLink {
    host: String,
    port: u16,
    retries: usize,
    retry_interval: Duration,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RemoteLink {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            retries: config.retries,
            retry_interval: config.retry_interval,
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends `command` with `args` using the configured retry budget.
    pub fn call(
        &self,
        command: &str,
        args: &[&str],
        expect_response: bool,
    ) -> Result<Option<Response>, RemoteError> {
        self.call_with_retries(command, args, expect_response, self.retries)
    }

    pub fn call_with_retries(
        &self,
        command: &str,
        args: &[&str],
        expect_response: bool,
        retries: usize,
    ) -> Result<Option<Response>, RemoteError> {
        let payload = if args.is_empty() {
            command.to_string()
        } else {
            format!("{};{}", command, args.join(":"))
        };
        debug!("-> {}:{} {}", self.host, self.port, payload);

        let mut stream = self.connect(retries)?;
        let io_err = |source| RemoteError::Io {
            host: self.host.clone(),
            port: self.port,
            source,
        };
        stream.write_all(payload.as_bytes()).map_err(io_err)?;
        stream.flush().map_err(io_err)?;
        if !expect_response {
            return Ok(None);
        }

        stream.shutdown(Shutdown::Write).map_err(io_err)?;
        stream
            .set_read_timeout(Some(self.response_timeout))
            .map_err(io_err)?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).map_err(io_err)?;
        let response = Response::parse(String::from_utf8_lossy(&raw).into_owned());
        debug!("<- {}:{} {:?}", self.host, self.port, response);
        Ok(Some(response))
    }

    fn connect(&self, retries: usize) -> Result<TcpStream, RemoteError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_connect() {
                Ok(stream) => return Ok(stream),
                Err(source) if attempts > retries => {
                    return Err(RemoteError::ConnectionUnavailable {
                        host: self.host.clone(),
                        port: self.port,
                        attempts,
                        source,
                    })
                }
                Err(e) => {
                    warn!(
                        "Connection to {}:{} failed ({}), retrying in {:?}",
                        self.host, self.port, e, self.retry_interval
                    );
                    std::thread::sleep(self.retry_interval);
                }
            }
        }
    }

    fn try_connect(&self) -> std::io::Result<TcpStream> {
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} resolved to no address", self.host),
        );
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// `true` if the server accepts a connection on the first attempt.
    pub fn ping(&self) -> bool {
        self.call_with_retries("ping", &["Client wants to know if server is running"], false, 0)
            .is_ok()
    }

    /// Launches the server through `launcher` unless it already answers a ping. Returns whether a
    /// launch was needed.
    pub fn ensure_reachable(&self, launcher: &dyn ServerLauncher) -> Result<bool, RemoteError> {
        if self.ping() {
            return Ok(false);
        }
        launcher.launch(self.port)?;
        Ok(true)
    }
}
