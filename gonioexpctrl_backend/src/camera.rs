//! Camera server client.
//!
//! The camera server owns the camera device, stores the images and shows the live feed. This
//! side only sends short text commands over a [`RemoteLink`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::remote::{CommandLauncher, RemoteLink, Response, ServerLauncher};
use crate::utils::py_bool;

/// Exposure of a single snap image, seconds.
const SNAP_EXPOSURE: f64 = 0.1;

/// Which side of the camera-to-DAQ trigger cable drives the sequence timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    /// The camera sends a trigger when its acquisition starts; playback waits for that edge.
    Send,
    /// The camera receives frame triggers from the rig's trigger output channel.
    Receive,
}

impl fmt::Display for TriggerDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TriggerDirection::Send => write!(f, "send"),
            TriggerDirection::Receive => write!(f, "receive"),
        }
    }
}

/// Acquisition commands the trial sequencer and the rig need from a camera server.
pub trait AcquisitionRemote {
    /// Arms a series of `frames` images, saved under `subdir` with `label`.
    fn acquire_series(
        &self,
        exposure: f64,
        interval: f64,
        frames: usize,
        label: &str,
        subdir: &str,
        direction: TriggerDirection,
    ) -> Result<(), RemoteError>;

    fn acquire_single(&self, save: bool, subdir: &str) -> Result<(), RemoteError>;

    fn set_saving_directory(&self, path: &str) -> Result<(), RemoteError>;

    fn save_description(&self, name: &str, text: &str) -> Result<(), RemoteError>;

    /// Asks the server to shut itself down.
    fn close_server(&self) -> Result<(), RemoteError>;
}

#[derive(Clone, Debug)]
pub struct CameraClient {
    link: RemoteLink,
}

impl CameraClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            link: RemoteLink::new(config),
        }
    }

    /// Client for the configured server. With a `server_command` configured, a server that does
    /// not answer a ping is started before the client is returned.
    pub fn connect(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = Self::new(config);
        let launcher = config
            .server_command
            .as_deref()
            .and_then(CommandLauncher::from_command_line);
        if let Some(launcher) = launcher {
            if client.ensure_running(&launcher)? {
                info!("Camera server launched on port {}", config.port);
            }
        }
        Ok(client)
    }

    pub fn from_link(link: RemoteLink) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &RemoteLink {
        &self.link
    }

    pub fn is_server_running(&self) -> bool {
        self.link.ping()
    }

    /// Starts a local camera server unless one is already answering.
    pub fn ensure_running(&self, launcher: &dyn ServerLauncher) -> Result<bool, RemoteError> {
        self.link.ensure_reachable(launcher)
    }

    fn send(&self, command: &str, args: &[&str]) -> Result<(), RemoteError> {
        self.link.call(command, args, false).map(|_| ())
    }

    fn query(&self, command: &str, args: &[&str]) -> Result<Response, RemoteError> {
        Ok(self
            .link
            .call(command, args, true)?
            .unwrap_or_else(|| Response::Text(String::new())))
    }

    /// Names of the cameras available on the server.
    pub fn get_cameras(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.query("get_cameras", &[])?.fields())
    }

    /// Name of the camera currently in use.
    pub fn get_camera(&self) -> Result<String, RemoteError> {
        Ok(self.query("get_camera", &[])?.text())
    }

    pub fn set_camera(&self, name: &str) -> Result<(), RemoteError> {
        self.send("set_camera", &[name])
    }

    /// Names of the settings the current camera exposes.
    pub fn get_settings(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.query("get_settings", &[])?.fields())
    }

    /// One of `"string"`, `"float"` or `"integer"`.
    pub fn get_setting_type(&self, name: &str) -> Result<String, RemoteError> {
        Ok(self.query("get_setting_type", &[name])?.text())
    }

    pub fn get_setting(&self, name: &str) -> Result<String, RemoteError> {
        Ok(self.query("get_setting", &[name])?.text())
    }

    pub fn set_setting(&self, name: &str, value: &str) -> Result<(), RemoteError> {
        self.send("set_setting", &[name, value])
    }

    /// Region of interest as `(x, y, width, height)` in pixels.
    pub fn set_roi(&self, roi: (u32, u32, u32, u32)) -> Result<(), RemoteError> {
        let (x, y, w, h) = roi;
        self.send(
            "set_roi",
            &[&x.to_string(), &y.to_string(), &w.to_string(), &h.to_string()],
        )
    }

    pub fn set_save_stack(&self, save_stack: bool) -> Result<(), RemoteError> {
        self.send("set_save_stack", &[py_bool(save_stack)])
    }
}

impl AcquisitionRemote for CameraClient {
    fn acquire_series(
        &self,
        exposure: f64,
        interval: f64,
        frames: usize,
        label: &str,
        subdir: &str,
        direction: TriggerDirection,
    ) -> Result<(), RemoteError> {
        self.send(
            "acquireSeries",
            &[
                &exposure.to_string(),
                &interval.to_string(),
                &frames.to_string(),
                label,
                subdir,
                &direction.to_string(),
            ],
        )
    }

    fn acquire_single(&self, save: bool, subdir: &str) -> Result<(), RemoteError> {
        self.send(
            "acquireSingle",
            &[&SNAP_EXPOSURE.to_string(), py_bool(save), subdir],
        )
    }

    fn set_saving_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.send("setSavingDirectory", &[path])
    }

    fn save_description(&self, name: &str, text: &str) -> Result<(), RemoteError> {
        self.send("saveDescription", &[name, text])
    }

    /// A server that is already gone counts as closed.
    fn close_server(&self) -> Result<(), RemoteError> {
        match self.link.call_with_retries("exit", &["None"], false, 0) {
            Ok(_) => Ok(()),
            Err(RemoteError::ConnectionUnavailable { .. }) => {
                debug!("Camera server was not running");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to close camera server: {}", e);
                Err(e)
            }
        }
    }
}
