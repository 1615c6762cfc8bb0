//! Error types of the device-coordination layer.
//!
//! Each concern has its own enum so that callers talking to a single device can match on a
//! narrow type; [`Error`] collects all of them for the sequencer and the rig façade.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use goniocompiler_backend::SynthesisError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// Every connection attempt was refused or timed out.
    #[error("Cannot connect to {host}:{port} after {attempts} attempt(s): {source}")]
    ConnectionUnavailable {
        host: String,
        port: u16,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while talking to {host}:{port}: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch server `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Playback did not complete within {timeout:?}")]
    PlaybackTimeout { timeout: Duration },

    #[error("Nothing to play: no output channels or empty waveforms")]
    EmptyOutput,

    #[error("Waveform for {channel} has {found} samples, expected {expected}")]
    LengthMismatch {
        channel: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid analog output channel name `{0}`, expected e.g. `Dev1/ao0`")]
    InvalidChannel(String),

    #[error("Channel {0} is listed more than once")]
    DuplicateChannel(String),

    #[error("Invalid sample rate {0}")]
    InvalidSampleRate(f64),

    #[error("Invalid playback timeout {0}")]
    InvalidTimeout(f64),

    /// Error reported by the analog-output driver.
    #[error("Driver error: {0}")]
    Driver(String),
}

#[derive(Error, Debug)]
pub enum MotorError {
    #[error("Serial link error: {0}")]
    Serial(#[from] io::Error),

    #[error("No motor with index {0}")]
    InvalidMotor(usize),

    #[error("Sensor {0} does not report a position")]
    SensorUnavailable(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize parameters: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MacroError {
    #[error("Line {line}: invalid macro step `{text}`: {reason}")]
    InvalidStep {
        line: usize,
        text: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Macro(#[from] MacroError),
}
