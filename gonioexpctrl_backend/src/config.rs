//! Rig configuration, loaded from TOML.
//!
//! Every section and field is optional; missing values take the defaults below. Durations are
//! written in humantime form:
//!
//! ```toml
//! [remote]
//! host = "127.0.0.1"
//! port = 50071
//! retries = 100
//! retry_interval = "1s"
//!
//! [sequencer]
//! trigger_direction = "send"
//! settle = "500ms"
//!
//! [trial]
//! repeats = 3
//! isi = [10.0, 12.0, 14.0]
//! flash_type = "squarelogsweep,0.5,100"
//! ```

use std::path::Path;
use std::time::Duration;

use goniocompiler_backend::{LengthPolicy, TrialParameters};
use serde::{Deserialize, Serialize};

use crate::camera::TriggerDirection;
use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Camera server.
    pub remote: RemoteConfig,
    /// Analog voltage input server.
    pub vio: RemoteConfig,
    pub serial: SerialConfig,
    pub motors: MotorsConfig,
    pub analog: AnalogConfig,
    pub sequencer: SequencerConfig,
    pub trial: TrialParameters,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            vio: RemoteConfig::vio_default(),
            serial: SerialConfig::default(),
            motors: MotorsConfig::default(),
            analog: AnalogConfig::default(),
            sequencer: SequencerConfig::default(),
            trial: TrialParameters::default(),
        }
    }
}

impl RigConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Extra connection attempts after the first one fails.
    pub retries: usize,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Program and arguments that start the server locally; `--port <port>` is appended.
    pub server_command: Option<Vec<String>>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50071,
            retries: 100,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(10),
            server_command: None,
        }
    }
}

impl RemoteConfig {
    pub fn vio_default() -> Self {
        Self {
            port: 50072,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "COM4".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_millis(100),
        }
    }
}

/// One motor, optionally paired with an encoder channel that reports its position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub motor: usize,
    #[serde(default)]
    pub sensor: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorsConfig {
    /// Width of the window around a target that counts as reached, in sensor units.
    pub tolerance: f64,
    /// Motor run time of one correction pulse, seconds.
    pub step: f64,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long shutdown waits for sensor axes to return to zero.
    #[serde(with = "humantime_serde")]
    pub return_timeout: Duration,
    /// Horizontal and vertical goniometer axes come first.
    pub axes: Vec<AxisConfig>,
}

impl Default for MotorsConfig {
    fn default() -> Self {
        Self {
            tolerance: 5.,
            step: 0.1,
            poll_interval: Duration::from_millis(100),
            return_timeout: Duration::from_secs(30),
            axes: vec![
                AxisConfig { motor: 0, sensor: Some(0) },
                AxisConfig { motor: 1, sensor: Some(1) },
                // Microscope focus
                AxisConfig { motor: 2, sensor: None },
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogConfig {
    /// Terminal carrying the camera's trigger output.
    pub trigger_terminal: String,
    /// Playback timeout as a multiple of the nominal playback duration.
    pub timeout_factor: f64,
    /// Sample clock of triggered level changes.
    pub level_samp_rate: f64,
    #[serde(with = "humantime_serde")]
    pub level_trigger_timeout: Duration,
}

impl Default for AnalogConfig {
    fn default() -> Self {
        Self {
            trigger_terminal: "/Dev1/PFI0".to_string(),
            timeout_factor: 1.5,
            level_samp_rate: 10000.,
            level_trigger_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub trigger_direction: TriggerDirection,
    /// Illumination settle time before arming the camera.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Cancellation polling period during inter-stimulus waits.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub length_policy: LengthPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            trigger_direction: TriggerDirection::Send,
            settle: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            length_policy: LengthPolicy::Collapse,
        }
    }
}
