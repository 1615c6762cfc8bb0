// Client of the analog voltage input/output (VIO) server, which records analog signals next to
// the imaging data.

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::remote::RemoteLink;
use crate::utils::py_bool;

#[derive(Clone, Debug)]
pub struct VioClient {
    link: RemoteLink,
}

impl VioClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            link: RemoteLink::new(config),
        }
    }

    pub fn link(&self) -> &RemoteLink {
        &self.link
    }

    /// Records `duration` seconds of analog input on the server, optionally gated on its trigger.
    pub fn analog_input(&self, duration: f64, wait_trigger: bool) -> Result<(), RemoteError> {
        self.link
            .call("analog_input", &[&duration.to_string(), py_bool(wait_trigger)], false)
            .map(|_| ())
    }

    /// Input device, channels (joined with `,`) and sample rate used by following recordings.
    pub fn set_settings(&self, device: &str, channels: &[&str], fs: f64) -> Result<(), RemoteError> {
        self.link
            .call("set_settings", &[device, &channels.join(","), &fs.to_string()], false)
            .map(|_| ())
    }
}
