//! # Goniometer trial compiler backend
//!
//! Pure, hardware-free half of the goniometer imaging rig: it turns operator trial parameters
//! into the sample arrays played on the rig's analog outputs.
//!
//! - [`parameters`]: [`TrialParameters`] and their resolution into an immutable [`TrialPlan`].
//! - [`waveform`]: stimulus waveform tags and the logarithmic sweep generators.
//! - [`synthesizer`]: per-repeat stimulus, illumination and camera trigger arrays.
//! - [`overload`]: pre-recorded stimuli that replace the synthesized stimulus.
//!
//! Nothing in this crate blocks or touches hardware; `gonioexpctrl_backend` plays the arrays.

pub mod error;
pub mod overload;
pub mod parameters;
pub mod synthesizer;
pub mod utils;
pub mod waveform;

#[cfg(feature = "python")]
pub mod python;

pub use error::*;
pub use overload::*;
pub use parameters::*;
pub use synthesizer::*;
pub use waveform::*;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn goniocompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::StimulusBuilder>()?;
    Ok(())
}
