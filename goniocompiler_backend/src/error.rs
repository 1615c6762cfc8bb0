//! Error type shared by parameter resolution and waveform synthesis.
//!
//! Every failure here is raised before any hardware is touched: a sequence resolves its
//! [`TrialPlan`](crate::parameters::TrialPlan) up front, so a malformed waveform tag or a
//! degenerate timing parameter stops the run before the first repeat is armed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SynthesisError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    /// Unknown waveform-type tag or a sweep range that does not parse.
    #[error("Invalid waveform spec '{spec}': {reason}")]
    InvalidWaveformSpec { spec: String, reason: String },

    #[error("Invalid trial parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Repeat index {index} is out of range for a sequence of {repeats} repeats")]
    RepeatOutOfRange { index: usize, repeats: usize },

    /// Pre-recorded stimulus could not be read or decoded.
    #[error("Failed to load overload stimulus from {source_name}: {reason}")]
    OverloadLoad { source_name: String, reason: String },
}
