//! Pre-recorded stimuli that replace the synthesized stimulus channel.
//!
//! A recording is stored as JSON with its native sample rate and up to ten stimulus traces:
//!
//! ```json
//! { "fs": 10000, "stim_0": [0.0, 0.1, ...], "stim_1": [...] }
//! ```
//!
//! Repeat `i` of a sequence plays trace `i mod n`. The recording's sample rate overrides the
//! trial sample rate for every channel, see [`crate::synthesizer`].

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::Array1;
use serde::Deserialize;

use crate::error::{Result, SynthesisError};

/// Highest `stim_N` key looked up in a recording.
const MAX_TRACES: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct OverloadStimulus {
    samp_rate: f64,
    traces: Vec<Array1<f64>>,
}

#[derive(Deserialize)]
struct RecordingFile {
    fs: f64,
    #[serde(flatten)]
    traces: BTreeMap<String, serde_json::Value>,
}

impl OverloadStimulus {
    pub fn new(samp_rate: f64, traces: Vec<Vec<f64>>) -> Result<Self> {
        Self::checked(samp_rate, traces.into_iter().map(Array1::from).collect(), "memory")
    }

    fn checked(samp_rate: f64, traces: Vec<Array1<f64>>, source_name: &str) -> Result<Self> {
        let fail = |reason: &str| SynthesisError::OverloadLoad {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        };
        if !(samp_rate.is_finite() && samp_rate > 0.) {
            return Err(fail("sample rate must be positive"));
        }
        if traces.is_empty() {
            return Err(fail("recording holds no stimulus traces"));
        }
        if traces.iter().any(|trace| trace.is_empty()) {
            return Err(fail("recording holds an empty stimulus trace"));
        }
        Ok(Self { samp_rate, traces })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::parse(json, "<string>")
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source_name = path.display().to_string();
        let json = std::fs::read_to_string(path).map_err(|e| SynthesisError::OverloadLoad {
            source_name: source_name.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&json, &source_name)
    }

    fn parse(json: &str, source_name: &str) -> Result<Self> {
        let fail = |reason: String| SynthesisError::OverloadLoad {
            source_name: source_name.to_string(),
            reason,
        };
        let file: RecordingFile = serde_json::from_str(json).map_err(|e| fail(e.to_string()))?;
        let mut traces = Vec::new();
        for i_stim in 0..MAX_TRACES {
            let Some(value) = file.traces.get(&format!("stim_{}", i_stim)) else {
                continue;
            };
            let samples: Vec<f64> =
                serde_json::from_value(value.clone()).map_err(|e| fail(format!("stim_{}: {}", i_stim, e)))?;
            traces.push(Array1::from(samples));
        }
        Self::checked(file.fs, traces, source_name)
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    pub fn num_traces(&self) -> usize {
        self.traces.len()
    }

    /// Trace played on repeat `index`.
    pub fn trace_for(&self, index: usize) -> &Array1<f64> {
        &self.traces[index % self.traces.len()]
    }
}
