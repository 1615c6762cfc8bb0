//! Python bindings, built with the `python` feature.
//!
//! ```python
//! from goniocompiler_backend import StimulusBuilder
//!
//! builder = StimulusBuilder('{"repeats": 3, "flash_on": [1.0, 2.0, 3.0]}')
//! stimulus, illumination, trigger, fs = builder.synthesize(0)
//! ```

use numpy::PyArray;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::error::SynthesisError;
use crate::overload::OverloadStimulus;
use crate::parameters::{LengthPolicy, TrialParameters, TrialPlan};

impl From<SynthesisError> for PyErr {
    fn from(err: SynthesisError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

#[pyclass]
pub struct StimulusBuilder {
    plan: TrialPlan,
}

#[pymethods]
impl StimulusBuilder {
    /// Resolves trial parameters given as a JSON object; missing fields take their defaults.
    #[new]
    #[pyo3(signature = (params_json=None, strict=false))]
    pub fn new(params_json: Option<&str>, strict: bool) -> PyResult<Self> {
        let params: TrialParameters = match params_json {
            Some(json) => serde_json::from_str(json).map_err(|e| PyValueError::new_err(e.to_string()))?,
            None => TrialParameters::default(),
        };
        let policy = if strict {
            LengthPolicy::Strict
        } else {
            LengthPolicy::Collapse
        };
        Ok(Self {
            plan: TrialPlan::resolve(&params, policy)?,
        })
    }

    pub fn load_overload(&mut self, path: &str) -> PyResult<()> {
        let overload = OverloadStimulus::from_json_file(path)?;
        self.plan = self.plan.clone().with_overload(overload);
        Ok(())
    }

    pub fn repeats(&self) -> usize {
        self.plan.repeats()
    }

    pub fn waveform(&self) -> String {
        self.plan.waveform().to_string()
    }

    /// Returns `(stimulus, illumination, trigger, fs)` for repeat `repeat_index`.
    pub fn synthesize(
        &self,
        repeat_index: usize,
        py: Python,
    ) -> PyResult<(PyObject, PyObject, PyObject, f64)> {
        let waves = self.plan.synthesize(repeat_index)?;
        Ok((
            PyArray::from_array(py, &waves.stimulus).to_object(py),
            PyArray::from_array(py, &waves.illumination).to_object(py),
            PyArray::from_array(py, &waves.trigger).to_object(py),
            waves.samp_rate,
        ))
    }

    /// Frames the camera records during repeat `repeat_index`.
    pub fn frame_count(&self, repeat_index: usize) -> PyResult<usize> {
        let waves = self.plan.synthesize(repeat_index)?;
        Ok(waves.frame_count(self.plan.params().frame_length))
    }
}
