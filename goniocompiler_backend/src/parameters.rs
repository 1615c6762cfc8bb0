//! Trial timing parameters and their resolution into a per-sequence plan.
//!
//! ## Overview
//!
//! [`TrialParameters`] is the operator-facing description of an imaging sequence: window
//! durations, frame length, repeat count, LED levels, output channels and the stimulus waveform
//! tag. Two of its fields may vary from repeat to repeat, the stimulus intensity (`flash_on`) and
//! the inter-stimulus interval (`isi`). Both are [`PerRepeat`] values, written either as a single
//! number or as a list.
//!
//! At the start of a sequence the parameters are resolved exactly once into a [`TrialPlan`]:
//! per-repeat values become fixed-length arrays, the waveform tag is parsed, and degenerate
//! timing is rejected. A plan is immutable for the lifetime of the sequence.
//!
//! ## Per-repeat coercion
//!
//! | given | `repeats = 3` resolves to |
//! |---|---|
//! | `2.0` | `[2.0, 2.0, 2.0]` |
//! | `[1.0, 2.0, 3.0]` | `[1.0, 2.0, 3.0]` |
//! | `[1.0, 2.0]` | `[1.0, 1.0, 1.0]` under [`LengthPolicy::Collapse`], an error under [`LengthPolicy::Strict`] |
//!
//! Collapse is the default since operator-edited lists frequently fall out of step with the
//! repeat count; every collapse is logged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SynthesisError};
use crate::overload::OverloadStimulus;
use crate::utils::{samples_for, whole_frames};
use crate::waveform::WaveformType;

/// A parameter given either once for all repeats or once per repeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerRepeat {
    Scalar(f64),
    Sequence(Vec<f64>),
}

/// What to do with a [`PerRepeat::Sequence`] whose length differs from the repeat count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPolicy {
    /// Broadcast the first element to every repeat.
    #[default]
    Collapse,
    /// Reject the parameters.
    Strict,
}

impl PerRepeat {
    /// Coerces the value to exactly `repeats` entries.
    ///
    /// ```
    /// use goniocompiler_backend::parameters::{LengthPolicy, PerRepeat};
    ///
    /// let isi = PerRepeat::Scalar(2.0);
    /// assert_eq!(isi.resolve("isi", 3, LengthPolicy::Collapse).unwrap(), vec![2.0, 2.0, 2.0]);
    ///
    /// let isi = PerRepeat::Sequence(vec![1.0, 2.0]);
    /// assert_eq!(isi.resolve("isi", 3, LengthPolicy::Collapse).unwrap(), vec![1.0, 1.0, 1.0]);
    /// assert!(isi.resolve("isi", 3, LengthPolicy::Strict).is_err());
    /// ```
    pub fn resolve(&self, name: &'static str, repeats: usize, policy: LengthPolicy) -> Result<Vec<f64>> {
        match self {
            PerRepeat::Scalar(value) => Ok(vec![*value; repeats]),
            PerRepeat::Sequence(values) if values.len() == repeats => Ok(values.clone()),
            PerRepeat::Sequence(values) => {
                let first = *values.first().ok_or_else(|| SynthesisError::InvalidParameter {
                    name,
                    reason: "per-repeat list is empty".to_string(),
                })?;
                match policy {
                    LengthPolicy::Collapse => {
                        warn!(
                            "`{}` has {} entries for {} repeats, using its first value {} for every repeat",
                            name,
                            values.len(),
                            repeats,
                            first
                        );
                        Ok(vec![first; repeats])
                    }
                    LengthPolicy::Strict => Err(SynthesisError::InvalidParameter {
                        name,
                        reason: format!("expected {} entries, got {}", repeats, values.len()),
                    }),
                }
            }
        }
    }
}

impl From<f64> for PerRepeat {
    fn from(value: f64) -> Self {
        PerRepeat::Scalar(value)
    }
}

impl From<Vec<f64>> for PerRepeat {
    fn from(values: Vec<f64>) -> Self {
        PerRepeat::Sequence(values)
    }
}

/// One analog output line, or a group of lines that are driven with the same waveform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputChannel {
    Line(String),
    Group(Vec<String>),
}

impl OutputChannel {
    pub fn lines(&self) -> Vec<&str> {
        match self {
            OutputChannel::Line(line) => vec![line.as_str()],
            OutputChannel::Group(lines) => lines.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for OutputChannel {
    fn from(line: &str) -> Self {
        OutputChannel::Line(line.to_string())
    }
}

/// Timing, level and routing parameters of an imaging sequence.
///
/// Durations are in seconds, levels in volts at the analog output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialParameters {
    pub pre_stim: f64,
    pub stim: f64,
    pub post_stim: f64,
    pub frame_length: f64,
    pub repeats: usize,
    /// Stimulus intensity per repeat.
    pub flash_on: PerRepeat,
    /// Stimulus level the output settles to after playback.
    pub flash_off: f64,
    /// Inter-stimulus interval per repeat.
    pub isi: PerRepeat,
    pub ir_imaging: f64,
    /// Illumination between repeats; also the level illumination settles to after playback.
    pub ir_waiting: f64,
    pub ir_livefeed: f64,
    /// Stimulus waveform tag, see [`WaveformType`].
    pub flash_type: String,
    pub flash_channel: OutputChannel,
    pub ir_channel: OutputChannel,
    pub trigger_channel: OutputChannel,
    /// Sample rate of the synthesized waveforms, Hz.
    pub fs: f64,
    /// High level of the camera trigger square wave.
    pub trigger_amplitude: f64,
    /// Appended to the position subfolder of every repeat.
    pub suffix: String,
}

impl Default for TrialParameters {
    fn default() -> Self {
        Self {
            pre_stim: 1.,
            stim: 0.5,
            post_stim: 1.,
            frame_length: 0.01,
            repeats: 1,
            flash_on: PerRepeat::Scalar(8.),
            flash_off: 0.,
            isi: PerRepeat::Scalar(10.),
            ir_imaging: 5.,
            ir_waiting: 0.,
            ir_livefeed: 1.,
            flash_type: "square".to_string(),
            flash_channel: OutputChannel::from("Dev1/ao0"),
            ir_channel: OutputChannel::from("Dev1/ao1"),
            trigger_channel: OutputChannel::from("Dev1/ao2"),
            fs: 1000.,
            trigger_amplitude: 5.,
            suffix: String::new(),
        }
    }
}

impl TrialParameters {
    pub fn total_duration(&self) -> f64 {
        self.pre_stim + self.stim + self.post_stim
    }

    pub fn stimulus_finalval(&self) -> f64 {
        self.flash_off
    }

    pub fn illumination_finalval(&self) -> f64 {
        self.ir_waiting
    }

    /// Frames recorded per repeat, `floor((pre + stim + post) / frame_length)`.
    pub fn frame_count(&self) -> usize {
        whole_frames(self.total_duration(), self.frame_length)
    }

    /// Samples per channel per repeat, `round((pre + stim + post) * fs)`.
    pub fn sample_count(&self) -> usize {
        samples_for(self.total_duration(), self.fs)
    }

    fn validate(&self) -> Result<()> {
        let check = |name: &'static str, ok: bool, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(SynthesisError::InvalidParameter {
                    name,
                    reason: reason.to_string(),
                })
            }
        };
        check("pre_stim", self.pre_stim.is_finite() && self.pre_stim >= 0., "must be a non-negative duration")?;
        check("stim", self.stim.is_finite() && self.stim >= 0., "must be a non-negative duration")?;
        check("post_stim", self.post_stim.is_finite() && self.post_stim >= 0., "must be a non-negative duration")?;
        check("frame_length", self.frame_length.is_finite() && self.frame_length > 0., "must be positive")?;
        check("fs", self.fs.is_finite() && self.fs > 0., "must be a positive sample rate")?;
        check("pre_stim", self.sample_count() > 0, "trial window is shorter than one sample")?;
        Ok(())
    }
}

/// Parameters resolved for one sequence: per-repeat arrays, parsed waveform type and an optional
/// pre-recorded stimulus.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialPlan {
    params: TrialParameters,
    flash_on: Vec<f64>,
    isi: Vec<f64>,
    waveform: WaveformType,
    overload: Option<OverloadStimulus>,
}

impl TrialPlan {
    pub fn resolve(params: &TrialParameters, policy: LengthPolicy) -> Result<Self> {
        params.validate()?;
        let waveform = params.flash_type.parse::<WaveformType>()?;
        let flash_on = params.flash_on.resolve("flash_on", params.repeats, policy)?;
        let isi = params.isi.resolve("isi", params.repeats, policy)?;
        for &interval in &isi {
            interval_duration(interval)?;
        }
        Ok(Self {
            params: params.clone(),
            flash_on,
            isi,
            waveform,
            overload: None,
        })
    }

    /// Replaces the synthesized stimulus of every repeat with a pre-recorded one.
    pub fn with_overload(mut self, overload: OverloadStimulus) -> Self {
        self.overload = Some(overload);
        self
    }

    pub fn params(&self) -> &TrialParameters {
        &self.params
    }

    pub fn repeats(&self) -> usize {
        self.params.repeats
    }

    pub fn waveform(&self) -> WaveformType {
        self.waveform
    }

    pub fn overload(&self) -> Option<&OverloadStimulus> {
        self.overload.as_ref()
    }

    pub fn flash_on(&self) -> &[f64] {
        &self.flash_on
    }

    pub fn isi(&self) -> &[f64] {
        &self.isi
    }

    pub(crate) fn check_repeat(&self, index: usize) -> Result<()> {
        if index < self.params.repeats {
            Ok(())
        } else {
            Err(SynthesisError::RepeatOutOfRange {
                index,
                repeats: self.params.repeats,
            })
        }
    }

    /// Inter-stimulus interval following repeat `index`.
    pub fn isi_for(&self, index: usize) -> Result<f64> {
        self.check_repeat(index)?;
        Ok(self.isi[index])
    }

    /// [`Self::isi_for`] as a [`Duration`].
    pub fn isi_duration(&self, index: usize) -> Result<Duration> {
        interval_duration(self.isi_for(index)?)
    }

    /// Stimulus intensity of repeat `index`.
    pub fn intensity_for(&self, index: usize) -> Result<f64> {
        self.check_repeat(index)?;
        Ok(self.flash_on[index])
    }
}

fn interval_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| SynthesisError::InvalidParameter {
        name: "isi",
        reason: format!("interval {} is not a non-negative duration", seconds),
    })
}
