//! Sample-accurate synthesis of the per-repeat output waveforms.
//!
//! ## Overview
//!
//! Every repeat of an imaging sequence plays three analog channels from one shared sample clock:
//!
//! ```text
//!                      _________ flash_on[i]
//! stimulus     _______|         |____________________  (last sample = flash_off)
//!              ______________________________________
//! illumination                                       | (ir_imaging, last sample = ir_waiting)
//!              _   _   _   _   _   _   _   _   _   _
//! trigger     | |_| |_| |_| |_| |_| |_| |_| |_| |_| |_ (one rising edge per frame, last sample = 0)
//!              pre_stim |  stim  |  post_stim
//! ```
//!
//! [`synthesize`] (or [`TrialPlan::synthesize`] once a plan is resolved) is a pure function of
//! the parameters and the repeat index: the same inputs always produce bit-identical arrays.
//!
//! ## Sample grid
//!
//! All channels hold `round((pre_stim + stim + post_stim) * fs)` samples. The stimulus window
//! boundaries are rounded onto the same grid, so the three windows always add up to the full
//! length.
//!
//! ## Final values
//!
//! Analog outputs hold the last written sample once a finite task ends. The last sample of each
//! channel is therefore overwritten with its idle level, leaving the LEDs at a defined level and
//! the trigger line low between repeats.
//!
//! ## Overload stimulus
//!
//! When the plan carries an [`OverloadStimulus`], its trace replaces the stimulus channel
//! verbatim and its sample rate becomes the effective rate of the repeat. Illumination and
//! trigger are then synthesized at that rate and with the trace's length.
//! [`TrialWaveforms::samp_rate`] always reports the rate the arrays were built for.

use ndarray::{s, Array1};

use crate::error::Result;
use crate::overload::OverloadStimulus;
use crate::parameters::{LengthPolicy, TrialParameters, TrialPlan};
use crate::utils::{samples_for, whole_frames};

/// The three output waveforms of one repeat.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialWaveforms {
    pub stimulus: Array1<f64>,
    pub illumination: Array1<f64>,
    pub trigger: Array1<f64>,
    /// Effective sample rate of all three arrays.
    pub samp_rate: f64,
}

impl TrialWaveforms {
    pub fn len(&self) -> usize {
        self.stimulus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimulus.is_empty()
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.samp_rate
    }

    /// Camera frames that fit into the playback.
    pub fn frame_count(&self, frame_length: f64) -> usize {
        whole_frames(self.duration(), frame_length)
    }
}

/// Resolves `params` with the default [`LengthPolicy`] and synthesizes repeat `repeat_index`.
///
/// ```
/// use goniocompiler_backend::parameters::TrialParameters;
/// use goniocompiler_backend::synthesizer::synthesize;
///
/// let params = TrialParameters { pre_stim: 1., stim: 0.5, post_stim: 1., fs: 1000., ..Default::default() };
/// let waves = synthesize(&params, 0).unwrap();
/// assert_eq!(waves.stimulus.len(), 2500);
/// assert_eq!(waves.illumination.len(), 2500);
/// assert_eq!(waves.trigger.len(), 2500);
/// ```
pub fn synthesize(params: &TrialParameters, repeat_index: usize) -> Result<TrialWaveforms> {
    TrialPlan::resolve(params, LengthPolicy::default())?.synthesize(repeat_index)
}

impl TrialPlan {
    pub fn synthesize(&self, repeat_index: usize) -> Result<TrialWaveforms> {
        self.check_repeat(repeat_index)?;
        let params = self.params();

        let (stimulus, samp_rate) = match self.overload() {
            Some(overload) => overload_stimulus(overload, repeat_index),
            None => (
                self.stimulus(self.intensity_for(repeat_index)?),
                params.fs,
            ),
        };
        let nsamps = stimulus.len();

        let mut illumination = Array1::from_elem(nsamps, params.ir_imaging);
        force_last(&mut illumination, params.illumination_finalval());

        let frames = whole_frames(nsamps as f64 / samp_rate, params.frame_length);
        let mut trigger = square_wave(
            nsamps,
            params.frame_length * samp_rate,
            frames,
            params.trigger_amplitude,
        );
        force_last(&mut trigger, 0.);

        Ok(TrialWaveforms {
            stimulus,
            illumination,
            trigger,
            samp_rate,
        })
    }

    fn stimulus(&self, intensity: f64) -> Array1<f64> {
        let params = self.params();
        let fs = params.fs;
        let nsamps = params.sample_count();
        let start = samples_for(params.pre_stim, fs).min(nsamps);
        let end = samples_for(params.pre_stim + params.stim, fs).clamp(start, nsamps);

        let waveform = self.waveform();
        let mut buffer = Array1::from_elem(nsamps, waveform.rest_level());
        {
            let mut window = buffer.slice_mut(s![start..end]);
            // Sample times relative to the stimulus onset, spanning the stimulus window end to end
            window.assign(&Array1::linspace(0., params.stim, end - start));
            waveform.eval_inplace(&mut window, params.stim);
        }
        buffer.mapv_inplace(|v| v * intensity);
        force_last(&mut buffer, params.stimulus_finalval());
        buffer
    }
}

fn overload_stimulus(overload: &OverloadStimulus, repeat_index: usize) -> (Array1<f64>, f64) {
    (overload.trace_for(repeat_index).clone(), overload.samp_rate())
}

/// Square wave with a period of `period_samps` samples, high during the first half of each of
/// the first `frames` periods and low afterwards.
///
/// The level is taken from each sample's position within the true (fractional) period, so the
/// number of rising edges equals `frames` whatever the ratio of frame length to sample rate.
fn square_wave(nsamps: usize, period_samps: f64, frames: usize, amplitude: f64) -> Array1<f64> {
    // Both half periods need at least one sample
    let period = period_samps.max(2.);
    Array1::from_shape_fn(nsamps, |k| {
        let x = k as f64 / period;
        if (x.floor() as usize) < frames && x.fract() < 0.5 {
            amplitude
        } else {
            0.
        }
    })
}

fn force_last(arr: &mut Array1<f64>, value: f64) {
    if let Some(last) = arr.last_mut() {
        *last = value;
    }
}
