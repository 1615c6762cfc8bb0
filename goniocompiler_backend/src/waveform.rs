//! Stimulus waveform types and their evaluation over time arrays.
//!
//! ## Main Structures:
//!
//! - [`WaveformType`]: the shape of the stimulus LED drive during the stimulus window. A plain
//!   `Square` pulse, or one of three logarithmic frequency sweeps (chirps) that differ in how the
//!   chirp is quantized: `SineLogSweep` (continuous), `SquareLogSweep` (two levels) and
//!   `ThreeStepLogSweep` (three levels).
//!
//! ## Tags
//!
//! Waveform types are written as text tags in trial parameters, e.g. `"square"`,
//! `"sinelogsweep"` or `"squarelogsweep,0.5,100"`. A sweep tag may carry an explicit
//! `f0,f1` frequency range in Hz; without one the sweep runs from 0.5 Hz to 100 Hz.
//! Unknown tags and malformed ranges are rejected with
//! [`SynthesisError::InvalidWaveformSpec`].
//!
//! ## Evaluation
//!
//! [`WaveformType::eval_inplace`] takes an array view holding sample times and overwrites it in place with the normalized
//! waveform (range `[0, 1]`). Scaling by intensity and padding with the pre/post windows is the
//! synthesizer's job.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SynthesisError};

/// Default sweep range used when a sweep tag carries no `f0,f1` suffix.
pub const DEFAULT_SWEEP_RANGE: (f64, f64) = (0.5, 100.);

/// Chirp phase offset in degrees; `-90` turns the cosine chirp into a sine starting at zero.
const CHIRP_PHI_DEG: f64 = -90.;

/// Compiled once, shared by every parse.
static WAVEFORM_TAG: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^\s*(square|sinelogsweep|squarelogsweep|3steplogsweep)\s*(?:,(.*))?$"));

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WaveformType {
    Square,
    SineLogSweep { f0: f64, f1: f64 },
    SquareLogSweep { f0: f64, f1: f64 },
    ThreeStepLogSweep { f0: f64, f1: f64 },
}

impl fmt::Display for WaveformType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaveformType::Square => write!(f, "square"),
            WaveformType::SineLogSweep { f0, f1 } => write!(f, "sinelogsweep,{},{}", f0, f1),
            WaveformType::SquareLogSweep { f0, f1 } => write!(f, "squarelogsweep,{},{}", f0, f1),
            WaveformType::ThreeStepLogSweep { f0, f1 } => {
                write!(f, "3steplogsweep,{},{}", f0, f1)
            }
        }
    }
}

impl FromStr for WaveformType {
    type Err = SynthesisError;

    /// Parses a waveform tag.
    ///
    /// ```
    /// use goniocompiler_backend::waveform::WaveformType;
    ///
    /// assert_eq!("square".parse::<WaveformType>().unwrap(), WaveformType::Square);
    /// assert_eq!(
    ///     "squarelogsweep,1,50".parse::<WaveformType>().unwrap(),
    ///     WaveformType::SquareLogSweep { f0: 1., f1: 50. }
    /// );
    /// assert!("triangle".parse::<WaveformType>().is_err());
    /// ```
    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| SynthesisError::InvalidWaveformSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let re = (*WAVEFORM_TAG).as_ref().map_err(|e| invalid(&e.to_string()))?;
        let caps = re.captures(spec).ok_or_else(|| {
            invalid("expected one of square, sinelogsweep, squarelogsweep, 3steplogsweep")
        })?;
        let kind = caps.get(1).map_or("", |m| m.as_str());

        if kind == "square" {
            if caps.get(2).is_some() {
                return Err(invalid("square pulses take no frequency range"));
            }
            return Ok(WaveformType::Square);
        }

        let (f0, f1) = match caps.get(2) {
            None => DEFAULT_SWEEP_RANGE,
            Some(range) => {
                let parts: Vec<&str> = range.as_str().split(',').map(str::trim).collect();
                if parts.len() != 2 {
                    return Err(invalid("sweep range must be given as `f0,f1`"));
                }
                let parse = |s: &str| {
                    s.parse::<f64>()
                        .map_err(|_| invalid(&format!("`{}` is not a frequency", s)))
                };
                (parse(parts[0])?, parse(parts[1])?)
            }
        };
        if !(f0.is_finite() && f1.is_finite()) || f0 <= 0. || f1 <= 0. {
            return Err(invalid("logarithmic sweep frequencies must be positive"));
        }

        Ok(match kind {
            "sinelogsweep" => WaveformType::SineLogSweep { f0, f1 },
            "squarelogsweep" => WaveformType::SquareLogSweep { f0, f1 },
            _ => WaveformType::ThreeStepLogSweep { f0, f1 },
        })
    }
}

impl WaveformType {
    /// Level used in the pre- and post-stimulus windows, before intensity scaling.
    ///
    /// A square pulse rests at zero; sweeps swing around the mid level so they rest at 0.5.
    pub fn rest_level(&self) -> f64 {
        match self {
            WaveformType::Square => 0.,
            _ => 0.5,
        }
    }

    /// Overwrites `t_arr` (sample times in seconds, relative to the stimulus onset) with the
    /// normalized waveform. `stim_time` is the length of the stimulus window and sets the sweep
    /// end time.
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>, stim_time: f64) {
        match *self {
            WaveformType::Square => t_arr.fill(1.),
            WaveformType::SineLogSweep { f0, f1 } => {
                t_arr.map_inplace(|t| *t = (log_chirp(*t, f0, f1, stim_time) + 1.) / 2.)
            }
            WaveformType::SquareLogSweep { f0, f1 } => t_arr.map_inplace(|t| {
                let x = log_chirp(*t, f0, f1, stim_time);
                *t = (x.signum_or_zero() + 1.) / 2.
            }),
            WaveformType::ThreeStepLogSweep { f0, f1 } => {
                let cstep = (PI / 4.).sin();
                t_arr.map_inplace(|t| {
                    let x = log_chirp(*t, f0, f1, stim_time);
                    let level = if x.abs() <= cstep {
                        0.
                    } else if x > cstep {
                        1.
                    } else {
                        -1.
                    };
                    *t = (level + 1.) / 2.
                })
            }
        }
    }
}

/// Logarithmic chirp `cos(phase(t) + phi)` sweeping from `f0` at `t = 0` to `f1` at `t = t1`.
pub fn log_chirp(t: f64, f0: f64, f1: f64, t1: f64) -> f64 {
    let phase = if f0 == f1 || t1 <= 0. {
        2. * PI * f0 * t
    } else {
        let beta = t1 / (f1 / f0).ln();
        2. * PI * beta * f0 * ((f1 / f0).powf(t / t1) - 1.)
    };
    (phase + CHIRP_PHI_DEG.to_radians()).cos()
}

trait SignumOrZero {
    fn signum_or_zero(self) -> f64;
}

impl SignumOrZero for f64 {
    // `f64::signum` maps 0.0 to 1.0; the square sweep keeps exact zeros at zero.
    fn signum_or_zero(self) -> f64 {
        if self > 0. {
            1.
        } else if self < 0. {
            -1.
        } else {
            0.
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn parse_tags() {
        assert_eq!(
            "sinelogsweep".parse::<WaveformType>().unwrap(),
            WaveformType::SineLogSweep { f0: 0.5, f1: 100. }
        );
        assert_eq!(
            " 3steplogsweep, 2, 20 ".parse::<WaveformType>().unwrap(),
            WaveformType::ThreeStepLogSweep { f0: 2., f1: 20. }
        );
        assert!("sinelogsweep,1".parse::<WaveformType>().is_err());
        assert!("sinelogsweep,a,b".parse::<WaveformType>().is_err());
        assert!("sinelogsweep,0,10".parse::<WaveformType>().is_err());
        assert!("square,1,2".parse::<WaveformType>().is_err());
        assert!("".parse::<WaveformType>().is_err());
    }

    #[test]
    fn parse_from_many_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    (0..100)
                        .map(|j| format!("squarelogsweep,{},{}", i + 1, j + 10).parse::<WaveformType>())
                        .all(|parsed| parsed.is_ok())
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        let wtype = WaveformType::SquareLogSweep { f0: 0.5, f1: 100. };
        assert_eq!(wtype.to_string().parse::<WaveformType>().unwrap(), wtype);
    }

    #[test]
    fn chirp_starts_at_zero_and_follows_start_frequency() {
        assert!(log_chirp(0., 1., 10., 1.).abs() < 1e-12);
        // Constant frequency sweep degenerates into a plain sine
        let quarter_period = 0.25;
        assert!((log_chirp(quarter_period, 1., 1., 1.) - 1.).abs() < 1e-12);
    }

    #[test]
    fn quantized_sweeps_stay_on_their_levels() {
        let times = Array1::linspace(0., 1., 500);
        for wtype in [
            WaveformType::SquareLogSweep { f0: 0.5, f1: 100. },
            WaveformType::ThreeStepLogSweep { f0: 0.5, f1: 100. },
        ] {
            let mut arr = times.clone();
            wtype.eval_inplace(&mut arr.view_mut(), 1.);
            assert!(arr.iter().all(|&v| v == 0. || v == 0.5 || v == 1.));
        }

        let mut arr = times.clone();
        WaveformType::SineLogSweep { f0: 0.5, f1: 100. }.eval_inplace(&mut arr.view_mut(), 1.);
        assert!(arr.iter().all(|&v| (0. ..=1.).contains(&v)));
    }
}
