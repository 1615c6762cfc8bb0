//! Trial sequencer: runs the repeats of one imaging sequence.
//!
//! ## Per-repeat flow
//!
//! ```text
//!  Idle ─► Arming ─► Playing ─► Waiting ─► Arming ─► ... ─► Done
//!            │                     │
//!            └── cancelled ────────┴──► Aborted
//! ```
//!
//! 1. Poll the cancellation callback; a `false` answer aborts the sequence.
//! 2. Snapshot the goniometer angles and synthesize the repeat's waveforms.
//! 3. Illumination to `ir_imaging`, let it settle, arm the camera with `acquireSeries`.
//! 4. Play the waveforms. With [`TriggerDirection::Send`] the stimulus and illumination wait for
//!    the camera's trigger edge; with [`TriggerDirection::Receive`] they start immediately and
//!    the trigger channel clocks the camera.
//! 5. Illumination to `ir_waiting`.
//! 6. Wait out the inter-stimulus interval, minus the settle time of the next repeat, polling the
//!    cancellation callback. The last repeat does not wait; its interval is recorded as the
//!    earliest start of the next sequence instead.
//!
//! Whatever happens, the illumination is put back to `ir_livefeed` before returning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use goniocompiler_backend::{SynthesisError, TrialPlan};
use tracing::{info, warn};

use crate::analog::AnalogDispatcher;
use crate::camera::{AcquisitionRemote, TriggerDirection};
use crate::config::SequencerConfig;
use crate::error::Result;
use crate::utils::Clock;

/// Current goniometer angles, `(horizontal, vertical)`.
pub trait AngleSource: Send + Sync {
    fn angles(&self) -> (i32, i32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Arming,
    Playing,
    Waiting,
    Aborted,
    Done,
}

/// Where and under which name a sequence stores its images.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrialSession {
    /// Preparation name; the top-level data folder.
    pub preparation: String,
    /// Appended after the trial parameters' own suffix.
    pub suffix: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrialRecord {
    pub label: String,
    pub position: (i32, i32),
    pub repeat: usize,
    pub subdir: String,
    pub frames: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SequenceReport {
    /// Repeats that were played, in order.
    pub records: Vec<TrialRecord>,
    /// [`SequencerState::Done`] or [`SequencerState::Aborted`].
    pub status: SequencerState,
}

pub struct TrialDevices<'a> {
    pub remote: &'a dyn AcquisitionRemote,
    pub dispatcher: &'a AnalogDispatcher,
    pub angles: &'a dyn AngleSource,
}

pub fn position_label(position: (i32, i32)) -> String {
    format!("pos({}, {})", position.0, position.1)
}

pub struct TrialSequencer {
    trigger_direction: TriggerDirection,
    settle: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    state: SequencerState,
    next_available_start: Option<Instant>,
}

impl TrialSequencer {
    pub fn new(config: &SequencerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            trigger_direction: config.trigger_direction,
            settle: config.settle,
            poll_interval: config.poll_interval,
            clock,
            state: SequencerState::Idle,
            next_available_start: None,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Earliest start of the next sequence, set by the last repeat of the previous one.
    pub fn next_available_start(&self) -> Option<Instant> {
        self.next_available_start
    }

    pub fn trigger_direction(&self) -> TriggerDirection {
        self.trigger_direction
    }

    pub fn set_trigger_direction(&mut self, direction: TriggerDirection) {
        self.trigger_direction = direction;
    }

    /// Runs every repeat of `plan`.
    ///
    /// `proceed` is called with the repeat index before each repeat and while waiting between
    /// repeats; returning `false` aborts the sequence. An aborted sequence is not an error: the
    /// report carries the repeats played so far and [`SequencerState::Aborted`].
    pub fn run(
        &mut self,
        plan: &TrialPlan,
        session: &TrialSession,
        devices: &TrialDevices,
        mut proceed: Option<&mut dyn FnMut(usize) -> bool>,
    ) -> Result<SequenceReport> {
        if let Some(start) = self.next_available_start.take() {
            if start > self.clock.now() {
                info!("Waiting for the inter-stimulus interval of the previous sequence");
                self.clock.sleep_until(start);
            }
        }
        info!("Starting sequence of {} repeats", plan.repeats());

        let result = self.run_repeats(plan, session, devices, &mut proceed);
        let params = plan.params();
        let cleanup = devices
            .dispatcher
            .set_level(&params.ir_channel, params.ir_livefeed, false);

        match (result, cleanup) {
            (Ok(report), Ok(())) => {
                self.state = report.status;
                info!("Sequence {:?} after {} repeats", report.status, report.records.len());
                Ok(report)
            }
            (Ok(_), Err(e)) => {
                self.state = SequencerState::Aborted;
                Err(e.into())
            }
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!("Failed to restore live-feed illumination: {}", cleanup_err);
                }
                self.state = SequencerState::Aborted;
                Err(e)
            }
        }
    }

    fn run_repeats(
        &mut self,
        plan: &TrialPlan,
        session: &TrialSession,
        devices: &TrialDevices,
        proceed: &mut Option<&mut dyn FnMut(usize) -> bool>,
    ) -> Result<SequenceReport> {
        let params = plan.params();
        let suffix = format!("{}{}", params.suffix, session.suffix);
        let subdir_for = |position: (i32, i32)| {
            format!("{}/{}{}", session.preparation, position_label(position), suffix)
        };

        let start_position = devices.angles.angles();
        devices
            .remote
            .save_description(&session.preparation, &subdir_for(start_position))?;

        let mut records = Vec::with_capacity(plan.repeats());
        for i in 0..plan.repeats() {
            if !keep_going(proceed, i) {
                return Ok(self.aborted(records));
            }
            self.state = SequencerState::Arming;

            let position = devices.angles.angles();
            let waves = plan.synthesize(i)?;
            // Counted on the synthesized trigger grid, one frame per rising edge
            let frames = waves.frame_count(params.frame_length);
            let label = format!("im_{}_rep{}", position_label(position), i);
            let subdir = subdir_for(position);
            info!("Imaging {}", label);

            devices
                .dispatcher
                .set_level(&params.ir_channel, params.ir_imaging, false)?;
            self.clock.sleep(self.settle);
            devices.remote.acquire_series(
                params.frame_length,
                0.,
                frames,
                &label,
                &subdir,
                self.trigger_direction,
            )?;

            self.state = SequencerState::Playing;
            match self.trigger_direction {
                TriggerDirection::Send => devices.dispatcher.play(
                    &[
                        (&params.flash_channel, waves.stimulus.view()),
                        (&params.ir_channel, waves.illumination.view()),
                    ],
                    waves.samp_rate,
                    true,
                )?,
                TriggerDirection::Receive => devices.dispatcher.play(
                    &[
                        (&params.flash_channel, waves.stimulus.view()),
                        (&params.ir_channel, waves.illumination.view()),
                        (&params.trigger_channel, waves.trigger.view()),
                    ],
                    waves.samp_rate,
                    false,
                )?,
            }
            devices
                .dispatcher
                .set_level(&params.ir_channel, params.ir_waiting, false)?;

            records.push(TrialRecord {
                label,
                position,
                repeat: i,
                subdir,
                frames,
            });

            let isi = plan.isi_duration(i)?;
            if i + 1 == plan.repeats() {
                self.next_available_start = Some(later_by(self.clock.now(), isi)?);
                break;
            }

            self.state = SequencerState::Waiting;
            let wakeup = later_by(self.clock.now(), isi.saturating_sub(self.settle))?;
            loop {
                let now = self.clock.now();
                if now >= wakeup {
                    break;
                }
                if !keep_going(proceed, i) {
                    return Ok(self.aborted(records));
                }
                self.clock.sleep(self.poll_interval.min(wakeup - now));
            }
        }

        Ok(SequenceReport {
            records,
            status: SequencerState::Done,
        })
    }

    fn aborted(&self, records: Vec<TrialRecord>) -> SequenceReport {
        info!("Sequence cancelled after {} repeats", records.len());
        SequenceReport {
            records,
            status: SequencerState::Aborted,
        }
    }
}

fn later_by(now: Instant, isi: Duration) -> Result<Instant> {
    now.checked_add(isi).ok_or_else(|| {
        SynthesisError::InvalidParameter {
            name: "isi",
            reason: format!("interval of {:?} is out of range", isi),
        }
        .into()
    })
}

fn keep_going(proceed: &mut Option<&mut dyn FnMut(usize) -> bool>, repeat: usize) -> bool {
    match proceed {
        Some(callback) => (*callback)(repeat),
        None => true,
    }
}
