//! Multi-channel analog output playback.
//!
//! ## Overview
//!
//! [`AnalogDispatcher`] takes one waveform per [`OutputChannel`], expands channel groups into
//! their lines, stacks everything into a single `(lines, samples)` buffer and plays it as one
//! finite, sample-clocked task, so all lines share a sample clock. Playback optionally waits for
//! a rising edge on the configured trigger terminal before starting, and blocks until the task
//! is done or `timeout_factor` times the nominal duration has passed.
//!
//! Static levels (LEDs between repeats) go through [`AnalogDispatcher::set_level`]: a single
//! on-demand write, or a two-sample task started by a falling trigger edge.
//!
//! ## Backends
//!
//! The dispatcher talks to hardware through [`AnalogBackend`], which creates [`OutputTask`]s
//! mirroring the NI-DAQmx task model. [`SimulatedBackend`] records every committed task for dry
//! runs and tests; the NI-DAQmx backend lives in [`crate::nidaqmx`] behind the `nidaqmx` feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use goniocompiler_backend::OutputChannel;
use indexmap::IndexMap;
use ndarray::{Array2, ArrayView1};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::AnalogConfig;
use crate::error::DispatchError;
use crate::utils::TickTimer;

type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// One hardware output task. Channels, timing and trigger are configured before the first
/// write.
pub trait OutputTask {
    fn create_ao_chan(&self, name: &str) -> DispatchResult<()>;
    /// Finite generation of `seq_len` samples per channel at `samp_rate`.
    fn cfg_sample_clk(&self, samp_rate: f64, seq_len: u64) -> DispatchResult<()>;
    fn cfg_dig_edge_start_trigger(&self, source: &str, edge: Edge) -> DispatchResult<()>;
    /// Writes a `(channels, samples)` buffer; returns samples written per channel.
    fn write_analog(&self, signal_arr: &Array2<f64>, auto_start: bool) -> DispatchResult<usize>;
    fn start(&self) -> DispatchResult<()>;
    /// `Ok(false)` if the task is still running after `timeout`.
    fn wait_until_done(&self, timeout: Duration) -> DispatchResult<bool>;
    fn stop(&self) -> DispatchResult<()>;
}

pub trait AnalogBackend: Send + Sync {
    fn new_task(&self) -> DispatchResult<Box<dyn OutputTask>>;
}

pub struct AnalogDispatcher {
    backend: Arc<dyn AnalogBackend>,
    trigger_terminal: String,
    timeout_factor: f64,
    level_samp_rate: f64,
    level_trigger_timeout: Duration,
    channel_re: Regex,
}

impl AnalogDispatcher {
    pub fn new(backend: Arc<dyn AnalogBackend>, config: &AnalogConfig) -> DispatchResult<Self> {
        let channel_re = Regex::new(r"^/?\w+/ao\d+$").map_err(|e| DispatchError::Driver(e.to_string()))?;
        if !(config.timeout_factor.is_finite() && config.timeout_factor > 0.) {
            return Err(DispatchError::InvalidTimeout(config.timeout_factor));
        }
        Ok(Self {
            backend,
            trigger_terminal: config.trigger_terminal.clone(),
            timeout_factor: config.timeout_factor,
            level_samp_rate: config.level_samp_rate,
            level_trigger_timeout: config.level_trigger_timeout,
            channel_re,
        })
    }

    fn check_line<'a>(&self, line: &'a str) -> DispatchResult<&'a str> {
        if self.channel_re.is_match(line) {
            Ok(line)
        } else {
            Err(DispatchError::InvalidChannel(line.to_string()))
        }
    }

    /// Plays `outputs` from one shared sample clock and blocks until playback completes.
    pub fn play(
        &self,
        outputs: &[(&OutputChannel, ArrayView1<f64>)],
        samp_rate: f64,
        wait_trigger: bool,
    ) -> DispatchResult<()> {
        let mut timer = TickTimer::new();
        if !(samp_rate.is_finite() && samp_rate > 0.) {
            return Err(DispatchError::InvalidSampleRate(samp_rate));
        }
        let nsamps = match outputs.first() {
            Some((_, waveform)) if !waveform.is_empty() => waveform.len(),
            _ => return Err(DispatchError::EmptyOutput),
        };
        let seconds = self.timeout_factor * nsamps as f64 / samp_rate;
        let timeout = Duration::try_from_secs_f64(seconds).map_err(|_| DispatchError::InvalidTimeout(seconds))?;

        // Group members each get a copy of the group's waveform
        let mut lines: IndexMap<&str, ArrayView1<f64>> = IndexMap::new();
        for (channel, waveform) in outputs {
            for line in channel.lines() {
                let line = self.check_line(line)?;
                if waveform.len() != nsamps {
                    return Err(DispatchError::LengthMismatch {
                        channel: line.to_string(),
                        expected: nsamps,
                        found: waveform.len(),
                    });
                }
                if lines.insert(line, waveform.view()).is_some() {
                    return Err(DispatchError::DuplicateChannel(line.to_string()));
                }
            }
        }
        if lines.is_empty() {
            return Err(DispatchError::EmptyOutput);
        }

        let mut signal_arr = Array2::<f64>::zeros((lines.len(), nsamps));
        for (mut row, waveform) in signal_arr.rows_mut().into_iter().zip(lines.values()) {
            row.assign(waveform);
        }

        let task = self.backend.new_task()?;
        for line in lines.keys() {
            task.create_ao_chan(line)?;
        }
        task.cfg_sample_clk(samp_rate, nsamps as u64)?;
        if wait_trigger {
            task.cfg_dig_edge_start_trigger(&self.trigger_terminal, Edge::Rising)?;
        }
        task.write_analog(&signal_arr, false)?;
        timer.tick_debug(&format!("{} lines x {} samples cfg & bufwrite", lines.len(), nsamps));

        task.start()?;
        let done = task.wait_until_done(timeout)?;
        timer.tick_debug("playback");
        finish(task.as_ref(), done, timeout)
    }

    /// Sets every line of `channel` to `value`.
    pub fn set_level(&self, channel: &OutputChannel, value: f64, wait_trigger: bool) -> DispatchResult<()> {
        let lines = channel
            .lines()
            .into_iter()
            .map(|line| self.check_line(line))
            .collect::<DispatchResult<Vec<_>>>()?;
        if lines.is_empty() {
            return Err(DispatchError::EmptyOutput);
        }
        debug!("Level {} on {:?} (trigger: {})", value, lines, wait_trigger);

        let task = self.backend.new_task()?;
        for line in &lines {
            task.create_ao_chan(line)?;
        }
        if !wait_trigger {
            task.write_analog(&Array2::from_elem((lines.len(), 1), value), true)?;
            return Ok(());
        }

        task.cfg_sample_clk(self.level_samp_rate, 2)?;
        task.cfg_dig_edge_start_trigger(&self.trigger_terminal, Edge::Falling)?;
        task.write_analog(&Array2::from_elem((lines.len(), 2), value), false)?;
        task.start()?;
        let done = task.wait_until_done(self.level_trigger_timeout)?;
        finish(task.as_ref(), done, self.level_trigger_timeout)
    }
}

/// Stops a task after waiting on it. A timeout is reported even when stopping fails too.
fn finish(task: &dyn OutputTask, done: bool, timeout: Duration) -> DispatchResult<()> {
    if done {
        return task.stop();
    }
    if let Err(e) = task.stop() {
        warn!("Failed to stop timed-out task: {}", e);
    }
    Err(DispatchError::PlaybackTimeout { timeout })
}

/// A task as committed to the simulated hardware.
#[derive(Clone, Debug, PartialEq)]
pub struct Playback {
    pub channels: Vec<String>,
    /// `None` for on-demand writes.
    pub samp_rate: Option<f64>,
    pub trigger: Option<(String, Edge)>,
    /// `(channels, samples)`
    pub data: Array2<f64>,
}

impl Playback {
    pub fn row(&self, channel: &str) -> Option<ArrayView1<'_, f64>> {
        let i = self.channels.iter().position(|c| c == channel)?;
        Some(self.data.row(i))
    }
}

#[derive(Default)]
struct SimState {
    playbacks: Vec<Playback>,
    levels: IndexMap<String, f64>,
}

/// Analog backend that plays nothing and records everything.
///
/// Clones share their records. A stalled backend never completes a clocked task, which makes
/// every playback time out.
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    stall: Arc<AtomicBool>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Every completed task, in order.
    pub fn playbacks(&self) -> Vec<Playback> {
        self.state.lock().playbacks.clone()
    }

    /// Value the line holds after the last completed task that drove it.
    pub fn level(&self, line: &str) -> Option<f64> {
        self.state.lock().levels.get(line).copied()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.playbacks.clear();
        state.levels.clear();
    }

    fn commit(&self, playback: Playback) {
        let mut state = self.state.lock();
        if let Some(last) = playback.data.columns().into_iter().last() {
            for (channel, value) in playback.channels.iter().zip(last.iter()) {
                state.levels.insert(channel.clone(), *value);
            }
        }
        state.playbacks.push(playback);
    }
}

impl AnalogBackend for SimulatedBackend {
    fn new_task(&self) -> DispatchResult<Box<dyn OutputTask>> {
        Ok(Box::new(SimulatedTask {
            backend: self.clone(),
            program: Mutex::new(Playback {
                channels: Vec::new(),
                samp_rate: None,
                trigger: None,
                data: Array2::zeros((0, 0)),
            }),
            seq_len: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }
}

struct SimulatedTask {
    backend: SimulatedBackend,
    program: Mutex<Playback>,
    seq_len: Mutex<Option<u64>>,
    started: AtomicBool,
}

impl OutputTask for SimulatedTask {
    fn create_ao_chan(&self, name: &str) -> DispatchResult<()> {
        self.program.lock().channels.push(name.to_string());
        Ok(())
    }

    fn cfg_sample_clk(&self, samp_rate: f64, seq_len: u64) -> DispatchResult<()> {
        self.program.lock().samp_rate = Some(samp_rate);
        *self.seq_len.lock() = Some(seq_len);
        Ok(())
    }

    fn cfg_dig_edge_start_trigger(&self, source: &str, edge: Edge) -> DispatchResult<()> {
        self.program.lock().trigger = Some((source.to_string(), edge));
        Ok(())
    }

    fn write_analog(&self, signal_arr: &Array2<f64>, auto_start: bool) -> DispatchResult<usize> {
        let mut program = self.program.lock();
        if signal_arr.nrows() != program.channels.len() {
            return Err(DispatchError::Driver(format!(
                "write of {} rows to a task with {} channels",
                signal_arr.nrows(),
                program.channels.len()
            )));
        }
        if let Some(seq_len) = *self.seq_len.lock() {
            if signal_arr.ncols() as u64 != seq_len {
                return Err(DispatchError::Driver(format!(
                    "write of {} samples to a task clocked for {}",
                    signal_arr.ncols(),
                    seq_len
                )));
            }
        }
        program.data = signal_arr.clone();
        if auto_start && program.samp_rate.is_none() {
            self.backend.commit(program.clone());
        }
        Ok(signal_arr.ncols())
    }

    fn start(&self) -> DispatchResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait_until_done(&self, _timeout: Duration) -> DispatchResult<bool> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(DispatchError::Driver("task was never started".to_string()));
        }
        if self.backend.stall.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.backend.commit(self.program.lock().clone());
        Ok(true)
    }

    fn stop(&self) -> DispatchResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}
