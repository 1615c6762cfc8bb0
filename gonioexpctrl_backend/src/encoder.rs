//! Serial link to the encoder/motor board.
//!
//! The board reports the two goniometer rotary encoders as text lines `"h,v\n"` (integer counts)
//! whenever either of them changes, and drives up to five motors on single-letter commands:
//! motor `i` is letter `a`..`e`, lowercase runs it forward and uppercase backward, each letter
//! being a 100 ms run.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MotorError;
use crate::motor::{MotorDriver, PositionSensor};
use crate::sequencer::AngleSource;

const MOTOR_LETTERS: [u8; 5] = [b'a', b'b', b'c', b'd', b'e'];

/// Letter repetitions per second of motor run.
const PULSES_PER_SECOND: f64 = 10.;

struct LinkState<S> {
    port: BufReader<S>,
    pending: Vec<u8>,
    latest: (i32, i32),
    offset: (i32, i32),
}

impl<S> LinkState<S> {
    fn corrected(&self) -> (i32, i32) {
        (self.latest.0 - self.offset.0, self.latest.1 - self.offset.1)
    }
}

impl<S: Read> LinkState<S> {
    /// One `read_until`; returns whether it completed a line.
    fn read_line(&mut self) -> Result<bool, MotorError> {
        match self.port.read_until(b'\n', &mut self.pending) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => return Err(MotorError::Serial(e)),
        }
        if self.pending.last() != Some(&b'\n') {
            return Ok(false);
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        match parse_angles(&line) {
            Some(angles) => self.latest = angles,
            None if line.is_empty() => {}
            None => warn!("Skipping malformed encoder line {:?}", line),
        }
        Ok(true)
    }
}

pub struct EncoderLink<S> {
    state: Mutex<LinkState<S>>,
}

impl<S: Read + Write + Send> EncoderLink<S> {
    pub fn new(port: S) -> Self {
        Self {
            state: Mutex::new(LinkState {
                port: BufReader::new(port),
                pending: Vec::new(),
                latest: (0, 0),
                offset: (0, 0),
            }),
        }
    }

    /// Reads at most one line from the board and returns the zero-corrected angle pair.
    ///
    /// Returns the previous pair if nothing complete has arrived; a partial line is kept and
    /// completed by a later read.
    pub fn read_angles(&self) -> Result<(i32, i32), MotorError> {
        let mut state = self.state.lock();
        state.read_line()?;
        Ok(state.corrected())
    }

    /// Reads every complete line already received and returns the pair from the newest one.
    ///
    /// Stops once no complete line is buffered, so it does not wait on the board.
    pub fn read_latest(&self) -> Result<(i32, i32), MotorError> {
        let mut state = self.state.lock();
        while state.read_line()? && state.port.buffer().contains(&b'\n') {}
        Ok(state.corrected())
    }

    /// Latest zero-corrected angle pair, without reading.
    pub fn latest(&self) -> (i32, i32) {
        self.state.lock().corrected()
    }

    /// Makes the current angles the zero point.
    pub fn current_as_zero(&self) {
        let mut state = self.state.lock();
        state.offset = state.latest;
    }

    /// Runs motor `i_motor` for `seconds`, forward if `direction >= 0`.
    pub fn move_motor(&self, i_motor: usize, direction: f64, seconds: f64) -> Result<(), MotorError> {
        let letter = *MOTOR_LETTERS.get(i_motor).ok_or(MotorError::InvalidMotor(i_motor))?;
        let letter = if direction >= 0. {
            letter
        } else {
            letter.to_ascii_uppercase()
        };
        let count = (seconds.abs() * PULSES_PER_SECOND).round() as usize;
        if count == 0 {
            return Ok(());
        }
        debug!("Motor {}: {} x {}", i_motor, letter as char, count);
        let mut state = self.state.lock();
        let port = state.port.get_mut();
        port.write_all(&vec![letter; count])?;
        port.flush()?;
        Ok(())
    }
}

fn parse_angles(line: &str) -> Option<(i32, i32)> {
    let (h, v) = line.split_once(',')?;
    Some((h.trim().parse().ok()?, v.trim().parse().ok()?))
}

impl<S: Read + Write + Send> PositionSensor for EncoderLink<S> {
    fn position(&self, sensor: usize) -> Option<f64> {
        if let Err(e) = self.read_latest() {
            warn!("Encoder read failed: {}", e);
        }
        let (h, v) = self.latest();
        match sensor {
            0 => Some(h as f64),
            1 => Some(v as f64),
            _ => None,
        }
    }
}

impl<S: Read + Write + Send> MotorDriver for EncoderLink<S> {
    fn pulse(&self, motor: usize, direction: f64, seconds: f64) -> Result<(), MotorError> {
        self.move_motor(motor, direction, seconds)
    }
}

impl<S: Read + Write + Send> AngleSource for EncoderLink<S> {
    fn angles(&self) -> (i32, i32) {
        self.latest()
    }
}

#[cfg(feature = "serial")]
pub type SerialLink = EncoderLink<Box<dyn serialport::SerialPort>>;

/// Opens the encoder board on the configured serial port.
#[cfg(feature = "serial")]
pub fn open_serial(config: &crate::config::SerialConfig) -> Result<SerialLink, MotorError> {
    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(config.timeout)
        .open()
        .map_err(|e| MotorError::Serial(e.into()))?;
    Ok(EncoderLink::new(port))
}

#[derive(Default)]
struct MemoryBuffers {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

/// In-memory stand-in for the encoder board, for dry runs without hardware.
///
/// Clones share the same buffers: keep one clone to [`MemoryPort::feed`] encoder lines and
/// inspect the motor commands the link wrote. Reading an empty port returns end of file, which
/// the link treats as "no new data".
#[derive(Clone, Default)]
pub struct MemoryPort {
    buffers: Arc<Mutex<MemoryBuffers>>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, text: &str) {
        self.buffers.lock().inbound.extend(text.bytes());
    }

    /// Everything written to the port so far.
    pub fn sent(&self) -> Vec<u8> {
        self.buffers.lock().outbound.clone()
    }
}

impl Read for MemoryPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buffers = self.buffers.lock();
        let n = buf.len().min(buffers.inbound.len());
        for (dst, src) in buf.iter_mut().zip(buffers.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffers.lock().outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
