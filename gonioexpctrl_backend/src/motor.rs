//! Per-axis motor control with soft limits and encoder feedback.
//!
//! ## Overview
//!
//! Motors are driven open-loop by run-time pulses (see [`MotorDriver`]). A [`MotorController`]
//! tracks the position it believes its motor is at, in seconds of motor run, and refuses pulses
//! that would carry the tracked position past its soft limits.
//!
//! An axis without a sensor moves to a target in one pulse of `|target - position|` seconds.
//! An axis with a [`PositionSensor`] instead starts a background correction loop: read the
//! sensed position, stop once it lies within `tolerance / 2` of the target, otherwise pulse one
//! `step` toward the target and wait `poll_interval`. The loop is cancelled through a channel;
//! a new [`MotorController::move_to`] cancels and joins the running loop before starting its own.
//!
//! ## Limits
//!
//! A pulse of signed length `delta` is allowed if it moves up and stays at or below the upper
//! limit, or moves down and stays at or above the lower limit. Refused pulses are logged and
//! otherwise ignored. A correction loop whose pulse is refused stops, since its target cannot
//! be reached without crossing the limit.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AxisConfig, MotorsConfig};
use crate::error::MotorError;

/// Reads encoder positions.
pub trait PositionSensor: Send + Sync {
    /// Current position reported by `sensor`, or `None` if there is no such sensor.
    fn position(&self, sensor: usize) -> Option<f64>;
}

/// Runs motors for a given time.
pub trait MotorDriver: Send + Sync {
    /// Runs `motor` for `seconds` forward if `direction >= 0`, backward otherwise.
    fn pulse(&self, motor: usize, direction: f64, seconds: f64) -> Result<(), MotorError>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotorState {
    pub position: f64,
    pub lower: f64,
    pub upper: f64,
    pub moving: bool,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            position: 0.,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            moving: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrectionSettings {
    pub tolerance: f64,
    pub step: f64,
    pub poll_interval: Duration,
}

impl From<&MotorsConfig> for CorrectionSettings {
    fn from(config: &MotorsConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            step: config.step,
            poll_interval: config.poll_interval,
        }
    }
}

struct CorrectionLoop {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct MotorController {
    motor: usize,
    sensor: Option<(usize, Arc<dyn PositionSensor>)>,
    driver: Arc<dyn MotorDriver>,
    settings: CorrectionSettings,
    state: Arc<Mutex<MotorState>>,
    correction: Option<CorrectionLoop>,
}

impl MotorController {
    pub fn new(motor: usize, driver: Arc<dyn MotorDriver>, settings: CorrectionSettings) -> Self {
        Self {
            motor,
            sensor: None,
            driver,
            settings,
            state: Arc::new(Mutex::new(MotorState::default())),
            correction: None,
        }
    }

    /// Controller whose moves are corrected with readings of `sensor`.
    pub fn with_sensor(mut self, sensor: usize, source: Arc<dyn PositionSensor>) -> Self {
        self.sensor = Some((sensor, source));
        self
    }

    /// Controllers for every configured axis, all driven through the same link.
    pub fn from_config<L>(config: &MotorsConfig, link: Arc<L>) -> Vec<Self>
    where
        L: MotorDriver + PositionSensor + 'static,
    {
        let settings = CorrectionSettings::from(config);
        config
            .axes
            .iter()
            .map(|&AxisConfig { motor, sensor }| {
                let controller = Self::new(motor, link.clone(), settings);
                match sensor {
                    Some(sensor) => controller.with_sensor(sensor, link.clone()),
                    None => controller,
                }
            })
            .collect()
    }

    pub fn motor(&self) -> usize {
        self.motor
    }

    pub fn state(&self) -> MotorState {
        *self.state.lock()
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    /// Starts moving toward `target`. Sensor axes return immediately and keep correcting in the
    /// background; see [`MotorController::reached_target`].
    pub fn move_to(&mut self, target: f64) -> Result<(), MotorError> {
        self.cancel();
        let Some((sensor, source)) = self.sensor.clone() else {
            let delta = target - self.position();
            pulse(&self.state, self.driver.as_ref(), self.motor, delta)?;
            return Ok(());
        };

        if source.position(sensor).is_none() {
            return Err(MotorError::SensorUnavailable(sensor));
        }
        debug!("Motor {} correcting toward {} (sensor {})", self.motor, target, sensor);
        let (cancel, cancelled) = bounded::<()>(1);
        let state = self.state.clone();
        let driver = self.driver.clone();
        let motor = self.motor;
        let settings = self.settings;
        state.lock().moving = true;
        let handle = std::thread::spawn(move || {
            loop {
                let Some(pos) = source.position(sensor) else {
                    warn!("Motor {}: sensor {} stopped reporting", motor, sensor);
                    break;
                };
                if (pos - target).abs() <= settings.tolerance / 2. {
                    break;
                }
                let delta = if target > pos { settings.step } else { -settings.step };
                match pulse(&state, driver.as_ref(), motor, delta) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Motor {}: {}", motor, e);
                        break;
                    }
                }
                match cancelled.recv_timeout(settings.poll_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            state.lock().moving = false;
        });
        self.correction = Some(CorrectionLoop { cancel, handle });
        Ok(())
    }

    /// Pulses the motor directly by `delta` seconds (signed), subject to the soft limits.
    /// Returns whether the pulse was allowed.
    pub fn move_raw(&self, delta: f64) -> Result<bool, MotorError> {
        pulse(&self.state, self.driver.as_ref(), self.motor, delta)
    }

    /// `false` while a correction loop is running.
    pub fn reached_target(&self) -> bool {
        !self.state.lock().moving
    }

    /// Stops the correction loop, if any, and waits for it to exit.
    pub fn cancel(&mut self) {
        if let Some(CorrectionLoop { cancel, handle }) = self.correction.take() {
            let _ = cancel.send(());
            if handle.join().is_err() {
                warn!("Motor {} correction loop panicked", self.motor);
                self.state.lock().moving = false;
            }
        }
    }

    /// Current position becomes the lower limit.
    pub fn set_lower_limit(&self) {
        let mut state = self.state.lock();
        state.lower = state.position;
    }

    /// Current position becomes the upper limit.
    pub fn set_upper_limit(&self) {
        let mut state = self.state.lock();
        state.upper = state.position;
    }

    pub fn set_limits(&self, lower: f64, upper: f64) {
        let mut state = self.state.lock();
        state.lower = lower;
        state.upper = upper;
    }

    pub fn limits(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.lower, state.upper)
    }

    /// Moves back to 0. Sensor axes are waited for up to `timeout`; returns whether the axis
    /// settled in time.
    pub fn return_to_zero(&mut self, timeout: Duration) -> Result<bool, MotorError> {
        self.move_to(0.)?;
        let deadline = Instant::now() + timeout;
        while !self.reached_target() {
            if Instant::now() >= deadline {
                warn!("Motor {} did not return to zero within {:?}", self.motor, timeout);
                self.cancel();
                return Ok(false);
            }
            std::thread::sleep(self.settings.poll_interval.min(Duration::from_millis(10)));
        }
        info!("Motor {} returned to zero", self.motor);
        Ok(true)
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.cancel()
    }
}

/// Applies one limit-checked pulse and updates the tracked position. The state lock is
/// released while the driver runs.
fn pulse(
    state: &Mutex<MotorState>,
    driver: &dyn MotorDriver,
    motor: usize,
    delta: f64,
) -> Result<bool, MotorError> {
    {
        let state = state.lock();
        let new_position = state.position + delta;
        let allowed = (delta >= 0. && new_position <= state.upper)
            || (delta < 0. && new_position >= state.lower);
        if !allowed {
            warn!(
                "Motor {}: move to {} refused by limits [{}, {}]",
                motor, new_position, state.lower, state.upper
            );
            return Ok(false);
        }
    }
    driver.pulse(motor, delta, delta.abs())?;
    state.lock().position += delta;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct RecordingDriver {
        pulses: Mutex<Vec<(usize, f64, f64)>>,
    }

    impl MotorDriver for RecordingDriver {
        fn pulse(&self, motor: usize, direction: f64, seconds: f64) -> Result<(), MotorError> {
            self.pulses.lock().push((motor, direction, seconds));
            Ok(())
        }
    }

    /// Motor and encoder in one: each 0.1 s of run moves the encoder by one count.
    #[derive(Default)]
    struct SimAxis {
        counts: Mutex<f64>,
        pulses: Mutex<usize>,
        /// State of the controller under test, checked for being unlocked during pulses.
        watched: Mutex<Option<Arc<Mutex<MotorState>>>>,
        locked_during_pulse: Mutex<bool>,
    }

    impl MotorDriver for SimAxis {
        fn pulse(&self, _motor: usize, direction: f64, seconds: f64) -> Result<(), MotorError> {
            if let Some(state) = self.watched.lock().as_ref() {
                if state.try_lock().is_none() {
                    *self.locked_during_pulse.lock() = true;
                }
            }
            *self.counts.lock() += direction.signum() * (seconds * 10.).round();
            *self.pulses.lock() += 1;
            Ok(())
        }
    }

    impl PositionSensor for SimAxis {
        fn position(&self, sensor: usize) -> Option<f64> {
            (sensor == 0).then(|| *self.counts.lock())
        }
    }

    fn sensed(axis: &Arc<SimAxis>) -> MotorController {
        MotorController::new(0, axis.clone(), settings()).with_sensor(0, axis.clone())
    }

    fn wait_settled(motor: &MotorController) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !motor.reached_target() {
            assert!(Instant::now() < deadline, "correction loop did not settle");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn settings() -> CorrectionSettings {
        CorrectionSettings {
            tolerance: 1.,
            step: 0.1,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn sensorless_move_pulses_toward_target() {
        let driver = Arc::new(RecordingDriver::default());
        let mut motor = MotorController::new(2, driver.clone(), settings());
        motor.move_to(1.5).unwrap();
        motor.move_to(0.5).unwrap();
        assert_eq!(motor.position(), 0.5);
        assert!(motor.reached_target());
        assert_eq!(*driver.pulses.lock(), vec![(2, 1.5, 1.5), (2, -1., 1.)]);
    }

    #[test]
    fn limits_take_current_position() {
        let driver = Arc::new(RecordingDriver::default());
        let mut motor = MotorController::new(0, driver, settings());
        motor.set_lower_limit();
        motor.move_to(2.).unwrap();
        motor.set_upper_limit();
        assert_eq!(motor.limits(), (0., 2.));

        assert!(!motor.move_raw(0.5).unwrap());
        assert!(!motor.move_raw(-2.5).unwrap());
        assert!(motor.move_raw(-2.).unwrap());
        assert_eq!(motor.position(), 0.);
    }

    #[test]
    fn sensor_loop_converges_within_tolerance() {
        let axis = Arc::new(SimAxis::default());
        let mut motor = sensed(&axis);
        *axis.watched.lock() = Some(motor.state.clone());

        motor.move_to(20.).unwrap();
        assert!(!motor.reached_target());
        wait_settled(&motor);

        assert_eq!(axis.position(0), Some(20.));
        assert_eq!(*axis.pulses.lock(), 20);
        assert!((motor.position() - 2.).abs() < 1e-9);
        assert!(!*axis.locked_during_pulse.lock());
    }

    #[test]
    fn new_target_supersedes_running_move() {
        let axis = Arc::new(SimAxis::default());
        let mut motor = sensed(&axis);
        motor.move_to(50.).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        motor.move_to(5.).unwrap();
        wait_settled(&motor);
        assert_eq!(axis.position(0), Some(5.));
    }

    #[test]
    fn refused_pulse_ends_correction() {
        let axis = Arc::new(SimAxis::default());
        let mut motor = sensed(&axis);
        motor.set_limits(f64::NEG_INFINITY, 1.);

        motor.move_to(50.).unwrap();
        wait_settled(&motor);

        assert!(motor.position() <= 1.);
        assert_eq!(axis.position(0), Some(10.));
    }

    #[test]
    fn missing_sensor_is_reported() {
        let axis = Arc::new(SimAxis::default());
        let mut motor = MotorController::new(0, axis.clone(), settings()).with_sensor(1, axis.clone());
        assert!(matches!(motor.move_to(3.), Err(MotorError::SensorUnavailable(1))));
        assert_eq!(*axis.pulses.lock(), 0);
    }
}
