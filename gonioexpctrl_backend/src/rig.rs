//! The rig: every device of the goniometer imaging setup behind one object.
//!
//! A [`Rig`] owns the encoder/motor link, the motor controllers, the camera remote, the analog
//! dispatcher and the trial sequencer, and keeps the preparation being imaged. An interactive
//! front end calls [`Rig::initialize`] once, then [`Rig::tick`] in its loop, and
//! [`Rig::finalize`] when done. Dropping an unfinalized rig finalizes it.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use goniocompiler_backend::{OverloadStimulus, TrialParameters, TrialPlan};
use tracing::{info, warn};

use crate::analog::{AnalogBackend, AnalogDispatcher};
use crate::camera::{AcquisitionRemote, CameraClient, TriggerDirection};
use crate::config::RigConfig;
use crate::encoder::EncoderLink;
use crate::error::{ConfigError, Error, MotorError, Result};
use crate::macro_step::{MacroEvent, MacroRunner};
use crate::motor::MotorController;
use crate::sequencer::{SequenceReport, TrialDevices, TrialSequencer, TrialSession};
use crate::utils::Clock;

/// The specimen being imaged. Empty fields are written as such to the description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preparation {
    pub name: String,
    pub sex: String,
    pub age: String,
}

impl Default for Preparation {
    fn default() -> Self {
        Self {
            name: "test".to_string(),
            sex: String::new(),
            age: String::new(),
        }
    }
}

pub struct Rig<S: Read + Write + Send + 'static> {
    config: RigConfig,
    encoder: Arc<EncoderLink<S>>,
    motors: Vec<MotorController>,
    remote: Box<dyn AcquisitionRemote>,
    dispatcher: AnalogDispatcher,
    sequencer: TrialSequencer,
    clock: Arc<dyn Clock>,
    preparation: Preparation,
    suffix: String,
    previous_angles: Option<(i32, i32)>,
    macro_runner: Option<MacroRunner>,
    overload: Option<OverloadStimulus>,
    finalized: bool,
}

impl<S: Read + Write + Send + 'static> Rig<S> {
    /// Assembles the rig. `port` is the serial connection to the encoder/motor board.
    pub fn new(
        config: RigConfig,
        port: S,
        remote: Box<dyn AcquisitionRemote>,
        backend: Arc<dyn AnalogBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let encoder = Arc::new(EncoderLink::new(port));
        let motors = MotorController::from_config(&config.motors, encoder.clone());
        let dispatcher = AnalogDispatcher::new(backend, &config.analog)?;
        let sequencer = TrialSequencer::new(&config.sequencer, clock.clone());
        Ok(Self {
            config,
            encoder,
            motors,
            remote,
            dispatcher,
            sequencer,
            clock,
            preparation: Preparation::default(),
            suffix: String::new(),
            previous_angles: None,
            macro_runner: None,
            overload: None,
            finalized: false,
        })
    }

    /// Assembles the rig around the configured camera server, starting the server first when
    /// `remote.server_command` is set and nothing answers.
    pub fn with_camera(
        config: RigConfig,
        port: S,
        backend: Arc<dyn AnalogBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let camera = CameraClient::connect(&config.remote)?;
        Self::new(config, port, Box::new(camera), backend, clock)
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn preparation(&self) -> &Preparation {
        &self.preparation
    }

    pub fn sequencer(&self) -> &TrialSequencer {
        &self.sequencer
    }

    /// Starts imaging a preparation.
    ///
    /// Non-empty arguments replace the current preparation fields. The preparation and the trial
    /// parameters are saved as the preparation's description, then the illumination goes to
    /// live-feed and the stimulus to its off level.
    pub fn initialize(&mut self, name: &str, sex: &str, age: &str) -> Result<()> {
        for (field, value) in [
            (&mut self.preparation.name, name),
            (&mut self.preparation.sex, sex),
            (&mut self.preparation.age, age),
        ] {
            if !value.is_empty() {
                *field = value.to_string();
            }
        }
        info!(
            "Preparation name set as {}, sex {}, age {} days",
            self.preparation.name, self.preparation.sex, self.preparation.age
        );

        let description = self.description()?;
        self.remote
            .save_description(&self.preparation.name, &description)?;

        let trial = &self.config.trial;
        self.dispatcher
            .set_level(&trial.ir_channel, trial.ir_livefeed, false)?;
        self.dispatcher
            .set_level(&trial.flash_channel, trial.flash_off, false)?;
        self.finalized = false;
        Ok(())
    }

    fn description(&self) -> Result<String> {
        let mut text = format!(
            "name {}\nsex {}\nage {}\n\n#DYNAMIC PROTOCOL PARAMETERS\n",
            self.preparation.name, self.preparation.sex, self.preparation.age
        );
        let params = toml::Value::try_from(&self.config.trial).map_err(ConfigError::from)?;
        if let toml::Value::Table(table) = params {
            for (key, value) in table {
                text.push_str(&format!("{} {}\n", key, value));
            }
        }
        Ok(text)
    }

    /// Runs one imaging sequence with the current trial parameters at the current position.
    pub fn image_series(
        &mut self,
        proceed: Option<&mut dyn FnMut(usize) -> bool>,
    ) -> Result<SequenceReport> {
        let mut plan = TrialPlan::resolve(&self.config.trial, self.config.sequencer.length_policy)?;
        if let Some(overload) = &self.overload {
            plan = plan.with_overload(overload.clone());
        }
        let session = TrialSession {
            preparation: self.preparation.name.clone(),
            suffix: self.suffix.clone(),
        };
        let devices = TrialDevices {
            remote: self.remote.as_ref(),
            dispatcher: &self.dispatcher,
            angles: self.encoder.as_ref(),
        };
        self.sequencer.run(&plan, &session, &devices, proceed)
    }

    /// Takes one image. A saved snap is lit with the imaging illumination and stored under
    /// `{preparation}/snaps`; an unsaved one only refreshes the live feed.
    pub fn take_snap(&mut self, save: bool) -> Result<()> {
        if save {
            let trial = &self.config.trial;
            self.dispatcher
                .set_level(&trial.ir_channel, trial.ir_imaging, false)?;
            self.clock.sleep(Duration::from_millis(300));
            self.remote
                .acquire_single(true, &format!("{}/snaps", self.preparation.name))?;
            self.dispatcher
                .set_level(&trial.ir_channel, trial.ir_livefeed, false)?;
            self.clock.sleep(Duration::from_millis(200));
            info!("A snap image taken");
        } else {
            self.remote.acquire_single(false, "")?;
            self.clock.sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    pub fn set_savedir(&self, savedir: &str) -> Result<()> {
        Ok(self.remote.set_saving_directory(savedir)?)
    }

    /// Appended to position folders: `pos(-14, 0)` becomes `pos(-14, 0)_highmag` for `"highmag"`.
    pub fn set_subfolder_suffix(&mut self, suffix: &str) {
        self.suffix = if suffix.is_empty() {
            String::new()
        } else {
            format!("_{}", suffix)
        };
    }

    pub fn subfolder_suffix(&self) -> &str {
        &self.suffix
    }

    /// Makes the current goniometer angles the zero point.
    pub fn set_zero(&mut self) {
        self.encoder.current_as_zero();
        self.previous_angles = None;
    }

    /// Zero-corrected goniometer angles, `(horizontal, vertical)`.
    pub fn angles(&self) -> (i32, i32) {
        self.encoder.latest()
    }

    pub fn trial(&self) -> &TrialParameters {
        &self.config.trial
    }

    pub fn trial_mut(&mut self) -> &mut TrialParameters {
        &mut self.config.trial
    }

    pub fn set_trial(&mut self, trial: TrialParameters) {
        self.config.trial = trial;
    }

    pub fn set_trigger_direction(&mut self, direction: TriggerDirection) {
        self.sequencer.set_trigger_direction(direction);
    }

    /// Plays a pre-recorded stimulus instead of the synthesized one from now on.
    pub fn load_overload<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let overload = OverloadStimulus::from_json_file(path)?;
        info!(
            "Loaded {} overload stimuli at {} Hz",
            overload.num_traces(),
            overload.samp_rate()
        );
        self.overload = Some(overload);
        Ok(())
    }

    pub fn clear_overload(&mut self) {
        self.overload = None;
    }

    /// Housekeeping for one iteration of the front end's loop.
    ///
    /// Reads the encoder until the angles stop changing, logging every change, then advances the
    /// running macro by one step.
    pub fn tick(&mut self) -> Result<()> {
        loop {
            let angles = self.encoder.read_angles()?;
            if self.previous_angles == Some(angles) {
                break;
            }
            info!("Horizontal-vertical is {:?}", angles);
            self.previous_angles = Some(angles);
        }

        let Some(runner) = self.macro_runner.as_mut() else {
            return Ok(());
        };
        let axes_ready = self.motors.iter().take(2).all(|m| m.reached_target());
        match runner.step(self.clock.now(), axes_ready) {
            MacroEvent::Idle => {}
            MacroEvent::MoveTo(h, v) => {
                info!("Macro: moving to ({}, {})", h, v);
                for (motor, target) in self.motors.iter_mut().zip([h, v]) {
                    motor.move_to(target)?;
                }
            }
            MacroEvent::Custom(tag) => match tag.as_str() {
                "image" => {
                    self.image_series(None)?;
                }
                "snap" => self.take_snap(true)?,
                _ => warn!("Macro: unknown step `{}` skipped", tag),
            },
            MacroEvent::Finished => {
                info!("Macro finished");
                self.macro_runner = None;
            }
        }
        Ok(())
    }

    /// Parses `text` as a macro and runs it from the next [`Rig::tick`] on, replacing any macro
    /// still running.
    pub fn run_macro(&mut self, text: &str) -> Result<()> {
        self.macro_runner = Some(MacroRunner::parse(text)?);
        Ok(())
    }

    pub fn macro_running(&self) -> bool {
        self.macro_runner.is_some()
    }

    pub fn stop_macro(&mut self) {
        self.macro_runner = None;
    }

    /// Runs motor `i_motor` directly, bypassing its controller.
    pub fn move_motor(&self, i_motor: usize, direction: f64, seconds: f64) -> Result<()> {
        Ok(self.encoder.move_motor(i_motor, direction, seconds)?)
    }

    pub fn motors(&self) -> &[MotorController] {
        &self.motors
    }

    pub fn motor_mut(&mut self, i: usize) -> Result<&mut MotorController> {
        Ok(self.motors.get_mut(i).ok_or(MotorError::InvalidMotor(i))?)
    }

    /// Turns the LEDs off and brings every motor back to zero.
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        self.macro_runner = None;
        let mut first_error: Option<Error> = None;

        let trial = &self.config.trial;
        for channel in [&trial.ir_channel, &trial.flash_channel] {
            if let Err(e) = self.dispatcher.set_level(channel, 0., false) {
                warn!("Failed to turn off {:?}: {}", channel, e);
                first_error.get_or_insert(e.into());
            }
        }
        let timeout = self.config.motors.return_timeout;
        for motor in self.motors.iter_mut() {
            if let Err(e) = motor.return_to_zero(timeout) {
                warn!("Motor {} failed to return to zero: {}", motor.motor(), e);
                first_error.get_or_insert(e.into());
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shuts the camera server down.
    pub fn exit(&self) -> Result<()> {
        Ok(self.remote.close_server()?)
    }
}

impl<S: Read + Write + Send + 'static> Drop for Rig<S> {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.finalize() {
                warn!("Finalizing on drop failed: {}", e);
            }
        }
    }
}
