//! # Goniometer experiment control backend
//!
//! Device-coordination half of the goniometer imaging rig. Waveforms come from
//! `goniocompiler_backend`; this crate moves the goniometer, arms the remote camera and plays
//! the waveforms on the analog outputs in step with the image series.
//!
//! - [`remote`], [`camera`], [`vio`]: text-command clients for the camera and voltage-input servers.
//! - [`encoder`], [`motor`]: the serial encoder/motor board and per-axis motor controllers.
//! - [`analog`]: multi-channel analog playback, on NI-DAQmx (feature `nidaqmx`) or simulated.
//! - [`sequencer`]: the repeats of one imaging sequence.
//! - [`macro_step`]: scripted moves and imaging.
//! - [`rig`]: all of the above behind one object.
//! - [`config`]: TOML rig configuration.

pub mod analog;
pub mod camera;
pub mod config;
pub mod encoder;
pub mod error;
pub mod macro_step;
pub mod motor;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod remote;
pub mod rig;
pub mod sequencer;
pub mod utils;
pub mod vio;

pub use crate::analog::{AnalogBackend, AnalogDispatcher, SimulatedBackend};
pub use crate::camera::{AcquisitionRemote, CameraClient, TriggerDirection};
pub use crate::config::RigConfig;
pub use crate::encoder::{EncoderLink, MemoryPort};
pub use crate::error::{Error, Result};
pub use crate::macro_step::{MacroEvent, MacroRunner, MacroStep};
pub use crate::motor::MotorController;
pub use crate::rig::Rig;
pub use crate::sequencer::{SequenceReport, SequencerState, TrialSequencer};
pub use crate::utils::{Clock, ManualClock, SystemClock};
pub use crate::vio::VioClient;
