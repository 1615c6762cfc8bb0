use std::sync::Arc;
use std::time::Duration;

use goniocompiler_backend::{
    LengthPolicy, OverloadStimulus, PerRepeat, SynthesisError, TrialParameters, TrialPlan,
};
use gonioexpctrl_backend::camera::AcquisitionRemote;
use gonioexpctrl_backend::config::{AnalogConfig, SequencerConfig};
use gonioexpctrl_backend::error::{DispatchError, Error, RemoteError};
use gonioexpctrl_backend::sequencer::{AngleSource, TrialDevices, TrialSession};
use gonioexpctrl_backend::utils::Clock;
use gonioexpctrl_backend::{
    AnalogDispatcher, ManualClock, SequencerState, SimulatedBackend, TrialSequencer, TriggerDirection,
};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingRemote {
    calls: Mutex<Vec<String>>,
}

impl RecordingRemote {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn series(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("acquireSeries"))
            .collect()
    }
}

impl AcquisitionRemote for RecordingRemote {
    fn acquire_series(
        &self,
        exposure: f64,
        interval: f64,
        frames: usize,
        label: &str,
        subdir: &str,
        direction: TriggerDirection,
    ) -> Result<(), RemoteError> {
        self.calls.lock().push(format!(
            "acquireSeries;{}:{}:{}:{}:{}:{}",
            exposure, interval, frames, label, subdir, direction
        ));
        Ok(())
    }

    fn acquire_single(&self, save: bool, subdir: &str) -> Result<(), RemoteError> {
        self.calls.lock().push(format!("acquireSingle;{}:{}", save, subdir));
        Ok(())
    }

    fn set_saving_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.calls.lock().push(format!("setSavingDirectory;{}", path));
        Ok(())
    }

    fn save_description(&self, name: &str, text: &str) -> Result<(), RemoteError> {
        self.calls.lock().push(format!("saveDescription;{}:{}", name, text));
        Ok(())
    }

    fn close_server(&self) -> Result<(), RemoteError> {
        self.calls.lock().push("exit;None".to_string());
        Ok(())
    }
}

struct FixedAngles((i32, i32));

impl AngleSource for FixedAngles {
    fn angles(&self) -> (i32, i32) {
        self.0
    }
}

struct Bench {
    backend: SimulatedBackend,
    dispatcher: AnalogDispatcher,
    remote: RecordingRemote,
    angles: FixedAngles,
    clock: Arc<ManualClock>,
}

impl Bench {
    fn new() -> Self {
        let backend = SimulatedBackend::new();
        let dispatcher = AnalogDispatcher::new(Arc::new(backend.clone()), &AnalogConfig::default()).unwrap();
        Self {
            backend,
            dispatcher,
            remote: RecordingRemote::default(),
            angles: FixedAngles((-14, 3)),
            clock: Arc::new(ManualClock::new()),
        }
    }

    fn devices(&self) -> TrialDevices {
        TrialDevices {
            remote: &self.remote,
            dispatcher: &self.dispatcher,
            angles: &self.angles,
        }
    }

    fn sequencer(&self, direction: TriggerDirection) -> TrialSequencer {
        let config = SequencerConfig {
            trigger_direction: direction,
            ..SequencerConfig::default()
        };
        TrialSequencer::new(&config, self.clock.clone())
    }
}

fn params(repeats: usize) -> TrialParameters {
    TrialParameters {
        pre_stim: 1.,
        stim: 0.5,
        post_stim: 1.,
        frame_length: 0.1,
        repeats,
        flash_on: PerRepeat::Scalar(8.),
        isi: PerRepeat::Scalar(2.),
        fs: 1000.,
        ..TrialParameters::default()
    }
}

fn session() -> TrialSession {
    TrialSession {
        preparation: "fly".to_string(),
        suffix: "_highmag".to_string(),
    }
}

#[test]
fn two_repeat_sequence() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let plan = TrialPlan::resolve(&params(2), LengthPolicy::Strict).unwrap();

    let report = sequencer.run(&plan, &session(), &bench.devices(), None).unwrap();

    assert_eq!(report.status, SequencerState::Done);
    assert_eq!(sequencer.state(), SequencerState::Done);
    assert_eq!(report.records.len(), 2);
    assert!(report.records.iter().all(|r| r.frames == 25));
    assert_eq!(
        bench.remote.series(),
        vec![
            "acquireSeries;0.1:0:25:im_pos(-14, 3)_rep0:fly/pos(-14, 3)_highmag:send",
            "acquireSeries;0.1:0:25:im_pos(-14, 3)_rep1:fly/pos(-14, 3)_highmag:send",
        ]
    );
    assert_eq!(
        bench.remote.calls()[0],
        "saveDescription;fly:fly/pos(-14, 3)_highmag"
    );

    // Level changes and clocked playbacks alternate: imaging, play, waiting per repeat
    let played: Vec<_> = bench
        .backend
        .playbacks()
        .into_iter()
        .filter(|p| p.samp_rate.is_some())
        .collect();
    assert_eq!(played.len(), 2);
    for playback in &played {
        assert_eq!(playback.channels, vec!["Dev1/ao0", "Dev1/ao1"]);
        assert_eq!(playback.data.ncols(), 2500);
        assert!(playback.trigger.is_some());
    }
    assert_eq!(bench.backend.level("Dev1/ao1"), Some(1.));

    // One settle per repeat and one shortened interval between them
    assert_eq!(bench.clock.elapsed(), Duration::from_millis(2500));
    assert_eq!(
        sequencer.next_available_start(),
        Some(bench.clock.now() + Duration::from_secs(2))
    );
}

#[test]
fn next_sequence_waits_for_interval() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let plan = TrialPlan::resolve(&params(1), LengthPolicy::Strict).unwrap();

    sequencer.run(&plan, &session(), &bench.devices(), None).unwrap();
    let available = sequencer.next_available_start().unwrap();
    sequencer.run(&plan, &session(), &bench.devices(), None).unwrap();
    // The second sequence started no earlier than the interval allowed, then settled once
    assert_eq!(bench.clock.now(), available + Duration::from_millis(500));
}

#[test]
fn receive_direction_plays_trigger_immediately() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Receive);
    let plan = TrialPlan::resolve(&params(1), LengthPolicy::Strict).unwrap();

    sequencer.run(&plan, &session(), &bench.devices(), None).unwrap();

    let played: Vec<_> = bench
        .backend
        .playbacks()
        .into_iter()
        .filter(|p| p.samp_rate.is_some())
        .collect();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].channels, vec!["Dev1/ao0", "Dev1/ao1", "Dev1/ao2"]);
    assert_eq!(played[0].trigger, None);
    assert!(bench.remote.series()[0].ends_with(":receive"));
}

#[test]
fn abort_before_second_of_five_repeats() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let plan = TrialPlan::resolve(&params(5), LengthPolicy::Strict).unwrap();

    let mut proceed = |repeat: usize| repeat < 1;
    let report = sequencer
        .run(&plan, &session(), &bench.devices(), Some(&mut proceed))
        .unwrap();

    assert_eq!(report.status, SequencerState::Aborted);
    assert_eq!(sequencer.state(), SequencerState::Aborted);
    assert_eq!(report.records.len(), 1);
    assert_eq!(bench.remote.series().len(), 1);
    assert_eq!(bench.backend.level("Dev1/ao1"), Some(1.));
}

#[test]
fn abort_on_third_of_five_repeats() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let plan = TrialPlan::resolve(&params(5), LengthPolicy::Strict).unwrap();

    let mut asked = Vec::new();
    let mut proceed = |repeat: usize| {
        asked.push(repeat);
        repeat != 2
    };
    let report = sequencer
        .run(&plan, &session(), &bench.devices(), Some(&mut proceed))
        .unwrap();

    assert_eq!(report.status, SequencerState::Aborted);
    assert_eq!(report.records.len(), 2);
    assert_eq!(
        report.records.iter().map(|r| r.repeat).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(bench.remote.series().len(), 2);
    assert_eq!(asked.last(), Some(&2));
    assert_eq!(bench.backend.level("Dev1/ao1"), Some(plan.params().ir_livefeed));
    assert_eq!(sequencer.next_available_start(), None);
}

#[test]
fn unrepresentable_interval_fails_cleanly() {
    let mut huge = params(2);
    huge.isi = PerRepeat::Scalar(1e20);
    assert!(matches!(
        TrialPlan::resolve(&huge, LengthPolicy::Strict),
        Err(SynthesisError::InvalidParameter { name: "isi", .. })
    ));

    // Fits a Duration but not a deadline on the clock
    huge.isi = PerRepeat::Scalar(1e19);
    let plan = TrialPlan::resolve(&huge, LengthPolicy::Strict).unwrap();
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);

    let result = sequencer.run(&plan, &session(), &bench.devices(), None);

    assert!(matches!(
        result,
        Err(Error::Synthesis(SynthesisError::InvalidParameter { name: "isi", .. }))
    ));
    assert_eq!(sequencer.state(), SequencerState::Aborted);
    assert_eq!(bench.remote.series().len(), 1);
    assert_eq!(bench.backend.level("Dev1/ao1"), Some(1.));
}

#[test]
fn playback_timeout_still_restores_livefeed() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let plan = TrialPlan::resolve(&params(3), LengthPolicy::Strict).unwrap();
    bench.backend.set_stall(true);

    let result = sequencer.run(&plan, &session(), &bench.devices(), None);

    assert!(matches!(
        result,
        Err(Error::Dispatch(DispatchError::PlaybackTimeout { .. }))
    ));
    assert_eq!(sequencer.state(), SequencerState::Aborted);
    assert_eq!(bench.remote.series().len(), 1);
    assert_eq!(bench.backend.level("Dev1/ao1"), Some(1.));
}

#[test]
fn overload_stimulus_sets_rate_and_frames() {
    let bench = Bench::new();
    let mut sequencer = bench.sequencer(TriggerDirection::Send);
    let overload = OverloadStimulus::new(2000., vec![vec![0.5; 3000]]).unwrap();
    let plan = TrialPlan::resolve(&params(1), LengthPolicy::Strict)
        .unwrap()
        .with_overload(overload);

    let report = sequencer.run(&plan, &session(), &bench.devices(), None).unwrap();

    assert_eq!(report.records[0].frames, 15);
    let played: Vec<_> = bench
        .backend
        .playbacks()
        .into_iter()
        .filter(|p| p.samp_rate.is_some())
        .collect();
    assert_eq!(played[0].samp_rate, Some(2000.));
    assert_eq!(played[0].data.ncols(), 3000);
}
