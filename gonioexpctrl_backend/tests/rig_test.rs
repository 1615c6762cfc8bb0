use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gonioexpctrl_backend::camera::AcquisitionRemote;
use gonioexpctrl_backend::config::{AxisConfig, RigConfig};
use gonioexpctrl_backend::error::RemoteError;
use gonioexpctrl_backend::{ManualClock, MemoryPort, Rig, SequencerState, SimulatedBackend, TriggerDirection};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct SharedRemote {
    calls: Arc<Mutex<Vec<String>>>,
}

impl SharedRemote {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(command)).count()
    }
}

impl AcquisitionRemote for SharedRemote {
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

struct Fixture {
    rig: Rig<MemoryPort>,
    port: MemoryPort,
    backend: SimulatedBackend,
    remote: SharedRemote,
    clock: Arc<ManualClock>,
}

/// Rig with two sensorless goniometer axes, so moves complete in one pulse.
fn fixture() -> Fixture {
    fixture_with(vec![
        AxisConfig { motor: 0, sensor: None },
        AxisConfig { motor: 1, sensor: None },
    ])
}

fn fixture_with(axes: Vec<AxisConfig>) -> Fixture {
    let mut config = RigConfig::default();
    config.motors.axes = axes;
    config.motors.poll_interval = Duration::from_millis(1);
    config.motors.return_timeout = Duration::from_millis(100);
    let port = MemoryPort::new();
    let backend = SimulatedBackend::new();
    let remote = SharedRemote::default();
    let clock = Arc::new(ManualClock::new());
    let rig = Rig::new(
        config,
        port.clone(),
        Box::new(remote.clone()),
        Arc::new(backend.clone()),
        clock.clone(),
    )
    .unwrap();
    Fixture {
        rig,
        port,
        backend,
        remote,
        clock,
    }
}

#[test]
fn initialize_saves_description_and_sets_idle_levels() {
    let mut f = fixture();
    f.rig.initialize("fly", "f", "3").unwrap();

    let calls = f.remote.calls();
    assert_eq!(calls.len(), 1);
    let description = calls[0].strip_prefix("saveDescription;fly:").unwrap();
    assert!(description.starts_with("name fly\nsex f\nage 3\n\n#DYNAMIC PROTOCOL PARAMETERS\n"));
    assert!(description.contains("\nrepeats 1\n"));
    assert!(description.contains("\nflash_type \"square\"\n"));
    assert_eq!(f.backend.level("Dev1/ao1"), Some(1.));
    assert_eq!(f.backend.level("Dev1/ao0"), Some(0.));

    // Empty arguments keep the previous values
    f.rig.initialize("", "", "4").unwrap();
    assert_eq!(f.rig.preparation().name, "fly");
    assert_eq!(f.rig.preparation().age, "4");
}

#[test]
fn image_series_at_current_angles() {
    let mut f = fixture();
    f.rig.initialize("fly", "", "").unwrap();
    f.rig.set_subfolder_suffix("highmag");
    f.port.feed("5,-2\n");
    f.rig.tick().unwrap();
    assert_eq!(f.rig.angles(), (5, -2));

    let report = f.rig.image_series(None).unwrap();

    assert_eq!(report.status, SequencerState::Done);
    assert!(f.remote.calls().contains(
        &"acquireSeries;0.01:0:250:im_pos(5, -2)_rep0:fly/pos(5, -2)_highmag:send".to_string()
    ));
    assert_eq!(f.backend.level("Dev1/ao1"), Some(1.));
}

#[test]
fn suffix_and_zero() {
    let mut f = fixture();
    f.rig.set_subfolder_suffix("x");
    assert_eq!(f.rig.subfolder_suffix(), "_x");
    f.rig.set_subfolder_suffix("");
    assert_eq!(f.rig.subfolder_suffix(), "");

    f.port.feed("7,9\n8,9\n");
    f.rig.tick().unwrap();
    assert_eq!(f.rig.angles(), (8, 9));
    f.rig.set_zero();
    assert_eq!(f.rig.angles(), (0, 0));
}

#[test]
fn saved_snap_lights_and_restores() {
    let mut f = fixture();
    f.rig.initialize("fly", "", "").unwrap();
    f.rig.take_snap(true).unwrap();
    f.rig.take_snap(false).unwrap();

    let calls = f.remote.calls();
    assert!(calls.contains(&"acquireSingle;true:fly/snaps".to_string()));
    assert!(calls.contains(&"acquireSingle;false:".to_string()));
    assert_eq!(f.backend.level("Dev1/ao1"), Some(1.));
    assert_eq!(f.clock.elapsed(), Duration::from_millis(600));
}

#[test]
fn macro_runs_moves_waits_and_imaging() {
    let mut f = fixture();
    f.rig.initialize("fly", "", "").unwrap();
    f.rig
        .run_macro("(0.3, -0.2)\nsnap\nwait 1\nimage\n")
        .unwrap();
    assert!(f.rig.macro_running());

    f.rig.tick().unwrap();
    assert_eq!(f.port.sent(), b"aaaBB".to_vec());
    assert_eq!(f.rig.motors()[0].position(), 0.3);

    f.rig.tick().unwrap();
    assert_eq!(f.remote.count("acquireSingle"), 1);

    // The wait starts on this tick and holds until the clock passes it
    f.rig.tick().unwrap();
    f.rig.tick().unwrap();
    assert_eq!(f.remote.count("acquireSeries"), 0);
    f.clock.advance(Duration::from_secs(1));
    f.rig.tick().unwrap();
    f.rig.tick().unwrap();
    assert_eq!(f.remote.count("acquireSeries"), 1);

    f.rig.tick().unwrap();
    assert!(!f.rig.macro_running());
}

#[test]
fn macro_images_only_after_correction_settles() {
    let mut f = fixture_with(vec![
        AxisConfig { motor: 0, sensor: Some(0) },
        AxisConfig { motor: 1, sensor: Some(1) },
    ]);
    f.rig.initialize("fly", "", "").unwrap();
    f.rig.run_macro("(50, 0)\nimage").unwrap();

    f.rig.tick().unwrap();
    assert!(!f.rig.motors()[0].reached_target());
    f.rig.tick().unwrap();
    f.rig.tick().unwrap();
    assert_eq!(f.remote.count("acquireSeries"), 0);
    assert!(f.rig.macro_running());

    // The encoder reaches the target and the correction loop stops
    f.port.feed("50,0\n");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f.rig.motors()[0].reached_target() {
        assert!(Instant::now() < deadline, "axis never settled");
        std::thread::sleep(Duration::from_millis(1));
    }

    f.rig.tick().unwrap();
    let series: Vec<String> = f
        .remote
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("acquireSeries"))
        .collect();
    assert_eq!(series.len(), 1);
    assert!(series[0].contains(":im_pos(50, 0)_rep0:fly/pos(50, 0):"));
}

#[test]
fn malformed_macro_is_rejected() {
    let mut f = fixture();
    assert!(f.rig.run_macro("(1, two)").is_err());
    assert!(!f.rig.macro_running());
}

#[test]
fn finalize_turns_off_leds_and_returns_motors() {
    let mut f = fixture();
    f.rig.initialize("fly", "", "").unwrap();
    f.rig.motor_mut(0).unwrap().move_to(0.3).unwrap();
    f.rig.motor_mut(1).unwrap().move_to(-0.2).unwrap();
    assert!(f.rig.motor_mut(2).is_err());

    f.rig.finalize().unwrap();

    assert_eq!(f.port.sent(), b"aaaBBAAAbb".to_vec());
    assert_eq!(f.backend.level("Dev1/ao1"), Some(0.));
    assert_eq!(f.backend.level("Dev1/ao0"), Some(0.));
    f.rig.exit().unwrap();
    assert_eq!(f.remote.calls().last().unwrap(), "exit;None");
}

#[test]
fn dropping_finalizes() {
    let Fixture { mut rig, backend, .. } = fixture();
    rig.initialize("fly", "", "").unwrap();
    assert_eq!(backend.level("Dev1/ao1"), Some(1.));
    drop(rig);
    assert_eq!(backend.level("Dev1/ao1"), Some(0.));
}

#[test]
fn camera_rig_checks_the_server_first() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = RigConfig::default();
    config.remote.port = listener.local_addr().unwrap().port();
    config.remote.server_command = Some(vec!["/nonexistent/camera-server".to_string()]);
    config.motors.axes = vec![AxisConfig { motor: 0, sensor: None }];
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut payload = String::new();
        stream.read_to_string(&mut payload).unwrap();
        payload
    });

    // The server answers, so the command is never run
    let rig = Rig::with_camera(
        config,
        MemoryPort::new(),
        Arc::new(SimulatedBackend::new()),
        Arc::new(ManualClock::new()),
    )
    .unwrap();

    assert_eq!(server.join().unwrap(), "ping;Client wants to know if server is running");
    drop(rig);
}

#[test]
fn config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "[sequencer]\nsettle = \"250ms\"\n\n[trial]\nrepeats = 2\nisi = [3.0, 4.0]\n"
    )
    .unwrap();

    let config = RigConfig::from_file(file.path()).unwrap();
    assert_eq!(config.sequencer.settle, Duration::from_millis(250));
    assert_eq!(config.trial.repeats, 2);
    assert!(RigConfig::from_file(file.path().with_extension("missing")).is_err());
}
