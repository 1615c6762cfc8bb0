use std::sync::Arc;
use std::time::Duration;

use gonioexpctrl_backend::camera::AcquisitionRemote;
use gonioexpctrl_backend::error::RemoteError;
use gonioexpctrl_backend::{ManualClock, MemoryPort, Rig, RigConfig, SimulatedBackend, TriggerDirection};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Camera stand-in that only logs the commands it receives.
struct LoggingRemote;

impl AcquisitionRemote for LoggingRemote {
    fn acquire_series(
        &self,
        exposure: f64,
        interval: f64,
        frames: usize,
        label: &str,
        subdir: &str,
        direction: TriggerDirection,
    ) -> Result<(), RemoteError> {
        info!(
            "acquireSeries: {} frames of {} s (interval {}), {} in {}, trigger {}",
            frames, exposure, interval, label, subdir, direction
        );
        Ok(())
    }

    fn acquire_single(&self, save: bool, subdir: &str) -> Result<(), RemoteError> {
        info!("acquireSingle: save {} in {:?}", save, subdir);
        Ok(())
    }

    fn set_saving_directory(&self, path: &str) -> Result<(), RemoteError> {
        info!("setSavingDirectory: {}", path);
        Ok(())
    }

    fn save_description(&self, name: &str, text: &str) -> Result<(), RemoteError> {
        info!("saveDescription for {}:\n{}", name, text);
        Ok(())
    }

    fn close_server(&self) -> Result<(), RemoteError> {
        info!("exit");
        Ok(())
    }
}

// Dry run of one imaging sequence: simulated analog outputs, an in-memory encoder board,
// a logging camera and a virtual clock. Usage: gonioexpctrl_backend_bin [config.toml]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => match RigConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        None => RigConfig::default(),
    };
    config.motors.return_timeout = Duration::from_secs(1);

    if let Err(e) = dry_run(config) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn dry_run(config: RigConfig) -> gonioexpctrl_backend::Result<()> {
    let port = MemoryPort::new();
    port.feed("0,0\n");
    let backend = SimulatedBackend::new();
    let clock = Arc::new(ManualClock::new());

    let mut rig = Rig::new(
        config,
        port.clone(),
        Box::new(LoggingRemote),
        Arc::new(backend.clone()),
        clock.clone(),
    )?;
    rig.tick()?;
    rig.initialize("demo", "", "")?;
    let report = rig.image_series(None)?;
    for record in &report.records {
        info!("{}: {} frames in {}", record.label, record.frames, record.subdir);
    }
    info!(
        "{:?} after {} playbacks, {:?} of virtual time",
        report.status,
        backend.playbacks().len(),
        clock.elapsed()
    );
    rig.finalize()
}
