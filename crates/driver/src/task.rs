//! Class driver thread
//!
//! Waits for the host library, runs the driver under the configured
//! supervisor policy, deregisters and signals the creator on the way out.

use common::{EventPublisher, ReadySignal};
use host::HostController;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{DriverConfig, OnFailure, SupervisorSettings};
use crate::driver::ClassDriver;
use crate::error::Result;

/// Run `driver` until it exits, restarting it per `policy` on failure
pub fn supervise<H: HostController>(
    driver: &mut ClassDriver<H>,
    policy: &SupervisorSettings,
) -> Result<()> {
    let mut restarts = 0u32;
    loop {
        let err = match driver.run() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        error!("Class driver failed: {}", err);
        driver.teardown();

        let retry = policy.on_failure == OnFailure::Restart
            && err.is_restartable()
            && restarts < policy.max_restarts;
        if !retry {
            return Err(err);
        }

        restarts += 1;
        warn!(
            "Restarting enumeration ({}/{})",
            restarts, policy.max_restarts
        );
        if !driver.restart() {
            info!("No device tracked, waiting for the next one");
        }
    }
}

/// Body of the class driver thread
///
/// Takes `signal` before touching the host (the daemon gives it once the
/// library is installed) and gives it back when done. `connect` builds the
/// host controller on this thread.
pub fn class_driver_task<H, F>(
    signal: ReadySignal,
    config: &DriverConfig,
    connect: F,
    events: Option<EventPublisher>,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    H: HostController,
    F: FnOnce() -> Result<H>,
{
    signal.take();
    info!("Host library ready, starting class driver");

    let result = run_driver(config, connect, events, shutdown);
    if let Err(e) = &result {
        error!("Class driver stopped: {}", e);
    }

    signal.give();
    result
}

fn run_driver<H, F>(
    config: &DriverConfig,
    connect: F,
    events: Option<EventPublisher>,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    H: HostController,
    F: FnOnce() -> Result<H>,
{
    let host = connect()?;
    let mut driver = ClassDriver::new(host, config.driver_settings())?.with_shutdown_flag(shutdown);
    if let Some(events) = events {
        driver = driver.with_events(events);
    }

    let outcome = supervise(&mut driver, &config.supervisor);
    match driver.shutdown() {
        Ok(_) => outcome,
        Err(e) => match outcome {
            Ok(()) => Err(e),
            Err(first) => {
                warn!("{}", e);
                Err(first)
            }
        },
    }
}

/// Spawn the class driver thread
pub fn spawn_class_driver<H, F>(
    signal: ReadySignal,
    config: DriverConfig,
    connect: F,
    events: Option<EventPublisher>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<Result<()>>>
where
    H: HostController,
    F: FnOnce() -> Result<H> + Send + 'static,
{
    std::thread::Builder::new()
        .name("hid-class-driver".to_string())
        .spawn(move || class_driver_task(signal, &config, connect, events, shutdown))
}
