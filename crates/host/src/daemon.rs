//! Host library daemon
//!
//! Installs libusb, announces readiness, keeps the library alive while
//! clients are registered and uninstalls it once the last one is gone.

use common::ReadySignal;
use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::rusb_host::{LibraryEvent, RusbLibrary};

/// Body of the host daemon thread
///
/// Hands the installed library to `installed`, gives `signal` once ready and
/// once more after uninstalling. On install failure the signal is still
/// given so waiting clients wake up and find `installed` disconnected.
pub fn host_daemon_task(signal: ReadySignal, installed: Sender<RusbLibrary>) -> Result<()> {
    let library = match RusbLibrary::install() {
        Ok(library) => library,
        Err(e) => {
            error!("Failed to install host library: {}", e);
            drop(installed);
            signal.give();
            return Err(e);
        }
    };

    let _ = installed.send(library.clone());
    drop(installed);
    signal.give();
    info!("Host library installed");

    loop {
        match library.wait_event() {
            Some(LibraryEvent::ClientRegistered) => {
                debug!("Client registered ({} active)", library.client_count());
            }
            Some(LibraryEvent::AllClientsGone) => {
                info!("All clients deregistered");
                break;
            }
            Some(LibraryEvent::Shutdown) => {
                info!("Host daemon shutdown requested");
                break;
            }
            None => break,
        }
    }

    drop(library);
    info!("Host library uninstalled");
    signal.give();
    Ok(())
}

/// Spawn the host daemon thread
pub fn spawn_host_daemon(
    signal: ReadySignal,
    installed: Sender<RusbLibrary>,
) -> std::io::Result<std::thread::JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("usb-host-daemon".to_string())
        .spawn(move || host_daemon_task(signal, installed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_daemon_lifecycle() {
        let signal = ReadySignal::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = spawn_host_daemon(signal.clone(), tx).unwrap();

        assert!(signal.take_timeout(Duration::from_secs(5)));
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(library) => {
                library.request_shutdown();
                drop(library);
                assert!(signal.take_timeout(Duration::from_secs(5)));
                assert!(handle.join().unwrap().is_ok());
            }
            Err(_) => {
                // No libusb in this environment
                assert!(handle.join().unwrap().is_err());
            }
        }
    }
}
