use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use log::{debug, info};
use tokio::sync::broadcast;

use crate::devices::DeviceEnumerator;
use crate::messages::Announcement;
use crate::monitor::ProximityMonitor;
use crate::presence::TransitionHandler;
use crate::sampler::SignalSampler;
use crate::scanner::Scanner;
use crate::settings::SharedSettings;
use crate::stop::StopSignal;

/// The two background workers. Both block on radio or process I/O, so each
/// gets its own thread rather than a runtime task.
pub struct Manager<S, H> {
    stop: StopSignal,
    monitor: JoinHandle<ProximityMonitor<S, H>>,
    scanner: JoinHandle<()>,
}

impl<S, H> Manager<S, H>
where
    S: SignalSampler + Send + 'static,
    H: TransitionHandler + 'static,
{
    pub fn start<E>(
        sampler: S,
        enumerator: E,
        handler: H,
        settings: SharedSettings,
        tx: broadcast::Sender<Announcement>,
    ) -> anyhow::Result<Self>
    where
        E: DeviceEnumerator + Send + 'static,
    {
        let stop = StopSignal::new();

        let scanner = {
            let stop = stop.clone();
            let settings = settings.clone();
            let scanner = Scanner::new(enumerator, tx);
            thread::Builder::new()
                .name("device-scanner".to_string())
                .spawn(move || scanner.run(&settings, &stop))?
        };

        let monitor = {
            let monitor_stop = stop.clone();
            let monitor = ProximityMonitor::new(sampler, handler, settings);
            let spawned = thread::Builder::new()
                .name("proximity-monitor".to_string())
                .spawn(move || monitor.run(&monitor_stop));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    stop.stop();
                    return Err(err.into());
                }
            }
        };
        info!("Started proximity monitor and device scanner");

        Ok(Manager {
            stop,
            monitor,
            scanner,
        })
    }

    /// Stops both workers, waits for them, and forces the "near" actions so
    /// that locks and mutes are never left behind. When sampling was already
    /// disabled the monitor has run them, so they are not repeated. Blocks
    /// for up to one interval, or a connect timeout if a sample is in flight.
    pub fn shutdown(self) -> anyhow::Result<H> {
        debug!("Stopping workers");
        self.stop.stop();

        if self.scanner.join().is_err() {
            return Err(anyhow!("device scanner thread panicked"));
        }
        let monitor = self
            .monitor
            .join()
            .map_err(|_| anyhow!("proximity monitor thread panicked"))?;

        let sampling = monitor.is_sampling();
        let (_sampler, mut handler) = monitor.into_parts();
        if sampling {
            handler.on_near();
        }
        info!("Workers stopped");
        Ok(handler)
    }
}
