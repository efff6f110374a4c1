use log::{debug, info, warn};

use crate::presence::{PresenceTracker, Transition, TransitionHandler};
use crate::sampler::SignalSampler;
use crate::settings::{SamplingParameters, SharedSettings};
use crate::stop::StopSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    Disabled,
    /// No usable target address; the sampler was not consulted.
    Skipped,
    Sampled(Option<Transition>),
}

/// The sampling worker. Owns the sampler (and with it the radio session)
/// exclusively; runs one sample per tick and reports transitions.
pub struct ProximityMonitor<S, H> {
    sampler: S,
    handler: H,
    settings: SharedSettings,
    tracker: PresenceTracker,
    was_enabled: bool,
}

impl<S: SignalSampler, H: TransitionHandler> ProximityMonitor<S, H> {
    pub fn new(sampler: S, handler: H, settings: SharedSettings) -> Self {
        ProximityMonitor {
            sampler,
            handler,
            settings,
            tracker: PresenceTracker::new(),
            was_enabled: false,
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Whether the last tick ran with sampling enabled.
    pub fn is_sampling(&self) -> bool {
        self.was_enabled
    }

    pub fn into_parts(self) -> (S, H) {
        (self.sampler, self.handler)
    }

    pub fn tick(&mut self, params: &SamplingParameters) -> Tick {
        if !params.enabled {
            if self.was_enabled {
                info!("Proximity sampling disabled");
                self.was_enabled = false;
                self.sampler.release();
                // Restore the safe "near" side effects on manual disable.
                self.tracker.reset();
                self.handler.on_near();
            }
            self.handler.on_signal(None);
            return Tick::Disabled;
        }
        if !self.was_enabled {
            info!("Proximity sampling enabled");
            self.was_enabled = true;
        }

        let Some(address) = params.target() else {
            debug!(
                "Invalid address {:?}, not sampling",
                params.target_address.as_deref().unwrap_or_default()
            );
            self.sampler.release();
            self.handler.on_signal(None);
            return Tick::Skipped;
        };

        self.sampler.reconfigure(params.adapter_index, params.connect_timeout);
        let rssi = match self.sampler.sample(&address) {
            Ok(rssi) => Some(rssi),
            Err(err) if err.is_expected() => {
                debug!("No signal from {}: {}", address, err);
                None
            }
            Err(err) => {
                warn!("Sampling {} failed: {}", address, err);
                None
            }
        };
        self.handler.on_signal(rssi);

        let transition = self
            .tracker
            .observe(rssi, params.threshold_dbm, params.miss_limit);
        debug!(
            "addr: {}, rssi: {:?}, misses: {}, state: {:?}",
            address,
            rssi,
            self.tracker.misses(),
            self.tracker.state()
        );
        match transition {
            Some(Transition::BecameFar) => {
                info!("{} is away", address);
                self.handler.on_far();
            }
            Some(Transition::BecameNear) => {
                info!("{} is here", address);
                self.handler.on_near();
            }
            None => {}
        }
        Tick::Sampled(transition)
    }

    /// Ticks until `stop` is signalled, then releases the session. No final
    /// transition is synthesized; that is up to the caller.
    pub fn run(mut self, stop: &StopSignal) -> Self {
        loop {
            if stop.is_stopped() {
                break;
            }
            let params = self.settings.snapshot();
            self.tick(&params);
            if stop.wait(params.interval) {
                break;
            }
        }
        self.sampler.release();
        debug!("Proximity monitor stopped");
        self
    }
}
