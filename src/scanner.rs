use log::{debug, info};
use tokio::sync::broadcast;

use crate::devices::{AdapterStatus, Device, DeviceEnumerator};
use crate::messages::Announcement;
use crate::settings::SharedSettings;
use crate::stop::StopSignal;

/// Periodically lists paired devices and announces changes.
pub struct Scanner<E> {
    enumerator: E,
    previous: Vec<Device>,
    tx: broadcast::Sender<Announcement>,
}

impl<E: DeviceEnumerator> Scanner<E> {
    pub fn new(enumerator: E, tx: broadcast::Sender<Announcement>) -> Self {
        Scanner {
            enumerator,
            previous: Vec::new(),
            tx,
        }
    }

    /// One enumeration. Returns true when a new device list was published.
    pub fn tick(&mut self) -> bool {
        let listing = self.enumerator.list_paired_devices();
        match &listing.adapter {
            AdapterStatus::Available => {}
            AdapterStatus::Missing => debug!("No bluetooth controller available"),
            AdapterStatus::Unavailable(reason) => debug!("Device listing unavailable: {}", reason),
        }

        let changed = listing.devices != self.previous;
        if changed {
            info!("Paired devices changed: {} found", listing.devices.len());
            for device in &listing.devices {
                debug!(" {}", device);
            }
            self.previous = listing.devices;
            self.announce(Announcement::DeviceListChanged(self.previous.clone()));
        }
        self.announce(Announcement::AdapterUsable(!self.previous.is_empty()));
        changed
    }

    pub fn run(mut self, settings: &SharedSettings, stop: &StopSignal) {
        loop {
            if stop.is_stopped() {
                break;
            }
            self.tick();
            if stop.wait(settings.snapshot().scan_interval) {
                break;
            }
        }
        debug!("Device scanner stopped");
    }

    fn announce(&self, announcement: Announcement) {
        if self.tx.send(announcement).is_err() {
            debug!("No listeners for device announcements");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::devices::{DeviceListing, parse_address};

    struct ScriptedEnumerator {
        listings: VecDeque<DeviceListing>,
    }

    impl DeviceEnumerator for ScriptedEnumerator {
        fn list_paired_devices(&mut self) -> DeviceListing {
            self.listings.pop_front().unwrap_or(DeviceListing {
                devices: Vec::new(),
                adapter: AdapterStatus::Missing,
            })
        }
    }

    fn device(address: &str, name: &str) -> Device {
        Device {
            address: parse_address(address).unwrap(),
            display_name: name.to_string(),
        }
    }

    fn available(devices: Vec<Device>) -> DeviceListing {
        DeviceListing {
            devices,
            adapter: AdapterStatus::Available,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Announcement>) -> Vec<Announcement> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn scanner(
        listings: Vec<DeviceListing>,
    ) -> (Scanner<ScriptedEnumerator>, broadcast::Receiver<Announcement>) {
        let (tx, rx) = broadcast::channel(16);
        let enumerator = ScriptedEnumerator {
            listings: listings.into(),
        };
        (Scanner::new(enumerator, tx), rx)
    }

    #[test]
    fn test_identical_listing_not_republished() {
        let phone = device("AA:BB:CC:DD:EE:FF", "Phone");
        let (mut scanner, mut rx) = scanner(vec![
            available(vec![phone.clone()]),
            available(vec![phone.clone()]),
        ]);

        assert!(scanner.tick());
        assert_eq!(
            drain(&mut rx),
            vec![
                Announcement::DeviceListChanged(vec![phone.clone()]),
                Announcement::AdapterUsable(true),
            ]
        );

        assert!(!scanner.tick());
        assert_eq!(drain(&mut rx), vec![Announcement::AdapterUsable(true)]);
    }

    #[test]
    fn test_reordering_counts_as_change() {
        let a = device("AA:BB:CC:DD:EE:FF", "Phone");
        let b = device("11:22:33:44:55:66", "Watch");
        let (mut scanner, _rx) = scanner(vec![
            available(vec![a.clone(), b.clone()]),
            available(vec![b, a]),
        ]);
        assert!(scanner.tick());
        assert!(scanner.tick());
    }

    #[test]
    fn test_empty_listing_marks_adapter_unusable() {
        let phone = device("AA:BB:CC:DD:EE:FF", "Phone");
        let (mut scanner, mut rx) = scanner(vec![
            DeviceListing::unavailable("bluetoothctl not found"),
            available(vec![phone.clone()]),
        ]);

        assert!(!scanner.tick());
        assert_eq!(drain(&mut rx), vec![Announcement::AdapterUsable(false)]);

        assert!(scanner.tick());
        assert_eq!(
            drain(&mut rx),
            vec![
                Announcement::DeviceListChanged(vec![phone]),
                Announcement::AdapterUsable(true),
            ]
        );
    }

    #[test]
    fn test_devices_disappearing_is_published() {
        let phone = device("AA:BB:CC:DD:EE:FF", "Phone");
        let (mut scanner, mut rx) = scanner(vec![available(vec![phone])]);
        scanner.tick();
        drain(&mut rx);
        assert!(scanner.tick());
        assert_eq!(
            drain(&mut rx),
            vec![
                Announcement::DeviceListChanged(Vec::new()),
                Announcement::AdapterUsable(false),
            ]
        );
    }

    #[test]
    fn test_tick_without_listeners() {
        let (mut scanner, rx) = scanner(vec![]);
        drop(rx);
        assert!(!scanner.tick());
    }
}
