use std::fmt;
use std::process::Command;

use log::debug;
use mac_address::MacAddress;

const NO_CONTROLLER: &str = "No default controller available";

/// A paired device as reported by the platform. Identity is the address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub address: MacAddress,
    pub display_name: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.address)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterStatus {
    Available,
    /// The platform reported that no controller is present.
    Missing,
    /// The listing facility itself could not be run.
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceListing {
    pub devices: Vec<Device>,
    pub adapter: AdapterStatus,
}

impl DeviceListing {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        DeviceListing {
            devices: Vec::new(),
            adapter: AdapterStatus::Unavailable(reason.into()),
        }
    }
}

pub trait DeviceEnumerator {
    fn list_paired_devices(&mut self) -> DeviceListing;
}

/// Lists paired devices through `bluetoothctl devices`.
#[derive(Debug, Clone)]
pub struct BluetoothctlEnumerator {
    program: String,
}

impl BluetoothctlEnumerator {
    pub fn new() -> Self {
        BluetoothctlEnumerator {
            program: "bluetoothctl".to_string(),
        }
    }
}

impl Default for BluetoothctlEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for BluetoothctlEnumerator {
    fn list_paired_devices(&mut self) -> DeviceListing {
        let output = match Command::new(&self.program).arg("devices").output() {
            Ok(output) => output,
            Err(err) => {
                debug!("Unable to run {}: {}", self.program, err);
                return DeviceListing::unavailable(err.to_string());
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("{} exited with {}: {}", self.program, output.status, stderr.trim());
        }
        parse_device_listing(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses `bluetoothctl devices` output. Each line is `Device <address>
/// <name...>`; the no-controller line ends parsing.
pub fn parse_device_listing(output: &str) -> DeviceListing {
    let mut devices = Vec::new();
    for line in output.lines() {
        if line.trim() == NO_CONTROLLER {
            return DeviceListing {
                devices: Vec::new(),
                adapter: AdapterStatus::Missing,
            };
        }
        let mut tokens = line.split_whitespace();
        let (Some(_), Some(address)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let Ok(address) = address.parse::<MacAddress>() else {
            debug!("Skipping unparseable device line: {}", line);
            continue;
        };
        devices.push(Device {
            address,
            display_name: tokens.collect::<Vec<_>>().join(" "),
        });
    }
    DeviceListing {
        devices,
        adapter: AdapterStatus::Available,
    }
}

/// Parses a configured address, rejecting anything that isn't six
/// colon or dash separated octets.
pub fn parse_address(address: &str) -> Option<MacAddress> {
    address.trim().parse::<MacAddress>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_listing() {
        let output = "Device 84:CF:BF:8D:90:D4 FP3\nDevice 8C:79:F5:B9:C4:BF [TV] TV  stua\n";
        let listing = parse_device_listing(output);
        assert_eq!(listing.adapter, AdapterStatus::Available);
        assert_eq!(listing.devices.len(), 2);
        assert_eq!(listing.devices[0].address.to_string(), "84:CF:BF:8D:90:D4");
        assert_eq!(listing.devices[0].display_name, "FP3");
        assert_eq!(listing.devices[1].display_name, "[TV] TV stua");
    }

    #[test]
    fn test_parse_device_listing_lowercase_address() {
        let listing = parse_device_listing("Device 84:cf:bf:8d:90:d4 Phone\n");
        assert_eq!(
            listing.devices[0].address,
            parse_address("84:CF:BF:8D:90:D4").unwrap()
        );
    }

    #[test]
    fn test_parse_device_listing_no_controller() {
        let output = "Device 84:CF:BF:8D:90:D4 FP3\nNo default controller available\nDevice 8C:79:F5:B9:C4:BF TV\n";
        let listing = parse_device_listing(output);
        assert_eq!(listing.adapter, AdapterStatus::Missing);
        assert!(listing.devices.is_empty());
    }

    #[test]
    fn test_parse_device_listing_skips_noise() {
        let output = "\nAgent registered\nDevice not-an-address Foo\nDevice 78:BD:BC:6E:C5:A3\n";
        let listing = parse_device_listing(output);
        assert_eq!(listing.devices.len(), 1);
        assert_eq!(listing.devices[0].display_name, "");
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("AA:BB:CC:DD:EE:FF").is_some());
        assert!(parse_address("aa:bb:cc:dd:ee:ff").is_some());
        assert!(parse_address("AA:BB:CC").is_none());
        assert!(parse_address("").is_none());
    }
}
