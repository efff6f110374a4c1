use crate::devices::Device;

/// Published by the worker threads for whoever is listening in the
/// foreground.
#[derive(Clone, Debug, PartialEq)]
pub enum Announcement {
    /// Emitted every sampling tick; `None` means no measurement.
    Signal(Option<i8>),
    Presence(DevicePresence),
    /// Emitted only when the ordered device list changed.
    DeviceListChanged(Vec<Device>),
    /// Emitted every enumeration tick.
    AdapterUsable(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePresence {
    Present(/* confidence */ u8),
    Absent,
}

impl DevicePresence {
    pub fn confidence(&self) -> u8 {
        match self {
            DevicePresence::Present(confidence) => *confidence,
            DevicePresence::Absent => 0,
        }
    }
}

/// Commands received from the outside while running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Enable,
    Disable,
}
