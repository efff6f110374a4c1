use std::sync::{Arc, RwLock};
use std::time::Duration;

use mac_address::MacAddress;

use crate::devices::parse_address;

/// Everything the loops read per tick. Published as a whole so related
/// fields (address and threshold, say) always change together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplingParameters {
    pub target_address: Option<String>,
    pub device_name: String,
    pub threshold_dbm: i8,
    pub interval: Duration,
    pub miss_limit: u32,
    pub enabled: bool,
    pub connect_timeout: Duration,
    pub adapter_index: u16,
    pub scan_interval: Duration,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        SamplingParameters {
            target_address: None,
            device_name: "(current)".to_string(),
            threshold_dbm: -4,
            interval: Duration::from_secs(5),
            miss_limit: 3,
            enabled: false,
            connect_timeout: Duration::from_secs(10),
            adapter_index: 0,
            scan_interval: Duration::from_secs(5),
        }
    }
}

impl SamplingParameters {
    pub fn target(&self) -> Option<MacAddress> {
        self.target_address.as_deref().and_then(parse_address)
    }
}

/// Single-writer, many-reader holder of the current parameters.
#[derive(Clone, Debug, Default)]
pub struct SharedSettings {
    current: Arc<RwLock<Arc<SamplingParameters>>>,
}

impl SharedSettings {
    pub fn new(params: SamplingParameters) -> Self {
        SharedSettings {
            current: Arc::new(RwLock::new(Arc::new(params))),
        }
    }

    pub fn snapshot(&self) -> Arc<SamplingParameters> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, params: SamplingParameters) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(params);
    }

    pub fn update(&self, f: impl FnOnce(&mut SamplingParameters)) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}
