use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

use crate::settings::SamplingParameters;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub device: Option<DeviceConfig>,
    pub proximity: Option<ProximityConfig>,
    pub scan: Option<ScanConfig>,
    pub actions: Option<ActionsConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DeviceConfig {
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProximityConfig {
    pub enabled: Option<bool>,
    pub threshold: Option<i8>,
    pub interval_seconds: Option<u64>,
    pub away_count: Option<u32>,
    pub connect_timeout_seconds: Option<u64>,
    /// Index of the HCI adapter, `0` for hci0.
    pub adapter: Option<u16>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interval_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ActionsConfig {
    pub here: Option<HereActions>,
    pub away: Option<AwayActions>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct HereActions {
    #[serde(default)]
    pub unlock: bool,
    #[serde(default)]
    pub resume_media: bool,
    #[serde(default)]
    pub unmute: bool,
    pub command: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct AwayActions {
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub pause_media: bool,
    pub command: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn device_name(&self) -> String {
        self.device
            .as_ref()
            .and_then(|d| d.name.clone())
            .unwrap_or("(current)".to_string())
    }

    pub fn sampling_parameters(&self) -> SamplingParameters {
        let defaults = SamplingParameters::default();
        let device = self.device.clone().unwrap_or_default();
        let proximity = self.proximity.clone().unwrap_or_default();
        let scan = self.scan.clone().unwrap_or_default();

        SamplingParameters {
            target_address: device.address.filter(|a| !a.trim().is_empty()),
            device_name: self.device_name(),
            threshold_dbm: proximity.threshold.unwrap_or(defaults.threshold_dbm),
            interval: proximity
                .interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            miss_limit: proximity.away_count.unwrap_or(defaults.miss_limit).max(1),
            enabled: proximity.enabled.unwrap_or(defaults.enabled),
            connect_timeout: proximity
                .connect_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            adapter_index: proximity.adapter.unwrap_or(defaults.adapter_index),
            scan_interval: scan
                .interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [device]
            address = "84:CF:BF:8D:90:D4"
            name = "FP3"

            [proximity]
            enabled = true
            threshold = -10
            interval_seconds = 2
            away_count = 4

            [scan]
            interval_seconds = 30

            [actions.here]
            unlock = true
            command = "notify-send hello"

            [actions.away]
            lock = true
            mute = true

            [mqtt]
            host = "localhost"
            port = 1883
        "#;
        let config: AppConfig = toml::de::from_str(&config_str).unwrap();
        let params = config.sampling_parameters();
        assert_eq!(params.target_address.as_deref(), Some("84:CF:BF:8D:90:D4"));
        assert_eq!(params.threshold_dbm, -10);
        assert_eq!(params.interval, Duration::from_secs(2));
        assert_eq!(params.miss_limit, 4);
        assert!(params.enabled);
        assert_eq!(params.scan_interval, Duration::from_secs(30));
        assert_eq!(config.device_name(), "FP3");
        assert_eq!(params.device_name, "FP3");

        let actions = config.actions.unwrap();
        let here = actions.here.unwrap();
        assert!(here.unlock && !here.unmute);
        assert_eq!(here.command.as_deref(), Some("notify-send hello"));
        let away = actions.away.unwrap();
        assert!(away.lock && away.mute && !away.pause_media);
        assert!(config.mqtt.map(|m| m.host) == Some("localhost".to_string()));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::de::from_str("").unwrap();
        let params = config.sampling_parameters();
        assert_eq!(params, SamplingParameters::default());
        assert_eq!(params.threshold_dbm, -4);
        assert_eq!(params.miss_limit, 3);
        assert_eq!(params.interval, Duration::from_secs(5));
        assert!(!params.enabled);
    }

    #[test]
    fn test_blank_address_and_zero_away_count() {
        let config: AppConfig = toml::de::from_str(
            r#"
            [device]
            address = "  "
            [proximity]
            away_count = 0
        "#,
        )
        .unwrap();
        let params = config.sampling_parameters();
        assert!(params.target_address.is_none());
        assert_eq!(params.miss_limit, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proximity]\nthreshold = -7").unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.sampling_parameters().threshold_dbm, -7);
    }

    #[test]
    fn test_load_reports_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proximity]\nthreshold = \"loud\"").unwrap();
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing config file"));
        assert!(AppConfig::load(Path::new("/nonexistent/proximity.toml")).is_err());
    }
}
