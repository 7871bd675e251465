use crate::address::AddressMatcher;
use config::{Config, File};
use ng_devhub_error::HubResult;
use serde::{self, Deserialize};
use std::{ops::Deref, sync::Arc, time::Duration};

#[derive(Debug, Clone, Default)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(config_path: String) -> HubResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path.as_str()).required(false))
            .add_source(
                config::Environment::with_prefix("NG")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("service.protocol_matchers")
                    .with_list_parse_key("service.platform_matchers")
                    .with_list_parse_key("service.hub_protocols"),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub log: Log,
}

/// Executor lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverSettings {
    /// Mailbox capacity of each executor.
    #[serde(default = "DriverSettings::backlog_size_default")]
    pub backlog_size: usize,
    /// Delay before a tombstoned executor is evicted. `0` disables the timer.
    #[serde(default = "DriverSettings::tombstone_timeout_ms_default")]
    pub tombstone_timeout_ms: u64,
    /// How long an upgrade waits for the old executor to stop.
    #[serde(default = "DriverSettings::upgrade_timeout_ms_default")]
    pub upgrade_timeout_ms: u64,
    /// How long remove/delete/tombstone wait for the `Disassociated` event.
    #[serde(default = "DriverSettings::disassociate_timeout_ms_default")]
    pub disassociate_timeout_ms: u64,
    /// Upper bound on cached executors; unbounded when absent.
    #[serde(default)]
    pub executor_cache_capacity: Option<u64>,
    /// Idle eviction of executors. `0` keeps them until explicitly removed.
    #[serde(default)]
    pub executor_idle_timeout_ms: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            backlog_size: Self::backlog_size_default(),
            tombstone_timeout_ms: Self::tombstone_timeout_ms_default(),
            upgrade_timeout_ms: Self::upgrade_timeout_ms_default(),
            disassociate_timeout_ms: Self::disassociate_timeout_ms_default(),
            executor_cache_capacity: None,
            executor_idle_timeout_ms: 0,
        }
    }
}

impl DriverSettings {
    fn backlog_size_default() -> usize {
        100
    }

    fn tombstone_timeout_ms_default() -> u64 {
        300_000
    }

    fn upgrade_timeout_ms_default() -> u64 {
        30_000
    }

    fn disassociate_timeout_ms_default() -> u64 {
        30_000
    }

    #[inline]
    pub fn tombstone_timeout(&self) -> Option<Duration> {
        (self.tombstone_timeout_ms > 0).then(|| Duration::from_millis(self.tombstone_timeout_ms))
    }

    #[inline]
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    #[inline]
    pub fn disassociate_timeout(&self) -> Duration {
        Duration::from_millis(self.disassociate_timeout_ms)
    }

    #[inline]
    pub fn executor_idle_timeout(&self) -> Option<Duration> {
        (self.executor_idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.executor_idle_timeout_ms))
    }
}

/// Message routing and reconciliation tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Size of the router's worker pool.
    #[serde(default = "ServiceSettings::max_workers_default")]
    pub max_workers: usize,
    #[serde(default = "ServiceSettings::restore_lost_devices_default")]
    pub restore_lost_devices: bool,
    #[serde(default = "ServiceSettings::protocol_matchers_default")]
    pub protocol_matchers: Vec<String>,
    #[serde(default = "ServiceSettings::platform_matchers_default")]
    pub platform_matchers: Vec<String>,
    /// Encoded sync responses above this many bytes are logged.
    #[serde(default = "ServiceSettings::sync_size_warning_default")]
    pub sync_size_warning: usize,
    /// Protocols whose devices are paired through a hub.
    #[serde(default = "ServiceSettings::hub_protocols_default")]
    pub hub_protocols: Vec<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_workers: Self::max_workers_default(),
            restore_lost_devices: Self::restore_lost_devices_default(),
            protocol_matchers: Self::protocol_matchers_default(),
            platform_matchers: Self::platform_matchers_default(),
            sync_size_warning: Self::sync_size_warning_default(),
            hub_protocols: Self::hub_protocols_default(),
        }
    }
}

impl ServiceSettings {
    fn max_workers_default() -> usize {
        32
    }

    fn restore_lost_devices_default() -> bool {
        true
    }

    fn protocol_matchers_default() -> Vec<String> {
        vec!["*".into()]
    }

    fn platform_matchers_default() -> Vec<String> {
        vec!["DRIV:*".into(), "SERV:devsvc:*".into(), "BCAST".into()]
    }

    fn sync_size_warning_default() -> usize {
        1024 * 1024
    }

    fn hub_protocols_default() -> Vec<String> {
        vec!["ZIGB".into(), "ZWAV".into()]
    }

    pub fn protocol_address_matchers(&self) -> Vec<AddressMatcher> {
        self.protocol_matchers
            .iter()
            .map(|m| AddressMatcher::parse(m))
            .collect()
    }

    pub fn platform_address_matchers(&self) -> Vec<AddressMatcher> {
        self.platform_matchers
            .iter()
            .map(|m| AddressMatcher::parse(m))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::level_default")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::level_default(),
        }
    }
}

impl Log {
    fn level_default() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_file() {
        let settings = Settings::new("/nonexistent/devhub".to_string()).unwrap();
        assert_eq!(settings.driver.backlog_size, 100);
        assert_eq!(
            settings.driver.tombstone_timeout(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(settings.driver.executor_idle_timeout(), None);
        assert_eq!(settings.service.hub_protocols, vec!["ZIGB", "ZWAV"]);
        assert!(settings.service.restore_lost_devices);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[driver]\nbacklog_size = 8\ntombstone_timeout_ms = 0\n\n[service]\nrestore_lost_devices = false\nmax_workers = 4"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();
        let settings = Settings::new(path).unwrap();
        assert_eq!(settings.driver.backlog_size, 8);
        assert_eq!(settings.driver.tombstone_timeout(), None);
        assert!(!settings.service.restore_lost_devices);
        assert_eq!(settings.service.max_workers, 4);
        assert_eq!(settings.driver.upgrade_timeout(), Duration::from_secs(30));
    }
}
