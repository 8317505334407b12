//! Fleet configuration.
//!
//! Loaded from an optional YAML/JSON file, then overridden by `FLEET_*`
//! environment variables (a `.env` file is honoured via `dotenvy`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ports::{PortRange, PortService, ServicePortRanges};
use crate::retry::RetryPolicy;

/// VM template for one OS type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsTemplate {
    /// Host path of the base VM disk image.
    pub image_path: String,
    pub disk_size: String,
    pub ram_size: String,
    pub cpu_cores: u32,
}

impl OsTemplate {
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            disk_size: "32G".to_string(),
            ram_size: "4G".to_string(),
            cpu_cores: 4,
        }
    }
}

/// Waits and hard timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Pause after a launch or restart before the first readiness probe.
    pub grace_period_ms: u64,
    /// Per-probe HTTP timeout.
    pub probe_timeout_ms: u64,
    /// Hard timeout for one launch attempt.
    pub launch_timeout_ms: u64,
    /// Grace given to the engine when stopping a container.
    pub stop_timeout_ms: u64,
    /// Upper bound on waiting for a conflicting container to disappear.
    pub removal_wait_ms: u64,
    pub removal_poll_ms: u64,
    /// Pause after removal before ports are returned to the pool.
    pub settle_ms: u64,
}

impl Timings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn removal_wait(&self) -> Duration {
        Duration::from_millis(self.removal_wait_ms)
    }

    pub fn removal_poll(&self) -> Duration {
        Duration::from_millis(self.removal_poll_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// All waits zeroed; timeouts kept short but non-zero.
    pub fn immediate() -> Self {
        Self {
            grace_period_ms: 0,
            probe_timeout_ms: 1_000,
            launch_timeout_ms: 5_000,
            stop_timeout_ms: 1_000,
            removal_wait_ms: 100,
            removal_poll_ms: 0,
            settle_ms: 0,
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
            probe_timeout_ms: 10_000,
            launch_timeout_ms: 120_000,
            stop_timeout_ms: 30_000,
            removal_wait_ms: 10_000,
            removal_poll_ms: 500,
            settle_ms: 2_000,
        }
    }
}

/// Retry policy per operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub engine: RetryPolicy,
    pub teardown: RetryPolicy,
    pub readiness: RetryPolicy,
    pub launch: RetryPolicy,
}

impl RetryPolicies {
    pub fn without_delay(&self) -> Self {
        Self {
            engine: self.engine.without_delay(),
            teardown: self.teardown.without_delay(),
            readiness: self.readiness.without_delay(),
            launch: self.launch.without_delay(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            engine: RetryPolicy::engine(),
            teardown: RetryPolicy::teardown(),
            readiness: RetryPolicy::readiness(),
            launch: RetryPolicy::launch(),
        }
    }
}

/// Top-level configuration for the fleet manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Container image that boots the VM.
    pub engine_image: String,
    /// Host used for readiness probes and handed back to callers.
    pub sandbox_host: String,
    /// Path probed on the control port.
    pub readiness_path: String,
    /// Templates keyed by OS type.
    pub templates: BTreeMap<String, OsTemplate>,
    pub ports: ServicePortRanges,
    /// Simultaneous heavyweight engine operations.
    pub max_concurrent_launches: usize,
    /// Externally configured sandbox quota.
    pub capacity: usize,
    /// Consult host socket tables when picking ports.
    pub scan_host_ports: bool,
    pub timings: Timings,
    pub retry: RetryPolicies,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(
            "ubuntu".to_string(),
            OsTemplate::new("./vm_data/Ubuntu.qcow2"),
        );

        Self {
            engine_image: "qemux/qemu:latest".to_string(),
            sandbox_host: "127.0.0.1".to_string(),
            readiness_path: "/screenshot".to_string(),
            templates,
            ports: ServicePortRanges::default(),
            max_concurrent_launches: default_launch_permits(),
            capacity: 16,
            scan_host_ports: true,
            timings: Timings::default(),
            retry: RetryPolicies::default(),
        }
    }
}

fn default_launch_permits() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl FleetConfig {
    /// Load from a YAML or JSON file (by extension).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
        }
    }

    /// File (if given), then `.env`, then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        let _ = dotenvy::dotenv();
        config.apply_env_from(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLEET_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(std::env::vars())
    }

    /// Apply `FLEET_*` overrides from an explicit variable list.
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix("FLEET_") else {
                continue;
            };

            match suffix {
                "ENGINE_IMAGE" => self.engine_image = value,
                "SANDBOX_HOST" => self.sandbox_host = value,
                "READINESS_PATH" => self.readiness_path = value,
                "CAPACITY" => self.capacity = parse_number(&key, &value)?,
                "MAX_CONCURRENT_LAUNCHES" => {
                    self.max_concurrent_launches = parse_number(&key, &value)?
                }
                "SCAN_HOST_PORTS" => self.scan_host_ports = parse_bool(&key, &value)?,
                "PORTS_DISPLAY" => self.set_range(PortService::Display, &key, &value)?,
                "PORTS_CONTROL" => self.set_range(PortService::Control, &key, &value)?,
                "PORTS_BROWSER_DEBUG" => {
                    self.set_range(PortService::BrowserDebug, &key, &value)?
                }
                "PORTS_MEDIA" => self.set_range(PortService::Media, &key, &value)?,
                other => {
                    if let Some(os_type) = other.strip_prefix("TEMPLATE_") {
                        let os_type = os_type.to_ascii_lowercase();
                        self.templates
                            .entry(os_type)
                            .and_modify(|t| t.image_path = value.clone())
                            .or_insert_with(|| OsTemplate::new(value.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn set_range(&mut self, service: PortService, key: &str, value: &str) -> Result<(), ConfigError> {
        let range = PortRange::parse(value).map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        })?;
        self.ports.set(service, range);
        Ok(())
    }

    /// Reject configurations the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for service in PortService::ALL {
            let range = self.ports.get(service);
            if range.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("ports.{}", service),
                    message: format!("range {} is empty", range),
                });
            }
        }
        if self.max_concurrent_launches == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_launches".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.templates.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "templates".to_string(),
                message: "at least one OS template is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn template(&self, os_type: &str) -> Option<&OsTemplate> {
        self.templates.get(&os_type.to_ascii_lowercase())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert!(config.template("ubuntu").is_some());
        assert!(config.template("windows").is_none());
        assert_eq!(config.capacity, 16);
        assert!(config.max_concurrent_launches >= 1);
        assert_eq!(config.timings.grace_period(), Duration::from_secs(3));
        assert_eq!(config.timings.launch_timeout(), Duration::from_secs(120));
        assert_eq!(config.timings.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.readiness.max_attempts, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_lookup_is_case_insensitive() {
        let config = FleetConfig::default();
        assert!(config.template("Ubuntu").is_some());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FleetConfig::default();
        config
            .apply_env_from(vars(&[
                ("FLEET_CAPACITY", "3"),
                ("FLEET_MAX_CONCURRENT_LAUNCHES", "2"),
                ("FLEET_PORTS_CONTROL", "7000-7010"),
                ("FLEET_SCAN_HOST_PORTS", "false"),
                ("FLEET_TEMPLATE_DEBIAN", "/images/debian.qcow2"),
                ("FLEET_TEMPLATE_UBUNTU", "/images/ubuntu.qcow2"),
                ("UNRELATED", "ignored"),
            ]))
            .unwrap();

        assert_eq!(config.capacity, 3);
        assert_eq!(config.max_concurrent_launches, 2);
        assert_eq!(config.ports.control, PortRange::new(7000, 7010));
        assert!(!config.scan_host_ports);
        assert_eq!(
            config.template("debian").unwrap().image_path,
            "/images/debian.qcow2"
        );
        assert_eq!(
            config.template("ubuntu").unwrap().image_path,
            "/images/ubuntu.qcow2"
        );
    }

    #[test]
    fn test_invalid_env_value_names_variable() {
        let mut config = FleetConfig::default();
        let err = config
            .apply_env_from(vars(&[("FLEET_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("FLEET_CAPACITY"));

        let err = config
            .apply_env_from(vars(&[("FLEET_PORTS_MEDIA", "9000-8000")]))
            .unwrap_err();
        assert!(err.to_string().contains("FLEET_PORTS_MEDIA"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = FleetConfig {
            capacity: 0,
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let mut config = FleetConfig::default();
        config.ports.media = PortRange::new(10, 10);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ports.media"));
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            "capacity: 4\nports:\n  display:\n    start: 6000\n    end: 6010\ntemplates:\n  ubuntu:\n    image_path: /vm/ubuntu.qcow2\n    disk_size: 64G\n    ram_size: 8G\n    cpu_cores: 8\n",
        )
        .unwrap();

        let config = FleetConfig::load_from(&path).unwrap();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.ports.display, PortRange::new(6000, 6010));
        assert_eq!(config.ports.control, ServicePortRanges::default().control);
        assert_eq!(config.template("ubuntu").unwrap().cpu_cores, 8);
        assert_eq!(config.timings, Timings::default());
    }

    #[test]
    fn test_load_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, r#"{"engine_image": "custom/vm:1", "retry": {"launch": {"max_attempts": 2, "delay_ms": 10}}}"#)
            .unwrap();

        let config = FleetConfig::load_from(&path).unwrap();
        assert_eq!(config.engine_image, "custom/vm:1");
        assert_eq!(config.retry.launch, RetryPolicy::new(2, 10));
        assert_eq!(config.retry.engine, RetryPolicy::engine());
    }

    #[test]
    fn test_load_corrupted_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, "capacity: [not, a, number").unwrap();
        assert!(matches!(
            FleetConfig::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_retry_policies_without_delay() {
        let policies = RetryPolicies::default().without_delay();
        assert_eq!(policies.engine.delay_ms, 0);
        assert_eq!(policies.engine.max_attempts, 5);
        assert_eq!(policies.launch.delay_ms, 0);
    }
}
