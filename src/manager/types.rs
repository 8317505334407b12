//! Request, record and response types for the lifecycle manager.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::engine::EngineHandle;
use crate::error::{FleetError, Result};
use crate::ports::PortSet;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,62}$").expect("static regex is valid")
});

/// Caller-supplied launch parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Sandbox name; generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub os_type: String,
    #[serde(default)]
    pub disk_size: Option<String>,
    #[serde(default)]
    pub ram_size: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub headless: Option<bool>,
    /// Extra environment passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StartRequest {
    pub fn for_os(os_type: impl Into<String>) -> Self {
        Self {
            os_type: os_type.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Template merged with caller overrides. Fixed once provisioning starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub os_type: String,
    pub image_path: String,
    pub disk_size: String,
    pub ram_size: String,
    pub cpu_cores: u32,
    pub headless: bool,
    pub extra_env: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Merge `request` over the template for its OS type.
    pub fn resolve(config: &FleetConfig, request: &StartRequest) -> Result<Self> {
        let template =
            config
                .template(&request.os_type)
                .ok_or_else(|| FleetError::UnsupportedOsType {
                    os_type: request.os_type.clone(),
                })?;

        if request.cpu_cores == Some(0) {
            return Err(FleetError::InvalidRequest {
                reason: "cpuCores must be at least 1".to_string(),
            });
        }
        for key in request.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(FleetError::InvalidRequest {
                    reason: format!("invalid environment variable name '{}'", key),
                });
            }
        }

        Ok(Self {
            os_type: request.os_type.to_ascii_lowercase(),
            image_path: template.image_path.clone(),
            disk_size: request
                .disk_size
                .clone()
                .unwrap_or_else(|| template.disk_size.clone()),
            ram_size: request
                .ram_size
                .clone()
                .unwrap_or_else(|| template.ram_size.clone()),
            cpu_cores: request.cpu_cores.unwrap_or(template.cpu_cores),
            headless: request.headless.unwrap_or(true),
            extra_env: request.env.clone(),
        })
    }

    /// Container environment, `KEY=VALUE`.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![
            format!("DISK_SIZE={}", self.disk_size),
            format!("RAM_SIZE={}", self.ram_size),
            format!("CPU_CORES={}", self.cpu_cores),
            format!("HEADLESS={}", self.headless),
        ];
        env.extend(self.extra_env.iter().map(|(k, v)| format!("{}={}", k, v)));
        env
    }
}

/// Validate a caller-supplied sandbox name.
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(FleetError::InvalidRequest {
            reason: format!(
                "sandbox name '{}' must be 1-63 characters of [a-zA-Z0-9_.-] starting with a letter or digit",
                name
            ),
        })
    }
}

/// `sandbox-` followed by 12 random hex characters.
pub fn generate_name() -> String {
    format!("sandbox-{}", hex::encode(rand::random::<[u8; 6]>()))
}

/// Lifecycle state of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopping,
    Removed,
    Failed,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Removed => write!(f, "removed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Registry entry for one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub name: String,
    /// Assigned once a launch attempt has reserved them.
    pub ports: Option<PortSet>,
    pub config: ResolvedConfig,
    pub engine_handle: Option<EngineHandle>,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn provisioning(name: impl Into<String>, config: ResolvedConfig) -> Self {
        Self {
            name: name.into(),
            ports: None,
            config,
            engine_handle: None,
            state: SandboxState::Provisioning,
            created_at: Utc::now(),
        }
    }
}

/// Where a caller reaches a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub name: String,
    pub ports: PortSet,
}

/// Entry returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub name: String,
    pub state: SandboxState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortSet>,
    pub os_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<&SandboxRecord> for SandboxSummary {
    fn from(record: &SandboxRecord) -> Self {
        Self {
            name: record.name.clone(),
            state: record.state,
            ports: record.ports,
            os_type: record.config.os_type.clone(),
            created_at: record.created_at,
        }
    }
}

/// Quota usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub capacity_total: usize,
    pub used: usize,
    pub available: usize,
}

/// Result of `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    /// Nothing registered under that name.
    NotFound,
}

/// What `factory_reset` cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub containers_removed: usize,
    pub records_dropped: usize,
    pub ports_released: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_name_pattern() {
        let name = generate_name();
        let suffix = name.strip_prefix("sandbox-").unwrap();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(validate_name(&name).is_ok());
        assert_ne!(generate_name(), generate_name());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("agent-01").is_ok());
        assert!(validate_name("a.b_c").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_resolve_uses_template_defaults() {
        let config = FleetConfig::default();
        let resolved = ResolvedConfig::resolve(&config, &StartRequest::for_os("ubuntu")).unwrap();
        let template = config.template("ubuntu").unwrap();
        assert_eq!(resolved.disk_size, template.disk_size);
        assert_eq!(resolved.ram_size, template.ram_size);
        assert_eq!(resolved.cpu_cores, template.cpu_cores);
        assert!(resolved.headless);
    }

    #[test]
    fn test_resolve_applies_overrides() {
        let config = FleetConfig::default();
        let request = StartRequest {
            ram_size: Some("8G".to_string()),
            cpu_cores: Some(2),
            headless: Some(false),
            env: [("LANG".to_string(), "C".to_string())].into_iter().collect(),
            ..StartRequest::for_os("UBUNTU")
        };
        let resolved = ResolvedConfig::resolve(&config, &request).unwrap();
        assert_eq!(resolved.os_type, "ubuntu");
        assert_eq!(resolved.ram_size, "8G");
        assert_eq!(resolved.cpu_cores, 2);

        let env = resolved.env();
        assert!(env.contains(&"RAM_SIZE=8G".to_string()));
        assert!(env.contains(&"CPU_CORES=2".to_string()));
        assert!(env.contains(&"HEADLESS=false".to_string()));
        assert!(env.contains(&"LANG=C".to_string()));
    }

    #[test]
    fn test_resolve_unsupported_os() {
        let err = ResolvedConfig::resolve(&FleetConfig::default(), &StartRequest::for_os("windows"))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnsupportedOsType { ref os_type } if os_type == "windows"));
    }

    #[test]
    fn test_resolve_rejects_bad_env_and_cores() {
        let config = FleetConfig::default();
        let request = StartRequest {
            env: [("A=B".to_string(), "x".to_string())].into_iter().collect(),
            ..StartRequest::for_os("ubuntu")
        };
        assert!(ResolvedConfig::resolve(&config, &request).is_err());

        let request = StartRequest {
            cpu_cores: Some(0),
            ..StartRequest::for_os("ubuntu")
        };
        assert!(ResolvedConfig::resolve(&config, &request).is_err());
    }

    #[test]
    fn test_start_request_deserializes_camel_case() {
        let request: StartRequest =
            serde_json::from_str(r#"{"osType": "ubuntu", "ramSize": "2G", "name": "sb-1"}"#).unwrap();
        assert_eq!(request.os_type, "ubuntu");
        assert_eq!(request.ram_size.as_deref(), Some("2G"));
        assert_eq!(request.name.as_deref(), Some("sb-1"));
        assert!(request.env.is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Provisioning.to_string(), "provisioning");
        assert_eq!(SandboxState::Failed.to_string(), "failed");
    }
}
