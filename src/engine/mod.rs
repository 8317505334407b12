//! Container engine seam.
//!
//! The fleet manager never talks to Docker directly; it drives a
//! [`ContainerEngine`], which keeps lifecycle logic testable against an
//! in-memory engine and leaves room for other backends.

pub mod docker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, FleetError};
use crate::ports::{PortSet, PortSource};

pub use docker::{DockerEngine, connect_docker};

/// Label applied to every container this service creates.
pub const MANAGED_LABEL: &str = "sandbox-fleet.managed";

/// Everything the engine needs to create one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// `(host path, container path)` bind mounts.
    pub volumes: Vec<(String, String)>,
    /// `(host port, container port)` TCP mappings.
    pub port_map: Vec<(u16, u16)>,
}

impl LaunchSpec {
    /// Map each reserved host port to its service's in-container port.
    pub fn port_map_for(ports: &PortSet) -> Vec<(u16, u16)> {
        ports
            .iter()
            .map(|(service, host)| (host, service.container_port()))
            .collect()
    }

    /// Host ports this spec publishes.
    pub fn host_ports(&self) -> Vec<u16> {
        self.port_map.iter().map(|(host, _)| *host).collect()
    }
}

/// Opaque reference to a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle {
    pub id: String,
    pub name: String,
}

/// Operations the fleet needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create and start a container.
    async fn create(&self, spec: &LaunchSpec) -> Result<EngineHandle, EngineError>;

    /// Look up a container by name.
    async fn get(&self, name: &str) -> Result<Option<EngineHandle>, EngineError>;

    async fn stop(&self, handle: &EngineHandle, grace: Duration) -> Result<(), EngineError>;

    async fn remove(&self, handle: &EngineHandle, force: bool) -> Result<(), EngineError>;

    /// Power-cycle in place, keeping name and port bindings.
    async fn restart(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Host ports published by any running container, managed or not.
    async fn list_published_ports(&self) -> Result<HashSet<u16>, EngineError>;

    /// Force-remove every container and prune leftover resources.
    /// Returns the number of containers removed.
    async fn remove_all(&self) -> Result<usize, EngineError>;
}

/// Exposes engine-published ports to the port allocator.
pub struct EnginePorts {
    engine: Arc<dyn ContainerEngine>,
}

impl EnginePorts {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PortSource for EnginePorts {
    fn name(&self) -> &str {
        "engine_published"
    }

    async fn occupied(&self) -> crate::error::Result<HashSet<u16>> {
        self.engine
            .list_published_ports()
            .await
            .map_err(FleetError::from)
    }
}
