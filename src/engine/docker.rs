//! Docker implementation of [`ContainerEngine`] via bollard.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::models::{DeviceMapping, HostConfig, PortBinding, PortMap};

use super::{ContainerEngine, EngineHandle, LaunchSpec, MANAGED_LABEL};
use crate::error::EngineError;

/// Seconds the engine waits for the VM to shut down on restart.
const RESTART_GRACE_SECS: isize = 30;

/// Connect to the local Docker daemon and verify it answers.
pub async fn connect_docker() -> Result<Docker, EngineError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| EngineError::Connection {
        reason: e.to_string(),
    })?;
    docker.ping().await.map_err(|e| EngineError::Connection {
        reason: format!("Docker daemon did not answer ping: {}", e),
    })?;
    Ok(docker)
}

/// Container engine backed by the Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub async fn connect() -> Result<Self, EngineError> {
        Ok(Self::new(connect_docker().await?))
    }
}

/// Build the bollard container config for a launch.
fn container_config(spec: &LaunchSpec) -> Config<String> {
    let mut port_bindings = PortMap::new();
    let mut exposed_ports = HashMap::new();
    for (host, container) in &spec.port_map {
        let key = format!("{}/tcp", container);
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host.to_string()),
            }]),
        );
        exposed_ports.insert(key, HashMap::new());
    }

    let binds: Vec<String> = spec
        .volumes
        .iter()
        .map(|(host, container)| format!("{}:{}", host, container))
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: if binds.is_empty() { None } else { Some(binds) },
        devices: Some(vec![DeviceMapping {
            path_on_host: Some("/dev/kvm".to_string()),
            path_in_container: Some("/dev/kvm".to_string()),
            cgroup_permissions: Some("rwm".to_string()),
        }]),
        cap_add: Some(vec!["NET_ADMIN".to_string()]),
        ..Default::default()
    };

    let labels: HashMap<String, String> = [(MANAGED_LABEL.to_string(), "true".to_string())]
        .into_iter()
        .collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        labels: Some(labels),
        ..Default::default()
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &LaunchSpec) -> Result<EngineHandle, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| match EngineError::from(e) {
                EngineError::NameConflict { .. } => EngineError::NameConflict {
                    name: spec.name.clone(),
                },
                other => other,
            })?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&response.id, None)
            .await
        {
            // A created-but-unstarted container would hold the name.
            if let Err(cleanup) = self
                .docker
                .remove_container(
                    &response.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(container = %spec.name, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        tracing::debug!(container = %spec.name, id = %response.id, "Container created and started");

        Ok(EngineHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn get(&self, name: &str) -> Result<Option<EngineHandle>, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(EngineHandle {
                id: info.id.unwrap_or_else(|| name.to_string()),
                name: name.to_string(),
            })),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, handle: &EngineHandle, grace: Duration) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(
                &handle.id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound {
                name: handle.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, handle: &EngineHandle, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::NotFound {
                        name: handle.name.clone(),
                    }
                } else {
                    e.into()
                }
            })
    }

    async fn restart(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.docker
            .restart_container(
                &handle.id,
                Some(RestartContainerOptions {
                    t: RESTART_GRACE_SECS,
                }),
            )
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::NotFound {
                        name: handle.name.clone(),
                    }
                } else {
                    e.into()
                }
            })
    }

    async fn list_published_ports(&self) -> Result<HashSet<u16>, EngineError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .iter()
            .filter_map(|c| c.ports.as_ref())
            .flatten()
            .filter_map(|p| p.public_port)
            .collect())
    }

    async fn remove_all(&self) -> Result<usize, EngineError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else {
                continue;
            };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed += 1,
                Err(e) if is_status(&e, 404) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = self.docker.prune_volumes::<String>(None).await {
            tracing::warn!(error = %e, "Volume prune failed");
        }
        if let Err(e) = self.docker.prune_networks::<String>(None).await {
            tracing::warn!(error = %e, "Network prune failed");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "sandbox-abc".to_string(),
            image: "qemux/qemu:latest".to_string(),
            env: vec!["DISK_SIZE=32G".to_string(), "RAM_SIZE=4G".to_string()],
            volumes: vec![("/vm/ubuntu.qcow2".to_string(), "/System.qcow2".to_string())],
            port_map: vec![(8010, 8006), (5001, 5000)],
        }
    }

    #[test]
    fn test_container_config_port_bindings() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();

        let display = bindings.get("8006/tcp").unwrap().as_ref().unwrap();
        assert_eq!(display[0].host_port.as_deref(), Some("8010"));
        let control = bindings.get("5000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(control[0].host_port.as_deref(), Some("5001"));

        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("8006/tcp"));
        assert!(exposed.contains_key("5000/tcp"));
    }

    #[test]
    fn test_container_config_mounts_and_devices() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();
        assert_eq!(
            host.binds.unwrap(),
            vec!["/vm/ubuntu.qcow2:/System.qcow2".to_string()]
        );
        let devices = host.devices.unwrap();
        assert_eq!(devices[0].path_on_host.as_deref(), Some("/dev/kvm"));
        assert_eq!(host.cap_add.unwrap(), vec!["NET_ADMIN".to_string()]);
    }

    #[test]
    fn test_container_config_env_and_labels() {
        let config = container_config(&spec());
        assert_eq!(config.image.as_deref(), Some("qemux/qemu:latest"));
        assert!(config.env.unwrap().contains(&"RAM_SIZE=4G".to_string()));
        assert_eq!(
            config.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_container_config_without_volumes() {
        let mut spec = spec();
        spec.volumes.clear();
        let host = container_config(&spec).host_config.unwrap();
        assert!(host.binds.is_none());
    }
}
