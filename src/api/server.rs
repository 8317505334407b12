//! Lifecycle of the HTTP listener and of the fleet behind it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{ConfigError, FleetError};
use crate::manager::SandboxManager;

/// Configuration for the API server.
pub struct ApiServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
}

/// Serves the fleet API and owns the orderly shutdown of the fleet.
pub struct ApiServer {
    config: ApiServerConfig,
    manager: Arc<SandboxManager>,
    running: Option<Running>,
}

/// A bound listener and its serving task.
struct Running {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: Arc<SandboxManager>) -> Self {
        Self {
            config,
            manager,
            running: None,
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Bind the listener and serve in the background. A second call while
    /// already serving does nothing.
    pub async fn start(&mut self) -> Result<(), FleetError> {
        if self.running.is_some() {
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ConfigError::InvalidValue {
                key: "bind".to_string(),
                message: format!("Failed to bind to {}: {}", self.config.addr, e),
            })?;
        let local_addr = listener.local_addr().map_err(ConfigError::from)?;

        let (stop, stopped) = oneshot::channel::<()>();
        let app = super::router(Arc::clone(&self.manager));
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await;
            match served {
                Ok(()) => tracing::info!(%local_addr, "Fleet API stopped"),
                Err(e) => tracing::error!(%local_addr, error = %e, "Fleet API failed"),
            }
        });

        tracing::info!(%local_addr, "Fleet API listening");
        self.running = Some(Running {
            local_addr,
            stop,
            task,
        });
        Ok(())
    }

    /// Stop taking requests, let in-flight ones finish, then stop every
    /// sandbox the manager still holds.
    pub async fn shutdown(&mut self) {
        if let Some(Running { stop, task, .. }) = self.running.take() {
            let _ = stop.send(());
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Fleet API task did not exit cleanly");
            }
        }
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::engine::ContainerEngine;
    use crate::manager::StartRequest;
    use crate::probe::ReadinessCheck;

    mod fakes {
        use std::collections::HashSet;
        use std::time::Duration;

        use async_trait::async_trait;

        use crate::engine::{ContainerEngine, EngineHandle, LaunchSpec};
        use crate::error::EngineError;
        use crate::ports::PortSet;
        use crate::probe::{ProbeError, ReadinessCheck};

        pub struct IdleEngine;

        #[async_trait]
        impl ContainerEngine for IdleEngine {
            async fn create(&self, spec: &LaunchSpec) -> Result<EngineHandle, EngineError> {
                Err(EngineError::Api {
                    reason: format!("unused: {}", spec.name),
                })
            }
            async fn get(&self, _name: &str) -> Result<Option<EngineHandle>, EngineError> {
                Ok(None)
            }
            async fn stop(&self, _h: &EngineHandle, _grace: Duration) -> Result<(), EngineError> {
                Ok(())
            }
            async fn remove(&self, _h: &EngineHandle, _force: bool) -> Result<(), EngineError> {
                Ok(())
            }
            async fn restart(&self, _h: &EngineHandle) -> Result<(), EngineError> {
                Ok(())
            }
            async fn list_published_ports(&self) -> Result<HashSet<u16>, EngineError> {
                Ok(HashSet::new())
            }
            async fn remove_all(&self) -> Result<usize, EngineError> {
                Ok(0)
            }
        }

        pub struct Ready;

        #[async_trait]
        impl ReadinessCheck for Ready {
            async fn check(&self, _name: &str, _ports: &PortSet) -> Result<(), ProbeError> {
                Ok(())
            }
        }
    }

    fn manager() -> Arc<SandboxManager> {
        let engine: Arc<dyn ContainerEngine> = Arc::new(fakes::IdleEngine);
        let check: Arc<dyn ReadinessCheck> = Arc::new(fakes::Ready);
        let config = FleetConfig {
            scan_host_ports: false,
            ..FleetConfig::default()
        };
        Arc::new(SandboxManager::new(config, engine, check))
    }

    fn auto_config() -> ApiServerConfig {
        ApiServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_lifecycle() {
        let manager = manager();
        let mut server = ApiServer::new(auto_config(), Arc::clone(&manager));
        server.start().await.expect("server should start on port 0");
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Restarting while serving keeps the same listener.
        server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        server.shutdown().await;
        assert!(server.running.is_none());
        assert!(server.local_addr().is_none());
        assert!(matches!(
            manager.start(StartRequest::for_os("ubuntu")).await,
            Err(FleetError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_start_on_occupied_port_returns_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let occupied = listener.local_addr().unwrap();

        let mut server = ApiServer::new(ApiServerConfig { addr: occupied }, manager());
        match server.start().await {
            Err(FleetError::Config(ConfigError::InvalidValue { key, message })) => {
                assert_eq!(key, "bind");
                assert!(message.contains("Failed to bind"));
            }
            other => panic!("Expected bind failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_start_still_drains_fleet() {
        let manager = manager();
        let mut server = ApiServer::new(auto_config(), Arc::clone(&manager));
        server.shutdown().await;
        assert!(server.running.is_none());
        assert!(manager.list().await.is_empty());
    }
}
