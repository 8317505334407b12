//! Sandbox lifecycle manager.
//!
//! Owns the registry of sandboxes and the port ledger, and drives every
//! sandbox through `Provisioning -> Running -> Stopping -> Removed` (or
//! `Failed`) using the port allocator, the container engine and the
//! readiness prober.
//!
//! ```text
//! start ─► resolve config ─► register (Provisioning) ─► launch permit
//!            │                                              │
//!            │              ┌──────── launch policy ────────┤
//!            │              │  reserve 4 ports (ledger lock)│
//!            │              │  engine create (timeout)      │
//!            │              └───────────────────────────────┤
//!            │                                              ▼
//!            │                               grace + readiness probe
//!            │                                              │
//!            ▼                                              ▼
//!   any failure ─► teardown engine handle, release ports, drop record
//! ```
//!
//! Heavy engine work (create/stop/restart) runs under a bounded pool of
//! launch permits. The registry and ledger locks are only held for short
//! in-memory updates, never across engine or network calls.

mod locks;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore, SemaphorePermit, oneshot};

use crate::config::FleetConfig;
use crate::engine::{ContainerEngine, EngineHandle, EnginePorts, LaunchSpec};
use crate::error::{ConfigError, EngineError, FleetError, Result};
use crate::ports::{HostSocketScan, PortAllocator, PortSet, PortSource};
use crate::probe::{HttpHealthCheck, ReadinessCheck, ReadinessProber};
use crate::retry::execute_with_policy;

use locks::NameLocks;
pub use types::{
    ConnectionInfo, ResetReport, ResolvedConfig, SandboxRecord, SandboxState, SandboxSummary,
    StartRequest, StopStatus, Usage, generate_name, validate_name,
};

/// Mount point of the template disk image inside the container.
const SYSTEM_IMAGE_MOUNT: &str = "/System.qcow2";

/// Extra time allowed on top of the engine's stop grace before giving up.
const STOP_CALL_MARGIN: Duration = Duration::from_secs(10);

/// Central orchestrator for sandbox containers.
pub struct SandboxManager {
    config: FleetConfig,
    engine: Arc<dyn ContainerEngine>,
    prober: ReadinessProber,
    allocator: PortAllocator,
    registry: RwLock<HashMap<String, SandboxRecord>>,
    launch_permits: Semaphore,
    name_locks: Arc<NameLocks>,
    shutting_down: AtomicBool,
}

impl SandboxManager {
    /// Build a manager around an engine and a readiness check.
    pub fn new(
        config: FleetConfig,
        engine: Arc<dyn ContainerEngine>,
        check: Arc<dyn ReadinessCheck>,
    ) -> Self {
        let mut sources: Vec<Arc<dyn PortSource>> = Vec::new();
        if config.scan_host_ports {
            sources.push(Arc::new(HostSocketScan));
        }
        sources.push(Arc::new(EnginePorts::new(Arc::clone(&engine))));

        let prober = ReadinessProber::new(
            check,
            config.timings.grace_period(),
            config.retry.readiness,
        );

        Self {
            launch_permits: Semaphore::new(config.max_concurrent_launches),
            allocator: PortAllocator::new(sources),
            registry: RwLock::new(HashMap::new()),
            name_locks: Arc::new(NameLocks::default()),
            shutting_down: AtomicBool::new(false),
            prober,
            engine,
            config,
        }
    }

    /// Build a manager that probes readiness over HTTP.
    pub fn with_http_probe(config: FleetConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        let check = HttpHealthCheck::new(
            config.sandbox_host.clone(),
            config.readiness_path.clone(),
            config.timings.probe_timeout(),
        )
        .map_err(|e| ConfigError::InvalidValue {
            key: "readiness_path".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(config, engine, Arc::new(check)))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    // ── start ──────────────────────────────────────────────────────────

    /// Provision a sandbox and wait until its control endpoint answers.
    ///
    /// Provisioning runs on its own task. If the caller stops waiting (a
    /// dropped request, an outer timeout) the task notices, runs the normal
    /// failure cleanup and exits, so nothing stays reserved.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<ConnectionInfo> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FleetError::ShuttingDown);
        }

        let resolved = ResolvedConfig::resolve(&self.config, &request)?;
        let name = match request.name {
            Some(name) => {
                validate_name(&name)?;
                name
            }
            None => generate_name(),
        };

        let (_caller_waiting, caller_gone) = oneshot::channel::<()>();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager
                .start_registered(name, resolved, caller_gone)
                .await
        });

        task.await.map_err(|e| FleetError::TaskFailed {
            reason: e.to_string(),
        })?
    }

    async fn start_registered(
        &self,
        name: String,
        resolved: ResolvedConfig,
        caller_gone: oneshot::Receiver<()>,
    ) -> Result<ConnectionInfo> {
        let _name_guard = self.name_locks.acquire(&name).await;
        self.register(&name, resolved).await?;

        tracing::info!(sandbox = %name, "Provisioning sandbox");

        let outcome = tokio::select! {
            outcome = self.provision(&name) => outcome,
            _ = caller_gone => Err(FleetError::Cancelled { name: name.clone() }),
        };

        match outcome {
            Ok(info) => {
                tracing::info!(sandbox = %name, ports = ?info.ports, "Sandbox running");
                Ok(info)
            }
            Err(e) => Err(self.abort_provisioning(&name, e).await),
        }
    }

    async fn register(&self, name: &str, config: ResolvedConfig) -> Result<()> {
        let mut registry = self.registry.write().await;
        if registry.contains_key(name) {
            return Err(FleetError::NameCollision {
                name: name.to_string(),
            });
        }
        if registry.len() >= self.config.capacity {
            return Err(FleetError::CapacityExhausted {
                capacity: self.config.capacity,
            });
        }
        registry.insert(name.to_string(), SandboxRecord::provisioning(name, config));
        Ok(())
    }

    /// Launch and probe. Leaves cleanup to the caller on error.
    async fn provision(&self, name: &str) -> Result<ConnectionInfo> {
        let config = self
            .registry
            .read()
            .await
            .get(name)
            .map(|record| record.config.clone())
            .ok_or_else(|| FleetError::NotFound {
                name: name.to_string(),
            })?;

        let ports = {
            let _permit = self.launch_permit().await?;
            let config = &config;
            execute_with_policy(
                &self.config.retry.launch,
                "launch",
                FleetError::is_transient,
                move || self.launch_attempt(name, config),
            )
            .await?
        };

        self.prober.wait_until_ready(name, &ports).await?;

        self.set_state(name, SandboxState::Running).await;
        Ok(ConnectionInfo {
            name: name.to_string(),
            ports,
        })
    }

    /// One launch attempt: fresh ports, then engine create under the hard
    /// timeout. A failed attempt returns its ports before reporting.
    async fn launch_attempt(&self, name: &str, config: &ResolvedConfig) -> Result<PortSet> {
        let ports = self.allocator.reserve_set(&self.config.ports).await?;
        self.update_record(name, |record| record.ports = Some(ports))
            .await;
        tracing::debug!(sandbox = %name, ports = ?ports, "Reserved ports");

        let spec = self.launch_spec(name, config, &ports);
        let timeout = self.config.timings.launch_timeout();
        let created = tokio::time::timeout(timeout, self.create_container(&spec))
            .await
            .unwrap_or_else(|_| {
                Err(FleetError::LaunchTimeout {
                    name: name.to_string(),
                    timeout,
                })
            });

        match created {
            Ok(handle) => {
                self.update_record(name, |record| record.engine_handle = Some(handle))
                    .await;
                Ok(ports)
            }
            Err(e) => {
                tracing::debug!(sandbox = %name, error = %e, "Launch attempt failed");
                if matches!(e, FleetError::LaunchTimeout { .. }) {
                    self.reclaim_untracked(name).await;
                }
                self.allocator.release_set(&ports).await;
                self.update_record(name, |record| record.ports = None).await;
                Err(e)
            }
        }
    }

    fn launch_spec(&self, name: &str, config: &ResolvedConfig, ports: &PortSet) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            image: self.config.engine_image.clone(),
            env: config.env(),
            volumes: vec![(config.image_path.clone(), SYSTEM_IMAGE_MOUNT.to_string())],
            port_map: LaunchSpec::port_map_for(ports),
        }
    }

    /// Create the container, clearing out a same-named leftover first if the
    /// engine reports a conflict.
    async fn create_container(&self, spec: &LaunchSpec) -> Result<EngineHandle> {
        let engine = &self.engine;
        let create = move || engine.create(spec);

        match execute_with_policy(
            &self.config.retry.engine,
            "engine_create",
            EngineError::is_transient,
            create,
        )
        .await
        {
            Ok(handle) => Ok(handle),
            Err(EngineError::NameConflict { .. }) => {
                tracing::warn!(sandbox = %spec.name, "Container name in use, removing stale container");
                self.remove_stale_container(&spec.name).await?;
                execute_with_policy(
                    &self.config.retry.engine,
                    "engine_create",
                    EngineError::is_transient,
                    create,
                )
                .await
                .map_err(FleetError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_stale_container(&self, name: &str) -> Result<()> {
        let engine = &self.engine;
        let existing = execute_with_policy(
            &self.config.retry.engine,
            "engine_get",
            EngineError::is_transient,
            move || engine.get(name),
        )
        .await?;

        if let Some(handle) = existing {
            let handle = &handle;
            let removed = execute_with_policy(
                &self.config.retry.teardown,
                "engine_remove",
                EngineError::is_transient,
                move || engine.remove(handle, true),
            )
            .await;
            match removed {
                Ok(()) | Err(EngineError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.wait_until_removed(name).await
    }

    /// Poll until the engine no longer knows `name`, bounded by the removal wait.
    async fn wait_until_removed(&self, name: &str) -> Result<()> {
        let wait = self.config.timings.removal_wait();
        let poll = self.config.timings.removal_poll();

        let gone = tokio::time::timeout(wait, async {
            loop {
                match self.engine.get(name).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(_)) => {}
                    Err(e) if e.is_transient() => {
                        tracing::debug!(sandbox = %name, error = %e, "Lookup failed while waiting for removal");
                    }
                    Err(e) => return Err(FleetError::from(e)),
                }
                tokio::time::sleep(poll).await;
                tokio::task::yield_now().await;
            }
        })
        .await;

        gone.unwrap_or_else(|_| Err(FleetError::Engine(EngineError::Timeout(wait))))
    }

    /// Single cleanup stage for any provisioning failure.
    ///
    /// Tears down the engine container if one was created, returns the
    /// record's ports and removes the record. A cleanup failure is logged and
    /// never replaces `error`.
    async fn abort_provisioning(&self, name: &str, error: FleetError) -> FleetError {
        tracing::warn!(
            sandbox = %name,
            kind = %error.kind(),
            error = %error,
            "Provisioning failed, cleaning up"
        );

        let record = {
            let mut registry = self.registry.write().await;
            registry.get_mut(name).map(|record| {
                record.state = SandboxState::Failed;
                record.clone()
            })
        };

        if let Some(record) = record {
            match &record.engine_handle {
                Some(handle) => {
                    if let Err(cleanup) = self.teardown(handle).await {
                        tracing::error!(
                            sandbox = %name,
                            error = %cleanup,
                            "Failed to tear down container after provisioning failure"
                        );
                    }
                }
                None => self.reclaim_untracked(name).await,
            }
            if let Some(ports) = &record.ports {
                self.allocator.release_set(ports).await;
            }
            self.registry.write().await.remove(name);
        }

        error
    }

    /// Tear down a container the engine may have created without the
    /// handle ever reaching the record (create cut off by a timeout or a
    /// cancelled caller). Best-effort; failures are logged.
    async fn reclaim_untracked(&self, name: &str) {
        let found = match self.engine.get(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(sandbox = %name, error = %e, "Failed to look up untracked container");
                return;
            }
        };
        let Some(handle) = found else {
            return;
        };

        tracing::warn!(sandbox = %name, id = %handle.id, "Removing container created by an abandoned launch");
        if let Err(e) = self.teardown(&handle).await {
            tracing::error!(sandbox = %name, error = %e, "Failed to remove untracked container");
        }
    }

    // ── stop ───────────────────────────────────────────────────────────

    /// Stop and remove a sandbox. Unknown names succeed with `NotFound`.
    ///
    /// If the engine refuses to stop the container the record stays in the
    /// registry (in its previous state) so the caller can retry.
    pub async fn stop(&self, name: &str) -> Result<StopStatus> {
        let _name_guard = self.name_locks.acquire(name).await;

        if !self.registry.read().await.contains_key(name) {
            tracing::debug!(sandbox = %name, "Stop requested for unknown sandbox");
            return Ok(StopStatus::NotFound);
        }

        let _permit = self.launch_permit().await?;

        let (handle, previous) = {
            let mut registry = self.registry.write().await;
            let Some(record) = registry.get_mut(name) else {
                return Ok(StopStatus::NotFound);
            };
            let previous = record.state;
            record.state = SandboxState::Stopping;
            (record.engine_handle.clone(), previous)
        };

        tracing::info!(sandbox = %name, "Stopping sandbox");

        if let Some(handle) = &handle
            && let Err(e) = self.teardown(handle).await
        {
            tracing::warn!(sandbox = %name, error = %e, "Stop failed, keeping record for retry");
            self.set_state(name, previous).await;
            return Err(e);
        }

        tokio::time::sleep(self.config.timings.settle()).await;

        let ports = self
            .registry
            .read()
            .await
            .get(name)
            .and_then(|record| record.ports);
        if let Some(ports) = &ports {
            self.allocator.release_set(ports).await;
        }
        if let Some(mut record) = self.registry.write().await.remove(name) {
            record.state = SandboxState::Removed;
            tracing::info!(sandbox = %name, state = %record.state, "Sandbox removed");
        }

        Ok(StopStatus::Stopped)
    }

    /// Stop then force-remove a container. A container that is already gone
    /// counts as removed.
    async fn teardown(&self, handle: &EngineHandle) -> Result<()> {
        let policy = &self.config.retry.teardown;

        let stopped = execute_with_policy(
            policy,
            "engine_stop",
            EngineError::is_transient,
            move || self.stop_with_timeout(handle),
        )
        .await;
        match stopped {
            Ok(()) | Err(EngineError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let engine = &self.engine;
        let removed = execute_with_policy(
            policy,
            "engine_remove",
            EngineError::is_transient,
            move || engine.remove(handle, true),
        )
        .await;
        match removed {
            Ok(()) | Err(EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_with_timeout(&self, handle: &EngineHandle) -> std::result::Result<(), EngineError> {
        let grace = self.config.timings.stop_timeout();
        tokio::time::timeout(grace + STOP_CALL_MARGIN, self.engine.stop(handle, grace))
            .await
            .unwrap_or(Err(EngineError::Timeout(grace)))
    }

    // ── revert ─────────────────────────────────────────────────────────

    /// Power-cycle a running sandbox in place and wait for it to come back.
    ///
    /// Name, ports and record are unchanged; the registry is not touched.
    pub async fn revert_to_snapshot(&self, name: &str, snapshot_id: &str) -> Result<()> {
        let _name_guard = self.name_locks.acquire(name).await;

        let (handle, ports) = {
            let registry = self.registry.read().await;
            let record = registry.get(name).ok_or_else(|| FleetError::NotFound {
                name: name.to_string(),
            })?;
            match (record.state, &record.engine_handle, record.ports) {
                (SandboxState::Running, Some(handle), Some(ports)) => (handle.clone(), ports),
                _ => {
                    return Err(FleetError::NotReady {
                        name: name.to_string(),
                    });
                }
            }
        };

        tracing::info!(sandbox = %name, snapshot = %snapshot_id, "Reverting sandbox");

        {
            let _permit = self.launch_permit().await?;
            let engine = &self.engine;
            let handle = &handle;
            execute_with_policy(
                &self.config.retry.engine,
                "engine_restart",
                EngineError::is_transient,
                move || engine.restart(handle),
            )
            .await?;
        }

        self.prober.wait_until_ready(name, &ports).await?;
        tracing::info!(sandbox = %name, snapshot = %snapshot_id, "Sandbox reverted");
        Ok(())
    }

    // ── queries ────────────────────────────────────────────────────────

    pub async fn connection_info(&self, name: &str) -> Result<ConnectionInfo> {
        let registry = self.registry.read().await;
        let record = registry.get(name).ok_or_else(|| FleetError::NotFound {
            name: name.to_string(),
        })?;
        let ports = record.ports.ok_or_else(|| FleetError::NotReady {
            name: name.to_string(),
        })?;
        Ok(ConnectionInfo {
            name: record.name.clone(),
            ports,
        })
    }

    /// All registered sandboxes, by name.
    pub async fn list(&self) -> Vec<SandboxSummary> {
        let mut sandboxes: Vec<SandboxSummary> = self
            .registry
            .read()
            .await
            .values()
            .map(SandboxSummary::from)
            .collect();
        sandboxes.sort_by(|a, b| a.name.cmp(&b.name));
        sandboxes
    }

    pub async fn get(&self, name: &str) -> Option<SandboxSummary> {
        self.registry
            .read()
            .await
            .get(name)
            .map(SandboxSummary::from)
    }

    /// Ports currently in the ledger, ascending.
    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.allocator.reserved().await
    }

    pub async fn usage(&self) -> Usage {
        let used = self.registry.read().await.len();
        Usage {
            capacity_total: self.config.capacity,
            used,
            available: self.config.capacity.saturating_sub(used),
        }
    }

    // ── maintenance ────────────────────────────────────────────────────

    /// Remove every container on the host and forget all local state.
    ///
    /// Destructive; meant for test and recovery environments.
    pub async fn factory_reset(&self) -> Result<ResetReport> {
        tracing::warn!("Factory reset: removing every container on the host");

        let engine = &self.engine;
        let containers_removed = execute_with_policy(
            &self.config.retry.engine,
            "engine_remove_all",
            EngineError::is_transient,
            move || engine.remove_all(),
        )
        .await?;

        let records_dropped = {
            let mut registry = self.registry.write().await;
            let count = registry.len();
            registry.clear();
            count
        };
        let ports_released = self.allocator.clear().await;

        tracing::warn!(
            containers_removed,
            records_dropped,
            ports_released,
            "Factory reset complete"
        );

        Ok(ResetReport {
            containers_removed,
            records_dropped,
            ports_released,
        })
    }

    /// Refuse new launches and stop every registered sandbox.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        tracing::info!(count = names.len(), "Stopping all sandboxes");

        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::error!(sandbox = %name, error = %e, "Failed to stop sandbox during shutdown");
            }
        }
    }

    // ── helpers ────────────────────────────────────────────────────────

    async fn launch_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.launch_permits
            .acquire()
            .await
            .map_err(|_| FleetError::ShuttingDown)
    }

    async fn update_record<F>(&self, name: &str, update: F)
    where
        F: FnOnce(&mut SandboxRecord),
    {
        if let Some(record) = self.registry.write().await.get_mut(name) {
            update(record);
        }
    }

    async fn set_state(&self, name: &str, state: SandboxState) {
        self.update_record(name, |record| {
            tracing::debug!(sandbox = %record.name, from = %record.state, to = %state, "State transition");
            record.state = state;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Timings;
    use crate::probe::ProbeError;

    /// Engine that accepts everything and remembers the specs it saw.
    #[derive(Default)]
    struct RecordingEngine {
        specs: Mutex<Vec<LaunchSpec>>,
    }

    #[async_trait]
    impl ContainerEngine for RecordingEngine {
        async fn create(&self, spec: &LaunchSpec) -> std::result::Result<EngineHandle, EngineError> {
            self.specs.lock().unwrap().push(spec.clone());
            Ok(EngineHandle {
                id: format!("id-{}", spec.name),
                name: spec.name.clone(),
            })
        }

        async fn get(&self, _name: &str) -> std::result::Result<Option<EngineHandle>, EngineError> {
            Ok(None)
        }

        async fn stop(&self, _handle: &EngineHandle, _grace: Duration) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn remove(&self, _handle: &EngineHandle, _force: bool) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn restart(&self, _handle: &EngineHandle) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn list_published_ports(&self) -> std::result::Result<HashSet<u16>, EngineError> {
            Ok(HashSet::new())
        }

        async fn remove_all(&self) -> std::result::Result<usize, EngineError> {
            Ok(0)
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessCheck for AlwaysReady {
        async fn check(&self, _name: &str, _ports: &PortSet) -> std::result::Result<(), ProbeError> {
            Ok(())
        }
    }

    fn test_config() -> FleetConfig {
        FleetConfig {
            scan_host_ports: false,
            max_concurrent_launches: 4,
            capacity: 2,
            timings: Timings::immediate(),
            retry: FleetConfig::default().retry.without_delay(),
            ..FleetConfig::default()
        }
    }

    fn manager() -> (Arc<SandboxManager>, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let manager = SandboxManager::new(test_config(), engine.clone(), Arc::new(AlwaysReady));
        (Arc::new(manager), engine)
    }

    #[tokio::test]
    async fn test_launch_spec_carries_template_and_ports() {
        let (manager, engine) = manager();
        let info = manager
            .start(StartRequest::for_os("ubuntu").named("sb-1"))
            .await
            .unwrap();

        let specs = engine.specs.lock().unwrap();
        let spec = &specs[0];
        assert_eq!(spec.name, "sb-1");
        assert_eq!(spec.image, manager.config().engine_image);
        assert_eq!(
            spec.volumes,
            vec![("./vm_data/Ubuntu.qcow2".to_string(), SYSTEM_IMAGE_MOUNT.to_string())]
        );
        assert!(spec.env.contains(&"DISK_SIZE=32G".to_string()));
        assert_eq!(spec.host_ports(), info.ports.ports().to_vec());
    }

    #[tokio::test]
    async fn test_record_is_running_after_start() {
        let (manager, _engine) = manager();
        manager
            .start(StartRequest::for_os("ubuntu").named("sb-1"))
            .await
            .unwrap();
        let summary = manager.get("sb-1").await.unwrap();
        assert_eq!(summary.state, SandboxState::Running);
        assert_eq!(summary.os_type, "ubuntu");
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (manager, _engine) = manager();
        manager.start(StartRequest::for_os("ubuntu")).await.unwrap();
        manager.start(StartRequest::for_os("ubuntu")).await.unwrap();
        let err = manager
            .start(StartRequest::for_os("ubuntu"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::CapacityExhausted { capacity: 2 }));
        assert_eq!(
            manager.usage().await,
            Usage {
                capacity_total: 2,
                used: 2,
                available: 0
            }
        );
        assert_eq!(manager.reserved_ports().await.len(), 8);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_registration() {
        let (manager, engine) = manager();
        let err = manager
            .start(StartRequest::for_os("ubuntu").named("bad name"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest { .. }));
        assert!(manager.list().await.is_empty());
        assert!(engine.specs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_refuses_new_work() {
        let (manager, _engine) = manager();
        manager.start(StartRequest::for_os("ubuntu")).await.unwrap();
        manager.shutdown().await;
        assert!(manager.list().await.is_empty());
        assert!(manager.reserved_ports().await.is_empty());
        assert!(matches!(
            manager.start(StartRequest::for_os("ubuntu")).await,
            Err(FleetError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_revert_requires_running_state() {
        let (manager, _engine) = manager();
        manager
            .start(StartRequest::for_os("ubuntu").named("sb-1"))
            .await
            .unwrap();
        manager.set_state("sb-1", SandboxState::Provisioning).await;
        let err = manager.revert_to_snapshot("sb-1", "init").await.unwrap_err();
        assert!(matches!(err, FleetError::NotReady { .. }));
    }
}
