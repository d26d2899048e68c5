//! Core module manager
//!
//! Top-level façade coordinating loader, registry and lifecycle controller.
//! Every lifecycle transition and registry mutation funnels through one
//! transition lock; module count is small and transitions are
//! administrative, so strict serialization wins over throughput.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sonde_kernel::config::{ConfigView, CoreConfig};
use sonde_kernel::event::{EventKind, EventMonitor, EventPoolInfo, ListenerIdTable, ListenerTable};
use sonde_kernel::instrument::{Instrumentation, TypeSource};
use sonde_kernel::module::{ModuleError, ModuleInfo, ModuleResult};
use sonde_kernel::resource::{ModuleManagerApi, ModuleController, ModuleResources, ResourceKind};

use crate::context::{ModuleResourceTracker, ResourceLedger, RuntimeContext};
use crate::lifecycle::{LifecycleController, Transition};
use crate::loader::{DylibHost, LibraryHost, ModuleGovernor, ModuleLoader, file_checksum};
use crate::registry::{ModuleRecord, RuntimeState};
use crate::watch::{ModuleEventWatcher, WatchRegistry};

/// Builder for [`CoreModuleManager`].
pub struct CoreModuleManagerBuilder {
    config: CoreConfig,
    instrumentation: Arc<dyn Instrumentation>,
    type_source: Arc<dyn TypeSource>,
    host: Option<Arc<dyn LibraryHost>>,
    governors: Vec<Arc<dyn ModuleGovernor>>,
}

impl CoreModuleManagerBuilder {
    /// Substitute the library host (the default loads shared libraries).
    pub fn with_library_host(mut self, host: Arc<dyn LibraryHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Add an admission governor consulted for every discovered candidate.
    pub fn with_governor(mut self, governor: Arc<dyn ModuleGovernor>) -> Self {
        self.governors.push(governor);
        self
    }

    pub fn build(self) -> Arc<CoreModuleManager> {
        let config = Arc::new(self.config);
        let ctx = Arc::new(RuntimeContext {
            config: config.clone(),
            instrumentation: self.instrumentation,
            type_source: self.type_source,
            listener_table: Arc::new(ListenerTable::new()),
            listener_ids: ListenerIdTable::new(),
            watches: WatchRegistry::new(),
            resources: ResourceLedger::new(),
        });
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(DylibHost::new()) as Arc<dyn LibraryHost>);
        let launch_mode = config.launch_mode;

        Arc::new_cyclic(|weak| CoreModuleManager {
            config,
            controller: LifecycleController::new(ctx.clone()),
            loader: ModuleLoader::new(host, launch_mode),
            governors: self.governors,
            state: Mutex::new(RuntimeState::default()),
            self_ref: weak.clone(),
            ctx,
        })
    }
}

/// The module runtime orchestrator.
pub struct CoreModuleManager {
    config: Arc<CoreConfig>,
    ctx: Arc<RuntimeContext>,
    controller: LifecycleController,
    loader: ModuleLoader,
    governors: Vec<Arc<dyn ModuleGovernor>>,
    state: Mutex<RuntimeState>,
    self_ref: Weak<CoreModuleManager>,
}

impl CoreModuleManager {
    pub fn builder(
        config: CoreConfig,
        instrumentation: Arc<dyn Instrumentation>,
        type_source: Arc<dyn TypeSource>,
    ) -> CoreModuleManagerBuilder {
        CoreModuleManagerBuilder {
            config,
            instrumentation,
            type_source,
            host: None,
            governors: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The process-wide listener activation table, for the host's event
    /// dispatch plumbing.
    pub fn listener_table(&self) -> Arc<ListenerTable> {
        self.ctx.listener_table.clone()
    }

    /// Unload everything (best-effort), then re-scan every configured module
    /// directory from scratch. Also serves as the initial startup scan.
    pub async fn reset(&self) -> ModuleResult<()> {
        info!("resetting module runtime");
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.unload_all_locked(state).await;
        for dir in self.config.module_dirs() {
            self.scan_dir_locked(state, &dir).await;
        }
        Ok(())
    }

    /// Hot-reload user modules. Soft flush diffs archives by content
    /// checksum and only touches changed ones; force flush unloads every
    /// user module and rescans. System modules are never touched.
    pub async fn flush(&self, force: bool) -> ModuleResult<()> {
        if force {
            self.force_flush().await
        } else {
            self.soft_flush().await
        }
    }

    async fn force_flush(&self) -> ModuleResult<()> {
        info!("force-flushing user modules");
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let stale: Vec<String> = state
            .registry
            .iter()
            .filter(|r| !self.is_system_module(&r.library_path))
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            if let Err(e) = self.controller.unload(state, id, true).await {
                warn!(module = %id, error = %e, "failed to unload module during flush");
            }
        }

        for dir in &self.config.user_module_dirs {
            self.scan_dir_locked(state, dir).await;
        }
        Ok(())
    }

    async fn soft_flush(&self) -> ModuleResult<()> {
        info!("soft-flushing user modules");
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // Checksum every candidate archive up front. A failing file is
        // skipped, not fatal to the flush.
        let mut current: Vec<(PathBuf, u32)> = Vec::new();
        for dir in &self.config.user_module_dirs {
            for path in self.loader.enumerate(dir) {
                match file_checksum(&path) {
                    Ok(sum) => current.push((path, sum)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "checksum failed, skipping archive")
                    }
                }
            }
        }
        let current_sums: HashSet<u32> = current.iter().map(|(_, sum)| *sum).collect();

        // Removals first: loaded user modules whose backing archive
        // disappeared or changed.
        let stale: Vec<String> = state
            .registry
            .iter()
            .filter(|r| !self.is_system_module(&r.library_path))
            .filter(|r| {
                state
                    .arena
                    .checksum(r.library)
                    .is_none_or(|sum| !current_sums.contains(&sum))
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            if let Err(e) = self.controller.unload(state, id, true).await {
                warn!(module = %id, error = %e, "failed to unload module during flush");
            }
        }

        // Then additions: archives whose checksum matches no loaded
        // boundary. Unchanged archives keep their modules untouched.
        let loaded_sums = state.arena.checksums();
        for (path, sum) in current {
            if loaded_sums.contains(&sum) {
                debug!(path = %path.display(), "archive unchanged, skipping");
                continue;
            }
            self.load_archive_locked(state, &path).await;
        }
        Ok(())
    }

    /// Unload one module. A module that is not loaded is a no-op.
    pub async fn unload(&self, id: &str) -> ModuleResult<()> {
        let mut guard = self.state.lock().await;
        self.controller.unload(&mut guard, id, false).await.map(|_| ())
    }

    /// Unload every module, best-effort; one misbehaving module never
    /// blocks teardown of the others.
    pub async fn unload_all(&self) {
        let mut guard = self.state.lock().await;
        self.unload_all_locked(&mut guard).await;
    }

    /// Activate a module.
    pub async fn active(&self, id: &str) -> ModuleResult<()> {
        let mut guard = self.state.lock().await;
        self.controller.active(&mut guard, id).await.map(|_| ())
    }

    /// Freeze a module.
    pub async fn frozen(&self, id: &str) -> ModuleResult<()> {
        let mut guard = self.state.lock().await;
        self.controller.frozen(&mut guard, id, false).await.map(|_| ())
    }

    /// Snapshot of every loaded module.
    pub async fn list(&self) -> Vec<ModuleInfo> {
        let guard = self.state.lock().await;
        guard.registry.iter().map(|r| self.info_of(r)).collect()
    }

    /// Snapshot of one module, if loaded.
    pub async fn get(&self, id: &str) -> Option<ModuleInfo> {
        let guard = self.state.lock().await;
        guard.registry.get(id).map(|r| self.info_of(r))
    }

    /// Snapshot of one module, failing with `NotFound` for unknown ids.
    pub async fn get_or_fail(&self, id: &str) -> ModuleResult<ModuleInfo> {
        self.get(id).await.ok_or_else(|| ModuleError::not_found(id))
    }

    pub async fn is_loaded(&self, id: &str) -> ModuleResult<bool> {
        let guard = self.state.lock().await;
        guard
            .registry
            .get(id)
            .map(|r| r.loaded)
            .ok_or_else(|| ModuleError::not_found(id))
    }

    pub async fn is_activated(&self, id: &str) -> ModuleResult<bool> {
        let guard = self.state.lock().await;
        guard
            .registry
            .get(id)
            .map(|r| r.activated)
            .ok_or_else(|| ModuleError::not_found(id))
    }

    /// Backing archive of a loaded module.
    pub async fn library_path(&self, id: &str) -> ModuleResult<PathBuf> {
        let guard = self.state.lock().await;
        guard
            .registry
            .get(id)
            .map(|r| r.library_path.clone())
            .ok_or_else(|| ModuleError::not_found(id))
    }

    /// Distinct types touched by a module's watches.
    pub async fn affected_type_count(&self, id: &str) -> ModuleResult<usize> {
        let guard = self.state.lock().await;
        if !guard.registry.contains(id) {
            return Err(ModuleError::not_found(id));
        }
        Ok(self.ctx.watches.affect_counts(id).0)
    }

    /// Distinct function signatures touched by a module's watches.
    pub async fn affected_function_count(&self, id: &str) -> ModuleResult<usize> {
        let guard = self.state.lock().await;
        if !guard.registry.contains(id) {
            return Err(ModuleError::not_found(id));
        }
        Ok(self.ctx.watches.affect_counts(id).1)
    }

    /// Snapshot of the event machinery.
    pub fn event_pool_info(&self) -> EventPoolInfo {
        pool_info(&self.ctx)
    }

    async fn unload_all_locked(&self, state: &mut RuntimeState) {
        let ids = state.registry.ids();
        for id in ids {
            if let Err(e) = self.controller.unload(state, &id, true).await {
                warn!(module = %id, error = %e, "failed to unload module");
            }
        }
    }

    async fn scan_dir_locked(&self, state: &mut RuntimeState, dir: &Path) {
        for path in self.loader.enumerate(dir) {
            self.load_archive_locked(state, &path).await;
        }
    }

    /// Load every admissible module from one archive. A failure anywhere in
    /// this archive never aborts the surrounding scan.
    async fn load_archive_locked(&self, state: &mut RuntimeState, path: &Path) {
        let candidates = match self.loader.open_archive(path) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open module archive");
                return;
            }
        };
        if candidates.modules.is_empty() {
            debug!(path = %path.display(), "archive declared no admissible modules");
            return;
        }

        let handle = state.arena.open(
            candidates.library.clone(),
            path.to_path_buf(),
            candidates.checksum,
        );
        let mut admitted = 0usize;

        'candidates: for module in candidates.modules {
            let module_id = module.module_id().to_string();
            for governor in &self.governors {
                if let Err(e) = governor.admit(module.metadata()) {
                    warn!(module = %module_id, error = %e, "module rejected by governor");
                    continue 'candidates;
                }
            }

            let declared = module.declare_resources();
            let resources = self.build_resources(&module_id, &declared);
            match self
                .controller
                .load(state, module, path, handle, resources)
                .await
            {
                Ok(Transition::Completed) => admitted += 1,
                Ok(Transition::Unchanged) => {}
                Err(e) => warn!(module = %module_id, error = %e, "failed to load module candidate"),
            }
        }

        // A boundary holding no live module must not leak.
        if admitted == 0 {
            debug!(path = %path.display(), "no module admitted from archive, closing library");
            state.arena.close(handle);
        }
    }

    fn build_resources(&self, module_id: &str, kinds: &[ResourceKind]) -> ModuleResources {
        let mut resources = ModuleResources::new();
        for kind in kinds {
            match kind {
                ResourceKind::TypeSource => {
                    resources = resources.with_type_source(self.ctx.type_source.clone());
                }
                ResourceKind::EventWatcher => {
                    resources = resources.with_event_watcher(Arc::new(ModuleEventWatcher {
                        module_id: module_id.to_string(),
                        ctx: self.ctx.clone(),
                    }));
                }
                ResourceKind::ModuleController => {
                    resources = resources.with_controller(Arc::new(ModuleControllerHandle {
                        module_id: module_id.to_string(),
                        manager: self.self_ref.clone(),
                    }));
                }
                ResourceKind::ModuleManager => {
                    resources = resources.with_manager(Arc::new(ManagerHandle {
                        manager: self.self_ref.clone(),
                    }));
                }
                ResourceKind::ConfigView => {
                    resources = resources.with_config(ConfigView::of(self.config.clone()));
                }
                ResourceKind::EventMonitor => {
                    resources = resources.with_event_monitor(Arc::new(PoolMonitor {
                        ctx: self.ctx.clone(),
                    }));
                }
                ResourceKind::ResourceTracker => {
                    resources = resources.with_tracker(Arc::new(ModuleResourceTracker {
                        module_id: module_id.to_string(),
                        ctx: self.ctx.clone(),
                    }));
                }
                other => {
                    warn!(module = %module_id, kind = ?other, "unrecognized resource kind, skipping")
                }
            }
        }
        resources
    }

    fn info_of(&self, record: &ModuleRecord) -> ModuleInfo {
        let metadata = record.module.metadata();
        let (affected_types, affected_functions) = self.ctx.watches.affect_counts(&record.id);
        ModuleInfo {
            id: record.id.clone(),
            version: metadata.version.clone(),
            author: metadata.author.clone(),
            library_path: Some(record.library_path.clone()),
            loaded: record.loaded,
            activated: record.activated,
            watch_count: self.ctx.watches.watch_count(&record.id),
            affected_types,
            affected_functions,
        }
    }

    /// Whether the archive lives under the system module directory. A
    /// failing filesystem check classifies the path optimistically as
    /// contained, so a broken path is never treated as a user module.
    fn is_system_module(&self, path: &Path) -> bool {
        let system = &self.config.system_module_dir;
        match system.try_exists() {
            Ok(false) => return false,
            Ok(true) => {}
            Err(_) => return true,
        }
        let system = match system.canonicalize() {
            Ok(p) => p,
            Err(_) => return true,
        };
        match path.canonicalize() {
            Ok(p) => p.starts_with(&system),
            Err(_) => true,
        }
    }
}

fn pool_info(ctx: &RuntimeContext) -> EventPoolInfo {
    EventPoolInfo {
        active_listeners: ctx.listener_table.active_count(),
        total_watches: ctx.watches.total_watches(),
        enter_subscriptions: ctx.listener_table.subscription_count(EventKind::Enter),
        exit_subscriptions: ctx.listener_table.subscription_count(EventKind::Exit),
        fault_subscriptions: ctx.listener_table.subscription_count(EventKind::Fault),
    }
}

/// Injectable orchestrator handle addressing modules by id.
struct ManagerHandle {
    manager: Weak<CoreModuleManager>,
}

impl ManagerHandle {
    fn upgrade(&self) -> ModuleResult<Arc<CoreModuleManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| ModuleError::Other("module runtime has shut down".to_string()))
    }
}

#[async_trait::async_trait]
impl ModuleManagerApi for ManagerHandle {
    async fn flush(&self, force: bool) -> ModuleResult<()> {
        self.upgrade()?.flush(force).await
    }

    async fn reset(&self) -> ModuleResult<()> {
        self.upgrade()?.reset().await
    }

    async fn unload(&self, module_id: &str) -> ModuleResult<()> {
        self.upgrade()?.unload(module_id).await
    }

    async fn active(&self, module_id: &str) -> ModuleResult<()> {
        self.upgrade()?.active(module_id).await
    }

    async fn frozen(&self, module_id: &str) -> ModuleResult<()> {
        self.upgrade()?.frozen(module_id).await
    }

    async fn list(&self) -> Vec<ModuleInfo> {
        match self.manager.upgrade() {
            Some(manager) => manager.list().await,
            None => Vec::new(),
        }
    }

    async fn get(&self, module_id: &str) -> Option<ModuleInfo> {
        match self.manager.upgrade() {
            Some(manager) => manager.get(module_id).await,
            None => None,
        }
    }
}

/// Injectable per-module lifecycle handle.
struct ModuleControllerHandle {
    module_id: String,
    manager: Weak<CoreModuleManager>,
}

#[async_trait::async_trait]
impl ModuleController for ModuleControllerHandle {
    async fn active(&self) -> ModuleResult<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.active(&self.module_id).await,
            None => Err(ModuleError::Other("module runtime has shut down".to_string())),
        }
    }

    async fn frozen(&self) -> ModuleResult<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.frozen(&self.module_id).await,
            None => Err(ModuleError::Other("module runtime has shut down".to_string())),
        }
    }
}

/// Injectable event-pool monitor.
struct PoolMonitor {
    ctx: Arc<RuntimeContext>,
}

impl EventMonitor for PoolMonitor {
    fn event_pool_info(&self) -> EventPoolInfo {
        pool_info(&self.ctx)
    }
}
