//! Resource declaration and injection
//!
//! A module declares the runtime capabilities it needs via
//! [`ResourceKind`]; the lifecycle controller builds a [`ModuleResources`]
//! bundle containing exactly those capabilities and hands it to the module
//! before `on_load`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ConfigView;
use crate::event::{EventKind, EventListener, EventMonitor, WatchId};
use crate::instrument::TypeSource;
use crate::matcher::TypeMatcher;
use crate::module::{ModuleInfo, ModuleResult};

/// Capabilities a module can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ResourceKind {
    /// Query surface over loaded types
    TypeSource,
    /// Per-module watch/delete registration handle
    EventWatcher,
    /// Per-module activate/freeze handle
    ModuleController,
    /// Orchestrator surface addressing modules by id
    ModuleManager,
    /// Read-only runtime configuration
    ConfigView,
    /// Event pool monitoring
    EventMonitor,
    /// Ledger for resources to release on unload
    ResourceTracker,
}

/// Per-module transform registration handle.
///
/// `watch` installs a transform hook for everything the matcher selects and
/// immediately retransforms already-loaded candidates; `delete` revokes the
/// registration and retransforms again to strip the instrumentation.
pub trait EventWatcher: Send + Sync {
    /// Register a watch over non-core types.
    fn watch(
        &self,
        matcher: Arc<dyn TypeMatcher>,
        listener: Arc<dyn EventListener>,
        kinds: &[EventKind],
    ) -> anyhow::Result<WatchId>;

    /// Register a watch that may also instrument host-core types.
    fn watch_unsafe(
        &self,
        matcher: Arc<dyn TypeMatcher>,
        listener: Arc<dyn EventListener>,
        kinds: &[EventKind],
    ) -> anyhow::Result<WatchId>;

    /// Revoke a watch owned by this module. The affect statistic of the
    /// registration freezes permanently.
    fn delete(&self, watch_id: WatchId) -> anyhow::Result<()>;
}

/// Per-module lifecycle handle bound to the owning module's id.
///
/// Acquires the runtime's transition lock: do not call from inside a
/// lifecycle hook (the hook already runs under that lock). Intended for
/// module worker tasks.
#[async_trait::async_trait]
pub trait ModuleController: Send + Sync {
    async fn active(&self) -> ModuleResult<()>;
    async fn frozen(&self) -> ModuleResult<()>;
}

/// Orchestrator surface addressing modules by id.
///
/// Same locking caveat as [`ModuleController`]: calling these from inside a
/// lifecycle hook deadlocks on the transition lock.
#[async_trait::async_trait]
pub trait ModuleManagerApi: Send + Sync {
    async fn flush(&self, force: bool) -> ModuleResult<()>;
    async fn reset(&self) -> ModuleResult<()>;
    async fn unload(&self, module_id: &str) -> ModuleResult<()>;
    async fn active(&self, module_id: &str) -> ModuleResult<()>;
    async fn frozen(&self, module_id: &str) -> ModuleResult<()>;
    async fn list(&self) -> Vec<ModuleInfo>;
    async fn get(&self, module_id: &str) -> Option<ModuleInfo>;
}

/// A resource acquired during module load, released on unload.
pub trait ReleasableResource: Send + Sync {
    fn name(&self) -> &str;
    fn release(&self) -> anyhow::Result<()>;
}

/// Ledger handle for releasable resources. Tracked resources are released
/// in reverse acquisition order when the owning module unloads.
pub trait ResourceTracker: Send + Sync {
    fn track(&self, resource: Box<dyn ReleasableResource>);
}

/// Capability bundle injected into a module before `on_load`.
///
/// Only declared capabilities are present; accessors return `None` for
/// everything else.
#[derive(Clone, Default)]
pub struct ModuleResources {
    type_source: Option<Arc<dyn TypeSource>>,
    event_watcher: Option<Arc<dyn EventWatcher>>,
    controller: Option<Arc<dyn ModuleController>>,
    manager: Option<Arc<dyn ModuleManagerApi>>,
    config: Option<ConfigView>,
    event_monitor: Option<Arc<dyn EventMonitor>>,
    tracker: Option<Arc<dyn ResourceTracker>>,
}

impl ModuleResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_source(mut self, source: Arc<dyn TypeSource>) -> Self {
        self.type_source = Some(source);
        self
    }

    pub fn with_event_watcher(mut self, watcher: Arc<dyn EventWatcher>) -> Self {
        self.event_watcher = Some(watcher);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn ModuleController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_manager(mut self, manager: Arc<dyn ModuleManagerApi>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_config(mut self, config: ConfigView) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_event_monitor(mut self, monitor: Arc<dyn EventMonitor>) -> Self {
        self.event_monitor = Some(monitor);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ResourceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn type_source(&self) -> Option<Arc<dyn TypeSource>> {
        self.type_source.clone()
    }

    pub fn event_watcher(&self) -> Option<Arc<dyn EventWatcher>> {
        self.event_watcher.clone()
    }

    pub fn controller(&self) -> Option<Arc<dyn ModuleController>> {
        self.controller.clone()
    }

    pub fn manager(&self) -> Option<Arc<dyn ModuleManagerApi>> {
        self.manager.clone()
    }

    pub fn config(&self) -> Option<&ConfigView> {
        self.config.as_ref()
    }

    pub fn event_monitor(&self) -> Option<Arc<dyn EventMonitor>> {
        self.event_monitor.clone()
    }

    pub fn tracker(&self) -> Option<Arc<dyn ResourceTracker>> {
        self.tracker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    #[test]
    fn test_empty_bundle_has_no_capabilities() {
        let resources = ModuleResources::new();
        assert!(resources.type_source().is_none());
        assert!(resources.event_watcher().is_none());
        assert!(resources.controller().is_none());
        assert!(resources.manager().is_none());
        assert!(resources.config().is_none());
        assert!(resources.event_monitor().is_none());
        assert!(resources.tracker().is_none());
    }

    #[test]
    fn test_bundle_carries_declared_capabilities() {
        let config = CoreConfig::new("/opt/sonde/system").view();
        let resources = ModuleResources::new().with_config(config);
        assert!(resources.config().is_some());
        assert!(resources.event_watcher().is_none());
    }
}
