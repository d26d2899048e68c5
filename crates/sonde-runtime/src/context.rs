//! Runtime context
//!
//! Shared collaborators handed to every component of the runtime. One
//! context exists per [`CoreModuleManager`](crate::manager::CoreModuleManager)
//! instance; there are no process-wide statics.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use sonde_kernel::config::CoreConfig;
use sonde_kernel::event::{ListenerIdTable, ListenerTable};
use sonde_kernel::instrument::{Instrumentation, TypeSource};
use sonde_kernel::resource::{ReleasableResource, ResourceTracker};

use crate::watch::WatchRegistry;

/// Shared state reachable from lifecycle transitions, watch handles and the
/// manager façade.
pub(crate) struct RuntimeContext {
    pub config: Arc<CoreConfig>,
    pub instrumentation: Arc<dyn Instrumentation>,
    pub type_source: Arc<dyn TypeSource>,
    pub listener_table: Arc<ListenerTable>,
    pub listener_ids: ListenerIdTable,
    pub watches: WatchRegistry,
    pub resources: ResourceLedger,
}

/// Per-module ledger of releasable resources acquired during load.
///
/// Resources are released in reverse acquisition order when the owning
/// module unloads.
#[derive(Default)]
pub(crate) struct ResourceLedger {
    inner: Mutex<HashMap<String, Vec<Box<dyn ReleasableResource>>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking resources for a module.
    pub fn open_module(&self, module_id: &str) {
        self.inner.lock().entry(module_id.to_string()).or_default();
    }

    /// Append a resource to a module's ledger. Returns false when the module
    /// is not open (the resource is dropped).
    pub fn track(&self, module_id: &str, resource: Box<dyn ReleasableResource>) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(module_id) {
            Some(resources) => {
                debug!(module = %module_id, resource = %resource.name(), "tracking releasable resource");
                resources.push(resource);
                true
            }
            None => false,
        }
    }

    /// Release every tracked resource of a module, last acquired first, and
    /// drop the ledger entry. Release failures are logged, never propagated.
    pub fn release_all(&self, module_id: &str) {
        let resources = self.inner.lock().remove(module_id).unwrap_or_default();
        for resource in resources.into_iter().rev() {
            match resource.release() {
                Ok(()) => debug!(module = %module_id, resource = %resource.name(), "released resource"),
                Err(e) => {
                    warn!(module = %module_id, resource = %resource.name(), error = %e, "failed to release resource")
                }
            }
        }
    }

    pub fn tracked_count(&self, module_id: &str) -> usize {
        self.inner.lock().get(module_id).map_or(0, Vec::len)
    }
}

/// Injectable [`ResourceTracker`] bound to one module's ledger entry.
pub(crate) struct ModuleResourceTracker {
    pub module_id: String,
    pub ctx: Arc<RuntimeContext>,
}

impl ResourceTracker for ModuleResourceTracker {
    fn track(&self, resource: Box<dyn ReleasableResource>) {
        if !self.ctx.resources.track(&self.module_id, resource) {
            warn!(module = %self.module_id, "dropping resource tracked by a module that is not loaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestResource {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestResource {
        fn boxed(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn ReleasableResource> {
            Box::new(Self {
                name: name.to_string(),
                log: log.clone(),
            })
        }
    }

    impl ReleasableResource for TestResource {
        fn name(&self) -> &str {
            &self.name
        }

        fn release(&self) -> anyhow::Result<()> {
            self.log.lock().push(self.name.clone());
            Ok(())
        }
    }

    #[test]
    fn test_release_all_is_lifo() {
        let ledger = ResourceLedger::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        ledger.open_module("m");
        assert!(ledger.track("m", TestResource::boxed("r1", &log)));
        assert!(ledger.track("m", TestResource::boxed("r2", &log)));
        assert!(ledger.track("m", TestResource::boxed("r3", &log)));
        assert_eq!(ledger.tracked_count("m"), 3);

        ledger.release_all("m");
        assert_eq!(*log.lock(), vec!["r3", "r2", "r1"]);
        assert_eq!(ledger.tracked_count("m"), 0);
    }

    #[test]
    fn test_track_requires_open_module() {
        let ledger = ResourceLedger::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(!ledger.track("ghost", TestResource::boxed("r", &log)));
    }

    #[test]
    fn test_release_all_on_unknown_module_is_noop() {
        let ledger = ResourceLedger::new();
        ledger.release_all("ghost");
    }
}
