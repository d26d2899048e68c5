//! Watch registrations
//!
//! A watch binds a type matcher to an event listener for a set of event
//! kinds. Registrations are owned by their module; the registry keeps a
//! per-module activation mirror so watch/delete calls stay consistent with
//! lifecycle transitions without taking the manager's transition lock.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use sonde_kernel::event::{EventKind, EventListener, ListenerId, WatchId};
use sonde_kernel::instrument::{LoadedType, TypeTransformer};
use sonde_kernel::matcher::TypeMatcher;
use sonde_kernel::resource::EventWatcher;

use crate::context::RuntimeContext;
use crate::retransform::RetransformDriver;

/// Running affect statistic of one watch registration: distinct types and
/// distinct function signatures touched. Freezes permanently when the
/// registration is deleted.
pub(crate) struct AffectStats {
    types: Mutex<HashSet<String>>,
    functions: Mutex<HashSet<String>>,
    frozen: AtomicBool,
}

impl AffectStats {
    pub fn new() -> Self {
        Self {
            types: Mutex::new(HashSet::new()),
            functions: Mutex::new(HashSet::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn record(&self, type_name: &str, functions: &[String]) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.types.lock().insert(type_name.to_string());
        let mut set = self.functions.lock();
        for function in functions {
            set.insert(format!("{type_name}::{function}"));
        }
    }

    pub fn type_count(&self) -> usize {
        self.types.lock().len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

/// The transform hook a watch installs into the instrumentation layer.
pub(crate) struct WatchTransformer {
    pub watch_id: WatchId,
    pub module_id: String,
    pub matcher: Arc<dyn TypeMatcher>,
    pub listener_id: ListenerId,
    pub include_core: bool,
    pub stats: Arc<AffectStats>,
}

impl TypeTransformer for WatchTransformer {
    fn transformer_id(&self) -> u64 {
        self.watch_id.0
    }

    fn transform(&self, ty: &LoadedType) -> anyhow::Result<bool> {
        if ty.core_type && !self.include_core {
            return Ok(false);
        }
        if !self.matcher.matches_type(&ty.name) {
            return Ok(false);
        }
        let matched: Vec<String> = ty
            .functions
            .iter()
            .filter(|f| self.matcher.matches_function(&ty.name, f))
            .cloned()
            .collect();
        if matched.is_empty() {
            return Ok(false);
        }
        self.stats.record(&ty.name, &matched);
        Ok(true)
    }
}

/// One live watch registration.
#[derive(Clone)]
pub(crate) struct WatchRegistration {
    pub watch_id: WatchId,
    pub module_id: String,
    pub matcher: Arc<dyn TypeMatcher>,
    pub listener: Arc<dyn EventListener>,
    pub listener_id: ListenerId,
    pub kinds: Vec<EventKind>,
    pub include_core: bool,
    pub stats: Arc<AffectStats>,
    pub transformer: Arc<WatchTransformer>,
}

struct ModuleWatches {
    activated: bool,
    watches: Vec<WatchRegistration>,
}

/// Per-module transformer registry plus the watch-id sequence.
pub(crate) struct WatchRegistry {
    next_watch: AtomicU64,
    inner: Mutex<HashMap<String, ModuleWatches>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            next_watch: AtomicU64::new(1000),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Issue the next watch id. Ids are monotone and never reused.
    pub fn next_watch_id(&self) -> WatchId {
        WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed))
    }

    /// Open the registration slot for a module being loaded.
    pub fn open_module(&self, module_id: &str) {
        self.inner
            .lock()
            .entry(module_id.to_string())
            .or_insert_with(|| ModuleWatches {
                activated: false,
                watches: Vec::new(),
            });
    }

    /// Drop a module's slot entirely. Any leftover registrations are
    /// returned so the caller can revoke them.
    pub fn close_module(&self, module_id: &str) -> Vec<WatchRegistration> {
        self.inner
            .lock()
            .remove(module_id)
            .map(|m| m.watches)
            .unwrap_or_default()
    }

    /// Append a registration to its module's slot.
    pub fn insert(&self, registration: WatchRegistration) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        match inner.get_mut(&registration.module_id) {
            Some(module) => {
                module.watches.push(registration);
                Ok(())
            }
            None => anyhow::bail!("module {} is not loaded", registration.module_id),
        }
    }

    /// Remove one registration by watch id.
    pub fn take(&self, module_id: &str, watch_id: WatchId) -> Option<WatchRegistration> {
        let mut inner = self.inner.lock();
        let module = inner.get_mut(module_id)?;
        let index = module.watches.iter().position(|w| w.watch_id == watch_id)?;
        Some(module.watches.remove(index))
    }

    /// Clone a module's registrations for iteration outside the lock.
    pub fn snapshot(&self, module_id: &str) -> Vec<WatchRegistration> {
        self.inner
            .lock()
            .get(module_id)
            .map(|m| m.watches.clone())
            .unwrap_or_default()
    }

    /// Maintain the activation mirror. Set by the lifecycle controller on
    /// activate/freeze so watch() can enable listeners on an already-active
    /// module.
    pub fn set_activated(&self, module_id: &str, activated: bool) {
        if let Some(module) = self.inner.lock().get_mut(module_id) {
            module.activated = activated;
        }
    }

    pub fn is_activated(&self, module_id: &str) -> bool {
        self.inner
            .lock()
            .get(module_id)
            .is_some_and(|m| m.activated)
    }

    pub fn watch_count(&self, module_id: &str) -> usize {
        self.inner
            .lock()
            .get(module_id)
            .map_or(0, |m| m.watches.len())
    }

    /// Aggregate affect counts over a module's live registrations.
    pub fn affect_counts(&self, module_id: &str) -> (usize, usize) {
        let inner = self.inner.lock();
        match inner.get(module_id) {
            Some(module) => module.watches.iter().fold((0, 0), |(t, f), w| {
                (t + w.stats.type_count(), f + w.stats.function_count())
            }),
            None => (0, 0),
        }
    }

    pub fn total_watches(&self) -> usize {
        self.inner.lock().values().map(|m| m.watches.len()).sum()
    }
}

/// Per-module `watch`/`delete` handle injected into modules.
pub(crate) struct ModuleEventWatcher {
    pub module_id: String,
    pub ctx: Arc<RuntimeContext>,
}

impl ModuleEventWatcher {
    fn watch_inner(
        &self,
        matcher: Arc<dyn TypeMatcher>,
        listener: Arc<dyn EventListener>,
        kinds: &[EventKind],
        include_core: bool,
    ) -> anyhow::Result<WatchId> {
        let watch_id = self.ctx.watches.next_watch_id();
        let listener_id = self.ctx.listener_ids.id_of(&listener);
        let stats = Arc::new(AffectStats::new());
        let transformer = Arc::new(WatchTransformer {
            watch_id,
            module_id: self.module_id.clone(),
            matcher: matcher.clone(),
            listener_id,
            include_core,
            stats: stats.clone(),
        });

        self.ctx
            .instrumentation
            .add_transformer(transformer.clone(), true)?;

        let registration = WatchRegistration {
            watch_id,
            module_id: self.module_id.clone(),
            matcher: matcher.clone(),
            listener: listener.clone(),
            listener_id,
            kinds: kinds.to_vec(),
            include_core,
            stats,
            transformer,
        };
        if let Err(e) = self.ctx.watches.insert(registration) {
            let _ = self.ctx.instrumentation.remove_transformer(watch_id.0);
            return Err(e);
        }

        // A watch on an already-activated module fires right away.
        if self.ctx.watches.is_activated(&self.module_id) {
            self.ctx.listener_table.activate(listener_id, listener, kinds);
        }

        let driver = RetransformDriver::new(
            self.ctx.instrumentation.as_ref(),
            self.ctx.type_source.as_ref(),
        );
        let summary = driver.retransform(matcher.as_ref(), include_core, None);
        info!(
            module = %self.module_id,
            %watch_id,
            retransformed = summary.succeeded,
            failed = summary.failed,
            "watch registered"
        );
        Ok(watch_id)
    }
}

impl EventWatcher for ModuleEventWatcher {
    fn watch(
        &self,
        matcher: Arc<dyn TypeMatcher>,
        listener: Arc<dyn EventListener>,
        kinds: &[EventKind],
    ) -> anyhow::Result<WatchId> {
        self.watch_inner(matcher, listener, kinds, false)
    }

    fn watch_unsafe(
        &self,
        matcher: Arc<dyn TypeMatcher>,
        listener: Arc<dyn EventListener>,
        kinds: &[EventKind],
    ) -> anyhow::Result<WatchId> {
        self.watch_inner(matcher, listener, kinds, true)
    }

    fn delete(&self, watch_id: WatchId) -> anyhow::Result<()> {
        let registration = self
            .ctx
            .watches
            .take(&self.module_id, watch_id)
            .ok_or_else(|| {
                anyhow::anyhow!("{watch_id} not found for module {}", self.module_id)
            })?;

        self.ctx.listener_table.frozen(registration.listener_id);
        if let Err(e) = self.ctx.instrumentation.remove_transformer(watch_id.0) {
            warn!(module = %self.module_id, %watch_id, error = %e, "failed to remove transformer");
        }
        registration.stats.freeze();

        // Compensating retransform strips the instrumentation from
        // previously affected types.
        let driver = RetransformDriver::new(
            self.ctx.instrumentation.as_ref(),
            self.ctx.type_source.as_ref(),
        );
        let summary = driver.retransform(
            registration.matcher.as_ref(),
            registration.include_core,
            None,
        );
        debug!(
            module = %self.module_id,
            %watch_id,
            retransformed = summary.succeeded,
            failed = summary.failed,
            "watch deleted"
        );
        Ok(())
    }
}
