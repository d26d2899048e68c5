//! Module lifecycle controller
//!
//! Drives the per-module state machine (load → activate ⇄ freeze → unload).
//! Idempotent transitions report [`Transition::Unchanged`] instead of
//! failing; hook failures are wrapped into the matching
//! [`ModuleError`] kind. All transitions run under the manager's
//! transition lock.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use sonde_kernel::module::{ModuleError, ModuleResult, ProbeModule};
use sonde_kernel::resource::ModuleResources;

use crate::context::RuntimeContext;
use crate::registry::{LibraryHandle, ModuleRecord, RuntimeState};
use crate::retransform::RetransformDriver;

/// Outcome of a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The module was already in the requested state; no hook ran.
    Unchanged,
    /// The transition ran to completion.
    Completed,
}

pub(crate) struct LifecycleController {
    ctx: Arc<RuntimeContext>,
}

impl LifecycleController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    /// Load one discovered module: inject declared resources, run `on_load`,
    /// register, auto-activate if requested, then fire the best-effort
    /// `load_completed` notification.
    ///
    /// A hook failure aborts the load before registry insertion and rolls
    /// back any watches or resources the hook acquired.
    pub async fn load(
        &self,
        state: &mut RuntimeState,
        mut module: Box<dyn ProbeModule>,
        path: &Path,
        library: LibraryHandle,
        resources: ModuleResources,
    ) -> ModuleResult<Transition> {
        let id = module.metadata().id.clone();
        if state.registry.contains(&id) {
            debug!(module = %id, "module already loaded, skipping");
            return Ok(Transition::Unchanged);
        }

        info!(module = %id, path = %path.display(), "loading module");
        self.ctx.watches.open_module(&id);
        self.ctx.resources.open_module(&id);
        module.inject(resources);

        if let Err(e) = module.on_load().await {
            warn!(module = %id, error = %e, "module load hook failed, rolling back");
            self.revoke_watches(&id);
            self.ctx.resources.release_all(&id);
            return Err(ModuleError::load(&id, e));
        }

        let activate_on_load = module.metadata().activate_on_load;
        state.registry.insert(ModuleRecord {
            id: id.clone(),
            module,
            library_path: path.to_path_buf(),
            library,
            loaded: true,
            activated: false,
        });
        state.arena.retain(library);

        if activate_on_load {
            if let Err(e) = self.active(state, &id).await {
                warn!(module = %id, error = %e, "activate-on-load failed, module stays frozen");
            }
        }

        // Best-effort completion notification, never propagated.
        if let Some(record) = state.registry.get_mut(&id) {
            if let Err(e) = record.module.load_completed().await {
                warn!(module = %id, error = %e, "load_completed hook failed (ignored)");
            }
        }

        info!(module = %id, "module loaded");
        Ok(Transition::Completed)
    }

    /// Unload a module. No-op when the module is not loaded.
    ///
    /// Order: implicit freeze, `on_unload` hook, watch revocation, registry
    /// removal, LIFO resource release, boundary release.
    pub async fn unload(
        &self,
        state: &mut RuntimeState,
        id: &str,
        ignore_errors: bool,
    ) -> ModuleResult<Transition> {
        if !state.registry.contains(id) {
            debug!(module = %id, "module not loaded, nothing to unload");
            return Ok(Transition::Unchanged);
        }

        info!(module = %id, "unloading module");

        // Unload must not leave active transforms behind.
        self.frozen(state, id, ignore_errors).await?;

        let record = state
            .registry
            .get_mut(id)
            .ok_or_else(|| ModuleError::not_found(id))?;
        if let Err(e) = record.module.on_unload().await {
            if ignore_errors {
                warn!(module = %id, error = %e, "module unload hook failed (ignored)");
            } else {
                return Err(ModuleError::unload(id, e));
            }
        }

        self.revoke_watches(id);

        if let Some(mut record) = state.registry.remove(id) {
            record.loaded = false;
            self.ctx.resources.release_all(id);
            if state.arena.release(record.library) {
                debug!(module = %id, "library boundary closed");
            }
        }

        info!(module = %id, "module unloaded");
        Ok(Transition::Completed)
    }

    /// Activate a module. No-op when already activated.
    pub async fn active(&self, state: &mut RuntimeState, id: &str) -> ModuleResult<Transition> {
        let record = state
            .registry
            .get_mut(id)
            .ok_or_else(|| ModuleError::not_found(id))?;
        if record.activated {
            debug!(module = %id, "module already activated");
            return Ok(Transition::Unchanged);
        }

        info!(module = %id, "activating module");
        if let Err(e) = record.module.on_active().await {
            return Err(ModuleError::active(id, e));
        }

        for registration in self.ctx.watches.snapshot(id) {
            self.ctx.listener_table.activate(
                registration.listener_id,
                registration.listener.clone(),
                &registration.kinds,
            );
        }
        self.ctx.watches.set_activated(id, true);
        record.activated = true;
        Ok(Transition::Completed)
    }

    /// Freeze a module. No-op when not activated.
    pub async fn frozen(
        &self,
        state: &mut RuntimeState,
        id: &str,
        ignore_errors: bool,
    ) -> ModuleResult<Transition> {
        let record = state
            .registry
            .get_mut(id)
            .ok_or_else(|| ModuleError::not_found(id))?;
        if !record.activated {
            debug!(module = %id, "module not activated, nothing to freeze");
            return Ok(Transition::Unchanged);
        }

        info!(module = %id, "freezing module");
        if let Err(e) = record.module.on_frozen().await {
            if ignore_errors {
                warn!(module = %id, error = %e, "module freeze hook failed (ignored)");
            } else {
                return Err(ModuleError::frozen(id, e));
            }
        }

        for registration in self.ctx.watches.snapshot(id) {
            self.ctx.listener_table.frozen(registration.listener_id);
        }
        self.ctx.watches.set_activated(id, false);
        record.activated = false;
        Ok(Transition::Completed)
    }

    /// Close a module's watch slot and revoke every registration it held:
    /// disable the listener, remove the transformer and retransform to strip
    /// the instrumentation. Closing the slot and taking the registrations is
    /// one atomic step, so a concurrent `watch` cannot slip in between.
    fn revoke_watches(&self, id: &str) {
        let registrations = self.ctx.watches.close_module(id);
        if registrations.is_empty() {
            return;
        }
        debug!(module = %id, count = registrations.len(), "revoking watch registrations");

        let driver = RetransformDriver::new(
            self.ctx.instrumentation.as_ref(),
            self.ctx.type_source.as_ref(),
        );
        for registration in registrations {
            self.ctx.listener_table.frozen(registration.listener_id);
            if let Err(e) = self
                .ctx
                .instrumentation
                .remove_transformer(registration.watch_id.0)
            {
                warn!(
                    module = %id,
                    watch_id = %registration.watch_id,
                    error = %e,
                    "failed to remove transformer"
                );
            }
            registration.stats.freeze();
            driver.retransform(
                registration.matcher.as_ref(),
                registration.include_core,
                None,
            );
        }
    }
}
