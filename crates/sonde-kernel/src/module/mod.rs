//! Module trait and metadata
//!
//! A probe module is the unit of pluggable instrumentation code. It declares
//! identity metadata, requests the runtime capabilities it needs, and opts
//! into lifecycle hooks by overriding the default no-op bodies.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::resource::{ModuleResources, ResourceKind};

pub mod error;
pub use error::{ModuleError, ModuleResult};

/// ABI version spoken between the runtime and module archives.
pub const MODULE_API_VERSION: u32 = 1;

/// Result type for module-supplied lifecycle hooks.
///
/// Hooks may fail for arbitrary reasons; the lifecycle controller wraps the
/// failure into the matching [`ModuleError`] kind.
pub type HookResult = anyhow::Result<()>;

/// Launch mode of the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LaunchMode {
    /// Loaded at host startup.
    Agent,
    /// Attached to an already-running host.
    Attach,
}

/// Declared module metadata, inspected at discovery and load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Unique module identifier. Must be non-blank; blank ids are skipped
    /// at discovery time.
    pub id: String,
    /// Module version
    pub version: String,
    /// Module author
    pub author: Option<String>,
    /// Launch modes this module supports. A module whose set does not
    /// contain the host's current mode is skipped at discovery time.
    pub required_modes: Vec<LaunchMode>,
    /// Whether the module should be activated right after a successful load.
    pub activate_on_load: bool,
}

impl ModuleMetadata {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            author: None,
            required_modes: vec![LaunchMode::Agent, LaunchMode::Attach],
            activate_on_load: true,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn with_required_modes(mut self, modes: &[LaunchMode]) -> Self {
        self.required_modes = modes.to_vec();
        self
    }

    pub fn with_activate_on_load(mut self, activate: bool) -> Self {
        self.activate_on_load = activate;
        self
    }

    /// Check whether this module supports the given launch mode.
    pub fn supports_mode(&self, mode: LaunchMode) -> bool {
        self.required_modes.contains(&mode)
    }
}

/// Core probe-module trait.
///
/// Lifecycle hooks default to no-ops so a module implements exactly the
/// capability it cares about. Hook failures during `on_load` abort the load;
/// see the lifecycle controller for the full failure policy.
#[async_trait::async_trait]
pub trait ProbeModule: Send + Sync {
    /// Declared module metadata.
    fn metadata(&self) -> &ModuleMetadata;

    /// Unique module id (convenience accessor).
    fn module_id(&self) -> &str {
        &self.metadata().id
    }

    /// Runtime capabilities this module wants injected before `on_load`.
    fn declare_resources(&self) -> Vec<ResourceKind> {
        Vec::new()
    }

    /// Receive the capability bundle built from [`declare_resources`].
    ///
    /// Called exactly once, before `on_load`. Capabilities that were not
    /// declared are absent from the bundle.
    ///
    /// [`declare_resources`]: ProbeModule::declare_resources
    fn inject(&mut self, resources: ModuleResources) {
        let _ = resources;
    }

    /// Module load hook. A failure aborts the load and rolls back any
    /// watches or resources acquired so far.
    async fn on_load(&mut self) -> HookResult {
        Ok(())
    }

    /// Module unload hook.
    async fn on_unload(&mut self) -> HookResult {
        Ok(())
    }

    /// Module activation hook.
    async fn on_active(&mut self) -> HookResult {
        Ok(())
    }

    /// Module freeze hook.
    async fn on_frozen(&mut self) -> HookResult {
        Ok(())
    }

    /// Best-effort notification after the whole load sequence finished.
    /// Failures are logged and never propagated.
    async fn load_completed(&mut self) -> HookResult {
        Ok(())
    }
}

/// Read-only snapshot of a loaded module, returned by the manager's
/// `list`/`get` surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Module id
    pub id: String,
    /// Module version
    pub version: String,
    /// Module author
    pub author: Option<String>,
    /// Backing archive file
    pub library_path: Option<PathBuf>,
    /// Whether the module is loaded
    pub loaded: bool,
    /// Whether the module is activated
    pub activated: bool,
    /// Number of live watch registrations
    pub watch_count: usize,
    /// Distinct types touched by this module's watches
    pub affected_types: usize,
    /// Distinct function signatures touched by this module's watches
    pub affected_functions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_builder() {
        let meta = ModuleMetadata::new("demo")
            .with_version("2.1.0")
            .with_author("team")
            .with_required_modes(&[LaunchMode::Attach])
            .with_activate_on_load(false);

        assert_eq!(meta.id, "demo");
        assert_eq!(meta.version, "2.1.0");
        assert_eq!(meta.author.as_deref(), Some("team"));
        assert!(!meta.activate_on_load);
        assert!(meta.supports_mode(LaunchMode::Attach));
        assert!(!meta.supports_mode(LaunchMode::Agent));
    }

    #[test]
    fn test_metadata_defaults_support_both_modes() {
        let meta = ModuleMetadata::new("demo");
        assert!(meta.supports_mode(LaunchMode::Agent));
        assert!(meta.supports_mode(LaunchMode::Attach));
        assert!(meta.activate_on_load);
    }

    struct NoopModule {
        metadata: ModuleMetadata,
    }

    #[async_trait::async_trait]
    impl ProbeModule for NoopModule {
        fn metadata(&self) -> &ModuleMetadata {
            &self.metadata
        }
    }

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        let mut module = NoopModule {
            metadata: ModuleMetadata::new("noop"),
        };

        assert_eq!(module.module_id(), "noop");
        assert!(module.declare_resources().is_empty());
        assert!(module.on_load().await.is_ok());
        assert!(module.on_active().await.is_ok());
        assert!(module.on_frozen().await.is_ok());
        assert!(module.on_unload().await.is_ok());
        assert!(module.load_completed().await.is_ok());
    }
}
