//! Typed errors for the module runtime.

use thiserror::Error;

/// Result type for module runtime operations.
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Errors surfaced by module lifecycle operations.
///
/// Every kind except [`ModuleError::NotFound`] originates from a
/// module-supplied lifecycle hook failing; the causal failure is carried
/// alongside the module id.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// No module with the given id is currently loaded.
    #[error("module not found: {0}")]
    NotFound(String),

    /// The module's `on_load` hook failed; the load was aborted and rolled
    /// back.
    #[error("module {module} load failed: {cause}")]
    LoadFailed { module: String, cause: anyhow::Error },

    /// The module's `on_unload` hook failed.
    #[error("module {module} unload failed: {cause}")]
    UnloadFailed { module: String, cause: anyhow::Error },

    /// The module's `on_active` hook failed.
    #[error("module {module} activation failed: {cause}")]
    ActiveFailed { module: String, cause: anyhow::Error },

    /// The module's `on_frozen` hook failed.
    #[error("module {module} freeze failed: {cause}")]
    FrozenFailed { module: String, cause: anyhow::Error },

    /// Catch-all for runtime-internal failures.
    #[error("{0}")]
    Other(String),
}

impl ModuleError {
    pub fn not_found(module: &str) -> Self {
        Self::NotFound(module.to_string())
    }

    pub fn load(module: &str, cause: anyhow::Error) -> Self {
        Self::LoadFailed {
            module: module.to_string(),
            cause,
        }
    }

    pub fn unload(module: &str, cause: anyhow::Error) -> Self {
        Self::UnloadFailed {
            module: module.to_string(),
            cause,
        }
    }

    pub fn active(module: &str, cause: anyhow::Error) -> Self {
        Self::ActiveFailed {
            module: module.to_string(),
            cause,
        }
    }

    pub fn frozen(module: &str, cause: anyhow::Error) -> Self {
        Self::FrozenFailed {
            module: module.to_string(),
            cause,
        }
    }

    /// The module id this error concerns, if any.
    pub fn module_id(&self) -> Option<&str> {
        match self {
            Self::NotFound(id) => Some(id),
            Self::LoadFailed { module, .. }
            | Self::UnloadFailed { module, .. }
            | Self::ActiveFailed { module, .. }
            | Self::FrozenFailed { module, .. } => Some(module),
            _ => None,
        }
    }
}
