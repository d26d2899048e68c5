//! Instrumentation-layer collaborator contracts
//!
//! The runtime never rewrites code itself; it talks to the host's live
//! instrumentation layer through these traits. Implementations live in the
//! embedding host (or in test doubles).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::matcher::TypeMatcher;

/// A type currently loaded in the host process, as seen by the
/// instrumentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedType {
    /// Fully qualified type name
    pub name: String,
    /// Function signatures defined on the type
    pub functions: Vec<String>,
    /// Whether the type belongs to the host runtime core. Core types are
    /// excluded from instrumentation unless a watch opts in.
    pub core_type: bool,
}

impl LoadedType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
            core_type: false,
        }
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.functions.push(function.to_string());
        self
    }

    pub fn with_core_type(mut self, core: bool) -> Self {
        self.core_type = core;
        self
    }
}

/// A transform hook registered with the instrumentation layer.
///
/// The host invokes `transform` for every type it (re)processes; the return
/// value says whether this transformer claimed the type.
pub trait TypeTransformer: Send + Sync {
    /// Stable identifier, used to remove the transformer again.
    fn transformer_id(&self) -> u64;

    /// Inspect a type and instrument it if it matches. Returns `true` when
    /// the type was claimed.
    fn transform(&self, ty: &LoadedType) -> anyhow::Result<bool>;
}

/// The host's live instrumentation layer.
///
/// Any call may fail; per-type retransform failures are contained by the
/// caller and never abort a batch.
pub trait Instrumentation: Send + Sync {
    /// Register a transform hook.
    fn add_transformer(
        &self,
        transformer: Arc<dyn TypeTransformer>,
        can_retransform: bool,
    ) -> anyhow::Result<()>;

    /// Remove a previously registered transform hook.
    fn remove_transformer(&self, transformer_id: u64) -> anyhow::Result<()>;

    /// Re-run registered transformers over one already-loaded type.
    fn retransform(&self, ty: &LoadedType) -> anyhow::Result<()>;
}

/// Query surface over the types currently loaded in the host process.
pub trait TypeSource: Send + Sync {
    /// Types satisfying the matcher, candidates for retransformation.
    /// Core types are included only when `include_core` is set.
    fn find_for_retransform(
        &self,
        matcher: &dyn TypeMatcher,
        include_core: bool,
    ) -> Vec<LoadedType>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_type_builder() {
        let ty = LoadedType::new("svc::Server")
            .with_function("handle(req)")
            .with_function("shutdown()")
            .with_core_type(false);

        assert_eq!(ty.name, "svc::Server");
        assert_eq!(ty.functions.len(), 2);
        assert!(!ty.core_type);
    }
}
