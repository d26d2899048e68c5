//! Sonde runtime
//!
//! The module lifecycle manager and transform registration engine:
//! - Dynamic module loading from archive directories with isolated library
//!   boundaries and checksum-based change detection
//! - Per-module lifecycle (load → activate ⇄ freeze → unload) with
//!   idempotent transitions and rollback on load failure
//! - Watch registrations binding type matchers to event listeners, with
//!   compensating retransforms on delete
//! - Soft/force flush hot reload and an optional filesystem watcher
//!
//! The entry point is [`CoreModuleManager`]; shared vocabulary lives in
//! `sonde-kernel`.

mod context;
mod registry;
mod watch;

pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod retransform;
pub mod watcher;

pub use lifecycle::Transition;
pub use loader::{
    DylibHost, LibraryHost, ModuleGovernor, ModuleLibrary, file_checksum, is_module_file,
};
pub use manager::{CoreModuleManager, CoreModuleManagerBuilder};
pub use retransform::{ProgressSink, RetransformSummary};
pub use watcher::{DirWatchConfig, ModuleDirWatcher};

// Re-export the kernel so embedders and modules can depend on one crate.
pub use sonde_kernel as kernel;
