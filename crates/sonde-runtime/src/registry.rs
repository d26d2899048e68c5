//! Module registry and library arena
//!
//! The registry is the single source of truth for what is currently loaded.
//! The arena tracks each opened library boundary with an explicit reference
//! count; a boundary closes when the last module referencing it is removed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use sonde_kernel::module::ProbeModule;

use crate::loader::ModuleLibrary;

/// Stable handle of an opened library boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(pub(crate) u64);

impl std::fmt::Display for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "library-{}", self.0)
    }
}

/// A loaded module record. Exclusively owned by the registry once inserted.
pub(crate) struct ModuleRecord {
    pub id: String,
    pub module: Box<dyn ProbeModule>,
    pub library_path: PathBuf,
    pub library: LibraryHandle,
    pub loaded: bool,
    pub activated: bool,
}

/// Map from module id to loaded-module record.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    modules: HashMap<String, ModuleRecord>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless the id is already present. Returns false on
    /// collision (first loader wins, silently).
    pub fn insert(&mut self, record: ModuleRecord) -> bool {
        if self.modules.contains_key(&record.id) {
            debug!(module = %record.id, "registry already holds this module id");
            return false;
        }
        self.modules.insert(record.id.clone(), record);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<ModuleRecord> {
        self.modules.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ModuleRecord> {
        self.modules.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ModuleRecord> {
        self.modules.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

pub(crate) struct LibraryEntry {
    pub library: Arc<dyn ModuleLibrary>,
    pub path: PathBuf,
    pub checksum: u32,
    pub refs: usize,
}

/// Arena of opened library boundaries with per-handle reference counts.
#[derive(Default)]
pub(crate) struct LibraryArena {
    next: u64,
    entries: HashMap<LibraryHandle, LibraryEntry>,
}

impl LibraryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an opened boundary. The initial reference count is zero;
    /// every module loaded from the boundary retains it once.
    pub fn open(&mut self, library: Arc<dyn ModuleLibrary>, path: PathBuf, checksum: u32) -> LibraryHandle {
        self.next += 1;
        let handle = LibraryHandle(self.next);
        self.entries.insert(
            handle,
            LibraryEntry {
                library,
                path,
                checksum,
                refs: 0,
            },
        );
        handle
    }

    pub fn retain(&mut self, handle: LibraryHandle) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.refs += 1;
        }
    }

    /// Drop one reference. Closes and removes the boundary when the count
    /// reaches zero; returns true in that case.
    pub fn release(&mut self, handle: LibraryHandle) -> bool {
        let closed = match self.entries.get_mut(&handle) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if closed {
            if let Some(entry) = self.entries.remove(&handle) {
                debug!(%handle, path = %entry.path.display(), "closing module library");
            }
        }
        closed
    }

    /// Close a boundary regardless of its reference count. Used when an
    /// archive yielded no admitted module.
    pub fn close(&mut self, handle: LibraryHandle) {
        if let Some(entry) = self.entries.remove(&handle) {
            debug!(%handle, path = %entry.path.display(), "closing module library");
        }
    }

    pub fn checksum(&self, handle: LibraryHandle) -> Option<u32> {
        self.entries.get(&handle).map(|e| e.checksum)
    }

    pub fn path(&self, handle: LibraryHandle) -> Option<&Path> {
        self.entries.get(&handle).map(|e| e.path.as_path())
    }

    /// Checksums of every open boundary.
    pub fn checksums(&self) -> HashSet<u32> {
        self.entries.values().map(|e| e.checksum).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Mutable runtime state guarded by the manager's transition lock.
#[derive(Default)]
pub(crate) struct RuntimeState {
    pub registry: ModuleRegistry,
    pub arena: LibraryArena,
}
