//! Dynamic module loader
//!
//! Handles opening isolated library boundaries, discovering the modules an
//! archive declares, and enumerating archives in module directories.

use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use sonde_kernel::module::{LaunchMode, MODULE_API_VERSION, ModuleMetadata, ProbeModule};

/// Admission hook consulted for every discovered module candidate. A veto
/// skips only that candidate, never the rest of the archive.
pub trait ModuleGovernor: Send + Sync {
    fn admit(&self, metadata: &ModuleMetadata) -> anyhow::Result<()>;
}

/// An opened library boundary. Dropping the last handle closes it.
pub trait ModuleLibrary: Send + Sync {
    /// Path of the backing archive file.
    fn path(&self) -> &Path;

    /// Instantiate the modules this archive declares.
    fn discover(&self) -> anyhow::Result<Vec<Box<dyn ProbeModule>>>;
}

/// Opens library boundaries. The default implementation loads shared
/// libraries; tests substitute an in-process fake.
pub trait LibraryHost: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn ModuleLibrary>>;
}

type ApiVersionFn = unsafe extern "C" fn() -> u32;
type ModulesFn = unsafe extern "C" fn() -> *mut Vec<Box<dyn ProbeModule>>;

/// Shared-library host backed by `libloading`.
///
/// Archives export their modules through the symbols generated by
/// `sonde_kernel::declare_modules!`.
pub struct DylibHost {
    expected_api: u32,
}

impl DylibHost {
    pub fn new() -> Self {
        Self {
            expected_api: MODULE_API_VERSION,
        }
    }
}

impl Default for DylibHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryHost for DylibHost {
    fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn ModuleLibrary>> {
        debug!(path = %path.display(), "opening module library");

        let library = unsafe {
            Library::new(path)
                .map_err(|e| anyhow::anyhow!("failed to load library {}: {e}", path.display()))?
        };

        let api_version = unsafe {
            match library.get::<ApiVersionFn>(b"_sonde_api_version") {
                Ok(func) => func(),
                // Default to the current version if the archive predates the
                // version symbol.
                Err(_) => MODULE_API_VERSION,
            }
        };

        if api_version != self.expected_api {
            anyhow::bail!(
                "module api version mismatch in {}: expected {}, got {}",
                path.display(),
                self.expected_api,
                api_version
            );
        }

        Ok(Arc::new(DylibLibrary {
            path: path.to_path_buf(),
            library,
        }))
    }
}

struct DylibLibrary {
    path: PathBuf,
    library: Library,
}

impl ModuleLibrary for DylibLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn discover(&self) -> anyhow::Result<Vec<Box<dyn ProbeModule>>> {
        unsafe {
            let provider = self.library.get::<ModulesFn>(b"_sonde_modules").map_err(|e| {
                anyhow::anyhow!("module provider symbol missing in {}: {e}", self.path.display())
            })?;
            let raw = provider();
            if raw.is_null() {
                anyhow::bail!("module provider in {} returned null", self.path.display());
            }
            Ok(*Box::from_raw(raw))
        }
    }
}

impl Drop for DylibLibrary {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "unloading module library");
    }
}

/// CRC32 content checksum of a file, used for archive change detection.
pub fn file_checksum(path: &Path) -> std::io::Result<u32> {
    let contents = std::fs::read(path)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&contents);
    Ok(hasher.finalize())
}

/// Whether a path looks like a module archive.
pub fn is_module_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str());
    matches!(ext, Some("so") | Some("dylib") | Some("dll"))
}

/// A filtered batch of module candidates discovered from one archive.
pub(crate) struct ArchiveCandidates {
    pub library: Arc<dyn ModuleLibrary>,
    pub checksum: u32,
    pub modules: Vec<Box<dyn ProbeModule>>,
}

/// Directory- and archive-level module discovery.
pub(crate) struct ModuleLoader {
    host: Arc<dyn LibraryHost>,
    mode: LaunchMode,
}

impl ModuleLoader {
    pub fn new(host: Arc<dyn LibraryHost>, mode: LaunchMode) -> Self {
        Self { host, mode }
    }

    /// Enumerate module archives under a directory in deterministic
    /// (lexicographic) order. A single archive path is also accepted. Read
    /// failures are logged and yield an empty list.
    pub fn enumerate(&self, dir: &Path) -> Vec<PathBuf> {
        if dir.is_file() {
            if is_module_file(dir) {
                return vec![dir.to_path_buf()];
            }
            warn!(path = %dir.display(), "module path is not a module archive");
            return Vec::new();
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read module directory");
                return Vec::new();
            }
        };

        let mut archives: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_module_file(p))
            .collect();
        archives.sort();
        archives
    }

    /// Open one archive and discover its admissible module candidates.
    ///
    /// Candidates with a blank id or an unsupported launch mode are warned
    /// about and filtered here; registry collisions and governor vetoes are
    /// handled by the caller per candidate.
    pub fn open_archive(&self, path: &Path) -> anyhow::Result<ArchiveCandidates> {
        let checksum = file_checksum(path)
            .map_err(|e| anyhow::anyhow!("checksum failed for {}: {e}", path.display()))?;
        let library = self.host.open(path)?;
        let discovered = library.discover()?;

        let mut modules = Vec::new();
        for module in discovered {
            let metadata = module.metadata();
            if metadata.id.trim().is_empty() {
                warn!(path = %path.display(), "skipping module candidate with blank id");
                continue;
            }
            if !metadata.supports_mode(self.mode) {
                warn!(
                    module = %metadata.id,
                    mode = ?self.mode,
                    "skipping module candidate: launch mode not supported"
                );
                continue;
            }
            modules.push(module);
        }

        Ok(ArchiveCandidates {
            library,
            checksum,
            modules,
        })
    }
}
