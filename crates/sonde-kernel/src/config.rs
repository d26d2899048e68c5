//! Runtime configuration
//!
//! [`CoreConfig`] is built by the embedding host; modules only ever see the
//! read-only [`ConfigView`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::module::LaunchMode;

/// Configuration of the module runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Namespace of this runtime instance (several instances may coexist in
    /// one host process)
    pub namespace: String,
    /// Launch mode of the host process
    pub launch_mode: LaunchMode,
    /// Directory holding system modules. Never touched by flushes.
    pub system_module_dir: PathBuf,
    /// Directories holding user modules, scanned in order.
    pub user_module_dirs: Vec<PathBuf>,
    /// Free-form settings exposed to modules
    pub settings: HashMap<String, serde_json::Value>,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(system_module_dir: P) -> Self {
        Self {
            namespace: "default".to_string(),
            launch_mode: LaunchMode::Agent,
            system_module_dir: system_module_dir.as_ref().to_path_buf(),
            user_module_dirs: Vec::new(),
            settings: HashMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    pub fn with_user_module_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.user_module_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.settings.insert(key.to_string(), v);
        }
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// All module directories, system directory first.
    pub fn module_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.system_module_dir.clone()];
        dirs.extend(self.user_module_dirs.iter().cloned());
        dirs
    }

    /// Build the read-only view handed to modules.
    pub fn view(self) -> ConfigView {
        ConfigView {
            inner: Arc::new(self),
        }
    }
}

/// Read-only configuration snapshot injectable into modules.
#[derive(Debug, Clone)]
pub struct ConfigView {
    inner: Arc<CoreConfig>,
}

impl ConfigView {
    pub fn of(config: Arc<CoreConfig>) -> Self {
        Self { inner: config }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn launch_mode(&self) -> LaunchMode {
        self.inner.launch_mode
    }

    pub fn system_module_dir(&self) -> &Path {
        &self.inner.system_module_dir
    }

    pub fn user_module_dirs(&self) -> &[PathBuf] {
        &self.inner.user_module_dirs
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_and_settings() {
        let mut config = CoreConfig::new("/opt/sonde/system")
            .with_namespace("test")
            .with_launch_mode(LaunchMode::Attach)
            .with_user_module_dir("/opt/sonde/user");
        config.set("sample_rate", 50);
        config.set("label", "canary");

        assert_eq!(config.namespace, "test");
        assert_eq!(config.launch_mode, LaunchMode::Attach);
        assert_eq!(config.get::<i64>("sample_rate"), Some(50));
        assert_eq!(config.get::<String>("label"), Some("canary".to_string()));
        assert_eq!(config.get::<i64>("missing"), None);
        assert_eq!(config.module_dirs().len(), 2);
    }

    #[test]
    fn test_config_view_is_read_only_snapshot() {
        let mut config = CoreConfig::new("/sys").with_user_module_dir("/usr1");
        config.set("flag", true);
        let view = config.view();

        assert_eq!(view.namespace(), "default");
        assert_eq!(view.system_module_dir(), Path::new("/sys"));
        assert_eq!(view.user_module_dirs().len(), 1);
        assert_eq!(view.get::<bool>("flag"), Some(true));
    }
}
