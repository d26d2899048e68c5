//! Module directory watcher
//!
//! Watches the user module directories and schedules a soft flush when an
//! archive is created, modified or removed. Manual `flush()` stays the
//! primary interface; the watcher is opt-in.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::manager::CoreModuleManager;

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct DirWatchConfig {
    /// Quiet period after the last relevant event before a flush runs.
    pub debounce: Duration,
    /// Archive extensions that count as module files.
    pub extensions: Vec<String>,
}

impl Default for DirWatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            extensions: vec!["so".to_string(), "dylib".to_string(), "dll".to_string()],
        }
    }
}

impl DirWatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    fn is_relevant(&self, event: &Event) -> bool {
        use notify::EventKind;
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event.paths.iter().any(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|known| known == ext))
        })
    }
}

/// Filesystem watcher driving soft flushes on the owning manager.
pub struct ModuleDirWatcher {
    manager: Weak<CoreModuleManager>,
    dirs: Vec<PathBuf>,
    config: DirWatchConfig,
    watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ModuleDirWatcher {
    pub fn new(manager: &Arc<CoreModuleManager>, config: DirWatchConfig) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            dirs: manager.config().user_module_dirs.clone(),
            config,
            watcher: None,
            shutdown_tx: None,
        }
    }

    /// Start watching. Missing directories are skipped with a warning.
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if self.watcher.is_some() {
            return Ok(());
        }
        info!(dirs = ?self.dirs, "starting module directory watcher");

        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.blocking_send(event);
                }
            },
            notify::Config::default(),
        )?;

        for dir in &self.dirs {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
            } else {
                warn!(dir = %dir.display(), "watch directory does not exist, skipping");
            }
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let manager = self.manager.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            // One pending deadline covers all paths: a soft flush rescans
            // every user directory anyway.
            let mut pending: Option<Instant> = None;

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                if config.is_relevant(&event) {
                                    debug!(?event, "module archive change detected");
                                    pending = Some(Instant::now() + config.debounce);
                                }
                            }
                            None => return,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if pending.is_some_and(|deadline| Instant::now() >= deadline) {
                            pending = None;
                            match manager.upgrade() {
                                Some(manager) => {
                                    if let Err(e) = manager.flush(false).await {
                                        warn!(error = %e, "scheduled soft flush failed");
                                    }
                                }
                                None => {
                                    debug!("module runtime gone, stopping watcher task");
                                    return;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("module directory watcher shutting down");
                        return;
                    }
                }
            }
        });

        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        info!("stopping module directory watcher");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        self.watcher = None;
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for ModuleDirWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::{CreateKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        let mut event = Event::new(kind);
        event.paths.push(PathBuf::from(path));
        event
    }

    #[test]
    fn test_relevant_event_filtering() {
        let config = DirWatchConfig::default();

        assert!(config.is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/modules/probe.so"
        )));
        assert!(config.is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/modules/probe.dylib"
        )));
        assert!(!config.is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/modules/notes.txt"
        )));
        assert!(!config.is_relevant(&event(EventKind::Access(notify::event::AccessKind::Any), "/modules/probe.so")));
    }

    #[test]
    fn test_config_builder() {
        let config = DirWatchConfig::new()
            .with_debounce(Duration::from_secs(2))
            .with_extension("module");
        assert_eq!(config.debounce, Duration::from_secs(2));
        assert!(config.extensions.iter().any(|e| e == "module"));
    }
}
