//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch the engine's TOML file and broadcast each validated revision.
//! A revision that fails to parse or validate is logged and dropped, so the
//! running engine keeps its current snapshot.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Editor bursts (write + rename + chmod) collapse into one reload
//! - Dropping the [`ConfigWatcher`] stops both the OS watch and the reload task
//!
//! ## NOT Responsible For
//! - Swapping the live snapshot (see [`super::SharedConfig::follow`])
//! - Initial config loading (that belongs to `loader`)

use std::path::PathBuf;
use std::sync::mpsc::TryRecvError;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::EngineConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a config file and broadcasts validated [`EngineConfig`] updates.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<EngineConfig>,
    // Dropping the OS watcher closes the event channel, which ends the task.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// The initial config is **not** broadcast; load it with
    /// [`load_from_file`] first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the OS watcher cannot be created or the
    /// parent directory cannot be watched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use edgellm_router::config::{loader::load_from_file, watcher::ConfigWatcher, SharedConfig};
    ///
    /// let shared = SharedConfig::new(load_from_file(&path)?);
    /// let (_watcher, rx) = ConfigWatcher::new(path)?;
    /// shared.follow(rx);
    /// ```
    pub fn new(path: PathBuf) -> Result<(Self, broadcast::Receiver<EngineConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (event_tx, event_rx) = std::sync::mpsc::channel::<notify::Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = event_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the directory: atomic-save editors replace the file by rename.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let publish = tx.clone();
        tokio::spawn(async move {
            let mut last_reload: Option<std::time::Instant> = None;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;

                let mut touched = false;
                loop {
                    match event_rx.try_recv() {
                        Ok(event) => {
                            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                                && event
                                    .paths
                                    .iter()
                                    .any(|p| p.file_name() == path.file_name())
                            {
                                touched = true;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            tracing::debug!(path = %path.display(), "config watcher stopped");
                            return;
                        }
                    }
                }

                let debounced = last_reload.is_some_and(|at| at.elapsed() < DEBOUNCE);
                if !touched || debounced {
                    continue;
                }
                last_reload = Some(std::time::Instant::now());

                match load_from_file(&path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "config reloaded");
                        // No subscribers is fine; the file was still validated.
                        let _ = publish.send(config);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "config reload rejected, keeping current config"
                        );
                    }
                }
            }
        });

        Ok((
            Self {
                tx,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Subscribe an additional receiver to config updates.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineConfig> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[routing]
low_complexity_threshold = 0.3
mid_complexity_threshold = 0.6

[cache]
ttl_secs = 60
"#;

    #[tokio::test]
    async fn test_config_watcher_creation_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        assert!(ConfigWatcher::new(path).is_ok());
    }

    #[tokio::test]
    async fn test_config_watcher_subscribe_returns_receiver() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (watcher, _rx) = ConfigWatcher::new(path).expect("test: create watcher");
        let _rx2 = watcher.subscribe();
    }

    #[tokio::test]
    async fn test_config_watcher_detects_file_change() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updated = VALID_TOML.replace("ttl_secs = 60", "ttl_secs = 7");
        let mut f = std::fs::File::create(&path).expect("test: open for write");
        f.write_all(updated.as_bytes()).expect("test: write");
        f.sync_all().expect("test: sync");
        drop(f);

        let result = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        let config = result
            .expect("test: update within 3s")
            .expect("test: recv");
        assert_eq!(config.cache.ttl_secs, 7);
    }

    #[tokio::test]
    async fn test_config_watcher_rejects_invalid_reload() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Thresholds out of order: parses but fails validation.
        std::fs::write(
            &path,
            "[routing]\nlow_complexity_threshold = 0.9\nmid_complexity_threshold = 0.2\n",
        )
        .expect("test: write invalid");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "should not broadcast invalid config");
    }

    #[tokio::test]
    async fn test_config_watcher_nonexistent_parent_returns_error() {
        let path = PathBuf::from("/definitely/nonexistent/dir/router.toml");
        assert!(ConfigWatcher::new(path).is_err());
    }
}
