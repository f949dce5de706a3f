//! Polling watcher for the plugins directory.
//!
//! Each poll stats every `<plugin>/manifest.json` and the executable it names, then
//! diffs that against the previous scan. Batches of changes are handed to a
//! dispatcher thread so a slow callback never stalls the poller.

use crate::manifest::MANIFEST_FILE;
use crate::plugin::lock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    ManifestUpdated,
    /// The executable changed while the manifest did not.
    Modified,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::ManifestUpdated => "manifest_updated",
            ChangeKind::Modified => "modified",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginChange {
    pub plugin_name: String,
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PluginStamp {
    manifest_mtime: SystemTime,
    executable_mtime: Option<SystemTime>,
    path: PathBuf,
}

type Snapshot = BTreeMap<String, PluginStamp>;

pub type ChangeCallback = Box<dyn Fn(Vec<PluginChange>) + Send + 'static>;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher is already running")]
    AlreadyRunning,
    #[error("failed to start watcher thread: {0}")]
    Thread(#[from] std::io::Error),
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn executable_path(plugin_dir: &Path, manifest_path: &Path) -> Option<PathBuf> {
    let content = fs::read_to_string(manifest_path).ok()?;
    let raw: Value = serde_json::from_str(content.trim_start_matches('\u{feff}')).ok()?;
    let executable = raw.get("executable")?.as_str()?;
    Some(plugin_dir.join(executable))
}

fn scan(plugins_dir: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let Ok(entries) = fs::read_dir(plugins_dir) else {
        return snapshot;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let manifest_path = path.join(MANIFEST_FILE);
        if !path.is_dir() {
            continue;
        }
        let Some(manifest_mtime) = modified(&manifest_path) else {
            continue;
        };
        let executable_mtime = executable_path(&path, &manifest_path)
            .as_deref()
            .and_then(modified);
        snapshot.insert(
            entry.file_name().to_string_lossy().into_owned(),
            PluginStamp {
                manifest_mtime,
                executable_mtime,
                path,
            },
        );
    }
    snapshot
}

fn diff(known: &Snapshot, current: &Snapshot) -> Vec<PluginChange> {
    let mut changes = Vec::new();
    for (name, stamp) in current {
        let Some(old) = known.get(name) else {
            changes.push(PluginChange {
                plugin_name: name.clone(),
                kind: ChangeKind::Added,
                path: stamp.path.clone(),
            });
            continue;
        };
        if stamp.manifest_mtime != old.manifest_mtime {
            changes.push(PluginChange {
                plugin_name: name.clone(),
                kind: ChangeKind::ManifestUpdated,
                path: stamp.path.join(MANIFEST_FILE),
            });
        } else if matches!(
            (old.executable_mtime, stamp.executable_mtime),
            (Some(before), Some(after)) if before != after
        ) {
            changes.push(PluginChange {
                plugin_name: name.clone(),
                kind: ChangeKind::Modified,
                path: stamp.path.clone(),
            });
        }
    }
    for (name, stamp) in known {
        if !current.contains_key(name) {
            changes.push(PluginChange {
                plugin_name: name.clone(),
                kind: ChangeKind::Removed,
                path: stamp.path.clone(),
            });
        }
    }
    changes
}

fn check(plugins_dir: &Path, known: &Mutex<Snapshot>) -> Vec<PluginChange> {
    let current = scan(plugins_dir);
    let mut known = lock(known);
    let changes = diff(&known, &current);
    *known = current;
    for change in &changes {
        info!(plugin = %change.plugin_name, kind = %change.kind, "plugin change detected");
    }
    changes
}

struct Running {
    stop: Sender<()>,
    poller: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

pub struct PluginWatcher {
    plugins_dir: PathBuf,
    interval: Duration,
    debounce: Duration,
    known: Arc<Mutex<Snapshot>>,
    running: Option<Running>,
}

impl PluginWatcher {
    /// Take the initial snapshot; plugins present now are never reported as added.
    pub fn new(plugins_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        let plugins_dir = plugins_dir.into();
        let known = Arc::new(Mutex::new(scan(&plugins_dir)));
        Self {
            plugins_dir,
            interval,
            debounce: Duration::ZERO,
            known,
            running: None,
        }
    }

    /// Hold changes until the directory has been quiet for `debounce`.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn known_plugins(&self) -> Vec<String> {
        lock(&self.known).keys().cloned().collect()
    }

    /// Scan immediately and return what changed since the last scan.
    pub fn force_rescan(&self) -> Vec<PluginChange> {
        check(&self.plugins_dir, &self.known)
    }

    pub fn start(&mut self, callback: ChangeCallback) -> Result<(), WatcherError> {
        if self.running.is_some() {
            return Err(WatcherError::AlreadyRunning);
        }

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<PluginChange>>();
        let dispatcher = thread::Builder::new()
            .name("plugin-watcher-dispatch".into())
            .spawn(move || {
                for batch in batch_rx {
                    callback(batch);
                }
            })?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let plugins_dir = self.plugins_dir.clone();
        let known = Arc::clone(&self.known);
        let (interval, debounce) = (self.interval, self.debounce);
        let poller = thread::Builder::new()
            .name("plugin-watcher".into())
            .spawn(move || {
                let mut pending = Vec::new();
                let mut last_change: Option<Instant> = None;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let changes = check(&plugins_dir, &known);
                    if !changes.is_empty() {
                        pending.extend(changes);
                        last_change = Some(Instant::now());
                    }
                    let quiet = last_change.is_some_and(|at| at.elapsed() >= debounce);
                    if quiet && !pending.is_empty() {
                        last_change = None;
                        if batch_tx.send(std::mem::take(&mut pending)).is_err() {
                            warn!("watcher dispatcher is gone, stopping");
                            break;
                        }
                    }
                }
                debug!("plugin watcher loop finished");
            });
        let poller = match poller {
            Ok(handle) => handle,
            Err(err) => {
                // batch_tx moved into the failed closure and was dropped, so the
                // dispatcher ends on its own.
                let _ = dispatcher.join();
                return Err(WatcherError::Thread(err));
            }
        };

        info!(
            dir = %self.plugins_dir.display(),
            interval_ms = self.interval.as_millis() as u64,
            "plugin watcher started"
        );
        self.running = Some(Running {
            stop: stop_tx,
            poller,
            dispatcher,
        });
        Ok(())
    }

    /// Stop polling. Changes still waiting out the debounce period are dropped.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.stop.send(());
        let _ = running.poller.join();
        let _ = running.dispatcher.join();
        info!("plugin watcher stopped");
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn add_plugin(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), r#"{"executable": "run.sh"}"#).unwrap();
        fs::write(dir.join("run.sh"), "#!/bin/sh\n").unwrap();
        dir
    }

    fn bump(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn reports_added_plugin_once() {
        let root = TempDir::new().unwrap();
        add_plugin(root.path(), "alpha");
        add_plugin(root.path(), "beta");
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1));
        assert_eq!(watcher.known_plugins(), vec!["alpha", "beta"]);

        add_plugin(root.path(), "gamma");
        let changes = watcher.force_rescan();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].plugin_name, "gamma");
        assert_eq!(changes[0].kind, ChangeKind::Added);

        assert!(watcher.force_rescan().is_empty());
    }

    #[test]
    fn touching_a_manifest_reports_only_that_plugin() {
        let root = TempDir::new().unwrap();
        add_plugin(root.path(), "alpha");
        let beta = add_plugin(root.path(), "beta");
        add_plugin(root.path(), "gamma");
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1));

        bump(&beta.join(MANIFEST_FILE), 10);
        let changes = watcher.force_rescan();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].plugin_name, "beta");
        assert_eq!(changes[0].kind, ChangeKind::ManifestUpdated);
        assert_eq!(changes[0].path, beta.join(MANIFEST_FILE));
    }

    #[test]
    fn executable_and_removal_changes() {
        let root = TempDir::new().unwrap();
        let alpha = add_plugin(root.path(), "alpha");
        let beta = add_plugin(root.path(), "beta");
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1));

        bump(&alpha.join("run.sh"), 10);
        fs::remove_dir_all(&beta).unwrap();
        let changes = watcher.force_rescan();

        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|c| c.plugin_name == "alpha" && c.kind == ChangeKind::Modified));
        assert!(changes
            .iter()
            .any(|c| c.plugin_name == "beta" && c.kind == ChangeKind::Removed));
    }

    #[test]
    fn directories_without_manifest_are_ignored() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("scratch")).unwrap();
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1));
        assert!(watcher.known_plugins().is_empty());
        assert!(watcher.force_rescan().is_empty());
    }

    #[test]
    fn background_poll_delivers_debounced_batch() {
        let root = TempDir::new().unwrap();
        add_plugin(root.path(), "alpha");
        let mut watcher = PluginWatcher::new(root.path(), Duration::from_millis(20))
            .with_debounce(Duration::from_millis(60));

        let (tx, rx) = mpsc::channel();
        watcher
            .start(Box::new(move |batch| {
                let _ = tx.send(batch);
            }))
            .unwrap();
        assert!(matches!(
            watcher.start(Box::new(|_| {})),
            Err(WatcherError::AlreadyRunning)
        ));

        add_plugin(root.path(), "beta");
        add_plugin(root.path(), "gamma");
        let batch = rx.recv_timeout(Duration::from_secs(5)).expect("batch delivered");
        let mut names: Vec<_> = batch.iter().map(|c| c.plugin_name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names, vec!["beta", "gamma"]);

        watcher.stop();
        assert!(!watcher.is_running());
    }
}
