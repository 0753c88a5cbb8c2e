//! External change detection for open files.
//!
//! Watches the parent directory of every open file (non-recursive) rather
//! than the files themselves: atomic saves replace the inode, which would
//! silently kill a per-file watch on inotify backends.
//!
//! The engine's own saves are filtered out with a metadata fingerprint.
//! After each internal write the engine acknowledges the path; the next
//! notify event then sees an unchanged fingerprint and is dropped.

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, SystemTime};

const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Change to an open file, as seen from outside the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Content on disk no longer matches what the engine last knew.
    Changed(PathBuf),
    /// The file disappeared (deleted or renamed away).
    Removed(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FsDelta {
    Modified { path: PathBuf },
    Removed { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileFingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

fn file_fingerprint(path: &Path) -> Option<FileFingerprint> {
    let metadata = std::fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some(FileFingerprint {
        len: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    raw_event_rx: mpsc::Receiver<notify::Event>,
    open_files: FxHashSet<PathBuf>,
    open_file_keys: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
    open_file_fingerprints: FxHashMap<PathBuf, FileFingerprint>,
    watched_dirs: FxHashSet<PathBuf>,
}

impl FileWatcher {
    pub fn new() -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                let _ = tx.send(event);
            },
            Config::default().with_poll_interval(WATCHER_POLL_INTERVAL),
        )?;
        Ok(Self {
            watcher,
            raw_event_rx: rx,
            open_files: FxHashSet::default(),
            open_file_keys: FxHashMap::default(),
            open_file_fingerprints: FxHashMap::default(),
            watched_dirs: FxHashSet::default(),
        })
    }

    /// Replace the watched set with the currently open files.
    ///
    /// Directory watches are diffed, not rebuilt, so pane churn inside one
    /// folder never touches the OS watch list.
    pub fn sync_open_files<'a, I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut open_files = FxHashSet::default();
        let mut open_file_keys: FxHashMap<PathBuf, FxHashSet<PathBuf>> = FxHashMap::default();
        let mut open_file_fingerprints: FxHashMap<PathBuf, FileFingerprint> = FxHashMap::default();
        let mut wanted_dirs = FxHashSet::default();

        for path in paths {
            let path = path.to_path_buf();
            if !open_files.insert(path.clone()) {
                continue;
            }

            for key in path_identity_keys(path.as_path()) {
                open_file_keys.entry(key).or_default().insert(path.clone());
            }

            if let Some(existing) = self.open_file_fingerprints.get(&path).cloned() {
                open_file_fingerprints.insert(path.clone(), existing);
            } else if let Some(fingerprint) = file_fingerprint(path.as_path()) {
                open_file_fingerprints.insert(path.clone(), fingerprint);
            }

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    wanted_dirs.insert(parent.to_path_buf());
                }
            }
        }

        for dir in self.watched_dirs.difference(&wanted_dirs) {
            let _ = self.watcher.unwatch(dir);
        }
        for dir in wanted_dirs.difference(&self.watched_dirs) {
            let _ = self.watcher.watch(dir, RecursiveMode::NonRecursive);
        }

        self.open_files = open_files;
        self.open_file_keys = open_file_keys;
        self.open_file_fingerprints = open_file_fingerprints;
        self.watched_dirs = wanted_dirs;
    }

    pub fn open_files(&self) -> &FxHashSet<PathBuf> {
        &self.open_files
    }

    /// Record the on-disk state after one of our own writes so the
    /// resulting notify event is not reported as an external change.
    pub fn acknowledge_write(&mut self, path: &Path) {
        for open_path in self.match_open_paths(path) {
            if let Some(fingerprint) = file_fingerprint(open_path.as_path()) {
                self.open_file_fingerprints.insert(open_path, fingerprint);
            } else {
                self.open_file_fingerprints.remove(&open_path);
            }
        }
    }

    /// Collect everything the backend queued since the last call.
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        let mut removed = FxHashSet::default();
        let mut changed = FxHashSet::default();

        while let Ok(event) = self.raw_event_rx.try_recv() {
            for delta in normalize_notify_event(event) {
                self.route_delta(delta, &mut removed, &mut changed);
            }
        }

        let mut events = Vec::new();

        let mut removed: Vec<_> = removed.into_iter().collect();
        removed.sort_unstable();
        for path in removed {
            events.push(WatchEvent::Removed(path));
        }

        let mut changed: Vec<_> = changed.into_iter().collect();
        changed.sort_unstable();
        for path in changed {
            events.push(WatchEvent::Changed(path));
        }

        events
    }

    fn route_delta(
        &mut self,
        delta: FsDelta,
        removed: &mut FxHashSet<PathBuf>,
        changed: &mut FxHashSet<PathBuf>,
    ) {
        match delta {
            FsDelta::Modified { path } => {
                for open_path in self.match_open_paths(path.as_path()) {
                    if self.refresh_open_file_fingerprint(open_path.as_path()) {
                        changed.insert(open_path);
                    }
                }
            }
            FsDelta::Removed { path } => {
                for open_path in self.match_open_paths(path.as_path()) {
                    // A removal followed by recreation in the same batch
                    // still counts as removed here; the recreate arrives
                    // as its own Modified delta.
                    self.open_file_fingerprints.remove(&open_path);
                    removed.insert(open_path);
                }
            }
        }
    }

    /// Returns true when the on-disk state differs from the remembered one.
    fn refresh_open_file_fingerprint(&mut self, path: &Path) -> bool {
        match file_fingerprint(path) {
            Some(new_fingerprint) => {
                match self
                    .open_file_fingerprints
                    .insert(path.to_path_buf(), new_fingerprint.clone())
                {
                    Some(previous) => previous != new_fingerprint,
                    None => true,
                }
            }
            None => self.open_file_fingerprints.remove(path).is_some(),
        }
    }

    fn match_open_paths(&self, path: &Path) -> FxHashSet<PathBuf> {
        let mut matched = FxHashSet::default();
        for key in path_identity_keys(path) {
            if let Some(paths) = self.open_file_keys.get(&key) {
                matched.extend(paths.iter().cloned());
            }
        }
        matched
    }
}

/// A path may be reported raw or canonicalized depending on the backend;
/// index open files under both forms.
fn path_identity_keys(path: &Path) -> Vec<PathBuf> {
    let mut keys = vec![path.to_path_buf()];
    if let Ok(canonical) = path.canonicalize() {
        if canonical != *path {
            keys.push(canonical);
        }
    }
    keys
}

fn normalize_notify_event(event: notify::Event) -> Vec<FsDelta> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|path| FsDelta::Modified { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| FsDelta::Removed { path })
            .collect(),
        EventKind::Modify(kind) => normalize_modify_event(kind, event.paths),
        _ => Vec::new(),
    }
}

fn normalize_modify_event(kind: ModifyKind, paths: Vec<PathBuf>) -> Vec<FsDelta> {
    match kind {
        ModifyKind::Name(RenameMode::Both) => {
            if paths.len() >= 2 {
                vec![
                    FsDelta::Removed {
                        path: paths[0].clone(),
                    },
                    FsDelta::Modified {
                        path: paths[1].clone(),
                    },
                ]
            } else {
                paths
                    .into_iter()
                    .map(|path| FsDelta::Modified { path })
                    .collect()
            }
        }
        ModifyKind::Name(RenameMode::From) => paths
            .into_iter()
            .map(|path| FsDelta::Removed { path })
            .collect(),
        ModifyKind::Name(RenameMode::To) => paths
            .into_iter()
            .map(|path| FsDelta::Modified { path })
            .collect(),
        ModifyKind::Data(_)
        | ModifyKind::Any
        | ModifyKind::Other
        | ModifyKind::Metadata(_)
        | ModifyKind::Name(_) => paths
            .into_iter()
            .map(|path| FsDelta::Modified { path })
            .collect(),
    }
}
