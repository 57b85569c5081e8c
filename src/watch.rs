use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::source;
use crate::system::System;

// ---------------------------------------------------------------------------
// File watcher. Observes the canonical base directories of watch-enabled
// filesystem specs and applies debounced create/update/delete transitions
// against the store. Bundled sources are read-only and never watched.
// ---------------------------------------------------------------------------

/// Quiet interval: a path's events are coalesced until this much time passes
/// without another one.
pub const DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Upsert,
    Delete,
}

/// Keeps the watcher alive. Dropping it (or calling `stop`) cancels pending
/// debounce timers, lets an in-flight application finish, and ignores
/// everything that arrives afterwards.
pub struct WatchHandle {
    watcher: Option<RecommendedWatcher>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the watcher closes the event channel; the debounce loop
        // sees the disconnect and exits after finishing its current batch.
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start watching every root implied by the system's watch-enabled specs.
/// Returns `None` when nothing is watchable or the OS watcher fails.
pub fn start(system: Arc<System>) -> Option<WatchHandle> {
    let mut roots: BTreeSet<PathBuf> = BTreeSet::new();
    for spec in system.watched_specs() {
        let prefix = spec.base_prefix.trim_end_matches('/');
        let base = Path::new(prefix);
        let root = if base.is_dir() {
            base.to_path_buf()
        } else {
            match base.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => {
                    tracing::warn!(spec = %spec.raw, "watch root does not exist; not watching");
                    continue;
                }
            }
        };
        system.stats.set_watching(&spec.raw, true);
        roots.insert(root);
    }
    if roots.is_empty() {
        return None;
    }

    let (tx, rx) = mpsc::channel::<Event>();
    let mut watcher = match RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("failed to create file watcher: {e}");
            return None;
        }
    };

    for root in &roots {
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => tracing::info!(root = %root.display(), "watching"),
            Err(e) => tracing::warn!(root = %root.display(), "failed to watch: {e}"),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let system = Arc::clone(&system);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || debounce_loop(rx, system, stop))
    };

    Some(WatchHandle {
        watcher: Some(watcher),
        stop,
        thread: Some(thread),
    })
}

/// Coalesce raw events per path and apply each path's final state once its
/// quiet interval elapses. A later delete supersedes a pending create or
/// modify; a modify after a create just resets the timer.
fn debounce_loop(rx: mpsc::Receiver<Event>, system: Arc<System>, stop: Arc<AtomicBool>) {
    let debounce = Duration::from_millis(DEBOUNCE_MS);
    let mut pending: HashMap<PathBuf, (PendingKind, Instant)> = HashMap::new();

    loop {
        // Sleep only until the earliest pending deadline, so a busy channel
        // cannot postpone the flush below past a path's own quiet interval.
        let wait = pending
            .values()
            .map(|(_, at)| (*at + debounce).saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(debounce);

        match rx.recv_timeout(wait) {
            Ok(event) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let kind = match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => Some(PendingKind::Upsert),
                    EventKind::Remove(_) => Some(PendingKind::Delete),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, (kind, now));
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        // Flush every path whose own interval elapsed, on every iteration —
        // events for other paths must not starve a quiet one.
        let now = Instant::now();
        let ready: Vec<(PathBuf, PendingKind)> = pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= debounce)
            .map(|(path, (kind, _))| (path.clone(), *kind))
            .collect();
        for (path, kind) in ready {
            pending.remove(&path);
            if stop.load(Ordering::SeqCst) {
                return;
            }
            apply(&system, &path, kind);
        }
    }
}

fn apply(system: &System, path: &Path, kind: PendingKind) {
    if path.is_dir() {
        return;
    }

    // Canonicalize exactly the way ingestion does, so removals hit the rows
    // ingestion wrote.
    let file_id = source::canonical_file_id(path);
    let matching: Vec<String> = system
        .watched_specs()
        .filter(|spec| spec.pattern.is_match(&file_id))
        .map(|spec| spec.raw.clone())
        .collect();
    if matching.is_empty() {
        return;
    }
    for raw in &matching {
        system.stats.record_watch_event(raw);
    }

    match kind {
        PendingKind::Delete => {
            remove(system, path, &matching);
        }
        PendingKind::Upsert => {
            if path.exists() {
                tracing::debug!(file = %file_id, "applying debounced upsert");
                system.upsert_path(path);
            } else {
                // The file vanished before its timer fired.
                remove(system, path, &matching);
            }
        }
    }
}

fn remove(system: &System, path: &Path, matching: &[String]) {
    if system.remove_path(path) > 0 {
        for raw in matching {
            system.stats.record_watch_remove(raw);
        }
    }
}
