//! Filesystem watcher registry.
//!
//! `watch` expands its glob patterns against the workspace root at
//! registration time and attaches one OS-level watcher per `watcherId`.
//! Change events are debounced until the file has been quiet for the
//! configured settle window; removals flush immediately as `rename`.
//! When the last subscriber of a watcher disconnects, the OS watcher is
//! closed and the record dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::Event;
use crate::error::{AgentError, OpResult};
use crate::ids;
use crate::registry::{self, Connections};

struct WatcherRecord {
    subscribers: HashSet<String>,
    /// Dropping this stops the OS watcher and, through its event callback,
    /// ends the debounce task.
    _watcher: RecommendedWatcher,
}

pub struct WatcherRegistry {
    connections: Arc<Connections>,
    workspace: PathBuf,
    workspace_canonical: PathBuf,
    stability: Duration,
    poll: Duration,
    watchers: DashMap<String, WatcherRecord>,
    client_watchers: DashMap<String, HashSet<String>>,
}

impl WatcherRegistry {
    pub fn new(
        connections: Arc<Connections>,
        workspace: PathBuf,
        stability: Duration,
        poll: Duration,
    ) -> Self {
        let workspace_canonical = workspace.canonicalize().unwrap_or_else(|_| workspace.clone());
        WatcherRegistry {
            connections,
            workspace,
            workspace_canonical,
            stability,
            poll,
            watchers: DashMap::new(),
            client_watchers: DashMap::new(),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Register a watcher over the files currently matching `patterns`.
    /// Two registrations with identical patterns stay independent.
    pub fn watch(self: &Arc<Self>, ws_id: &str, patterns: &[String]) -> OpResult<String> {
        let mut paths = Vec::new();
        for pattern in patterns {
            let full = self.workspace.join(pattern);
            let full = full.to_string_lossy();
            let matches = glob::glob(&full)
                .map_err(|e| AgentError::Watch(format!("invalid pattern {pattern:?}: {e}")))?;
            for entry in matches {
                match entry {
                    Ok(path) => paths.push(path),
                    Err(err) => warn!(%err, pattern, "skipping unreadable glob match"),
                }
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(err) => warn!(%err, "watcher backend error"),
            },
        )
        .map_err(AgentError::watch)?;

        for path in &paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| AgentError::Watch(format!("cannot watch {}: {e}", path.display())))?;
        }

        let watcher_id = ids::token();
        self.watchers.insert(
            watcher_id.clone(),
            WatcherRecord {
                subscribers: HashSet::from([ws_id.to_string()]),
                _watcher: watcher,
            },
        );
        self.client_watchers
            .entry(ws_id.to_string())
            .or_default()
            .insert(watcher_id.clone());

        debug!(%watcher_id, files = paths.len(), "watcher registered");
        tokio::spawn(self.clone().debounce_loop(watcher_id.clone(), event_rx));
        Ok(watcher_id)
    }

    async fn debounce_loop(
        self: Arc<Self>,
        watcher_id: String,
        mut events: mpsc::UnboundedReceiver<notify::Event>,
    ) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event.kind {
                        EventKind::Remove(_) => {
                            for path in event.paths {
                                pending.remove(&path);
                                self.emit(&watcher_id, "rename", &path);
                            }
                        }
                        EventKind::Access(_) => {}
                        // Create, Modify and anything the backend could not
                        // classify all count as a write in progress.
                        _ => {
                            let now = Instant::now();
                            for path in event.paths {
                                pending.insert(path, now);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let settled: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, last)| now.duration_since(**last) >= self.stability)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in settled {
                        pending.remove(&path);
                        self.emit(&watcher_id, "change", &path);
                    }
                }
            }
        }
        debug!(%watcher_id, "watcher task finished");
    }

    fn emit(&self, watcher_id: &str, kind: &str, path: &Path) {
        let subscribers = match self.watchers.get(watcher_id) {
            Some(record) => record.subscribers.clone(),
            None => return,
        };
        let filename = path
            .strip_prefix(&self.workspace_canonical)
            .or_else(|_| path.strip_prefix(&self.workspace))
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let event = Event::new(
            "file-change",
            json!({ "watcherId": watcher_id, "event": kind, "filename": filename }),
        );
        let text = event.to_json();
        for ws in &subscribers {
            registry::send_text(&self.connections, ws, &text);
        }
    }

    /// Drop every watcher subscription of a disconnecting client; watchers
    /// left without subscribers are closed immediately.
    pub fn unsubscribe(&self, ws_id: &str) {
        let Some((_, watcher_ids)) = self.client_watchers.remove(ws_id) else {
            return;
        };
        for watcher_id in watcher_ids {
            let mut empty = false;
            if let Some(mut record) = self.watchers.get_mut(&watcher_id) {
                record.subscribers.remove(ws_id);
                empty = record.subscribers.is_empty();
            }
            if empty {
                self.watchers.remove(&watcher_id);
                debug!(%watcher_id, "watcher closed, last subscriber gone");
            }
        }
    }

    /// Shutdown path: close everything.
    pub fn clear(&self) {
        self.watchers.clear();
        self.client_watchers.clear();
    }
}
