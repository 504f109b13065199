//! Durable graph checkpoints keyed by `(user_id, thread_id, checkpoint_id)`.
//!
//! Keyspace:
//! - `checkpoint:<user>:<thread>:<cp_id>` — serialized
//!   `{checkpoint, metadata, parent_config}`.
//! - `thread:<user>:<thread>:history` — checkpoint IDs ordered by a
//!   monotonic wall-clock score; the latest entry is the resume point.
//! - `checkpoint:<user>:<thread>:<cp_id>:writes` — pending partial writes
//!   keyed `task_id:channel_idx`, surviving until the next full checkpoint.
//!
//! Keys are namespaced by user so threads can never collide across
//! tenants. State blobs are opaque serde values; a blob that fails to
//! deserialize is logged and treated as absent. The store is process-local
//! with a file mirror; multi-process deployments promote the same keyspace
//! to a shared KV.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tb_domain::error::Result;

use crate::file::{load_json, save_json};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Addressing for checkpoint operations. `thread_id == session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub user_id: String,
    pub thread_id: String,
    /// Explicit checkpoint; `None` means the latest on the thread.
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    pub fn latest(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            checkpoint_id: None,
        }
    }
}

/// One pending partial write: `(task_id, channel, value)`.
pub type PendingWrite = (String, String, Value);

/// A restored checkpoint plus its pending writes.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Value,
    pub metadata: Value,
    pub parent_config: Option<Value>,
    pub pending_writes: Vec<PendingWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCheckpoint {
    checkpoint: Value,
    metadata: Value,
    #[serde(default)]
    parent_config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWrite {
    task_id: String,
    channel: String,
    value: Value,
    #[serde(default)]
    task_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointSpace {
    /// `checkpoint:<user>:<thread>:<cp_id>` → blob.
    checkpoints: HashMap<String, StoredCheckpoint>,
    /// `thread:<user>:<thread>:history` → `(score, cp_id)` pairs.
    history: HashMap<String, Vec<(i64, String)>>,
    /// `…:writes` → field → write.
    writes: HashMap<String, HashMap<String, StoredWrite>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CheckpointStore {
    path: PathBuf,
    space: RwLock<CheckpointSpace>,
}

fn checkpoint_key(config: &CheckpointConfig, cp_id: &str) -> String {
    format!("checkpoint:{}:{}:{cp_id}", config.user_id, config.thread_id)
}

fn history_key(config: &CheckpointConfig) -> String {
    format!("thread:{}:{}:history", config.user_id, config.thread_id)
}

fn writes_key(config: &CheckpointConfig, cp_id: &str) -> String {
    format!(
        "checkpoint:{}:{}:{cp_id}:writes",
        config.user_id, config.thread_id
    )
}

/// Strip runtime-only fields (live handles, callbacks) that must never be
/// serialized into a parent config.
fn sanitize_parent_config(mut config: Value) -> Value {
    if let Some(map) = config.as_object_mut() {
        map.remove("callbacks");
        map.remove("tool_registry");
    }
    config
}

impl CheckpointStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("checkpoints.json");
        let space: CheckpointSpace = load_json(&path).unwrap_or_else(|e| {
            tracing::error!(error = %e, "checkpoint space unreadable, starting empty");
            CheckpointSpace::default()
        });
        Ok(Self {
            path,
            space: RwLock::new(space),
        })
    }

    fn flush(&self, space: &CheckpointSpace) {
        if let Err(e) = save_json(&self.path, space) {
            tracing::error!(error = %e, "failed to flush checkpoint space");
        }
    }

    /// Latest checkpoint ID on a thread, by history score.
    fn latest_id(space: &CheckpointSpace, config: &CheckpointConfig) -> Option<String> {
        let entries = space.history.get(&history_key(config))?;
        entries
            .iter()
            .max_by_key(|(score, _)| *score)
            .map(|(_, id)| id.clone())
    }

    /// Fetch a checkpoint (explicit or latest) with its pending writes.
    pub fn get_tuple(&self, config: &CheckpointConfig) -> Option<CheckpointTuple> {
        let space = self.space.read();
        let cp_id = match &config.checkpoint_id {
            Some(id) => id.clone(),
            None => Self::latest_id(&space, config)?,
        };

        let stored = space.checkpoints.get(&checkpoint_key(config, &cp_id))?;

        let pending_writes = space
            .writes
            .get(&writes_key(config, &cp_id))
            .map(|fields| {
                let mut sorted: Vec<_> = fields.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                sorted
                    .into_iter()
                    .map(|(_, w)| (w.task_id.clone(), w.channel.clone(), w.value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Some(CheckpointTuple {
            config: CheckpointConfig {
                user_id: config.user_id.clone(),
                thread_id: config.thread_id.clone(),
                checkpoint_id: Some(cp_id),
            },
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent_config: stored.parent_config.clone(),
            pending_writes,
        })
    }

    /// Newest-first iteration over a thread's checkpoints.
    pub fn list(&self, config: &CheckpointConfig, limit: usize) -> Vec<CheckpointTuple> {
        let space = self.space.read();
        let Some(entries) = space.history.get(&history_key(config)) else {
            return Vec::new();
        };
        let mut ordered: Vec<_> = entries.clone();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        ordered
            .into_iter()
            .take(limit)
            .filter_map(|(_, cp_id)| {
                self.get_tuple(&CheckpointConfig {
                    user_id: config.user_id.clone(),
                    thread_id: config.thread_id.clone(),
                    checkpoint_id: Some(cp_id),
                })
            })
            .collect()
    }

    /// Store a checkpoint and advance the thread's history index.
    ///
    /// Returns the config addressing the stored checkpoint.
    pub fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint_id: &str,
        checkpoint: Value,
        metadata: Value,
        parent_config: Option<Value>,
    ) -> CheckpointConfig {
        let mut space = self.space.write();
        space.checkpoints.insert(
            checkpoint_key(config, checkpoint_id),
            StoredCheckpoint {
                checkpoint,
                metadata,
                parent_config: parent_config.map(sanitize_parent_config),
            },
        );
        let score = Utc::now().timestamp_micros();
        space
            .history
            .entry(history_key(config))
            .or_default()
            .push((score, checkpoint_id.to_string()));
        // A full checkpoint supersedes the previous pending writes.
        space.writes.remove(&writes_key(config, checkpoint_id));
        self.flush(&space);

        CheckpointConfig {
            user_id: config.user_id.clone(),
            thread_id: config.thread_id.clone(),
            checkpoint_id: Some(checkpoint_id.to_string()),
        }
    }

    /// Record partial task writes against an existing checkpoint. Fields
    /// are deterministic (`task_id:idx`) so replays overwrite in place.
    pub fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, Value)],
        task_id: &str,
        task_path: &str,
    ) {
        let Some(cp_id) = config.checkpoint_id.as_deref() else {
            tracing::warn!("put_writes called without a checkpoint id");
            return;
        };
        let mut space = self.space.write();
        let fields = space.writes.entry(writes_key(config, cp_id)).or_default();
        for (idx, (channel, value)) in writes.iter().enumerate() {
            fields.insert(
                format!("{task_id}:{idx}"),
                StoredWrite {
                    task_id: task_id.to_string(),
                    channel: channel.clone(),
                    value: value.clone(),
                    task_path: task_path.to_string(),
                },
            );
        }
        self.flush(&space);
    }

    /// Drop every checkpoint on a thread (conversation deletion).
    pub fn delete_thread(&self, user_id: &str, thread_id: &str) {
        let config = CheckpointConfig::latest(user_id, thread_id);
        let mut space = self.space.write();
        let prefix = format!("checkpoint:{user_id}:{thread_id}:");
        space.checkpoints.retain(|k, _| !k.starts_with(&prefix));
        space.writes.retain(|k, _| !k.starts_with(&prefix));
        space.history.remove(&history_key(&config));
        self.flush(&space);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        let state = json!({ "messages": [{ "role": "user", "content": "hi" }] });

        store.put(&config, "cp1", state.clone(), json!({ "step": 1 }), None);

        let tuple = store.get_tuple(&config).unwrap();
        assert_eq!(tuple.checkpoint, state);
        assert_eq!(tuple.metadata, json!({ "step": 1 }));
        assert_eq!(tuple.config.checkpoint_id.as_deref(), Some("cp1"));
        assert!(tuple.pending_writes.is_empty());
    }

    #[test]
    fn latest_follows_history_order() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        store.put(&config, "cp1", json!({"n": 1}), json!({}), None);
        store.put(&config, "cp2", json!({"n": 2}), json!({}), None);

        let tuple = store.get_tuple(&config).unwrap();
        assert_eq!(tuple.config.checkpoint_id.as_deref(), Some("cp2"));
        assert_eq!(tuple.checkpoint, json!({"n": 2}));
    }

    #[test]
    fn explicit_id_fetches_older_checkpoint() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        store.put(&config, "cp1", json!({"n": 1}), json!({}), None);
        store.put(&config, "cp2", json!({"n": 2}), json!({}), None);

        let explicit = CheckpointConfig {
            checkpoint_id: Some("cp1".into()),
            ..config
        };
        assert_eq!(store.get_tuple(&explicit).unwrap().checkpoint, json!({"n": 1}));
    }

    #[test]
    fn pending_writes_roundtrip_and_order() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        let stored = store.put(&config, "cp1", json!({}), json!({}), None);

        store.put_writes(
            &stored,
            &[
                ("messages".into(), json!({"result": "a"})),
                ("messages".into(), json!({"result": "b"})),
            ],
            "task1",
            "",
        );

        let tuple = store.get_tuple(&config).unwrap();
        assert_eq!(tuple.pending_writes.len(), 2);
        assert_eq!(tuple.pending_writes[0].2, json!({"result": "a"}));
        assert_eq!(tuple.pending_writes[1].2, json!({"result": "b"}));
    }

    #[test]
    fn new_full_checkpoint_supersedes_writes() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        let stored = store.put(&config, "cp1", json!({}), json!({}), None);
        store.put_writes(&stored, &[("messages".into(), json!(1))], "task1", "");

        store.put(&config, "cp2", json!({}), json!({}), None);
        let tuple = store.get_tuple(&config).unwrap();
        assert!(tuple.pending_writes.is_empty());
    }

    #[test]
    fn threads_are_namespaced_by_user() {
        let (_dir, store) = store();
        let a = CheckpointConfig::latest("u1", "shared-thread");
        let b = CheckpointConfig::latest("u2", "shared-thread");
        store.put(&a, "cp1", json!({"owner": "u1"}), json!({}), None);

        assert!(store.get_tuple(&b).is_none());
        assert_eq!(
            store.get_tuple(&a).unwrap().checkpoint,
            json!({"owner": "u1"})
        );
    }

    #[test]
    fn list_is_newest_first() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        store.put(&config, "cp1", json!({"n": 1}), json!({}), None);
        store.put(&config, "cp2", json!({"n": 2}), json!({}), None);
        store.put(&config, "cp3", json!({"n": 3}), json!({}), None);

        let list = store.list(&config, 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].config.checkpoint_id.as_deref(), Some("cp3"));
        assert_eq!(list[1].config.checkpoint_id.as_deref(), Some("cp2"));
    }

    #[test]
    fn parent_config_is_sanitized() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        store.put(
            &config,
            "cp1",
            json!({}),
            json!({}),
            Some(json!({
                "thread_id": "t1",
                "callbacks": ["live handle"],
                "tool_registry": {"not": "serializable"}
            })),
        );

        let parent = store.get_tuple(&config).unwrap().parent_config.unwrap();
        assert_eq!(parent, json!({ "thread_id": "t1" }));
    }

    #[test]
    fn survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig::latest("u1", "t1");
        {
            let store = CheckpointStore::new(dir.path()).unwrap();
            store.put(&config, "cp1", json!({"persisted": true}), json!({}), None);
        }
        let reloaded = CheckpointStore::new(dir.path()).unwrap();
        assert_eq!(
            reloaded.get_tuple(&config).unwrap().checkpoint,
            json!({"persisted": true})
        );
    }

    #[test]
    fn delete_thread_removes_everything() {
        let (_dir, store) = store();
        let config = CheckpointConfig::latest("u1", "t1");
        let stored = store.put(&config, "cp1", json!({}), json!({}), None);
        store.put_writes(&stored, &[("messages".into(), json!(1))], "task1", "");

        store.delete_thread("u1", "t1");
        assert!(store.get_tuple(&config).is_none());
        assert!(store.list(&config, 10).is_empty());
    }
}
