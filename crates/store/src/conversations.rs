//! Conversation metadata + append-only message log.
//!
//! One conversation per session; `thread_id == session_id`. The assistant
//! turn is appended with the accumulated tool scratchpad as metadata so
//! the UI can replay tool activity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tb_domain::error::{Error, Result};

use crate::file::{load_json, save_json};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    /// Tool-use trace captured while producing an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scratchpad: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConversationState {
    meta: HashMap<String, ConversationMeta>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

/// How much of the first prompt becomes the conversation title.
const TITLE_MAX_CHARS: usize = 35;

/// Derive a title from the first prompt.
pub fn title_from_prompt(prompt: &str) -> String {
    let chars: Vec<char> = prompt.chars().collect();
    if chars.len() > TITLE_MAX_CHARS {
        let head: String = chars[..TITLE_MAX_CHARS].iter().collect();
        format!("{head}...")
    } else {
        prompt.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation store backed by `conversations.json`.
pub struct ConversationStore {
    path: PathBuf,
    state: RwLock<ConversationState>,
}

impl ConversationStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("conversations.json");
        let state: ConversationState = load_json(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn flush(&self, state: &ConversationState) -> Result<()> {
        save_json(&self.path, state)
    }

    pub fn exists(&self, chat_id: &str) -> bool {
        self.state.read().meta.contains_key(chat_id)
    }

    pub fn create(&self, owner_id: &str, chat_id: &str, title: &str) -> Result<ConversationMeta> {
        let meta = ConversationMeta {
            id: chat_id.to_string(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        let mut state = self.state.write();
        state.meta.insert(chat_id.to_string(), meta.clone());
        state.messages.entry(chat_id.to_string()).or_default();
        self.flush(&state)?;
        Ok(meta)
    }

    pub fn owner_of(&self, chat_id: &str) -> Option<String> {
        self.state.read().meta.get(chat_id).map(|m| m.owner_id.clone())
    }

    pub fn get_meta(&self, chat_id: &str) -> Option<ConversationMeta> {
        self.state.read().meta.get(chat_id).cloned()
    }

    /// Conversations for one user, newest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<ConversationMeta> {
        let mut rows: Vec<_> = self
            .state
            .read()
            .meta
            .values()
            .filter(|m| m.owner_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn latest_for_user(&self, user_id: &str) -> Option<String> {
        self.list_for_user(user_id).first().map(|m| m.id.clone())
    }

    /// Append one message to the log.
    pub fn append_message(
        &self,
        chat_id: &str,
        role: &str,
        content: &str,
        scratchpad: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if !state.meta.contains_key(chat_id) {
            return Err(Error::NotFound(format!("conversation {chat_id}")));
        }
        state
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(StoredMessage {
                role: role.to_string(),
                content: content.to_string(),
                scratchpad,
                created_at: Utc::now(),
            });
        self.flush(&state)
    }

    pub fn messages(&self, chat_id: &str) -> Vec<StoredMessage> {
        self.state
            .read()
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn delete(&self, user_id: &str, chat_id: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.meta.get(chat_id) {
            Some(meta) if meta.owner_id == user_id => {
                state.meta.remove(chat_id);
                state.messages.remove(chat_id);
                self.flush(&state)
            }
            Some(_) => Err(Error::Forbidden(
                "conversation belongs to another user".into(),
            )),
            None => Err(Error::NotFound(format!("conversation {chat_id}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn title_truncation() {
        assert_eq!(title_from_prompt("short"), "short");
        let long = "x".repeat(50);
        let title = title_from_prompt(&long);
        assert_eq!(title.chars().count(), 38);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn create_and_append() {
        let (_dir, store) = store();
        store.create("u1", "s1", "weather in Paris").unwrap();
        store
            .append_message("s1", "user", "weather in Paris", Vec::new())
            .unwrap();
        store
            .append_message(
                "s1",
                "assistant",
                "It's sunny.",
                vec!["Tool Used: Weather_get_weather".into()],
            )
            .unwrap();

        let messages = store.messages("s1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].scratchpad.len(), 1);
    }

    #[test]
    fn append_to_unknown_conversation_fails() {
        let (_dir, store) = store();
        assert!(store
            .append_message("nope", "user", "hi", Vec::new())
            .is_err());
    }

    #[test]
    fn ownership_on_delete() {
        let (_dir, store) = store();
        store.create("u1", "s1", "t").unwrap();
        assert!(matches!(store.delete("u2", "s1"), Err(Error::Forbidden(_))));
        store.delete("u1", "s1").unwrap();
        assert!(!store.exists("s1"));
    }

    #[test]
    fn latest_for_user() {
        let (_dir, store) = store();
        assert!(store.latest_for_user("u1").is_none());
        store.create("u1", "s1", "first").unwrap();
        store.create("u1", "s2", "second").unwrap();
        // Both created in the same instant are ordered deterministically;
        // the latest is one of the user's own conversations.
        let latest = store.latest_for_user("u1").unwrap();
        assert!(latest == "s1" || latest == "s2");
        assert!(store.latest_for_user("u2").is_none());
    }
}
