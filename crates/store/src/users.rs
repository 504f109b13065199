//! Minimal user records. Authentication itself lives upstream; the
//! gateway only needs stable user IDs to scope ownership.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tb_domain::error::Result;

use crate::file::{load_json, save_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub is_guest: bool,
    pub created_at: DateTime<Utc>,
}

/// User store backed by `users.json`.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("users.json");
        let users: HashMap<String, User> = load_json(&path)?;
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.users.read().get(id).cloned()
    }

    /// Look up a user, creating a guest record on first sight. The auth
    /// layer hands us opaque IDs; everything downstream only needs them
    /// to exist.
    pub fn ensure(&self, id: &str) -> Result<User> {
        if let Some(user) = self.get(id) {
            return Ok(user);
        }
        let user = User {
            id: id.to_string(),
            username: None,
            email: None,
            password_hash: None,
            is_guest: true,
            created_at: Utc::now(),
        };
        let mut users = self.users.write();
        users.insert(id.to_string(), user.clone());
        save_json(&self.path, &*users)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_guest_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path()).unwrap();

        let user = store.ensure("u1").unwrap();
        assert!(user.is_guest);

        let again = store.ensure("u1").unwrap();
        assert_eq!(user.created_at, again.created_at);
    }
}
