//! `tb-store` — persisted per-user state for ToolBridge.
//!
//! Every store is a JSON file under the configured state directory,
//! guarded by a `parking_lot` lock in memory and an `fs2` file lock on
//! disk. Each `McpServerConfig`, `ToolPermission`, `ToolApproval`,
//! `Checkpoint` and conversation is exclusively owned by one user.

pub mod checkpoint;
pub mod conversations;
mod file;
pub mod permissions;
pub mod servers;
pub mod users;

pub use checkpoint::{CheckpointConfig, CheckpointStore, CheckpointTuple};
pub use conversations::ConversationStore;
pub use permissions::{ApprovalType, PermissionStore};
pub use servers::{McpServerRow, ServerStore};
pub use users::{User, UserStore};
