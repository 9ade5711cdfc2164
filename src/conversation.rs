//! Per-thread transcript model and persistence.

pub mod context;
pub mod store;

pub use store::ThreadStore;

use serde::{Deserialize, Serialize};

/// Display name the bridge records for its own transcript entries.
pub const BRIDGE_NAME: &str = "pai-slack-bridge";

/// Speaker classification for a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One utterance in a thread transcript. `ts` is the Slack message
/// timestamp and doubles as the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: Role,
    pub name: String,
    pub text: String,
    pub ts: String,
}

/// Durable transcript for one Slack thread, persisted as
/// `<thread_ts>.json` in the store directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadFile {
    /// Timestamp of the thread's root message; primary key and filename stem.
    pub thread_ts: String,

    /// Channel the thread lives in.
    pub channel: String,

    /// Always equals `messages.len()` after a successful save.
    pub message_count: usize,

    /// Messages in thread order.
    pub messages: Vec<ThreadMessage>,

    /// Compaction placeholder. Stored if present, never synthesized here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Operational flag set by external tooling; preserved, not interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reseeded: Option<bool>,
}

impl ThreadFile {
    pub fn new(thread_ts: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            thread_ts: thread_ts.into(),
            channel: channel.into(),
            message_count: 0,
            messages: Vec::new(),
            summary: None,
            reseeded: None,
        }
    }
}
