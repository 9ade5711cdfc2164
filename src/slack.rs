//! Slack client capability surface consumed by the bridge core.

pub mod adapter;
#[cfg(test)]
pub(crate) mod fake;

pub use adapter::SlackAdapter;

use crate::error::Result;
use futures::Stream;
use std::pin::Pin;

/// Inbound event stream type.
pub type EventStream = Pin<Box<dyn Stream<Item = SlackEvent> + Send>>;

/// Kind of inbound Slack event the bridge reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlackEventKind {
    /// A plain message event; only relevant when the conversation is a DM.
    Message,
    /// The bot was @-mentioned, in any conversation.
    AppMention,
}

/// Inbound Slack event, kept raw enough that intake owns the filtering
/// rules (subtype, allowlists, DM confirmation).
#[derive(Debug, Clone)]
pub struct SlackEvent {
    pub kind: SlackEventKind,
    pub channel: String,
    pub user: Option<String>,
    pub text: Option<String>,
    /// Timestamp of this message.
    pub ts: String,
    /// Present when the message was posted inside an existing thread.
    pub thread_ts: Option<String>,
    /// Subtype marker for non-user messages (edits, joins, bot posts).
    pub subtype: Option<String>,
}

/// One message fetched from a thread's reply history.
#[derive(Debug, Clone)]
pub struct ThreadReply {
    pub ts: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub text: Option<String>,
}

/// User identity fields from `users.info`; any may be missing.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub real_name: Option<String>,
    pub name: Option<String>,
}

impl UserProfile {
    /// Resolution order: profile display name, real name, username, then
    /// the raw user id.
    pub fn display_name_or(&self, user_id: &str) -> String {
        [&self.display_name, &self.real_name, &self.name]
            .into_iter()
            .filter_map(|candidate| candidate.as_deref())
            .map(str::trim)
            .find(|candidate| !candidate.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user_id.to_string())
    }
}

/// Capability set the core consumes: post, thread history, identity
/// lookup, conversation shape, own identity.
pub trait ChatClient: Send + Sync + 'static {
    /// Post `text` to a channel, threading under `thread_ts` when given.
    fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch up to `limit` messages of the thread rooted at `ts`,
    /// inclusive of the root, in thread order.
    fn list_replies(
        &self,
        channel: &str,
        ts: &str,
        limit: u16,
    ) -> impl std::future::Future<Output = Result<Vec<ThreadReply>>> + Send;

    /// Look up a user's identity fields.
    fn describe_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<UserProfile>> + Send;

    /// Whether `channel` is a direct-message conversation.
    fn is_direct_message(
        &self,
        channel: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// The bridge's own bot-user id.
    fn whoami(&self) -> impl std::future::Future<Output = Result<String>> + Send;
}

#[cfg(test)]
mod tests {
    use super::UserProfile;

    #[test]
    fn display_name_resolution_order() {
        let profile = UserProfile {
            display_name: Some("Display".to_string()),
            real_name: Some("Real".to_string()),
            name: Some("username".to_string()),
        };
        assert_eq!(profile.display_name_or("U1"), "Display");

        let profile = UserProfile {
            display_name: Some("  ".to_string()),
            real_name: None,
            name: Some("username".to_string()),
        };
        assert_eq!(profile.display_name_or("U1"), "username");

        assert_eq!(UserProfile::default().display_name_or("U1"), "U1");
    }
}
