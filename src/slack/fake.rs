//! In-memory `ChatClient` used by tests.

use crate::error::Result;
use crate::slack::{ChatClient, ThreadReply, UserProfile};

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A message recorded by the fake client.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub channel: String,
    pub thread_ts: Option<String>,
    pub text: String,
}

#[derive(Default)]
pub struct FakeChatClient {
    bot_user_id: String,
    replies: Mutex<Vec<ThreadReply>>,
    users: Mutex<HashMap<String, UserProfile>>,
    im_channels: Mutex<Vec<String>>,
    posts: Mutex<Vec<RecordedPost>>,
    pub describe_user_calls: AtomicUsize,
}

impl FakeChatClient {
    pub fn new(bot_user_id: &str) -> Self {
        Self {
            bot_user_id: bot_user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_replies(self, replies: Vec<ThreadReply>) -> Self {
        *self.replies.lock().expect("lock") = replies;
        self
    }

    pub fn with_user(self, user_id: &str, display_name: &str) -> Self {
        self.users.lock().expect("lock").insert(
            user_id.to_string(),
            UserProfile {
                display_name: Some(display_name.to_string()),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_im_channel(self, channel: &str) -> Self {
        self.im_channels.lock().expect("lock").push(channel.to_string());
        self
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().expect("lock").clone()
    }
}

impl ChatClient for FakeChatClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<()> {
        self.posts.lock().expect("lock").push(RecordedPost {
            channel: channel.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn list_replies(
        &self,
        _channel: &str,
        _ts: &str,
        limit: u16,
    ) -> Result<Vec<ThreadReply>> {
        Ok(self
            .replies
            .lock()
            .expect("lock")
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn describe_user(&self, user_id: &str) -> Result<UserProfile> {
        self.describe_user_calls.fetch_add(1, Ordering::SeqCst);
        self.users
            .lock()
            .expect("lock")
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown user: {user_id}").into())
    }

    async fn is_direct_message(&self, channel: &str) -> Result<bool> {
        Ok(self
            .im_channels
            .lock()
            .expect("lock")
            .iter()
            .any(|im| im == channel))
    }

    async fn whoami(&self) -> Result<String> {
        Ok(self.bot_user_id.clone())
    }
}
