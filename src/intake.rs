//! Slack event intake: filter, resolve thread state, enqueue, acknowledge.
//!
//! Intake never blocks on the agent. It durably enqueues a job, posts an
//! immediate ack, and lets the processor do the rest out of band.

use crate::conversation::{Role, ThreadMessage, ThreadStore, context};
use crate::error::Result;
use crate::queue::{Job, Queue};
use crate::slack::{ChatClient, SlackEvent, SlackEventKind};

use std::sync::Arc;

/// Reply when a mention contains nothing but the mention itself.
const EMPTY_MENTION_REPLY: &str = "Hi! Mention me with a question and I'll get to work.";

/// Fixed apology when enqueueing fails. Tests assert on this string.
pub(crate) const QUEUE_APOLOGY: &str =
    "Sorry, something went wrong while queuing your request. Please try again.";

/// Translates inbound Slack events into queued jobs.
pub struct Intake<C: ChatClient> {
    queue: Arc<Queue>,
    store: Arc<ThreadStore>,
    client: Arc<C>,
    bot_user_id: String,
    allowed_users: Vec<String>,
    allowed_channels: Vec<String>,
}

impl<C: ChatClient> Intake<C> {
    pub fn new(
        queue: Arc<Queue>,
        store: Arc<ThreadStore>,
        client: Arc<C>,
        bot_user_id: String,
        allowed_users: Vec<String>,
        allowed_channels: Vec<String>,
    ) -> Self {
        Self {
            queue,
            store,
            client,
            bot_user_id,
            allowed_users,
            allowed_channels,
        }
    }

    /// Handle one inbound event end to end. Failures apologize in-thread
    /// and drop the event; nothing propagates to the caller.
    pub async fn handle_event(&self, event: SlackEvent) {
        if let Err(error) = self.try_handle(&event).await {
            tracing::error!(%error, ts = %event.ts, "intake failed, dropping event");
            let reply_ts = event.thread_ts.as_deref().unwrap_or(&event.ts);
            if let Err(post_error) = self
                .client
                .post_message(&event.channel, Some(reply_ts), QUEUE_APOLOGY)
                .await
            {
                tracing::warn!(%post_error, "failed to deliver queuing apology");
            }
        }
    }

    async fn try_handle(&self, event: &SlackEvent) -> Result<()> {
        if event.subtype.is_some() {
            tracing::debug!(ts = %event.ts, subtype = ?event.subtype, "ignoring subtyped message");
            return Ok(());
        }
        let Some(user) = event.user.as_deref() else {
            return Ok(());
        };
        let Some(text) = event.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(());
        };

        if !allowed(&self.allowed_users, user) {
            tracing::debug!(user, "user not in allowlist, dropping");
            return Ok(());
        }
        if !allowed(&self.allowed_channels, &event.channel) {
            tracing::debug!(channel = %event.channel, "channel not in allowlist, dropping");
            return Ok(());
        }

        // Plain message events only reach the agent from genuine DMs.
        if event.kind == SlackEventKind::Message
            && !self.client.is_direct_message(&event.channel).await?
        {
            return Ok(());
        }

        let prompt = strip_bot_mention(text, &self.bot_user_id);
        if prompt.is_empty() {
            if event.kind == SlackEventKind::AppMention {
                self.client
                    .post_message(&event.channel, Some(&event.ts), EMPTY_MENTION_REPLY)
                    .await?;
            }
            return Ok(());
        }

        // A threaded reply continues its thread; a top-level message opens
        // a new one rooted at itself.
        let reply_ts = event.thread_ts.as_deref().unwrap_or(&event.ts);

        let thread_context = match event.thread_ts.as_deref() {
            Some(thread_ts) => self.assemble_context(event, thread_ts, user, &prompt).await?,
            None => None,
        };

        let job = Job::new(&event.channel, reply_ts, user, &prompt, thread_context);
        self.queue.submit(&job).await?;
        tracing::info!(job_id = %job.id, channel = %event.channel, user, "job queued");

        let ack = format!("Got it! Processing in background (job: {}...)", &job.id[..8]);
        if let Err(error) = self
            .client
            .post_message(&event.channel, Some(reply_ts), &ack)
            .await
        {
            tracing::warn!(%error, "failed to post ack");
        }
        Ok(())
    }

    /// Record the inbound message in the transcript (seeding from Slack on
    /// first encounter) and render the bounded context document. Returns
    /// `None` when there is nothing prior to the current message.
    async fn assemble_context(
        &self,
        event: &SlackEvent,
        thread_ts: &str,
        user: &str,
        prompt: &str,
    ) -> Result<Option<String>> {
        let name = match self.client.describe_user(user).await {
            Ok(profile) => profile.display_name_or(user),
            Err(error) => {
                tracing::debug!(%error, user, "user lookup failed, recording by id");
                user.to_string()
            }
        };

        if self.store.load(thread_ts).await.is_none() {
            self.store
                .seed_from_slack(thread_ts, &event.channel, &self.bot_user_id, self.client.as_ref())
                .await?;
        }

        let file = self
            .store
            .append(
                thread_ts,
                &event.channel,
                ThreadMessage {
                    role: Role::User,
                    name,
                    text: prompt.to_string(),
                    ts: event.ts.clone(),
                },
            )
            .await?;

        if file.messages.len() <= 1 {
            return Ok(None);
        }
        Ok(Some(context::format_context(
            &file,
            context::DEFAULT_CONTEXT_BUDGET,
        )))
    }
}

/// Empty allowlist admits everyone; otherwise membership is required.
fn allowed(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|entry| entry == value)
}

/// Remove every `<@BOT_ID>` token from the text. Slack renders mentions
/// with uppercase IDs, so no case folding is needed.
fn strip_bot_mention(text: &str, bot_user_id: &str) -> String {
    let mention = format!("<@{bot_user_id}>");
    text.replace(&mention, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::BRIDGE_NAME;
    use crate::slack::ThreadReply;
    use crate::slack::fake::FakeChatClient;

    struct Harness {
        _dir: tempfile::TempDir,
        queue: Arc<Queue>,
        store: Arc<ThreadStore>,
        client: Arc<FakeChatClient>,
    }

    fn harness(client: FakeChatClient) -> (Harness, Intake<FakeChatClient>) {
        harness_with_lists(client, Vec::new(), Vec::new())
    }

    fn harness_with_lists(
        client: FakeChatClient,
        allowed_users: Vec<String>,
        allowed_channels: Vec<String>,
    ) -> (Harness, Intake<FakeChatClient>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(Queue::new(dir.path().join("queue")));
        queue.ensure_dirs().expect("dirs");
        let store = Arc::new(ThreadStore::new(dir.path().join("threads")).expect("store"));
        let client = Arc::new(client);
        let intake = Intake::new(
            queue.clone(),
            store.clone(),
            client.clone(),
            "U_BRIDGE".to_string(),
            allowed_users,
            allowed_channels,
        );
        (
            Harness {
                _dir: dir,
                queue,
                store,
                client,
            },
            intake,
        )
    }

    fn mention(text: &str) -> SlackEvent {
        SlackEvent {
            kind: SlackEventKind::AppMention,
            channel: "C1".to_string(),
            user: Some("U1".to_string()),
            text: Some(text.to_string()),
            ts: "1700000001.000100".to_string(),
            thread_ts: None,
            subtype: None,
        }
    }

    async fn pending_jobs(queue: &Queue) -> Vec<Job> {
        let mut jobs = Vec::new();
        for name in queue.scan_pending().await.expect("scan") {
            let raw = std::fs::read(queue.pending_dir().join(name)).expect("read");
            jobs.push(serde_json::from_slice(&raw).expect("parse"));
        }
        jobs
    }

    #[tokio::test]
    async fn mention_becomes_job_and_ack() {
        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE"));
        intake.handle_event(mention("<@U_BRIDGE> run the tests")).await;

        let jobs = pending_jobs(&h.queue).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].prompt, "run the tests");
        assert_eq!(jobs[0].channel, "C1");
        // Top-level mention opens a new thread rooted at the message itself.
        assert_eq!(jobs[0].thread_ts, "1700000001.000100");
        assert_eq!(jobs[0].user, "U1");
        assert!(jobs[0].thread_context.is_none());

        let posts = h.client.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(
            posts[0].text,
            format!("Got it! Processing in background (job: {}...)", &jobs[0].id[..8])
        );
        assert_eq!(posts[0].thread_ts.as_deref(), Some("1700000001.000100"));
    }

    #[tokio::test]
    async fn subtyped_textless_and_userless_events_are_dropped() {
        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE"));

        let mut event = mention("hello");
        event.subtype = Some("message_changed".to_string());
        intake.handle_event(event).await;

        let mut event = mention("hello");
        event.user = None;
        intake.handle_event(event).await;

        let mut event = mention("hello");
        event.text = Some("   ".to_string());
        intake.handle_event(event).await;

        assert!(pending_jobs(&h.queue).await.is_empty());
        assert!(h.client.posts().is_empty());
    }

    #[tokio::test]
    async fn allowlists_drop_silently() {
        let (h, intake) = harness_with_lists(
            FakeChatClient::new("U_BRIDGE"),
            vec!["U_SOMEONE_ELSE".to_string()],
            Vec::new(),
        );
        intake.handle_event(mention("hello")).await;
        assert!(pending_jobs(&h.queue).await.is_empty());
        assert!(h.client.posts().is_empty());

        let (h, intake) = harness_with_lists(
            FakeChatClient::new("U_BRIDGE"),
            Vec::new(),
            vec!["C_OTHER".to_string()],
        );
        intake.handle_event(mention("hello")).await;
        assert!(pending_jobs(&h.queue).await.is_empty());
        assert!(h.client.posts().is_empty());
    }

    #[tokio::test]
    async fn plain_messages_require_a_dm_conversation() {
        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE"));
        let mut event = mention("hello from a channel");
        event.kind = SlackEventKind::Message;
        intake.handle_event(event).await;
        assert!(pending_jobs(&h.queue).await.is_empty());

        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE").with_im_channel("D1"));
        let mut event = mention("hello from a dm");
        event.kind = SlackEventKind::Message;
        event.channel = "D1".to_string();
        intake.handle_event(event).await;
        let jobs = pending_jobs(&h.queue).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].prompt, "hello from a dm");
    }

    #[tokio::test]
    async fn empty_mention_gets_a_nudge_and_empty_dm_is_silent() {
        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE"));
        intake.handle_event(mention("<@U_BRIDGE>")).await;
        assert!(pending_jobs(&h.queue).await.is_empty());
        let posts = h.client.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, EMPTY_MENTION_REPLY);

        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE").with_im_channel("D1"));
        let mut event = mention("<@U_BRIDGE>");
        event.kind = SlackEventKind::Message;
        event.channel = "D1".to_string();
        intake.handle_event(event).await;
        assert!(pending_jobs(&h.queue).await.is_empty());
        assert!(h.client.posts().is_empty());
    }

    #[tokio::test]
    async fn threaded_reply_seeds_and_carries_context() {
        let client = FakeChatClient::new("U_BRIDGE")
            .with_user("U1", "alice")
            .with_replies(vec![
                ThreadReply {
                    ts: "1700000000.000001".to_string(),
                    user: Some("U1".to_string()),
                    bot_id: None,
                    text: Some("original question".to_string()),
                },
                ThreadReply {
                    ts: "1700000000.000002".to_string(),
                    user: Some("U_BRIDGE".to_string()),
                    bot_id: Some("B_BRIDGE".to_string()),
                    text: Some("first answer".to_string()),
                },
            ]);
        let (h, intake) = harness(client);

        let mut event = mention("<@U_BRIDGE> follow-up question");
        event.thread_ts = Some("1700000000.000001".to_string());
        intake.handle_event(event).await;

        let jobs = pending_jobs(&h.queue).await;
        assert_eq!(jobs.len(), 1);
        // Threaded reply continues the existing thread.
        assert_eq!(jobs[0].thread_ts, "1700000000.000001");

        let rendered = jobs[0].thread_context.as_deref().expect("context");
        assert!(rendered.contains("original question"));
        assert!(rendered.contains("first answer"));
        assert!(rendered.contains("follow-up question"));
        assert!(rendered.contains(BRIDGE_NAME));
        assert!(rendered.contains(context::INJECTION_FENCE));

        let file = h.store.load("1700000000.000001").await.expect("transcript");
        assert_eq!(file.messages.len(), 3);
        assert_eq!(file.messages[2].name, "alice");
    }

    #[tokio::test]
    async fn context_is_skipped_when_nothing_came_before() {
        // The platform only returns the triggering message itself, so the
        // appended message dedups against the seed and the transcript holds
        // a single entry.
        let client = FakeChatClient::new("U_BRIDGE")
            .with_user("U1", "alice")
            .with_replies(vec![ThreadReply {
                ts: "1700000001.000100".to_string(),
                user: Some("U1".to_string()),
                bot_id: None,
                text: Some("lone question".to_string()),
            }]);
        let (h, intake) = harness(client);

        let mut event = mention("<@U_BRIDGE> lone question");
        event.thread_ts = Some("1700000001.000100".to_string());
        intake.handle_event(event).await;

        let jobs = pending_jobs(&h.queue).await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].thread_context.is_none());
    }

    #[tokio::test]
    async fn repeated_event_dedups_against_the_transcript() {
        let client = FakeChatClient::new("U_BRIDGE").with_user("U1", "alice");
        let (h, intake) = harness(client);

        let mut event = mention("<@U_BRIDGE> same message");
        event.thread_ts = Some("1700000000.000001".to_string());
        intake.handle_event(event.clone()).await;
        intake.handle_event(event).await;

        let file = h.store.load("1700000000.000001").await.expect("transcript");
        assert_eq!(file.messages.len(), 1);
        // Both deliveries still queued a job; dedup only guards the transcript.
        assert_eq!(pending_jobs(&h.queue).await.len(), 2);
    }

    #[tokio::test]
    async fn enqueue_failure_apologizes_in_thread() {
        let (h, intake) = harness(FakeChatClient::new("U_BRIDGE"));
        // Make every submit fail by replacing the pending directory with a file.
        std::fs::remove_dir_all(h.queue.pending_dir()).expect("rm");
        std::fs::write(h.queue.pending_dir(), b"not a directory").expect("block");

        intake.handle_event(mention("hello")).await;

        let posts = h.client.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, QUEUE_APOLOGY);
        assert_eq!(posts[0].thread_ts.as_deref(), Some("1700000001.000100"));
    }
}
