//! Slack Socket Mode adapter using slack-morphism.

use crate::slack::{ChatClient, EventStream, SlackEvent, SlackEventKind, ThreadReply, UserProfile};

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct AdapterState {
    event_tx: mpsc::Sender<SlackEvent>,
    bot_user_id: String,
}

/// Slack adapter. One shared HTTP client (with its hyper connection pool)
/// serves all REST calls; the Socket Mode listener owns a separate client
/// for its persistent WebSocket.
pub struct SlackAdapter {
    app_token: String,
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    /// Resolved via `auth.test` on first use and cached for the process
    /// lifetime.
    bot_user_id: OnceLock<String>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.into()));
        Ok(Self {
            app_token: app_token.into(),
            client,
            token,
            bot_user_id: OnceLock::new(),
        })
    }

    /// Open a session against the cached client using the cached bot token.
    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Connect Socket Mode and return the inbound event stream.
    ///
    /// The listener runs on a spawned task for the life of the process;
    /// events arrive on the returned stream.
    pub async fn start(&self) -> crate::Result<EventStream> {
        let (event_tx, event_rx) = mpsc::channel(256);

        let bot_user_id = self.whoami().await?;
        tracing::info!(bot_user_id = %bot_user_id, "slack bot user ID resolved");

        let adapter_state = Arc::new(AdapterState {
            event_tx,
            bot_user_id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        // The socket mode listener needs its own client: it owns a
        // persistent WebSocket connection. The shared self.client is for
        // REST calls only.
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .context("failed to create slack socket mode connector")?,
        ));

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }
            tracing::info!("slack socket mode connected");
            let exit_code = listener.serve().await;
            tracing::info!(exit_code, "slack socket mode listener stopped");
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            event_rx,
        )))
    }
}

impl ChatClient for SlackAdapter {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> crate::Result<()> {
        let mut request = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        request = request.opt_thread_ts(thread_ts.map(|ts| SlackTs(ts.to_string())));
        self.session()
            .chat_post_message(&request)
            .await
            .context("failed to post slack message")?;
        Ok(())
    }

    async fn list_replies(
        &self,
        channel: &str,
        ts: &str,
        limit: u16,
    ) -> crate::Result<Vec<ThreadReply>> {
        let request = SlackApiConversationsRepliesRequest::new(
            SlackChannelId(channel.to_string()),
            SlackTs(ts.to_string()),
        )
        .with_limit(limit);
        let response = self
            .session()
            .conversations_replies(&request)
            .await
            .context("failed to fetch slack thread replies")?;

        Ok(response
            .messages
            .into_iter()
            .map(|message| ThreadReply {
                ts: message.origin.ts.0.clone(),
                user: message.sender.user.map(|u| u.0),
                bot_id: message.sender.bot_id.map(|b| b.0),
                text: message.content.text,
            })
            .collect())
    }

    async fn describe_user(&self, user_id: &str) -> crate::Result<UserProfile> {
        let request = SlackApiUsersInfoRequest::new(SlackUserId(user_id.to_string()));
        let response = self
            .session()
            .users_info(&request)
            .await
            .context("failed to look up slack user")?;
        let user = response.user;
        Ok(UserProfile {
            display_name: user.profile.as_ref().and_then(|p| p.display_name.clone()),
            real_name: user.profile.as_ref().and_then(|p| p.real_name.clone()),
            name: user.name,
        })
    }

    async fn is_direct_message(&self, channel: &str) -> crate::Result<bool> {
        let request = SlackApiConversationsInfoRequest::new(SlackChannelId(channel.to_string()));
        let response = self
            .session()
            .conversations_info(&request)
            .await
            .context("failed to inspect slack conversation")?;
        Ok(response.channel.flags.is_im.unwrap_or(false))
    }

    async fn whoami(&self) -> crate::Result<String> {
        if let Some(cached) = self.bot_user_id.get() {
            return Ok(cached.clone());
        }
        let response = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")?;
        let bot_user_id = response.user_id.0.clone();
        let _ = self.bot_user_id.set(bot_user_id.clone());
        Ok(bot_user_id)
    }
}

// ---------------------------------------------------------------------------
// Inbound event handlers (fn pointers, a slack-morphism requirement)
// ---------------------------------------------------------------------------

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    match event.event {
        SlackEventCallbackBody::Message(message) => handle_message_event(message, states).await,
        SlackEventCallbackBody::AppMention(mention) => {
            handle_app_mention_event(mention, states).await
        }
        _ => Ok(()),
    }
}

async fn handle_message_event(
    message: SlackMessageEvent,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<AdapterState>>()
        .expect("AdapterState must be in user_state");

    let user = message.sender.user.as_ref().map(|u| u.0.clone());
    if user.as_deref() == Some(adapter_state.bot_user_id.as_str()) {
        return Ok(()); // ignore self
    }

    let event = SlackEvent {
        kind: SlackEventKind::Message,
        channel: message
            .origin
            .channel
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_default(),
        user,
        text: message.content.as_ref().and_then(|c| c.text.clone()),
        ts: message.origin.ts.0.clone(),
        thread_ts: message.origin.thread_ts.as_ref().map(|t| t.0.clone()),
        subtype: message.subtype.as_ref().map(|s| format!("{s:?}")),
    };

    forward(&adapter_state.event_tx, event).await;
    Ok(())
}

/// `SlackAppMentionEvent` has flat `user` and `channel` fields rather than
/// the `sender`/`origin` sub-structs of the message event.
async fn handle_app_mention_event(
    mention: SlackAppMentionEvent,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<AdapterState>>()
        .expect("AdapterState must be in user_state");

    let user = mention.user.0.clone();
    if user == adapter_state.bot_user_id {
        return Ok(());
    }

    let event = SlackEvent {
        kind: SlackEventKind::AppMention,
        channel: mention.channel.0.clone(),
        user: Some(user),
        text: mention.content.text.clone(),
        ts: mention.origin.ts.0.clone(),
        thread_ts: mention.origin.thread_ts.as_ref().map(|t| t.0.clone()),
        subtype: None,
    };

    forward(&adapter_state.event_tx, event).await;
    Ok(())
}

async fn forward(tx: &mpsc::Sender<SlackEvent>, event: SlackEvent) {
    if let Err(error) = tx.send(event).await {
        tracing::warn!(%error, "failed to forward inbound slack event");
    }
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}
