//! Background job processor.
//!
//! Exactly one processor runs per deployment, and it executes jobs
//! strictly serially: the agent may mutate the local filesystem, and its
//! session-continuation flag assumes a single active invocation. There is
//! no retry here; failed jobs are terminal.

use crate::claude::{self, AgentReply, AgentRequest};
use crate::config::ClaudeConfig;
use crate::conversation::{BRIDGE_NAME, Role, ThreadMessage, ThreadStore, context};
use crate::error::{QueueError, Result};
use crate::queue::{Job, Queue};
use crate::slack::ChatClient;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cycles between transcript GC sweeps.
const CLEANUP_EVERY_CYCLES: u64 = 100;

/// Transcripts older than this are garbage collected.
const TRANSCRIPT_MAX_AGE_HOURS: u64 = 72;

/// Stored assistant replies are clipped to this many characters.
const STORED_REPLY_MAX_CHARS: usize = 500;

/// Long-running loop that drains the queue.
pub struct Processor<C: ChatClient> {
    queue: Arc<Queue>,
    store: Arc<ThreadStore>,
    client: Arc<C>,
    claude: ClaudeConfig,
    poll_interval: Duration,
}

impl<C: ChatClient> Processor<C> {
    pub fn new(
        queue: Arc<Queue>,
        store: Arc<ThreadStore>,
        client: Arc<C>,
        claude: ClaudeConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            client,
            claude,
            poll_interval,
        }
    }

    /// Run forever: recover interrupted jobs, then poll `pending/`.
    pub async fn run(self) {
        self.startup().await;

        let mut cycles: u64 = 0;
        loop {
            self.cycle().await;
            cycles += 1;
            if cycles % CLEANUP_EVERY_CYCLES == 0 {
                let removed = self.store.cleanup(TRANSCRIPT_MAX_AGE_HOURS).await;
                if removed > 0 {
                    tracing::info!(removed, "cleaned up stale thread transcripts");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Ensure the queue directories exist and requeue anything stranded in
    /// `processing/` by an unclean shutdown.
    pub(crate) async fn startup(&self) {
        if let Err(error) = self.queue.ensure_dirs() {
            tracing::error!(%error, "failed to create queue directories");
        }
        match self.queue.recover().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "requeued jobs interrupted by a previous shutdown"),
            Err(error) => tracing::warn!(%error, "queue recovery failed"),
        }
    }

    /// One poll: list `pending/` and process each file. A listing failure
    /// is logged and left for the next cycle to self-heal.
    pub(crate) async fn cycle(&self) {
        let files = match self.queue.scan_pending().await {
            Ok(files) => files,
            Err(error) => {
                tracing::warn!(%error, "failed to list pending queue directory");
                return;
            }
        };
        if !files.is_empty() {
            let status = self.queue.status().await;
            tracing::debug!(status = ?status, "draining queue");
        }
        for file_name in files {
            if let Err(error) = self.process_one(&file_name).await {
                tracing::error!(%error, file = %file_name, "job processing failed");
            }
        }
    }

    async fn process_one(&self, file_name: &str) -> Result<()> {
        let claimed = match self.queue.claim(file_name).await {
            Ok(path) => path,
            Err(error) => {
                tracing::debug!(%error, file = %file_name, "lost claim race, skipping");
                return Ok(());
            }
        };

        // From here on the file either archives to completed/ or
        // dead-letters to failed/.
        let parsed = match read_job_value(&claimed).await {
            Ok(value) => value,
            Err(reason) => {
                return self
                    .dead_letter(file_name, serde_json::json!({}), &reason)
                    .await;
            }
        };

        // A file with `text` but no `prompt` is a plain post request.
        if parsed.get("text").is_some() && parsed.get("prompt").is_none() {
            return self.post_notification(file_name, parsed).await;
        }

        let mut job: Job = match serde_json::from_value(parsed.clone()) {
            Ok(job) => job,
            Err(error) => {
                let id = parsed
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(file_name);
                let reason = QueueError::InvalidJob {
                    id: id.to_string(),
                    reason: error.to_string(),
                }
                .to_string();
                return self.dead_letter(file_name, parsed, &reason).await;
            }
        };

        job.started_at = Some(chrono::Utc::now().timestamp_millis());
        tracing::info!(job_id = %job.id, channel = %job.channel, "processing job");

        // Forward detected phases into the thread as they stream. Posting
        // errors must never abort the job.
        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(16);
        let poster = {
            let client = self.client.clone();
            let channel = job.channel.clone();
            let thread_ts = job.thread_ts.clone();
            tokio::spawn(async move {
                while let Some(phase) = progress_rx.recv().await {
                    if let Err(error) = client
                        .post_message(&channel, Some(&thread_ts), &format!("[{phase}]"))
                        .await
                    {
                        tracing::warn!(%error, phase, "failed to post progress update");
                    }
                }
            })
        };

        let invocation = claude::run(
            AgentRequest {
                prompt: &job.prompt,
                thread_context: job.thread_context.as_deref(),
                cli_path: &self.claude.cli_path,
                working_dir: &self.claude.working_dir,
                max_output_chars: self.claude.max_output_chars,
            },
            progress_tx,
        )
        .await;

        // The progress sender is gone once the invocation returns; wait for
        // the poster to flush so phase posts precede the final reply.
        let _ = poster.await;

        match invocation {
            Ok(reply) => {
                if let Err(error) = self.finish_job(file_name, &mut job, &reply).await {
                    let detail = error.to_string();
                    self.dead_letter(file_name, serde_json::to_value(&job)?, &detail)
                        .await?;
                }
            }
            Err(error) => {
                let detail = error.to_string();
                self.dead_letter(file_name, serde_json::to_value(&job)?, &detail)
                    .await?;
            }
        }
        Ok(())
    }

    /// Success path: post the reply, record it in the transcript, archive
    /// the job. A transcript write failure leaves the job completed.
    async fn finish_job(&self, file_name: &str, job: &mut Job, reply: &AgentReply) -> Result<()> {
        self.client
            .post_message(&job.channel, Some(&job.thread_ts), &reply.output)
            .await?;

        let stored = context::truncate_at_natural_boundary(&reply.output, STORED_REPLY_MAX_CHARS);
        let message = ThreadMessage {
            role: Role::Assistant,
            name: BRIDGE_NAME.to_string(),
            text: stored.to_string(),
            ts: chrono::Utc::now().timestamp().to_string(),
        };
        if let Err(error) = self.store.append(&job.thread_ts, &job.channel, message).await {
            tracing::warn!(%error, thread_ts = %job.thread_ts, "failed to record assistant reply in transcript");
        }

        job.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.queue
            .complete(file_name, &serde_json::to_value(&*job)?)
            .await?;
        tracing::info!(
            job_id = %job.id,
            duration_ms = reply.duration.as_millis() as u64,
            "job completed"
        );
        Ok(())
    }

    /// Handle the simple-notification job shape: post `text` to `channel`
    /// and archive a minimal record.
    async fn post_notification(&self, file_name: &str, value: serde_json::Value) -> Result<()> {
        let channel = value
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if channel.is_empty() {
            return self
                .dead_letter(file_name, value, "notification job missing channel")
                .await;
        }
        let text = value
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let thread_ts = value
            .get("thread_ts")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match self
            .client
            .post_message(&channel, thread_ts.as_deref(), &text)
            .await
        {
            Ok(()) => {
                let mut record = value;
                if let Some(object) = record.as_object_mut() {
                    object.insert(
                        "completed_at".to_string(),
                        serde_json::json!(chrono::Utc::now().timestamp_millis()),
                    );
                }
                self.queue.complete(file_name, &record).await?;
                tracing::info!(channel = %channel, "notification posted");
                Ok(())
            }
            Err(error) => {
                let detail = error.to_string();
                self.dead_letter(file_name, value, &detail).await
            }
        }
    }

    /// Terminal failure: annotate the record, move it to `failed/`, and
    /// tell the thread when routing is known.
    async fn dead_letter(
        &self,
        file_name: &str,
        mut record: serde_json::Value,
        error: &str,
    ) -> Result<()> {
        if let Some(object) = record.as_object_mut() {
            object.insert("error".to_string(), serde_json::json!(error));
            object.insert(
                "failed_at".to_string(),
                serde_json::json!(chrono::Utc::now().timestamp_millis()),
            );
        }
        self.queue.fail(file_name, &record).await?;
        tracing::error!(file = %file_name, error = %error, "job dead-lettered");

        let channel = record.get("channel").and_then(|v| v.as_str());
        let thread_ts = record.get("thread_ts").and_then(|v| v.as_str());
        if let (Some(channel), Some(thread_ts)) = (channel, thread_ts) {
            let notice = format!("Sorry, I encountered an error processing your request: {error}");
            if let Err(post_error) = self
                .client
                .post_message(channel, Some(thread_ts), &notice)
                .await
            {
                tracing::warn!(%post_error, "failed to notify thread about job failure");
            }
        }
        Ok(())
    }
}

async fn read_job_value(path: &Path) -> std::result::Result<serde_json::Value, String> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|error| format!("failed to read job file: {error}"))?;
    serde_json::from_slice(&raw).map_err(|error| format!("invalid job JSON: {error}"))
}
