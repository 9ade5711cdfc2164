//! Durable on-disk work queue.
//!
//! A job's residence directory is its state: `pending/`, `processing/`,
//! `completed/`, or `failed/`. Every transition is a same-filesystem
//! rename, so a job file is always in exactly one stage and never visible
//! half-written. The rename from `pending/` to `processing/` is the only
//! concurrency primitive between workers: losing that race is non-fatal.

use crate::error::Result;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One unit of queued work.
///
/// `started_at` and `completed_at` stay null until the matching
/// transition happens; `error` and `failed_at` exist only in dead-letter
/// records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub channel: String,
    pub thread_ts: String,
    pub user: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_context: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

impl Job {
    pub fn new(
        channel: &str,
        thread_ts: &str,
        user: &str,
        prompt: &str,
        thread_context: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            thread_ts: thread_ts.to_string(),
            user: user.to_string(),
            prompt: prompt.to_string(),
            thread_context,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
            error: None,
            failed_at: None,
        }
    }
}

/// Point-in-time count of job files per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Four-directory on-disk queue rooted at a base path.
pub struct Queue {
    base: PathBuf,
}

impl Queue {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.base.join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.base.join("processing")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.base.join("completed")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.base.join("failed")
    }

    /// Create the base and all four stage directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.pending_dir(),
            self.processing_dir(),
            self.completed_dir(),
            self.failed_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create queue dir: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Durably enqueue a job: write `<base>/<id>.tmp.json`, then rename
    /// into `pending/`. The temp file lives in the base directory so the
    /// rename stays on one filesystem.
    pub async fn submit(&self, job: &Job) -> Result<()> {
        self.submit_value(&job.id, &serde_json::to_value(job)?).await
    }

    /// Enqueue an arbitrary JSON object. Used for the simple-notification
    /// job shape, which is not a full [`Job`].
    pub async fn submit_value(&self, id: &str, value: &serde_json::Value) -> Result<()> {
        let tmp = self.base.join(format!("{id}.tmp.json"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?)
            .await
            .with_context(|| format!("failed to write job temp file: {}", tmp.display()))?;
        let target = self.pending_dir().join(format!("{id}.json"));
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("failed to enqueue job: {}", target.display()))?;
        Ok(())
    }

    /// List pending job file names in OS directory order. No FIFO promise,
    /// only eventual drain.
    pub async fn scan_pending(&self) -> std::io::Result<Vec<String>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(self.pending_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    files.push(name.to_string());
                }
            }
        }
        Ok(files)
    }

    /// Claim a pending job by renaming it into `processing/`. An error
    /// means another worker won the race (or the file vanished); the
    /// caller logs and skips.
    pub async fn claim(&self, file_name: &str) -> std::io::Result<PathBuf> {
        let claimed = self.processing_dir().join(file_name);
        tokio::fs::rename(self.pending_dir().join(file_name), &claimed).await?;
        Ok(claimed)
    }

    /// Archive a finished job: overwrite the in-flight file with the final
    /// JSON, then rename into `completed/`.
    pub async fn complete(&self, file_name: &str, record: &serde_json::Value) -> Result<()> {
        let in_flight = self.processing_dir().join(file_name);
        tokio::fs::write(&in_flight, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("failed to finalize job record: {}", in_flight.display()))?;
        tokio::fs::rename(&in_flight, self.completed_dir().join(file_name))
            .await
            .with_context(|| format!("failed to archive job: {file_name}"))?;
        Ok(())
    }

    /// Dead-letter a job: write the annotated record into `failed/`, then
    /// unlink the in-flight file. Nothing consumes `failed/`.
    pub async fn fail(&self, file_name: &str, record: &serde_json::Value) -> Result<()> {
        let target = self.failed_dir().join(file_name);
        tokio::fs::write(&target, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("failed to write dead-letter record: {}", target.display()))?;
        if let Err(error) = tokio::fs::remove_file(self.processing_dir().join(file_name)).await {
            tracing::warn!(%error, file = %file_name, "failed to unlink in-flight job file");
        }
        Ok(())
    }

    /// Move every job stranded in `processing/` back to `pending/`. Runs
    /// once at processor startup; interrupted jobs are retried at least
    /// once. Idempotent when `processing/` is empty.
    pub async fn recover(&self) -> Result<usize> {
        let mut moved = 0;
        let processing = self.processing_dir();
        let mut entries = tokio::fs::read_dir(&processing)
            .await
            .with_context(|| format!("failed to list {}", processing.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read processing directory entry")?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            match tokio::fs::rename(entry.path(), self.pending_dir().join(&name)).await {
                Ok(()) => {
                    moved += 1;
                    tracing::info!(job = %name, "requeued job interrupted mid-processing");
                }
                Err(error) => {
                    tracing::warn!(%error, job = %name, "failed to requeue interrupted job");
                }
            }
        }
        Ok(moved)
    }

    /// Count `*.json` files in each stage directory. Best-effort: an
    /// unreadable directory counts as zero.
    pub async fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: count_json_files(&self.pending_dir()).await,
            processing: count_json_files(&self.processing_dir()).await,
            completed: count_json_files(&self.completed_dir()).await,
            failed: count_json_files(&self.failed_dir()).await,
        }
    }
}

async fn count_json_files(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_str().is_some_and(|name| name.ends_with(".json")) {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, Queue) {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Queue::new(dir.path());
        queue.ensure_dirs().expect("dirs");
        (dir, queue)
    }

    fn job() -> Job {
        Job::new("C1", "1.000001", "U1", "do the thing", None)
    }

    #[tokio::test]
    async fn submit_lands_in_pending_only() {
        let (dir, queue) = queue();
        let job = job();
        queue.submit(&job).await.expect("submit");

        let file = format!("{}.json", job.id);
        assert!(dir.path().join("pending").join(&file).exists());
        assert!(!dir.path().join(format!("{}.tmp.json", job.id)).exists());

        let status = queue.status().await;
        assert_eq!(status, QueueStatus { pending: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn submitted_job_is_pretty_json_round_trip() {
        let (dir, queue) = queue();
        let job = job();
        queue.submit(&job).await.expect("submit");

        let raw = std::fs::read_to_string(dir.path().join("pending").join(format!("{}.json", job.id)))
            .expect("read");
        assert!(raw.contains("\n  \"id\""));
        let parsed: Job = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.prompt, job.prompt);
        assert!(parsed.started_at.is_none());
    }

    #[tokio::test]
    async fn job_lives_in_exactly_one_stage_across_transitions() {
        let (_dir, queue) = queue();
        let job = job();
        let file = format!("{}.json", job.id);

        queue.submit(&job).await.expect("submit");
        assert_eq!(queue.status().await, QueueStatus { pending: 1, ..Default::default() });

        queue.claim(&file).await.expect("claim");
        assert_eq!(queue.status().await, QueueStatus { processing: 1, ..Default::default() });

        queue
            .complete(&file, &serde_json::to_value(&job).expect("value"))
            .await
            .expect("complete");
        assert_eq!(queue.status().await, QueueStatus { completed: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn claim_race_loser_gets_an_error() {
        let (_dir, queue) = queue();
        let job = job();
        let file = format!("{}.json", job.id);
        queue.submit(&job).await.expect("submit");

        queue.claim(&file).await.expect("first claim");
        assert!(queue.claim(&file).await.is_err());
    }

    #[tokio::test]
    async fn fail_moves_record_to_dead_letter() {
        let (dir, queue) = queue();
        let job = job();
        let file = format!("{}.json", job.id);
        queue.submit(&job).await.expect("submit");
        queue.claim(&file).await.expect("claim");

        let record = serde_json::json!({
            "id": job.id,
            "channel": job.channel,
            "error": "boom",
            "failed_at": 1700000000000i64,
        });
        queue.fail(&file, &record).await.expect("fail");

        assert_eq!(
            queue.status().await,
            QueueStatus { failed: 1, ..Default::default() }
        );
        let raw = std::fs::read_to_string(dir.path().join("failed").join(&file)).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed["error"], "boom");
    }

    #[tokio::test]
    async fn recover_requeues_interrupted_jobs() {
        let (_dir, queue) = queue();
        let job = job();
        let file = format!("{}.json", job.id);
        queue.submit(&job).await.expect("submit");
        queue.claim(&file).await.expect("claim");

        assert_eq!(queue.recover().await.expect("recover"), 1);
        let status = queue.status().await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.processing, 0);

        // Idempotent on an empty processing directory.
        assert_eq!(queue.recover().await.expect("recover"), 0);
        assert_eq!(queue.status().await.pending, 1);
    }
}
