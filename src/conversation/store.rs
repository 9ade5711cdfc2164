//! Transcript persistence: atomic writes, per-thread locks, seeding, GC.

use crate::conversation::{BRIDGE_NAME, Role, ThreadFile, ThreadMessage};
use crate::error::Result;
use crate::slack::ChatClient;

use anyhow::Context as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Number of trailing messages checked when deduplicating appends.
const DEDUP_WINDOW: usize = 5;

/// Maximum replies fetched when seeding a thread from Slack.
const SEED_FETCH_LIMIT: u16 = 20;

/// Per-thread transcript store backed by JSON files.
///
/// Writes go through a temp file + rename, so readers only ever see a
/// complete snapshot. Writes on the same thread are funnelled through a
/// per-thread tokio mutex; tokio mutexes queue waiters fairly, which gives
/// appends arrival order. The locks are in-memory only: multi-process
/// safety is out of scope.
pub struct ThreadStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create thread store dir: {}", dir.display()))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, thread_ts: &str) -> PathBuf {
        self.dir.join(format!("{thread_ts}.json"))
    }

    fn tmp_path_for(&self, thread_ts: &str) -> PathBuf {
        self.dir.join(format!("{thread_ts}.tmp.json"))
    }

    async fn lock_for(&self, thread_ts: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(thread_ts.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load a transcript, returning `None` on any read or parse error.
    pub async fn load(&self, thread_ts: &str) -> Option<ThreadFile> {
        let bytes = tokio::fs::read(self.path_for(thread_ts)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Persist a transcript atomically: write `<thread_ts>.tmp.json`, then
    /// rename over `<thread_ts>.json`. Relies on POSIX same-directory
    /// rename atomicity; no fsync, losing the last update on host crash is
    /// tolerated.
    pub async fn save(&self, file: &ThreadFile) -> Result<()> {
        let tmp = self.tmp_path_for(&file.thread_ts);
        let body = serde_json::to_vec_pretty(file)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write transcript temp file: {}", tmp.display()))?;
        let path = self.path_for(&file.thread_ts);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to commit transcript: {}", path.display()))?;
        Ok(())
    }

    /// Append a message to a thread, creating the transcript if absent.
    ///
    /// A message whose `ts` already appears among the last [`DEDUP_WINDOW`]
    /// stored entries is a no-op. Returns the post-append transcript.
    pub async fn append(
        &self,
        thread_ts: &str,
        channel: &str,
        message: ThreadMessage,
    ) -> Result<ThreadFile> {
        let lock = self.lock_for(thread_ts).await;
        let _guard = lock.lock().await;
        self.append_locked(thread_ts, channel, message).await
    }

    async fn append_locked(
        &self,
        thread_ts: &str,
        channel: &str,
        message: ThreadMessage,
    ) -> Result<ThreadFile> {
        let mut file = self
            .load(thread_ts)
            .await
            .unwrap_or_else(|| ThreadFile::new(thread_ts, channel));

        let duplicate = file
            .messages
            .iter()
            .rev()
            .take(DEDUP_WINDOW)
            .any(|existing| existing.ts == message.ts);
        if duplicate {
            tracing::debug!(thread_ts, ts = %message.ts, "duplicate message ts, skipping append");
            return Ok(file);
        }

        file.messages.push(message);
        file.message_count = file.messages.len();
        self.save(&file).await?;
        Ok(file)
    }

    /// Variant of [`append`](Self::append) that holds the thread lock for
    /// `delay` before writing, so tests can pin down lock ordering.
    #[cfg(test)]
    pub(crate) async fn append_after_delay(
        &self,
        thread_ts: &str,
        channel: &str,
        message: ThreadMessage,
        delay: Duration,
    ) -> Result<ThreadFile> {
        let lock = self.lock_for(thread_ts).await;
        let _guard = lock.lock().await;
        tokio::time::sleep(delay).await;
        self.append_locked(thread_ts, channel, message).await
    }

    /// Build a transcript from the thread's Slack reply history and persist
    /// it, overwriting any prior on-disk state.
    ///
    /// Classification per reply: textless replies are dropped; replies
    /// authored by the bridge itself become assistant entries; replies from
    /// any other bot are dropped; human authors are resolved to display
    /// names (cached per call, falling back to the raw user id); replies
    /// with neither `user` nor `bot_id` are dropped.
    pub async fn seed_from_slack<C: ChatClient>(
        &self,
        thread_ts: &str,
        channel: &str,
        bridge_bot_id: &str,
        client: &C,
    ) -> Result<ThreadFile> {
        let replies = client.list_replies(channel, thread_ts, SEED_FETCH_LIMIT).await?;

        let mut names: HashMap<String, String> = HashMap::new();
        let mut file = ThreadFile::new(thread_ts, channel);

        for reply in replies {
            let Some(text) = reply.text.filter(|t| !t.is_empty()) else {
                continue;
            };
            match (reply.user.as_deref(), reply.bot_id.as_deref()) {
                (Some(user), _) if user == bridge_bot_id => {
                    file.messages.push(ThreadMessage {
                        role: Role::Assistant,
                        name: BRIDGE_NAME.to_string(),
                        text,
                        ts: reply.ts,
                    });
                }
                (_, Some(_)) => continue,
                (Some(user), None) => {
                    let name = match names.get(user) {
                        Some(cached) => cached.clone(),
                        None => {
                            let resolved = match client.describe_user(user).await {
                                Ok(profile) => profile.display_name_or(user),
                                Err(error) => {
                                    tracing::debug!(%error, user, "user lookup failed, recording by id");
                                    user.to_string()
                                }
                            };
                            names.insert(user.to_string(), resolved.clone());
                            resolved
                        }
                    };
                    file.messages.push(ThreadMessage {
                        role: Role::User,
                        name,
                        text,
                        ts: reply.ts,
                    });
                }
                (None, None) => continue,
            }
        }

        file.message_count = file.messages.len();

        let lock = self.lock_for(thread_ts).await;
        let _guard = lock.lock().await;
        self.save(&file).await?;
        tracing::info!(thread_ts, messages = file.message_count, "seeded thread from slack history");
        Ok(file)
    }

    /// Delete transcripts whose mtime is older than `max_age_hours`,
    /// dropping their lock entries. Per-file errors are swallowed; a file
    /// may be racing with a concurrent writer. Returns the deletion count.
    pub async fn cleanup(&self, max_age_hours: u64) -> usize {
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_hours * 3600);
        let mut removed = 0;

        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.ends_with(".tmp.json") {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|meta| meta.modified()) else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
                let thread_ts = name.trim_end_matches(".json");
                self.locks.lock().await.remove(thread_ts);
            }
        }

        removed
    }
}
