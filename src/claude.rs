//! Claude CLI subprocess invocation with streamed progress detection.
//!
//! The agent runs with no timeout: the queue exists precisely to host
//! long-running tasks, and a watchdog would defeat that. Cancellation, if
//! ever needed, is host-initiated (signal to the process group).

use crate::error::AgentError;

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;

/// Maximum bytes retained from the agent's stderr stream.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Suffix replacing the tail of oversized agent output.
pub const OUTPUT_TRUNCATION_SUFFIX: &str = "\n\n... (output truncated)";

/// ANSI escape sequences recognised by the output scrubber.
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("hardcoded regex"));

/// Progress phase markers scanned for in streamed stdout, in priority
/// order. The first pattern matching a chunk wins.
static PHASE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        "OBSERVE",
        "THINK",
        "EXECUTE",
        "VERIFY",
        "COMPLETE",
        "Planning",
        "Implementing",
        "Testing",
        "Reviewing",
    ]
    .into_iter()
    .map(|name| {
        (
            name,
            Regex::new(&format!("(?i){name}")).expect("hardcoded regex"),
        )
    })
    .collect()
});

/// Parameters for one agent invocation.
pub struct AgentRequest<'a> {
    pub prompt: &'a str,
    pub thread_context: Option<&'a str>,
    pub cli_path: &'a Path,
    pub working_dir: &'a Path,
    pub max_output_chars: usize,
}

/// Successful invocation result.
#[derive(Debug)]
pub struct AgentReply {
    pub output: String,
    pub duration: Duration,
}

/// Wrap the latest message with the stored thread context, when present.
pub fn compose_prompt(prompt: &str, thread_context: Option<&str>) -> String {
    match thread_context {
        Some(context) if !context.is_empty() => format!(
            "Here is the conversation thread for context:\n\n{context}\n\n---\n\nLatest message (respond to this):\n{prompt}"
        ),
        _ => prompt.to_string(),
    }
}

/// Run the Claude CLI to completion, streaming stdout for progress phases.
///
/// Each newly seen phase is sent on `progress_tx`; a full channel or a
/// dropped receiver never aborts the invocation. On a non-zero exit the
/// error carries stderr, or a generic exit-code message when stderr was
/// empty.
pub async fn run(
    request: AgentRequest<'_>,
    progress_tx: mpsc::Sender<String>,
) -> Result<AgentReply, AgentError> {
    let started = Instant::now();
    let full_prompt = compose_prompt(request.prompt, request.thread_context);

    let mut child = Command::new(request.cli_path)
        .arg("--print")
        .arg("--continue")
        .arg("--dangerously-skip-permissions")
        .arg(&full_prompt)
        .current_dir(request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| AgentError::Spawn {
            path: request.cli_path.display().to_string(),
            source,
        })?;

    // Capture stderr in a background task for diagnostics on failure.
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = MAX_STDERR_BYTES.saturating_sub(buf.len());
                    if remaining == 0 {
                        continue; // drain but don't store
                    }
                    buf.extend_from_slice(&chunk[..n.min(remaining)]);
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let Some(mut stdout) = child.stdout.take() else {
        return Err(AgentError::Failed("agent stdout pipe unavailable".to_string()));
    };

    let mut raw = Vec::new();
    let mut reported: HashSet<&'static str> = HashSet::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                raw.extend_from_slice(&chunk[..n]);
                let decoded = String::from_utf8_lossy(&chunk[..n]);
                if let Some(phase) = detect_phase(&decoded) {
                    if reported.insert(phase) {
                        let _ = progress_tx.send(phase.to_string()).await;
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "error reading agent stdout");
                break;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|error| AgentError::Failed(format!("failed to wait for Claude CLI: {error}")))?;
    let stderr_output = stderr_task.await.unwrap_or_default();
    let duration = started.elapsed();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let detail = if stderr_output.trim().is_empty() {
            format!("Claude CLI exited with code {code}")
        } else {
            stderr_output.trim().to_string()
        };
        return Err(AgentError::Failed(detail));
    }

    let output = strip_ansi(&String::from_utf8_lossy(&raw));
    let output = truncate_output(&output, request.max_output_chars);
    tracing::debug!(
        duration_ms = duration.as_millis() as u64,
        output_bytes = output.len(),
        "agent invocation finished"
    );
    Ok(AgentReply { output, duration })
}

/// First phase pattern matching anywhere in the chunk, in priority order.
fn detect_phase(chunk: &str) -> Option<&'static str> {
    PHASE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(chunk))
        .map(|(name, _)| *name)
}

fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

fn truncate_output(output: &str, max_output_chars: usize) -> String {
    if output.len() <= max_output_chars {
        return output.to_string();
    }
    let keep = max_output_chars.saturating_sub(OUTPUT_TRUNCATION_SUFFIX.len());
    let keep = output.floor_char_boundary(keep);
    format!("{}{OUTPUT_TRUNCATION_SUFFIX}", &output[..keep])
}
