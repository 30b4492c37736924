//! Streams the serving process's output into the telemetry store.

use std::sync::Arc;
use std::time::Duration;

use llamactl_backend::LogStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::store::TelemetryStore;

/// How long a collector gets to wind down before it is aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct LogCollector {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    grace: Duration,
}

impl LogCollector {
    /// Runs until stopped, shut down, or the stream ends. A stream error
    /// leaves one diagnostic line in the buffer; there is no retry.
    pub fn spawn(mut lines: LogStream, store: Arc<TelemetryStore>, shutdown: CancellationToken) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = shutdown.cancelled() => break,
                    item = lines.next() => match item {
                        Some(Ok(line)) => store.update_logs(clean_log_line(&line)),
                        Some(Err(e)) => {
                            store.update_logs(format!("(log collection error: {e})"));
                            break;
                        }
                        None => {
                            tracing::debug!(target: "logs", "log stream closed");
                            break;
                        }
                    },
                }
            }
            // dropping the stream detaches the follower process
            drop(lines);
        });
        Self { stop: Some(stop_tx), task, grace: STOP_GRACE }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_finished(&self) -> bool { self.task.is_finished() }

    /// Signals the task and waits up to the grace period. A task that has
    /// not exited by then is aborted without waiting further, since it may
    /// be stuck inside a blocking read. Returns `false` if it was aborted.
    pub async fn stop(mut self) -> bool {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(self.grace, &mut self.task).await.is_ok() {
            return true;
        }
        tracing::warn!(target: "logs", "log collector unresponsive, aborting");
        self.task.abort();
        false
    }
}

/// Strips the trailing newline, ANSI escapes, and a leading compose
/// service prefix such as `llama-server-1  | `.
pub fn clean_log_line(raw: &str) -> String {
    let line = strip_ansi(raw.trim_end_matches(['\n', '\r']));
    let head: String = line.chars().take(40).collect();
    if let Some(bar) = head.find('|') {
        let prefix = head[..bar].trim();
        if !prefix.is_empty() && !prefix.contains(char::is_whitespace) {
            return line[bar + 1..].trim_start().to_string();
        }
    }
    line
}

fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // CSI: parameters until a final byte in '@'..='~'
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            chars.next();
        }
    }
    out
}
