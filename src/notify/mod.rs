// Outbound notifications: sink trait, message chunking, dispatcher task.
// The core only produces `Notification` events; this module turns them into sink calls.

pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{ChannelClass, Notification};

/// Telegram's hard limit for one message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

const FENCE: &str = "```";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("send failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected message (HTTP {status}): {description}")]
    Rejected { status: u16, description: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sends one message no longer than the sink's limit.
    async fn send(&self, channel: ChannelClass, text: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log; used when no chat sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, channel: ChannelClass, text: &str) -> Result<(), NotifyError> {
        info!(channel = %channel, "{}", text);
        Ok(())
    }
}

/// Splits `text` into chunks of at most `limit` characters, preferring line boundaries.
/// Lines longer than the limit are hard-split. Code fences cut by a split are closed at
/// the end of the chunk and reopened at the start of the next one.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }
    let fenced = text.contains(FENCE);
    // Room for "```\n" in front and "\n```" at the back.
    let budget = if fenced {
        limit.saturating_sub(2 * (FENCE.len() + 1)).max(1)
    } else {
        limit
    };
    let chunks = split_lines(text, budget);
    if fenced {
        balance_fences(chunks)
    } else {
        chunks
    }
}

fn split_lines(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let joined_len = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };
        if joined_len <= budget {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len = joined_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line_len <= budget {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut pieces = chars.chunks(budget).map(|c| c.iter().collect::<String>());
        let mut last = pieces.next().unwrap_or_default();
        for piece in pieces {
            chunks.push(std::mem::replace(&mut last, piece));
        }
        current_len = last.chars().count();
        current = last;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Closes a block cut by a split and reopens it in the next chunk. A fence line sitting
/// right at a split is dropped instead, so no chunk carries an empty block.
fn balance_fences(chunks: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut open = false;
    for mut chunk in chunks {
        if open && chunk.starts_with(FENCE) {
            // The previous chunk already closed this block.
            chunk = chunk
                .split_once('\n')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default();
            open = false;
        }
        let open_after = open ^ (chunk.matches(FENCE).count() % 2 == 1);
        if open_after {
            // Opening fence on the last line: drop it and let the next chunk reopen the block.
            let fence_line_at = match chunk.rsplit_once('\n') {
                Some((head, last)) => last.starts_with(FENCE).then_some(head.len()),
                None => chunk.starts_with(FENCE).then_some(0),
            };
            match fence_line_at {
                Some(len) => chunk.truncate(len),
                None => chunk.push_str("\n```"),
            }
        }
        if open && !chunk.is_empty() {
            chunk.insert_str(0, "```\n");
        }
        open = open_after;
        if !chunk.is_empty() {
            out.push(chunk);
        }
    }
    out
}

/// Drains `rx` until every sender is dropped, delivering each notification as a primary
/// message plus continuation chunks. A failed chunk drops the rest of that notification.
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
    max_message_len: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sent_total: u64 = 0;
        while let Some(notification) = rx.recv().await {
            let chunks = split_message(&notification.text, max_message_len);
            let parts = chunks.len();
            for (i, chunk) in chunks.iter().enumerate() {
                if let Err(e) = sink.send(notification.channel, chunk).await {
                    warn!(
                        error = %e,
                        operation = "send_notification",
                        channel = %notification.channel,
                        part = i + 1,
                        parts,
                        "notification delivery failed"
                    );
                    break;
                }
                sent_total += 1;
            }
        }
        debug!(sent_total, "Notification dispatcher shutting down");
    })
}
