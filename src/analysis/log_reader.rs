//! Normalized log file input
//!
//! Accepts JSON Lines (streamed line by line) or a single JSON array.
//! Malformed lines are skipped and counted rather than failing the read.

use anyhow::Context;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use crate::models::LogEntry;

pub struct LogFileStream {
    pub entries: BoxStream<'static, anyhow::Result<LogEntry>>,
    /// Lines that could not be parsed, updated as the stream is consumed
    pub skipped: Arc<AtomicU64>,
}

impl LogFileStream {
    pub fn skipped_lines(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

pub async fn open_log_file(path: &Path) -> anyhow::Result<LogFileStream> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let skipped = Arc::new(AtomicU64::new(0));

    let head = reader.fill_buf().await?;
    let is_array = head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[');

    if is_array {
        let mut raw = String::new();
        reader.read_to_string(&mut raw).await?;
        let entries: Vec<LogEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse log array {}", path.display()))?;
        return Ok(LogFileStream {
            entries: stream::iter(entries.into_iter().map(Ok)).boxed(),
            skipped,
        });
    }

    let lines = reader.lines();
    let counter = Arc::clone(&skipped);
    let entries = stream::unfold((lines, counter), |(mut lines, counter)| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => return Some((Ok(entry), (lines, counter))),
                        Err(e) => {
                            debug!("Skipping malformed log line: {}", e);
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(anyhow::Error::from(e)), (lines, counter))),
            }
        }
    })
    .boxed();

    Ok(LogFileStream { entries, skipped })
}
