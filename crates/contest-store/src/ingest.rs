//! Per-container log ingestion: follows a container's combined log stream,
//! tees each stream to its own file on disk, and parses completed lines into
//! [`LogEntry`] records for the sink.

use crate::model::LogEntry;
use crate::Result;
use contest_host::{HostAdapter, LogChunk};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Splits a byte buffer into complete, newline-terminated lines, leaving any
/// trailing partial line in `buf` for the next chunk.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        lines.push(line);
    }
    lines
}

/// Spawns a task that follows `container_name`'s logs until `cancel` fires or
/// the stream ends, tagging every parsed entry with `alias`.
pub fn spawn(
    host: Arc<dyn HostAdapter>,
    container_name: String,
    alias: String,
    base_dir: &Path,
    sender: mpsc::Sender<LogEntry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    let stdout_path = base_dir.join(format!("{alias}.stdout.log"));
    let stderr_path = base_dir.join(format!("{alias}.stderr.log"));

    tokio::spawn(async move {
        let mut stdout_file = tokio::fs::File::create(&stdout_path).await?;
        let mut stderr_file = tokio::fs::File::create(&stderr_path).await?;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let mut logs = host.container_logs(&container_name).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = logs.next() => {
                    let Some(chunk) = chunk else { break };
                    match chunk? {
                        LogChunk::Stdout(bytes) => {
                            stdout_file.write_all(&bytes).await?;
                            stdout_buf.extend_from_slice(&bytes);
                            for line in drain_lines(&mut stdout_buf) {
                                let entry = LogEntry::parse(&alias, false, &line);
                                if sender.send(entry).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        LogChunk::Stderr(bytes) => {
                            stderr_file.write_all(&bytes).await?;
                            stderr_buf.extend_from_slice(&bytes);
                            for line in drain_lines(&mut stderr_buf) {
                                let entry = LogEntry::parse(&alias, true, &line);
                                if sender.send(entry).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_and_keeps_partial_tail() {
        let mut buf = b"line one\nline two\npartial".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["line one".to_string(), "line two".to_string()]);
        assert_eq!(buf, b"partial");
    }

    #[test]
    fn empty_buffer_yields_no_lines() {
        let mut buf = Vec::new();
        assert!(drain_lines(&mut buf).is_empty());
    }
}
