//! Buffers ingested log entries and flushes them to the document store in
//! small batches, trading a little latency for far fewer round trips.

use crate::model::LogEntry;
use crate::store::DocumentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FLUSH_INTERVAL: Duration = Duration::from_millis(33);
const FLUSH_BATCH_SIZE: usize = 33;

/// Runs until `receiver` closes or `cancel` fires, flushing once more before
/// returning either way. Insertion errors are logged, not propagated: a
/// flaky store should not bring down the scenario run.
pub async fn run(
    store: Arc<dyn DocumentStore>,
    mut receiver: mpsc::Receiver<LogEntry>,
    cancel: CancellationToken,
) {
    let mut buffer = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(entry) = receiver.try_recv() {
                    buffer.push(entry);
                }
                break;
            }
            entry = receiver.recv() => {
                match entry {
                    Some(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= FLUSH_BATCH_SIZE {
                            flush(&store, &mut buffer).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
        }
    }

    flush(&store, &mut buffer).await;
}

async fn flush(store: &Arc<dyn DocumentStore>, buffer: &mut Vec<LogEntry>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(e) = store.insert_batch(batch).await {
        tracing::error!(error = %e, "failed to flush log entries to store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn flushes_on_channel_close() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tx.send(LogEntry::parse("no0", false, "hello"))
            .await
            .unwrap();
        drop(tx);

        run(store.clone() as Arc<dyn DocumentStore>, rx, cancel).await;

        let query: serde_json::Value = serde_json::from_str(r#"{"node": "no0"}"#).unwrap();
        assert_eq!(store.count(&query).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flushes_on_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tx.send(LogEntry::parse("no0", false, "hello"))
            .await
            .unwrap();
        cancel.cancel();

        run(store.clone() as Arc<dyn DocumentStore>, rx, cancel).await;

        let query: serde_json::Value = serde_json::from_str(r#"{"node": "no0"}"#).unwrap();
        assert_eq!(store.count(&query).await.unwrap(), 1);
    }
}
