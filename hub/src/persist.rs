use crate::metrics::{PERSIST_BATCH_SIZE, PERSIST_LATENCY_SECONDS};
use crate::model::{Rover, RoverId};
use crate::store::RoverStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

/// Write-behind loop: coalesces registry snapshots per rover and saves them in batches
pub async fn run_persister(
    mut rx: mpsc::Receiver<Rover>,
    store: Arc<dyn RoverStore>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting persister with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: HashMap<RoverId, Rover> = HashMap::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                match snapshot {
                    Some(rover) => {
                        // Only the newest snapshot of each rover matters
                        buffer.insert(rover.id, rover);

                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Persister stopped");
}

async fn flush_batch(store: &dyn RoverStore, buffer: &mut HashMap<RoverId, Rover>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} rover states", batch_len);
    PERSIST_BATCH_SIZE.set(batch_len as f64);

    let mut batch: Vec<Rover> = buffer.drain().map(|(_, rover)| rover).collect();
    batch.sort_by_key(|r| r.id);

    let start = Instant::now();

    const MAX_RETRIES: u32 = 3;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.save_states(&batch).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                PERSIST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!("Batch saved after {} attempts in {:.3}s", attempt, elapsed);
                } else {
                    debug!("Batch saved in {:.3}s", elapsed);
                }
                PERSIST_BATCH_SIZE.set(0.0);
                return;
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to save batch after {} attempts: {}", MAX_RETRIES, e);
                    error!("{} rover states will be re-saved only on their next change", batch_len);
                    PERSIST_BATCH_SIZE.set(0.0);
                    return;
                }

                // Retry with exponential backoff: 100ms, 200ms, 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to save batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, Result};
    use crate::model::RoverStatus;
    use crate::store::MemoryRoverStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_flushes_latest_snapshot_on_close() {
        let store = Arc::new(MemoryRoverStore::new());
        let mut rover = store.create_or_get(1, "R1", Utc::now()).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_persister(rx, store.clone(), 100, 60_000));

        rover.status = RoverStatus::Active;
        tx.send(rover.clone()).await.unwrap();
        rover.status = RoverStatus::Error;
        tx.send(rover.clone()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.get(rover.id).await.unwrap().status, RoverStatus::Error);
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RoverStore for FailingStore {
        async fn load_all(&self) -> Result<Vec<Rover>> {
            Ok(Vec::new())
        }

        async fn create_or_get(&self, customer_id: i64, identifier: &str, now: DateTime<Utc>) -> Result<Rover> {
            Ok(Rover::new(1, customer_id, identifier, now))
        }

        async fn save_states(&self, _rovers: &[Rover]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Validation("store down".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let store = FailingStore {
            calls: AtomicUsize::new(0),
        };
        let mut buffer = HashMap::new();
        buffer.insert(1, Rover::new(1, 1, "R1", Utc::now()));

        flush_batch(&store, &mut buffer).await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(buffer.is_empty());
    }
}
