//! Bounded, best-effort memory extraction queue.
//!
//! Jobs are submitted without waiting; a full queue drops the job with a
//! warning. One worker processes jobs in order, each under its own timeout.
//! [`MemoryQueue::shutdown`] drains what is queued and returns counters, so
//! tests can wait for extraction deterministically.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_store::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MemoryExtractor, MemoryStore};
use crate::error::Result;

/// Queue settings, loaded from the `[memory]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryQueueConfig {
    /// Jobs waiting before new submissions are dropped.
    pub capacity: usize,
    /// Budget for extracting and saving one job, in seconds.
    pub timeout_secs: u64,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            timeout_secs: 60,
        }
    }
}

/// One conversation to mine for facts.
#[derive(Debug, Clone)]
pub struct MemoryJob {
    pub session_id: Option<String>,
    pub messages: Vec<Message>,
}

/// Outcome counters reported by [`MemoryQueue::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Cloneable submission side of a [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct MemoryQueueHandle {
    tx: mpsc::Sender<MemoryJob>,
}

impl MemoryQueueHandle {
    /// Enqueue without waiting. Returns `false` if the job was dropped.
    pub fn submit(&self, job: MemoryJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(session_id = ?job.session_id, "memory queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::debug!(session_id = ?job.session_id, "memory queue closed, job dropped");
                false
            }
        }
    }
}

/// Owner of the worker task.
pub struct MemoryQueue {
    handle: MemoryQueueHandle,
    shutdown: CancellationToken,
    worker: JoinHandle<MemoryStats>,
}

impl MemoryQueue {
    /// Spawn the worker on the current runtime.
    pub fn start(
        extractor: Arc<dyn MemoryExtractor>,
        store: Arc<dyn MemoryStore>,
        config: MemoryQueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shutdown = CancellationToken::new();
        let timeout = Duration::from_secs(config.timeout_secs);
        let worker = tokio::spawn(run_worker(rx, extractor, store, timeout, shutdown.clone()));
        tracing::info!(capacity = config.capacity, timeout_secs = config.timeout_secs, "memory queue started");

        Self {
            handle: MemoryQueueHandle { tx },
            shutdown,
            worker,
        }
    }

    pub fn handle(&self) -> MemoryQueueHandle {
        self.handle.clone()
    }

    /// Stop accepting jobs, finish the queued ones, and report.
    pub async fn shutdown(self) -> MemoryStats {
        self.shutdown.cancel();
        match self.worker.await {
            Ok(stats) => {
                tracing::info!(?stats, "memory queue stopped");
                stats
            }
            Err(e) => {
                tracing::error!(error = %e, "memory worker panicked");
                MemoryStats::default()
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<MemoryJob>,
    extractor: Arc<dyn MemoryExtractor>,
    store: Arc<dyn MemoryStore>,
    timeout: Duration,
    shutdown: CancellationToken,
) -> MemoryStats {
    let mut stats = MemoryStats::default();
    loop {
        tokio::select! {
            biased;
            job = rx.recv() => match job {
                Some(job) => process(&job, extractor.as_ref(), store.as_ref(), timeout, &mut stats).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    process(&job, extractor.as_ref(), store.as_ref(), timeout, &mut stats).await;
                }
                break;
            }
        }
    }
    stats
}

async fn process(
    job: &MemoryJob,
    extractor: &dyn MemoryExtractor,
    store: &dyn MemoryStore,
    timeout: Duration,
    stats: &mut MemoryStats,
) {
    stats.processed += 1;
    let work = async {
        let entries = extractor
            .extract(job.session_id.as_deref(), &job.messages)
            .await?;
        store.save_memories(entries).await
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(saved)) => {
            stats.saved += saved;
            tracing::debug!(session_id = ?job.session_id, saved, "memories extracted");
        }
        Ok(Err(e)) => {
            stats.failed += 1;
            tracing::warn!(session_id = ?job.session_id, error = %e, "memory extraction failed");
        }
        Err(_) => {
            stats.timed_out += 1;
            tracing::warn!(
                session_id = ?job.session_id,
                timeout_secs = timeout.as_secs_f64(),
                "memory extraction timed out"
            );
        }
    }
}
