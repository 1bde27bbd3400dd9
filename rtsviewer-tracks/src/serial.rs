//! Per-source serial execution of track operations
//!
//! Enable and disable are asynchronous on the transport side and must never
//! overlap for the same track. Each source gets one FIFO drained by a single
//! worker task: new work is appended, nothing is cancelled or coalesced.

use crate::error::{Error, Result, TrackError};
use crate::types::SourceId;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type JobResult = std::result::Result<(), TrackError>;

struct QueuedJob {
    label: &'static str,
    job: BoxFuture<'static, JobResult>,
    done: oneshot::Sender<JobResult>,
}

/// Handle resolved once a queued job has run
#[must_use = "dropping a completion does not cancel the job"]
pub struct Completion {
    source_id: SourceId,
    rx: oneshot::Receiver<JobResult>,
}

impl Completion {
    /// Wait for the job and return its outcome
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::QueueClosed(self.source_id.to_string())),
        }
    }
}

/// FIFO of track operations for one source
///
/// Clones feed the same worker.
#[derive(Clone)]
pub struct SerialQueue {
    source_id: SourceId,
    tx: mpsc::UnboundedSender<QueuedJob>,
    pending: Arc<AtomicUsize>,
}

impl SerialQueue {
    /// Create the queue and spawn its worker. Must be called inside a Tokio runtime.
    pub fn new(source_id: SourceId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::run(source_id.clone(), rx, Arc::clone(&pending)));

        Self {
            source_id,
            tx,
            pending,
        }
    }

    /// Append `job`; it starts once every previously queued job has finished
    pub fn enqueue<F>(&self, label: &'static str, job: F) -> Result<Completion>
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);

        let queued = QueuedJob {
            label,
            job: Box::pin(job),
            done,
        };
        if self.tx.send(queued).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::QueueClosed(self.source_id.to_string()));
        }

        trace!(source_id = %self.source_id, label, "Queued track operation");

        Ok(Completion {
            source_id: self.source_id.clone(),
            rx,
        })
    }

    /// Wait until everything queued so far has run
    pub async fn flush(&self) -> Result<()> {
        self.enqueue("flush", async { Ok(()) })?.wait().await
    }

    /// Jobs queued or running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn run(
        source_id: SourceId,
        mut rx: mpsc::UnboundedReceiver<QueuedJob>,
        pending: Arc<AtomicUsize>,
    ) {
        while let Some(QueuedJob { label, job, done }) = rx.recv().await {
            trace!(source_id = %source_id, label, "Running track operation");
            let result = job.await;
            pending.fetch_sub(1, Ordering::SeqCst);
            // The caller may have stopped waiting
            let _ = done.send(result);
        }

        debug!(source_id = %source_id, "Serial queue drained and closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order_without_overlap() {
        let queue = SerialQueue::new(SourceId::from("cam"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut completions = Vec::new();
        for i in 0..5u64 {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            let completion = queue
                .enqueue("test", async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    // Earlier jobs sleep longer; order must still hold
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    log.lock().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            completions.push(completion);
        }

        for completion in completions {
            completion.wait().await.unwrap();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_chain() {
        let queue = SerialQueue::new(SourceId::from("cam"));

        let failed = queue
            .enqueue("fail", async { Err(TrackError::Transport("boom".into())) })
            .unwrap();
        let ok = queue.enqueue("ok", async { Ok(()) }).unwrap();

        assert_eq!(
            failed.wait().await,
            Err(Error::Track(TrackError::Transport("boom".into())))
        );
        assert!(ok.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_through_clone_waits_for_earlier_jobs() {
        let queue = SerialQueue::new(SourceId::from("cam"));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let _slow = queue
            .enqueue("slow", async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        queue.clone().flush().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_queue_still_drains() {
        let queue = SerialQueue::new(SourceId::from("cam"));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let completion = queue
            .enqueue("slow", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        drop(queue);

        assert!(completion.wait().await.is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
