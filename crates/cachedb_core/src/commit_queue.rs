//! Coalescing commit coordinator.
//!
//! Domain operations ask for a commit and await the answer. A background
//! task drains every request queued so far, runs a single
//! [`Persistence::commit`] on the blocking pool, and hands the same outcome
//! to every requester. A burst of operations therefore costs one journal
//! frame instead of one per operation.

use crate::error::{CoreError, CoreResult};
use crate::persistence::{CommitReceipt, Persistence};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Responder = oneshot::Sender<CoreResult<CommitReceipt>>;

/// Handle to the commit task. Dropping it stops the task once the queue
/// is empty.
#[derive(Debug)]
pub struct CommitQueue {
    requests: mpsc::UnboundedSender<Responder>,
    worker: JoinHandle<()>,
}

impl CommitQueue {
    /// Spawns the commit task on the current tokio runtime.
    pub fn spawn(persistence: Arc<Persistence>) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(persistence, rx));
        Self { requests, worker }
    }

    /// Requests a commit and waits for the shared outcome.
    ///
    /// # Errors
    ///
    /// `CommitFailure` if the write failed, `StoreUnavailable` if the commit
    /// task is gone.
    pub async fn commit(&self) -> CoreResult<CommitReceipt> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .map_err(|_| CoreError::unavailable("commit task stopped"))?;
        rx.await
            .map_err(|_| CoreError::unavailable("commit task dropped the request"))?
    }

    /// True once the commit task has exited.
    pub fn is_stopped(&self) -> bool {
        self.worker.is_finished()
    }
}

async fn run(persistence: Arc<Persistence>, mut rx: mpsc::UnboundedReceiver<Responder>) {
    while let Some(first) = rx.recv().await {
        let mut waiters = vec![first];
        while let Ok(next) = rx.try_recv() {
            waiters.push(next);
        }

        let p = Arc::clone(&persistence);
        let outcome = tokio::task::spawn_blocking(move || p.commit())
            .await
            .unwrap_or_else(|join| Err(CoreError::unavailable(format!("commit task panicked: {join}"))));
        tracing::debug!(
            requests = waiters.len(),
            ok = outcome.is_ok(),
            "coalesced commit finished"
        );

        for waiter in waiters {
            let shared = match &outcome {
                Ok(receipt) => Ok(*receipt),
                Err(err) => Err(err.duplicate()),
            };
            // The requester may have been cancelled; nothing to tell it
            let _ = waiter.send(shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::journal::Frame;
    use crate::model::{EntityKind, Field};
    use cachedb_codec::Value;
    use cachedb_storage::{FaultyBackend, InMemoryBackend};

    fn local_frames(p: &Persistence) -> usize {
        p.scan()
            .unwrap()
            .entries
            .iter()
            .filter(|e| matches!(e.frame, Frame::Local { .. }))
            .count()
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_frame() {
        let (p, _) =
            Persistence::recover(Box::new(InMemoryBackend::new()), &Config::in_memory()).unwrap();
        let p = Arc::new(p);
        let queue = CommitQueue::spawn(Arc::clone(&p));
        for name in ["a", "b", "c"] {
            p.store()
                .insert(EntityKind::Tag, [(Field::Name, Value::from(name))])
                .unwrap();
        }

        let (a, b, c) = tokio::join!(queue.commit(), queue.commit(), queue.commit());
        assert_eq!(a.unwrap().changes, 3);
        // The later requests were drained into the same commit
        assert_eq!(b.unwrap().changes, 3);
        assert_eq!(c.unwrap().changes, 3);
        assert_eq!(local_frames(&p), 1);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let (faulty, plan) = FaultyBackend::new(InMemoryBackend::new());
        let (p, _) = Persistence::recover(Box::new(faulty), &Config::in_memory()).unwrap();
        let p = Arc::new(p);
        let queue = CommitQueue::spawn(Arc::clone(&p));
        p.store()
            .insert(EntityKind::Tag, [(Field::Name, Value::from("a"))])
            .unwrap();

        plan.fail_appends(1);
        let (a, b) = tokio::join!(queue.commit(), queue.commit());
        assert!(a.unwrap_err().is_commit_failure());
        assert!(b.unwrap_err().is_commit_failure());
        assert_eq!(p.store().pending_len(), 1);

        assert_eq!(queue.commit().await.unwrap().changes, 1);
    }
}
