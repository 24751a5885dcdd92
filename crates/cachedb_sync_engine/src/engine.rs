//! Sync engine state machine.
//!
//! A cycle pulls before it pushes:
//!
//! 1. Re-read the persisted sync flag. Off means no remote call at all.
//! 2. Pull pages after the remote cursor, merge them, and durably record
//!    the cursor each page reaches.
//! 3. Push unacknowledged local history and durably record the sent seq
//!    after each acknowledgement.
//!
//! Every remote call is raced with the cancellation token. Cursors only
//! move after a page has been fully handled, so a cancelled cycle resumes
//! from where the last completed page left off.

use crate::config::SyncConfig;
use crate::convert::{from_sync, to_sync};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use cachedb_core::{CoreError, CoreResult, EntityId, MergeConflict, Persistence};
use cachedb_sync_protocol::{ChangeBatch, EraseAck, EraseRequest, PullRequest, PushRequest};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as CycleLock};
use tokio::time::Interval;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// The last cycle found the sync flag off.
    Disabled,
    /// Fetching remote changes.
    Pulling,
    /// Sending local changes.
    Pushing,
    /// The last cycle completed.
    Synced,
    /// The last cycle failed.
    Error,
    /// Waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// True while a cycle is exchanging data or waiting to retry.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::RetryWait
        )
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Remote rows received.
    pub changes_pulled: u64,
    /// Remote changes that took effect locally.
    pub changes_merged: u64,
    /// Local changes acknowledged by the remote.
    pub changes_pushed: u64,
    /// Outbound batches constructed.
    pub batches_built: u64,
    /// Merge conflicts resolved.
    pub conflicts: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// When the last cycle completed.
    pub last_sync: Option<Instant>,
    /// Message of the last failure, cleared by a completed cycle.
    pub last_error: Option<String>,
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Remote rows received, including this device's own.
    pub pulled: usize,
    /// Received rows that originated here and were skipped.
    pub skipped_own: usize,
    /// Remote changes that took effect.
    pub merged: usize,
    /// Local changes acknowledged.
    pub pushed: usize,
    /// Conflicts the merge resolved.
    pub conflicts: Vec<MergeConflict>,
    /// Entities a remote edit brought back from a local deletion.
    pub resurrected: Vec<EntityId>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The sync flag is off. Nothing was sent or received.
    Disabled,
    /// The cycle ran to completion.
    Synced(SyncReport),
}

impl SyncOutcome {
    /// The report of a completed cycle.
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Disabled => None,
            SyncOutcome::Synced(report) => Some(report),
        }
    }
}

/// Keeps one device's store in sync with a remote zone.
pub struct SyncEngine<R: RemoteStore> {
    config: SyncConfig,
    persistence: Arc<Persistence>,
    remote: Arc<R>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancel: watch::Sender<u64>,
    cycle: CycleLock<()>,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Creates an engine for the store behind `persistence`.
    pub fn new(config: SyncConfig, persistence: Arc<Persistence>, remote: Arc<R>) -> Self {
        Self {
            config,
            persistence,
            remote,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancel: watch::Sender::new(0),
            cycle: CycleLock::new(()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The store being synced.
    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// The remote zone service.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Cancels the operation in progress, if any. Later calls are unaffected.
    pub fn cancel(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        tracing::debug!("sync cancellation requested");
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn busy(&self, to: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: format!("{:?}", self.state()),
            to: to.to_string(),
        }
    }

    /// Runs one pull-then-push cycle.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if another operation holds the engine,
    /// `Cancelled` after [`cancel`](Self::cancel), and transport, protocol
    /// or store errors from the exchange itself.
    pub async fn sync_once(&self) -> SyncResult<SyncOutcome> {
        let _cycle = self.cycle.try_lock().map_err(|_| self.busy("Pulling"))?;
        let mut token = self.cancel.subscribe();
        self.run_cycle(&mut token).await
    }

    /// Runs cycles until one succeeds, a non-retryable error occurs, or the
    /// configured attempts are used up.
    ///
    /// # Errors
    ///
    /// The last error seen. See [`sync_once`](Self::sync_once).
    pub async fn sync_with_retry(&self) -> SyncResult<SyncOutcome> {
        let _cycle = self.cycle.try_lock().map_err(|_| self.busy("Pulling"))?;
        let mut token = self.cancel.subscribe();
        let retry = self.config.retry.clone();
        let mut attempt = 0;
        loop {
            match self.run_cycle(&mut token).await {
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    self.set_state(SyncState::RetryWait);
                    self.stats.write().retries += 1;
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "sync failed, retrying"
                    );
                    let wait = async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    };
                    if let Err(err) = cancellable(&mut token, wait).await {
                        self.set_state(SyncState::Idle);
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }

    /// Syncs in the background until `shutdown` turns true or its sender
    /// is dropped.
    ///
    /// A cycle runs at start, after every local commit, and on each tick
    /// of the configured interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut commits = self.persistence.subscribe();
        let mut ticker = self
            .config
            .sync_interval
            .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
        tracing::info!(zone = %self.config.zone, "background sync started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                outcome = self.sync_with_retry() => log_background(outcome),
                changed = shutdown.changed() => {
                    self.set_state(SyncState::Idle);
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = commits.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tick(ticker.as_mut()) => {}
            }
        }
        tracing::info!(zone = %self.config.zone, "background sync stopped");
    }

    /// Erases the whole remote zone and resets the remote cursor.
    ///
    /// Local data and the sent seq are untouched. This never runs as part
    /// of a cycle and refuses to start while one is active.
    ///
    /// # Errors
    ///
    /// `Disabled` if the sync flag is off, `InvalidStateTransition` while
    /// a cycle runs, or the remote's error.
    pub async fn erase_remote_data(&self) -> SyncResult<EraseAck> {
        if !self.persistence.sync_enabled() {
            return Err(SyncError::Disabled);
        }
        let _cycle = self.cycle.try_lock().map_err(|_| self.busy("Erasing"))?;
        let mut token = self.cancel.subscribe();
        let request = EraseRequest {
            zone: self.config.zone.clone(),
        };
        let ack = cancellable(&mut token, self.remote.erase_all_remote_data(request)).await?;
        let p = Arc::clone(&self.persistence);
        blocking(move || p.reset_remote_cursor()).await?;
        tracing::info!(zone = %ack.zone, erased = ack.erased, "remote zone erased");
        Ok(ack)
    }

    async fn run_cycle(&self, token: &mut watch::Receiver<u64>) -> SyncResult<SyncOutcome> {
        if !self.persistence.sync_enabled() {
            self.set_state(SyncState::Disabled);
            tracing::debug!("sync disabled, cycle skipped");
            return Ok(SyncOutcome::Disabled);
        }

        let start = Instant::now();
        let mut report = SyncReport::default();
        let result = async {
            self.set_state(SyncState::Pulling);
            self.pull_all(token, &mut report).await?;
            self.set_state(SyncState::Pushing);
            self.push_all(token, &mut report).await
        }
        .await;

        match result {
            Ok(()) => {
                report.duration = start.elapsed();
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.last_sync = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    pulled = report.pulled,
                    merged = report.merged,
                    pushed = report.pushed,
                    conflicts = report.conflicts.len(),
                    "sync cycle complete"
                );
                Ok(SyncOutcome::Synced(report))
            }
            Err(SyncError::Cancelled) => {
                self.set_state(SyncState::Idle);
                tracing::info!("sync cycle cancelled");
                Err(SyncError::Cancelled)
            }
            Err(err) => {
                self.set_state(SyncState::Error);
                self.stats.write().last_error = Some(err.to_string());
                tracing::warn!(error = %err, "sync cycle failed");
                Err(err)
            }
        }
    }

    // Each page lands with its cursor in one frame, so a cancel or failure
    // keeps the pages already merged and the next cycle resumes after them
    async fn pull_all(
        &self,
        token: &mut watch::Receiver<u64>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let own = *self.persistence.device().as_bytes();
        loop {
            let since = self.persistence.cursor().remote;
            let request = PullRequest {
                zone: self.config.zone.clone(),
                since,
                limit: self.config.pull_batch_size,
            };
            let page = cancellable(token, self.remote.pull_changes(request)).await?;
            if page.new_cursor < since {
                return Err(SyncError::Protocol(format!(
                    "remote cursor moved back from {since} to {}",
                    page.new_cursor
                )));
            }

            let mut changes = Vec::with_capacity(page.batch.len());
            for row in &page.batch.changes {
                if row.device_id == own {
                    report.skipped_own += 1;
                } else {
                    changes.push(from_sync(row)?);
                }
            }
            report.pulled += page.batch.len();

            if !changes.is_empty() || page.new_cursor != since {
                let p = Arc::clone(&self.persistence);
                let cursor = page.new_cursor;
                let merge = blocking(move || p.apply_remote(changes, cursor)).await?;
                let mut stats = self.stats.write();
                stats.changes_pulled += page.batch.len() as u64;
                stats.changes_merged += merge.applied as u64;
                stats.conflicts += merge.conflicts.len() as u64;
                report.merged += merge.applied;
                report.conflicts.extend(merge.conflicts);
                report.resurrected.extend(merge.resurrected);
            }

            if !page.has_more || page.batch.is_empty() {
                return Ok(());
            }
        }
    }

    async fn push_all(
        &self,
        token: &mut watch::Receiver<u64>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let device = *self.persistence.device().as_bytes();
        loop {
            let unsent = self.persistence.unsent(self.config.push_batch_size as usize);
            let Some(last) = unsent.last().map(|c| c.seq) else {
                return Ok(());
            };
            let batch = ChangeBatch::new(unsent.iter().map(to_sync).collect());
            self.stats.write().batches_built += 1;

            let request = PushRequest {
                zone: self.config.zone.clone(),
                device_id: device,
                batch,
            };
            let ack = cancellable(token, self.remote.push_changes(request)).await?;
            if ack.acked_seq < last.get() {
                return Err(SyncError::Protocol(format!(
                    "remote acknowledged seq {} of {last}",
                    ack.acked_seq
                )));
            }

            let p = Arc::clone(&self.persistence);
            blocking(move || p.mark_sent(last)).await?;
            self.stats.write().changes_pushed += unsent.len() as u64;
            report.pushed += unsent.len();
            tracing::debug!(
                changes = unsent.len(),
                accepted = ack.accepted,
                duplicates = ack.duplicates,
                sent_seq = %last,
                "batch pushed"
            );
        }
    }
}

/// Resolves `call` unless the token changes first.
async fn cancellable<T>(
    token: &mut watch::Receiver<u64>,
    call: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    tokio::select! {
        biased;
        _ = token.changed() => Err(SyncError::Cancelled),
        out = call => out,
    }
}

/// Runs a journal write on the blocking pool.
async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoreResult<T> + Send + 'static,
{
    let out = tokio::task::spawn_blocking(f)
        .await
        .map_err(|join| CoreError::unavailable(format!("sync write panicked: {join}")))?;
    Ok(out?)
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_background(outcome: SyncResult<SyncOutcome>) {
    match outcome {
        Ok(_) | Err(SyncError::Cancelled) => {}
        Err(err @ SyncError::InvalidStateTransition { .. }) => {
            tracing::debug!(error = %err, "background cycle skipped");
        }
        Err(err) => tracing::warn!(error = %err, "background sync gave up"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::remote::MemoryRemote;
    use cachedb_core::{Inventory, NewStorageRoot};

    async fn device(remote: &Arc<MemoryRemote>) -> (Inventory, Arc<SyncEngine<MemoryRemote>>) {
        let inventory = Inventory::in_memory().await.unwrap();
        inventory.set_sync_enabled(true).await.unwrap();
        let config = SyncConfig::new("test").with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let engine = SyncEngine::new(
            config,
            Arc::clone(inventory.persistence()),
            Arc::clone(remote),
        );
        (inventory, Arc::new(engine))
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn active_states() {
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(SyncState::RetryWait.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Disabled.is_active());
        assert!(!SyncState::Synced.is_active());
    }

    #[tokio::test]
    async fn empty_cycle_completes() {
        let remote = Arc::new(MemoryRemote::new());
        let (_inventory, engine) = device(&remote).await;
        let outcome = engine.sync_once().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!((report.pulled, report.pushed), (0, 0));
        assert_eq!(engine.state(), SyncState::Synced);
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(engine.stats().batches_built, 0);
    }

    #[tokio::test]
    async fn second_operation_is_refused_while_a_cycle_runs() {
        let remote = Arc::new(MemoryRemote::new());
        let (_inventory, engine) = device(&remote).await;
        remote.set_stalled(true);

        let running = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.sync_once().await }
        });
        wait_for(|| remote.pull_calls() == 1).await;

        assert!(matches!(
            engine.sync_once().await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            engine.erase_remote_data().await,
            Err(SyncError::InvalidStateTransition { .. })
        ));

        engine.cancel();
        assert!(matches!(running.await.unwrap(), Err(SyncError::Cancelled)));
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn retry_stops_after_the_last_attempt() {
        let remote = Arc::new(MemoryRemote::new());
        let (inventory, engine) = device(&remote).await;
        inventory
            .create_storage_root(NewStorageRoot::new("Garage"))
            .await
            .unwrap();
        remote.set_offline(true);

        let err = engine.sync_with_retry().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.pull_calls(), 3);
        assert_eq!(engine.stats().retries, 2);
        assert_eq!(engine.state(), SyncState::Error);
        assert!(engine.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn background_loop_pushes_commits_and_stops() {
        let remote = Arc::new(MemoryRemote::new());
        let (inventory, engine) = device(&remote).await;
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run(shutdown).await }
        });

        inventory
            .create_storage_root(NewStorageRoot::new("Garage"))
            .await
            .unwrap();
        wait_for(|| inventory.persistence().unsent_len() == 0).await;
        assert!(!remote.is_empty("test"));

        stop.send_replace(true);
        task.await.unwrap();
    }
}
