//! The durability layer.
//!
//! [`Persistence`] owns the journal and the [`EntityStore`] rebuilt from it.
//! It commits pending local changes as one `Local` frame, records remote
//! merges and sync cursors, and keeps the history of committed but not yet
//! pushed changes for the sync engine.
//!
//! Lock order: the durable state lock is taken before the store's writer
//! lock, never the other way round.

use crate::change::Change;
use crate::clock::{HybridClock, TimeSource};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::graph::MergeReport;
use crate::journal::{Frame, Journal, Scan};
use crate::store::EntityStore;
use crate::types::{DeviceId, SequenceNumber};
use cachedb_storage::StorageBackend;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Commit lifecycle.
///
/// ```text
/// Idle -> Committing -> Committed -> Idle
///                    \-> Failed    -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// No commit in progress.
    Idle,
    /// Writing a frame.
    Committing,
    /// The last commit is durable.
    Committed,
    /// The last commit failed; its changes are pending again.
    Failed,
}

impl CommitState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: CommitState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Committing)
                | (Self::Committing, Self::Committed)
                | (Self::Committing, Self::Failed)
                | (Self::Committed, Self::Idle)
                | (Self::Failed, Self::Idle)
        )
    }
}

/// A local change with its assigned sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedChange {
    /// Position in this device's history.
    pub seq: SequenceNumber,
    /// The change.
    pub change: Change,
}

/// Sync progress, persisted in `Cursor` and `RemoteApplied` frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncCursor {
    /// Last local sequence number the remote acknowledged.
    pub sent_seq: SequenceNumber,
    /// Last remote cursor merged locally.
    pub remote: u64,
}

/// What a successful commit wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Changes written; zero for a no-op commit.
    pub changes: usize,
    /// Highest committed sequence number after the commit.
    pub last_seq: SequenceNumber,
}

/// Counts from replaying the journal on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Intact frames replayed.
    pub frames: usize,
    /// Local changes replayed.
    pub local_changes: usize,
    /// Remote changes replayed.
    pub remote_changes: usize,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

#[derive(Debug)]
struct Durable {
    journal: Journal,
    next_seq: SequenceNumber,
    history: VecDeque<CommittedChange>,
    cursor: SyncCursor,
    sync_enabled: bool,
    state: CommitState,
}

impl Durable {
    fn transition(&mut self, next: CommitState) {
        debug_assert!(self.state.can_transition_to(next), "{:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Appends `frame`, rolling the journal back on failure.
    fn write(&mut self, frame: &Frame) -> CoreResult<()> {
        let before = self.journal.size()?;
        if let Err(err) = self.journal.append(frame) {
            if let Err(rollback) = self.journal.truncate(before) {
                tracing::warn!(%rollback, "could not roll back partial journal frame");
            }
            return Err(err);
        }
        Ok(())
    }

    fn last_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.next_seq.get().saturating_sub(1))
    }
}

/// Journal-backed durability for one [`EntityStore`].
#[derive(Debug)]
pub struct Persistence {
    store: Arc<EntityStore>,
    durable: Mutex<Durable>,
    committed: watch::Sender<SequenceNumber>,
    device: DeviceId,
    created_ms: i64,
}

impl Persistence {
    /// Opens `backend` and rebuilds the store from its frames.
    ///
    /// A fresh journal gets an `Identity` frame with `config.device_id` or a
    /// new id. A torn trailing frame is truncated away.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the journal is damaged before its tail or does
    /// not start with an identity.
    pub fn recover(
        backend: Box<dyn StorageBackend>,
        config: &Config,
    ) -> CoreResult<(Self, RecoveryReport)> {
        let mut journal = Journal::new(backend, config.sync_on_commit);
        let Scan { entries, torn_at } = journal.scan()?;
        let mut report = RecoveryReport {
            frames: entries.len(),
            ..RecoveryReport::default()
        };

        if let Some(offset) = torn_at {
            let size = journal.size()?;
            report.truncated_bytes = size - offset;
            tracing::warn!(
                offset,
                bytes = report.truncated_bytes,
                "dropping torn journal tail"
            );
            journal.truncate(offset)?;
        }

        let mut frames = entries.into_iter().map(|e| e.frame);
        let (device, created_ms) = match frames.next() {
            Some(Frame::Identity { device, created_ms }) => (device, created_ms),
            Some(other) => {
                return Err(CoreError::unavailable(format!(
                    "journal starts with a {} frame, expected identity",
                    other.frame_type().name()
                )))
            }
            None => {
                let device = config.device_id.unwrap_or_default();
                let created_ms = config.time_source.now_ms();
                journal.append(&Frame::Identity { device, created_ms })?;
                (device, created_ms)
            }
        };
        if config.device_id.is_some_and(|d| d != device) {
            tracing::warn!(%device, "journal identity overrides configured device id");
        }

        let source: Arc<dyn TimeSource> = Arc::clone(&config.time_source);
        let store = Arc::new(EntityStore::new(HybridClock::new(device, source)));
        let mut durable = Durable {
            journal,
            next_seq: SequenceNumber::new(1),
            history: VecDeque::new(),
            cursor: SyncCursor::default(),
            sync_enabled: false,
            state: CommitState::Idle,
        };

        for frame in frames {
            match frame {
                Frame::Identity { .. } => {
                    return Err(CoreError::unavailable("duplicate identity frame"));
                }
                Frame::Local { first_seq, changes } => {
                    store.merge(&changes);
                    report.local_changes += changes.len();
                    let mut seq = first_seq;
                    for change in changes {
                        durable.history.push_back(CommittedChange { seq, change });
                        seq = seq.next();
                    }
                    durable.next_seq = durable.next_seq.max(seq);
                }
                Frame::RemoteApplied {
                    changes,
                    remote_cursor,
                } => {
                    store.merge(&changes);
                    report.remote_changes += changes.len();
                    durable.cursor.remote = remote_cursor;
                }
                Frame::Cursor {
                    sent_seq,
                    remote_cursor,
                } => {
                    durable.cursor = SyncCursor {
                        sent_seq,
                        remote: remote_cursor,
                    };
                }
                Frame::Settings { sync_enabled } => durable.sync_enabled = sync_enabled,
            }
        }
        let sent = durable.cursor.sent_seq;
        durable.history.retain(|c| c.seq > sent);

        tracing::info!(
            %device,
            frames = report.frames,
            local = report.local_changes,
            remote = report.remote_changes,
            unsent = durable.history.len(),
            "journal recovered"
        );

        let (committed, _) = watch::channel(durable.last_seq());
        Ok((
            Self {
                store,
                durable: Mutex::new(durable),
                committed,
                device,
                created_ms,
            },
            report,
        ))
    }

    /// The store this layer makes durable.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// This installation's device id.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// When the store was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Current commit state.
    pub fn state(&self) -> CommitState {
        self.durable.lock().state
    }

    /// Writes every pending change as one frame.
    ///
    /// On success the changes get consecutive sequence numbers, join the
    /// unsent history, and the new last sequence number is published to
    /// subscribers. With nothing pending this writes nothing.
    ///
    /// # Errors
    ///
    /// `CommitFailure` when the write fails. The journal is rolled back and
    /// every change is pending again, ahead of changes made since.
    pub fn commit(&self) -> CoreResult<CommitReceipt> {
        let mut durable = self.durable.lock();
        let changes = self.store.take_pending();
        if changes.is_empty() {
            return Ok(CommitReceipt {
                changes: 0,
                last_seq: durable.last_seq(),
            });
        }

        durable.transition(CommitState::Committing);
        let first_seq = durable.next_seq;
        let frame = Frame::Local {
            first_seq,
            changes: changes.clone(),
        };
        if let Err(err) = durable.write(&frame) {
            let count = changes.len();
            self.store.restore_pending(changes);
            durable.transition(CommitState::Failed);
            durable.transition(CommitState::Idle);
            let pending = self.store.pending_len();
            tracing::warn!(%err, changes = count, pending, "commit failed; changes kept pending");
            return Err(CoreError::CommitFailure {
                message: err.to_string(),
                pending,
            });
        }

        let count = changes.len();
        let mut seq = first_seq;
        for change in changes {
            durable.history.push_back(CommittedChange { seq, change });
            seq = seq.next();
        }
        durable.next_seq = seq;
        durable.transition(CommitState::Committed);
        let last_seq = durable.last_seq();
        tracing::debug!(first = %first_seq, last = %last_seq, changes = count, "commit durable");
        durable.transition(CommitState::Idle);
        drop(durable);

        self.committed.send_replace(last_seq);
        Ok(CommitReceipt {
            changes: count,
            last_seq,
        })
    }

    /// Durably records remote changes with the cursor they reach, then
    /// merges them into the store.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be written; nothing is merged then.
    pub fn apply_remote(&self, changes: Vec<Change>, remote_cursor: u64) -> CoreResult<MergeReport> {
        let mut durable = self.durable.lock();
        durable.write(&Frame::RemoteApplied {
            changes: changes.clone(),
            remote_cursor,
        })?;
        durable.cursor.remote = remote_cursor;
        let report = self.store.merge(&changes);
        tracing::debug!(
            applied = report.applied,
            ignored = report.ignored(),
            conflicts = report.conflicts.len(),
            remote_cursor,
            "remote changes merged"
        );
        Ok(report)
    }

    /// Records that the remote acknowledged everything up to `seq`.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be written; the cursor is unchanged then.
    pub fn mark_sent(&self, seq: SequenceNumber) -> CoreResult<()> {
        let mut durable = self.durable.lock();
        if seq <= durable.cursor.sent_seq {
            return Ok(());
        }
        let remote = durable.cursor.remote;
        durable.write(&Frame::Cursor {
            sent_seq: seq,
            remote_cursor: remote,
        })?;
        durable.cursor.sent_seq = seq;
        while durable.history.front().is_some_and(|c| c.seq <= seq) {
            durable.history.pop_front();
        }
        Ok(())
    }

    /// Resets the remote cursor to 0 so the next pull starts over.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be written.
    pub fn reset_remote_cursor(&self) -> CoreResult<()> {
        let mut durable = self.durable.lock();
        let sent_seq = durable.cursor.sent_seq;
        durable.write(&Frame::Cursor {
            sent_seq,
            remote_cursor: 0,
        })?;
        durable.cursor.remote = 0;
        Ok(())
    }

    /// Up to `limit` committed changes the remote has not acknowledged,
    /// oldest first.
    pub fn unsent(&self, limit: usize) -> Vec<CommittedChange> {
        self.durable
            .lock()
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of unacknowledged committed changes.
    pub fn unsent_len(&self) -> usize {
        self.durable.lock().history.len()
    }

    /// Current sync progress.
    pub fn cursor(&self) -> SyncCursor {
        self.durable.lock().cursor
    }

    /// Highest committed local sequence number.
    pub fn last_committed(&self) -> SequenceNumber {
        self.durable.lock().last_seq()
    }

    /// The persisted sync flag.
    pub fn sync_enabled(&self) -> bool {
        self.durable.lock().sync_enabled
    }

    /// Persists the sync flag. Setting the current value writes nothing.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be written.
    pub fn set_sync_enabled(&self, enabled: bool) -> CoreResult<()> {
        let mut durable = self.durable.lock();
        if durable.sync_enabled == enabled {
            return Ok(());
        }
        durable.write(&Frame::Settings {
            sync_enabled: enabled,
        })?;
        durable.sync_enabled = enabled;
        tracing::info!(enabled, "sync setting changed");
        Ok(())
    }

    /// Receives the last committed sequence number after every commit.
    pub fn subscribe(&self) -> watch::Receiver<SequenceNumber> {
        self.committed.subscribe()
    }

    /// Reads back every frame in the journal.
    ///
    /// # Errors
    ///
    /// See [`Journal::scan`].
    pub fn scan(&self) -> CoreResult<Scan> {
        self.durable.lock().journal.scan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::model::{EntityKind, Field};
    use cachedb_codec::Value;
    use cachedb_storage::{FaultyBackend, InMemoryBackend};

    fn config() -> Config {
        Config::in_memory().time_source(ManualTimeSource::starting_at(5_000))
    }

    fn tag(p: &Persistence, name: &str) {
        p.store()
            .insert(EntityKind::Tag, [(Field::Name, Value::from(name))])
            .unwrap();
    }

    #[test]
    fn fresh_journal_gets_identity() {
        let device = DeviceId::new();
        let backend = InMemoryBackend::new();
        let (p, report) =
            Persistence::recover(Box::new(backend.clone()), &config().device_id(device)).unwrap();
        assert_eq!(p.device(), device);
        assert_eq!(report.frames, 0);
        let scan = p.scan().unwrap();
        assert!(matches!(scan.entries[0].frame, Frame::Identity { .. }));
    }

    #[test]
    fn commit_assigns_consecutive_seqs() {
        let (p, _) = Persistence::recover(Box::new(InMemoryBackend::new()), &config()).unwrap();
        tag(&p, "a");
        tag(&p, "b");
        let receipt = p.commit().unwrap();
        assert_eq!(receipt.changes, 2);
        assert_eq!(receipt.last_seq, SequenceNumber::new(2));
        let unsent = p.unsent(10);
        assert_eq!(unsent[0].seq, SequenceNumber::new(1));
        assert_eq!(unsent[1].seq, SequenceNumber::new(2));
        assert_eq!(p.commit().unwrap().changes, 0);
        assert_eq!(p.state(), CommitState::Idle);
    }

    #[test]
    fn failed_commit_keeps_changes_pending_and_journal_clean() {
        let (faulty, plan) = FaultyBackend::new(InMemoryBackend::new());
        let (p, _) = Persistence::recover(Box::new(faulty), &config()).unwrap();
        tag(&p, "a");
        let size = p.durable.lock().journal.size().unwrap();

        plan.tear_writes(true);
        plan.fail_appends(1);
        let err = p.commit().unwrap_err();
        assert!(matches!(err, CoreError::CommitFailure { pending: 1, .. }));
        assert_eq!(p.store().pending_len(), 1);
        assert_eq!(p.durable.lock().journal.size().unwrap(), size);
        assert_eq!(p.last_committed(), SequenceNumber::ZERO);

        plan.clear();
        assert_eq!(p.commit().unwrap().changes, 1);
        assert_eq!(p.store().pending_len(), 0);
    }

    #[test]
    fn state_survives_reopen() {
        let backend = InMemoryBackend::new();
        let (p, _) = Persistence::recover(Box::new(backend.clone()), &config()).unwrap();
        tag(&p, "a");
        tag(&p, "b");
        p.commit().unwrap();
        p.mark_sent(SequenceNumber::new(1)).unwrap();
        p.set_sync_enabled(true).unwrap();
        let device = p.device();
        let snapshot = p.store().snapshot();
        drop(p);

        let (reopened, report) = Persistence::recover(Box::new(backend), &config()).unwrap();
        assert_eq!(reopened.device(), device);
        assert_eq!(report.local_changes, 2);
        assert!(reopened.sync_enabled());
        assert_eq!(reopened.cursor().sent_seq, SequenceNumber::new(1));
        assert_eq!(reopened.unsent_len(), 1);
        assert_eq!(reopened.last_committed(), SequenceNumber::new(2));
        assert_eq!(reopened.store().snapshot().graph(), snapshot.graph());
    }

    #[test]
    fn subscribers_see_commits() {
        let (p, _) = Persistence::recover(Box::new(InMemoryBackend::new()), &config()).unwrap();
        let mut rx = p.subscribe();
        tag(&p, "a");
        p.commit().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SequenceNumber::new(1));
    }

    #[test]
    fn remote_changes_are_not_unsent() {
        let (source, _) = Persistence::recover(Box::new(InMemoryBackend::new()), &config()).unwrap();
        tag(&source, "remote");
        source.commit().unwrap();
        let remote: Vec<_> = source.unsent(10).into_iter().map(|c| c.change).collect();

        let (p, _) = Persistence::recover(Box::new(InMemoryBackend::new()), &config()).unwrap();
        let report = p.apply_remote(remote, 7).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(p.unsent_len(), 0);
        assert_eq!(p.cursor().remote, 7);
        p.reset_remote_cursor().unwrap();
        assert_eq!(p.cursor().remote, 0);
    }

    #[test]
    fn state_machine_transitions() {
        use CommitState::*;
        assert!(Idle.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Committed));
        assert!(!Failed.can_transition_to(Committed));
    }
}
