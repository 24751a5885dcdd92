//! The remote record zone.
//!
//! [`RemoteStore`] abstracts the service so the engine can run against a
//! real backend or the in-process [`MemoryRemote`].

use crate::error::{SyncError, SyncResult};
use cachedb_sync_protocol::{
    ChangeBatch, Decode, Encode, EraseAck, EraseRequest, PullRequest, PullResponse, PushAck,
    PushRequest, SyncChange, SyncMessage,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::watch;

/// A remote zone service.
pub trait RemoteStore: Send + Sync {
    /// Stores a device's changes. Re-sent rows are acknowledged but not stored twice.
    fn push_changes(&self, request: PushRequest) -> impl Future<Output = SyncResult<PushAck>> + Send;

    /// Returns changes stored after `request.since`.
    fn pull_changes(
        &self,
        request: PullRequest,
    ) -> impl Future<Output = SyncResult<PullResponse>> + Send;

    /// Removes every record in the zone. Irreversible.
    fn erase_all_remote_data(
        &self,
        request: EraseRequest,
    ) -> impl Future<Output = SyncResult<EraseAck>> + Send;
}

#[derive(Debug, Default)]
struct Zone {
    /// `(server cursor, encoded row)` in arrival order.
    rows: Vec<(u64, Vec<u8>)>,
    seen: HashSet<([u8; 16], u64)>,
    acked: HashMap<[u8; 16], u64>,
    /// Last assigned cursor. Survives erasure so cursors never repeat.
    cursor: u64,
}

/// An in-process zone service.
///
/// Requests and responses pass through their [`SyncMessage`] byte form, so
/// a round trip exercises the same codec a network transport would.
#[derive(Debug)]
pub struct MemoryRemote {
    zones: Mutex<HashMap<String, Zone>>,
    offline: AtomicBool,
    failures: AtomicU32,
    stalled: watch::Sender<bool>,
    stall_after: Mutex<Option<u32>>,
    push_calls: AtomicU64,
    pull_calls: AtomicU64,
    erase_calls: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// An empty service.
    pub fn new() -> Self {
        Self {
            zones: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            stalled: watch::Sender::new(false),
            stall_after: Mutex::new(None),
            push_calls: AtomicU64::new(0),
            pull_calls: AtomicU64::new(0),
            erase_calls: AtomicU64::new(0),
        }
    }

    /// While offline every call fails with a retryable transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next `n` calls with a retryable transport error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// While stalled, calls wait without completing.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }

    /// Lets the next `n` calls through, then stalls like
    /// [`set_stalled(true)`](Self::set_stalled).
    pub fn stall_after(&self, n: u32) {
        *self.stall_after.lock() = Some(n);
    }

    /// Push calls received, including failed ones.
    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Pull calls received, including failed ones.
    pub fn pull_calls(&self) -> u64 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Erase calls received, including failed ones.
    pub fn erase_calls(&self) -> u64 {
        self.erase_calls.load(Ordering::SeqCst)
    }

    /// Rows stored in `zone`.
    pub fn len(&self, zone: &str) -> usize {
        self.zones.lock().get(zone).map_or(0, |z| z.rows.len())
    }

    /// True if `zone` stores nothing.
    pub fn is_empty(&self, zone: &str) -> bool {
        self.len(zone) == 0
    }

    /// Decoded rows of `zone`, oldest first.
    pub fn rows(&self, zone: &str) -> SyncResult<Vec<SyncChange>> {
        let zones = self.zones.lock();
        let Some(z) = zones.get(zone) else {
            return Ok(Vec::new());
        };
        z.rows
            .iter()
            .map(|(_, bytes)| SyncChange::decode(bytes).map_err(SyncError::from))
            .collect()
    }

    /// Handles one encoded request and returns the encoded response.
    ///
    /// # Errors
    ///
    /// `Protocol` for undecodable input or a response type sent as a request.
    pub fn handle(&self, request: &[u8]) -> SyncResult<Vec<u8>> {
        let response = match SyncMessage::decode(request)? {
            SyncMessage::PushRequest(req) => SyncMessage::PushAck(self.push(req)?),
            SyncMessage::PullRequest(req) => SyncMessage::PullResponse(self.pull(&req)?),
            SyncMessage::EraseRequest(req) => SyncMessage::EraseAck(self.erase(req)),
            other => {
                return Err(SyncError::Protocol(format!(
                    "message type {} is not a request",
                    other.type_code()
                )))
            }
        };
        Ok(response.encode())
    }

    fn push(&self, request: PushRequest) -> SyncResult<PushAck> {
        if let Some(row) = request.batch.changes.iter().find(|r| r.device_id != request.device_id) {
            return Err(SyncError::transport_fatal(format!(
                "row seq {} was written by another device",
                row.seq
            )));
        }
        let mut zones = self.zones.lock();
        let zone = zones.entry(request.zone).or_default();
        let mut ack = PushAck::default();
        for row in &request.batch.changes {
            if zone.seen.insert((row.device_id, row.seq)) {
                zone.cursor += 1;
                zone.rows.push((zone.cursor, row.encode()));
                ack.accepted += 1;
            } else {
                ack.duplicates += 1;
            }
        }
        let acked = zone.acked.entry(request.device_id).or_insert(0);
        if let Some(last) = request.batch.last_seq_from(&request.device_id) {
            *acked = (*acked).max(last);
        }
        ack.acked_seq = *acked;
        ack.server_cursor = zone.cursor;
        Ok(ack)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let zones = self.zones.lock();
        let Some(zone) = zones.get(&request.zone) else {
            return Ok(PullResponse {
                batch: ChangeBatch::default(),
                new_cursor: request.since,
                has_more: false,
            });
        };
        let limit = request.limit as usize;
        let mut after = zone.rows.iter().filter(|(cursor, _)| *cursor > request.since);
        let mut changes = Vec::new();
        let mut new_cursor = request.since;
        for (cursor, bytes) in after.by_ref().take(limit) {
            changes.push(SyncChange::decode(bytes)?);
            new_cursor = *cursor;
        }
        Ok(PullResponse {
            batch: ChangeBatch::new(changes),
            new_cursor,
            has_more: after.next().is_some(),
        })
    }

    fn erase(&self, request: EraseRequest) -> EraseAck {
        let mut zones = self.zones.lock();
        let erased = zones.get_mut(&request.zone).map_or(0, |zone| {
            let erased = zone.rows.len() as u64;
            zone.rows.clear();
            zone.seen.clear();
            zone.acked.clear();
            erased
        });
        EraseAck {
            zone: request.zone,
            erased,
        }
    }

    async fn admit(&self, calls: &AtomicU64) -> SyncResult<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut countdown = self.stall_after.lock();
            match *countdown {
                Some(0) => {
                    *countdown = None;
                    self.stalled.send_replace(true);
                }
                Some(n) => *countdown = Some(n - 1),
                None => {}
            }
        }
        let mut stalled = self.stalled.subscribe();
        loop {
            let now = *stalled.borrow_and_update();
            if !now || stalled.changed().await.is_err() {
                break;
            }
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("remote unreachable"));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::transport_retryable("remote request failed"));
        }
        Ok(())
    }

    fn exchange(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        let reply = self.handle(&request.encode())?;
        Ok(SyncMessage::decode(&reply)?)
    }
}

fn unexpected(message: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("unexpected reply type {}", message.type_code()))
}

impl RemoteStore for MemoryRemote {
    fn push_changes(&self, request: PushRequest) -> impl Future<Output = SyncResult<PushAck>> + Send {
        async move {
            self.admit(&self.push_calls).await?;
            match self.exchange(SyncMessage::PushRequest(request))? {
                SyncMessage::PushAck(ack) => Ok(ack),
                other => Err(unexpected(&other)),
            }
        }
    }

    fn pull_changes(
        &self,
        request: PullRequest,
    ) -> impl Future<Output = SyncResult<PullResponse>> + Send {
        async move {
            self.admit(&self.pull_calls).await?;
            match self.exchange(SyncMessage::PullRequest(request))? {
                SyncMessage::PullResponse(response) => Ok(response),
                other => Err(unexpected(&other)),
            }
        }
    }

    fn erase_all_remote_data(
        &self,
        request: EraseRequest,
    ) -> impl Future<Output = SyncResult<EraseAck>> + Send {
        async move {
            self.admit(&self.erase_calls).await?;
            match self.exchange(SyncMessage::EraseRequest(request))? {
                SyncMessage::EraseAck(ack) => Ok(ack),
                other => Err(unexpected(&other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "inventory";

    fn row(device: u8, seq: u64) -> SyncChange {
        SyncChange {
            entity_id: [seq as u8; 16],
            entity_type: "tag".into(),
            field_or_relation: "name".into(),
            new_value: vec![0x61, 0x61],
            wall_ms: 1_000 + seq as i64,
            counter: 0,
            device_id: [device; 16],
            seq,
        }
    }

    fn push(device: u8, seqs: &[u64]) -> PushRequest {
        PushRequest {
            zone: ZONE.into(),
            device_id: [device; 16],
            batch: ChangeBatch::new(seqs.iter().map(|s| row(device, *s)).collect()),
        }
    }

    fn pull(since: u64, limit: u32) -> PullRequest {
        PullRequest {
            zone: ZONE.into(),
            since,
            limit,
        }
    }

    #[tokio::test]
    async fn resent_rows_are_acknowledged_once() {
        let remote = MemoryRemote::new();
        let first = remote.push_changes(push(1, &[1, 2])).await.unwrap();
        assert_eq!((first.accepted, first.duplicates, first.acked_seq), (2, 0, 2));

        let again = remote.push_changes(push(1, &[2, 3])).await.unwrap();
        assert_eq!((again.accepted, again.duplicates, again.acked_seq), (1, 1, 3));
        assert_eq!(again.server_cursor, 3);
        assert_eq!(remote.len(ZONE), 3);
    }

    #[tokio::test]
    async fn pulls_page_through_the_zone() {
        let remote = MemoryRemote::new();
        remote.push_changes(push(1, &[1, 2, 3])).await.unwrap();

        let page = remote.pull_changes(pull(0, 2)).await.unwrap();
        assert_eq!(page.batch.len(), 2);
        assert_eq!(page.new_cursor, 2);
        assert!(page.has_more);

        let rest = remote.pull_changes(pull(page.new_cursor, 2)).await.unwrap();
        assert_eq!(rest.batch.changes[0].seq, 3);
        assert!(!rest.has_more);

        let none = remote.pull_changes(pull(rest.new_cursor, 2)).await.unwrap();
        assert!(none.batch.is_empty());
        assert_eq!(none.new_cursor, rest.new_cursor);
    }

    #[tokio::test]
    async fn erase_empties_the_zone_without_reusing_cursors() {
        let remote = MemoryRemote::new();
        remote.push_changes(push(1, &[1, 2])).await.unwrap();
        let ack = remote
            .erase_all_remote_data(EraseRequest { zone: ZONE.into() })
            .await
            .unwrap();
        assert_eq!(ack.erased, 2);
        assert!(remote.is_empty(ZONE));

        // The same rows may be pushed again after an erase
        let ack = remote.push_changes(push(1, &[1])).await.unwrap();
        assert_eq!(ack.accepted, 1);
        assert_eq!(ack.server_cursor, 3);
    }

    #[tokio::test]
    async fn faults_are_retryable_transport_errors() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        let err = remote.pull_changes(pull(0, 10)).await.unwrap_err();
        assert!(err.is_retryable());
        remote.set_offline(false);

        remote.fail_next(1);
        assert!(remote.pull_changes(pull(0, 10)).await.is_err());
        assert!(remote.pull_changes(pull(0, 10)).await.is_ok());
        assert_eq!(remote.pull_calls(), 3);
    }

    #[tokio::test]
    async fn stall_engages_after_the_allowed_calls() {
        let remote = std::sync::Arc::new(MemoryRemote::new());
        remote.push_changes(push(1, &[1])).await.unwrap();
        remote.stall_after(1);
        assert!(remote.pull_changes(pull(0, 10)).await.is_ok());

        let stuck = tokio::spawn({
            let remote = std::sync::Arc::clone(&remote);
            async move { remote.pull_changes(pull(0, 10)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!stuck.is_finished());

        remote.set_stalled(false);
        assert_eq!(stuck.await.unwrap().unwrap().batch.len(), 1);
    }

    #[tokio::test]
    async fn rows_from_another_device_are_refused() {
        let remote = MemoryRemote::new();
        let mut request = push(1, &[1]);
        request.batch.changes.push(row(2, 1));
        let err = remote.push_changes(request).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(remote.is_empty(ZONE));
    }

    #[test]
    fn acks_are_not_requests() {
        let remote = MemoryRemote::new();
        let bytes = SyncMessage::PushAck(PushAck::default()).encode();
        assert!(matches!(remote.handle(&bytes), Err(SyncError::Protocol(_))));
        assert!(remote.handle(&[0xff]).is_err());
    }
}
