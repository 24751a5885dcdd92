//! Multi-device scenarios against an in-process remote zone.

use cachedb_core::{
    Config, ConflictKind, EntityId, Inventory, ItemUpdate, ManualTimeSource, NewItem,
    NewStorageRoot, SyncCursor,
};
use cachedb_sync_engine::{
    MemoryRemote, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncOutcome, SyncReport,
    SyncState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const ZONE: &str = "inventory";

struct Device {
    inventory: Inventory,
    engine: Arc<SyncEngine<MemoryRemote>>,
    clock: Arc<ManualTimeSource>,
}

impl Device {
    async fn new(remote: &Arc<MemoryRemote>, start_ms: i64) -> Self {
        let clock = ManualTimeSource::starting_at(start_ms);
        let inventory = Inventory::open(Config::in_memory().time_source(clock.clone()))
            .await
            .unwrap();
        inventory.set_sync_enabled(true).await.unwrap();
        Self::attach(inventory, remote, clock)
    }

    fn attach(inventory: Inventory, remote: &Arc<MemoryRemote>, clock: Arc<ManualTimeSource>) -> Self {
        let config = SyncConfig::new(ZONE).with_pull_batch_size(4).with_retry(
            RetryConfig::new(4)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let engine = Arc::new(SyncEngine::new(
            config,
            Arc::clone(inventory.persistence()),
            Arc::clone(remote),
        ));
        Self {
            inventory,
            engine,
            clock,
        }
    }

    async fn sync(&self) -> SyncReport {
        match self.engine.sync_once().await.unwrap() {
            SyncOutcome::Synced(report) => report,
            SyncOutcome::Disabled => panic!("sync unexpectedly disabled"),
        }
    }
}

async fn shared_item(a: &Device, b: &Device) -> EntityId {
    let root = a
        .inventory
        .create_storage_root(NewStorageRoot::new("Garage"))
        .await
        .unwrap();
    let item = a
        .inventory
        .create_item(NewItem::new("Drill").in_root(root).description("cordless"))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;
    assert!(b.inventory.snapshot().item(&item).is_some());
    item
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

#[tokio::test]
async fn two_devices_converge() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;

    let root = a
        .inventory
        .create_storage_root(NewStorageRoot::new("Garage"))
        .await
        .unwrap();
    let storage_box = a.inventory.create_box(root, "Bits").await.unwrap();
    for name in ["Drill", "Saw", "Level"] {
        a.inventory
            .create_item(NewItem::new(name).in_root(root).in_box(storage_box))
            .await
            .unwrap();
    }
    let pushed = a.sync().await.pushed;
    assert_eq!(pushed, remote.len(ZONE));

    // Pull pages of four until the zone is drained
    let report = b.sync().await;
    assert_eq!(report.pulled, pushed);
    assert!(remote.pull_calls() > 2);

    let snapshot = b.inventory.snapshot();
    assert_eq!(snapshot.items_in_box(&storage_box).len(), 3);
    assert_eq!(snapshot.storage_root(&root).unwrap().name, "Garage");
    assert_eq!(*snapshot.graph(), *a.inventory.snapshot().graph());
}

#[tokio::test]
async fn own_changes_are_skipped_on_pull() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    a.inventory.create_tag("Fragile", None).await.unwrap();
    a.sync().await;

    let report = a.sync().await;
    assert_eq!(report.pulled, 1);
    assert_eq!(report.skipped_own, 1);
    assert_eq!(report.merged, 0);
    assert_eq!(a.engine.persistence().cursor().remote, 1);
}

#[tokio::test]
async fn later_edit_wins_on_every_device() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    let item = shared_item(&a, &b).await;

    a.clock.set(5_000);
    a.inventory
        .update_item(item, ItemUpdate::default().name("Drill (A)"))
        .await
        .unwrap();
    b.clock.set(6_000);
    b.inventory
        .update_item(item, ItemUpdate::default().name("Drill (B)"))
        .await
        .unwrap();

    a.sync().await;
    let report = b.sync().await;
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::ConcurrentWrite);
    a.sync().await;

    for device in [&a, &b] {
        assert_eq!(device.inventory.snapshot().item(&item).unwrap().name, "Drill (B)");
    }
    assert!(b.engine.stats().conflicts >= 1);
}

#[tokio::test]
async fn remote_edit_outlives_local_delete() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    let item = shared_item(&a, &b).await;

    // The edit is older than the delete but the deleter never saw it
    b.clock.set(2_000);
    b.inventory
        .update_item(item, ItemUpdate::default().description(Some("corded".into())))
        .await
        .unwrap();
    a.clock.set(9_000);
    a.inventory.delete_item(item).await.unwrap();
    assert!(a.inventory.snapshot().item(&item).is_none());

    a.sync().await;
    b.sync().await;
    let report = a.sync().await;
    assert_eq!(report.resurrected, vec![item]);

    for device in [&a, &b] {
        let restored = device.inventory.snapshot().item(&item).unwrap();
        assert_eq!(restored.name, "Drill");
        assert_eq!(restored.description.as_deref(), Some("corded"));
    }
}

#[tokio::test]
async fn remote_item_edit_outlives_a_root_delete() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    let item = shared_item(&a, &b).await;
    let root = a.inventory.snapshot().item(&item).unwrap().root;

    b.clock.set(2_000);
    b.inventory
        .update_item(item, ItemUpdate::default().description(Some("corded".into())))
        .await
        .unwrap();
    a.clock.set(9_000);
    a.inventory.delete_storage_root(root).await.unwrap();
    assert!(a.inventory.snapshot().storage_roots().is_empty());

    a.sync().await;
    b.sync().await;
    let report = a.sync().await;
    assert_eq!(report.resurrected, vec![item, root]);

    for device in [&a, &b] {
        let snapshot = device.inventory.snapshot();
        let restored = snapshot.item(&item).unwrap();
        assert_eq!(restored.root, root);
        assert_eq!(restored.description.as_deref(), Some("corded"));
        assert_eq!(snapshot.storage_roots().len(), 1);
        assert_eq!(snapshot.items_in(&root).len(), 1);
    }
    assert_eq!(*a.inventory.snapshot().graph(), *b.inventory.snapshot().graph());
}

#[tokio::test]
async fn remote_move_and_tag_outlive_a_local_delete() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    let item = shared_item(&a, &b).await;
    let root = b.inventory.snapshot().item(&item).unwrap().root;

    b.clock.set(2_000);
    let storage_box = b.inventory.create_box(root, "Bits").await.unwrap();
    let tag = b.inventory.create_tag("Fragile", None).await.unwrap();
    b.inventory.move_item(item, Some(storage_box)).await.unwrap();
    b.inventory.attach_tag(item, tag).await.unwrap();
    a.clock.set(9_000);
    a.inventory.delete_item(item).await.unwrap();

    a.sync().await;
    b.sync().await;
    let report = a.sync().await;
    assert_eq!(report.resurrected, vec![item]);

    for device in [&a, &b] {
        let snapshot = device.inventory.snapshot();
        let restored = snapshot.item(&item).unwrap();
        assert_eq!(restored.storage_box, Some(storage_box));
        assert_eq!(restored.tags, vec![tag]);
        assert_eq!(snapshot.items_in_box(&storage_box).len(), 1);
    }
}

#[tokio::test]
async fn replaying_the_zone_changes_nothing() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let fresh = Device::new(&remote, 1_000).await;
    shared_item(&a, &fresh).await;
    let once = fresh.inventory.snapshot().graph().clone();

    fresh.engine.persistence().reset_remote_cursor().unwrap();
    let replay = fresh.sync().await;
    assert!(replay.pulled > 0);
    assert_eq!(replay.merged, 0);
    assert_eq!(*fresh.inventory.snapshot().graph(), once);
}

#[tokio::test]
async fn disabled_sync_never_builds_a_batch() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    a.inventory.set_sync_enabled(false).await.unwrap();

    let root = a
        .inventory
        .create_storage_root(NewStorageRoot::new("Garage"))
        .await
        .unwrap();
    for i in 0..25 {
        a.inventory
            .create_item(NewItem::new(format!("Item {i}")).in_root(root))
            .await
            .unwrap();
    }

    for _ in 0..3 {
        assert!(matches!(
            a.engine.sync_once().await.unwrap(),
            SyncOutcome::Disabled
        ));
    }
    assert_eq!(a.engine.state(), SyncState::Disabled);
    assert_eq!(a.engine.stats().batches_built, 0);
    assert_eq!(remote.push_calls() + remote.pull_calls(), 0);
    assert!(matches!(
        a.engine.erase_remote_data().await,
        Err(SyncError::Disabled)
    ));
    assert_eq!(remote.erase_calls(), 0);

    // The flag is re-read each cycle, so no new engine is needed
    a.inventory.set_sync_enabled(true).await.unwrap();
    let report = a.sync().await;
    assert!(report.pushed > 25);
    assert!(a.engine.stats().batches_built >= 1);
}

#[tokio::test]
async fn cancelled_pull_leaves_the_cursor_alone() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    a.inventory.create_tag("Fragile", None).await.unwrap();
    a.sync().await;

    remote.set_stalled(true);
    let pulls = remote.pull_calls();
    let running = tokio::spawn({
        let engine = Arc::clone(&b.engine);
        async move { engine.sync_once().await }
    });
    wait_for(|| remote.pull_calls() > pulls).await;
    b.engine.cancel();

    assert!(matches!(running.await.unwrap(), Err(SyncError::Cancelled)));
    assert_eq!(b.engine.state(), SyncState::Idle);
    assert_eq!(b.engine.persistence().cursor(), SyncCursor::default());
    assert!(b.inventory.snapshot().tags().is_empty());

    // The next attempt resumes from the same point
    remote.set_stalled(false);
    b.sync().await;
    assert_eq!(b.inventory.snapshot().tags()[0].name, "Fragile");
}

#[tokio::test]
async fn cancel_mid_pull_keeps_merged_pages() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    for i in 0..10 {
        a.inventory.create_tag(&format!("Tag {i}"), None).await.unwrap();
    }
    a.sync().await;
    assert_eq!(remote.len(ZONE), 10);

    // The first page of four goes through, the second hangs
    remote.stall_after(1);
    let pulls = remote.pull_calls();
    let running = tokio::spawn({
        let engine = Arc::clone(&b.engine);
        async move { engine.sync_once().await }
    });
    wait_for(|| remote.pull_calls() >= pulls + 2).await;
    b.engine.cancel();

    assert!(matches!(running.await.unwrap(), Err(SyncError::Cancelled)));
    assert_eq!(b.engine.persistence().cursor().remote, 4);
    assert_eq!(b.inventory.snapshot().tags().len(), 4);

    remote.set_stalled(false);
    let report = b.sync().await;
    assert_eq!(report.pulled, 6);
    assert_eq!(b.inventory.snapshot().tags().len(), 10);
    assert_eq!(b.engine.persistence().cursor().remote, 10);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    a.inventory.create_tag("Fragile", None).await.unwrap();

    remote.fail_next(2);
    let outcome = a.engine.sync_with_retry().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);
    assert_eq!(a.engine.stats().retries, 2);
    assert_eq!(a.engine.state(), SyncState::Synced);
    assert_eq!(remote.len(ZONE), 1);
}

#[tokio::test]
async fn failed_push_is_resent() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    a.inventory.create_tag("Fragile", None).await.unwrap();

    a.engine.sync_once().await.unwrap();
    a.inventory.create_tag("Heavy", None).await.unwrap();
    // The remote goes away with a change still unsent
    remote.set_offline(true);
    assert!(a.engine.sync_once().await.unwrap_err().is_retryable());
    assert_eq!(a.engine.state(), SyncState::Error);
    assert_eq!(a.engine.persistence().unsent_len(), 1);

    remote.set_offline(false);
    assert_eq!(a.sync().await.pushed, 1);
    assert_eq!(remote.len(ZONE), 2);
}

#[tokio::test]
async fn erase_clears_the_zone_but_not_local_data() {
    let remote = Arc::new(MemoryRemote::new());
    let a = Device::new(&remote, 1_000).await;
    let b = Device::new(&remote, 1_000).await;
    shared_item(&a, &b).await;
    let stored = remote.len(ZONE) as u64;
    let sent = a.engine.persistence().cursor().sent_seq;

    let ack = a.engine.erase_remote_data().await.unwrap();
    assert_eq!(ack.erased, stored);
    assert!(remote.is_empty(ZONE));

    let cursor = a.engine.persistence().cursor();
    assert_eq!(cursor.remote, 0);
    assert_eq!(cursor.sent_seq, sent);
    assert_eq!(a.inventory.snapshot().storage_roots().len(), 1);

    // A device syncing afterwards keeps what it already had
    let report = b.sync().await;
    assert_eq!(report.pulled, 0);
    assert_eq!(b.inventory.snapshot().storage_roots().len(), 1);
}

#[tokio::test]
async fn progress_survives_a_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("store");
    let remote = Arc::new(MemoryRemote::new());
    let clock = ManualTimeSource::starting_at(1_000);
    let config = || {
        Config::directory(&path)
            .sync_on_commit(false)
            .time_source(clock.clone())
    };

    let pushed = {
        let inventory = Inventory::open(config()).await.unwrap();
        inventory.set_sync_enabled(true).await.unwrap();
        let device = Device::attach(inventory, &remote, clock.clone());
        device
            .inventory
            .create_storage_root(NewStorageRoot::new("Attic"))
            .await
            .unwrap();
        device.sync().await.pushed
    };
    assert!(pushed > 0);
    let push_calls = remote.push_calls();

    let inventory = Inventory::open(config()).await.unwrap();
    assert!(inventory.sync_enabled());
    let device = Device::attach(inventory, &remote, clock.clone());
    let cursor = device.engine.persistence().cursor();
    assert_eq!(cursor.sent_seq, device.engine.persistence().last_committed());
    // The only cycle pulled before it pushed
    assert_eq!(cursor.remote, 0);

    let report = device.sync().await;
    assert_eq!(report.pushed, 0);
    assert_eq!(report.skipped_own, pushed);
    assert_eq!(report.merged, 0);
    assert_eq!(remote.push_calls(), push_calls);
}
