use super::*;

use futures::FutureExt;

const H: Ts = 3600;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("castslot_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn seed(slots: i64, capacity: u32) -> CalendarSpec {
    CalendarSpec {
        horizon: Span::new(0, slots * H),
        slot_secs: H,
        capacity,
    }
}

fn open(path: &PathBuf, slots: i64, capacity: u32) -> Arc<Store> {
    Arc::new(Store::open(path.clone(), &seed(slots, capacity), Duration::from_millis(200)).unwrap())
}

fn new_user(name: &str) -> NewUser {
    NewUser {
        name: name.into(),
        display_name: name.to_uppercase(),
        description: format!("{name}'s channel"),
        password_hash: "hashed".into(),
        dark_mode: false,
    }
}

fn request(span: Span, tag_ids: Vec<TagId>) -> ReservationRequest {
    ReservationRequest {
        start_at: span.start,
        end_at: span.end,
        tag_ids,
        meta: BroadcastMeta {
            title: "show".into(),
            ..Default::default()
        },
    }
}

async fn reserve(store: &Arc<Store>, owner: UserId, span: Span) -> Broadcast {
    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    tx.decrement_range(span).unwrap();
    tx.insert_broadcast(owner, &request(span, vec![])).unwrap();
    tx.commit().await.unwrap().unwrap()
}

fn capacities(store: &Store) -> Vec<u32> {
    store.slots().iter().map(|s| s.remaining_capacity).collect()
}

#[tokio::test]
async fn seeds_calendar_on_first_open() {
    let path = test_wal_path("seed.wal");
    let store = open(&path, 4, 5);
    assert_eq!(capacities(&store), vec![5, 5, 5, 5]);
    assert_eq!(store.calendar().bounds(), Some(Span::new(0, 4 * H)));
}

#[tokio::test]
async fn reopen_keeps_existing_calendar() {
    let path = test_wal_path("reopen.wal");
    {
        let store = open(&path, 3, 2);
        let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
        reserve(&store, alice.id, Span::new(0, H)).await;
    }
    // A different seed is ignored once the log holds a calendar.
    let store = open(&path, 10, 9);
    assert_eq!(capacities(&store), vec![1, 2, 2]);
}

#[tokio::test]
async fn replay_rebuilds_state() {
    let path = test_wal_path("replay.wal");
    let (slots, broadcasts, alice_id) = {
        let store = open(&path, 6, 2);
        let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
        let (bob, _) = store.insert_user(new_user("bob")).await.unwrap();
        let tag = store.insert_tag("music".into()).await.unwrap();
        store.set_theme(alice.id, true).await.unwrap();
        store.replace_icon(bob.id, vec![1, 2, 3]).await.unwrap();

        let span = Span::new(H, 3 * H);
        let mut tx = store.begin().await.unwrap();
        tx.lock_range(span).await.unwrap();
        tx.decrement_range(span).unwrap();
        tx.insert_broadcast(alice.id, &request(span, vec![tag.id])).unwrap();
        tx.commit().await.unwrap();
        reserve(&store, bob.id, Span::new(2 * H, 4 * H)).await;

        (store.slots(), store.broadcasts(), alice.id)
    };

    let store = open(&path, 6, 2);
    assert_eq!(store.slots(), slots);
    assert_eq!(capacities(&store), vec![2, 1, 0, 1, 2, 2]);
    assert_eq!(store.broadcasts(), broadcasts);
    assert_eq!(store.broadcasts_by_owner(alice_id).len(), 1);
    assert_eq!(store.broadcasts_by_owner(alice_id)[0].tag_ids.len(), 1);
    assert!(store.theme(alice_id).unwrap().dark_mode);
    assert_eq!(store.user_by_name("bob").map(|u| u.id), Some(2));
    assert_eq!(store.icon(2).map(|i| i.image), Some(vec![1, 2, 3]));
    assert_eq!(store.tags().len(), 1);
}

#[tokio::test]
async fn rollback_leaves_nothing_behind() {
    let path = test_wal_path("rollback.wal");
    let store = open(&path, 3, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();

    let span = Span::new(0, 2 * H);
    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    tx.decrement_range(span).unwrap();
    let staged = tx.insert_broadcast(alice.id, &request(span, vec![])).unwrap();
    tx.rollback();

    assert_eq!(capacities(&store), vec![1, 1, 1]);
    assert_eq!(store.broadcast_count(), 0);
    assert!(store.broadcast(staged.id).is_none());

    // Ids consumed by the rolled-back insert are not reused.
    let b = reserve(&store, alice.id, span).await;
    assert_eq!(b.id, staged.id + 1);
}

#[tokio::test]
async fn lock_timeout_releases_partial_locks() {
    let path = test_wal_path("lock_timeout.wal");
    let store = open(&path, 4, 1);

    let mut holder = store.begin().await.unwrap();
    holder.lock_range(Span::new(2 * H, 3 * H)).await.unwrap();

    // Acquires the first two rows, then waits on the held third one.
    let mut blocked = store.begin().await.unwrap();
    let err = blocked.lock_range(Span::new(0, 3 * H)).await.unwrap_err();
    assert!(matches!(err, StorageError::LockTimeout(_)));
    drop(blocked);

    let mut next = store.begin().await.unwrap();
    let slots = next.lock_range(Span::new(0, 2 * H)).await.unwrap();
    assert_eq!(slots.len(), 2);
}

#[tokio::test]
async fn begin_gives_up_behind_maintenance() {
    let path = test_wal_path("gate_timeout.wal");
    let store = open(&path, 2, 1);

    let maintenance = store.gate.write().await;
    let started = std::time::Instant::now();
    let err = store.begin().await.err().unwrap();
    assert!(matches!(err, StorageError::GateTimeout));
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(maintenance);

    assert!(store.begin().await.is_ok());
}

#[tokio::test]
async fn disjoint_ranges_do_not_contend() {
    let path = test_wal_path("disjoint.wal");
    let store = open(&path, 4, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();

    let mut first = store.begin().await.unwrap();
    first.lock_range(Span::new(0, 2 * H)).await.unwrap();

    let started = std::time::Instant::now();
    let b = reserve(&store, alice.id, Span::new(2 * H, 4 * H)).await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(b.span(), Span::new(2 * H, 4 * H));
    drop(first);
}

#[tokio::test]
async fn lock_range_reads_committed_capacity() {
    let path = test_wal_path("committed_read.wal");
    let store = open(&path, 3, 2);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    reserve(&store, alice.id, Span::new(0, H)).await;

    let mut tx = store.begin().await.unwrap();
    let slots = tx.lock_range(Span::new(0, 3 * H)).await.unwrap();
    assert_eq!(slots.iter().map(|s| s.remaining_capacity).collect::<Vec<_>>(), vec![1, 2, 2]);
    assert_eq!(tx.count_available(Span::new(0, 3 * H)).unwrap(), 3);
}

#[tokio::test]
async fn decrement_of_exhausted_slot_is_rejected() {
    let path = test_wal_path("underflow.wal");
    let store = open(&path, 3, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    reserve(&store, alice.id, Span::new(H, 2 * H)).await;

    let span = Span::new(0, 3 * H);
    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    assert_eq!(tx.count_available(span).unwrap(), 2);
    let err = tx.decrement_range(span).unwrap_err();
    assert!(matches!(err, StorageError::CapacityUnderflow { start_at } if start_at == H));
    drop(tx);
    assert_eq!(capacities(&store), vec![1, 0, 1]);
}

#[tokio::test]
async fn unlocked_ranges_are_refused() {
    let path = test_wal_path("unlocked.wal");
    let store = open(&path, 4, 1);
    let mut tx = store.begin().await.unwrap();
    assert!(matches!(tx.count_available(Span::new(0, H)), Err(StorageError::Constraint(_))));

    tx.lock_range(Span::new(0, 2 * H)).await.unwrap();
    assert!(matches!(tx.decrement_range(Span::new(0, 3 * H)), Err(StorageError::Constraint(_))));
    assert!(matches!(tx.lock_range(Span::new(2 * H, 3 * H)).await, Err(StorageError::Constraint(_))));
}

#[tokio::test]
async fn foreign_keys_are_checked() {
    let path = test_wal_path("foreign_keys.wal");
    let store = open(&path, 2, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    let span = Span::new(0, H);

    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    let err = tx.insert_broadcast(99, &request(span, vec![])).unwrap_err();
    assert!(matches!(err, StorageError::ForeignKey { table: "users", id: 99 }));
    let err = tx.insert_broadcast(alice.id, &request(span, vec![42])).unwrap_err();
    assert!(matches!(err, StorageError::ForeignKey { table: "tags", id: 42 }));
}

#[tokio::test]
async fn duplicate_tag_ids_collapse() {
    let path = test_wal_path("dup_tags.wal");
    let store = open(&path, 2, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    let a = store.insert_tag("a".into()).await.unwrap();
    let b = store.insert_tag("b".into()).await.unwrap();

    let span = Span::new(0, H);
    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    let staged = tx.insert_broadcast(alice.id, &request(span, vec![b.id, a.id, b.id])).unwrap();
    assert_eq!(staged.tag_ids, vec![b.id, a.id]);
}

#[tokio::test]
async fn mismatched_staging_cannot_commit() {
    let path = test_wal_path("mismatched.wal");
    let store = open(&path, 3, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.lock_range(Span::new(0, 2 * H)).await.unwrap();
    tx.decrement_range(Span::new(0, H)).unwrap();
    tx.insert_broadcast(alice.id, &request(Span::new(0, 2 * H), vec![])).unwrap();
    assert!(matches!(tx.commit().await, Err(StorageError::Constraint(_))));
    assert_eq!(capacities(&store), vec![1, 1, 1]);

    // Nothing staged is a no-op commit.
    let tx = store.begin().await.unwrap();
    assert_eq!(tx.commit().await.unwrap(), None);
}

#[tokio::test]
async fn commit_finishes_after_caller_gives_up() {
    let path = test_wal_path("detached_commit.wal");
    let store = open(&path, 2, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();

    let span = Span::new(0, H);
    let mut tx = store.begin().await.unwrap();
    tx.lock_range(span).await.unwrap();
    tx.decrement_range(span).unwrap();
    let staged = tx.insert_broadcast(alice.id, &request(span, vec![])).unwrap();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    // Poll once, which starts the commit, then drop the future.
    let polled = tx
        .commit_then(move |store, b| {
            let _ = done_tx.send((b.id, store.broadcast_count()));
        })
        .now_or_never();
    assert!(polled.is_none());

    let (id, count) = done_rx.await.unwrap();
    assert_eq!(id, staged.id);
    assert_eq!(count, 1);
    assert_eq!(capacities(&store), vec![0, 1]);
}

#[tokio::test]
async fn duplicate_user_name_is_rejected() {
    let path = test_wal_path("dup_user.wal");
    let store = open(&path, 1, 1);
    store.insert_user(new_user("alice")).await.unwrap();
    let err = store.insert_user(new_user("alice")).await.unwrap_err();
    assert!(matches!(err, StorageError::Duplicate { table: "users", .. }));
    assert_eq!(store.users().len(), 1);
}

#[tokio::test]
async fn catalog_writes_require_existing_user() {
    let path = test_wal_path("catalog_fk.wal");
    let store = open(&path, 1, 1);
    assert!(matches!(store.set_theme(7, true).await, Err(StorageError::ForeignKey { .. })));
    assert!(matches!(store.replace_icon(7, vec![0]).await, Err(StorageError::ForeignKey { .. })));
}

#[tokio::test]
async fn replace_icon_keeps_one_per_user() {
    let path = test_wal_path("icon_replace.wal");
    let store = open(&path, 1, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    let first = store.replace_icon(alice.id, vec![1]).await.unwrap();
    let second = store.replace_icon(alice.id, vec![2]).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(store.icon(alice.id).map(|i| i.image), Some(vec![2]));
}

#[tokio::test]
async fn compaction_preserves_state_and_resets_counter() {
    let path = test_wal_path("compact.wal");
    let (slots, broadcasts) = {
        let store = open(&path, 4, 3);
        let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
        store.set_theme(alice.id, true).await.unwrap();
        for _ in 0..3 {
            store.replace_icon(alice.id, vec![7; 64]).await.unwrap();
        }
        for i in 0..3 {
            reserve(&store, alice.id, Span::new(i * H, (i + 1) * H)).await;
        }
        reserve(&store, alice.id, Span::new(0, 2 * H)).await;
        assert!(store.wal_appends_since_compact().await > 0);

        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // Appends after compaction land in the new log.
        reserve(&store, alice.id, Span::new(3 * H, 4 * H)).await;
        (store.slots(), store.broadcasts())
    };

    let store = open(&path, 4, 3);
    assert_eq!(store.slots(), slots);
    assert_eq!(capacities(&store), vec![1, 1, 2, 2]);
    assert_eq!(store.broadcasts(), broadcasts);
    assert!(store.theme(1).unwrap().dark_mode);
    assert_eq!(store.icon(1).map(|i| i.image.len()), Some(64));

    // Sequences resume past restored ids.
    let b = reserve(&store, 1, Span::new(3 * H, 4 * H)).await;
    assert_eq!(b.id, 6);
}

#[tokio::test]
async fn reset_starts_over() {
    let path = test_wal_path("reset.wal");
    {
        let store = open(&path, 3, 1);
        let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
        store.insert_tag("music".into()).await.unwrap();
        reserve(&store, alice.id, Span::new(0, H)).await;

        store.reset(seed(2, 4)).await.unwrap();
        assert_eq!(capacities(&store), vec![4, 4]);
        assert!(store.users().is_empty());
        assert!(store.tags().is_empty());
        assert_eq!(store.broadcast_count(), 0);

        let (bob, _) = store.insert_user(new_user("bob")).await.unwrap();
        assert_eq!(bob.id, 1);
    }

    let store = open(&path, 3, 1);
    assert_eq!(capacities(&store), vec![4, 4]);
    assert_eq!(store.users().len(), 1);
    assert!(store.user_by_name("alice").is_none());
}

#[tokio::test]
async fn reset_hook_runs_before_writers_resume() {
    let path = test_wal_path("reset_hook.wal");
    let store = open(&path, 2, 2);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    reserve(&store, alice.id, Span::new(0, H)).await;

    let observed = Arc::new(std::sync::Mutex::new(None));
    let hook_store = Arc::clone(&store);
    let hook_observed = Arc::clone(&observed);
    store
        .reset_then(seed(2, 2), move |snapshot| {
            let writers_blocked = hook_store.gate.try_read().is_err();
            *hook_observed.lock().unwrap() = Some((writers_blocked, snapshot.broadcasts.len(), snapshot.users.len()));
        })
        .await
        .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some((true, 0, 0)));
    assert!(store.begin().await.is_ok());
}

#[tokio::test]
async fn open_windows_skip_exhausted_slots() {
    let path = test_wal_path("open_windows.wal");
    let store = open(&path, 5, 1);
    let (alice, _) = store.insert_user(new_user("alice")).await.unwrap();
    reserve(&store, alice.id, Span::new(2 * H, 3 * H)).await;
    assert_eq!(
        store.open_windows(&Span::new(0, 5 * H)),
        vec![Span::new(0, 2 * H), Span::new(3 * H, 5 * H)]
    );
}
