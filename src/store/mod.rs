mod calendar;
mod compact;
mod error;
#[cfg(test)]
mod tests;
mod tx;

pub use calendar::{CalendarSpec, SlotCalendar, SlotRow, merge_adjacent};
pub use error::StorageError;
pub use tx::SlotTx;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::cache::Snapshot;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then pay
/// for a single fsync and answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the buffered bytes of a failed
    // batch never ride along with the next one.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Monotonic id generator; ids consumed by a rolled-back insert are not reused.
#[derive(Default)]
struct Sequence(AtomicI64);

impl Sequence {
    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn observe(&self, id: i64) {
        self.0.fetch_max(id, Ordering::AcqRel);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[derive(Default)]
struct Sequences {
    users: Sequence,
    tags: Sequence,
    themes: Sequence,
    icons: Sequence,
    broadcasts: Sequence,
}

/// The system of record: slot calendar plus entity tables, made durable by
/// the WAL.
///
/// Slot rows carry their own locks (see [`SlotTx`]). Catalog writes (users,
/// tags, themes, icons) are rare and serialize on one mutex. A reset or
/// compaction takes `gate` exclusively; every transaction and catalog write
/// holds it shared for its whole lifetime.
pub struct Store {
    calendar: std::sync::RwLock<Arc<SlotCalendar>>,
    users: DashMap<UserId, User>,
    user_names: DashMap<String, UserId>,
    tags: DashMap<TagId, Tag>,
    themes: DashMap<UserId, Theme>,
    icons: DashMap<UserId, Icon>,
    broadcasts: DashMap<BroadcastId, Broadcast>,
    by_owner: DashMap<UserId, Vec<BroadcastId>>,
    ids: Sequences,
    wal_tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
    catalog: Mutex<()>,
    lock_timeout: Duration,
}

impl Store {
    /// Replay the log at `wal_path`; seed a calendar from `seed` if the log
    /// has none. Must run inside a tokio runtime (spawns the WAL writer).
    pub fn open(wal_path: PathBuf, seed: &CalendarSpec, lock_timeout: Duration) -> Result<Self, StorageError> {
        let events = Wal::replay(&wal_path).map_err(|e| StorageError::WalError(e.to_string()))?;
        let mut wal = Wal::open(&wal_path).map_err(|e| StorageError::WalError(e.to_string()))?;

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let store = Self {
            calendar: std::sync::RwLock::new(Arc::new(SlotCalendar::empty())),
            users: DashMap::new(),
            user_names: DashMap::new(),
            tags: DashMap::new(),
            themes: DashMap::new(),
            icons: DashMap::new(),
            broadcasts: DashMap::new(),
            by_owner: DashMap::new(),
            ids: Sequences::default(),
            wal_tx,
            gate: Arc::new(RwLock::new(())),
            catalog: Mutex::new(()),
            lock_timeout,
        };

        for event in &events {
            store.apply(event);
        }

        if store.calendar().is_empty() {
            let event = Event::CalendarSeeded {
                slot_secs: seed.slot_secs,
                slots: seed.tile()?,
            };
            wal.append_buffered(&event)
                .and_then(|()| wal.flush_sync())
                .map_err(|e| StorageError::WalError(e.to_string()))?;
            store.apply(&event);
            tracing::info!(slots = store.calendar().len(), "seeded slot calendar");
        } else {
            tracing::info!(
                records = events.len(),
                slots = store.calendar().len(),
                livestreams = store.broadcasts.len(),
                "replayed WAL"
            );
        }

        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(store)
    }

    /// Write one record through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StorageError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::WalError(e.to_string()))
    }

    async fn wal_rewrite(&self, events: Vec<Event>) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite { events, response: tx })
            .await
            .map_err(|_| StorageError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Apply a committed record to the in-memory tables. Slot decrements
    /// assume the caller holds the affected row locks or is replaying.
    fn apply(&self, event: &Event) {
        match event {
            Event::CalendarSeeded { slot_secs, slots } => {
                let calendar = SlotCalendar::from_slots(*slot_secs, slots.clone());
                *self.calendar.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(calendar);
            }
            Event::UserCreated { user, theme } => {
                self.ids.users.observe(user.id);
                self.ids.themes.observe(theme.id);
                self.user_names.insert(user.name.clone(), user.id);
                self.users.insert(user.id, user.clone());
                self.themes.insert(user.id, *theme);
            }
            Event::TagCreated { tag } => {
                self.ids.tags.observe(tag.id);
                self.tags.insert(tag.id, tag.clone());
            }
            Event::ThemeSet { theme } => {
                self.ids.themes.observe(theme.id);
                self.themes.insert(theme.user_id, *theme);
            }
            Event::IconReplaced { icon } => {
                self.ids.icons.observe(icon.id);
                self.icons.insert(icon.user_id, icon.clone());
            }
            Event::BroadcastReserved { broadcast } => {
                self.calendar().decrement_within(&broadcast.span());
                self.insert_broadcast_row(broadcast);
            }
            Event::BroadcastRestored { broadcast } => self.insert_broadcast_row(broadcast),
        }
    }

    fn insert_broadcast_row(&self, broadcast: &Broadcast) {
        self.ids.broadcasts.observe(broadcast.id);
        self.broadcasts.insert(broadcast.id, broadcast.clone());
        let mut ids = self.by_owner.entry(broadcast.owner_id).or_default();
        if let Err(pos) = ids.binary_search(&broadcast.id) {
            ids.insert(pos, broadcast.id);
        }
    }

    /// Run a write as its own task so a caller that stops waiting cannot
    /// interrupt it between the WAL append and the in-memory apply.
    async fn detached<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Store>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
    {
        tokio::spawn(f(Arc::clone(self)))
            .await
            .map_err(|e| StorageError::WalError(format!("write task failed: {e}")))?
    }

    // ── Catalog writes ───────────────────────────────────────

    pub async fn insert_user(self: &Arc<Self>, new: NewUser) -> Result<(User, Theme), StorageError> {
        if new.name.is_empty() || new.name.len() > MAX_NAME_LEN {
            return Err(StorageError::Constraint("user name length out of range"));
        }
        self.detached(move |store| async move {
            let _gate = store.gate.read().await;
            let _catalog = store.catalog.lock().await;
            if store.user_names.contains_key(&new.name) {
                return Err(StorageError::Duplicate { table: "users", value: new.name });
            }
            let user = User {
                id: store.ids.users.next(),
                name: new.name,
                display_name: new.display_name,
                description: new.description,
                password_hash: new.password_hash,
            };
            let theme = Theme {
                id: store.ids.themes.next(),
                user_id: user.id,
                dark_mode: new.dark_mode,
            };
            let event = Event::UserCreated { user: user.clone(), theme };
            store.wal_append(&event).await?;
            store.apply(&event);
            Ok((user, theme))
        })
        .await
    }

    pub async fn insert_tag(self: &Arc<Self>, name: String) -> Result<Tag, StorageError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(StorageError::Constraint("tag name length out of range"));
        }
        self.detached(move |store| async move {
            let _gate = store.gate.read().await;
            let _catalog = store.catalog.lock().await;
            if store.tags.iter().any(|t| t.name == name) {
                return Err(StorageError::Duplicate { table: "tags", value: name });
            }
            let tag = Tag { id: store.ids.tags.next(), name };
            let event = Event::TagCreated { tag: tag.clone() };
            store.wal_append(&event).await?;
            store.apply(&event);
            Ok(tag)
        })
        .await
    }

    pub async fn set_theme(self: &Arc<Self>, user_id: UserId, dark_mode: bool) -> Result<Theme, StorageError> {
        self.detached(move |store| async move {
            let _gate = store.gate.read().await;
            let _catalog = store.catalog.lock().await;
            if !store.users.contains_key(&user_id) {
                return Err(StorageError::ForeignKey { table: "users", id: user_id });
            }
            let id = match store.themes.get(&user_id) {
                Some(t) => t.id,
                None => store.ids.themes.next(),
            };
            let theme = Theme { id, user_id, dark_mode };
            let event = Event::ThemeSet { theme };
            store.wal_append(&event).await?;
            store.apply(&event);
            Ok(theme)
        })
        .await
    }

    /// Delete the user's icon (if any) and insert `image` as the new one.
    pub async fn replace_icon(self: &Arc<Self>, user_id: UserId, image: Vec<u8>) -> Result<Icon, StorageError> {
        if image.len() > MAX_ICON_BYTES {
            return Err(StorageError::Constraint("icon too large"));
        }
        self.detached(move |store| async move {
            let _gate = store.gate.read().await;
            let _catalog = store.catalog.lock().await;
            if !store.users.contains_key(&user_id) {
                return Err(StorageError::ForeignKey { table: "users", id: user_id });
            }
            let icon = Icon { id: store.ids.icons.next(), user_id, image };
            let event = Event::IconReplaced { icon: icon.clone() };
            store.wal_append(&event).await?;
            store.apply(&event);
            Ok(icon)
        })
        .await
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn calendar(&self) -> Arc<SlotCalendar> {
        self.calendar.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.calendar().slots()
    }

    pub fn slot(&self, start_at: Ts) -> Option<Slot> {
        self.calendar().row(start_at).map(|r| r.to_slot())
    }

    pub fn open_windows(&self, query: &Span) -> Vec<Span> {
        self.calendar().open_windows(query)
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        let id = *self.user_names.get(name)?;
        self.user(id)
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|u| u.value().clone()).collect()
    }

    pub fn tag(&self, id: TagId) -> Option<Tag> {
        self.tags.get(&id).map(|t| t.value().clone())
    }

    pub fn tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.tags.iter().map(|t| t.value().clone()).collect();
        tags.sort_by_key(|t| t.id);
        tags
    }

    pub fn theme(&self, user_id: UserId) -> Option<Theme> {
        self.themes.get(&user_id).map(|t| *t.value())
    }

    pub fn icon(&self, user_id: UserId) -> Option<Icon> {
        self.icons.get(&user_id).map(|i| i.value().clone())
    }

    pub fn broadcast(&self, id: BroadcastId) -> Option<Broadcast> {
        self.broadcasts.get(&id).map(|b| b.value().clone())
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.len()
    }

    /// All broadcasts, newest first.
    pub fn broadcasts(&self) -> Vec<Broadcast> {
        let mut all: Vec<Broadcast> = self.broadcasts.iter().map(|b| b.value().clone()).collect();
        all.sort_by(|a, b| b.id.cmp(&a.id));
        all
    }

    /// Owner's broadcasts in id order.
    pub fn broadcasts_by_owner(&self, owner_id: UserId) -> Vec<Broadcast> {
        match self.by_owner.get(&owner_id) {
            Some(ids) => self.broadcasts_by_ids(ids.value()),
            None => Vec::new(),
        }
    }

    /// Bulk read by key set; missing ids are skipped.
    pub fn broadcasts_by_ids(&self, ids: &[BroadcastId]) -> Vec<Broadcast> {
        ids.iter().filter_map(|id| self.broadcast(*id)).collect()
    }

    /// Full table scan feeding cache population.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tags: self.tags(),
            users: self.users(),
            broadcasts: self.broadcasts(),
        }
    }
}
