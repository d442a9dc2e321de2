use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard};

use crate::limits::MAX_TAGS_PER_BROADCAST;
use crate::model::*;
use crate::observability::{LOCK_TIMEOUTS_TOTAL, LOCK_WAIT_SECONDS};

use super::{SlotCalendar, SlotRow, StorageError, Store};

struct LockedRow {
    row: Arc<SlotRow>,
    _guard: OwnedMutexGuard<()>,
}

/// One reservation transaction.
///
/// Writes are staged and become visible only through [`SlotTx::commit`],
/// which persists the slot decrement and the broadcast row as a single WAL
/// record. Dropping the transaction is a rollback: staged writes vanish and
/// every row lock is released.
pub struct SlotTx {
    store: Arc<Store>,
    calendar: Arc<SlotCalendar>,
    locked: Vec<LockedRow>,
    locked_span: Option<Span>,
    staged_decrement: Option<Span>,
    staged_broadcast: Option<Broadcast>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Store {
    /// Start a transaction. Waits out a running reset or compaction, but no
    /// longer than the lock-wait timeout.
    pub async fn begin(self: &Arc<Self>) -> Result<SlotTx, StorageError> {
        let gate = match tokio::time::timeout(self.lock_timeout, Arc::clone(&self.gate).read_owned()).await {
            Ok(gate) => gate,
            Err(_) => {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                return Err(StorageError::GateTimeout);
            }
        };
        Ok(SlotTx {
            store: Arc::clone(self),
            calendar: self.calendar(),
            locked: Vec::new(),
            locked_span: None,
            staged_decrement: None,
            staged_broadcast: None,
            _gate: gate,
        })
    }
}

impl SlotTx {
    /// Row-lock every slot inside `span` in ascending `start_at` order and
    /// return their committed state. Gives up after the store's lock-wait
    /// timeout, releasing whatever was acquired.
    pub async fn lock_range(&mut self, span: Span) -> Result<Vec<Slot>, StorageError> {
        if self.locked_span.is_some() {
            return Err(StorageError::Constraint("transaction already holds a locked range"));
        }
        let rows = self.calendar.rows_within(&span);
        let started = Instant::now();
        let acquire = async move {
            let mut locked = Vec::with_capacity(rows.len());
            for row in rows {
                let guard = Arc::clone(&row.lock).lock_owned().await;
                locked.push(LockedRow { row, _guard: guard });
            }
            locked
        };
        let locked = match tokio::time::timeout(self.store.lock_timeout, acquire).await {
            Ok(locked) => locked,
            Err(_) => {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                return Err(StorageError::LockTimeout(span));
            }
        };
        metrics::histogram!(LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());

        let slots = locked.iter().map(|l| l.row.to_slot()).collect();
        self.locked = locked;
        self.locked_span = Some(span);
        Ok(slots)
    }

    fn locked_within(&self, span: &Span) -> Result<impl Iterator<Item = &Arc<SlotRow>>, StorageError> {
        match self.locked_span {
            Some(locked) if locked.contains_span(span) => Ok(self
                .locked
                .iter()
                .map(|l| &l.row)
                .filter(move |row| row.start_at >= span.start && row.end_at <= span.end)),
            _ => Err(StorageError::Constraint("range is not locked by this transaction")),
        }
    }

    /// Locked slots inside `span` that still have capacity.
    pub fn count_available(&self, span: Span) -> Result<usize, StorageError> {
        Ok(self.locked_within(&span)?.filter(|row| row.remaining() > 0).count())
    }

    /// Stage a decrement of every slot inside `span`; returns how many slots
    /// it covers. Fails without staging anything if any of them is already
    /// at zero.
    pub fn decrement_range(&mut self, span: Span) -> Result<usize, StorageError> {
        if self.staged_decrement.is_some() {
            return Err(StorageError::Constraint("decrement already staged"));
        }
        let mut affected = 0;
        for row in self.locked_within(&span)? {
            if row.remaining() == 0 {
                return Err(StorageError::CapacityUnderflow { start_at: row.start_at });
            }
            affected += 1;
        }
        self.staged_decrement = Some(span);
        Ok(affected)
    }

    /// Stage the broadcast row with a freshly generated id. Owner and tags
    /// must exist; duplicate tag ids collapse to one association.
    pub fn insert_broadcast(&mut self, owner_id: UserId, req: &ReservationRequest) -> Result<Broadcast, StorageError> {
        if self.staged_broadcast.is_some() {
            return Err(StorageError::Constraint("broadcast already staged"));
        }
        if !self.store.users.contains_key(&owner_id) {
            return Err(StorageError::ForeignKey { table: "users", id: owner_id });
        }
        let mut tag_ids: Vec<TagId> = Vec::with_capacity(req.tag_ids.len());
        for &tag_id in &req.tag_ids {
            if !self.store.tags.contains_key(&tag_id) {
                return Err(StorageError::ForeignKey { table: "tags", id: tag_id });
            }
            if !tag_ids.contains(&tag_id) {
                tag_ids.push(tag_id);
            }
        }
        if tag_ids.len() > MAX_TAGS_PER_BROADCAST {
            return Err(StorageError::Constraint("too many tags"));
        }

        let broadcast = Broadcast {
            id: self.store.ids.broadcasts.next(),
            owner_id,
            meta: req.meta.clone(),
            start_at: req.start_at,
            end_at: req.end_at,
            tag_ids,
        };
        self.staged_broadcast = Some(broadcast.clone());
        Ok(broadcast)
    }

    pub async fn commit(self) -> Result<Option<Broadcast>, StorageError> {
        self.commit_then(|_, _| {}).await
    }

    /// Persist the staged writes, make them visible, run `after` while the
    /// row locks are still held, then release everything.
    ///
    /// The work runs as its own task: once started it finishes even if the
    /// caller stops waiting, so `after` (typically a cache update) can never
    /// be skipped for a write that reached the log.
    pub async fn commit_then<F>(self, after: F) -> Result<Option<Broadcast>, StorageError>
    where
        F: FnOnce(&Store, &Broadcast) + Send + 'static,
    {
        let broadcast = match (&self.staged_decrement, &self.staged_broadcast) {
            (None, None) => return Ok(None),
            (Some(span), Some(b)) if *span == b.span() => b.clone(),
            _ => {
                return Err(StorageError::Constraint(
                    "decrement and broadcast must be staged together over the same range",
                ));
            }
        };

        let handle = tokio::spawn(async move {
            let event = Event::BroadcastReserved { broadcast: broadcast.clone() };
            self.store.wal_append(&event).await?;
            self.store.apply(&event);
            after(&self.store, &broadcast);
            drop(self);
            Ok::<_, StorageError>(Some(broadcast))
        });
        handle
            .await
            .map_err(|e| StorageError::WalError(format!("commit task failed: {e}")))?
    }

    pub fn rollback(self) {
        tracing::trace!(span = ?self.locked_span, "transaction rolled back");
    }
}
