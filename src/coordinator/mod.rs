mod admission;
mod error;
mod horizon;

pub use admission::{AdmissionPolicy, UnknownPolicy, Verdict, tiles};
pub use error::ReserveError;
pub use horizon::Horizon;

use std::sync::Arc;
use std::time::Instant;

use crate::cache::Caches;
use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATION_DURATION_SECONDS, RESERVATION_SLOTS, RESERVATIONS_TOTAL};
use crate::store::{StorageError, Store};

/// The only path by which a broadcast is created.
///
/// A reservation runs `Validating -> Locking -> Checking -> Committing` inside
/// one store transaction. Overlapping requests serialize on the slot row
/// locks; the coordinator itself holds no lock, so disjoint requests run in
/// parallel.
pub struct ReservationCoordinator {
    store: Arc<Store>,
    caches: Arc<Caches>,
    horizon: Horizon,
    policy: AdmissionPolicy,
}

impl ReservationCoordinator {
    pub fn new(store: Arc<Store>, caches: Arc<Caches>, horizon: Horizon, policy: AdmissionPolicy) -> Self {
        Self {
            store,
            caches,
            horizon,
            policy,
        }
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Reserve `[req.start_at, req.end_at)` for `caller`.
    ///
    /// On success the broadcast is durable and already visible through the
    /// by-id and by-owner caches. On any error nothing was mutated.
    pub async fn reserve(&self, caller: Caller, req: ReservationRequest) -> Result<Broadcast, ReserveError> {
        let started = Instant::now();
        let result = self.try_reserve(caller, req).await;

        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) => e.label(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(RESERVATION_DURATION_SECONDS, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(b) => tracing::debug!(
                id = b.id,
                owner = b.owner_id,
                start_at = b.start_at,
                end_at = b.end_at,
                "reservation accepted"
            ),
            Err(e) if e.is_client_fault() => {
                tracing::debug!(owner = caller.user_id(), "reservation rejected: {e}")
            }
            Err(e) => tracing::warn!(owner = caller.user_id(), "reservation failed: {e}"),
        }
        result
    }

    async fn try_reserve(&self, caller: Caller, req: ReservationRequest) -> Result<Broadcast, ReserveError> {
        check_limits(&req)?;
        let span = self.horizon.validate(req.start_at, req.end_at)?;

        let mut tx = self.store.begin().await?;
        let slots = tx.lock_range(span).await?;

        let available = tx.count_available(span)?;
        match self.policy.admit(&span, &slots, available) {
            Verdict::Accept => {}
            Verdict::Misaligned => {
                tx.rollback();
                return Err(ReserveError::OutOfRange {
                    requested: (span.start, span.end),
                    horizon: self.horizon.span(),
                });
            }
            Verdict::Overbooked => {
                tx.rollback();
                return Err(ReserveError::Overbooked { requested: span });
            }
        }

        // Under a coarse policy the verdict can pass with an exhausted slot in
        // range; the store refuses it and the caller sees a full range.
        let covered = tx.decrement_range(span).map_err(|e| match e {
            StorageError::CapacityUnderflow { .. } => ReserveError::Overbooked { requested: span },
            other => ReserveError::from(other),
        })?;
        tx.insert_broadcast(caller.user_id(), &req)?;

        let caches = Arc::clone(&self.caches);
        let broadcast = tx
            .commit_then(move |store, b| {
                caches.publish_broadcast(b, || store.broadcasts_by_owner(b.owner_id));
            })
            .await?
            .ok_or(StorageError::Constraint("commit produced no broadcast"))?;

        metrics::histogram!(RESERVATION_SLOTS).record(covered as f64);
        Ok(broadcast)
    }
}

fn check_limits(req: &ReservationRequest) -> Result<(), ReserveError> {
    if req.meta.title.len() > MAX_TITLE_LEN {
        return Err(ReserveError::Invalid("title too long"));
    }
    if req.meta.description.len() > MAX_DESCRIPTION_LEN {
        return Err(ReserveError::Invalid("description too long"));
    }
    if req.meta.playlist_url.len() > MAX_URL_LEN || req.meta.thumbnail_url.len() > MAX_URL_LEN {
        return Err(ReserveError::Invalid("url too long"));
    }
    if req.tag_ids.len() > MAX_TAGS_PER_BROADCAST {
        return Err(ReserveError::Invalid("too many tags"));
    }
    Ok(())
}
