use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;

use crate::limits::MAX_SLOTS;
use crate::model::*;

use super::StorageError;

/// How to tile a fresh calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarSpec {
    pub horizon: Span,
    pub slot_secs: Ts,
    pub capacity: u32,
}

impl CalendarSpec {
    /// Tile the horizon with back-to-back slots. A trailing remainder shorter
    /// than one slot is not bookable.
    pub fn tile(&self) -> Result<Vec<Slot>, StorageError> {
        if self.slot_secs <= 0 {
            return Err(StorageError::InvalidCalendar("slot width must be positive".into()));
        }
        let count = self.horizon.duration() / self.slot_secs;
        if count == 0 {
            return Err(StorageError::InvalidCalendar("horizon shorter than one slot".into()));
        }
        if count as usize > MAX_SLOTS {
            return Err(StorageError::InvalidCalendar(format!(
                "{count} slots exceeds the limit of {MAX_SLOTS}"
            )));
        }
        Ok((0..count)
            .map(|i| {
                let start_at = self.horizon.start + i * self.slot_secs;
                Slot {
                    start_at,
                    end_at: start_at + self.slot_secs,
                    remaining_capacity: self.capacity,
                }
            })
            .collect())
    }
}

/// One persisted slot row.
///
/// `remaining` holds the committed value and is only written by a holder of
/// `lock`, so plain reads never wait on a reservation in flight.
pub struct SlotRow {
    pub start_at: Ts,
    pub end_at: Ts,
    remaining: AtomicU32,
    pub(super) lock: Arc<Mutex<()>>,
}

impl SlotRow {
    fn new(slot: Slot) -> Self {
        Self {
            start_at: slot.start_at,
            end_at: slot.end_at,
            remaining: AtomicU32::new(slot.remaining_capacity),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn to_slot(&self) -> Slot {
        Slot {
            start_at: self.start_at,
            end_at: self.end_at,
            remaining_capacity: self.remaining(),
        }
    }

    /// Caller holds `lock` (or is replaying) and has checked `remaining > 0`.
    pub(super) fn decrement(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The slot ledger: a fixed set of rows keyed by `start_at`.
pub struct SlotCalendar {
    slot_secs: Ts,
    rows: BTreeMap<Ts, Arc<SlotRow>>,
}

impl SlotCalendar {
    pub fn from_slots(slot_secs: Ts, slots: Vec<Slot>) -> Self {
        let rows = slots
            .into_iter()
            .map(|s| (s.start_at, Arc::new(SlotRow::new(s))))
            .collect();
        Self { slot_secs, rows }
    }

    pub fn empty() -> Self {
        Self {
            slot_secs: 0,
            rows: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn slot_secs(&self) -> Ts {
        self.slot_secs
    }

    /// Bounds of the whole calendar, if any slot exists.
    pub fn bounds(&self) -> Option<Span> {
        let first = self.rows.values().next()?;
        let last = self.rows.values().next_back()?;
        Some(Span::new(first.start_at, last.end_at))
    }

    /// Rows with `start_at >= span.start && end_at <= span.end`, ascending.
    pub fn rows_within(&self, span: &Span) -> Vec<Arc<SlotRow>> {
        if span.start >= span.end {
            return Vec::new();
        }
        self.rows
            .range(span.start..span.end)
            .map(|(_, row)| row)
            .filter(|row| row.end_at <= span.end)
            .cloned()
            .collect()
    }

    pub fn row(&self, start_at: Ts) -> Option<&Arc<SlotRow>> {
        self.rows.get(&start_at)
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.rows.values().map(|r| r.to_slot()).collect()
    }

    /// Apply a committed decrement. Live callers hold every affected row lock.
    pub(super) fn decrement_within(&self, span: &Span) {
        for row in self.rows_within(span) {
            if row.remaining() > 0 {
                row.decrement();
            }
        }
    }

    /// Merged spans inside `query` whose slots still have capacity.
    pub fn open_windows(&self, query: &Span) -> Vec<Span> {
        let open: Vec<Span> = self
            .rows_within(query)
            .iter()
            .filter(|row| row.remaining() > 0)
            .map(|row| Span::new(row.start_at, row.end_at))
            .collect();
        merge_adjacent(&open)
    }
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_adjacent(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}
