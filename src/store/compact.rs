use std::sync::Arc;

use crate::cache::Snapshot;
use crate::model::*;

use super::{CalendarSpec, StorageError, Store};

impl Store {
    /// Records that recreate the current state: the calendar as it stands,
    /// then users, tags, icons and broadcasts. Broadcasts are written in
    /// restored form since the calendar snapshot already carries their
    /// decrements.
    fn state_events(&self) -> Vec<Event> {
        let calendar = self.calendar();
        let mut events = vec![Event::CalendarSeeded {
            slot_secs: calendar.slot_secs(),
            slots: calendar.slots(),
        }];

        let mut users = self.users();
        users.sort_by_key(|u| u.id);
        for user in users {
            // Every user row is written with its theme; a missing one only
            // happens if the log itself was hand-edited.
            let Some(theme) = self.theme(user.id) else {
                tracing::warn!(user_id = user.id, "user without theme dropped by compaction");
                continue;
            };
            events.push(Event::UserCreated { user, theme });
        }
        events.extend(self.tags().into_iter().map(|tag| Event::TagCreated { tag }));

        let mut icons: Vec<Icon> = self.icons.iter().map(|i| i.value().clone()).collect();
        icons.sort_by_key(|i| i.id);
        events.extend(icons.into_iter().map(|icon| Event::IconReplaced { icon }));

        let mut broadcasts = self.broadcasts();
        broadcasts.reverse();
        events.extend(broadcasts.into_iter().map(|broadcast| Event::BroadcastRestored { broadcast }));
        events
    }

    /// Rewrite the WAL with only the records needed to recreate the current
    /// state. Waits for in-flight transactions and blocks new ones meanwhile.
    pub async fn compact(self: &Arc<Self>) -> Result<(), StorageError> {
        self.detached(|store| async move {
            let _gate = store.gate.write().await;
            let events = store.state_events();
            let records = events.len();
            store.wal_rewrite(events).await?;
            tracing::info!(records, "compacted WAL");
            Ok(())
        })
        .await
    }

    /// Drop every row and start over with a freshly tiled calendar. The log
    /// is rewritten before memory changes, so a failed reset leaves the old
    /// state intact on disk and in memory.
    pub async fn reset(self: &Arc<Self>, seed: CalendarSpec) -> Result<(), StorageError> {
        self.reset_then(seed, |_| {}).await
    }

    /// [`Store::reset`], then hand `after` a snapshot of the emptied store
    /// before any transaction or catalog write can run again.
    pub async fn reset_then<F>(self: &Arc<Self>, seed: CalendarSpec, after: F) -> Result<(), StorageError>
    where
        F: FnOnce(Snapshot) + Send + 'static,
    {
        let slots = seed.tile()?;
        self.detached(move |store| async move {
            let _gate = store.gate.write().await;
            let seeded = Event::CalendarSeeded {
                slot_secs: seed.slot_secs,
                slots,
            };
            store.wal_rewrite(vec![seeded.clone()]).await?;

            store.users.clear();
            store.user_names.clear();
            store.tags.clear();
            store.themes.clear();
            store.icons.clear();
            store.broadcasts.clear();
            store.by_owner.clear();
            store.ids.users.reset();
            store.ids.tags.reset();
            store.ids.themes.reset();
            store.ids.icons.reset();
            store.ids.broadcasts.reset();
            store.apply(&seeded);

            tracing::info!(slots = store.calendar().len(), "store reset");
            after(store.snapshot());
            Ok(())
        })
        .await
    }
}
