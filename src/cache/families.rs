use std::collections::HashMap;
use std::fmt;

use crate::model::*;

use super::EntityCache;

/// The cached entity families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Tag,
    UserById,
    UserByName,
    BroadcastById,
    BroadcastsByOwner,
    ThemeByName,
    IconHashByName,
}

impl EntityKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Tag => "tag",
            EntityKind::UserById => "user_by_id",
            EntityKind::UserByName => "user_by_name",
            EntityKind::BroadcastById => "livestream_by_id",
            EntityKind::BroadcastsByOwner => "livestreams_by_owner",
            EntityKind::ThemeByName => "theme_by_name",
            EntityKind::IconHashByName => "icon_hash_by_name",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Natural key of a cached entity: numeric id or unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(i64),
    Name(String),
}

/// Full-table read used to populate the caches.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tags: Vec<Tag>,
    pub users: Vec<User>,
    pub broadcasts: Vec<Broadcast>,
}

/// Every entity cache this process keeps. Constructed explicitly and shared by
/// `Arc`; there is no process-global instance.
#[derive(Default)]
pub struct Caches {
    pub tags: EntityCache<TagId, Tag>,
    pub users_by_id: EntityCache<UserId, User>,
    pub users_by_name: EntityCache<String, User>,
    pub broadcasts_by_id: EntityCache<BroadcastId, Broadcast>,
    /// Owner's broadcasts in id order.
    pub broadcasts_by_owner: EntityCache<UserId, Vec<Broadcast>>,
    pub themes_by_name: EntityCache<String, Theme>,
    /// SHA-256 of the user's icon (or of the fallback image).
    pub icon_hashes_by_name: EntityCache<String, [u8; 32]>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase one of initialization: empty every family.
    pub fn init(&self) {
        self.tags.init();
        self.users_by_id.init();
        self.users_by_name.init();
        self.broadcasts_by_id.init();
        self.broadcasts_by_owner.init();
        self.themes_by_name.init();
        self.icon_hashes_by_name.init();
    }

    /// Phase two: populate from a full table scan. Loading the same snapshot
    /// twice leaves every family unchanged.
    ///
    /// Owner lists are merged by id with what is already cached, so a
    /// broadcast published after `snapshot` was taken is kept.
    pub fn bulk_load(&self, snapshot: &Snapshot) {
        self.tags
            .bulk_set(snapshot.tags.iter().map(|t| (t.id, t.clone())));
        self.users_by_id
            .bulk_set(snapshot.users.iter().map(|u| (u.id, u.clone())));
        self.users_by_name
            .bulk_set(snapshot.users.iter().map(|u| (u.name.clone(), u.clone())));
        self.broadcasts_by_id
            .bulk_set(snapshot.broadcasts.iter().map(|b| (b.id, b.clone())));

        let mut by_owner: HashMap<UserId, Vec<Broadcast>> = HashMap::new();
        for b in &snapshot.broadcasts {
            by_owner.entry(b.owner_id).or_default().push(b.clone());
        }
        for (owner_id, loaded) in by_owner {
            self.broadcasts_by_owner.update(owner_id, |current| {
                let mut list = current.cloned().unwrap_or_default();
                for b in loaded {
                    if !list.iter().any(|c| c.id == b.id) {
                        list.push(b);
                    }
                }
                list.sort_by_key(|b| b.id);
                Some(list)
            });
        }

        tracing::info!(
            tags = snapshot.tags.len(),
            users = snapshot.users.len(),
            livestreams = snapshot.broadcasts.len(),
            "caches loaded"
        );
    }

    /// Force a re-read of one entry on next access. Returns whether an entry
    /// was removed; a key of the wrong shape for `kind` removes nothing.
    pub fn invalidate(&self, kind: EntityKind, key: &CacheKey) -> bool {
        let removed = match (kind, key) {
            (EntityKind::Tag, CacheKey::Id(id)) => self.tags.delete(id).is_some(),
            (EntityKind::UserById, CacheKey::Id(id)) => self.users_by_id.delete(id).is_some(),
            (EntityKind::UserByName, CacheKey::Name(n)) => self.users_by_name.delete(n).is_some(),
            (EntityKind::BroadcastById, CacheKey::Id(id)) => {
                self.broadcasts_by_id.delete(id).is_some()
            }
            (EntityKind::BroadcastsByOwner, CacheKey::Id(id)) => {
                self.broadcasts_by_owner.delete(id).is_some()
            }
            (EntityKind::ThemeByName, CacheKey::Name(n)) => self.themes_by_name.delete(n).is_some(),
            (EntityKind::IconHashByName, CacheKey::Name(n)) => {
                self.icon_hashes_by_name.delete(n).is_some()
            }
            (kind, key) => {
                tracing::debug!(%kind, ?key, "invalidate with mismatched key shape");
                false
            }
        };
        if removed {
            metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL, "family" => kind.label())
                .increment(1);
        }
        removed
    }

    /// Mirror a committed user row.
    pub fn publish_user(&self, user: &User) {
        self.users_by_id.set(user.id, user.clone());
        self.users_by_name.set(user.name.clone(), user.clone());
    }

    /// Mirror a committed broadcast. The owner list is extended in place when
    /// cached; when absent, `load_owner_list` (a read of committed state that
    /// already includes `broadcast`) supplies it.
    pub fn publish_broadcast<F>(&self, broadcast: &Broadcast, load_owner_list: F)
    where
        F: FnOnce() -> Vec<Broadcast>,
    {
        self.broadcasts_by_id.set(broadcast.id, broadcast.clone());
        self.broadcasts_by_owner.update(broadcast.owner_id, |current| {
            let mut list = match current {
                Some(list) => list.clone(),
                None => load_owner_list(),
            };
            if !list.iter().any(|b| b.id == broadcast.id) {
                list.push(broadcast.clone());
            }
            list.sort_by_key(|b| b.id);
            Some(list)
        });
    }
}
