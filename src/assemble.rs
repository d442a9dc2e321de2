use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::{Caches, EntityKind};
use crate::model::*;
use crate::observability::CACHE_MISSES_TOTAL;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeView {
    pub id: ThemeId,
    pub dark_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub theme: ThemeView,
    /// Lowercase hex SHA-256 of the icon bytes.
    pub icon_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagView {
    pub id: TagId,
    pub name: String,
}

impl From<&Tag> for TagView {
    fn from(tag: &Tag) -> Self {
        Self {
            id: tag.id,
            name: tag.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivestreamView {
    pub id: BroadcastId,
    pub owner: UserView,
    pub title: String,
    pub description: String,
    pub playlist_url: String,
    pub thumbnail_url: String,
    pub tags: Vec<TagView>,
    pub start_at: Ts,
    pub end_at: Ts,
}

#[derive(Debug)]
pub enum AssembleError {
    MissingUser(UserId),
    UnknownUserName(String),
    MissingTag(TagId),
    MissingTheme(UserId),
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::MissingUser(id) => write!(f, "user {id} not found"),
            AssembleError::UnknownUserName(name) => write!(f, "user {name:?} not found"),
            AssembleError::MissingTag(id) => write!(f, "tag {id} not found"),
            AssembleError::MissingTheme(id) => write!(f, "theme for user {id} not found"),
        }
    }
}

impl std::error::Error for AssembleError {}

fn miss(kind: EntityKind) {
    metrics::counter!(CACHE_MISSES_TOTAL, "family" => kind.label()).increment(1);
}

/// Builds the externally visible livestream representation.
///
/// Every lookup goes to the caches first. A miss reads the store and fills
/// the cache through `get_or_load`, so a fill never clobbers a newer value
/// written by a concurrent commit.
pub struct ResponseAssembler {
    store: Arc<Store>,
    caches: Arc<Caches>,
    fallback_icon_hash: [u8; 32],
}

impl ResponseAssembler {
    /// `fallback_icon` is served for users without an icon.
    pub fn new(store: Arc<Store>, caches: Arc<Caches>, fallback_icon: &[u8]) -> Self {
        Self {
            store,
            caches,
            fallback_icon_hash: Sha256::digest(fallback_icon).into(),
        }
    }

    fn user_by_id(&self, id: UserId) -> Result<User, AssembleError> {
        self.caches
            .users_by_id
            .get_or_load(&id, || {
                miss(EntityKind::UserById);
                self.store.user(id)
            })
            .ok_or(AssembleError::MissingUser(id))
    }

    pub fn user_by_name(&self, name: &str) -> Result<User, AssembleError> {
        self.caches
            .users_by_name
            .get_or_load(&name.to_string(), || {
                miss(EntityKind::UserByName);
                self.store.user_by_name(name)
            })
            .ok_or_else(|| AssembleError::UnknownUserName(name.to_string()))
    }

    fn tag(&self, id: TagId) -> Result<Tag, AssembleError> {
        self.caches
            .tags
            .get_or_load(&id, || {
                miss(EntityKind::Tag);
                self.store.tag(id)
            })
            .ok_or(AssembleError::MissingTag(id))
    }

    pub fn theme(&self, user: &User) -> Result<Theme, AssembleError> {
        self.caches
            .themes_by_name
            .get_or_load(&user.name, || {
                miss(EntityKind::ThemeByName);
                self.store.theme(user.id)
            })
            .ok_or(AssembleError::MissingTheme(user.id))
    }

    /// SHA-256 of the user's icon, or of the fallback image when there is none.
    pub fn icon_hash(&self, user: &User) -> [u8; 32] {
        let loaded = self.caches.icon_hashes_by_name.get_or_load(&user.name, || {
            miss(EntityKind::IconHashByName);
            Some(match self.store.icon(user.id) {
                Some(icon) => Sha256::digest(&icon.image).into(),
                None => self.fallback_icon_hash,
            })
        });
        loaded.unwrap_or(self.fallback_icon_hash)
    }

    pub fn user(&self, user: &User) -> Result<UserView, AssembleError> {
        let theme = self.theme(user)?;
        Ok(UserView {
            id: user.id,
            name: user.name.clone(),
            display_name: user.display_name.clone(),
            description: user.description.clone(),
            theme: ThemeView {
                id: theme.id,
                dark_mode: theme.dark_mode,
            },
            icon_hash: hex::encode(self.icon_hash(user)),
        })
    }

    pub fn livestream(&self, broadcast: &Broadcast) -> Result<LivestreamView, AssembleError> {
        let owner = self.user_by_id(broadcast.owner_id)?;
        let owner = self.user(&owner)?;
        self.with_owner(broadcast, owner)
    }

    fn with_owner(&self, broadcast: &Broadcast, owner: UserView) -> Result<LivestreamView, AssembleError> {
        let tags = broadcast
            .tag_ids
            .iter()
            .map(|id| self.tag(*id).map(|t| TagView::from(&t)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LivestreamView {
            id: broadcast.id,
            owner,
            title: broadcast.meta.title.clone(),
            description: broadcast.meta.description.clone(),
            playlist_url: broadcast.meta.playlist_url.clone(),
            thumbnail_url: broadcast.meta.thumbnail_url.clone(),
            tags,
            start_at: broadcast.start_at,
            end_at: broadcast.end_at,
        })
    }

    /// Assemble many broadcasts, building each distinct owner once.
    pub fn livestreams(&self, broadcasts: &[Broadcast]) -> Result<Vec<LivestreamView>, AssembleError> {
        let mut owners: Vec<UserView> = Vec::new();
        let mut views = Vec::with_capacity(broadcasts.len());
        for b in broadcasts {
            let owner = match owners.iter().find(|o| o.id == b.owner_id) {
                Some(o) => o.clone(),
                None => {
                    let user = self.user_by_id(b.owner_id)?;
                    let view = self.user(&user)?;
                    owners.push(view.clone());
                    view
                }
            };
            views.push(self.with_owner(b, owner)?);
        }
        Ok(views)
    }

    pub fn livestream_by_id(&self, id: BroadcastId) -> Result<Option<LivestreamView>, AssembleError> {
        let found = self.caches.broadcasts_by_id.get_or_load(&id, || {
            miss(EntityKind::BroadcastById);
            self.store.broadcast(id)
        });
        found.map(|b| self.livestream(&b)).transpose()
    }

    /// The named user's livestreams in id order.
    pub fn livestreams_by_owner(&self, name: &str) -> Result<Vec<LivestreamView>, AssembleError> {
        let owner = self.user_by_name(name)?;
        let list = self
            .caches
            .broadcasts_by_owner
            .get_or_load(&owner.id, || {
                miss(EntityKind::BroadcastsByOwner);
                Some(self.store.broadcasts_by_owner(owner.id))
            })
            .unwrap_or_default();
        self.livestreams(&list)
    }

    /// Livestreams carrying a tag with this name, or every livestream when
    /// `tag_name` is `None`. Newest first; `limit` applies only to the
    /// untagged listing. Candidates come from the store; each row is then
    /// read through the cache.
    pub fn search(&self, tag_name: Option<&str>, limit: Option<usize>) -> Result<Vec<LivestreamView>, AssembleError> {
        let mut candidates = self.store.broadcasts();
        match tag_name {
            Some(name) => {
                let tag_ids: HashSet<TagId> = self
                    .store
                    .tags()
                    .into_iter()
                    .filter(|t| t.name == name)
                    .map(|t| t.id)
                    .collect();
                candidates.retain(|b| b.tag_ids.iter().any(|id| tag_ids.contains(id)));
            }
            None => {
                if let Some(limit) = limit {
                    candidates.truncate(limit);
                }
            }
        }
        let found: Vec<Broadcast> = candidates
            .into_iter()
            .filter_map(|b| {
                let id = b.id;
                self.caches.broadcasts_by_id.get_or_load(&id, || {
                    miss(EntityKind::BroadcastById);
                    Some(b)
                })
            })
            .collect();
        self.livestreams(&found)
    }

    /// Every tag in id order.
    pub fn tags(&self) -> Vec<TagView> {
        let mut tags = self.caches.tags.all();
        tags.sort_by_key(|t| t.id);
        tags.iter().map(TagView::from).collect()
    }
}
