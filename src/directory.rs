//! Peer write paths that touch cached families. Each one commits to the
//! store first, then brings the caches in line before returning.

use std::sync::Arc;

use crate::cache::{CacheKey, Caches, EntityKind};
use crate::model::*;
use crate::store::{StorageError, Store};

#[derive(Debug)]
pub enum DirectoryError {
    NameTaken(String),
    UnknownUser(UserId),
    Invalid(&'static str),
    Storage(StorageError),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NameTaken(name) => write!(f, "name already taken: {name}"),
            DirectoryError::UnknownUser(id) => write!(f, "user {id} not found"),
            DirectoryError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            DirectoryError::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<StorageError> for DirectoryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Duplicate { value, .. } => DirectoryError::NameTaken(value),
            StorageError::ForeignKey { table: "users", id } => DirectoryError::UnknownUser(id),
            StorageError::Constraint(msg) => DirectoryError::Invalid(msg),
            other => DirectoryError::Storage(other),
        }
    }
}

pub struct Directory {
    store: Arc<Store>,
    caches: Arc<Caches>,
}

impl Directory {
    pub fn new(store: Arc<Store>, caches: Arc<Caches>) -> Self {
        Self { store, caches }
    }

    /// Create the user and their theme together.
    pub async fn register_user(&self, new: NewUser) -> Result<User, DirectoryError> {
        let (user, _theme) = self.store.insert_user(new).await?;
        self.caches.publish_user(&user);
        self.caches
            .invalidate(EntityKind::ThemeByName, &CacheKey::Name(user.name.clone()));
        tracing::info!(user_id = user.id, name = %user.name, "user registered");
        Ok(user)
    }

    pub async fn create_tag(&self, name: String) -> Result<Tag, DirectoryError> {
        let tag = self.store.insert_tag(name).await?;
        self.caches.tags.set(tag.id, tag.clone());
        Ok(tag)
    }

    pub async fn set_theme(&self, user_id: UserId, dark_mode: bool) -> Result<Theme, DirectoryError> {
        let user = self.store.user(user_id).ok_or(DirectoryError::UnknownUser(user_id))?;
        let theme = self.store.set_theme(user_id, dark_mode).await?;
        self.caches
            .invalidate(EntityKind::ThemeByName, &CacheKey::Name(user.name));
        Ok(theme)
    }

    /// Swap the user's icon. The cached hash depends on the icon bytes, so it
    /// is dropped and recomputed on next read.
    pub async fn replace_icon(&self, user_id: UserId, image: Vec<u8>) -> Result<Icon, DirectoryError> {
        let user = self.store.user(user_id).ok_or(DirectoryError::UnknownUser(user_id))?;
        let icon = self.store.replace_icon(user_id, image).await?;
        self.caches
            .invalidate(EntityKind::IconHashByName, &CacheKey::Name(user.name));
        tracing::debug!(user_id, icon_id = icon.id, "icon replaced");
        Ok(icon)
    }
}
