use std::sync::Arc;

use crate::assemble::ResponseAssembler;
use crate::cache::Caches;
use crate::config::{Config, ConfigError};
use crate::coordinator::ReservationCoordinator;
use crate::directory::Directory;
use crate::store::{CalendarSpec, StorageError, Store};

#[derive(Debug)]
pub enum BackendError {
    Config(ConfigError),
    Storage(StorageError),
    Io(std::io::Error),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Config(e) => write!(f, "config: {e}"),
            BackendError::Storage(e) => write!(f, "storage: {e}"),
            BackendError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<ConfigError> for BackendError {
    fn from(e: ConfigError) -> Self {
        BackendError::Config(e)
    }
}

impl From<StorageError> for BackendError {
    fn from(e: StorageError) -> Self {
        BackendError::Storage(e)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e)
    }
}

/// The wired-up core: one store, one set of caches, and the components
/// sharing them.
pub struct Backend {
    pub store: Arc<Store>,
    pub caches: Arc<Caches>,
    pub coordinator: ReservationCoordinator,
    pub directory: Directory,
    pub assembler: ResponseAssembler,
    seed: CalendarSpec,
}

impl Backend {
    /// Replay the log and warm every cache. Returns only once the caches
    /// mirror the store, so no caller can observe a cold cache.
    pub async fn open(config: &Config) -> Result<Self, BackendError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let fallback_icon = config.fallback_icon_bytes()?;
        let store = Arc::new(Store::open(config.wal_path(), &config.calendar, config.lock_timeout)?);

        let caches = Arc::new(Caches::new());
        caches.init();
        caches.bulk_load(&store.snapshot());

        tracing::info!(
            wal = %config.wal_path().display(),
            admission = %config.admission,
            slots = store.calendar().len(),
            "backend ready"
        );
        Ok(Self {
            coordinator: ReservationCoordinator::new(
                store.clone(),
                caches.clone(),
                config.horizon(),
                config.admission,
            ),
            directory: Directory::new(store.clone(), caches.clone()),
            assembler: ResponseAssembler::new(store.clone(), caches.clone(), &fallback_icon),
            store,
            caches,
            seed: config.calendar,
        })
    }

    /// Wipe everything back to a freshly seeded calendar and reload the
    /// caches from the emptied store. The reload runs while the store still
    /// refuses writers, so no commit can land between snapshot and load.
    pub async fn initialize(&self) -> Result<(), BackendError> {
        let caches = Arc::clone(&self.caches);
        self.store
            .reset_then(self.seed, move |snapshot| {
                caches.init();
                caches.bulk_load(&snapshot);
            })
            .await?;
        tracing::info!("backend initialized");
        Ok(())
    }
}
