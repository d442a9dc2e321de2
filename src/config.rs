use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::{AdmissionPolicy, Horizon};
use crate::model::{Span, Ts};
use crate::store::CalendarSpec;

/// 2023-11-25T01:00:00Z
pub const DEFAULT_HORIZON_START: Ts = 1_700_874_000;
/// 2024-11-25T01:00:00Z
pub const DEFAULT_HORIZON_END: Ts = 1_732_496_400;
pub const DEFAULT_SLOT_SECS: Ts = 3600;
pub const DEFAULT_SLOT_CAPACITY: u32 = 5;

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Io { path: PathBuf, error: std::io::Error },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::Io { path, error } => write!(f, "cannot read {}: {error}", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub calendar: CalendarSpec,
    pub admission: AdmissionPolicy,
    pub lock_timeout: Duration,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Image hashed for users without an icon. Empty bytes when unset.
    pub fallback_icon: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            calendar: CalendarSpec {
                horizon: Span::new(DEFAULT_HORIZON_START, DEFAULT_HORIZON_END),
                slot_secs: DEFAULT_SLOT_SECS,
                capacity: DEFAULT_SLOT_CAPACITY,
            },
            admission: AdmissionPolicy::Strict,
            lock_timeout: Duration::from_secs(5),
            compact_threshold: 1000,
            metrics_port: None,
            fallback_icon: None,
        }
    }
}

impl Config {
    /// Read `CASTSLOT_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(dir) = lookup("CASTSLOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        let start = parse(&lookup, "CASTSLOT_HORIZON_START")?.unwrap_or(DEFAULT_HORIZON_START);
        let end = parse(&lookup, "CASTSLOT_HORIZON_END")?.unwrap_or(DEFAULT_HORIZON_END);
        config.calendar.horizon = Span::try_new(start, end).ok_or(ConfigError::Invalid {
            var: "CASTSLOT_HORIZON_END",
            value: end.to_string(),
        })?;
        if let Some(secs) = parse(&lookup, "CASTSLOT_SLOT_SECS")? {
            config.calendar.slot_secs = secs;
        }
        if let Some(capacity) = parse(&lookup, "CASTSLOT_SLOT_CAPACITY")? {
            config.calendar.capacity = capacity;
        }
        if let Some(policy) = parse(&lookup, "CASTSLOT_ADMISSION")? {
            config.admission = policy;
        }
        if let Some(ms) = parse(&lookup, "CASTSLOT_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse(&lookup, "CASTSLOT_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        config.metrics_port = parse(&lookup, "CASTSLOT_METRICS_PORT")?;
        config.fallback_icon = lookup("CASTSLOT_FALLBACK_ICON").map(PathBuf::from);

        if config.calendar.slot_secs <= 0 {
            return Err(ConfigError::Invalid {
                var: "CASTSLOT_SLOT_SECS",
                value: config.calendar.slot_secs.to_string(),
            });
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("castslot.wal")
    }

    pub fn horizon(&self) -> Horizon {
        Horizon::new(self.calendar.horizon)
    }

    pub fn fallback_icon_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        match &self.fallback_icon {
            Some(path) => std::fs::read(path).map_err(|error| ConfigError::Io {
                path: path.clone(),
                error,
            }),
            None => Ok(Vec::new()),
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
