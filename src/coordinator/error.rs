use crate::model::Span;
use crate::store::StorageError;

#[derive(Debug)]
pub enum ReserveError {
    /// Empty, inverted, misaligned, or outside the horizon. Nothing was locked.
    OutOfRange { requested: (i64, i64), horizon: Span },
    /// The covered slots lack capacity. Rolled back; nothing mutated.
    Overbooked { requested: Span },
    /// The request breaks a payload limit.
    Invalid(&'static str),
    /// Log failure, lock-wait timeout or constraint violation. Rolled back.
    StorageFailure(StorageError),
}

impl ReserveError {
    /// Client faults map to 400, infrastructure faults to 500.
    pub fn status(&self) -> u16 {
        match self {
            ReserveError::OutOfRange { .. } | ReserveError::Overbooked { .. } | ReserveError::Invalid(_) => 400,
            ReserveError::StorageFailure(_) => 500,
        }
    }

    pub fn is_client_fault(&self) -> bool {
        self.status() < 500
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            ReserveError::OutOfRange { .. } => "out_of_range",
            ReserveError::Overbooked { .. } => "overbooked",
            ReserveError::Invalid(_) => "invalid",
            ReserveError::StorageFailure(_) => "storage_failure",
        }
    }

    /// Message safe to show the caller. Storage details (lock state, table
    /// names) stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ReserveError::OutOfRange { .. } => "bad reservation time range".into(),
            ReserveError::Overbooked { requested } => format!(
                "reservation range {} ~ {} is fully booked",
                requested.start, requested.end
            ),
            ReserveError::Invalid(msg) => format!("invalid reservation: {msg}"),
            ReserveError::StorageFailure(_) => "reservation failed, try again later".into(),
        }
    }
}

impl std::fmt::Display for ReserveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveError::OutOfRange { requested, horizon } => write!(
                f,
                "range [{}, {}) not bookable within horizon [{}, {})",
                requested.0, requested.1, horizon.start, horizon.end
            ),
            ReserveError::Overbooked { requested } => {
                write!(f, "no capacity for [{}, {})", requested.start, requested.end)
            }
            ReserveError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            ReserveError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for ReserveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReserveError::StorageFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for ReserveError {
    fn from(e: StorageError) -> Self {
        ReserveError::StorageFailure(e)
    }
}
