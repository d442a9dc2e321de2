use crate::model::Span;

#[derive(Debug)]
pub enum StorageError {
    /// Slot row locks for the span were not acquired before the deadline.
    LockTimeout(Span),
    /// A reset or compaction held the store past the lock-wait deadline.
    GateTimeout,
    /// A row references a missing user or tag.
    ForeignKey { table: &'static str, id: i64 },
    /// A unique column already holds this value.
    Duplicate { table: &'static str, value: String },
    /// Decrement would take a slot below zero.
    CapacityUnderflow { start_at: i64 },
    /// The transaction was used outside its protocol.
    Constraint(&'static str),
    InvalidCalendar(String),
    WalError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::LockTimeout(span) => {
                write!(f, "lock wait timeout on slots [{}, {})", span.start, span.end)
            }
            StorageError::GateTimeout => write!(f, "lock wait timeout behind store maintenance"),
            StorageError::ForeignKey { table, id } => {
                write!(f, "foreign key violation: no {table} row with id {id}")
            }
            StorageError::Duplicate { table, value } => {
                write!(f, "duplicate entry in {table}: {value}")
            }
            StorageError::CapacityUnderflow { start_at } => {
                write!(f, "slot at {start_at} has no remaining capacity")
            }
            StorageError::Constraint(msg) => write!(f, "constraint violation: {msg}"),
            StorageError::InvalidCalendar(msg) => write!(f, "invalid calendar: {msg}"),
            StorageError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}
