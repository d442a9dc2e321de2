use crate::model::{Span, Ts};

use super::ReserveError;

/// The bounded window across which slots exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon(Span);

impl Horizon {
    pub fn new(span: Span) -> Self {
        Self(span)
    }

    pub fn span(&self) -> Span {
        self.0
    }

    /// Accept `[start, end)` only when it is non-empty and lies inside the
    /// horizon.
    pub fn validate(&self, start: Ts, end: Ts) -> Result<Span, ReserveError> {
        let out_of_range = || ReserveError::OutOfRange {
            requested: (start, end),
            horizon: self.0,
        };
        let span = Span::try_new(start, end).ok_or_else(out_of_range)?;
        if !self.0.contains_span(&span) {
            return Err(out_of_range());
        }
        Ok(span)
    }
}
