use std::fmt;
use std::str::FromStr;

use crate::model::{Slot, Span};

/// How the locked slots decide whether a request is admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// The slots must tile the request exactly and every one must have
    /// capacity.
    #[default]
    Strict,
    /// Admit when any covered slot has capacity; every covered slot is then
    /// decremented. A decrement that would go below zero still fails in the
    /// store.
    AnyCovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// The slot grid does not line up with the requested bounds.
    Misaligned,
    Overbooked,
}

impl AdmissionPolicy {
    /// `slots` are the locked rows inside `span` in ascending order;
    /// `available` is how many of them have capacity.
    pub fn admit(&self, span: &Span, slots: &[Slot], available: usize) -> Verdict {
        match self {
            AdmissionPolicy::Strict => {
                if !tiles(span, slots) {
                    Verdict::Misaligned
                } else if available < slots.len() {
                    Verdict::Overbooked
                } else {
                    Verdict::Accept
                }
            }
            AdmissionPolicy::AnyCovered => {
                if available >= 1 {
                    Verdict::Accept
                } else {
                    Verdict::Overbooked
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdmissionPolicy::Strict => "strict",
            AdmissionPolicy::AnyCovered => "any_covered",
        }
    }
}

/// True when `slots` are back to back and cover exactly `span`.
pub fn tiles(span: &Span, slots: &[Slot]) -> bool {
    let (Some(first), Some(last)) = (slots.first(), slots.last()) else {
        return false;
    };
    first.start_at == span.start
        && last.end_at == span.end
        && slots.windows(2).all(|w| w[0].end_at == w[1].start_at)
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPolicy(pub String);

impl fmt::Display for UnknownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown admission policy {:?} (expected strict or any_covered)", self.0)
    }
}

impl std::error::Error for UnknownPolicy {}

impl FromStr for AdmissionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(AdmissionPolicy::Strict),
            "any_covered" | "any-covered" | "anycovered" => Ok(AdmissionPolicy::AnyCovered),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}
