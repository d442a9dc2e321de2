use serde::{Deserialize, Serialize};

/// Unix seconds. The only time type.
pub type Ts = i64;

pub type UserId = i64;
pub type TagId = i64;
pub type BroadcastId = i64;
pub type ThemeId = i64;
pub type IconId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted bounds.
    pub fn try_new(start: Ts, end: Ts) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Ts {
        self.end - self.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One fixed-width unit of bookable calendar time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start_at: Ts,
    pub end_at: Ts,
    pub remaining_capacity: u32,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start_at, self.end_at)
    }

    pub fn has_capacity(&self) -> bool {
        self.remaining_capacity > 0
    }
}

/// Caller identity, authenticated by the session layer before it reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller(UserId);

impl Caller {
    pub fn authenticated(user_id: UserId) -> Self {
        Self(user_id)
    }

    pub fn user_id(&self) -> UserId {
        self.0
    }
}

/// Opaque broadcast metadata carried through the core untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMeta {
    pub title: String,
    pub description: String,
    pub playlist_url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub start_at: Ts,
    pub end_at: Ts,
    pub tag_ids: Vec<TagId>,
    pub meta: BroadcastMeta,
}

/// An accepted reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub owner_id: UserId,
    pub meta: BroadcastMeta,
    pub start_at: Ts,
    pub end_at: Ts,
    pub tag_ids: Vec<TagId>,
}

impl Broadcast {
    pub fn span(&self) -> Span {
        Span::new(self.start_at, self.end_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub password_hash: String,
}

/// Registration input; the password is already hashed by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub password_hash: String,
    pub dark_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    pub id: ThemeId,
    pub user_id: UserId,
    pub dark_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
    pub id: IconId,
    pub user_id: UserId,
    pub image: Vec<u8>,
}

/// Log records, one per committed write. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Full calendar state: written on seeding, reset and compaction.
    CalendarSeeded { slot_secs: Ts, slots: Vec<Slot> },
    /// Registration writes the user and their theme together.
    UserCreated { user: User, theme: Theme },
    TagCreated { tag: Tag },
    ThemeSet { theme: Theme },
    IconReplaced { icon: Icon },
    /// Decrements every slot inside the broadcast's span and inserts the row.
    BroadcastReserved { broadcast: Broadcast },
    /// Row insert only; the calendar snapshot already carries the decrement.
    BroadcastRestored { broadcast: Broadcast },
}
