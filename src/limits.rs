//! Hard limits on request payloads and store growth.

pub const MAX_TAGS_PER_BROADCAST: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_ICON_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on slots in one calendar; protects against a misconfigured horizon.
pub const MAX_SLOTS: usize = 1_000_000;

/// Largest WAL record accepted on write or replay. Covers a full calendar
/// snapshot of `MAX_SLOTS` rows and an icon of `MAX_ICON_BYTES`.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;
