//! Hard caps on input sizes. Everything here is enforced before a WAL append.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_TIMEZONE_LEN: usize = 64;
pub const MAX_TOKEN_LEN: usize = 128;

pub const MAX_USERS: usize = 1_000_000;
pub const MAX_RULES_PER_TUTOR: usize = 256;
pub const MAX_BOOKINGS_PER_TUTOR: usize = 100_000;

/// Longest bookable session: one day.
pub const MAX_SESSION_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_LISTEN_CHANNELS: usize = 64;
