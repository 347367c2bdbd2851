//! Hard limits on input sizes. Checked by the engine, surfaced as `LimitExceeded`.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4096;

pub const MAX_PARTICIPANTS: usize = 64;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

/// Seats a single application may request.
pub const MAX_BATCH_SIZE: usize = 32;
pub const MAX_SESSIONS_PER_TEAM: usize = 64;
pub const MAX_CAPACITY: u32 = 1024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
