//! Hard bounds enforced by the booking core and the transport.

/// Shortest bookable window, in minutes.
pub const MIN_DURATION_MINUTES: i32 = 30;
/// Longest bookable window, in minutes.
pub const MAX_DURATION_MINUTES: i32 = 240;

pub const MAX_BUFFER_MINUTES: u16 = 60;
pub const DEFAULT_BUFFER_MINUTES: u16 = 15;

pub const MAX_NOTES_LEN: usize = 500;

/// Default same-day active reservations per user.
pub const DEFAULT_DAILY_LIMIT: usize = 3;
/// Default largest party accepted at any single table.
pub const DEFAULT_MAX_PARTY_SIZE: u32 = 8;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

pub const MAX_ROOMS_PER_CONNECTION: usize = 64;
/// Pending events per connection before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 256;
/// Longest accepted request line, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
