/// Hours in a booking day. Valid hour boundaries are `0..HOURS_PER_DAY`.
pub const HOURS_PER_DAY: u32 = 24;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_PURPOSE_LEN: usize = 512;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_REGULATIONS_LEN: usize = 16 * 1024;

/// Longest request line accepted on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Dates a single connection may listen on at once.
pub const MAX_LISTENS_PER_CONNECTION: usize = 62;

/// Default number of optimistic commit attempts before giving up.
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 3;
