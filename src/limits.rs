//! Input bounds. Requests exceeding these are rejected up front so a single
//! caller cannot balloon memory or the WAL.

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_WINDOWS_PER_RESOURCE: usize = 64;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;
