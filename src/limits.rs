use crate::model::Ms;

/// Hard caps. Kept deliberately generous — they exist to bound memory and
/// WAL growth, not to shape business rules.
pub const MAX_SERVICES: usize = 1_024;

pub const MAX_APPOINTMENTS_PER_SERVICE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;

/// Rows handed to the store in one atomic batch insert.
pub const IMPORT_BATCH_SIZE: usize = 1_000;

pub const MAX_BATCH_SIZE: usize = IMPORT_BATCH_SIZE;

/// Jobs allowed to sit in a single queue (waiting + active).
pub const MAX_QUEUE_DEPTH: usize = 100_000;

/// 2000-01-01T00:00:00Z — anything earlier is a parsing bug upstream.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// An appointment never spans more than one day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;
