#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Missing or malformed request fields. Not retried.
    InvalidInput(&'static str),
    /// Referenced service does not exist.
    UnknownService(u32),
    /// Referenced appointment does not exist.
    NotFound(i64),
    /// Service already seeded under this id.
    ServiceExists(u32),
    /// The requested window overlaps an existing appointment (its id).
    /// Surfaced as a 409-equivalent; the caller picks another slot.
    SlotConflict(i64),
    LimitExceeded(&'static str),
    /// Transient store failure — safe to retry.
    WalError(String),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::UnknownService(id) => write!(f, "unknown service: {id}"),
            BookingError::NotFound(id) => write!(f, "no such appointment: {id}"),
            BookingError::ServiceExists(id) => write!(f, "service already exists: {id}"),
            BookingError::SlotConflict(id) => {
                write!(f, "slot already booked by appointment: {id}")
            }
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}
