use crate::model::*;

use super::BookingError;

pub(crate) fn validate_span(span: &Span) -> Result<(), BookingError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(BookingError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

/// Scan the schedule for any appointment whose `[start, end)` window strictly
/// overlaps `span`. Back-to-back appointments touching at the boundary do not
/// conflict. `exclude` skips the appointment being rescheduled.
///
/// Must run under the schedule's write lock so the check and the subsequent
/// insert are serialized against all other writers for this service.
pub(crate) fn find_conflict(
    schedule: &ServiceSchedule,
    span: &Span,
    exclude: Option<i64>,
) -> Option<i64> {
    schedule
        .overlapping(span)
        .find(|a| exclude != Some(a.id))
        .map(|a| a.id)
}

pub(crate) fn check_no_conflict(
    schedule: &ServiceSchedule,
    span: &Span,
    exclude: Option<i64>,
) -> Result<(), BookingError> {
    match find_conflict(schedule, span, exclude) {
        Some(id) => Err(BookingError::SlotConflict(id)),
        None => Ok(()),
    }
}

/// Intra-batch check: does `span` overlap any span already accepted from the
/// same batch for the same service?
pub(crate) fn conflicts_within(accepted: &[Span], span: &Span) -> bool {
    accepted.iter().any(|s| s.overlaps(span))
}
