use std::collections::HashSet;

use chrono::NaiveDate;

use crate::model::*;

use super::BookingError;

// Business hours: candidate slots run 09:00..=15:00 with a [12:00, 14:00)
// lunch exclusion.
const OPEN_MS: Ms = 9 * HOUR_MS;
const CLOSE_MS: Ms = 15 * HOUR_MS;
const LUNCH_START_HOUR: Ms = 12;
const LUNCH_END_MS: Ms = 14 * HOUR_MS;

/// Result of a slot query: the free `HH:MM` starts plus echoed metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub service_id: u32,
    pub service_name: String,
    pub duration_minutes: u32,
    pub date: String,
    pub slots: Vec<String>,
}

/// Compute the open slots for a service on a date, given that day's booked
/// spans. Pure and restartable: identical inputs always yield identical
/// output, in chronological order.
pub fn available_slots(
    service: &Service,
    date: &str,
    booked: &[Span],
) -> Result<Vec<String>, BookingError> {
    let day = parse_date(date).ok_or(BookingError::InvalidInput("unparsable date"))?;
    if service.duration_minutes == 0 {
        return Err(BookingError::InvalidInput("service duration is zero"));
    }
    Ok(grid(service, day, booked))
}

fn grid(service: &Service, day: NaiveDate, booked: &[Span]) -> Vec<String> {
    let day_ms = day_start_ms(day);
    let open = day_ms + OPEN_MS;
    let close = day_ms + CLOSE_MS;
    let step = service.duration_ms();

    // Expand each booked interval onto the same step grid: every tick from
    // its start until its end is taken.
    let mut taken: HashSet<Ms> = HashSet::new();
    for b in booked {
        let mut t = b.start;
        while t < b.end {
            taken.insert(t);
            t += step;
        }
    }

    let mut slots = Vec::new();
    let mut cur = open;
    // `<=`: a final step starting exactly at close is still emitted.
    while cur <= close {
        let hour = (cur - day_ms) / HOUR_MS;
        if hour >= LUNCH_START_HOUR && cur < day_ms + LUNCH_END_MS {
            // Lunch exclusion — stepping resumes from 14:00, skipped steps
            // don't accumulate.
            cur = day_ms + LUNCH_END_MS;
            continue;
        }
        if !taken.contains(&cur) {
            slots.push(hhmm(cur));
        }
        cur += step;
    }
    slots
}
