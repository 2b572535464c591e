use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Date/time parsing and formatting ─────────────────────────────

/// Parse a `YYYY-MM-DD` date string.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse an `HH:MM` time-of-day string.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Combine a date and a time-of-day into unix milliseconds.
/// The schedule lives in a single implicit zone, so naive == UTC here.
pub fn datetime_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Midnight of `date` in unix milliseconds.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/// Format a timestamp's time-of-day as `HH:MM`.
pub fn hhmm(ms: Ms) -> String {
    let minutes = ms.div_euclid(MINUTE_MS).rem_euclid(24 * 60);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Format a timestamp's date as `YYYY-MM-DD`.
pub fn date_str(ms: Ms) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => String::new(),
    }
}

// ── Schedule entities ────────────────────────────────────────────

/// A bookable service. Immutable after seeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: u32,
    pub name: String,
    pub duration_minutes: u32,
    /// Price in integer cents — no float money.
    pub price_cents: i64,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub customer_name: String,
    pub email: Option<String>,
    pub span: Span,
    pub service_id: u32,
    pub status: AppointmentStatus,
}

/// All appointments for a single service, sorted by `span.start`.
/// The per-service write lock around this struct is the serialization
/// scope for the conflict check.
#[derive(Debug, Clone)]
pub struct ServiceSchedule {
    pub service: Service,
    pub appointments: Vec<Appointment>,
}

impl ServiceSchedule {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            appointments: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start (ties broken by id).
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&(appt.span.start, appt.id), |a| (a.span.start, a.id))
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn remove_appointment(&mut self, id: i64) -> Option<Appointment> {
        if let Some(pos) = self.appointments.iter().position(|a| a.id == id) {
            Some(self.appointments.remove(pos))
        } else {
            None
        }
    }

    pub fn get(&self, id: i64) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Return only appointments whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the schedule WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceAdded {
        id: u32,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    AppointmentBooked {
        id: i64,
        customer_name: String,
        email: Option<String>,
        span: Span,
        service_id: u32,
        status: AppointmentStatus,
    },
    AppointmentUpdated {
        id: i64,
        customer_name: String,
        email: Option<String>,
        span: Span,
        service_id: u32,
    },
    AppointmentCancelled {
        id: i64,
        service_id: u32,
    },
    AppointmentStatusChanged {
        id: i64,
        service_id: u32,
        status: AppointmentStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> Service {
        Service {
            id: 1,
            name: "Haircut".into(),
            duration_minutes: 30,
            price_cents: 2_500,
        }
    }

    fn appt(id: i64, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id,
            customer_name: format!("c{id}"),
            email: None,
            span: Span::new(start, end),
            service_id: 1,
            status: AppointmentStatus::Pending,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_duration() {
        assert_eq!(Span::new(100, 250).duration_ms(), 150);
    }

    #[test]
    fn parse_helpers() {
        assert!(parse_date("2026-03-14").is_some());
        assert!(parse_date("14/03/2026").is_none());
        assert!(parse_date("garbage").is_none());
        assert!(parse_time("09:30").is_some());
        assert!(parse_time("9 am").is_none());
    }

    #[test]
    fn datetime_roundtrip() {
        let date = parse_date("2026-03-14").unwrap();
        let time = parse_time("10:30").unwrap();
        let ms = datetime_ms(date, time);
        assert_eq!(hhmm(ms), "10:30");
        assert_eq!(date_str(ms), "2026-03-14");
        assert_eq!(ms - day_start_ms(date), 10 * HOUR_MS + 30 * MINUTE_MS);
    }

    #[test]
    fn schedule_ordering() {
        let mut sched = ServiceSchedule::new(svc());
        sched.insert_appointment(appt(1, 300, 400));
        sched.insert_appointment(appt(2, 100, 200));
        sched.insert_appointment(appt(3, 200, 300));
        let starts: Vec<Ms> = sched.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn schedule_remove() {
        let mut sched = ServiceSchedule::new(svc());
        sched.insert_appointment(appt(7, 100, 200));
        assert!(sched.remove_appointment(7).is_some());
        assert!(sched.remove_appointment(7).is_none());
        assert!(sched.appointments.is_empty());
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut sched = ServiceSchedule::new(svc());
        sched.insert_appointment(appt(1, 100, 200));
        sched.insert_appointment(appt(2, 450, 600));
        sched.insert_appointment(appt(3, 1000, 1100));

        let hits: Vec<_> = sched.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Appointment ending exactly at query.start is NOT overlapping (half-open)
        let mut sched = ServiceSchedule::new(svc());
        sched.insert_appointment(appt(1, 100, 200));
        assert_eq!(sched.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_spanning_query() {
        let mut sched = ServiceSchedule::new(svc());
        sched.insert_appointment(appt(1, 0, 10_000));
        assert_eq!(sched.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: 42,
            customer_name: "Alice".into(),
            email: Some("alice@example.com".into()),
            span: Span::new(1000, 2000),
            service_id: 3,
            status: AppointmentStatus::Pending,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
