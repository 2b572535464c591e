mod conflict;
mod error;
pub mod slots;
#[cfg(test)]
mod tests;

pub use error::BookingError;
pub use slots::{SlotQuery, available_slots};

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

use crate::limits::*;
use crate::model::*;
use crate::queue::{EMAIL_QUEUE, JobOptions, JobPayload, JobQueue};
use crate::wal::{self, Wal, WalCommand};

use conflict::{check_no_conflict, conflicts_within, validate_span};

pub type SharedSchedule = Arc<RwLock<ServiceSchedule>>;

/// A booking request as received from the outside: plain strings, validated
/// and resolved by the engine.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub customer_name: String,
    pub email: Option<String>,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`
    pub start_time: String,
    pub service_id: u32,
}

/// Partial update. `None` leaves a field untouched; start/end are recomputed
/// only when date, start time, or service change.
#[derive(Debug, Clone, Default)]
pub struct AppointmentPatch {
    pub customer_name: Option<String>,
    pub email: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub service_id: Option<u32>,
}

/// One pre-resolved row of a bulk import batch.
#[derive(Debug, Clone)]
pub struct BatchBooking {
    pub customer_name: String,
    pub email: Option<String>,
    pub span: Span,
    pub service_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub inserted: Vec<Appointment>,
    /// Rows dropped for conflicts or unknown services.
    pub skipped: usize,
}

/// The conflict-checked booking engine. Owns the schedule store: one
/// `ServiceSchedule` per service behind its own write lock, which is the
/// serializable scope for check-then-insert. The store is the single source
/// of truth for overlap decisions — there is no separate booking cache.
pub struct BookingEngine {
    services: DashMap<u32, Service>,
    schedules: DashMap<u32, SharedSchedule>,
    /// Reverse lookup: appointment id → service id.
    appointment_to_service: DashMap<i64, u32>,
    next_appointment_id: AtomicI64,
    wal_tx: mpsc::Sender<WalCommand<Event>>,
    /// Confirmation jobs go here on successful booking, when present.
    notify: Option<Arc<JobQueue>>,
}

impl BookingEngine {
    pub fn open(wal_path: &Path, notify: Option<Arc<JobQueue>>) -> io::Result<Self> {
        let events = Wal::<Event>::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let wal_tx = wal::spawn_writer(wal);

        let engine = Self {
            services: DashMap::new(),
            schedules: DashMap::new(),
            appointment_to_service: DashMap::new(),
            next_appointment_id: AtomicI64::new(1),
            wal_tx,
            notify,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never blocking_write here: open may run inside
        // an async context.
        for event in events {
            engine.apply_replay(event);
        }

        Ok(engine)
    }

    fn apply_replay(&self, event: Event) {
        match event {
            Event::ServiceAdded {
                id,
                name,
                duration_minutes,
                price_cents,
            } => {
                let service = Service {
                    id,
                    name,
                    duration_minutes,
                    price_cents,
                };
                self.schedules
                    .insert(id, Arc::new(RwLock::new(ServiceSchedule::new(service.clone()))));
                self.services.insert(id, service);
            }
            Event::AppointmentBooked {
                id,
                customer_name,
                email,
                span,
                service_id,
                status,
            } => {
                let Some(sched) = self.schedule(service_id) else {
                    warn!("replay: appointment {id} references unknown service {service_id}");
                    return;
                };
                let mut guard = sched.try_write().expect("replay: uncontended write");
                guard.insert_appointment(Appointment {
                    id,
                    customer_name,
                    email,
                    span,
                    service_id,
                    status,
                });
                self.appointment_to_service.insert(id, service_id);
                self.bump_next_id(id);
            }
            Event::AppointmentUpdated {
                id,
                customer_name,
                email,
                span,
                service_id,
            } => {
                let Some(old_sid) = self.appointment_to_service.get(&id).map(|e| *e.value())
                else {
                    return;
                };
                let Some(old_sched) = self.schedule(old_sid) else {
                    return;
                };
                let removed = old_sched
                    .try_write()
                    .expect("replay: uncontended write")
                    .remove_appointment(id);
                let Some(removed) = removed else { return };
                let Some(new_sched) = self.schedule(service_id) else {
                    return;
                };
                new_sched
                    .try_write()
                    .expect("replay: uncontended write")
                    .insert_appointment(Appointment {
                        id,
                        customer_name,
                        email,
                        span,
                        service_id,
                        status: removed.status,
                    });
                self.appointment_to_service.insert(id, service_id);
            }
            Event::AppointmentCancelled { id, service_id } => {
                if let Some(sched) = self.schedule(service_id) {
                    sched
                        .try_write()
                        .expect("replay: uncontended write")
                        .remove_appointment(id);
                }
                self.appointment_to_service.remove(&id);
            }
            Event::AppointmentStatusChanged {
                id,
                service_id,
                status,
            } => {
                if let Some(sched) = self.schedule(service_id)
                    && let Some(appt) = sched
                        .try_write()
                        .expect("replay: uncontended write")
                        .get_mut(id)
                {
                    appt.status = status;
                }
            }
        }
    }

    fn bump_next_id(&self, seen: i64) {
        self.next_appointment_id.fetch_max(seen + 1, Ordering::SeqCst);
    }

    fn alloc_id(&self) -> i64 {
        self.next_appointment_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        wal::append_via(&self.wal_tx, event.clone())
            .await
            .map_err(|e| BookingError::WalError(e.to_string()))
    }

    pub fn schedule(&self, service_id: u32) -> Option<SharedSchedule> {
        self.schedules.get(&service_id).map(|e| e.value().clone())
    }

    pub fn service(&self, id: u32) -> Option<Service> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    pub fn services(&self) -> Vec<Service> {
        let mut all: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn has_services(&self) -> bool {
        !self.services.is_empty()
    }

    // ── Services ─────────────────────────────────────────────

    /// Seed a service. Services are immutable once added.
    pub async fn add_service(
        &self,
        id: u32,
        name: &str,
        duration_minutes: u32,
        price_cents: i64,
    ) -> Result<Service, BookingError> {
        if self.services.len() >= MAX_SERVICES {
            return Err(BookingError::LimitExceeded("too many services"));
        }
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(BookingError::InvalidInput("service name missing or too long"));
        }
        if duration_minutes == 0 {
            return Err(BookingError::InvalidInput("service duration must be positive"));
        }
        if self.services.contains_key(&id) {
            return Err(BookingError::ServiceExists(id));
        }

        let event = Event::ServiceAdded {
            id,
            name: name.trim().to_string(),
            duration_minutes,
            price_cents,
        };
        self.wal_append(&event).await?;
        let service = Service {
            id,
            name: name.trim().to_string(),
            duration_minutes,
            price_cents,
        };
        self.schedules
            .insert(id, Arc::new(RwLock::new(ServiceSchedule::new(service.clone()))));
        self.services.insert(id, service.clone());
        Ok(service)
    }

    // ── Booking path ─────────────────────────────────────────

    fn resolve_span(
        service: &Service,
        date: &str,
        start_time: &str,
    ) -> Result<Span, BookingError> {
        let day = parse_date(date).ok_or(BookingError::InvalidInput("unparsable date"))?;
        let time =
            parse_time(start_time).ok_or(BookingError::InvalidInput("unparsable startTime"))?;
        let start = datetime_ms(day, time);
        let span = Span::new(start, start + service.duration_ms());
        validate_span(&span)?;
        Ok(span)
    }

    /// Create an appointment. The conflict scan and the insert run under the
    /// service's write lock, so two concurrent overlapping requests cannot
    /// both observe "no conflict".
    pub async fn book(&self, req: NewAppointment) -> Result<Appointment, BookingError> {
        if req.customer_name.trim().is_empty() {
            return Err(BookingError::InvalidInput("customerName is required"));
        }
        if req.customer_name.len() > MAX_NAME_LEN {
            return Err(BookingError::LimitExceeded("customer name too long"));
        }
        if req.date.trim().is_empty() {
            return Err(BookingError::InvalidInput("date is required"));
        }
        if req.start_time.trim().is_empty() {
            return Err(BookingError::InvalidInput("startTime is required"));
        }

        let service = self
            .service(req.service_id)
            .ok_or(BookingError::UnknownService(req.service_id))?;
        let span = Self::resolve_span(&service, &req.date, &req.start_time)?;

        let sched = self
            .schedule(req.service_id)
            .ok_or(BookingError::UnknownService(req.service_id))?;
        let mut guard = sched.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_SERVICE {
            return Err(BookingError::LimitExceeded("too many appointments for service"));
        }

        if let Err(e) = check_no_conflict(&guard, &span, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let email = req.email.filter(|e| !e.trim().is_empty());
        let appt = Appointment {
            id: self.alloc_id(),
            customer_name: req.customer_name.trim().to_string(),
            email,
            span,
            service_id: req.service_id,
            status: AppointmentStatus::Pending,
        };
        let event = Event::AppointmentBooked {
            id: appt.id,
            customer_name: appt.customer_name.clone(),
            email: appt.email.clone(),
            span: appt.span,
            service_id: appt.service_id,
            status: appt.status,
        };
        self.wal_append(&event).await?;
        guard.insert_appointment(appt.clone());
        self.appointment_to_service.insert(appt.id, appt.service_id);
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        self.enqueue_confirmation(&appt).await;
        Ok(appt)
    }

    /// Queue the confirmation email for a committed appointment. The booking
    /// is already durable, so a queue failure is logged, not propagated.
    async fn enqueue_confirmation(&self, appt: &Appointment) {
        let (Some(queue), Some(email)) = (&self.notify, &appt.email) else {
            return;
        };
        let result = queue
            .enqueue(
                EMAIL_QUEUE,
                JobPayload::SendConfirmation {
                    email: email.clone(),
                    subject: "Appointment Confirmation".into(),
                    message: "Your appointment is confirmed.".into(),
                    appointment_id: appt.id,
                },
                JobOptions::with_dedupe_key(format!("confirm:{}", appt.id)),
            )
            .await;
        if let Err(e) = result {
            warn!("failed to enqueue confirmation for appointment {}: {e}", appt.id);
        }
    }

    /// Update an appointment. Start/end are recomputed — and the conflict
    /// scan re-run, excluding the appointment itself — only when date, start
    /// time, or service change. Unrelated field edits never touch the span.
    pub async fn update(
        &self,
        id: i64,
        patch: AppointmentPatch,
    ) -> Result<Appointment, BookingError> {
        let old_sid = self
            .appointment_to_service
            .get(&id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(id))?;
        let new_sid = patch.service_id.unwrap_or(old_sid);
        let service_changed = new_sid != old_sid;
        let service = self
            .service(new_sid)
            .ok_or(BookingError::UnknownService(new_sid))?;

        // Write locks in sorted service order to prevent deadlocks.
        let mut sids = vec![old_sid, new_sid];
        sids.sort_unstable();
        sids.dedup();
        let mut guards = Vec::with_capacity(sids.len());
        let mut guard_idx = HashMap::new();
        for sid in &sids {
            let sched = self
                .schedule(*sid)
                .ok_or(BookingError::UnknownService(*sid))?;
            guard_idx.insert(*sid, guards.len());
            guards.push(sched.write_owned().await);
        }

        let existing = guards[guard_idx[&old_sid]]
            .get(id)
            .cloned()
            .ok_or(BookingError::NotFound(id))?;

        let reschedule =
            patch.date.is_some() || patch.start_time.is_some() || service_changed;
        let span = if reschedule {
            let date = match &patch.date {
                Some(d) => d.clone(),
                None => date_str(existing.span.start),
            };
            let start_time = match &patch.start_time {
                Some(t) => t.clone(),
                None => hhmm(existing.span.start),
            };
            let span = Self::resolve_span(&service, &date, &start_time)?;
            if let Err(e) = check_no_conflict(&guards[guard_idx[&new_sid]], &span, Some(id)) {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            span
        } else {
            existing.span
        };

        let updated = Appointment {
            id,
            customer_name: patch
                .customer_name
                .unwrap_or_else(|| existing.customer_name.clone()),
            email: patch.email.or_else(|| existing.email.clone()),
            span,
            service_id: new_sid,
            status: existing.status,
        };
        let event = Event::AppointmentUpdated {
            id,
            customer_name: updated.customer_name.clone(),
            email: updated.email.clone(),
            span,
            service_id: new_sid,
        };
        self.wal_append(&event).await?;
        guards[guard_idx[&old_sid]].remove_appointment(id);
        guards[guard_idx[&new_sid]].insert_appointment(updated.clone());
        self.appointment_to_service.insert(id, new_sid);
        Ok(updated)
    }

    /// Remove an appointment. A missing id is `NotFound`, not a silent no-op.
    pub async fn cancel(&self, id: i64) -> Result<(), BookingError> {
        let sid = self
            .appointment_to_service
            .get(&id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(id))?;
        let sched = self.schedule(sid).ok_or(BookingError::NotFound(id))?;
        let mut guard = sched.write().await;
        if guard.get(id).is_none() {
            return Err(BookingError::NotFound(id));
        }
        let event = Event::AppointmentCancelled { id, service_id: sid };
        self.wal_append(&event).await?;
        guard.remove_appointment(id);
        self.appointment_to_service.remove(&id);
        Ok(())
    }

    /// All appointments, ordered by start time ascending (ties by id).
    pub async fn list(&self) -> Vec<Appointment> {
        let scheds: Vec<SharedSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::new();
        for sched in scheds {
            let guard = sched.read().await;
            all.extend(guard.appointments.iter().cloned());
        }
        all.sort_by_key(|a| (a.span.start, a.id));
        all
    }

    pub async fn get(&self, id: i64) -> Option<Appointment> {
        let sid = self.appointment_to_service.get(&id).map(|e| *e.value())?;
        let sched = self.schedule(sid)?;
        let guard = sched.read().await;
        guard.get(id).cloned()
    }

    /// Idempotent status transition used by the notification worker.
    /// Returns false when the appointment was already COMPLETED.
    pub async fn mark_completed(&self, id: i64) -> Result<bool, BookingError> {
        let sid = self
            .appointment_to_service
            .get(&id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(id))?;
        let sched = self.schedule(sid).ok_or(BookingError::NotFound(id))?;
        let mut guard = sched.write().await;
        let status = guard.get(id).map(|a| a.status).ok_or(BookingError::NotFound(id))?;
        if status == AppointmentStatus::Completed {
            return Ok(false);
        }
        let event = Event::AppointmentStatusChanged {
            id,
            service_id: sid,
            status: AppointmentStatus::Completed,
        };
        self.wal_append(&event).await?;
        if let Some(appt) = guard.get_mut(id) {
            appt.status = AppointmentStatus::Completed;
        }
        Ok(true)
    }

    // ── Slot queries ─────────────────────────────────────────

    /// Open slots for a service on a date (defaults to today), with echoed
    /// service metadata.
    pub async fn slots_for(
        &self,
        service_id: u32,
        date: Option<&str>,
    ) -> Result<SlotQuery, BookingError> {
        let service = self
            .service(service_id)
            .ok_or(BookingError::UnknownService(service_id))?;
        let date = date
            .map(str::to_string)
            .unwrap_or_else(|| date_str(now_ms()));
        // Validate before touching the schedule.
        let day = parse_date(&date).ok_or(BookingError::InvalidInput("unparsable date"))?;

        let window = Span::new(day_start_ms(day), day_start_ms(day) + DAY_MS);
        let sched = self
            .schedule(service_id)
            .ok_or(BookingError::UnknownService(service_id))?;
        let guard = sched.read().await;
        let booked: Vec<Span> = guard.overlapping(&window).map(|a| a.span).collect();
        drop(guard);

        let slots = slots::available_slots(&service, &date, &booked)?;
        Ok(SlotQuery {
            service_id,
            service_name: service.name,
            duration_minutes: service.duration_minutes,
            date,
            slots,
        })
    }

    // ── Bulk insertion ───────────────────────────────────────

    /// Insert a batch of pre-resolved rows in one lock hold per service.
    /// Each row is checked against persisted appointments AND rows accepted
    /// earlier in the same batch; conflicting rows are skipped, never the
    /// whole batch. Skipping makes reprocessing idempotent: a retried import
    /// finds its own earlier inserts as conflicts.
    pub async fn batch_book(
        &self,
        rows: Vec<BatchBooking>,
    ) -> Result<BatchOutcome, BookingError> {
        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }
        if rows.len() > MAX_BATCH_SIZE {
            return Err(BookingError::LimitExceeded("batch too large"));
        }

        let mut outcome = BatchOutcome::default();
        let mut valid = Vec::with_capacity(rows.len());
        for row in rows {
            if self.services.contains_key(&row.service_id) {
                valid.push(row);
            } else {
                warn!("batch row for unknown service {}, skipping", row.service_id);
                outcome.skipped += 1;
            }
        }

        // Write locks in sorted service order to prevent deadlocks.
        let mut sids: Vec<u32> = valid.iter().map(|r| r.service_id).collect();
        sids.sort_unstable();
        sids.dedup();
        let mut guards = Vec::with_capacity(sids.len());
        let mut guard_idx = HashMap::new();
        for sid in &sids {
            let sched = self
                .schedule(*sid)
                .ok_or(BookingError::UnknownService(*sid))?;
            guard_idx.insert(*sid, guards.len());
            guards.push(sched.write_owned().await);
        }

        // Phase 1: validate each row against current state + intra-batch.
        let mut accepted: Vec<BatchBooking> = Vec::with_capacity(valid.len());
        let mut accepted_spans: HashMap<u32, Vec<Span>> = HashMap::new();
        for row in valid {
            let guard = &guards[guard_idx[&row.service_id]];
            if validate_span(&row.span).is_err()
                || guard.appointments.len() >= MAX_APPOINTMENTS_PER_SERVICE
            {
                outcome.skipped += 1;
                continue;
            }
            let batch_spans = accepted_spans.entry(row.service_id).or_default();
            if check_no_conflict(guard, &row.span, None).is_err()
                || conflicts_within(batch_spans, &row.span)
            {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                outcome.skipped += 1;
                continue;
            }
            batch_spans.push(row.span);
            accepted.push(row);
        }

        // Phase 2: all survivors validated — commit them.
        for row in accepted {
            let appt = Appointment {
                id: self.alloc_id(),
                customer_name: row.customer_name,
                email: row.email,
                span: row.span,
                service_id: row.service_id,
                status: AppointmentStatus::Pending,
            };
            let event = Event::AppointmentBooked {
                id: appt.id,
                customer_name: appt.customer_name.clone(),
                email: appt.email.clone(),
                span: appt.span,
                service_id: appt.service_id,
                status: appt.status,
            };
            self.wal_append(&event).await?;
            guards[guard_idx[&appt.service_id]].insert_appointment(appt.clone());
            self.appointment_to_service.insert(appt.id, appt.service_id);
            outcome.inserted.push(appt);
        }

        metrics::counter!(crate::observability::BOOKINGS_TOTAL)
            .increment(outcome.inserted.len() as u64);
        Ok(outcome)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let mut records = Vec::new();
        for service in self.services() {
            records.push(Event::ServiceAdded {
                id: service.id,
                name: service.name,
                duration_minutes: service.duration_minutes,
                price_cents: service.price_cents,
            });
        }
        let scheds: Vec<SharedSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        for sched in scheds {
            let guard = sched.read().await;
            for appt in &guard.appointments {
                records.push(Event::AppointmentBooked {
                    id: appt.id,
                    customer_name: appt.customer_name.clone(),
                    email: appt.email.clone(),
                    span: appt.span,
                    service_id: appt.service_id,
                    status: appt.status,
                });
            }
        }
        wal::compact_via(&self.wal_tx, records)
            .await
            .map_err(|e| BookingError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        wal::appends_since_compact_via(&self.wal_tx).await
    }
}
