use super::*;
use crate::model::*;
use std::path::PathBuf;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn open_engine(name: &str) -> Arc<BookingEngine> {
    let engine = Arc::new(BookingEngine::open(&test_wal_path(name), None).unwrap());
    engine.add_service(1, "Haircut", 30, 2_500).await.unwrap();
    engine.add_service(2, "Coloring", 60, 6_000).await.unwrap();
    engine
}

fn req(name: &str, date: &str, time: &str, service_id: u32) -> NewAppointment {
    NewAppointment {
        customer_name: name.into(),
        email: None,
        date: date.into(),
        start_time: time.into(),
        service_id,
    }
}

fn at(date: &str, time: &str) -> Ms {
    datetime_ms(parse_date(date).unwrap(), parse_time(time).unwrap())
}

#[tokio::test]
async fn engine_add_service_and_duplicate_rejected() {
    let engine = open_engine("add_service.wal").await;
    assert_eq!(engine.services().len(), 2);
    assert_eq!(
        engine.add_service(1, "Haircut Again", 45, 3_000).await,
        Err(BookingError::ServiceExists(1))
    );
    assert_eq!(
        engine.add_service(3, "", 30, 1_000).await,
        Err(BookingError::InvalidInput("service name missing or too long"))
    );
    assert_eq!(
        engine.add_service(3, "Massage", 0, 1_000).await,
        Err(BookingError::InvalidInput("service duration must be positive"))
    );
}

#[tokio::test]
async fn engine_book_and_get() {
    let engine = open_engine("book_get.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    assert_eq!(appt.customer_name, "Alice");
    assert_eq!(appt.span, Span::new(at("2026-03-14", "09:00"), at("2026-03-14", "09:30")));
    assert_eq!(appt.status, AppointmentStatus::Pending);

    let fetched = engine.get(appt.id).await.unwrap();
    assert_eq!(fetched, appt);
}

#[tokio::test]
async fn engine_book_unknown_service() {
    let engine = open_engine("unknown_service.wal").await;
    assert_eq!(
        engine.book(req("Alice", "2026-03-14", "09:00", 99)).await,
        Err(BookingError::UnknownService(99))
    );
}

#[tokio::test]
async fn engine_book_rejects_bad_input() {
    let engine = open_engine("bad_input.wal").await;
    assert_eq!(
        engine.book(req("  ", "2026-03-14", "09:00", 1)).await,
        Err(BookingError::InvalidInput("customerName is required"))
    );
    assert_eq!(
        engine.book(req("Alice", "14/03/2026", "09:00", 1)).await,
        Err(BookingError::InvalidInput("unparsable date"))
    );
    assert_eq!(
        engine.book(req("Alice", "2026-03-14", "9am", 1)).await,
        Err(BookingError::InvalidInput("unparsable startTime"))
    );
}

#[tokio::test]
async fn engine_overlap_rejected_with_conflicting_id() {
    let engine = open_engine("overlap.wal").await;
    let first = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    // Second request overlaps the first by 15 minutes.
    assert_eq!(
        engine.book(req("Bob", "2026-03-14", "09:15", 1)).await,
        Err(BookingError::SlotConflict(first.id))
    );
    assert_eq!(engine.list().await.len(), 1);
}

#[tokio::test]
async fn engine_adjacent_appointments_no_conflict() {
    let engine = open_engine("adjacent.wal").await;
    engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    // [09:00,09:30) and [09:30,10:00) touch at the boundary: both commit.
    engine
        .book(req("Bob", "2026-03-14", "09:30", 1))
        .await
        .unwrap();
    assert_eq!(engine.list().await.len(), 2);
}

#[tokio::test]
async fn engine_same_slot_different_services_no_conflict() {
    let engine = open_engine("cross_service.wal").await;
    engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    engine
        .book(req("Bob", "2026-03-14", "09:00", 2))
        .await
        .unwrap();
    assert_eq!(engine.list().await.len(), 2);
}

#[tokio::test]
async fn engine_concurrent_bookings_one_winner() {
    let engine = open_engine("concurrent.wal").await;
    let mut handles = Vec::new();
    for n in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .book(req(&format!("Customer {n}"), "2026-03-14", "10:00", 1))
                .await
        }));
    }
    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(BookingError::SlotConflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(engine.list().await.len(), 1);
}

#[tokio::test]
async fn engine_update_reschedule_checks_conflicts() {
    let engine = open_engine("update_resched.wal").await;
    let alice = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    let bob = engine
        .book(req("Bob", "2026-03-14", "10:00", 1))
        .await
        .unwrap();

    // Moving Bob onto Alice's slot is a conflict.
    assert_eq!(
        engine
            .update(
                bob.id,
                AppointmentPatch {
                    start_time: Some("09:00".into()),
                    ..Default::default()
                },
            )
            .await,
        Err(BookingError::SlotConflict(alice.id))
    );

    // Moving him to a free slot works and recomputes the span.
    let moved = engine
        .update(
            bob.id,
            AppointmentPatch {
                start_time: Some("11:00".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        moved.span,
        Span::new(at("2026-03-14", "11:00"), at("2026-03-14", "11:30"))
    );
}

#[tokio::test]
async fn engine_update_reschedule_excludes_self() {
    let engine = open_engine("update_self.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    // Shifting by 15 minutes overlaps the old position; the appointment must
    // not conflict with itself.
    let moved = engine
        .update(
            appt.id,
            AppointmentPatch {
                start_time: Some("09:15".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.span.start, at("2026-03-14", "09:15"));
}

#[tokio::test]
async fn engine_update_name_only_keeps_span() {
    let engine = open_engine("update_name.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    let updated = engine
        .update(
            appt.id,
            AppointmentPatch {
                customer_name: Some("Alicia".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.customer_name, "Alicia");
    assert_eq!(updated.span, appt.span);
    assert_eq!(updated.status, appt.status);
}

#[tokio::test]
async fn engine_update_moves_between_services() {
    let engine = open_engine("update_move.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    // Service 2 runs 60 minutes; the span is recomputed for the new service.
    let moved = engine
        .update(
            appt.id,
            AppointmentPatch {
                service_id: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.service_id, 2);
    assert_eq!(
        moved.span,
        Span::new(at("2026-03-14", "09:00"), at("2026-03-14", "10:00"))
    );
    // The old service's slot is free again.
    engine
        .book(req("Bob", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_update_missing_id_not_found() {
    let engine = open_engine("update_missing.wal").await;
    assert_eq!(
        engine.update(42, AppointmentPatch::default()).await,
        Err(BookingError::NotFound(42))
    );
}

#[tokio::test]
async fn engine_cancel_frees_slot() {
    let engine = open_engine("cancel.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    engine.cancel(appt.id).await.unwrap();
    assert!(engine.list().await.is_empty());
    // Slot reusable after cancellation.
    engine
        .book(req("Bob", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    // Cancelling twice (or a never-existing id) is NotFound.
    assert_eq!(engine.cancel(appt.id).await, Err(BookingError::NotFound(appt.id)));
}

#[tokio::test]
async fn engine_list_sorted_across_services() {
    let engine = open_engine("list.wal").await;
    engine
        .book(req("Late", "2026-03-14", "11:00", 1))
        .await
        .unwrap();
    engine
        .book(req("Early", "2026-03-14", "09:00", 2))
        .await
        .unwrap();
    engine
        .book(req("Middle", "2026-03-14", "10:00", 1))
        .await
        .unwrap();
    let all = engine.list().await;
    let names: Vec<&str> = all.iter().map(|a| a.customer_name.as_str()).collect();
    assert_eq!(names, vec!["Early", "Middle", "Late"]);
}

#[tokio::test]
async fn engine_mark_completed_idempotent() {
    let engine = open_engine("complete.wal").await;
    let appt = engine
        .book(req("Alice", "2026-03-14", "09:00", 1))
        .await
        .unwrap();
    assert!(engine.mark_completed(appt.id).await.unwrap());
    let appends = engine.wal_appends_since_compact().await;
    // Second transition is a no-op and writes nothing.
    assert!(!engine.mark_completed(appt.id).await.unwrap());
    assert_eq!(engine.wal_appends_since_compact().await, appends);
    assert_eq!(
        engine.get(appt.id).await.unwrap().status,
        AppointmentStatus::Completed
    );
    assert_eq!(
        engine.mark_completed(999).await,
        Err(BookingError::NotFound(999))
    );
}

#[tokio::test]
async fn engine_slots_reflect_bookings() {
    let engine = open_engine("slots.wal").await;
    engine
        .book(req("Alice", "2026-03-14", "10:00", 1))
        .await
        .unwrap();
    let query = engine.slots_for(1, Some("2026-03-14")).await.unwrap();
    assert_eq!(query.service_name, "Haircut");
    assert_eq!(query.duration_minutes, 30);
    assert_eq!(
        query.slots,
        vec!["09:00", "09:30", "10:30", "11:00", "11:30", "14:00", "14:30", "15:00"]
    );
    // Another day is unaffected.
    let other = engine.slots_for(1, Some("2026-03-15")).await.unwrap();
    assert_eq!(other.slots.len(), 9);
    assert_eq!(
        engine.slots_for(99, Some("2026-03-14")).await,
        Err(BookingError::UnknownService(99))
    );
}

#[tokio::test]
async fn engine_batch_book_skips_conflicting_rows() {
    let engine = open_engine("batch.wal").await;
    engine
        .book(req("Existing", "2026-03-14", "09:00", 1))
        .await
        .unwrap();

    let row = |name: &str, time: &str| BatchBooking {
        customer_name: name.into(),
        email: None,
        span: Span::new(at("2026-03-14", time), at("2026-03-14", time) + 30 * MINUTE_MS),
        service_id: 1,
    };
    let outcome = engine
        .batch_book(vec![
            row("A", "09:00"), // conflicts with Existing
            row("B", "10:00"),
            row("C", "10:00"), // intra-batch conflict with B
            row("D", "11:00"),
        ])
        .await
        .unwrap();
    assert_eq!(outcome.inserted.len(), 2);
    assert_eq!(outcome.skipped, 2);
    assert_eq!(engine.list().await.len(), 3);
}

#[tokio::test]
async fn engine_batch_book_spanning_services() {
    let engine = open_engine("batch_multi.wal").await;
    let row = |name: &str, sid: u32, mins: i64| BatchBooking {
        customer_name: name.into(),
        email: None,
        span: Span::new(
            at("2026-03-14", "09:00"),
            at("2026-03-14", "09:00") + mins * MINUTE_MS,
        ),
        service_id: sid,
    };
    let outcome = engine
        .batch_book(vec![row("A", 1, 30), row("B", 2, 60), row("C", 99, 30)])
        .await
        .unwrap();
    assert_eq!(outcome.inserted.len(), 2);
    assert_eq!(outcome.skipped, 1); // unknown service
}

#[tokio::test]
async fn engine_wal_replay() {
    let path = test_wal_path("replay.wal");
    let alice_id;
    {
        let engine = Arc::new(BookingEngine::open(&path, None).unwrap());
        engine.add_service(1, "Haircut", 30, 2_500).await.unwrap();
        let alice = engine
            .book(req("Alice", "2026-03-14", "09:00", 1))
            .await
            .unwrap();
        alice_id = alice.id;
        engine.mark_completed(alice.id).await.unwrap();
        let bob = engine
            .book(req("Bob", "2026-03-14", "10:00", 1))
            .await
            .unwrap();
        engine.cancel(bob.id).await.unwrap();
    }

    let engine = BookingEngine::open(&path, None).unwrap();
    let all = engine.list().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, alice_id);
    assert_eq!(all[0].status, AppointmentStatus::Completed);
    // Id allocation continues past replayed ids.
    let carol = engine
        .book(req("Carol", "2026-03-14", "11:00", 1))
        .await
        .unwrap();
    assert!(carol.id > alice_id);
    // Replayed spans still conflict.
    assert_eq!(
        engine.book(req("Dan", "2026-03-14", "09:00", 1)).await,
        Err(BookingError::SlotConflict(alice_id))
    );
}

#[tokio::test]
async fn engine_compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    {
        let engine = Arc::new(BookingEngine::open(&path, None).unwrap());
        engine.add_service(1, "Haircut", 30, 2_500).await.unwrap();
        for n in 0..20 {
            let appt = engine
                .book(req(
                    &format!("Customer {n}"),
                    "2026-03-14",
                    &format!("{:02}:00", 9 + (n % 6)),
                    1,
                ))
                .await;
            // Only six distinct hours; the rest conflict and that's fine.
            if let Ok(appt) = appt
                && n % 2 == 0
            {
                engine.cancel(appt.id).await.unwrap();
            }
        }
        assert!(engine.wal_appends_since_compact().await > 6);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = BookingEngine::open(&path, None).unwrap();
    assert_eq!(engine.services().len(), 1);
    let all = engine.list().await;
    assert_eq!(all.len(), 3); // odd-numbered winners of hours 9..15
    for pair in all.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start);
    }
}

#[tokio::test]
async fn engine_booking_enqueues_confirmation() {
    let qpath = test_wal_path("notify_queue.wal");
    let queue = Arc::new(crate::queue::JobQueue::open(&qpath).unwrap());
    let engine =
        BookingEngine::open(&test_wal_path("notify_engine.wal"), Some(queue.clone())).unwrap();
    engine.add_service(1, "Haircut", 30, 2_500).await.unwrap();

    engine
        .book(NewAppointment {
            email: Some("alice@example.com".into()),
            ..req("Alice", "2026-03-14", "09:00", 1)
        })
        .await
        .unwrap();
    // No email, no job.
    engine
        .book(req("Bob", "2026-03-14", "10:00", 1))
        .await
        .unwrap();
    assert_eq!(queue.depth(crate::queue::EMAIL_QUEUE).await.waiting, 1);
}
