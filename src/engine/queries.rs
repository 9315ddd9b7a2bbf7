use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{SLOT_STEP_MINUTES, compute_candidates, day_span};
use super::conflict::filter_free;
use super::{Engine, EngineError};

impl Engine {
    /// Rules plus the tutor's shared buffer. Unknown tutors have no rules.
    pub async fn list_availability(&self, tutor_id: Ulid) -> TutorAvailability {
        let Some(ts) = self.store.tutor(&tutor_id) else {
            return TutorAvailability {
                tutor_id,
                buffer_minutes: 0,
                rules: Vec::new(),
            };
        };
        let guard = ts.read().await;
        TutorAvailability {
            tutor_id,
            buffer_minutes: guard.buffer_minutes,
            rules: guard.rules.clone(),
        }
    }

    /// Availability plus every PENDING/CONFIRMED booking starting on `date`,
    /// across all of the tutor's classes.
    pub async fn availability_with_conflicts(
        &self,
        tutor_id: Ulid,
        date: NaiveDate,
    ) -> AvailabilityOverview {
        let availability = self.list_availability(tutor_id).await;
        let Some(ts) = self.store.tutor(&tutor_id) else {
            return AvailabilityOverview {
                availability,
                bookings: Vec::new(),
            };
        };
        let day = day_span(date);
        let guard = ts.read().await;
        let start = guard.bookings.partition_point(|b| b.scheduled_at < day.start);
        let bookings = guard.bookings[start..]
            .iter()
            .take_while(|b| b.scheduled_at < day.end)
            .filter(|b| b.status.is_active())
            .map(|b| BookedSlot {
                id: b.id,
                scheduled_at: b.scheduled_at,
                status: b.status,
                duration_minutes: b.duration_minutes,
                student_name: self.store.user_name(&b.student_id),
                class_title: self.store.class_title(&b.class_id),
            })
            .collect();
        AvailabilityOverview {
            availability,
            bookings,
        }
    }

    /// Candidate slots for one class on `date`, each marked with the booking
    /// occupying it. A read: the guard re-checks at booking time.
    pub async fn available_slots(
        &self,
        class_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let class = self
            .store
            .class(&class_id)
            .ok_or_else(|| EngineError::not_found("class", class_id))?;
        let Some(ts) = self.store.tutor(&class.tutor_id) else {
            return Ok(Vec::new());
        };
        let guard = ts.read().await;
        let candidates = compute_candidates(
            date,
            &guard.rules,
            class.duration_minutes,
            SLOT_STEP_MINUTES,
        );
        Ok(filter_free(&candidates, class.duration_minutes, &guard.bookings))
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<BookingView> {
        let (tutor_id, _) = self.store.booking_parties(&id)?;
        let ts = self.store.tutor(&tutor_id)?;
        let booking = ts.read().await.booking(id).cloned()?;
        Some(self.view_of(booking))
    }

    /// Every booking of the tutor, any status, by start time.
    pub async fn bookings_for_tutor(&self, tutor_id: Ulid) -> Vec<BookingView> {
        let Some(ts) = self.store.tutor(&tutor_id) else {
            return Vec::new();
        };
        let bookings = ts.read().await.bookings.clone();
        bookings.into_iter().map(|b| self.view_of(b)).collect()
    }

    pub async fn bookings_for_student(&self, student_id: Ulid) -> Vec<BookingView> {
        if self.store.user(&student_id).is_none() {
            return Vec::new();
        }
        let st = self.store.student_or_create(student_id);
        let mut bookings = st.lock().await.bookings.clone();
        bookings.sort_by_key(|b| (b.scheduled_at, b.id));
        bookings.into_iter().map(|b| self.view_of(b)).collect()
    }

    /// All requests on a booking, oldest first.
    pub async fn reschedule_requests(&self, booking_id: Ulid) -> Vec<RescheduleRequest> {
        let Some((tutor_id, _)) = self.store.booking_parties(&booking_id) else {
            return Vec::new();
        };
        let Some(ts) = self.store.tutor(&tutor_id) else {
            return Vec::new();
        };
        let guard = ts.read().await;
        guard
            .reschedules
            .iter()
            .filter(|r| r.booking_id == booking_id)
            .cloned()
            .collect()
    }
}
