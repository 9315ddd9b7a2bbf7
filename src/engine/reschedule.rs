use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::{find_student_conflict, find_tutor_conflict, now_ms, validate_future};
use super::{Engine, EngineError};

impl Engine {
    /// Either participant proposes a new start. Not conflict-checked until
    /// the other side accepts.
    pub async fn propose_reschedule(
        &self,
        actor: Ulid,
        id: Ulid,
        booking_id: Ulid,
        proposed_time: Ms,
    ) -> Result<RescheduleRequest, EngineError> {
        let (tutor_id, student_id) = self
            .store
            .booking_parties(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if actor != tutor_id && actor != student_id {
            return Err(EngineError::Forbidden("not a participant of this booking"));
        }

        let tutor_state = self.store.tutor_or_create(tutor_id);
        let mut ts = tutor_state.write().await;

        let booking = ts
            .booking(booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if !booking.status.is_active() {
            return Err(EngineError::Invalid(format!(
                "cannot reschedule a {} booking",
                booking.status.as_str()
            )));
        }
        let counterpart = booking.counterpart(actor);
        validate_future(proposed_time, now_ms())?;
        if let Some(pending) = ts.pending_reschedule_for(booking_id) {
            return Err(self.rejected(EngineError::ReschedulePending(pending.id)));
        }
        if !self.store.reserve_request_id(id, booking_id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let request = RescheduleRequest {
            id,
            booking_id,
            requested_by_id: actor,
            proposed_time,
            status: RescheduleStatus::Pending,
        };
        let event = Event::RescheduleProposed {
            request: request.clone(),
            tutor_id,
        };
        if let Err(e) = self.persist_tutor(&mut ts, &event).await {
            self.store.release_request_id(&id);
            return Err(e);
        }
        drop(ts);

        metrics::counter!(observability::RESCHEDULE_OUTCOMES_TOTAL, "outcome" => "proposed")
            .increment(1);
        info!(request = %id, booking = %booking_id, "reschedule proposed");

        if let Some(recipient) = self.store.user(&counterpart) {
            self.mailer.reschedule_proposed(&request, &recipient).await;
        }
        Ok(request)
    }

    /// Moves the booking to the proposed time if both participants are still
    /// free then. On conflict the request stays PENDING.
    pub async fn accept_reschedule(
        &self,
        actor: Ulid,
        request_id: Ulid,
        booking_id: Option<Ulid>,
    ) -> Result<RescheduleRequest, EngineError> {
        self.resolve(actor, request_id, booking_id, RescheduleStatus::Accepted)
            .await
    }

    pub async fn decline_reschedule(
        &self,
        actor: Ulid,
        request_id: Ulid,
        booking_id: Option<Ulid>,
    ) -> Result<RescheduleRequest, EngineError> {
        self.resolve(actor, request_id, booking_id, RescheduleStatus::Declined)
            .await
    }

    async fn resolve(
        &self,
        actor: Ulid,
        request_id: Ulid,
        claimed_booking: Option<Ulid>,
        decision: RescheduleStatus,
    ) -> Result<RescheduleRequest, EngineError> {
        let booking_id = self
            .store
            .booking_for_request(&request_id)
            .filter(|b| claimed_booking.is_none_or(|claimed| claimed == *b))
            .ok_or_else(|| EngineError::not_found("reschedule request", request_id))?;
        let (tutor_id, student_id) = self
            .store
            .booking_parties(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;

        let student_state = self.store.student_or_create(student_id);
        let tutor_state = self.store.tutor_or_create(tutor_id);
        // Decline never touches the student's bookings.
        let mut st = match decision {
            RescheduleStatus::Accepted => Some(student_state.lock().await),
            _ => None,
        };
        let mut ts = tutor_state.write().await;

        let request = ts
            .reschedule(request_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reschedule request", request_id))?;
        if actor == request.requested_by_id {
            return Err(EngineError::Forbidden("requester cannot resolve their own request"));
        }
        if actor != tutor_id && actor != student_id {
            return Err(EngineError::Forbidden("not a participant of this booking"));
        }
        if request.status != RescheduleStatus::Pending {
            return Err(EngineError::AlreadyResolved(request_id));
        }

        match (decision, st.as_deref_mut()) {
            (RescheduleStatus::Accepted, Some(st)) => {
                let booking = ts
                    .booking(booking_id)
                    .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
                if !booking.status.is_active() {
                    return Err(EngineError::Invalid(format!(
                        "cannot reschedule a {} booking",
                        booking.status.as_str()
                    )));
                }
                validate_future(request.proposed_time, now_ms())?;
                let span = Span::starting_at(request.proposed_time, booking.duration_minutes.max(1));

                let clash = find_tutor_conflict(&ts, &span, Some(booking_id))
                    .or_else(|| find_student_conflict(&st.bookings, &span, self.policy, Some(booking_id)))
                    .map(|b| b.id);
                if let Some(other) = clash {
                    return Err(self.rejected(EngineError::RescheduleConflict(other)));
                }

                let event = Event::RescheduleAccepted {
                    id: request_id,
                    booking_id,
                    tutor_id,
                    student_id,
                    scheduled_at: request.proposed_time,
                };
                self.persist_booking(st, &mut ts, &event).await?;
            }
            _ => {
                let event = Event::RescheduleDeclined {
                    id: request_id,
                    booking_id,
                    tutor_id,
                };
                self.persist_tutor(&mut ts, &event).await?;
            }
        }

        let resolved = ts
            .reschedule(request_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reschedule request", request_id))?;
        drop(ts);
        drop(st);

        let outcome = resolved.status.as_str().to_ascii_lowercase();
        metrics::counter!(observability::RESCHEDULE_OUTCOMES_TOTAL, "outcome" => outcome)
            .increment(1);
        info!(request = %request_id, booking = %booking_id, status = resolved.status.as_str(), "reschedule resolved");

        if let Some(requester) = self.store.user(&resolved.requested_by_id) {
            self.mailer.reschedule_resolved(&resolved, &requester).await;
        }
        Ok(resolved)
    }
}
