use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_student_free, check_tutor_free, now_ms, validate_future};
use super::mutations::normalize_email;
use super::{Engine, EngineError};

/// How a booking entered the system; used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookingPath {
    Direct,
    Link,
    TutorScheduled,
}

impl BookingPath {
    fn label(self) -> &'static str {
        match self {
            BookingPath::Direct => "direct",
            BookingPath::Link => "link",
            BookingPath::TutorScheduled => "tutor",
        }
    }

    fn initial_status(self) -> BookingStatus {
        match self {
            BookingPath::TutorScheduled => BookingStatus::Confirmed,
            BookingPath::Direct | BookingPath::Link => BookingStatus::Pending,
        }
    }
}

impl Engine {
    /// A student books a class directly.
    pub async fn create_booking(
        &self,
        actor: Ulid,
        id: Ulid,
        class_id: Ulid,
        scheduled_at: Ms,
        notes: Option<String>,
    ) -> Result<BookingView, EngineError> {
        let student = self.require_role(actor, Role::Student)?;
        let class = self.bookable_class(class_id)?;
        self.commit_booking(id, &class, &student, scheduled_at, notes, BookingPath::Direct)
            .await
    }

    /// Anonymous booking through a share link. An unknown email gets a new
    /// student account; it is kept even if the booking then conflicts.
    pub async fn book_via_link(
        &self,
        id: Ulid,
        token: &str,
        student_name: &str,
        student_email: &str,
        scheduled_at: Ms,
        notes: Option<String>,
    ) -> Result<BookingView, EngineError> {
        let link = self
            .store
            .link(token)
            .filter(|l| !l.is_expired(now_ms()))
            .ok_or_else(|| EngineError::not_found("link", token))?;
        let class = self.bookable_class(link.class_id)?;
        validate_future(scheduled_at, now_ms())?;

        let student = match self.store.user_by_email(&normalize_email(student_email)?) {
            Some(user) if user.role == Role::Student => user,
            Some(_) => {
                return Err(EngineError::Invalid(
                    "email belongs to a non-student account".into(),
                ));
            }
            None => self.ensure_student(student_name, student_email).await?,
        };
        self.commit_booking(id, &class, &student, scheduled_at, notes, BookingPath::Link)
            .await
    }

    /// The class owner books a known student; the booking starts CONFIRMED.
    pub async fn schedule_for_student(
        &self,
        actor: Ulid,
        id: Ulid,
        class_id: Ulid,
        student_email: &str,
        scheduled_at: Ms,
        notes: Option<String>,
    ) -> Result<BookingView, EngineError> {
        self.require_role(actor, Role::Tutor)?;
        let class = self
            .store
            .class(&class_id)
            .ok_or_else(|| EngineError::not_found("class", class_id))?;
        if class.tutor_id != actor {
            return Err(EngineError::Forbidden("class belongs to another tutor"));
        }
        if !class.is_active {
            return Err(EngineError::ClassInactive(class_id));
        }
        let student_email = normalize_email(student_email)?;
        let student = self
            .store
            .user_by_email(&student_email)
            .ok_or_else(|| EngineError::not_found("student", &student_email))?;
        if student.role != Role::Student {
            return Err(EngineError::Invalid("email does not belong to a student".into()));
        }
        self.commit_booking(
            id,
            &class,
            &student,
            scheduled_at,
            notes,
            BookingPath::TutorScheduled,
        )
        .await
    }

    /// The atomic unit: student lock, tutor write lock, re-check, WAL, apply.
    async fn commit_booking(
        &self,
        id: Ulid,
        class: &Class,
        student: &User,
        scheduled_at: Ms,
        notes: Option<String>,
        path: BookingPath,
    ) -> Result<BookingView, EngineError> {
        validate_future(scheduled_at, now_ms())?;
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let span = Span::starting_at(scheduled_at, class.duration_minutes);

        let student_state = self.store.student_or_create(student.id);
        let tutor_state = self.store.tutor_or_create(class.tutor_id);
        let mut st = student_state.lock().await;
        let mut ts = tutor_state.write().await;

        if !self.store.reserve_booking_id(id, (class.tutor_id, student.id)) {
            return Err(EngineError::AlreadyExists(id));
        }
        let booking = Booking {
            id,
            class_id: class.id,
            tutor_id: class.tutor_id,
            student_id: student.id,
            scheduled_at,
            duration_minutes: class.duration_minutes,
            status: path.initial_status(),
            notes,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        let committed = match self.check_new_booking(&st, &ts, &span) {
            Ok(()) => self.persist_booking(&mut st, &mut ts, &event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            self.store.release_booking_id(&id);
            return Err(e);
        }
        drop(ts);
        drop(st);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "path" => path.label())
            .increment(1);
        info!(booking = %id, tutor = %class.tutor_id, student = %student.id, path = path.label(), "booking created");

        let view = self.view_of(booking);
        self.mailer.booking_created(&view).await;
        Ok(view)
    }

    /// Status change by a participant. Only moves forward, so it can never
    /// reactivate a slot someone else has since taken.
    pub async fn update_booking_status(
        &self,
        actor: Ulid,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingView, EngineError> {
        let (tutor_id, student_id) = self
            .store
            .booking_parties(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if actor == student_id {
            if status != BookingStatus::Cancelled {
                return Err(EngineError::Forbidden("students may only cancel"));
            }
        } else if actor == tutor_id {
            if !matches!(status, BookingStatus::Confirmed | BookingStatus::Cancelled) {
                return Err(EngineError::Forbidden("tutors may only confirm or cancel"));
            }
        } else {
            return Err(EngineError::Forbidden("not a participant of this booking"));
        }

        let student_state = self.store.student_or_create(student_id);
        let tutor_state = self.store.tutor_or_create(tutor_id);
        let mut st = student_state.lock().await;
        let mut ts = tutor_state.write().await;

        let current = ts
            .booking(booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?
            .status;
        if !current.can_transition_to(status) {
            return Err(EngineError::Invalid(format!(
                "cannot change status from {} to {}",
                current.as_str(),
                status.as_str()
            )));
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            tutor_id,
            student_id,
            status,
        };
        self.persist_booking(&mut st, &mut ts, &event).await?;
        let booking = ts
            .booking(booking_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        drop(ts);
        drop(st);

        info!(booking = %booking_id, status = status.as_str(), "booking status changed");
        Ok(self.view_of(booking))
    }

    /// Only the owning student, only while the booking still holds time.
    pub async fn delete_booking(&self, actor: Ulid, booking_id: Ulid) -> Result<(), EngineError> {
        let (tutor_id, student_id) = self
            .store
            .booking_parties(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if actor != student_id {
            return Err(EngineError::Forbidden("only the booking's student may delete it"));
        }

        let student_state = self.store.student_or_create(student_id);
        let tutor_state = self.store.tutor_or_create(tutor_id);
        let mut st = student_state.lock().await;
        let mut ts = tutor_state.write().await;

        let booking = ts
            .booking(booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if !booking.status.is_active() {
            return Err(EngineError::Invalid(format!(
                "cannot delete a {} booking",
                booking.status.as_str()
            )));
        }

        let event = Event::BookingDeleted {
            id: booking_id,
            tutor_id,
            student_id,
        };
        self.persist_booking(&mut st, &mut ts, &event).await?;
        info!(booking = %booking_id, "booking deleted");
        Ok(())
    }

    // ── Shared checks ────────────────────────────────────────

    fn check_new_booking(
        &self,
        st: &StudentState,
        ts: &TutorState,
        span: &Span,
    ) -> Result<(), EngineError> {
        if ts.bookings.len() >= MAX_BOOKINGS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many bookings for tutor"));
        }
        check_student_free(st, span, self.policy, None).map_err(|e| self.rejected(e))?;
        check_tutor_free(ts, span, None).map_err(|e| self.rejected(e))
    }

    pub(super) fn require_role(&self, actor: Ulid, role: Role) -> Result<User, EngineError> {
        match self.store.user(&actor) {
            Some(user) if user.role == role => Ok(user),
            _ => Err(EngineError::Forbidden(match role {
                Role::Student => "actor must be a student",
                Role::Tutor => "actor must be a tutor",
            })),
        }
    }

    fn bookable_class(&self, class_id: Ulid) -> Result<Class, EngineError> {
        let class = self
            .store
            .class(&class_id)
            .ok_or_else(|| EngineError::not_found("class", class_id))?;
        if !class.is_active {
            return Err(EngineError::ClassInactive(class_id));
        }
        Ok(class)
    }

    /// Count and log a rejected write, then hand the error back.
    pub(super) fn rejected(&self, err: EngineError) -> EngineError {
        if let Some(kind) = err.conflict_kind() {
            metrics::counter!(observability::CONFLICTS_TOTAL, "kind" => kind).increment(1);
            debug!("write rejected: {err}");
        }
        err
    }

    pub(super) fn view_of(&self, booking: Booking) -> BookingView {
        BookingView {
            class_title: self.store.class_title(&booking.class_id),
            tutor_name: self.store.user_name(&booking.tutor_id),
            student_name: self.store.user_name(&booking.student_id),
            booking,
        }
    }
}
