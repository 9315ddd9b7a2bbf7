use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn minutes(n: u32) -> Ms {
    n as Ms * MINUTE_MS
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

    pub fn starting_at(start: Ms, duration_minutes: u32) -> Self {
        Self::new(start, start + minutes(duration_minutes))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Collaborator records ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Student,
    Tutor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Tutor => "TUTOR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STUDENT" => Some(Role::Student),
            "TUTOR" => Some(Role::Tutor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    /// Stored lowercased; unique across users.
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub title: String,
    pub duration_minutes: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub token: String,
    pub class_id: Ulid,
    pub expires_at: Option<Ms>,
}

impl ShareLink {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

// ── Availability ─────────────────────────────────────────────────

/// Recurring weekly window. `day_of_week` counts from Sunday = 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Opaque label; never used for conversion.
    pub timezone: String,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Only active bookings occupy time.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(BookingStatus::Pending),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "COMPLETED" => Some(BookingStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub class_id: Ulid,
    pub tutor_id: Ulid,
    pub student_id: Ulid,
    pub scheduled_at: Ms,
    /// Copied from the class at booking time. Zero means unknown.
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub notes: Option<String>,
}

impl Booking {
    /// Occupied interval; an unknown duration borrows `fallback_minutes`.
    pub fn span(&self, fallback_minutes: u32) -> Span {
        let d = if self.duration_minutes == 0 {
            fallback_minutes.max(1)
        } else {
            self.duration_minutes
        };
        Span::starting_at(self.scheduled_at, d)
    }

    /// The participant who is not `user_id`.
    pub fn counterpart(&self, user_id: Ulid) -> Ulid {
        if self.student_id == user_id {
            self.tutor_id
        } else {
            self.student_id
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RescheduleStatus {
    Pending,
    Accepted,
    Declined,
}

impl RescheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescheduleStatus::Pending => "PENDING",
            RescheduleStatus::Accepted => "ACCEPTED",
            RescheduleStatus::Declined => "DECLINED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(RescheduleStatus::Pending),
            "ACCEPTED" => Some(RescheduleStatus::Accepted),
            "DECLINED" => Some(RescheduleStatus::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub requested_by_id: Ulid,
    pub proposed_time: Ms,
    pub status: RescheduleStatus,
}

// ── Per-party state ──────────────────────────────────────────────

/// Everything that must change atomically for one tutor: rules, bookings
/// across all of their classes, and reschedule requests on those bookings.
#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    /// One buffer per tutor, whichever rule write set it last.
    pub buffer_minutes: u32,
    pub rules: Vec<AvailabilityRule>,
    /// Sorted by `scheduled_at`.
    pub bookings: Vec<Booking>,
    pub reschedules: Vec<RescheduleRequest>,
}

impl TutorState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            buffer_minutes: 0,
            rules: Vec::new(),
            bookings: Vec::new(),
            reschedules: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by `scheduled_at`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.scheduled_at, |b| b.scheduled_at)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose interval overlaps `query`, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span, fallback_minutes: u32) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.scheduled_at < query.end);
        let query = *query;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span(fallback_minutes).end > query.start)
    }

    pub fn upsert_rule(&mut self, rule: AvailabilityRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    pub fn reschedule(&self, id: Ulid) -> Option<&RescheduleRequest> {
        self.reschedules.iter().find(|r| r.id == id)
    }

    pub fn pending_reschedule_for(&self, booking_id: Ulid) -> Option<&RescheduleRequest> {
        self.reschedules
            .iter()
            .find(|r| r.booking_id == booking_id && r.status == RescheduleStatus::Pending)
    }
}

/// A student's own bookings, mirrored from the tutors that hold them so the
/// student-side check never has to lock another tutor.
#[derive(Debug, Clone)]
pub struct StudentState {
    pub id: Ulid,
    pub bookings: Vec<Booking>,
}

impl StudentState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }
}

/// WAL record format. Every committed mutation is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    ClassSaved {
        class: Class,
    },
    ShareLinkIssued {
        link: ShareLink,
    },
    RuleSaved {
        rule: AvailabilityRule,
        buffer_minutes: Option<u32>,
    },
    RuleRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    TutorBufferSet {
        tutor_id: Ulid,
        buffer_minutes: u32,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        student_id: Ulid,
        status: BookingStatus,
    },
    BookingDeleted {
        id: Ulid,
        tutor_id: Ulid,
        student_id: Ulid,
    },
    RescheduleProposed {
        request: RescheduleRequest,
        tutor_id: Ulid,
    },
    RescheduleDeclined {
        id: Ulid,
        booking_id: Ulid,
        tutor_id: Ulid,
    },
    RescheduleAccepted {
        id: Ulid,
        booking_id: Ulid,
        tutor_id: Ulid,
        student_id: Ulid,
        scheduled_at: Ms,
    },
}

impl Event {
    /// The tutor whose channel this event is published on.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::UserRegistered { user } if user.role == Role::Tutor => Some(user.id),
            Event::UserRegistered { .. } | Event::ShareLinkIssued { .. } => None,
            Event::ClassSaved { class } => Some(class.tutor_id),
            Event::RuleSaved { rule, .. } => Some(rule.tutor_id),
            Event::BookingCreated { booking } => Some(booking.tutor_id),
            Event::RescheduleProposed { tutor_id, .. }
            | Event::RuleRemoved { tutor_id, .. }
            | Event::TutorBufferSet { tutor_id, .. }
            | Event::BookingStatusChanged { tutor_id, .. }
            | Event::BookingDeleted { tutor_id, .. }
            | Event::RescheduleDeclined { tutor_id, .. }
            | Event::RescheduleAccepted { tutor_id, .. } => Some(*tutor_id),
        }
    }

    /// The student whose mirrored bookings this event touches.
    pub fn student_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.student_id),
            Event::BookingStatusChanged { student_id, .. }
            | Event::BookingDeleted { student_id, .. }
            | Event::RescheduleAccepted { student_id, .. } => Some(*student_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::UserRegistered { .. } => "user_registered",
            Event::ClassSaved { .. } => "class_saved",
            Event::ShareLinkIssued { .. } => "share_link_issued",
            Event::RuleSaved { .. } => "rule_saved",
            Event::RuleRemoved { .. } => "rule_removed",
            Event::TutorBufferSet { .. } => "tutor_buffer_set",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::BookingDeleted { .. } => "booking_deleted",
            Event::RescheduleProposed { .. } => "reschedule_proposed",
            Event::RescheduleDeclined { .. } => "reschedule_declined",
            Event::RescheduleAccepted { .. } => "reschedule_accepted",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Booking joined with the names a calendar needs to display it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub class_title: String,
    pub tutor_name: String,
    pub student_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TutorAvailability {
    pub tutor_id: Ulid,
    pub buffer_minutes: u32,
    pub rules: Vec<AvailabilityRule>,
}

/// Projection of an occupying booking for a tutor's day view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedSlot {
    pub id: Ulid,
    pub scheduled_at: Ms,
    pub status: BookingStatus,
    pub duration_minutes: u32,
    pub student_name: String,
    pub class_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityOverview {
    pub availability: TutorAvailability,
    pub bookings: Vec<BookedSlot>,
}

/// Candidate slot; `booking_id` is set when an existing booking occupies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub booking_id: Option<Ulid>,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.booking_id.is_none()
    }
}
