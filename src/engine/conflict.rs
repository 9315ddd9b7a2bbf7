use chrono::{DateTime, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Half-width of the student-side window around a requested start.
pub const STUDENT_WINDOW_MINUTES: u32 = 30;

/// How a student's own bookings block a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentConflictPolicy {
    /// Any active booking starting within ±30 minutes (inclusive) of the
    /// requested start, whatever either session's length.
    #[default]
    Window,
    /// Same half-open overlap test as the tutor side.
    Overlap,
}

impl StudentConflictPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "window" => Some(StudentConflictPolicy::Window),
            "overlap" => Some(StudentConflictPolicy::Overlap),
            _ => None,
        }
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::InvalidTime(format!("{t} out of range")));
    }
    Ok(())
}

/// Booking times must lie strictly in the future.
pub(crate) fn validate_future(t: Ms, now: Ms) -> Result<(), EngineError> {
    validate_instant(t)?;
    if t <= now {
        return Err(EngineError::InvalidTime("must be in the future".into()));
    }
    Ok(())
}

fn utc_date(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

pub fn same_calendar_day(a: Ms, b: Ms) -> bool {
    match (utc_date(a), utc_date(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// First active booking on the candidate's calendar day whose interval
/// overlaps `[candidate_start, candidate_start + duration)`.
pub fn is_occupied<'a>(
    candidate_start: Ms,
    duration_minutes: u32,
    bookings: impl IntoIterator<Item = &'a Booking>,
) -> Option<&'a Booking> {
    let candidate = Span::starting_at(candidate_start, duration_minutes.max(1));
    bookings.into_iter().find(|b| {
        b.status.is_active()
            && same_calendar_day(candidate_start, b.scheduled_at)
            && candidate.overlaps(&b.span(duration_minutes))
    })
}

/// Pair each candidate with the booking occupying it, if any.
pub fn filter_free(candidates: &[Ms], duration_minutes: u32, bookings: &[Booking]) -> Vec<Slot> {
    candidates
        .iter()
        .map(|&start| Slot {
            start,
            end: start + minutes(duration_minutes),
            booking_id: is_occupied(start, duration_minutes, bookings).map(|b| b.id),
        })
        .collect()
}

/// Write-time tutor check: plain half-open overlap with no calendar-day
/// scoping, so sessions crossing midnight still block.
pub fn find_tutor_conflict<'a>(
    tutor: &'a TutorState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    let fallback = (span.duration_ms() / MINUTE_MS).max(1) as u32;
    tutor
        .overlapping(span, fallback)
        .find(|b| b.status.is_active() && Some(b.id) != exclude)
}

pub fn find_student_conflict<'a>(
    bookings: &'a [Booking],
    span: &Span,
    policy: StudentConflictPolicy,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    let window = minutes(STUDENT_WINDOW_MINUTES);
    let fallback = (span.duration_ms() / MINUTE_MS).max(1) as u32;
    bookings.iter().find(|b| {
        b.status.is_active()
            && Some(b.id) != exclude
            && match policy {
                StudentConflictPolicy::Window => (b.scheduled_at - span.start).abs() <= window,
                StudentConflictPolicy::Overlap => span.overlaps(&b.span(fallback)),
            }
    })
}

pub(crate) fn check_tutor_free(
    tutor: &TutorState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_tutor_conflict(tutor, span, exclude) {
        Some(b) => Err(EngineError::TutorConflict(b.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_student_free(
    student: &StudentState,
    span: &Span,
    policy: StudentConflictPolicy,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_student_conflict(&student.bookings, span, policy, exclude) {
        Some(b) => Err(EngineError::StudentConflict(b.id)),
        None => Ok(()),
    }
}
