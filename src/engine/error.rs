use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// `kind` names the missing record: "class", "booking", "link", ...
    NotFound { kind: &'static str, id: String },
    AlreadyExists(Ulid),
    DuplicateEmail(String),
    DuplicateToken(String),
    Invalid(String),
    InvalidTime(String),
    ClassInactive(Ulid),
    Forbidden(&'static str),
    /// The student already holds the conflicting booking.
    StudentConflict(Ulid),
    /// Another booking of the tutor occupies the interval.
    TutorConflict(Ulid),
    /// Accepting would overlap the given booking.
    RescheduleConflict(Ulid),
    /// The booking already has this pending request.
    ReschedulePending(Ulid),
    AlreadyResolved(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Status code of the HTTP contract this error corresponds to.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Invalid(_)
            | EngineError::InvalidTime(_)
            | EngineError::ClassInactive(_)
            | EngineError::AlreadyResolved(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound { .. } => 404,
            EngineError::AlreadyExists(_)
            | EngineError::DuplicateEmail(_)
            | EngineError::DuplicateToken(_)
            | EngineError::StudentConflict(_)
            | EngineError::TutorConflict(_)
            | EngineError::RescheduleConflict(_)
            | EngineError::ReschedulePending(_) => 409,
            EngineError::WalError(_) => 500,
        }
    }

    /// PostgreSQL error code reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidTime(_) => "22007",
            EngineError::Invalid(_)
            | EngineError::ClassInactive(_)
            | EngineError::AlreadyResolved(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Forbidden(_) => "42501",
            EngineError::NotFound { .. } => "P0002",
            EngineError::AlreadyExists(_)
            | EngineError::DuplicateEmail(_)
            | EngineError::DuplicateToken(_) => "23505",
            EngineError::StudentConflict(_)
            | EngineError::TutorConflict(_)
            | EngineError::RescheduleConflict(_)
            | EngineError::ReschedulePending(_) => "23P01",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Label for the conflict counter, `None` for non-conflicts.
    pub fn conflict_kind(&self) -> Option<&'static str> {
        match self {
            EngineError::StudentConflict(_) => Some("student"),
            EngineError::TutorConflict(_) => Some("tutor"),
            EngineError::RescheduleConflict(_) => Some("reschedule"),
            EngineError::ReschedulePending(_) => Some("reschedule_pending"),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateEmail(email) => write!(f, "email already registered: {email}"),
            EngineError::DuplicateToken(token) => write!(f, "share link already issued: {token}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidTime(msg) => write!(f, "invalid time: {msg}"),
            EngineError::ClassInactive(id) => write!(f, "class is not active: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::StudentConflict(id) => {
                write!(f, "student already has a booking at this time: {id}")
            }
            EngineError::TutorConflict(id) => {
                write!(f, "tutor is already booked at this time: {id}")
            }
            EngineError::RescheduleConflict(id) => {
                write!(f, "proposed time conflicts with booking: {id}")
            }
            EngineError::ReschedulePending(id) => {
                write!(f, "booking already has a pending reschedule request: {id}")
            }
            EngineError::AlreadyResolved(id) => {
                write!(f, "reschedule request already resolved: {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            // Callers only see that storage failed; the detail goes to the log.
            EngineError::WalError(_) => write!(f, "storage failure"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_map_to_409_and_exclusion_violation() {
        for e in [
            EngineError::StudentConflict(Ulid::new()),
            EngineError::TutorConflict(Ulid::new()),
            EngineError::RescheduleConflict(Ulid::new()),
        ] {
            assert_eq!(e.http_status(), 409);
            assert_eq!(e.sqlstate(), "23P01");
            assert!(e.conflict_kind().is_some());
        }
    }

    #[test]
    fn storage_detail_is_not_exposed() {
        let e = EngineError::WalError("disk on fire at /var/data".into());
        assert_eq!(e.http_status(), 500);
        assert_eq!(e.to_string(), "storage failure");
    }

    #[test]
    fn not_found_names_the_record() {
        let e = EngineError::not_found("link", "abc");
        assert_eq!(e.http_status(), 404);
        assert_eq!(e.to_string(), "link not found: abc");
    }
}
