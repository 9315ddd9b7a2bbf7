use chrono::NaiveTime;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_instant;
use super::{Engine, EngineError, WalCommand};

fn validate_name(name: &str, what: &'static str, max: usize) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{what} must not be empty")));
    }
    if name.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Trimmed and lowercased, the form every stored email takes.
pub(super) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::Invalid(format!("malformed email: {email}"))),
    }
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        name: &str,
        email: &str,
        role: Role,
    ) -> Result<User, EngineError> {
        validate_name(name, "name", MAX_NAME_LEN)?;
        let email = normalize_email(email)?;
        let _directory = self.directory.lock().await;
        self.insert_user(User {
            id,
            name: name.trim().to_string(),
            email,
            role,
        })
        .await
    }

    /// Student account for `email`, created on first use. Caller has already
    /// ruled out a non-student owner, but a concurrent registration may have
    /// won the race, so look again under the lock.
    pub(super) async fn ensure_student(&self, name: &str, email: &str) -> Result<User, EngineError> {
        validate_name(name, "name", MAX_NAME_LEN)?;
        let email = normalize_email(email)?;
        let _directory = self.directory.lock().await;
        match self.store.user_by_email(&email) {
            Some(user) if user.role == Role::Student => Ok(user),
            Some(_) => Err(EngineError::Invalid(
                "email belongs to a non-student account".into(),
            )),
            None => {
                let user = self
                    .insert_user(User {
                        id: Ulid::new(),
                        name: name.trim().to_string(),
                        email,
                        role: Role::Student,
                    })
                    .await?;
                info!(user = %user.id, "student auto-registered from share link");
                Ok(user)
            }
        }
    }

    /// Caller holds the directory lock.
    async fn insert_user(&self, user: User) -> Result<User, EngineError> {
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.user(&user.id).is_some() {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if self.store.user_by_email(&user.email).is_some() {
            return Err(EngineError::DuplicateEmail(user.email));
        }
        let event = Event::UserRegistered { user: user.clone() };
        self.persist_directory(&event).await?;
        Ok(user)
    }

    /// Create or replace a class. Only its tutor may do either.
    pub async fn save_class(
        &self,
        actor: Ulid,
        id: Ulid,
        tutor_id: Ulid,
        title: &str,
        duration_minutes: u32,
        is_active: bool,
    ) -> Result<Class, EngineError> {
        self.require_role(actor, Role::Tutor)?;
        if actor != tutor_id {
            return Err(EngineError::Forbidden("classes are created by their own tutor"));
        }
        validate_name(title, "title", MAX_TITLE_LEN)?;
        if duration_minutes == 0 || duration_minutes > MAX_SESSION_MINUTES {
            return Err(EngineError::Invalid(format!(
                "duration_minutes must be in 1..={MAX_SESSION_MINUTES}"
            )));
        }

        let _directory = self.directory.lock().await;
        if let Some(existing) = self.store.class(&id)
            && existing.tutor_id != actor
        {
            return Err(EngineError::Forbidden("class belongs to another tutor"));
        }
        let class = Class {
            id,
            tutor_id,
            title: title.trim().to_string(),
            duration_minutes,
            is_active,
        };
        self.persist_directory(&Event::ClassSaved {
            class: class.clone(),
        })
        .await?;
        Ok(class)
    }

    pub async fn issue_share_link(
        &self,
        actor: Ulid,
        token: &str,
        class_id: Ulid,
        expires_at: Option<Ms>,
    ) -> Result<ShareLink, EngineError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::Invalid(format!(
                "token length must be in 1..={MAX_TOKEN_LEN}"
            )));
        }
        if let Some(t) = expires_at {
            validate_instant(t)?;
        }
        let class = self
            .store
            .class(&class_id)
            .ok_or_else(|| EngineError::not_found("class", class_id))?;
        if class.tutor_id != actor {
            return Err(EngineError::Forbidden("only the class tutor may share it"));
        }

        let _directory = self.directory.lock().await;
        if self.store.link(token).is_some() {
            return Err(EngineError::DuplicateToken(token.to_string()));
        }
        let link = ShareLink {
            token: token.to_string(),
            class_id,
            expires_at,
        };
        self.persist_directory(&Event::ShareLinkIssued { link: link.clone() })
            .await?;
        Ok(link)
    }

    // ── Availability rules ───────────────────────────────────

    /// Upsert by id. `buffer_minutes`, when given, replaces the tutor's single
    /// buffer value.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_rule(
        &self,
        actor: Ulid,
        id: Ulid,
        tutor_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        timezone: &str,
        buffer_minutes: Option<u32>,
    ) -> Result<AvailabilityRule, EngineError> {
        if actor != tutor_id {
            return Err(EngineError::Forbidden("rules belong to the tutor who writes them"));
        }
        self.require_role(actor, Role::Tutor)?;
        if day_of_week > 6 {
            return Err(EngineError::Invalid(format!(
                "day_of_week must be 0..=6, got {day_of_week}"
            )));
        }
        if start_time >= end_time {
            return Err(EngineError::InvalidTime(format!(
                "start_time {start_time} must be before end_time {end_time}"
            )));
        }
        if timezone.len() > MAX_TIMEZONE_LEN {
            return Err(EngineError::LimitExceeded("timezone label too long"));
        }
        if buffer_minutes.is_some_and(|b| b > MAX_BUFFER_MINUTES) {
            return Err(EngineError::Invalid(format!(
                "buffer_minutes must be at most {MAX_BUFFER_MINUTES}"
            )));
        }
        if self.store.tutor_for_rule(&id).is_some_and(|owner| owner != tutor_id) {
            return Err(EngineError::Forbidden("rule belongs to another tutor"));
        }

        let tutor_state = self.store.tutor_or_create(tutor_id);
        let mut ts = tutor_state.write().await;
        let is_new = !ts.rules.iter().any(|r| r.id == id);
        if is_new && ts.rules.len() >= MAX_RULES_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many availability rules"));
        }

        let rule = AvailabilityRule {
            id,
            tutor_id,
            day_of_week,
            start_time,
            end_time,
            timezone: timezone.to_string(),
        };
        let event = Event::RuleSaved {
            rule: rule.clone(),
            buffer_minutes,
        };
        self.persist_tutor(&mut ts, &event).await?;
        Ok(rule)
    }

    pub async fn remove_rule(&self, actor: Ulid, id: Ulid) -> Result<(), EngineError> {
        let tutor_id = self
            .store
            .tutor_for_rule(&id)
            .ok_or_else(|| EngineError::not_found("rule", id))?;
        if actor != tutor_id {
            return Err(EngineError::Forbidden("rules belong to the tutor who writes them"));
        }
        let tutor_state = self.store.tutor_or_create(tutor_id);
        let mut ts = tutor_state.write().await;
        if !ts.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::not_found("rule", id));
        }
        self.persist_tutor(&mut ts, &Event::RuleRemoved { id, tutor_id })
            .await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Holds the directory lock and every tutor's read lock for the duration,
    /// so no write can land between the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _directory = self.directory.lock().await;
        let mut events = self.store.directory_snapshot();

        let mut guards = Vec::new();
        for id in self.store.tutor_ids() {
            if let Some(ts) = self.store.tutor(&id) {
                guards.push(ts.read_owned().await);
            }
        }
        for ts in &guards {
            for rule in &ts.rules {
                events.push(Event::RuleSaved {
                    rule: rule.clone(),
                    buffer_minutes: None,
                });
            }
            if ts.buffer_minutes > 0 {
                events.push(Event::TutorBufferSet {
                    tutor_id: ts.id,
                    buffer_minutes: ts.buffer_minutes,
                });
            }
            for booking in &ts.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            for request in &ts.reschedules {
                events.push(Event::RescheduleProposed {
                    request: request.clone(),
                    tutor_id: ts.id,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
