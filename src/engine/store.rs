use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedTutorState = Arc<RwLock<TutorState>>;
pub type SharedStudentState = Arc<Mutex<StudentState>>;

/// All engine state. Tutor and student state sit behind their own locks;
/// the directory records (users, classes, links) are plain map entries.
pub struct InMemoryStore {
    tutors: DashMap<Ulid, SharedTutorState>,
    students: DashMap<Ulid, SharedStudentState>,
    users: DashMap<Ulid, User>,
    /// Lowercased email → user id.
    emails: DashMap<String, Ulid>,
    classes: DashMap<Ulid, Class>,
    links: DashMap<String, ShareLink>,
    rule_to_tutor: DashMap<Ulid, Ulid>,
    /// booking id → (tutor id, student id)
    booking_index: DashMap<Ulid, (Ulid, Ulid)>,
    request_to_booking: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tutors: DashMap::new(),
            students: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            classes: DashMap::new(),
            links: DashMap::new(),
            rule_to_tutor: DashMap::new(),
            booking_index: DashMap::new(),
            request_to_booking: DashMap::new(),
        }
    }

    // ── Directory ────────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&email.to_lowercase())?.value();
        self.user(&id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn class(&self, id: &Ulid) -> Option<Class> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub fn link(&self, token: &str) -> Option<ShareLink> {
        self.links.get(token).map(|e| e.value().clone())
    }

    /// Display name, empty when the user is unknown.
    pub fn user_name(&self, id: &Ulid) -> String {
        self.users
            .get(id)
            .map(|u| u.name.clone())
            .unwrap_or_default()
    }

    pub fn class_title(&self, id: &Ulid) -> String {
        self.classes
            .get(id)
            .map(|c| c.title.clone())
            .unwrap_or_default()
    }

    // ── Per-party state ──────────────────────────────────────

    pub fn tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn tutor_or_create(&self, id: Ulid) -> SharedTutorState {
        self.tutors
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(TutorState::new(id))))
            .clone()
    }

    pub fn tutor_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.tutors.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn student_or_create(&self, id: Ulid) -> SharedStudentState {
        self.students
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(StudentState::new(id))))
            .clone()
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn tutor_for_rule(&self, rule_id: &Ulid) -> Option<Ulid> {
        self.rule_to_tutor.get(rule_id).map(|e| *e.value())
    }

    pub fn booking_parties(&self, booking_id: &Ulid) -> Option<(Ulid, Ulid)> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn booking_for_request(&self, request_id: &Ulid) -> Option<Ulid> {
        self.request_to_booking.get(request_id).map(|e| *e.value())
    }

    /// Claim a new booking id across all tutors. `false` when it is taken.
    /// A claim whose write then fails must be released.
    pub fn reserve_booking_id(&self, id: Ulid, parties: (Ulid, Ulid)) -> bool {
        match self.booking_index.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(parties);
                true
            }
        }
    }

    pub fn release_booking_id(&self, id: &Ulid) {
        self.booking_index.remove(id);
    }

    pub fn reserve_request_id(&self, id: Ulid, booking_id: Ulid) -> bool {
        match self.request_to_booking.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
                true
            }
        }
    }

    pub fn release_request_id(&self, id: &Ulid) {
        self.request_to_booking.remove(id);
    }

    /// Directory records in dependency order: users, then classes, then links.
    pub fn directory_snapshot(&self) -> Vec<Event> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut classes: Vec<Class> = self.classes.iter().map(|e| e.value().clone()).collect();
        classes.sort_by_key(|c| c.id);
        let mut links: Vec<ShareLink> = self.links.iter().map(|e| e.value().clone()).collect();
        links.sort_by(|a, b| a.token.cmp(&b.token));

        let mut events = Vec::with_capacity(users.len() + classes.len() + links.len());
        events.extend(users.into_iter().map(|user| Event::UserRegistered { user }));
        events.extend(classes.into_iter().map(|class| Event::ClassSaved { class }));
        events.extend(links.into_iter().map(|link| Event::ShareLinkIssued { link }));
        events
    }

    // ── Event application ────────────────────────────────────

    /// Users, classes and links. Registering a user also creates the
    /// lockable state matching their role.
    pub fn apply_directory(&self, event: &Event) {
        match event {
            Event::UserRegistered { user } => {
                self.emails.insert(user.email.to_lowercase(), user.id);
                match user.role {
                    Role::Tutor => {
                        self.tutor_or_create(user.id);
                    }
                    Role::Student => {
                        self.student_or_create(user.id);
                    }
                }
                self.users.insert(user.id, user.clone());
            }
            Event::ClassSaved { class } => {
                self.classes.insert(class.id, class.clone());
            }
            Event::ShareLinkIssued { link } => {
                self.links.insert(link.token.clone(), link.clone());
            }
            _ => {}
        }
    }

    /// Caller holds the tutor's write lock.
    pub fn apply_to_tutor(&self, ts: &mut TutorState, event: &Event) {
        match event {
            Event::RuleSaved {
                rule,
                buffer_minutes,
            } => {
                self.rule_to_tutor.insert(rule.id, rule.tutor_id);
                ts.upsert_rule(rule.clone());
                if let Some(b) = buffer_minutes {
                    ts.buffer_minutes = *b;
                }
            }
            Event::RuleRemoved { id, .. } => {
                ts.remove_rule(*id);
                self.rule_to_tutor.remove(id);
            }
            Event::TutorBufferSet { buffer_minutes, .. } => {
                ts.buffer_minutes = *buffer_minutes;
            }
            Event::BookingCreated { booking } => {
                self.booking_index
                    .insert(booking.id, (booking.tutor_id, booking.student_id));
                ts.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = ts.booking_mut(*id) {
                    b.status = *status;
                }
            }
            Event::BookingDeleted { id, .. } => {
                ts.remove_booking(*id);
                self.booking_index.remove(id);
                ts.reschedules.retain(|r| {
                    if r.booking_id == *id {
                        self.request_to_booking.remove(&r.id);
                        false
                    } else {
                        true
                    }
                });
            }
            Event::RescheduleProposed { request, .. } => {
                self.request_to_booking.insert(request.id, request.booking_id);
                ts.reschedules.push(request.clone());
            }
            Event::RescheduleDeclined { id, .. } => {
                set_request_status(ts, *id, RescheduleStatus::Declined);
            }
            Event::RescheduleAccepted {
                id,
                booking_id,
                scheduled_at,
                ..
            } => {
                set_request_status(ts, *id, RescheduleStatus::Accepted);
                // Re-insert to keep the start order.
                if let Some(mut booking) = ts.remove_booking(*booking_id) {
                    booking.scheduled_at = *scheduled_at;
                    ts.insert_booking(booking);
                }
            }
            Event::UserRegistered { .. }
            | Event::ClassSaved { .. }
            | Event::ShareLinkIssued { .. } => {}
        }
    }

    /// Caller holds the student's lock. Mirrors the booking changes only.
    pub fn apply_to_student(&self, st: &mut StudentState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => st.bookings.push(booking.clone()),
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = st.booking_mut(*id) {
                    b.status = *status;
                }
            }
            Event::BookingDeleted { id, .. } => st.bookings.retain(|b| b.id != *id),
            Event::RescheduleAccepted {
                booking_id,
                scheduled_at,
                ..
            } => {
                if let Some(b) = st.booking_mut(*booking_id) {
                    b.scheduled_at = *scheduled_at;
                }
            }
            _ => {}
        }
    }
}

fn set_request_status(ts: &mut TutorState, id: Ulid, status: RescheduleStatus) {
    if let Some(r) = ts.reschedules.iter_mut().find(|r| r.id == id) {
        r.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, email: &str) -> User {
        User {
            id: Ulid::new(),
            name: "Grace".into(),
            email: email.into(),
            role,
        }
    }

    fn booking(tutor_id: Ulid, student_id: Ulid, at: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            class_id: Ulid::new(),
            tutor_id,
            student_id,
            scheduled_at: at,
            duration_minutes: 60,
            status: BookingStatus::Pending,
            notes: None,
        }
    }

    #[test]
    fn registering_creates_role_state() {
        let store = InMemoryStore::new();
        let tutor = user(Role::Tutor, "t@example.com");
        let student = user(Role::Student, "s@example.com");
        store.apply_directory(&Event::UserRegistered { user: tutor.clone() });
        store.apply_directory(&Event::UserRegistered { user: student.clone() });

        assert!(store.tutor(&tutor.id).is_some());
        assert!(store.tutor(&student.id).is_none());
        assert_eq!(store.user_by_email("T@Example.com").map(|u| u.id), Some(tutor.id));
        assert_eq!(store.user_count(), 2);
    }

    #[test]
    fn accepted_reschedule_moves_booking_and_keeps_order() {
        let store = InMemoryStore::new();
        let tutor_id = Ulid::new();
        let student_id = Ulid::new();
        let mut ts = TutorState::new(tutor_id);
        let mut st = StudentState::new(student_id);

        let early = booking(tutor_id, student_id, 1_000);
        let late = booking(tutor_id, student_id, 5_000);
        for b in [&early, &late] {
            let e = Event::BookingCreated { booking: b.clone() };
            store.apply_to_tutor(&mut ts, &e);
            store.apply_to_student(&mut st, &e);
        }

        let request = RescheduleRequest {
            id: Ulid::new(),
            booking_id: early.id,
            requested_by_id: student_id,
            proposed_time: 9_000,
            status: RescheduleStatus::Pending,
        };
        store.apply_to_tutor(&mut ts, &Event::RescheduleProposed { request: request.clone(), tutor_id });
        assert_eq!(store.booking_for_request(&request.id), Some(early.id));

        let accepted = Event::RescheduleAccepted {
            id: request.id,
            booking_id: early.id,
            tutor_id,
            student_id,
            scheduled_at: 9_000,
        };
        store.apply_to_tutor(&mut ts, &accepted);
        store.apply_to_student(&mut st, &accepted);

        let order: Vec<Ulid> = ts.bookings.iter().map(|b| b.id).collect();
        assert_eq!(order, vec![late.id, early.id]);
        assert_eq!(ts.reschedule(request.id).map(|r| r.status), Some(RescheduleStatus::Accepted));
        assert_eq!(st.booking_mut(early.id).map(|b| b.scheduled_at), Some(9_000));
    }

    #[test]
    fn deleting_booking_drops_its_requests() {
        let store = InMemoryStore::new();
        let tutor_id = Ulid::new();
        let student_id = Ulid::new();
        let mut ts = TutorState::new(tutor_id);
        let b = booking(tutor_id, student_id, 1_000);
        store.apply_to_tutor(&mut ts, &Event::BookingCreated { booking: b.clone() });
        let request = RescheduleRequest {
            id: Ulid::new(),
            booking_id: b.id,
            requested_by_id: tutor_id,
            proposed_time: 2_000,
            status: RescheduleStatus::Pending,
        };
        store.apply_to_tutor(&mut ts, &Event::RescheduleProposed { request: request.clone(), tutor_id });

        store.apply_to_tutor(&mut ts, &Event::BookingDeleted { id: b.id, tutor_id, student_id });
        assert!(ts.bookings.is_empty());
        assert!(ts.reschedules.is_empty());
        assert!(store.booking_parties(&b.id).is_none());
        assert!(store.booking_for_request(&request.id).is_none());
    }

    #[test]
    fn snapshot_orders_directory_records() {
        let store = InMemoryStore::new();
        let tutor = user(Role::Tutor, "owner@example.com");
        let class = Class {
            id: Ulid::new(),
            tutor_id: tutor.id,
            title: "Algebra".into(),
            duration_minutes: 60,
            is_active: true,
        };
        store.apply_directory(&Event::ShareLinkIssued {
            link: ShareLink { token: "abc".into(), class_id: class.id, expires_at: None },
        });
        store.apply_directory(&Event::ClassSaved { class: class.clone() });
        store.apply_directory(&Event::UserRegistered { user: tutor.clone() });

        let kinds: Vec<&str> = store.directory_snapshot().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["user_registered", "class_saved", "share_link_issued"]);
    }
}
