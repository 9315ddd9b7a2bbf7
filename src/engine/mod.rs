mod availability;
mod conflict;
mod error;
mod guard;
mod mutations;
mod queries;
mod reschedule;
mod store;

pub use availability::{SLOT_STEP_MINUTES, compute_candidates, day_span, instant_at, weekday_index};
pub use conflict::{StudentConflictPolicy, filter_free, is_occupied, same_calendar_day};
pub use error::EngineError;
pub use store::{InMemoryStore, SharedStudentState, SharedTutorState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

use crate::mailer::{LogMailer, Mailer};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every Append that is already queued when the first one
/// arrives joins the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
        // Every caller gets an error, so none of the batch may replay later.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further writes: {e}");
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Knobs that change engine behaviour rather than storage location.
#[derive(Clone)]
pub struct EngineOptions {
    pub student_policy: StudentConflictPolicy,
    pub mailer: Arc<dyn Mailer>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            student_policy: StudentConflictPolicy::default(),
            mailer: Arc::new(LogMailer),
        }
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) mailer: Arc<dyn Mailer>,
    pub(super) policy: StudentConflictPolicy,
    /// Serializes user/class/link writes so email uniqueness holds.
    pub(super) directory: Mutex<()>,
    replayed_events: usize,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, EngineOptions::default())
    }

    /// Must be called inside a tokio runtime; spawns the WAL writer.
    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = replay.discarded_bytes,
                "discarded torn or corrupt WAL tail"
            );
            Wal::discard_tail(&wal_path, replay.valid_bytes)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            mailer: options.mailer,
            policy: options.student_policy,
            directory: Mutex::new(()),
            replayed_events: replay.events.len(),
        };
        for event in &replay.events {
            engine.replay_event(event)?;
        }
        if !replay.events.is_empty() {
            info!(events = replay.events.len(), "replayed WAL");
        }
        Ok(engine)
    }

    /// Nothing else holds the locks during construction, so `try_*` always
    /// succeeds; blocking variants would panic inside the runtime.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        self.store.apply_directory(event);
        if let Some(tutor_id) = event.tutor_id() {
            let ts = self.store.tutor_or_create(tutor_id);
            let mut guard = ts
                .try_write()
                .map_err(|_| io::Error::other("replay: tutor state locked"))?;
            self.store.apply_to_tutor(&mut guard, event);
        }
        if let Some(student_id) = event.student_id() {
            let st = self.store.student_or_create(student_id);
            let mut guard = st
                .try_lock()
                .map_err(|_| io::Error::other("replay: student state locked"))?;
            self.store.apply_to_student(&mut guard, event);
        }
        Ok(())
    }

    /// Number of WAL entries applied at startup.
    pub fn replayed_events(&self) -> usize {
        self.replayed_events
    }

    pub fn student_policy(&self) -> StudentConflictPolicy {
        self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Caller holds the directory lock.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_directory(event);
        if let Event::ClassSaved { class } = event {
            self.store.tutor_or_create(class.tutor_id);
        }
        self.notify.publish(event);
        Ok(())
    }

    /// Caller holds the tutor's write lock.
    pub(super) async fn persist_tutor(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_tutor(ts, event);
        self.notify.publish(event);
        Ok(())
    }

    /// Caller holds the student's lock and then the tutor's write lock.
    pub(super) async fn persist_booking(
        &self,
        st: &mut StudentState,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_tutor(ts, event);
        self.store.apply_to_student(st, event);
        self.notify.publish(event);
        Ok(())
    }

    pub fn user(&self, id: &ulid::Ulid) -> Option<User> {
        self.store.user(id)
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.store.user_by_email(email)
    }

    pub fn class(&self, id: &ulid::Ulid) -> Option<Class> {
        self.store.class(id)
    }
}
