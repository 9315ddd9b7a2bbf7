use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{TutorslotAuthSource, actor_from_metadata};
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify::parse_tutor_channel;
use crate::observability::{self, command_label};
use crate::sql::{self, BookingFilter, Command, SqlError};

/// A LISTEN registration held by one connection.
struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

/// One handler per connection: it owns that connection's LISTEN state.
pub struct TutorslotHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TutorslotQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl TutorslotHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TutorslotQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, actor: Option<Ulid>, query: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Forward every event received since the last statement as a
    /// NotificationResponse, ahead of the statement's own response.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.subscriptions.lock().await;
            for sub in subs.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(event) => pending.push((sub.channel.clone(), notification_payload(&event))),
                        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                            warn!(channel = %sub.channel, skipped, "listener lagged, notifications dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .feed(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        actor: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser {
                id,
                name,
                email,
                role,
            } => {
                engine
                    .register_user(id, &name, &email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SaveClass {
                id,
                tutor_id,
                title,
                duration_minutes,
                is_active,
            } => {
                engine
                    .save_class(require_actor(actor)?, id, tutor_id, &title, duration_minutes, is_active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::IssueShareLink {
                token,
                class_id,
                expires_at,
            } => {
                engine
                    .issue_share_link(require_actor(actor)?, &token, class_id, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SaveRule {
                id,
                tutor_id,
                day_of_week,
                start_time,
                end_time,
                timezone,
                buffer_minutes,
            } => {
                engine
                    .save_rule(
                        require_actor(actor)?,
                        id,
                        tutor_id,
                        day_of_week,
                        start_time,
                        end_time,
                        &timezone,
                        buffer_minutes,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteRule { id } => {
                engine
                    .remove_rule(require_actor(actor)?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SelectRules { tutor_id } => {
                let availability = engine.list_availability(tutor_id).await;
                let buffer = availability.buffer_minutes as i32;
                Ok(vec![rows(rules_schema(), availability.rules, |enc, rule| {
                    enc.encode_field(&rule.id.to_string())?;
                    enc.encode_field(&rule.tutor_id.to_string())?;
                    enc.encode_field(&(rule.day_of_week as i32))?;
                    enc.encode_field(&rule.start_time.format("%H:%M:%S").to_string())?;
                    enc.encode_field(&rule.end_time.format("%H:%M:%S").to_string())?;
                    enc.encode_field(&rule.timezone)?;
                    enc.encode_field(&buffer)
                })])
            }
            Command::SelectBookedSlots { tutor_id, date } => {
                let overview = engine.availability_with_conflicts(tutor_id, date).await;
                Ok(vec![rows(booked_slots_schema(), overview.bookings, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.scheduled_at)?;
                    enc.encode_field(&b.status.as_str())?;
                    enc.encode_field(&(b.duration_minutes as i32))?;
                    enc.encode_field(&b.student_name)?;
                    enc.encode_field(&b.class_title)
                })])
            }
            Command::SelectSlots { class_id, date } => {
                let slots = engine
                    .available_slots(class_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(slots_schema(), slots, |enc, slot| {
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&slot.booking_id.map(|id| id.to_string()))?;
                    enc.encode_field(&slot.is_free())
                })])
            }
            Command::InsertBooking {
                id,
                class_id,
                scheduled_at,
                notes,
            } => {
                engine
                    .create_booking(require_actor(actor)?, id, class_id, scheduled_at, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertLinkBooking {
                id,
                token,
                student_name,
                student_email,
                scheduled_at,
                notes,
            } => {
                engine
                    .book_via_link(id, &token, &student_name, &student_email, scheduled_at, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertScheduledBooking {
                id,
                class_id,
                student_email,
                scheduled_at,
                notes,
            } => {
                engine
                    .schedule_for_student(
                        require_actor(actor)?,
                        id,
                        class_id,
                        &student_email,
                        scheduled_at,
                        notes,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetBookingStatus { booking_id, status } => {
                engine
                    .update_booking_status(require_actor(actor)?, booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteBooking { id } => {
                engine
                    .delete_booking(require_actor(actor)?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => engine.get_booking(id).await.into_iter().collect(),
                    BookingFilter::Tutor(id) => engine.bookings_for_tutor(id).await,
                    BookingFilter::Student(id) => engine.bookings_for_student(id).await,
                };
                Ok(vec![rows(bookings_schema(), bookings, encode_booking)])
            }
            Command::ProposeReschedule {
                id,
                booking_id,
                proposed_time,
            } => {
                engine
                    .propose_reschedule(require_actor(actor)?, id, booking_id, proposed_time)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DecideReschedule {
                request_id,
                booking_id,
                decision,
            } => {
                let actor = require_actor(actor)?;
                let resolved = match decision {
                    RescheduleStatus::Accepted => engine.accept_reschedule(actor, request_id, booking_id).await,
                    _ => engine.decline_reschedule(actor, request_id, booking_id).await,
                };
                resolved.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SelectRescheduleRequests { booking_id } => {
                let requests = engine.reschedule_requests(booking_id).await;
                Ok(vec![rows(reschedule_schema(), requests, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.booking_id.to_string())?;
                    enc.encode_field(&r.requested_by_id.to_string())?;
                    enc.encode_field(&r.proposed_time)?;
                    enc.encode_field(&r.status.as_str())
                })])
            }
            Command::Listen { channel } => {
                let tutor_id = parse_tutor_channel(&channel).ok_or_else(|| {
                    engine_err(EngineError::Invalid(format!(
                        "invalid channel: {channel} (expected tutor_{{id}})"
                    )))
                })?;
                let mut subs = self.subscriptions.lock().await;
                if !subs.iter().any(|s| s.channel == channel) {
                    if subs.len() >= MAX_LISTEN_CHANNELS {
                        return Err(engine_err(EngineError::LimitExceeded("too many LISTEN channels")));
                    }
                    let rx = engine.notify.subscribe(tutor_id);
                    debug!(%channel, "listening");
                    subs.push(Subscription { channel, rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.subscriptions.lock().await.retain(|s| s.channel != channel);
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::Checkpoint => {
                engine.compact_wal().await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("CHECKPOINT"))])
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

/// JSON body of a NOTIFY: the event kind plus the event itself.
fn notification_payload(event: &Event) -> String {
    serde_json::json!({
        "kind": event.kind(),
        "event": event,
    })
    .to_string()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_booking(enc: &mut DataRowEncoder, view: &BookingView) -> PgWireResult<()> {
    let b = &view.booking;
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.class_id.to_string())?;
    enc.encode_field(&b.tutor_id.to_string())?;
    enc.encode_field(&b.student_id.to_string())?;
    enc.encode_field(&b.scheduled_at)?;
    enc.encode_field(&(b.duration_minutes as i32))?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&b.notes)?;
    enc.encode_field(&view.class_title)?;
    enc.encode_field(&view.tutor_name)?;
    enc.encode_field(&view.student_name)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("day_of_week", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("buffer_minutes", Type::INT4),
    ]
}

fn booked_slots_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("scheduled_at", Type::INT8),
        field("status", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("student_name", Type::VARCHAR),
        field("class_title", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("booking_id", Type::VARCHAR),
        field("is_free", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("class_id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("student_id", Type::VARCHAR),
        field("scheduled_at", Type::INT8),
        field("duration_minutes", Type::INT4),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("class_title", Type::VARCHAR),
        field("tutor_name", Type::VARCHAR),
        field("student_name", Type::VARCHAR),
    ]
}

fn reschedule_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("requested_by_id", Type::VARCHAR),
        field("proposed_time", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

/// Row shape of a statement, judged from its text alone so it works on
/// unbound `$n` statements too.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("BOOKED_SLOTS") {
        booked_slots_schema()
    } else if upper.contains("RESCHEDULE_REQUESTS") {
        reschedule_schema()
    } else if upper.contains("AVAILABILITY_RULES") {
        rules_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TutorslotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let actor = actor_from_metadata(client.metadata());
        self.run(actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TutorslotQueryParser;

#[async_trait]
impl QueryParser for TutorslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TutorslotHandler {
    type Statement = String;
    type QueryParser = TutorslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let actor = actor_from_metadata(client.metadata());
        let sql = substitute_params(portal);
        let responses = self.run(actor, &sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TutorslotFactory {
    handler: Arc<TutorslotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TutorslotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TutorslotFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TutorslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TutorslotHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TutorslotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects. Each connection gets its own
/// handler so LISTEN registrations die with it.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let notify = engine.notify.clone();
    let factory = Arc::new(TutorslotFactory::new(engine, password));
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    notify.prune();
    result
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE and client-facing message. Storage failures are logged here and
/// reach the client without their detail.
fn error_parts(e: &EngineError) -> (&'static str, String) {
    if let EngineError::WalError(detail) = e {
        tracing::error!("storage failure: {detail}");
        return (e.sqlstate(), "storage failure; nothing was written".into());
    }
    (e.sqlstate(), e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = error_parts(&e);
    user_error(code, message)
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn require_actor(actor: Option<Ulid>) -> PgWireResult<Ulid> {
    actor.ok_or_else(|| {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        user_error(
            "42501",
            "connection user must be a registered user id".into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO bookings (id, class_id, scheduled_at) VALUES ($1, $2, $3)"),
            3
        );
        assert_eq!(count_params("CHECKPOINT"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        let width = |sql: &str| result_schema(sql).len();
        assert_eq!(width("SELECT * FROM booked_slots WHERE tutor_id = $1"), 6);
        assert_eq!(width("SELECT * FROM slots WHERE class_id = $1"), 4);
        assert_eq!(width("SELECT * FROM availability_rules WHERE tutor_id = $1"), 7);
        assert_eq!(width("select * from bookings where id = $1"), 11);
        assert_eq!(width("SELECT * FROM reschedule_requests WHERE booking_id = $1"), 5);
        assert_eq!(width("INSERT INTO bookings (id, class_id, scheduled_at) VALUES ($1, $2, $3)"), 0);
    }

    #[test]
    fn engine_errors_keep_their_sqlstate() {
        let (code, message) = error_parts(&EngineError::TutorConflict(Ulid::nil()));
        assert_eq!(code, "23P01");
        assert!(message.contains(&Ulid::nil().to_string()));
        assert_eq!(error_parts(&EngineError::Forbidden("nope")).0, "42501");
    }

    #[test]
    fn wal_errors_hide_detail() {
        let (code, message) = error_parts(&EngineError::WalError("disk on fire".into()));
        assert_eq!(code, "58030");
        assert!(!message.contains("disk"));
    }

    #[test]
    fn payload_is_json_with_kind() {
        let event = Event::RuleRemoved {
            id: Ulid::nil(),
            tutor_id: Ulid::nil(),
        };
        let value: serde_json::Value = serde_json::from_str(&notification_payload(&event)).unwrap();
        assert_eq!(value["kind"], "rule_removed");
        assert!(value["event"]["RuleRemoved"].is_object());
    }
}
