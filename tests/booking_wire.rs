use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use tutorslot::engine::Engine;
use tutorslot::notify::{NotifyHub, tutor_channel};
use tutorslot::wire;

const PASSWORD: &str = "tutorslot";

/// Monday 2030-01-07 09:00 UTC.
const MONDAY_9AM: i64 = 1_894_006_800_000;
const HOUR_MS: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tutorslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("tutorslot.wal"), Arc::new(NotifyHub::new())).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

/// Connect as `user`; a registered user's ULID makes it the actor.
async fn connect(
    addr: SocketAddr,
    user: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tutorslot")
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

async fn select(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// A tutor with a 60-minute class and a Monday 09:00-11:00 rule, plus one
/// student. Returns (tutor, student, class).
async fn seed(addr: SocketAddr) -> (Ulid, Ulid, Ulid) {
    let tutor = Ulid::new();
    let student = Ulid::new();
    let class = Ulid::new();
    let rule = Ulid::new();

    let (admin, _) = connect(addr, "setup").await;
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{tutor}', 'Tina Tutor', 'tina-{tutor}@example.com', 'TUTOR')"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{student}', 'Sam Student', 'sam-{student}@example.com', 'STUDENT')"
        ))
        .await
        .unwrap();

    let (tc, _) = connect(addr, &tutor.to_string()).await;
    tc.batch_execute(&format!(
        "INSERT INTO classes (id, tutor_id, title, duration_minutes, is_active) VALUES ('{class}', '{tutor}', 'Algebra', 60, true)"
    ))
    .await
    .unwrap();
    tc.batch_execute(&format!(
        "INSERT INTO availability_rules (id, tutor_id, day_of_week, start_time, end_time, timezone, buffer_minutes) \
         VALUES ('{rule}', '{tutor}', 1, '09:00', '11:00', 'UTC', 10)"
    ))
    .await
    .unwrap();

    (tutor, student, class)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn rules_and_slots_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (client, _) = connect(addr, &student.to_string()).await;

    let rules = select(&client, &format!("SELECT * FROM availability_rules WHERE tutor_id = '{tutor}'")).await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].get("start_time"), Some("09:00:00"));
    assert_eq!(rules[0].get("buffer_minutes"), Some("10"));

    let slots = select(&client, &format!("SELECT * FROM slots WHERE class_id = '{class}' AND on_date = '2030-01-07'")).await;
    let starts: Vec<&str> = slots.iter().filter_map(|r| r.get("start")).collect();
    assert_eq!(starts, vec![MONDAY_9AM.to_string(), (MONDAY_9AM + HOUR_MS).to_string()]);
    assert!(slots.iter().all(|r| r.get("booking_id").is_none()));

    let tuesday = select(&client, &format!("SELECT * FROM slots WHERE class_id = '{class}' AND on_date = '2030-01-08'")).await;
    assert!(tuesday.is_empty());
}

#[tokio::test]
async fn booking_hides_slot_and_shows_in_calendar() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (client, _) = connect(addr, &student.to_string()).await;

    let booking = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, class_id, scheduled_at, notes) VALUES ('{booking}', '{class}', {MONDAY_9AM}, 'chapter 2')"
        ))
        .await
        .unwrap();

    let slots = select(&client, &format!("SELECT * FROM slots WHERE class_id = '{class}' AND on_date = '2030-01-07'")).await;
    let booking_str = booking.to_string();
    assert_eq!(slots[0].get("booking_id"), Some(booking_str.as_str()));
    assert_eq!(slots[0].get("is_free"), Some("f"));
    assert_eq!(slots[1].get("is_free"), Some("t"));

    let booked = select(&client, &format!("SELECT * FROM booked_slots WHERE tutor_id = '{tutor}' AND on_date = '2030-01-07'")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("student_name"), Some("Sam Student"));
    assert_eq!(booked[0].get("class_title"), Some("Algebra"));
    assert_eq!(booked[0].get("status"), Some("PENDING"));

    let mine = select(&client, &format!("SELECT * FROM bookings WHERE student_id = '{student}'")).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("notes"), Some("chapter 2"));
    assert_eq!(mine[0].get("tutor_name"), Some("Tina Tutor"));
}

#[tokio::test]
async fn concurrent_bookings_one_wins() {
    let (addr, _engine) = start_test_server().await;
    let (_tutor, first, class) = seed(addr).await;

    let second = Ulid::new();
    let (admin, _) = connect(addr, "setup").await;
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{second}', 'Second', 'second-{second}@example.com', 'STUDENT')"
        ))
        .await
        .unwrap();

    let (c1, _) = connect(addr, &first.to_string()).await;
    let (c2, _) = connect(addr, &second.to_string()).await;
    let sql1 = format!("INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})", Ulid::new());
    let sql2 = format!("INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})", Ulid::new());

    let (r1, r2) = tokio::join!(c1.batch_execute(&sql1), c2.batch_execute(&sql2));
    let errors: Vec<_> = [r1, r2].into_iter().filter_map(Result::err).collect();
    assert_eq!(errors.len(), 1, "exactly one booking must lose");
    assert_eq!(sqlstate(&errors[0]), "23P01");
}

#[tokio::test]
async fn actor_scoped_statement_needs_registered_user() {
    let (addr, _engine) = start_test_server().await;
    let (_tutor, _student, class) = seed(addr).await;
    let (anon, _) = connect(addr, "guest").await;

    let err = anon
        .batch_execute(&format!(
            "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let (_tutor, student, _class) = seed(addr).await;
    let (client, _) = connect(addr, &student.to_string()).await;

    let err = client.batch_execute("INSERT INTO nowhere VALUES (1)").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{}', {MONDAY_9AM})",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{}', 'Dup', 'sam-{student}@example.com', 'STUDENT')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");
}

#[tokio::test]
async fn link_booking_without_actor() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, _student, class) = seed(addr).await;

    let (tc, _) = connect(addr, &tutor.to_string()).await;
    tc.batch_execute(&format!(
        "INSERT INTO share_links (token, class_id, expires_at) VALUES ('open-{class}', '{class}', NULL)"
    ))
    .await
    .unwrap();

    let (anon, _) = connect(addr, "guest").await;
    anon.batch_execute(&format!(
        "INSERT INTO link_bookings (id, token, student_name, student_email, scheduled_at, notes) \
         VALUES ('{}', 'open-{class}', 'Lee', 'lee-{class}@example.com', {}, NULL)",
        Ulid::new(),
        MONDAY_9AM + HOUR_MS
    ))
    .await
    .unwrap();

    let calendar = select(&tc, &format!("SELECT * FROM bookings WHERE tutor_id = '{tutor}'")).await;
    assert_eq!(calendar.len(), 1);
    assert_eq!(calendar[0].get("student_name"), Some("Lee"));
}

#[tokio::test]
async fn reschedule_accept_then_resolved() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (sc, _) = connect(addr, &student.to_string()).await;
    let (tc, _) = connect(addr, &tutor.to_string()).await;

    let booking = Ulid::new();
    sc.batch_execute(&format!(
        "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{booking}', '{class}', {MONDAY_9AM})"
    ))
    .await
    .unwrap();

    let request = Ulid::new();
    let new_time = MONDAY_9AM + 24 * HOUR_MS;
    tc.batch_execute(&format!(
        "INSERT INTO reschedule_requests (id, booking_id, proposed_time) VALUES ('{request}', '{booking}', {new_time})"
    ))
    .await
    .unwrap();

    let decision = format!(
        "INSERT INTO reschedule_decisions (request_id, booking_id, decision) VALUES ('{request}', '{booking}', 'ACCEPTED')"
    );
    sc.batch_execute(&decision).await.unwrap();

    let rows = select(&sc, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows[0].get("scheduled_at"), Some(new_time.to_string().as_str()));

    let requests = select(&sc, &format!("SELECT * FROM reschedule_requests WHERE booking_id = '{booking}'")).await;
    assert_eq!(requests[0].get("status"), Some("ACCEPTED"));

    let err = sc.batch_execute(&decision).await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (client, _) = connect(addr, &student.to_string()).await;

    let booking = Ulid::new().to_string();
    let class = class.to_string();
    let at = MONDAY_9AM.to_string();
    client
        .execute(
            "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ($1, $2, $3)",
            &[&booking, &class, &at],
        )
        .await
        .unwrap();

    let booked = select(&client, &format!("SELECT * FROM booked_slots WHERE tutor_id = '{tutor}' AND on_date = '2030-01-07'")).await;
    assert_eq!(booked[0].get("id"), Some(booking.as_str()));
}

#[tokio::test]
async fn listener_gets_tutor_events_before_next_response() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (tc, mut rx) = connect(addr, &tutor.to_string()).await;
    tc.batch_execute(&format!("LISTEN {}", tutor_channel(tutor))).await.unwrap();

    let (sc, _) = connect(addr, &student.to_string()).await;
    sc.batch_execute(&format!(
        "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})",
        Ulid::new()
    ))
    .await
    .unwrap();

    tc.simple_query(&format!("SELECT * FROM availability_rules WHERE tutor_id = '{tutor}'"))
        .await
        .unwrap();
    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), tutor_channel(tutor));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["kind"], "booking_created");

    let dup = recv_notification(&mut rx, Duration::from_millis(300)).await;
    assert!(dup.is_none(), "one event, one notification");
}

#[tokio::test]
async fn other_tutors_events_stay_quiet() {
    let (addr, _engine) = start_test_server().await;
    let (tutor_a, _, _) = seed(addr).await;
    let (tutor_b, student_b, class_b) = seed(addr).await;

    let (ta, mut rx) = connect(addr, &tutor_a.to_string()).await;
    ta.batch_execute(&format!("LISTEN {}", tutor_channel(tutor_a))).await.unwrap();

    let (sb, _) = connect(addr, &student_b.to_string()).await;
    sb.batch_execute(&format!(
        "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class_b}', {MONDAY_9AM})",
        Ulid::new()
    ))
    .await
    .unwrap();

    ta.simple_query(&format!("SELECT * FROM bookings WHERE tutor_id = '{tutor_b}'"))
        .await
        .unwrap();
    let notif = recv_notification(&mut rx, Duration::from_millis(500)).await;
    assert!(notif.is_none());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _engine) = start_test_server().await;
    let (tutor, student, class) = seed(addr).await;
    let (tc, mut rx) = connect(addr, &tutor.to_string()).await;
    tc.batch_execute(&format!("LISTEN {}", tutor_channel(tutor))).await.unwrap();
    tc.batch_execute("UNLISTEN *").await.unwrap();

    let (sc, _) = connect(addr, &student.to_string()).await;
    sc.batch_execute(&format!(
        "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})",
        Ulid::new()
    ))
    .await
    .unwrap();

    tc.simple_query(&format!("SELECT * FROM availability_rules WHERE tutor_id = '{tutor}'"))
        .await
        .unwrap();
    let notif = recv_notification(&mut rx, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn listen_rejects_bad_channel() {
    let (addr, _engine) = start_test_server().await;
    let (client, _) = connect(addr, "guest").await;
    let err = client.batch_execute("LISTEN resource_abc").await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");
}

#[tokio::test]
async fn checkpoint_compacts() {
    let (addr, engine) = start_test_server().await;
    let (_tutor, student, class) = seed(addr).await;
    let (client, _) = connect(addr, &student.to_string()).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{class}', {MONDAY_9AM})",
            Ulid::new()
        ))
        .await
        .unwrap();
    assert!(engine.wal_appends_since_compact().await > 0);

    client.batch_execute("CHECKPOINT").await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}
