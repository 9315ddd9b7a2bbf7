use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

/// Monday 2030-01-07 00:00 UTC.
const BASE: i64 = 1_893_974_400_000;

const PASSWORD_DEFAULT: &str = "tutorslot";

struct Target {
    host: String,
    port: u16,
    password: String,
}

async fn connect(target: &Target, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("tutorslot")
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Tutor {
    id: Ulid,
    class_id: Ulid,
}

async fn register(client: &tokio_postgres::Client, role: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{id}', 'bench {id}', 'bench-{id}@example.com', '{role}')"
        ))
        .await
        .unwrap();
    id
}

/// A tutor available all day, every day, with one 60-minute class.
async fn setup_tutor(target: &Target) -> Tutor {
    let admin = connect(target, "bench").await;
    let id = register(&admin, "TUTOR").await;
    let client = connect(target, &id.to_string()).await;

    let class_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO classes (id, tutor_id, title, duration_minutes) VALUES ('{class_id}', '{id}', 'Bench', 60)"
        ))
        .await
        .unwrap();
    for day in 0..7 {
        client
            .batch_execute(&format!(
                "INSERT INTO availability_rules (id, tutor_id, day_of_week, start_time, end_time) \
                 VALUES ('{}', '{id}', {day}, '00:00', '23:59')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    Tutor { id, class_id }
}

async fn phase1_sequential(target: &Target) {
    let tutor = setup_tutor(target).await;
    let admin = connect(target, "bench").await;
    let student = register(&admin, "STUDENT").await;
    let client = connect(target, &student.to_string()).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let at = BASE + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{}', {at})",
                Ulid::new(),
                tutor.class_id
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many students race for the same hour of one tutor. Exactly one may win.
async fn phase2_same_slot_storm(target: &Target) {
    let n_students = 64;
    let rounds = 20;
    let tutor = Arc::new(setup_tutor(target).await);
    let admin = connect(target, "bench").await;

    let mut students = Vec::with_capacity(n_students);
    for _ in 0..n_students {
        students.push(register(&admin, "STUDENT").await);
    }

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let other = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for round in 0..rounds {
        let at = BASE + (round as i64) * 24 * HOUR;
        let mut handles = Vec::new();
        for &student in &students {
            let target = Target {
                host: target.host.clone(),
                port: target.port,
                password: target.password.clone(),
            };
            let tutor = tutor.clone();
            let (wins, conflicts, other) = (wins.clone(), conflicts.clone(), other.clone());
            handles.push(tokio::spawn(async move {
                let client = connect(&target, &student.to_string()).await;
                let result = client
                    .batch_execute(&format!(
                        "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{}', {at})",
                        Ulid::new(),
                        tutor.class_id
                    ))
                    .await;
                match result {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.as_db_error().is_some_and(|db| db.code().code() == "23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => {
                        eprintln!("unexpected error: {e}");
                        other.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    println!(
        "  {rounds} rounds x {n_students} students: {wins} won, {} conflicted, {} failed in {:.2}s",
        conflicts.load(Ordering::Relaxed),
        other.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    if wins != rounds {
        println!("  !! double booking detected: expected {rounds} wins for tutor {}", tutor.id);
    }
}

async fn phase3_read_under_load(target: &Target) {
    let tutor = Arc::new(setup_tutor(target).await);
    let admin = connect(target, "bench").await;
    let writer_id = register(&admin, "STUDENT").await;

    let writes = 500;
    let writer_target = Target {
        host: target.host.clone(),
        port: target.port,
        password: target.password.clone(),
    };
    let writer_tutor = tutor.clone();
    let writer = tokio::spawn(async move {
        let client = connect(&writer_target, &writer_id.to_string()).await;
        for i in 0..writes {
            let _ = client
                .batch_execute(&format!(
                    "INSERT INTO bookings (id, class_id, scheduled_at) VALUES ('{}', '{}', {})",
                    Ulid::new(),
                    writer_tutor.class_id,
                    BASE + (i as i64) * HOUR
                ))
                .await;
        }
    });

    let reader = connect(target, "bench").await;
    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        reader
            .simple_query(&format!(
                "SELECT * FROM slots WHERE class_id = '{}' AND on_date = '2030-01-08'",
                tutor.class_id
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let _ = writer.await;
    print_latency("slot query latency under write load", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TUTORSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TUTORSLOT_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid TUTORSLOT_PORT");
    let password = std::env::var("TUTORSLOT_PASSWORD").unwrap_or_else(|_| PASSWORD_DEFAULT.into());
    let target = Target { host, port, password };

    println!("=== tutorslot stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own tutor so phases never conflict with each other

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] same-slot booking storm");
    phase2_same_slot_storm(&target).await;

    println!("\n[phase 3] slot reads under write load");
    phase3_read_under_load(&target).await;

    println!("\n=== benchmark complete ===");
}
