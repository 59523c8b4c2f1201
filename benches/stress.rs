use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, club: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(club)
        .user("courtside")
        .password("courtside");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_club() -> String {
    format!("bench_{}", Ulid::new())
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Day `n` of the benchmark calendar, `YYYY-MM-DD`.
fn day(n: u64) -> String {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid base date");
    base.checked_add_days(Days::new(n))
        .expect("date in range")
        .format("%Y-%m-%d")
        .to_string()
}

/// One of the fourteen hourly business slots, as (`start`, `end`).
fn hour_slot(n: u64) -> (String, String) {
    let h = 8 + n % 14;
    (format!("{h:02}:00"), format!("{:02}:00", h + 1))
}

async fn add_court(client: &Client) -> Ulid {
    let court = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO courts (id, name) VALUES ('{court}', 'bench')"))
        .await
        .unwrap();
    court
}

/// Submit a request and return the first column (`outcome`) and cart id.
async fn request(
    client: &Client,
    actor: Ulid,
    court: Ulid,
    date: &str,
    start: &str,
    end: &str,
) -> Result<(String, Option<String>), tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            r#"INSERT INTO requests (actor, court_id, date, start, "end", players)
               VALUES ('{actor}', '{court}', '{date}', '{start}', '{end}', 2)"#
        ))
        .await?;
    for m in messages {
        if let SimpleQueryMessage::Row(row) = m {
            let outcome = row.get("outcome").unwrap_or_default().to_string();
            let cart = row.get("cart_id").map(str::to_string);
            return Ok((outcome, cart));
        }
    }
    Ok((String::new(), None))
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_club()).await;
    let court = add_court(&client).await;

    let n = 1000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let actor = Ulid::new();
        let (s, e) = hour_slot(i);
        let date = day(i / 14);
        let t = Instant::now();
        let (_, cart) = request(&client, actor, court, &date, &s, &e).await.unwrap();
        let cart = cart.expect("fresh slot is admitted");
        client
            .simple_query(&format!(
                "INSERT INTO checkouts (actor, cart_id) VALUES ('{actor}', '{cart}')"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} request+checkout pairs in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request+checkout latency", &mut latencies);
}

async fn phase2_contended_slot(host: &str, port: u16) {
    let club = fresh_club();
    let setup = connect(host, port, &club).await;
    let court = add_court(&setup).await;
    drop(setup);

    let n_tasks = 50;
    let rounds = 20u64;
    let admitted = Arc::new(AtomicUsize::new(0));
    let waitlisted = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let club = club.clone();
        let admitted = admitted.clone();
        let waitlisted = waitlisted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &club).await;
            let actor = Ulid::new();
            for r in 0..rounds {
                // Everyone fights over the same slot each round.
                let date = day(r);
                match request(&client, actor, court, &date, "18:00", "19:00").await {
                    Ok((outcome, _)) if outcome == "admitted" => {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {
                        waitlisted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => eprintln!("request failed: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let a = admitted.load(Ordering::Relaxed);
    let w = waitlisted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} users x {rounds} slots in {:.2}s: {a} admitted, {w} waitlisted",
        elapsed.as_secs_f64()
    );
    if a != rounds as usize {
        println!("  WARNING: expected exactly {rounds} admissions, got {a}");
    }
}

async fn phase3_slots_under_load(host: &str, port: u16) {
    let club = fresh_club();
    let setup = connect(host, port, &club).await;
    let court = add_court(&setup).await;
    for i in 0..200u64 {
        let (s, e) = hour_slot(i);
        let _ = request(&setup, Ulid::new(), court, &day(i / 14), &s, &e).await;
    }
    drop(setup);

    // Writers keep submitting on the same court.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let club = club.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &club).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let (s, e) = hour_slot(i);
                let date = day(100 + w * 1000 + i / 14);
                let _ = request(&client, Ulid::new(), court, &date, &s, &e).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let club = club.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &club).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = day(((r * reads_per_reader + i) % 15) as u64);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM slots WHERE court_id = '{court}' AND date = '{date}' AND minutes = 30"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("free-slot query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_club()).await;
            let court = add_court(&client).await;
            let actor = Ulid::new();
            for i in 0..ops_per_conn {
                let (s, e) = hour_slot(i);
                request(&client, actor, court, &day(0), &s, &e).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("COURTSIDE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("COURTSIDE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid COURTSIDE_PORT");

    println!("=== courtside stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own club (unique dbname) to avoid interference

    println!("[phase 1] sequential request + checkout");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended slot");
    phase2_contended_slot(&host, port).await;

    println!("\n[phase 3] free-slot reads under write load");
    phase3_slots_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
