//! Performance benchmarks for the session, sequencer and broadcast paths

use server::gateway::{Gateway, GatewayConfig};
use server::sequencer::Sequencer;
use server::session::{Session, SessionLimits};
use shared::{ClientEvent, ConnectionId, Pattern, PatternSquare};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn busy_session(rows: u32, cols: u32, players: usize) -> (Session, ConnectionId) {
    let mut session = Session::new(SessionLimits::default());
    let dm = ConnectionId::from("dm");
    session.create_game(&dm, rows, cols).unwrap();
    for i in 0..players {
        let id = ConnectionId::new(format!("player-{}", i));
        session.add_player(&id, &format!("Player {}", i)).unwrap();
    }
    (session, dm)
}

fn wide_pattern(rows: u32, cols: u32, count: usize) -> Pattern {
    let squares = (0..count)
        .map(|i| {
            let i = i as u32;
            PatternSquare::new(i % rows, (i / rows) % cols, (i % 7) as f64 * 0.5, 3.0)
        })
        .collect();
    Pattern {
        name: "Barrage".to_string(),
        squares,
    }
}

/// Benchmarks a large pattern cascading through every phase
#[test]
fn benchmark_sequencer_cascade() {
    let (mut session, _dm) = busy_session(100, 100, 50);
    let mut sequencer = Sequencer::new();
    let pattern = wide_pattern(100, 100, 2_000);

    let start_clock = Instant::now();
    let launched = sequencer.launch(&pattern, start_clock);
    assert_eq!(launched, 2_000);

    let start = std::time::Instant::now();
    let events = sequencer.fire_due(start_clock + Duration::from_secs(60), &mut session);
    let duration = start.elapsed();

    println!(
        "Sequencer cascade: {} steps for {} squares in {:?}",
        events.len(),
        launched,
        duration
    );

    // Warning, damage, two more sweeps and the clear for each square.
    assert_eq!(events.len(), 2_000 * 5);
    assert!(sequencer.is_idle());
    assert!(session.active_squares().is_empty());
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks hit sweeps against a crowded cell
#[test]
fn benchmark_hit_sweeps() {
    let (mut session, _dm) = busy_session(20, 20, 200);
    let iterations = 10_000;

    let start = std::time::Instant::now();
    let mut total_hits = 0;
    for _ in 0..iterations {
        total_hits += session.sweep_hits(10, 10).len();
    }
    let duration = start.elapsed();

    println!(
        "Hit sweeps: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Every player spawns on the centre cell.
    assert_eq!(total_hits, 200 * iterations);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks snapshot serialization of a busy session
#[test]
fn benchmark_snapshot_serialization() {
    let (mut session, dm) = busy_session(50, 50, 64);
    for i in 0..20 {
        let mut pattern = wide_pattern(50, 50, 25);
        pattern.name = format!("Pattern {}", i);
        session.save_pattern(&dm, pattern).unwrap();
    }

    let iterations = 1_000;
    let start = std::time::Instant::now();
    let mut bytes = 0;
    for _ in 0..iterations {
        bytes += serde_json::to_string(&session.snapshot()).unwrap().len();
    }
    let duration = start.elapsed();

    println!(
        "Snapshot serialization: {} iterations, {} bytes each, in {:?}",
        iterations,
        bytes / iterations,
        duration
    );

    assert!(bytes > 0);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks parsing of incoming command frames
#[test]
fn benchmark_command_parsing() {
    let frame = r#"{"event":"movePlayer","data":{"row":4,"col":7}}"#;
    let iterations = 100_000;

    let start = std::time::Instant::now();
    for _ in 0..iterations {
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event, ClientEvent::MovePlayer { row: 4, col: 7 });
    }
    let duration = start.elapsed();

    println!(
        "Command parsing: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks broadcast fan-out to a full server
#[test]
fn benchmark_broadcast_fanout() {
    let mut gateway = Gateway::new(GatewayConfig::default());
    let mut receivers = Vec::new();
    for _ in 0..64 {
        let (tx, rx) = mpsc::unbounded_channel();
        gateway.connect(tx).unwrap();
        receivers.push(rx);
    }

    let iterations = 1_000;
    let start = std::time::Instant::now();
    for _ in 0..iterations {
        gateway.regenerate();
    }
    let duration = start.elapsed();

    println!(
        "Broadcast fan-out: {} broadcasts to {} clients in {:?}",
        iterations,
        receivers.len(),
        duration
    );

    for rx in receivers.iter_mut() {
        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        // Initial snapshot plus one per regeneration.
        assert_eq!(frames, iterations + 1);
    }
    assert!(duration.as_millis() < 3000);
}
