// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic data-handler usage example.
//!
//! Demonstrates:
//! 1. Initializing over an in-memory local store and in-process remote
//! 2. Writing and reading a few JSON values
//! 3. Riding out a remote outage (circuit opens, local keeps serving)
//! 4. Recovering and flushing the queued writes
//! 5. Health, performance and raw metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use data_handler::storage::memory::{InMemoryRemote, InMemoryStorage};
use data_handler::{DataHandler, HandlerConfig, StorageAdapter};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           data-handler: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and initialize
    // ─────────────────────────────────────────────────────────────────────────
    let config = HandlerConfig::from_toml_str(
        r#"
        debounce_ms = 50
        sync_interval_ms = 100
        circuit_threshold = 2
        circuit_cooldown_ms = 500
        remote_timeout_ms = 200
        "#,
    )?;

    let storage = Arc::new(InMemoryStorage::new());
    let remote = Arc::new(InMemoryRemote::new());
    // A record written by an older release, picked up by migration
    storage.put("settings_theme", "\"dark\"").await?;

    let handler = DataHandler::initialize(config, storage.clone(), remote.clone()).await?;
    println!("🚀 Handler initialized. State: {}", handler.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write and read
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing entries...");
    let entries = vec![
        ("profile", "alice", json!({"name": "Alice", "role": "admin"})),
        ("profile", "bob", json!({"name": "Bob", "role": "user"})),
        ("settings", "locale", json!("en-GB")),
    ];
    for (namespace, field, value) in &entries {
        let start = std::time::Instant::now();
        handler.set(namespace, field, value).await?;
        println!("   └─ {namespace}.{field} → {value} ({:?})", start.elapsed());
    }

    let theme: Option<String> = handler.get("settings", "theme").await?;
    println!("   └─ settings.theme (migrated) → {theme:?}");

    let report = handler.flush().await?;
    println!("   ✅ Flushed {} writes to the remote", report.delivered.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Remote outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Taking the remote offline...");
    remote.set_offline(true);
    handler.set("profile", "carol", &json!({"name": "Carol"})).await?;
    for _ in 0..3 {
        handler.flush().await?;
    }
    let alice: Option<serde_json::Value> = handler.get("profile", "alice").await?;
    println!("   └─ profile.alice still readable → {alice:?}");
    println!("   └─ Circuit: {}", handler.circuit().state);
    println!("   └─ Queue: {:?}", handler.sync_queue_stats());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Recovery
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩹 Bringing the remote back...");
    remote.set_offline(false);
    tokio::time::sleep(Duration::from_millis(600)).await;
    handler.flush().await?;
    println!("   └─ Circuit: {}", handler.circuit().state);
    println!("   └─ Remote has profile.carol: {}", remote.peek("profile.carol").is_some());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = handler.sample_health();
    println!("\n🩺 Health: score={} status={:?}", health.score, health.status);

    println!("\n📊 Performance:");
    for (op, stats) in handler.performance_metrics().per_operation {
        println!(
            "   └─ {op}: count={} errors={} p50={:.3}ms p95={:.3}ms p99={:.3}ms",
            stats.count, stats.errors, stats.p50_ms, stats.p95_ms, stats.p99_ms
        );
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    handler.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", handler.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {line}");
    }
}
