// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic sheet-sync usage example.
//!
//! Demonstrates:
//! 1. Starting the service in memory (no Redis, no SQL)
//! 2. A structured-store insert landing as a sheet row
//! 3. A human edit on the sheet flowing back
//! 4. The echo of our own write being dropped
//! 5. Dumping the recorded metrics
//!
//! Set `REDIS_URL` / `SQL_URL` to run against real backends.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use sheet_sync::storage::memory::InMemorySheet;
use sheet_sync::{SheetSyncConfig, SyncService, WebhookRequest, WebhookResponse};

const LAMP: &str = "7f3c2a10-1b2c-4d5e-8f90-123456789abc";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             sheet-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Start the service
    // ─────────────────────────────────────────────────────────────────────────
    let config = SheetSyncConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        sql_url: std::env::var("SQL_URL").ok(),
        ..Default::default()
    };

    let sheet = Arc::new(InMemorySheet::new());
    sheet.create_table("products", &["id", "name", "price"]);
    let service = SyncService::connect(config, sheet.clone()).await?;
    println!("🚀 Service started, health: {}", service.gateway().health().await.body);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Structured insert → sheet row
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📥 Structured insert...");
    let insert = json!({
        "type": "INSERT",
        "table": "products",
        "record": {"id": LAMP, "name": "Desk Lamp", "price": 20}
    });
    let response = service
        .gateway()
        .structured_webhook(WebhookRequest::new(insert.to_string()))
        .await;
    show("structured", &response);
    println!("   sheet rows: {:?}", sheet.rows("products"));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Our own write echoes back from the sheet
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Echo of our own write...");
    let echo = json!({"table": "products", "row": [LAMP, "Desk Lamp", "20"], "rowIndex": 2});
    let response = service.gateway().sheet_webhook(WebhookRequest::new(echo.to_string())).await;
    show("sheet", &response);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. A human edit flows back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✏️  Human edit on the sheet...");
    let edit = json!({"table": "products", "row": [LAMP, "Desk Lamp", "24.5"], "rowIndex": 2});
    let response = service.gateway().sheet_webhook(WebhookRequest::new(edit.to_string())).await;
    show("sheet", &response);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics");
    dump_metrics(&snapshotter);

    println!("\n✅ Done\n");
    Ok(())
}

fn show(origin: &str, response: &WebhookResponse) {
    println!("   {origin} webhook → {} {}", response.status, response.body);
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            match value {
                DebugValue::Counter(v) => Some(format!("   {}{} = {}", key.name(), label_str, v)),
                DebugValue::Gauge(v) => Some(format!("   {}{} = {}", key.name(), label_str, v.into_inner())),
                DebugValue::Histogram(samples) if !samples.is_empty() => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    Some(format!(
                        "   {}{} n={} avg={:.4}",
                        key.name(),
                        label_str,
                        samples.len(),
                        sum / samples.len() as f64
                    ))
                }
                DebugValue::Histogram(_) => None,
            }
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("{line}");
    }
}
