//! Redis-backed tests for the shared cache and a full service round trip.
//!
//! These need Docker and are ignored by default:
//!
//! ```bash
//! cargo test --test redis_integration -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

use sheet_sync::storage::memory::InMemorySheet;
use sheet_sync::storage::redis::RedisCache;
use sheet_sync::storage::traits::SharedCache;
use sheet_sync::{SheetSyncConfig, SyncService, WebhookRequest};

const LAMP: &str = "7f3c2a10-1b2c-4d5e-8f90-123456789abc";

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_is_exclusive_and_token_guarded() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::connect(&redis_url(&redis), Some("test:"))
        .await
        .expect("Failed to connect to Redis");

    let ttl = Duration::from_secs(5);
    assert!(cache.set_nx("lock:products:a", "token-1", ttl).await.unwrap());
    assert!(!cache.set_nx("lock:products:a", "token-2", ttl).await.unwrap());

    // A stale holder cannot release someone else's lock
    assert!(!cache.compare_and_delete("lock:products:a", "token-2").await.unwrap());
    assert_eq!(cache.get("lock:products:a").await.unwrap().as_deref(), Some("token-1"));

    assert!(cache.compare_and_delete("lock:products:a", "token-1").await.unwrap());
    assert!(cache.get("lock:products:a").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_keys_expire() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::connect(&redis_url(&redis), None).await.expect("connect");

    cache
        .set("fp:products:a", "abc", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(cache.get("fp:products:a").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.get("fp:products:a").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_replace_set_swaps_membership() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::connect(&redis_url(&redis), Some("test:")).await.expect("connect");

    let ttl = Duration::from_secs(60);
    cache
        .replace_set("fkset:categories", &["a".into(), "b".into()], ttl)
        .await
        .unwrap();
    assert!(cache.is_member("fkset:categories", "a").await.unwrap());

    cache.replace_set("fkset:categories", &["c".into()], ttl).await.unwrap();
    assert!(!cache.is_member("fkset:categories", "a").await.unwrap());
    assert!(cache.is_member("fkset:categories", "c").await.unwrap());

    // An empty replacement clears the set
    cache.replace_set("fkset:categories", &[], ttl).await.unwrap();
    assert!(!cache.is_member("fkset:categories", "c").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_service_round_trip_and_health() {
    let docker = Cli::default();
    let redis = redis_container(&docker);

    let sheet = Arc::new(InMemorySheet::new());
    sheet.create_table("products", &["id", "name", "price"]);
    let config = SheetSyncConfig {
        redis_url: Some(redis_url(&redis)),
        ..Default::default()
    };
    let service = SyncService::connect(config, sheet.clone()).await.expect("Failed to start");

    let health = service.gateway().health().await;
    assert_eq!(health.status, 200);
    assert!(health.body.contains("\"connected\""));

    let body = json!({
        "type": "INSERT",
        "table": "products",
        "record": {"id": LAMP, "name": "Lamp", "price": 20}
    })
    .to_string();
    let response = service.gateway().structured_webhook(WebhookRequest::new(body.clone())).await;
    assert_eq!((response.status, response.body.as_str()), (200, "OK"));
    assert_eq!(sheet.rows("products"), vec![vec![LAMP.to_string(), "Lamp".into(), "20".into()]]);

    // Redelivery inside the dedupe window is suppressed by the shared cache
    let response = service.gateway().structured_webhook(WebhookRequest::new(body)).await;
    assert_eq!(response.body, "Duplicate");
    assert!(!service.coordinator().cache().is_degraded());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_unreachable_at_startup_runs_degraded() {
    let sheet = Arc::new(InMemorySheet::new());
    let config = SheetSyncConfig {
        // Nothing listens here
        redis_url: Some("redis://127.0.0.1:1".into()),
        ..Default::default()
    };
    let service = SyncService::connect(config, sheet).await.expect("startup survives Redis");
    assert!(service.coordinator().cache().is_degraded());
    assert_eq!(service.gateway().health().await.status, 200);
}
