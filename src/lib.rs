//! # Sheet Sync
//!
//! Loop-safe bidirectional sync between a structured record store and a
//! human-edited spreadsheet.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐            ┌──────────────────────┐
//! │   structured store   │            │        sheet         │
//! │  (change webhook)    │            │   (edit webhook)     │
//! └──────────┬───────────┘            └───────────┬──────────┘
//!            ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WebhookGateway                         │
//! │  • HMAC / shared-secret auth                               │
//! │  • IngressGuard: idempotency, burst dedupe, loop breaker   │
//! │  • HandlerRegistry: one handler per event class            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SyncCoordinator                         │
//! │  • per-entity lock (burst protection)                      │
//! │  • RecordNormalizer: type repair, shifted-row recovery     │
//! │  • fingerprints (echo suppression), conflict resolution    │
//! │  • row location cache, self-healing sheet rewrites         │
//! └─────────────────────────────────────────────────────────────┘
//!            │                  │                    │
//!   retry + circuit     retry + write queue    TieredCache
//!            ▼            + circuit ▼          (Redis → local)
//!     StructuredStore        TabularStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sheet_sync::{SheetSyncConfig, SyncService, WebhookRequest};
//! use sheet_sync::storage::memory::InMemorySheet;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SheetSyncConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         sql_url: Some("sqlite:records.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let sheet = Arc::new(InMemorySheet::new());
//!     sheet.create_table("products", &["id", "name", "price"]);
//!
//!     let service = SyncService::connect(config, sheet).await.expect("Failed to start");
//!
//!     let body = br#"{"type":"INSERT","table":"products",
//!                     "record":{"id":"7f3c2a10-1b2c-4d5e-8f90-123456789abc","name":"Lamp","price":20}}"#;
//!     let response = service.gateway().structured_webhook(WebhookRequest::new(body.to_vec())).await;
//!     println!("{} {}", response.status, response.body);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`ingress`]: webhook surface, authentication, health
//! - [`guard`]: ingress deduplication and loop breaking
//! - [`registry`]: single-subscriber handler registry
//! - [`coordinator`]: the [`SyncCoordinator`] state machine
//! - [`normalize`]: sheet row ⇄ canonical record mapping
//! - [`fingerprint`], [`row_cache`]: echo detection and row addressing
//! - [`storage`]: collaborator traits and backends (Redis, SQL, memory)
//! - [`resilience`]: circuit breakers, retry, write quota

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod ingress;
pub mod metrics;
pub mod normalize;
pub mod record;
pub mod registry;
pub mod resilience;
pub mod row_cache;
pub mod service;
pub mod storage;
pub mod time_source;

pub use config::{RelationConfig, SheetSyncConfig};
pub use coordinator::{Backends, SyncCoordinator, SyncOutcome, SyncState};
pub use error::{DispatchError, RegistryError, StartupError, SyncError};
pub use guard::{GuardDecision, IngressGuard};
pub use ingress::{WebhookGateway, WebhookRequest, WebhookResponse};
pub use normalize::RecordNormalizer;
pub use record::{CanonicalRecord, CellValue, EntityKey, EventEnvelope, EventType, Origin};
pub use registry::{EventClass, EventHandler, HandlerRegistry};
pub use resilience::circuit_breaker::{BackendCircuits, CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use service::SyncService;
pub use storage::traits::{SharedCache, StorageError, StructuredStore, TabularStore};
