// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service assembly.
//!
//! [`SyncService::connect`] wires the production graph:
//!
//! ```text
//! Redis (optional) ──► TieredCache ─┬─► IngressGuard ─┐
//!                                   │                 ├─► WebhookGateway
//! SQL (required when configured) ───┼─► SyncCoordinator ─► HandlerRegistry
//! sheet client (caller supplied) ───┘
//! ```
//!
//! Redis failing at startup is not fatal: the service comes up degraded on
//! the local tier. A configured SQL store that cannot be reached is.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SheetSyncConfig;
use crate::coordinator::{Backends, SyncCoordinator};
use crate::error::StartupError;
use crate::guard::{GuardConfig, IngressGuard};
use crate::ingress::WebhookGateway;
use crate::registry::HandlerRegistry;
use crate::storage::memory::InMemoryRecordStore;
use crate::storage::redis::RedisCache;
use crate::storage::sql::SqlRecordStore;
use crate::storage::tiered::TieredCache;
use crate::storage::traits::{SharedCache, StructuredStore, TabularStore};
use crate::time_source::{SystemTimeSource, TimeSource};

pub struct SyncService {
    coordinator: Arc<SyncCoordinator>,
    registry: HandlerRegistry,
    gateway: WebhookGateway,
}

impl SyncService {
    /// Connect the configured backends around a caller-supplied sheet client.
    #[tracing::instrument(skip_all, fields(has_redis, has_sql))]
    pub async fn connect(config: SheetSyncConfig, sheet: Arc<dyn TabularStore>) -> Result<Self, StartupError> {
        let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);

        let primary: Option<Arc<dyn SharedCache>> = match &config.redis_url {
            Some(url) => {
                let started = Instant::now();
                info!(url = %url, prefix = %config.redis_prefix, "Connecting to Redis...");
                match RedisCache::connect(url, Some(config.redis_prefix.as_str())).await {
                    Ok(cache) => {
                        tracing::Span::current().record("has_redis", true);
                        crate::metrics::set_backend_healthy("redis", true);
                        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Redis connected");
                        Some(Arc::new(cache) as Arc<dyn SharedCache>)
                    }
                    Err(e) => {
                        tracing::Span::current().record("has_redis", false);
                        warn!(error = %e, "Failed to connect to Redis, continuing on the local tier");
                        crate::metrics::set_backend_healthy("redis", false);
                        crate::metrics::record_connection_error("redis");
                        None
                    }
                }
            }
            None => {
                warn!("No Redis URL configured, locks and dedupe are instance-local");
                None
            }
        };
        let cache = Arc::new(match primary {
            Some(primary) => {
                TieredCache::new(primary).with_call_timeout(Duration::from_millis(config.external_timeout_ms))
            }
            None => TieredCache::local_only(Arc::clone(&clock)),
        });

        let records: Arc<dyn StructuredStore> = match &config.sql_url {
            Some(url) => match SqlRecordStore::connect(url).await {
                Ok(store) => {
                    tracing::Span::current().record("has_sql", true);
                    crate::metrics::set_backend_healthy("sql", true);
                    info!("Structured store connected");
                    Arc::new(store)
                }
                Err(e) => {
                    crate::metrics::set_backend_healthy("sql", false);
                    crate::metrics::record_connection_error("sql");
                    return Err(StartupError::Backend(e));
                }
            },
            None => {
                tracing::Span::current().record("has_sql", false);
                warn!("No SQL URL configured, records are kept in memory only");
                Arc::new(InMemoryRecordStore::new())
            }
        };

        let backends = Backends {
            cache,
            records,
            sheet,
            clock,
        };
        Self::from_coordinator(Arc::new(SyncCoordinator::new(config, backends)))
    }

    /// Assemble guard, registry and gateway around an existing coordinator.
    pub fn from_coordinator(coordinator: Arc<SyncCoordinator>) -> Result<Self, StartupError> {
        let registry = HandlerRegistry::new();
        coordinator.register_handlers(&registry)?;

        let config = coordinator.config();
        let guard = IngressGuard::new(
            Arc::clone(coordinator.cache()),
            Arc::clone(coordinator.clock()),
            GuardConfig::from_config(config),
        );
        let gateway = WebhookGateway::new(config, guard, registry.clone(), Arc::clone(coordinator.cache()));

        Ok(Self {
            coordinator,
            registry,
            gateway,
        })
    }

    #[must_use]
    pub fn gateway(&self) -> &WebhookGateway {
        &self.gateway
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Keep the foreign-key id set warm. `None` without a relation.
    pub fn spawn_fk_refresh(&self) -> Option<JoinHandle<()>> {
        self.coordinator.config().relation.as_ref()?;
        let period = Duration::from_secs(self.coordinator.config().fk_refresh_secs.max(1));
        let coordinator = Arc::clone(&self.coordinator);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.refresh_foreign_keys().await {
                    warn!(error = %e, "Periodic foreign-key refresh failed");
                }
            }
        }))
    }
}
