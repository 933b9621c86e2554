// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Webhook surface.
//!
//! Framework-agnostic: the embedding HTTP server hands over headers and the
//! raw body and writes back the [`WebhookResponse`]. Each request runs
//!
//! ```text
//! authenticate ─► guard ─► dispatch (registry) ─► response
//!      401        200/429     200 / 400 / 500
//! ```
//!
//! # Authentication
//!
//! With a `webhook_secret` configured, a request passes when either
//! - `x-signature` holds the hex HMAC-SHA256 of the body (optionally prefixed
//!   `sha256=`), or
//! - `x-webhook-secret` equals the secret.
//!
//! The structured webhook always authenticates; the sheet webhook only when
//! `require_sheet_auth` is set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, warn};

use crate::config::SheetSyncConfig;
use crate::coordinator::SyncOutcome;
use crate::error::{DispatchError, SyncError};
use crate::guard::{GuardDecision, IngressGuard};
use crate::record::{EventEnvelope, EventType, Origin};
use crate::registry::{EventClass, HandlerRegistry};
use crate::storage::tiered::TieredCache;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SECRET_HEADER: &str = "x-webhook-secret";

type HmacSha256 = Hmac<Sha256>;

/// Inbound webhook call.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Header names lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
#[must_use]
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Plain-secret check. Both secrets key an HMAC over a fixed message and the
/// tags are compared by `verify_slice`, which is constant time.
fn secret_matches(secret: &str, given: &str) -> bool {
    let tag = |key: &str| {
        HmacSha256::new_from_slice(key.as_bytes()).map(|mut mac| {
            mac.update(SECRET_HEADER.as_bytes());
            mac
        })
    };
    match (tag(secret), tag(given)) {
        (Ok(expected), Ok(mac)) => mac.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

/// Request authenticator for one shared secret.
#[derive(Clone)]
struct WebhookAuth {
    secret: Option<String>,
    require_sheet: bool,
}

impl WebhookAuth {
    fn required_for(&self, origin: Origin) -> bool {
        match origin {
            Origin::Structured => true,
            Origin::Sheet => self.require_sheet,
        }
    }

    fn verify(&self, origin: Origin, request: &WebhookRequest) -> Result<(), SyncError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };
        if !self.required_for(origin) {
            return Ok(());
        }

        if let Some(signature) = request.header(SIGNATURE_HEADER) {
            let signature = signature.trim();
            let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
            let Ok(raw) = hex::decode(signature) else {
                return Err(SyncError::Auth("signature is not hex".into()));
            };
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| SyncError::Auth("unusable secret".into()))?;
            mac.update(&request.body);
            return mac
                .verify_slice(&raw)
                .map_err(|_| SyncError::Auth("signature mismatch".into()));
        }

        match request.header(SECRET_HEADER) {
            Some(given) if secret_matches(secret, given) => Ok(()),
            Some(_) => Err(SyncError::Auth("secret mismatch".into())),
            None => Err(SyncError::Auth("missing signature".into())),
        }
    }
}

/// Both webhooks plus the health check.
pub struct WebhookGateway {
    auth: WebhookAuth,
    guard: IngressGuard,
    registry: HandlerRegistry,
    cache: Arc<TieredCache>,
}

impl WebhookGateway {
    pub fn new(config: &SheetSyncConfig, guard: IngressGuard, registry: HandlerRegistry, cache: Arc<TieredCache>) -> Self {
        Self {
            auth: WebhookAuth {
                secret: config.webhook_secret.clone().filter(|s| !s.is_empty()),
                require_sheet: config.require_sheet_auth,
            },
            guard,
            registry,
            cache,
        }
    }

    #[must_use]
    pub fn guard(&self) -> &IngressGuard {
        &self.guard
    }

    /// Change notification from the structured store.
    pub async fn structured_webhook(&self, request: WebhookRequest) -> WebhookResponse {
        self.handle(Origin::Structured, request).await
    }

    /// Edit notification from the sheet.
    pub async fn sheet_webhook(&self, request: WebhookRequest) -> WebhookResponse {
        self.handle(Origin::Sheet, request).await
    }

    /// `200 {"status":"ok","cache":"connected"}`, or 503 while the shared
    /// cache is unreachable. Without a shared cache the process-local tier
    /// is reported as `"local"`.
    pub async fn health(&self) -> WebhookResponse {
        if !self.cache.has_primary() {
            return WebhookResponse::new(200, json!({"status": "ok", "cache": "local"}).to_string());
        }
        if self.cache.ping().await {
            WebhookResponse::new(200, json!({"status": "ok", "cache": "connected"}).to_string())
        } else {
            WebhookResponse::new(503, json!({"status": "degraded", "cache": "disconnected"}).to_string())
        }
    }

    #[tracing::instrument(skip(self, request), fields(origin = %origin))]
    async fn handle(&self, origin: Origin, request: WebhookRequest) -> WebhookResponse {
        let started = Instant::now();
        let response = self.respond(origin, request).await;
        crate::metrics::record_webhook_response(origin.as_str(), response.status);
        crate::metrics::record_webhook_latency(origin.as_str(), started.elapsed());
        response
    }

    async fn respond(&self, origin: Origin, request: WebhookRequest) -> WebhookResponse {
        if let Err(e) = self.auth.verify(origin, &request) {
            warn!(error = %e, "Webhook rejected");
            return WebhookResponse::new(e.status_code(), "Unauthorized");
        }

        let envelope = envelope_for(origin, request);
        match self.guard.check(&envelope).await {
            GuardDecision::Accept => {}
            GuardDecision::AlreadyProcessed | GuardDecision::Duplicate => {
                debug!("Duplicate delivery suppressed");
                return WebhookResponse::new(200, SyncOutcome::Duplicate.response_text(origin));
            }
            GuardDecision::RateLimited { retry_after } => {
                return WebhookResponse::new(
                    429,
                    format!("Rate limited, retry after {}s", retry_after.as_secs().max(1)),
                );
            }
        }

        match self.registry.dispatch(EventClass::for_origin(origin)).call(envelope).await {
            Ok(outcome) => WebhookResponse::new(200, outcome.response_text(origin)),
            Err(DispatchError::Handler(e)) => match e {
                SyncError::Storage(_) => WebhookResponse::new(e.status_code(), "Internal error"),
                other => WebhookResponse::new(other.status_code(), other.to_string()),
            },
            Err(e @ DispatchError::NoHandler(_)) => {
                error!(error = %e, "Webhook has no handler");
                WebhookResponse::new(503, "No handler")
            }
        }
    }
}

/// Build the envelope. The structured body carries its change type.
fn envelope_for(origin: Origin, request: WebhookRequest) -> EventEnvelope {
    let event_type = match origin {
        Origin::Structured => serde_json::from_slice::<Value>(&request.body)
            .ok()
            .and_then(|v| v.get("type").and_then(Value::as_str).and_then(EventType::parse))
            .unwrap_or(EventType::Update),
        Origin::Sheet => EventType::Update,
    };
    let mut envelope = EventEnvelope::new(origin, event_type, request.body);
    envelope.headers = request.headers;
    envelope
}
