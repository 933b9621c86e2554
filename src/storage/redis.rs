//! Redis backend for the shared cache / lock service.
//!
//! Every primitive maps to a single atomic Redis command so the guarantees
//! hold across process instances:
//!
//! | Primitive | Command |
//! |---|---|
//! | `set_nx` | `SET key value NX PX ttl` |
//! | `compare_and_delete` | Lua: `GET` + `DEL` if equal |
//! | `replace_set` | `MULTI; DEL; SADD; PEXPIRE; EXEC` |
//! | `is_member` | `SISMEMBER` |
//!
//! All keys carry the configured prefix (e.g. `sheetsync:lock:products:42`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, Script};

use super::traits::{SharedCache, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisCache {
    connection: ConnectionManager,
    prefix: String,
    release_script: Script,
}

impl RedisCache {
    /// Connect with startup-mode retry (fails fast on bad configuration).
    ///
    /// ```rust,no_run
    /// # use sheet_sync::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCache::connect("redis://localhost", Some("sheetsync:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            release_script: Script::new(COMPARE_AND_DELETE),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

// Calls are single attempts: the tiered cache's circuit breaker and local
// fallback decide what happens on failure, retrying here would only add latency.
#[async_trait]
impl SharedCache for RedisCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(self.prefixed_key(key)).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let mut set = cmd("SET");
        set.arg(self.prefixed_key(key)).arg(value);
        if let Some(ttl) = ttl {
            set.arg("PX").arg(ttl_ms(ttl));
        }
        let _: () = set.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_script
            .key(self.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let mut p = pipe();
        p.atomic().del(&key).ignore();
        if !members.is_empty() {
            p.sadd(&key, members).ignore();
            p.cmd("PEXPIRE").arg(&key).arg(ttl_ms(ttl)).ignore();
        }
        let _: () = p.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        conn.sismember(self.prefixed_key(key), member)
            .await
            .map_err(backend)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}
