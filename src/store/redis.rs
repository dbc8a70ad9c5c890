//! Redis sorted-set adapter.
//!
//! ZADD / ZRANGE / ZREM / ZCARD through a `ConnectionManager`, which
//! reconnects on its own after a dropped connection. The atomic pop is a
//! Lua script so the read and the remove run as one server-side step.

use super::{OrderedStore, StoreConnector};
use crate::config::secrets::{ExposeSecret, SecretString, redacted_url};
use crate::error::Result;
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

mod scripts {
    use ::redis::Script;

    /// ZRANGE 0 0 then ZREM, atomically. Returns nil on an empty set.
    pub fn pop_min() -> Script {
        Script::new(
            r#"
            local members = redis.call('ZRANGE', KEYS[1], 0, 0)
            if #members == 0 then
                return false
            end
            redis.call('ZREM', KEYS[1], members[1])
            return members[1]
            "#,
        )
    }
}

/// One Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis. Fails if the server cannot be reached.
    pub async fn connect(url: &SecretString) -> Result<Self> {
        let client = ::redis::Client::open(url.expose_secret())?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %redacted_url(url), "connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl OrderedStore for RedisStore {
    async fn add(&self, collection: &str, member: &str, score: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.zadd(collection, member, score).await?;
        Ok(added > 0)
    }

    async fn range_by_rank(
        &self,
        collection: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(collection, start, stop).await?)
    }

    async fn remove(&self, collection: &str, member: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zrem(collection, member).await?)
    }

    async fn cardinality(&self, collection: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(collection).await?)
    }

    async fn pop_min(&self, collection: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let member: Option<String> = scripts::pop_min()
            .key(collection)
            .invoke_async(&mut conn)
            .await?;
        debug!(collection, hit = member.is_some(), "atomic pop");
        Ok(member)
    }
}

/// Opens a fresh [`RedisStore`] per `connect` call.
pub struct RedisConnector {
    url: SecretString,
}

impl RedisConnector {
    pub fn new(url: SecretString) -> Self {
        Self { url }
    }
}

impl fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnector")
            .field("url", &redacted_url(&self.url))
            .finish()
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn OrderedStore>> {
        Ok(Arc::new(RedisStore::connect(&self.url).await?))
    }

    fn describe(&self) -> String {
        redacted_url(&self.url)
    }
}
