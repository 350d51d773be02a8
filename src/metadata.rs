use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use redis::aio::ConnectionManager;

use crate::error::Result;
use crate::protocol::StartRequest;

/// Descriptive and liveness data for one channel, stored as a hash keyed by
/// the channel identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    pub channel_name: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub active: bool,
    pub viewers: u64,
    pub last_active: DateTime<Utc>,
}

impl StreamMetadata {
    /// Record for a stream that is going live now.
    pub fn starting(request: &StartRequest, now: DateTime<Utc>) -> Self {
        StreamMetadata {
            channel_name: request.channel_name.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            tags: request.tags.clone(),
            created_at: request.created_at.unwrap_or(now),
            started_at: now,
            active: true,
            viewers: 0,
            last_active: now,
        }
    }

    /// Hash fields in store order.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("channelName", self.channel_name.clone()),
            ("title", self.title.clone()),
            ("description", self.description.clone()),
            ("tags", self.tags.join(",")),
            ("createdAt", timestamp(self.created_at)),
            ("startedAt", timestamp(self.started_at)),
            ("active", flag(self.active)),
            ("viewers", self.viewers.to_string()),
            ("lastActive", timestamp(self.last_active)),
        ]
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// Booleans are stored as "1"/"0", the encoding existing readers of the hash expect.
fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn inactive_fields(now: DateTime<Utc>) -> Vec<(&'static str, String)> {
    vec![("active", flag(false)), ("lastActive", timestamp(now))]
}

/// Remote hash-field store holding per-channel metadata.
///
/// Shared by every session; implementations must be safe for concurrent use
/// and need no locking beyond what the store itself provides.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Writes or merges all fields of `metadata` onto its channel's hash.
    async fn upsert(&self, metadata: &StreamMetadata) -> Result<()>;

    /// Sets `active=0` and `lastActive=now` on the channel's hash.
    async fn mark_inactive(&self, channel: &str, now: DateTime<Utc>) -> Result<()>;

    /// Deletes the channel's hash.
    async fn remove(&self, channel: &str) -> Result<()>;
}

/// Redis-backed store. `ConnectionManager` reconnects on its own and is cheap to clone.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(RedisStore { redis })
    }

    async fn hset(&self, key: &str, fields: &[(&'static str, String)]) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let mut conn = self.redis.clone();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RedisStore {
    async fn upsert(&self, metadata: &StreamMetadata) -> Result<()> {
        self.hset(&metadata.channel_name, &metadata.to_fields()).await?;
        debug!("metadata upserted: channel={}", metadata.channel_name);
        Ok(())
    }

    async fn mark_inactive(&self, channel: &str, now: DateTime<Utc>) -> Result<()> {
        self.hset(channel, &inactive_fields(now)).await?;
        debug!("metadata marked inactive: channel={}", channel);
        Ok(())
    }

    async fn remove(&self, channel: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("DEL").arg(channel).query_async(&mut conn).await?;
        debug!("metadata removed: channel={}", channel);
        Ok(())
    }
}
