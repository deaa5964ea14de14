use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

pub mod memory;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

/// Hygiene bound on explicit offline markers. Absence already means offline,
/// so letting the negative record expire never changes an answer.
const OFFLINE_TTL_SECONDS: i64 = 3600;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "online",
            PresenceState::Offline => "offline",
        }
    }
}

impl FromStr for PresenceState {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(PresenceState::Online),
            "offline" => Ok(PresenceState::Offline),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub peer: i64,
    pub state: PresenceState,
    pub expires_at: DateTime<Utc>,
}

/// One durably queued payload awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// Durable store-and-forward queue keyed by recipient.
///
/// `store` is append-only and never deduplicates; callers retrying a write
/// produce distinct rows (at-least-once semantics). Delivery marking is
/// monotonic and timestamps each row exactly once.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn store(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError>;

    /// Inserts a row already marked delivered, for payloads that reached the
    /// recipient out-of-band and are stored for history only.
    async fn store_delivered(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError>;

    /// Undelivered rows for a recipient, oldest first by row id.
    async fn fetch_undelivered(
        &self,
        recipient: i64,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        self.fetch_undelivered_after(recipient, 0, limit).await
    }

    /// Same scan resuming past a row id. Cursor for drains that filter rows
    /// and must page beyond the first window.
    async fn fetch_undelivered_after(
        &self,
        recipient: i64,
        after: i64,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StorageError>;

    /// Idempotent: already-delivered ids are skipped, an empty set is a
    /// zero no-op. Returns the number of rows newly marked.
    async fn mark_delivered(&self, ids: &[i64]) -> Result<u64, StorageError>;

    /// Scoped to the recipient; ids owned by another recipient are silently
    /// excluded from the update and the count.
    async fn mark_read(&self, recipient: i64, ids: &[i64]) -> Result<u64, StorageError>;

    /// Deletes delivered rows older than the retention window.
    async fn purge_delivered(&self, retention: Duration) -> Result<u64, StorageError>;
}

/// Expiring presence hints shared outside the process. Informational only;
/// delivery decisions always consult the in-process connection registry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, peer: i64, ttl_seconds: i64) -> Result<(), StorageError>;
    async fn set_offline(&self, peer: i64) -> Result<(), StorageError>;
    async fn is_online(&self, peer: i64) -> Result<bool, StorageError>;
}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

/// Establishes connectivity to PostgreSQL and Redis backends.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        _pg_task: task,
        redis: Arc::new(Mutex::new(redis_connection)),
    })
}

fn presence_key(peer: i64) -> String {
    format!("presence:{}", peer)
}

fn queued_message(row: &Row) -> QueuedMessage {
    QueuedMessage {
        id: row.get(0),
        sender_id: row.get(1),
        recipient_id: row.get(2),
        content: row.get(3),
        created_at: row.get(4),
        delivered: row.get(5),
        delivered_at: row.get(6),
        is_read: row.get(7),
        read_at: row.get(8),
    }
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Publishes a presence record into Redis with the given expiry.
    async fn publish_presence(
        &self,
        peer: i64,
        state: PresenceState,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let ttl = ttl_seconds.max(1) as usize;
        let expires_at = Utc::now() + Duration::seconds(ttl as i64);
        let payload = serde_json::json!({
            "peer": peer,
            "state": state.as_str(),
            "expires_at": expires_at.to_rfc3339(),
        })
        .to_string();
        redis::cmd("SETEX")
            .arg(presence_key(peer))
            .arg(ttl)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Reads the raw presence record for a peer if one has not expired.
    pub async fn read_presence(&self, peer: i64) -> Result<Option<PresenceSnapshot>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(peer))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let Some(json) = value else {
            return Ok(None);
        };
        let parsed: Value = serde_json::from_str(&json).map_err(|_| StorageError::Serialization)?;
        let state = parsed
            .get("state")
            .and_then(|v| v.as_str())
            .ok_or(StorageError::Serialization)?;
        let state = PresenceState::from_str(state)?;
        let expires = parsed
            .get("expires_at")
            .and_then(|v| v.as_str())
            .ok_or(StorageError::Serialization)?;
        let expires_at = DateTime::parse_from_rfc3339(expires)
            .map_err(|_| StorageError::Serialization)?
            .with_timezone(&Utc);
        Ok(Some(PresenceSnapshot {
            peer,
            state,
            expires_at,
        }))
    }

    async fn insert_message(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
        delivered: bool,
    ) -> Result<QueuedMessage, StorageError> {
        let now = Utc::now();
        let delivered_at = delivered.then_some(now);
        let row = self
            .client
            .query_one(
                "INSERT INTO relay_message (sender_id, recipient_id, content, created_at, delivered, delivered_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, sender_id, recipient_id, content, created_at, delivered, delivered_at, is_read, read_at",
                &[&sender, &recipient, &content, &now, &delivered, &delivered_at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(queued_message(&row))
    }
}

#[async_trait]
impl Mailbox for Storage {
    async fn store(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError> {
        self.insert_message(sender, recipient, content, false).await
    }

    async fn store_delivered(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError> {
        self.insert_message(sender, recipient, content, true).await
    }

    async fn fetch_undelivered_after(
        &self,
        recipient: i64,
        after: i64,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT id, sender_id, recipient_id, content, created_at, delivered, delivered_at, is_read, read_at
                FROM relay_message
                WHERE recipient_id = $1 AND id > $2 AND NOT delivered
                ORDER BY id ASC
                LIMIT $3",
                &[&recipient, &after, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(queued_message).collect())
    }

    async fn mark_delivered(&self, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        let now = Utc::now();
        self.client
            .execute(
                "UPDATE relay_message SET delivered = TRUE, delivered_at = $2
                WHERE id = ANY($1) AND NOT delivered",
                &[&ids, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)
    }

    async fn mark_read(&self, recipient: i64, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        let now = Utc::now();
        self.client
            .execute(
                "UPDATE relay_message SET is_read = TRUE, read_at = $3
                WHERE id = ANY($1) AND recipient_id = $2 AND NOT is_read",
                &[&ids, &recipient, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)
    }

    async fn purge_delivered(&self, retention: Duration) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - retention;
        self.client
            .execute(
                "DELETE FROM relay_message WHERE delivered AND delivered_at <= $1",
                &[&cutoff],
            )
            .await
            .map_err(|_| StorageError::Postgres)
    }
}

#[async_trait]
impl PresenceStore for Storage {
    async fn set_online(&self, peer: i64, ttl_seconds: i64) -> Result<(), StorageError> {
        self.publish_presence(peer, PresenceState::Online, ttl_seconds)
            .await
    }

    async fn set_offline(&self, peer: i64) -> Result<(), StorageError> {
        self.publish_presence(peer, PresenceState::Offline, OFFLINE_TTL_SECONDS)
            .await
    }

    async fn is_online(&self, peer: i64) -> Result<bool, StorageError> {
        let snapshot = self.read_presence(peer).await?;
        Ok(snapshot
            .map(|s| s.state == PresenceState::Online && s.expires_at > Utc::now())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_relay_message() {
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS relay_message"));
        assert!(INIT_SQL.contains("relay_message_undelivered_idx"));
        assert!(INIT_SQL.contains("WHERE NOT delivered"));
    }

    #[test]
    fn presence_key_is_namespaced() {
        assert_eq!(presence_key(42), "presence:42");
    }

    #[test]
    fn presence_state_roundtrip() {
        assert_eq!(PresenceState::Online.as_str(), "online");
        assert_eq!(
            PresenceState::from_str("offline").unwrap(),
            PresenceState::Offline
        );
        assert!(PresenceState::from_str("away").is_err());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("SOTTO_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SOTTO_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis = match std::env::var("SOTTO_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SOTTO_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = connect(&pg, &redis).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let sender = suffix;
        let recipient = suffix + 1;

        let first = storage.store(sender, recipient, b"first").await?;
        let second = storage.store(sender, recipient, b"second").await?;
        assert!(first.id < second.id);
        assert!(!first.delivered);

        let pending = storage.fetch_undelivered(recipient, 128).await?;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].content, b"first");
        assert_eq!(pending[1].content, b"second");

        let tail = storage
            .fetch_undelivered_after(recipient, first.id, 128)
            .await?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, b"second");

        let marked = storage.mark_delivered(&[first.id, second.id]).await?;
        assert_eq!(marked, 2);
        let again = storage.mark_delivered(&[first.id, second.id]).await?;
        assert_eq!(again, 0);
        assert!(storage.fetch_undelivered(recipient, 128).await?.is_empty());

        let read = storage.mark_read(recipient, &[first.id]).await?;
        assert_eq!(read, 1);
        let foreign = storage.mark_read(recipient + 99, &[second.id]).await?;
        assert_eq!(foreign, 0);

        let archived = storage.store_delivered(sender, recipient, b"history").await?;
        assert!(archived.delivered);
        assert!(archived.delivered_at.is_some());
        assert!(storage.fetch_undelivered(recipient, 128).await?.is_empty());

        let purged = storage.purge_delivered(Duration::zero()).await?;
        assert!(purged >= 3);

        storage.set_online(recipient, 60).await?;
        assert!(storage.is_online(recipient).await?);
        let snapshot = storage.read_presence(recipient).await?.expect("presence");
        assert_eq!(snapshot.state, PresenceState::Online);
        storage.set_offline(recipient).await?;
        assert!(!storage.is_online(recipient).await?);
        storage.readiness().await?;
        Ok(())
    }
}
