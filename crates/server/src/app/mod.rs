pub mod auth;
pub mod maintenance;
pub mod registry;
pub mod router;
pub mod session;

use crate::config::{ServerConfig, StorageDriver};
use crate::metrics::Metrics;
use auth::{ConnectAuthorizer, KeyedTokenAuthorizer};
use chrono::{DateTime, Utc};
use registry::ConnectionRegistry;
use router::{Delivery, Router};
use serde_json::Value;
use sotto_proto::{CodecError, SignalBody, SignalKind};
use sotto_storage::memory::{MemoryMailbox, MemoryPresence};
use sotto_storage::{Mailbox, PresenceStore, QueuedMessage, Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub enum RelayError {
    Auth,
    Codec,
    Unreachable,
    Storage,
    Invalid,
    Io,
}

impl RelayError {
    /// Wire code carried by error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth => "auth_failed",
            Self::Codec => "malformed_frame",
            Self::Unreachable => "unreachable",
            Self::Storage => "storage",
            Self::Invalid => "invalid",
            Self::Io => "io",
        }
    }
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "authentication rejected"),
            Self::Codec => write!(f, "malformed frame"),
            Self::Unreachable => write!(f, "recipient unreachable"),
            Self::Storage => write!(f, "storage failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "transport io failure"),
        }
    }
}

impl Error for RelayError {}

impl From<StorageError> for RelayError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}

impl From<CodecError> for RelayError {
    fn from(_: CodecError) -> Self {
        Self::Codec
    }
}

/// Shared state behind every session, router dispatch and maintenance tick.
///
/// The registry is authoritative for delivery decisions; the presence store
/// is the externally visible hint and never consulted for routing.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Router,
    pub mailbox: Arc<dyn Mailbox>,
    pub presence: Arc<dyn PresenceStore>,
    pub authorizer: Arc<dyn ConnectAuthorizer>,
    pub metrics: Arc<Metrics>,
    pub probe: Option<Arc<Storage>>,
    pub presence_ttl_seconds: i64,
    pub heartbeat_interval_seconds: u64,
    pub retention_days: i64,
    pub purge_interval_seconds: u64,
    pub flush_limit: i64,
    pub channel_capacity: usize,
}

/// One drained signal row, ready for the HTTP-facing response shape.
pub struct PendingSignal {
    pub id: i64,
    pub sender: i64,
    pub kind: SignalKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Handle the embedding layer holds on the delivery core.
#[derive(Clone)]
pub struct SottoApp {
    pub state: Arc<AppState>,
}

impl SottoApp {
    pub async fn init(config: &ServerConfig) -> Result<Self, RelayError> {
        let (mailbox, presence, probe): (
            Arc<dyn Mailbox>,
            Arc<dyn PresenceStore>,
            Option<Arc<Storage>>,
        ) = match config.storage_driver {
            StorageDriver::Postgres => {
                let dsn = config.postgres_dsn.as_deref().ok_or(RelayError::Invalid)?;
                let redis_url = config.redis_url.as_deref().ok_or(RelayError::Invalid)?;
                let storage = Arc::new(sotto_storage::connect(dsn, redis_url).await?);
                storage.migrate().await?;
                info!("postgres mailbox ready");
                (
                    Arc::clone(&storage) as Arc<dyn Mailbox>,
                    Arc::clone(&storage) as Arc<dyn PresenceStore>,
                    Some(storage),
                )
            }
            StorageDriver::Memory => {
                info!("memory storage driver active; nothing survives a restart");
                (
                    Arc::new(MemoryMailbox::new()),
                    Arc::new(MemoryPresence::new()),
                    None,
                )
            }
        };
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&mailbox),
            Arc::clone(&metrics),
        );
        let authorizer: Arc<dyn ConnectAuthorizer> =
            Arc::new(KeyedTokenAuthorizer::new(config.auth_secret));
        Ok(Self {
            state: Arc::new(AppState {
                registry,
                router,
                mailbox,
                presence,
                authorizer,
                metrics,
                probe,
                presence_ttl_seconds: config.presence_ttl_seconds,
                heartbeat_interval_seconds: config.heartbeat_interval_seconds,
                retention_days: config.retention_days,
                purge_interval_seconds: config.purge_interval_seconds,
                flush_limit: config.flush_limit,
                channel_capacity: config.channel_capacity,
            }),
        })
    }

    /// Live-or-queued signal send for the HTTP-facing path. A candidate to an
    /// offline recipient is a terminal unreachable error for that send.
    pub async fn send_signal(
        &self,
        sender: i64,
        recipient: i64,
        kind: SignalKind,
        data: Value,
    ) -> Result<Delivery, RelayError> {
        self.state
            .router
            .relay_signal(
                sender,
                recipient,
                SignalBody {
                    signal_type: kind,
                    data,
                },
            )
            .await
    }

    /// Drains and marks delivered every queued row whose content is
    /// signal-shaped for this user, paging past chat rows so a deep chat
    /// backlog cannot hide a queued signal. Chat rows stay queued.
    pub async fn pending_signals(&self, user: i64) -> Result<Vec<PendingSignal>, RelayError> {
        let limit = self.state.flush_limit;
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut drained = Vec::new();
        let mut ids = Vec::new();
        let mut cursor = 0;
        'scan: loop {
            let rows = self
                .state
                .mailbox
                .fetch_undelivered_after(user, cursor, limit)
                .await?;
            let window = rows.len() as i64;
            for row in rows {
                cursor = row.id;
                let Some(body) = SignalBody::parse(&row.content) else {
                    continue;
                };
                ids.push(row.id);
                drained.push(PendingSignal {
                    id: row.id,
                    sender: row.sender_id,
                    kind: body.signal_type,
                    data: body.data,
                    timestamp: row.created_at,
                });
                if drained.len() as i64 >= limit {
                    break 'scan;
                }
            }
            // A short window means the scan reached the end of the queue.
            if window < limit {
                break;
            }
        }
        if !ids.is_empty() {
            let count = self.state.mailbox.mark_delivered(&ids).await?;
            self.state.metrics.mark_flushed(count);
        }
        Ok(drained)
    }

    /// Stores a chat payload without attempting live delivery.
    pub async fn store_message(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<i64, RelayError> {
        let row = self.state.mailbox.store(sender, recipient, content).await?;
        self.state.metrics.mark_queued();
        Ok(row.id)
    }

    /// Variant for payloads that already reached the recipient out-of-band:
    /// the row is born delivered and only its read state remains open.
    pub async fn store_received_message(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<i64, RelayError> {
        let row = self
            .state
            .mailbox
            .store_delivered(sender, recipient, content)
            .await?;
        Ok(row.id)
    }

    /// Fetch plus mark-delivered, combined.
    pub async fn offline_messages(&self, user: i64) -> Result<Vec<QueuedMessage>, RelayError> {
        let rows = self
            .state
            .mailbox
            .fetch_undelivered(user, self.state.flush_limit)
            .await?;
        if rows.is_empty() {
            return Ok(rows);
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let count = self.state.mailbox.mark_delivered(&ids).await?;
        self.state.metrics.mark_flushed(count);
        Ok(rows)
    }

    pub async fn mark_messages_read(&self, user: i64, ids: &[i64]) -> Result<u64, RelayError> {
        Ok(self.state.mailbox.mark_read(user, ids).await?)
    }

    /// Informational presence hint; delivery decisions use the registry.
    pub async fn peer_online(&self, peer: i64) -> Result<bool, RelayError> {
        Ok(self.state.presence.is_online(peer).await?)
    }

    /// Probes the storage backends for the collaborator's health route. The
    /// memory driver is always ready.
    pub async fn readiness(&self) -> Result<(), RelayError> {
        match &self.state.probe {
            Some(storage) => Ok(storage.readiness().await?),
            None => Ok(()),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.state.metrics
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let registry = Arc::new(ConnectionRegistry::new());
    let mailbox: Arc<dyn Mailbox> = Arc::new(MemoryMailbox::new());
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    let metrics = Arc::new(Metrics::new());
    let router = Router::new(
        Arc::clone(&registry),
        Arc::clone(&mailbox),
        Arc::clone(&metrics),
    );
    let mut authorizer = auth::StaticAuthorizer::new();
    authorizer.insert("token-1", 1);
    authorizer.insert("token-2", 2);
    authorizer.insert("token-3", 3);
    AppState {
        registry,
        router,
        mailbox,
        presence,
        authorizer: Arc::new(authorizer),
        metrics,
        probe: None,
        presence_ttl_seconds: 60,
        heartbeat_interval_seconds: 30,
        retention_days: 30,
        purge_interval_seconds: 3600,
        flush_limit: 128,
        channel_capacity: 16,
    }
}
