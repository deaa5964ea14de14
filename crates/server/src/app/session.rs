use crate::app::router::Delivery;
use crate::app::{AppState, RelayError};
use crate::transport::SessionChannel;
use crate::util::{encode_hex, generate_id};
use chrono::Utc;
use sotto_proto::{
    decode_client, encode_server, ClientEnvelope, DeliveryReceipt, PendingBatch, PendingItem,
    PresenceStatus, PresenceUpdate, ServerEnvelope, SignalBody, MAX_ENVELOPE_LEN,
};
use sotto_storage::QueuedMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Grace period for the first frame. A transport that has not authenticated
/// within it is answered and closed.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// What the loop does after one inbound frame.
enum Step {
    Continue,
    Reply(ServerEnvelope),
    Close,
}

/// Drives one transport through `Unauthenticated -> Authenticated -> Closed`.
///
/// The first frame must be `connect`; everything after authentication is
/// multiplexed in a single select loop so one slow storage call for this
/// session never stalls other transports. The bounded outbound channel only
/// carries pushes from other tasks; the session's own replies and the
/// mailbox flush are written straight to the transport.
pub async fn run(
    state: Arc<AppState>,
    mut channel: SessionChannel,
    mut shutdown: watch::Receiver<bool>,
) {
    let first = match timeout(AUTH_DEADLINE, channel.read_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            channel.finish().await;
            return;
        }
        Ok(Err(err)) => {
            debug!(error = %err, "transport failed before authentication");
            channel.finish().await;
            return;
        }
        Err(_) => {
            send_direct(
                &mut channel,
                ServerEnvelope::error("auth_required", "authentication deadline elapsed"),
            )
            .await;
            channel.finish().await;
            return;
        }
    };
    let token = match decode_client(&first) {
        Ok(ClientEnvelope::Connect { token }) => token,
        Ok(_) => {
            send_direct(
                &mut channel,
                ServerEnvelope::error("auth_required", "first frame must be connect"),
            )
            .await;
            channel.finish().await;
            return;
        }
        Err(err) => {
            send_direct(
                &mut channel,
                ServerEnvelope::error("malformed_frame", err.to_string()),
            )
            .await;
            channel.finish().await;
            return;
        }
    };
    let Some(peer) = state.authorizer.authorize(&token).await else {
        let rejected = RelayError::Auth;
        send_direct(
            &mut channel,
            ServerEnvelope::error(rejected.code(), rejected.to_string()),
        )
        .await;
        channel.finish().await;
        return;
    };

    let session_id = generate_id(&peer.to_string());
    let (tx_out, mut rx_out) = mpsc::channel::<ServerEnvelope>(state.channel_capacity);
    let connection_id = state
        .registry
        .register(peer, tx_out, session_id.clone())
        .await;
    state.metrics.incr_connections();
    let active = state.registry.len().await;
    info!(peer, session = %session_id, active, "peer connected");

    if let Err(err) = state.presence.set_online(peer, state.presence_ttl_seconds).await {
        warn!(peer, error = %err, "presence publish failed");
    }
    let connected = ServerEnvelope::Connected {
        peer_id: peer,
        session: session_id.clone(),
    };
    if deliver(&state, &mut channel, &connected, peer).await {
        broadcast_presence(&state, peer, PresenceStatus::Online).await;
        if let Err(err) = flush_mailbox(&state, peer, &mut channel).await {
            warn!(peer, error = %err, "mailbox flush failed");
        }

        loop {
            tokio::select! {
                envelope = rx_out.recv() => {
                    let Some(envelope) = envelope else { break };
                    if !deliver(&state, &mut channel, &envelope, peer).await {
                        break;
                    }
                }
                frame = channel.read_frame() => {
                    match frame {
                        Ok(Some(text)) => {
                            state.metrics.mark_ingress();
                            match dispatch(&state, peer, &text).await {
                                Step::Reply(reply) => {
                                    if !deliver(&state, &mut channel, &reply, peer).await {
                                        break;
                                    }
                                }
                                Step::Close => break,
                                Step::Continue => {}
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(peer, error = %err, "transport read failed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // Unregister before the presence write so no window reports a peer
    // online without a live transport behind it.
    let owned = state.registry.unregister(connection_id).await;
    state.metrics.decr_connections();
    if let Some(peer) = owned {
        if let Err(err) = state.presence.set_offline(peer).await {
            warn!(peer, error = %err, "presence cleanup failed");
        }
        broadcast_presence(&state, peer, PresenceStatus::Offline).await;
        info!(peer, session = %session_id, "peer disconnected");
    }
    channel.finish().await;
}

/// Type-dispatch for one authenticated inbound frame. Replies go back to the
/// loop and are written in request order, never queued behind the outbound
/// channel.
async fn dispatch(state: &AppState, peer: i64, text: &str) -> Step {
    let envelope = match decode_client(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Step::Reply(ServerEnvelope::error("malformed_frame", err.to_string()));
        }
    };
    match envelope {
        ClientEnvelope::Connect { .. } => Step::Reply(ServerEnvelope::error(
            "already_connected",
            "session is already authenticated",
        )),
        ClientEnvelope::Disconnect => Step::Close,
        ClientEnvelope::Signal {
            recipient_id,
            payload,
        } => {
            let outcome = state.router.relay_signal(peer, recipient_id, payload).await;
            report(recipient_id, outcome, true)
        }
        ClientEnvelope::Message {
            recipient_id,
            payload,
        } => {
            let outcome = state.router.relay_message(peer, recipient_id, payload).await;
            report(recipient_id, outcome, false)
        }
    }
}

/// Explicit outcome envelope per send. Live chat is the one exception: the
/// router already pushed the delivered receipt to this sender's transport.
fn report(recipient: i64, outcome: Result<Delivery, RelayError>, receipt_on_live: bool) -> Step {
    let envelope = match outcome {
        Ok(Delivery::Delivered) => {
            if !receipt_on_live {
                return Step::Continue;
            }
            ServerEnvelope::Delivered {
                payload: DeliveryReceipt {
                    recipient,
                    delivered: true,
                    message_id: None,
                    timestamp: Utc::now(),
                },
            }
        }
        Ok(Delivery::Queued(id)) => ServerEnvelope::Delivered {
            payload: DeliveryReceipt {
                recipient,
                delivered: false,
                message_id: Some(id),
                timestamp: Utc::now(),
            },
        },
        Err(err) => ServerEnvelope::error(err.code(), err.to_string()),
    };
    Step::Reply(envelope)
}

/// Encodes and writes one envelope. A codec refusal drops the envelope and
/// keeps the session; a transport failure ends it.
async fn deliver(
    state: &AppState,
    channel: &mut SessionChannel,
    envelope: &ServerEnvelope,
    peer: i64,
) -> bool {
    match encode_server(envelope) {
        Ok(text) => {
            if channel.write_frame(&text).await.is_err() {
                return false;
            }
            state.metrics.mark_egress();
            true
        }
        Err(err) => {
            warn!(peer, error = %err, "outbound envelope dropped");
            true
        }
    }
}

/// Post-connect drain: fetch undelivered rows and write them as `pending`
/// bundles sized under the frame bound, marking each bundle's rows delivered
/// only after its frame is written. An interrupted flush leaves the
/// remainder queued for the next connect.
async fn flush_mailbox(
    state: &AppState,
    peer: i64,
    channel: &mut SessionChannel,
) -> Result<(), RelayError> {
    let rows = state
        .mailbox
        .fetch_undelivered(peer, state.flush_limit)
        .await?;
    if rows.is_empty() {
        return Ok(());
    }
    let overhead = encode_server(&ServerEnvelope::Pending {
        payload: PendingBatch {
            messages: Vec::new(),
        },
    })?
    .len();
    let mut items: Vec<PendingItem> = Vec::new();
    let mut ids: Vec<i64> = Vec::new();
    let mut bundled = overhead;
    for row in rows {
        let id = row.id;
        let item = pending_item(row);
        // One byte of separator headroom per item.
        let needed = serde_json::to_string(&item)
            .map_err(|_| RelayError::Codec)?
            .len()
            + 1;
        if !items.is_empty() && bundled + needed > MAX_ENVELOPE_LEN {
            write_bundle(state, peer, channel, &mut items, &mut ids).await?;
            bundled = overhead;
        }
        if bundled + needed > MAX_ENVELOPE_LEN {
            // A row too large for any frame stays queued; the poll drains
            // carry no frame bound.
            warn!(peer, id, "queued row exceeds the frame bound");
            continue;
        }
        bundled += needed;
        items.push(item);
        ids.push(id);
    }
    if !items.is_empty() {
        write_bundle(state, peer, channel, &mut items, &mut ids).await?;
    }
    Ok(())
}

/// Writes one bundle and, once the frame is out, marks its rows delivered.
async fn write_bundle(
    state: &AppState,
    peer: i64,
    channel: &mut SessionChannel,
    items: &mut Vec<PendingItem>,
    ids: &mut Vec<i64>,
) -> Result<(), RelayError> {
    let batch = ServerEnvelope::Pending {
        payload: PendingBatch {
            messages: std::mem::take(items),
        },
    };
    let text = encode_server(&batch)?;
    channel.write_frame(&text).await?;
    state.metrics.mark_egress();
    let flushed = std::mem::take(ids);
    let count = state.mailbox.mark_delivered(&flushed).await?;
    state.metrics.mark_flushed(count);
    debug!(peer, count, "mailbox bundle flushed");
    Ok(())
}

/// Converts one stored row into its wire item. Signal-shaped content keeps
/// its parsed form; chat content rides verbatim when it is UTF-8 and
/// hex-armored when it is not.
fn pending_item(row: QueuedMessage) -> PendingItem {
    if let Some(signal) = SignalBody::parse(&row.content) {
        return PendingItem::Signal {
            id: row.id,
            sender: row.sender_id,
            signal_type: signal.signal_type,
            data: signal.data,
            timestamp: row.created_at,
        };
    }
    let (encrypted_content, binary) = match String::from_utf8(row.content) {
        Ok(text) => (text, false),
        Err(raw) => (encode_hex(raw.as_bytes()), true),
    };
    PendingItem::Message {
        id: row.id,
        sender: row.sender_id,
        encrypted_content,
        binary,
        timestamp: row.created_at,
    }
}

/// Presence fan-out to every other registered peer. Best-effort: a full or
/// closing transport just misses the update.
async fn broadcast_presence(state: &AppState, peer: i64, status: PresenceStatus) {
    let update = ServerEnvelope::Presence {
        payload: PresenceUpdate { peer, status },
    };
    for (other, transport) in state.registry.snapshot().await {
        if other == peer {
            continue;
        }
        let _ = transport.try_send(update.clone());
    }
}

async fn send_direct(channel: &mut SessionChannel, envelope: ServerEnvelope) {
    if let Ok(text) = encode_server(&envelope) {
        let _ = channel.write_frame(&text).await;
    }
}
