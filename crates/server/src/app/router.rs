use crate::app::registry::ConnectionRegistry;
use crate::app::RelayError;
use crate::metrics::Metrics;
use chrono::Utc;
use sotto_proto::{
    encode_server, DeliveryReceipt, MessageBody, MessageDelivery, ServerEnvelope, SignalBody,
    SignalDelivery,
};
use sotto_storage::Mailbox;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one routed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued(i64),
}

/// Live-vs-queued decision per outbound unit. Registry hits push straight to
/// the resident transport; misses and lost races persist through the mailbox.
/// Candidate signals are the exception: stale negotiation data is unusable,
/// so an unreachable recipient is reported instead of queued.
#[derive(Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    mailbox: Arc<dyn Mailbox>,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        mailbox: Arc<dyn Mailbox>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            mailbox,
            metrics,
        }
    }

    pub async fn relay_signal(
        &self,
        sender: i64,
        recipient: i64,
        body: SignalBody,
    ) -> Result<Delivery, RelayError> {
        if let Some(transport) = self.registry.lookup(recipient).await {
            let envelope = ServerEnvelope::Signal {
                payload: SignalDelivery {
                    sender,
                    signal_type: body.signal_type,
                    data: body.data.clone(),
                    timestamp: Utc::now(),
                },
            };
            // An envelope the codec refuses to frame is a miss, not a
            // delivery.
            if encode_server(&envelope).is_ok() && transport.try_send(envelope).is_ok() {
                return Ok(Delivery::Delivered);
            }
            debug!(recipient, "live signal push missed");
        }
        if body.signal_type.is_ephemeral() {
            return Err(RelayError::Unreachable);
        }
        let row = self
            .mailbox
            .store(sender, recipient, &body.to_content()?)
            .await?;
        self.metrics.mark_queued();
        Ok(Delivery::Queued(row.id))
    }

    pub async fn relay_message(
        &self,
        sender: i64,
        recipient: i64,
        body: MessageBody,
    ) -> Result<Delivery, RelayError> {
        if let Some(transport) = self.registry.lookup(recipient).await {
            let envelope = ServerEnvelope::Message {
                payload: MessageDelivery {
                    sender,
                    encrypted_content: body.encrypted_content.clone(),
                    timestamp: Utc::now(),
                },
            };
            // The delivered receipt must never precede a frame the codec
            // would refuse to emit.
            if encode_server(&envelope).is_ok() && transport.try_send(envelope).is_ok() {
                self.acknowledge(sender, recipient).await;
                return Ok(Delivery::Delivered);
            }
            debug!(recipient, "live message push missed");
        }
        let row = self
            .mailbox
            .store(sender, recipient, body.encrypted_content.as_bytes())
            .await?;
        self.metrics.mark_queued();
        Ok(Delivery::Queued(row.id))
    }

    /// Delivery receipt back to the sender's own transport, when registered,
    /// so a client can mark the message delivered without polling.
    async fn acknowledge(&self, sender: i64, recipient: i64) {
        if let Some(transport) = self.registry.lookup(sender).await {
            let receipt = ServerEnvelope::Delivered {
                payload: DeliveryReceipt {
                    recipient,
                    delivered: true,
                    message_id: None,
                    timestamp: Utc::now(),
                },
            };
            let _ = transport.try_send(receipt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sotto_proto::{SignalKind, MAX_ENVELOPE_LEN};
    use sotto_storage::memory::MemoryMailbox;
    use tokio::sync::mpsc;

    fn build_router() -> (Router, Arc<ConnectionRegistry>, Arc<MemoryMailbox>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let mailbox = Arc::new(MemoryMailbox::new());
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&mailbox) as Arc<dyn Mailbox>,
            Arc::new(Metrics::new()),
        );
        (router, registry, mailbox)
    }

    fn offer(sdp: &str) -> SignalBody {
        SignalBody {
            signal_type: SignalKind::Offer,
            data: json!({ "sdp": sdp }),
        }
    }

    #[tokio::test]
    async fn live_signal_reaches_recipient_transport() {
        let (router, registry, _mailbox) = build_router();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(2, tx, "s2".to_string()).await;

        let outcome = router.relay_signal(1, 2, offer("v=0")).await.unwrap();
        assert_eq!(outcome, Delivery::Delivered);
        match rx.recv().await.unwrap() {
            ServerEnvelope::Signal { payload } => {
                assert_eq!(payload.sender, 1);
                assert_eq!(payload.signal_type, SignalKind::Offer);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_signal_is_queued_as_signal_shaped_row() {
        let (router, _registry, mailbox) = build_router();

        let outcome = router.relay_signal(1, 2, offer("v=0")).await.unwrap();
        let Delivery::Queued(id) = outcome else {
            panic!("expected queued outcome");
        };
        let rows = mailbox.fetch_undelivered(2, 16).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        let body = SignalBody::parse(&rows[0].content).expect("signal-shaped content");
        assert_eq!(body.signal_type, SignalKind::Offer);
    }

    #[tokio::test]
    async fn offline_candidate_is_unreachable_and_never_stored() {
        let (router, _registry, mailbox) = build_router();
        let body = SignalBody {
            signal_type: SignalKind::Candidate,
            data: json!({ "candidate": "udp 1 192.0.2.1" }),
        };

        let outcome = router.relay_signal(1, 2, body).await;
        assert!(matches!(outcome, Err(RelayError::Unreachable)));
        assert!(mailbox.fetch_undelivered(2, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_message_sends_receipt_to_sender() {
        let (router, registry, _mailbox) = build_router();
        let (tx_sender, mut rx_sender) = mpsc::channel(4);
        let (tx_recipient, mut rx_recipient) = mpsc::channel(4);
        registry.register(1, tx_sender, "s1".to_string()).await;
        registry.register(2, tx_recipient, "s2".to_string()).await;

        let body = MessageBody {
            encrypted_content: "aGVsbG8=".to_string(),
        };
        let outcome = router.relay_message(1, 2, body).await.unwrap();
        assert_eq!(outcome, Delivery::Delivered);

        match rx_recipient.recv().await.unwrap() {
            ServerEnvelope::Message { payload } => {
                assert_eq!(payload.sender, 1);
                assert_eq!(payload.encrypted_content, "aGVsbG8=");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
        match rx_sender.recv().await.unwrap() {
            ServerEnvelope::Delivered { payload } => {
                assert_eq!(payload.recipient, 2);
                assert!(payload.delivered);
                assert!(payload.message_id.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_transport_degrades_to_queue() {
        let (router, registry, mailbox) = build_router();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(2, tx, "s2".to_string()).await;
        // Occupy the single slot so the live push cannot land.
        let occupied = registry.lookup(2).await.unwrap();
        occupied
            .try_send(ServerEnvelope::error("busy", ""))
            .unwrap();

        let body = MessageBody {
            encrypted_content: "blob".to_string(),
        };
        let outcome = router.relay_message(1, 2, body).await.unwrap();
        assert!(matches!(outcome, Delivery::Queued(_)));
        assert_eq!(mailbox.fetch_undelivered(2, 16).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlong_message_queues_instead_of_acking() {
        let (router, registry, mailbox) = build_router();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(2, tx, "s2".to_string()).await;

        let body = MessageBody {
            encrypted_content: "y".repeat(MAX_ENVELOPE_LEN),
        };
        let outcome = router.relay_message(1, 2, body).await.unwrap();
        assert!(matches!(outcome, Delivery::Queued(_)));
        // Nothing reached the live transport and no receipt was produced.
        assert!(rx.try_recv().is_err());
        assert_eq!(mailbox.fetch_undelivered(2, 4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlong_candidate_is_unreachable() {
        let (router, registry, mailbox) = build_router();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(2, tx, "s2".to_string()).await;

        let body = SignalBody {
            signal_type: SignalKind::Candidate,
            data: json!({ "candidate": "u".repeat(MAX_ENVELOPE_LEN) }),
        };
        let outcome = router.relay_signal(1, 2, body).await;
        assert!(matches!(outcome, Err(RelayError::Unreachable)));
        assert!(rx.try_recv().is_err());
        assert!(mailbox.fetch_undelivered(2, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_transport_degrades_to_queue() {
        let (router, registry, mailbox) = build_router();
        let (tx, rx) = mpsc::channel(4);
        registry.register(2, tx, "s2".to_string()).await;
        drop(rx);

        let outcome = router.relay_signal(1, 2, offer("v=0")).await.unwrap();
        assert!(matches!(outcome, Delivery::Queued(_)));
        assert_eq!(mailbox.fetch_undelivered(2, 16).await.unwrap().len(), 1);
    }
}
