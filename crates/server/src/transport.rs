use crate::app::{session, AppState, RelayError};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

#[cfg(test)]
use tokio::sync::mpsc;

/// Bidirectional frame channel a session runs over. Production sessions
/// arrive as accepted WebSocket streams; tests drive sessions through the
/// memory variant without touching a socket.
pub enum SessionChannel {
    WebSocket(WebSocketStream<TcpStream>),
    #[cfg(test)]
    Memory(MemoryChannel),
}

#[cfg(test)]
pub struct MemoryChannel {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
}

/// Client half of a memory channel pair.
#[cfg(test)]
pub struct MemoryPeer {
    pub to_server: mpsc::Sender<String>,
    pub from_server: mpsc::Receiver<String>,
}

#[cfg(test)]
impl MemoryPeer {
    pub async fn send(&self, text: &str) {
        self.to_server
            .send(text.to_string())
            .await
            .expect("session receiver alive");
    }

    /// Next server frame, `None` on close or after a bounded wait.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.from_server.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_server.try_recv().ok()
    }
}

impl SessionChannel {
    #[cfg(test)]
    pub fn memory(capacity: usize) -> (Self, MemoryPeer) {
        let (to_server, incoming) = mpsc::channel(capacity);
        let (outgoing, from_server) = mpsc::channel(capacity);
        (
            Self::Memory(MemoryChannel { incoming, outgoing }),
            MemoryPeer {
                to_server,
                from_server,
            },
        )
    }

    /// Reads the next text frame. `Ok(None)` means the peer closed the
    /// channel. Binary frames are tolerated as UTF-8 text; pings are answered
    /// inline so the codec layer never sees them.
    pub async fn read_frame(&mut self) -> Result<Option<String>, RelayError> {
        match self {
            Self::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                    Some(Ok(Message::Binary(data))) => {
                        return Ok(Some(String::from_utf8_lossy(&data).into_owned()))
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return Err(RelayError::Io);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read failure");
                        return Err(RelayError::Io);
                    }
                    None => return Ok(None),
                }
            },
            #[cfg(test)]
            Self::Memory(channel) => Ok(channel.incoming.recv().await),
        }
    }

    pub async fn write_frame(&mut self, text: &str) -> Result<(), RelayError> {
        match self {
            Self::WebSocket(stream) => stream
                .send(Message::text(text))
                .await
                .map_err(|_| RelayError::Io),
            #[cfg(test)]
            Self::Memory(channel) => channel
                .outgoing
                .send(text.to_string())
                .await
                .map_err(|_| RelayError::Io),
        }
    }

    pub async fn finish(self) {
        match self {
            Self::WebSocket(mut stream) => {
                if let Err(err) = stream.close(None).await {
                    debug!(error = %err, "websocket close error");
                }
            }
            #[cfg(test)]
            Self::Memory(_) => {}
        }
    }
}

/// Accept loop: each socket is upgraded to a WebSocket and handed to its own
/// session task. Returns once the shutdown watch fires.
pub async fn run_listener(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) {
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(socket).await {
                        Ok(stream) => {
                            debug!(remote = %remote, "websocket established");
                            session::run(state, SessionChannel::WebSocket(stream), shutdown).await;
                        }
                        Err(err) => {
                            debug!(remote = %remote, error = %err, "websocket handshake failed");
                        }
                    }
                });
            }
            _ = accept_shutdown.changed() => {
                info!("listener stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_state;
    use serde_json::json;
    use sotto_proto::ServerEnvelope;

    #[tokio::test]
    async fn websocket_session_end_to_end() {
        let state = Arc::new(test_state());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(run_listener(Arc::clone(&state), listener, shutdown_rx));

        let (mut client, _response) =
            tokio_tungstenite::connect_async(format!("ws://{address}"))
                .await
                .expect("client handshake");
        client
            .send(Message::text(
                json!({ "type": "connect", "token": "token-1" }).to_string(),
            ))
            .await
            .unwrap();

        let frame = client.next().await.unwrap().unwrap();
        let envelope: ServerEnvelope =
            serde_json::from_str(frame.to_text().unwrap()).expect("decodable frame");
        match envelope {
            ServerEnvelope::Connected { peer_id, .. } => assert_eq!(peer_id, 1),
            other => panic!("unexpected envelope {other:?}"),
        }
        assert!(state.registry.lookup(1).await.is_some());

        client
            .send(Message::text(json!({ "type": "disconnect" }).to_string()))
            .await
            .unwrap();
        // Session closes the socket after the disconnect frame.
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
        assert!(state.registry.lookup(1).await.is_none());

        shutdown_tx.send(true).unwrap();
        accept.await.unwrap();
    }
}
