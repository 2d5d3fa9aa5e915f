//! WebSocket transport for one connection.
//!
//! A [`Transport`] owns three tasks: a writer draining the outbound queue
//! into the socket, a reader parsing inbound frames, and a heartbeat that
//! pings on an interval.  Pings from the peer are answered here and any
//! inbound frame counts as liveness; silence past the liveness timeout is a
//! disconnect.  The transport knows nothing about sessions or keys.
//!
//! [`Transport::close`] is the graceful path: queued frames are flushed, a
//! close frame goes out, and the reader waits for the peer to finish the
//! close handshake.  [`Transport::abort`] and drop stop everything at once.

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use sw_domain::config::TransportConfig;
use sw_domain::error::NetworkError;
use sw_protocol::WsMessage;

/// What the reader hands up.
#[derive(Debug)]
pub enum TransportEvent {
    Message(WsMessage),
    /// Terminal for this transport.  Delivered at most once.
    Disconnected(NetworkError),
}

pub struct Transport {
    url: String,
    outbound: mpsc::Sender<WsMessage>,
    inbound: mpsc::Receiver<TransportEvent>,
    /// Hard stop for every task.
    closed: CancellationToken,
    /// Graceful stop; child of `closed`.
    closing: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Open a socket to `url` and start the connection tasks.
    pub async fn connect(url: &str, config: &TransportConfig) -> Result<Self, NetworkError> {
        tracing::debug!(url, "connecting");
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(256);
        let closed = CancellationToken::new();
        let closing = closed.child_token();

        // Writer: drains the outbound queue into the socket.
        let writer_closed = closed.clone();
        let writer_closing = closing.clone();
        let writer_events = inbound_tx.clone();
        let writer = tokio::spawn(async move {
            loop {
                // Queued frames go out before a close takes effect.
                let msg = tokio::select! {
                    biased;
                    m = outbound_rx.recv() => m,
                    _ = writer_closing.cancelled() => None,
                };
                let Some(msg) = msg else {
                    if !writer_closed.is_cancelled() {
                        let _ = sink.close().await;
                    }
                    break;
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!(error = %e, kind = msg.kind(), "failed to serialize outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    if !writer_closing.is_cancelled() {
                        let _ = writer_events
                            .send(TransportEvent::Disconnected(NetworkError::Disconnected(
                                e.to_string(),
                            )))
                            .await;
                    }
                    writer_closed.cancel();
                    break;
                }
            }
        });

        // Heartbeat.
        let ping_tx = outbound_tx.clone();
        let ping_closed = closing.clone();
        let heartbeat = config.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + heartbeat,
                heartbeat,
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = ping_closed.cancelled() => break,
                }
                let msg = WsMessage::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                if ping_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: parse inbound frames, answer pings, watch liveness.
        let pong_tx = outbound_tx.clone();
        let reader_closed = closed.clone();
        let reader_closing = closing.clone();
        let liveness = config.liveness_timeout();
        let max_bytes = config.max_message_bytes;
        let reader = tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    r = tokio::time::timeout(liveness, stream.next()) => r,
                    _ = reader_closed.cancelled() => break None,
                };
                let msg = match next {
                    Err(_) => {
                        break Some(NetworkError::Timeout(format!(
                            "no frames for {}ms",
                            liveness.as_millis()
                        )))
                    }
                    Ok(None) => break Some(NetworkError::Disconnected("stream ended".into())),
                    Ok(Some(Err(e))) => break Some(NetworkError::Disconnected(e.to_string())),
                    Ok(Some(Ok(msg))) => msg,
                };
                match msg {
                    Message::Text(text) => {
                        // ── Pre-parse size limit ─────────────────────────
                        if text.len() > max_bytes {
                            tracing::warn!(
                                bytes = text.len(),
                                max = max_bytes,
                                "inbound message exceeds max_message_bytes, dropping"
                            );
                            continue;
                        }
                        match serde_json::from_str::<WsMessage>(&text) {
                            Ok(WsMessage::Ping { timestamp }) => {
                                let _ = pong_tx.send(WsMessage::Pong { timestamp }).await;
                            }
                            Ok(WsMessage::Pong { timestamp }) => {
                                tracing::trace!(
                                    rtt_ms = Utc::now().timestamp_millis() - timestamp,
                                    "received pong"
                                );
                            }
                            Ok(msg) if reader_closing.is_cancelled() => {
                                tracing::trace!(kind = msg.kind(), "frame after close dropped");
                            }
                            Ok(msg) => {
                                if inbound_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                    break None;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "failed to parse message");
                            }
                        }
                    }
                    Message::Close(_) if reader_closing.is_cancelled() => {
                        tracing::debug!("close handshake complete");
                        break None;
                    }
                    Message::Close(_) => {
                        break Some(NetworkError::Disconnected("peer closed connection".into()))
                    }
                    _ => {}
                }
            };

            if let Some(err) = reason {
                if !reader_closing.is_cancelled() {
                    tracing::info!(error = %err, "transport disconnected");
                    let _ = inbound_tx.send(TransportEvent::Disconnected(err)).await;
                }
            }
            reader_closed.cancel();
        });

        Ok(Self {
            url: url.to_string(),
            outbound: outbound_tx,
            inbound: inbound_rx,
            closed,
            closing,
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue a frame for the writer.
    pub async fn send(&self, msg: WsMessage) -> Result<(), NetworkError> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::Disconnected("transport closed".into()));
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| NetworkError::Disconnected("writer stopped".into()))
    }

    /// Next inbound event.  `None` once every task has stopped.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Receive with a deadline.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<TransportEvent, NetworkError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(ev)) => Ok(ev),
            Ok(None) => Err(NetworkError::Disconnected("transport closed".into())),
            Err(_) => Err(NetworkError::Timeout(format!(
                "no reply within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Send a heartbeat now.
    pub async fn ping(&self) -> Result<(), NetworkError> {
        self.send(WsMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop all tasks now.  Queued frames may be lost.
    pub fn abort(&self) {
        self.closed.cancel();
    }

    /// Flush queued frames, send a close frame, and wait up to `grace` for
    /// the peer to complete the close handshake.
    pub async fn close(mut self, grace: Duration) {
        self.closing.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let drained = tokio::time::timeout(grace, futures_util::future::join_all(tasks)).await;
        if drained.is_err() {
            tracing::debug!(url = %self.url, grace_ms = grace.as_millis() as u64, "close handshake timed out");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.url)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn close_flushes_queued_frames_before_the_close_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let peer = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut frames = Vec::new();
            let mut closed_after = None;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => frames.push(serde_json::from_str::<WsMessage>(&text).unwrap()),
                    Message::Close(_) => closed_after = Some(frames.len()),
                    _ => {}
                }
            }
            (frames, closed_after)
        });

        let transport = Transport::connect(&url, &TransportConfig::default()).await.unwrap();
        for timestamp in 0..32 {
            transport.send(WsMessage::Ping { timestamp }).await.unwrap();
        }
        transport.close(Duration::from_secs(5)).await;

        let (frames, closed_after) = tokio::time::timeout(Duration::from_secs(5), peer)
            .await
            .expect("peer never saw the socket end")
            .unwrap();
        let expected: Vec<_> = (0..32).map(|timestamp| WsMessage::Ping { timestamp }).collect();
        assert_eq!(frames, expected);
        assert_eq!(closed_after, Some(32));
    }
}
