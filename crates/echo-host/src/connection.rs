//! One WebSocket connection on the host side.
//!
//! A writer task drains the outbound queue; the reader loop below handles
//! every inbound frame in order.  A connection is bound to at most one
//! session at a time, either by a fresh handshake or by a resume.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use sw_crypto::{verify_checkpoint_signer, KeyAgreement, SessionCrypto};
use sw_domain::error::{Error, ErrorCode};
use sw_domain::stream::{FinishReason, Usage};
use sw_domain::trace::TraceEvent;
use sw_protocol::{
    Checkpoint, ClientPayload, EncryptedEnvelope, ErrorFrame, HostPayload, SessionInitEnvelope,
    WsMessage, PROTOCOL_VERSION,
};

use crate::host::{HostSession, HostState};

pub(crate) async fn serve_connection(
    state: Arc<HostState>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "websocket upgrade failed");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(64);

    // Writer task.  A dropped connection stops mid-queue.
    let writer_cancel = cancel.clone();
    let writer_state = state.clone();
    let stall = state.stall_token();
    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => break,
                m = out_rx.recv() => m,
            };
            let Some(msg) = msg else { break };
            if stall.is_cancelled() {
                tracing::trace!(kind = msg.kind(), "stalled, frame swallowed");
                continue;
            }
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(error = %e, kind = msg.kind(), "failed to serialize outbound message");
                    continue;
                }
            };
            if matches!(msg, WsMessage::EncryptedMessage(_)) && writer_state.take_duplicate() {
                tracing::info!("writing encrypted message twice");
                if sink.send(Message::Text(json.clone())).await.is_err() {
                    break;
                }
            }
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(%peer, "connection opened");
    let mut conn = Connection {
        state: state.clone(),
        out: out_tx,
        cancel: cancel.clone(),
        session: None,
        generation: None,
    };
    conn.send(WsMessage::Connected {
        protocol_version: PROTOCOL_VERSION,
        capabilities: vec!["session_resume".into(), "checkpoints".into()],
        models: state.config.models.clone(),
    })
    .await;

    let max_bytes = state.config.max_message_bytes;
    loop {
        let next = tokio::select! {
            m = stream.next() => m,
            _ = cancel.cancelled() => break,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            // Keep reading so the close reply goes out; the stream ends after.
            Some(Ok(Message::Close(_))) => continue,
            Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        if text.len() > max_bytes {
            tracing::warn!(%peer, bytes = text.len(), max = max_bytes, "inbound message too large, dropping");
            continue;
        }
        match serde_json::from_str::<WsMessage>(&text) {
            Ok(msg) => conn.handle(msg).await,
            Err(e) => tracing::debug!(%peer, error = %e, "failed to parse message"),
        }
    }

    cancel.cancel();
    writer.abort();
    tracing::debug!(%peer, "connection closed");
}

struct Generation {
    request_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Connection {
    state: Arc<HostState>,
    out: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
    session: Option<Arc<HostSession>>,
    generation: Option<Generation>,
}

impl Connection {
    async fn send(&self, msg: WsMessage) {
        let _ = self.out.send(msg).await;
    }

    async fn send_error(&self, frame: ErrorFrame) {
        self.send(WsMessage::Error(frame)).await;
    }

    async fn handle(&mut self, msg: WsMessage) {
        match msg {
            WsMessage::SessionInit(envelope) => self.on_session_init(envelope).await,
            WsMessage::SessionResume {
                session_id,
                last_checkpoint,
                token_count,
            } => self.on_resume(session_id, last_checkpoint, token_count).await,
            WsMessage::EncryptedMessage(envelope) => self.on_encrypted(envelope).await,
            WsMessage::Checkpoint {
                session_id,
                checkpoint,
            } => self.on_checkpoint(session_id, checkpoint).await,
            WsMessage::SessionEnd { session_id, reason } => {
                self.stop_generation();
                if self.state.end_session(&session_id) {
                    tracing::info!(session_id = %session_id, %reason, "session ended by client");
                }
                self.session = None;
            }
            WsMessage::Ping { timestamp } => self.send(WsMessage::Pong { timestamp }).await,
            WsMessage::Pong { .. } => tracing::trace!("received pong"),
            other => tracing::debug!(kind = other.kind(), "ignoring message"),
        }
    }

    // ── Handshake and resume ─────────────────────────────────────────

    async fn on_session_init(&mut self, envelope: SessionInitEnvelope) {
        if self.state.config.silent_handshake {
            tracing::debug!("silent handshake: session_init left unanswered");
            return;
        }

        let started = Instant::now();
        let agreement = KeyAgreement::new(self.state.identity.clone());
        let result = agreement
            .respond_to_handshake(
                &envelope,
                self.state.authz.as_ref(),
                self.state.config.handshake_max_age_ms,
            )
            .await;

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                let code = Error::from(e.clone()).code();
                let reason = format!("{code}: {e}");
                tracing::warn!(%reason, "session_init rejected");
                TraceEvent::HandshakeRejected {
                    reason: reason.clone(),
                }
                .emit();
                self.send(WsMessage::SessionInitAck {
                    accepted: false,
                    session_id: String::new(),
                    reason: Some(reason),
                })
                .await;
                return;
            }
        };

        let session_id = result.session_id.clone();
        let crypto = SessionCrypto::responder(session_id.clone(), result.session_key);
        let session = Arc::new(HostSession::new(
            session_id.clone(),
            result.peer_address.clone(),
            crypto,
        ));
        if !self.state.insert_session(session.clone()) {
            self.send(WsMessage::SessionInitAck {
                accepted: false,
                session_id,
                reason: Some(ErrorCode::SessionAlreadyActive.to_string()),
            })
            .await;
            return;
        }

        self.stop_generation();
        self.session = Some(session);
        TraceEvent::HandshakeCompleted {
            session_id: session_id.clone(),
            peer_address: result.peer_address,
            role: "responder".into(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
        self.send(WsMessage::SessionInitAck {
            accepted: true,
            session_id,
            reason: None,
        })
        .await;
    }

    async fn on_resume(&mut self, session_id: String, last_checkpoint: u64, token_count: u64) {
        let host_last = self.state.last_checkpoint(&session_id);
        let accepted = match self.state.session(&session_id) {
            Some(session) => {
                tracing::info!(
                    session_id = %session_id,
                    client_last_checkpoint = last_checkpoint,
                    host_last_checkpoint = host_last,
                    token_count,
                    "session resumed"
                );
                self.stop_generation();
                self.session = Some(session);
                true
            }
            None => {
                tracing::info!(session_id = %session_id, "resume refused: unknown session");
                false
            }
        };
        self.send(WsMessage::SessionResumeAck {
            session_id,
            accepted,
            last_checkpoint: host_last,
        })
        .await;
    }

    // ── Encrypted stream ─────────────────────────────────────────────

    async fn on_encrypted(&mut self, envelope: EncryptedEnvelope) {
        let session = match &self.session {
            Some(s) if s.id == envelope.session_id => s.clone(),
            _ => {
                self.send_error(
                    ErrorFrame::new(ErrorCode::SessionNotFound, "no session on this connection")
                        .for_session(envelope.session_id),
                )
                .await;
                return;
            }
        };

        let decoded = session.with_crypto(|c| c.decrypt_json::<ClientPayload>(&envelope));
        match decoded {
            None => {
                self.send_error(
                    ErrorFrame::new(ErrorCode::SessionExpired, "session ended")
                        .for_session(session.id.clone()),
                )
                .await;
            }
            Some(Ok(ClientPayload::Prompt {
                request_id,
                prompt,
                max_tokens,
            })) => self.start_generation(session, request_id, prompt, max_tokens).await,
            Some(Ok(ClientPayload::Cancel { request_id })) => {
                if let Some(gen) = &self.generation {
                    if gen.request_id == request_id {
                        tracing::debug!(session_id = %session.id, %request_id, "generation cancelled");
                        gen.cancel.cancel();
                    }
                }
            }
            Some(Err(e)) => {
                // Replays included.  The session survives for a resume.
                tracing::warn!(session_id = %session.id, error = %e, "protocol violation, dropping connection");
                self.stop_generation();
                self.cancel.cancel();
            }
        }
    }

    async fn start_generation(
        &mut self,
        session: Arc<HostSession>,
        request_id: String,
        prompt: String,
        max_tokens: Option<u64>,
    ) {
        if self.generation.as_ref().is_some_and(|g| !g.task.is_finished()) {
            self.send_error(
                ErrorFrame::new(ErrorCode::InvalidState, "a generation is already in progress")
                    .for_session(session.id.clone()),
            )
            .await;
            return;
        }

        let context_window = self.state.config.context_window;
        let words: Vec<String> = prompt.split_whitespace().map(str::to_string).collect();
        let prompt_tokens = words.len() as u64;
        if prompt_tokens > context_window {
            tracing::info!(session_id = %session.id, prompt_tokens, context_window, "prompt exceeds context window");
            self.send_error(
                ErrorFrame::token_limit(prompt_tokens, context_window).for_session(session.id.clone()),
            )
            .await;
            return;
        }

        let limit = (context_window - prompt_tokens).min(max_tokens.unwrap_or(u64::MAX));
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(echo(EchoJob {
            session,
            words,
            limit,
            context_window,
            delay: Duration::from_millis(self.state.config.token_delay_ms),
            out: self.out.clone(),
            cancel: cancel.clone(),
        }));
        self.generation = Some(Generation {
            request_id,
            cancel,
            task,
        });
    }

    fn stop_generation(&mut self) {
        if let Some(gen) = self.generation.take() {
            gen.cancel.cancel();
        }
    }

    // ── Checkpoints ──────────────────────────────────────────────────

    async fn on_checkpoint(&mut self, session_id: String, checkpoint: Checkpoint) {
        let Some(session) = self.state.session(&session_id) else {
            self.send_error(
                ErrorFrame::new(ErrorCode::SessionNotFound, "unknown session").for_session(session_id),
            )
            .await;
            return;
        };
        if !verify_checkpoint_signer(&session_id, &checkpoint, &session.peer_address) {
            tracing::warn!(session_id = %session_id, number = checkpoint.number, "checkpoint signer mismatch");
            self.send_error(
                ErrorFrame::new(ErrorCode::SignatureInvalid, "checkpoint not signed by session peer")
                    .for_session(session_id),
            )
            .await;
            return;
        }

        let number = checkpoint.number;
        {
            let mut log = self.state.checkpoints.write();
            let entry = log.entry(session_id.clone()).or_default();
            if entry.last().is_some_and(|last| last.number >= number) {
                tracing::debug!(session_id = %session_id, number, "checkpoint already recorded");
            } else {
                tracing::info!(
                    session_id = %session_id,
                    number,
                    token_count = checkpoint.token_count,
                    "checkpoint recorded"
                );
                entry.push(checkpoint);
            }
        }
        self.send(WsMessage::CheckpointAck { session_id, number }).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo generation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct EchoJob {
    session: Arc<HostSession>,
    words: Vec<String>,
    limit: u64,
    context_window: u64,
    delay: Duration,
    out: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

/// Stream each prompt word back as one token, then `stream_end`.
async fn echo(job: EchoJob) {
    let started = Instant::now();
    let mut finish_reason = FinishReason::Stop;
    let mut completion_tokens: u64 = 0;

    for (index, word) in job.words.iter().enumerate() {
        if completion_tokens >= job.limit {
            finish_reason = FinishReason::Length;
            break;
        }
        if !job.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(job.delay) => {}
                _ = job.cancel.cancelled() => {}
            }
        }
        if job.cancel.is_cancelled() {
            finish_reason = FinishReason::Cancelled;
            break;
        }

        let content = if index == 0 {
            word.clone()
        } else {
            format!(" {word}")
        };
        let chunk = HostPayload::StreamChunk {
            content,
            index: index as u64,
        };
        if !send_encrypted(&job, &chunk).await {
            return;
        }
        completion_tokens += 1;
    }

    let prompt_tokens = job.words.len() as u64;
    let end = HostPayload::StreamEnd {
        finish_reason,
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            context_window_size: job.context_window,
        },
        duration_ms: started.elapsed().as_millis() as u64,
    };
    if send_encrypted(&job, &end).await {
        tracing::debug!(
            session_id = %job.session.id,
            %finish_reason,
            completion_tokens,
            "generation finished"
        );
    }
}

async fn send_encrypted(job: &EchoJob, payload: &HostPayload) -> bool {
    if job.cancel.is_cancelled() && matches!(payload, HostPayload::StreamChunk { .. }) {
        return false;
    }
    let envelope = match job.session.with_crypto(|c| c.encrypt_json(payload)) {
        Some(Ok(env)) => env,
        Some(Err(e)) => {
            tracing::error!(session_id = %job.session.id, error = %e, "encrypt failed");
            return false;
        }
        None => return false,
    };
    job.out.send(WsMessage::EncryptedMessage(envelope)).await.is_ok()
}
