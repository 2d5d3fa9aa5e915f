//! The task that owns one session.
//!
//! Everything that mutates a session happens here: the handshake, the
//! encrypted prompt/stream exchange, checkpointing, resume after a dropped
//! connection, expiry, and the close sequence.  Handles talk to the task
//! over a command channel and read state through the registry slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sw_crypto::{IdentityDirectory, IdentityKeyStore, KeyAgreement, SessionCrypto};
use sw_domain::config::Config;
use sw_domain::error::{
    CheckpointError, Error, ErrorCode, HandshakeError, NetworkError, SessionError,
};
use sw_domain::stream::{Completion, ContextWarning, FinishReason, StreamToken, Usage};
use sw_domain::trace::TraceEvent;
use sw_protocol::{Checkpoint, ClientPayload, HostPayload, SessionParams, WsMessage};
use sw_sessions::{
    CheckpointManager, CheckpointSubmitter, CloseReason, LifecycleManager, SessionState,
    SettlementOutcome,
};

use crate::builder::ContextWarningHook;
use crate::reconnect::{await_connected, connect_with_backoff, resume_session, ResumeRequest, Resumed};
use crate::registry::{SessionRegistry, SessionSlot};
use crate::transport::{Transport, TransportEvent};

const LIFECYCLE_TICK: Duration = Duration::from_secs(1);
/// Upper bound on the close handshake once the session is done.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// Requests from handles to the session task.
pub(crate) enum Command {
    Prompt {
        prompt: String,
        max_tokens: Option<u64>,
        events: mpsc::UnboundedSender<StreamEvent>,
        reply: Reply<String>,
    },
    /// `None` cancels whatever is in flight.
    Cancel { request_id: Option<String> },
    CheckpointNow { reply: Reply<Checkpoint> },
    AbandonPending { reply: oneshot::Sender<u64> },
    Close {
        reason: CloseReason,
        reply: Reply<SettlementOutcome>,
    },
}

/// What a [`TokenStream`](crate::TokenStream) receives.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Token(StreamToken),
    Done(Completion),
    Failed(Error),
}

struct Generation {
    request_id: String,
    events: mpsc::UnboundedSender<StreamEvent>,
    started: Instant,
    cancelled: bool,
    completion_tokens: u64,
}

/// The session is `Closed` once the final checkpoint has settled and the
/// host has acknowledged it (or cannot).
struct Closing {
    final_number: u64,
    waiters: Vec<Reply<SettlementOutcome>>,
    /// Set when settlement of the final checkpoint failed.  The session
    /// stays in `Closing` until pending checkpoints are abandoned.
    failure: Option<Error>,
    settled: Option<SettlementOutcome>,
    /// The host acked `final_number`, the connection is gone, or the ack
    /// wait timed out.
    host_acked: bool,
    ack_deadline: tokio::time::Instant,
}

enum Wake {
    Command(Option<Command>),
    Frame(TransportEvent),
    Resumed(Result<Resumed, Error>),
    Settled(Result<SettlementOutcome, CheckpointError>),
    AckTimeout,
    Tick,
    Shutdown,
}

pub(crate) struct SessionMachine {
    session_id: String,
    peer_address: String,
    url: String,
    slot: Arc<SessionSlot>,
    registry: SessionRegistry,
    config: Arc<Config>,
    identity: Arc<IdentityKeyStore>,
    lifecycle: LifecycleManager,
    checkpoints: CheckpointManager,
    submitter: CheckpointSubmitter,
    commands: mpsc::Receiver<Command>,
    on_context_warning: Option<ContextWarningHook>,
    shutdown: CancellationToken,

    transport: Option<Transport>,
    generation: Option<Generation>,
    resume: Option<JoinHandle<Result<Resumed, Error>>>,
    closing: Option<Closing>,
    done: bool,
}

pub(crate) struct MachineParts {
    pub session_id: String,
    pub peer_address: String,
    pub url: String,
    pub slot: Arc<SessionSlot>,
    pub registry: SessionRegistry,
    pub config: Arc<Config>,
    pub identity: Arc<IdentityKeyStore>,
    pub submitter: CheckpointSubmitter,
    pub commands: mpsc::Receiver<Command>,
    pub on_context_warning: Option<ContextWarningHook>,
    pub shutdown: CancellationToken,
}

impl SessionMachine {
    pub(crate) fn new(parts: MachineParts) -> Self {
        let checkpoints = CheckpointManager::new(
            parts.session_id.clone(),
            parts.identity.clone(),
            parts.config.checkpoint.checkpoint_token_interval,
        );
        Self {
            lifecycle: LifecycleManager::new(parts.config.session.clone()),
            checkpoints,
            session_id: parts.session_id,
            peer_address: parts.peer_address,
            url: parts.url,
            slot: parts.slot,
            registry: parts.registry,
            config: parts.config,
            identity: parts.identity,
            submitter: parts.submitter,
            commands: parts.commands,
            on_context_warning: parts.on_context_warning,
            shutdown: parts.shutdown,
            transport: None,
            generation: None,
            resume: None,
            closing: None,
            done: false,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Handshake
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Drive `Uninitialized → HandshakePending → Active`.  On failure the
    /// session ends in `Failed` and leaves the registry.
    pub(crate) async fn establish(
        &mut self,
        directory: &dyn IdentityDirectory,
        params: SessionParams,
    ) -> Result<(), Error> {
        self.transition(SessionState::HandshakePending);
        let started = Instant::now();
        let timeout = self.config.session.handshake_timeout();

        let result = tokio::select! {
            r = tokio::time::timeout(timeout, self.handshake(directory, params)) => match r {
                Ok(r) => r,
                Err(_) => Err(HandshakeError::Timeout(timeout.as_millis() as u64).into()),
            },
            _ = self.shutdown.cancelled() => {
                Err(NetworkError::Disconnected("shutdown requested".into()).into())
            }
        };

        match result {
            Ok((transport, crypto, peer_address)) => {
                self.slot.install_key(crypto);
                self.transport = Some(transport);
                self.transition(SessionState::Active);
                TraceEvent::HandshakeCompleted {
                    session_id: self.session_id.clone(),
                    peer_address,
                    role: "initiator".into(),
                    duration_ms: started.elapsed().as_millis() as u64,
                }
                .emit();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "handshake failed");
                self.transition(SessionState::Failed);
                self.registry.finish(&self.session_id);
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        directory: &dyn IdentityDirectory,
        params: SessionParams,
    ) -> Result<(Transport, SessionCrypto, String), Error> {
        let backoff = self.config.transport.reconnect_backoff().seeded(&self.session_id);
        let mut transport =
            connect_with_backoff(&self.url, &self.config, &backoff, &self.shutdown).await?;
        let models = await_connected(&mut transport, self.config.session.handshake_timeout()).await?;
        if !params.model.is_empty() && !models.is_empty() && !models.contains(&params.model) {
            return Err(Error::Host {
                code: ErrorCode::ModelNotAvailable,
                message: format!("host does not serve model {}", params.model),
            });
        }

        let agreement = KeyAgreement::new(self.identity.clone());
        let (envelope, result) = agreement
            .initiate_handshake(directory, &self.peer_address, &self.session_id, params)
            .await?;
        transport.send(WsMessage::SessionInit(envelope)).await?;

        loop {
            match transport.recv().await {
                Some(TransportEvent::Message(WsMessage::SessionInitAck {
                    accepted,
                    session_id,
                    reason,
                })) => {
                    // Rejections carry no session id.
                    if !accepted {
                        return Err(rejection(reason, self.identity.address()).into());
                    }
                    if session_id != self.session_id {
                        return Err(HandshakeError::Malformed(format!(
                            "ack for session {session_id}, expected {}",
                            self.session_id
                        ))
                        .into());
                    }
                    let crypto = SessionCrypto::initiator(result.session_id, result.session_key);
                    return Ok((transport, crypto, result.peer_address));
                }
                Some(TransportEvent::Message(WsMessage::Error(frame))) => {
                    return Err(frame.for_session(self.session_id.clone()).into_error());
                }
                Some(TransportEvent::Message(other)) => {
                    tracing::debug!(kind = other.kind(), "ignoring frame during handshake");
                }
                Some(TransportEvent::Disconnected(e)) => return Err(e.into()),
                None => return Err(NetworkError::Disconnected("transport closed".into()).into()),
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Main loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(LIFECYCLE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;
        let mut shutdown_seen = false;

        while !self.done {
            let wake = tokio::select! {
                cmd = self.commands.recv(), if commands_open => Wake::Command(cmd),
                ev = next_frame(&mut self.transport) => Wake::Frame(ev),
                r = poll_resume(&mut self.resume) => Wake::Resumed(r),
                r = settle(&self.submitter, self.closing.as_ref()) => Wake::Settled(r),
                _ = ack_deadline(self.closing.as_ref()) => Wake::AckTimeout,
                _ = tick.tick() => Wake::Tick,
                _ = self.shutdown.cancelled(), if !shutdown_seen => Wake::Shutdown,
            };

            match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Command(None) => {
                    commands_open = false;
                    self.shut_down().await;
                }
                Wake::Frame(ev) => self.on_frame(ev).await,
                Wake::Resumed(r) => {
                    self.resume = None;
                    self.on_resumed(r).await;
                }
                Wake::Settled(r) => self.on_settled(r),
                Wake::AckTimeout => self.on_ack_timeout(),
                Wake::Tick => self.on_tick().await,
                Wake::Shutdown => {
                    shutdown_seen = true;
                    self.shut_down().await;
                }
            }
            self.finish_close().await;
        }

        tracing::debug!(session_id = %self.session_id, state = %self.slot.state(), "session task stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Prompt {
                prompt,
                max_tokens,
                events,
                reply,
            } => {
                let result = self.start_prompt(prompt, max_tokens, events).await;
                let _ = reply.send(result);
            }
            Command::Cancel { request_id } => self.cancel_generation(request_id.as_deref()).await,
            Command::CheckpointNow { reply } => {
                let state = self.slot.state();
                let result = if state.accepts_prompts() {
                    match self.checkpoints.flush() {
                        Ok(cp) => {
                            self.publish_checkpoint(cp.clone()).await;
                            Ok(cp)
                        }
                        Err(e) => Err(e.into()),
                    }
                } else {
                    Err(SessionError::InvalidState {
                        state: state.to_string(),
                        op: "checkpoint",
                    }
                    .into())
                };
                let _ = reply.send(result);
            }
            Command::AbandonPending { reply } => {
                let through = self.submitter.abandon_pending();
                if let Some(closing) = self.closing.as_mut() {
                    closing.failure = None;
                }
                let _ = reply.send(through);
            }
            Command::Close { reason, reply } => match self.closing.as_mut() {
                Some(closing) => match &closing.failure {
                    Some(err) => {
                        let _ = reply.send(Err(err.clone()));
                    }
                    None => closing.waiters.push(reply),
                },
                None => self.begin_close(reason, Some(reply)).await,
            },
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Prompts and the token stream
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn start_prompt(
        &mut self,
        prompt: String,
        max_tokens: Option<u64>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, Error> {
        let state = self.slot.state();
        if !state.accepts_prompts() {
            return Err(SessionError::InvalidState {
                state: state.to_string(),
                op: "prompt",
            }
            .into());
        }
        if self.generation.is_some() {
            return Err(SessionError::GenerationInProgress.into());
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        self.send_encrypted(&ClientPayload::Prompt {
            request_id: request_id.clone(),
            prompt,
            max_tokens,
        })
        .await?;

        tracing::debug!(session_id = %self.session_id, %request_id, "prompt sent");
        self.generation = Some(Generation {
            request_id: request_id.clone(),
            events,
            started: Instant::now(),
            cancelled: false,
            completion_tokens: 0,
        });
        Ok(request_id)
    }

    async fn cancel_generation(&mut self, request_id: Option<&str>) {
        let Some(gen) = self.generation.as_mut() else {
            return;
        };
        if gen.cancelled || request_id.is_some_and(|id| id != gen.request_id) {
            return;
        }
        gen.cancelled = true;
        let payload = ClientPayload::Cancel {
            request_id: gen.request_id.clone(),
        };
        if let Err(e) = self.send_encrypted(&payload).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to send cancel");
        }
    }

    async fn send_encrypted(&self, payload: &ClientPayload) -> Result<(), Error> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| NetworkError::Disconnected("no connection".into()))?;
        let envelope = self.slot.with_key(|c| c.encrypt_json(payload))??;
        let sequence = envelope.sequence;
        transport.send(WsMessage::EncryptedMessage(envelope)).await?;
        self.slot.update(|s| {
            s.outbound_sequence = sequence;
            s.touch();
        });
        Ok(())
    }

    fn on_host_payload(&mut self, payload: HostPayload) -> Option<Checkpoint> {
        match payload {
            HostPayload::StreamChunk { content, index } => {
                let checkpoint = match self.checkpoints.on_token_produced(&content, 1) {
                    Ok(cp) => cp,
                    Err(e) => {
                        tracing::error!(session_id = %self.session_id, error = %e, "checkpoint failed");
                        None
                    }
                };
                let token_count = self.checkpoints.token_count();
                self.slot.update(|s| {
                    s.token_count = token_count;
                    s.touch();
                });

                match self.generation.as_mut() {
                    Some(gen) => {
                        gen.completion_tokens += 1;
                        if !gen.cancelled {
                            let _ = gen.events.send(StreamEvent::Token(StreamToken { content, index }));
                        }
                    }
                    None => {
                        tracing::debug!(session_id = %self.session_id, index, "chunk outside a generation");
                    }
                }
                checkpoint
            }
            HostPayload::StreamEnd {
                finish_reason,
                usage,
                duration_ms,
            } => {
                let Some(gen) = self.generation.take() else {
                    tracing::debug!(session_id = %self.session_id, "stream end outside a generation");
                    return None;
                };
                let finish_reason = if gen.cancelled {
                    FinishReason::Cancelled
                } else {
                    finish_reason
                };
                self.check_context_window(&usage);
                self.finish_generation(gen, finish_reason, usage, duration_ms);
                None
            }
        }
    }

    fn finish_generation(&self, gen: Generation, finish_reason: FinishReason, usage: Usage, duration_ms: u64) {
        let completion = Completion {
            finish_reason,
            usage,
            duration_ms,
            session_token_count: self.checkpoints.token_count(),
            last_checkpoint_number: self.checkpoints.last_number(),
        };
        TraceEvent::GenerationFinished {
            session_id: self.session_id.clone(),
            finish_reason: finish_reason.to_string(),
            completion_tokens: gen.completion_tokens,
            duration_ms,
        }
        .emit();
        let _ = gen.events.send(StreamEvent::Done(completion));
    }

    fn fail_generation(&mut self, err: Error) {
        if let Some(gen) = self.generation.take() {
            tracing::warn!(
                session_id = %self.session_id,
                request_id = %gen.request_id,
                error = %err,
                "generation failed"
            );
            let _ = gen.events.send(StreamEvent::Failed(err));
        }
    }

    fn check_context_window(&self, usage: &Usage) {
        let threshold = self.config.session.context_warning_threshold;
        let Some(utilization) = usage.context_utilization() else {
            return;
        };
        if utilization < threshold {
            return;
        }
        tracing::warn!(
            session_id = %self.session_id,
            utilization,
            threshold,
            context_window_size = usage.context_window_size,
            "context window nearly full"
        );
        if let Some(hook) = &self.on_context_warning {
            hook(&ContextWarning {
                session_id: self.session_id.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                context_window_size: usage.context_window_size,
                utilization,
                threshold,
            });
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Inbound frames
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn on_frame(&mut self, ev: TransportEvent) {
        let msg = match ev {
            TransportEvent::Message(msg) => msg,
            TransportEvent::Disconnected(e) => {
                self.on_disconnect(e);
                return;
            }
        };

        match msg {
            WsMessage::EncryptedMessage(envelope) => {
                let decoded = self.slot.with_key(|c| {
                    let payload = c.decrypt_json::<HostPayload>(&envelope);
                    (payload, c.inbound_high_water())
                });
                match decoded {
                    Err(_) => {
                        tracing::debug!(session_id = %self.session_id, "message after key purge dropped");
                    }
                    Ok((Ok(payload), high_water)) => {
                        self.slot.update(|s| s.inbound_sequence = high_water);
                        if let Some(cp) = self.on_host_payload(payload) {
                            self.publish_checkpoint(cp).await;
                        }
                    }
                    // Replays included.
                    Ok((Err(e), _)) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "protocol violation, dropping connection");
                        self.on_disconnect_with(e.into());
                    }
                }
            }
            WsMessage::CheckpointAck { session_id, number } if session_id == self.session_id => {
                tracing::debug!(session_id = %self.session_id, number, "host received checkpoint");
                if let Some(closing) = self.closing.as_mut() {
                    if number >= closing.final_number {
                        closing.host_acked = true;
                    }
                }
            }
            WsMessage::Error(frame) => {
                let err = frame.for_session(self.session_id.clone()).into_error();
                match err.code() {
                    ErrorCode::SessionExpired | ErrorCode::SessionNotFound
                        if self.closing.is_none() =>
                    {
                        self.fail(err).await;
                    }
                    _ if self.generation.is_some() => self.fail_generation(err),
                    _ => {
                        tracing::warn!(session_id = %self.session_id, error = %err, "host error");
                    }
                }
            }
            other => {
                tracing::debug!(session_id = %self.session_id, kind = other.kind(), "ignoring frame");
            }
        }
    }

    fn on_disconnect(&mut self, err: NetworkError) {
        self.on_disconnect_with(err.into());
    }

    /// Drop the connection and, unless closing, start resuming.
    fn on_disconnect_with(&mut self, err: Error) {
        if let Some(t) = self.transport.take() {
            t.abort();
        }
        if let Some(closing) = self.closing.as_mut() {
            tracing::info!(session_id = %self.session_id, error = %err, "connection lost while closing");
            closing.host_acked = true;
            return;
        }
        self.fail_generation(err);
        if !self.transition(SessionState::Resuming) {
            return;
        }

        let request = ResumeRequest {
            session_id: self.session_id.clone(),
            url: self.url.clone(),
            last_checkpoint: self.checkpoints.last_number(),
            token_count: self.checkpoints.token_count(),
        };
        self.resume = Some(tokio::spawn(resume_session(
            request,
            self.config.clone(),
            self.shutdown.child_token(),
        )));
    }

    async fn on_resumed(&mut self, result: Result<Resumed, Error>) {
        let resumed = match result {
            Ok(r) => r,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        let ours = self.checkpoints.last_number();
        if resumed.host_last_checkpoint > ours {
            self.fail(
                CheckpointError::InvariantViolation(format!(
                    "host reports checkpoint #{} but the last one issued is #{ours}",
                    resumed.host_last_checkpoint
                ))
                .into(),
            )
            .await;
            return;
        }

        self.transport = Some(resumed.transport);
        if resumed.host_last_checkpoint < ours {
            if let Some(cp) = self.checkpoints.last().cloned() {
                self.send_checkpoint(cp).await;
            }
        }
        self.slot.update(|s| s.resumes += 1);
        self.transition(SessionState::Active);
        TraceEvent::SessionResumed {
            session_id: self.session_id.clone(),
            last_checkpoint: ours,
            attempts: resumed.attempts,
        }
        .emit();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Checkpoints
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Queue `checkpoint` for settlement and send it to the host.  Returns
    /// whether it was handed to the transport.
    async fn publish_checkpoint(&mut self, checkpoint: Checkpoint) -> bool {
        let was_active = self.slot.state() == SessionState::Active;
        if was_active {
            self.transition(SessionState::Checkpointing);
        }

        let number = checkpoint.number;
        self.slot.update(|s| s.last_checkpoint_number = number);
        if let Err(e) = self.submitter.submit(checkpoint.clone()) {
            tracing::error!(session_id = %self.session_id, number, error = %e, "checkpoint not queued");
        }
        let sent = self.send_checkpoint(checkpoint).await;

        if was_active {
            self.transition(SessionState::Active);
        }
        sent
    }

    async fn send_checkpoint(&self, checkpoint: Checkpoint) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        let number = checkpoint.number;
        let msg = WsMessage::Checkpoint {
            session_id: self.session_id.clone(),
            checkpoint,
        };
        match transport.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = %self.session_id, number, error = %e, "checkpoint not sent to host");
                false
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Close and failure
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn begin_close(&mut self, reason: CloseReason, reply: Option<Reply<SettlementOutcome>>) {
        let state = self.slot.state();
        if !state.can_transition_to(SessionState::Closing) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(SessionError::InvalidState {
                    state: state.to_string(),
                    op: "close",
                }
                .into()));
            }
            return;
        }

        // The cancel goes out under the session key, before it is purged.
        self.cancel_generation(None).await;
        if let Some(gen) = self.generation.take() {
            let usage = Usage {
                completion_tokens: gen.completion_tokens,
                total_tokens: gen.completion_tokens,
                ..Usage::default()
            };
            let elapsed = gen.started.elapsed().as_millis() as u64;
            self.finish_generation(gen, FinishReason::Cancelled, usage, elapsed);
        }
        self.stop_resume();
        self.transition(SessionState::Closing);

        let (final_number, sent) = match self.checkpoints.flush() {
            Ok(cp) => {
                let number = cp.number;
                (number, self.publish_checkpoint(cp).await)
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "final checkpoint failed");
                (self.checkpoints.last_number(), false)
            }
        };

        if let Some(transport) = &self.transport {
            let _ = transport
                .send(WsMessage::SessionEnd {
                    session_id: self.session_id.clone(),
                    reason: reason.to_string(),
                })
                .await;
        }

        tracing::info!(
            session_id = %self.session_id,
            %reason,
            final_checkpoint = final_number,
            token_count = self.checkpoints.token_count(),
            "session closing"
        );
        self.closing = Some(Closing {
            final_number,
            waiters: reply.into_iter().collect(),
            failure: None,
            settled: None,
            host_acked: !sent,
            ack_deadline: tokio::time::Instant::now() + self.config.checkpoint.ack_timeout(),
        });
    }

    fn on_settled(&mut self, result: Result<SettlementOutcome, CheckpointError>) {
        let Some(closing) = self.closing.as_mut() else {
            return;
        };
        match result {
            Ok(outcome) => {
                if !closing.host_acked {
                    tracing::debug!(
                        session_id = %self.session_id,
                        final_checkpoint = closing.final_number,
                        "settled, waiting for the host ack"
                    );
                }
                closing.settled = Some(outcome);
            }
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    final_checkpoint = closing.final_number,
                    error = %e,
                    "final checkpoint not settled, holding session in closing"
                );
                let err: Error = e.into();
                for w in closing.waiters.drain(..) {
                    let _ = w.send(Err(err.clone()));
                }
                closing.failure = Some(err);
            }
        }
    }

    fn on_ack_timeout(&mut self) {
        let Some(closing) = self.closing.as_mut() else {
            return;
        };
        tracing::warn!(
            session_id = %self.session_id,
            final_checkpoint = closing.final_number,
            timeout_ms = self.config.checkpoint.ack_timeout_ms,
            "host did not acknowledge the final checkpoint"
        );
        closing.host_acked = true;
    }

    /// `Closing → Closed` once both the settlement and the host are done.
    async fn finish_close(&mut self) {
        if self.done {
            return;
        }
        let Some(closing) = self.closing.as_mut() else {
            return;
        };
        let Some(outcome) = closing.settled else {
            return;
        };
        if !closing.host_acked {
            return;
        }
        let waiters = std::mem::take(&mut closing.waiters);
        self.transition(SessionState::Closed);
        self.teardown().await;
        for w in waiters {
            let _ = w.send(Ok(outcome));
        }
    }

    async fn on_tick(&mut self) {
        if self.closing.is_some() || !self.slot.state().accepts_prompts() {
            return;
        }
        let record = self.slot.snapshot();
        let busy = self.generation.is_some();
        if let Some(reason) = self.lifecycle.should_close(&record, Utc::now(), busy) {
            tracing::info!(session_id = %self.session_id, %reason, "session expired");
            self.begin_close(reason, None).await;
        }
    }

    /// Close without waiting on settlement.
    async fn shut_down(&mut self) {
        if self.closing.is_none() {
            self.begin_close(CloseReason::Shutdown, None).await;
        }
        if self.closing.is_some() {
            self.submitter.abandon_pending();
            if let Some(closing) = self.closing.as_mut() {
                closing.failure = None;
                // Queued frames still drain during the close handshake.
                closing.host_acked = true;
            }
        } else if !self.done {
            self.fail(NetworkError::Disconnected("shutdown requested".into()).into())
                .await;
        }
    }

    async fn fail(&mut self, err: Error) {
        tracing::error!(session_id = %self.session_id, error = %err, "session failed");
        self.fail_generation(err.clone());
        self.stop_resume();
        self.slot.record_failure(err.clone());
        self.transition(SessionState::Failed);
        if let Some(closing) = self.closing.as_mut() {
            for w in closing.waiters.drain(..) {
                let _ = w.send(Err(err.clone()));
            }
        }
        self.teardown().await;
    }

    fn stop_resume(&mut self) {
        if let Some(task) = self.resume.take() {
            task.abort();
        }
    }

    async fn teardown(&mut self) {
        self.registry.finish(&self.session_id);
        self.done = true;
        if let Some(t) = self.transport.take() {
            t.close(CLOSE_GRACE).await;
        }
    }

    fn transition(&mut self, next: SessionState) -> bool {
        let from = self.slot.state();
        if from == next {
            return true;
        }
        if !from.can_transition_to(next) {
            tracing::warn!(session_id = %self.session_id, %from, to = %next, "illegal transition ignored");
            return false;
        }
        self.slot.set_state(next);
        TraceEvent::StateChanged {
            session_id: self.session_id.clone(),
            from: from.to_string(),
            to: next.to_string(),
        }
        .emit();
        if !next.holds_session_key() {
            self.slot.purge_key();
        }
        true
    }
}

// ── select helpers ───────────────────────────────────────────────────

async fn next_frame(transport: &mut Option<Transport>) -> TransportEvent {
    match transport {
        Some(t) => match t.recv().await {
            Some(ev) => ev,
            None => TransportEvent::Disconnected(NetworkError::Disconnected("transport closed".into())),
        },
        None => std::future::pending().await,
    }
}

async fn poll_resume(resume: &mut Option<JoinHandle<Result<Resumed, Error>>>) -> Result<Resumed, Error> {
    match resume {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::Disconnected(format!("resume task stopped: {e}")).into()),
        },
        None => std::future::pending().await,
    }
}

async fn settle(
    submitter: &CheckpointSubmitter,
    closing: Option<&Closing>,
) -> Result<SettlementOutcome, CheckpointError> {
    match closing {
        Some(c) if c.failure.is_none() && c.settled.is_none() => {
            submitter.wait_settled(c.final_number).await
        }
        _ => std::future::pending().await,
    }
}

async fn ack_deadline(closing: Option<&Closing>) {
    match closing {
        Some(c) if !c.host_acked => tokio::time::sleep_until(c.ack_deadline).await,
        _ => std::future::pending().await,
    }
}

/// Map a `session_init_ack` rejection reason onto the handshake taxonomy.
/// Reasons are an error code, optionally followed by `: detail`.
fn rejection(reason: Option<String>, own_address: &str) -> HandshakeError {
    let reason = reason.unwrap_or_default();
    let code = reason.split(':').next().unwrap_or_default().trim();
    match code {
        "UNAUTHORIZED_SENDER" => HandshakeError::UnauthorizedSender {
            address: own_address.to_string(),
        },
        "SIGNATURE_INVALID" => HandshakeError::SignatureInvalid,
        "DECRYPTION_FAILED" => HandshakeError::DecryptionFailed,
        _ => HandshakeError::Rejected(reason),
    }
}
