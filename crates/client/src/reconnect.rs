//! Connection establishment and session resume, with jittered back-off.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sw_domain::config::Config;
use sw_domain::error::{Error, NetworkError, ProtocolError, SessionError};
use sw_domain::Backoff;
use sw_protocol::{WsMessage, PROTOCOL_VERSION};

use crate::transport::{Transport, TransportEvent};

/// Dial `url`, retrying with `backoff` until it succeeds, the attempt
/// ceiling is reached, or `shutdown` fires.
pub async fn connect_with_backoff(
    url: &str,
    config: &Config,
    backoff: &Backoff,
    shutdown: &CancellationToken,
) -> Result<Transport, NetworkError> {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            r = Transport::connect(url, &config.transport) => r,
            _ = shutdown.cancelled() => {
                return Err(NetworkError::Disconnected("shutdown requested".into()));
            }
        };

        let err = match result {
            Ok(transport) => return Ok(transport),
            Err(e) => e,
        };
        attempt += 1;
        tracing::warn!(url, attempt, error = %err, "connect failed");

        if backoff.should_give_up(attempt) {
            tracing::error!(url, attempts = attempt, "max connect attempts exhausted");
            return Err(NetworkError::ReconnectExhausted(attempt));
        }

        let delay = backoff.delay_for_attempt(attempt - 1);
        tracing::info!(
            url,
            delay_ms = delay.as_millis() as u64,
            attempt = attempt + 1,
            "reconnecting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                return Err(NetworkError::Disconnected("shutdown requested".into()));
            }
        }
    }
}

/// Wait for the host's `connected` greeting and check the protocol version.
pub async fn await_connected(transport: &mut Transport, timeout: Duration) -> Result<Vec<String>, Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match transport.recv_timeout(remaining).await? {
            TransportEvent::Message(WsMessage::Connected {
                protocol_version,
                models,
                ..
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ProtocolError::MalformedEnvelope(format!(
                        "host speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                    ))
                    .into());
                }
                return Ok(models);
            }
            TransportEvent::Message(other) => {
                tracing::debug!(kind = other.kind(), "ignoring frame before connected");
            }
            TransportEvent::Disconnected(e) => return Err(e.into()),
        }
    }
}

/// Successful re-attachment to a session.
#[derive(Debug)]
pub struct Resumed {
    pub transport: Transport,
    /// The host's last received checkpoint.
    pub host_last_checkpoint: u64,
    pub attempts: u32,
}

/// Everything a resume needs, detached from the session task.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: String,
    pub url: String,
    pub last_checkpoint: u64,
    pub token_count: u64,
}

/// Reconnect and re-attach to `request.session_id`.  Transport failures are
/// retried on the reconnect schedule; a host that no longer knows the
/// session is fatal.
pub async fn resume_session(
    request: ResumeRequest,
    config: std::sync::Arc<Config>,
    shutdown: CancellationToken,
) -> Result<Resumed, Error> {
    let backoff = config.transport.reconnect_backoff().seeded(&request.session_id);
    let reply_timeout = config.session.handshake_timeout();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            r = try_resume(&request, &config, reply_timeout) => r,
            _ = shutdown.cancelled() => {
                return Err(NetworkError::Disconnected("shutdown requested".into()).into());
            }
        };

        let err = match result {
            Ok((transport, host_last_checkpoint)) => {
                return Ok(Resumed {
                    transport,
                    host_last_checkpoint,
                    attempts: attempt,
                })
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        tracing::warn!(
            session_id = %request.session_id,
            attempt,
            error = %err,
            "resume attempt failed"
        );
        if backoff.should_give_up(attempt) {
            tracing::error!(session_id = %request.session_id, attempts = attempt, "resume attempts exhausted");
            return Err(NetworkError::ReconnectExhausted(attempt).into());
        }

        let delay = backoff.delay_for_attempt(attempt - 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                return Err(NetworkError::Disconnected("shutdown requested".into()).into());
            }
        }
    }
}

async fn try_resume(
    request: &ResumeRequest,
    config: &Config,
    reply_timeout: Duration,
) -> Result<(Transport, u64), Error> {
    let mut transport = Transport::connect(&request.url, &config.transport).await?;
    await_connected(&mut transport, reply_timeout).await?;

    transport
        .send(WsMessage::SessionResume {
            session_id: request.session_id.clone(),
            last_checkpoint: request.last_checkpoint,
            token_count: request.token_count,
        })
        .await?;

    let deadline = tokio::time::Instant::now() + reply_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match transport.recv_timeout(remaining).await? {
            TransportEvent::Message(WsMessage::SessionResumeAck {
                session_id,
                accepted,
                last_checkpoint,
            }) if session_id == request.session_id => {
                if !accepted {
                    return Err(SessionError::SessionNotFound(session_id).into());
                }
                return Ok((transport, last_checkpoint));
            }
            TransportEvent::Message(WsMessage::Error(frame)) => {
                return Err(frame.for_session(request.session_id.clone()).into_error());
            }
            TransportEvent::Message(other) => {
                tracing::debug!(kind = other.kind(), "ignoring frame while resuming");
            }
            TransportEvent::Disconnected(e) => return Err(e.into()),
        }
    }
}
