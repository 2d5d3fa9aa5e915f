//! Integration tests: a real [`SessionClient`] against an in-process
//! [`EchoHost`] over loopback WebSockets.
//!
//! Covers the full session loop end to end:
//! - handshake, encrypted prompt/stream, checkpointing, and a settled close
//! - handshake timeout against a host that never answers
//! - rejection of an unauthorized signer
//! - resume after the host severs the connection mid-stream, goes silent,
//!   or replays a frame; failure once resume attempts run out
//! - oversize inbound frames dropped without disturbing the stream
//! - host-reported token limits, context warnings, cancel, and misuse

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;

use sw_client::{
    Config, ContextWarning, Error, ErrorCode, FinishReason, IdentityKeyStore, SessionClient,
    SessionParams, SessionState, SettlementError, SettlementOutcome, SettlementService,
    StaticDirectory,
};
use sw_crypto::{verify_checkpoint_signer, AllowList, AuthorizationCheck};
use sw_domain::error::{CheckpointError, HandshakeError, NetworkError, SessionError, TokenLimitError};
use sw_echo_host::{EchoHost, HostConfig, RunningHost};
use sw_protocol::Checkpoint;

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    host: RunningHost,
    host_identity: Arc<IdentityKeyStore>,
}

impl Harness {
    async fn start(config: HostConfig, authz: Arc<dyn AuthorizationCheck>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let host_identity = Arc::new(IdentityKeyStore::generate());
        let host = EchoHost::new(host_identity.clone(), authz, config)
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        Self {
            host,
            host_identity,
        }
    }

    async fn open(config: HostConfig) -> Self {
        Self::start(config, Arc::new(AllowList::open())).await
    }

    fn client(&self, identity: Arc<IdentityKeyStore>, config: Config) -> SessionClient {
        self.client_with(identity, config, |b| b)
    }

    fn client_with(
        &self,
        identity: Arc<IdentityKeyStore>,
        config: Config,
        customize: impl FnOnce(sw_client::SessionClientBuilder) -> sw_client::SessionClientBuilder,
    ) -> SessionClient {
        let directory = StaticDirectory::new().with_key(*self.host_identity.public_key());
        customize(
            SessionClient::builder()
                .identity(identity)
                .directory(Arc::new(directory))
                .config(config),
        )
        .build()
        .unwrap()
    }

    fn host_address(&self) -> String {
        self.host_identity.address().to_string()
    }

    /// Poll the host until it has recorded `count` checkpoints for `session_id`.
    async fn wait_for_checkpoints(&self, session_id: &str, count: usize) -> Vec<Checkpoint> {
        let control = self.host.control().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                let log = control.checkpoints(session_id);
                if log.len() >= count {
                    return log;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout waiting for host checkpoints")
    }
}

/// Fast reconnects and a short handshake so failures surface quickly.
fn test_config() -> Config {
    let mut config = Config::default();
    config.session.handshake_timeout_ms = 3_000;
    config.transport.reconnect_backoff_base_ms = 20;
    config.transport.reconnect_backoff_max_ms = 100;
    config.transport.reconnect_max_attempts = 10;
    config.checkpoint.submit_backoff_base_ms = 5;
    config.checkpoint.submit_backoff_max_ms = 20;
    config
}

fn echo_params() -> SessionParams {
    SessionParams {
        model: "echo-1".into(),
        max_tokens: None,
    }
}

fn words(n: usize) -> String {
    (1..=n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
}

// ── Happy path ──────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_stream_checkpoint_and_close() {
    let harness = Harness::open(HostConfig::default()).await;
    let identity = Arc::new(IdentityKeyStore::generate());
    let mut config = test_config();
    config.checkpoint.checkpoint_token_interval = 5;
    let client = harness.client(identity.clone(), config);

    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(client.registry().len(), 1);
    let session_id = session.id();

    let prompt = words(12);
    let (text, completion) = session.prompt(prompt.clone()).await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, prompt);
    assert_eq!(completion.finish_reason, FinishReason::Stop);
    assert_eq!(completion.usage.prompt_tokens, 12);
    assert_eq!(completion.usage.completion_tokens, 12);
    assert_eq!(completion.usage.total_tokens, 24);
    assert_eq!(completion.session_token_count, 12);
    assert_eq!(completion.last_checkpoint_number, 2);

    let outcome = session.close().await.unwrap();
    assert_eq!(outcome, SettlementOutcome::Acknowledged);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(client.registry().is_empty());
    assert!(client.session(&session_id).is_none());

    // Close returns only after the host has the final checkpoint and the
    // session_end, so nothing here needs to poll.
    assert!(!harness.host.control().knows(&session_id));

    // Two interval checkpoints and the final flush, all signed by the client.
    let log = harness.host.control().checkpoints(&session_id);
    let numbers: Vec<u64> = log.iter().map(|c| c.number).collect();
    let counts: Vec<u64> = log.iter().map(|c| c.token_count).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(counts, vec![5, 10, 12]);
    for cp in &log {
        assert!(verify_checkpoint_signer(&session_id, cp, identity.address()));
    }
}

#[tokio::test]
async fn tokens_arrive_in_order() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let mut stream = session.prompt("alpha beta gamma").await.unwrap();
    let mut tokens = Vec::new();
    while let Some(token) = stream.next().await {
        tokens.push(token.unwrap());
    }
    let indices: Vec<u64> = tokens.iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(tokens[0].content, "alpha");
    assert_eq!(tokens[2].content, " gamma");
    assert_eq!(stream.completion().unwrap().finish_reason, FinishReason::Stop);

    // A second prompt on the same session continues the counts.
    let (_, completion) = session.prompt("delta").await.unwrap().collect_text().await.unwrap();
    assert_eq!(completion.session_token_count, 4);
    assert!(session.snapshot().outbound_sequence >= 2);

    session.close().await.unwrap();
}

#[tokio::test]
async fn sequential_prompts_never_fall_behind_checkpoints() {
    let harness = Harness::open(HostConfig::default()).await;
    let mut config = test_config();
    config.checkpoint.checkpoint_token_interval = 4;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    let session_id = session.id();

    let mut total = 0;
    for n in [3, 6, 9] {
        let (_, completion) = session.prompt(words(n)).await.unwrap().collect_text().await.unwrap();
        total += n as u64;
        assert_eq!(completion.session_token_count, total);
        let log = harness.host.control().checkpoints(&session_id);
        let recorded = client
            .session(&session_id)
            .map(|h| h.snapshot().last_checkpoint_number)
            .unwrap();
        assert_eq!(completion.last_checkpoint_number, recorded);
        if let Some(last) = log.last() {
            assert!(completion.session_token_count >= last.token_count);
        }
    }
    assert_eq!(total, 18);

    session.close().await.unwrap();
    let log = harness.wait_for_checkpoints(&session_id, 5).await;
    let counts: Vec<u64> = log.iter().map(|c| c.token_count).collect();
    assert_eq!(counts, vec![4, 8, 12, 16, 18]);
}

// ── Handshake failures ──────────────────────────────────────────────────

#[tokio::test]
async fn silent_host_times_out_the_handshake() {
    let harness = Harness::open(HostConfig {
        silent_handshake: true,
        ..HostConfig::default()
    })
    .await;
    let mut config = test_config();
    config.session.handshake_timeout_ms = 300;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);

    let started = std::time::Instant::now();
    let err = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Handshake(HandshakeError::Timeout(300))),
        "unexpected error: {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(client.registry().is_empty());
    assert_eq!(harness.host.control().session_count(), 0);
}

#[tokio::test]
async fn unauthorized_signer_is_rejected() {
    let stranger = IdentityKeyStore::generate();
    let harness = Harness::start(
        HostConfig::default(),
        Arc::new(AllowList::new([stranger.address()])),
    )
    .await;
    let identity = Arc::new(IdentityKeyStore::generate());
    let client = harness.client(identity.clone(), test_config());

    let err = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnauthorizedSender);
    match err {
        Error::Handshake(HandshakeError::UnauthorizedSender { address }) => {
            assert_eq!(address, identity.address());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(client.registry().is_empty());
    assert_eq!(harness.host.control().session_count(), 0);
}

#[tokio::test]
async fn unknown_host_address_fails_the_handshake() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let other = IdentityKeyStore::generate();

    let err = client
        .start_session(other.address(), &harness.host.url(), echo_params())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Handshake(HandshakeError::UnknownPeer(_))),
        "unexpected error: {err:?}"
    );
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn unserved_model_is_refused() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());

    let err = client
        .start_session(
            &harness.host_address(),
            &harness.host.url(),
            SessionParams {
                model: "no-such-model".into(),
                max_tokens: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelNotAvailable);
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn duplicate_session_id_is_refused_while_live() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let host = harness.host_address();
    let url = harness.host.url();

    let first = client
        .start_session_with_id("dup-1", &host, &url, echo_params())
        .await
        .unwrap();
    let err = client
        .start_session_with_id("dup-1", &host, &url, echo_params())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::SessionAlreadyActive(ref id)) if id == "dup-1"
    ));
    assert_eq!(first.state(), SessionState::Active);

    // Once closed on both ends, the id is free again.
    first.close().await.unwrap();
    let control = harness.host.control().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while control.knows("dup-1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("host kept the session after session_end");
    let second = client
        .start_session_with_id("dup-1", &host, &url, echo_params())
        .await
        .unwrap();
    second.close().await.unwrap();
}

// ── Resume ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn dropped_connection_resumes_the_session() {
    let harness = Harness::open(HostConfig {
        token_delay_ms: 20,
        ..HostConfig::default()
    })
    .await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let mut stream = session.prompt(words(40)).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "w1");

    harness.host.control().drop_connections();

    // The in-flight generation ends with a network error.
    let failure = loop {
        match stream.next().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e,
            None => panic!("stream ended without the disconnect surfacing"),
        }
    };
    assert_eq!(failure.code(), ErrorCode::NetworkError);

    let state = tokio::time::timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Active))
        .await
        .expect("timeout waiting for resume");
    assert_eq!(state, SessionState::Active);
    assert_eq!(session.snapshot().resumes, 1);

    // Same key, same session: a new prompt goes through.
    let (text, _) = session.prompt("after resume").await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "after resume");
    assert!(harness.host.control().knows(&session.id()));

    session.close().await.unwrap();
}

#[tokio::test]
async fn resume_keeps_checkpoint_progress() {
    let harness = Harness::open(HostConfig::default()).await;
    let mut config = test_config();
    config.checkpoint.checkpoint_token_interval = 5;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    let session_id = session.id();

    let (_, completion) = session.prompt(words(10)).await.unwrap().collect_text().await.unwrap();
    assert_eq!(completion.last_checkpoint_number, 2);
    harness.wait_for_checkpoints(&session_id, 2).await;

    harness.host.control().drop_connections();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snap = session.snapshot();
            if snap.resumes == 1 && snap.state == SessionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for resume");

    let snap = session.snapshot();
    assert_eq!(snap.last_checkpoint_number, 2);
    assert_eq!(snap.token_count, 10);

    // Work after the resume is counted from where the checkpoints left off.
    let (_, completion) = session.prompt(words(5)).await.unwrap().collect_text().await.unwrap();
    assert_eq!(completion.session_token_count, 15);
    assert_eq!(completion.last_checkpoint_number, 3);

    let log = harness.wait_for_checkpoints(&session_id, 3).await;
    let counts: Vec<u64> = log.iter().map(|c| c.token_count).collect();
    assert_eq!(counts, vec![5, 10, 15]);

    session.close().await.unwrap();
}

#[tokio::test]
async fn resume_refused_by_host_fails_the_session() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    let session_id = session.id();

    assert!(harness.host.control().forget_session(&session_id));
    harness.host.control().drop_connections();

    let state = tokio::time::timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Closed))
        .await
        .expect("timeout waiting for failure");
    assert_eq!(state, SessionState::Failed);
    assert!(client.registry().is_empty());

    let err = session.prompt("anyone there").await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::Closed)));
}

/// Poll until the session is `Active` again after `resumes` resumes.
async fn wait_for_resumes(session: &sw_client::SessionHandle, resumes: u32) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snap = session.snapshot();
            if snap.resumes >= resumes && snap.state == SessionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for resume");
}

#[tokio::test]
async fn exhausted_resume_fails_with_a_network_error() {
    let mut harness = Harness::open(HostConfig::default()).await;
    let mut config = test_config();
    config.transport.reconnect_max_attempts = 3;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    harness.host.shutdown();
    harness.host.wait().await;
    // Anything accepted before the listener closed goes too.
    harness.host.control().drop_connections();

    let state = tokio::time::timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Closed))
        .await
        .expect("timeout waiting for failure");
    assert_eq!(state, SessionState::Failed);
    match session.failure() {
        Some(Error::Network(NetworkError::ReconnectExhausted(3))) => {}
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(session.failure().unwrap().code(), ErrorCode::NetworkError);
    assert!(client.registry().is_empty());
    assert!(session.prompt("anyone there").await.is_err());
}

#[tokio::test]
async fn silent_connection_trips_liveness_and_resumes() {
    let harness = Harness::open(HostConfig::default()).await;
    let mut config = test_config();
    config.transport.heartbeat_interval_ms = 50;
    config.transport.liveness_timeout_ms = 300;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    // The socket stays open; only the frames stop.
    harness.host.control().stall_connections();
    wait_for_resumes(&session, 1).await;
    assert_eq!(session.snapshot().resumes, 1);
    assert!(session.failure().is_none());

    let (text, _) = session.prompt("still here").await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "still here");
    session.close().await.unwrap();
}

#[tokio::test]
async fn replayed_frame_drops_the_connection_and_resumes_once() {
    let harness = Harness::open(HostConfig {
        token_delay_ms: 20,
        ..HostConfig::default()
    })
    .await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    harness.host.control().duplicate_next_message();
    let mut stream = session.prompt(words(10)).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "w1");

    // The second copy of w1 never reaches the stream.
    let failure = loop {
        match stream.next().await {
            Some(Ok(token)) => panic!("token after a replay: {token:?}"),
            Some(Err(e)) => break e,
            None => panic!("stream ended without the replay surfacing"),
        }
    };
    assert_eq!(failure.code(), ErrorCode::ReplayedMessage);

    wait_for_resumes(&session, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = session.snapshot();
    assert_eq!(snap.resumes, 1);
    assert_eq!(snap.state, SessionState::Active);
    assert_eq!(snap.token_count, 1);

    let (text, _) = session.prompt("after replay").await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "after replay");
    session.close().await.unwrap();
}

#[tokio::test]
async fn oversize_frame_is_dropped_before_parsing() {
    let harness = Harness::open(HostConfig::default()).await;
    let mut config = test_config();
    config.transport.max_message_bytes = 1_024;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), config);
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    // The middle word's frame is several kilobytes once sealed.
    let prompt = format!("short {} tail", "x".repeat(2_000));
    let (text, completion) = session.prompt(prompt).await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "short tail");
    assert_eq!(completion.finish_reason, FinishReason::Stop);
    assert_eq!(completion.session_token_count, 2);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.snapshot().resumes, 0);

    session.close().await.unwrap();
}

// ── Host-reported limits ────────────────────────────────────────────────

#[tokio::test]
async fn token_limit_carries_the_host_figures() {
    let harness = Harness::open(HostConfig {
        context_window: 8,
        ..HostConfig::default()
    })
    .await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let mut stream = session.prompt(words(10)).await.unwrap();
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::TokenLimitExceeded);
    assert!(!err.is_retryable());
    match err {
        Error::TokenLimit(TokenLimitError {
            prompt_tokens,
            context_window_size,
        }) => {
            assert_eq!(prompt_tokens, 10);
            assert_eq!(context_window_size, 8);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(stream.next().await.is_none());

    // The session survives and the next prompt fits.
    assert_eq!(session.state(), SessionState::Active);
    let (text, _) = session.prompt("short one").await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "short one");
    session.close().await.unwrap();
}

#[tokio::test]
async fn context_warning_fires_past_the_threshold() {
    let harness = Harness::open(HostConfig {
        context_window: 10,
        ..HostConfig::default()
    })
    .await;
    let warnings: Arc<Mutex<Vec<ContextWarning>>> = Arc::default();
    let sink = warnings.clone();
    let client = harness.client_with(
        Arc::new(IdentityKeyStore::generate()),
        test_config(),
        move |b| b.on_context_warning(move |w| sink.lock().push(w.clone())),
    );
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    // 2 prompt + 2 completion of 10: below 0.8.
    session.prompt("one two").await.unwrap().collect_text().await.unwrap();
    assert!(warnings.lock().is_empty());

    // 5 prompt + 5 completion of 10: full.
    let (_, completion) = session.prompt(words(5)).await.unwrap().collect_text().await.unwrap();
    assert_eq!(completion.usage.context_window_size, 10);

    let seen = warnings.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session_id, session.id());
    assert_eq!(seen[0].prompt_tokens, 5);
    assert_eq!(seen[0].completion_tokens, 5);
    assert_eq!(seen[0].threshold, 0.8);
    assert!((seen[0].utilization - 1.0).abs() < f64::EPSILON);

    session.close().await.unwrap();
}

#[tokio::test]
async fn max_tokens_caps_the_completion() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let (text, completion) = session
        .prompt_with(words(6), Some(3))
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "w1 w2 w3");
    assert_eq!(completion.finish_reason, FinishReason::Length);
    assert_eq!(completion.usage.completion_tokens, 3);
    session.close().await.unwrap();
}

// ── Cancel and misuse ───────────────────────────────────────────────────

#[tokio::test]
async fn cancel_ends_the_stream_with_cancelled() {
    let harness = Harness::open(HostConfig {
        token_delay_ms: 20,
        ..HostConfig::default()
    })
    .await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let mut stream = session.prompt(words(50)).await.unwrap();
    stream.next().await.unwrap().unwrap();
    stream.cancel().await.unwrap();

    let mut after = 0;
    while let Some(token) = stream.next().await {
        token.unwrap();
        after += 1;
    }
    assert!(after < 49, "cancel did not stop the stream ({after} more tokens)");
    assert_eq!(stream.completion().unwrap().finish_reason, FinishReason::Cancelled);

    // The session is ready for the next prompt.
    let (text, _) = session.prompt("next").await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "next");
    session.close().await.unwrap();
}

#[tokio::test]
async fn second_prompt_while_streaming_is_refused() {
    let harness = Harness::open(HostConfig {
        token_delay_ms: 20,
        ..HostConfig::default()
    })
    .await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();

    let _stream = session.prompt(words(20)).await.unwrap();
    let err = session.prompt("too soon").await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::GenerationInProgress)));

    // Closing mid-stream still settles.
    assert_eq!(session.close().await.unwrap(), SettlementOutcome::Acknowledged);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn closed_session_refuses_prompts() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    session.close().await.unwrap();

    let err = session.prompt("hello").await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::Closed)));
}

// ── Settlement ──────────────────────────────────────────────────────────

/// Settlement that is never reachable.
#[derive(Default)]
struct Unreachable {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl SettlementService for Unreachable {
    async fn submit_checkpoint(&self, _: &str, _: &Checkpoint) -> Result<(), SettlementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SettlementError::Unavailable("settlement offline".into()))
    }
}

#[tokio::test]
async fn unsettled_close_holds_until_abandoned() {
    let harness = Harness::open(HostConfig::default()).await;
    let settlement = Arc::new(Unreachable::default());
    let mut config = test_config();
    config.checkpoint.submit_max_attempts = 2;
    let service = settlement.clone();
    let client = harness.client_with(Arc::new(IdentityKeyStore::generate()), config, move |b| {
        b.settlement(service)
    });
    let session = client
        .start_session(&harness.host_address(), &harness.host.url(), echo_params())
        .await
        .unwrap();
    session.prompt("a b c").await.unwrap().collect_text().await.unwrap();

    let err = session.close().await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::Checkpoint(CheckpointError::SubmissionFailed { number: 1, attempts: 2, .. })
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(settlement.calls.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), SessionState::Closing);
    assert_eq!(client.registry().len(), 1);
    assert!(session.prompt("more").await.is_err());

    let through = session.abandon_pending_checkpoints().await.unwrap();
    assert_eq!(through, 1);
    let state = tokio::time::timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Closed))
        .await
        .expect("timeout waiting for close");
    assert_eq!(state, SessionState::Closed);
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn client_shutdown_closes_every_session() {
    let harness = Harness::open(HostConfig::default()).await;
    let client = harness.client(Arc::new(IdentityKeyStore::generate()), test_config());
    let host = harness.host_address();
    let url = harness.host.url();

    let a = client.start_session(&host, &url, echo_params()).await.unwrap();
    let b = client.start_session(&host, &url, echo_params()).await.unwrap();
    assert_eq!(client.sessions().len(), 2);

    client.shutdown().await;
    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(b.state(), SessionState::Closed);
    assert!(client.registry().is_empty());

    let err = client.start_session(&host, &url, echo_params()).await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::Closed)));
}
