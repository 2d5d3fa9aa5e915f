//! Checkpoints: signed proofs of progress and their settlement.
//!
//! [`CheckpointManager`] lives inside the session task and is purely
//! synchronous: it counts tokens, folds content into the transcript digest
//! and signs a [`Checkpoint`] every `interval` tokens or on flush.
//!
//! [`CheckpointSubmitter`] is a background task per session that forwards
//! checkpoints to the [`SettlementService`] with back-off.  It never blocks
//! generation; the session only waits on it while closing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify};

use sw_crypto::{sign_checkpoint, IdentityKeyStore};
use sw_domain::error::CheckpointError;
use sw_domain::trace::TraceEvent;
use sw_domain::Backoff;
use sw_protocol::Checkpoint;

use crate::transcript::TranscriptDigest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds the append-only checkpoint log of one session.
pub struct CheckpointManager {
    session_id: String,
    identity: Arc<IdentityKeyStore>,
    interval: u64,
    token_count: u64,
    tokens_since: u64,
    digest: TranscriptDigest,
    log: Vec<Checkpoint>,
}

impl CheckpointManager {
    /// `interval == 0` disables automatic checkpoints; flush still works.
    pub fn new(session_id: impl Into<String>, identity: Arc<IdentityKeyStore>, interval: u64) -> Self {
        let session_id = session_id.into();
        let digest = TranscriptDigest::new(&session_id);
        Self {
            session_id,
            identity,
            interval,
            token_count: 0,
            tokens_since: 0,
            digest,
            log: Vec::new(),
        }
    }

    /// Record `count` tokens of `content`.  Returns the checkpoint when this
    /// crosses the interval.
    pub fn on_token_produced(
        &mut self,
        content: &str,
        count: u64,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.digest.absorb(content.as_bytes());
        self.token_count += count;
        self.tokens_since += count;
        if self.interval > 0 && self.tokens_since >= self.interval {
            return self.create().map(Some);
        }
        Ok(None)
    }

    /// Checkpoint whatever has accumulated, even if nothing has.
    pub fn flush(&mut self) -> Result<Checkpoint, CheckpointError> {
        self.create()
    }

    /// Tokens recorded since the last checkpoint.
    pub fn pending_tokens(&self) -> u64 {
        self.tokens_since
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Number of the last checkpoint, `0` before the first.
    pub fn last_number(&self) -> u64 {
        self.log.last().map(|c| c.number).unwrap_or(0)
    }

    /// Retained for resume.
    pub fn last(&self) -> Option<&Checkpoint> {
        self.log.last()
    }

    pub fn log(&self) -> &[Checkpoint] {
        &self.log
    }

    fn create(&mut self) -> Result<Checkpoint, CheckpointError> {
        let number = self.last_number() + 1;
        let digest = self.digest.commit();
        let checkpoint = sign_checkpoint(
            &self.identity,
            &self.session_id,
            number,
            self.token_count,
            &digest,
            Utc::now().timestamp_millis(),
        )
        .map_err(|e| CheckpointError::InvariantViolation(format!("signing failed: {e}")))?;

        if let Some(prev) = self.log.last() {
            if checkpoint.number <= prev.number || checkpoint.token_count < prev.token_count {
                return Err(CheckpointError::InvariantViolation(format!(
                    "checkpoint #{} ({} tokens) does not follow #{} ({} tokens)",
                    checkpoint.number, checkpoint.token_count, prev.number, prev.token_count
                )));
            }
        }

        self.tokens_since = 0;
        self.log.push(checkpoint.clone());

        TraceEvent::CheckpointCreated {
            session_id: self.session_id.clone(),
            number,
            token_count: self.token_count,
        }
        .emit();

        Ok(checkpoint)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("session_id", &self.session_id)
            .field("interval", &self.interval)
            .field("token_count", &self.token_count)
            .field("last_number", &self.last_number())
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settlement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Worth retrying.
    #[error("settlement unavailable: {0}")]
    Unavailable(String),
    /// Permanent refusal.
    #[error("settlement rejected checkpoint: {0}")]
    Rejected(String),
}

/// The external accumulator of checkpoints.
#[async_trait]
pub trait SettlementService: Send + Sync {
    async fn submit_checkpoint(
        &self,
        session_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), SettlementError>;
}

/// Settlement that accepts everything and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSettlement;

#[async_trait]
impl SettlementService for NoopSettlement {
    async fn submit_checkpoint(&self, session_id: &str, checkpoint: &Checkpoint) -> Result<(), SettlementError> {
        tracing::trace!(session_id, number = checkpoint.number, "checkpoint discarded");
        Ok(())
    }
}

/// Progress of one session's submissions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettlementLedger {
    /// Highest number handed to the submitter.
    pub queued: u64,
    /// Highest number the settlement service accepted.
    pub acknowledged: u64,
    /// Everything up to this number was abandoned by the caller.
    pub abandoned_through: u64,
    /// Queued numbers the service has not accepted, whatever became of them.
    pub unacknowledged: BTreeSet<u64>,
    /// Permanent failures by number.
    pub failures: BTreeMap<u64, CheckpointError>,
}

impl SettlementLedger {
    fn is_open(&self, number: u64) -> bool {
        number > self.abandoned_through && !self.failures.contains_key(&number)
    }

    /// Every checkpoint up to `number` has an outcome.
    fn is_settled(&self, number: u64) -> bool {
        self.unacknowledged
            .range(..=number)
            .all(|n| !self.is_open(*n))
    }

    /// Earliest checkpoint up to `number` the service never accepted.
    pub fn earliest_unacknowledged(&self, number: u64) -> Option<u64> {
        self.unacknowledged.range(..=number).next().copied()
    }

    /// Earliest failure up to `number` the caller has not abandoned.
    pub fn earliest_failure(&self, number: u64) -> Option<&CheckpointError> {
        self.failures
            .range(..=number)
            .find(|(n, _)| **n > self.abandoned_through)
            .map(|(_, e)| e)
    }

    /// Checkpoints still waiting on the service.
    pub fn pending(&self) -> u64 {
        self.unacknowledged.iter().filter(|n| self.is_open(**n)).count() as u64
    }
}

/// How the checkpoints up to a waited-on number ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The service accepted every one of them.
    Acknowledged,
    /// Some were given up on; `earliest` is the first never accepted.
    Abandoned { earliest: u64 },
}

/// Background forwarder for one session.
pub struct CheckpointSubmitter {
    session_id: String,
    tx: mpsc::UnboundedSender<Checkpoint>,
    ledger: Arc<watch::Sender<SettlementLedger>>,
    abandon: Arc<Notify>,
}

impl CheckpointSubmitter {
    /// Spawn the forwarding task on the current runtime.
    pub fn spawn(
        session_id: impl Into<String>,
        settlement: Arc<dyn SettlementService>,
        backoff: Backoff,
    ) -> Self {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ledger, _) = watch::channel(SettlementLedger::default());
        let ledger = Arc::new(ledger);
        let abandon = Arc::new(Notify::new());

        tokio::spawn(run_submitter(
            session_id.clone(),
            settlement,
            backoff,
            rx,
            ledger.clone(),
            abandon.clone(),
        ));

        Self {
            session_id,
            tx,
            ledger,
            abandon,
        }
    }

    /// Queue a checkpoint.  Never waits on the settlement service.
    pub fn submit(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let number = checkpoint.number;
        // Recorded before the task can see it, so an early ack is not lost.
        self.ledger.send_modify(|l| {
            l.queued = l.queued.max(number);
            l.unacknowledged.insert(number);
        });
        if self.tx.send(checkpoint).is_err() {
            self.ledger.send_modify(|l| {
                l.failures.insert(number, CheckpointError::SubmitterStopped);
            });
            return Err(CheckpointError::SubmitterStopped);
        }
        Ok(())
    }

    pub fn ledger(&self) -> SettlementLedger {
        self.ledger.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SettlementLedger> {
        self.ledger.subscribe()
    }

    /// Give up on everything queued so far.  Later checkpoints are still
    /// submitted.
    pub fn abandon_pending(&self) -> u64 {
        let mut through = 0;
        self.ledger.send_modify(|l| {
            l.abandoned_through = l.queued;
            through = l.queued;
        });
        self.abandon.notify_waiters();
        tracing::warn!(session_id = %self.session_id, through, "pending checkpoints abandoned");
        through
    }

    /// Wait until every checkpoint up to `number` is acknowledged,
    /// abandoned, or has permanently failed.  The earliest failure not
    /// abandoned is the error.
    pub async fn wait_settled(&self, number: u64) -> Result<SettlementOutcome, CheckpointError> {
        let mut rx = self.ledger.subscribe();
        let ledger = rx
            .wait_for(|l| l.is_settled(number))
            .await
            .map_err(|_| CheckpointError::SubmitterStopped)?
            .clone();
        if let Some(err) = ledger.earliest_failure(number) {
            return Err(err.clone());
        }
        Ok(match ledger.earliest_unacknowledged(number) {
            None => SettlementOutcome::Acknowledged,
            Some(earliest) => SettlementOutcome::Abandoned { earliest },
        })
    }
}

impl std::fmt::Debug for CheckpointSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointSubmitter")
            .field("session_id", &self.session_id)
            .field("ledger", &*self.ledger.borrow())
            .finish()
    }
}

async fn run_submitter(
    session_id: String,
    settlement: Arc<dyn SettlementService>,
    backoff: Backoff,
    mut rx: mpsc::UnboundedReceiver<Checkpoint>,
    ledger: Arc<watch::Sender<SettlementLedger>>,
    abandon: Arc<Notify>,
) {
    while let Some(checkpoint) = rx.recv().await {
        let number = checkpoint.number;
        let abandoned = || ledger.borrow().abandoned_through >= number;
        let mut attempt: u32 = 0;

        loop {
            if abandoned() {
                tracing::debug!(session_id = %session_id, number, "skipping abandoned checkpoint");
                break;
            }

            attempt += 1;
            let result = tokio::select! {
                r = settlement.submit_checkpoint(&session_id, &checkpoint) => r,
                _ = abandon.notified() => continue,
            };

            match result {
                Ok(()) => {
                    ledger.send_modify(|l| {
                        l.acknowledged = l.acknowledged.max(number);
                        l.unacknowledged.remove(&number);
                    });
                    TraceEvent::CheckpointAcknowledged {
                        session_id: session_id.clone(),
                        number,
                        attempts: attempt,
                    }
                    .emit();
                    break;
                }
                Err(SettlementError::Rejected(message)) => {
                    tracing::error!(session_id = %session_id, number, %message, "checkpoint rejected by settlement");
                    ledger.send_modify(|l| {
                        l.failures.insert(number, CheckpointError::Rejected { number, message });
                    });
                    break;
                }
                Err(SettlementError::Unavailable(message)) => {
                    if backoff.should_give_up(attempt) {
                        tracing::error!(
                            session_id = %session_id,
                            number,
                            attempts = attempt,
                            %message,
                            "checkpoint submission gave up"
                        );
                        ledger.send_modify(|l| {
                            l.failures.insert(
                                number,
                                CheckpointError::SubmissionFailed {
                                    number,
                                    attempts: attempt,
                                    message,
                                },
                            );
                        });
                        break;
                    }
                    let delay = backoff.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        session_id = %session_id,
                        number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "checkpoint submission failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abandon.notified() => {}
                    }
                }
            }
        }
    }
    tracing::debug!(session_id = %session_id, "checkpoint submitter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn manager(interval: u64) -> CheckpointManager {
        CheckpointManager::new("s1", Arc::new(IdentityKeyStore::generate()), interval)
    }

    #[test]
    fn fires_on_interval() {
        let mut m = manager(100);
        for _ in 0..99 {
            assert!(m.on_token_produced("w ", 1).unwrap().is_none());
        }
        let cp = m.on_token_produced("w ", 1).unwrap().expect("checkpoint at 100");
        assert_eq!(cp.number, 1);
        assert_eq!(cp.token_count, 100);
        assert_eq!(m.pending_tokens(), 0);
    }

    #[test]
    fn numbers_increase_and_counts_never_decrease() {
        let mut m = manager(10);
        let mut produced = Vec::new();
        for i in 0..95 {
            if let Some(cp) = m.on_token_produced(&format!("t{i}"), 1).unwrap() {
                produced.push(cp);
            }
        }
        produced.push(m.flush().unwrap());
        produced.push(m.flush().unwrap());

        assert_eq!(produced.len(), 11);
        for w in produced.windows(2) {
            assert_eq!(w[1].number, w[0].number + 1);
            assert!(w[1].token_count >= w[0].token_count);
        }
        assert_eq!(produced.last().map(|c| c.token_count), Some(95));
        assert_eq!(m.log().len(), 11);
    }

    #[test]
    fn checkpoints_are_signed_by_the_identity() {
        let identity = Arc::new(IdentityKeyStore::generate());
        let mut m = CheckpointManager::new("s1", identity.clone(), 0);
        m.on_token_produced("hello", 1).unwrap();
        let cp = m.flush().unwrap();
        assert!(sw_crypto::verify_checkpoint_signer("s1", &cp, identity.address()));
    }

    #[test]
    fn digest_links_to_the_previous_checkpoint() {
        let mut m = manager(0);
        m.on_token_produced("a", 1).unwrap();
        let first = m.flush().unwrap();
        m.on_token_produced("b", 1).unwrap();
        m.on_token_produced("c", 1).unwrap();
        let second = m.flush().unwrap();

        let prev: [u8; 32] = hex::decode(&first.digest).unwrap().try_into().unwrap();
        let expected = TranscriptDigest::extend(&prev, [&b"b"[..], &b"c"[..]]);
        assert_eq!(second.digest, hex::encode(expected));
    }

    #[test]
    fn zero_interval_only_flushes() {
        let mut m = manager(0);
        for _ in 0..1000 {
            assert!(m.on_token_produced("x", 1).unwrap().is_none());
        }
        assert_eq!(m.flush().unwrap().token_count, 1000);
    }

    struct Flaky {
        failures_left: AtomicU32,
        accepted: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl SettlementService for Flaky {
        async fn submit_checkpoint(&self, _: &str, cp: &Checkpoint) -> Result<(), SettlementError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SettlementError::Unavailable("down".into()));
            }
            self.accepted.lock().push(cp.number);
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            accepted: Mutex::new(Vec::new()),
        })
    }

    fn fast_backoff(attempts: u32) -> Backoff {
        Backoff::from_millis(1, 5, attempts)
    }

    #[tokio::test]
    async fn retries_until_acknowledged() {
        let service = flaky(2);
        let submitter = CheckpointSubmitter::spawn("s1", service.clone(), fast_backoff(5));
        let mut m = manager(0);
        submitter.submit(m.flush().unwrap()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), submitter.wait_settled(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::Acknowledged);
        assert_eq!(*service.accepted.lock(), vec![1]);
        assert_eq!(submitter.ledger().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_the_backoff_schedule() {
        let service = flaky(3);
        let submitter =
            CheckpointSubmitter::spawn("s1", service.clone(), Backoff::from_millis(10_000, 60_000, 5));
        let mut m = manager(0);
        let started = tokio::time::Instant::now();
        submitter.submit(m.flush().unwrap()).unwrap();

        let outcome = submitter.wait_settled(1).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Acknowledged);
        // 10s + 20s + 40s, each with at most a quarter on top.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(70), "{waited:?}");
        assert!(waited <= Duration::from_millis(87_500), "{waited:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_submission_failed() {
        let service = flaky(u32::MAX);
        let submitter = CheckpointSubmitter::spawn("s1", service, fast_backoff(3));
        let mut m = manager(0);
        submitter.submit(m.flush().unwrap()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), submitter.wait_settled(1))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            err,
            CheckpointError::SubmissionFailed {
                number: 1,
                attempts: 3,
                message: "down".into()
            }
        );
    }

    #[tokio::test]
    async fn abandon_releases_waiters() {
        let service = flaky(u32::MAX);
        // Unlimited attempts: only abandonment ends this.
        let submitter = CheckpointSubmitter::spawn("s1", service, Backoff::from_millis(50, 50, 0));
        let mut m = manager(0);
        submitter.submit(m.flush().unwrap()).unwrap();

        let waiter = submitter.wait_settled(1);
        tokio::pin!(waiter);
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut waiter)
            .await
            .is_err());

        assert_eq!(submitter.abandon_pending(), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::Abandoned { earliest: 1 });
    }

    struct Refusing;

    #[async_trait]
    impl SettlementService for Refusing {
        async fn submit_checkpoint(&self, _: &str, _: &Checkpoint) -> Result<(), SettlementError> {
            Err(SettlementError::Rejected("bad signature".into()))
        }
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let submitter = CheckpointSubmitter::spawn("s1", Arc::new(Refusing), fast_backoff(5));
        let mut m = manager(0);
        submitter.submit(m.flush().unwrap()).unwrap();
        let err = submitter.wait_settled(1).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Rejected { number: 1, .. }));
    }

    /// Refuses checkpoint #1, accepts the rest.
    struct RefuseFirst;

    #[async_trait]
    impl SettlementService for RefuseFirst {
        async fn submit_checkpoint(&self, _: &str, cp: &Checkpoint) -> Result<(), SettlementError> {
            if cp.number == 1 {
                return Err(SettlementError::Rejected("disputed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn later_acknowledgement_does_not_hide_an_earlier_failure() {
        let submitter = CheckpointSubmitter::spawn("s1", Arc::new(RefuseFirst), fast_backoff(5));
        let mut m = manager(0);
        submitter.submit(m.flush().unwrap()).unwrap();
        submitter.submit(m.flush().unwrap()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), submitter.wait_settled(2))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Rejected { number: 1, .. }));
        let ledger = submitter.ledger();
        assert_eq!(ledger.acknowledged, 2);
        assert_eq!(ledger.earliest_unacknowledged(2), Some(1));

        submitter.abandon_pending();
        assert_eq!(
            submitter.wait_settled(2).await.unwrap(),
            SettlementOutcome::Abandoned { earliest: 1 }
        );
    }
}
