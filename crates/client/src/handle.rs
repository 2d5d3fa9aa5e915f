//! Caller-facing handles: [`SessionHandle`] and [`TokenStream`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use sw_domain::error::{Error, SessionError};
use sw_domain::stream::{Completion, StreamToken};
use sw_protocol::Checkpoint;
use sw_sessions::{CloseReason, Session, SessionState, SettlementLedger, SettlementOutcome};

use crate::machine::{Command, StreamEvent};
use crate::registry::SessionSlot;

/// A live session.  Cheap to clone; every clone drives the same task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
}

impl SessionHandle {
    pub(crate) fn new(slot: Arc<SessionSlot>) -> Self {
        Self { slot }
    }

    pub fn id(&self) -> String {
        self.slot.id()
    }

    pub fn state(&self) -> SessionState {
        self.slot.state()
    }

    pub fn snapshot(&self) -> Session {
        self.slot.snapshot()
    }

    /// Settlement progress of this session's checkpoints.
    pub fn settlement(&self) -> SettlementLedger {
        self.slot.settlement()
    }

    /// The error that put the session in `Failed`, if it failed.
    pub fn failure(&self) -> Option<Error> {
        self.slot.failure()
    }

    /// Wait until the session reaches `target` or a terminal state, and
    /// return the state it stopped in.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut rx = self.slot.subscribe_state();
        let reached = rx
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s);
        reached.unwrap_or_else(|_| self.slot.state())
    }

    /// Send a prompt and stream the reply.
    pub async fn prompt(&self, prompt: impl Into<String>) -> Result<TokenStream, Error> {
        self.prompt_with(prompt, None).await
    }

    /// [`prompt`](Self::prompt) with a completion-token cap.
    pub async fn prompt_with(
        &self,
        prompt: impl Into<String>,
        max_tokens: Option<u64>,
    ) -> Result<TokenStream, Error> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Prompt {
            prompt: prompt.into(),
            max_tokens,
            events: events_tx,
            reply: reply_tx,
        })
        .await?;
        let request_id = reply_rx.await.map_err(|_| SessionError::Closed)??;
        Ok(TokenStream {
            request_id,
            events: events_rx,
            commands: self.slot.commands.clone(),
            completion: None,
            finished: false,
        })
    }

    /// Cancel the in-flight generation, if any.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.send(Command::Cancel { request_id: None }).await
    }

    /// Checkpoint whatever has accumulated now.
    pub async fn checkpoint_now(&self) -> Result<Checkpoint, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CheckpointNow { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Give up on every checkpoint not yet settled.  Unblocks a close that
    /// is waiting on settlement.  Returns the highest abandoned number.
    pub async fn abandon_pending_checkpoints(&self) -> Result<u64, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AbandonPending { reply }).await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)?)
    }

    /// Close the session.  Resolves once the final checkpoint is settled or
    /// abandoned; an exhausted submission is returned as an error and the
    /// session stays in `Closing`.
    pub async fn close(&self) -> Result<SettlementOutcome, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close {
            reason: CloseReason::Requested,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), Error> {
        self.slot
            .commands
            .send(cmd)
            .await
            .map_err(|_| SessionError::Closed.into())
    }
}

/// Decrypted tokens of one generation, in order.
///
/// Ends with `None` on normal completion (see [`completion`](Self::completion))
/// or with one `Err` item when the generation fails.  Dropping an unfinished
/// stream cancels the generation.
pub struct TokenStream {
    request_id: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::Sender<Command>,
    completion: Option<Completion>,
    finished: bool,
}

impl TokenStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Set once the stream has ended normally.
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Ask the host to stop.  The stream still ends with a completion.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.commands
            .send(Command::Cancel {
                request_id: Some(self.request_id.clone()),
            })
            .await
            .map_err(|_| SessionError::Closed.into())
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<(String, Completion), Error> {
        let mut text = String::new();
        while let Some(token) = self.next().await {
            text.push_str(&token?.content);
        }
        let completion = self.completion.clone().ok_or(SessionError::Closed)?;
        Ok((text, completion))
    }
}

impl futures_core::Stream for TokenStream {
    type Item = Result<StreamToken, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let item = match ready!(self.events.poll_recv(cx)) {
            Some(StreamEvent::Token(token)) => Some(Ok(token)),
            Some(StreamEvent::Done(completion)) => {
                self.completion = Some(completion);
                self.finished = true;
                None
            }
            Some(StreamEvent::Failed(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            None => {
                self.finished = true;
                Some(Err(SessionError::Closed.into()))
            }
        };
        Poll::Ready(item)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.try_send(Command::Cancel {
                request_id: Some(self.request_id.clone()),
            });
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("request_id", &self.request_id)
            .field("finished", &self.finished)
            .finish()
    }
}
