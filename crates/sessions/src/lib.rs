//! Session bookkeeping shared by both ends of a sealwire session.
//!
//! - **State**: the lifecycle states and their legal transitions
//! - **Session**: the per-session record exposed in snapshots
//! - **Lifecycle**: max-duration and idle expiry
//! - **Transcript**: the rolling digest committed by each checkpoint
//! - **Checkpoint**: signed progress proofs and their settlement

pub mod checkpoint;
pub mod lifecycle;
pub mod session;
pub mod state;
pub mod transcript;

pub use checkpoint::{
    CheckpointManager, CheckpointSubmitter, NoopSettlement, SettlementError, SettlementLedger,
    SettlementOutcome, SettlementService,
};
pub use lifecycle::{CloseReason, LifecycleManager};
pub use session::Session;
pub use state::{SessionRole, SessionState};
pub use transcript::TranscriptDigest;
