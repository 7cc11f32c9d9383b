//! Field sync - pending-log push and cursor-based pull
//!
//! Handles:
//! - Wire payloads for sync-down and sync-up
//! - The client's pending mutation log
//! - Server-side upsert-by-identifier
//! - Transports and the client coordinator loop

pub mod coordinator;
pub mod outbox;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports
pub use coordinator::{PullOutcome, PullReport, PushOutcome, PushReport, SyncCoordinator, SyncReport, SyncTrigger};
pub use outbox::{MutationKind, PendingMutation};
pub use protocol::{
    PushFailure, PushFailureReason, PushStatus, SamplePayload, SessionPayload, SyncDownResponse, SyncUpRequest,
    SyncUpResponse,
};
pub use server::{AssessorIdentity, SyncServer};
pub use transport::{HttpTransport, LoopbackTransport, SyncTransport};
