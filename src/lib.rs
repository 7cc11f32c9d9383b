//! verisca-sync: offline-first crop loss assessment
//!
//! Field assessors record damage samples while disconnected. This crate turns
//! those samples into a frozen loss percentage and keeps the field device and
//! the central server consistent once connectivity returns:
//! - Lookup tables: piecewise-linear growth-stage reference curves
//! - Assessment: sample aggregation and loss calculation
//! - Sessions: the `draft -> in_progress -> completed -> synced` lifecycle
//! - Sync: pending-log push, cursor-based pull, HTTP and loopback transports

pub mod api;
pub mod assess;
pub mod client;
pub mod config;
pub mod error;
pub mod lookup;
pub mod model;
pub mod session;
pub mod storage;
pub mod sync;

pub use client::FieldClient;
pub use config::Config;
pub use error::{Error, ErrorCategory, Result, SyncError};
pub use lookup::{LookupSource, LookupTableEntry, LookupTableStore};
pub use session::{NewSample, SessionHandle};
pub use storage::{LocalStore, ServerStore};
pub use sync::{AssessorIdentity, SyncCoordinator, SyncServer};
