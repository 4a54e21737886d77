//! Core building blocks shared by the roomline client crates.
//!
//! This crate is I/O-free: it defines the protocol data model (cursors,
//! events, sync batches, filters), the error taxonomy, the backoff policy
//! used by retry loops, the blocking FIFO behind the command queue, and
//! the power-level role resolver.

/// Stable error types and HTTP classification helpers.
pub mod error;
/// Serializable sync/pagination filters.
pub mod filter;
/// Power-level to role resolution.
pub mod power;
/// Blocking FIFO primitive for the command queue.
pub mod queue;
/// Backoff policy used by retry loops.
pub mod retry;
/// Protocol data model.
pub mod types;

pub use error::{classify_http_status, ClientError, ErrorCategory};
pub use filter::{EventTypeFilter, Filter, RoomFilter, TimelineFilter};
pub use power::{
    can_execute, permissions, resolve_role, roles, Action, Permissions, PowerLevels, Resolution,
    RoleDefinition, Scope, OPERATION_MESSAGE_TYPE,
};
pub use queue::Fifo;
pub use retry::RetryPolicy;
pub use types::{Cursor, Event, SyncBatch};
