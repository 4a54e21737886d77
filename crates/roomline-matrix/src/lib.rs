//! Client-side synchronization engine for a room-based, event-sourced
//! messaging protocol.
//!
//! The crate keeps a local application consistent with remote room state:
//! the [`sync::SyncEngine`] turns a cursor-based delta feed plus backward
//! pagination into gap-free, chronologically ordered batches, the
//! [`stream`] driver wraps it into a cancellable backoff-aware sequence,
//! and the [`command::CommandQueue`] delivers outbound calls in order
//! despite transient failures. [`http::HttpApi`] binds everything to a
//! live homeserver.

/// Outbound command queue and delivery loop.
pub mod command;
/// HTTP endpoint bindings.
pub mod http;
/// Session credentials and single-flight token refresh.
pub mod session;
/// Stream driver: continuous polling with backoff and cancellation.
pub mod stream;
/// Sync engine: delta fetch plus concurrent gap catch-up.
pub mod sync;
/// Wire-level request/response shapes.
pub mod wire;

pub use command::{CommandQueue, CommandTransport, Operation, PendingCommand};
pub use http::{media_download_url, HttpApi};
pub use session::{Credentials, NoopListener, Session, SessionListener, TokenPair};
pub use stream::{stream, FilterSource, SyncStream};
pub use sync::{SyncEngine, SyncTransport, DEFAULT_POLL_TIMEOUT};
pub use wire::{Direction, MessagesOptions, MessagesPage, SyncResponse};
