//! Session persistence for sojourn agents.
//!
//! A session is an ordered log of [`Event`](sojourn_core::Event)s plus a
//! key/value state map. Keys are scoped by prefix:
//!
//! - `app:` keys are shared by every session of the application,
//! - `user:` keys by every session of one user,
//! - `temp:` keys live only in the caller's in-memory session,
//! - anything else belongs to the session itself.
//!
//! [`SessionService::append_event`] commits an event and its state delta
//! atomically, then mirrors the result into the caller's session object.
//! Two backends implement the service: [`SqliteSessionService`] (behind the
//! default `sqlite` feature) and [`InMemorySessionService`].

/// Store configuration.
pub mod config;
/// Row-level locks for writers.
pub mod locks;
/// Process-local backend.
pub mod memory;
/// The `SessionService` trait and its request types.
pub mod service;
/// Session handles.
pub mod session;
/// Scope classification and delta merging.
pub mod state;

/// SQLite backend.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use config::StoreConfig;
pub use locks::{RowKey, RowLocks};
pub use memory::InMemorySessionService;
pub use service::{CreateRequest, DeleteRequest, GetRequest, ListRequest, SessionService};
pub use session::{Session, SessionSummary, StoredSession};
pub use state::{Scope, ScopedDeltas};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionService;
