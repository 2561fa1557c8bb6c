//! Core types and error definitions for the Sojourn session service.
//!
//! This crate provides the types shared between the session store and its
//! callers: the unified error type, the event record, and the dynamic state map.
//!
//! # Main types
//!
//! - [`SojournError`]: Unified error enum for all Sojourn operations.
//! - [`SojournResult`]: Convenience alias for `Result<T, SojournError>`.
//! - [`Event`]: A single record in a session's append-only event log.
//! - [`EventActions`]: Side effects of an event, including its state delta.
//! - [`StateMap`]: Key → JSON value map used for state and deltas.

/// Error type and result alias.
pub mod error;
/// Event log records.
pub mod event;

pub use error::{SojournError, SojournResult};
pub use event::{Event, EventActions};

use std::collections::HashMap;

/// A dynamic key → value state map.
///
/// Values are tagged JSON values. In a delta, [`serde_json::Value::Null`]
/// means "delete this key", never "set to null".
pub type StateMap = HashMap<String, serde_json::Value>;
