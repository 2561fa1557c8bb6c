use crate::session::{Session, SessionSummary, StoredSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sojourn_core::{Event, SojournError, SojournResult, StateMap};

/// Arguments for [`SessionService::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner of the session.
    pub user_id: String,
    /// Generated when `None` or empty.
    pub session_id: Option<String>,
    /// Initial state. `app:` and `user:` keys are merged into the shared
    /// scopes; `temp:` keys are dropped.
    pub state: Option<StateMap>,
}

impl CreateRequest {
    /// Request for the given identity.
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Use this id instead of a generated one.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Initial state for the new session.
    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = Some(state);
        self
    }

    pub(crate) fn validate(&self) -> SojournResult<()> {
        require("app_name", &self.app_name)?;
        require("user_id", &self.user_id)
    }
}

/// Arguments for [`SessionService::get`].
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner of the session.
    pub user_id: String,
    /// Session to address.
    pub session_id: String,
    /// Keep only the last N events (after `after` filtering). `None` or
    /// `Some(0)` returns all.
    pub num_recent_events: Option<usize>,
    /// Keep only events with `timestamp >= after`.
    pub after: Option<DateTime<Utc>>,
}

impl GetRequest {
    /// Request for the given identity.
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Return only the last `n` events. Zero means all.
    pub fn num_recent_events(mut self, n: usize) -> Self {
        self.num_recent_events = Some(n);
        self
    }

    /// Return only events at or after `timestamp`.
    pub fn after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.after = Some(timestamp);
        self
    }

    pub(crate) fn validate(&self) -> SojournResult<()> {
        require("app_name", &self.app_name)?;
        require("user_id", &self.user_id)?;
        require("session_id", &self.session_id)
    }

    /// Effective limit, with `Some(0)` meaning unlimited.
    pub(crate) fn limit(&self) -> Option<usize> {
        self.num_recent_events.filter(|n| *n > 0)
    }
}

/// Arguments for [`SessionService::list`]. An empty `user_id` lists every
/// user's sessions for the app.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner filter. Empty matches every user.
    pub user_id: String,
}

impl ListRequest {
    /// Request for the given identity.
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
        }
    }

    pub(crate) fn validate(&self) -> SojournResult<()> {
        require("app_name", &self.app_name)
    }
}

/// Arguments for [`SessionService::delete`].
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner of the session.
    pub user_id: String,
    /// Session to address.
    pub session_id: String,
}

impl DeleteRequest {
    /// Request for the given identity.
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub(crate) fn validate(&self) -> SojournResult<()> {
        require("app_name", &self.app_name)?;
        require("user_id", &self.user_id)?;
        require("session_id", &self.session_id)
    }
}

fn require(field: &str, value: &str) -> SojournResult<()> {
    if value.trim().is_empty() {
        return Err(SojournError::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Durable store for sessions, their event logs, and app/user/session state.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Persist a new session and return it with app and user state composed in.
    async fn create(&self, req: CreateRequest) -> SojournResult<StoredSession>;

    /// Load a session with composed state and its (optionally filtered) events.
    /// Fails with [`SojournError::NotFound`] if the session does not exist.
    async fn get(&self, req: GetRequest) -> SojournResult<StoredSession>;

    /// Session summaries, most recently updated first.
    async fn list(&self, req: ListRequest) -> SojournResult<Vec<SessionSummary>>;

    /// Hard delete. Deleting a missing session succeeds.
    async fn delete(&self, req: DeleteRequest) -> SojournResult<()>;

    /// Atomically apply the event's state delta, store the event and bump the
    /// session's update time.
    ///
    /// On success `session` is updated in place and `temp:` keys are removed
    /// from `event`'s delta. Partial events are ignored. `session` must be a
    /// handle produced by this crate, otherwise [`SojournError::TypeMismatch`]
    /// is returned before any I/O.
    async fn append_event(&self, session: &mut dyn Session, event: &mut Event) -> SojournResult<()>;
}

/// Keep events with `timestamp >= after`, then the last `limit` of them.
/// `events` must already be in log order.
pub(crate) fn select_events(
    events: &[Event],
    after: Option<DateTime<Utc>>,
    limit: Option<usize>,
) -> Vec<Event> {
    let filtered: Vec<&Event> = events
        .iter()
        .filter(|e| after.map_or(true, |after| e.timestamp >= after))
        .collect();
    let skip = limit.map_or(0, |n| filtered.len().saturating_sub(n));
    filtered.into_iter().skip(skip).cloned().collect()
}
