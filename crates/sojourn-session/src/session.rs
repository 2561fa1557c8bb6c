use crate::state::{self, MergedState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sojourn_core::{Event, SojournError, SojournResult, StateMap};
use std::any::Any;
use std::fmt;

/// Read access to a conversation session, plus the downcast hook the stores
/// use to reject handles they did not produce.
pub trait Session: Any + Send + Sync + fmt::Debug {
    /// Session id, unique within (app, user).
    fn id(&self) -> &str;
    /// Application the session belongs to.
    fn app_name(&self) -> &str;
    /// Owner of the session.
    fn user_id(&self) -> &str;
    /// Composed view: session keys, `app:` keys, `user:` keys, and any `temp:`
    /// keys applied during the current process.
    fn state(&self) -> &StateMap;
    /// Events in log order.
    fn events(&self) -> &[Event];
    /// Time of the last committed write.
    fn last_update_time(&self) -> DateTime<Utc>;

    /// Mutable `Any` access for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Concrete type name, used in type-mismatch errors.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The session handle produced by every store in this crate.
///
/// It is a snapshot. `append_event` keeps the handle it is given up to date,
/// but other handles for the same session id are not notified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Session id.
    pub id: String,
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner of the session.
    pub user_id: String,
    /// Composed state view.
    pub state: StateMap,
    /// Events in log order.
    pub events: Vec<Event>,
    /// Time of the last committed write.
    pub last_update_time: DateTime<Utc>,
}

impl StoredSession {
    /// Downcast a caller-supplied handle, failing fast on foreign types.
    pub(crate) fn downcast(session: &mut dyn Session) -> SojournResult<&mut StoredSession> {
        let actual = session.type_name();
        session
            .as_any_mut()
            .downcast_mut::<StoredSession>()
            .ok_or(SojournError::TypeMismatch {
                expected: std::any::type_name::<StoredSession>(),
                actual,
            })
    }

    /// Mirror a committed append into this handle.
    pub(crate) fn apply_committed(
        &mut self,
        event: Event,
        merged: &MergedState,
        temp: &StateMap,
        now: DateTime<Utc>,
    ) {
        for (scope, map) in merged.iter() {
            state::mirror(&mut self.state, scope, map);
        }
        state::apply_delta(&mut self.state, temp);
        self.events.push(event);
        self.last_update_time = now;
    }
}

impl Session for StoredSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn state(&self) -> &StateMap {
        &self.state
    }

    fn events(&self) -> &[Event] {
        &self.events
    }

    fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Listing view of a session: its own state only, no app/user state and no
/// events. Use `get` for the full picture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Application the session belongs to.
    pub app_name: String,
    /// Owner of the session.
    pub user_id: String,
    /// Session-scoped state only.
    pub state: StateMap,
    /// Time of the last committed write.
    pub last_update_time: DateTime<Utc>,
}
