use crate::service::{
    select_events, CreateRequest, DeleteRequest, GetRequest, ListRequest, SessionService,
};
use crate::session::{Session, SessionSummary, StoredSession};
use crate::state::{self, MergedState, Scope, ScopedDeltas};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sojourn_core::{Event, SojournError, SojournResult, StateMap};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

type SessionId = (String, String, String);

struct SessionRecord {
    state: StateMap,
    events: Vec<Event>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    app_state: HashMap<String, StateMap>,
    user_state: HashMap<(String, String), StateMap>,
    /// Event ids are unique across every session.
    event_ids: HashSet<String>,
}

impl Tables {
    fn compose(&self, app_name: &str, user_id: &str, session_state: &StateMap) -> StateMap {
        let empty = StateMap::new();
        let app = self.app_state.get(app_name).unwrap_or(&empty);
        let user = self
            .user_state
            .get(&(app_name.to_string(), user_id.to_string()))
            .unwrap_or(&empty);
        state::compose(session_state, app, user)
    }

    /// Merge app and user deltas into the shared maps.
    fn merge_shared(&mut self, app_name: &str, user_id: &str, deltas: &ScopedDeltas) -> MergedState {
        let mut merged = MergedState::default();
        if !deltas.app.is_empty() {
            let app = self.app_state.entry(app_name.to_string()).or_default();
            state::apply_delta(app, &deltas.app);
            merged.set(Scope::App, app.clone());
        }
        if !deltas.user.is_empty() {
            let user = self
                .user_state
                .entry((app_name.to_string(), user_id.to_string()))
                .or_default();
            state::apply_delta(user, &deltas.user);
            merged.set(Scope::User, user.clone());
        }
        merged
    }
}

/// Process-local session service. Same contract as the SQLite store,
/// nothing survives a restart. Suited to tests and single-process runs.
///
/// Each write holds the table lock for its whole critical section, which
/// never awaits, so every append is atomic.
#[derive(Default)]
pub struct InMemorySessionService {
    tables: RwLock<Tables>,
}

impl InMemorySessionService {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create(&self, req: CreateRequest) -> SojournResult<StoredSession> {
        req.validate()?;
        let session_id = req
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deltas = ScopedDeltas::split(&req.state.unwrap_or_default());
        let key = (req.app_name.clone(), req.user_id.clone(), session_id.clone());

        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&key) {
            return Err(SojournError::AlreadyExists(format!(
                "session/{}/{}/{session_id}",
                req.app_name, req.user_id
            )));
        }

        tables.merge_shared(&req.app_name, &req.user_id, &deltas);
        let mut session_state = StateMap::new();
        state::apply_delta(&mut session_state, &deltas.session);
        let now = Utc::now();
        let view = tables.compose(&req.app_name, &req.user_id, &session_state);
        tables.sessions.insert(
            key,
            SessionRecord {
                state: session_state,
                events: Vec::new(),
                updated_at: now,
            },
        );
        drop(tables);

        info!(app = %req.app_name, user = %req.user_id, session = %session_id, "Session created");

        Ok(StoredSession {
            id: session_id,
            app_name: req.app_name,
            user_id: req.user_id,
            state: view,
            events: Vec::new(),
            last_update_time: now,
        })
    }

    async fn get(&self, req: GetRequest) -> SojournResult<StoredSession> {
        req.validate()?;
        let key = (req.app_name.clone(), req.user_id.clone(), req.session_id.clone());

        let tables = self.tables.read().await;
        let record = tables.sessions.get(&key).ok_or_else(|| {
            SojournError::NotFound(format!(
                "session/{}/{}/{}",
                req.app_name, req.user_id, req.session_id
            ))
        })?;

        let mut ordered = record.events.clone();
        // Stable sort keeps insertion order for equal timestamps.
        ordered.sort_by_key(|e| e.timestamp);
        let events = select_events(&ordered, req.after, req.limit());
        let state = tables.compose(&req.app_name, &req.user_id, &record.state);
        let last_update_time = record.updated_at;
        drop(tables);

        debug!(session = %req.session_id, events = events.len(), "Session loaded");

        Ok(StoredSession {
            id: req.session_id,
            app_name: req.app_name,
            user_id: req.user_id,
            state,
            events,
            last_update_time,
        })
    }

    async fn list(&self, req: ListRequest) -> SojournResult<Vec<SessionSummary>> {
        req.validate()?;
        let tables = self.tables.read().await;
        let mut sessions: Vec<SessionSummary> = tables
            .sessions
            .iter()
            .filter(|((app, user, _), _)| {
                *app == req.app_name && (req.user_id.is_empty() || *user == req.user_id)
            })
            .map(|((app, user, id), record)| SessionSummary {
                id: id.clone(),
                app_name: app.clone(),
                user_id: user.clone(),
                state: record.state.clone(),
                last_update_time: record.updated_at,
            })
            .collect();
        drop(tables);

        sessions.sort_by(|a, b| {
            b.last_update_time
                .cmp(&a.last_update_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }

    async fn delete(&self, req: DeleteRequest) -> SojournResult<()> {
        req.validate()?;
        let key = (req.app_name.clone(), req.user_id.clone(), req.session_id.clone());
        let removed = {
            let mut tables = self.tables.write().await;
            match tables.sessions.remove(&key) {
                Some(record) => {
                    for event in &record.events {
                        tables.event_ids.remove(&event.id);
                    }
                    true
                }
                None => false,
            }
        };
        info!(session = %req.session_id, deleted = removed, "Session deleted");
        Ok(())
    }

    async fn append_event(&self, session: &mut dyn Session, event: &mut Event) -> SojournResult<()> {
        let stored = StoredSession::downcast(session)?;

        if event.is_partial() {
            return Ok(());
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }

        let mut deltas = ScopedDeltas::split(&event.actions.state_delta);
        let temp = std::mem::take(&mut deltas.temp);
        let mut persisted = event.clone();
        state::strip_temp_keys(&mut persisted.actions.state_delta);

        let key = (stored.app_name.clone(), stored.user_id.clone(), stored.id.clone());
        let now = Utc::now();

        let committed = {
            let mut tables = self.tables.write().await;
            if !tables.sessions.contains_key(&key) {
                Err(SojournError::NotFound(format!(
                    "session/{}/{}/{}",
                    stored.app_name, stored.user_id, stored.id
                )))
            } else if tables.event_ids.contains(&persisted.id) {
                Err(SojournError::AlreadyExists(format!("event {}", persisted.id)))
            } else {
                let mut merged = tables.merge_shared(&stored.app_name, &stored.user_id, &deltas);
                tables.event_ids.insert(persisted.id.clone());
                if let Some(record) = tables.sessions.get_mut(&key) {
                    if !deltas.session.is_empty() {
                        state::apply_delta(&mut record.state, &deltas.session);
                        merged.set(Scope::Session, record.state.clone());
                    }
                    record.events.push(persisted);
                    record.updated_at = now;
                }
                Ok(merged)
            }
        };

        let merged = committed.map_err(|e| {
            warn!(session = %stored.id, event = %event.id, error = %e, "Event append rejected");
            SojournError::append(event.id.clone(), e)
        })?;

        state::strip_temp_keys(&mut event.actions.state_delta);
        stored.apply_committed(event.clone(), &merged, &temp, now);
        debug!(session = %stored.id, event = %event.id, "Event appended");
        Ok(())
    }
}
