//! SQLite-backed session service.
//!
//! ## Concurrency model
//!
//! A single connection behind a mutex; every operation runs its statements in
//! one `spawn_blocking` call so the async runtime never blocks on I/O.
//! Writers first take [`RowLocks`] on each logical row they will
//! read-modify-write (app state, user state, the session row), then run the
//! whole transaction, then release the locks. Two appends touching the same
//! app state serialize on its row lock; appends for different users of the
//! same app only contend on the connection for the length of their statements.
//!
//! Reads take no row locks and see the last committed state.

mod events;
mod location;
mod schema;

use crate::config::StoreConfig;
use crate::locks::{RowKey, RowLocks};
use crate::service::{
    CreateRequest, DeleteRequest, GetRequest, ListRequest, SessionService,
};
use crate::session::{Session, SessionSummary, StoredSession};
use crate::state::{self, MergedState, Scope, ScopedDeltas};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use location::{merge_scope, ScopedStateTable, SessionStateColumn, StateLocation};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use sojourn_core::{Event, SojournError, SojournResult, StateMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Classify a driver error: busy/locked is retryable, the rest is not.
pub(crate) fn db(err: rusqlite::Error) -> SojournError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SojournError::Transient(err.to_string())
        }
        _ => SojournError::Storage(err.to_string()),
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> SojournResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| SojournError::Storage(format!("timestamp out of range: {micros}")))
}

/// Stored precision is microseconds; trim in-memory copies to match.
fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Round up to whole microseconds so `timestamp >= after` holds against
/// stored timestamps exactly as it does at full precision.
fn ceil_micros(ts: DateTime<Utc>) -> i64 {
    let micros = ts.timestamp_micros();
    if ts.timestamp_subsec_nanos() % 1_000 == 0 {
        micros
    } else {
        micros + 1
    }
}

/// Raises the flag when dropped armed, i.e. when the caller abandons an
/// append whose blocking half is already queued.
struct CancelOnDrop(Option<Arc<AtomicBool>>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

fn check_cancelled(cancelled: &AtomicBool) -> SojournResult<()> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(SojournError::Transient("append cancelled by caller".to_string()));
    }
    Ok(())
}

/// Rows an operation will write, beyond the session row itself.
fn lock_keys(app_name: &str, user_id: &str, session_id: &str, deltas: &ScopedDeltas) -> Vec<RowKey> {
    let mut keys = vec![RowKey::session(app_name, user_id, session_id)];
    if !deltas.app.is_empty() {
        keys.push(RowKey::app(app_name));
    }
    if !deltas.user.is_empty() {
        keys.push(RowKey::user(app_name, user_id));
    }
    keys
}

fn scope_key(scope: Scope, session_key: &RowKey) -> Option<RowKey> {
    let RowKey::Session {
        app_name, user_id, ..
    } = session_key
    else {
        return None;
    };
    match scope {
        Scope::App => Some(RowKey::app(app_name)),
        Scope::User => Some(RowKey::user(app_name, user_id)),
        Scope::Session => Some(session_key.clone()),
        Scope::Temp => None,
    }
}

/// Merge every persisted scope of `deltas`. Caller holds the row locks and
/// an open transaction.
fn merge_persisted(
    conn: &Connection,
    session_key: &RowKey,
    deltas: &ScopedDeltas,
    now: i64,
) -> SojournResult<MergedState> {
    let mut merged = MergedState::default();
    for (scope, delta) in deltas.persisted() {
        let Some(key) = scope_key(scope, session_key) else {
            continue;
        };
        merged.set(scope, merge_scope(conn, scope, &key, delta, now)?);
    }
    Ok(merged)
}

/// Read app and user state and compose them over `session_state`.
/// Missing rows read as empty maps.
fn compose_view(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_state: &StateMap,
) -> SojournResult<StateMap> {
    let app = ScopedStateTable
        .load(conn, &RowKey::app(app_name))?
        .unwrap_or_default();
    let user = ScopedStateTable
        .load(conn, &RowKey::user(app_name, user_id))?
        .unwrap_or_default();
    Ok(state::compose(session_state, &app, &user))
}

fn session_not_found(key: &RowKey) -> SojournError {
    SojournError::NotFound(key.to_string())
}

fn touch_session(conn: &Connection, key: &RowKey, now: i64) -> SojournResult<()> {
    let RowKey::Session {
        app_name,
        user_id,
        session_id,
    } = key
    else {
        return Err(session_not_found(key));
    };
    conn.execute(
        "UPDATE sessions SET update_time = ?4 WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
        params![app_name, user_id, session_id, now],
    )
    .map_err(db)?;
    Ok(())
}

/// Session service persisting to SQLite.
pub struct SqliteSessionService {
    conn: Arc<Mutex<Connection>>,
    locks: RowLocks,
}

impl SqliteSessionService {
    /// Open (and migrate) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> SojournResult<Self> {
        config.validate()?;
        let path = config.database_path.clone();
        let busy_timeout = config.busy_timeout();

        let conn = tokio::task::spawn_blocking(move || -> SojournResult<Connection> {
            let mut conn = match &path {
                Some(path) => Connection::open(path),
                None => Connection::open_in_memory(),
            }
            .map_err(db)?;
            conn.busy_timeout(busy_timeout).map_err(db)?;
            conn.pragma_update(None, "foreign_keys", "ON").map_err(db)?;
            schema::migrate(&mut conn).map_err(db)?;
            Ok(conn)
        })
        .await
        .map_err(|e| SojournError::Storage(format!("Failed to spawn blocking task: {e}")))??;

        info!(
            path = ?config.database_path,
            schema_version = schema::SCHEMA_VERSION,
            "Session store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: RowLocks::new(config.lock_timeout()),
        })
    }

    /// Open a private in-memory database with default settings.
    pub async fn open_in_memory() -> SojournResult<Self> {
        Self::open(&StoreConfig::default()).await
    }

    async fn run_blocking<F, R>(&self, f: F) -> SojournResult<R>
    where
        F: FnOnce(&mut Connection) -> SojournResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| SojournError::Storage(format!("Task execution failed: {e}")))?
    }

    /// Transaction body of `append_event`. Returns the merged maps to mirror.
    ///
    /// Rolls back with a transient error if `cancelled` is raised before the
    /// commit.
    fn append_in_tx(
        conn: &mut Connection,
        session_key: &RowKey,
        deltas: &ScopedDeltas,
        event: &Event,
        now: i64,
        cancelled: &AtomicBool,
    ) -> SojournResult<MergedState> {
        check_cancelled(cancelled)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;

        if SessionStateColumn.load(&tx, session_key)?.is_none() {
            return Err(session_not_found(session_key));
        }

        let merged = merge_persisted(&tx, session_key, deltas, now)?;
        events::insert(&tx, session_key, event)?;

        touch_session(&tx, session_key, now)?;

        check_cancelled(cancelled)?;
        tx.commit().map_err(db)?;
        Ok(merged)
    }
}

#[async_trait]
impl SessionService for SqliteSessionService {
    async fn create(&self, req: CreateRequest) -> SojournResult<StoredSession> {
        req.validate()?;
        let session_id = req
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deltas = ScopedDeltas::split(&req.state.unwrap_or_default());
        let app_name = req.app_name;
        let user_id = req.user_id;
        let session_key = RowKey::session(&app_name, &user_id, &session_id);

        let _locks = self
            .locks
            .acquire(lock_keys(&app_name, &user_id, &session_id, &deltas))
            .await?;
        let now = truncate_micros(Utc::now());
        let now_micros = to_micros(now);

        let state = {
            let (app_name, user_id, session_key) =
                (app_name.clone(), user_id.clone(), session_key.clone());
            self.run_blocking(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db)?;
                if SessionStateColumn.load(&tx, &session_key)?.is_some() {
                    return Err(SojournError::AlreadyExists(session_key.to_string()));
                }
                let merged = merge_persisted(&tx, &session_key, &deltas, now_micros)?;
                if merged.session.is_none() {
                    SessionStateColumn.save(&tx, &session_key, &StateMap::new(), false, now_micros)?;
                }
                let session_state = merged.session.unwrap_or_default();
                let view = compose_view(&tx, &app_name, &user_id, &session_state)?;
                tx.commit().map_err(db)?;
                Ok(view)
            })
            .await?
        };

        info!(app = %app_name, user = %user_id, session = %session_id, "Session created");

        Ok(StoredSession {
            id: session_id,
            app_name,
            user_id,
            state,
            events: Vec::new(),
            last_update_time: now,
        })
    }

    async fn get(&self, req: GetRequest) -> SojournResult<StoredSession> {
        req.validate()?;
        let limit = req.limit();
        let after = req.after.map(ceil_micros);
        let session_key = RowKey::session(&req.app_name, &req.user_id, &req.session_id);

        let (state, update_time, events) = {
            let (app_name, user_id, session_id) =
                (req.app_name.clone(), req.user_id.clone(), req.session_id.clone());
            self.run_blocking(move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT state, update_time FROM sessions
                         WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                        params![app_name, user_id, session_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(db)?;
                let Some((raw_state, update_time)) = row else {
                    return Err(session_not_found(&session_key));
                };
                let session_state: StateMap = serde_json::from_str(&raw_state)?;
                let view = compose_view(conn, &app_name, &user_id, &session_state)?;
                let events = events::load(conn, &session_key, after, limit)?;
                Ok((view, from_micros(update_time)?, events))
            })
            .await?
        };

        debug!(
            app = %req.app_name,
            user = %req.user_id,
            session = %req.session_id,
            events = events.len(),
            "Session loaded"
        );

        Ok(StoredSession {
            id: req.session_id,
            app_name: req.app_name,
            user_id: req.user_id,
            state,
            events,
            last_update_time: update_time,
        })
    }

    async fn list(&self, req: ListRequest) -> SojournResult<Vec<SessionSummary>> {
        req.validate()?;
        let ListRequest { app_name, user_id } = req;

        let rows = {
            let (app_name, user_id) = (app_name.clone(), user_id.clone());
            self.run_blocking(move |conn| {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, user_id, state, update_time FROM sessions
                         WHERE app_name = ?1 AND (?2 = '' OR user_id = ?2)
                         ORDER BY update_time DESC, id ASC",
                    )
                    .map_err(db)?;
                let rows = stmt
                    .query_map(params![app_name, user_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })
                    .map_err(db)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db)?;
                Ok(rows)
            })
            .await?
        };

        let sessions = rows
            .into_iter()
            .map(|(id, user_id, raw_state, update_time)| {
                Ok(SessionSummary {
                    id,
                    app_name: app_name.clone(),
                    user_id,
                    state: serde_json::from_str(&raw_state)?,
                    last_update_time: from_micros(update_time)?,
                })
            })
            .collect::<SojournResult<Vec<_>>>()?;

        debug!(app = %app_name, user = %user_id, count = sessions.len(), "Sessions listed");
        Ok(sessions)
    }

    async fn delete(&self, req: DeleteRequest) -> SojournResult<()> {
        req.validate()?;
        let session_key = RowKey::session(&req.app_name, &req.user_id, &req.session_id);
        let _locks = self.locks.acquire([session_key]).await?;

        let DeleteRequest {
            app_name,
            user_id,
            session_id,
        } = req;
        let deleted = {
            let (app_name, user_id, session_id) =
                (app_name.clone(), user_id.clone(), session_id.clone());
            self.run_blocking(move |conn| {
                conn.execute(
                    "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                    params![app_name, user_id, session_id],
                )
                .map_err(db)
            })
            .await?
        };

        info!(app = %app_name, user = %user_id, session = %session_id, deleted = deleted > 0, "Session deleted");
        Ok(())
    }

    async fn append_event(&self, session: &mut dyn Session, event: &mut Event) -> SojournResult<()> {
        let stored = StoredSession::downcast(session)?;

        if event.is_partial() {
            debug!(session = %stored.id, "Skipping partial event");
            return Ok(());
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }

        let mut deltas = ScopedDeltas::split(&event.actions.state_delta);
        let temp = std::mem::take(&mut deltas.temp);
        let mut persisted = event.clone();
        persisted.timestamp = truncate_micros(persisted.timestamp);
        state::strip_temp_keys(&mut persisted.actions.state_delta);
        let stored_timestamp = persisted.timestamp;

        let session_key = RowKey::session(&stored.app_name, &stored.user_id, &stored.id);
        let keys = lock_keys(&stored.app_name, &stored.user_id, &stored.id, &deltas);

        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_guard = CancelOnDrop(Some(Arc::clone(&cancelled)));

        let committed = async move {
            let locks = self.locks.acquire(keys).await?;
            let now = truncate_micros(Utc::now());
            let now_micros = to_micros(now);
            let merged = self
                .run_blocking(move |conn| {
                    // Row locks are released only after commit or rollback.
                    let _locks = locks;
                    Self::append_in_tx(
                        conn,
                        &session_key,
                        &deltas,
                        &persisted,
                        now_micros,
                        &cancelled,
                    )
                })
                .await?;
            Ok::<_, SojournError>((merged, now))
        }
        .await;
        cancel_guard.disarm();

        let (merged, now) = committed.map_err(|e| {
            warn!(session = %stored.id, event = %event.id, error = %e, "Event append rolled back");
            SojournError::append(event.id.clone(), e)
        })?;

        event.timestamp = stored_timestamp;
        state::strip_temp_keys(&mut event.actions.state_delta);
        stored.apply_committed(event.clone(), &merged, &temp, now);

        debug!(
            session = %stored.id,
            event = %event.id,
            author = %event.author,
            scopes = ?merged.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            "Event appended"
        );
        Ok(())
    }
}
