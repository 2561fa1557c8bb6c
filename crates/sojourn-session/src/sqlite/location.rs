//! Where each persisted scope's map lives.
//!
//! App and user state are rows in the `states` table. Session state is not:
//! it is the `state` column of the session's own row. Both sit behind
//! [`StateLocation`] so the merge path is identical for every scope.

use super::db;
use crate::locks::RowKey;
use crate::state::Scope;
use rusqlite::{params, Connection, OptionalExtension};
use sojourn_core::{SojournError, SojournResult, StateMap};

pub(crate) trait StateLocation: Sync {
    /// Read the stored map, `None` if the row does not exist.
    ///
    /// Inside a write transaction the caller must hold the [`RowKey`] lock,
    /// which makes this a select-for-update.
    fn load(&self, conn: &Connection, key: &RowKey) -> SojournResult<Option<StateMap>>;

    /// Persist `state`: update when the row `existed`, insert otherwise.
    fn save(
        &self,
        conn: &Connection,
        key: &RowKey,
        state: &StateMap,
        existed: bool,
        now: i64,
    ) -> SojournResult<()>;
}

/// App and user state in the `states` table.
pub(crate) struct ScopedStateTable;

/// Session state in the `sessions.state` column.
pub(crate) struct SessionStateColumn;

/// Storage backend for a persisted scope. Temp has none.
pub(crate) fn location_for(scope: Scope) -> Option<&'static dyn StateLocation> {
    match scope {
        Scope::App | Scope::User => Some(&ScopedStateTable),
        Scope::Session => Some(&SessionStateColumn),
        Scope::Temp => None,
    }
}

/// Primary key columns of a `states` row: (scope, app_name, user_id).
fn states_pk(key: &RowKey) -> SojournResult<(&'static str, &str, &str)> {
    match key {
        RowKey::App { app_name } => Ok(("app", app_name, "")),
        RowKey::User { app_name, user_id } => Ok(("user", app_name, user_id)),
        RowKey::Session { .. } => Err(SojournError::Storage(format!(
            "{key} is not stored in the states table"
        ))),
    }
}

fn session_pk(key: &RowKey) -> SojournResult<(&str, &str, &str)> {
    match key {
        RowKey::Session {
            app_name,
            user_id,
            session_id,
        } => Ok((app_name, user_id, session_id)),
        other => Err(SojournError::Storage(format!(
            "{other} is not a session row"
        ))),
    }
}

fn parse_map(raw: &str) -> SojournResult<StateMap> {
    Ok(serde_json::from_str(raw)?)
}

impl StateLocation for ScopedStateTable {
    fn load(&self, conn: &Connection, key: &RowKey) -> SojournResult<Option<StateMap>> {
        let (scope, app_name, user_id) = states_pk(key)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM states
                 WHERE scope = ?1 AND app_name = ?2 AND user_id = ?3 AND session_id = ''",
                params![scope, app_name, user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        raw.as_deref().map(parse_map).transpose()
    }

    fn save(
        &self,
        conn: &Connection,
        key: &RowKey,
        state: &StateMap,
        existed: bool,
        now: i64,
    ) -> SojournResult<()> {
        let (scope, app_name, user_id) = states_pk(key)?;
        let json = serde_json::to_string(state)?;
        let written = if existed {
            conn.execute(
                "UPDATE states SET state = ?4, update_time = ?5
                 WHERE scope = ?1 AND app_name = ?2 AND user_id = ?3 AND session_id = ''",
                params![scope, app_name, user_id, json, now],
            )
        } else {
            conn.execute(
                "INSERT INTO states (scope, app_name, user_id, session_id, state, update_time)
                 VALUES (?1, ?2, ?3, '', ?4, ?5)",
                params![scope, app_name, user_id, json, now],
            )
        };
        written.map_err(db)?;
        Ok(())
    }
}

impl StateLocation for SessionStateColumn {
    fn load(&self, conn: &Connection, key: &RowKey) -> SojournResult<Option<StateMap>> {
        let (app_name, user_id, session_id) = session_pk(key)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![app_name, user_id, session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        raw.as_deref().map(parse_map).transpose()
    }

    /// Inserting creates the session row itself.
    fn save(
        &self,
        conn: &Connection,
        key: &RowKey,
        state: &StateMap,
        existed: bool,
        now: i64,
    ) -> SojournResult<()> {
        let (app_name, user_id, session_id) = session_pk(key)?;
        let json = serde_json::to_string(state)?;
        let written = if existed {
            conn.execute(
                "UPDATE sessions SET state = ?4, update_time = ?5
                 WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![app_name, user_id, session_id, json, now],
            )
        } else {
            conn.execute(
                "INSERT INTO sessions (app_name, user_id, id, state, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![app_name, user_id, session_id, json, now],
            )
        };
        written.map_err(db)?;
        Ok(())
    }
}

/// Lock-then-merge for one scope: load (absent means empty), apply the
/// delta, upsert, and return the merged map.
pub(crate) fn merge_scope(
    conn: &Connection,
    scope: Scope,
    key: &RowKey,
    delta: &StateMap,
    now: i64,
) -> SojournResult<StateMap> {
    let location = location_for(scope).ok_or_else(|| {
        SojournError::Storage(format!("{scope:?} state has no storage location"))
    })?;
    let existing = location.load(conn, key)?;
    let existed = existing.is_some();
    let mut merged = existing.unwrap_or_default();
    crate::state::apply_delta(&mut merged, delta);
    location.save(conn, key, &merged, existed, now)?;
    Ok(merged)
}
