//! Append-only event log.
//!
//! Rows are only ever inserted; they disappear solely through the cascade
//! when their session is deleted. Log order is `timestamp`, then insertion
//! order (`rowid`) for equal timestamps.

use super::{db, from_micros, to_micros};
use crate::locks::RowKey;
use rusqlite::{params, Connection, Row};
use sojourn_core::{Event, SojournError, SojournResult};

const EVENT_COLUMNS: &str = "id, invocation_id, author, actions, branch, timestamp, content, \
     grounding_metadata, usage_metadata, citation_metadata, custom_metadata, \
     long_running_tool_ids, partial, turn_complete, interrupted, error_code, error_message";

/// Raw `events` row; JSON columns are still text.
struct EventRow {
    id: String,
    invocation_id: String,
    author: String,
    actions: String,
    branch: Option<String>,
    timestamp: i64,
    content: Option<String>,
    grounding_metadata: Option<String>,
    usage_metadata: Option<String>,
    citation_metadata: Option<String>,
    custom_metadata: Option<String>,
    long_running_tool_ids: Option<String>,
    partial: Option<bool>,
    turn_complete: Option<bool>,
    interrupted: Option<bool>,
    error_code: Option<String>,
    error_message: Option<String>,
}

fn to_json(value: &Option<serde_json::Value>) -> SojournResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(SojournError::from)
}

fn from_json(raw: Option<String>) -> SojournResult<Option<serde_json::Value>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(SojournError::from)
}

impl EventRow {
    fn from_event(event: &Event) -> SojournResult<Self> {
        let long_running_tool_ids = if event.long_running_tool_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.long_running_tool_ids)?)
        };
        Ok(Self {
            id: event.id.clone(),
            invocation_id: event.invocation_id.clone(),
            author: event.author.clone(),
            actions: serde_json::to_string(&event.actions)?,
            branch: event.branch.clone(),
            timestamp: to_micros(event.timestamp),
            content: to_json(&event.content)?,
            grounding_metadata: to_json(&event.grounding_metadata)?,
            usage_metadata: to_json(&event.usage_metadata)?,
            citation_metadata: to_json(&event.citation_metadata)?,
            custom_metadata: to_json(&event.custom_metadata)?,
            long_running_tool_ids,
            partial: event.partial,
            turn_complete: event.turn_complete,
            interrupted: event.interrupted,
            error_code: event.error_code.clone(),
            error_message: event.error_message.clone(),
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            invocation_id: row.get(1)?,
            author: row.get(2)?,
            actions: row.get(3)?,
            branch: row.get(4)?,
            timestamp: row.get(5)?,
            content: row.get(6)?,
            grounding_metadata: row.get(7)?,
            usage_metadata: row.get(8)?,
            citation_metadata: row.get(9)?,
            custom_metadata: row.get(10)?,
            long_running_tool_ids: row.get(11)?,
            partial: row.get(12)?,
            turn_complete: row.get(13)?,
            interrupted: row.get(14)?,
            error_code: row.get(15)?,
            error_message: row.get(16)?,
        })
    }

    fn into_event(self) -> SojournResult<Event> {
        let long_running_tool_ids = match self.long_running_tool_ids.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        Ok(Event {
            id: self.id,
            invocation_id: self.invocation_id,
            author: self.author,
            actions: serde_json::from_str(&self.actions)?,
            branch: self.branch,
            timestamp: from_micros(self.timestamp)?,
            content: from_json(self.content)?,
            grounding_metadata: from_json(self.grounding_metadata)?,
            usage_metadata: from_json(self.usage_metadata)?,
            citation_metadata: from_json(self.citation_metadata)?,
            custom_metadata: from_json(self.custom_metadata)?,
            long_running_tool_ids,
            partial: self.partial,
            turn_complete: self.turn_complete,
            interrupted: self.interrupted,
            error_code: self.error_code,
            error_message: self.error_message,
        })
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
            "events belong to sessions, not {other}"
        ))),
    }
}

/// Insert one event for the session identified by `key`.
pub(crate) fn insert(conn: &Connection, key: &RowKey, event: &Event) -> SojournResult<()> {
    let (app_name, user_id, session_id) = session_pk(key)?;
    let row = EventRow::from_event(event)?;
    conn.execute(
        &format!(
            "INSERT INTO events (app_name, user_id, session_id, {EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ),
        params![
            app_name,
            user_id,
            session_id,
            row.id,
            row.invocation_id,
            row.author,
            row.actions,
            row.branch,
            row.timestamp,
            row.content,
            row.grounding_metadata,
            row.usage_metadata,
            row.citation_metadata,
            row.custom_metadata,
            row.long_running_tool_ids,
            row.partial,
            row.turn_complete,
            row.interrupted,
            row.error_code,
            row.error_message,
        ],
    )
    .map_err(db)?;
    Ok(())
}

/// Events for a session in log order, keeping `timestamp >= after` and then
/// only the last `limit` of those.
pub(crate) fn load(
    conn: &Connection,
    key: &RowKey,
    after: Option<i64>,
    limit: Option<usize>,
) -> SojournResult<Vec<Event>> {
    let (app_name, user_id, session_id) = session_pk(key)?;
    // Newest first so LIMIT keeps the most recent, then flip back.
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND timestamp >= ?4
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?5"
        ))
        .map_err(db)?;
    let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
    let rows = stmt
        .query_map(
            params![app_name, user_id, session_id, after.unwrap_or(i64::MIN), limit],
            EventRow::from_row,
        )
        .map_err(db)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db)?;

    rows.into_iter()
        .rev()
        .map(EventRow::into_event)
        .collect()
}
