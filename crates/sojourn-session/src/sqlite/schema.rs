use rusqlite::Connection;

/// Current schema version, tracked in `PRAGMA user_version`.
pub(crate) const SCHEMA_VERSION: i32 = 1;

// Timestamps are microseconds since the Unix epoch. Maps are JSON text.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    app_name    TEXT    NOT NULL,
    user_id     TEXT    NOT NULL,
    id          TEXT    NOT NULL,
    state       TEXT    NOT NULL DEFAULT '{}',
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL,
    PRIMARY KEY (app_name, user_id, id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_update_time
    ON sessions (app_name, user_id, update_time);

CREATE TABLE IF NOT EXISTS events (
    id                    TEXT    PRIMARY KEY,
    app_name              TEXT    NOT NULL,
    user_id               TEXT    NOT NULL,
    session_id            TEXT    NOT NULL,
    invocation_id         TEXT    NOT NULL,
    author                TEXT    NOT NULL,
    actions               TEXT    NOT NULL,
    branch                TEXT,
    timestamp             INTEGER NOT NULL,
    content               TEXT,
    grounding_metadata    TEXT,
    usage_metadata        TEXT,
    citation_metadata     TEXT,
    custom_metadata       TEXT,
    long_running_tool_ids TEXT,
    partial               INTEGER,
    turn_complete         INTEGER,
    interrupted           INTEGER,
    error_code            TEXT,
    error_message         TEXT,
    FOREIGN KEY (app_name, user_id, session_id)
        REFERENCES sessions (app_name, user_id, id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_session_time
    ON events (app_name, user_id, session_id, timestamp);

CREATE TABLE IF NOT EXISTS states (
    scope       TEXT    NOT NULL CHECK (scope IN ('app', 'user')),
    app_name    TEXT    NOT NULL,
    user_id     TEXT    NOT NULL DEFAULT '',
    session_id  TEXT    NOT NULL DEFAULT '',
    state       TEXT    NOT NULL DEFAULT '{}',
    update_time INTEGER NOT NULL,
    PRIMARY KEY (scope, app_name, user_id, session_id),
    CHECK ((scope = 'app' AND user_id = '') OR (scope = 'user' AND user_id <> ''))
);
"#;

/// Bring the schema up to [`SCHEMA_VERSION`]. Safe to run on every open.
pub(crate) fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}
