//! Row-level pessimistic locks.
//!
//! SQLite has no `SELECT ... FOR UPDATE`, so writers lock the logical rows
//! they are about to read-modify-write through [`RowLocks`] before opening the
//! database transaction. Guards are held until the transaction has committed
//! or rolled back. Writers touching disjoint rows never contend.

use parking_lot::Mutex;
use sojourn_core::{SojournError, SojournResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

/// Identity of a lockable persisted row.
///
/// The derived ordering is the global lock acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    /// App-scope state row.
    App {
        /// Owning application.
        app_name: String,
    },
    /// User-scope state row.
    User {
        /// Owning application.
        app_name: String,
        /// Owning user.
        user_id: String,
    },
    /// A session row (holds session-scope state inline).
    Session {
        /// Owning application.
        app_name: String,
        /// Owning user.
        user_id: String,
        /// Session id.
        session_id: String,
    },
}

impl RowKey {
    /// The app-scope row of `app_name`.
    pub fn app(app_name: &str) -> Self {
        RowKey::App {
            app_name: app_name.to_string(),
        }
    }

    /// The user-scope row of one user.
    pub fn user(app_name: &str, user_id: &str) -> Self {
        RowKey::User {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// A session row.
    pub fn session(app_name: &str, user_id: &str, session_id: &str) -> Self {
        RowKey::Session {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::App { app_name } => write!(f, "app/{app_name}"),
            RowKey::User { app_name, user_id } => write!(f, "user/{app_name}/{user_id}"),
            RowKey::Session {
                app_name,
                user_id,
                session_id,
            } => write!(f, "session/{app_name}/{user_id}/{session_id}"),
        }
    }
}

/// Guards for a set of locked rows. Dropping it releases every lock.
#[derive(Debug)]
pub struct RowLockSet {
    keys: Vec<RowKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl RowLockSet {
    /// Locked keys, in acquisition order.
    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }
}

/// In-process lock table keyed by [`RowKey`].
pub struct RowLocks {
    table: Mutex<HashMap<RowKey, Weak<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl RowLocks {
    /// Entries are pruned once the table grows past this many keys.
    const PRUNE_THRESHOLD: usize = 128;

    /// `timeout` bounds how long [`acquire`](Self::acquire) waits per row.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, key: &RowKey) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();

        if table.len() > Self::PRUNE_THRESHOLD {
            table.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        table.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Lock every key, in sorted order so concurrent callers cannot deadlock.
    ///
    /// Fails with [`SojournError::Transient`] if any row stays locked longer
    /// than the configured timeout; locks taken so far are released.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = RowKey>) -> SojournResult<RowLockSet> {
        let mut keys: Vec<RowKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.entry(key);
            match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Row lock wait timed out");
                    return Err(SojournError::Transient(format!(
                        "timed out after {}ms waiting for lock on {key}",
                        self.timeout.as_millis()
                    )));
                }
            }
        }

        Ok(RowLockSet {
            keys,
            _guards: guards,
        })
    }

    /// Number of rows currently locked or waited on.
    pub fn live_entries(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
