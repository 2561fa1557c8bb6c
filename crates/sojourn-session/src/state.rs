//! State merge engine.
//!
//! Every delta key is routed to exactly one [`Scope`] by its prefix:
//!
//! | prefix  | scope     | stored in                         |
//! |---------|-----------|-----------------------------------|
//! | `app:`  | App       | `states` row `(app, app_name)`    |
//! | `user:` | User      | `states` row `(user, app, user)`  |
//! | `temp:` | Temp      | nowhere, in-memory session only   |
//! | other   | Session   | `sessions.state` column           |
//!
//! App and user maps are stored with the prefix stripped. The composed view a
//! caller sees puts the prefix back, so `app:theme` round-trips as `app:theme`.

use sojourn_core::StateMap;

/// Key prefix for state shared by every user of an app.
pub const APP_PREFIX: &str = "app:";
/// Key prefix for state shared by every session of one user.
pub const USER_PREFIX: &str = "user:";
/// Key prefix for state that lives only for the current append call.
pub const TEMP_PREFIX: &str = "temp:";

/// Where a state key belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared by every session of an app.
    App,
    /// Shared by every session of one user.
    User,
    /// Private to one session.
    Session,
    /// Never persisted.
    Temp,
}

impl Scope {
    /// Classify a delta key, returning its scope and the key with any scope
    /// prefix removed.
    pub fn classify(key: &str) -> (Scope, &str) {
        if let Some(rest) = key.strip_prefix(APP_PREFIX) {
            (Scope::App, rest)
        } else if let Some(rest) = key.strip_prefix(USER_PREFIX) {
            (Scope::User, rest)
        } else if let Some(rest) = key.strip_prefix(TEMP_PREFIX) {
            (Scope::Temp, rest)
        } else {
            (Scope::Session, key)
        }
    }

    /// Prefix this scope's keys carry in the composed view.
    pub fn prefix(self) -> &'static str {
        match self {
            Scope::App => APP_PREFIX,
            Scope::User => USER_PREFIX,
            Scope::Temp => TEMP_PREFIX,
            Scope::Session => "",
        }
    }

    /// Temp keys are never written to storage.
    pub fn is_persisted(self) -> bool {
        !matches!(self, Scope::Temp)
    }
}

/// A delta partitioned by scope.
///
/// `app` and `user` hold stripped keys, `session` holds keys verbatim and
/// `temp` keeps the full `temp:` key since that is how it appears in the view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedDeltas {
    /// `app:` keys, prefix stripped.
    pub app: StateMap,
    /// `user:` keys, prefix stripped.
    pub user: StateMap,
    /// Unprefixed keys.
    pub session: StateMap,
    /// `temp:` keys, prefix kept.
    pub temp: StateMap,
}

impl ScopedDeltas {
    /// Route every key of `delta` to its scope.
    pub fn split(delta: &StateMap) -> Self {
        let mut out = Self::default();
        for (key, value) in delta {
            let (scope, stripped) = Scope::classify(key);
            let target = match scope {
                Scope::App => &mut out.app,
                Scope::User => &mut out.user,
                Scope::Session => &mut out.session,
                Scope::Temp => {
                    out.temp.insert(key.clone(), value.clone());
                    continue;
                }
            };
            target.insert(stripped.to_string(), value.clone());
        }
        out
    }

    /// No key in any scope.
    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty() && self.temp.is_empty()
    }

    /// Non-empty persisted scopes, in a fixed order.
    pub fn persisted(&self) -> impl Iterator<Item = (Scope, &StateMap)> {
        [
            (Scope::App, &self.app),
            (Scope::User, &self.user),
            (Scope::Session, &self.session),
        ]
        .into_iter()
        .filter(|(_, delta)| !delta.is_empty())
    }
}

/// Stored maps that resulted from merging a delta, per persisted scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedState {
    /// Stored app map, if the delta touched it.
    pub app: Option<StateMap>,
    /// Stored user map, if the delta touched it.
    pub user: Option<StateMap>,
    /// Stored session map, if the delta touched it.
    pub session: Option<StateMap>,
}

impl MergedState {
    /// Record the merged map for `scope`. Temp is ignored.
    pub fn set(&mut self, scope: Scope, merged: StateMap) {
        match scope {
            Scope::App => self.app = Some(merged),
            Scope::User => self.user = Some(merged),
            Scope::Session => self.session = Some(merged),
            Scope::Temp => {}
        }
    }

    /// Merged maps with their scope, app first.
    pub fn iter(&self) -> impl Iterator<Item = (Scope, &StateMap)> {
        [
            (Scope::App, self.app.as_ref()),
            (Scope::User, self.user.as_ref()),
            (Scope::Session, self.session.as_ref()),
        ]
        .into_iter()
        .filter_map(|(scope, merged)| merged.map(|m| (scope, m)))
    }
}

/// Apply a delta: a `null` value deletes the key, anything else sets it.
pub fn apply_delta(target: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Build the caller-facing view: session keys as-is, app and user keys
/// re-prefixed.
pub fn compose(session: &StateMap, app: &StateMap, user: &StateMap) -> StateMap {
    let mut view = session.clone();
    for (key, value) in app {
        view.insert(format!("{APP_PREFIX}{key}"), value.clone());
    }
    for (key, value) in user {
        view.insert(format!("{USER_PREFIX}{key}"), value.clone());
    }
    view
}

/// Replace every `scope` entry of a composed view with `merged`.
pub fn mirror(view: &mut StateMap, scope: Scope, merged: &StateMap) {
    view.retain(|key, _| Scope::classify(key).0 != scope);
    let prefix = scope.prefix();
    for (key, value) in merged {
        view.insert(format!("{prefix}{key}"), value.clone());
    }
}

/// Drop `temp:` keys so they never look persisted.
pub fn strip_temp_keys(delta: &mut StateMap) {
    delta.retain(|key, _| Scope::classify(key).0.is_persisted());
}
