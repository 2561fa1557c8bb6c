#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use sojourn_core::{Event, SojournError, StateMap};
use sojourn_session::{
    CreateRequest, DeleteRequest, GetRequest, InMemorySessionService, ListRequest, Session,
    SessionService, StoredSession,
};
#[cfg(feature = "sqlite")]
use sojourn_session::{SqliteSessionService, StoreConfig};
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinSet;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sojourn_session=debug")
        .try_init();
}

fn delta(pairs: &[(&str, Value)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

/// Every enabled backend, freshly opened.
async fn backends() -> Vec<(&'static str, Arc<dyn SessionService>)> {
    init_tracing();
    let memory: Arc<dyn SessionService> = Arc::new(InMemorySessionService::new());
    #[allow(unused_mut)]
    let mut all = vec![("memory", memory)];
    #[cfg(feature = "sqlite")]
    {
        let sqlite: Arc<dyn SessionService> =
            Arc::new(SqliteSessionService::open_in_memory().await.unwrap());
        all.push(("sqlite", sqlite));
    }
    all
}

async fn append(
    service: &dyn SessionService,
    session: &mut StoredSession,
    state_delta: StateMap,
) -> Event {
    let mut event = Event::new("inv", "agent").with_state_delta(state_delta);
    service.append_event(session, &mut event).await.unwrap();
    event
}

#[derive(Debug)]
struct ForeignSession {
    state: StateMap,
    events: Vec<Event>,
}

impl Session for ForeignSession {
    fn id(&self) -> &str {
        "foreign"
    }
    fn app_name(&self) -> &str {
        "app"
    }
    fn user_id(&self) -> &str {
        "u1"
    }
    fn state(&self) -> &StateMap {
        &self.state
    }
    fn events(&self) -> &[Event] {
        &self.events
    }
    fn last_update_time(&self) -> DateTime<Utc> {
        t(0)
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[tokio::test]
async fn test_create_and_get_round_trip() {
    for (name, service) in backends().await {
        let created = service
            .create(
                CreateRequest::new("app", "u1")
                    .with_session_id("s1")
                    .with_state(delta(&[
                        ("k", json!("v")),
                        ("app:a", json!(1)),
                        ("user:u", json!(2)),
                        ("temp:t", json!(3)),
                    ])),
            )
            .await
            .unwrap();
        assert_eq!(created.id, "s1", "{name}");
        assert_eq!(
            created.state,
            delta(&[("k", json!("v")), ("app:a", json!(1)), ("user:u", json!(2))]),
            "{name}"
        );

        let fetched = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        assert_eq!(fetched.state, created.state, "{name}");
        assert!(fetched.events.is_empty(), "{name}");
        assert_eq!(fetched.last_update_time, created.last_update_time, "{name}");
    }
}

#[tokio::test]
async fn test_generated_session_ids_are_unique() {
    for (name, service) in backends().await {
        let a = service.create(CreateRequest::new("app", "u1")).await.unwrap();
        let b = service
            .create(CreateRequest::new("app", "u1").with_session_id(""))
            .await
            .unwrap();
        assert!(!a.id.is_empty(), "{name}");
        assert_ne!(a.id, b.id, "{name}");
    }
}

#[tokio::test]
async fn test_state_routes_by_scope() {
    for (name, service) in backends().await {
        let mut s1 = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        let event = append(
            service.as_ref(),
            &mut s1,
            delta(&[
                ("app:theme", json!("dark")),
                ("user:lang", json!("es")),
                ("temp:scratch", json!([1, 2])),
                ("step", json!(1)),
            ]),
        )
        .await;

        // The caller's handle sees every scope, temp included.
        assert_eq!(s1.state["app:theme"], "dark", "{name}");
        assert_eq!(s1.state["user:lang"], "es", "{name}");
        assert_eq!(s1.state["temp:scratch"], json!([1, 2]), "{name}");
        assert_eq!(s1.state["step"], 1, "{name}");
        assert!(!event.actions.state_delta.contains_key("temp:scratch"), "{name}");

        // Same user, new session: app and user scopes only.
        let s2 = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        assert_eq!(
            s2.state,
            delta(&[("app:theme", json!("dark")), ("user:lang", json!("es"))]),
            "{name}"
        );

        // Other user: app scope only.
        let s3 = service
            .create(CreateRequest::new("app", "u2"))
            .await
            .unwrap();
        assert_eq!(s3.state, delta(&[("app:theme", json!("dark"))]), "{name}");

        // Other app: nothing.
        let s4 = service
            .create(CreateRequest::new("other", "u1"))
            .await
            .unwrap();
        assert!(s4.state.is_empty(), "{name}");

        // Temp never reaches storage, neither in state nor in the log.
        let fetched = service
            .get(GetRequest::new("app", "u1", &s1.id))
            .await
            .unwrap();
        assert!(!fetched.state.contains_key("temp:scratch"), "{name}");
        assert_eq!(fetched.events.len(), 1, "{name}");
        assert!(
            !fetched.events[0]
                .actions
                .state_delta
                .contains_key("temp:scratch"),
            "{name}"
        );
        assert_eq!(fetched.events[0], s1.events[0], "{name}");
    }
}

#[tokio::test]
async fn test_null_deletes_keys() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        append(
            service.as_ref(),
            &mut session,
            delta(&[("k", json!(1)), ("app:a", json!(1)), ("keep", json!(true))]),
        )
        .await;
        append(
            service.as_ref(),
            &mut session,
            delta(&[
                ("k", Value::Null),
                ("app:a", Value::Null),
                ("never_set", Value::Null),
                ("user:never_set", Value::Null),
            ]),
        )
        .await;

        assert_eq!(session.state, delta(&[("keep", json!(true))]), "{name}");

        let fetched = service
            .get(GetRequest::new("app", "u1", &session.id))
            .await
            .unwrap();
        assert_eq!(fetched.state, delta(&[("keep", json!(true))]), "{name}");
        // The log keeps the deletion markers.
        assert_eq!(
            fetched.events[1].actions.state_delta.get("k"),
            Some(&Value::Null),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_event_log_order_and_windowing() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        for (id, at) in [("e1", t(1)), ("e2", t(2)), ("e3", t(3))] {
            let mut event = Event::new("inv", "agent").at(at);
            event.id = id.to_string();
            service.append_event(&mut session, &mut event).await.unwrap();
        }

        let ids = |events: &[Event]| events.iter().map(|e| e.id.clone()).collect::<Vec<_>>();

        let all = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        assert_eq!(ids(&all.events), vec!["e1", "e2", "e3"], "{name}");

        let recent = service
            .get(GetRequest::new("app", "u1", "s1").num_recent_events(2))
            .await
            .unwrap();
        assert_eq!(ids(&recent.events), vec!["e2", "e3"], "{name}");

        let unlimited = service
            .get(GetRequest::new("app", "u1", "s1").num_recent_events(0))
            .await
            .unwrap();
        assert_eq!(unlimited.events.len(), 3, "{name}");

        let after = service
            .get(GetRequest::new("app", "u1", "s1").after(t(2)))
            .await
            .unwrap();
        assert_eq!(ids(&after.events), vec!["e2", "e3"], "{name}");

        let both = service
            .get(
                GetRequest::new("app", "u1", "s1")
                    .after(t(1))
                    .num_recent_events(1),
            )
            .await
            .unwrap();
        assert_eq!(ids(&both.events), vec!["e3"], "{name}");
    }
}

#[tokio::test]
async fn test_get_missing_session_is_not_found() {
    for (name, service) in backends().await {
        let err = service
            .get(GetRequest::new("app", "u1", "nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name}: {err}");

        // Right id, wrong user.
        service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        let err = service
            .get(GetRequest::new("app", "u2", "s1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name}: {err}");
    }
}

#[tokio::test]
async fn test_delete_is_idempotent_and_cascades() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        append(
            service.as_ref(),
            &mut session,
            delta(&[("k", json!(1)), ("app:shared", json!(1))]),
        )
        .await;

        service
            .delete(DeleteRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        service
            .delete(DeleteRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        service
            .delete(DeleteRequest::new("app", "u1", "never-existed"))
            .await
            .unwrap();

        let err = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name}");

        // Recreating the id starts clean; app state outlives the session.
        let again = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        assert_eq!(again.state, delta(&[("app:shared", json!(1))]), "{name}");
        let fetched = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        assert!(fetched.events.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_append_rejects_foreign_session_type() {
    for (name, service) in backends().await {
        let mut foreign = ForeignSession {
            state: StateMap::new(),
            events: Vec::new(),
        };
        let mut event = Event::new("inv", "agent").with_state_delta(delta(&[("k", json!(1))]));
        let err = service
            .append_event(&mut foreign, &mut event)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SojournError::TypeMismatch { .. }),
            "{name}: {err}"
        );
        assert!(foreign.state.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_append_to_missing_session_fails() {
    for (name, service) in backends().await {
        let mut ghost = StoredSession {
            id: "ghost".into(),
            app_name: "app".into(),
            user_id: "u1".into(),
            state: StateMap::new(),
            events: Vec::new(),
            last_update_time: t(0),
        };
        let mut event = Event::new("inv", "agent").with_state_delta(delta(&[("app:a", json!(1))]));
        let err = service
            .append_event(&mut ghost, &mut event)
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name}: {err}");
        assert!(ghost.events.is_empty(), "{name}");

        // Nothing leaked into app state.
        let fresh = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        assert!(fresh.state.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_partial_event_is_not_persisted() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        let before = session.clone();

        let mut event = Event::new("inv", "agent").with_state_delta(delta(&[("k", json!(1))]));
        event.partial = Some(true);
        service.append_event(&mut session, &mut event).await.unwrap();

        assert_eq!(session, before, "{name}");
        let fetched = service
            .get(GetRequest::new("app", "u1", &session.id))
            .await
            .unwrap();
        assert!(fetched.events.is_empty(), "{name}");
        assert!(fetched.state.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_list_sessions() {
    for (name, service) in backends().await {
        for (user, id) in [("u1", "s1"), ("u1", "s2"), ("u2", "s3")] {
            service
                .create(
                    CreateRequest::new("app", user)
                        .with_session_id(id)
                        .with_state(delta(&[("id", json!(id)), ("app:x", json!(1))])),
                )
                .await
                .unwrap();
        }
        service
            .create(CreateRequest::new("other", "u1").with_session_id("s4"))
            .await
            .unwrap();

        let mut s1 = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        append(service.as_ref(), &mut s1, delta(&[("touched", json!(true))])).await;

        let listed = service.list(ListRequest::new("app", "u1")).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"], "{name}");
        assert!(listed[0].last_update_time >= listed[1].last_update_time, "{name}");
        // Summaries carry session-scoped state only.
        assert_eq!(
            listed[0].state,
            delta(&[("id", json!("s1")), ("touched", json!(true))]),
            "{name}"
        );

        let everyone = service.list(ListRequest::new("app", "")).await.unwrap();
        assert_eq!(everyone.len(), 3, "{name}");

        let nobody = service.list(ListRequest::new("app", "u9")).await.unwrap();
        assert!(nobody.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_duplicate_create_and_validation() {
    for (name, service) in backends().await {
        service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        let err = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SojournError::AlreadyExists(_)), "{name}: {err}");

        let err = service
            .create(CreateRequest::new("", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SojournError::Validation(_)), "{name}: {err}");

        let err = service
            .get(GetRequest::new("app", "u1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SojournError::Validation(_)), "{name}: {err}");

        let err = service
            .list(ListRequest::new("", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SojournError::Validation(_)), "{name}: {err}");
    }
}

#[tokio::test]
async fn test_handles_of_same_session_diverge() {
    for (name, service) in backends().await {
        let mut first = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        let mut second = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();

        append(service.as_ref(), &mut first, delta(&[("a", json!(1))])).await;
        assert!(!second.state.contains_key("a"), "{name}");
        assert!(second.events.is_empty(), "{name}");

        // The second append mirrors the stored session map, which already has `a`.
        append(service.as_ref(), &mut second, delta(&[("b", json!(2))])).await;
        assert_eq!(second.state, delta(&[("a", json!(1)), ("b", json!(2))]), "{name}");
        assert_eq!(second.events.len(), 1, "{name}");
        assert!(!first.state.contains_key("b"), "{name}");

        let stored = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        assert_eq!(stored.events.len(), 2, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_lose_no_updates() {
    const WRITERS: usize = 16;

    for (name, service) in backends().await {
        service
            .create(
                CreateRequest::new("app", "seed")
                    .with_state(delta(&[("app:seed", json!(true))])),
            )
            .await
            .unwrap();

        // One session per writer; all of them write the shared app row and a
        // shared user row.
        let mut tasks = JoinSet::new();
        for i in 0..WRITERS {
            let service = Arc::clone(&service);
            tasks.spawn(async move {
                let user = if i % 2 == 0 { "even" } else { "odd" };
                let mut session = service
                    .create(CreateRequest::new("app", user))
                    .await
                    .unwrap();
                let mut event = Event::new(format!("inv-{i}"), "agent").with_state_delta(delta(&[
                    (format!("app:writer_{i}").as_str(), json!(i)),
                    (format!("user:writer_{i}").as_str(), json!(i)),
                    ("mine", json!(i)),
                ]));
                service.append_event(&mut session, &mut event).await.unwrap();
                session
            });
        }
        let mut sessions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            sessions.push(joined.unwrap());
        }
        assert_eq!(sessions.len(), WRITERS, "{name}");

        let probe = service
            .create(CreateRequest::new("app", "even"))
            .await
            .unwrap();
        let app_keys = probe.state.keys().filter(|k| k.starts_with("app:")).count();
        assert_eq!(app_keys, 1 + WRITERS, "{name}");
        let user_keys = probe.state.keys().filter(|k| k.starts_with("user:")).count();
        assert_eq!(user_keys, WRITERS / 2, "{name}");

        for session in sessions {
            let stored = service
                .get(GetRequest::new("app", &session.user_id, &session.id))
                .await
                .unwrap();
            assert_eq!(stored.events.len(), 1, "{name}");
            assert_eq!(stored.state["mine"], session.state["mine"], "{name}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_to_one_session() {
    const WRITERS: usize = 12;

    for (name, service) in backends().await {
        service
            .create(CreateRequest::new("app", "u1").with_session_id("shared"))
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..WRITERS {
            let service = Arc::clone(&service);
            tasks.spawn(async move {
                let mut handle = service
                    .get(GetRequest::new("app", "u1", "shared"))
                    .await
                    .unwrap();
                let mut event = Event::new("inv", "agent")
                    .with_state_delta(delta(&[(format!("k{i}").as_str(), json!(i))]));
                service.append_event(&mut handle, &mut event).await.unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let stored = service
            .get(GetRequest::new("app", "u1", "shared"))
            .await
            .unwrap();
        assert_eq!(stored.events.len(), WRITERS, "{name}");
        assert_eq!(stored.state.len(), WRITERS, "{name}");
    }
}

#[tokio::test]
async fn test_duplicate_event_id_is_rejected() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        let original = Event::new("inv", "agent").with_state_delta(delta(&[("k", json!(1))]));
        service
            .append_event(&mut session, &mut original.clone())
            .await
            .unwrap();

        let mut again = original.with_state_delta(delta(&[("k", json!(2)), ("app:a", json!(1))]));
        let before = session.clone();
        let err = service
            .append_event(&mut session, &mut again)
            .await
            .unwrap_err();
        assert!(matches!(err, SojournError::Append { .. }), "{name}: {err}");
        assert_eq!(session, before, "{name}");

        let fetched = service
            .get(GetRequest::new("app", "u1", "s1"))
            .await
            .unwrap();
        assert_eq!(fetched.events.len(), 1, "{name}");
        assert_eq!(fetched.state, delta(&[("k", json!(1))]), "{name}");
    }
}

#[tokio::test]
async fn test_failed_append_keeps_callers_event_intact() {
    for (name, service) in backends().await {
        let mut ghost = StoredSession {
            id: "ghost".into(),
            app_name: "app".into(),
            user_id: "u1".into(),
            state: StateMap::new(),
            events: Vec::new(),
            last_update_time: t(0),
        };
        let mut event = Event::new("inv", "agent")
            .with_state_delta(delta(&[("temp:t", json!(1)), ("k", json!(1))]));
        let original = event.clone();

        assert!(service.append_event(&mut ghost, &mut event).await.is_err(), "{name}");
        assert_eq!(event, original, "{name}");
        assert!(ghost.state.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_after_bound_below_one_microsecond() {
    for (name, service) in backends().await {
        let mut session = service
            .create(CreateRequest::new("app", "u1").with_session_id("s1"))
            .await
            .unwrap();
        let mut event = Event::new("inv", "agent").at(t(1));
        service.append_event(&mut session, &mut event).await.unwrap();

        let just_after = service
            .get(GetRequest::new("app", "u1", "s1").after(t(1) + Duration::nanoseconds(500)))
            .await
            .unwrap();
        assert!(just_after.events.is_empty(), "{name}");

        let just_before = service
            .get(GetRequest::new("app", "u1", "s1").after(t(1) - Duration::nanoseconds(500)))
            .await
            .unwrap();
        assert_eq!(just_before.events.len(), 1, "{name}");
    }
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let config = StoreConfig::with_database_path(tmp.path().join("sessions.db"));

    let session_id = {
        let service = SqliteSessionService::open(&config).await.unwrap();
        let mut session = service
            .create(CreateRequest::new("app", "u1"))
            .await
            .unwrap();
        let mut event = Event::new("inv", "agent")
            .with_content(json!({"parts": [{"text": "hello"}]}))
            .with_state_delta(delta(&[
                ("k", json!(1)),
                ("app:a", json!("x")),
                ("temp:t", json!(0)),
            ]));
        service.append_event(&mut session, &mut event).await.unwrap();
        session.id
    };

    let service = SqliteSessionService::open(&config).await.unwrap();
    let fetched = service
        .get(GetRequest::new("app", "u1", &session_id))
        .await
        .unwrap();
    assert_eq!(
        fetched.state,
        delta(&[("k", json!(1)), ("app:a", json!("x"))])
    );
    assert_eq!(fetched.events.len(), 1);
    assert_eq!(
        fetched.events[0].content,
        Some(json!({"parts": [{"text": "hello"}]}))
    );
}
