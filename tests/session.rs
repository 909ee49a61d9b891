mod common;

use async_std::task;
use chrono::{NaiveDateTime, Utc};
use common::{cookie_pair, data, ConstantIdGenerator};
use locked_session::{
    is_valid_id, DebugIdGenerator, Error, FileStore, MemoryStore, RequestContext, Session,
    SessionCookieCommand, SessionData, SessionOptions, SessionStatus, SessionStore,
    StorageBackend, MAXIMUM_COOKIE_LIFETIME,
};
use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;

fn options() -> SessionOptions {
    SessionOptions {
        gc_probability: 0,
        ..Default::default()
    }
}

fn new_session(context: &RequestContext, store: &MemoryStore) -> Session {
    let mut session = Session::new(context);
    session.configure(options()).unwrap();
    session.set_save_handler(store.clone()).unwrap();
    session
}

fn with_cookie(id: &str) -> RequestContext {
    RequestContext::new().with_cookie_header(format!("SESSID={id}"))
}

/// Parses the expiry of a `Set-Cookie` header.
fn expires(set_cookie: &str) -> NaiveDateTime {
    let expires = set_cookie
        .split("; ")
        .find_map(|attribute| attribute.strip_prefix("expires="))
        .unwrap();
    NaiveDateTime::parse_from_str(expires, "%a, %d-%b-%Y %H:%M:%S GMT").unwrap()
}

/// The data of a session cannot be accessed before it is started or after it was closed.
#[async_std::test]
async fn test_access_requires_started_session() {
    let store = MemoryStore::new();
    let mut session = new_session(&RequestContext::new(), &store);
    assert_eq!(session.status(), SessionStatus::Unstarted);
    assert!(matches!(session.get("a"), Err(Error::NotStarted)));
    assert!(matches!(session.set("a", 1), Err(Error::NotStarted)));
    assert!(matches!(session.has("a"), Err(Error::NotStarted)));
    assert!(matches!(session.delete("a"), Err(Error::NotStarted)));
    assert!(matches!(session.id(), Err(Error::NotStarted)));
    assert!(matches!(session.write_close().await, Err(Error::NotStarted)));
    assert!(matches!(session.destroy().await, Err(Error::NotStarted)));
    assert!(matches!(session.regenerate_id(false).await, Err(Error::NotStarted)));

    session.start().await.unwrap();
    assert!(session.is_started());
    assert_eq!(session.get("a").unwrap(), None);
    assert_eq!(session.set("a", 1).unwrap(), None);
    assert_eq!(session.set("a", "two").unwrap(), Some(json!(1)));
    assert!(session.has("a").unwrap());
    assert_eq!(session.keys().unwrap().collect::<Vec<_>>(), ["a"]);
    assert_eq!(session.delete("a").unwrap(), Some(json!("two")));
    assert!(!session.has("a").unwrap());

    session.write_close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(matches!(session.get("a"), Err(Error::NotStarted)));
    assert!(matches!(session.set("a", 1), Err(Error::NotStarted)));
    assert!(matches!(session.write_close().await, Err(Error::NotStarted)));
}

/// Configuration is only possible before starting, and a closed session cannot be restarted.
#[async_std::test]
async fn test_lifecycle_ordering() {
    let store = MemoryStore::new();
    let mut session = new_session(&RequestContext::new(), &store);
    session.start().await.unwrap();
    let id = session.id().unwrap().to_owned();
    // Starting again does nothing.
    session.start().await.unwrap();
    assert_eq!(session.id().unwrap(), id);

    assert!(matches!(session.configure(options()), Err(Error::AlreadyStarted)));
    assert!(matches!(
        session.set_save_handler(MemoryStore::new()),
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(session.set_id("abc"), Err(Error::AlreadyStarted)));

    session.write_close().await.unwrap();
    assert!(matches!(session.start().await, Err(Error::AlreadyClosed)));
    assert!(matches!(session.configure(options()), Err(Error::AlreadyClosed)));
}

/// A request without cookie gets a new session and exactly one cookie,
/// and the next request presenting that cookie finds the same session again.
#[async_std::test]
async fn test_new_session_round_trip() {
    let store = MemoryStore::new();
    let mut session = new_session(&RequestContext::new().with_peer("10.0.0.1:1234"), &store);
    assert!(session.cookie_headers().unwrap().is_empty());
    session.start().await.unwrap();
    let id = session.id().unwrap().to_owned();
    assert!(is_valid_id(&id));
    assert_eq!(
        session.cookie_command(),
        &SessionCookieCommand::Set { id: id.clone() }
    );
    session.set("user", "ferris").unwrap();
    session.write_close().await.unwrap();

    let headers = session.cookie_headers().unwrap();
    assert_eq!(
        headers,
        [("Set-Cookie".to_owned(), format!("SESSID={id}; path=/"))]
    );

    let context = RequestContext::new().with_cookie_header(cookie_pair(&headers[0].1));
    let mut session = new_session(&context, &store);
    session.start().await.unwrap();
    assert_eq!(session.id().unwrap(), id);
    assert_eq!(session.get("user").unwrap(), Some(&json!("ferris")));
    session.write_close().await.unwrap();
    assert_eq!(session.cookie_command(), &SessionCookieCommand::DoNothing);
    assert!(session.cookie_headers().unwrap().is_empty());
}

/// Cookie attributes are taken from the options.
#[async_std::test]
async fn test_cookie_attributes() {
    let store = MemoryStore::new();
    let mut session = Session::new(&RequestContext::new());
    session
        .configure(SessionOptions {
            cookie_name: "app".to_owned(),
            cookie_lifetime: 3600,
            cookie_path: None,
            cookie_domain: Some("example.com".to_owned()),
            cookie_secure: true,
            cookie_httponly: true,
            ..options()
        })
        .unwrap();
    session.set_save_handler(store).unwrap();
    session.set_id_generator(DebugIdGenerator::<6>::default()).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.name(), "app");
    assert_eq!(session.id().unwrap(), "000000");

    let headers = session.cookie_headers().unwrap();
    let header = &headers[0].1;
    assert!(header.starts_with("app=000000; expires="), "{header}");
    assert!(header.ends_with("; domain=example.com; secure; httponly"), "{header}");
    let lifetime = expires(header) - Utc::now().naive_utc();
    assert!((3590..=3600).contains(&lifetime.num_seconds()), "{lifetime}");
}

/// Destroying removes the record and tells the client to delete the cookie.
#[async_std::test]
async fn test_destroy() {
    let store = MemoryStore::new();
    let mut session = new_session(&RequestContext::new(), &store);
    session.start().await.unwrap();
    let id = session.id().unwrap().to_owned();
    session.set("a", 1).unwrap();
    session.write_close().await.unwrap();

    let mut session = new_session(&with_cookie(&id), &store);
    session.start().await.unwrap();
    session.destroy().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(session.cookie_command(), &SessionCookieCommand::Delete);

    let headers = session.cookie_headers().unwrap();
    assert_eq!(headers.len(), 1);
    assert!(headers[0].1.starts_with("SESSID=deleted; expires="));
    assert!(headers[0].1.ends_with("; path=/"));
    assert!(expires(&headers[0].1) < Utc::now().naive_utc() - chrono::Duration::days(364));

    let mut store = store.clone();
    assert!(store.is_id_free(&id).await.unwrap());
    store.open(&id).await.unwrap();
    assert_eq!(store.read().unwrap(), SessionData::new());
}

/// Destroying a session whose record vanished still succeeds.
#[async_std::test]
async fn test_destroy_missing_record() {
    let store = MemoryStore::new();
    let mut session = new_session(&with_cookie("abc"), &store);
    session.start().await.unwrap();
    // The record of "abc" was opened, but never written.
    session.destroy().await.unwrap();
    assert_eq!(session.cookie_command(), &SessionCookieCommand::Delete);
}

/// Aborting releases the session without persisting changes.
#[async_std::test]
async fn test_abort() {
    let store = MemoryStore::new();
    let mut session = new_session(&with_cookie("abc"), &store);
    session.start().await.unwrap();
    session.set("a", 1).unwrap();
    session.write_close().await.unwrap();

    let mut session = new_session(&with_cookie("abc"), &store);
    session.start().await.unwrap();
    session.set("a", 2).unwrap();
    session.abort().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);

    let mut session = new_session(&with_cookie("abc"), &store);
    session.start().await.unwrap();
    assert_eq!(session.get("a").unwrap(), Some(&json!(1)));
}

/// Regenerating moves the data to a new id and sends a new cookie.
#[async_std::test]
async fn test_regenerate_id() {
    for delete_old in [false, true] {
        let store = MemoryStore::new();
        let mut session = new_session(&with_cookie("old"), &store);
        session.start().await.unwrap();
        assert_eq!(session.cookie_command(), &SessionCookieCommand::DoNothing);
        session.set("a", 1).unwrap();
        session.regenerate_id(delete_old).await.unwrap();

        let new_id = session.id().unwrap().to_owned();
        assert_ne!(new_id, "old");
        assert!(is_valid_id(&new_id));
        assert_eq!(session.get("a").unwrap(), Some(&json!(1)));
        session.set("b", 2).unwrap();
        session.write_close().await.unwrap();

        let headers = session.cookie_headers().unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(cookie_pair(&headers[0].1), format!("SESSID={new_id}"));

        let mut session = new_session(&with_cookie(&new_id), &store);
        session.start().await.unwrap();
        assert_eq!(session.get("b").unwrap(), Some(&json!(2)));
        session.write_close().await.unwrap();

        let mut store = store.clone();
        assert_eq!(store.is_id_free("old").await.unwrap(), delete_old);
        if !delete_old {
            store.open("old").await.unwrap();
            assert_eq!(store.read().unwrap(), data([("a", json!(1))]));
        }
    }
}

/// If regenerating cannot create a new record, the session keeps its old id and its data,
/// and closing it persists the data under the old id.
#[async_std::test]
async fn test_regenerate_id_failure_keeps_session() {
    for delete_old in [false, true] {
        let store = MemoryStore::new();
        let mut holder = store.clone();
        holder.open("taken").await.unwrap();
        holder.close().await.unwrap();

        let mut session = new_session(&with_cookie("abc"), &store);
        session.set_id_generator(ConstantIdGenerator("taken")).unwrap();
        session.start().await.unwrap();
        session.set("user", "ferris").unwrap();

        assert!(matches!(
            session.regenerate_id(delete_old).await,
            Err(Error::IdentifierExhaustion { .. })
        ));
        assert_eq!(session.status(), SessionStatus::Started);
        assert_eq!(session.id().unwrap(), "abc");
        assert_eq!(session.get("user").unwrap(), Some(&json!("ferris")));
        assert_eq!(session.cookie_command(), &SessionCookieCommand::DoNothing);
        session.write_close().await.unwrap();

        let mut store = store.clone();
        store.open("abc").await.unwrap();
        assert_eq!(store.read().unwrap(), data([("user", json!("ferris"))]));
    }
}

/// Cookie lifetimes too long to render are rejected when configuring.
#[async_std::test]
async fn test_cookie_lifetime_limit() {
    let mut session = Session::new(&RequestContext::new());
    let error = session
        .configure(SessionOptions {
            cookie_lifetime: u64::MAX,
            ..options()
        })
        .unwrap_err();
    assert!(matches!(error, Error::InvalidCookieLifetime(lifetime) if lifetime == u64::MAX));
    assert_eq!(error.kind(), locked_session::ErrorKind::Validation);
    assert_eq!(session.options().cookie_lifetime, 0);

    session
        .configure(SessionOptions {
            cookie_lifetime: MAXIMUM_COOKIE_LIFETIME,
            ..options()
        })
        .unwrap();
    session.set_save_handler(MemoryStore::new()).unwrap();
    session.start().await.unwrap();
    session.write_close().await.unwrap();
    let headers = session.cookie_headers().unwrap();
    let lifetime = expires(&headers[0].1) - Utc::now().naive_utc();
    assert!(lifetime > chrono::Duration::days(36_000), "{lifetime}");
}

/// An explicitly set id wins over the cookie, and is sent to the client.
#[async_std::test]
async fn test_explicit_id() {
    let store = MemoryStore::new();
    let mut session = new_session(&with_cookie("fromcookie"), &store);
    assert!(matches!(session.set_id("../x"), Err(Error::InvalidId(_))));
    session.set_id("explicit").unwrap();
    session.start().await.unwrap();
    assert_eq!(session.id().unwrap(), "explicit");
    assert_eq!(
        session.cookie_command(),
        &SessionCookieCommand::Set {
            id: "explicit".to_owned()
        }
    );
}

/// Invalid client ids are rejected before anything is stored.
#[async_std::test]
async fn test_invalid_client_id() {
    let store = MemoryStore::new();
    let context = RequestContext::new().with_cookie_header("SESSID=..%2Fetc%2Fpasswd");
    let mut session = new_session(&context, &store);
    assert!(matches!(session.start().await, Err(Error::InvalidId(id)) if id == "../etc/passwd"));
    assert_eq!(session.status(), SessionStatus::Unstarted);
    assert!(store.is_empty());

    // The caller may decide to start a fresh session instead.
    session.forget_client_id().unwrap();
    session.start().await.unwrap();
    assert_ne!(session.id().unwrap(), "../etc/passwd");
    assert!(matches!(
        session.cookie_command(),
        SessionCookieCommand::Set { .. }
    ));
}

/// The query parameter is only used if `use_only_cookies` is disabled,
/// and must agree with the cookie.
#[async_std::test]
async fn test_alternate_transport() {
    let store = MemoryStore::new();
    let transport_options = SessionOptions {
        use_only_cookies: false,
        ..options()
    };

    // Ignored by default.
    let context = RequestContext::new().with_query_param("SESSID", "fromquery");
    let mut session = new_session(&context, &store);
    session.start().await.unwrap();
    assert_ne!(session.id().unwrap(), "fromquery");
    session.abort().await.unwrap();

    let mut session = Session::new(&context);
    session.configure(transport_options.clone()).unwrap();
    session.set_save_handler(store.clone()).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.id().unwrap(), "fromquery");
    assert_eq!(
        session.cookie_command(),
        &SessionCookieCommand::Set {
            id: "fromquery".to_owned()
        }
    );
    session.abort().await.unwrap();

    let context = with_cookie("same").with_query_param("SESSID", "same");
    let mut session = Session::new(&context);
    session.configure(transport_options.clone()).unwrap();
    session.set_save_handler(store.clone()).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.id().unwrap(), "same");
    assert_eq!(session.cookie_command(), &SessionCookieCommand::DoNothing);
    session.abort().await.unwrap();

    let context = with_cookie("one").with_query_param("SESSID", "other");
    let mut session = Session::new(&context);
    session.configure(transport_options).unwrap();
    session.set_save_handler(store.clone()).unwrap();
    let error = session.start().await.unwrap_err();
    assert!(matches!(
        &error,
        Error::ConflictingIdentifier { cookie, transport } if cookie == "one" && transport == "other"
    ));
    assert_eq!(error.kind(), locked_session::ErrorKind::Validation);
    assert!(store.is_id_free("one").await.unwrap());
    assert!(store.is_id_free("other").await.unwrap());
}

/// Without cookies, the cookie is neither read nor sent.
#[async_std::test]
async fn test_without_cookies() {
    let store = MemoryStore::new();
    let mut session = Session::new(&with_cookie("abc"));
    session
        .configure(SessionOptions {
            use_cookies: false,
            ..options()
        })
        .unwrap();
    session.set_save_handler(store).unwrap();
    session.start().await.unwrap();
    assert_ne!(session.id().unwrap(), "abc");
    session.destroy().await.unwrap();
    assert!(session.cookie_headers().unwrap().is_empty());
}

/// An invalid cookie name is rejected before the session is started.
#[async_std::test]
async fn test_invalid_cookie_name() {
    let store = MemoryStore::new();
    let mut session = Session::new(&RequestContext::new());
    session
        .configure(SessionOptions {
            cookie_name: "bad name".to_owned(),
            ..options()
        })
        .unwrap();
    session.set_save_handler(store.clone()).unwrap();
    assert!(matches!(session.start().await, Err(Error::InvalidName(_))));
    assert!(store.is_empty());
}

/// If no free id can be found, starting fails.
#[async_std::test]
async fn test_identifier_exhaustion() {
    let store = MemoryStore::new();
    let mut holder = store.clone();
    holder.open("taken").await.unwrap();
    holder.close().await.unwrap();

    let mut session = new_session(&RequestContext::new(), &store);
    session.set_id_generator(ConstantIdGenerator("taken")).unwrap();
    assert!(matches!(
        session.start().await,
        Err(Error::IdentifierExhaustion { .. })
    ));
    assert_eq!(session.status(), SessionStatus::Unstarted);
}

/// Dropping a started session releases its record.
#[async_std::test]
async fn test_drop_releases_record() {
    let store = MemoryStore::new();
    {
        let mut session = new_session(&with_cookie("abc"), &store);
        session.start().await.unwrap();
        session.set("a", 1).unwrap();
    }

    let mut session = new_session(&with_cookie("abc"), &store);
    async_std::future::timeout(Duration::from_secs(5), session.start())
        .await
        .expect("the dropped session still holds the record")
        .unwrap();
    assert_eq!(session.get("a").unwrap(), None);
}

/// Concurrent requests for the same session run one after another,
/// and the record ends up with the full data of the last writer.
#[async_std::test]
async fn test_concurrent_sessions_serialize() {
    let dir = tempdir().unwrap();
    let options = SessionOptions {
        save_path: dir.path().to_owned(),
        ..options()
    };

    let mut first = Session::new(&with_cookie("shared"));
    first.configure(options.clone()).unwrap();
    first.start().await.unwrap();
    first.set("first", true).unwrap();
    first.set("writer", "first").unwrap();

    let second = {
        let options = options.clone();
        task::spawn(async move {
            let mut second = Session::new(&with_cookie("shared"));
            second.configure(options).unwrap();
            second.start().await.unwrap();
            let seen_first = second.get("first").unwrap().cloned();
            second.delete("first").unwrap();
            second.set("writer", "second").unwrap();
            second.write_close().await.unwrap();
            seen_first
        })
    };

    task::sleep(Duration::from_millis(200)).await;
    first.write_close().await.unwrap();
    assert_eq!(second.await, Some(json!(true)));

    let mut store = FileStore::from_options(&options).unwrap();
    store.open("shared").await.unwrap();
    assert_eq!(store.read().unwrap(), data([("writer", json!("second"))]));
}

/// The memory backend shares sessions across the whole process.
#[async_std::test]
async fn test_memory_backend() {
    let options = SessionOptions {
        storage_backend: StorageBackend::Memory,
        ..options()
    };

    let mut session = Session::new(&RequestContext::new());
    session.configure(options.clone()).unwrap();
    session.start().await.unwrap();
    let id = session.id().unwrap().to_owned();
    session.set("backend", "memory").unwrap();
    session.write_close().await.unwrap();

    let mut session = Session::new(&with_cookie(&id));
    session.configure(options).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.get("backend").unwrap(), Some(&json!("memory")));
    session.destroy().await.unwrap();
    assert!(MemoryStore::shared().is_id_free(&id).await.unwrap());
}

/// With probability one, starting a session collects garbage, sparing the session itself.
#[async_std::test]
async fn test_gc_on_start() {
    let store = MemoryStore::new();
    let mut session = new_session(&with_cookie("stale"), &store);
    session.start().await.unwrap();
    session.write_close().await.unwrap();
    task::sleep(Duration::from_millis(20)).await;

    let mut session = Session::new(&with_cookie("fresh"));
    session
        .configure(SessionOptions {
            gc_probability: 1,
            gc_divisor: 1,
            gc_maxlifetime: 0,
            ..options()
        })
        .unwrap();
    session.set_save_handler(store.clone()).unwrap();
    session.start().await.unwrap();

    assert!(store.is_id_free("stale").await.unwrap());
    assert!(!store.is_id_free("fresh").await.unwrap());
}

/// The file backend is bound by default.
#[async_std::test]
async fn test_file_backend() {
    let dir = tempdir().unwrap();
    let mut session = Session::new(&RequestContext::new());
    session
        .configure(SessionOptions {
            save_path: dir.path().to_owned(),
            ..options()
        })
        .unwrap();
    session.start().await.unwrap();
    session.set("a", json!({"b": [1, 2]})).unwrap();
    let id = session.id().unwrap().to_owned();
    session.write_close().await.unwrap();

    let contents = std::fs::read_to_string(dir.path().join(format!("sess_{id}"))).unwrap();
    assert_eq!(contents, r#"{"a":{"b":[1,2]}}"#);
}
