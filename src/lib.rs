//! Async HTTP sessions with lock-guarded storage.
//!
//! This crate correlates a client across requests via a session cookie,
//! persists arbitrary key/value data per client between requests,
//! and guarantees that only one request at a time works on the data of a session.
//!
//! # Lifecycle
//!
//! A [`Session`] lives for exactly one request.
//! Starting it resolves the session id from the cookie (or from a query parameter, if enabled),
//! or mints a new id, and then opens the record of that id in a [`SessionStore`].
//! The store holds an exclusive lock on the record until the session is closed,
//! so concurrent requests for the same session run their read-modify-write cycles one after another.
//! Closing the session with [`Session::write_close`] persists the data and releases the lock.
//! [`Session::cookie_headers`] then yields the `Set-Cookie` header to send, if the cookie changed.
//!
//! The [`SessionMiddleware`] does all of this around an [`Application`].
//!
//! # Security
//!
//! Ids presented by the client are only used if they match `[A-Za-z0-9,-]+`,
//! so they cannot escape the save path of the [`FileStore`].
//! If the cookie and the query carry different ids, starting fails instead of picking one.
//! Use [`Session::regenerate_id`] when the privileges of a session change.
//! Session data is stored unencrypted.
//!
//! # Example
//!
//! ```
//! use locked_session::{RequestContext, Session, SessionOptions};
//!
//! # fn main() -> locked_session::Result {
//! # async_std::task::block_on(async {
//! # let save_path = tempfile::tempdir()?;
//! // Sessions are stored in files below the save path.
//! let options = SessionOptions {
//!     save_path: save_path.path().to_owned(),
//!     cookie_httponly: true,
//!     ..Default::default()
//! };
//!
//! // A request without session cookie gets a new session.
//! let mut session = Session::new(&RequestContext::new());
//! session.configure(options.clone())?;
//! session.start().await?;
//! session.set("user", "ferris")?;
//! let id = session.id()?.to_owned();
//! session.write_close().await?;
//! let headers = session.cookie_headers()?;
//! assert_eq!(headers[0].0, "Set-Cookie");
//! assert_eq!(headers[0].1, format!("SESSID={id}; path=/; httponly"));
//!
//! // The next request presents the cookie and finds its data again.
//! let context = RequestContext::new().with_cookie_header(format!("SESSID={id}"));
//! let mut session = Session::new(&context);
//! session.configure(options)?;
//! session.start().await?;
//! assert_eq!(session.get("user")?.and_then(|user| user.as_str()), Some("ferris"));
//! session.destroy().await?;
//! #
//! # Ok(()) }) }
//! ```

// #![forbid(unsafe_code, future_incompatible)]
// #![deny(missing_debug_implementations, nonstandard_style)]
#![forbid(unsafe_code)]
#![deny(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    missing_docs,
    unreachable_pub,
    missing_copy_implementations,
    unused_qualifications
)]

mod codec;
mod cookie;
mod error;
mod file_store;
mod memory_store;
mod middleware;
mod options;
mod session;
mod session_store;

pub use cookie::{parse_cookie_header, validate_cookie_name, SetCookie, SET_COOKIE};
pub use error::{Error, ErrorKind};
pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use middleware::{Application, RequestContext, Response, SessionMiddleware};
pub use options::{SessionOptions, StorageBackend, MAXIMUM_COOKIE_LIFETIME};
pub use serde_json::Value;
pub use session::{Session, SessionCookieCommand, SessionStatus};
pub use session_store::id_generator::{is_valid_id, DebugIdGenerator, DefaultIdGenerator, IdGenerator};
pub use session_store::{SessionData, SessionStore, DEFAULT_MAXIMUM_RETRIES_ON_ID_COLLISION};

/// A result with this crate's [`Error`] and a default return type of `()`.
pub type Result<T = ()> = std::result::Result<T, Error>;
