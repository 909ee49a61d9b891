//! Wraps a [`Session`] around one request/response cycle.

use crate::cookie::parse_cookie_header;
use crate::{ErrorKind, Session, SessionOptions, SessionStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// The parts of an incoming request a session depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    cookies: HashMap<String, String>,
    query: HashMap<String, String>,
    peer: Option<String>,
}

impl RequestContext {
    /// An empty request context, i.e. one without cookies, query parameters or peer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Add the cookies of a raw `Cookie` header.
    pub fn with_cookie_header(mut self, raw: impl AsRef<str>) -> Self {
        self.cookies.extend(parse_cookie_header(raw.as_ref()));
        self
    }

    /// Add a query parameter.
    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set the identity of the remote peer, e.g. its address and user agent.
    /// It is mixed into newly generated session ids.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Returns the cookies sent by the client.
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Returns the query parameters of the request.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Returns the identity of the remote peer.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}

/// A response produced by an [`Application`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// The HTTP status code.
    pub status: u16,
    /// The response headers, as `(name, value)` pairs.
    pub headers: Vec<(String, String)>,
    /// The response body.
    pub body: Vec<u8>,
}

impl Response {
    /// A response with the given status, no headers and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Returns the values of all headers called `name`, ignoring ASCII case.
    pub fn header_values<'response>(
        &'response self,
        name: &'response str,
    ) -> impl Iterator<Item = &'response str> {
        self.headers
            .iter()
            .filter(move |(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// The application handling requests downstream of the session middleware.
#[async_trait]
pub trait Application: Send + Sync {
    /// Handle a request. The session is unstarted unless the middleware auto-starts it,
    /// the application may start it whenever it needs the session.
    async fn call(&self, context: &RequestContext, session: &mut Session)
        -> anyhow::Result<Response>;
}

type StoreFactory = Arc<dyn Fn() -> Box<dyn SessionStore> + Send + Sync>;

/// Runs an [`Application`] with a fresh [`Session`] per request.
///
/// After the application returns, a started session is written and closed,
/// and its `Set-Cookie` headers are appended to the response.
/// If the application fails, the session is still written and closed on a best-effort basis,
/// so that its record is not left locked, and the application's error is returned.
pub struct SessionMiddleware<A> {
    app: A,
    options: SessionOptions,
    store_factory: Option<StoreFactory>,
    auto_start: bool,
    recover_invalid_ids: bool,
}

impl<A: Application> SessionMiddleware<A> {
    /// Wrap `app` with default session options.
    pub fn new(app: A) -> Self {
        Self {
            app,
            options: SessionOptions::default(),
            store_factory: None,
            auto_start: false,
            recover_invalid_ids: false,
        }
    }

    /// Use the given options for every session.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind a store from `factory` to every session, instead of the configured storage backend.
    pub fn with_store_factory(
        mut self,
        factory: impl Fn() -> Box<dyn SessionStore> + Send + Sync + 'static,
    ) -> Self {
        self.store_factory = Some(Arc::new(factory));
        self
    }

    /// Start every session before calling the application.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// When auto-starting, replace client ids that are invalid or conflicting by a fresh session
    /// instead of failing the request.
    pub fn with_invalid_id_recovery(mut self, recover_invalid_ids: bool) -> Self {
        self.recover_invalid_ids = recover_invalid_ids;
        self
    }

    /// Returns the wrapped application.
    pub fn app(&self) -> &A {
        &self.app
    }

    /// Handle one request.
    pub async fn handle(&self, context: RequestContext) -> anyhow::Result<Response> {
        let mut session = Session::new(&context);
        session.configure(self.options.clone())?;
        if let Some(factory) = &self.store_factory {
            session.set_boxed_save_handler(factory())?;
        }
        if self.auto_start {
            self.start(&mut session).await?;
        }

        match self.app.call(&context, &mut session).await {
            Ok(mut response) => {
                if session.is_started() {
                    session.write_close().await?;
                }
                response.headers.extend(session.cookie_headers()?);
                Ok(response)
            }
            Err(error) => {
                if session.is_started() {
                    if let Err(close_error) = session.write_close().await {
                        log::warn!("Failed to close session after application error: {close_error}");
                    }
                }
                Err(error)
            }
        }
    }

    async fn start(&self, session: &mut Session) -> crate::Result {
        match session.start().await {
            Err(error) if self.recover_invalid_ids && error.kind() == ErrorKind::Validation => {
                log::warn!("Starting a fresh session instead of the client's: {error}");
                session.forget_client_id()?;
                session.start().await
            }
            result => result,
        }
    }
}

impl<A: Debug> Debug for SessionMiddleware<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMiddleware")
            .field("app", &self.app)
            .field("options", &self.options)
            .field("store_factory", &self.store_factory.is_some())
            .field("auto_start", &self.auto_start)
            .field("recover_invalid_ids", &self.recover_invalid_ids)
            .finish()
    }
}
