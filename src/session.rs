use crate::cookie::{validate_cookie_name, SetCookie, SET_COOKIE};
use crate::session_store::id_generator::{is_valid_id, DefaultIdGenerator, IdGenerator};
use crate::{Error, RequestContext, Result, SessionData, SessionOptions, SessionStore};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::mem;
use std::time::Duration;

/// The session of one request.
///
/// A session is constructed per request from the [`RequestContext`], configured, and then started,
/// which resolves its id from the client or mints a new one, and locks and loads its record.
/// While started, its data can be accessed with [`get`](Self::get), [`set`](Self::set),
/// [`has`](Self::has) and [`delete`](Self::delete).
/// It ends with [`write_close`](Self::write_close), which persists the data,
/// with [`destroy`](Self::destroy), which removes the record, or with [`abort`](Self::abort),
/// which discards all changes.
/// A closed session cannot be started again.
///
/// The record stays locked while the session is started.
/// Dropping a started session releases the lock without persisting anything.
///
/// # Example
///
/// ```rust
/// use locked_session::{MemoryStore, RequestContext, Session};
///
/// # fn main() -> locked_session::Result { async_std::task::block_on(async {
/// let store = MemoryStore::new();
///
/// let mut session = Session::new(&RequestContext::new());
/// session.set_save_handler(store.clone())?;
/// session.start().await?;
/// session.set("visits", 1)?;
/// session.write_close().await?;
/// let headers = session.cookie_headers()?;
/// assert_eq!(headers.len(), 1);
///
/// // The client presents the cookie on its next request.
/// let cookie = headers[0].1.split("; ").next().unwrap().to_owned();
/// let mut session = Session::new(&RequestContext::new().with_cookie_header(cookie));
/// session.set_save_handler(store)?;
/// session.start().await?;
/// assert_eq!(session.get("visits")?, Some(&serde_json::json!(1)));
/// assert!(session.cookie_headers()?.is_empty());
/// # Ok(()) }) }
/// ```
#[derive(Debug)]
pub struct Session {
    options: SessionOptions,
    cookies: HashMap<String, String>,
    query: HashMap<String, String>,
    peer: Option<String>,
    requested_id: Option<String>,
    save_handler: Option<Box<dyn SessionStore>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    state: SessionState,
    cookie_command: SessionCookieCommand,
}

#[derive(Debug)]
enum SessionState {
    Unstarted,
    Started {
        id: String,
        data: SessionData,
        store: Box<dyn SessionStore>,
    },
    Closed,
}

/// The lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// The session can be configured and started.
    Unstarted,
    /// The session data is loaded and its record locked.
    Started,
    /// The session was written, destroyed or aborted.
    Closed,
}

/// What the client should be told about the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionCookieCommand {
    /// The client's cookie is up to date, or cookies are disabled.
    #[default]
    DoNothing,
    /// The client should store the session cookie with the given id.
    Set {
        /// The session id.
        id: String,
    },
    /// The client should delete the session cookie.
    Delete,
}

/// Where the id of a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdSource {
    Explicit,
    Cookie,
    Transport,
}

impl Session {
    /// Create an unstarted session for a request with default options.
    pub fn new(context: &RequestContext) -> Self {
        Self {
            options: SessionOptions::default(),
            cookies: context.cookies().clone(),
            query: context.query().clone(),
            peer: context.peer().map(ToOwned::to_owned),
            requested_id: None,
            save_handler: None,
            id_generator: None,
            state: SessionState::Unstarted,
            cookie_command: SessionCookieCommand::DoNothing,
        }
    }

    /// Replace the options of this session.
    ///
    /// Fails with [`Error::InvalidCookieLifetime`] if `cookie_lifetime` exceeds
    /// [`MAXIMUM_COOKIE_LIFETIME`](crate::MAXIMUM_COOKIE_LIFETIME).
    ///
    /// Use struct update syntax to override only some defaults:
    ///
    /// ```rust
    /// use locked_session::{RequestContext, Session, SessionOptions};
    ///
    /// let mut session = Session::new(&RequestContext::new());
    /// session
    ///     .configure(SessionOptions {
    ///         cookie_lifetime: 3600,
    ///         ..Default::default()
    ///     })
    ///     .unwrap();
    /// assert_eq!(session.options().cookie_lifetime, 3600);
    /// ```
    pub fn configure(&mut self, options: SessionOptions) -> Result {
        self.ensure_unstarted()?;
        options.validate()?;
        self.options = options;
        Ok(())
    }

    /// Bind the session store. If no store is bound, [`start`](Self::start) binds the one
    /// selected by the `storage_backend` option.
    pub fn set_save_handler(&mut self, store: impl SessionStore + 'static) -> Result {
        self.set_boxed_save_handler(Box::new(store))
    }

    /// Like [`set_save_handler`](Self::set_save_handler), for stores that are boxed already.
    pub fn set_boxed_save_handler(&mut self, store: Box<dyn SessionStore>) -> Result {
        self.ensure_unstarted()?;
        self.save_handler = Some(store);
        Ok(())
    }

    /// Set the generator for new session ids.
    /// By default, a [`DefaultIdGenerator`] that mixes in the peer of the request is used.
    pub fn set_id_generator(&mut self, generator: impl IdGenerator + 'static) -> Result {
        self.ensure_unstarted()?;
        self.id_generator = Some(Box::new(generator));
        Ok(())
    }

    /// Use the given id instead of the one presented by the client.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result {
        self.ensure_unstarted()?;
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(Error::InvalidId(id));
        }
        self.requested_id = Some(id);
        Ok(())
    }

    /// Ignore the id presented by the client, so that starting mints a fresh session.
    pub fn forget_client_id(&mut self) -> Result {
        self.ensure_unstarted()?;
        self.cookies.remove(&self.options.cookie_name);
        self.query.remove(&self.options.cookie_name);
        Ok(())
    }

    /// Returns the options of this session.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Returns the name of the session cookie.
    pub fn name(&self) -> &str {
        &self.options.cookie_name
    }

    /// Returns the lifecycle state of this session.
    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Unstarted => SessionStatus::Unstarted,
            SessionState::Started { .. } => SessionStatus::Started,
            SessionState::Closed => SessionStatus::Closed,
        }
    }

    /// Returns true if this session is started.
    pub fn is_started(&self) -> bool {
        self.status() == SessionStatus::Started
    }

    /// Returns the id of this session.
    pub fn id(&self) -> Result<&str> {
        match &self.state {
            SessionState::Started { id, .. } => Ok(id),
            _ => Err(Error::NotStarted),
        }
    }

    /// Start the session. Does nothing if the session is started already.
    ///
    /// The id is taken from [`set_id`](Self::set_id) if it was called,
    /// else from the session cookie, else from the query parameter named like the cookie
    /// if `use_only_cookies` is disabled.
    /// If both the cookie and the query carry an id and they differ, this fails with
    /// [`Error::ConflictingIdentifier`].
    /// If no id is found, the store mints a new one and a session cookie will be sent.
    ///
    /// Blocks while another request holds the same session.
    pub async fn start(&mut self) -> Result {
        match self.state {
            SessionState::Started { .. } => return Ok(()),
            SessionState::Closed => return Err(Error::AlreadyClosed),
            SessionState::Unstarted => {}
        }

        if self.options.use_cookies {
            validate_cookie_name(&self.options.cookie_name)?;
        }
        let resolved = self.resolve_id()?;

        let mut store = match self.save_handler.take() {
            Some(store) => store,
            None => self.options.storage_backend.bind(&self.options)?,
        };
        let peer = self.peer.as_deref();
        let generator = self
            .id_generator
            .get_or_insert_with(|| default_id_generator(peer));

        let opened = match &resolved {
            Some((id, _)) => store.open(id).await.map(|()| id.clone()),
            None => store.create(generator.as_ref()).await,
        };
        let (id, data) = match opened.and_then(|id| Ok((id, store.read()?))) {
            Ok(opened) => opened,
            Err(error) => {
                // The session stays unstarted, and keeps the store for another attempt.
                if let Err(close_error) = store.close().await {
                    log::warn!("Failed to release session store after failed start: {close_error}");
                }
                self.save_handler = Some(store);
                return Err(error);
            }
        };

        let source = resolved.map(|(_, source)| source);
        if self.options.use_cookies && source != Some(IdSource::Cookie) {
            self.cookie_command = SessionCookieCommand::Set { id: id.clone() };
        }

        self.collect_garbage(store.as_ref()).await;

        log::debug!(
            "Started session {id:?} ({})",
            match source {
                Some(IdSource::Explicit) => "explicit id",
                Some(IdSource::Cookie) => "from cookie",
                Some(IdSource::Transport) => "from query",
                None => "new",
            }
        );
        self.state = SessionState::Started { id, data, store };
        Ok(())
    }

    fn resolve_id(&self) -> Result<Option<(String, IdSource)>> {
        if let Some(id) = &self.requested_id {
            return Ok(Some((id.clone(), IdSource::Explicit)));
        }

        let name = &self.options.cookie_name;
        let from_cookie = self
            .cookies
            .get(name)
            .filter(|id| self.options.use_cookies && !id.is_empty());
        let from_transport = self
            .query
            .get(name)
            .filter(|id| !self.options.use_only_cookies && !id.is_empty());

        let resolved = match (from_cookie, from_transport) {
            (Some(cookie), Some(transport)) if cookie != transport => {
                return Err(Error::ConflictingIdentifier {
                    cookie: cookie.clone(),
                    transport: transport.clone(),
                })
            }
            (Some(cookie), _) => Some((cookie.clone(), IdSource::Cookie)),
            (None, Some(transport)) => Some((transport.clone(), IdSource::Transport)),
            (None, None) => None,
        };

        match resolved {
            Some((id, _)) if !is_valid_id(&id) => Err(Error::InvalidId(id)),
            resolved => Ok(resolved),
        }
    }

    async fn collect_garbage(&self, store: &dyn SessionStore) {
        let SessionOptions {
            gc_probability,
            gc_divisor,
            gc_maxlifetime,
            ..
        } = self.options;
        if gc_divisor == 0 {
            return;
        }
        let roll = rand::thread_rng().gen_range(0..gc_divisor);
        if roll >= gc_probability {
            return;
        }

        if let Err(error) = store.gc(Duration::from_secs(gc_maxlifetime)).await {
            log::warn!("Session garbage collection failed: {error}");
        }
    }

    fn data(&self) -> Result<&SessionData> {
        match &self.state {
            SessionState::Started { data, .. } => Ok(data),
            _ => Err(Error::NotStarted),
        }
    }

    fn data_mut(&mut self) -> Result<&mut SessionData> {
        match &mut self.state {
            SessionState::Started { data, .. } => Ok(data),
            _ => Err(Error::NotStarted),
        }
    }

    /// Returns the value stored under `key`, or `None` if there is none.
    pub fn get(&self, key: &str) -> Result<Option<&Value>> {
        Ok(self.data()?.get(key))
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        Ok(self.data_mut()?.insert(key.into(), value.into()))
    }

    /// Returns true if a value is stored under `key`.
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.data()?.contains_key(key))
    }

    /// Remove the value stored under `key`, returning it.
    pub fn delete(&mut self, key: &str) -> Result<Option<Value>> {
        Ok(self.data_mut()?.remove(key))
    }

    /// Returns an iterator over the keys of the session data.
    pub fn keys(&self) -> Result<impl Iterator<Item = &str>> {
        Ok(self.data()?.keys().map(String::as_str))
    }

    /// Move the session data to a new id, and send a new session cookie.
    ///
    /// The data is kept under the old id as well, unless `delete_old` is set,
    /// in which case the old record is destroyed.
    /// Regenerate the id whenever the privileges of a session change, e.g. on login,
    /// so that an attacker who planted a known id in the client cannot use it.
    ///
    /// If no new record can be created, the record of the old id is opened again and the error
    /// is returned. The session stays started under its old id with its data intact,
    /// so [`write_close`](Self::write_close) still persists it.
    /// Only if the old record cannot be reopened either, the session is closed.
    pub async fn regenerate_id(&mut self, delete_old: bool) -> Result {
        let SessionState::Started { id, data, store } = &mut self.state else {
            return Err(Error::NotStarted);
        };

        let released = if delete_old {
            match store.destroy().await {
                Err(Error::RecordMissing { id }) => {
                    log::warn!("Record of session {id:?} vanished before regeneration");
                    Ok(())
                }
                result => result,
            }
        } else {
            // The old record is still open if writing fails.
            store.write(data).await?;
            store.close().await
        };

        let peer = self.peer.as_deref();
        let generator = self
            .id_generator
            .get_or_insert_with(|| default_id_generator(peer));
        let created = match released {
            Ok(()) => store.create(generator.as_ref()).await,
            Err(error) => Err(error),
        };
        let new_id = match created {
            Ok(new_id) => new_id,
            Err(error) => {
                let reopened = match store.open_id() {
                    Some(_) => Ok(()),
                    None => store.open(id).await,
                };
                if let Err(reopen_error) = reopened {
                    log::warn!("Closing session {id:?}, it cannot be reopened after failed regeneration: {reopen_error}");
                    self.state = SessionState::Closed;
                }
                return Err(error);
            }
        };
        log::debug!("Regenerated session {id:?} as {new_id:?}");
        *id = new_id;

        if self.options.use_cookies {
            self.cookie_command = SessionCookieCommand::Set { id: id.clone() };
        }
        Ok(())
    }

    /// Persist the session data, release the record and close the session.
    ///
    /// The record is released even if persisting fails.
    pub async fn write_close(&mut self) -> Result {
        let (id, data, mut store) = self.close_state()?;

        let written = store.write(&data).await;
        let closed = store.close().await;
        written?;
        closed?;

        log::debug!("Wrote and closed session {id:?}");
        Ok(())
    }

    /// Alias for [`write_close`](Self::write_close).
    pub async fn commit(&mut self) -> Result {
        self.write_close().await
    }

    /// Release the record and close the session without persisting the session data.
    pub async fn abort(&mut self) -> Result {
        let (id, _, mut store) = self.close_state()?;
        store.close().await?;

        log::debug!("Aborted session {id:?}");
        Ok(())
    }

    /// Remove the record of this session, close the session and tell the client to delete the cookie.
    pub async fn destroy(&mut self) -> Result {
        let (id, _, mut store) = self.close_state()?;
        if self.options.use_cookies {
            self.cookie_command = SessionCookieCommand::Delete;
        }

        match store.destroy().await {
            Ok(()) => {}
            Err(Error::RecordMissing { id }) => {
                log::warn!("Record of destroyed session {id:?} was already gone");
            }
            Err(error) => return Err(error),
        }

        log::debug!("Destroyed session {id:?}");
        Ok(())
    }

    /// Transition from `Started` to `Closed`, returning what the started state owned.
    fn close_state(&mut self) -> Result<(String, SessionData, Box<dyn SessionStore>)> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let SessionState::Started { id, data, store } =
            mem::replace(&mut self.state, SessionState::Closed)
        else {
            unreachable!("The session was checked to be started")
        };
        Ok((id, data, store))
    }

    /// Returns what the client should be told about the session cookie.
    pub fn cookie_command(&self) -> &SessionCookieCommand {
        &self.cookie_command
    }

    /// Returns the `Set-Cookie` headers to send to the client, as `(name, value)` pairs.
    ///
    /// This is empty unless starting, regenerating or destroying the session changed the cookie,
    /// and never contains more than one header.
    pub fn cookie_headers(&self) -> Result<Vec<(String, String)>> {
        let value = match &self.cookie_command {
            SessionCookieCommand::DoNothing => return Ok(Vec::new()),
            SessionCookieCommand::Set { id } => id.as_str(),
            SessionCookieCommand::Delete => "",
        };

        let now = Utc::now();
        let options = &self.options;
        let expires = match i64::try_from(options.cookie_lifetime) {
            Ok(0) => 0,
            Ok(lifetime) => now.timestamp().saturating_add(lifetime),
            Err(_) => i64::MAX,
        };
        let cookie = SetCookie {
            name: &options.cookie_name,
            value,
            expires,
            path: options.cookie_path.as_deref(),
            domain: options.cookie_domain.as_deref(),
            secure: options.cookie_secure,
            http_only: options.cookie_httponly,
            raw: false,
        };

        Ok(vec![(SET_COOKIE.to_owned(), cookie.render(now)?)])
    }

    fn ensure_unstarted(&self) -> Result {
        match self.state {
            SessionState::Unstarted => Ok(()),
            SessionState::Started { .. } => Err(Error::AlreadyStarted),
            SessionState::Closed => Err(Error::AlreadyClosed),
        }
    }
}

fn default_id_generator(peer: Option<&str>) -> Box<dyn IdGenerator> {
    match peer {
        Some(peer) => Box::new(DefaultIdGenerator::<32>::with_peer(peer)),
        None => Box::new(DefaultIdGenerator::<32>::default()),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let SessionState::Started { id, .. } = &self.state {
            log::debug!("Session {id:?} dropped while started, releasing it without writing");
        }
    }
}
