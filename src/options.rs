use crate::{Error, FileStore, MemoryStore, Result, SessionStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The longest accepted `cookie_lifetime`, one hundred years in seconds.
pub const MAXIMUM_COOKIE_LIFETIME: u64 = 100 * 365 * 24 * 60 * 60;

/// The session store bound by [`Session::start`](crate::Session::start) if no store was set explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// A [`FileStore`] below `save_path`, named by `filename_pattern`.
    #[default]
    File,
    /// The process-wide [`MemoryStore::shared`].
    Memory,
}

impl StorageBackend {
    pub(crate) fn bind(self, options: &SessionOptions) -> Result<Box<dyn SessionStore>> {
        Ok(match self {
            Self::File => Box::new(FileStore::from_options(options)?),
            Self::Memory => Box::new(MemoryStore::shared()),
        })
    }
}

/// The configuration of a session.
///
/// Missing fields take their default values when deserializing, so a partial configuration
/// overrides only what it names.
///
/// ```rust
/// use locked_session::{SessionOptions, StorageBackend};
///
/// let options: SessionOptions =
///     serde_json::from_str(r#"{"cookie_name": "app", "storage_backend": "memory"}"#).unwrap();
/// assert_eq!(options.cookie_name, "app");
/// assert_eq!(options.storage_backend, StorageBackend::Memory);
/// assert_eq!(options.cookie_path.as_deref(), Some("/"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// The name of the session cookie, and of the query parameter carrying the session id.
    pub cookie_name: String,
    /// Seconds until the session cookie expires. `0` makes it expire with the browser session.
    pub cookie_lifetime: u64,
    /// The `path` attribute of the session cookie.
    pub cookie_path: Option<String>,
    /// The `domain` attribute of the session cookie.
    pub cookie_domain: Option<String>,
    /// Whether the session cookie carries the `secure` flag.
    pub cookie_secure: bool,
    /// Whether the session cookie carries the `httponly` flag.
    pub cookie_httponly: bool,
    /// The session store to bind if none was set explicitly.
    pub storage_backend: StorageBackend,
    /// The directory of the file backend.
    pub save_path: PathBuf,
    /// The session filenames of the file backend. `%s` is replaced by the session id.
    pub filename_pattern: String,
    /// Whether the session id is read from and sent in a cookie.
    pub use_cookies: bool,
    /// If false, the session id may also be passed as a query parameter.
    pub use_only_cookies: bool,
    /// Starting a session collects garbage with probability `gc_probability / gc_divisor`.
    pub gc_probability: u32,
    /// See `gc_probability`. `0` disables garbage collection on start.
    pub gc_divisor: u32,
    /// Records not modified for this many seconds are garbage.
    pub gc_maxlifetime: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cookie_name: "SESSID".to_owned(),
            cookie_lifetime: 0,
            cookie_path: Some("/".to_owned()),
            cookie_domain: None,
            cookie_secure: false,
            cookie_httponly: false,
            storage_backend: StorageBackend::File,
            save_path: std::env::temp_dir(),
            filename_pattern: "sess_%s".to_owned(),
            use_cookies: true,
            use_only_cookies: true,
            gc_probability: 1,
            gc_divisor: 100,
            gc_maxlifetime: 1440,
        }
    }
}

impl SessionOptions {
    /// Check the options that cannot be checked by their types.
    pub(crate) fn validate(&self) -> Result {
        if self.cookie_lifetime > MAXIMUM_COOKIE_LIFETIME {
            return Err(Error::InvalidCookieLifetime(self.cookie_lifetime));
        }
        Ok(())
    }
}
