use std::io;
use std::path::PathBuf;

/// All errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session data was accessed, or a lifecycle operation was attempted,
    /// while the session was not started.
    #[error("the session is not started")]
    NotStarted,

    /// The session was reconfigured after it was started.
    #[error("the session is already started")]
    AlreadyStarted,

    /// The session was closed or destroyed before. A session cannot be started twice,
    /// construct a new one instead.
    #[error("the session was already closed")]
    AlreadyClosed,

    /// A session store operation required an open record, but none was open.
    #[error("the session store has no open record")]
    NotOpen,

    /// A session store was asked to open a record while it still held another one.
    #[error("the session store already has an open record")]
    AlreadyOpen,

    /// A session id does not match `[A-Za-z0-9,-]+`.
    #[error("invalid session id {0:?}")]
    InvalidId(String),

    /// A cookie name contains one of `=,; \t\r\n\x0B\x0C`.
    #[error("cookie names can not contain any of '=,; \\t\\r\\n\\013\\014', got {0:?}")]
    InvalidName(String),

    /// A raw cookie value contains one of `,; \t\r\n\x0B\x0C`.
    #[error("raw cookie values can not contain any of ',; \\t\\r\\n\\013\\014', got {0:?}")]
    InvalidValue(String),

    /// The client presented different session ids in the cookie and in the query.
    #[error("the session cookie carries {cookie:?}, but the query carries {transport:?}")]
    ConflictingIdentifier {
        /// The id found in the cookie.
        cookie: String,
        /// The id found in the alternate transport.
        transport: String,
    },

    /// A cookie expiry timestamp cannot be represented as a date.
    #[error("the cookie expiry timestamp {0} is out of range")]
    ExpiryOutOfRange(i64),

    /// The configured cookie lifetime exceeds [`MAXIMUM_COOKIE_LIFETIME`](crate::MAXIMUM_COOKIE_LIFETIME).
    #[error("the cookie lifetime of {0} seconds is too long")]
    InvalidCookieLifetime(u64),

    /// A file store filename pattern does not contain exactly one `%s`.
    #[error("the filename pattern {0:?} must contain `%s` exactly once")]
    InvalidFilenamePattern(String),

    /// The storage location cannot be prepared, e.g. the save path is not writable.
    #[error("the session storage at {} is unavailable: {source}", path.display())]
    StorageUnavailable {
        /// The location that could not be prepared.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// Reading or writing a session record failed.
    #[error("session I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The session data could not be serialized or deserialized.
    #[error("session data could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tried as often as allowed to generate a session id, but all generated ids were taken.
    #[error("the maximum number of retries ({maximum}) to generate a free session id was reached")]
    IdentifierExhaustion {
        /// The maximum number of retries that was reached.
        maximum: u32,
    },

    /// A record was destroyed, but it did not exist anymore.
    #[error("the record of session {id:?} does not exist")]
    RecordMissing {
        /// The id of the missing record.
        id: String,
    },
}

/// The broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The API was misused, e.g. session data was accessed before starting the session.
    /// These are bugs in the caller and should never be retried.
    Contract,
    /// Malformed or adversarial input was rejected before any durable side effect.
    Validation,
    /// The storage backend failed.
    Resource,
    /// Something unexpected happened, but the operation achieved its goal anyway.
    Warning,
}

impl Error {
    /// Returns the category of this error.
    ///
    /// ```rust
    /// use locked_session::{Error, ErrorKind};
    ///
    /// assert_eq!(Error::NotStarted.kind(), ErrorKind::Contract);
    /// assert_eq!(Error::InvalidId("../x".into()).kind(), ErrorKind::Validation);
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotStarted
            | Self::AlreadyStarted
            | Self::AlreadyClosed
            | Self::NotOpen
            | Self::AlreadyOpen => ErrorKind::Contract,
            Self::InvalidId(_)
            | Self::InvalidName(_)
            | Self::InvalidValue(_)
            | Self::ConflictingIdentifier { .. }
            | Self::ExpiryOutOfRange(_)
            | Self::InvalidCookieLifetime(_)
            | Self::InvalidFilenamePattern(_) => ErrorKind::Validation,
            Self::StorageUnavailable { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::IdentifierExhaustion { .. } => ErrorKind::Resource,
            Self::RecordMissing { .. } => ErrorKind::Warning,
        }
    }
}
