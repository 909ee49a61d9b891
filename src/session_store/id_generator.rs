use rand::{thread_rng, RngCore};
use std::fmt::{Debug, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns true if `id` matches `[A-Za-z0-9,-]+`.
///
/// Ids arriving from the client are checked with this before they are used as storage keys.
///
/// ```rust
/// use locked_session::is_valid_id;
///
/// assert!(is_valid_id("a1,B-2"));
/// assert!(!is_valid_id(""));
/// assert!(!is_valid_id("../etc/passwd"));
/// assert!(!is_valid_id("id;drop"));
/// ```
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b',' || byte == b'-')
}

/// A type with the ability to generate session ids.
///
/// Generated ids must satisfy [`is_valid_id`], but need not be unique.
/// Session stores combine the generator with a check whether the id is free.
pub trait IdGenerator: Debug + Send + Sync {
    /// Generate a candidate session id.
    fn generate(&self) -> String;
}

/// The default id generator.
///
/// It hashes the host identity, the current time in nanoseconds, the identity of the remote peer
/// and 128 random bits with blake3, and emits the hash as `ID_LENGTH` lowercase hex characters.
#[derive(Debug, Default, Clone)]
pub struct DefaultIdGenerator<const ID_LENGTH: usize = 32> {
    peer: Option<String>,
}

impl<const ID_LENGTH: usize> DefaultIdGenerator<ID_LENGTH> {
    /// Create a generator that mixes the identity of the remote peer into the ids,
    /// e.g. its address and user agent.
    pub fn with_peer(peer: impl Into<String>) -> Self {
        Self {
            peer: Some(peer.into()),
        }
    }
}

impl<const ID_LENGTH: usize> IdGenerator for DefaultIdGenerator<ID_LENGTH> {
    fn generate(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let mut salt = [0; 16];
        thread_rng().fill_bytes(&mut salt);

        let mut hasher = blake3::Hasher::new();
        hasher.update(host_identity().as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&nanos.to_le_bytes());
        if let Some(peer) = &self.peer {
            hasher.update(peer.as_bytes());
        }
        hasher.update(&salt);

        let mut bytes = vec![0; (ID_LENGTH + 1) / 2];
        hasher.finalize_xof().fill(&mut bytes);

        let mut id = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            // Writing to a string cannot fail.
            let _ = write!(id, "{byte:02x}");
        }
        id.truncate(ID_LENGTH);
        id
    }
}

fn host_identity() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default()
}

/// A debug id generator that generates an ascending sequence of integers, formatted as strings padded with zeroes.
#[derive(Debug, Default)]
pub struct DebugIdGenerator<const ID_LENGTH: usize = 32> {
    next_index: AtomicUsize,
}

impl<const ID_LENGTH: usize> IdGenerator for DebugIdGenerator<ID_LENGTH> {
    fn generate(&self) -> String {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        format!("{index:0width$}", width = ID_LENGTH)
    }
}
