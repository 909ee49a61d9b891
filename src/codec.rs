use crate::{Result, SessionData};

/// Serialize session data into the bytes of a session record.
pub(crate) fn encode(data: &SessionData) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

/// Deserialize the bytes of a session record. A record without content holds an empty session.
pub(crate) fn decode(bytes: &[u8]) -> Result<SessionData> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(SessionData::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Like [`decode`], but unreadable records are logged and treated as empty.
pub(crate) fn decode_or_empty(id: &str, bytes: &[u8]) -> SessionData {
    decode(bytes).unwrap_or_else(|error| {
        log::warn!("Discarding unreadable record of session {id:?}: {error}");
        SessionData::new()
    })
}
