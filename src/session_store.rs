use crate::session_store::id_generator::{is_valid_id, IdGenerator};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

pub(crate) mod id_generator;

/// The data of a session: a mapping from string keys to arbitrary JSON values.
pub type SessionData = HashMap<String, Value>;

/// How often a store retries generating a session id before it gives up, unless it overrides
/// [`SessionStore::maximum_retries_on_id_collision`].
pub const DEFAULT_MAXIMUM_RETRIES_ON_ID_COLLISION: u32 = 32;

/// This is the backend-facing interface of a session.
///
/// A store instance holds at most one open record at a time.
/// While a record is open, the store holds an exclusive lock on it,
/// so that no other store instance, in this process or another, can open the same record
/// until it is closed.
/// This serializes the read-modify-write cycles of concurrent requests for the same session.
///
/// Dropping a store releases its lock without persisting anything.
#[async_trait]
pub trait SessionStore: Debug + Send + Sync {
    /// Generating a free session id may fail if the generated ids are taken.
    /// This indicates how often the caller should retry with different ids until it should give up.
    fn maximum_retries_on_id_collision(&self) -> u32 {
        DEFAULT_MAXIMUM_RETRIES_ON_ID_COLLISION
    }

    /// Returns true if no record exists for `id`.
    async fn is_id_free(&self, id: &str) -> Result<bool>;

    /// Generate ids until one is free, at most [`maximum_retries_on_id_collision`](Self::maximum_retries_on_id_collision) times.
    ///
    /// The returned id is not reserved. Use [`create`](Self::create) to reserve it atomically.
    async fn free_id(&self, generator: &dyn IdGenerator) -> Result<String> {
        let maximum = self.maximum_retries_on_id_collision();
        for _ in 0..maximum {
            let id = generator.generate();
            if !is_valid_id(&id) {
                return Err(Error::InvalidId(id));
            }
            if self.is_id_free(&id).await? {
                return Ok(id);
            }
            log::trace!("Generated session id {id:?} is taken, retrying");
        }

        Err(Error::IdentifierExhaustion { maximum })
    }

    /// Reserve a new unique id and open its (empty) record.
    ///
    /// Calls the generator at most [`maximum_retries_on_id_collision`](Self::maximum_retries_on_id_collision)
    /// times, and fails with [`Error::IdentifierExhaustion`] if every generated id was taken.
    async fn create(&mut self, generator: &dyn IdGenerator) -> Result<String>;

    /// Lock the record of `id` and load its data.
    /// A record that does not exist yet is opened as an empty record.
    ///
    /// Blocks while another store holds the record open.
    async fn open(&mut self, id: &str) -> Result;

    /// Returns the id of the open record, if any.
    fn open_id(&self) -> Option<&str>;

    /// Returns true if a record is open.
    fn is_open(&self) -> bool {
        self.open_id().is_some()
    }

    /// Returns the data of the open record.
    fn read(&self) -> Result<SessionData>;

    /// Replace the data of the open record.
    async fn write(&mut self, data: &SessionData) -> Result;

    /// Release the open record. Does nothing if no record is open.
    async fn close(&mut self) -> Result;

    /// Remove the open record entirely and release it.
    ///
    /// Fails with [`Error::RecordMissing`] if the record had already vanished,
    /// in which case the store is closed nonetheless.
    async fn destroy(&mut self) -> Result;

    /// Remove all records that were not modified for longer than `max_lifetime`.
    /// Records that are currently open by any store are skipped.
    ///
    /// Returns the number of removed records.
    async fn gc(&self, max_lifetime: Duration) -> Result<usize>;
}
