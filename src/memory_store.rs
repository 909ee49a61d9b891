use crate::session_store::id_generator::{is_valid_id, IdGenerator};
use crate::{codec, Error, Result, SessionData, SessionStore};
use async_lock::{Mutex as AsyncMutex, MutexGuardArc};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>>;

/// # in-memory session store
/// Because there is no external
/// persistence, this session store is ephemeral and will be cleared
/// on server restart.
///
/// Clones of a memory store share their records, but each clone opens records on its own.
/// Like the [`FileStore`](crate::FileStore), a store holds an exclusive lock on its open record,
/// so clones serialize their access to the same session.
///
/// # ***READ THIS BEFORE USING IN A PRODUCTION DEPLOYMENT***
///
/// Storing sessions only in memory brings the following problems:
///
/// 1. All sessions must fit in available memory (important for high load services)
/// 2. Sessions are only removed when destroyed or garbage collected.
///    If [`SessionStore::gc`] never runs, memory accumulates.
/// 3. All sessions will be lost on shutdown
/// 4. If the service is clustered particular session will be stored only on a single instance.
///    This might be solved by using load balancers with sticky sessions.
pub struct MemoryStore {
    slots: Slots,
    record: Option<OpenSlot>,
}

#[derive(Debug)]
struct Slot {
    bytes: Option<Vec<u8>>,
    modified: DateTime<Utc>,
}

struct OpenSlot {
    id: String,
    guard: MutexGuardArc<Slot>,
    data: SessionData,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a handle to the memory store shared by the whole process.
    /// This is the store bound for [`StorageBackend::Memory`](crate::StorageBackend::Memory).
    pub fn shared() -> Self {
        static SHARED: OnceLock<Slots> = OnceLock::new();
        Self {
            slots: SHARED.get_or_init(Default::default).clone(),
            record: None,
        }
    }

    /// Returns the number of records in the memory store, including records
    /// that were opened but never written.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Returns true if the memory store is empty.
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<Slot>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &str) -> Arc<AsyncMutex<Slot>> {
        self.slots()
            .entry(id.to_owned())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Slot {
                    bytes: None,
                    modified: Utc::now(),
                }))
            })
            .clone()
    }

    /// Returns true if `slot` is still the slot registered for `id`.
    fn is_current(&self, id: &str, slot: &Arc<AsyncMutex<Slot>>) -> bool {
        self.slots()
            .get(id)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
    }

    fn ensure_closed(&self) -> Result {
        if self.record.is_some() {
            Err(Error::AlreadyOpen)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn is_id_free(&self, id: &str) -> Result<bool> {
        Ok(!self.slots().contains_key(id))
    }

    async fn create(&mut self, generator: &dyn IdGenerator) -> Result<String> {
        self.ensure_closed()?;

        let maximum = self.maximum_retries_on_id_collision();
        for _ in 0..maximum {
            let id = generator.generate();
            if !is_valid_id(&id) {
                return Err(Error::InvalidId(id));
            }
            let slot = Arc::new(AsyncMutex::new(Slot {
                bytes: None,
                modified: Utc::now(),
            }));
            // The slot is locked before it becomes visible to other stores.
            let guard = slot.lock_arc().await;
            {
                let mut slots = self.slots();
                if slots.contains_key(&id) {
                    log::trace!("Generated session id {id:?} is taken, retrying");
                    continue;
                }
                slots.insert(id.clone(), slot);
            }

            log::trace!("Created in-memory session {id:?}");
            self.record = Some(OpenSlot {
                id: id.clone(),
                guard,
                data: SessionData::new(),
            });
            return Ok(id);
        }

        Err(Error::IdentifierExhaustion { maximum })
    }

    async fn open(&mut self, id: &str) -> Result {
        self.ensure_closed()?;
        if !is_valid_id(id) {
            return Err(Error::InvalidId(id.to_owned()));
        }

        let guard = loop {
            let slot = self.slot(id);
            let guard = slot.lock_arc().await;
            // The previous holder may have removed the slot while we were waiting.
            if self.is_current(id, &slot) {
                break guard;
            }
        };

        let data = guard
            .bytes
            .as_deref()
            .map(|bytes| codec::decode_or_empty(id, bytes))
            .unwrap_or_default();
        log::trace!("Opened in-memory session {id:?}");
        self.record = Some(OpenSlot {
            id: id.to_owned(),
            guard,
            data,
        });
        Ok(())
    }

    fn open_id(&self) -> Option<&str> {
        self.record.as_ref().map(|record| record.id.as_str())
    }

    fn read(&self) -> Result<SessionData> {
        self.record
            .as_ref()
            .map(|record| record.data.clone())
            .ok_or(Error::NotOpen)
    }

    async fn write(&mut self, data: &SessionData) -> Result {
        let record = self.record.as_mut().ok_or(Error::NotOpen)?;
        record.guard.bytes = Some(codec::encode(data)?);
        record.guard.modified = Utc::now();
        record.data = data.clone();
        Ok(())
    }

    async fn close(&mut self) -> Result {
        if let Some(record) = self.record.take() {
            log::trace!("Closed in-memory session {:?}", record.id);
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result {
        let mut record = self.record.take().ok_or(Error::NotOpen)?;
        let existed = record.guard.bytes.take().is_some();
        // Removed while still locked, so waiters notice and register a fresh slot.
        self.slots().remove(&record.id);

        if existed {
            log::trace!("Destroyed in-memory session {:?}", record.id);
            Ok(())
        } else {
            Err(Error::RecordMissing { id: record.id })
        }
    }

    async fn gc(&self, max_lifetime: Duration) -> Result<usize> {
        let now = Utc::now();
        let initial_len = self.len();
        self.slots().retain(|id, slot| {
            let Some(slot) = slot.try_lock_arc() else {
                log::trace!("Skipping locked in-memory session {id:?}");
                return true;
            };
            let age = (now - slot.modified).to_std().unwrap_or_default();
            age <= max_lifetime
        });
        let removed = initial_len.saturating_sub(self.len());
        log::debug!("Removed {removed} expired in-memory sessions");
        Ok(removed)
    }
}

impl Clone for MemoryStore {
    /// The clone shares the records, but has no open record.
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            record: None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            record: None,
        }
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len())
            .field("open_id", &self.open_id())
            .finish()
    }
}
