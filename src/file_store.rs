use crate::session_store::id_generator::{is_valid_id, IdGenerator};
use crate::{codec, Error, Result, SessionData, SessionOptions, SessionStore};
use async_std::task;
use async_trait::async_trait;
use fs2::FileExt;
use same_file::Handle;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const ID_PLACEHOLDER: &str = "%s";

/// # file session store
/// Stores every session in its own file below a save path, named by a filename pattern
/// in which `%s` is replaced by the session id, e.g. `sess_%s`.
/// The file content is the serialized session data.
///
/// While a record is open, its file is held open with an exclusive advisory lock
/// (`flock` on unix, `LockFileEx` on windows).
/// The lock is taken per file handle, so it serializes concurrent requests for the same session
/// across processes as well as across threads of one process.
/// Processes that access the save path without taking the lock are not kept out.
///
/// There is no timeout when waiting for a lock.
/// Callers that need bounded waits should wrap [`SessionStore::open`] in their own timeout.
#[derive(Debug)]
pub struct FileStore {
    save_path: PathBuf,
    filename_prefix: String,
    filename_suffix: String,
    record: Option<OpenRecord>,
}

#[derive(Debug)]
struct OpenRecord {
    id: String,
    path: PathBuf,
    handle: Handle,
    data: SessionData,
}

impl FileStore {
    /// Create a file store below `save_path` with the given filename pattern.
    ///
    /// The save path is created on first use. The pattern must contain `%s` exactly once.
    pub fn new(save_path: impl Into<PathBuf>, filename_pattern: &str) -> Result<Self> {
        let (filename_prefix, filename_suffix) = filename_pattern
            .split_once(ID_PLACEHOLDER)
            .filter(|(_, suffix)| !suffix.contains(ID_PLACEHOLDER))
            .ok_or_else(|| Error::InvalidFilenamePattern(filename_pattern.to_owned()))?;

        Ok(Self {
            save_path: save_path.into(),
            filename_prefix: filename_prefix.to_owned(),
            filename_suffix: filename_suffix.to_owned(),
            record: None,
        })
    }

    /// Create a file store from the `save_path` and `filename_pattern` options.
    pub fn from_options(options: &SessionOptions) -> Result<Self> {
        Self::new(options.save_path.clone(), &options.filename_pattern)
    }

    /// Returns the directory the session files are stored in.
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Returns the path of the file holding the record of `id`.
    pub fn session_filename(&self, id: &str) -> PathBuf {
        self.save_path.join(format!(
            "{}{id}{}",
            self.filename_prefix, self.filename_suffix
        ))
    }

    /// Returns the session id encoded in `filename`, if it matches the filename pattern.
    fn id_from_filename<'name>(&self, filename: &'name str) -> Option<&'name str> {
        filename
            .strip_prefix(self.filename_prefix.as_str())?
            .strip_suffix(self.filename_suffix.as_str())
            .filter(|id| is_valid_id(id))
    }

    fn prepare(&self) -> Result {
        fs::create_dir_all(&self.save_path).map_err(|source| self.unavailable(source))
    }

    fn unavailable(&self, source: io::Error) -> Error {
        Error::StorageUnavailable {
            path: self.save_path.clone(),
            source,
        }
    }

    fn ensure_closed(&self) -> Result {
        if self.record.is_some() {
            Err(Error::AlreadyOpen)
        } else {
            Ok(())
        }
    }

    fn record_mut(&mut self) -> Result<&mut OpenRecord> {
        self.record.as_mut().ok_or(Error::NotOpen)
    }
}

/// Wait for an exclusive lock on `file` without blocking the executor.
async fn acquire_lock(file: File) -> io::Result<File> {
    task::spawn_blocking(move || file.lock_exclusive().map(|()| file)).await
}

/// Returns true if `handle` is still the file found at `path`.
fn is_current(handle: &Handle, path: &Path) -> io::Result<bool> {
    match Handle::from_path(path) {
        Ok(current) => Ok(current == *handle),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Lock `file`, and return it if it is still the file at `path` once the lock is held.
/// A holder may destroy the record while we wait, and a new file may take its place.
async fn lock_current(file: File, path: &Path) -> io::Result<Option<Handle>> {
    let handle = Handle::from_file(acquire_lock(file).await?)?;
    Ok(is_current(&handle, path)?.then_some(handle))
}

fn read_file(file: &mut File) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Overwrite the content of `file` with `bytes`.
///
/// The file is cut to length only after all bytes are written, so it is never left empty.
/// A write that fails partway still leaves a mix of old and new bytes,
/// which the next opener discards as unreadable.
fn write_file(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.set_len(bytes.len() as u64)?;
    file.sync_data()
}

#[async_trait]
impl SessionStore for FileStore {
    async fn is_id_free(&self, id: &str) -> Result<bool> {
        Ok(!self.session_filename(id).try_exists()?)
    }

    async fn create(&mut self, generator: &dyn IdGenerator) -> Result<String> {
        self.ensure_closed()?;
        self.prepare()?;

        let maximum = self.maximum_retries_on_id_collision();
        for _ in 0..maximum {
            let id = generator.generate();
            if !is_valid_id(&id) {
                return Err(Error::InvalidId(id));
            }
            let path = self.session_filename(&id);
            // Creating the file reserves the id.
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    log::trace!("Generated session id {id:?} is taken, retrying");
                    continue;
                }
                Err(error) => return Err(self.unavailable(error)),
            };
            let Some(handle) = lock_current(file, &path).await? else {
                log::trace!("Session file {} vanished before it was locked", path.display());
                continue;
            };

            log::trace!("Created session file {}", path.display());
            self.record = Some(OpenRecord {
                id: id.clone(),
                path,
                handle,
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
        self.prepare()?;

        let path = self.session_filename(id);
        let mut handle = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if let Some(handle) = lock_current(file, &path).await? {
                break handle;
            }
            log::trace!("Session file {} was replaced while waiting for its lock", path.display());
        };

        let data = codec::decode_or_empty(id, &read_file(handle.as_file_mut())?);
        log::trace!("Opened session file {}", path.display());
        self.record = Some(OpenRecord {
            id: id.to_owned(),
            path,
            handle,
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
        let record = self.record_mut()?;
        let bytes = codec::encode(data)?;
        write_file(record.handle.as_file_mut(), &bytes)?;
        record.data = data.clone();
        Ok(())
    }

    async fn close(&mut self) -> Result {
        if let Some(record) = self.record.take() {
            FileExt::unlock(record.handle.as_file())?;
            log::trace!("Closed session file {}", record.path.display());
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result {
        let record = self.record.take().ok_or(Error::NotOpen)?;
        // The file is unlinked while still locked, and the lock is released when it is dropped.
        match fs::remove_file(&record.path) {
            Ok(()) => {
                log::trace!("Removed session file {}", record.path.display());
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(Error::RecordMissing { id: record.id })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn gc(&self, max_lifetime: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.save_path) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if self.id_from_filename(filename).is_none() {
                continue;
            }

            let file = match File::open(&path) {
                Ok(file) => file,
                // Removed concurrently.
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            if file.try_lock_exclusive().is_err() {
                log::trace!("Skipping locked session file {}", path.display());
                continue;
            }
            let handle = Handle::from_file(file)?;
            // Replaced concurrently, the new file may be held by a session.
            if !is_current(&handle, &path)? {
                continue;
            }

            let modified = handle.as_file().metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_lifetime {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        log::debug!(
            "Removed {removed} expired session files from {}",
            self.save_path.display()
        );
        Ok(removed)
    }
}
