//! Flat JSON documents on local disk.
//!
//! Every mutation goes through [`JsonDocument::update`], which holds an exclusive
//! lock on `<document>.lock` for the whole load -> mutate -> store sequence. The
//! lock is an OS file lock, so the bot process and the web process serialize
//! against each other as well as against their own threads.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StorageError, StorageResult};

const TEMP_FILE_SUFFIX: &str = ".tmp";
const LOCK_FILE_SUFFIX: &str = ".lock";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sidecar(path, TEMP_FILE_SUFFIX);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Exclusive lock on the sidecar `.lock` file of a document. Released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(target: &Path, timeout: Duration) -> StorageResult<Self> {
        let path = sidecar(target, LOCK_FILE_SUFFIX);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Lock {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| StorageError::Lock {
                path: path.clone(),
                source,
            })?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Self { file }),
                Err(TryLockError::WouldBlock) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StorageError::LockTimeout { path, waited });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(TryLockError::Error(source)) => {
                    return Err(StorageError::Lock { path, source });
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A typed JSON document. A missing or empty file reads as `T::default()`.
pub struct JsonDocument<T> {
    path: PathBuf,
    lock_timeout: Duration,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            _doc: PhantomData,
        }
    }

    /// Lock-free read. Writers replace the file by rename, so this never
    /// observes a half-written document.
    pub fn load(&self) -> StorageResult<T> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    /// Locked read-modify-write.
    ///
    /// `f` returns `None` when it decided not to change anything; the document
    /// is then left untouched and `Ok(None)` is returned.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Option<R>) -> StorageResult<Option<R>> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut doc = self.load()?;
        let Some(out) = f(&mut doc) else {
            return Ok(None);
        };
        self.store(&doc)?;
        Ok(Some(out))
    }

    fn store(&self, doc: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StorageError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// RFC 3339 timestamps, also accepting naive ISO-8601 (read as UTC) written by
/// older deployments.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|n| n.and_utc())
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            v: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match v {
                Some(ts) => s.serialize_some(&super::format(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            match raw {
                None => Ok(None),
                Some(s) => super::parse(&s)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {s}"))),
            }
        }
    }
}
