//! JSON file storage for the credential record.
//!
//! The file is replaced atomically (write to a sibling temp file, then
//! rename), so a reader never observes a half-written record.

use super::{CredentialRecord, TokenUpdate, CONFIG_SYNC_KEY};
use crate::error::{AuthError, Result};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Receives the current access token after every successful update.
///
/// The host application uses this to mirror the token into its own
/// configuration store.
pub trait TokenObserver: Send + Sync {
    fn on_access_token(&self, key: &str, access_token: &str);
}

/// Observer that only records the synchronization in the log.
pub struct LoggingTokenObserver;

impl TokenObserver for LoggingTokenObserver {
    fn on_access_token(&self, key: &str, _access_token: &str) {
        info!(key = %key, "Access token propagated to host configuration");
    }
}

struct Inner {
    record: Option<CredentialRecord>,
    /// Bumped on every change to `record`
    generation: u64,
    /// Set when the last write or delete of the backing file failed
    dirty: bool,
}

/// Owner of the single credential record.
///
/// # Thread Safety
/// All reads and writes go through one mutex, held across merge and persist,
/// so a scheduler refresh and a callback exchange can never interleave.
pub struct CredentialStore {
    path: PathBuf,
    expiry_buffer: Duration,
    inner: Mutex<Inner>,
    observer: Option<Arc<dyn TokenObserver>>,
}

impl CredentialStore {
    /// Opens the store at `path` and loads any persisted record.
    ///
    /// `expiry_buffer` is subtracted from both expiry instants by the validity
    /// predicates. A missing or unreadable file yields an empty store.
    pub fn open<P: AsRef<Path>>(path: P, expiry_buffer: Duration) -> Self {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            expiry_buffer,
            inner: Mutex::new(Inner {
                record: None,
                generation: 0,
                dirty: false,
            }),
            observer: None,
        };
        store.load();
        store
    }

    /// Registers the config synchronization collaborator.
    pub fn with_observer(mut self, observer: Arc<dyn TokenObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expiry_buffer(&self) -> Duration {
        self.expiry_buffer
    }

    /// Reads the persisted record into memory.
    ///
    /// Read and parse failures are logged and treated as "never
    /// authenticated".
    pub fn load(&self) -> Option<CredentialRecord> {
        let record = match read_record(&self.path) {
            Ok(Some(record)) => {
                debug!(path = %self.path.display(), "Loaded stored credentials");
                Some(record)
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No stored credentials");
                None
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to load stored credentials, starting unauthenticated"
                );
                None
            }
        };

        let mut inner = self.lock();
        inner.record = record.clone();
        inner.generation += 1;
        inner.dirty = false;
        record
    }

    /// Applies a token update and persists the resulting record.
    ///
    /// Expiries are computed from `issued_at`: the access token from
    /// `expires_in`, the refresh token from the fixed 30-day window.
    ///
    /// A failed write does not fail the update; the record is kept in memory
    /// and the write is retried by [`retry_persist`](Self::retry_persist).
    ///
    /// # Errors
    /// `InvalidTokenResponse` when creating a record without a refresh token
    /// or with an unusable `expires_in`.
    pub fn update(
        &self,
        update: TokenUpdate,
        issued_at: DateTime<Utc>,
    ) -> Result<CredentialRecord> {
        let record = {
            let mut inner = self.lock();
            self.apply(&mut inner, update, issued_at)?
        };
        self.updated(&record);
        Ok(record)
    }

    /// Like [`update`](Self::update), but only if the record has not changed
    /// since `generation` was read.
    ///
    /// Returns `Ok(None)` and leaves the store untouched when the record was
    /// cleared, reloaded or replaced in the meantime.
    pub fn update_if(
        &self,
        generation: u64,
        update: TokenUpdate,
        issued_at: DateTime<Utc>,
    ) -> Result<Option<CredentialRecord>> {
        let record = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(
                    expected = generation,
                    current = inner.generation,
                    "Credentials changed since read, discarding update"
                );
                return Ok(None);
            }
            self.apply(&mut inner, update, issued_at)?
        };
        self.updated(&record);
        Ok(Some(record))
    }

    fn apply(
        &self,
        inner: &mut Inner,
        update: TokenUpdate,
        issued_at: DateTime<Utc>,
    ) -> Result<CredentialRecord> {
        let record = CredentialRecord::merged(inner.record.as_ref(), update, issued_at)?;

        inner.record = Some(record.clone());
        inner.generation += 1;
        match write_record(&self.path, &record) {
            Ok(()) => inner.dirty = false,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to persist credentials, will retry"
                );
                inner.dirty = true;
            }
        }
        Ok(record)
    }

    fn updated(&self, record: &CredentialRecord) {
        info!(
            access_expires_at = %record.access_expires_at,
            refresh_expires_at = %record.refresh_expires_at,
            "Credentials updated"
        );

        if let Some(observer) = &self.observer {
            observer.on_access_token(CONFIG_SYNC_KEY, &record.access_token);
        }
    }

    /// Deletes the record and its backing file.
    ///
    /// Returns whether a record was present. Calling it on an empty store is a
    /// no-op.
    pub fn clear(&self) -> bool {
        let mut inner = self.lock();
        let existed = inner.record.take().is_some();
        if existed {
            inner.generation += 1;
        }

        match remove_file(&self.path) {
            Ok(()) => inner.dirty = false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove credential file");
                inner.dirty = true;
            }
        }

        if existed {
            info!("Credentials cleared");
        }
        existed
    }

    /// Re-attempts a write or delete that failed earlier.
    ///
    /// Returns true when the file is in sync with memory afterwards.
    pub fn retry_persist(&self) -> bool {
        let mut inner = self.lock();
        if !inner.dirty {
            return true;
        }

        let result = match &inner.record {
            Some(record) => write_record(&self.path, record),
            None => remove_file(&self.path),
        };

        match result {
            Ok(()) => {
                info!(path = %self.path.display(), "Credential file synchronized");
                inner.dirty = false;
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Credential file still out of sync");
                false
            }
        }
    }

    /// Whether a write or delete is waiting to be retried.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Snapshot of the current record.
    pub fn current(&self) -> Option<CredentialRecord> {
        self.lock().record.clone()
    }

    /// Counter bumped by every update, clear and reload.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Current record together with its generation, for use with
    /// [`update_if`](Self::update_if).
    pub fn current_with_generation(&self) -> Option<(CredentialRecord, u64)> {
        let inner = self.lock();
        inner.record.clone().map(|record| (record, inner.generation))
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().record.as_ref().map(|r| r.access_token.clone())
    }

    /// True iff a record exists and `now` is more than the buffer away from
    /// the access token's expiry.
    pub fn is_access_valid(&self, now: DateTime<Utc>) -> bool {
        self.lock()
            .record
            .as_ref()
            .is_some_and(|r| now + self.expiry_buffer < r.access_expires_at)
    }

    /// True iff a record exists and `now` is more than the buffer away from
    /// the refresh token's expiry.
    pub fn is_refresh_valid(&self, now: DateTime<Utc>) -> bool {
        self.lock()
            .record
            .as_ref()
            .is_some_and(|r| now + self.expiry_buffer < r.refresh_expires_at)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_record(path: &Path) -> Result<Option<CredentialRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let record = serde_json::from_str(&contents)
        .map_err(|e| AuthError::PersistenceFailed(format!("corrupt credential file: {}", e)))?;
    Ok(Some(record))
}

fn write_record(path: &Path, record: &CredentialRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let serialized = serde_json::to_string_pretty(record)
        .map_err(|e| AuthError::PersistenceFailed(e.to_string()))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, serialized)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
