// A process-wide in-memory file store shared by all concurrent transfers.
//
// Files are opaque byte blobs keyed by name. Writes are create-once: a `put`
// on an existing name fails instead of overwriting, so a second WRQ can never
// silently clobber a finished upload. The store is volatile and lives for the
// process lifetime; one instance is built in main and handed to every
// conversation behind an Arc.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Mutex;

/// Represents a failure of a store operation.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    EmptyPath,
    FileNotFound(String),
    FileExists(String),
}

impl error::Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::EmptyPath => write!(f, "Must supply a file path"),
            StoreError::FileNotFound(path) => write!(f, "No such file '{path}'"),
            StoreError::FileExists(path) => write!(f, "File '{path}' already exists"),
        }
    }
}

/// A thread-safe in-memory file store with create-once write semantics.
#[derive(Debug)]
pub struct FileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileStore {
    pub fn new() -> FileStore {
        FileStore {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a copy of the blob stored under `path`.
    pub fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        if path.is_empty() {
            return Err(StoreError::EmptyPath);
        }
        let files = self.lock();
        match files.get(path) {
            Some(blob) => Ok(blob.clone()),
            None => Err(StoreError::FileNotFound(path.to_string())),
        }
    }

    /// Stores `blob` under `path`. Fails if `path` is already taken.
    pub fn put(&self, path: &str, blob: Vec<u8>) -> Result<(), StoreError> {
        if path.is_empty() {
            return Err(StoreError::EmptyPath);
        }
        let mut files = self.lock();
        if files.contains_key(path) {
            return Err(StoreError::FileExists(path.to_string()));
        }
        files.insert(path.to_string(), blob);
        Ok(())
    }

    // The lock is held only for the duration of a single get/put, never
    // across a network wait. A poisoned lock still guards a map that is
    // structurally intact, so recover the guard instead of panicking.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}
