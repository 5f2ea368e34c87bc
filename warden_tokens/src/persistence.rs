//! Durable key/value storage for credentials

use std::{collections::BTreeMap, error, fmt};

/// The error type returned by a [`PersistentStore`]
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// A synchronous key/value store that outlives the process
///
/// Implementations only need to keep string values by key. Absence of a key
/// means absence of the corresponding credential.
pub trait PersistentStore: fmt::Debug + Send {
    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes any value stored under `key`
    ///
    /// Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

impl<S: PersistentStore + ?Sized> PersistentStore for Box<S> {
    #[inline]
    fn get(&self, key: &str) -> Option<String> {
        S::get(&**self, key)
    }

    #[inline]
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        S::set(&mut **self, key, value)
    }

    #[inline]
    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        S::remove(&mut **self, key)
    }
}

/// A store that keeps values in memory only
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    values: BTreeMap<String, String>,
}

impl InMemoryStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(feature = "file")]
pub use file::{FileStore, FileStoreError};

#[cfg(feature = "file")]
mod file {
    use std::{
        collections::BTreeMap,
        fs::{self, OpenOptions},
        io::{self, Write},
        path::{Path, PathBuf},
    };

    use thiserror::Error;

    use super::{PersistentStore, StoreError};

    /// An error reading or writing the credentials file
    #[derive(Debug, Error)]
    pub enum FileStoreError {
        /// The file could not be read or written
        #[error("error accessing credentials file")]
        Io(#[from] io::Error),
        /// The file contents were not a JSON object of strings
        #[error("error (de)serializing credentials file")]
        Json(#[from] serde_json::Error),
    }

    /// A store that keeps values as a JSON object in a local file
    ///
    /// The whole object is rewritten on every mutation. On unix the file is
    /// created readable and writable by its owner only.
    #[derive(Debug)]
    pub struct FileStore {
        path: PathBuf,
        values: BTreeMap<String, String>,
    }

    impl FileStore {
        /// Opens the store at `path`, loading any values already persisted there
        ///
        /// A missing file is treated as an empty store and is created on the
        /// first write.
        pub fn open(path: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
            let path = path.into();
            let values = match fs::read_to_string(&path) {
                Ok(data) if data.trim().is_empty() => BTreeMap::new(),
                Ok(data) => serde_json::from_str(&data)?,
                Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
                Err(err) => return Err(err.into()),
            };

            tracing::debug!(path = %path.display(), keys = values.len(), "opened credentials file");

            Ok(Self { path, values })
        }

        /// The location of the backing file
        pub fn path(&self) -> &Path {
            &self.path
        }

        fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), FileStoreError> {
            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                file_opts.mode(0o600);
            }

            let mut file = file_opts.open(&self.path)?;
            let data = serde_json::to_string_pretty(values)?;
            file.write_all(data.as_bytes())?;
            Ok(())
        }
    }

    impl PersistentStore for FileStore {
        fn get(&self, key: &str) -> Option<String> {
            self.values.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
            let mut next = self.values.clone();
            next.insert(key.to_owned(), value.to_owned());
            self.write_all(&next)?;
            self.values = next;
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), StoreError> {
            if !self.values.contains_key(key) {
                return Ok(());
            }

            let mut next = self.values.clone();
            next.remove(key);
            self.write_all(&next)?;
            self.values = next;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trip() {
        let mut store = InMemoryStore::new();
        assert_eq!(store.get("access_token"), None);

        store.set("access_token", "abc").unwrap();
        assert_eq!(store.get("access_token").as_deref(), Some("abc"));

        store.remove("access_token").unwrap();
        store.remove("access_token").unwrap();
        assert_eq!(store.get("access_token"), None);
    }

    #[cfg(feature = "file")]
    #[test]
    fn file_store_survives_reopen() -> color_eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("credentials.json");

        {
            let mut store = FileStore::open(&path)?;
            store.set("refresh_token", "r1").unwrap();
            store.set("id_token", "i1").unwrap();
            store.remove("id_token").unwrap();
        }

        let store = FileStore::open(&path)?;
        assert_eq!(store.get("refresh_token").as_deref(), Some("r1"));
        assert_eq!(store.get("id_token"), None);
        Ok(())
    }

    #[cfg(all(feature = "file", unix))]
    #[test]
    fn file_store_is_owner_only() -> color_eyre::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("credentials.json");
        let mut store = FileStore::open(&path)?;
        store.set("access_token", "a").unwrap();

        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[cfg(feature = "file")]
    #[test]
    fn corrupt_file_is_rejected() -> color_eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "[1, 2")?;

        assert!(matches!(
            FileStore::open(&path),
            Err(FileStoreError::Json(_))
        ));
        Ok(())
    }
}
