//! Backing storage for site tensors and mutable MPS data.
//!
//! Sweeps keep only a small window of tensors in memory; everything else lives
//! in a [`TensorStore`], addressed by string keys of the form
//! `"{tag}.{site}"` (tensors), `"{tag}.{site}.{root}"` (multi-state
//! wavefunctions) and `"{tag}.info"` (mutable data). Two stores are
//! provided: [`MemoryStore`], shared between all processes of a single-node
//! run, and [`DiskStore`], a directory of files that also serves as the
//! restart mirror.
//!
//! Tensors are encoded with `bincode`; mutable data and resume cursors with
//! `serde_json`. The encoding is not a compatibility contract.

use std::{
    fs,
    io,
    path::{ Path, PathBuf },
    sync::Mutex,
};
use rustc_hash::{ FxHashMap as HashMap };
use serde::{ de::DeserializeOwned, Serialize };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Returned when reading a key that was never written.
    #[error("error in TensorStore::read: missing key '{0}'")]
    MissingKey(String),

    /// Returned when a file-backed store fails to read or write.
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    /// Returned when binary encoding or decoding fails.
    #[error("store encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Returned when JSON encoding or decoding fails.
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Returned when another thread panicked while holding the store.
    #[error("store lock poisoned")]
    Poisoned,
}
use StoreError::*;
pub type StoreResult<T> = Result<T, StoreError>;

/// A key-value store of encoded tensor data.
pub trait TensorStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous value.
    fn write(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()>;

    /// Read the value under `key`.
    fn read(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Return `true` if `key` holds a value.
    fn contains(&self, key: &str) -> bool;

    /// Remove the value under `key`, if any.
    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Return all keys currently held.
    fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Encode `value` with `bincode` and write it under `key`.
pub fn save_bin<T>(store: &dyn TensorStore, key: &str, value: &T)
    -> StoreResult<()>
where T: Serialize
{
    store.write(key, bincode::serialize(value)?)
}

/// Read and decode a `bincode` value.
pub fn load_bin<T>(store: &dyn TensorStore, key: &str) -> StoreResult<T>
where T: DeserializeOwned
{
    Ok(bincode::deserialize(&store.read(key)?)?)
}

/// Encode `value` as JSON and write it under `key`.
pub fn save_json<T>(store: &dyn TensorStore, key: &str, value: &T)
    -> StoreResult<()>
where T: Serialize
{
    store.write(key, serde_json::to_vec_pretty(value)?)
}

/// Read and decode a JSON value.
pub fn load_json<T>(store: &dyn TensorStore, key: &str) -> StoreResult<T>
where T: DeserializeOwned
{
    Ok(serde_json::from_slice(&store.read(key)?)?)
}

/// Copy every value whose key starts with `prefix` from `src` to `dest`,
/// returning the number of values copied.
pub fn mirror(src: &dyn TensorStore, prefix: &str, dest: &dyn TensorStore)
    -> StoreResult<usize>
{
    let mut count: usize = 0;
    for key in src.keys()?.into_iter().filter(|k| k.starts_with(prefix)) {
        dest.write(&key, src.read(&key)?)?;
        count += 1;
    }
    Ok(count)
}

/// An in-memory store.
///
/// The store is internally locked and can be shared between threads behind an
/// [`Arc`][std::sync::Arc].
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl TensorStore for MemoryStore {
    fn write(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        self.data.lock().map_err(|_| Poisoned)?.insert(key.to_string(), bytes);
        Ok(())
    }

    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.data.lock().map_err(|_| Poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| MissingKey(key.to_string()))
    }

    fn contains(&self, key: &str) -> bool {
        self.data.lock().map(|data| data.contains_key(key)).unwrap_or(false)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.data.lock().map_err(|_| Poisoned)?.remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> =
            self.data.lock().map_err(|_| Poisoned)?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// A store backed by one file per key in a directory.
#[derive(Clone, Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create, if needed) a store rooted at `root`.
    pub fn new<P>(root: P) -> StoreResult<Self>
    where P: AsRef<Path>
    {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self { root: root.as_ref().to_path_buf() })
    }

    /// Return the root directory.
    pub fn root(&self) -> &Path { &self.root }

    fn path(&self, key: &str) -> PathBuf { self.root.join(format!("{key}.dat")) }
}

impl TensorStore for DiskStore {
    fn write(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        // write-then-rename so that readers never see a partial file
        let tmp = self.root.join(format!("{key}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound =>
                Err(MissingKey(key.to_string())),
            Err(err) => Err(Io(err)),
        }
    }

    fn contains(&self, key: &str) -> bool { self.path(key).is_file() }

    fn remove(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Io(err)),
        }
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(key) = name.strip_suffix(".dat") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip() {
        let store = MemoryStore::new();
        save_bin(&store, "a.0", &vec![1.0_f64, 2.0]).unwrap();
        let back: Vec<f64> = load_bin(&store, "a.0").unwrap();
        assert_eq!(back, vec![1.0, 2.0]);
        assert!(matches!(store.read("a.1"), Err(MissingKey(_))));
        store.remove("a.0").unwrap();
        assert!(!store.contains("a.0"));
    }

    #[test]
    fn disk_round_trip_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStore::new(dir.path().join("restart")).unwrap();
        let mem = MemoryStore::new();
        save_json(&mem, "psi.info", &(3_usize, "LCR")).unwrap();
        save_bin(&mem, "psi.0", &vec![0.5_f64]).unwrap();
        save_bin(&mem, "other.0", &vec![0.0_f64]).unwrap();
        assert_eq!(mirror(&mem, "psi.", &disk).unwrap(), 2);
        assert_eq!(disk.keys().unwrap(), vec!["psi.0".to_string(), "psi.info".to_string()]);
        let info: (usize, String) = load_json(&disk, "psi.info").unwrap();
        assert_eq!(info, (3, "LCR".to_string()));
        assert!(matches!(disk.read("psi.7"), Err(MissingKey(_))));
    }
}
