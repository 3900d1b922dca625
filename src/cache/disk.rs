use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheStore, StoreError};

/// Disk-backed cache store with a total size budget.
///
/// Every entry lives in a single file at `<root>/<xx>/<md5 of key>`, holding one
/// line of JSON metadata followed by the raw body. Files are written to a
/// temporary name and renamed into place, so a reader never observes a partial
/// entry. When the tracked total exceeds `max_bytes`, the least recently used
/// entries are removed until it fits again.
#[derive(Clone)]
pub struct DiskStore {
    inner: Arc<DiskInner>,
}

struct DiskInner {
    root: PathBuf,
    max_bytes: u64,
    index: Mutex<Index>,
    tmp_seq: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(default)]
    varied: BTreeMap<String, String>,
    stored_at: DateTime<Utc>,
}

struct Record {
    size: u64,
    tick: u64,
}

// Byte accounting plus recency order, keyed by file name
#[derive(Default)]
struct Index {
    records: HashMap<String, Record>,
    recency: BTreeMap<u64, String>,
    total: u64,
    tick: u64,
}

impl Index {
    fn insert(&mut self, name: String, size: u64) {
        self.remove(&name);
        self.tick += 1;
        self.recency.insert(self.tick, name.clone());
        self.records.insert(name, Record { size, tick: self.tick });
        self.total += size;
    }

    fn touch(&mut self, name: &str) {
        if let Some(record) = self.records.get_mut(name) {
            self.recency.remove(&record.tick);
            self.tick += 1;
            record.tick = self.tick;
            self.recency.insert(self.tick, name.to_string());
        }
    }

    fn remove(&mut self, name: &str) -> Option<u64> {
        let record = self.records.remove(name)?;
        self.recency.remove(&record.tick);
        self.total -= record.size;
        Some(record.size)
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, name) = self.recency.pop_first()?;
        if let Some(record) = self.records.remove(&name) {
            self.total -= record.size;
        }
        Some(name)
    }
}

impl DiskStore {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// Existing entries are indexed by scanning the directory, oldest
    /// modification time first, and leftover temporary files are deleted.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::Init(format!("cannot create {}: {}", root.display(), e)))?;

        let mut found = scan(&root)
            .map_err(|e| StoreError::Init(format!("cannot scan {}: {}", root.display(), e)))?;
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut index = Index::default();
        for (name, size, _) in found {
            index.insert(name, size);
        }

        let inner = DiskInner {
            root,
            max_bytes,
            index: Mutex::new(index),
            tmp_seq: AtomicU64::new(0),
        };

        {
            let mut index = inner.index.lock();
            let evicted = inner.evict(&mut index);
            info!(
                "Disk cache opened at {}: {} entries, {}/{} bytes ({} evicted)",
                inner.root.display(),
                index.records.len(),
                index.total,
                max_bytes,
                evicted
            );
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.index.lock().total
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.index.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.index.lock().records.contains_key(&file_name(key))
    }

    /// Path of the file backing `key`, whether or not it exists.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.inner.entry_path(&file_name(key))
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DiskInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

impl DiskInner {
    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(&name[..2]).join(name)
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let name = file_name(key);
        let path = self.entry_path(&name);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // A set may have renamed the file into place since the read
                let mut index = self.index.lock();
                if !path.exists() {
                    index.remove(&name);
                }
                return Ok(None);
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        match decode(data) {
            Ok(entry) if entry.key == key => {
                self.index.lock().touch(&name);
                Ok(Some(entry))
            }
            Ok(entry) => {
                debug!("Cache file {} holds {}, not {}", path.display(), entry.key, key);
                Ok(None)
            }
            Err(e) => {
                self.drop_corrupt(&name, &path);
                Err(e)
            }
        }
    }

    // Re-reads under the index lock so a file replaced by a concurrent set survives
    fn drop_corrupt(&self, name: &str, path: &Path) {
        let mut index = self.index.lock();
        let still_corrupt = match fs::read(path) {
            Ok(data) => decode(data).is_err(),
            Err(e) => e.kind() != ErrorKind::NotFound,
        };
        if !still_corrupt && path.exists() {
            return;
        }

        index.remove(name);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove corrupt cache file {}: {}", path.display(), e),
        }
    }

    fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        let data = encode(key, entry)?;
        let size = data.len() as u64;
        let name = file_name(key);
        let path = self.entry_path(&name);

        if size > self.max_bytes {
            debug!(
                "Not caching {}: {} bytes exceeds the {} byte budget",
                key, size, self.max_bytes
            );
            return self.delete(key);
        }

        let dir = path.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{}.tmp{}", name, seq));
        fs::write(&tmp, &data).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(&tmp, e)
        })?;

        let mut index = self.index.lock();
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, e));
        }
        index.insert(name, size);
        let evicted = self.evict(&mut index);
        if evicted > 0 {
            debug!("Evicted {} cache entries, {} bytes in use", evicted, index.total);
        }

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let name = file_name(key);
        let path = self.entry_path(&name);

        let mut index = self.index.lock();
        index.remove(&name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    // Caller holds the index lock, so no set can land between unlink and accounting
    fn evict(&self, index: &mut Index) -> usize {
        let mut evicted = 0;
        while index.total > self.max_bytes {
            let Some(name) = index.pop_oldest() else {
                break;
            };
            let path = self.entry_path(&name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to evict cache file {}: {}", path.display(), e),
            }
            evicted += 1;
        }
        evicted
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = key.to_string();
        self.run(move |inner| inner.get(&key)).await
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |inner| inner.set(&key, &entry)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |inner| inner.delete(&key)).await
    }
}

fn file_name(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

fn is_entry_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode(key: &str, entry: &CacheEntry) -> Result<Vec<u8>, StoreError> {
    let meta = EntryMeta {
        key: key.to_string(),
        status: entry.status,
        headers: entry.headers.clone(),
        varied: entry.varied.clone(),
        stored_at: entry.stored_at,
    };
    let mut data =
        serde_json::to_vec(&meta).map_err(|e| StoreError::Corrupt(format!("encode: {}", e)))?;
    data.push(b'\n');
    data.extend_from_slice(&entry.body);
    Ok(data)
}

fn decode(data: Vec<u8>) -> Result<CacheEntry, StoreError> {
    let split = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::Corrupt("missing metadata line".to_string()))?;
    let meta: EntryMeta = serde_json::from_slice(&data[..split])
        .map_err(|e| StoreError::Corrupt(format!("metadata: {}", e)))?;
    let body = Bytes::from(data).slice(split + 1..);

    Ok(CacheEntry {
        key: meta.key,
        status: meta.status,
        headers: meta.headers,
        varied: meta.varied,
        body,
        stored_at: meta.stored_at,
    })
}

// Collects (file name, size, mtime) for every entry file under root
fn scan(root: &Path) -> std::io::Result<Vec<(String, u64, SystemTime)>> {
    let mut found = Vec::new();
    for shard in fs::read_dir(root)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for file in fs::read_dir(shard.path())? {
            let file = file?;
            let name = file.file_name().to_string_lossy().into_owned();
            if name.contains(".tmp") {
                let _ = fs::remove_file(file.path());
                continue;
            }
            if !is_entry_name(&name) {
                continue;
            }
            let meta = file.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((name, meta.len(), modified));
        }
    }
    Ok(found)
}
