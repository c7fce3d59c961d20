//! Hash-indexed, persisted store of blocked items.
//!
//! The hash index and the display ordering live behind one lock, so an item
//! is either visible through both [`BlocklistStore::lookup`] and
//! [`BlocklistStore::get`] or through neither.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::item::{BlockItem, Connection, ItemKey};

/// Error type for blocklist store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item not in blocklist: {0}")]
    NotFound(ItemKey),

    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize blocklist record")]
    Serialize(#[from] serde_json::Error),
}

/// Column to order the display list by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Process name.
    Name,
    /// Domain when known, else address.
    Destination,
    /// Literal address.
    Address,
}

#[derive(Default)]
struct Inner {
    items: HashMap<ItemKey, BlockItem>,
    order: Vec<ItemKey>,
}

impl Inner {
    fn insert(&mut self, item: BlockItem) -> bool {
        let key = item.key();
        if self.items.contains_key(&key) {
            return false;
        }
        self.items.insert(key, item);
        self.order.push(key);
        true
    }
}

/// The authoritative set of blocked application/destination pairs.
///
/// Readers (the enforcement path, the UI) and writers share one
/// `RwLock`; persistence is additionally serialized so saves and loads never
/// interleave on disk.
pub struct BlocklistStore {
    inner: RwLock<Inner>,
    path: PathBuf,
    persist: Mutex<()>,
}

impl BlocklistStore {
    /// Create an empty store persisted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: path.into(),
            persist: Mutex::new(()),
        }
    }

    /// Create a store persisted at `path` and fill it from disk.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convert an observed connection into the item that would block it.
    pub fn from_connection(conn: &Connection) -> BlockItem {
        BlockItem::from(conn)
    }

    /// Insert `item` unless an item with the same key is present.
    ///
    /// Returns `true` if the item was new.
    pub fn add(&self, item: BlockItem) -> bool {
        let added = self.inner.write().insert(item);
        debug!(added, "blocklist add");
        added
    }

    /// Whether `item` (by key) is blocked.
    #[inline]
    pub fn lookup(&self, item: &BlockItem) -> bool {
        self.contains_key(&item.key())
    }

    #[inline]
    pub fn contains_key(&self, key: &ItemKey) -> bool {
        self.inner.read().items.contains_key(key)
    }

    /// Remove `item` (by key).
    pub fn delete(&self, item: &BlockItem) -> Result<(), StoreError> {
        let key = item.key();
        let mut inner = self.inner.write();
        if inner.items.remove(&key).is_none() {
            return Err(StoreError::NotFound(key));
        }
        inner.order.retain(|k| *k != key);
        Ok(())
    }

    /// Reorder the display list. Items and the hash index are untouched.
    pub fn sort(&self, key: SortKey, ascending: bool) {
        let mut guard = self.inner.write();
        let Inner { items, order } = &mut *guard;
        order.sort_by(|a, b| {
            let (a, b) = (&items[a], &items[b]);
            let ordering = match key {
                SortKey::Name => a.name.cmp(&b.name),
                SortKey::Destination => a.addr_name().cmp(b.addr_name()),
                SortKey::Address => a.addr.cmp(&b.addr),
            };
            if ascending { ordering } else { ordering.reverse() }
        });
    }

    /// Item at `row` of the display list.
    pub fn get(&self, row: usize) -> Option<BlockItem> {
        let inner = self.inner.read();
        inner
            .order
            .get(row)
            .and_then(|key| inner.items.get(key))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all items in display order.
    pub fn items(&self) -> Vec<BlockItem> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|key| inner.items.get(key))
            .cloned()
            .collect()
    }

    /// Write every item, in display order, replacing the file on disk.
    ///
    /// Records are JSON objects, one per line. The file is written beside
    /// the target and renamed over it.
    pub fn save(&self) -> Result<(), StoreError> {
        let _persist = self.persist.lock();
        let items = self.items();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let tmp_path = self.temp_path();
        let file = File::create(&tmp_path).map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        for item in &items {
            serde_json::to_writer(&mut writer, item)?;
            writer.write_all(b"\n").map_err(|source| self.io_error(source))?;
        }
        let file = writer
            .into_inner()
            .map_err(|err| self.io_error(err.into_error()))?;
        file.sync_all().map_err(|source| self.io_error(source))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|source| self.io_error(source))?;
        info!(count = items.len(), path = ?self.path, "saved blocklist");
        Ok(())
    }

    /// Replace the in-memory items with those on disk.
    ///
    /// A missing file loads as empty. Malformed records are skipped.
    /// Returns the number of items loaded.
    pub fn load(&self) -> Result<usize, StoreError> {
        let _persist = self.persist.lock();

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = ?self.path, "no saved blocklist, starting empty");
                *self.inner.write() = Inner::default();
                return Ok(0);
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let mut loaded = Inner::default();
        let mut skipped = 0usize;
        // Lines are parsed as bytes so that invalid UTF-8 is just another bad record.
        for (number, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<BlockItem>(&line) {
                Ok(item) if item.is_valid() => {
                    loaded.insert(item);
                }
                Ok(_) => {
                    warn!(line = number + 1, "skipping incomplete blocklist record");
                    skipped += 1;
                }
                Err(err) => {
                    warn!(line = number + 1, "skipping malformed blocklist record: {err}");
                    skipped += 1;
                }
            }
        }

        let count = loaded.order.len();
        *self.inner.write() = loaded;
        info!(count, skipped, path = ?self.path, "loaded blocklist");
        Ok(count)
    }

    /// `<path>.tmp`, beside the target and never equal to it.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
