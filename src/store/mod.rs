//! Embedded log-structured key-value store.
//!
//! Writes are appended to the active segment file; an in-memory index maps
//! each live key to the newest record holding it. Overwrites and deletes leave
//! stale bytes behind in older segments, which [`Store::run_gc`] reclaims by
//! copying the still-live records forward and deleting the old file.
//!
//! The API is synchronous and performs blocking disk I/O. Async callers go
//! through `tokio::task::spawn_blocking` (see [`crate::cache::EmbeddedCache`]).
//!
//! ```text
//! <dir>/
//!   LOCK           exclusive advisory lock held while open
//!   000001.vlog    sealed segment
//!   000002.vlog    active segment (appends go here)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lock;

mod segment;

use segment::RecordKind;

/// Default size at which the active segment is sealed and a new one started.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Largest accepted key.
pub const MAX_KEY_LEN: usize = 65_000;

const LOCK_FILE: &str = "LOCK";

// Records copied per write-lock acquisition during GC.
const GC_BATCH: usize = 64;

/// Errors produced by [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt record in segment {segment} at offset {offset}")]
    Corrupt { segment: u32, offset: u64 },

    #[error("store directory {0} is locked by another process")]
    Locked(PathBuf),

    #[error("store is closed")]
    Closed,

    #[error("discard ratio must be between 0 and 1 (exclusive), got {0}")]
    InvalidDiscardRatio(f64),

    #[error("a garbage collection pass is already running")]
    GcInProgress,

    #[error("key of {len} bytes exceeds the {max}-byte limit")]
    KeyTooLarge { len: usize, max: usize },

    #[error("value of {0} bytes is too large")]
    ValueTooLarge(usize),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Options for [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dir: PathBuf,
    pub segment_size: u64,
    /// `fsync` after every write.
    pub sync_writes: bool,
}

impl StoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_writes: false,
        }
    }

    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes.max(1);
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// Result of one [`Store::run_gc`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// A segment was rewritten and deleted.
    Rewritten {
        segment: u32,
        moved: usize,
        reclaimed_bytes: u64,
    },
    /// No sealed segment met the discard ratio.
    NoRewrite,
}

/// Size and occupancy figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub keys: usize,
    pub segments: usize,
    pub total_bytes: u64,
    pub stale_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pointer {
    segment: u32,
    offset: u64,
    len: u32,
}

#[derive(Debug)]
struct SegmentMeta {
    total: u64,
    stale: u64,
    reader: Mutex<File>,
}

impl SegmentMeta {
    fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.stale as f64 / self.total as f64
        }
    }
}

#[derive(Debug)]
struct Active {
    id: u32,
    file: File,
    size: u64,
}

#[derive(Debug)]
struct State {
    index: HashMap<Vec<u8>, Pointer>,
    segments: BTreeMap<u32, SegmentMeta>,
    active: Active,
    lock_file: Option<File>,
}

#[derive(Debug)]
struct Inner {
    options: StoreOptions,
    state: RwLock<State>,
    closed: AtomicBool,
    gc_running: AtomicBool,
}

/// Handle to an open store. Clones share the same underlying files.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Opens the store in `options.dir`, creating the directory if needed.
    ///
    /// Every segment is replayed to rebuild the index. A partially written
    /// record at the end of the newest segment is cut off; damage anywhere
    /// else is reported as [`StoreError::Corrupt`].
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let dir = options.dir.clone();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let lock_file = acquire_dir_lock(&dir)?;
        let ids = segment::list_segments(&dir).map_err(io_error(&dir))?;

        let mut index = HashMap::new();
        let mut segments = BTreeMap::new();
        let newest = ids.last().copied();

        for &id in &ids {
            let path = segment::segment_path(&dir, id);
            let (total, stale) = replay_segment(&path, id, Some(id) == newest, &mut index, &mut segments)?;
            let reader = File::open(&path).map_err(io_error(&path))?;
            segments.insert(
                id,
                SegmentMeta {
                    total,
                    stale,
                    reader: Mutex::new(reader),
                },
            );
        }

        let active = match newest {
            Some(id) => {
                let path = segment::segment_path(&dir, id);
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(io_error(&path))?;
                let size = file.metadata().map_err(io_error(&path))?.len();
                Active { id, file, size }
            }
            None => create_segment(&dir, 1, &mut segments)?,
        };

        info!(
            dir = %dir.display(),
            keys = index.len(),
            segments = segments.len(),
            "opened embedded store"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                state: RwLock::new(State {
                    index,
                    segments,
                    active,
                    lock_file: Some(lock_file),
                }),
                closed: AtomicBool::new(false),
                gc_running: AtomicBool::new(false),
            }),
        })
    }

    /// Directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.inner.options.dir
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let state = lock::read(&self.inner.state, "store.get");
        let Some(ptr) = state.index.get(key).copied() else {
            return Ok(None);
        };

        let buf = read_record(&self.inner.options.dir, &state, ptr)?;
        match segment::decode(&buf) {
            Ok((record, _)) if record.kind == RecordKind::Value && record.key == key => {
                Ok(Some(record.value.to_vec()))
            }
            _ => Err(StoreError::Corrupt {
                segment: ptr.segment,
                offset: ptr.offset,
            }),
        }
    }

    /// Returns `true` if `key` has a live value.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(lock::read(&self.inner.state, "store.contains").index.contains_key(key))
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        if u32::try_from(value.len()).is_err() {
            return Err(StoreError::ValueTooLarge(value.len()));
        }
        self.ensure_open()?;

        let mut buf = Vec::with_capacity(segment::HEADER_LEN + key.len() + value.len());
        segment::encode(RecordKind::Value, key, value, &mut buf);

        let mut state = lock::write(&self.inner.state, "store.put");
        let ptr = self.append(&mut state, &buf)?;
        let previous = state.index.insert(key.to_vec(), ptr);
        if let Some(old) = previous {
            mark_stale(&mut state, old.segment, u64::from(old.len));
        }
        Ok(())
    }

    /// Removes `key`. Removing an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.ensure_open()?;

        let mut state = lock::write(&self.inner.state, "store.delete");
        if !state.index.contains_key(key) {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(segment::HEADER_LEN + key.len());
        let len = segment::encode(RecordKind::Tombstone, key, &[], &mut buf) as u64;
        let ptr = self.append(&mut state, &buf)?;
        mark_stale(&mut state, ptr.segment, len);

        if let Some(old) = state.index.remove(key) {
            mark_stale(&mut state, old.segment, u64::from(old.len));
        }
        Ok(())
    }

    /// Returns every live key starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let state = lock::read(&self.inner.state, "store.keys_with_prefix");
        Ok(state
            .index
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Deletes every key and every segment file.
    pub fn drop_all(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let dir = &self.inner.options.dir;
        let mut state = lock::write(&self.inner.state, "store.drop_all");

        let next_id = state.active.id + 1;
        let ids: Vec<u32> = state.segments.keys().copied().collect();
        state.segments.clear();
        state.index.clear();

        // The new active segment must exist before the old ones go, so a crash
        // in between never leaves a directory with stale records but no writer.
        state.active = create_segment(dir, next_id, &mut state.segments)?;
        for id in ids {
            let path = segment::segment_path(dir, id);
            fs::remove_file(&path).map_err(io_error(&path))?;
        }
        debug!(dir = %dir.display(), "dropped all keys");
        Ok(())
    }

    /// Current size and occupancy figures.
    pub fn stats(&self) -> StoreStats {
        let state = lock::read(&self.inner.state, "store.stats");
        StoreStats {
            keys: state.index.len(),
            segments: state.segments.len(),
            total_bytes: state.segments.values().map(|m| m.total).sum(),
            stale_bytes: state.segments.values().map(|m| m.stale).sum(),
        }
    }

    /// Rewrites the sealed segment with the most stale data, provided its
    /// stale fraction is at least `discard_ratio`.
    ///
    /// The segment file is read without holding any lock, and live records
    /// are copied forward in small batches, so readers and writers are only
    /// ever held up for one batch.
    pub fn run_gc(&self, discard_ratio: f64) -> Result<GcOutcome, StoreError> {
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            return Err(StoreError::InvalidDiscardRatio(discard_ratio));
        }
        self.ensure_open()?;
        let _guard = GcGuard::acquire(&self.inner.gc_running)?;

        let candidate = {
            let state = lock::read(&self.inner.state, "store.gc.pick");
            let active = state.active.id;
            state
                .segments
                .iter()
                .filter(|(id, meta)| **id != active && meta.ratio() >= discard_ratio)
                .max_by(|a, b| a.1.ratio().total_cmp(&b.1.ratio()))
                .map(|(id, meta)| (*id, meta.total))
        };
        let Some((victim, victim_bytes)) = candidate else {
            return Ok(GcOutcome::NoRewrite);
        };

        let dir = &self.inner.options.dir;
        let path = segment::segment_path(dir, victim);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.has_segment(victim) => {
                return Ok(GcOutcome::NoRewrite);
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        let mut records = Vec::new();
        segment::scan(&data, |offset, record, len| records.push((offset, record, len))).map_err(
            |stop| StoreError::Corrupt {
                segment: victim,
                offset: stop.offset,
            },
        )?;

        let mut moved = 0usize;
        let mut rewritten = 0u64;
        let mut buf = Vec::new();

        for batch in records.chunks(GC_BATCH) {
            self.ensure_open()?;
            let mut state = lock::write(&self.inner.state, "store.gc.batch");
            if !state.segments.contains_key(&victim) {
                // drop_all ran underneath us.
                return Ok(GcOutcome::NoRewrite);
            }

            for (offset, record, len) in batch {
                let here = Pointer {
                    segment: victim,
                    offset: *offset,
                    len: *len,
                };
                let keep = match record.kind {
                    RecordKind::Value => state.index.get(record.key) == Some(&here),
                    // A tombstone still shadows older segments unless the key
                    // has been written again since.
                    RecordKind::Tombstone => {
                        !state.index.contains_key(record.key)
                            && state.segments.range(..victim).next().is_some()
                    }
                };
                if !keep {
                    continue;
                }

                buf.clear();
                segment::encode(record.kind, record.key, record.value, &mut buf);
                let ptr = self.append(&mut state, &buf)?;
                match record.kind {
                    RecordKind::Value => {
                        state.index.insert(record.key.to_vec(), ptr);
                    }
                    RecordKind::Tombstone => mark_stale(&mut state, ptr.segment, u64::from(ptr.len)),
                }
                moved += 1;
                rewritten += u64::from(*len);
            }
        }

        let mut state = lock::write(&self.inner.state, "store.gc.finish");
        if state.segments.remove(&victim).is_none() {
            return Ok(GcOutcome::NoRewrite);
        }
        state.active.file.sync_data().map_err(io_error(dir))?;
        fs::remove_file(&path).map_err(io_error(&path))?;
        drop(state);

        let reclaimed_bytes = victim_bytes.saturating_sub(rewritten);
        info!(segment = victim, moved, reclaimed_bytes, "rewrote store segment");
        Ok(GcOutcome::Rewritten {
            segment: victim,
            moved,
            reclaimed_bytes,
        })
    }

    /// Flushes the active segment and releases the directory lock.
    ///
    /// Subsequent operations fail with [`StoreError::Closed`]; closing again
    /// is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = lock::write(&self.inner.state, "store.close");
        let dir = &self.inner.options.dir;
        let synced = state.active.file.sync_all().map_err(io_error(dir));
        // Dropping the handle releases the advisory lock.
        state.lock_file.take();
        info!(dir = %dir.display(), "closed embedded store");
        synced
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn has_segment(&self, id: u32) -> bool {
        lock::read(&self.inner.state, "store.has_segment")
            .segments
            .contains_key(&id)
    }

    // Appends an encoded record to the active segment, sealing it first when
    // the record would not fit.
    fn append(&self, state: &mut State, record: &[u8]) -> Result<Pointer, StoreError> {
        let dir = &self.inner.options.dir;
        let len = record.len() as u64;

        if state.active.size > 0 && state.active.size + len > self.inner.options.segment_size {
            state.active.file.sync_data().map_err(io_error(dir))?;
            let next = state.active.id + 1;
            state.active = create_segment(dir, next, &mut state.segments)?;
            debug!(segment = next, "sealed segment and started a new one");
        }

        let path = segment::segment_path(dir, state.active.id);
        state.active.file.write_all(record).map_err(io_error(&path))?;
        if self.inner.options.sync_writes {
            state.active.file.sync_data().map_err(io_error(&path))?;
        }

        let ptr = Pointer {
            segment: state.active.id,
            offset: state.active.size,
            len: record.len() as u32,
        };
        state.active.size += len;
        if let Some(meta) = state.segments.get_mut(&ptr.segment) {
            meta.total += len;
        }
        Ok(ptr)
    }
}

struct GcGuard<'a>(&'a AtomicBool);

impl<'a> GcGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, StoreError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(StoreError::GcInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for GcGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn check_key(key: &[u8]) -> Result<(), StoreError> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLarge {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

fn mark_stale(state: &mut State, segment: u32, bytes: u64) {
    if let Some(meta) = state.segments.get_mut(&segment) {
        meta.stale = (meta.stale + bytes).min(meta.total);
    }
}

fn acquire_dir_lock(dir: &Path) -> Result<File, StoreError> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(io_error(&path))?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(StoreError::Locked(dir.to_path_buf())),
        Err(e) => Err(io_error(&path)(e)),
    }
}

fn create_segment(
    dir: &Path,
    id: u32,
    segments: &mut BTreeMap<u32, SegmentMeta>,
) -> Result<Active, StoreError> {
    let path = segment::segment_path(dir, id);
    let file = OpenOptions::new()
        .append(true)
        .create_new(true)
        .open(&path)
        .map_err(io_error(&path))?;
    let reader = File::open(&path).map_err(io_error(&path))?;
    segments.insert(
        id,
        SegmentMeta {
            total: 0,
            stale: 0,
            reader: Mutex::new(reader),
        },
    );
    Ok(Active { id, file, size: 0 })
}

fn read_record(dir: &Path, state: &State, ptr: Pointer) -> Result<Vec<u8>, StoreError> {
    let corrupt = || StoreError::Corrupt {
        segment: ptr.segment,
        offset: ptr.offset,
    };
    let meta = state.segments.get(&ptr.segment).ok_or_else(corrupt)?;
    let path = segment::segment_path(dir, ptr.segment);

    let mut file = lock::lock(&meta.reader, "store.read_record");
    file.seek(SeekFrom::Start(ptr.offset)).map_err(io_error(&path))?;
    let mut buf = vec![0; ptr.len as usize];
    file.read_exact(&mut buf).map_err(io_error(&path))?;
    Ok(buf)
}

// Replays one segment into the index and returns its (total, stale) byte counts.
fn replay_segment(
    path: &Path,
    id: u32,
    newest: bool,
    index: &mut HashMap<Vec<u8>, Pointer>,
    segments: &mut BTreeMap<u32, SegmentMeta>,
) -> Result<(u64, u64), StoreError> {
    let data = fs::read(path).map_err(io_error(path))?;
    let mut total = 0u64;
    let mut stale = 0u64;
    let mut stale_elsewhere = Vec::new();

    let scanned = segment::scan(&data, |offset, record, len| {
        total += u64::from(len);
        let previous = match record.kind {
            RecordKind::Value => index.insert(
                record.key.to_vec(),
                Pointer {
                    segment: id,
                    offset,
                    len,
                },
            ),
            RecordKind::Tombstone => {
                stale += u64::from(len);
                index.remove(record.key)
            }
        };
        if let Some(old) = previous {
            if old.segment == id {
                stale += u64::from(old.len);
            } else {
                stale_elsewhere.push(old);
            }
        }
    });

    if let Err(stop) = scanned {
        if !(newest && stop.at_tail) {
            return Err(StoreError::Corrupt {
                segment: id,
                offset: stop.offset,
            });
        }
        warn!(
            segment = id,
            offset = stop.offset,
            dropped_bytes = data.len() as u64 - stop.offset,
            "truncating torn record at end of segment"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(io_error(path))?;
        file.set_len(stop.offset).map_err(io_error(path))?;
        file.sync_all().map_err(io_error(path))?;
    }

    for old in stale_elsewhere {
        if let Some(meta) = segments.get_mut(&old.segment) {
            meta.stale = (meta.stale + u64::from(old.len)).min(meta.total);
        }
    }
    Ok((total, stale.min(total)))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn open(dir: &Path) -> Store {
        Store::open(StoreOptions::new(dir)).unwrap()
    }

    fn small_segments(dir: &Path) -> Store {
        Store::open(StoreOptions::new(dir).segment_size(256)).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.put(b"user:1", b"Alice").unwrap();
        assert_eq!(store.get(b"user:1").unwrap(), Some(b"Alice".to_vec()));
        assert!(store.contains(b"user:1").unwrap());

        store.put(b"user:1", b"Bob").unwrap();
        assert_eq!(store.get(b"user:1").unwrap(), Some(b"Bob".to_vec()));

        store.delete(b"user:1").unwrap();
        assert_eq!(store.get(b"user:1").unwrap(), None);
        // Deleting again is fine.
        store.delete(b"user:1").unwrap();
    }

    #[test]
    fn reopen_replays_puts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = small_segments(dir.path());
            for i in 0..50u32 {
                store.put(format!("k{i}").as_bytes(), &i.to_le_bytes()).unwrap();
            }
            store.put(b"k7", b"seven").unwrap();
            store.delete(b"k3").unwrap();
            assert!(store.stats().segments > 1);
            store.close().unwrap();
        }

        let store = small_segments(dir.path());
        assert_eq!(store.stats().keys, 49);
        assert_eq!(store.get(b"k7").unwrap(), Some(b"seven".to_vec()));
        assert_eq!(store.get(b"k3").unwrap(), None);
        assert_eq!(store.get(b"k42").unwrap(), Some(42u32.to_le_bytes().to_vec()));
    }

    #[test]
    fn second_open_of_same_directory_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let err = Store::open(StoreOptions::new(dir.path())).unwrap_err();
        assert!(matches!(err, StoreError::Locked(_)));

        store.close().unwrap();
        let reopened = open(dir.path());
        assert!(!reopened.is_closed());
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
            store.close().unwrap();
        }
        let path = segment::segment_path(dir.path(), 1);
        let full = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        // Half a record header.
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 5]).unwrap();
        drop(file);

        let store = open(dir.path());
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(fs::metadata(&path).unwrap().len(), full);

        store.put(b"c", b"3").unwrap();
        assert_eq!(store.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn corruption_in_sealed_segment_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = small_segments(dir.path());
            for i in 0..40u32 {
                store.put(format!("key-{i}").as_bytes(), b"some value bytes").unwrap();
            }
            store.close().unwrap();
        }
        let path = segment::segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        bytes[segment::HEADER_LEN] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = Store::open(StoreOptions::new(dir.path()).segment_size(256)).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { segment: 1, offset: 0 }));
    }

    #[test]
    fn keys_with_prefix_and_drop_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_segments(dir.path());
        store.put(b"app:a", b"1").unwrap();
        store.put(b"app:b", b"2").unwrap();
        store.put(b"other:c", b"3").unwrap();

        let mut keys = store.keys_with_prefix(b"app:").unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"app:a".to_vec(), b"app:b".to_vec()]);

        store.drop_all().unwrap();
        assert_eq!(store.stats().keys, 0);
        assert_eq!(store.stats().segments, 1);
        assert_eq!(store.get(b"other:c").unwrap(), None);
        assert_eq!(segment::list_segments(dir.path()).unwrap().len(), 1);

        store.put(b"fresh", b"x").unwrap();
        store.close().unwrap();
        let store = small_segments(dir.path());
        assert_eq!(store.stats().keys, 1);
    }

    #[test]
    fn gc_rewrites_the_stalest_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_segments(dir.path());

        for i in 0..30u32 {
            store.put(format!("k{i}").as_bytes(), b"first").unwrap();
        }
        for i in 0..30u32 {
            if i % 10 != 0 {
                store.put(format!("k{i}").as_bytes(), b"second").unwrap();
            }
        }
        let before = store.stats();
        assert!(before.stale_bytes > 0);

        let outcome = store.run_gc(0.5).unwrap();
        let GcOutcome::Rewritten { segment, reclaimed_bytes, .. } = outcome else {
            panic!("expected a rewrite, got {outcome:?}");
        };
        assert!(reclaimed_bytes > 0);
        assert!(!segment::segment_path(dir.path(), segment).exists());

        for i in 0..30u32 {
            let expected: &[u8] = if i % 10 == 0 { b"first" } else { b"second" };
            assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap().as_deref(), Some(expected));
        }

        store.close().unwrap();
        let store = small_segments(dir.path());
        assert_eq!(store.stats().keys, 30);
        assert_eq!(store.get(b"k20").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn gc_keeps_tombstones_that_shadow_older_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_segments(dir.path());

        // Segment 1 holds the value; later segments hold the tombstone.
        store.put(b"doomed", b"value").unwrap();
        for i in 0..20u32 {
            store.put(format!("pad{i}").as_bytes(), b"padding-padding").unwrap();
        }
        store.delete(b"doomed").unwrap();
        for i in 0..20u32 {
            store.put(format!("pad{i}").as_bytes(), b"rewritten-value").unwrap();
        }

        while let GcOutcome::Rewritten { .. } = store.run_gc(0.5).unwrap() {}
        store.close().unwrap();

        let store = small_segments(dir.path());
        assert_eq!(store.get(b"doomed").unwrap(), None);
        assert_eq!(store.get(b"pad3").unwrap(), Some(b"rewritten-value".to_vec()));
    }

    #[test]
    fn gc_with_nothing_stale_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_segments(dir.path());
        for i in 0..30u32 {
            store.put(format!("k{i}").as_bytes(), b"only").unwrap();
        }
        assert_eq!(store.run_gc(0.5).unwrap(), GcOutcome::NoRewrite);
    }

    #[test]
    fn gc_rejects_out_of_range_ratios() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        for ratio in [0.0, 1.0, -0.1, 1.5, f64::NAN] {
            assert!(matches!(store.run_gc(ratio), Err(StoreError::InvalidDiscardRatio(_))));
        }
    }

    #[test]
    fn concurrent_gc_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let _running = GcGuard::acquire(&store.inner.gc_running).unwrap();

        assert!(matches!(store.run_gc(0.5), Err(StoreError::GcInProgress)));
    }

    #[test]
    fn reads_and_writes_proceed_during_gc() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_segments(dir.path());
        for i in 0..200u32 {
            store.put(format!("k{}", i % 20).as_bytes(), &i.to_le_bytes()).unwrap();
        }

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    store.put(b"live", &i.to_le_bytes()).unwrap();
                    assert!(store.get(b"k5").unwrap().is_some());
                }
            })
        };
        while let GcOutcome::Rewritten { .. } = store.run_gc(0.5).unwrap() {}
        writer.join().unwrap();

        assert_eq!(store.get(b"live").unwrap(), Some(199u32.to_le_bytes().to_vec()));
        assert_eq!(store.stats().keys, 21);
    }

    #[test]
    fn operations_after_close_fail_and_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(store.get(b"x"), Err(StoreError::Closed)));
        assert!(matches!(store.put(b"x", b"y"), Err(StoreError::Closed)));
        assert!(matches!(store.run_gc(0.5), Err(StoreError::Closed)));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let key = vec![b'k'; MAX_KEY_LEN + 1];
        assert!(matches!(store.put(&key, b"v"), Err(StoreError::KeyTooLarge { .. })));
    }
}
