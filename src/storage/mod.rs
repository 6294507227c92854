//! WAL partition files.
//!
//! The recovery log is partitioned across sequentially numbered append-only
//! files named `log.<N>` (`N >= 1`, no leading zeros) under the configured
//! log directory. Once the writer moves on to partition `N + 1`, the bytes of
//! partition `N` are immutable. [`LogStorage`] enumerates existing partitions
//! at startup, hands out lookups under a shared latch, rotates to new
//! partitions under an exclusive latch, and recycles old partitions on a
//! background worker.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::latch::Latched;
use crate::lsn::{Lsn, PartitionNum};
use crate::worker::WorkerThread;
use crate::Error;

/// File name prefix of a partition: `log.<N>`.
pub const LOG_PREFIX: &str = "log.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PartitionState {
    /// Finalized partition, readable.
    OpenForRead,
    /// The partition currently receiving appends.
    OpenForAppend,
    /// Recycled; the file awaits physical deletion.
    MarkedForDeletion,
    /// The file has been unlinked.
    Deleted,
}

/// One WAL partition file.
pub struct Partition {
    num: PartitionNum,
    path: PathBuf,
    state: Mutex<PartitionState>,
}

impl Partition {
    fn new(num: PartitionNum, path: PathBuf, state: PartitionState) -> Self {
        Partition { num, path, state: Mutex::new(state) }
    }

    pub fn num(&self) -> PartitionNum {
        self.num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Opens a fresh read handle on the partition file.
    pub fn open_for_read(&self) -> Result<File> {
        if *self.state.lock()? == PartitionState::Deleted {
            return Err(Error::NotFound(format!("partition {} deleted", self.num)));
        }
        File::open(&self.path)
            .map_err(|e| Error::NotFound(format!("partition {}: {e}", self.num)))
    }

    fn mark_for_deletion(&self) {
        let mut state = self.state.lock().unwrap();
        *state = PartitionState::MarkedForDeletion;
    }

    fn finalize(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PartitionState::OpenForAppend {
            *state = PartitionState::OpenForRead;
        }
    }

    fn delete_file(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        *self.state.lock()? = PartitionState::Deleted;
        Ok(())
    }
}

struct StorageState {
    partitions: BTreeMap<PartitionNum, Arc<Partition>>,
    curr: Option<Arc<Partition>>,
}

/// Catalog of WAL partition files.
pub struct LogStorage {
    logdir: PathBuf,
    partition_size: u64,
    delete_old: bool,
    state: Latched<StorageState>,
    to_delete: Arc<Mutex<Vec<Arc<Partition>>>>,
    recycler: Mutex<Option<WorkerThread>>,
}

impl LogStorage {
    /// Opens the log directory: with `reformat`, pre-existing partition
    /// files are removed; otherwise they are scanned and validated, and the
    /// highest-numbered one becomes the current partition. Directory entries
    /// that do not parse as `log.<N>` are rejected.
    pub fn open(config: &ArchiveConfig) -> Result<LogStorage> {
        let partition_size = config.effective_partition_size()?;
        let logdir = config.logdir.clone();

        if !logdir.exists() {
            if config.reformat {
                fs::create_dir_all(&logdir)?;
            } else {
                return errconfig!("could not open log directory {}", logdir.display());
            }
        }

        let mut partitions = BTreeMap::new();
        for entry in fs::read_dir(&logdir)? {
            let entry = entry?;
            let fname = entry.file_name().to_string_lossy().into_owned();
            match parse_partition_name(&fname) {
                Some(num) => {
                    if config.reformat {
                        tracing::info!(file = %fname, "reformat: removing partition file");
                        fs::remove_file(entry.path())?;
                        continue;
                    }
                    let p = Partition::new(num, entry.path(), PartitionState::OpenForRead);
                    partitions.insert(num, Arc::new(p));
                }
                None => {
                    return errconfig!("cannot parse file name {fname} in log directory");
                }
            }
        }

        let curr = partitions.values().next_back().cloned();
        if let Some(p) = &curr {
            tracing::info!(partition = p.num(), "resuming at last log partition");
        }

        Ok(LogStorage {
            logdir,
            partition_size,
            delete_old: config.delete_old_partitions,
            state: Latched::new(StorageState { partitions, curr }),
            to_delete: Arc::new(Mutex::new(Vec::new())),
            recycler: Mutex::new(None),
        })
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    pub fn make_log_path(&self, num: PartitionNum) -> PathBuf {
        self.logdir.join(format!("{LOG_PREFIX}{num}"))
    }

    /// Looks up a partition. A number that raced with recycling is simply
    /// absent.
    pub fn get_partition(&self, num: PartitionNum) -> Option<Arc<Partition>> {
        self.state.read().partitions.get(&num).cloned()
    }

    pub fn curr_partition(&self) -> Option<Arc<Partition>> {
        self.state.read().curr.clone()
    }

    /// Creates and installs partition `num`, which must be the successor of
    /// the current partition and absent from the catalog.
    pub fn create_partition(&self, num: PartitionNum) -> Result<Arc<Partition>> {
        let path = self.make_log_path(num);
        let mut state = self.state.write();

        assert!(
            !state.partitions.contains_key(&num),
            "partition {num} already exists"
        );
        if let Some(curr) = &state.curr {
            assert!(curr.num() == num - 1, "partition {num} does not succeed {}", curr.num());
            curr.finalize();
        }

        File::create(&path)?;
        let p = Arc::new(Partition::new(num, path, PartitionState::OpenForAppend));
        state.partitions.insert(num, p.clone());
        state.curr = Some(p.clone());
        drop(state);

        tracing::debug!(partition = num, "created log partition");
        self.wakeup_recycler();
        Ok(p)
    }

    /// Called by the log flusher: rotates to a new partition when the flush
    /// start LSN crosses a file boundary.
    pub fn get_partition_for_flush(&self, start_lsn: Lsn) -> Result<Arc<Partition>> {
        let curr = self
            .curr_partition()
            .ok_or_else(|| Error::NotFound("no current partition".to_string()))?;
        if start_lsn.hi() != curr.num() {
            assert!(
                start_lsn.hi() == curr.num() + 1,
                "flush start {start_lsn} skips past partition {}",
                curr.num()
            );
            return self.create_partition(curr.num() + 1);
        }
        Ok(curr)
    }

    /// Drops partitions numbered below `older_than` from the catalog and,
    /// when configured, queues their files for physical deletion. Returns
    /// the number of partitions removed.
    pub fn delete_old_partitions(&self, older_than: PartitionNum) -> usize {
        if older_than == 0 {
            return 0;
        }

        let removed: Vec<Arc<Partition>> = {
            let mut state = self.state.write();
            let keep = state.partitions.split_off(&older_than);
            let removed = std::mem::replace(&mut state.partitions, keep);
            removed.into_values().collect()
        };

        let count = removed.len();
        if self.delete_old && count > 0 {
            for p in &removed {
                p.mark_for_deletion();
            }
            self.to_delete.lock().unwrap().extend(removed);
            self.wakeup_recycler();
        }
        if count > 0 {
            tracing::info!(older_than, count, "recycled log partitions");
        }
        count
    }

    /// Partition numbers currently in the catalog, sorted.
    pub fn list_partitions(&self) -> Vec<PartitionNum> {
        self.state.read().partitions.keys().copied().collect()
    }

    /// Byte distance between two LSNs, assuming every non-tail partition has
    /// length `partition_size`. Null LSNs count as the start of the log.
    pub fn get_byte_distance(&self, a: Lsn, b: Lsn) -> u64 {
        let mut a = if a.is_null() { Lsn::new(1, 0) } else { a };
        let mut b = if b.is_null() { Lsn::new(1, 0) } else { b };
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }

        if a.hi() == b.hi() {
            (b.lo() - a.lo()) as u64
        } else {
            let rest = b.lo() as u64 + (self.partition_size - a.lo() as u64);
            self.partition_size * (b.hi() - a.hi() - 1) as u64 + rest
        }
    }

    fn wakeup_recycler(&self) {
        let mut recycler = self.recycler.lock().unwrap();
        if recycler.is_none() {
            let queue = self.to_delete.clone();
            *recycler = Some(WorkerThread::spawn("partition-recycler", None, move |_| {
                let batch: Vec<Arc<Partition>> = queue.lock()?.drain(..).collect();
                for p in batch {
                    match p.delete_file() {
                        Ok(()) => tracing::debug!(partition = p.num(), "deleted partition file"),
                        Err(e) => {
                            tracing::warn!(partition = p.num(), error = %e, "partition deletion failed")
                        }
                    }
                }
                Ok(())
            }));
        }
        recycler.as_ref().unwrap().wakeup();
    }

    /// Stops the recycler worker, if it ever started. Called on drop.
    pub fn shutdown(&self) {
        if let Some(mut worker) = self.recycler.lock().unwrap().take() {
            worker.stop();
        }
    }
}

impl Drop for LogStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parses `log.<N>` with `N >= 1` and no leading zero.
fn parse_partition_name(fname: &str) -> Option<PartitionNum> {
    let digits = fname.strip_prefix(LOG_PREFIX)?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ArchiveConfig {
        ArchiveConfig::new(dir.path().join("log"), dir.path().join("arch"))
            .partition_size(1024 * 1024)
            .block_size(8192)
            .reformat(true)
    }

    #[test]
    fn test_parse_partition_name() {
        assert_eq!(parse_partition_name("log.1"), Some(1));
        assert_eq!(parse_partition_name("log.42"), Some(42));
        assert_eq!(parse_partition_name("log.0"), None);
        assert_eq!(parse_partition_name("log.01"), None);
        assert_eq!(parse_partition_name("log."), None);
        assert_eq!(parse_partition_name("log.x"), None);
        assert_eq!(parse_partition_name("journal.1"), None);
    }

    #[test]
    fn test_open_empty_and_create() {
        let dir = TempDir::new().unwrap();
        let storage = LogStorage::open(&test_config(&dir)).unwrap();
        assert!(storage.curr_partition().is_none());
        assert!(storage.list_partitions().is_empty());

        let p = storage.create_partition(1).unwrap();
        assert_eq!(p.num(), 1);
        assert_eq!(storage.curr_partition().unwrap().num(), 1);
        storage.create_partition(2).unwrap();
        assert_eq!(storage.list_partitions(), vec![1, 2]);
        assert_eq!(storage.curr_partition().unwrap().num(), 2);
    }

    #[test]
    fn test_scan_existing_partitions() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.logdir).unwrap();
        for n in [1u32, 2, 3] {
            File::create(config.logdir.join(format!("log.{n}"))).unwrap();
        }

        let storage = LogStorage::open(&config.clone().reformat(false)).unwrap();
        assert_eq!(storage.list_partitions(), vec![1, 2, 3]);
        assert_eq!(storage.curr_partition().unwrap().num(), 3);
        assert!(storage.get_partition(2).is_some());
        assert!(storage.get_partition(9).is_none());
    }

    #[test]
    fn test_unknown_file_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.logdir).unwrap();
        File::create(config.logdir.join("stray.txt")).unwrap();

        let result = LogStorage::open(&config.clone().reformat(false));
        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[test]
    fn test_reformat_wipes_partitions() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.logdir).unwrap();
        File::create(config.logdir.join("log.1")).unwrap();

        let storage = LogStorage::open(&config).unwrap();
        assert!(storage.list_partitions().is_empty());
        assert!(!config.logdir.join("log.1").exists());
    }

    #[test]
    fn test_missing_dir_without_reformat() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).reformat(false);
        assert!(matches!(LogStorage::open(&config), Err(Error::BadConfig(_))));
    }

    #[test]
    fn test_partition_read_back() {
        let dir = TempDir::new().unwrap();
        let storage = LogStorage::open(&test_config(&dir)).unwrap();
        let p = storage.create_partition(1).unwrap();

        let mut file = File::options().write(true).open(p.path()).unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);

        assert_eq!(p.size().unwrap(), 10);
        let file = p.open_for_read().unwrap();
        assert_eq!(file.metadata().unwrap().len(), 10);
    }

    #[test]
    fn test_delete_old_partitions() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).delete_old_partitions(true);
        let storage = LogStorage::open(&config).unwrap();
        for n in 1..=4 {
            storage.create_partition(n).unwrap();
        }

        assert_eq!(storage.delete_old_partitions(0), 0);
        assert_eq!(storage.delete_old_partitions(3), 2);
        assert_eq!(storage.list_partitions(), vec![3, 4]);

        // The recycler unlinks the files asynchronously.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while storage.make_log_path(1).exists() || storage.make_log_path(2).exists() {
            assert!(std::time::Instant::now() < deadline, "recycler never deleted files");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(storage.make_log_path(3).exists());
    }

    #[test]
    fn test_get_partition_for_flush_rotates() {
        let dir = TempDir::new().unwrap();
        let storage = LogStorage::open(&test_config(&dir)).unwrap();
        storage.create_partition(1).unwrap();

        let p = storage.get_partition_for_flush(Lsn::new(1, 512)).unwrap();
        assert_eq!(p.num(), 1);
        let p = storage.get_partition_for_flush(Lsn::new(2, 0)).unwrap();
        assert_eq!(p.num(), 2);
        assert_eq!(storage.curr_partition().unwrap().num(), 2);
    }

    #[test]
    fn test_byte_distance() {
        let dir = TempDir::new().unwrap();
        let storage = LogStorage::open(&test_config(&dir)).unwrap();
        let psize = storage.partition_size();

        // Same partition.
        assert_eq!(storage.get_byte_distance(Lsn::new(1, 100), Lsn::new(1, 300)), 200);
        // Across partitions.
        assert_eq!(
            storage.get_byte_distance(Lsn::new(1, 100), Lsn::new(3, 50)),
            (psize - 100) + psize + 50
        );
        // Null counts as the start of the log; arguments may be swapped.
        assert_eq!(storage.get_byte_distance(Lsn::NULL, Lsn::new(1, 64)), 64);
        assert_eq!(storage.get_byte_distance(Lsn::new(1, 64), Lsn::NULL), 64);
    }

    #[test]
    fn test_byte_distance_identity() {
        let dir = TempDir::new().unwrap();
        let storage = LogStorage::open(&test_config(&dir)).unwrap();

        // d(a,c) = d(a,b) + d(b,c) for ordered a <= b <= c.
        let points = [
            Lsn::new(1, 0),
            Lsn::new(1, 4096),
            Lsn::new(2, 0),
            Lsn::new(2, 100),
            Lsn::new(5, 8192),
        ];
        for (i, &a) in points.iter().enumerate() {
            for (j, &b) in points.iter().enumerate().skip(i) {
                for &c in points.iter().skip(j) {
                    assert_eq!(
                        storage.get_byte_distance(a, c),
                        storage.get_byte_distance(a, b) + storage.get_byte_distance(b, c),
                        "identity failed for {a} {b} {c}"
                    );
                }
            }
        }
    }
}
