//! Leveled catalog of archive runs.
//!
//! A run is a sorted, immutable file of log records covering a contiguous
//! range of WAL epochs at one level of the index. On disk a run is the data
//! region followed by a serialized sparse index (the trailer):
//!
//! ```text
//! +--------------------------+
//! | log records (var length) |
//! +--------------------------+
//! | count: u32               |
//! | pids[count]: u32         |
//! | offsets[count]: u64      |   high bit: block holds a page image
//! +--------------------------+
//! | trailer length: u64      |
//! +--------------------------+
//! ```
//!
//! Everything is little-endian. Entry `i` of the trailer asserts that the
//! first record with page id `pids[i]` sits at byte offset
//! `offsets[i] & !HIGH_BIT` of the data region.
//!
//! Finished runs are named `run.<begin>-<end>.<level>`; a run being written
//! uses `current_run.<level>` and is renamed on close. The in-memory catalog
//! is guarded by a reader/writer latch; probes take it shared, run
//! installation takes it exclusive, and the mmap open-file cache sits behind
//! its own latch.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::latch::Latched;
use crate::lsn::{PageId, RunNumber};
use crate::Error;

/// File name prefix of a finished run.
pub const RUN_PREFIX: &str = "run";

/// File name prefix of the run currently being written at a level.
pub const CURR_RUN_PREFIX: &str = "current_run";

/// High bit of a trailer offset: the block at this offset contains a full
/// page image.
const OFFSET_IMG_MASK: u64 = 1 << 63;

/// Identity of one run: the epoch range it covers and its level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RunId {
    pub begin: RunNumber,
    pub end: RunNumber,
    pub level: u32,
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}-{}.{}", RUN_PREFIX, self.begin, self.end, self.level)
    }
}

/// Index entry handed to [`ArchiveIndex::new_block`] for each page bucket of
/// a block the run builder just wrote.
#[derive(Clone, Copy, Debug)]
pub struct BucketInfo {
    pub pid: PageId,
    pub offset: u64,
    pub has_page_image: bool,
}

/// In-memory sparse index of one run: parallel arrays of monotonically
/// non-decreasing page ids and encoded file offsets.
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub begin: RunNumber,
    pub end: RunNumber,
    pids: Vec<PageId>,
    offsets: Vec<u64>,
}

impl RunInfo {
    pub fn new(begin: RunNumber, end: RunNumber) -> Self {
        RunInfo { begin, end, pids: Vec::new(), offsets: Vec::new() }
    }

    fn add_raw_entry(&mut self, pid: PageId, raw_offset: u64) {
        debug_assert!(self.pids.last().map_or(true, |&last| last <= pid));
        self.pids.push(pid);
        self.offsets.push(raw_offset);
    }

    pub fn add_entry(&mut self, pid: PageId, offset: u64, has_image: bool) {
        assert!(offset & OFFSET_IMG_MASK == 0, "offset overflows the image bit");
        self.add_raw_entry(pid, offset | if has_image { OFFSET_IMG_MASK } else { 0 });
    }

    pub fn entry_count(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn pid(&self, i: usize) -> PageId {
        self.pids[i]
    }

    pub fn offset(&self, i: usize) -> u64 {
        self.offsets[i] & !OFFSET_IMG_MASK
    }

    pub fn has_image(&self, i: usize) -> bool {
        self.offsets[i] & OFFSET_IMG_MASK != 0
    }

    pub fn max_pid(&self) -> Option<PageId> {
        self.pids.last().copied()
    }

    /// Greatest index `i` with `pids[i] <= pid`; 0 when every entry is
    /// larger (the caller starts from the head of the run).
    pub fn find_entry(&self, pid: PageId) -> usize {
        self.pids.partition_point(|&p| p <= pid).saturating_sub(1)
    }

    fn trailer_len(&self) -> usize {
        4 + self.pids.len() * 4 + self.offsets.len() * 8
    }

    /// Serializes the trailer followed by its own length.
    fn write_trailer(&self, out: &mut impl Write) -> Result<()> {
        let mut buf = Vec::with_capacity(self.trailer_len() + 8);
        let mut scratch = [0u8; 8];

        LittleEndian::write_u32(&mut scratch[..4], self.pids.len() as u32);
        buf.extend_from_slice(&scratch[..4]);
        for &pid in &self.pids {
            LittleEndian::write_u32(&mut scratch[..4], pid);
            buf.extend_from_slice(&scratch[..4]);
        }
        for &offset in &self.offsets {
            LittleEndian::write_u64(&mut scratch, offset);
            buf.extend_from_slice(&scratch);
        }
        LittleEndian::write_u64(&mut scratch, self.trailer_len() as u64);
        buf.extend_from_slice(&scratch);

        out.write_all(&buf)?;
        Ok(())
    }

    /// Parses a trailer out of the mapped run file.
    fn read_trailer(trailer: &[u8], begin: RunNumber, end: RunNumber) -> Result<RunInfo> {
        if trailer.len() < 4 {
            return errcorrupt!("run trailer too short: {} bytes", trailer.len());
        }
        let count = LittleEndian::read_u32(&trailer[..4]) as usize;
        if trailer.len() != 4 + count * 12 {
            return errcorrupt!(
                "run trailer length {} does not match entry count {count}",
                trailer.len()
            );
        }

        let mut info = RunInfo::new(begin, end);
        let pids = &trailer[4..4 + count * 4];
        let offsets = &trailer[4 + count * 4..];
        for i in 0..count {
            info.add_raw_entry(
                LittleEndian::read_u32(&pids[i * 4..]),
                LittleEndian::read_u64(&offsets[i * 8..]),
            );
        }
        Ok(info)
    }
}

/// A memory-mapped open run file. Shared between the open-file cache and any
/// scans currently reading it; the mapping lives until the last reference
/// drops.
pub struct RunFile {
    runid: RunId,
    map: Mmap,
    data_len: usize,
}

impl RunFile {
    fn open(path: &Path, runid: RunId) -> Result<RunFile> {
        let file = File::open(path)
            .map_err(|e| Error::NotFound(format!("run {runid}: {e}")))?;
        // SAFETY: run files are immutable once renamed to their final name.
        let map = unsafe { Mmap::map(&file)? };
        let data_len = data_region_len(&map, &runid)?;
        Ok(RunFile { runid, map, data_len })
    }

    pub fn runid(&self) -> RunId {
        self.runid
    }

    /// The record region of the file, trailer excluded.
    pub fn data(&self) -> &[u8] {
        &self.map[..self.data_len]
    }
}

/// Splits a mapped run into data region and trailer, validating the
/// trailing length word.
fn data_region_len(map: &[u8], runid: &RunId) -> Result<usize> {
    if map.len() < 12 {
        return errcorrupt!("run {runid} too small: {} bytes", map.len());
    }
    let trailer_len = LittleEndian::read_u64(&map[map.len() - 8..]) as usize;
    map.len()
        .checked_sub(8 + trailer_len)
        .ok_or_else(|| {
            Error::CorruptRecord(format!("run {runid} trailer length {trailer_len} too large"))
        })
}

/// One probed merge source: an open run and the offset of the first
/// candidate record.
pub struct ProbeResult {
    pub file: Arc<RunFile>,
    pub pos: u64,
}

struct IndexState {
    /// Finished runs per level, sorted by `begin`. Level 0 is unused.
    runs: Vec<Vec<RunInfo>>,
    /// Index of the last finished (probe-visible) run per level.
    last_finished: Vec<Option<usize>>,
}

impl IndexState {
    fn ensure_level(&mut self, level: u32) {
        while self.runs.len() <= level as usize {
            self.runs.push(Vec::new());
            self.last_finished.push(None);
        }
    }

    fn max_level(&self) -> u32 {
        (self.runs.len() as u32).saturating_sub(1)
    }

    /// First index at `level` whose run ends at or after `run`.
    fn find_run(&self, run: RunNumber, level: u32) -> usize {
        self.runs[level as usize].partition_point(|r| r.end < run)
    }
}

struct CacheEntry {
    file: Arc<RunFile>,
    last_used: u64,
}

struct OpenFileCache {
    files: HashMap<RunId, CacheEntry>,
    tick: u64,
}

struct Appender {
    file: File,
    pos: u64,
    info: RunInfo,
}

/// Catalog of all archive runs: startup discovery, the appender path used by
/// the run builder, and probe/scan support.
pub struct ArchiveIndex {
    archdir: PathBuf,
    max_open_files: usize,
    state: Latched<IndexState>,
    open_files: Latched<OpenFileCache>,
    appenders: Mutex<Vec<Option<Appender>>>,
}

impl ArchiveIndex {
    /// Opens the archive directory, loading the sparse index of every
    /// finished run and removing stale in-progress files. With `reformat`,
    /// existing run files are wiped instead.
    pub fn open(config: &ArchiveConfig) -> Result<ArchiveIndex> {
        if config.archdir.as_os_str().is_empty() {
            return errconfig!("archdir must be set");
        }
        let archdir = config.archdir.clone();
        if !archdir.exists() {
            if config.reformat {
                fs::create_dir_all(&archdir)?;
            } else {
                return errconfig!("could not open archive directory {}", archdir.display());
            }
        }

        let mut state = IndexState { runs: vec![Vec::new()], last_finished: vec![None] };

        for entry in fs::read_dir(&archdir)? {
            let entry = entry?;
            let fname = entry.file_name().to_string_lossy().into_owned();

            if let Some(level) = parse_current_run_name(&fname) {
                // Leftover from a crash mid-run; the data is incomplete.
                tracing::warn!(level, file = %fname, "removing stale in-progress run");
                fs::remove_file(entry.path())?;
                continue;
            }
            let runid = match parse_run_file_name(&fname) {
                Some(runid) => runid,
                None => {
                    return errconfig!("cannot parse file name {fname} in archive directory");
                }
            };
            if config.reformat {
                tracing::info!(run = %runid, "reformat: removing run file");
                fs::remove_file(entry.path())?;
                continue;
            }

            let file = RunFile::open(&entry.path(), runid)?;
            let trailer = &file.map[file.data_len..file.map.len() - 8];
            let info = RunInfo::read_trailer(trailer, runid.begin, runid.end)?;
            state.ensure_level(runid.level);
            state.runs[runid.level as usize].push(info);
        }

        for (level, runs) in state.runs.iter_mut().enumerate() {
            runs.sort_by_key(|r| r.begin);
            state.last_finished[level] = runs.len().checked_sub(1);
        }
        tracing::info!(
            max_level = state.max_level(),
            "opened archive index at {}",
            archdir.display()
        );

        Ok(ArchiveIndex {
            archdir,
            max_open_files: config.max_open_files,
            state: Latched::new(state),
            open_files: Latched::new(OpenFileCache { files: HashMap::new(), tick: 0 }),
            appenders: Mutex::new(Vec::new()),
        })
    }

    pub fn archdir(&self) -> &Path {
        &self.archdir
    }

    pub fn max_level(&self) -> u32 {
        self.state.read().max_level()
    }

    pub fn run_count(&self, level: u32) -> usize {
        let state = self.state.read();
        if level as usize >= state.runs.len() {
            return 0;
        }
        state.runs[level as usize].len()
    }

    /// Epoch covered by the last finished run at `level`.
    pub fn last_run(&self, level: u32) -> Option<RunNumber> {
        let state = self.state.read();
        let runs = state.runs.get(level as usize)?;
        state.last_finished[level as usize].map(|i| runs[i].end)
    }

    /// Epoch at which the first finished run of `level` begins.
    pub fn first_run(&self, level: u32) -> Option<RunNumber> {
        let state = self.state.read();
        state.runs.get(level as usize)?.first().map(|r| r.begin)
    }

    fn make_run_path(&self, runid: RunId) -> PathBuf {
        self.archdir
            .join(format!("{}.{}-{}.{}", RUN_PREFIX, runid.begin, runid.end, runid.level))
    }

    fn make_current_run_path(&self, level: u32) -> PathBuf {
        self.archdir.join(format!("{CURR_RUN_PREFIX}.{level}"))
    }

    // ----- run generation -----

    /// Creates the in-progress file for a new run at `level`. The run covers
    /// epochs from the end of the level's last finished run onward; the
    /// upper bound is supplied at close.
    pub fn open_new_run(&self, level: u32) -> Result<()> {
        assert!(level > 0, "runs live at level 1 and above");
        let begin = self.last_run(level).map_or(1, |end| end + 1);

        let path = self.make_current_run_path(level);
        let file = File::create(&path)?;
        tracing::debug!(level, begin, "opened new run");

        let mut appenders = self.appenders.lock().unwrap();
        while appenders.len() <= level as usize {
            appenders.push(None);
        }
        assert!(
            appenders[level as usize].is_none(),
            "level {level} already has an open run"
        );
        appenders[level as usize] = Some(Appender { file, pos: 0, info: RunInfo::new(begin, 0) });
        Ok(())
    }

    /// Appends raw record data to the in-progress run at `level`.
    pub fn append(&self, data: &[u8], level: u32) -> Result<()> {
        let mut appenders = self.appenders.lock().unwrap();
        let appender = open_appender(&mut appenders, level)?;
        appender.file.write_all(data)?;
        appender.pos += data.len() as u64;
        Ok(())
    }

    /// Extends the in-progress run's sparse index with the buckets of the
    /// block just appended.
    pub fn new_block(&self, buckets: &[BucketInfo], level: u32) -> Result<()> {
        let mut appenders = self.appenders.lock().unwrap();
        let appender = open_appender(&mut appenders, level)?;
        for b in buckets {
            appender.info.add_entry(b.pid, b.offset, b.has_page_image);
        }
        Ok(())
    }

    pub fn fsync(&self, level: u32) -> Result<()> {
        let mut appenders = self.appenders.lock().unwrap();
        let appender = open_appender(&mut appenders, level)?;
        appender.file.sync_data()?;
        Ok(())
    }

    /// Finishes the in-progress run at `level` as covering epochs up to
    /// `run_no`: writes the trailer, fsyncs, renames the file to its final
    /// name, and installs the run in the catalog under the exclusive latch.
    /// Only after installation is the run visible to probes.
    pub fn close_current_run(&self, run_no: RunNumber, level: u32) -> Result<()> {
        let mut appender = {
            let mut appenders = self.appenders.lock().unwrap();
            open_appender(&mut appenders, level)?;
            appenders[level as usize].take().unwrap()
        };

        let curr_path = self.make_current_run_path(level);
        if appender.pos == 0 {
            // Nothing was appended; drop the empty file.
            drop(appender);
            fs::remove_file(&curr_path)?;
            tracing::debug!(level, "discarded empty run");
            return Ok(());
        }

        appender.info.end = run_no;
        assert!(appender.info.end >= appender.info.begin, "run range inverted");
        appender.info.write_trailer(&mut appender.file)?;
        appender.file.sync_data()?;

        let runid = RunId { begin: appender.info.begin, end: run_no, level };
        fs::rename(&curr_path, self.make_run_path(runid))?;
        tracing::info!(run = %runid, bytes = appender.pos, "closed run");

        let mut state = self.state.write();
        state.ensure_level(level);
        let runs = &mut state.runs[level as usize];
        let at = runs.partition_point(|r| r.begin < appender.info.begin);
        runs.insert(at, appender.info);
        let count = runs.len();
        state.last_finished[level as usize] = Some(count - 1);
        Ok(())
    }

    // ----- run scanning -----

    /// Returns the open run, mmap-ing it on a cache miss. When the cache
    /// exceeds its cap, least-recently-used files no scan holds are evicted.
    pub fn open_for_scan(&self, runid: RunId) -> Result<Arc<RunFile>> {
        let mut cache = self.open_files.write();
        cache.tick += 1;
        let tick = cache.tick;

        if let Some(entry) = cache.files.get_mut(&runid) {
            entry.last_used = tick;
            return Ok(entry.file.clone());
        }

        let file = Arc::new(RunFile::open(&self.make_run_path(runid), runid)?);
        cache.files.insert(runid, CacheEntry { file: file.clone(), last_used: tick });

        while cache.files.len() > self.max_open_files {
            // Evict the least-recently-used run no scan is holding.
            let victim = cache
                .files
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.file) == 1)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    tracing::debug!(run = %id, "evicting mapped run");
                    cache.files.remove(&id);
                }
                None => break, // every file is pinned by a scan
            }
        }

        Ok(file)
    }

    /// Locates, for every finished run that may hold records in
    /// `[start_pid, end_pid)` (with `end_pid == 0` unbounded) and epochs
    /// from `run_begin` up to `*run_end` (0 unbounded), the position of the
    /// first candidate record. `*run_end` returns the largest epoch
    /// observed, so the caller can bound future probes.
    pub fn probe(
        &self,
        start_pid: PageId,
        end_pid: PageId,
        run_begin: RunNumber,
        run_end: &mut RunNumber,
    ) -> Result<Vec<ProbeResult>> {
        let state = self.state.read();
        let bound = *run_end;
        let mut next_run = run_begin;
        let mut inputs = Vec::new();

        for level in (1..=state.max_level()).rev() {
            if bound > 0 && next_run > bound {
                break;
            }

            let mut index = state.find_run(next_run, level);
            let finished = state.last_finished[level as usize];
            while finished.is_some_and(|last| index <= last) {
                let run = &state.runs[level as usize][index];
                index += 1;
                if bound > 0 && run.begin > bound {
                    break;
                }
                next_run = next_run.max(run.end);

                if run.is_empty() {
                    continue;
                }
                // Prune without a search when the whole run is below the
                // requested range.
                if start_pid > run.max_pid().unwrap() {
                    continue;
                }
                let entry = run.find_entry(start_pid);
                if end_pid > 0 && run.pid(entry) >= end_pid {
                    continue;
                }

                let runid = RunId { begin: run.begin, end: run.end, level };
                let file = self.open_for_scan(runid)?;
                let pos = run.offset(entry);
                debug_assert!(pos < file.data().len() as u64);
                inputs.push(ProbeResult { file, pos });
            }
        }

        *run_end = next_run;
        Ok(inputs)
    }

    /// A minimal covering set of runs, preferring the highest (largest-run)
    /// levels: starting from epoch 1, walks each level's finished runs and
    /// descends only for epochs not yet covered.
    pub fn list_runs_non_overlapping(&self) -> Vec<RunId> {
        let state = self.state.read();
        let mut out = Vec::new();
        let mut next_run = 1;

        for level in (1..=state.max_level()).rev() {
            let mut index = state.find_run(next_run, level);
            let finished = state.last_finished[level as usize];
            while finished.is_some_and(|last| index <= last) {
                let run = &state.runs[level as usize][index];
                out.push(RunId { begin: run.begin, end: run.end, level });
                next_run = run.end + 1;
                index += 1;
            }
        }
        out
    }
}

fn open_appender(appenders: &mut [Option<Appender>], level: u32) -> Result<&mut Appender> {
    appenders
        .get_mut(level as usize)
        .and_then(|a| a.as_mut())
        .ok_or_else(|| Error::NotFound(format!("no open run at level {level}")))
}

/// Parses `run.<begin>-<end>.<level>`.
fn parse_run_file_name(fname: &str) -> Option<RunId> {
    let rest = fname.strip_prefix(RUN_PREFIX)?.strip_prefix('.')?;
    let (range, level) = rest.rsplit_once('.')?;
    let (begin, end) = range.split_once('-')?;
    let runid = RunId {
        begin: begin.parse().ok()?,
        end: end.parse().ok()?,
        level: level.parse().ok()?,
    };
    (runid.begin <= runid.end && runid.level > 0).then_some(runid)
}

/// Parses `current_run.<level>`.
fn parse_current_run_name(fname: &str) -> Option<u32> {
    fname.strip_prefix(CURR_RUN_PREFIX)?.strip_prefix('.')?.parse().ok()
}
