//! Merge-reads archive runs in `(pid, page_version)` order.
//!
//! A scan probes the index for every run that may hold records in the
//! requested page range, opens a cursor into each, and merges them through a
//! min-heap keyed on `(pid, page_version)`. Single-page scans prune with the
//! page-image rule: iterating the probed inputs newest-first, the first
//! input whose head record carries a page image obsoletes all older inputs,
//! which bounds replay cost by the age of the most recent image.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::archive::index::{ArchiveIndex, RunFile, RunId};
use crate::error::Result;
use crate::logrec::{LogRecord, HEADER_SIZE};
use crate::lsn::{PageId, RunNumber};

/// One merge source: a cursor into an open run.
///
/// Two of these pack into a cache line; the compile-time assertion below
/// keeps the layout honest.
struct MergeInput {
    file: Arc<RunFile>,
    pos: u64,
    key_pid: PageId,
    key_version: u32,
    end_pid: PageId,
}

const _: () = assert!(std::mem::size_of::<MergeInput>() == 32, "MergeInput grew past 32 bytes");

impl MergeInput {
    fn new(file: Arc<RunFile>, pos: u64, end_pid: PageId) -> Self {
        MergeInput { file, pos, key_pid: 0, key_version: 0, end_pid }
    }

    fn record(&self) -> LogRecord<'_> {
        LogRecord::from_bytes(&self.file.data()[self.pos as usize..])
    }

    /// A cursor is finished at the end of the data region, on the synthetic
    /// EOF record, or once the current pid leaves the requested range.
    fn finished(&self) -> bool {
        let data_len = self.file.data().len();
        if self.pos as usize + HEADER_SIZE > data_len {
            return true;
        }
        let lr = self.record();
        lr.is_eof() || (self.end_pid != 0 && lr.pid() >= self.end_pid)
    }

    /// Positions the cursor on the first record with `pid >= start_pid`.
    /// Returns false if the run holds no candidate record.
    fn open(&mut self, start_pid: PageId) -> bool {
        if self.finished() {
            return false;
        }
        self.refresh_keys();
        while !self.finished() && self.record().pid() < start_pid {
            self.next();
        }
        if self.finished() {
            return false;
        }
        debug_assert!(self.key_version == self.record().page_version());
        true
    }

    fn next(&mut self) {
        debug_assert!(!self.finished());
        let lr = self.record();
        debug_assert!(lr.valid_header());
        self.pos += lr.length() as u64;
        self.refresh_keys();
    }

    fn refresh_keys(&mut self) {
        if self.pos as usize + HEADER_SIZE <= self.file.data().len() {
            let lr = self.record();
            let pid = lr.pid();
            let version = lr.page_version();
            self.key_pid = pid;
            self.key_version = version;
        }
    }
}

impl PartialEq for MergeInput {
    fn eq(&self, other: &Self) -> bool {
        self.key_pid == other.key_pid && self.key_version == other.key_version
    }
}

impl Eq for MergeInput {}

impl PartialOrd for MergeInput {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeInput {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest (pid, version) next.
        (self.key_pid, self.key_version)
            .cmp(&(other.key_pid, other.key_version))
            .reverse()
    }
}

/// One record emitted by a scan. Holds the mapped run alive; the borrowed
/// view from [`ScanRecord::record`] is valid for as long as this handle is.
pub struct ScanRecord {
    file: Arc<RunFile>,
    pos: usize,
}

impl ScanRecord {
    pub fn record(&self) -> LogRecord<'_> {
        LogRecord::from_bytes(&self.file.data()[self.pos..])
    }

    pub fn pid(&self) -> PageId {
        self.record().pid()
    }

    pub fn page_version(&self) -> u32 {
        self.record().page_version()
    }
}

/// A merge scan over all archive records for a page range.
pub struct ArchiveScan {
    index: Arc<ArchiveIndex>,
    heap: BinaryHeap<MergeInput>,
    single_page: bool,
    last_probed_run: RunNumber,
}

impl ArchiveScan {
    pub fn new(index: Arc<ArchiveIndex>) -> Self {
        ArchiveScan { index, heap: BinaryHeap::new(), single_page: false, last_probed_run: 0 }
    }

    /// Probes runs covering epochs `[run_begin, run_end]` (`run_end == 0`
    /// unbounded) for records in `[start_pid, end_pid)` (`end_pid == 0`
    /// unbounded) and builds the merge heap.
    pub fn open(
        &mut self,
        start_pid: PageId,
        end_pid: PageId,
        run_begin: RunNumber,
        run_end: RunNumber,
    ) -> Result<()> {
        self.clear();

        let mut run_end = run_end;
        let probed = self.index.probe(start_pid, end_pid, run_begin, &mut run_end)?;
        self.last_probed_run = run_end;
        self.single_page = end_pid == start_pid.wrapping_add(1);

        // Sweep the probed inputs newest-first so a page image can discard
        // every older input.
        for probe in probed.into_iter().rev() {
            let mut input = MergeInput::new(probe.file, probe.pos, end_pid);
            if !input.open(start_pid) {
                continue;
            }
            let has_img = input.record().has_page_img();
            self.heap.push(input);
            if self.single_page && has_img {
                tracing::debug!(start_pid, "page image found, pruning older inputs");
                break;
            }
        }
        Ok(())
    }

    /// Merges the given runs in full, with no page-range bounds.
    pub fn open_for_merge(&mut self, runids: &[RunId]) -> Result<()> {
        self.clear();
        for &runid in runids {
            let file = self.index.open_for_scan(runid)?;
            let mut input = MergeInput::new(file, 0, 0);
            if input.open(0) {
                self.heap.push(input);
            }
        }
        Ok(())
    }

    /// Full-range scan; the record-granular half of whole-file by-page
    /// merging.
    #[cfg(feature = "by-page-merge")]
    pub fn open_by_page(&mut self) -> Result<()> {
        self.open(0, 0, 0, 0)
    }

    /// Pops the smallest `(pid, page_version)` record across all inputs.
    pub fn next(&mut self) -> Result<Option<ScanRecord>> {
        while let Some(mut top) = self.heap.pop() {
            if top.finished() {
                // Exhausted input: the heap shrinks.
                continue;
            }
            let out = ScanRecord { file: top.file.clone(), pos: top.pos as usize };
            debug_assert!(out.pid() == top.key_pid && out.page_version() == top.key_version);
            top.next();
            self.heap.push(top);
            return Ok(Some(out));
        }
        Ok(None)
    }

    pub fn finished(&self) -> bool {
        self.heap.is_empty()
    }

    /// Largest epoch covered by the last probe; a reopen can resume past it.
    pub fn last_probed_run(&self) -> RunNumber {
        self.last_probed_run
    }

    /// Drops all inputs, releasing their references into the open-file
    /// cache.
    fn clear(&mut self) {
        self.heap.clear();
        self.single_page = false;
    }
}
