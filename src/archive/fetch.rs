//! Rebuilds a page by replaying its archived history.
//!
//! A node fetch opens a single-page archive scan and applies every redo
//! record to the page in `(pid, version)` order. Page-image compression
//! interacts with run boundaries: an older non-image record can land in a
//! *later* run file than the image that shadows it, so the scan may emit it
//! after the image's run was selected. Applying it would corrupt the page.
//! The fetch therefore skips non-image records until the first page image
//! for the page has been consumed; from then on every redo record applies.

use std::sync::Arc;

use crate::archive::index::ArchiveIndex;
use crate::archive::scan::ArchiveScan;
use crate::error::Result;
use crate::logrec::LogRecord;
use crate::lsn::{PageId, RunNumber};

/// Applies one redo record to a node. The record-body codec implements
/// this; the fetch driver only sequences the calls.
pub trait Redoer {
    type Node;

    fn redo(&self, record: LogRecord<'_>, node: &mut Self::Node);
}

pub struct NodeFetch<R> {
    scan: ArchiveScan,
    redoer: R,
    /// Set once the first page image for the open page was applied;
    /// non-image records before it are skipped.
    img_consumed: bool,
}

impl<R: Redoer> NodeFetch<R> {
    pub fn new(index: Arc<ArchiveIndex>, redoer: R) -> Self {
        NodeFetch { scan: ArchiveScan::new(index), redoer, img_consumed: false }
    }

    /// Opens a single-page scan over the full archive history of `id`.
    pub fn open(&mut self, id: PageId) -> Result<()> {
        self.scan.open(id, id + 1, 0, 0)?;
        self.img_consumed = false;
        Ok(())
    }

    /// Reopens for the same page, resuming after the last probed run.
    /// Used when a page is evicted with updates not yet archived; the image
    /// gate carries over from the previous replay.
    pub fn reopen(&mut self, id: PageId) -> Result<()> {
        self.scan.open(id, id + 1, self.last_probed_run() + 1, 0)
    }

    /// Replays the scan into `node`. Returns the number of records applied.
    pub fn apply(&mut self, node: &mut R::Node) -> Result<usize> {
        let mut replayed = 0;
        while let Some(rec) = self.scan.next()? {
            let lr = rec.record();
            if self.should_redo(lr) {
                self.redoer.redo(lr, node);
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    pub fn last_probed_run(&self) -> RunNumber {
        self.scan.last_probed_run()
    }

    fn should_redo(&mut self, lr: LogRecord<'_>) -> bool {
        debug_assert!(lr.valid_header());
        if !lr.is_redo() {
            return false;
        }
        debug_assert!(lr.page_version() > 0);

        if lr.has_page_img() {
            self.img_consumed = true;
        } else if !self.img_consumed {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::index::BucketInfo;
    use crate::config::ArchiveConfig;
    use crate::logrec::{kind, RecordBuf};
    use tempfile::TempDir;

    /// Replays into a version/history pair so tests can assert exactly what
    /// was applied.
    struct VersionRedoer;

    struct TestNode {
        version: u32,
        applied: Vec<u32>,
    }

    impl Redoer for VersionRedoer {
        type Node = TestNode;

        fn redo(&self, record: LogRecord<'_>, node: &mut TestNode) {
            assert!(record.page_version() > node.version, "replay went backwards");
            node.version = record.page_version();
            node.applied.push(record.page_version());
        }
    }

    fn open_index(dir: &TempDir) -> Arc<ArchiveIndex> {
        let config = ArchiveConfig::new(dir.path().join("log"), dir.path().join("arch"))
            .block_size(8192)
            .reformat(true);
        Arc::new(ArchiveIndex::open(&config).unwrap())
    }

    fn build_run(index: &ArchiveIndex, level: u32, run_no: u32, records: &[(u32, u32, bool)]) {
        index.open_new_run(level).unwrap();
        let mut offset = 0u64;
        let mut buckets = Vec::new();
        for &(pid, version, has_image) in records {
            let rtype = if has_image { kind::PAGE_IMAGE } else { kind::UPDATE };
            let rec = RecordBuf::new(rtype, pid, version, &[0; 16]);
            index.append(rec.as_bytes(), level).unwrap();
            // One sparse-index entry per pid: the first record of each page.
            if buckets.last().is_none_or(|b: &BucketInfo| b.pid != pid) {
                buckets.push(BucketInfo { pid, offset, has_page_image: has_image });
            }
            offset += rec.as_bytes().len() as u64;
        }
        index.new_block(&buckets, level).unwrap();
        index.close_current_run(run_no, level).unwrap();
    }

    #[test]
    fn test_replay_from_image() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        build_run(&index, 1, 1, &[(7, 1, true), (7, 2, false), (7, 3, false)]);

        let mut fetch = NodeFetch::new(index, VersionRedoer);
        fetch.open(7).unwrap();
        let mut node = TestNode { version: 0, applied: Vec::new() };
        assert_eq!(fetch.apply(&mut node).unwrap(), 3);
        assert_eq!(node.applied, vec![1, 2, 3]);
        assert_eq!(node.version, 3);
    }

    /// An orphaned pre-image update emitted after the image (the run
    /// boundary case) is skipped, not applied.
    #[test]
    fn test_pre_image_records_skipped() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        // Version 2 landed in a later run than the version-3 image, so the
        // image prune cannot remove it and the merge emits it first.
        build_run(&index, 1, 1, &[(7, 3, true), (7, 4, false)]);
        build_run(&index, 1, 2, &[(7, 2, false)]);

        let mut fetch = NodeFetch::new(index, VersionRedoer);
        fetch.open(7).unwrap();
        let mut node = TestNode { version: 0, applied: Vec::new() };
        fetch.apply(&mut node).unwrap();
        assert_eq!(node.applied, vec![3, 4]);
    }

    /// With no page image archived, nothing applies: the page's history
    /// must start with an image.
    #[test]
    fn test_no_image_applies_nothing() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        build_run(&index, 1, 1, &[(7, 1, false), (7, 2, false)]);

        let mut fetch = NodeFetch::new(index, VersionRedoer);
        fetch.open(7).unwrap();
        let mut node = TestNode { version: 0, applied: Vec::new() };
        assert_eq!(fetch.apply(&mut node).unwrap(), 0);
        assert!(node.applied.is_empty());
    }

    /// `reopen` resumes past the runs already replayed and keeps the image
    /// gate open.
    #[test]
    fn test_reopen_resumes_after_probed_runs() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        build_run(&index, 1, 1, &[(7, 1, true), (7, 2, false)]);

        let mut fetch = NodeFetch::new(index.clone(), VersionRedoer);
        fetch.open(7).unwrap();
        let mut node = TestNode { version: 0, applied: Vec::new() };
        fetch.apply(&mut node).unwrap();
        assert_eq!(node.applied, vec![1, 2]);
        assert_eq!(fetch.last_probed_run(), 1);

        // New history arrives in a later run.
        build_run(&index, 1, 2, &[(7, 3, false)]);
        fetch.reopen(7).unwrap();
        fetch.apply(&mut node).unwrap();
        assert_eq!(node.applied, vec![1, 2, 3]);
    }

    /// Records of other pages never reach the redoer.
    #[test]
    fn test_only_requested_page_applied() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        build_run(
            &index,
            1,
            1,
            &[(6, 1, true), (7, 1, true), (7, 2, false), (8, 1, true)],
        );

        let mut fetch = NodeFetch::new(index, VersionRedoer);
        fetch.open(7).unwrap();
        let mut node = TestNode { version: 0, applied: Vec::new() };
        assert_eq!(fetch.apply(&mut node).unwrap(), 2);
        assert_eq!(node.applied, vec![1, 2]);
    }
}
