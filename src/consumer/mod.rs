//! Record-at-a-time interface to the recovery log.
//!
//! [`LogConsumer`] composes the three reading pipelines:
//!
//! ```text
//! partition files --> Reader (worker thread) --> ring buffer
//!                                                     |
//!                                 LogScanner <-- consumer side
//!                                      |
//!                              LogConsumer::next()
//! ```
//!
//! `open` publishes an end-LSN goal to the reader; `next` then yields one
//! record per call, reassembling records that straddle block boundaries and
//! transparently crossing partition boundaries when the scanner reports the
//! synthetic end-of-file record. `next` returns `None` exactly when the goal
//! LSN is reached, and `next_lsn() <= end_lsn` holds on every return.
//!
//! The record returned by `next` borrows either the current ring-buffer
//! block or the scanner's scratch buffer; it is valid until the next call.

pub mod reader;
pub mod scanner;

use std::sync::Arc;

use crate::error::Result;
use crate::logrec::LogRecord;
use crate::lsn::Lsn;
use crate::ringbuf::{ring_buffer, Consumer};
use crate::storage::LogStorage;
use crate::worker::WorkerThread;

use reader::Reader;
use scanner::{LogScanner, Scan};

/// Number of blocks in the read ring buffer.
const IO_BLOCK_COUNT: usize = 8;

pub struct LogConsumer {
    consumer: Consumer,
    reader: WorkerThread,
    scanner: LogScanner,
    storage: Arc<LogStorage>,

    next_lsn: Lsn,
    end_lsn: Lsn,

    block_size: usize,
    /// Parse position within the current block.
    pos: usize,
    read_whole_blocks: bool,
}

impl LogConsumer {
    /// Creates the ring buffer, spawns the reader at `start_lsn`, and places
    /// the parse cursor on the corresponding in-block offset.
    pub fn new(start_lsn: Lsn, block_size: usize, storage: Arc<LogStorage>) -> Self {
        tracing::debug!(start = %start_lsn, "starting log consumer");

        let (producer, consumer) = ring_buffer(block_size, IO_BLOCK_COUNT);
        let mut reader = Reader::new(producer, start_lsn, storage.clone());
        let worker =
            WorkerThread::spawn("log-reader", None, move |signal| reader.run(signal));

        LogConsumer {
            consumer,
            reader: worker,
            scanner: LogScanner::new(block_size),
            storage,
            next_lsn: start_lsn,
            end_lsn: Lsn::NULL,
            block_size,
            pos: (start_lsn.lo() as usize) % block_size,
            read_whole_blocks: false,
        }
    }

    /// Activates the reader up to `end_lsn` and fetches the first block.
    /// With `read_whole_blocks`, a record that would straddle the final
    /// block boundary is left for the next activation instead of being
    /// assembled.
    pub fn open(&mut self, end_lsn: Lsn, read_whole_blocks: bool) -> Result<()> {
        self.end_lsn = end_lsn;
        self.read_whole_blocks = read_whole_blocks;
        self.reader.wakeup_until_lsn(end_lsn);
        self.next_block()?;
        Ok(())
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Stops the reader and marks the ring finished. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&mut self) {
        if !self.consumer.is_finished() {
            self.consumer.set_finished();
        }
        self.reader.stop();
    }

    fn next_block(&mut self) -> Result<bool> {
        if self.consumer.has_block() {
            self.consumer.release();
        }
        if !self.consumer.request() {
            // The request only fails once the buffer is finished; the
            // end LSN always names a readable position.
            return Ok(false);
        }
        if self.pos >= self.block_size {
            // Continuing into a fresh block; otherwise the cursor stays at
            // the in-block offset carried over from the previous cycle.
            self.pos = 0;
        }
        Ok(true)
    }

    /// Yields the next record and its LSN, or `None` at the end LSN.
    pub fn next(&mut self) -> Result<Option<(LogRecord<'_>, Lsn)>> {
        debug_assert!(self.next_lsn <= self.end_lsn);

        if !self.consumer.has_block() && !self.next_block()? {
            return Ok(None);
        }

        let (len, from_scratch) = loop {
            let scan = self.scanner.next_record(
                self.consumer.current(),
                &mut self.pos,
                &mut self.next_lsn,
                self.end_lsn,
            )?;

            match scan {
                Scan::AtStop => return Ok(None),
                Scan::Record { len, scratch, eof: false } => break (len, scratch),
                Scan::Record { eof: true, .. } => {
                    // End-of-file marker: resume at the next partition.
                    self.next_lsn = Lsn::new(self.next_lsn.hi() + 1, 0);
                    self.pos = 0;
                    self.scanner.reset();
                    tracing::debug!(next = %self.next_lsn, "eof record, jumping partition");
                    if !self.next_block()? {
                        return Ok(None);
                    }
                }
                Scan::BlockDone { partial_len } => {
                    if self.at_partition_end() {
                        // The partition ended on a block boundary with no
                        // EOF marker; resume at the next partition.
                        self.next_lsn = Lsn::new(self.next_lsn.hi() + 1, 0);
                        self.pos = 0;
                        self.scanner.reset();
                        tracing::debug!(next = %self.next_lsn, "partition end, jumping");
                        if !self.next_block()? {
                            return Ok(None);
                        }
                        continue;
                    }
                    if self.stop_at_block_boundary(partial_len) {
                        return Ok(None);
                    }
                    if !self.next_block()? {
                        return Ok(None);
                    }
                }
            }
        };

        debug_assert!(self.next_lsn <= self.end_lsn);
        let lsn = Lsn::new(self.next_lsn.hi(), self.next_lsn.lo() - len as u32);
        let bytes = if from_scratch {
            self.scanner.scratch_bytes(len)
        } else {
            &self.consumer.current()[self.pos - len..self.pos]
        };
        Ok(Some((LogRecord::from_bytes(bytes), lsn)))
    }

    /// Whether the parse cursor sits exactly at the final size of a
    /// non-current partition, i.e. the writer rotated without an EOF
    /// marker. Finalized partitions are immutable, so the size is stable.
    fn at_partition_end(&self) -> bool {
        if self.next_lsn.hi() >= self.end_lsn.hi() || self.scanner.has_partial_record() {
            return false;
        }
        match self.storage.get_partition(self.next_lsn.hi()) {
            Some(p) => p.size().is_ok_and(|size| size == self.next_lsn.lo() as u64),
            None => false,
        }
    }

    /// Whether an incomplete record at a block boundary ends this
    /// activation.
    fn stop_at_block_boundary(&self, partial_len: Option<usize>) -> bool {
        if self.next_lsn == self.end_lsn {
            return true;
        }
        if !self.read_whole_blocks {
            return false;
        }
        // Whole-blocks policy: stop if the pending record would spill past
        // the end LSN's block; the next activation re-reads it.
        self.end_lsn.hi() == self.next_lsn.hi()
            && match partial_len {
                None => true,
                Some(len) => ((self.end_lsn.lo() - self.next_lsn.lo()) as usize) < len,
            }
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
