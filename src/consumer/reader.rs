//! Asynchronous reader for the recovery log.
//!
//! The reader runs on a worker thread and operates in activation cycles: the
//! consumer publishes an end-LSN goal, the reader streams partition blocks
//! into the ring buffer until the goal is reached, then sleeps until the
//! next activation. It never reads past the goal at logical granularity, but
//! a physical read may extend up to one block beyond it; short reads make
//! that safe.
//!
//! On reaching the end of a partition (a zero-byte read) the reader opens
//! the next partition and retries once; a second zero-byte read with the
//! goal still ahead is an unexpected end of file. Any failure marks the ring
//! finished, so the consumer drains and then stops instead of hanging.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::error::Result;
use crate::lsn::{Lsn, PartitionNum};
use crate::ringbuf::Producer;
use crate::storage::LogStorage;
use crate::worker::Signal;
use crate::Error;

pub(crate) struct Reader {
    producer: Producer,
    storage: Arc<LogStorage>,
    /// Partition to open next; the open one (if any) is `next_partition - 1`.
    next_partition: PartitionNum,
    current: Option<File>,
    /// Read position within the current partition file.
    pos: u64,
}

impl Reader {
    pub(crate) fn new(producer: Producer, start_lsn: Lsn, storage: Arc<LogStorage>) -> Self {
        Reader {
            producer,
            storage,
            next_partition: start_lsn.hi(),
            current: None,
            pos: start_lsn.lo() as u64,
        }
    }

    /// One activation round: stream blocks until the published goal.
    pub(crate) fn run(&mut self, signal: &Signal) -> Result<()> {
        let local_end = signal.end_lsn();
        tracing::debug!(end = %local_end, "reader activated");

        match self.stream_until(signal, local_end) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Fail closed: the consumer must not wait forever on blocks
                // that will never arrive.
                self.producer.set_finished();
                Err(e)
            }
        }
    }

    fn stream_until(&mut self, signal: &Signal, local_end: Lsn) -> Result<()> {
        let block_size = self.producer.block_size();

        loop {
            let curr_partition = if self.current.is_none() {
                self.next_partition
            } else {
                self.next_partition - 1
            };
            if local_end.hi() == curr_partition && self.pos >= local_end.lo() as u64 {
                // Goal reached inside an already-read block. The next
                // activation starts exactly at the goal.
                self.pos = local_end.lo() as u64;
                tracing::debug!(pos = self.pos, "reader reached end LSN, sleeping");
                return Ok(());
            }

            if signal.should_exit() || self.producer.is_finished() {
                return Ok(());
            }
            if !self.producer.request() {
                return Ok(());
            }

            if self.current.is_none() && !self.open_partition(local_end)? {
                return Err(Error::UnexpectedEof(format!(
                    "partition {} empty with goal {local_end} ahead",
                    self.next_partition
                )));
            }

            // Read only the portion of the block not covered last round.
            let block_pos = (self.pos % block_size as u64) as usize;
            let file = self.current.as_ref().unwrap();
            let mut read =
                file.read_at(&mut self.producer.current()[block_pos..], self.pos)?;

            if read == 0 {
                // End of partition: advance to the next one and retry once.
                if !self.open_partition(local_end)? {
                    return Err(Error::UnexpectedEof(format!(
                        "partition {} empty with goal {local_end} ahead",
                        self.next_partition
                    )));
                }
                self.pos = 0;
                let file = self.current.as_ref().unwrap();
                read = file.read_at(self.producer.current(), 0)?;
                if read == 0 {
                    return Err(Error::UnexpectedEof(format!(
                        "no bytes before goal {local_end} in partition {}",
                        self.next_partition - 1
                    )));
                }
            }

            self.pos += read as u64;
            self.producer.release();
        }
    }

    /// Opens the next partition for reading. Returns false if the file is
    /// empty.
    fn open_partition(&mut self, local_end: Lsn) -> Result<bool> {
        self.current = None;

        let path = self.storage.make_log_path(self.next_partition);
        let file = File::open(&path).map_err(|e| {
            Error::UnexpectedEof(format!(
                "cannot open partition {}: {e}",
                self.next_partition
            ))
        })?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(false);
        }

        // The goal must be persistent within its own partition.
        if local_end.hi() == self.next_partition && size < local_end.lo() as u64 {
            return Err(Error::UnexpectedEof(format!(
                "partition {} has {size} bytes, goal {local_end} beyond it",
                self.next_partition
            )));
        }

        tracing::debug!(partition = self.next_partition, size, "opened partition for read");
        self.current = Some(file);
        self.next_partition += 1;
        Ok(true)
    }
}
