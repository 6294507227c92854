//! Bounded single-producer/single-consumer ring of IO blocks.
//!
//! The buffer hands out whole blocks by reference, in two stages on each
//! side: `request` blocks until a slot is available and exposes it, `release`
//! hands it to the other side. No bytes are copied through the buffer.
//!
//! Cursor/parity bookkeeping distinguishes full from empty when the cursors
//! coincide: the buffer is full iff the cursors are equal and the parities
//! differ, and empty iff they are equal and the parities match. Waits use a
//! timed condition variable with a bounded re-check interval, so a
//! `set_finished` raced against a waiting side is observed promptly. After
//! `finished` is set the producer refuses requests immediately; the consumer
//! drains the remaining blocks, then refuses.
//!
//! The single-producer/single-consumer discipline is an ownership fact here:
//! [`ring_buffer`] returns one [`Producer`] and one [`Consumer`] handle, and
//! slot access goes through `&mut self` methods on them.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Bounded re-check interval for waits, so a late `set_finished` cannot
/// strand a waiting side.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// The block arena, cache-line aligned. Raw pointers keep producer and
/// consumer slot accesses from ever forming a reference to the whole
/// buffer.
struct BlockArena {
    data: *mut u8,
    layout: Layout,
}

impl BlockArena {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 64).unwrap();
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "ring buffer allocation failed");
        BlockArena { data, layout }
    }
}

impl Drop for BlockArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

struct Cursors {
    begin: usize,
    end: usize,
    bparity: bool,
    eparity: bool,
}

impl Cursors {
    fn is_full(&self) -> bool {
        self.begin == self.end && self.bparity != self.eparity
    }

    fn is_empty(&self) -> bool {
        self.begin == self.end && self.bparity == self.eparity
    }
}

struct Shared {
    buf: BlockArena,
    block_size: usize,
    block_count: usize,
    cursors: Mutex<Cursors>,
    cond: Condvar,
    finished: AtomicBool,
}

// SAFETY: the producer only touches the slot at `end` between its request and
// release, the consumer only the slot at `begin`; the cursor protocol keeps
// those disjoint, and cursor updates synchronize through the mutex.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn advance(&self, pos: &mut usize, parity: &mut bool) {
        *pos = (*pos + 1) % self.block_count;
        if *pos == 0 {
            *parity = !*parity;
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
        let _guard = self.cursors.lock().unwrap();
        self.cond.notify_all();
    }
}

/// Creates a ring of `block_count` blocks of `block_size` bytes each.
pub fn ring_buffer(block_size: usize, block_count: usize) -> (Producer, Consumer) {
    assert!(block_size > 0 && block_count > 0);
    let shared = Arc::new(Shared {
        buf: BlockArena::new(block_size * block_count),
        block_size,
        block_count,
        cursors: Mutex::new(Cursors { begin: 0, end: 0, bparity: true, eparity: true }),
        cond: Condvar::new(),
        finished: AtomicBool::new(false),
    });
    (Producer { shared: shared.clone(), owned: false }, Consumer { shared, owned: false })
}

/// Producer side of the ring. Fill the slot returned by
/// [`Producer::request`], then [`Producer::release`] it to the consumer.
pub struct Producer {
    shared: Arc<Shared>,
    /// Whether this side currently owns the slot at `end`.
    owned: bool,
}

impl Producer {
    /// Blocks until a free slot exists or the buffer is finished. Returns
    /// whether a slot was acquired; on `false` the buffer is finished.
    pub fn request(&mut self) -> bool {
        assert!(!self.owned, "producer requested twice without release");
        let mut cursors = self.shared.cursors.lock().unwrap();
        while cursors.is_full() && !self.shared.is_finished() {
            let (guard, _) = self.shared.cond.wait_timeout(cursors, WAIT_INTERVAL).unwrap();
            cursors = guard;
        }
        if self.shared.is_finished() {
            return false;
        }
        self.owned = true;
        true
    }

    /// The slot acquired by the last [`Producer::request`].
    pub fn current(&mut self) -> &mut [u8] {
        assert!(self.owned, "producer has no slot");
        let end = self.shared.cursors.lock().unwrap().end;
        // SAFETY: this side owns the slot at `end` until release; see Shared.
        unsafe {
            let base = self.shared.buf.data.add(end * self.shared.block_size);
            std::slice::from_raw_parts_mut(base, self.shared.block_size)
        }
    }

    /// Hands the filled slot to the consumer.
    pub fn release(&mut self) {
        assert!(self.owned, "producer released without request");
        self.owned = false;
        let mut cursors = self.shared.cursors.lock().unwrap();
        let was_empty = cursors.is_empty();
        let (mut end, mut eparity) = (cursors.end, cursors.eparity);
        self.shared.advance(&mut end, &mut eparity);
        cursors.end = end;
        cursors.eparity = eparity;
        if was_empty {
            self.shared.cond.notify_one();
        }
    }

    pub fn set_finished(&self) {
        self.shared.set_finished();
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }
}

/// Consumer side of the ring.
pub struct Consumer {
    shared: Arc<Shared>,
    owned: bool,
}

impl Consumer {
    /// Blocks until a filled slot exists, or the buffer is finished *and*
    /// empty. Returns whether a slot was acquired.
    pub fn request(&mut self) -> bool {
        assert!(!self.owned, "consumer requested twice without release");
        let mut cursors = self.shared.cursors.lock().unwrap();
        while cursors.is_empty() && !self.shared.is_finished() {
            let (guard, _) = self.shared.cond.wait_timeout(cursors, WAIT_INTERVAL).unwrap();
            cursors = guard;
        }
        // The consumer drains remaining blocks before refusing.
        if self.shared.is_finished() && cursors.is_empty() {
            return false;
        }
        self.owned = true;
        true
    }

    /// The slot acquired by the last [`Consumer::request`].
    pub fn current(&self) -> &[u8] {
        assert!(self.owned, "consumer has no slot");
        let begin = self.shared.cursors.lock().unwrap().begin;
        // SAFETY: this side owns the slot at `begin` until release; see Shared.
        unsafe {
            let base = self.shared.buf.data.add(begin * self.shared.block_size);
            std::slice::from_raw_parts(base, self.shared.block_size)
        }
    }

    pub fn has_block(&self) -> bool {
        self.owned
    }

    /// Returns the consumed slot to the producer.
    pub fn release(&mut self) {
        assert!(self.owned, "consumer released without request");
        self.owned = false;
        let mut cursors = self.shared.cursors.lock().unwrap();
        let was_full = cursors.is_full();
        let (mut begin, mut bparity) = (cursors.begin, cursors.bparity);
        self.shared.advance(&mut begin, &mut bparity);
        cursors.begin = begin;
        cursors.bparity = bparity;
        if was_full {
            self.shared.cond.notify_one();
        }
    }

    pub fn set_finished(&self) {
        self.shared.set_finished();
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_block_round_trip() {
        let (mut producer, mut consumer) = ring_buffer(64, 4);

        assert!(producer.request());
        producer.current()[..5].copy_from_slice(b"hello");
        producer.release();

        assert!(consumer.request());
        assert_eq!(&consumer.current()[..5], b"hello");
        consumer.release();
    }

    #[test]
    fn test_fifo_order_across_threads() {
        let (mut producer, mut consumer) = ring_buffer(8, 3);
        const BLOCKS: usize = 100;

        let handle = thread::spawn(move || {
            for i in 0..BLOCKS {
                assert!(producer.request());
                producer.current().fill(i as u8);
                producer.release();
            }
            producer.set_finished();
        });

        let mut seen = 0usize;
        while consumer.request() {
            assert!(consumer.current().iter().all(|&b| b == seen as u8));
            consumer.release();
            seen += 1;
        }
        assert_eq!(seen, BLOCKS);
        handle.join().unwrap();
    }

    #[test]
    fn test_producer_blocks_when_full() {
        let (mut producer, mut consumer) = ring_buffer(4, 2);

        for _ in 0..2 {
            assert!(producer.request());
            producer.release();
        }

        // Buffer is full; the producer must wait until the consumer releases.
        let handle = thread::spawn(move || {
            assert!(producer.request());
            producer.release();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(consumer.request());
        consumer.release();
        handle.join().unwrap();
    }

    #[test]
    fn test_finished_producer_refuses() {
        let (mut producer, _consumer) = ring_buffer(4, 2);
        producer.set_finished();
        assert!(!producer.request());
    }

    #[test]
    fn test_finished_consumer_drains_then_refuses() {
        let (mut producer, mut consumer) = ring_buffer(4, 2);

        assert!(producer.request());
        producer.current().fill(7);
        producer.release();
        producer.set_finished();

        // One block was in flight: it must still be delivered.
        assert!(consumer.request());
        assert!(consumer.current().iter().all(|&b| b == 7));
        consumer.release();
        assert!(!consumer.request());
    }

    #[test]
    fn test_late_finish_wakes_waiting_consumer() {
        let (producer, mut consumer) = ring_buffer(4, 2);

        let handle = thread::spawn(move || consumer.request());
        thread::sleep(Duration::from_millis(20));
        producer.set_finished();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_slots_not_reused_before_release() {
        // With a single slot, the producer can only advance once the
        // consumer has released the previous block.
        let (mut producer, mut consumer) = ring_buffer(4, 1);

        assert!(producer.request());
        producer.current().fill(1);
        producer.release();

        let handle = thread::spawn(move || {
            assert!(producer.request());
            producer.current().fill(2);
            producer.release();
            producer.set_finished();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(consumer.request());
        assert!(consumer.current().iter().all(|&b| b == 1));
        consumer.release();

        assert!(consumer.request());
        assert!(consumer.current().iter().all(|&b| b == 2));
        consumer.release();
        handle.join().unwrap();
    }
}
