//! Short-duration reader/writer latch with conditional upgrade and
//! per-thread recursive acquisition.
//!
//! A latch is held in `SH` (shared) or `EX` (exclusive) mode. The same thread
//! may acquire a latch it already holds any number of times: recursion is
//! tracked in a thread-local holder list and never touches the underlying
//! lock word, so re-acquisition always succeeds. A thread holding `SH` that
//! requests `EX` gets a *conditional* upgrade: it succeeds only if the thread
//! is the sole reader and no writer is queued, and it never blocks (a
//! blocking self-upgrade would deadlock).
//!
//! The lock word encodes `2 * readers + writer_bit`:
//!
//! ```text
//! 0 (idle) --> R on reader arrival        R (k readers) --> R±1 arrive/depart
//! 0 (idle) --> W on writer acquire        R (k == 1)    --> W on upgrade
//! W        --> R on downgrade             W             --> 0 on release
//! ```
//!
//! Writers are preferred: arriving readers queue behind a waiting writer.
//!
//! [`Latched`] wraps a value with a latch and hands out RAII guards; it is
//! how the partition map and the archive index consume this primitive.

use std::cell::{RefCell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::Error;

/// Latch modes, in increasing order of privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LatchMode {
    /// Not held.
    Nl,
    /// Shared (read).
    Sh,
    /// Exclusive (write).
    Ex,
}

/// Result of an acquire call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireResult {
    Ok,
    /// Conditional acquisition (or self-upgrade) failed without blocking.
    WouldBlock,
    /// A bounded wait expired.
    Timeout,
}

/// How long an acquire may wait.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    /// Try once; never block.
    Immediate,
    /// Wait at most this long.
    For(Duration),
    /// Wait until acquired.
    Forever,
}

const WRITER: u32 = 1;

struct Core {
    /// `2 * readers + writer_bit`. The writer bit and reader counts are
    /// never set simultaneously.
    holders: u32,
    /// Writers queued for entry; arriving readers yield to them.
    writers_waiting: u32,
}

pub struct Latch {
    core: Mutex<Core>,
    cond: Condvar,
}

/// One entry in the thread-local holder list: which latch, in which mode,
/// how many times. Keyed by the latch address; the latch itself keeps no
/// back-pointer to its holders.
#[derive(Clone, Copy)]
struct Holder {
    latch: usize,
    mode: LatchMode,
    count: u32,
}

thread_local! {
    static HOLDERS: RefCell<Vec<Holder>> = const { RefCell::new(Vec::new()) };
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            core: Mutex::new(Core { holders: 0, writers_waiting: 0 }),
            cond: Condvar::new(),
        }
    }

    fn key(&self) -> usize {
        self as *const Latch as usize
    }

    fn with_holder<R>(&self, f: impl FnOnce(Option<&mut Holder>) -> R) -> R {
        let key = self.key();
        HOLDERS.with(|h| {
            let mut list = h.borrow_mut();
            let entry = list.iter_mut().find(|h| h.latch == key);
            f(entry)
        })
    }

    fn push_holder(&self, mode: LatchMode) {
        let holder = Holder { latch: self.key(), mode, count: 1 };
        HOLDERS.with(|h| h.borrow_mut().push(holder));
    }

    fn remove_holder(&self) {
        let key = self.key();
        HOLDERS.with(|h| h.borrow_mut().retain(|h| h.latch != key));
    }

    /// Acquires the latch in the given mode.
    ///
    /// If this thread already holds the latch, the request recurses: the
    /// per-thread count is incremented and the lock word is untouched. A
    /// thread holding `EX` recurses for any requested mode; a thread holding
    /// `SH` that requests `EX` attempts a non-blocking upgrade regardless of
    /// the timeout and reports `WouldBlock` on failure.
    pub fn acquire(&self, mode: LatchMode, timeout: Timeout) -> AcquireResult {
        assert!(mode != LatchMode::Nl, "cannot acquire in NL mode");

        enum Held {
            No,
            Recursed,
            Upgrade,
        }

        let held = self.with_holder(|holder| match holder {
            None => Held::No,
            Some(h) => {
                if h.mode == LatchMode::Ex || h.mode == mode {
                    // Later acquires by an exclusive holder default to EX.
                    h.count += 1;
                    Held::Recursed
                } else {
                    debug_assert!(h.mode == LatchMode::Sh && mode == LatchMode::Ex);
                    Held::Upgrade
                }
            }
        });

        match held {
            Held::Recursed => AcquireResult::Ok,
            Held::Upgrade => {
                if self.try_upgrade_word() {
                    self.with_holder(|holder| {
                        let h = holder.expect("holder vanished during upgrade");
                        h.mode = LatchMode::Ex;
                        h.count += 1;
                    });
                    AcquireResult::Ok
                } else {
                    AcquireResult::WouldBlock
                }
            }
            Held::No => {
                let result = match mode {
                    LatchMode::Sh => self.lock_shared(timeout),
                    LatchMode::Ex => self.lock_exclusive(timeout),
                    LatchMode::Nl => unreachable!(),
                };
                if result == AcquireResult::Ok {
                    self.push_holder(mode);
                }
                result
            }
        }
    }

    /// Releases one acquisition and returns the remaining per-thread count.
    /// The lock word is released only when the count reaches zero.
    pub fn release(&self) -> u32 {
        let (remaining, release_mode) = self.with_holder(|holder| {
            let h = holder.expect("released a latch this thread does not hold");
            assert!(h.count > 0);
            h.count -= 1;
            if h.count > 0 {
                (h.count, LatchMode::Nl)
            } else {
                (0, h.mode)
            }
        });

        match release_mode {
            LatchMode::Nl => remaining,
            mode => {
                self.remove_holder();
                let mut core = self.core.lock().unwrap();
                match mode {
                    LatchMode::Sh => {
                        debug_assert!(core.holders >= 2 && core.holders & WRITER == 0);
                        core.holders -= 2;
                    }
                    LatchMode::Ex => {
                        debug_assert!(core.holders == WRITER);
                        core.holders = 0;
                    }
                    LatchMode::Nl => unreachable!(),
                }
                if core.holders == 0 {
                    self.cond.notify_all();
                }
                0
            }
        }
    }

    /// Upgrades from `SH` to `EX` if that can be done without blocking.
    /// Returns whether the upgrade *would have blocked* (in which case it did
    /// not happen). Never changes the per-thread count.
    pub fn upgrade_if_not_block(&self) -> bool {
        let mode = self.with_holder(|holder| {
            holder.map(|h| h.mode).expect("upgrade on a latch this thread does not hold")
        });
        if mode == LatchMode::Ex {
            return false;
        }
        if self.try_upgrade_word() {
            self.with_holder(|holder| holder.unwrap().mode = LatchMode::Ex);
            false
        } else {
            true
        }
    }

    /// Atomically converts an `EX` hold into `SH`. The count is unchanged.
    pub fn downgrade(&self) {
        self.with_holder(|holder| {
            let h = holder.expect("downgrade on a latch this thread does not hold");
            assert!(h.mode == LatchMode::Ex, "downgrade requires EX");
            h.mode = LatchMode::Sh;
        });
        let mut core = self.core.lock().unwrap();
        debug_assert!(core.holders == WRITER);
        core.holders = 2;
        self.cond.notify_all();
    }

    /// Number of times this thread holds the latch; 0 if not held.
    pub fn held_by_me(&self) -> u32 {
        self.with_holder(|holder| holder.map_or(0, |h| h.count))
    }

    /// True iff this thread holds the latch in `EX` mode.
    pub fn is_mine(&self) -> bool {
        self.with_holder(|holder| holder.map_or(false, |h| h.mode == LatchMode::Ex))
    }

    /// Mode in which the latch is held by anyone. Best-effort: the value may
    /// be stale as soon as it is produced; only [`Latch::held_by_me`] and
    /// [`Latch::is_mine`] are authoritative.
    pub fn mode(&self) -> LatchMode {
        let core = self.core.lock().unwrap();
        if core.holders == WRITER {
            LatchMode::Ex
        } else if core.holders > 0 {
            LatchMode::Sh
        } else {
            LatchMode::Nl
        }
    }

    /// How many threads hold the latch. Best-effort, like [`Latch::mode`].
    pub fn num_holders(&self) -> usize {
        let core = self.core.lock().unwrap();
        if core.holders == WRITER {
            1
        } else {
            (core.holders / 2) as usize
        }
    }

    fn try_upgrade_word(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.holders == 2 && core.writers_waiting == 0 {
            core.holders = WRITER;
            true
        } else {
            false
        }
    }

    fn lock_shared(&self, timeout: Timeout) -> AcquireResult {
        let mut core = self.core.lock().unwrap();
        let can_enter = |c: &Core| c.holders & WRITER == 0 && c.writers_waiting == 0;

        if can_enter(&core) {
            core.holders += 2;
            return AcquireResult::Ok;
        }
        let deadline = match timeout {
            Timeout::Immediate => return AcquireResult::WouldBlock,
            Timeout::For(d) => Some(Instant::now() + d),
            Timeout::Forever => None,
        };
        while !can_enter(&core) {
            match self.wait(core, deadline) {
                Some(c) => core = c,
                None => return AcquireResult::Timeout,
            }
        }
        core.holders += 2;
        AcquireResult::Ok
    }

    fn lock_exclusive(&self, timeout: Timeout) -> AcquireResult {
        let mut core = self.core.lock().unwrap();
        if core.holders == 0 {
            core.holders = WRITER;
            return AcquireResult::Ok;
        }
        let deadline = match timeout {
            Timeout::Immediate => return AcquireResult::WouldBlock,
            Timeout::For(d) => Some(Instant::now() + d),
            Timeout::Forever => None,
        };
        core.writers_waiting += 1;
        while core.holders != 0 {
            match self.wait(core, deadline) {
                Some(c) => core = c,
                None => {
                    self.core.lock().unwrap().writers_waiting -= 1;
                    return AcquireResult::Timeout;
                }
            }
        }
        core.holders = WRITER;
        core.writers_waiting -= 1;
        AcquireResult::Ok
    }

    /// Waits on the condvar, bounded by the deadline. Returns the re-locked
    /// core, or `None` once the deadline has passed.
    fn wait<'a>(
        &'a self,
        core: std::sync::MutexGuard<'a, Core>,
        deadline: Option<Instant>,
    ) -> Option<std::sync::MutexGuard<'a, Core>> {
        match deadline {
            None => Some(self.cond.wait(core).unwrap()),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (core, _) = self.cond.wait_timeout(core, deadline - now).unwrap();
                Some(core)
            }
        }
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("mode", &self.mode())
            .field("num_holders", &self.num_holders())
            .finish()
    }
}

/// A value guarded by a [`Latch`], accessed through RAII guards.
///
/// Guards use the non-recursive subset of the latch: taking a second guard on
/// the same `Latched` from one thread is a usage error and panics, because an
/// upgrade or recursion under a live guard could alias `&T` with `&mut T`.
pub struct Latched<T> {
    latch: Latch,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` only happens through guards, which hold the latch
// in SH (shared references) or EX (the sole mutable reference) mode.
unsafe impl<T: Send> Send for Latched<T> {}
unsafe impl<T: Send + Sync> Sync for Latched<T> {}

impl<T> Latched<T> {
    pub fn new(value: T) -> Self {
        Latched { latch: Latch::new(), value: UnsafeCell::new(value) }
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Acquires SH and returns a shared guard.
    pub fn read(&self) -> SharedGuard<'_, T> {
        assert!(self.latch.held_by_me() == 0, "guard taken while latch already held");
        let result = self.latch.acquire(LatchMode::Sh, Timeout::Forever);
        assert!(result == AcquireResult::Ok);
        SharedGuard { owner: self }
    }

    /// Acquires EX and returns an exclusive guard.
    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        assert!(self.latch.held_by_me() == 0, "guard taken while latch already held");
        let result = self.latch.acquire(LatchMode::Ex, Timeout::Forever);
        assert!(result == AcquireResult::Ok);
        ExclusiveGuard { owner: self }
    }

    /// Conditional variant of [`Latched::write`]; never blocks.
    pub fn try_write(&self) -> Result<ExclusiveGuard<'_, T>> {
        assert!(self.latch.held_by_me() == 0, "guard taken while latch already held");
        match self.latch.acquire(LatchMode::Ex, Timeout::Immediate) {
            AcquireResult::Ok => Ok(ExclusiveGuard { owner: self }),
            _ => Err(Error::WouldBlock),
        }
    }
}

pub struct SharedGuard<'a, T> {
    owner: &'a Latched<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: SH is held, so no exclusive guard exists.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.latch.release();
    }
}

pub struct ExclusiveGuard<'a, T> {
    owner: &'a Latched<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: EX is held, so this is the only access.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: EX is held, so this is the only access.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.latch.release();
    }
}
