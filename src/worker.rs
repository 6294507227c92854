//! Background worker threads with a wakeup/round protocol.
//!
//! A worker sleeps until woken (or on a periodic interval), runs one round of
//! its body, publishes the round count, and goes back to sleep. `stop()`
//! requests exit, wakes the thread, and joins it; the body observes the
//! request through [`Signal::should_exit`] and is expected to re-check it
//! every iteration so cancellation lands within one block cycle.
//!
//! LSN-driven workers (the log reader) receive their goal through an atomic
//! slot updated by [`WorkerThread::wakeup_until_lsn`], which only ever moves
//! the goal forward.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::lsn::Lsn;

struct State {
    wakeup_requested: bool,
    busy: bool,
    rounds: u64,
}

/// Shared coordination state between a worker thread and its controllers.
pub struct Signal {
    state: Mutex<State>,
    wakeup: Condvar,
    done: Condvar,
    stop: AtomicBool,
    goal: AtomicU64,
}

impl Signal {
    fn new() -> Self {
        Signal {
            state: Mutex::new(State { wakeup_requested: false, busy: false, rounds: 0 }),
            wakeup: Condvar::new(),
            done: Condvar::new(),
            stop: AtomicBool::new(false),
            goal: AtomicU64::new(Lsn::NULL.to_raw()),
        }
    }

    /// Whether the worker was asked to stop. Work bodies re-check this every
    /// iteration.
    pub fn should_exit(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Current end-LSN goal for LSN-driven workers.
    pub fn end_lsn(&self) -> Lsn {
        Lsn::from_raw(self.goal.load(Ordering::Acquire))
    }

    pub fn rounds_completed(&self) -> u64 {
        self.state.lock().unwrap().rounds
    }

    /// Blocks until the given round number has completed. `round == 0` waits
    /// for one round past the current one.
    pub fn wait_for_round(&self, round: u64) {
        let mut state = self.state.lock().unwrap();
        let target = if round == 0 { state.rounds + 1 } else { round };
        while !self.should_exit() && state.rounds < target {
            state = self.done.wait(state).unwrap();
        }
    }

    fn send_wakeup(&self) {
        let mut state = self.state.lock().unwrap();
        state.wakeup_requested = true;
        self.wakeup.notify_one();
    }
}

/// Handle to a spawned worker. Stops and joins the thread on drop.
pub struct WorkerThread {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns a worker running `body` once per activation. With an interval,
    /// the body also runs periodically without an explicit wakeup.
    pub fn spawn<F>(name: &str, interval: Option<Duration>, mut body: F) -> WorkerThread
    where
        F: FnMut(&Signal) -> Result<()> + Send + 'static,
    {
        let signal = Arc::new(Signal::new());
        let thread_signal = signal.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let signal = thread_signal;
                loop {
                    {
                        let mut state = signal.state.lock().unwrap();
                        while !state.wakeup_requested && !signal.should_exit() {
                            state = match interval {
                                None => signal.wakeup.wait(state).unwrap(),
                                Some(timeout) => {
                                    let (new_state, result) =
                                        signal.wakeup.wait_timeout(state, timeout).unwrap();
                                    if result.timed_out() {
                                        state = new_state;
                                        break;
                                    }
                                    new_state
                                }
                            };
                        }
                        if signal.should_exit() {
                            break;
                        }
                        state.wakeup_requested = false;
                        state.busy = true;
                    }

                    if let Err(e) = body(&signal) {
                        tracing::error!(worker = %thread_name, error = %e, "worker round failed");
                    }

                    let mut state = signal.state.lock().unwrap();
                    state.rounds += 1;
                    state.busy = false;
                    signal.done.notify_all();
                }
                let mut state = signal.state.lock().unwrap();
                state.busy = false;
                signal.done.notify_all();
            })
            .expect("failed to spawn worker thread");

        WorkerThread { signal, handle: Some(handle) }
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    /// Wakes the worker for one round.
    pub fn wakeup(&self) {
        self.signal.send_wakeup();
    }

    /// Publishes a new end-LSN goal and wakes the worker. The goal only
    /// moves forward; a lower LSN leaves the current goal in place.
    pub fn wakeup_until_lsn(&self, lsn: Lsn) {
        let mut curr = self.signal.goal.load(Ordering::Acquire);
        while lsn.to_raw() > curr {
            match self.signal.goal.compare_exchange(
                curr,
                lsn.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => curr = actual,
            }
        }
        self.signal.send_wakeup();
    }

    /// Requests the worker to stop on its next iteration and joins it.
    pub fn stop(&mut self) {
        self.signal.stop.store(true, Ordering::Release);
        self.signal.send_wakeup();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                tracing::error!("worker thread panicked: {e:?}");
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_wakeup_runs_one_round() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let worker = WorkerThread::spawn("test-worker", None, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        worker.wakeup();
        worker.signal().wait_for_round(1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        worker.wakeup();
        worker.signal().wait_for_round(2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interval_runs_without_wakeup() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let _worker =
            WorkerThread::spawn("ticker", Some(Duration::from_millis(5)), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        thread::sleep(Duration::from_millis(60));
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let mut worker = WorkerThread::spawn("sleeper", None, |_| Ok(()));
        let start = std::time::Instant::now();
        worker.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        // A second stop is a no-op.
        worker.stop();
    }

    #[test]
    fn test_goal_is_monotonic() {
        let worker = WorkerThread::spawn("goal", None, |_| Ok(()));
        worker.wakeup_until_lsn(Lsn::new(2, 100));
        assert_eq!(worker.signal().end_lsn(), Lsn::new(2, 100));
        // Lower goals do not rewind.
        worker.wakeup_until_lsn(Lsn::new(1, 500));
        assert_eq!(worker.signal().end_lsn(), Lsn::new(2, 100));
        worker.wakeup_until_lsn(Lsn::new(2, 200));
        assert_eq!(worker.signal().end_lsn(), Lsn::new(2, 200));
    }

    #[test]
    fn test_body_observes_stop() {
        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        let mut worker = WorkerThread::spawn("loopy", None, move |signal| {
            while !signal.should_exit() {
                o.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        worker.wakeup();
        thread::sleep(Duration::from_millis(10));
        worker.stop();
        assert!(observed.load(Ordering::SeqCst) > 0);
    }
}
