//! Wake-driven loop for background threads.
//!
//! A `BlockingLoop` runs a payload on a dedicated thread whenever another
//! thread signals new work with [`BlockingLoop::wakeup`]. After a burst of
//! work it keeps polling for a short window so back-to-back submissions do not
//! pay the thread wake latency, then parks on a condition variable until the
//! next wakeup. Other threads can block in [`BlockingLoop::wait`] until all
//! work signalled so far has been processed.

use crate::sync::lock;
use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Busy-poll window used when the owner does not configure one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// Grace period used by [`StopMode::BlockAndGiveUp`] unless overridden.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

// Ordered so that each payload call moves the state down by one.
const STATE_NEED_EXECUTION: i32 = 3;
const STATE_LAST_EXECUTION: i32 = 2;
const STATE_DONE: i32 = 1;
const STATE_SLEEPING: i32 = 0;

/// How [`BlockingLoop::stop`] waits for the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Request the stop and return immediately.
    NonBlock,
    /// Request the stop and wait until the loop has exited.
    Block,
    /// Like `Block`, but give up after the grace period and mark the loop
    /// stopped anyway.
    BlockAndGiveUp,
}

/// A payload loop that sleeps when idle and is woken on demand.
pub struct BlockingLoop {
    state: CachePadded<AtomicI32>,
    stopped: AtomicBool,
    may_sleep: AtomicBool,
    prepare_lock: Mutex<()>,
    wait_lock: Mutex<()>,
    new_work: Mutex<()>,
    new_work_cv: Condvar,
    done: Mutex<()>,
    done_cv: Condvar,
    exited: Mutex<bool>,
    exited_cv: Condvar,
    grace_period: Duration,
}

impl BlockingLoop {
    /// Creates a stopped loop.
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_STOP_GRACE_PERIOD)
    }

    /// Creates a stopped loop with a custom [`StopMode::BlockAndGiveUp`] grace period.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        BlockingLoop {
            state: CachePadded::new(AtomicI32::new(STATE_DONE)),
            stopped: AtomicBool::new(true),
            may_sleep: AtomicBool::new(false),
            prepare_lock: Mutex::new(()),
            wait_lock: Mutex::new(()),
            new_work: Mutex::new(()),
            new_work_cv: Condvar::new(),
            done: Mutex::new(()),
            done_cv: Condvar::new(),
            exited: Mutex::new(true),
            exited_cv: Condvar::new(),
            grace_period,
        }
    }

    /// Arms the loop so wakeups and waits are tracked before `run` starts.
    ///
    /// Does nothing if the loop is already prepared or running.
    pub fn prepare(&self) {
        let _guard = lock(&self.prepare_lock);
        if !self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.state.store(STATE_LAST_EXECUTION, Ordering::SeqCst);
        self.may_sleep.store(false, Ordering::Relaxed);
        *lock(&self.exited) = false;
        self.stopped.store(false, Ordering::Release);
    }

    /// Runs `payload` on the calling thread until the loop is stopped.
    ///
    /// [`prepare`](Self::prepare) must have been called first; a loop that
    /// was stopped before `run` starts returns immediately. The payload must
    /// process all work visible to it each time it is called; it is re-run
    /// after every wakeup.
    pub fn run<F: FnMut()>(&self, mut payload: F, busy_timeout: Duration) {
        let _exit = ExitGuard { owner: self };

        let backoff = Backoff::new();
        let mut last_work = Instant::now();

        while !self.stopped.load(Ordering::Acquire) {
            payload();

            match self.state.fetch_sub(1, Ordering::AcqRel) {
                STATE_NEED_EXECUTION => {
                    // Run once more to pick up work queued during this pass.
                    last_work = Instant::now();
                    backoff.reset();
                }
                STATE_LAST_EXECUTION => {
                    let _guard = lock(&self.done);
                    self.done_cv.notify_all();
                }
                STATE_DONE => {
                    let sleep = self.may_sleep.load(Ordering::Acquire)
                        || last_work.elapsed() >= busy_timeout;
                    if sleep {
                        self.may_sleep.store(false, Ordering::Release);
                        self.sleep();
                        last_work = Instant::now();
                        backoff.reset();
                    } else {
                        // Still inside the busy window. If a wakeup raced in
                        // the state is already NeedExecution and stays so.
                        let _ = self.state.compare_exchange(
                            STATE_SLEEPING,
                            STATE_DONE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        backoff.snooze();
                    }
                }
                state => {
                    log::error!("BlockingLoop observed invalid state {state}");
                    self.state.store(STATE_LAST_EXECUTION, Ordering::SeqCst);
                }
            }
        }
    }

    fn sleep(&self) {
        let mut guard = lock(&self.new_work);
        while self.state.load(Ordering::Acquire) == STATE_SLEEPING
            && !self.stopped.load(Ordering::Acquire)
        {
            guard = match self.new_work_cv.wait(guard) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Signals that new work is available. Never blocks on the loop thread.
    pub fn wakeup(&self) {
        if self.state.swap(STATE_NEED_EXECUTION, Ordering::AcqRel) == STATE_SLEEPING {
            let _guard = lock(&self.new_work);
            self.new_work_cv.notify_one();
        }
    }

    /// Blocks until every wakeup issued before this call has been followed
    /// by a complete payload run. Returns immediately if the loop is stopped.
    pub fn wait(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let _serial = lock(&self.wait_lock);
        let mut guard = lock(&self.done);
        while !self.stopped.load(Ordering::Acquire)
            && self.state.load(Ordering::Acquire) > STATE_DONE
        {
            guard = match self.done_cv.wait(guard) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        drop(guard);

        // Whoever waited has nothing more queued right now.
        self.may_sleep.store(true, Ordering::Release);
    }

    /// Lets the loop leave its busy-poll window and sleep once idle.
    pub fn allow_sleep(&self) {
        self.may_sleep.store(true, Ordering::Release);
    }

    /// Requests the loop to stop.
    ///
    /// Returns false only if `BlockAndGiveUp` hit its grace period before the
    /// loop thread exited.
    pub fn stop(&self, mode: StopMode) -> bool {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify_stopped();
        }

        match mode {
            StopMode::NonBlock => true,
            StopMode::Block => {
                let mut exited = lock(&self.exited);
                while !*exited {
                    exited = match self.exited_cv.wait(exited) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                true
            }
            StopMode::BlockAndGiveUp => {
                let Some(deadline) = Instant::now().checked_add(self.grace_period) else {
                    return self.stop(StopMode::Block);
                };
                let mut exited = lock(&self.exited);
                while !*exited {
                    let now = Instant::now();
                    if now >= deadline {
                        log::warn!(
                            "BlockingLoop did not exit within {:?}, giving up",
                            self.grace_period
                        );
                        *exited = true;
                        return false;
                    }
                    exited = match self.exited_cv.wait_timeout(exited, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                true
            }
        }
    }

    fn notify_stopped(&self) {
        {
            let _guard = lock(&self.new_work);
            self.new_work_cv.notify_all();
        }
        let _guard = lock(&self.done);
        self.done_cv.notify_all();
    }

    /// Returns true if the loop is not prepared or has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns true if the loop is parked waiting for a wakeup.
    pub fn is_sleeping(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SLEEPING
    }
}

impl Default for BlockingLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the loop stopped and exited when `run` returns or unwinds.
struct ExitGuard<'a> {
    owner: &'a BlockingLoop,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let owner = self.owner;
        if !owner.stopped.swap(true, Ordering::AcqRel) {
            owner.notify_stopped();
        }
        *lock(&owner.exited) = true;
        owner.exited_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn spawn_counting_loop(
        blocking_loop: &Arc<BlockingLoop>,
        busy_timeout: Duration,
    ) -> (Arc<AtomicUsize>, thread::JoinHandle<()>) {
        let runs = Arc::new(AtomicUsize::new(0));
        blocking_loop.prepare();
        let handle = {
            let blocking_loop = blocking_loop.clone();
            let runs = runs.clone();
            thread::spawn(move || {
                blocking_loop.run(
                    || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    },
                    busy_timeout,
                );
            })
        };
        (runs, handle)
    }

    #[test]
    fn test_new_loop_is_stopped() {
        let blocking_loop = BlockingLoop::new();
        assert!(blocking_loop.is_stopped());
        // Waiting on a stopped loop returns immediately.
        blocking_loop.wait();
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let blocking_loop = BlockingLoop::new();
        blocking_loop.prepare();
        blocking_loop.wakeup();
        blocking_loop.prepare();
        assert!(!blocking_loop.is_stopped());
        assert_eq!(blocking_loop.state.load(Ordering::SeqCst), STATE_NEED_EXECUTION);
        blocking_loop.stop(StopMode::NonBlock);
    }

    #[test]
    fn test_wait_observes_payload_run() {
        let blocking_loop = Arc::new(BlockingLoop::new());
        let (runs, handle) = spawn_counting_loop(&blocking_loop, Duration::ZERO);

        blocking_loop.wait();
        let before = runs.load(Ordering::SeqCst);
        blocking_loop.wakeup();
        blocking_loop.wait();
        assert!(runs.load(Ordering::SeqCst) > before);

        assert!(blocking_loop.stop(StopMode::Block));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleeps_when_idle_and_wakes() {
        let blocking_loop = Arc::new(BlockingLoop::new());
        let (runs, handle) = spawn_counting_loop(&blocking_loop, Duration::ZERO);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !blocking_loop.is_sleeping() {
            assert!(Instant::now() < deadline, "loop never went to sleep");
            thread::sleep(Duration::from_millis(1));
        }

        let before = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), before, "sleeping loop kept running");

        blocking_loop.wakeup();
        blocking_loop.wait();
        assert!(runs.load(Ordering::SeqCst) > before);

        assert!(blocking_loop.stop(StopMode::Block));
        handle.join().unwrap();
    }

    #[test]
    fn test_allow_sleep_ends_busy_window() {
        let blocking_loop = Arc::new(BlockingLoop::new());
        let (_runs, handle) = spawn_counting_loop(&blocking_loop, Duration::from_secs(60));

        blocking_loop.allow_sleep();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !blocking_loop.is_sleeping() {
            assert!(Instant::now() < deadline, "allow_sleep was ignored");
            blocking_loop.allow_sleep();
            thread::sleep(Duration::from_millis(1));
        }

        assert!(blocking_loop.stop(StopMode::Block));
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_wakes_sleeping_loop() {
        let blocking_loop = Arc::new(BlockingLoop::new());
        let (_runs, handle) = spawn_counting_loop(&blocking_loop, Duration::ZERO);
        blocking_loop.wait();

        assert!(blocking_loop.stop(StopMode::Block));
        assert!(blocking_loop.is_stopped());
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_grace_period_waits_for_exit() {
        let blocking_loop = Arc::new(BlockingLoop::with_grace_period(Duration::MAX));
        let (_runs, handle) = spawn_counting_loop(&blocking_loop, Duration::ZERO);
        blocking_loop.wait();

        assert!(blocking_loop.stop(StopMode::BlockAndGiveUp));
        handle.join().unwrap();
    }

    #[test]
    fn test_block_and_give_up_times_out() {
        let blocking_loop = BlockingLoop::with_grace_period(Duration::from_millis(20));
        // Prepared but never run: nothing will ever mark it exited.
        blocking_loop.prepare();

        let start = Instant::now();
        assert!(!blocking_loop.stop(StopMode::BlockAndGiveUp));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(blocking_loop.is_stopped());
    }

    #[test]
    fn test_loop_can_restart_after_stop() {
        let blocking_loop = Arc::new(BlockingLoop::new());
        let (_, first) = spawn_counting_loop(&blocking_loop, Duration::ZERO);
        assert!(blocking_loop.stop(StopMode::Block));
        first.join().unwrap();

        let (runs, second) = spawn_counting_loop(&blocking_loop, Duration::ZERO);
        blocking_loop.wakeup();
        blocking_loop.wait();
        assert!(runs.load(Ordering::SeqCst) > 0);
        assert!(blocking_loop.stop(StopMode::Block));
        second.join().unwrap();
    }
}
