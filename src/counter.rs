//! Fence counters for tracking GPU completion.
//!
//! Every submission is identified by a monotonically increasing 64-bit fence
//! counter. The [`TimelineSemaphore`] hands out new counters to the producer
//! and owns a background thread that waits on native fences in submission
//! order, publishing the highest counter known to be finished so any thread
//! can block until a given counter has completed.

use crate::blocking_loop::{BlockingLoop, StopMode};
use crate::error::SchedulerError;
use crate::sink::NativeFence;
use crate::tracing::{CollectorGuard, TraceGuard};
use crate::sync::lock;
use crossbeam::utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct FenceShared<F> {
    next_fence_counter: CachePadded<AtomicU64>,
    completed_fence_counter: CachePadded<AtomicU64>,
    pending: Mutex<VecDeque<(F, u64)>>,
    /// Guards completion publication; holds the failure message once a
    /// native wait has failed.
    fence_lock: Mutex<Option<String>>,
    fence_condvar: Condvar,
    fence_loop: BlockingLoop,
}

/// Source of fence counters with asynchronous completion tracking.
pub struct TimelineSemaphore<F: NativeFence> {
    shared: Arc<FenceShared<F>>,
    thread: Option<JoinHandle<()>>,
}

impl<F: NativeFence> TimelineSemaphore<F> {
    /// Creates the semaphore and starts its fence waiter thread.
    pub fn new() -> Result<Self, SchedulerError> {
        let shared = Arc::new(FenceShared {
            next_fence_counter: CachePadded::new(AtomicU64::new(1)),
            completed_fence_counter: CachePadded::new(AtomicU64::new(0)),
            pending: Mutex::new(VecDeque::new()),
            fence_lock: Mutex::new(None),
            fence_condvar: Condvar::new(),
            fence_loop: BlockingLoop::new(),
        });

        shared.fence_loop.prepare();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("fence-waiter".into())
            .spawn(move || {
                let _collector = CollectorGuard;
                log::debug!("fence waiter thread started");
                // No busy window: fences complete at frame rate at best.
                thread_shared
                    .fence_loop
                    .run(|| thread_shared.wait_pending_fences(), Duration::ZERO);
                log::debug!("fence waiter thread exiting");
            })
            .map_err(|source| SchedulerError::ThreadSpawn {
                name: "fence-waiter",
                source,
            })?;

        Ok(TimelineSemaphore {
            shared,
            thread: Some(thread),
        })
    }

    /// Reserves the next fence counter and returns it.
    pub fn bump_next_fence_counter(&self) -> u64 {
        self.shared.next_fence_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// The counter the next submission will be assigned.
    pub fn current_fence_counter(&self) -> u64 {
        self.shared.next_fence_counter.load(Ordering::Acquire)
    }

    /// Highest counter whose submission is known to have finished.
    pub fn completed_fence_counter(&self) -> u64 {
        self.shared.completed_fence_counter.load(Ordering::Acquire)
    }

    /// Queues `fence`; once it signals, every counter up to `fence_counter`
    /// is complete.
    pub fn push_pending_fence_value(&self, fence: F, fence_counter: u64) {
        lock(&self.shared.pending).push_back((fence, fence_counter));
        self.shared.fence_loop.wakeup();
    }

    /// Blocks until `fence_counter` has completed.
    ///
    /// # Panics
    ///
    /// Panics if a native fence wait failed before the counter completed.
    pub fn wait_for_fence_counter(&self, fence_counter: u64) {
        if self.completed_fence_counter() >= fence_counter {
            return;
        }

        let mut failure = lock(&self.shared.fence_lock);
        loop {
            if self.completed_fence_counter() >= fence_counter {
                return;
            }
            if let Some(message) = failure.as_ref() {
                panic!("waiting for fence counter {fence_counter} failed: {message}");
            }
            failure = match self.shared.fence_condvar.wait(failure) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Number of fences submitted but not yet observed as signalled.
    pub fn pending_fences(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}

impl<F: NativeFence> FenceShared<F> {
    fn wait_pending_fences(&self) {
        while !self.fence_loop.is_stopped() {
            let Some((fence, fence_counter)) = lock(&self.pending).pop_front() else {
                return;
            };

            let result = {
                let _trace = TraceGuard::new("fence_wait");
                fence.wait()
            };

            match result {
                Ok(()) => {
                    {
                        let _guard = lock(&self.fence_lock);
                        self.completed_fence_counter
                            .fetch_max(fence_counter, Ordering::AcqRel);
                    }
                    self.fence_condvar.notify_all();
                    log::trace!("fence counter {fence_counter} completed");
                }
                Err(err) => {
                    log::error!("waiting on fence for counter {fence_counter} failed: {err}");
                    *lock(&self.fence_lock) = Some(err.to_string());
                    self.fence_condvar.notify_all();
                    self.fence_loop.stop(StopMode::NonBlock);
                    return;
                }
            }
        }
    }
}

impl<F: NativeFence> Drop for TimelineSemaphore<F> {
    fn drop(&mut self) {
        self.shared.fence_loop.stop(StopMode::Block);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("fence waiter thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FenceError;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Fence that signals when the test sends on its channel.
    struct ManualFence(Mutex<mpsc::Receiver<Result<(), FenceError>>>);

    impl NativeFence for ManualFence {
        fn wait(&self) -> Result<(), FenceError> {
            self.0
                .lock()
                .unwrap()
                .recv()
                .unwrap_or(Err(FenceError::DeviceLost))
        }
    }

    fn manual_fence() -> (ManualFence, mpsc::Sender<Result<(), FenceError>>) {
        let (tx, rx) = mpsc::channel();
        (ManualFence(Mutex::new(rx)), tx)
    }

    #[test]
    fn test_counters_start_at_one() {
        let timeline = TimelineSemaphore::<ManualFence>::new().unwrap();
        assert_eq!(timeline.current_fence_counter(), 1);
        assert_eq!(timeline.completed_fence_counter(), 0);

        assert_eq!(timeline.bump_next_fence_counter(), 1);
        assert_eq!(timeline.bump_next_fence_counter(), 2);
        assert_eq!(timeline.current_fence_counter(), 3);
    }

    #[test]
    fn test_wait_on_completed_counter_returns_immediately() {
        let timeline = TimelineSemaphore::<ManualFence>::new().unwrap();
        let start = Instant::now();
        timeline.wait_for_fence_counter(0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_completion_published_in_order() {
        let timeline = TimelineSemaphore::new().unwrap();
        let first = timeline.bump_next_fence_counter();
        let second = timeline.bump_next_fence_counter();
        let (fence_a, signal_a) = manual_fence();
        let (fence_b, signal_b) = manual_fence();
        timeline.push_pending_fence_value(fence_a, first);
        timeline.push_pending_fence_value(fence_b, second);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(timeline.completed_fence_counter(), 0);

        signal_a.send(Ok(())).unwrap();
        timeline.wait_for_fence_counter(first);
        assert!(timeline.completed_fence_counter() >= first);
        assert!(timeline.completed_fence_counter() < second);

        signal_b.send(Ok(())).unwrap();
        timeline.wait_for_fence_counter(second);
        assert_eq!(timeline.completed_fence_counter(), second);
        assert!(timeline.completed_fence_counter() <= timeline.current_fence_counter());
    }

    #[test]
    fn test_wait_blocks_until_signalled() {
        let timeline = Arc::new(TimelineSemaphore::new().unwrap());
        let counter = timeline.bump_next_fence_counter();
        let (fence, signal) = manual_fence();
        timeline.push_pending_fence_value(fence, counter);

        let signalled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waiter = {
            let timeline = timeline.clone();
            let signalled = signalled.clone();
            thread::spawn(move || {
                timeline.wait_for_fence_counter(counter);
                assert!(signalled.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(20));
        signalled.store(true, Ordering::SeqCst);
        signal.send(Ok(())).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_failed_fence_is_fatal_to_waiters() {
        let timeline = TimelineSemaphore::new().unwrap();
        let counter = timeline.bump_next_fence_counter();
        let (fence, signal) = manual_fence();
        timeline.push_pending_fence_value(fence, counter);
        signal.send(Err(FenceError::DeviceLost)).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            timeline.wait_for_fence_counter(counter);
        }));
        assert!(result.is_err());
        assert_eq!(timeline.completed_fence_counter(), 0);
    }
}
