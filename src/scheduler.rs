//! Command recording and submission scheduler.
//!
//! The [`Scheduler`] is the renderer-facing entry point. The render thread
//! records closures against the command buffer manager; they accumulate in
//! the current chunk and are handed to the submission worker on flush, where
//! they run in record order. Fence counters let the renderer find out when
//! the GPU has finished with everything recorded before a submission.

use crate::PinningStrategy;
use crate::blocking_loop::{DEFAULT_BUSY_TIMEOUT, DEFAULT_STOP_GRACE_PERIOD, StopMode};
use crate::chunk::CommandChunk;
use crate::counter::TimelineSemaphore;
use crate::error::SchedulerError;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsSnapshot;
use crate::sink::{CommandBufferManager, PresentStatus, PresentTarget, StateTracker, SubmitRequest};
use crate::sync::lock;
use crate::worker::{SubmissionQueue, Worker};
use serde::{Deserialize, Serialize};
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`Scheduler`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Replay commands on a dedicated worker thread. When false, every
    /// recorded command runs immediately on the recording thread.
    pub use_worker_thread: bool,
    /// How long the worker keeps polling after its last work before
    /// sleeping. Default: 100ms.
    pub busy_poll_timeout_ms: u64,
    /// How long shutdown waits for the worker to exit. Default: 1s.
    pub stop_grace_period_ms: u64,
    /// Chunks allocated up front into the recycle pool. Default: 4.
    pub initial_chunk_reserve: usize,
    /// Core pinning for the worker thread.
    pub pinning: PinningStrategy,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            use_worker_thread: true,
            busy_poll_timeout_ms: duration_to_ms(DEFAULT_BUSY_TIMEOUT),
            stop_grace_period_ms: duration_to_ms(DEFAULT_STOP_GRACE_PERIOD),
            initial_chunk_reserve: 4,
            pinning: PinningStrategy::None,
            thread_name: "submission-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_thread(mut self, use_worker_thread: bool) -> Self {
        self.use_worker_thread = use_worker_thread;
        self
    }

    pub fn with_busy_poll_timeout(mut self, timeout: Duration) -> Self {
        self.busy_poll_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_stop_grace_period(mut self, grace_period: Duration) -> Self {
        self.stop_grace_period_ms = duration_to_ms(grace_period);
        self
    }

    pub fn with_pinning(mut self, pinning: PinningStrategy) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn busy_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_poll_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Records commands on the render thread and submits them asynchronously.
///
/// Exactly one thread records into a scheduler. Commands execute in the
/// order they were recorded, each exactly once.
///
/// # Example
///
/// ```ignore
/// use command_scheduler::{Scheduler, SchedulerConfig};
///
/// let mut scheduler = Scheduler::new(command_buffer_manager, SchedulerConfig::default())?;
/// scheduler.record(|mgr| mgr.draw(3));
/// let fence = scheduler.submit_command_buffer(false, false, None);
/// scheduler.wait_for_fence_counter(fence);
/// ```
pub struct Scheduler<S: CommandBufferManager> {
    chunk: CommandChunk<S>,
    queue: Arc<SubmissionQueue<S>>,
    timeline: Arc<TimelineSemaphore<S::Fence>>,
    present_status: Arc<PresentStatus>,
    worker: Option<Worker>,
    config: SchedulerConfig,
    is_shut_down: bool,
}

impl<S: CommandBufferManager> Scheduler<S> {
    /// Creates a scheduler driving `sink`, starting the fence waiter and,
    /// if configured, the submission worker.
    pub fn new(sink: S, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let present_status = sink.present_status();
        let timeline = Arc::new(TimelineSemaphore::new()?);
        let queue = Arc::new(SubmissionQueue::new(sink, config.stop_grace_period()));

        lock(&queue.reserve).extend((0..config.initial_chunk_reserve).map(|_| CommandChunk::new()));

        let worker = if config.use_worker_thread {
            Some(Worker::spawn(
                Arc::clone(&queue),
                config.thread_name.clone(),
                config.pinning,
                config.busy_poll_timeout(),
            )?)
        } else {
            None
        };

        log::debug!(
            "scheduler created (worker thread: {}, reserve: {} chunks)",
            config.use_worker_thread,
            config.initial_chunk_reserve
        );

        Ok(Scheduler {
            chunk: CommandChunk::new(),
            queue,
            timeline,
            present_status,
            worker,
            config,
            is_shut_down: false,
        })
    }

    /// Creates a scheduler with the default configuration.
    pub fn with_default_config(sink: S) -> Result<Self, SchedulerError> {
        Self::new(sink, SchedulerConfig::default())
    }

    /// Records `command` to run against the command buffer manager.
    ///
    /// Without a worker thread the command runs immediately. Otherwise it is
    /// appended to the current chunk, flushing first if the chunk is full.
    ///
    /// # Panics
    ///
    /// Panics if called after [`shutdown`](Self::shutdown).
    pub fn record<F>(&mut self, command: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        assert!(!self.is_shut_down, "command recorded after scheduler shutdown");

        if self.worker.is_none() {
            let mut sink = lock(&self.queue.sink);
            command(&mut *sink);
            return;
        }

        #[cfg(feature = "metrics")]
        self.queue
            .metrics
            .commands_recorded
            .fetch_add(1, Ordering::Relaxed);

        let Err(command) = self.chunk.record(command) else {
            return;
        };

        #[cfg(feature = "metrics")]
        self.queue
            .metrics
            .chunk_overflows
            .fetch_add(1, Ordering::Relaxed);

        self.flush();
        if self.chunk.record(command).is_err() {
            panic!("recorded command does not fit in an empty command chunk");
        }
    }

    /// Hands the current chunk to the worker and starts a new one.
    pub fn flush(&mut self) {
        if self.chunk.is_empty() {
            return;
        }

        let replacement = self.acquire_new_chunk();
        let chunk = std::mem::replace(&mut self.chunk, replacement);
        log::trace!("flushing chunk with {} commands", chunk.len());

        lock(&self.queue.pending).push_back(chunk);
        self.queue.submit_loop.wakeup();

        #[cfg(feature = "metrics")]
        self.queue
            .metrics
            .chunks_flushed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn acquire_new_chunk(&self) -> CommandChunk<S> {
        if let Some(chunk) = lock(&self.queue.reserve).pop() {
            return chunk;
        }

        #[cfg(feature = "metrics")]
        self.queue
            .metrics
            .chunks_allocated
            .fetch_add(1, Ordering::Relaxed);

        log::debug!("command chunk pool exhausted, allocating a new chunk");
        CommandChunk::new()
    }

    /// Flushes and blocks until the worker has executed everything recorded
    /// so far. Does not wait for the GPU.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread died executing a command.
    pub fn sync_worker(&mut self) {
        if self.worker.is_none() {
            return;
        }

        self.flush();
        self.queue.submit_loop.wait();

        if self.queue.has_panicked() {
            panic!("submission worker thread panicked while executing a command");
        }
    }

    /// Lets the worker sleep as soon as it runs out of work instead of
    /// polling. Typically called once per frame.
    pub fn allow_sleep(&self) {
        self.queue.submit_loop.allow_sleep();
    }

    /// Ends the render pass and submits the current command buffer.
    ///
    /// Returns the fence counter that completes with this submission. When
    /// `wait_for_completion` is set this blocks until the GPU has finished
    /// it; otherwise the work is flushed to the worker without blocking.
    pub fn submit_command_buffer(
        &mut self,
        submit_on_worker_thread: bool,
        wait_for_completion: bool,
        present: Option<PresentTarget>,
    ) -> u64 {
        let fence_counter = self.timeline.bump_next_fence_counter();
        let timeline = Arc::clone(&self.timeline);

        self.record(move |sink: &mut S| {
            sink.state_tracker().end_render_pass();
            sink.submit_command_buffer(
                SubmitRequest {
                    fence_counter,
                    submit_on_worker_thread,
                    wait_for_completion,
                    present,
                },
                &timeline,
            );
        });

        if wait_for_completion {
            self.wait_for_fence_counter(fence_counter);
        } else {
            self.flush();
        }

        fence_counter
    }

    /// Blocks until the GPU has finished the submission that produced
    /// `fence_counter`.
    pub fn wait_for_fence_counter(&mut self, fence_counter: u64) {
        if self.timeline.completed_fence_counter() >= fence_counter {
            return;
        }

        #[cfg(feature = "metrics")]
        self.queue
            .metrics
            .fence_waits_blocked
            .fetch_add(1, Ordering::Relaxed);

        // The submission carrying this counter may still be sitting in a chunk.
        self.sync_worker();
        self.timeline.wait_for_fence_counter(fence_counter);
    }

    /// Highest fence counter known to be complete.
    pub fn completed_fence_counter(&self) -> u64 {
        self.timeline.completed_fence_counter()
    }

    /// Fence counter the next submission will receive.
    pub fn current_fence_counter(&self) -> u64 {
        self.timeline.current_fence_counter()
    }

    /// Returns true once per failed present.
    pub fn check_last_present_fail(&self) -> bool {
        self.present_status.check_last_present_fail()
    }

    /// Result code of the most recent present.
    pub fn last_present_result(&self) -> i32 {
        self.present_status.last_present_result()
    }

    /// Returns true once per completed present.
    pub fn check_last_present_done(&self) -> bool {
        self.present_status.check_last_present_done()
    }

    /// Runs `f` with exclusive access to the command buffer manager.
    ///
    /// Commands still queued for the worker are not reflected; call
    /// [`sync_worker`](Self::sync_worker) first for a consistent view.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut sink = lock(&self.queue.sink);
        f(&mut *sink)
    }

    /// The fence counter source shared with the command buffer manager.
    pub fn timeline(&self) -> &Arc<TimelineSemaphore<S::Fence>> {
        &self.timeline
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns true if commands are replayed on a worker thread.
    pub fn uses_worker_thread(&self) -> bool {
        self.worker.is_some()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.queue.metrics.snapshot()
    }

    /// Executes everything recorded so far and stops the worker thread.
    ///
    /// Safe to call more than once; later calls do nothing. Dropping the
    /// scheduler shuts it down as well.
    pub fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if self.is_shut_down {
            return Ok(());
        }
        self.is_shut_down = true;

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        if !self.queue.has_panicked() {
            self.flush();
            self.queue.submit_loop.wait();
        }

        if !self.queue.submit_loop.stop(StopMode::BlockAndGiveUp) {
            // The worker is unresponsive; leave the thread detached.
            drop(worker);
            return Err(SchedulerError::ShutdownTimedOut(
                self.config.stop_grace_period(),
            ));
        }

        if worker.join().is_err() || self.queue.has_panicked() {
            return Err(SchedulerError::WorkerPanicked);
        }

        log::debug!("scheduler shut down");
        Ok(())
    }
}

impl<S: CommandBufferManager> Drop for Scheduler<S> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("scheduler shutdown failed: {err}");
        }
    }
}
