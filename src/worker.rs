//! Submission worker thread.
//!
//! The worker owns the consumer side of the scheduler: it drains flushed
//! chunks in FIFO order, replays each one against the command buffer manager
//! and hands the emptied chunk back to the recycle pool. It sleeps on the
//! submission [`BlockingLoop`] whenever the queue stays empty.

use crate::PinningStrategy;
use crate::blocking_loop::{BlockingLoop, StopMode};
use crate::chunk::CommandChunk;
use crate::error::SchedulerError;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::sink::CommandBufferManager;
use crate::sync::lock;
use crate::tracing::{CollectorGuard, TraceGuard};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering as MetricsOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between the producer and the submission worker.
pub(crate) struct SubmissionQueue<S> {
    pub(crate) sink: Mutex<S>,
    pub(crate) pending: Mutex<VecDeque<CommandChunk<S>>>,
    pub(crate) reserve: Mutex<Vec<CommandChunk<S>>>,
    pub(crate) submit_loop: BlockingLoop,
    pub(crate) panicked: AtomicBool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl<S: CommandBufferManager> SubmissionQueue<S> {
    pub(crate) fn new(sink: S, grace_period: Duration) -> Self {
        SubmissionQueue {
            sink: Mutex::new(sink),
            pending: Mutex::new(VecDeque::new()),
            reserve: Mutex::new(Vec::new()),
            submit_loop: BlockingLoop::with_grace_period(grace_period),
            panicked: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    /// Executes every pending chunk. Payload of the submission loop.
    fn drain(&self) {
        loop {
            let Some(mut chunk) = lock(&self.pending).pop_front() else {
                return;
            };

            {
                let _trace = TraceGuard::new("execute_chunk");
                let mut sink = lock(&self.sink);
                chunk.execute_all(&mut *sink);
            }

            #[cfg(feature = "metrics")]
            self.metrics
                .chunks_executed
                .fetch_add(1, MetricsOrdering::Relaxed);

            lock(&self.reserve).push(chunk);
        }
    }

    pub(crate) fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }
}

/// Handle to the running submission worker thread.
pub(crate) struct Worker {
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Prepares the submission loop and starts the worker thread.
    pub(crate) fn spawn<S: CommandBufferManager>(
        queue: Arc<SubmissionQueue<S>>,
        name: String,
        pinning: PinningStrategy,
        busy_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        // Prepared here so wakeups and waits issued before the thread is
        // scheduled are not lost.
        queue.submit_loop.prepare();

        let thread_queue = Arc::clone(&queue);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            pin_current_thread(pinning);
            Worker::run_loop(&thread_queue, busy_timeout);
        });

        match spawned {
            Ok(handle) => Ok(Worker {
                handle: Some(handle),
            }),
            Err(source) => {
                queue.submit_loop.stop(StopMode::NonBlock);
                Err(SchedulerError::ThreadSpawn {
                    name: "submission worker",
                    source,
                })
            }
        }
    }

    fn run_loop<S: CommandBufferManager>(queue: &SubmissionQueue<S>, busy_timeout: Duration) {
        let _collector = CollectorGuard;
        log::debug!("submission worker started");

        queue.submit_loop.run(
            || {
                let result = catch_unwind(AssertUnwindSafe(|| queue.drain()));
                if let Err(panic_payload) = result {
                    let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        *s
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.as_str()
                    } else {
                        "unknown panic"
                    };
                    log::error!("submission worker panicked: {msg}");
                    // Published before the stop so waiters released by it
                    // observe the failure.
                    queue.panicked.store(true, Ordering::Release);
                    queue.submit_loop.stop(StopMode::NonBlock);
                }
            },
            busy_timeout,
        );

        log::debug!("submission worker exiting");
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn pin_current_thread(pinning: PinningStrategy) {
    let PinningStrategy::Core(index) = pinning else {
        return;
    };
    match core_affinity::get_core_ids() {
        Some(core_ids) if index < core_ids.len() => {
            if !core_affinity::set_for_current(core_ids[index]) {
                log::warn!("failed to pin submission worker to core {index}");
            }
        }
        _ => log::warn!("core {index} is not available for pinning"),
    }
}
