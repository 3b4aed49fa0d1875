//! Shared command buffer manager doubles for the integration tests.

#![allow(dead_code)]

use command_scheduler::{
    CommandBufferManager, FenceError, NativeFence, PresentStatus, StateTracker, SubmitRequest,
    TimelineSemaphore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fence that signals after a fixed delay from its creation.
pub struct DelayedFence {
    signal_at: Instant,
    result: Result<(), FenceError>,
}

impl NativeFence for DelayedFence {
    fn wait(&self) -> Result<(), FenceError> {
        let now = Instant::now();
        if self.signal_at > now {
            std::thread::sleep(self.signal_at - now);
        }
        self.result.clone()
    }
}

pub struct NullTracker;

impl StateTracker for NullTracker {
    fn end_render_pass(&mut self) {}
}

/// Log entry written when a submission executes.
pub fn submit_marker(fence_counter: u64) -> u64 {
    u64::MAX - fence_counter
}

/// Appends every executed command id to `log`, and a [`submit_marker`] per
/// submission; fences take `gpu_time`.
pub struct TestDevice {
    pub log: Vec<u64>,
    pub submitted: Vec<u64>,
    pub gpu_time: Duration,
    pub fail_fences: bool,
    tracker: NullTracker,
    present_status: Arc<PresentStatus>,
}

impl TestDevice {
    pub fn new() -> Self {
        Self::with_gpu_time(Duration::ZERO)
    }

    pub fn with_gpu_time(gpu_time: Duration) -> Self {
        TestDevice {
            log: Vec::new(),
            submitted: Vec::new(),
            gpu_time,
            fail_fences: false,
            tracker: NullTracker,
            present_status: Arc::new(PresentStatus::new()),
        }
    }
}

impl CommandBufferManager for TestDevice {
    type Fence = DelayedFence;
    type StateTracker = NullTracker;

    fn state_tracker(&mut self) -> &mut NullTracker {
        &mut self.tracker
    }

    fn submit_command_buffer(
        &mut self,
        request: SubmitRequest,
        timeline: &TimelineSemaphore<DelayedFence>,
    ) {
        self.submitted.push(request.fence_counter);
        self.log.push(submit_marker(request.fence_counter));
        let result = if self.fail_fences {
            Err(FenceError::DeviceLost)
        } else {
            Ok(())
        };
        timeline.push_pending_fence_value(
            DelayedFence {
                signal_at: Instant::now() + self.gpu_time,
                result,
            },
            request.fence_counter,
        );
    }

    fn present_status(&self) -> Arc<PresentStatus> {
        Arc::clone(&self.present_status)
    }
}
