//! Interfaces the scheduler consumes from the graphics backend.
//!
//! The scheduler never talks to a graphics API itself. Recorded commands run
//! against a [`CommandBufferManager`], which owns the native command buffers,
//! per-frame pools and fences, and reports completed submissions back through
//! the [`TimelineSemaphore`] it is handed.

use crate::counter::TimelineSemaphore;
use crate::error::FenceError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Raw result code of a successful present.
pub const PRESENT_SUCCESS: i32 = 0;

/// A native fence that can be waited on from the fence waiter thread.
pub trait NativeFence: Send + 'static {
    /// Blocks until the fence is signalled.
    fn wait(&self) -> Result<(), FenceError>;
}

/// Render-state bookkeeping owned by the command buffer manager.
pub trait StateTracker {
    /// Ends the active render pass, if any.
    fn end_render_pass(&mut self);
}

/// Swapchain image to present after a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTarget {
    /// Opaque native swapchain handle.
    pub swapchain: u64,
    pub image_index: u32,
}

/// Parameters of one command buffer submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Counter that becomes complete once this submission finishes on the GPU.
    pub fence_counter: u64,
    pub submit_on_worker_thread: bool,
    pub wait_for_completion: bool,
    pub present: Option<PresentTarget>,
}

/// The object recorded commands operate on.
///
/// Implementations must register one fence per submission with
/// [`TimelineSemaphore::push_pending_fence_value`], using
/// [`SubmitRequest::fence_counter`], in submission order.
pub trait CommandBufferManager: Send + 'static {
    type Fence: NativeFence;
    type StateTracker: StateTracker;

    fn state_tracker(&mut self) -> &mut Self::StateTracker;

    /// Submits the current command buffer and begins a new one.
    fn submit_command_buffer(
        &mut self,
        request: SubmitRequest,
        timeline: &TimelineSemaphore<Self::Fence>,
    );

    /// Shared present flags, readable without going through the worker.
    fn present_status(&self) -> Arc<PresentStatus>;
}

/// Present results relayed from the command buffer manager to the renderer.
///
/// The manager records each present; the renderer polls after submitting
/// and decides whether to recreate the swapchain.
#[derive(Debug)]
pub struct PresentStatus {
    failed: AtomicBool,
    done: AtomicBool,
    result: AtomicI32,
}

impl PresentStatus {
    pub fn new() -> Self {
        PresentStatus {
            failed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            result: AtomicI32::new(PRESENT_SUCCESS),
        }
    }

    /// Records the outcome of a present.
    pub fn record_present(&self, result: i32) {
        self.result.store(result, Ordering::Release);
        if result != PRESENT_SUCCESS {
            log::warn!("present failed with code {result}");
            self.failed.store(true, Ordering::Release);
        }
        self.done.store(true, Ordering::Release);
    }

    /// Returns true once per failed present.
    pub fn check_last_present_fail(&self) -> bool {
        self.failed.swap(false, Ordering::AcqRel)
    }

    /// Result code of the most recent present.
    pub fn last_present_result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    /// Returns true once per completed present.
    pub fn check_last_present_done(&self) -> bool {
        self.done.swap(false, Ordering::AcqRel)
    }
}

impl Default for PresentStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_flags_clear_on_read() {
        let status = PresentStatus::new();
        assert!(!status.check_last_present_done());
        assert!(!status.check_last_present_fail());

        status.record_present(PRESENT_SUCCESS);
        assert!(status.check_last_present_done());
        assert!(!status.check_last_present_done());
        assert!(!status.check_last_present_fail());
    }

    #[test]
    fn test_failed_present_keeps_result() {
        let status = PresentStatus::new();
        status.record_present(-1000001004);

        assert!(status.check_last_present_fail());
        assert!(!status.check_last_present_fail());
        assert_eq!(status.last_present_result(), -1000001004);
        assert!(status.check_last_present_done());

        status.record_present(PRESENT_SUCCESS);
        assert_eq!(status.last_present_result(), PRESENT_SUCCESS);
        assert!(!status.check_last_present_fail());
    }
}
