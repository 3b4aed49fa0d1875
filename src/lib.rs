//! # command-scheduler - Asynchronous GPU Command Submission
//!
//! A command recording and submission scheduler for renderers built on
//! explicit graphics APIs. The render thread records closures against a
//! command buffer manager without ever waiting on the GPU; a dedicated worker
//! thread replays them and submits command buffers, and fence counters tell
//! the renderer when resources used by earlier work may be reused.
//!
//! ## Architecture
//!
//! - **Command chunks**: fixed-size arenas holding type-erased closures in
//!   record order, recycled through a pool so steady-state recording never
//!   allocates
//! - **Scheduler**: owns the current chunk, flushes full chunks to the
//!   worker's FIFO and exposes submit / wait operations
//! - **Blocking loop**: the wake/sleep state machine driving background
//!   threads, busy-polling briefly after work before parking
//! - **Timeline semaphore**: hands out monotonically increasing fence
//!   counters and publishes their completion from a fence waiter thread
//!
//! ## Example
//!
//! ```no_run
//! use command_scheduler::{Scheduler, SchedulerConfig};
//! # use command_scheduler::{CommandBufferManager, NativeFence, StateTracker};
//! # use command_scheduler::{FenceError, PresentStatus, SubmitRequest, TimelineSemaphore};
//! # use std::sync::Arc;
//! # struct Fence;
//! # impl NativeFence for Fence { fn wait(&self) -> Result<(), FenceError> { Ok(()) } }
//! # struct Tracker;
//! # impl StateTracker for Tracker { fn end_render_pass(&mut self) {} }
//! # struct Device { tracker: Tracker, draws: u32 }
//! # impl CommandBufferManager for Device {
//! #     type Fence = Fence;
//! #     type StateTracker = Tracker;
//! #     fn state_tracker(&mut self) -> &mut Tracker { &mut self.tracker }
//! #     fn submit_command_buffer(&mut self, request: SubmitRequest, timeline: &TimelineSemaphore<Fence>) {
//! #         timeline.push_pending_fence_value(Fence, request.fence_counter);
//! #     }
//! #     fn present_status(&self) -> Arc<PresentStatus> { Arc::new(PresentStatus::new()) }
//! # }
//! # let device = Device { tracker: Tracker, draws: 0 };
//!
//! let mut scheduler = Scheduler::new(device, SchedulerConfig::default()).unwrap();
//!
//! scheduler.record(|device| device.draws += 1);
//! let fence = scheduler.submit_command_buffer(false, false, None);
//!
//! // Resources used by the draw above are free once the fence completes.
//! scheduler.wait_for_fence_counter(fence);
//! scheduler.shutdown().unwrap();
//! ```

pub mod allocator;
pub mod blocking_loop;
pub mod chunk;
pub mod command;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod sink;
mod sync;
pub mod tracing;
mod worker;

use serde::{Deserialize, Serialize};

/// Core pinning for the submission worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Pin the worker to the logical processor with this index.
    Core(usize),
}

pub use blocking_loop::{BlockingLoop, StopMode};
pub use chunk::{CommandChunk, DEFAULT_CHUNK_CAPACITY};
pub use counter::TimelineSemaphore;
pub use error::{FenceError, SchedulerError};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sink::{
    CommandBufferManager, NativeFence, PRESENT_SUCCESS, PresentStatus, PresentTarget,
    StateTracker, SubmitRequest,
};
