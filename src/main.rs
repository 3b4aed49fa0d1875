use command_scheduler::{
    CommandBufferManager, FenceError, NativeFence, PRESENT_SUCCESS, PresentStatus, PresentTarget,
    Scheduler, SchedulerConfig, StateTracker, SubmitRequest, TimelineSemaphore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fence of a simulated GPU queue that signals at a fixed point in time.
struct SimulatedFence {
    signal_at: Instant,
}

impl NativeFence for SimulatedFence {
    fn wait(&self) -> Result<(), FenceError> {
        let now = Instant::now();
        if self.signal_at > now {
            std::thread::sleep(self.signal_at - now);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RenderPassState {
    in_render_pass: bool,
}

impl StateTracker for RenderPassState {
    fn end_render_pass(&mut self) {
        self.in_render_pass = false;
    }
}

/// Command buffer manager backed by a fake GPU that takes `gpu_time` per
/// submission.
struct SimulatedDevice {
    state: RenderPassState,
    gpu_time: Duration,
    gpu_idle_at: Instant,
    draws: u64,
    submissions: u64,
    present_status: Arc<PresentStatus>,
}

impl SimulatedDevice {
    fn new(gpu_time: Duration) -> Self {
        SimulatedDevice {
            state: RenderPassState::default(),
            gpu_time,
            gpu_idle_at: Instant::now(),
            draws: 0,
            submissions: 0,
            present_status: Arc::new(PresentStatus::new()),
        }
    }

    fn draw(&mut self, vertices: u32) {
        self.state.in_render_pass = true;
        self.draws += 1;
        std::hint::black_box(vertices);
    }
}

impl CommandBufferManager for SimulatedDevice {
    type Fence = SimulatedFence;
    type StateTracker = RenderPassState;

    fn state_tracker(&mut self) -> &mut RenderPassState {
        &mut self.state
    }

    fn submit_command_buffer(
        &mut self,
        request: SubmitRequest,
        timeline: &TimelineSemaphore<SimulatedFence>,
    ) {
        // Submissions execute back to back on the simulated queue.
        self.gpu_idle_at = self.gpu_idle_at.max(Instant::now()) + self.gpu_time;
        self.submissions += 1;
        timeline.push_pending_fence_value(
            SimulatedFence {
                signal_at: self.gpu_idle_at,
            },
            request.fence_counter,
        );
        if request.present.is_some() {
            self.present_status.record_present(PRESENT_SUCCESS);
        }
    }

    fn present_status(&self) -> Arc<PresentStatus> {
        Arc::clone(&self.present_status)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("command-scheduler - Asynchronous GPU Command Submission\n");

    // COMMAND_SCHEDULER_TRACE=<path> writes a chrome://tracing profile.
    let trace_path = std::env::var_os("COMMAND_SCHEDULER_TRACE");
    command_scheduler::tracing::set_enabled(trace_path.is_some());

    let frames = 8u64;
    let draws_per_frame = 1_000u32;
    let device = SimulatedDevice::new(Duration::from_millis(4));
    let mut scheduler = match Scheduler::new(device, SchedulerConfig::default()) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            eprintln!("Failed to start scheduler: {err}");
            std::process::exit(1);
        }
    };

    // Example 1: frames in flight, waiting only on the frame two behind.
    println!("Example 1: Pipelined frames");
    let start = Instant::now();
    let mut frame_fences = Vec::new();
    for frame in 0..frames {
        if frame >= 2 {
            scheduler.wait_for_fence_counter(frame_fences[(frame - 2) as usize]);
        }
        for i in 0..draws_per_frame {
            scheduler.record(move |device: &mut SimulatedDevice| device.draw(3 + i % 64));
        }
        let fence = scheduler.submit_command_buffer(
            true,
            false,
            Some(PresentTarget {
                swapchain: 1,
                image_index: (frame % 3) as u32,
            }),
        );
        frame_fences.push(fence);
        scheduler.allow_sleep();
    }
    let recorded = start.elapsed();
    if let Some(&last) = frame_fences.last() {
        scheduler.wait_for_fence_counter(last);
    }
    println!(
        "  Recorded {} frames in {:?}, GPU finished after {:?}",
        frames,
        recorded,
        start.elapsed()
    );
    println!(
        "  Completed fence counter: {} (next: {})",
        scheduler.completed_fence_counter(),
        scheduler.current_fence_counter()
    );
    println!(
        "  Last present done: {}, failed: {}\n",
        scheduler.check_last_present_done(),
        scheduler.check_last_present_fail()
    );

    // Example 2: a blocking submission.
    println!("Example 2: Synchronous submission");
    let start = Instant::now();
    scheduler.record(|device: &mut SimulatedDevice| device.draw(36));
    let fence = scheduler.submit_command_buffer(false, true, None);
    println!(
        "  Fence {} complete after {:?}\n",
        fence,
        start.elapsed()
    );

    let (draws, submissions, in_render_pass) = scheduler.with_sink(|device| {
        (device.draws, device.submissions, device.state.in_render_pass)
    });
    println!("  Draws executed: {draws}, submissions: {submissions}");
    println!("  Render pass open after submit: {in_render_pass}\n");

    println!("Shutting down scheduler...");
    match scheduler.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {e}"),
    }
    // Background threads hand over their spans when they exit.
    drop(scheduler);

    if let Some(path) = trace_path {
        command_scheduler::tracing::collect_local_trace();
        match command_scheduler::tracing::export_to_file(&path) {
            Ok(()) => println!("Trace written to {}", path.to_string_lossy()),
            Err(e) => eprintln!("Failed to write trace: {e}"),
        }
    }
}
