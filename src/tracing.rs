//! Chrome Tracing collector for submission and fence activity.
//!
//! Spans are recorded into thread-local buffers while tracing is enabled, so
//! the worker and fence threads never contend on a lock per event. Buffers
//! are handed to the global collector when a thread exits (see
//! [`CollectorGuard`]) and can be exported to a JSON file compatible with
//! chrome://tracing or ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A single trace event in Chrome Tracing format.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub tid: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static NEXT_TID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
    static TID: usize = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

/// Turns span recording on or off for all threads.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Records a span of work on the current thread.
pub fn record_event(name: &'static str, start: Instant, duration: Duration) {
    let start_us = (start.saturating_duration_since(*GLOBAL_START).as_micros() as u64)
        + *EPOCH_START_US;
    let duration_us = duration.as_micros() as u64;
    let tid = TID.with(|tid| *tid);

    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            tid,
            start_us,
            duration_us,
        });
    });
}

/// Moves the current thread's buffer into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local_buf = buf.borrow_mut();
        if !local_buf.is_empty() {
            let mut global = ALL_BUFFERS.lock().unwrap_or_else(|e| e.into_inner());
            global.push(std::mem::take(&mut *local_buf));
        }
    });
}

/// Returns the events collected so far, without clearing them.
pub fn collected_events() -> Vec<TraceEvent> {
    let global = ALL_BUFFERS.lock().unwrap_or_else(|e| e.into_inner());
    global.iter().flatten().cloned().collect()
}

/// Exports all collected trace events to a JSON file.
pub fn export_to_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let events = collected_events();

    writeln!(writer, "[")?;
    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            writeln!(writer, ",")?;
        }
        // ph: X is "Complete Event" (requires dur)
        write!(
            writer,
            "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
            event.name, event.start_us, event.duration_us, event.tid
        )?;
    }
    writeln!(writer, "\n]")?;
    writer.flush()?;

    Ok(())
}

/// RAII span; records nothing while tracing is disabled.
pub struct TraceGuard {
    name: &'static str,
    start: Option<Instant>,
}

impl TraceGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: is_enabled().then(Instant::now),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            record_event(self.name, start, start.elapsed());
        }
    }
}

/// RAII guard that collects the local trace when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_collected_from_thread() {
        set_enabled(true);
        std::thread::spawn(|| {
            let _collector = CollectorGuard;
            let _span = TraceGuard::new("unit_test_span");
        })
        .join()
        .unwrap();

        assert!(
            collected_events()
                .iter()
                .any(|event| event.name == "unit_test_span")
        );
    }

    #[test]
    fn test_export_writes_json_array() {
        set_enabled(true);
        {
            let _span = TraceGuard::new("export_span");
        }
        collect_local_trace();

        let path = std::env::temp_dir().join(format!(
            "command-scheduler-trace-{}.json",
            std::process::id()
        ));
        export_to_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(contents.trim_start().starts_with('['));
        assert!(contents.trim_end().ends_with(']'));
        assert!(contents.contains("\"name\":\"export_span\""));
    }
}
