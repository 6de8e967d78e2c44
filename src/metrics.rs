// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn print_summary(&self) {
        tracing::info!(
            active_conns = self.active_conns.load(Ordering::Relaxed),
            total_requests = self.req_count.load(Ordering::Relaxed),
            bytes_sent = self.bytes_sent.load(Ordering::Relaxed),
            "metrics summary"
        );
    }
}

/// Spawn a detached thread that prints a metrics summary every 5 seconds,
/// for as long as the process runs. There is no shutdown flag to stop it
/// with, matching the rest of this crate's no-graceful-shutdown design.
pub fn spawn_metrics_printer(metrics: &'static WorkerMetrics) {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(5));
        metrics.print_summary();
    });
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
