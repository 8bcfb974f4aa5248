use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::models::{ExecutionResult, ExecutionStatus};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    jobs_submitted_total: AtomicU64,
    jobs_completed_total: AtomicU64,
    jobs_failed_total: AtomicU64,
    cleanup_failures_total: AtomicU64,
    runs_total: AtomicU64,
    runs_timed_out_total: AtomicU64,
    runs_memory_exceeded_total: AtomicU64,
    boxes_acquired_total: AtomicU64,
    boxes_released_total: AtomicU64,
    pool_waits_total: AtomicU64,
    pool_waiting: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cleanup_failed(&self) {
        self.cleanup_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, result: &ExecutionResult) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        match result.status {
            ExecutionStatus::TimedOut => {
                self.runs_timed_out_total.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionStatus::MemoryExceeded => {
                self.runs_memory_exceeded_total.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionStatus::Ok | ExecutionStatus::RuntimeError => {}
        }
    }

    pub fn box_acquired(&self) {
        self.boxes_acquired_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn box_released(&self) {
        self.boxes_released_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiter_enqueued(&self) {
        self.pool_waits_total.fetch_add(1, Ordering::Relaxed);
        self.pool_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiter_dequeued(&self) {
        let mut current = self.pool_waiting.load(Ordering::Relaxed);
        while current > 0 {
            match self.pool_waiting.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn boxes_acquired(&self) -> u64 {
        self.boxes_acquired_total.load(Ordering::Relaxed)
    }

    pub fn boxes_released(&self) -> u64 {
        self.boxes_released_total.load(Ordering::Relaxed)
    }

    pub fn pool_waits(&self) -> u64 {
        self.pool_waits_total.load(Ordering::Relaxed)
    }

    pub fn pool_waiting(&self) -> u64 {
        self.pool_waiting.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE jobbox_jobs_submitted_total counter\n",
                "jobbox_jobs_submitted_total {}\n",
                "# TYPE jobbox_jobs_completed_total counter\n",
                "jobbox_jobs_completed_total {}\n",
                "# TYPE jobbox_jobs_failed_total counter\n",
                "jobbox_jobs_failed_total {}\n",
                "# TYPE jobbox_cleanup_failures_total counter\n",
                "jobbox_cleanup_failures_total {}\n",
                "# TYPE jobbox_runs_total counter\n",
                "jobbox_runs_total {}\n",
                "# TYPE jobbox_runs_timed_out_total counter\n",
                "jobbox_runs_timed_out_total {}\n",
                "# TYPE jobbox_runs_memory_exceeded_total counter\n",
                "jobbox_runs_memory_exceeded_total {}\n",
                "# TYPE jobbox_boxes_acquired_total counter\n",
                "jobbox_boxes_acquired_total {}\n",
                "# TYPE jobbox_boxes_released_total counter\n",
                "jobbox_boxes_released_total {}\n",
                "# TYPE jobbox_pool_waits_total counter\n",
                "jobbox_pool_waits_total {}\n",
                "# TYPE jobbox_pool_waiting gauge\n",
                "jobbox_pool_waiting {}\n"
            ),
            self.jobs_submitted_total.load(Ordering::Relaxed),
            self.jobs_completed_total.load(Ordering::Relaxed),
            self.jobs_failed_total.load(Ordering::Relaxed),
            self.cleanup_failures_total.load(Ordering::Relaxed),
            self.runs_total.load(Ordering::Relaxed),
            self.runs_timed_out_total.load(Ordering::Relaxed),
            self.runs_memory_exceeded_total.load(Ordering::Relaxed),
            self.boxes_acquired_total.load(Ordering::Relaxed),
            self.boxes_released_total.load(Ordering::Relaxed),
            self.pool_waits_total.load(Ordering::Relaxed),
            self.pool_waiting.load(Ordering::Relaxed),
        )
    }
}
