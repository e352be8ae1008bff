use serde::Serialize;

/// Counters accumulated over executed items.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Stats {
    pub kernel_count: usize,
    pub global_ops: u64,
    pub global_mem: u64,
    /// Sum of waited execution times.
    pub time_sum_s: f64,
}

impl Stats {
    pub fn add(&mut self, other: &Stats) {
        self.kernel_count += other.kernel_count;
        self.global_ops += other.global_ops;
        self.global_mem += other.global_mem;
        self.time_sum_s += other.time_sum_s;
    }

    pub fn gflops(&self) -> f64 {
        if self.time_sum_s > 0.0 {
            self.global_ops as f64 / self.time_sum_s * 1e-9
        } else {
            0.0
        }
    }
}
