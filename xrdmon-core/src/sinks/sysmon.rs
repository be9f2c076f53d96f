//! Host and process metrics for collector self-monitoring
//!
//! Provides:
//! - CPU usage and load averages of the host
//! - Memory usage of the host
//! - CPU, memory and run time of monitored daemon processes

use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::debug;

/// Host metrics published under the `<group>_xrootd_SysInfo` cluster
#[derive(Debug, Clone, Serialize)]
pub struct HostMetrics {
    pub uptime_seconds: u64,
    pub cpu_percent: f32,
    pub cpu_count: usize,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total_mb: u64,
    pub mem_used_mb: u64,
    pub mem_percent: f32,
    pub swap_total_mb: u64,
    pub swap_used_mb: u64,
}

impl HostMetrics {
    /// Collect host metrics, refreshing `sys` as needed
    pub fn collect(sys: &mut System) -> Self {
        debug!("collecting host metrics");
        sys.refresh_cpu();
        sys.refresh_memory();

        let load = System::load_average();
        let total = sys.total_memory();
        let used = sys.used_memory();
        let mem_percent = if total > 0 {
            (used as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        Self {
            uptime_seconds: System::uptime(),
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            cpu_count: sys.cpus().len(),
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
            mem_total_mb: total / (1024 * 1024),
            mem_used_mb: used / (1024 * 1024),
            mem_percent,
            swap_total_mb: sys.total_swap() / (1024 * 1024),
            swap_used_mb: sys.used_swap() / (1024 * 1024),
        }
    }
}

/// Metrics of one monitored daemon process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub virtual_memory_mb: f64,
    pub run_time_seconds: u64,
}

impl ProcessMetrics {
    /// Collect metrics of `pid`, `None` if the process is gone
    pub fn collect(sys: &mut System, pid: u32) -> Option<Self> {
        let pid = Pid::from_u32(pid);
        if !sys.refresh_process(pid) {
            return None;
        }
        let process = sys.process(pid)?;
        Some(Self {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            virtual_memory_mb: process.virtual_memory() as f64 / (1024.0 * 1024.0),
            run_time_seconds: process.run_time(),
        })
    }
}
