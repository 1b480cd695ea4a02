//! Host and manager metrics served on `/stats`.

use serde::{Deserialize, Serialize};

use crate::manager::ManagerStats;
use crate::session::current_timestamp_ms;

/// Host resource usage, sampled on demand
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Body of `GET /stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsResponse {
    pub timestamp_unix_ms: i64,
    pub manager: ManagerStats,
    pub host: HostMetrics,
}

impl StatsResponse {
    pub fn new(manager: ManagerStats, host: HostMetrics) -> Self {
        Self {
            timestamp_unix_ms: current_timestamp_ms(),
            manager,
            host,
        }
    }
}

/// Collects current host metrics using sysinfo
pub fn collect_host_metrics() -> HostMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    HostMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
