use std::sync::Mutex;

use imagine_core::api::SystemInfo;
use sysinfo::System;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Samples host CPU and memory usage.
pub struct SystemMonitor {
    system: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first sample.
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn snapshot(&self) -> SystemInfo {
        let Ok(mut system) = self.system.lock() else {
            return SystemInfo::default();
        };
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory() as f64;
        let available = system.available_memory() as f64;
        let memory_usage = if total > 0.0 {
            (total - available) / total * 100.0
        } else {
            0.0
        };
        SystemInfo {
            cpu_usage: f64::from(system.global_cpu_info().cpu_usage()),
            memory_usage,
            available_memory: available / GIB,
            total_memory: total / GIB,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}
