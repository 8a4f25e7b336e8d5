use async_trait::async_trait;
use parking_lot::Mutex;
use scriptctl_core::{Error, MetricsSampler, Result, SampledMetrics};
use std::time::Instant;
use sysinfo::{Pid, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// CPU and resident memory from the OS process table.
///
/// CPU usage is measured between consecutive refreshes, so the first sample
/// of a process reports 0%.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoSampler").finish_non_exhaustive()
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn sample_blocking(&self, pid: u32, started_at: Option<Instant>) -> Result<SampledMetrics> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return Err(Error::Supervisor(format!("Process {} not found", pid)));
        }
        let process = system
            .process(pid)
            .ok_or_else(|| Error::Supervisor(format!("Process {} not found", pid)))?;

        Ok(SampledMetrics {
            cpu_percent: Some(process.cpu_usage()),
            mem_mb: Some(process.memory() as f64 / BYTES_PER_MB),
            uptime_ms: SampledMetrics::uptime_since(started_at),
        })
    }
}

#[async_trait]
impl MetricsSampler for SysinfoSampler {
    async fn sample(&self, pid: u32, started_at: Option<Instant>) -> Result<SampledMetrics> {
        self.sample_blocking(pid, started_at)
    }
}
