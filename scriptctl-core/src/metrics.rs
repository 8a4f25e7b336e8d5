use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::HealthCheck;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledMetrics {
    pub cpu_percent: Option<f32>,
    #[serde(rename = "memMB")]
    pub mem_mb: Option<f64>,
    pub uptime_ms: Option<u64>,
}

impl SampledMetrics {
    pub fn uptime_since(started_at: Option<Instant>) -> Option<u64> {
        started_at.map(|t| t.elapsed().as_millis() as u64)
    }
}

/// Resource usage of a running OS process.
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    async fn sample(&self, pid: u32, started_at: Option<Instant>)
    -> crate::Result<SampledMetrics>;
}

/// Reports only uptime.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSampler;

#[async_trait]
impl MetricsSampler for NoopSampler {
    async fn sample(
        &self,
        _pid: u32,
        started_at: Option<Instant>,
    ) -> crate::Result<SampledMetrics> {
        Ok(SampledMetrics {
            uptime_ms: SampledMetrics::uptime_since(started_at),
            ..Default::default()
        })
    }
}

/// Liveness check beyond OS-level process existence.
///
/// Implementations bound their own run time; an unreachable target yields
/// `false` rather than an error.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, check: &HealthCheck) -> bool;
}
