use parking_lot::RwLock;
use scriptctl_core::{
    RuntimeStatus, SampledMetrics, ScriptDefinition, ScriptId, SecretRedactor, StatusSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The live OS process of one run.
#[derive(Debug, Clone)]
pub(crate) struct RunHandle {
    pub pid: u32,
    pub generation: u64,
    /// Flips to `true` once the run's exit has been fully handled.
    pub done: watch::Receiver<bool>,
}

/// A backoff wait between an exit and the next spawn.
#[derive(Debug, Clone)]
pub(crate) struct PendingRestart {
    pub token: CancellationToken,
    /// Identifies the wait so a superseded one cannot act.
    pub ticket: u64,
    pub due: Instant,
}

/// Runtime state of one script. Only ever touched under its registry mutex.
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    pub id: ScriptId,
    pub run: Option<RunHandle>,
    pub status: RuntimeStatus,
    pub started_at: Option<Instant>,
    pub start_time_ms: Option<u64>,
    pub last_exit_code: Option<i32>,
    pub retries: u32,
    pub backoff_ms: u64,
    pub metrics: SampledMetrics,
    pub healthy: Option<bool>,
    pub stop_requested: bool,
    pub secrets: Arc<SecretRedactor>,
    pub pending_restart: Option<PendingRestart>,
}

impl ManagedProcess {
    pub fn new(script: &ScriptDefinition) -> Self {
        Self {
            id: script.id.clone(),
            run: None,
            status: RuntimeStatus::Stopped,
            started_at: None,
            start_time_ms: None,
            last_exit_code: None,
            retries: 0,
            backoff_ms: script.backoff_ms,
            metrics: SampledMetrics::default(),
            healthy: None,
            stop_requested: false,
            secrets: Arc::new(SecretRedactor::default()),
            pending_restart: None,
        }
    }

    /// Applies `next` if the status table allows it; other requests are dropped.
    pub fn transition(&mut self, next: RuntimeStatus) -> bool {
        if !self.status.can_transition_to(next) {
            debug!(
                "Dropping transition {} -> {} for {}",
                self.status, next, self.id
            );
            return false;
        }

        self.status = next;
        if next == RuntimeStatus::Starting {
            self.started_at = Some(Instant::now());
            self.start_time_ms = Some(epoch_ms());
        }
        true
    }

    /// Sets `stopped` regardless of the current status.
    pub fn force_stopped(&mut self) {
        self.status = RuntimeStatus::Stopped;
    }

    pub fn generation(&self) -> Option<u64> {
        self.run.as_ref().map(|run| run.generation)
    }

    pub fn pid(&self) -> Option<u32> {
        self.run.as_ref().map(|run| run.pid)
    }

    /// Cancels a pending backoff wait, if any.
    pub fn cancel_pending_restart(&mut self) -> bool {
        match self.pending_restart.take() {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn clear_run_metrics(&mut self) {
        self.metrics = SampledMetrics::default();
        self.healthy = None;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let live = self.run.is_some();
        let uptime_ms = if live {
            self.metrics
                .uptime_ms
                .or_else(|| SampledMetrics::uptime_since(self.started_at))
        } else {
            None
        };

        StatusSnapshot {
            script_id: self.id.clone(),
            pid: self.pid(),
            status: self.status,
            start_time: self.start_time_ms,
            uptime_ms,
            cpu_percent: self.metrics.cpu_percent,
            mem_mb: self.metrics.mem_mb,
            last_exit_code: self.last_exit_code,
            retries: self.retries,
            healthy: self.healthy,
            backoff_ms: self.backoff_ms,
            next_restart_delay_ms: self.pending_restart.as_ref().map(|pending| {
                pending
                    .due
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64
            }),
        }
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) type SharedProcess = Arc<Mutex<ManagedProcess>>;

/// One record per script id, created on first use and never removed.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessRegistry {
    processes: Arc<RwLock<HashMap<ScriptId, SharedProcess>>>,
    pid_to_script: Arc<RwLock<HashMap<u32, ScriptId>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, script: &ScriptDefinition) -> SharedProcess {
        if let Some(existing) = self.processes.read().get(&script.id) {
            return existing.clone();
        }

        self.processes
            .write()
            .entry(script.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ManagedProcess::new(script))))
            .clone()
    }

    pub fn get(&self, script_id: &ScriptId) -> Option<SharedProcess> {
        self.processes.read().get(script_id).cloned()
    }

    pub fn register_pid(&self, pid: u32, script_id: ScriptId) {
        self.pid_to_script.write().insert(pid, script_id);
    }

    pub fn unregister_pid(&self, pid: u32) {
        self.pid_to_script.write().remove(&pid);
    }

    pub fn get_by_pid(&self, pid: u32) -> Option<ScriptId> {
        self.pid_to_script.read().get(&pid).cloned()
    }

    pub fn ids(&self) -> Vec<ScriptId> {
        let mut ids: Vec<ScriptId> = self.processes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn records(&self) -> Vec<SharedProcess> {
        self.processes.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.processes.read().len()
    }
}
