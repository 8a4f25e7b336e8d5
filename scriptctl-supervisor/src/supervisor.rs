use parking_lot::Mutex;
use scriptctl_core::backoff::{self, BackoffPolicy};
use scriptctl_core::{
    BroadcastSink, CrashNotifier, Error, EventSink, ExitStatus, HealthProbe, MetricsSampler,
    OutputStream, ProcessHandle, ProcessLauncher, Result, RuntimeStatus, ScriptDefinition,
    ScriptId, ScriptProvider, SecretRedactor, Settings, StatusSnapshot, SupervisorEvent,
    TracingNotifier,
};
use scriptctl_logging::{LogManager, LogMeta};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::registry::{ManagedProcess, PendingRestart, ProcessRegistry, RunHandle, SharedProcess};
use crate::{NetHealthProbe, SysinfoSampler};

// Longest output line forwarded as one chunk
const MAX_LINE_BYTES: u64 = 64 * 1024;

// Readers still holding pipes after the child exits are abandoned after this
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick_interval: Duration,
    pub probe_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub notifications_enabled: bool,
    /// How long `restart` and `shutdown` wait for a terminated run before killing it.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(2000),
            probe_timeout: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
            notifications_enabled: true,
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            probe_timeout: settings.probe_timeout(),
            backoff: settings.backoff_policy(),
            notifications_enabled: settings.notifications_enabled,
            ..Default::default()
        }
    }
}

pub struct SupervisorBuilder {
    scripts: Arc<dyn ScriptProvider>,
    logs: LogManager,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    sampler: Option<Arc<dyn MetricsSampler>>,
    probe: Option<Arc<dyn HealthProbe>>,
    notifier: Arc<dyn CrashNotifier>,
    sinks: Vec<Arc<dyn EventSink>>,
    config: SupervisorConfig,
    event_capacity: usize,
}

impl SupervisorBuilder {
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn MetricsSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CrashNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Adds a sink that receives every event alongside [`Supervisor::subscribe`] receivers.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Supervisor {
        let probe_timeout = self.config.probe_timeout;
        let sampler: Arc<dyn MetricsSampler> = match self.sampler {
            Some(sampler) => sampler,
            None => Arc::new(SysinfoSampler::new()),
        };
        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(NetHealthProbe::new(probe_timeout)),
        };

        Supervisor {
            inner: Arc::new(Inner {
                scripts: self.scripts,
                launcher: self.launcher.unwrap_or_else(crate::create_launcher),
                sampler,
                probe,
                notifier: self.notifier,
                sinks: self.sinks,
                events: BroadcastSink::new(self.event_capacity),
                logs: self.logs,
                registry: ProcessRegistry::new(),
                config: self.config,
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                ticker: Mutex::new(None),
            }),
        }
    }
}

struct Inner {
    scripts: Arc<dyn ScriptProvider>,
    launcher: Arc<dyn ProcessLauncher>,
    sampler: Arc<dyn MetricsSampler>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn CrashNotifier>,
    sinks: Vec<Arc<dyn EventSink>>,
    events: BroadcastSink,
    logs: LogManager,
    registry: ProcessRegistry,
    config: SupervisorConfig,
    generation: AtomicU64,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Runs one state machine per script: spawn, exit handling, backoff-delayed
/// restarts and the periodic metrics/health tick.
///
/// Cheap to clone; clones share the same process table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("processes", &self.inner.registry.count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn builder(scripts: Arc<dyn ScriptProvider>, logs: LogManager) -> SupervisorBuilder {
        SupervisorBuilder {
            scripts,
            logs,
            launcher: None,
            sampler: None,
            probe: None,
            notifier: Arc::new(TracingNotifier),
            sinks: Vec::new(),
            config: SupervisorConfig::default(),
            event_capacity: 1024,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn logs(&self) -> &LogManager {
        &self.inner.logs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: SupervisorEvent) {
        for sink in &self.inner.sinks {
            sink.publish(event.clone());
        }
        self.inner.events.publish(event);
    }

    fn publish_status(&self, managed: &ManagedProcess) {
        self.publish(SupervisorEvent::Status(managed.snapshot()));
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn script(&self, id: &ScriptId) -> Result<ScriptDefinition> {
        self.inner
            .scripts
            .script(id)
            .ok_or_else(|| Error::ScriptNotFound(id.to_string()))
    }

    fn record_for(&self, id: &ScriptId) -> Result<SharedProcess> {
        if let Some(record) = self.inner.registry.get(id) {
            return Ok(record);
        }
        let script = self.script(id)?;
        Ok(self.inner.registry.get_or_create(&script))
    }

    /// Creates a record for every known script and starts the tick.
    pub async fn init(&self) {
        for script in self.inner.scripts.scripts() {
            let record = self.inner.registry.get_or_create(&script);
            let managed = record.lock().await;
            self.publish_status(&managed);
        }
        self.spawn_ticker();
        info!(
            "Supervisor initialized with {} scripts",
            self.inner.registry.count()
        );
    }

    /// Starts every script flagged `auto_start`; failures are logged and skipped.
    pub async fn start_auto(&self) -> Vec<ScriptId> {
        let mut started = Vec::new();
        for script in self.inner.scripts.scripts() {
            if !script.auto_start {
                continue;
            }
            match self.start(&script.id).await {
                Ok(()) => started.push(script.id),
                Err(e) => warn!("Auto-start of {} failed: {}", script.id, e),
            }
        }
        started
    }

    /// Starts `id` unless it already has a live process.
    ///
    /// Spawn failures are written to the script's log and handled like an
    /// exit; they are not returned.
    pub async fn start(&self, id: &ScriptId) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Supervisor("supervisor is shut down".to_string()));
        }

        let script = self.script(id)?;
        let record = self.inner.registry.get_or_create(&script);
        let mut managed = record.lock().await;

        if let Some(pid) = managed.pid() {
            debug!("{} is already running with PID {}", id, pid);
            return Ok(());
        }

        managed.cancel_pending_restart();
        managed.retries = 0;
        self.spawn_run(&script, &mut managed).await;
        Ok(())
    }

    async fn spawn_run(&self, script: &ScriptDefinition, managed: &mut ManagedProcess) {
        managed.transition(RuntimeStatus::Starting);
        managed.stop_requested = false;
        managed.backoff_ms = script.backoff_ms;
        managed.clear_run_metrics();
        self.publish_status(managed);

        let mut env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        env.extend(script.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let secrets = Arc::new(SecretRedactor::from_env(&env));
        if !secrets.is_empty() {
            debug!("Masking {} secret values for {}", secrets.values().len(), script.id);
        }
        managed.secrets = secrets.clone();

        match self.inner.launcher.spawn(script).await {
            Ok(handle) => {
                let generation = self.next_generation();
                let (done_tx, done_rx) = watch::channel(false);
                managed.run = Some(RunHandle {
                    pid: handle.pid,
                    generation,
                    done: done_rx,
                });
                self.inner
                    .registry
                    .register_pid(handle.pid, script.id.clone());
                managed.transition(RuntimeStatus::Running);
                info!("Started {} with PID {}", script.id, handle.pid);
                self.publish_status(managed);

                self.spawn_monitor(script.clone(), handle, generation, secrets, done_tx);
            }
            Err(e) => {
                error!("Failed to spawn {}: {}", script.id, e);
                let line = format!("\n[error] {}\n", e);
                let masked = managed.secrets.mask(&line).into_owned();
                if let Err(e) = self.inner.logs.write(&script.id, &masked).await {
                    debug!("Failed to log spawn error for {}: {}", script.id, e);
                }
                self.publish(SupervisorEvent::Log {
                    script: script.id.clone(),
                    stream: OutputStream::System,
                    text: masked,
                });
                self.apply_exit(script, managed, ExitStatus::spawn_failed())
                    .await;
            }
        }
    }

    fn spawn_monitor(
        &self,
        script: ScriptDefinition,
        handle: ProcessHandle,
        generation: u64,
        secrets: Arc<SecretRedactor>,
        done_tx: watch::Sender<bool>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            this.monitor(script, handle, generation, secrets).await;
            let _ = done_tx.send(true);
        });
    }

    async fn monitor(
        self,
        script: ScriptDefinition,
        mut handle: ProcessHandle,
        generation: u64,
        secrets: Arc<SecretRedactor>,
    ) {
        let id = script.id.clone();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = handle.take_stdout() {
            readers.push(tokio::spawn(self.clone().pump(
                id.clone(),
                OutputStream::Stdout,
                stdout,
                secrets.clone(),
            )));
        }
        if let Some(stderr) = handle.take_stderr() {
            readers.push(tokio::spawn(self.clone().pump(
                id.clone(),
                OutputStream::Stderr,
                stderr,
                secrets,
            )));
        }

        let status = match handle.wait().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to wait for {} (PID {}): {}", id, handle.pid, e);
                ExitStatus::spawn_failed()
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
                debug!("Abandoning output reader of {}", id);
                reader.abort();
            }
        }

        self.finish_run(&script, generation, status).await;
    }

    async fn pump<R>(
        self,
        id: ScriptId,
        stream: OutputStream,
        reader: R,
        secrets: Arc<SecretRedactor>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut chunk = Vec::with_capacity(1024);
        // Bytes read but not yet emitted: an unfinished line tail that may
        // hold the start of a secret or of a UTF-8 sequence
        let mut pending = Vec::new();
        loop {
            chunk.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES)
                .read_until(b'\n', &mut chunk)
                .await;
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let complete = chunk.last() == Some(&b'\n');
                    pending.extend_from_slice(&chunk);
                    if let Some(text) = take_output(&mut pending, &secrets, complete) {
                        self.emit(&id, stream, text).await;
                    }
                }
                Err(e) => {
                    debug!("Output stream of {} failed: {}", id, e);
                    break;
                }
            }
        }
        if let Some(text) = take_output(&mut pending, &secrets, true) {
            self.emit(&id, stream, text).await;
        }
        trace!("Output reader for {} finished", id);
    }

    async fn emit(&self, id: &ScriptId, stream: OutputStream, text: String) {
        if let Err(e) = self.inner.logs.write(id, &text).await {
            debug!("Failed to write log for {}: {}", id, e);
        }
        self.publish(SupervisorEvent::Log {
            script: id.clone(),
            stream,
            text,
        });
    }

    async fn finish_run(&self, script: &ScriptDefinition, generation: u64, status: ExitStatus) {
        let Some(record) = self.inner.registry.get(&script.id) else {
            return;
        };
        let mut managed = record.lock().await;
        if managed.generation() != Some(generation) {
            debug!("Ignoring stale exit of {} run {}", script.id, generation);
            return;
        }

        if let Some(run) = managed.run.take() {
            self.inner.registry.unregister_pid(run.pid);
        }
        self.apply_exit(script, &mut managed, status).await;
    }

    /// Exit handling for a record whose run is already detached.
    ///
    /// The status follows the exit code alone; an operator stop only
    /// suppresses the restart and the crash notification.
    async fn apply_exit(
        &self,
        script: &ScriptDefinition,
        managed: &mut ManagedProcess,
        status: ExitStatus,
    ) {
        let id = &script.id;
        let stop_requested = std::mem::take(&mut managed.stop_requested);

        managed.last_exit_code = status.code();
        managed.clear_run_metrics();
        let next = if status.success() {
            RuntimeStatus::Stopped
        } else {
            RuntimeStatus::Crashed
        };
        managed.transition(next);
        self.inner.logs.close(id).await;

        match (status.code(), status.signal()) {
            (Some(code), _) => info!("{} exited with code {}", id, code),
            (None, Some(signal)) => info!("{} terminated by signal {}", id, signal),
            (None, None) => info!("{} ended without an exit code", id),
        }

        if stop_requested {
            managed.retries = 0;
            self.publish_status(managed);
            return;
        }

        if next == RuntimeStatus::Crashed && self.inner.config.notifications_enabled {
            self.inner.notifier.notify_crash(script, status.code());
        }

        // Policy and backoff base are read fresh for every restart decision
        let current = self
            .inner
            .scripts
            .script(id)
            .unwrap_or_else(|| script.clone());

        if !status.should_restart(current.restart_policy) {
            managed.retries = 0;
            self.publish_status(managed);
            return;
        }

        if !current.retry_budget_allows(managed.retries) {
            warn!(
                "{} exhausted its restart budget after {} retries",
                id, managed.retries
            );
            self.publish_status(managed);
            return;
        }

        let attempt = managed.retries.saturating_add(1);
        let delay = self
            .inner
            .config
            .backoff
            .delay_with_base(attempt, current.backoff_base());
        let token = self.inner.shutdown.child_token();
        let ticket = self.next_generation();

        managed.backoff_ms = current.backoff_ms;
        managed.pending_restart = Some(PendingRestart {
            token: token.clone(),
            ticket,
            due: Instant::now() + delay,
        });
        info!("Restarting {} in {:?} (attempt {})", id, delay, attempt);
        self.publish_status(managed);

        self.schedule_restart(id.clone(), token, ticket, delay);
    }

    fn schedule_restart(&self, id: ScriptId, token: CancellationToken, ticket: u64, delay: Duration) {
        tokio::spawn(self.clone().restart_after(id, token, ticket, delay));
    }

    async fn restart_after(
        self,
        id: ScriptId,
        token: CancellationToken,
        ticket: u64,
        delay: Duration,
    ) {
        if let Err(e) = backoff::wait_for(delay, &token).await {
            debug!("Restart of {} abandoned: {}", id, e);
            return;
        }

        let Some(record) = self.inner.registry.get(&id) else {
            return;
        };
        let mut managed = record.lock().await;

        let current = managed
            .pending_restart
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket);
        if !current || token.is_cancelled() {
            debug!("Restart of {} was superseded", id);
            return;
        }
        managed.pending_restart = None;

        if managed.run.is_some() {
            return;
        }
        let Some(script) = self.inner.scripts.script(&id) else {
            warn!("{} was removed before its restart", id);
            return;
        };

        managed.retries = managed.retries.saturating_add(1);
        self.publish(SupervisorEvent::RestartAttempt {
            script: id.clone(),
            attempt: managed.retries,
            delay,
        });
        self.spawn_run(&script, &mut managed).await;
    }

    /// Requests graceful termination of the script's process tree.
    ///
    /// Without a live process the status is forced to `stopped`. Any pending
    /// restart is cancelled first. Returns once termination is requested.
    pub async fn stop(&self, id: &ScriptId) -> Result<()> {
        let record = self.record_for(id)?;
        let mut managed = record.lock().await;

        if managed.cancel_pending_restart() {
            debug!("Cancelled pending restart of {}", id);
        }

        let Some(pid) = managed.pid() else {
            managed.force_stopped();
            managed.retries = 0;
            self.publish_status(&managed);
            return Ok(());
        };

        managed.stop_requested = true;
        info!("Stopping {} (PID {})", id, pid);
        self.inner.launcher.terminate_tree(pid).await
    }

    /// Stops the script, waits for its exit to be handled, then starts it again.
    pub async fn restart(&self, id: &ScriptId) -> Result<()> {
        let record = self.record_for(id)?;
        let run = {
            let mut managed = record.lock().await;
            managed.transition(RuntimeStatus::Restarting);
            self.publish_status(&managed);
            managed.run.as_ref().map(|run| (run.pid, run.done.clone()))
        };

        self.stop(id).await?;
        if let Some((pid, done)) = run {
            self.wait_for_exit(id, pid, done).await;
        }
        self.start(id).await
    }

    async fn wait_for_exit(&self, id: &ScriptId, pid: u32, mut done: watch::Receiver<bool>) {
        let grace = self.inner.config.stop_grace;
        if tokio::time::timeout(grace, done.wait_for(|handled| *handled))
            .await
            .is_ok()
        {
            return;
        }

        warn!("{} did not exit within {:?}, killing it", id, grace);
        if let Err(e) = self.inner.launcher.kill_tree(pid).await {
            warn!("Failed to kill {} (PID {}): {}", id, pid, e);
        }
        if tokio::time::timeout(grace, done.wait_for(|handled| *handled))
            .await
            .is_err()
        {
            error!("{} (PID {}) is still running after SIGKILL", id, pid);
        }
    }

    /// Forcefully kills the script's process tree. The exit is treated as
    /// unrequested, so the restart policy applies.
    pub async fn kill_tree(&self, id: &ScriptId) -> Result<()> {
        let record = self.record_for(id)?;
        let managed = record.lock().await;
        let Some(pid) = managed.pid() else {
            debug!("{} has no live process to kill", id);
            return Ok(());
        };

        warn!("Killing process tree of {} (PID {})", id, pid);
        self.inner.launcher.kill_tree(pid).await
    }

    pub async fn snapshot(&self, id: &ScriptId) -> Result<StatusSnapshot> {
        let record = self.record_for(id)?;
        let managed = record.lock().await;
        Ok(managed.snapshot())
    }

    /// Snapshots of every known or previously managed script, ordered by id.
    pub async fn list_snapshots(&self) -> Vec<StatusSnapshot> {
        let ids: BTreeSet<ScriptId> = self
            .inner
            .scripts
            .scripts()
            .into_iter()
            .map(|s| s.id)
            .chain(self.inner.registry.ids())
            .collect();

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(snapshot) = self.snapshot(&id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub fn script_for_pid(&self, pid: u32) -> Option<ScriptId> {
        self.inner.registry.get_by_pid(pid)
    }

    /// Contents of the script's current log file.
    pub async fn read_log(&self, id: &ScriptId) -> Result<String> {
        self.inner.logs.read(id, scriptctl_logging::CURRENT).await
    }

    /// Contents of one of the files returned by [`list_logs`](Self::list_logs).
    pub async fn read_log_file(&self, id: &ScriptId, file: &str) -> Result<String> {
        self.inner.logs.read(id, file).await
    }

    pub async fn list_logs(&self, id: &ScriptId) -> Result<Vec<LogMeta>> {
        self.inner.logs.list(id).await
    }

    /// Samples metrics and health of every live process once.
    ///
    /// Each script is refreshed in its own task; a failure for one never
    /// affects the others.
    pub async fn tick(&self) {
        let mut tasks = JoinSet::new();
        for record in self.inner.registry.records() {
            let this = self.clone();
            tasks.spawn(async move { this.refresh(record).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                debug!("Tick task failed: {}", e);
            }
        }
    }

    async fn refresh(&self, record: SharedProcess) {
        let (id, pid, generation, started_at) = {
            let managed = record.lock().await;
            let Some(run) = &managed.run else {
                return;
            };
            (managed.id.clone(), run.pid, run.generation, managed.started_at)
        };

        let metrics = match self.inner.sampler.sample(pid, started_at).await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                debug!("Sampling {} (PID {}) failed: {}", id, pid, e);
                None
            }
        };

        let check = self
            .inner
            .scripts
            .script(&id)
            .and_then(|script| script.health_check().cloned());
        let healthy = match check {
            Some(check) => Some(
                tokio::time::timeout(self.inner.config.probe_timeout, self.inner.probe.probe(&check))
                    .await
                    .unwrap_or(false),
            ),
            None => None,
        };

        let mut managed = record.lock().await;
        if managed.generation() != Some(generation) {
            trace!("Discarding tick result for finished run of {}", id);
            return;
        }
        if let Some(metrics) = metrics {
            managed.metrics = metrics;
        }
        managed.healthy = healthy;
        self.publish_status(&managed);
    }

    fn spawn_ticker(&self) {
        let mut slot = self.inner.ticker.lock();
        if slot.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.tick_interval;

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        Supervisor { inner }.tick().await;
                    }
                }
            }
            debug!("Tick loop stopped");
        }));
    }

    /// Stops the tick, abandons pending restarts and stops every live process,
    /// waiting for their exits to be handled.
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor");
        self.inner.shutdown.cancel();
        let ticker = self.inner.ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        let mut running = Vec::new();
        for id in self.inner.registry.ids() {
            let Some(record) = self.inner.registry.get(&id) else {
                continue;
            };
            let run = {
                let managed = record.lock().await;
                managed.run.as_ref().map(|run| (run.pid, run.done.clone()))
            };
            if let Err(e) = self.stop(&id).await {
                warn!("Failed to stop {} during shutdown: {}", id, e);
            }
            if let Some((pid, done)) = run {
                running.push((id, pid, done));
            }
        }

        for (id, pid, done) in running {
            self.wait_for_exit(&id, pid, done).await;
        }
        self.inner.logs.close_all().await;
        info!("Supervisor shut down");
    }
}

/// Drains the part of `pending` that can be masked and emitted now.
///
/// Unless `complete`, an unfinished UTF-8 sequence and any tail that could
/// be the start of a secret stay in `pending` for the next read.
fn take_output(
    pending: &mut Vec<u8>,
    secrets: &SecretRedactor,
    complete: bool,
) -> Option<String> {
    if pending.is_empty() {
        return None;
    }

    let boundary = if complete {
        pending.len()
    } else {
        utf8_boundary(pending)
    };
    let text = String::from_utf8_lossy(&pending[..boundary]).into_owned();
    let split = if complete {
        text.len()
    } else {
        secrets.split_point(&text)
    };

    let mut rest = text.as_bytes()[split..].to_vec();
    rest.extend_from_slice(&pending[boundary..]);
    *pending = rest;

    if split == 0 {
        return None;
    }
    Some(secrets.mask(&text[..split]).into_owned())
}

/// Length of `bytes` without a trailing, incomplete UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        // Skip continuation bytes until the sequence's lead byte
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}
