use anyhow::{Context, bail};
use colored::*;
use scriptctl_core::{ConfigWatcher, OutputStream, RuntimeStatus, ScriptId, SupervisorEvent};
use scriptctl_logging::{LogConfig, LogManager};
use scriptctl_supervisor::{Supervisor, SupervisorConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::cli::RunArgs;
use crate::common::{self, FAILURE_ICON, RUNNING_ICON, STOPPED_ICON};
use crate::telemetry;

pub async fn execute(config: Option<PathBuf>, args: RunArgs) -> anyhow::Result<()> {
    let Some(path) = common::resolve_config_path(config.as_deref()) else {
        bail!("No scriptctl.json found; pass --config <file>");
    };

    let watcher = Arc::new(
        ConfigWatcher::new(&path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
    );
    let settings = watcher.get().settings.clone();
    let log_config = LogConfig::from_settings(&settings);
    let _guard = telemetry::init_with_app_log(&log_config.base_dir)
        .context("Failed to initialize application log")?;

    info!("Using config {}", path.display());
    info!("Logs directory {}", log_config.base_dir.display());

    let supervisor = Supervisor::builder(watcher.clone(), LogManager::new(log_config))
        .with_config(SupervisorConfig::from_settings(&settings))
        .build();
    let mut events = supervisor.subscribe();

    supervisor.init().await;
    if !args.no_auto_start {
        let started = supervisor.start_auto().await;
        if !started.is_empty() {
            info!("Auto-started {} scripts", started.len());
        }
    }
    for name in &args.scripts {
        let id = common::parse_script_id(name)?;
        if let Err(e) = supervisor.start(&id).await {
            error!("Failed to start {}: {}", id, e);
        }
    }

    let mut reporter = EventReporter::new(args.json);
    let mut reload = tokio::time::interval(Duration::from_secs(args.reload_interval.max(1)));
    reload.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            event = events.recv() => match event {
                Ok(event) => reporter.report(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                Err(RecvError::Closed) => break,
            },

            _ = reload.tick() => match watcher.check_reload().await {
                Ok(true) => info!("Configuration reloaded"),
                Ok(false) => {}
                Err(e) => warn!("Keeping previous configuration: {}", e),
            },
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    }
}

/// Prints script output and status changes; periodic status updates with
/// an unchanged status only go to debug.
struct EventReporter {
    json: bool,
    last_status: HashMap<ScriptId, RuntimeStatus>,
}

impl EventReporter {
    fn new(json: bool) -> Self {
        colored::control::set_override(atty::is(atty::Stream::Stdout));
        Self {
            json,
            last_status: HashMap::new(),
        }
    }

    fn report(&mut self, event: &SupervisorEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => debug!("Failed to serialize event: {}", e),
            }
            return;
        }

        match event {
            SupervisorEvent::Log {
                script,
                stream,
                text,
            } => {
                let line = text.trim_end_matches('\n');
                match stream {
                    OutputStream::Stdout => println!("[{}] {}", script.as_str().cyan(), line),
                    OutputStream::Stderr => {
                        println!("[{}] {}", script.as_str().red(), line.red())
                    }
                    OutputStream::System => {
                        println!("[{}] {}", script.as_str().yellow(), line.trim().yellow())
                    }
                }
            }
            SupervisorEvent::RestartAttempt {
                script,
                attempt,
                delay,
            } => {
                info!("Restarting {} (attempt {}) after {:?}", script, attempt, delay);
            }
            SupervisorEvent::Status(snapshot) => {
                let previous = self
                    .last_status
                    .insert(snapshot.script_id.clone(), snapshot.status);
                if previous == Some(snapshot.status) {
                    let uptime = snapshot
                        .uptime_ms
                        .map(|ms| common::format_duration(ms / 1000))
                        .unwrap_or_else(|| "-".to_string());
                    debug!(
                        "{} up {} cpu={:?} mem={:?}MB healthy={:?}",
                        snapshot.script_id,
                        uptime,
                        snapshot.cpu_percent,
                        snapshot.mem_mb,
                        snapshot.healthy
                    );
                    return;
                }

                let icon = match snapshot.status {
                    RuntimeStatus::Running | RuntimeStatus::Starting => RUNNING_ICON,
                    RuntimeStatus::Crashed => FAILURE_ICON,
                    RuntimeStatus::Stopped | RuntimeStatus::Restarting => STOPPED_ICON,
                };
                match (snapshot.pid, snapshot.last_exit_code) {
                    (Some(pid), _) => {
                        info!("{} {} {} (PID {})", icon, snapshot.script_id, snapshot.status, pid)
                    }
                    (None, Some(code)) => info!(
                        "{} {} {} (exit code {})",
                        icon, snapshot.script_id, snapshot.status, code
                    ),
                    (None, None) => info!("{} {} {}", icon, snapshot.script_id, snapshot.status),
                }
            }
        }
    }
}
