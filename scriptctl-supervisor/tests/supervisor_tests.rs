#![cfg(unix)]

use async_trait::async_trait;
use scriptctl_core::{
    BackoffPolicy, Error, HealthCheck, JitterMode, MetricsSampler, NoopSampler, ProcessHandle,
    ProcessLauncher, RestartPolicy, Result, RuntimeStatus, SampledMetrics, ScriptDefinition,
    ScriptId, StaticScripts, StatusSnapshot, SupervisorEvent,
};
use scriptctl_logging::{LogConfig, LogManager};
use scriptctl_supervisor::{PlatformLauncher, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Counts spawns and delegates to the real launcher.
#[derive(Default)]
struct CountingLauncher {
    inner: PlatformLauncher,
    spawns: AtomicUsize,
}

#[async_trait]
impl ProcessLauncher for CountingLauncher {
    async fn spawn(&self, script: &ScriptDefinition) -> Result<ProcessHandle> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        // Widen the window for racing starts
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.spawn(script).await
    }

    async fn terminate_tree(&self, pid: u32) -> Result<()> {
        self.inner.terminate_tree(pid).await
    }

    async fn kill_tree(&self, pid: u32) -> Result<()> {
        self.inner.kill_tree(pid).await
    }
}

/// Fails for one chosen pid and reports fixed usage for every other.
#[derive(Default)]
struct SelectiveSampler {
    failing_pid: Mutex<Option<u32>>,
}

#[async_trait]
impl MetricsSampler for SelectiveSampler {
    async fn sample(&self, pid: u32, _started_at: Option<Instant>) -> Result<SampledMetrics> {
        if *self.failing_pid.lock().unwrap() == Some(pid) {
            return Err(Error::Supervisor(format!("no such process {pid}")));
        }
        Ok(SampledMetrics {
            cpu_percent: Some(12.5),
            mem_mb: Some(64.0),
            uptime_ms: Some(1000),
        })
    }
}

// Exits with the given code once terminated
fn graceful(code: i32) -> String {
    format!("trap 'exit {code}' TERM; while true; do sleep 0.05; done")
}

fn id(name: &str) -> ScriptId {
    ScriptId::new(name).unwrap()
}

fn shell(name: &str, command: &str) -> ScriptDefinition {
    let mut script = ScriptDefinition::new(id(name), "sh");
    script.args = vec!["-c".to_string(), command.to_string()];
    script.backoff_ms = 20;
    script
}

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        tick_interval: Duration::from_secs(60),
        probe_timeout: Duration::from_millis(300),
        backoff: BackoffPolicy::new()
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(JitterMode::None),
        notifications_enabled: true,
        stop_grace: Duration::from_secs(5),
    }
}

struct Fixture {
    _dir: TempDir,
    supervisor: Supervisor,
    launcher: Arc<CountingLauncher>,
}

fn fixture(scripts: Vec<ScriptDefinition>) -> Fixture {
    fixture_with(scripts, test_config())
}

fn fixture_with(scripts: Vec<ScriptDefinition>, config: SupervisorConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let logs = LogManager::new(LogConfig {
        base_dir: dir.path().to_path_buf(),
        ..LogConfig::default()
    });
    let launcher = Arc::new(CountingLauncher::default());
    let supervisor = Supervisor::builder(Arc::new(StaticScripts::new(scripts)), logs)
        .with_config(config)
        .with_launcher(launcher.clone())
        .with_sampler(Arc::new(NoopSampler))
        .build();

    Fixture {
        _dir: dir,
        supervisor,
        launcher,
    }
}

async fn wait_until<F>(supervisor: &Supervisor, script: &ScriptId, condition: F) -> StatusSnapshot
where
    F: Fn(&StatusSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = supervisor.snapshot(script).await.unwrap();
        if condition(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting, last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn drain(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_concurrent_start_spawns_once() {
    let f = fixture(vec![shell("web", "exec sleep 30")]);
    let web = id("web");

    let (a, b, c) = tokio::join!(
        f.supervisor.start(&web),
        f.supervisor.start(&web),
        f.supervisor.start(&web)
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
    let snapshot = f.supervisor.snapshot(&web).await.unwrap();
    assert_eq!(snapshot.status, RuntimeStatus::Running);
    assert!(snapshot.pid.is_some());
    assert!(snapshot.start_time.is_some());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_without_process_is_idempotent() {
    let f = fixture(vec![shell("idle", "true")]);
    let idle = id("idle");

    f.supervisor.stop(&idle).await.unwrap();
    f.supervisor.stop(&idle).await.unwrap();

    let snapshot = f.supervisor.snapshot(&idle).await.unwrap();
    assert_eq!(snapshot.status, RuntimeStatus::Stopped);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.retries, 0);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_script_is_not_found() {
    let f = fixture(vec![]);
    let ghost = id("ghost");

    assert!(f.supervisor.start(&ghost).await.unwrap_err().is_not_found());
    assert!(f.supervisor.stop(&ghost).await.unwrap_err().is_not_found());
    assert!(f.supervisor.kill_tree(&ghost).await.unwrap_err().is_not_found());
    assert!(f.supervisor.snapshot(&ghost).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_operator_stop_with_clean_exit_ends_stopped() {
    let mut script = shell("sleeper", &graceful(0));
    script.restart_policy = RestartPolicy::Always;
    let f = fixture(vec![script]);
    let sleeper = id("sleeper");

    f.supervisor.start(&sleeper).await.unwrap();
    wait_until(&f.supervisor, &sleeper, |s| s.status == RuntimeStatus::Running).await;
    f.supervisor.stop(&sleeper).await.unwrap();

    let snapshot = wait_until(&f.supervisor, &sleeper, |s| s.pid.is_none()).await;
    assert_eq!(snapshot.status, RuntimeStatus::Stopped);
    assert_eq!(snapshot.last_exit_code, Some(0));
    assert_eq!(snapshot.retries, 0);
    assert_eq!(snapshot.next_restart_delay_ms, None);

    // No restart follows an operator stop, even with the always policy
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_operator_stop_keeps_nonzero_exit_as_crashed() {
    let f = fixture(vec![shell("stubborn", &graceful(7))]);
    let stubborn = id("stubborn");

    f.supervisor.start(&stubborn).await.unwrap();
    wait_until(&f.supervisor, &stubborn, |s| s.status == RuntimeStatus::Running).await;
    f.supervisor.stop(&stubborn).await.unwrap();

    let snapshot = wait_until(&f.supervisor, &stubborn, |s| s.pid.is_none()).await;
    assert_eq!(snapshot.status, RuntimeStatus::Crashed);
    assert_eq!(snapshot.last_exit_code, Some(7));
    assert_eq!(snapshot.retries, 0);
    assert_eq!(snapshot.next_restart_delay_ms, None);

    // The on-crash policy is still suppressed by the stop
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_tree_is_treated_as_crash() {
    let f = fixture(vec![shell("worker", "exec sleep 30")]);
    let worker = id("worker");
    let mut rx = f.supervisor.subscribe();

    f.supervisor.start(&worker).await.unwrap();
    let first = wait_until(&f.supervisor, &worker, |s| s.status == RuntimeStatus::Running).await;
    f.supervisor.kill_tree(&worker).await.unwrap();

    let second = wait_until(&f.supervisor, &worker, |s| {
        s.status == RuntimeStatus::Running && s.pid.is_some() && s.pid != first.pid
    })
    .await;
    assert_eq!(second.retries, 1);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 2);

    let attempts: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::RestartAttempt { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1]);

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_restarts_until_budget_exhausted() {
    let mut script = shell("flaky", "exit 3");
    script.max_retries = 2;
    let f = fixture(vec![script]);
    let flaky = id("flaky");
    let mut rx = f.supervisor.subscribe();

    f.supervisor.start(&flaky).await.unwrap();
    let snapshot = wait_until(&f.supervisor, &flaky, |s| {
        s.status == RuntimeStatus::Crashed && s.retries == 2 && s.next_restart_delay_ms.is_none()
    })
    .await;
    assert_eq!(snapshot.last_exit_code, Some(3));
    assert_eq!(snapshot.pid, None);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let attempts: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::RestartAttempt { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_restart_delays_follow_backoff() {
    let mut script = shell("flaky", "exit 1");
    script.max_retries = 3;
    let f = fixture(vec![script]);
    let flaky = id("flaky");
    let mut rx = f.supervisor.subscribe();

    f.supervisor.start(&flaky).await.unwrap();
    wait_until(&f.supervisor, &flaky, |s| {
        s.status == RuntimeStatus::Crashed && s.retries == 3 && s.next_restart_delay_ms.is_none()
    })
    .await;

    let delays: Vec<Duration> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::RestartAttempt { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80)
        ]
    );
}

#[tokio::test]
async fn test_clean_exit_under_on_crash_is_final() {
    let f = fixture(vec![shell("job", "echo done")]);
    let job = id("job");

    f.supervisor.start(&job).await.unwrap();
    let snapshot = wait_until(&f.supervisor, &job, |s| s.pid.is_none()).await;
    assert_eq!(snapshot.status, RuntimeStatus::Stopped);
    assert_eq!(snapshot.last_exit_code, Some(0));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
    assert_eq!(f.supervisor.read_log(&job).await.unwrap(), "done\n");
}

#[tokio::test]
async fn test_always_policy_restarts_clean_exit() {
    let mut script = shell("loop", "exit 0");
    script.restart_policy = RestartPolicy::Always;
    script.max_retries = 1;
    let f = fixture(vec![script]);
    let looped = id("loop");

    f.supervisor.start(&looped).await.unwrap();
    let snapshot = wait_until(&f.supervisor, &looped, |s| {
        s.retries == 1 && s.pid.is_none() && s.next_restart_delay_ms.is_none()
    })
    .await;
    assert_eq!(snapshot.status, RuntimeStatus::Stopped);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_never_policy_does_not_restart() {
    let mut script = shell("once", "exit 9");
    script.restart_policy = RestartPolicy::Never;
    let f = fixture(vec![script]);
    let once = id("once");

    f.supervisor.start(&once).await.unwrap();
    let snapshot = wait_until(&f.supervisor, &once, |s| s.status == RuntimeStatus::Crashed).await;
    assert_eq!(snapshot.last_exit_code, Some(9));
    assert_eq!(snapshot.retries, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    let mut script = shell("slow", "exit 1");
    script.backoff_ms = 5000;
    let mut config = test_config();
    config.backoff = BackoffPolicy::new().with_jitter(JitterMode::None);
    let f = fixture_with(vec![script], config);
    let slow = id("slow");

    f.supervisor.start(&slow).await.unwrap();
    let snapshot = wait_until(&f.supervisor, &slow, |s| s.next_restart_delay_ms.is_some()).await;
    assert_eq!(snapshot.status, RuntimeStatus::Crashed);

    f.supervisor.stop(&slow).await.unwrap();
    let snapshot = f.supervisor.snapshot(&slow).await.unwrap();
    assert_eq!(snapshot.status, RuntimeStatus::Stopped);
    assert_eq!(snapshot.next_restart_delay_ms, None);
    assert_eq!(snapshot.retries, 0);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let f = fixture(vec![shell("web", "exec sleep 30")]);
    let web = id("web");

    f.supervisor.start(&web).await.unwrap();
    let first = wait_until(&f.supervisor, &web, |s| s.pid.is_some()).await;

    f.supervisor.restart(&web).await.unwrap();
    let second = f.supervisor.snapshot(&web).await.unwrap();

    assert_eq!(second.status, RuntimeStatus::Running);
    assert!(second.pid.is_some());
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.retries, 0);
    assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 2);
    assert!(f.supervisor.script_for_pid(first.pid.unwrap()).is_none());
    assert_eq!(f.supervisor.script_for_pid(second.pid.unwrap()), Some(web.clone()));

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_secrets_are_masked_in_logs_and_events() {
    let mut script = shell("leaky", "echo \"token=$API_TOKEN\"");
    script
        .env
        .insert("API_TOKEN".to_string(), "hunter2-secret-value".to_string());
    let f = fixture(vec![script]);
    let leaky = id("leaky");
    let mut rx = f.supervisor.subscribe();

    f.supervisor.start(&leaky).await.unwrap();
    wait_until(&f.supervisor, &leaky, |s| s.pid.is_none()).await;

    let log = f.supervisor.read_log(&leaky).await.unwrap();
    assert_eq!(log, "token=****\n");

    let lines: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::Log { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["token=****\n".to_string()]);
}

#[tokio::test]
async fn test_secret_split_by_long_line_is_masked() {
    let secret = "hunter2-secret-value";
    // The secret straddles the 64 KiB line chunk boundary
    let mut script = shell(
        "chatty",
        "head -c 65530 /dev/zero | tr '\\0' a; echo \"$API_TOKEN\"",
    );
    script
        .env
        .insert("API_TOKEN".to_string(), secret.to_string());
    let f = fixture(vec![script]);
    let chatty = id("chatty");
    let mut rx = f.supervisor.subscribe();

    f.supervisor.start(&chatty).await.unwrap();
    wait_until(&f.supervisor, &chatty, |s| s.pid.is_none()).await;

    let log = f.supervisor.read_log(&chatty).await.unwrap();
    assert!(!log.contains(secret));
    assert_eq!(log, format!("{}****\n", "a".repeat(65530)));

    let streamed: String = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::Log { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, log);
}

#[tokio::test]
async fn test_spawn_failure_is_logged_and_crashes() {
    let mut script = ScriptDefinition::new(id("missing"), "scriptctl-no-such-binary");
    script.restart_policy = RestartPolicy::Never;
    let f = fixture(vec![script]);
    let missing = id("missing");

    f.supervisor.start(&missing).await.unwrap();
    let snapshot = f.supervisor.snapshot(&missing).await.unwrap();
    assert_eq!(snapshot.status, RuntimeStatus::Crashed);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.last_exit_code, None);

    let log = f.supervisor.read_log(&missing).await.unwrap();
    assert!(log.contains("[error]"), "{log}");
}

#[tokio::test]
async fn test_tick_reports_unhealthy_port() {
    let mut script = shell("web", "exec sleep 30");
    // Bind and release a port so nothing listens on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    script.health_check = Some(HealthCheck {
        port: Some(port),
        url: None,
    });
    let f = fixture(vec![script]);
    let web = id("web");

    f.supervisor.start(&web).await.unwrap();
    wait_until(&f.supervisor, &web, |s| s.status == RuntimeStatus::Running).await;
    f.supervisor.tick().await;

    let snapshot = f.supervisor.snapshot(&web).await.unwrap();
    assert_eq!(snapshot.healthy, Some(false));
    assert!(snapshot.uptime_ms.is_some());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_tick_reports_healthy_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut script = shell("api", "exec sleep 30");
    script.health_check = Some(HealthCheck {
        port: Some(port),
        url: None,
    });
    let f = fixture(vec![script]);
    let api = id("api");

    f.supervisor.start(&api).await.unwrap();
    f.supervisor.tick().await;

    assert_eq!(f.supervisor.snapshot(&api).await.unwrap().healthy, Some(true));
    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_tick_isolates_sampler_failures() {
    let dir = TempDir::new().unwrap();
    let logs = LogManager::new(LogConfig {
        base_dir: dir.path().to_path_buf(),
        ..LogConfig::default()
    });
    let sampler = Arc::new(SelectiveSampler::default());
    let scripts = vec![shell("good", "exec sleep 30"), shell("bad", "exec sleep 30")];
    let supervisor = Supervisor::builder(Arc::new(StaticScripts::new(scripts)), logs)
        .with_config(test_config())
        .with_sampler(sampler.clone())
        .build();
    let (good, bad) = (id("good"), id("bad"));

    supervisor.start(&good).await.unwrap();
    supervisor.start(&bad).await.unwrap();
    let bad_pid = supervisor.snapshot(&bad).await.unwrap().pid;
    *sampler.failing_pid.lock().unwrap() = bad_pid;

    supervisor.tick().await;

    let healthy = supervisor.snapshot(&good).await.unwrap();
    assert_eq!(healthy.cpu_percent, Some(12.5));
    assert_eq!(healthy.mem_mb, Some(64.0));
    assert_eq!(healthy.uptime_ms, Some(1000));

    let failed = supervisor.snapshot(&bad).await.unwrap();
    assert_eq!(failed.status, RuntimeStatus::Running);
    assert_eq!(failed.cpu_percent, None);
    assert_eq!(failed.mem_mb, None);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_list_snapshots_sorted() {
    let f = fixture(vec![shell("zeta", "true"), shell("alpha", "true")]);
    f.supervisor.init().await;

    let ids: Vec<String> = f
        .supervisor
        .list_snapshots()
        .await
        .into_iter()
        .map(|s| s.script_id.to_string())
        .collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);
    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_start_auto_only_flagged() {
    let mut auto = shell("auto", "exec sleep 30");
    auto.auto_start = true;
    let f = fixture(vec![auto, shell("manual", "exec sleep 30")]);

    let started = f.supervisor.start_auto().await;
    assert_eq!(started, vec![id("auto")]);
    assert_eq!(
        f.supervisor.snapshot(&id("manual")).await.unwrap().status,
        RuntimeStatus::Stopped
    );
    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let f = fixture(vec![shell("a", &graceful(0)), shell("b", &graceful(0))]);
    f.supervisor.start(&id("a")).await.unwrap();
    f.supervisor.start(&id("b")).await.unwrap();

    f.supervisor.shutdown().await;

    for name in ["a", "b"] {
        let snapshot = f.supervisor.snapshot(&id(name)).await.unwrap();
        assert_eq!(snapshot.status, RuntimeStatus::Stopped);
        assert_eq!(snapshot.pid, None);
    }
    assert!(f.supervisor.start(&id("a")).await.is_err());
}
