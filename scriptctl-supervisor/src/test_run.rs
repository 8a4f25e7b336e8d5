use parking_lot::Mutex;
use scriptctl_core::{ExitStatus, ProcessBuilder, ScriptDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_TEST_RUN_TIMEOUT_MS: u64 = 8000;
pub const MIN_TEST_RUN_TIMEOUT_MS: u64 = 1000;

// Output still buffered in pipes after exit gets this long to drain
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunInput {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TestRunInput {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            self.timeout_ms
                .unwrap_or(DEFAULT_TEST_RUN_TIMEOUT_MS)
                .max(MIN_TEST_RUN_TIMEOUT_MS),
        )
    }
}

impl From<&ScriptDefinition> for TestRunInput {
    fn from(script: &ScriptDefinition) -> Self {
        Self {
            command: script.command.clone(),
            args: script.args.clone(),
            cwd: script.cwd.clone(),
            env: script.env.clone(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn collect<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task
        && tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err()
    {
        task.abort();
    }
}

fn take_string(buffer: &SharedBuffer) -> String {
    String::from_utf8_lossy(&buffer.lock()).into_owned()
}

/// Runs a command once, outside any supervision, and captures its output.
///
/// The process is killed when it outlives the timeout (default 8s, at least 1s).
/// Failures are reported in the result, never as an `Err`.
pub async fn test_run(input: TestRunInput) -> TestRunResult {
    let timeout = input.timeout();

    let mut builder = ProcessBuilder::new(&input.command)
        .args(&input.args)
        .envs(&input.env);
    if let Some(cwd) = &input.cwd {
        builder = builder.current_dir(cwd);
    }

    let mut child = match builder.spawn() {
        Ok(child) => child,
        Err(e) => {
            return TestRunResult {
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
    };

    let pid = child.id().unwrap_or(0);
    let stdout: SharedBuffer = Arc::default();
    let stderr: SharedBuffer = Arc::default();
    let stdout_task = child.stdout.take().map(|out| collect(out, stdout.clone()));
    let stderr_task = child.stderr.take().map(|err| collect(err, stderr.clone()));

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let (exit_code, timed_out, error) = match waited {
        Ok(Ok(status)) => (ExitStatus::from_std(status).code(), false, None),
        Ok(Err(e)) => (None, false, Some(e.to_string())),
        Err(_) => {
            debug!("Test run of {} timed out after {:?}", input.command, timeout);
            if let Err(e) = child.kill().await {
                debug!("Failed to kill timed out test run {}: {}", pid, e);
            }
            (None, true, None)
        }
    };

    drain(stdout_task).await;
    drain(stderr_task).await;

    TestRunResult {
        exit_code,
        stdout: take_string(&stdout),
        stderr: take_string(&stderr),
        timed_out,
        error,
    }
}
