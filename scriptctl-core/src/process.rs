use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::ScriptId;

/// A spawned child owned by the task that waits on it.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub script_id: ScriptId,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    pub fn new(pid: u32, script_id: ScriptId, mut child: Child) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Self {
            pid,
            script_id,
            child,
            stdout,
            stderr,
        }
    }

    pub async fn wait(&mut self) -> crate::Result<ExitStatus> {
        let status = self.child.wait().await?;
        Ok(ExitStatus::from_std(status))
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }
}

/// Signal a launcher delivers to a whole process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as NixSignal;
        match self {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }

    pub fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self { code, signal }
    }

    /// Exit of a run that never produced an OS process.
    pub fn spawn_failed() -> Self {
        Self::new(None, None)
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn should_restart(&self, policy: crate::RestartPolicy) -> bool {
        policy.restarts_after(self.code)
    }
}

pub struct ProcessBuilder {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<std::path::PathBuf>,
    new_process_group: bool,
    stdout: Stdio,
    stderr: Stdio,
    stdin: Stdio,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            new_process_group: false,
            stdout: Stdio::piped(),
            stderr: Stdio::piped(),
            stdin: Stdio::null(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Overlays `vars` on the inherited environment.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.env
                .insert(k.as_ref().to_string(), v.as_ref().to_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Puts the child in its own process group so the whole tree can be signalled.
    pub fn new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    pub fn stdout(mut self, stdout: Stdio) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn stderr(mut self, stderr: Stdio) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn stdin(mut self, stdin: Stdio) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn spawn(self) -> crate::Result<Child> {
        tracing::debug!(
            "Spawning process: command='{}', args={:?}",
            self.command,
            self.args
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdout(self.stdout)
            .stderr(self.stderr)
            .stdin(self.stdin)
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            tracing::debug!("Setting working directory to: {:?}", cwd);
            cmd.current_dir(cwd);
        }

        #[cfg(unix)]
        if self.new_process_group {
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.spawn()
            .map_err(|e| crate::Error::SpawnFailed(format!("{}: {}", self.command, e)))
    }
}
