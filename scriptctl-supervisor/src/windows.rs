use async_trait::async_trait;
use scriptctl_core::{
    Error, ProcessBuilder, ProcessHandle, ProcessLauncher, Result, ScriptDefinition, Signal,
};
use std::process::Stdio;
use tracing::debug;

/// Terminates trees through `taskkill /T`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsLauncher;

impl WindowsLauncher {
    pub fn new() -> Self {
        Self
    }

    async fn taskkill(&self, pid: u32, sig: Signal) -> Result<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if sig == Signal::Kill {
            args.push("/F");
        }

        let status = ProcessBuilder::new("taskkill")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()
            .await?;

        // 128: no such process
        match status.code() {
            Some(0) | Some(128) => Ok(()),
            code => Err(Error::Signal(format!(
                "taskkill for {} exited with {:?}",
                pid, code
            ))),
        }
    }
}

#[async_trait]
impl ProcessLauncher for WindowsLauncher {
    async fn spawn(&self, script: &ScriptDefinition) -> Result<ProcessHandle> {
        let mut builder = ProcessBuilder::new(&script.command)
            .args(&script.args)
            .envs(&script.env);
        if let Some(cwd) = &script.cwd {
            builder = builder.current_dir(cwd);
        }

        let child = builder.spawn()?;
        let pid = child.id().ok_or_else(|| {
            Error::SpawnFailed(format!("{} exited before reporting a pid", script.command))
        })?;

        debug!("Spawned {} with PID {}", script.id, pid);
        Ok(ProcessHandle::new(pid, script.id.clone(), child))
    }

    async fn terminate_tree(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, Signal::Terminate).await
    }

    async fn kill_tree(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, Signal::Kill).await
    }
}
