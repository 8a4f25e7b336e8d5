use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use scriptctl_core::{
    Error, ProcessBuilder, ProcessHandle, ProcessLauncher, Result, ScriptDefinition, Signal,
};
use tracing::debug;

/// Spawns each script as the leader of its own process group so the whole
/// tree can be signalled at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixLauncher;

impl UnixLauncher {
    pub fn new() -> Self {
        Self
    }

    fn signal_tree(&self, pid: u32, sig: Signal) -> Result<()> {
        let sig = sig.to_nix();
        let pid_i32 = i32::try_from(pid)
            .map_err(|_| Error::Supervisor(format!("PID {} too large for system", pid)))?;

        // Negative pid addresses the process group
        match signal::kill(Pid::from_raw(-pid_i32), sig) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) => {}
            Err(e) => debug!("Signalling process group {} failed: {}", pid, e),
        }

        match signal::kill(Pid::from_raw(pid_i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Signal(format!("Failed to send {:?} to {}: {}", sig, pid, e))),
        }
    }
}

#[async_trait]
impl ProcessLauncher for UnixLauncher {
    async fn spawn(&self, script: &ScriptDefinition) -> Result<ProcessHandle> {
        let mut builder = ProcessBuilder::new(&script.command)
            .args(&script.args)
            .envs(&script.env)
            .new_process_group(true);
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
        debug!("Sending SIGTERM to process tree {}", pid);
        self.signal_tree(pid, Signal::Terminate)
    }

    async fn kill_tree(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGKILL to process tree {}", pid);
        self.signal_tree(pid, Signal::Kill)
    }
}
