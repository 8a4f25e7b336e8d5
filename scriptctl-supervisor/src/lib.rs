#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::UnixLauncher as PlatformLauncher;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::WindowsLauncher as PlatformLauncher;

mod health;
mod registry;
mod sampler;
mod supervisor;
mod test_run;

pub use health::{DEFAULT_PROBE_TIMEOUT, NetHealthProbe};
pub use sampler::SysinfoSampler;
pub use supervisor::{Supervisor, SupervisorBuilder, SupervisorConfig};
pub use test_run::{
    DEFAULT_TEST_RUN_TIMEOUT_MS, MIN_TEST_RUN_TIMEOUT_MS, TestRunInput, TestRunResult, test_run,
};

use scriptctl_core::ProcessLauncher;
use std::sync::Arc;
use tracing::debug;

pub fn create_launcher() -> Arc<dyn ProcessLauncher> {
    debug!("Creating platform-specific launcher");
    Arc::new(PlatformLauncher::new())
}
