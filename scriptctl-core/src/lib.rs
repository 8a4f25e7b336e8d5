pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod process;
pub mod redact;
pub mod script;
pub mod supervisor;

pub use backoff::{BackoffPolicy, JitterMode};
pub use config::{Config, ConfigLoader, ConfigWatcher, ScriptProvider, Settings, StaticScripts};
pub use error::{Error, Result};
pub use metrics::{HealthProbe, MetricsSampler, NoopSampler, SampledMetrics};
pub use process::{ExitStatus, ProcessBuilder, ProcessHandle, Signal};
pub use redact::SecretRedactor;
pub use script::{
    HealthCheck, RestartPolicy, RuntimeStatus, ScriptDefinition, ScriptId, StatusSnapshot,
};
pub use supervisor::{
    BroadcastSink, CrashNotifier, EventSink, OutputStream, ProcessLauncher, SupervisorEvent,
    TracingNotifier,
};
