use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::{ProcessHandle, ScriptDefinition, ScriptId, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines the supervisor itself appends, such as spawn errors.
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Status(StatusSnapshot),
    Log {
        script: ScriptId,
        stream: OutputStream,
        text: String,
    },
    RestartAttempt {
        script: ScriptId,
        attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
}

impl SupervisorEvent {
    pub fn script_id(&self) -> &ScriptId {
        match self {
            Self::Status(snapshot) => &snapshot.script_id,
            Self::Log { script, .. } | Self::RestartAttempt { script, .. } => script,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Fire-and-forget event publication. Implementations must never block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SupervisorEvent);
}

/// [`EventSink`] over a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest events instead of holding up the publisher.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: SupervisorEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

/// Invoked when a run ends in `crashed` and notifications are enabled.
pub trait CrashNotifier: Send + Sync {
    fn notify_crash(&self, script: &ScriptDefinition, exit_code: Option<i32>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl CrashNotifier for TracingNotifier {
    fn notify_crash(&self, script: &ScriptDefinition, exit_code: Option<i32>) {
        match exit_code {
            Some(code) => tracing::warn!("{} crashed with exit code {}", script.name, code),
            None => tracing::warn!("{} crashed (terminated by signal)", script.name),
        }
    }
}

/// Platform process control: spawning and tree-wide termination.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, script: &ScriptDefinition) -> crate::Result<ProcessHandle>;

    /// Requests graceful termination of `pid` and its descendants.
    async fn terminate_tree(&self, pid: u32) -> crate::Result<()>;

    /// Forcefully kills `pid` and its descendants.
    async fn kill_tree(&self, pid: u32) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeStatus;

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::new(4);
        for attempt in 0..10 {
            sink.publish(SupervisorEvent::RestartAttempt {
                script: ScriptId::new("a").unwrap(),
                attempt,
                delay: Duration::from_millis(5),
            });
        }
    }

    #[tokio::test]
    async fn test_broadcast_sink_lagging_subscriber() {
        let sink = BroadcastSink::new(2);
        let mut rx = sink.subscribe();
        for attempt in 0..5 {
            sink.publish(SupervisorEvent::RestartAttempt {
                script: ScriptId::new("a").unwrap(),
                attempt,
                delay: Duration::ZERO,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_event_serialization() {
        let event = SupervisorEvent::Log {
            script: ScriptId::new("web").unwrap(),
            stream: OutputStream::Stderr,
            text: "boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["stream"], "stderr");
        assert_eq!(event.script_id().as_str(), "web");

        let snapshot = StatusSnapshot {
            script_id: ScriptId::new("web").unwrap(),
            pid: None,
            status: RuntimeStatus::Stopped,
            start_time: None,
            uptime_ms: None,
            cpu_percent: None,
            mem_mb: None,
            last_exit_code: None,
            retries: 0,
            healthy: None,
            backoff_ms: 1000,
            next_restart_delay_ms: None,
        };
        let value = serde_json::to_value(SupervisorEvent::Status(snapshot)).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["scriptId"], "web");
    }
}
