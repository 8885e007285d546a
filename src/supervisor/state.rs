use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerStatus {
    Idle,
    Spawning,
    AwaitingHealthCheck,
    Running,
    Restarting,
    Stopped,
    FailedPermanently,
}

impl WorkerStatus {
    /// Transitions the UI is notified about.
    pub fn is_notable(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Restarting | Self::Stopped | Self::FailedPermanently
        )
    }
}

/// Broadcast on every notable status transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: WorkerStatus,
    pub port: Option<u16>,
    pub attempts: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub status: WorkerStatus,
    pub port: Option<u16>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub rejected_ports: Vec<u16>,
    pub pid: Option<u32>,
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = StatusEvent {
            status: WorkerStatus::FailedPermanently,
            port: Some(3001),
            attempts: 5,
            message: "gave up".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "failedPermanently");
        assert_eq!(json["port"], 3001);
        assert_eq!(json["attempts"], 5);
    }

    #[test]
    fn test_notable_states() {
        assert!(WorkerStatus::Running.is_notable());
        assert!(!WorkerStatus::Spawning.is_notable());
        assert!(!WorkerStatus::AwaitingHealthCheck.is_notable());
    }
}
