use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Status codes reported through the status stream, fleet store, and HTTP
/// observer. Values are pinned to match the original scheduler's wire
/// encoding so persisted state and external dashboards stay stable across
/// releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DiscoroStatus {
    NodeDiscovered = 1,
    NodeInitialized = 2,
    NodeClosed = 3,
    NodeIgnore = 4,
    NodeDisconnected = 5,
    ServerDiscovered = 11,
    ServerInitialized = 12,
    ServerClosed = 13,
    ServerIgnore = 14,
    ServerDisconnected = 15,
    /// Emitted only client-side (`Computation::run_at`/`run_each`), the
    /// moment a task handle comes back from the scheduler. Never sent by
    /// the scheduler itself.
    CoroCreated = 20,
    /// The scheduler-side counterpart: a task finished, whether by normal
    /// completion or because its server was torn down out from under it.
    CoroTerminated = 21,
    ComputationClosed = 25,
}

impl DiscoroStatus {
    pub fn is_node(self) -> bool {
        matches!(
            self,
            DiscoroStatus::NodeDiscovered
                | DiscoroStatus::NodeInitialized
                | DiscoroStatus::NodeClosed
                | DiscoroStatus::NodeIgnore
                | DiscoroStatus::NodeDisconnected
        )
    }

    pub fn is_server(self) -> bool {
        matches!(
            self,
            DiscoroStatus::ServerDiscovered
                | DiscoroStatus::ServerInitialized
                | DiscoroStatus::ServerClosed
                | DiscoroStatus::ServerIgnore
                | DiscoroStatus::ServerDisconnected
        )
    }

    /// True for a status that should be visible to the client status stream
    /// (`Computation::status()`/`.events`) the way the Python scheduler's
    /// `__status_proc` forwards everything except the provisional
    /// `*Ignore` states.
    pub fn is_client_visible(self) -> bool {
        !matches!(self, DiscoroStatus::NodeIgnore | DiscoroStatus::ServerIgnore)
    }
}

/// Per-task summary reported by a server in its heartbeat and to the HTTP
/// observer dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoroInfo {
    pub task_id: uuid::Uuid,
    pub name: String,
    pub start_time_unix_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_pinned() {
        assert_eq!(DiscoroStatus::NodeDiscovered as u8, 1);
        assert_eq!(DiscoroStatus::NodeInitialized as u8, 2);
        assert_eq!(DiscoroStatus::NodeClosed as u8, 3);
        assert_eq!(DiscoroStatus::NodeIgnore as u8, 4);
        assert_eq!(DiscoroStatus::NodeDisconnected as u8, 5);
        assert_eq!(DiscoroStatus::ServerDiscovered as u8, 11);
        assert_eq!(DiscoroStatus::ServerInitialized as u8, 12);
        assert_eq!(DiscoroStatus::ServerClosed as u8, 13);
        assert_eq!(DiscoroStatus::ServerIgnore as u8, 14);
        assert_eq!(DiscoroStatus::ServerDisconnected as u8, 15);
        assert_eq!(DiscoroStatus::CoroCreated as u8, 20);
        assert_eq!(DiscoroStatus::CoroTerminated as u8, 21);
        assert_eq!(DiscoroStatus::ComputationClosed as u8, 25);
    }

    #[test]
    fn round_trips_through_json_as_integer() {
        let json = serde_json::to_string(&DiscoroStatus::ServerInitialized).unwrap();
        assert_eq!(json, "12");
        let back: DiscoroStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DiscoroStatus::ServerInitialized);
    }

    #[test]
    fn ignore_states_are_not_client_visible() {
        assert!(!DiscoroStatus::NodeIgnore.is_client_visible());
        assert!(!DiscoroStatus::ServerIgnore.is_client_visible());
        assert!(DiscoroStatus::ServerInitialized.is_client_visible());
    }
}
