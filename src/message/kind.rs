use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire message kind — determines stream mapping (uni vs bidi) and payload
/// schema for every envelope exchanged between scheduler, server agents and
/// clients.
///
/// The original scheduler passed around untyped dicts keyed by a `req`
/// string; here each kind pins down its payload type in `message::payloads`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// scheduler -> server: stage a computation (auth, files, depends).
    Setup,
    /// scheduler -> server: spawn a remote task.
    Run,
    /// scheduler -> server: tear down a computation on this server.
    CloseServer,
    /// scheduler -> server: one chunk of a staged computation file.
    FileTransfer,
    /// server -> scheduler, fire-and-forget: liveness + load heartbeat.
    Pulse,
    /// node/server -> scheduler, fire-and-forget: lifecycle status change.
    StatusUpdate,
    /// client -> scheduler: register a computation, obtain an auth token.
    Schedule,
    /// client -> scheduler: block until a task id completes.
    Await,
    /// client -> scheduler: run a task pinned to one node/server location.
    RunAt,
    /// client -> scheduler: run a task on every known server.
    RunEach,
    /// client -> scheduler: list known nodes.
    NodesQuery,
    /// client -> scheduler: list known servers (optionally filtered by node).
    ServersQuery,
    /// client -> scheduler: release a computation and all its resources.
    CloseComputation,
    /// scheduler -> server: cancel specific running tasks (dashboard admin action).
    Terminate,
    /// generic positive acknowledgement.
    Ack,
    /// task completion/result delivery (scheduler -> client, or server -> scheduler).
    Result,
    /// generic negative acknowledgement.
    Error,
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Kinds sent on a bidirectional stream that block for a reply.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            MessageKind::Setup
                | MessageKind::Run
                | MessageKind::CloseServer
                | MessageKind::FileTransfer
                | MessageKind::Schedule
                | MessageKind::Await
                | MessageKind::RunAt
                | MessageKind::RunEach
                | MessageKind::NodesQuery
                | MessageKind::ServersQuery
                | MessageKind::CloseComputation
                | MessageKind::Terminate
        )
    }

    /// Kinds that are themselves a reply to some other request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Ack | MessageKind::Result | MessageKind::Error
        )
    }

    /// Kinds sent unidirectionally with no reply expected.
    pub fn is_fire_and_forget(self) -> bool {
        matches!(self, MessageKind::Pulse | MessageKind::StatusUpdate)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Setup => "setup",
            MessageKind::Run => "run",
            MessageKind::CloseServer => "close_server",
            MessageKind::FileTransfer => "file_transfer",
            MessageKind::Pulse => "pulse",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::Schedule => "schedule",
            MessageKind::Await => "await",
            MessageKind::RunAt => "run_at",
            MessageKind::RunEach => "run_each",
            MessageKind::NodesQuery => "nodes_query",
            MessageKind::ServersQuery => "servers_query",
            MessageKind::CloseComputation => "close_computation",
            MessageKind::Terminate => "terminate",
            MessageKind::Ack => "ack",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
            MessageKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[path = "kind_tests.rs"]
mod tests;
