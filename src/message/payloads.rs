use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::location::Location;
use super::status::DiscoroStatus;

// ---------------------------------------------------------------------------
// Server agent protocol (scheduler <-> discoro_server process)
// ---------------------------------------------------------------------------

/// Scheduler -> server: stage a computation before any task can run on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupPayload {
    pub computation_id: Uuid,
    /// Auth token the server must echo back on its heartbeat and on
    /// `close_server` acks; proves the request came from the scheduler that
    /// actually owns this computation.
    pub auth: String,
    pub dest_path: String,
    #[serde(default)]
    pub xfer_files: Vec<String>,
}

/// Scheduler -> server: spawn one remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub task_id: Uuid,
    pub computation_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub kwargs: Value,
}

/// Scheduler -> server: tear down a computation running on this server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseServerPayload {
    pub computation_id: Uuid,
}

/// Scheduler -> server: cancel specific running tasks without tearing
/// down the whole server. Originates from the HTTP dashboard's
/// `/terminate_coros` admin action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatePayload {
    pub computation_id: Uuid,
    pub task_ids: Vec<Uuid>,
}

/// Scheduler -> server: one staged computation file, base64-encoded so it
/// travels inside the regular envelope framing rather than a raw byte
/// stream. Large transfers are chunked by the caller; `seq`/`done` let the
/// receiver reassemble and detect completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferPayload {
    pub computation_id: Uuid,
    pub rel_path: String,
    pub seq: u32,
    pub done: bool,
    pub data_base64: String,
}

/// Server -> scheduler, unidirectional: liveness + load heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsePayload {
    pub location: Location,
    pub ncoros: u32,
}

/// Node/server -> scheduler, unidirectional: lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub status: DiscoroStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

// ---------------------------------------------------------------------------
// Client RPC protocol (client <-> scheduler)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub name: String,
    #[serde(default)]
    pub xfer_files: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitPayload {
    pub auth: String,
    pub task_id: Uuid,
}

/// Client -> scheduler: spawn one remote task. `location` pins a specific
/// server; omitted, the scheduler picks the least-loaded one itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAtPayload {
    pub auth: String,
    /// Exact server to run on. Takes precedence over `host` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Host address to run on (least-loaded server of that node). Ignored
    /// when `location` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub kwargs: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEachPayload {
    pub auth: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub kwargs: Value,
    /// When set, dispatch once per node (one server per node) instead of
    /// once per server. Mirrors the original `run_each`/`run_node_servers`
    /// split — see DESIGN.md for the resolved ambiguity around this flag.
    #[serde(default)]
    pub one_per_node: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesQueryPayload {
    pub auth: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServersQueryPayload {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseComputationPayload {
    pub auth: String,
}

// ---------------------------------------------------------------------------
// Generic reply payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotAuthorized,
    UnknownComputation,
    UnknownTask,
    NoServerAvailable,
    UnknownKind,
    InvalidEnvelope,
    Internal,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesQueryResponsePayload {
    pub nodes: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServersQueryResponsePayload {
    pub servers: HashMap<String, Vec<Location>>,
}

#[cfg(test)]
#[path = "payloads_tests.rs"]
mod tests;
