//! Client-facing handle for a scheduled computation, grounded on
//! `original_source/py3/asyncoro/discoro.py`'s `Computation` class: a
//! thin RPC wrapper that schedules, runs, and tears down work against a
//! scheduler over the same wire protocol `scheduler::client_rpc` answers.
//!
//! This is distinct from `scheduler::computation::Computation`, the
//! scheduler's own bookkeeping record for the computation it is hosting.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{
    AckPayload, AwaitPayload, CloseComputationPayload, CoroInfo, DiscoroStatus, Envelope,
    ErrorPayload, FileTransferPayload, Location, MessageKind, NodesQueryPayload,
    NodesQueryResponsePayload, RunAtPayload, RunEachPayload, SchedulePayload,
    ServersQueryPayload, ServersQueryResponsePayload, now_millis,
};
use crate::scheduler::status_processor::ObserverEvent;
use crate::transport::QuicTransport;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// One remote task dispatched through `run_at`/`run_each`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub location: Location,
}

/// A computation the caller has scheduled (or is about to). Not `Clone`:
/// there is exactly one client holding the auth token for a given
/// computation, and `close` consumes it.
pub struct Computation {
    name: String,
    xfer_files: Vec<PathBuf>,
    depends: Vec<String>,
    nodes: Option<Vec<String>>,
    pulse_interval: Option<u64>,
    client_secret: Option<String>,
    auth: Option<String>,
    scheduler_addr: Option<SocketAddr>,
    status_observer: Option<mpsc::Sender<ObserverEvent>>,
}

impl Computation {
    /// Builds an unscheduled computation. `xfer_files` must name distinct
    /// files that exist on disk; `depends` lists arbitrary module/package
    /// names the scheduler's servers are expected to already provide.
    pub fn new(
        name: impl Into<String>,
        xfer_files: Vec<PathBuf>,
        depends: Vec<String>,
        nodes: Option<Vec<String>>,
        pulse_interval: Option<u64>,
        client_secret: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            bail!("computation name must not be empty");
        }

        let mut seen_names = HashSet::new();
        for path in &xfer_files {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("xfer_file path has no file name: {}", path.display()))?
                .to_string_lossy()
                .into_owned();
            if !seen_names.insert(file_name.clone()) {
                bail!("duplicate xfer_file name: {file_name}");
            }
            if !path.is_file() {
                bail!("xfer_file does not exist or is not a regular file: {}", path.display());
            }
        }

        Ok(Self {
            name,
            xfer_files,
            depends,
            nodes,
            pulse_interval,
            client_secret,
            auth: None,
            scheduler_addr: None,
            status_observer: None,
        })
    }

    /// Registers a channel to receive a local `CoroCreated` notification
    /// every time `run_at`/`run_each` hands back a task handle, mirroring
    /// `Computation.status_event`'s immediate `CoroCreated` callback in the
    /// original implementation. Replaces any previously registered channel.
    pub fn set_status_observer(&mut self, observer: mpsc::Sender<ObserverEvent>) {
        self.status_observer = Some(observer);
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    async fn notify_created(&self, handle: &TaskHandle) {
        let Some(observer) = &self.status_observer else { return };
        let event = ObserverEvent {
            status: DiscoroStatus::CoroCreated,
            location: Some(handle.location),
            host: None,
            coro: Some(CoroInfo {
                task_id: handle.task_id,
                name: String::new(),
                start_time_unix_ms: now_millis(),
            }),
        };
        if observer.send(event).await.is_err() {
            warn!("status observer channel closed, dropping CoroCreated notification");
        }
    }

    fn auth_or_err(&self) -> Result<String> {
        self.auth.clone().context("computation has not been scheduled yet")
    }

    fn scheduler_addr_or_err(&self) -> Result<SocketAddr> {
        self.scheduler_addr.context("computation has not been scheduled yet")
    }

    /// Schedules this computation with a scheduler, waits for the single
    /// active slot, transfers `xfer_files`, then confirms activation.
    /// Mirrors `Computation.schedule`: `schedule` -> stage files -> `await_`.
    pub async fn schedule(&mut self, transport: &QuicTransport, scheduler_addr: SocketAddr) -> Result<()> {
        let xfer_file_names: Vec<String> = self
            .xfer_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::Schedule,
            serde_json::json!(SchedulePayload {
                name: self.name.clone(),
                xfer_files: xfer_file_names,
                depends: self.depends.clone(),
                nodes: self.nodes.clone(),
                pulse_interval: self.pulse_interval,
                client_secret: self.client_secret.clone(),
            }),
        );

        let reply = send_rpc(transport, scheduler_addr, request).await?;
        let ack = expect_ack(&reply)?;
        let auth = ack.auth.context("schedule response carried no auth token")?;

        for path in &self.xfer_files {
            self.upload_file(transport, scheduler_addr, &auth, path).await?;
        }

        let await_request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::Await,
            serde_json::json!(AwaitPayload {
                auth: auth.clone(),
                task_id: Uuid::nil(),
            }),
        );
        let reply = send_rpc(transport, scheduler_addr, await_request).await?;
        expect_ack(&reply)?;

        info!(name = %self.name, %auth, "computation scheduled and activated");
        self.auth = Some(auth);
        self.scheduler_addr = Some(scheduler_addr);
        Ok(())
    }

    async fn upload_file(&self, transport: &QuicTransport, scheduler_addr: SocketAddr, auth: &str, path: &Path) -> Result<()> {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading xfer_file {}", path.display()))?;
        let rel_path = path.file_name().unwrap().to_string_lossy().into_owned();

        let envelope = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::FileTransfer,
            serde_json::json!(FileTransferPayload {
                computation_id: crate::scheduler::bootstrap::parse_auth(auth),
                rel_path,
                seq: 0,
                done: true,
                data_base64: STANDARD.encode(&bytes),
            }),
        );

        let reply = send_rpc(transport, scheduler_addr, envelope).await?;
        expect_ack(&reply)?;
        Ok(())
    }

    /// Runs `name` once, at a specific server if `location` is given,
    /// otherwise at whichever initialized server the scheduler judges
    /// least loaded.
    pub async fn run_at(
        &self,
        transport: &QuicTransport,
        location: Option<Location>,
        name: impl Into<String>,
        args: Value,
        kwargs: Value,
    ) -> Result<TaskHandle> {
        self.run_at_target(transport, location, None, name, args, kwargs).await
    }

    /// Runs `name` on the least-loaded server of the node identified by
    /// `host`.
    pub async fn run_at_host(
        &self,
        transport: &QuicTransport,
        host: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        kwargs: Value,
    ) -> Result<TaskHandle> {
        self.run_at_target(transport, None, Some(host.into()), name, args, kwargs).await
    }

    async fn run_at_target(
        &self,
        transport: &QuicTransport,
        location: Option<Location>,
        host: Option<String>,
        name: impl Into<String>,
        args: Value,
        kwargs: Value,
    ) -> Result<TaskHandle> {
        let auth = self.auth_or_err()?;
        let scheduler_addr = self.scheduler_addr_or_err()?;

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::RunAt,
            serde_json::json!(RunAtPayload {
                auth,
                location,
                host,
                name: name.into(),
                args,
                kwargs,
            }),
        );

        let reply = send_rpc(transport, scheduler_addr, request).await?;
        let ack = expect_ack(&reply)?;
        let value = ack.value.context("run_at response carried no task info")?;
        let handle = parse_task_handle(&value)?;
        self.notify_created(&handle).await;
        Ok(handle)
    }

    /// Runs `name` on every initialized server (or once per node, when
    /// `one_per_node` is set).
    pub async fn run_each(
        &self,
        transport: &QuicTransport,
        name: impl Into<String>,
        args: Value,
        kwargs: Value,
        one_per_node: bool,
    ) -> Result<Vec<TaskHandle>> {
        let auth = self.auth_or_err()?;
        let scheduler_addr = self.scheduler_addr_or_err()?;

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::RunEach,
            serde_json::json!(RunEachPayload {
                auth,
                name: name.into(),
                args,
                kwargs,
                one_per_node,
            }),
        );

        let reply = send_rpc(transport, scheduler_addr, request).await?;
        let ack = expect_ack(&reply)?;
        let value = ack.value.context("run_each response carried no dispatch list")?;
        let entries = value.as_array().context("run_each response was not a list")?;
        let handles: Vec<TaskHandle> = entries.iter().map(parse_task_handle).collect::<Result<_>>()?;
        for handle in &handles {
            self.notify_created(handle).await;
        }
        Ok(handles)
    }

    pub async fn nodes(&self, transport: &QuicTransport) -> Result<Vec<Location>> {
        let auth = self.auth_or_err()?;
        let scheduler_addr = self.scheduler_addr_or_err()?;

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::NodesQuery,
            serde_json::json!(NodesQueryPayload { auth }),
        );
        let reply = send_rpc(transport, scheduler_addr, request).await?;
        let response: NodesQueryResponsePayload = expect_result(&reply)?;
        Ok(response.nodes)
    }

    pub async fn servers(&self, transport: &QuicTransport, node: Option<String>) -> Result<HashMap<String, Vec<Location>>> {
        let auth = self.auth_or_err()?;
        let scheduler_addr = self.scheduler_addr_or_err()?;

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::ServersQuery,
            serde_json::json!(ServersQueryPayload { auth, node }),
        );
        let reply = send_rpc(transport, scheduler_addr, request).await?;
        let response: ServersQueryResponsePayload = expect_result(&reply)?;
        Ok(response.servers)
    }

    /// Releases the scheduler's active slot. Consumes `self`: there is
    /// nothing left to do with a closed computation's auth token.
    pub async fn close(mut self, transport: &QuicTransport) -> Result<()> {
        let auth = self.auth_or_err()?;
        let scheduler_addr = self.scheduler_addr_or_err()?;

        let request = Envelope::new(
            transport.local_agent_id().to_string(),
            "node.scheduler".to_string(),
            MessageKind::CloseComputation,
            serde_json::json!(CloseComputationPayload { auth }),
        );
        let reply = send_rpc(transport, scheduler_addr, request).await?;
        expect_ack(&reply)?;
        self.auth = None;
        Ok(())
    }

    /// Watches the scheduler's pulse stream and signals `cancel` if no
    /// pulse arrives within `5 * pulse_interval`, mirroring
    /// `Computation._pulse_proc`'s dead-scheduler detection. Intended to
    /// run as a background task for the lifetime of the computation.
    pub async fn pulse_watch(&self, transport: &QuicTransport, pulse_interval: Duration, cancel: CancellationToken, dead_tx: mpsc::Sender<()>) {
        let mut inbound = transport.subscribe_inbound();
        let timeout = pulse_interval * 5;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = tokio::time::timeout(timeout, inbound.recv()) => {
                    match received {
                        Ok(Ok(inbound)) if inbound.envelope.kind == MessageKind::Pulse => {
                            continue;
                        }
                        Ok(Ok(_)) => continue,
                        Ok(Err(_)) => return,
                        Err(_) => {
                            warn!("no pulse from scheduler within timeout, declaring it dead");
                            let _ = dead_tx.send(()).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn send_rpc(transport: &QuicTransport, scheduler_addr: SocketAddr, request: Envelope) -> Result<Envelope> {
    tokio::time::timeout(RPC_TIMEOUT, transport.send(scheduler_addr, request))
        .await
        .context("scheduler RPC timed out")?
        .context("scheduler RPC failed")?
        .context("scheduler RPC expected a reply")
}

fn expect_ack(reply: &Envelope) -> Result<AckPayload> {
    match reply.kind {
        MessageKind::Ack => reply.payload_as().context("malformed ack payload"),
        MessageKind::Error => {
            let err: ErrorPayload = reply.payload_as().context("malformed error payload")?;
            bail!("scheduler rejected request: {}", err.message);
        }
        other => bail!("unexpected reply kind: {other}"),
    }
}

fn expect_result<T: serde::de::DeserializeOwned>(reply: &Envelope) -> Result<T> {
    match reply.kind {
        MessageKind::Result => reply.payload_as().context("malformed result payload"),
        MessageKind::Error => {
            let err: ErrorPayload = reply.payload_as().context("malformed error payload")?;
            bail!("scheduler rejected request: {}", err.message);
        }
        other => bail!("unexpected reply kind: {other}"),
    }
}

fn parse_task_handle(value: &Value) -> Result<TaskHandle> {
    let task_id = value
        .get("task_id")
        .context("dispatch entry missing task_id")?
        .as_str()
        .context("task_id was not a string")?
        .parse()
        .context("task_id was not a valid uuid")?;
    let location: Location = serde_json::from_value(value.get("location").context("dispatch entry missing location")?.clone())
        .context("dispatch entry location was malformed")?;
    Ok(TaskHandle { task_id, location })
}

#[cfg(test)]
#[path = "computation_tests.rs"]
mod tests;
