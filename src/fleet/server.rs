use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::fleet::task::{RemoteTask, TaskOutcome};
use crate::message::{DiscoroStatus, Location};

/// A single coroutine-server process on a node, as tracked by the scheduler.
///
/// Mirrors `__Server` in the original scheduler: a name, the node it runs
/// on, the tasks currently placed on it, and a small buffer of outcomes
/// that arrived before the scheduler's `await_` caught up with them.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub location: Location,
    pub node: Location,
    pub status: DiscoroStatus,
    pub coros: HashMap<Uuid, RemoteTask>,
    pub done: Vec<TaskOutcome>,
    pub last_pulse: Instant,
}

impl Server {
    pub fn new(name: impl Into<String>, location: Location, node: Location) -> Self {
        Self {
            name: name.into(),
            location,
            node,
            status: DiscoroStatus::ServerDiscovered,
            coros: HashMap::new(),
            done: Vec::new(),
            last_pulse: Instant::now(),
        }
    }

    pub fn mark_pulse(&mut self) {
        self.last_pulse = Instant::now();
    }

    pub fn silent_for(&self) -> std::time::Duration {
        self.last_pulse.elapsed()
    }

    pub fn place_task(&mut self, task: RemoteTask) {
        self.coros.insert(task.task_id, task);
    }

    /// Removes a completed task from `coros`, buffering the outcome if it
    /// is not yet known (the completion reply raced the `run` reply).
    pub fn record_outcome(&mut self, task_id: Uuid, value: Option<serde_json::Value>, error: Option<String>) {
        self.coros.remove(&task_id);
        self.done.push(TaskOutcome {
            task_id,
            value,
            error,
        });
    }

    pub fn take_outcome(&mut self, task_id: Uuid) -> Option<TaskOutcome> {
        let idx = self.done.iter().position(|o| o.task_id == task_id)?;
        Some(self.done.remove(idx))
    }

    pub fn load(&self) -> usize {
        self.coros.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loc(port: u16) -> Location {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn place_and_complete_task_moves_between_coros_and_done() {
        let mut server = Server::new("s1", loc(9001), loc(9000));
        let task_id = Uuid::new_v4();
        server.place_task(RemoteTask::new(task_id, "f", json!([]), json!({})));
        assert_eq!(server.load(), 1);

        server.record_outcome(task_id, Some(json!(42)), None);
        assert_eq!(server.load(), 0);

        let outcome = server.take_outcome(task_id).expect("outcome");
        assert_eq!(outcome.value, Some(json!(42)));
        assert!(server.take_outcome(task_id).is_none());
    }

    #[test]
    fn silent_for_grows_until_pulse() {
        let mut server = Server::new("s1", loc(9001), loc(9000));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(server.silent_for().as_millis() >= 5);
        server.mark_pulse();
        assert!(server.silent_for().as_millis() < 5);
    }
}
