use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

/// A task running on a remote server, tracked by the scheduler for
/// `await_` and for teardown bookkeeping.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub task_id: Uuid,
    pub name: String,
    pub args: Value,
    pub kwargs: Value,
    pub start_time: Instant,
}

impl RemoteTask {
    pub fn new(task_id: Uuid, name: impl Into<String>, args: Value, kwargs: Value) -> Self {
        Self {
            task_id,
            name: name.into(),
            args,
            kwargs,
            start_time: Instant::now(),
        }
    }

    pub fn running_for(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

/// Outcome of a task that finished (or was force-terminated) before the
/// scheduler's `await_` caught up with it — buffered in `Server::done` the
/// way the original scheduler buffers `__server.done` entries to resolve
/// the race between a `run`/`close` reply and an in-flight completion.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub value: Option<Value>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn running_for_advances_with_time() {
        let task = RemoteTask::new(Uuid::new_v4(), "compute", json!([1, 2]), json!({}));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(task.running_for().as_millis() >= 5);
    }
}
