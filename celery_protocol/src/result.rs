use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task's lifecycle status, as reported in its result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Received,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

/// The object stored/transmitted in a result backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Value,
    pub traceback: Option<String>,
    #[serde(default)]
    pub children: Vec<Value>,
}

impl ResultEnvelope {
    /// Builds a `SUCCESS` result envelope.
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            result,
            traceback: None,
            children: Vec::new(),
        }
    }
}
