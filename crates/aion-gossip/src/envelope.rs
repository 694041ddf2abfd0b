//! Wire types for the broadcast and anti-entropy channels.

use aion_task::Task;
use serde::{Deserialize, Serialize};

/// `{ Type: ADD|REMOVE|UPDATE, Task: <Task> }`.
///
/// Only `ADD` is acted on. `REMOVE`/`UPDATE` are parsed, so a well-formed
/// envelope of that kind doesn't count as malformed, but logged as
/// unsupported and dropped (implementing them needs a tombstone scheme).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: EnvelopeKind,
    #[serde(rename = "Task")]
    pub task: Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
    #[serde(rename = "UPDATE")]
    Update,
}

/// Anti-entropy pull request: "send me your full task list." Carries no
/// payload; cursor-based delta sync is not in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyRequest;

/// `{ Tasks: [Task, ...] }`, the sender's entire LTS contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyResponse {
    #[serde(rename = "Tasks")]
    pub tasks: Vec<Task>,
}
