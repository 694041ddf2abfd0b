//! The task data model shared across the aion cluster.
//!
//! A [`Task`] is the unit of scheduled work: a stable [`Code`], a cron
//! [`Definition`], and an opaque `Command` payload for the executor. Every
//! task that exists in the cluster originated as a local client request on
//! exactly one node and floods out from there (see `aion-manager`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while constructing or validating a [`Task`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// The cron expression did not parse as a 5-field wall-clock schedule.
    #[error("invalid cron definition {0:?}: {1}")]
    InvalidDefinition(String, String),
}

/// The globally unique, immutable identifier of a task.
///
/// URL-safe base64 (unpadded) of a 128-bit random UUID: 22 ASCII bytes.
/// Assigned once, on the node that originates the task, and never changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(String);

impl Code {
    /// Mint a fresh, cryptographically random code.
    ///
    /// Collision probability is negligible given 128 random bits, so two
    /// independent calls never produce the same code.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4();
        Self(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            uuid.as_bytes(),
        ))
    }

    /// Borrow the raw ASCII representation, e.g. as a store key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Code {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for Code {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 5-field wall-clock cron expression: minute hour day-of-month month
/// day-of-week.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Definition(String);

impl Definition {
    /// Wrap a raw cron string without validating it.
    ///
    /// Validation happens at registration time against the scheduler's own
    /// parser, keeping construction infallible so a record learned from a
    /// peer can round-trip even if this node's scheduler later rejects it
    /// (logged as a fatal startup error only when *this* node tries to
    /// register it, see `aion-manager`).
    pub fn new(expr: impl Into<String>) -> Self {
        Self(expr.into())
    }

    /// Validate the expression against 5-field cron semantics.
    pub fn validate(&self) -> Result<(), TaskError> {
        cron::Schedule::try_from(five_field_to_seven(&self.0).as_str())
            .map(|_| ())
            .map_err(|e| TaskError::InvalidDefinition(self.0.clone(), e.to_string()))
    }

    /// Borrow the raw cron expression string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 7-field (seconds + years) form `aion-scheduler`'s underlying
    /// scheduler library expects, derived from this 5-field wall-clock
    /// expression.
    pub fn as_seven_field_cron(&self) -> String {
        five_field_to_seven(&self.0)
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `cron` (the crate) parses 6- or 7-field expressions with a leading
/// seconds field; the spec's wire format is the classic 5-field wall-clock
/// form (minute hour day-of-month month day-of-week). Prepend `0` seconds
/// and `*` years so the rest of the stack never has to think about the
/// mismatch.
pub(crate) fn five_field_to_seven(expr: &str) -> String {
    format!("0 {expr} *")
}

/// The fundamental scheduled-work entity: identity, schedule, and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Human label, free-form, not unique.
    pub name: String,
    /// Globally unique identifier; primary key throughout the system.
    pub code: Code,
    /// Cron expression, parsed at registration time.
    pub definition: Definition,
    /// Opaque action payload for the executor.
    pub command: String,
    /// Local, node-private scheduler handle.
    ///
    /// Never serialized across nodes: skipped on the wire, and always
    /// discarded and regenerated on register, even when the source JSON
    /// (e.g. replayed from another node's LTS) happens to carry one.
    #[serde(skip)]
    pub id: Option<Uuid>,
}

impl Task {
    /// Construct a new, locally originated task with a fresh [`Code`].
    pub fn new(name: impl Into<String>, definition: Definition, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Code::new(),
            definition,
            command: command.into(),
            id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn code_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let code = Code::new();
            assert_eq!(code.as_str().len(), 22);
            assert!(seen.insert(code), "Code::new produced a duplicate");
        }
    }

    #[test]
    fn definition_validates_five_field_expressions() {
        assert!(Definition::new("* * * * *").validate().is_ok());
        assert!(Definition::new("0 9 * * 1-5").validate().is_ok());
        assert!(Definition::new("not a cron expr").validate().is_err());
    }

    #[test]
    fn task_id_never_serializes() {
        let mut task = Task::new("nightly", Definition::new("* * * * *"), "Test command");
        task.id = Some(Uuid::new_v4());

        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("id"));

        let round_tripped: Task = serde_json::from_str(&json).unwrap();
        assert!(round_tripped.id.is_none());
        assert_eq!(round_tripped.code, task.code);
    }

    #[test]
    fn peer_supplied_id_field_is_ignored_on_ingest() {
        let code = Code::new();
        let json = format!(
            r#"{{"name":"x","code":"{code}","definition":"* * * * *","command":"c","id":"not-even-a-uuid"}}"#
        );
        let task: Task = serde_json::from_str(&json).unwrap();
        assert!(task.id.is_none());
    }
}
