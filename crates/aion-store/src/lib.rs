//! Local Task Store (LTS).
//!
//! An on-disk, ordered key-value store holding the canonical set of tasks
//! known to this node, keyed by [`Code`]. Backed by a single `sled::Tree`
//! named `"tasks"` inside the database file named by config key `db.file`.
//!
//! Registering a task with the cron scheduler is an async call, so the
//! check-register-write sequence that keeps the LTS and the scheduler in
//! agreement cannot live behind a synchronous sled transaction; `aion-manager`
//! serializes that sequence itself and calls the plain `put`/`contains`
//! primitives below.

use aion_task::{Code, Task};
use thiserror::Error;

/// Errors raised by the Local Task Store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying sled database or tree operation failed.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    /// A stored record did not deserialize as a [`Task`].
    #[error("corrupt task record for code {0}: {1}")]
    Corrupt(String, serde_json::Error),
    /// Serializing a task for storage failed.
    #[error("failed to serialize task {0}: {1}")]
    Encode(String, serde_json::Error),
}

/// The namespace all task records live under.
const TASKS_TREE: &str = "tasks";

/// The on-disk task registry for this node.
pub struct Store {
    /// Kept open for the process lifetime; dropping it flushes to disk.
    _db: sled::Db,
    tasks: sled::Tree,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// I/O errors here are fatal at startup: the caller cannot recover state
    /// without this file, so this returns an error rather than retrying.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tasks = db.open_tree(TASKS_TREE)?;
        Ok(Self { _db: db, tasks })
    }

    /// An in-memory store, useful for tests and for a bootstrap lone node
    /// that has not configured `db.file`.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let tasks = db.open_tree(TASKS_TREE)?;
        Ok(Self { _db: db, tasks })
    }

    /// Whether `code` is already present, without deserializing it.
    pub fn contains(&self, code: &Code) -> Result<bool, StoreError> {
        Ok(self.tasks.contains_key(code.as_str())?)
    }

    /// Unconditionally write (or overwrite) a task record.
    ///
    /// Caller is responsible for idempotency checks, and for keeping this in
    /// step with the scheduler registration for the same code.
    pub fn put(&self, task: &Task) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(task)
            .map_err(|e| StoreError::Encode(task.code.to_string(), e))?;
        self.tasks.insert(task.code.as_str(), bytes)?;
        self.tasks.flush()?;
        Ok(())
    }

    /// Iterate every stored task. Malformed records are logged and skipped,
    /// rather than aborting the whole scan.
    pub fn for_each(&self, mut f: impl FnMut(Task)) -> Result<(), StoreError> {
        for entry in self.tasks.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<Task>(&value) {
                Ok(task) => f(task),
                Err(e) => {
                    let code = String::from_utf8_lossy(&key).to_string();
                    tracing::error!(code, error = %e, "dropping corrupt task record");
                }
            }
        }
        Ok(())
    }

    /// Snapshot the entire LTS contents, e.g. for an anti-entropy push or
    /// `GET /info`.
    pub fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        self.for_each(|task| tasks.push(task))?;
        Ok(tasks)
    }

    /// Overwrite a task's persisted record in place, used when loading every
    /// persisted task at startup to write back a freshly regenerated
    /// scheduler handle.
    pub fn rewrite(&self, task: &Task) -> Result<(), StoreError> {
        self.put(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_task::Definition;

    fn task(name: &str) -> Task {
        Task::new(name, Definition::new("* * * * *"), "Test command")
    }

    #[test]
    fn for_each_visits_every_task() {
        let store = Store::temporary().unwrap();
        for name in ["a", "b", "c"] {
            store.put(&task(name)).unwrap();
        }

        let mut names: Vec<String> = Vec::new();
        store.for_each(|t| names.push(t.name)).unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn snapshot_round_trips_through_put() {
        let store = Store::temporary().unwrap();
        let t = task("nightly");
        store.put(&t).unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].code, t.code);
    }

    /// A task survives a real close-and-reopen of the on-disk file, not just
    /// an in-process handle.
    #[test]
    fn reopens_and_recovers_persisted_tasks_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aion.db");
        let t = task("nightly");
        let code = t.code.clone();

        {
            let store = Store::open(&path).unwrap();
            store.put(&t).unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        let snap = reopened.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].code, code);
        assert_eq!(snap[0].name, "nightly");
    }
}
