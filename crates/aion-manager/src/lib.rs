//! Task Manager (TM).
//!
//! The single mutator of the *(LTS record, CS handle)* tuple. Every task
//! added locally or learned remotely goes through [`Manager::add`] or
//! [`Manager::apply`], which serialize the check-register-write sequence
//! behind a process-local lock. sled has no transaction API that can span
//! an `.await`ed scheduler registration, so a `tokio::sync::Mutex` plays
//! that role here instead.

use std::sync::{Arc, OnceLock};

use aion_gossip::{GossipEvent, GossipHandle, TaskSnapshotSource};
use aion_ring::{NodeName, SharedRing};
use aion_scheduler::Scheduler;
use aion_store::Store;
use aion_task::{Definition, Task};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Errors raised applying or loading tasks.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The Local Task Store rejected a read or write.
    #[error(transparent)]
    Store(#[from] aion_store::StoreError),
    /// The scheduler rejected a registration.
    #[error(transparent)]
    Scheduler(#[from] aion_scheduler::SchedulerError),
    /// A persisted cron definition no longer parses; fatal at startup.
    #[error(transparent)]
    Task(#[from] aion_task::TaskError),
}

/// Adapts an `aion-store::Store` to `aion-gossip`'s anti-entropy contract
/// without that crate needing to depend on `aion-store` directly.
pub struct StoreSnapshotSource(pub Arc<Store>);

impl TaskSnapshotSource for StoreSnapshotSource {
    fn snapshot(&self) -> Vec<Task> {
        self.0.snapshot().unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to snapshot LTS for anti-entropy push");
            Vec::new()
        })
    }
}

/// The Task Manager.
pub struct Manager {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    ring: Arc<SharedRing>,
    local_name: NodeName,
    gossip: OnceLock<GossipHandle>,
    write_lock: Mutex<()>,
}

impl Manager {
    /// Construct a manager over an already-open store, a running scheduler,
    /// and a ring seeded from the configured bootstrap membership.
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        ring: Arc<SharedRing>,
        local_name: NodeName,
    ) -> Self {
        Self {
            store,
            scheduler,
            ring,
            local_name,
            gossip: OnceLock::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Wire in the gossip broadcast handle once the transport is up. Calling
    /// this more than once is a programmer error; init order is fixed.
    pub fn attach_gossip(&self, handle: GossipHandle) {
        if self.gossip.set(handle).is_err() {
            tracing::warn!("attach_gossip called more than once, ignoring");
        }
    }

    /// A snapshot source suitable for `aion_gossip::spawn`.
    pub fn snapshot_source(store: Arc<Store>) -> Arc<dyn TaskSnapshotSource> {
        Arc::new(StoreSnapshotSource(store))
    }

    /// A locally originated task. Registers, persists, and, if a gossip
    /// handle is attached, enqueues a broadcast strictly after the commit
    /// (commit-then-broadcast).
    pub async fn add(
        &self,
        name: impl Into<String>,
        definition: Definition,
        command: impl Into<String>,
    ) -> Result<Task, ManagerError> {
        definition.validate()?;
        let task = Task::new(name, definition, command);
        self.apply_internal(task.clone(), true).await?;
        Ok(task)
    }

    /// A task learned via broadcast or anti-entropy. Never re-broadcasts.
    /// Idempotent: re-delivery of an already-known `Code` is a no-op.
    pub async fn apply(&self, task: Task) -> Result<bool, ManagerError> {
        if let Err(e) = task.definition.validate() {
            tracing::error!(code = %task.code, error = %e, "dropping remote task with invalid definition");
            return Ok(false);
        }
        self.apply_internal(task, false).await
    }

    async fn apply_internal(&self, mut task: Task, broadcast: bool) -> Result<bool, ManagerError> {
        let _guard = self.write_lock.lock().await;

        if self.store.contains(&task.code)? {
            return Ok(false);
        }

        let handle = match self.register_firing_closure(&task).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    code = %task.code,
                    error = %e,
                    "registration failed, task dropped (anti-entropy will retry)"
                );
                return Ok(false);
            }
        };

        task.id = Some(handle);
        self.store.put(&task)?;

        if broadcast {
            if let Some(gossip) = self.gossip.get() {
                gossip.broadcast_add(task.clone());
            }
        }

        Ok(true)
    }

    /// Iterate the LTS at startup, register every persisted definition, and
    /// write the freshly generated handle back. An invalid persisted cron
    /// expression is fatal, since it means the on-disk record is corrupt in
    /// a way anti-entropy cannot repair.
    pub async fn load_all(&self) -> Result<usize, ManagerError> {
        let tasks = self.store.snapshot()?;
        let mut loaded = 0;
        for mut task in tasks {
            task.definition.validate()?;
            let handle = self.register_firing_closure(&task).await?;
            task.id = Some(handle);
            self.store.rewrite(&task)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn register_firing_closure(&self, task: &Task) -> Result<uuid::Uuid, ManagerError> {
        let ring = self.ring.clone();
        let local_name = self.local_name.clone();
        let code = task.code.clone();
        let command = task.command.clone();

        let handle = self
            .scheduler
            .register(&task.definition, move || {
                let ring_snapshot = ring.load();
                match aion_ring::owner(&code, &ring_snapshot) {
                    Some(owner) if *owner == local_name => {
                        tracing::info!(%code, %command, "firing: this node owns it");
                    }
                    Some(owner) => {
                        tracing::trace!(%code, %owner, "skipping firing: owned by another node");
                    }
                    None => {
                        tracing::warn!(%code, "skipping firing: empty ring, no owner");
                    }
                }
            })
            .await?;

        Ok(handle)
    }

    /// A snapshot of the LTS contents, e.g. for `GET /info`.
    pub fn snapshot(&self) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.snapshot()?)
    }

    /// The current membership view, e.g. for `GET /info`.
    pub fn members(&self) -> Vec<String> {
        self.ring
            .load()
            .members()
            .iter()
            .map(|n| n.to_string())
            .collect()
    }

    /// Drive gossip events (membership changes, broadcast receives,
    /// anti-entropy responses) until the event channel closes. Spawned as
    /// its own task by the binary; runs for the process lifetime.
    pub async fn drive_gossip_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<GossipEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                GossipEvent::MembershipChanged(members) => {
                    self.ring.rebuild(members);
                }
                GossipEvent::TaskAdded(task) => {
                    if let Err(e) = self.apply(task).await {
                        tracing::error!(error = %e, "failed to apply broadcast task");
                    }
                }
                GossipEvent::AntiEntropySnapshot(tasks) => {
                    for task in tasks {
                        if let Err(e) = self.apply(task).await {
                            tracing::error!(error = %e, "failed to apply anti-entropy task");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_ring::Ring;

    async fn manager(name: &str) -> Arc<Manager> {
        let store = Arc::new(Store::temporary().unwrap());
        let scheduler = Arc::new(Scheduler::start().await.unwrap());
        let ring = Arc::new(SharedRing::new(Ring::from_members([NodeName::new(name)])));
        Arc::new(Manager::new(store, scheduler, ring, NodeName::new(name)))
    }

    #[tokio::test]
    async fn add_persists_and_registers() {
        let mgr = manager("node-a").await;
        let task = mgr
            .add("nightly", Definition::new("* * * * *"), "Test command")
            .await
            .unwrap();

        let snap = mgr.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].code, task.code);
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let mgr = manager("node-a").await;
        let task = Task::new("nightly", Definition::new("* * * * *"), "Test command");

        let first = mgr.apply(task.clone()).await.unwrap();
        let second = mgr.apply(task.clone()).await.unwrap();

        assert!(first);
        assert!(!second, "duplicate Apply of the same code must be a no-op");
        assert_eq!(mgr.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_discards_the_incoming_id() {
        let mgr = manager("node-a").await;
        let mut task = Task::new("nightly", Definition::new("* * * * *"), "Test command");
        task.id = Some(uuid::Uuid::new_v4());

        mgr.apply(task).await.unwrap();
        let snap = mgr.snapshot().unwrap();
        assert!(snap[0].id.is_some(), "LoadAll/Apply should assign a fresh local handle");
    }

    #[tokio::test]
    async fn invalid_remote_definition_is_dropped_not_fatal() {
        let mgr = manager("node-a").await;
        let mut task = Task::new("bad", Definition::new("nonsense"), "Test command");
        task.definition = Definition::new("this is not cron");

        let applied = mgr.apply(task).await.unwrap();
        assert!(!applied);
        assert!(mgr.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_all_reregisters_every_persisted_task() {
        let store = Arc::new(Store::temporary().unwrap());
        store
            .put(&Task::new("a", Definition::new("* * * * *"), "Test command"))
            .unwrap();
        store
            .put(&Task::new("b", Definition::new("* * * * *"), "Test command"))
            .unwrap();

        let scheduler = Arc::new(Scheduler::start().await.unwrap());
        let ring = Arc::new(SharedRing::new(Ring::from_members([NodeName::new("node-a")])));
        let mgr = Manager::new(store, scheduler, ring, NodeName::new("node-a"));

        let loaded = mgr.load_all().await.unwrap();
        assert_eq!(loaded, 2);
        assert!(mgr.snapshot().unwrap().iter().all(|t| t.id.is_some()));
    }

    /// End to end through the manager: `add` on one process, then a fresh
    /// process (new store handle, new scheduler, new ring, same on-disk
    /// file) recovers it via `load_all` with a freshly regenerated local
    /// handle.
    #[tokio::test]
    async fn add_then_restart_recovers_the_task_via_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aion.db");
        let original_code;

        {
            let store = Arc::new(Store::open(&path).unwrap());
            let scheduler = Arc::new(Scheduler::start().await.unwrap());
            let ring = Arc::new(SharedRing::new(Ring::from_members([NodeName::new("node-a")])));
            let mgr = Manager::new(store, scheduler, ring, NodeName::new("node-a"));

            let task = mgr
                .add("nightly", Definition::new("* * * * *"), "Test command")
                .await
                .unwrap();
            original_code = task.code;
        }

        let store = Arc::new(Store::open(&path).unwrap());
        let scheduler = Arc::new(Scheduler::start().await.unwrap());
        let ring = Arc::new(SharedRing::new(Ring::from_members([NodeName::new("node-a")])));
        let mgr = Manager::new(store, scheduler, ring, NodeName::new("node-a"));

        let loaded = mgr.load_all().await.unwrap();
        assert_eq!(loaded, 1);

        let snap = mgr.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].code, original_code);
        assert_eq!(snap[0].name, "nightly");
    }

    /// Convergence, simplified: stands in for a real two-process gossip
    /// exchange (out of this workspace's test budget, see DESIGN.md) by
    /// relaying the broadcast/anti-entropy payload directly between two
    /// in-process managers, since `apply` is exactly what a received
    /// envelope or anti-entropy response is fed into either way.
    #[tokio::test]
    async fn two_nodes_converge_on_a_relayed_add_and_snapshot() {
        let a = manager("node-a").await;
        let b = manager("node-b").await;

        let task = a
            .add("nightly", Definition::new("* * * * *"), "Test command")
            .await
            .unwrap();

        // What B's anti-entropy pull or broadcast receive would hand it
        let delivered = b.apply(task.clone()).await.unwrap();
        assert!(delivered);

        let a_snapshot = a.snapshot().unwrap();
        let b_snapshot = b.snapshot().unwrap();
        assert_eq!(a_snapshot.len(), 1);
        assert_eq!(b_snapshot.len(), 1);
        assert_eq!(a_snapshot[0].code, b_snapshot[0].code);
    }

    /// The same envelope delivered twice converges to one entry, not two.
    #[tokio::test]
    async fn duplicate_relayed_broadcast_converges_idempotently() {
        let b = manager("node-b").await;
        let task = Task::new("nightly", Definition::new("* * * * *"), "Test command");

        assert!(b.apply(task.clone()).await.unwrap());
        assert!(!b.apply(task.clone()).await.unwrap());
        assert_eq!(b.snapshot().unwrap().len(), 1);
    }
}
