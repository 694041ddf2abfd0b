//! Ring & Owner Decider.
//!
//! The ring is a pure function of the current membership view: given the
//! same set of node names, every node computes the same owner for the same
//! [`Code`]. It is derived-only state, nothing here persists across a
//! restart, and nothing here ever talks to the network; `aion-gossip` is the
//! only caller that rebuilds it, in response to join/leave events.

use std::fmt;
use std::sync::Arc;

use aion_task::Code;
use arc_swap::ArcSwap;

/// A member's stable cluster identity: `hostname + "-" + random-uuid`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeName(String);

impl NodeName {
    /// Wrap a raw node name string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An immutable consistent-hash ring over a fixed membership view.
///
/// Construction is the only way to change membership: there is no
/// incremental `add`/`remove` exposed here, since the whole ring is rebuilt
/// on every join/leave event rather than mutated in place.
#[derive(Clone)]
pub struct Ring {
    inner: hashring::HashRing<NodeName>,
    members: Vec<NodeName>,
}

impl Ring {
    /// Build a ring from the current membership view. Member order does not
    /// affect the resulting owner assignments (consistent hashing hashes
    /// each name independently), but is kept sorted here for predictable
    /// `/info` output.
    pub fn from_members(members: impl IntoIterator<Item = NodeName>) -> Self {
        let mut members: Vec<NodeName> = members.into_iter().collect();
        members.sort();
        members.dedup();

        let mut inner = hashring::HashRing::new();
        for member in &members {
            inner.add(member.clone());
        }

        Self { inner, members }
    }

    /// An empty ring: a lone bootstrapping node before it learns of any
    /// peers, or a cluster that has lost every member.
    pub fn empty() -> Self {
        Self::from_members(std::iter::empty())
    }

    /// The node names this ring was built from.
    pub fn members(&self) -> &[NodeName] {
        &self.members
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members at all.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The single node responsible for executing `code`'s firings, or `None` if
/// the ring has no members (the firing is skipped entirely in that case,
/// see `aion-manager`).
pub fn owner<'a>(code: &Code, ring: &'a Ring) -> Option<&'a NodeName> {
    ring.inner.get(&code.as_str())
}

/// An atomically-swappable handle to the current [`Ring`].
///
/// Readers (cron closures asking for the owner of a code) and the single
/// writer (the gossip delegate's join/leave handler) never see a torn ring:
/// a reader holding an `Arc<Ring>` obtained from [`SharedRing::load`] keeps
/// reading that exact snapshot even if `rebuild` replaces the pointer
/// concurrently.
pub struct SharedRing(ArcSwap<Ring>);

impl SharedRing {
    /// Start from a given initial ring (typically built from the configured
    /// bootstrap `members` list, or empty for a lone node).
    pub fn new(initial: Ring) -> Self {
        Self(ArcSwap::new(Arc::new(initial)))
    }

    /// The ring a firing closure should read *right now*. Must be called
    /// fresh on every firing rather than cached, since membership may have
    /// changed since the closure was registered.
    pub fn load(&self) -> Arc<Ring> {
        self.0.load_full()
    }

    /// Replace the ring in one atomic step, in response to a join or leave
    /// event. `Update` events never call this; node metadata changes don't
    /// affect identity.
    pub fn rebuild(&self, members: impl IntoIterator<Item = NodeName>) {
        self.0.store(Arc::new(Ring::from_members(members)));
    }
}

impl Default for SharedRing {
    fn default() -> Self {
        Self::new(Ring::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn members(n: usize) -> Vec<NodeName> {
        (0..n).map(|i| NodeName::new(format!("node-{i}"))).collect()
    }

    #[test]
    fn owner_determinism() {
        let ring_a = Ring::from_members(members(5));
        let ring_b = Ring::from_members(members(5));

        for i in 0..200 {
            let code = Code::from(format!("code-{i}"));
            assert_eq!(owner(&code, &ring_a), owner(&code, &ring_b));
        }
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = Ring::empty();
        let code = Code::new();
        assert!(owner(&code, &ring).is_none());
    }

    #[test]
    fn single_member_owns_everything() {
        let ring = Ring::from_members(members(1));
        for i in 0..50 {
            let code = Code::from(format!("code-{i}"));
            assert_eq!(owner(&code, &ring).unwrap().as_str(), "node-0");
        }
    }

    proptest! {
        /// Owner stability: adding one member to an N-node ring disturbs
        /// only a small fraction of assignments, bounded generously at 4/N
        /// plus a fixed slack to absorb hashring's finite-replica variance
        /// at small N.
        #[test]
        fn owner_stability_on_join(n in 5usize..40, seed in 0u64..1000) {
            let before_members = members(n);
            let before = Ring::from_members(before_members.clone());

            let codes: Vec<Code> = (0..500)
                .map(|i| Code::from(format!("seed-{seed}-code-{i}")))
                .collect();
            let before_owners: Vec<_> = codes.iter().map(|c| owner(c, &before).cloned()).collect();

            let mut after_members = before_members;
            after_members.push(NodeName::new(format!("node-new-{seed}")));
            let after = Ring::from_members(after_members);
            let after_owners: Vec<_> = codes.iter().map(|c| owner(c, &after).cloned()).collect();

            let changed = before_owners
                .iter()
                .zip(after_owners.iter())
                .filter(|(a, b)| a != b)
                .count();

            let bound = (codes.len() * 4 / n) + (codes.len() / 20);
            prop_assert!(
                changed <= bound,
                "changed {changed} of {} assignments exceeds bound {bound} for n={n}",
                codes.len()
            );
        }
    }
}
