use std::collections::HashMap;

use crate::error::Result;
use crate::graph::ObjectGraph;
use crate::ids::{ObjectKey, ObjectType, UserId};

/// Lock granularity, ordered `None < Partial < Full`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LockLevel {
    /// Freely editable.
    #[default]
    None,
    /// Property edits on this exact node are blocked; children stay editable.
    Partial,
    /// The node and all its descendants are blocked from local edits.
    Full,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditKind {
    Property,
    Structure,
}

/// Outcome of gating a local host edit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditGate {
    Allow,
    /// The host change must be undone and the replicated state re-applied.
    Revert,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockTransition {
    pub object: ObjectKey,
    pub before: LockLevel,
    pub after: LockLevel,
    pub owner_before: Option<UserId>,
    pub owner_after: Option<UserId>,
}

impl LockTransition {
    pub fn owner_changed(&self) -> bool {
        self.owner_before != self.owner_after
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StaleReason {
    Locked,
    Unlocked,
    OwnerChanged,
}

/// Delivered to stale hooks when a node's effective lock or owner changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StaleNotice {
    pub object: ObjectKey,
    pub kind: ObjectType,
    pub reason: StaleReason,
    pub level: LockLevel,
}

pub type StaleHook = Box<dyn FnMut(&StaleNotice)>;

/// Derives effective lock levels from the graph and gates local edits.
///
/// Effective level is `max(own, inherited)` where only a Full lock is inherited from an
/// ancestor. Results are cached per node and invalidated down the subtree on change.
pub struct LockManager {
    local_user: UserId,
    cache: HashMap<ObjectKey, LockLevel>,
    hooks: HashMap<ObjectType, Vec<StaleHook>>,
}

impl LockManager {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            cache: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Register a callback that marks host-side state stale for nodes of `kind`.
    pub fn on_stale(&mut self, kind: ObjectType, hook: StaleHook) {
        self.hooks.entry(kind).or_default().push(hook);
    }

    /// Lock level of the node itself, ignoring ancestors.
    pub fn own_lock(&self, graph: &ObjectGraph, key: ObjectKey) -> LockLevel {
        let Some(node) = graph.get(key) else {
            return LockLevel::None;
        };
        match node.lock_owner() {
            Some(owner) if owner != self.local_user => LockLevel::Full,
            Some(_) => LockLevel::None,
            None if node.locked => LockLevel::Partial,
            None => LockLevel::None,
        }
    }

    pub fn effective_lock(&mut self, graph: &ObjectGraph, key: ObjectKey) -> LockLevel {
        if let Some(level) = self.cache.get(&key) {
            return *level;
        }
        if !graph.is_live(key) {
            return LockLevel::None;
        }
        let inherited = match graph.parent(key) {
            Some(parent) if self.effective_lock(graph, parent) == LockLevel::Full => {
                LockLevel::Full
            }
            _ => LockLevel::None,
        };
        let level = self.own_lock(graph, key).max(inherited);
        self.cache.insert(key, level);
        level
    }

    /// Uncached computation, for read-only contexts.
    pub fn compute_lock(&self, graph: &ObjectGraph, key: ObjectKey) -> LockLevel {
        let own = self.own_lock(graph, key);
        let inherited = graph
            .ancestors(key)
            .into_iter()
            .any(|a| self.own_lock(graph, a) == LockLevel::Full);
        if inherited {
            LockLevel::Full
        } else {
            own
        }
    }

    /// Drop cached levels for the subtree rooted at `key`.
    pub fn invalidate(&mut self, graph: &ObjectGraph, key: ObjectKey) {
        for k in graph.descendants(key) {
            self.cache.remove(&k);
        }
    }

    pub fn forget(&mut self, key: ObjectKey) {
        self.cache.remove(&key);
    }

    /// Apply an authority lock update, fire stale hooks for every node whose effective lock
    /// changed, and report the transition of `key` itself.
    pub fn apply_lock(
        &mut self,
        graph: &mut ObjectGraph,
        key: ObjectKey,
        locked: bool,
        owner: Option<UserId>,
    ) -> Result<Option<LockTransition>> {
        let subtree = graph.descendants(key);
        let before: Vec<LockLevel> = subtree
            .iter()
            .map(|k| self.effective_lock(graph, *k))
            .collect();
        let (_, owner_before) = graph.set_lock_state(key, locked, owner)?;
        self.invalidate(graph, key);

        let mut transition = None;
        for (k, before) in subtree.iter().zip(before) {
            let after = self.effective_lock(graph, *k);
            let owner_changed = *k == key && owner_before != owner;
            if before == after && !owner_changed {
                continue;
            }
            let reason = if after > before {
                StaleReason::Locked
            } else if after < before {
                StaleReason::Unlocked
            } else {
                StaleReason::OwnerChanged
            };
            if let Some(kind) = graph.kind(*k) {
                self.notify(&StaleNotice {
                    object: *k,
                    kind,
                    reason,
                    level: after,
                });
            }
            if *k == key {
                transition = Some(LockTransition {
                    object: key,
                    before,
                    after,
                    owner_before,
                    owner_after: owner,
                });
            }
        }
        Ok(transition)
    }

    /// Decide whether a local host edit may be applied to `key`.
    pub fn gate(&mut self, graph: &ObjectGraph, key: ObjectKey, edit: EditKind) -> EditGate {
        match (edit, self.effective_lock(graph, key)) {
            (_, LockLevel::None) => EditGate::Allow,
            (EditKind::Structure, LockLevel::Partial) => EditGate::Allow,
            _ => EditGate::Revert,
        }
    }

    fn notify(&mut self, notice: &StaleNotice) {
        if let Some(hooks) = self.hooks.get_mut(&notice.kind) {
            for hook in hooks {
                hook(notice);
            }
        }
    }
}
