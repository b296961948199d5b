use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::graph::{ObjectGraph, SyncState};
use crate::ids::{HostKey, ObjectKey};

/// Outcome of a duplicate-create tie-break. The winner holds the lower authority id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub winner: ObjectKey,
    pub loser: ObjectKey,
}

/// Order in which a chain of dependents can be removed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemovalPlan<K> {
    /// Safe removals, deepest dependent first, the root last.
    pub order: Vec<K>,
    /// Entries that sit on or above a dependency cycle and must not be removed.
    pub blocked: Vec<K>,
    pub cycles: Vec<Vec<K>>,
}

impl<K> Default for RemovalPlan<K> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            blocked: Vec::new(),
            cycles: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistoryKind {
    Undo,
    Redo,
}

#[derive(Clone, Copy)]
enum Mark {
    Active,
    Done(bool),
}

struct Frame<K> {
    node: K,
    dependents: std::vec::IntoIter<K>,
    safe: bool,
}

/// Compute the removal order for `root` and everything that (transitively) depends on it.
pub fn plan_removal<K, F>(root: K, mut dependents: F) -> RemovalPlan<K>
where
    K: Copy + Eq + Hash,
    F: FnMut(K) -> Vec<K>,
{
    let mut plan = RemovalPlan::default();
    let mut marks = HashMap::from([(root, Mark::Active)]);
    let mut frames = vec![Frame {
        node: root,
        dependents: dependents(root).into_iter(),
        safe: true,
    }];
    loop {
        let Some(frame) = frames.last_mut() else {
            break;
        };
        let Some(dep) = frame.dependents.next() else {
            let Some(Frame { node, safe, .. }) = frames.pop() else {
                break;
            };
            marks.insert(node, Mark::Done(safe));
            if safe {
                plan.order.push(node);
            } else {
                plan.blocked.push(node);
            }
            if let Some(parent) = frames.last_mut() {
                parent.safe &= safe;
            }
            continue;
        };
        match marks.get(&dep).copied() {
            Some(Mark::Active) => {
                let start = frames.iter().position(|f| f.node == dep).unwrap_or(0);
                plan.cycles.push(frames[start..].iter().map(|f| f.node).collect());
                if let Some(frame) = frames.last_mut() {
                    frame.safe = false;
                }
            }
            Some(Mark::Done(safe)) => {
                if let Some(frame) = frames.last_mut() {
                    frame.safe &= safe;
                }
            }
            None => {
                marks.insert(dep, Mark::Active);
                frames.push(Frame {
                    node: dep,
                    dependents: dependents(dep).into_iter(),
                    safe: true,
                });
            }
        }
    }
    plan
}

/// Detects soft conflicts between independently created nodes and tracks undo/redo safety.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    identities: HashMap<ObjectKey, String>,
    pending: Vec<(ObjectKey, ObjectKey)>,
    unsafe_structures: HashSet<HostKey>,
    history: Option<HistoryKind>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the identifying key (e.g. source prefab file id) of a node.
    pub fn track(&mut self, key: ObjectKey, identity: impl Into<String>) {
        self.identities.insert(key, identity.into());
    }

    pub fn untrack(&mut self, key: ObjectKey) {
        self.identities.remove(&key);
        self.pending.retain(|(a, b)| *a != key && *b != key);
    }

    pub fn identity(&self, key: ObjectKey) -> Option<&str> {
        self.identities.get(&key).map(String::as_str)
    }

    /// A live sibling of `key` carrying the same identifying key.
    pub fn find_duplicate(&self, graph: &ObjectGraph, key: ObjectKey) -> Option<ObjectKey> {
        let identity = self.identities.get(&key)?;
        let siblings = match graph.parent(key) {
            Some(parent) => graph.children(parent),
            None => graph.roots(),
        };
        siblings.iter().copied().find(|s| {
            *s != key
                && graph.state(*s).is_some_and(|state| {
                    !matches!(state, SyncState::DeletePending | SyncState::Deleted)
                })
                && self.identities.get(s) == Some(identity)
        })
    }

    /// Tie-break two duplicates by authority id; `None` until both have one.
    pub fn resolve(&self, graph: &ObjectGraph, a: ObjectKey, b: ObjectKey) -> Option<Resolution> {
        let a_id = graph.id(a)?;
        let b_id = graph.id(b)?;
        if !a_id.is_assigned() || !b_id.is_assigned() || a_id == b_id {
            return None;
        }
        Some(if a_id < b_id {
            Resolution { winner: a, loser: b }
        } else {
            Resolution { winner: b, loser: a }
        })
    }

    /// Park a duplicate pair until both sides are acknowledged.
    pub fn defer(&mut self, a: ObjectKey, b: ObjectKey) {
        let known = self
            .pending
            .iter()
            .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a));
        if !known {
            self.pending.push((a, b));
        }
    }

    pub fn is_pending(&self, key: ObjectKey) -> bool {
        self.pending.iter().any(|(a, b)| *a == key || *b == key)
    }

    /// Resolutions for parked pairs that can now be decided. Pairs with a side that went
    /// away are dropped.
    pub fn take_ready(&mut self, graph: &ObjectGraph) -> Vec<Resolution> {
        let mut ready = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        for (a, b) in pending {
            let alive = |k: ObjectKey| {
                matches!(
                    graph.state(k),
                    Some(SyncState::Unsynced | SyncState::PendingCreate | SyncState::Synced)
                )
            };
            if !alive(a) || !alive(b) {
                continue;
            }
            match self.resolve(graph, a, b) {
                Some(resolution) => ready.push(resolution),
                None => self.pending.push((a, b)),
            }
        }
        ready
    }

    pub fn begin_history(&mut self, kind: HistoryKind) {
        self.history = Some(kind);
    }

    pub fn end_history(&mut self) {
        self.history = None;
    }

    pub fn history(&self) -> Option<HistoryKind> {
        self.history
    }

    /// An undo recreated a structure the authority had locked; a redo of it is unsafe.
    pub fn mark_unsafe(&mut self, entity: HostKey) {
        self.unsafe_structures.insert(entity);
    }

    pub fn is_unsafe(&self, entity: HostKey) -> bool {
        self.unsafe_structures.contains(&entity)
    }

    pub fn clear_unsafe(&mut self, entity: HostKey) {
        self.unsafe_structures.remove(&entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObjectFlags;
    use crate::ids::{ObjectId, ObjectType};

    #[test]
    fn dependents_are_removed_deepest_first() {
        // 3 requires 2 requires 1
        let deps: HashMap<u32, Vec<u32>> = HashMap::from([(1, vec![2]), (2, vec![3]), (3, vec![])]);
        let plan = plan_removal(1, |k| deps.get(&k).cloned().unwrap_or_default());
        assert_eq!(plan.order, vec![3, 2, 1]);
        assert!(plan.cycles.is_empty());
    }

    #[test]
    fn cycles_abort_their_chain_only() {
        // 1 <- 2 <- 3 <- 2 forms a cycle; 4 depends on 1 independently.
        let deps: HashMap<u32, Vec<u32>> =
            HashMap::from([(1, vec![2, 4]), (2, vec![3]), (3, vec![2]), (4, vec![])]);
        let plan = plan_removal(1, |k| deps.get(&k).cloned().unwrap_or_default());
        assert_eq!(plan.cycles, vec![vec![2, 3]]);
        assert_eq!(plan.order, vec![4]);
        assert!(plan.blocked.contains(&1));
        assert!(plan.blocked.contains(&2));
        assert!(plan.blocked.contains(&3));
    }

    #[test]
    fn long_dependency_chains_are_planned() {
        let depth = 200_000u32;
        let plan = plan_removal(0, |k| if k < depth { vec![k + 1] } else { Vec::new() });
        assert_eq!(plan.order.len(), depth as usize + 1);
        assert_eq!(plan.order.first(), Some(&depth));
        assert_eq!(plan.order.last(), Some(&0));
        assert!(plan.blocked.is_empty());
    }

    #[test]
    fn lower_authority_id_wins() {
        let mut graph = ObjectGraph::new();
        let mut resolver = ConflictResolver::new();
        let a = graph.create(ObjectType::Asset, None, None, None).unwrap();
        let b = graph
            .create_remote(ObjectId(5), ObjectType::Asset, None, None, 0, ObjectFlags::empty())
            .unwrap();
        resolver.track(a, "prefab:7");
        resolver.track(b, "prefab:7");
        assert_eq!(resolver.find_duplicate(&graph, b), Some(a));

        assert_eq!(resolver.resolve(&graph, a, b), None);
        resolver.defer(a, b);
        resolver.defer(b, a);
        assert!(resolver.take_ready(&graph).is_empty());
        assert!(resolver.is_pending(a));

        graph.confirm_create(a, ObjectId(7)).unwrap();
        let ready = resolver.take_ready(&graph);
        assert_eq!(ready, vec![Resolution { winner: b, loser: a }]);
        assert!(!resolver.is_pending(a));
    }

    #[test]
    fn unsafe_structures_are_remembered() {
        let mut resolver = ConflictResolver::new();
        resolver.begin_history(HistoryKind::Undo);
        resolver.mark_unsafe(HostKey(3));
        resolver.end_history();
        assert!(resolver.is_unsafe(HostKey(3)));
        assert_eq!(resolver.history(), None);
        resolver.clear_unsafe(HostKey(3));
        assert!(!resolver.is_unsafe(HostKey(3)));
    }
}
