use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use slotmap::SlotMap;

use crate::error::{Error, Result};
use crate::ids::{ObjectId, ObjectKey, ObjectType, PropertyKey, UserId};
use crate::property::{PropertyStore, PropertyTree};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u8 {
        /// Ephemeral state (cursors, brushes); never persisted by the authority.
        const TRANSIENT = 0b0000_0001;
        /// Acknowledged by the authority.
        const SYNCING = 0b0000_0010;
        const LOCKABLE = 0b0000_0100;
    }
}

/// Lifecycle of a node.
///
/// `Unsynced -> PendingCreate -> Synced -> DeletePending -> Deleted`. A `Deleted` node is
/// retained (cleared) so that it can be recreated without losing its handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SyncState {
    Unsynced,
    PendingCreate,
    Synced,
    DeletePending,
    Deleted,
}

/// A node in the replicated tree.
#[derive(Clone, Debug)]
pub struct ReplicatedObject {
    pub(crate) id: ObjectId,
    pub(crate) kind: ObjectType,
    pub(crate) property: Option<PropertyKey>,
    pub(crate) parent: Option<ObjectKey>,
    pub(crate) children: Vec<ObjectKey>,
    pub(crate) flags: ObjectFlags,
    pub(crate) state: SyncState,
    pub(crate) locked: bool,
    pub(crate) lock_owner: Option<UserId>,
}

impl ReplicatedObject {
    fn new(kind: ObjectType, flags: ObjectFlags) -> Self {
        Self {
            id: ObjectId::UNASSIGNED,
            kind,
            property: None,
            parent: None,
            children: Vec::new(),
            flags,
            state: SyncState::Unsynced,
            locked: false,
            lock_owner: None,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectType {
        self.kind
    }

    pub fn property(&self) -> Option<PropertyKey> {
        self.property
    }

    pub fn parent(&self) -> Option<ObjectKey> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectKey] {
        &self.children
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_syncing(&self) -> bool {
        self.flags.contains(ObjectFlags::SYNCING)
    }

    pub fn is_transient(&self) -> bool {
        self.flags.contains(ObjectFlags::TRANSIENT)
    }

    /// Whether the authority reports the node as locked (by anyone).
    pub fn is_locked(&self) -> bool {
        self.locked || self.lock_owner.is_some()
    }

    pub fn lock_owner(&self) -> Option<UserId> {
        self.lock_owner
    }

    fn is_live(&self) -> bool {
        self.state != SyncState::Deleted
    }
}

/// Arena-backed replicated object tree plus the property store its nodes own.
#[derive(Debug, Default)]
pub struct ObjectGraph {
    objects: SlotMap<ObjectKey, ReplicatedObject>,
    by_id: HashMap<ObjectId, ObjectKey>,
    retired: HashSet<ObjectId>,
    roots: Vec<ObjectKey>,
    properties: PropertyStore,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a local node with id 0. Inserted at `index` under `parent` (default: end).
    pub fn create(
        &mut self,
        kind: ObjectType,
        property: Option<&PropertyTree>,
        parent: Option<ObjectKey>,
        index: Option<usize>,
    ) -> Result<ObjectKey> {
        self.check_parent(kind, parent)?;
        let key = self.objects.insert(ReplicatedObject::new(kind, ObjectFlags::empty()));
        self.install_property(key, property)?;
        self.link(key, parent, index.unwrap_or(usize::MAX));
        Ok(key)
    }

    /// Materialise a node the authority created. A node retained after losing visibility of
    /// the same id is reused, keeping its handle.
    pub fn create_remote(
        &mut self,
        id: ObjectId,
        kind: ObjectType,
        property: Option<&PropertyTree>,
        parent: Option<ObjectKey>,
        index: usize,
        flags: ObjectFlags,
    ) -> Result<ObjectKey> {
        if !id.is_assigned() {
            return Err(Error::Protocol("remote create without an id".into()));
        }
        if self.retired.contains(&id) {
            return Err(Error::Protocol(format!("remote create reuses retired id {id}")));
        }
        self.check_parent(kind, parent)?;
        let key = match self.by_id.get(&id).copied() {
            Some(existing) => {
                let node = self.node_mut(existing)?;
                if node.is_live() {
                    return Err(Error::Protocol(format!("duplicate remote create for {id}")));
                }
                if node.kind != kind {
                    return Err(Error::Protocol(format!(
                        "remote create of {id} as {kind}, previously {}",
                        node.kind
                    )));
                }
                existing
            }
            None => self.objects.insert(ReplicatedObject::new(kind, ObjectFlags::empty())),
        };
        let node = self.node_mut(key)?;
        node.id = id;
        node.state = SyncState::Synced;
        node.flags = flags | ObjectFlags::SYNCING;
        self.by_id.insert(id, key);
        self.install_property(key, property)?;
        self.link(key, parent, index);
        Ok(key)
    }

    /// The authority assigned `id` to a locally created node.
    pub fn confirm_create(&mut self, key: ObjectKey, id: ObjectId) -> Result<()> {
        if !id.is_assigned() {
            return Err(Error::Protocol("confirm with unassigned id".into()));
        }
        if self.retired.contains(&id) {
            return Err(Error::Protocol(format!("confirm reuses retired id {id}")));
        }
        if let Some(other) = self.by_id.get(&id) {
            if *other != key {
                return Err(Error::Protocol(format!("id {id} is already bound to another object")));
            }
        }
        let node = self.node_mut(key)?;
        if node.state == SyncState::Deleted {
            return Err(Error::Protocol(format!("confirm {id} for a deleted object")));
        }
        if node.id == id && node.is_syncing() {
            return Err(Error::Protocol(format!("duplicate confirm for {id}")));
        }
        let previous = node.id;
        node.id = id;
        node.flags.insert(ObjectFlags::SYNCING);
        if matches!(node.state, SyncState::Unsynced | SyncState::PendingCreate) {
            node.state = SyncState::Synced;
        }
        if previous.is_assigned() && previous != id && self.by_id.get(&previous) == Some(&key) {
            self.by_id.remove(&previous);
        }
        self.by_id.insert(id, key);
        Ok(())
    }

    /// Record that the create request for `key` went out.
    pub fn mark_sent(&mut self, key: ObjectKey) -> Result<()> {
        let node = self.node_mut(key)?;
        if node.state == SyncState::Unsynced {
            node.state = SyncState::PendingCreate;
        }
        Ok(())
    }

    /// Mark the subtree DeletePending. Returns false if it already was.
    pub fn delete(&mut self, key: ObjectKey) -> Result<bool> {
        let node = self.live(key)?;
        if node.state == SyncState::DeletePending {
            return Ok(false);
        }
        for k in self.descendants(key) {
            if let Some(node) = self.objects.get_mut(k) {
                node.state = SyncState::DeletePending;
            }
        }
        Ok(true)
    }

    /// Remove the subtree from the tree, keeping each node as a cleared, reusable shell.
    ///
    /// Returns the removed nodes top-down; empty when the node was already removed.
    /// `from_unsubscribe` keeps ids mapped so a later re-subscription reuses the same nodes;
    /// otherwise the ids are retired and never bound again.
    pub fn confirm_delete(
        &mut self,
        key: ObjectKey,
        from_unsubscribe: bool,
    ) -> Result<Vec<ObjectKey>> {
        let node = self.node(key)?;
        if node.state == SyncState::Deleted {
            return Ok(Vec::new());
        }
        let removed = self.descendants(key);
        self.unlink(key);
        for k in &removed {
            let Some(node) = self.objects.get_mut(*k) else {
                continue;
            };
            let property = node.property.take();
            node.children.clear();
            node.parent = None;
            node.state = SyncState::Deleted;
            node.flags.remove(ObjectFlags::SYNCING);
            node.locked = false;
            node.lock_owner = None;
            let id = node.id;
            if let Some(property) = property {
                self.properties.release(property)?;
            }
            if id.is_assigned() && !from_unsubscribe {
                if self.by_id.get(&id) == Some(k) {
                    self.by_id.remove(&id);
                }
                self.retired.insert(id);
            }
        }
        Ok(removed)
    }

    /// Bring a deleted node back as a new local create.
    pub fn recreate(
        &mut self,
        key: ObjectKey,
        property: Option<&PropertyTree>,
        parent: Option<ObjectKey>,
        index: Option<usize>,
    ) -> Result<()> {
        let kind = self.node(key)?.kind;
        if self.node(key)?.is_live() {
            return Err(Error::InvalidOperation("recreate of a live object".into()));
        }
        self.check_parent(kind, parent)?;
        let node = self.node_mut(key)?;
        node.state = SyncState::Unsynced;
        node.flags.remove(ObjectFlags::SYNCING);
        self.install_property(key, property)?;
        self.link(key, parent, index.unwrap_or(usize::MAX));
        Ok(())
    }

    /// Permanently free a removed node. Its handle becomes stale.
    pub fn release(&mut self, key: ObjectKey) -> Result<()> {
        if self.node(key)?.is_live() {
            return Err(Error::InvalidOperation("release of a live object".into()));
        }
        if let Some(node) = self.objects.remove(key) {
            if self.by_id.get(&node.id) == Some(&key) {
                self.by_id.remove(&node.id);
            }
        }
        Ok(())
    }

    /// Reorder a node among its siblings.
    pub fn set_child_index(&mut self, key: ObjectKey, new_index: usize) -> Result<()> {
        let parent = self.live(key)?.parent;
        let siblings = match parent {
            Some(p) => &mut self.node_mut(p)?.children,
            None => &mut self.roots,
        };
        let Some(current) = siblings.iter().position(|c| *c == key) else {
            return Err(Error::Protocol("object missing from its parent's children".into()));
        };
        siblings.remove(current);
        let index = new_index.min(siblings.len());
        siblings.insert(index, key);
        Ok(())
    }

    /// Reparent a node. Moves, never copies.
    pub fn move_to(
        &mut self,
        key: ObjectKey,
        new_parent: Option<ObjectKey>,
        index: usize,
    ) -> Result<()> {
        let node = self.live(key)?;
        if node.parent == new_parent {
            return self.set_child_index(key, index);
        }
        let kind = node.kind;
        self.check_parent(kind, new_parent)?;
        if let Some(p) = new_parent {
            if p == key || self.ancestors(p).contains(&key) {
                return Err(Error::Protocol("move would introduce a cycle".into()));
            }
        }
        self.unlink(key);
        self.link(key, new_parent, index);
        Ok(())
    }

    /// Move every child of `from` to the end of `to`, preserving their order.
    pub fn migrate_children(&mut self, from: ObjectKey, to: ObjectKey) -> Result<Vec<ObjectKey>> {
        let children = self.live(from)?.children.clone();
        for child in &children {
            self.move_to(*child, Some(to), usize::MAX)?;
        }
        Ok(children)
    }

    pub fn set_lock_state(
        &mut self,
        key: ObjectKey,
        locked: bool,
        owner: Option<UserId>,
    ) -> Result<(bool, Option<UserId>)> {
        let node = self.live_mut(key)?;
        let previous = (node.locked, node.lock_owner);
        node.locked = locked;
        node.lock_owner = owner;
        Ok(previous)
    }

    pub fn insert_flags(&mut self, key: ObjectKey, flags: ObjectFlags) -> Result<()> {
        self.node_mut(key)?.flags.insert(flags);
        Ok(())
    }

    pub fn get(&self, key: ObjectKey) -> Option<&ReplicatedObject> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    pub fn is_live(&self, key: ObjectKey) -> bool {
        self.objects.get(key).map(|n| n.is_live()).unwrap_or(false)
    }

    /// Live node currently bound to `id`.
    pub fn get_by_id(&self, id: ObjectId) -> Option<ObjectKey> {
        self.by_id.get(&id).copied().filter(|k| self.is_live(*k))
    }

    /// Node bound to `id`, including nodes retained after an unsubscribe.
    pub fn lookup_id(&self, id: ObjectId) -> Option<ObjectKey> {
        self.by_id.get(&id).copied()
    }

    pub fn kind(&self, key: ObjectKey) -> Option<ObjectType> {
        self.objects.get(key).map(|n| n.kind)
    }

    pub fn id(&self, key: ObjectKey) -> Option<ObjectId> {
        self.objects.get(key).map(|n| n.id)
    }

    pub fn state(&self, key: ObjectKey) -> Option<SyncState> {
        self.objects.get(key).map(|n| n.state)
    }

    pub fn property(&self, key: ObjectKey) -> Option<PropertyKey> {
        self.objects.get(key).and_then(|n| n.property)
    }

    pub fn parent(&self, key: ObjectKey) -> Option<ObjectKey> {
        self.objects.get(key).and_then(|n| n.parent)
    }

    pub fn children(&self, key: ObjectKey) -> &[ObjectKey] {
        self.objects
            .get(key)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> &[ObjectKey] {
        &self.roots
    }

    pub fn child_index(&self, key: ObjectKey) -> Option<usize> {
        let siblings = match self.parent(key) {
            Some(p) => self.children(p),
            None => self.roots.as_slice(),
        };
        siblings.iter().position(|c| *c == key)
    }

    /// Ids of the children of `key`, in order. Unacknowledged children report id 0.
    pub fn child_ids(&self, key: ObjectKey) -> Vec<ObjectId> {
        self.children(key)
            .iter()
            .filter_map(|c| self.id(*c))
            .collect()
    }

    /// Pre-order walk of the subtree rooted at `key`, `key` first.
    pub fn descendants(&self, key: ObjectKey) -> Vec<ObjectKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            if !self.objects.contains_key(k) {
                continue;
            }
            out.push(k);
            stack.extend(self.children(k).iter().rev());
        }
        out
    }

    /// Ancestors of `key`, nearest first.
    pub fn ancestors(&self, key: ObjectKey) -> Vec<ObjectKey> {
        let mut out = Vec::new();
        let mut current = self.parent(key);
        while let Some(p) = current {
            if out.contains(&p) {
                break;
            }
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    pub fn count_live(&self, kind: ObjectType) -> usize {
        self.objects
            .values()
            .filter(|n| n.kind == kind && n.is_live())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectKey, &ReplicatedObject)> {
        self.objects.iter()
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyStore {
        &mut self.properties
    }

    /// Follow a reference field to the node it currently points at. `None` when the target
    /// does not exist right now, which is an expected state.
    pub fn resolve(&self, dict: PropertyKey, field: &str) -> Option<ObjectKey> {
        let target = self.properties.get_value(dict, field)?.as_reference()?;
        self.get_by_id(target)
    }

    /// Validate parent/child consistency, sibling uniqueness and acyclicity.
    /// Intended for tests and debugging.
    pub fn validate_invariants(&self) -> Result<()> {
        for (key, node) in &self.objects {
            let mut seen = HashSet::new();
            for child in &node.children {
                if !seen.insert(child) {
                    return Err(Error::InvalidOperation("duplicate child entry".into()));
                }
                match self.objects.get(*child) {
                    Some(c) if c.parent == Some(key) => {}
                    Some(_) => return Err(Error::InvalidOperation("child parent mismatch".into())),
                    None => {
                        return Err(Error::InvalidOperation("child not present in graph".into()))
                    }
                }
            }
            if node.is_live() {
                let listed = match node.parent {
                    Some(p) => self.children(p).contains(&key),
                    None => self.roots.contains(&key),
                };
                if !listed {
                    return Err(Error::InvalidOperation("live object not linked".into()));
                }
            }
            let mut visited = HashSet::new();
            let mut current = Some(key);
            while let Some(n) = current {
                if !visited.insert(n) {
                    return Err(Error::InvalidOperation("cycle detected".into()));
                }
                current = self.parent(n);
            }
        }
        Ok(())
    }

    fn check_parent(&self, kind: ObjectType, parent: Option<ObjectKey>) -> Result<()> {
        let parent_kind = match parent {
            Some(p) => Some(self.live(p)?.kind),
            None => None,
        };
        if !kind.accepts_parent(parent_kind) {
            return Err(Error::Protocol(match parent_kind {
                Some(pk) => format!("{kind} cannot be a child of {pk}"),
                None => format!("{kind} requires a parent"),
            }));
        }
        Ok(())
    }

    fn install_property(&mut self, key: ObjectKey, property: Option<&PropertyTree>) -> Result<()> {
        let tree = property.cloned().unwrap_or_else(PropertyTree::empty_dictionary);
        let root = self.properties.import(&tree);
        self.properties.attach(root, key)?;
        if let Some(old) = self.node_mut(key)?.property.replace(root) {
            self.properties.release(old)?;
        }
        Ok(())
    }

    fn link(&mut self, key: ObjectKey, parent: Option<ObjectKey>, index: usize) {
        let siblings = match parent.and_then(|p| self.objects.get_mut(p)) {
            Some(p) => &mut p.children,
            None => &mut self.roots,
        };
        let index = index.min(siblings.len());
        siblings.insert(index, key);
        if let Some(node) = self.objects.get_mut(key) {
            node.parent = parent;
        }
    }

    fn unlink(&mut self, key: ObjectKey) {
        let parent = self.parent(key);
        match parent.and_then(|p| self.objects.get_mut(p)) {
            Some(p) => p.children.retain(|c| *c != key),
            None => self.roots.retain(|c| *c != key),
        }
        if let Some(node) = self.objects.get_mut(key) {
            node.parent = None;
        }
    }

    fn node(&self, key: ObjectKey) -> Result<&ReplicatedObject> {
        self.objects
            .get(key)
            .ok_or_else(|| Error::UnknownObject("stale object handle".into()))
    }

    fn node_mut(&mut self, key: ObjectKey) -> Result<&mut ReplicatedObject> {
        self.objects
            .get_mut(key)
            .ok_or_else(|| Error::UnknownObject("stale object handle".into()))
    }

    fn live(&self, key: ObjectKey) -> Result<&ReplicatedObject> {
        let node = self.node(key)?;
        if !node.is_live() {
            return Err(Error::InvalidOperation("object has been deleted".into()));
        }
        Ok(node)
    }

    fn live_mut(&mut self, key: ObjectKey) -> Result<&mut ReplicatedObject> {
        let node = self.node_mut(key)?;
        if !node.is_live() {
            return Err(Error::InvalidOperation("object has been deleted".into()));
        }
        Ok(node)
    }
}
