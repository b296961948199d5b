use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use slotmap::SlotMap;

use crate::error::{Error, Result};
use crate::ids::{ObjectId, ObjectKey, PropertyKey};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Leaf scalar held by a property.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Points at another replicated object by its authority id.
    Reference(ObjectId),
}

impl Value {
    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Reference(v)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PropertyKind {
    Value,
    Dictionary,
    List,
}

/// Detached, owned form of a property subtree.
///
/// This is what crosses the session boundary. Dictionaries use a sorted map, so two trees with
/// the same key set compare equal regardless of insertion order.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PropertyTree {
    Value(Value),
    Dictionary(BTreeMap<String, PropertyTree>),
    List(Vec<PropertyTree>),
}

impl PropertyTree {
    pub fn empty_dictionary() -> Self {
        PropertyTree::Dictionary(BTreeMap::new())
    }

    pub fn dictionary<K: Into<String>>(
        fields: impl IntoIterator<Item = (K, PropertyTree)>,
    ) -> Self {
        PropertyTree::Dictionary(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = PropertyTree>) -> Self {
        PropertyTree::List(items.into_iter().collect())
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyTree::Value(_) => PropertyKind::Value,
            PropertyTree::Dictionary(_) => PropertyKind::Dictionary,
            PropertyTree::List(_) => PropertyKind::List,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyTree::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&PropertyTree> {
        match self {
            PropertyTree::Dictionary(map) => map.get(name),
            _ => None,
        }
    }
}

impl From<Value> for PropertyTree {
    fn from(v: Value) -> Self {
        PropertyTree::Value(v)
    }
}

macro_rules! tree_from_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for PropertyTree {
                fn from(v: $ty) -> Self {
                    PropertyTree::Value(Value::from(v))
                }
            }
        )*
    };
}

tree_from_scalar!(bool, i64, u64, f64, &str, String, ObjectId);

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a property relative to its root, e.g. `transform.position` or `materials[2]`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropertyPath(pub Vec<PathSegment>);

impl PropertyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a keys-only path from a dotted string.
    pub fn field(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(|s| PathSegment::Key(s.to_owned()))
                .collect(),
        )
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn parent(&self) -> Option<PropertyPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Dotted field names with list indices dropped. Used as the routing key for path handlers.
    pub fn field_path(&self) -> String {
        let names: Vec<&str> = self
            .0
            .iter()
            .filter_map(|s| match s {
                PathSegment::Key(k) => Some(k.as_str()),
                PathSegment::Index(_) => None,
            })
            .collect();
        names.join(".")
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(k) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

/// What happened to a property.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    /// A field, list element or leaf received a new value. `property` is the new node.
    Set {
        old: Option<PropertyTree>,
        new: PropertyTree,
    },
    /// A dictionary field was removed. `property` is the dictionary.
    Removed { old: PropertyTree },
    /// `count` elements were inserted at `index`. `property` is the list.
    ListInserted {
        index: usize,
        count: usize,
        items: Vec<PropertyTree>,
    },
    /// `count` elements were removed starting at `index`. `property` is the list.
    ListRemoved {
        index: usize,
        count: usize,
        removed: Vec<PropertyTree>,
    },
}

/// Change notification recorded by every mutation of the store.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyChange {
    pub container: Option<ObjectKey>,
    pub property: PropertyKey,
    pub path: PropertyPath,
    pub kind: ChangeKind,
}

#[derive(Clone, Debug)]
enum Node {
    Value(Value),
    Dictionary(HashMap<String, PropertyKey>),
    List(Vec<PropertyKey>),
}

#[derive(Clone, Debug)]
struct Slot {
    parent: Option<PropertyKey>,
    /// Field name when the parent is a dictionary.
    name: Option<String>,
    /// Owning object; only set on roots.
    container: Option<ObjectKey>,
    node: Node,
}

/// Self-contained description of one property mutation, as exchanged with the authority.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PropertyDelta {
    Set {
        path: PropertyPath,
        value: PropertyTree,
    },
    Remove {
        path: PropertyPath,
    },
    ListInsert {
        path: PropertyPath,
        index: usize,
        items: Vec<PropertyTree>,
    },
    ListRemove {
        path: PropertyPath,
        index: usize,
        count: usize,
    },
}

impl PropertyDelta {
    pub fn from_change(change: &PropertyChange) -> Self {
        let path = change.path.clone();
        match &change.kind {
            ChangeKind::Set { new, .. } => PropertyDelta::Set {
                path,
                value: new.clone(),
            },
            ChangeKind::Removed { .. } => PropertyDelta::Remove { path },
            ChangeKind::ListInserted { index, items, .. } => PropertyDelta::ListInsert {
                path,
                index: *index,
                items: items.clone(),
            },
            ChangeKind::ListRemoved { index, count, .. } => PropertyDelta::ListRemove {
                path,
                index: *index,
                count: *count,
            },
        }
    }

    pub fn path(&self) -> &PropertyPath {
        match self {
            PropertyDelta::Set { path, .. }
            | PropertyDelta::Remove { path }
            | PropertyDelta::ListInsert { path, .. }
            | PropertyDelta::ListRemove { path, .. } => path,
        }
    }
}

/// Arena of property nodes with parent links, container links and a reverse reference index.
#[derive(Debug, Default)]
pub struct PropertyStore {
    slots: SlotMap<PropertyKey, Slot>,
    references: HashMap<ObjectId, HashSet<PropertyKey>>,
    changes: Vec<PropertyChange>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a detached tree into the arena as a new, unattached root.
    pub fn import(&mut self, tree: &PropertyTree) -> PropertyKey {
        self.import_under(tree, None, None)
    }

    /// Encode the subtree rooted at `key`.
    pub fn export(&self, key: PropertyKey) -> Result<PropertyTree> {
        let slot = self.slot(key)?;
        Ok(match &slot.node {
            Node::Value(v) => PropertyTree::Value(v.clone()),
            Node::Dictionary(map) => {
                let mut out = BTreeMap::new();
                for (name, child) in map {
                    out.insert(name.clone(), self.export(*child)?);
                }
                PropertyTree::Dictionary(out)
            }
            Node::List(items) => PropertyTree::List(
                items
                    .iter()
                    .map(|child| self.export(*child))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    /// Bind a root to the object that owns it.
    pub fn attach(&mut self, root: PropertyKey, container: ObjectKey) -> Result<()> {
        let slot = self.slot_mut(root)?;
        if slot.parent.is_some() {
            return Err(Error::InvalidOperation(
                "only a root property can be attached to an object".into(),
            ));
        }
        slot.container = Some(container);
        Ok(())
    }

    /// Remove a subtree from the arena, detaching it from its parent first.
    pub fn release(&mut self, key: PropertyKey) -> Result<()> {
        let parent = self.slot(key)?.parent;
        if let Some(parent) = parent {
            if let Some(slot) = self.slots.get_mut(parent) {
                match &mut slot.node {
                    Node::Dictionary(map) => map.retain(|_, child| *child != key),
                    Node::List(items) => items.retain(|child| *child != key),
                    Node::Value(_) => {}
                }
            }
        }
        self.free_subtree(key);
        Ok(())
    }

    pub fn contains(&self, key: PropertyKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn kind(&self, key: PropertyKey) -> Option<PropertyKind> {
        self.slots.get(key).map(|slot| match slot.node {
            Node::Value(_) => PropertyKind::Value,
            Node::Dictionary(_) => PropertyKind::Dictionary,
            Node::List(_) => PropertyKind::List,
        })
    }

    pub fn parent(&self, key: PropertyKey) -> Option<PropertyKey> {
        self.slots.get(key).and_then(|slot| slot.parent)
    }

    /// The object owning the root of the subtree containing `key`.
    pub fn container(&self, key: PropertyKey) -> Option<ObjectKey> {
        let mut current = key;
        loop {
            let slot = self.slots.get(current)?;
            match slot.parent {
                Some(parent) => current = parent,
                None => return slot.container,
            }
        }
    }

    /// Path from the root of the subtree down to `key`.
    pub fn path(&self, key: PropertyKey) -> PropertyPath {
        let mut segments = Vec::new();
        let mut current = key;
        while let Some(slot) = self.slots.get(current) {
            let Some(parent) = slot.parent else {
                break;
            };
            match self.slots.get(parent).map(|p| &p.node) {
                Some(Node::Dictionary(_)) => {
                    segments.push(PathSegment::Key(slot.name.clone().unwrap_or_default()))
                }
                Some(Node::List(items)) => {
                    let index = items.iter().position(|c| *c == current).unwrap_or(0);
                    segments.push(PathSegment::Index(index));
                }
                _ => break,
            }
            current = parent;
        }
        segments.reverse();
        PropertyPath(segments)
    }

    /// Walk `path` down from `root`.
    pub fn resolve_path(&self, root: PropertyKey, path: &PropertyPath) -> Option<PropertyKey> {
        let mut current = root;
        for segment in &path.0 {
            current = match (&self.slots.get(current)?.node, segment) {
                (Node::Dictionary(map), PathSegment::Key(k)) => *map.get(k)?,
                (Node::List(items), PathSegment::Index(i)) => *items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn value(&self, key: PropertyKey) -> Option<&Value> {
        match &self.slots.get(key)?.node {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn get(&self, dict: PropertyKey, field: &str) -> Option<PropertyKey> {
        match &self.slots.get(dict)?.node {
            Node::Dictionary(map) => map.get(field).copied(),
            _ => None,
        }
    }

    pub fn get_value(&self, dict: PropertyKey, field: &str) -> Option<&Value> {
        self.get(dict, field).and_then(|key| self.value(key))
    }

    /// Field names of a dictionary, sorted.
    pub fn fields(&self, dict: PropertyKey) -> Vec<String> {
        match self.slots.get(dict).map(|slot| &slot.node) {
            Some(Node::Dictionary(map)) => {
                let mut names: Vec<String> = map.keys().cloned().collect();
                names.sort();
                names
            }
            _ => Vec::new(),
        }
    }

    /// Set a dictionary field, returning the prior value.
    pub fn set(
        &mut self,
        dict: PropertyKey,
        field: &str,
        tree: &PropertyTree,
    ) -> Result<Option<PropertyTree>> {
        let previous = match &self.slot(dict)?.node {
            Node::Dictionary(map) => map.get(field).copied(),
            _ => {
                return Err(Error::InvalidOperation(format!(
                    "cannot set field {field:?} on a non-dictionary property"
                )))
            }
        };
        let old = match previous {
            Some(prev) => {
                let exported = self.export(prev)?;
                self.free_subtree(prev);
                Some(exported)
            }
            None => None,
        };
        let child = self.import_under(tree, Some(dict), Some(field.to_owned()));
        if let Node::Dictionary(map) = &mut self.slot_mut(dict)?.node {
            map.insert(field.to_owned(), child);
        }
        self.record(
            child,
            self.path(child),
            ChangeKind::Set {
                old: old.clone(),
                new: tree.clone(),
            },
        );
        Ok(old)
    }

    pub fn set_value(
        &mut self,
        dict: PropertyKey,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Option<PropertyTree>> {
        self.set(dict, field, &PropertyTree::Value(value.into()))
    }

    pub fn set_reference(
        &mut self,
        dict: PropertyKey,
        field: &str,
        target: ObjectId,
    ) -> Result<Option<PropertyTree>> {
        self.set(dict, field, &PropertyTree::Value(Value::Reference(target)))
    }

    /// Replace the value of a leaf in place.
    pub fn set_leaf(&mut self, key: PropertyKey, value: Value) -> Result<Value> {
        let old = match &mut self.slot_mut(key)?.node {
            Node::Value(current) => std::mem::replace(current, value.clone()),
            _ => {
                return Err(Error::InvalidOperation(
                    "set_leaf called on a container property".into(),
                ))
            }
        };
        self.unindex(key, &old);
        self.index(key, &value);
        self.record(
            key,
            self.path(key),
            ChangeKind::Set {
                old: Some(PropertyTree::Value(old.clone())),
                new: PropertyTree::Value(value),
            },
        );
        Ok(old)
    }

    pub fn remove_field(&mut self, dict: PropertyKey, field: &str) -> Result<Option<PropertyTree>> {
        let removed = match &mut self.slot_mut(dict)?.node {
            Node::Dictionary(map) => map.remove(field),
            _ => {
                return Err(Error::InvalidOperation(format!(
                    "cannot remove field {field:?} from a non-dictionary property"
                )))
            }
        };
        let Some(removed) = removed else {
            return Ok(None);
        };
        let old = self.export(removed)?;
        self.free_subtree(removed);
        let path = self.path(dict).child(PathSegment::Key(field.to_owned()));
        self.record(dict, path, ChangeKind::Removed { old: old.clone() });
        Ok(Some(old))
    }

    pub fn list_len(&self, list: PropertyKey) -> Option<usize> {
        match &self.slots.get(list)?.node {
            Node::List(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn list_get(&self, list: PropertyKey, index: usize) -> Option<PropertyKey> {
        match &self.slots.get(list)?.node {
            Node::List(items) => items.get(index).copied(),
            _ => None,
        }
    }

    pub fn list_items(&self, list: PropertyKey) -> Vec<PropertyKey> {
        match self.slots.get(list).map(|slot| &slot.node) {
            Some(Node::List(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Insert `items` at `index`; reported as a single `(index, count)` range.
    pub fn insert(
        &mut self,
        list: PropertyKey,
        index: usize,
        items: &[PropertyTree],
    ) -> Result<()> {
        let len = self.list_len(list).ok_or_else(|| {
            Error::InvalidOperation("insert called on a non-list property".into())
        })?;
        if index > len {
            return Err(Error::InvalidOperation(format!(
                "list insert index {index} out of bounds (len {len})"
            )));
        }
        if items.is_empty() {
            return Ok(());
        }
        let children: Vec<PropertyKey> = items
            .iter()
            .map(|tree| self.import_under(tree, Some(list), None))
            .collect();
        if let Node::List(current) = &mut self.slot_mut(list)?.node {
            current.splice(index..index, children);
        }
        self.record(
            list,
            self.path(list),
            ChangeKind::ListInserted {
                index,
                count: items.len(),
                items: items.to_vec(),
            },
        );
        Ok(())
    }

    pub fn push(&mut self, list: PropertyKey, tree: &PropertyTree) -> Result<()> {
        let len = self.list_len(list).unwrap_or(0);
        self.insert(list, len, std::slice::from_ref(tree))
    }

    /// Remove `count` elements starting at `index`, returning them.
    pub fn remove_range(
        &mut self,
        list: PropertyKey,
        index: usize,
        count: usize,
    ) -> Result<Vec<PropertyTree>> {
        let len = self.list_len(list).ok_or_else(|| {
            Error::InvalidOperation("remove_range called on a non-list property".into())
        })?;
        let Some(end) = index.checked_add(count).filter(|end| *end <= len) else {
            return Err(Error::InvalidOperation(format!(
                "list range {index}+{count} out of bounds (len {len})"
            )));
        };
        if count == 0 {
            return Ok(Vec::new());
        }
        let drained: Vec<PropertyKey> = match &mut self.slot_mut(list)?.node {
            Node::List(current) => current.drain(index..end).collect(),
            _ => Vec::new(),
        };
        let mut removed = Vec::with_capacity(drained.len());
        for child in drained {
            removed.push(self.export(child)?);
            self.free_subtree(child);
        }
        self.record(
            list,
            self.path(list),
            ChangeKind::ListRemoved {
                index,
                count,
                removed: removed.clone(),
            },
        );
        Ok(removed)
    }

    /// Replace one list element, returning the prior element.
    pub fn set_element(
        &mut self,
        list: PropertyKey,
        index: usize,
        tree: &PropertyTree,
    ) -> Result<PropertyTree> {
        let previous = self.list_get(list, index).ok_or_else(|| {
            Error::InvalidOperation(format!("no list element at index {index}"))
        })?;
        let old = self.export(previous)?;
        self.free_subtree(previous);
        let child = self.import_under(tree, Some(list), None);
        if let Node::List(items) = &mut self.slot_mut(list)?.node {
            items[index] = child;
        }
        self.record(
            child,
            self.path(child),
            ChangeKind::Set {
                old: Some(old.clone()),
                new: tree.clone(),
            },
        );
        Ok(old)
    }

    /// Reference properties currently pointing at `target`.
    pub fn references_to(&self, target: ObjectId) -> Vec<PropertyKey> {
        self.references
            .get(&target)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn reference_target(&self, key: PropertyKey) -> Option<ObjectId> {
        self.value(key).and_then(Value::as_reference)
    }

    pub fn take_changes(&mut self) -> Vec<PropertyChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Apply a delta received from the authority to the subtree rooted at `root`.
    pub fn apply_delta(&mut self, root: PropertyKey, delta: &PropertyDelta) -> Result<()> {
        match delta {
            PropertyDelta::Set { path, value } => {
                let (parent, last) = self.split_path(root, path)?;
                match last {
                    PathSegment::Key(field) => {
                        self.set(parent, field, value)?;
                    }
                    PathSegment::Index(index) => {
                        if self.list_len(parent) == Some(*index) {
                            self.push(parent, value)?;
                        } else {
                            self.set_element(parent, *index, value)?;
                        }
                    }
                }
            }
            PropertyDelta::Remove { path } => {
                let (parent, last) = self.split_path(root, path)?;
                match last {
                    PathSegment::Key(field) => {
                        self.remove_field(parent, field)?;
                    }
                    PathSegment::Index(index) => {
                        self.remove_range(parent, *index, 1)?;
                    }
                }
            }
            PropertyDelta::ListInsert { path, index, items } => {
                let list = self.resolve_or_err(root, path)?;
                self.insert(list, *index, items)?;
            }
            PropertyDelta::ListRemove { path, index, count } => {
                let list = self.resolve_or_err(root, path)?;
                self.remove_range(list, *index, *count)?;
            }
        }
        Ok(())
    }

    fn resolve_or_err(&self, root: PropertyKey, path: &PropertyPath) -> Result<PropertyKey> {
        self.resolve_path(root, path)
            .ok_or_else(|| Error::Protocol(format!("property path {path} does not exist")))
    }

    fn split_path<'p>(
        &self,
        root: PropertyKey,
        path: &'p PropertyPath,
    ) -> Result<(PropertyKey, &'p PathSegment)> {
        let (Some(parent), Some(last)) = (path.parent(), path.last()) else {
            return Err(Error::Protocol("cannot replace a property root".into()));
        };
        Ok((self.resolve_or_err(root, &parent)?, last))
    }

    fn slot(&self, key: PropertyKey) -> Result<&Slot> {
        self.slots
            .get(key)
            .ok_or_else(|| Error::InvalidOperation("stale property handle".into()))
    }

    fn slot_mut(&mut self, key: PropertyKey) -> Result<&mut Slot> {
        self.slots
            .get_mut(key)
            .ok_or_else(|| Error::InvalidOperation("stale property handle".into()))
    }

    fn import_under(
        &mut self,
        tree: &PropertyTree,
        parent: Option<PropertyKey>,
        name: Option<String>,
    ) -> PropertyKey {
        let node = match tree {
            PropertyTree::Value(v) => Node::Value(v.clone()),
            PropertyTree::Dictionary(_) => Node::Dictionary(HashMap::new()),
            PropertyTree::List(_) => Node::List(Vec::new()),
        };
        let key = self.slots.insert(Slot {
            parent,
            name,
            container: None,
            node,
        });
        match tree {
            PropertyTree::Value(v) => self.index(key, v),
            PropertyTree::Dictionary(fields) => {
                let children: HashMap<String, PropertyKey> = fields
                    .iter()
                    .map(|(field, child)| {
                        (field.clone(), self.import_under(child, Some(key), Some(field.clone())))
                    })
                    .collect();
                if let Some(slot) = self.slots.get_mut(key) {
                    slot.node = Node::Dictionary(children);
                }
            }
            PropertyTree::List(items) => {
                let children: Vec<PropertyKey> = items
                    .iter()
                    .map(|child| self.import_under(child, Some(key), None))
                    .collect();
                if let Some(slot) = self.slots.get_mut(key) {
                    slot.node = Node::List(children);
                }
            }
        }
        key
    }

    fn free_subtree(&mut self, key: PropertyKey) {
        let Some(slot) = self.slots.remove(key) else {
            return;
        };
        match slot.node {
            Node::Value(v) => self.unindex(key, &v),
            Node::Dictionary(map) => {
                for child in map.into_values() {
                    self.free_subtree(child);
                }
            }
            Node::List(items) => {
                for child in items {
                    self.free_subtree(child);
                }
            }
        }
    }

    fn index(&mut self, key: PropertyKey, value: &Value) {
        if let Some(target) = value.as_reference() {
            if target.is_assigned() {
                self.references.entry(target).or_default().insert(key);
            }
        }
    }

    fn unindex(&mut self, key: PropertyKey, value: &Value) {
        if let Some(target) = value.as_reference() {
            if let Some(set) = self.references.get_mut(&target) {
                set.remove(&key);
                if set.is_empty() {
                    self.references.remove(&target);
                }
            }
        }
    }

    fn record(&mut self, property: PropertyKey, path: PropertyPath, kind: ChangeKind) {
        let container = self.container(property);
        self.changes.push(PropertyChange {
            container,
            property,
            path,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform() -> PropertyTree {
        PropertyTree::dictionary([
            ("name", PropertyTree::from("Box")),
            (
                "transform",
                PropertyTree::dictionary([(
                    "position",
                    PropertyTree::list([1.0.into(), 2.0.into(), 3.0.into()]),
                )]),
            ),
        ])
    }

    #[test]
    fn set_returns_prior_value_and_records_change() {
        let mut store = PropertyStore::new();
        let root = store.import(&transform());
        store.take_changes();

        let old = store.set_value(root, "name", "Crate").unwrap();
        assert_eq!(old, Some(PropertyTree::from("Box")));
        assert_eq!(store.get_value(root, "name"), Some(&Value::from("Crate")));

        let changes = store.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PropertyPath::field("name"));
        assert_eq!(
            changes[0].kind,
            ChangeKind::Set {
                old: Some(PropertyTree::from("Box")),
                new: PropertyTree::from("Crate"),
            }
        );
    }

    #[test]
    fn paths_include_list_indices() {
        let mut store = PropertyStore::new();
        let root = store.import(&transform());
        let position = store
            .resolve_path(root, &PropertyPath::field("transform.position"))
            .unwrap();
        let y = store.list_get(position, 1).unwrap();
        assert_eq!(store.path(y).to_string(), "transform.position[1]");
        assert_eq!(store.path(y).field_path(), "transform.position");
        assert_eq!(store.value(y), Some(&Value::Float(2.0)));
    }

    #[test]
    fn list_edits_are_reported_as_ranges() {
        let mut store = PropertyStore::new();
        let root = store.import(&PropertyTree::dictionary([(
            "components",
            PropertyTree::list(["a".into(), "d".into()]),
        )]));
        let list = store.get(root, "components").unwrap();
        store.take_changes();

        store
            .insert(list, 1, &["b".into(), "c".into()])
            .unwrap();
        let removed = store.remove_range(list, 0, 1).unwrap();
        assert_eq!(removed, vec![PropertyTree::from("a")]);

        let changes = store.take_changes();
        assert!(matches!(
            changes[0].kind,
            ChangeKind::ListInserted {
                index: 1,
                count: 2,
                ..
            }
        ));
        assert!(matches!(
            changes[1].kind,
            ChangeKind::ListRemoved {
                index: 0,
                count: 1,
                ..
            }
        ));
        assert_eq!(
            store.export(list).unwrap(),
            PropertyTree::list(["b".into(), "c".into(), "d".into()])
        );
    }

    #[test]
    fn out_of_bounds_list_edits_are_rejected() {
        let mut store = PropertyStore::new();
        let list = store.import(&PropertyTree::list([1i64.into()]));
        assert!(store.insert(list, 3, &[2i64.into()]).is_err());
        assert!(store.remove_range(list, 0, 2).is_err());
        assert_eq!(store.list_len(list), Some(1));
    }

    #[test]
    fn oversized_remote_list_removal_is_an_error() {
        let mut store = PropertyStore::new();
        let root = store.import(&PropertyTree::dictionary([(
            "l",
            PropertyTree::list([1i64.into(), 2i64.into()]),
        )]));
        let delta = PropertyDelta::ListRemove {
            path: PropertyPath::field("l"),
            index: 1,
            count: usize::MAX,
        };
        assert!(matches!(
            store.apply_delta(root, &delta),
            Err(Error::InvalidOperation(_))
        ));
        let list = store.get(root, "l").unwrap();
        assert_eq!(store.list_len(list), Some(2));
        assert!(!store.has_changes());
    }

    #[test]
    fn reverse_index_tracks_overwrites_and_release() {
        let mut store = PropertyStore::new();
        let root = store.import(&PropertyTree::empty_dictionary());
        store.set_reference(root, "mesh", ObjectId(7)).unwrap();
        assert_eq!(store.references_to(ObjectId(7)).len(), 1);

        store.set_reference(root, "mesh", ObjectId(8)).unwrap();
        assert!(store.references_to(ObjectId(7)).is_empty());
        assert_eq!(store.references_to(ObjectId(8)).len(), 1);

        store.release(root).unwrap();
        assert!(store.references_to(ObjectId(8)).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn container_is_found_from_nested_fields() {
        let mut objects: SlotMap<ObjectKey, ()> = SlotMap::with_key();
        let owner = objects.insert(());
        let mut store = PropertyStore::new();
        let root = store.import(&transform());
        store.attach(root, owner).unwrap();
        let position = store
            .resolve_path(root, &PropertyPath::field("transform.position"))
            .unwrap();
        assert_eq!(store.container(position), Some(owner));
        assert!(store.attach(position, owner).is_err());
    }
    #[test]
    fn deltas_replay_changes_on_another_store() {
        let mut local = PropertyStore::new();
        let mut remote = PropertyStore::new();
        let a = local.import(&transform());
        let b = remote.import(&transform());
        local.take_changes();

        let position = local
            .resolve_path(a, &PropertyPath::field("transform.position"))
            .unwrap();
        local.set_value(a, "name", "Crate").unwrap();
        local.push(position, &4.0.into()).unwrap();
        local.remove_range(position, 0, 1).unwrap();
        local.set_element(position, 0, &9.0.into()).unwrap();
        local.remove_field(a, "name").unwrap();

        for change in local.take_changes() {
            remote
                .apply_delta(b, &PropertyDelta::from_change(&change))
                .unwrap();
        }
        assert_eq!(remote.export(b).unwrap(), local.export(a).unwrap());
    }

    #[test]
    fn deltas_on_missing_paths_are_protocol_errors() {
        let mut store = PropertyStore::new();
        let root = store.import(&transform());
        let delta = PropertyDelta::Set {
            path: PropertyPath::field("missing.field"),
            value: 1i64.into(),
        };
        assert!(matches!(
            store.apply_delta(root, &delta),
            Err(Error::Protocol(_))
        ));
        let replace_root = PropertyDelta::Remove {
            path: PropertyPath::root(),
        };
        assert!(store.apply_delta(root, &replace_root).is_err());
    }
}
