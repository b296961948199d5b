use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

slotmap::new_key_type! {
    /// Stable arena handle for a node in the object graph.
    pub struct ObjectKey;
    /// Stable arena handle for a node in the property store.
    pub struct PropertyKey;
}

/// Wire identity assigned by the session authority.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Id carried by a node until the authority acknowledges it.
    pub const UNASSIGNED: ObjectId = ObjectId(0);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session user identity, used for lock ownership and presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserId(pub u32);

/// Opaque handle to an entity living in the host environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HostKey(pub u64);

/// Closed set of replicated object types. Selects the translator that owns a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ObjectType {
    Scene,
    Hierarchy,
    Entity,
    Component,
    Asset,
    AssetPath,
    Config,
    Terrain,
    Avatar,
    TransientBrush,
}

/// Where a node of a given type may sit in the graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParentRule {
    /// Must be a root.
    Root,
    /// Must have a parent of one of these types.
    OneOf(&'static [ObjectType]),
    /// Root or child of anything.
    Any,
}

impl ObjectType {
    pub fn parent_rule(self) -> ParentRule {
        use ObjectType::*;
        match self {
            Scene | Asset | AssetPath | Config | Avatar => ParentRule::Root,
            Hierarchy => ParentRule::OneOf(&[Scene]),
            Entity => ParentRule::OneOf(&[Hierarchy, Entity]),
            Component | Terrain => ParentRule::OneOf(&[Entity]),
            TransientBrush => ParentRule::Any,
        }
    }

    /// Checks a prospective parent type against [`ObjectType::parent_rule`].
    pub fn accepts_parent(self, parent: Option<ObjectType>) -> bool {
        match (self.parent_rule(), parent) {
            (ParentRule::Any, _) => true,
            (ParentRule::Root, None) => true,
            (ParentRule::Root, Some(_)) => false,
            (ParentRule::OneOf(_), None) => false,
            (ParentRule::OneOf(kinds), Some(kind)) => kinds.contains(&kind),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_rules_follow_scene_layout() {
        assert!(ObjectType::Scene.accepts_parent(None));
        assert!(!ObjectType::Scene.accepts_parent(Some(ObjectType::Scene)));
        assert!(ObjectType::Hierarchy.accepts_parent(Some(ObjectType::Scene)));
        assert!(!ObjectType::Hierarchy.accepts_parent(None));
        assert!(ObjectType::Entity.accepts_parent(Some(ObjectType::Entity)));
        assert!(!ObjectType::Component.accepts_parent(Some(ObjectType::Hierarchy)));
        assert!(ObjectType::TransientBrush.accepts_parent(None));
        assert!(ObjectType::TransientBrush.accepts_parent(Some(ObjectType::Terrain)));
    }

    #[test]
    fn unassigned_id_is_zero() {
        assert!(!ObjectId::UNASSIGNED.is_assigned());
        assert!(ObjectId(42).is_assigned());
        assert_eq!(ObjectId(42).to_string(), "#42");
    }
}
