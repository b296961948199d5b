use crate::ids::{HostKey, ObjectId, ObjectKey, ObjectType, UserId};
use crate::property::{PropertyDelta, PropertyTree};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Snapshot of an authority-created subtree.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteObject {
    pub id: ObjectId,
    pub kind: ObjectType,
    pub property: PropertyTree,
    pub transient: bool,
    pub locked: bool,
    pub lock_owner: Option<UserId>,
    pub children: Vec<RemoteObject>,
}

impl RemoteObject {
    pub fn new(id: ObjectId, kind: ObjectType, property: PropertyTree) -> Self {
        Self {
            id,
            kind,
            property,
            transient: false,
            locked: false,
            lock_owner: None,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: RemoteObject) -> Self {
        self.children.push(child);
        self
    }

    pub fn locked_by(mut self, owner: Option<UserId>) -> Self {
        self.locked = true;
        self.lock_owner = owner;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Ids of this object and everything below it, pre-order.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut out = vec![self.id];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }
}

/// Inbound notification from the session.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RemoteEvent {
    /// The authority accepted a local create and assigned it an id.
    CreateAck { object: ObjectKey, id: ObjectId },
    Create {
        parent: Option<ObjectId>,
        index: usize,
        object: RemoteObject,
    },
    Delete { id: ObjectId },
    /// The authority confirmed a local delete.
    DeleteAck { id: ObjectId },
    /// The object left this peer's view; it may come back with the same id.
    Unsubscribe { id: ObjectId },
    Property { id: ObjectId, delta: PropertyDelta },
    Parent {
        id: ObjectId,
        parent: Option<ObjectId>,
        index: usize,
    },
    Lock {
        id: ObjectId,
        locked: bool,
        owner: Option<UserId>,
    },
}

/// Create request for a local subtree, snapshotted when the outbox is flushed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CreateRequest {
    pub object: ObjectKey,
    pub kind: ObjectType,
    /// Local parent handle, for parents whose own create is still in flight.
    pub parent: Option<ObjectKey>,
    pub parent_id: Option<ObjectId>,
    pub index: usize,
    pub property: PropertyTree,
    pub transient: bool,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropertyDiff {
    pub object: ObjectKey,
    pub id: ObjectId,
    pub delta: PropertyDelta,
}

/// Outbound request to the session authority.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OutboundMessage {
    Create(CreateRequest),
    Delete {
        object: ObjectKey,
        id: ObjectId,
    },
    Property(PropertyDiff),
    Parent {
        object: ObjectKey,
        id: ObjectId,
        parent: Option<ObjectId>,
        index: usize,
    },
}

impl OutboundMessage {
    pub fn object(&self) -> ObjectKey {
        match self {
            OutboundMessage::Create(request) => request.object,
            OutboundMessage::Delete { object, .. } | OutboundMessage::Parent { object, .. } => {
                *object
            }
            OutboundMessage::Property(diff) => diff.object,
        }
    }
}

/// Change detected in the host environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HostEvent {
    Created {
        entity: HostKey,
        parent: Option<HostKey>,
    },
    Deleted {
        entity: HostKey,
    },
    PropertyChanged {
        entity: HostKey,
    },
    Reparented {
        entity: HostKey,
        parent: Option<HostKey>,
        index: usize,
    },
}

impl HostEvent {
    pub fn entity(&self) -> HostKey {
        match self {
            HostEvent::Created { entity, .. }
            | HostEvent::Deleted { entity }
            | HostEvent::PropertyChanged { entity }
            | HostEvent::Reparented { entity, .. } => *entity,
        }
    }

    pub fn is_structural(&self) -> bool {
        !matches!(self, HostEvent::PropertyChanged { .. })
    }
}

/// Presence information about a session participant.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub color: [u8; 3],
}
