use std::collections::{BTreeMap, HashMap};

use crate::events::{RemoteEvent, RemoteObject};
use crate::ids::ObjectId;

pub type ParkHandle = u64;

/// A remote create whose parent has not been materialised yet.
#[derive(Clone, Debug, PartialEq)]
pub struct ParkedCreate {
    pub parent: ObjectId,
    pub index: usize,
    pub object: RemoteObject,
    /// Events addressed to the parked subtree, replayed after it is created.
    pub followups: Vec<RemoteEvent>,
}

/// Remote creates keyed by the parent id they wait for, released in arrival order.
#[derive(Debug)]
pub struct CreateWaitlist {
    capacity: usize,
    next_handle: ParkHandle,
    items: BTreeMap<ParkHandle, ParkedCreate>,
    waiting_on: HashMap<ObjectId, Vec<ParkHandle>>,
    parked_ids: HashMap<ObjectId, ParkHandle>,
}

impl CreateWaitlist {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_handle: 0,
            items: BTreeMap::new(),
            waiting_on: HashMap::new(),
            parked_ids: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `id` belongs to a parked subtree.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.parked_ids.contains_key(&id)
    }

    /// Park a create until `parent` shows up. Returns the entry evicted to make room, if any.
    pub fn park(
        &mut self,
        parent: ObjectId,
        index: usize,
        object: RemoteObject,
    ) -> Option<ParkedCreate> {
        let evicted = if self.items.len() >= self.capacity {
            let oldest = self.items.keys().next().copied();
            oldest.and_then(|handle| self.remove_handle(handle))
        } else {
            None
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.insert(
            handle,
            ParkedCreate {
                parent,
                index,
                object,
                followups: Vec::new(),
            },
        );
        evicted
    }

    /// Queue an event for a parked subtree. Gives the event back if `id` is not parked.
    pub fn attach(&mut self, id: ObjectId, event: RemoteEvent) -> Option<RemoteEvent> {
        match self
            .parked_ids
            .get(&id)
            .and_then(|handle| self.items.get_mut(handle))
        {
            Some(parked) => {
                parked.followups.push(event);
                None
            }
            None => Some(event),
        }
    }

    /// Everything that was waiting for `parent`, in arrival order.
    pub fn take_ready(&mut self, parent: ObjectId) -> Vec<ParkedCreate> {
        let mut handles = self.waiting_on.remove(&parent).unwrap_or_default();
        handles.sort_unstable();
        handles
            .into_iter()
            .filter_map(|handle| self.remove_handle(handle))
            .collect()
    }

    /// Drop a parked subtree because the authority deleted it (or anything in it) before
    /// its parent arrived. Returns true if something was parked under `id`.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let Some(handle) = self.parked_ids.get(&id).copied() else {
            return false;
        };
        let Some(mut parked) = self.remove_handle(handle) else {
            return false;
        };
        if parked.object.id == id {
            return true;
        }
        // Only part of the subtree went away; the remainder keeps its place in line.
        prune(&mut parked.object, id);
        self.insert(handle, parked);
        true
    }

    fn insert(&mut self, handle: ParkHandle, parked: ParkedCreate) {
        for id in parked.object.ids() {
            self.parked_ids.insert(id, handle);
        }
        self.waiting_on.entry(parked.parent).or_default().push(handle);
        self.items.insert(handle, parked);
    }

    fn remove_handle(&mut self, handle: ParkHandle) -> Option<ParkedCreate> {
        let parked = self.items.remove(&handle)?;
        for id in parked.object.ids() {
            if self.parked_ids.get(&id) == Some(&handle) {
                self.parked_ids.remove(&id);
            }
        }
        if let Some(handles) = self.waiting_on.get_mut(&parked.parent) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                self.waiting_on.remove(&parked.parent);
            }
        }
        Some(parked)
    }
}

fn prune(object: &mut RemoteObject, id: ObjectId) -> bool {
    let before = object.children.len();
    object.children.retain(|child| child.id != id);
    if object.children.len() != before {
        return true;
    }
    object.children.iter_mut().any(|child| prune(child, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObjectType;
    use crate::property::PropertyTree;

    fn entity(id: u64) -> RemoteObject {
        RemoteObject::new(ObjectId(id), ObjectType::Entity, PropertyTree::empty_dictionary())
    }

    #[test]
    fn released_in_arrival_order() {
        let mut waitlist = CreateWaitlist::new(8);
        waitlist.park(ObjectId(1), 0, entity(10));
        waitlist.park(ObjectId(2), 0, entity(20));
        waitlist.park(ObjectId(1), 1, entity(11));

        let ready = waitlist.take_ready(ObjectId(1));
        let ids: Vec<ObjectId> = ready.iter().map(|p| p.object.id).collect();
        assert_eq!(ids, vec![ObjectId(10), ObjectId(11)]);
        assert_eq!(waitlist.len(), 1);
        assert!(waitlist.take_ready(ObjectId(1)).is_empty());
    }

    #[test]
    fn full_waitlist_drops_the_oldest() {
        let mut waitlist = CreateWaitlist::new(2);
        assert!(waitlist.park(ObjectId(1), 0, entity(10)).is_none());
        assert!(waitlist.park(ObjectId(1), 0, entity(11)).is_none());
        let evicted = waitlist.park(ObjectId(1), 0, entity(12)).unwrap();
        assert_eq!(evicted.object.id, ObjectId(10));
        assert!(!waitlist.contains(ObjectId(10)));
        assert_eq!(waitlist.len(), 2);
    }

    #[test]
    fn followups_travel_with_the_parked_subtree() {
        let mut waitlist = CreateWaitlist::new(4);
        waitlist.park(ObjectId(1), 0, entity(10).with_child(entity(11)));
        let event = RemoteEvent::Lock {
            id: ObjectId(11),
            locked: true,
            owner: None,
        };
        assert!(waitlist.attach(ObjectId(11), event.clone()).is_none());
        assert_eq!(waitlist.attach(ObjectId(99), event.clone()), Some(event.clone()));

        let ready = waitlist.take_ready(ObjectId(1));
        assert_eq!(ready[0].followups, vec![event]);
    }

    #[test]
    fn deleting_a_parked_child_keeps_the_rest() {
        let mut waitlist = CreateWaitlist::new(4);
        waitlist.park(ObjectId(1), 0, entity(10).with_child(entity(11)));
        assert!(waitlist.remove(ObjectId(11)));
        assert!(waitlist.contains(ObjectId(10)));
        assert!(!waitlist.contains(ObjectId(11)));

        assert!(waitlist.remove(ObjectId(10)));
        assert!(waitlist.is_empty());
        assert!(!waitlist.remove(ObjectId(10)));
    }
}
