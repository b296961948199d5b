//! Drives one synchronization tick: inbound authority events, host change detection, then
//! the outbound flush.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::config::EngineConfig;
use crate::conflict::{plan_removal, ConflictResolver, HistoryKind, Resolution};
use crate::error::{Error, Result};
use crate::events::{
    CreateRequest, HostEvent, OutboundMessage, PropertyDiff, RemoteEvent, RemoteObject, UserInfo,
};
use crate::graph::{ObjectFlags, ObjectGraph, SyncState};
use crate::ids::{HostKey, ObjectId, ObjectKey, ObjectType, PropertyKey, UserId};
use crate::lock::{EditGate, EditKind, LockManager};
use crate::property::{PropertyChange, PropertyDelta, PropertyTree};
use crate::traits::{HostProvider, Session};
use crate::translator::{Translator, TranslatorRegistry};
use crate::waitlist::{CreateWaitlist, ParkedCreate};

/// Work queued by a translator to run after the inbound phase of the current tick.
pub type Deferred<S, H> = Box<dyn FnOnce(&mut SyncContext<S, H>)>;

/// What happened during one tick (or one history batch).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub remote_events: usize,
    pub host_events: usize,
    pub sent: usize,
    /// Local edits undone because the target was locked.
    pub reverted: usize,
    pub suppressed_redos: usize,
    pub refused_creates: usize,
    pub deferred_run: usize,
    /// Errors logged and skipped; none of them aborted the tick.
    pub errors: Vec<Error>,
    pub cycles: Vec<Vec<HostKey>>,
}

/// Result of offering a host entity to the translators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateOutcome {
    /// No translator claimed the entity. It stays local.
    Unclaimed,
    Created(ObjectKey),
    /// Claimed, but the session's object limit for the type was reached.
    Refused,
}

#[derive(Clone, Debug)]
enum Pending {
    Property { object: ObjectKey, delta: PropertyDelta },
    Parent { object: ObjectKey },
    Delete { object: ObjectKey, id: ObjectId },
}

enum Outgoing {
    Send(OutboundMessage),
    Wait,
    Drop,
}

#[derive(Debug, Default)]
struct Outbox {
    creates: Vec<ObjectKey>,
    pending: Vec<Pending>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Removal {
    /// The authority removed the object.
    Remote,
    /// The object left this peer's view.
    Unsubscribe,
    /// A local delete finished; the host entity is already gone.
    Local,
}

/// Everything a translator can reach: the replicated state, the collaborators and the queues.
pub struct SyncContext<S, H> {
    pub graph: ObjectGraph,
    pub locks: LockManager,
    pub resolver: ConflictResolver,
    pub session: S,
    pub host: H,
    pub config: EngineConfig,
    entities: HashMap<ObjectKey, HostKey>,
    nodes: HashMap<HostKey, ObjectKey>,
    deferred: VecDeque<Deferred<S, H>>,
    outbox: Outbox,
    waitlist: CreateWaitlist,
    applying_remote: bool,
    host_suppressed: bool,
    report: TickReport,
}

impl<S, H> SyncContext<S, H> {
    /// Associate a node with its host entity, replacing any previous pairing of either side.
    pub fn bind(&mut self, node: ObjectKey, entity: HostKey) {
        if let Some(old) = self.entities.insert(node, entity) {
            if old != entity {
                self.nodes.remove(&old);
            }
        }
        if let Some(old) = self.nodes.insert(entity, node) {
            if old != node {
                self.entities.remove(&old);
            }
        }
    }

    pub fn unbind(&mut self, node: ObjectKey) -> Option<HostKey> {
        let entity = self.entities.remove(&node)?;
        self.nodes.remove(&entity);
        Some(entity)
    }

    pub fn entity_of(&self, node: ObjectKey) -> Option<HostKey> {
        self.entities.get(&node).copied()
    }

    pub fn node_of(&self, entity: HostKey) -> Option<ObjectKey> {
        self.nodes.get(&entity).copied()
    }

    pub fn defer(&mut self, action: impl FnOnce(&mut SyncContext<S, H>) + 'static) {
        self.deferred.push_back(Box::new(action));
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// True while inbound authority changes are being applied.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    /// Queue a local node (and its unsent descendants) for creation on the next flush.
    pub fn queue_create(&mut self, node: ObjectKey) {
        if !self.outbox.creates.contains(&node) {
            self.outbox.creates.push(node);
        }
    }

    /// Outbound messages still waiting for an id or an acknowledgement.
    pub fn pending_messages(&self) -> usize {
        self.outbox.pending.len()
    }

    pub fn waitlist(&self) -> &CreateWaitlist {
        &self.waitlist
    }

    /// Live node bound to an authority id.
    pub fn get_object(&self, id: ObjectId) -> Option<ObjectKey> {
        self.graph.get_by_id(id)
    }

    /// Reference properties pointing at `node`.
    pub fn references(&self, node: ObjectKey) -> Vec<PropertyKey> {
        match self.graph.id(node) {
            Some(id) if id.is_assigned() => self.graph.properties().references_to(id),
            _ => Vec::new(),
        }
    }

    fn record_error(&mut self, err: Error) {
        warn!("{err}");
        self.report.errors.push(err);
    }

    fn unbind_entity(&mut self, entity: HostKey) {
        if let Some(node) = self.nodes.remove(&entity) {
            self.entities.remove(&node);
        }
    }

    fn queue_local_change(&mut self, change: &PropertyChange) {
        let Some(object) = change.container else {
            return;
        };
        // Changes to unsent nodes ride along in the create snapshot.
        if matches!(
            self.graph.state(object),
            Some(SyncState::Synced | SyncState::PendingCreate)
        ) {
            self.outbox.pending.push(Pending::Property {
                object,
                delta: PropertyDelta::from_change(change),
            });
        }
    }

    fn snapshot(&self, node: ObjectKey) -> Result<CreateRequest> {
        let object = self
            .graph
            .get(node)
            .ok_or_else(|| Error::UnknownObject("create queued for a released object".into()))?;
        let parent = object.parent();
        let parent_id = parent
            .and_then(|p| self.graph.id(p))
            .filter(|id| id.is_assigned());
        let property = match object.property() {
            Some(root) => self.graph.properties().export(root)?,
            None => PropertyTree::empty_dictionary(),
        };
        Ok(CreateRequest {
            object: node,
            kind: object.kind(),
            parent,
            parent_id,
            index: self.graph.child_index(node).unwrap_or(0),
            property,
            transient: object.is_transient(),
        })
    }

    fn outgoing(&self, pending: &Pending) -> Outgoing {
        match pending {
            Pending::Property { object, delta } => match self.graph.state(*object) {
                Some(SyncState::Synced) => Outgoing::Send(OutboundMessage::Property(PropertyDiff {
                    object: *object,
                    id: self.graph.id(*object).unwrap_or_default(),
                    delta: delta.clone(),
                })),
                Some(SyncState::PendingCreate) => Outgoing::Wait,
                _ => Outgoing::Drop,
            },
            Pending::Parent { object } => match self.graph.state(*object) {
                Some(SyncState::Synced) => {
                    let parent = match self.graph.parent(*object) {
                        Some(p) => match self.graph.id(p) {
                            Some(id) if id.is_assigned() => Some(id),
                            _ => return Outgoing::Wait,
                        },
                        None => None,
                    };
                    Outgoing::Send(OutboundMessage::Parent {
                        object: *object,
                        id: self.graph.id(*object).unwrap_or_default(),
                        parent,
                        index: self.graph.child_index(*object).unwrap_or(0),
                    })
                }
                Some(SyncState::PendingCreate) => Outgoing::Wait,
                _ => Outgoing::Drop,
            },
            Pending::Delete { object, id } => {
                if id.is_assigned() {
                    return Outgoing::Send(OutboundMessage::Delete {
                        object: *object,
                        id: *id,
                    });
                }
                match (self.graph.state(*object), self.graph.id(*object)) {
                    (None | Some(SyncState::Deleted), _) => Outgoing::Drop,
                    (_, Some(id)) if id.is_assigned() => Outgoing::Send(OutboundMessage::Delete {
                        object: *object,
                        id,
                    }),
                    _ => Outgoing::Wait,
                }
            }
        }
    }
}

impl<S: Session, H: HostProvider> SyncContext<S, H> {
    fn new(session: S, host: H, config: EngineConfig) -> Self {
        let local_user = session.local_user();
        Self {
            graph: ObjectGraph::new(),
            locks: LockManager::new(local_user),
            resolver: ConflictResolver::new(),
            session,
            host,
            waitlist: CreateWaitlist::new(config.max_parked_creates),
            config,
            entities: HashMap::new(),
            nodes: HashMap::new(),
            deferred: VecDeque::new(),
            outbox: Outbox::default(),
            applying_remote: false,
            host_suppressed: false,
            report: TickReport::default(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.session.local_user()
    }

    /// Presence information for a session participant.
    pub fn user(&self, id: UserId) -> Option<UserInfo> {
        self.session.user(id)
    }

    /// Send queued creates top-down, then every message whose ids are now known.
    fn flush(&mut self) -> usize {
        let mut sent = 0;
        for root in std::mem::take(&mut self.outbox.creates) {
            for node in self.graph.descendants(root) {
                if self.graph.state(node) != Some(SyncState::Unsynced) {
                    continue;
                }
                let request = match self.snapshot(node) {
                    Ok(request) => request,
                    Err(err) => {
                        self.record_error(err);
                        continue;
                    }
                };
                self.session.send(OutboundMessage::Create(request));
                if let Err(err) = self.graph.mark_sent(node) {
                    self.record_error(err);
                }
                sent += 1;
            }
        }

        let mut waiting = Vec::new();
        for pending in std::mem::take(&mut self.outbox.pending) {
            match self.outgoing(&pending) {
                Outgoing::Send(message) => {
                    self.session.send(message);
                    sent += 1;
                }
                Outgoing::Wait => waiting.push(pending),
                Outgoing::Drop => {}
            }
        }
        self.outbox.pending = waiting;
        sent
    }
}

/// Routes host and authority events between the object graph and the registered translators.
pub struct Dispatcher<S, H> {
    ctx: SyncContext<S, H>,
    registry: TranslatorRegistry<S, H>,
}

impl<S: Session, H: HostProvider> Dispatcher<S, H> {
    pub fn new(session: S, host: H) -> Self {
        Self::with_config(session, host, EngineConfig::default())
    }

    pub fn with_config(session: S, host: H, config: EngineConfig) -> Self {
        Self {
            ctx: SyncContext::new(session, host, config),
            registry: TranslatorRegistry::new(),
        }
    }

    /// Register the translator for `kind`. Order matters for [`Dispatcher::try_create`].
    pub fn register(
        &mut self,
        kind: ObjectType,
        translator: impl Translator<S, H> + 'static,
    ) -> Result<()> {
        self.registry.register(kind, Box::new(translator))
    }

    pub fn context(&self) -> &SyncContext<S, H> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SyncContext<S, H> {
        &mut self.ctx
    }

    pub fn registry(&self) -> &TranslatorRegistry<S, H> {
        &self.registry
    }

    /// Run one tick: (a) apply inbound authority events with host reporting suppressed, then
    /// run deferred actions as local work, (b) handle host changes, (c) flush outbound messages.
    pub fn tick(&mut self) -> TickReport {
        // Edits made through the context since the last tick are local.
        self.drain_changes();
        let events = self.ctx.session.poll();
        let suppressed = self.suppress_host();
        self.ctx.applying_remote = true;
        for event in events {
            self.ctx.report.remote_events += 1;
            self.apply_remote(event);
            self.drain_changes();
        }
        self.resolve_ready();
        self.drain_changes();
        self.ctx.applying_remote = false;
        self.run_deferred();
        self.release_host(suppressed);

        for event in self.ctx.host.poll_changes() {
            self.ctx.report.host_events += 1;
            self.handle_local(event);
        }

        let sent = self.ctx.flush();
        self.ctx.report.sent += sent;
        std::mem::take(&mut self.ctx.report)
    }

    /// Apply an undo or redo batch of host edits. Messages go out on the next tick.
    pub fn apply_history(&mut self, kind: HistoryKind, events: Vec<HostEvent>) -> TickReport {
        self.ctx.resolver.begin_history(kind);
        for event in events {
            self.ctx.report.host_events += 1;
            self.handle_local(event);
        }
        self.ctx.resolver.end_history();
        std::mem::take(&mut self.ctx.report)
    }

    /// Offer a new host entity to the translators in registration order.
    pub fn try_create(&mut self, entity: HostKey) -> CreateOutcome {
        let outcome = self.claim(entity);
        self.drain_changes();
        outcome
    }

    fn claim(&mut self, entity: HostKey) -> CreateOutcome {
        let Some((_, node)) = self.registry.try_create(&mut self.ctx, entity) else {
            return CreateOutcome::Unclaimed;
        };
        let Some(kind) = self.ctx.graph.kind(node) else {
            return CreateOutcome::Unclaimed;
        };
        if self.ctx.config.enforce_object_limits {
            if let Some(limit) = self.ctx.session.object_limit(kind) {
                if self.ctx.graph.count_live(kind) > limit {
                    warn!("refusing to create {kind}: session limit of {limit} reached");
                    self.discard_local(node);
                    self.ctx.report.refused_creates += 1;
                    return CreateOutcome::Refused;
                }
            }
        }
        self.ctx.bind(node, entity);
        self.ctx.queue_create(node);
        debug!("{entity:?} claimed as {kind}");
        self.detect_duplicate(node);
        CreateOutcome::Created(node)
    }

    /// Handle one change reported by the host.
    pub fn handle_local(&mut self, event: HostEvent) {
        let entity = event.entity();
        if event.is_structural()
            && self.ctx.resolver.history() == Some(HistoryKind::Redo)
            && self.ctx.resolver.is_unsafe(entity)
        {
            debug!("suppressing redo of {event:?}");
            self.ctx.report.suppressed_redos += 1;
            self.suppress_redo(event);
            return;
        }
        let result = match event {
            HostEvent::Created { entity, parent } => self.local_create(entity, parent),
            HostEvent::Deleted { entity } => self.local_delete(entity),
            HostEvent::PropertyChanged { entity } => self.local_property(entity),
            HostEvent::Reparented {
                entity,
                parent,
                index,
            } => self.local_reparent(entity, parent, index),
        };
        if let Err(err) = result {
            self.ctx.record_error(err);
        }
        self.drain_changes();
    }

    fn apply_remote(&mut self, event: RemoteEvent) {
        debug!("applying {event:?}");
        let result = match event {
            RemoteEvent::CreateAck { object, id } => self.remote_create_ack(object, id),
            RemoteEvent::Create {
                parent,
                index,
                object,
            } => self.remote_create(parent, index, object),
            RemoteEvent::Delete { id } => self.remote_delete(id, Removal::Remote),
            RemoteEvent::Unsubscribe { id } => self.remote_delete(id, Removal::Unsubscribe),
            RemoteEvent::DeleteAck { id } => self.remote_delete_ack(id),
            RemoteEvent::Property { id, delta } => self.remote_property(id, delta),
            RemoteEvent::Parent { id, parent, index } => self.remote_parent(id, parent, index),
            RemoteEvent::Lock { id, locked, owner } => self.remote_lock(id, locked, owner),
        };
        if let Err(err) = result {
            self.ctx.record_error(err);
        }
    }

    fn remote_create_ack(&mut self, object: ObjectKey, id: ObjectId) -> Result<()> {
        let state = self
            .ctx
            .graph
            .state(object)
            .ok_or_else(|| Error::UnknownObject(format!("ack {id} for an unknown local object")))?;
        self.ctx.graph.confirm_create(object, id)?;
        if state == SyncState::DeletePending {
            // Cancelled before the ack; the queued delete goes out now that the id is known.
            debug!("create of {id} was cancelled locally");
            return Ok(());
        }
        self.notify(object, |t, ctx| t.on_confirm_create(ctx, object));
        self.notify_references(id);
        self.release_parked(id);
        self.resolve_ready();
        Ok(())
    }

    fn remote_create(
        &mut self,
        parent: Option<ObjectId>,
        index: usize,
        object: RemoteObject,
    ) -> Result<()> {
        let parent_key = match parent {
            None => None,
            Some(parent_id) => match self.ctx.graph.get_by_id(parent_id) {
                Some(key) => Some(key),
                None => {
                    debug!("parking {} until {parent_id} arrives", object.id);
                    if let Some(dropped) = self.ctx.waitlist.park(parent_id, index, object) {
                        return Err(Error::MissingDependency(format!(
                            "create waitlist full; dropped {} waiting on {}",
                            dropped.object.id, dropped.parent
                        )));
                    }
                    return Ok(());
                }
            },
        };
        self.materialize(parent_key, index, &object)
    }

    /// Create a remote subtree top-down, parents before children, in authority order.
    fn materialize(
        &mut self,
        parent: Option<ObjectKey>,
        index: usize,
        object: &RemoteObject,
    ) -> Result<()> {
        let flags = if object.transient {
            ObjectFlags::TRANSIENT
        } else {
            ObjectFlags::empty()
        };
        let node = self.ctx.graph.create_remote(
            object.id,
            object.kind,
            Some(&object.property),
            parent,
            index,
            flags,
        )?;
        if object.locked || object.lock_owner.is_some() {
            self.ctx.graph.set_lock_state(node, object.locked, object.lock_owner)?;
        }
        self.ctx.locks.invalidate(&self.ctx.graph, node);

        let child_index = self.ctx.graph.child_index(node).unwrap_or(index);
        self.notify(node, |t, ctx| t.on_create(ctx, node, child_index));
        self.notify_references(object.id);

        for (i, child) in object.children.iter().enumerate() {
            if let Err(err) = self.materialize(Some(node), i, child) {
                self.ctx.record_error(err);
            }
        }
        self.release_parked(object.id);
        // Last, so a losing duplicate hands over its complete subtree.
        self.detect_duplicate(node);
        Ok(())
    }

    fn release_parked(&mut self, parent: ObjectId) {
        for ParkedCreate {
            index,
            object,
            followups,
            ..
        } in self.ctx.waitlist.take_ready(parent)
        {
            let parent_key = self.ctx.graph.get_by_id(parent);
            if let Err(err) = self.materialize(parent_key, index, &object) {
                self.ctx.record_error(err);
                continue;
            }
            for event in followups {
                self.apply_remote(event);
            }
        }
    }

    fn remote_delete(&mut self, id: ObjectId, removal: Removal) -> Result<()> {
        let Some(node) = self.ctx.graph.get_by_id(id) else {
            if self.ctx.waitlist.remove(id) {
                debug!("dropped parked create {id}");
            } else {
                debug!("delete for {id}, which is already gone");
            }
            return Ok(());
        };
        self.remove_subtree(node, removal)
    }

    fn remote_delete_ack(&mut self, id: ObjectId) -> Result<()> {
        let Some(node) = self.ctx.graph.get_by_id(id) else {
            debug!("delete ack for {id}, which is already gone");
            return Ok(());
        };
        if self.ctx.graph.state(node) != Some(SyncState::DeletePending) {
            return Err(Error::Protocol(format!(
                "delete ack for {id}, which was not deleted locally"
            )));
        }
        self.remove_subtree(node, Removal::Local)
    }

    fn remote_property(&mut self, id: ObjectId, delta: PropertyDelta) -> Result<()> {
        let Some(node) = self.ctx.graph.get_by_id(id) else {
            return self.park_followup(id, RemoteEvent::Property { id, delta });
        };
        let root = self
            .ctx
            .graph
            .property(node)
            .ok_or_else(|| Error::UnknownObject(format!("{id} has no properties")))?;
        self.ctx.graph.properties_mut().apply_delta(root, &delta)
    }

    fn remote_parent(
        &mut self,
        id: ObjectId,
        parent: Option<ObjectId>,
        index: usize,
    ) -> Result<()> {
        let Some(node) = self.ctx.graph.get_by_id(id) else {
            return self.park_followup(id, RemoteEvent::Parent { id, parent, index });
        };
        let parent_key = match parent {
            Some(parent_id) => Some(self.ctx.graph.get_by_id(parent_id).ok_or_else(|| {
                Error::UnknownObject(format!("new parent {parent_id} of {id} is unknown"))
            })?),
            None => None,
        };
        self.ctx.graph.move_to(node, parent_key, index)?;
        self.ctx.locks.invalidate(&self.ctx.graph, node);
        let child_index = self.ctx.graph.child_index(node).unwrap_or(index);
        self.notify(node, |t, ctx| t.on_parent_change(ctx, node, child_index));
        Ok(())
    }

    fn remote_lock(&mut self, id: ObjectId, locked: bool, owner: Option<UserId>) -> Result<()> {
        let Some(node) = self.ctx.graph.get_by_id(id) else {
            return self.park_followup(id, RemoteEvent::Lock { id, locked, owner });
        };
        let Some(transition) = self
            .ctx
            .locks
            .apply_lock(&mut self.ctx.graph, node, locked, owner)?
        else {
            return Ok(());
        };
        if transition.after > transition.before {
            self.notify(node, |t, ctx| t.on_lock(ctx, node));
        } else if transition.after < transition.before {
            self.notify(node, |t, ctx| t.on_unlock(ctx, node));
        }
        if transition.owner_changed() {
            self.notify(node, |t, ctx| t.on_lock_owner_change(ctx, node));
        }
        Ok(())
    }

    fn park_followup(&mut self, id: ObjectId, event: RemoteEvent) -> Result<()> {
        match self.ctx.waitlist.attach(id, event) {
            None => Ok(()),
            Some(_) => Err(Error::UnknownObject(format!("event for unknown object {id}"))),
        }
    }

    fn local_create(&mut self, entity: HostKey, parent: Option<HostKey>) -> Result<()> {
        if self.ctx.node_of(entity).is_some() {
            return Ok(());
        }
        if let Some(parent_node) = parent.and_then(|p| self.ctx.node_of(p)) {
            if self
                .ctx
                .locks
                .gate(&self.ctx.graph, parent_node, EditKind::Structure)
                == EditGate::Revert
            {
                self.note_revert(entity, true);
                let suppressed = self.suppress_host();
                self.ctx.host.destroy(entity);
                self.release_host(suppressed);
                return Ok(());
            }
        }
        self.try_create(entity);
        Ok(())
    }

    fn local_delete(&mut self, entity: HostKey) -> Result<()> {
        let Some(node) = self.ctx.node_of(entity) else {
            return Ok(());
        };
        if self.ctx.locks.gate(&self.ctx.graph, node, EditKind::Structure) == EditGate::Revert {
            self.note_revert(entity, true);
            self.ctx.unbind(node);
            let suppressed = self.suppress_host();
            self.notify(node, |t, ctx| t.restore(ctx, node));
            self.release_host(suppressed);
            return Ok(());
        }

        self.notify(node, |t, ctx| t.on_delete(ctx, node));
        match self.ctx.graph.state(node) {
            Some(SyncState::Unsynced) => self.remove_subtree(node, Removal::Local),
            Some(SyncState::PendingCreate | SyncState::Synced) => {
                self.ctx.graph.delete(node)?;
                for key in self.ctx.graph.descendants(node) {
                    self.ctx.unbind(key);
                }
                let id = self.ctx.graph.id(node).unwrap_or_default();
                self.ctx.outbox.pending.push(Pending::Delete { object: node, id });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn local_property(&mut self, entity: HostKey) -> Result<()> {
        let Some(node) = self.ctx.node_of(entity) else {
            return Ok(());
        };
        match self.ctx.locks.gate(&self.ctx.graph, node, EditKind::Property) {
            EditGate::Allow => self.notify(node, |t, ctx| t.sync_local(ctx, node, entity)),
            EditGate::Revert => {
                self.note_revert(entity, false);
                let suppressed = self.suppress_host();
                self.notify(node, |t, ctx| t.revert(ctx, node));
                self.release_host(suppressed);
            }
        }
        Ok(())
    }

    fn local_reparent(
        &mut self,
        entity: HostKey,
        parent: Option<HostKey>,
        index: usize,
    ) -> Result<()> {
        let Some(node) = self.ctx.node_of(entity) else {
            return Ok(());
        };
        let parent_node = match parent {
            Some(p) => Some(self.ctx.node_of(p).ok_or_else(|| {
                Error::UnknownObject(format!("{entity:?} moved under unsynchronized {p:?}"))
            })?),
            None => None,
        };
        let mut blocked =
            self.ctx.locks.gate(&self.ctx.graph, node, EditKind::Structure) == EditGate::Revert;
        if let Some(p) = parent_node {
            blocked |=
                self.ctx.locks.gate(&self.ctx.graph, p, EditKind::Structure) == EditGate::Revert;
        }
        let moved = if blocked {
            Ok(false)
        } else {
            self.ctx.graph.move_to(node, parent_node, index).map(|_| true)
        };
        match moved {
            Ok(true) => {
                self.ctx.locks.invalidate(&self.ctx.graph, node);
                if matches!(
                    self.ctx.graph.state(node),
                    Some(SyncState::Synced | SyncState::PendingCreate)
                ) {
                    self.ctx.outbox.pending.push(Pending::Parent { object: node });
                }
                Ok(())
            }
            Ok(false) | Err(_) => {
                // Put the host entity back where the graph says it belongs.
                self.note_revert(entity, true);
                let child_index = self.ctx.graph.child_index(node).unwrap_or(0);
                let suppressed = self.suppress_host();
                self.notify(node, |t, ctx| t.on_parent_change(ctx, node, child_index));
                self.release_host(suppressed);
                moved.map(|_| ())
            }
        }
    }

    fn suppress_redo(&mut self, event: HostEvent) {
        let suppressed = self.suppress_host();
        match event {
            HostEvent::Created { entity, .. } => {
                if self.ctx.node_of(entity).is_none() {
                    self.ctx.host.destroy(entity);
                }
            }
            HostEvent::Deleted { entity } => {
                if let Some(node) = self.ctx.node_of(entity) {
                    self.ctx.unbind(node);
                    self.notify(node, |t, ctx| t.restore(ctx, node));
                }
            }
            HostEvent::Reparented { entity, .. } => {
                if let Some(node) = self.ctx.node_of(entity) {
                    let child_index = self.ctx.graph.child_index(node).unwrap_or(0);
                    self.notify(node, |t, ctx| t.on_parent_change(ctx, node, child_index));
                }
            }
            HostEvent::PropertyChanged { .. } => {}
        }
        self.release_host(suppressed);
    }

    fn note_revert(&mut self, entity: HostKey, structural: bool) {
        debug!("reverting local edit of locked {entity:?}");
        self.ctx.report.reverted += 1;
        if structural && self.ctx.resolver.history() == Some(HistoryKind::Undo) {
            self.ctx.resolver.mark_unsafe(entity);
        }
    }

    /// Remove `node` and its subtree from the graph, telling translators bottom-up.
    /// Host entities of unsubscribed nodes are left for `on_confirm_delete` to dispose of.
    fn remove_subtree(&mut self, node: ObjectKey, removal: Removal) -> Result<()> {
        let unsubscribed = removal == Removal::Unsubscribe;
        if removal == Removal::Remote {
            self.notify(node, |t, ctx| t.on_delete(ctx, node));
            if let Some(entity) = self.ctx.entity_of(node) {
                self.destroy_entity(entity);
            }
        }
        let removed = self.ctx.graph.confirm_delete(node, unsubscribed)?;
        for key in removed.iter().rev().copied() {
            self.notify(key, |t, ctx| t.on_confirm_delete(ctx, key, unsubscribed));
            self.ctx.unbind(key);
            self.ctx.locks.forget(key);
            self.ctx.resolver.untrack(key);
            self.ctx.outbox.creates.retain(|k| *k != key);
        }
        if !unsubscribed {
            for key in removed {
                if let Some(id) = self.ctx.graph.id(key).filter(|id| id.is_assigned()) {
                    self.notify_references(id);
                }
            }
        }
        Ok(())
    }

    /// Destroy a host entity after everything that depends on it, deepest dependent first.
    /// A dependency cycle aborts the chain that contains it.
    fn destroy_entity(&mut self, entity: HostKey) {
        let host = &self.ctx.host;
        let plan = plan_removal(entity, |e| host.dependents(e));
        for cycle in &plan.cycles {
            self.ctx.record_error(Error::DependencyCycle(format!(
                "host entities {cycle:?} depend on each other; not removing them"
            )));
        }
        self.ctx.report.cycles.extend(plan.cycles);
        for e in plan.order {
            if self.ctx.host.is_valid(e) {
                self.ctx.host.destroy(e);
            }
            if e != entity {
                self.ctx.unbind_entity(e);
            }
        }
    }

    /// Drop a node that never reached the authority.
    fn discard_local(&mut self, node: ObjectKey) {
        match self.ctx.graph.confirm_delete(node, false) {
            Ok(removed) => {
                for key in removed {
                    self.ctx.unbind(key);
                    self.ctx.resolver.untrack(key);
                    if let Err(err) = self.ctx.graph.release(key) {
                        self.ctx.record_error(err);
                    }
                }
            }
            Err(err) => self.ctx.record_error(err),
        }
    }

    fn detect_duplicate(&mut self, node: ObjectKey) {
        if !self.ctx.config.resolve_duplicates {
            return;
        }
        let Some(kind) = self.ctx.graph.kind(node) else {
            return;
        };
        let Some(identity) = self
            .registry
            .translator(kind)
            .and_then(|t| t.identity_key(&self.ctx, node))
        else {
            return;
        };
        self.ctx.resolver.track(node, identity);
        let Some(other) = self.ctx.resolver.find_duplicate(&self.ctx.graph, node) else {
            return;
        };
        match self.ctx.resolver.resolve(&self.ctx.graph, node, other) {
            Some(resolution) => self.execute_resolution(resolution),
            None => self.ctx.resolver.defer(node, other),
        }
    }

    fn resolve_ready(&mut self) {
        if !self.ctx.config.resolve_duplicates {
            return;
        }
        for resolution in self.ctx.resolver.take_ready(&self.ctx.graph) {
            self.execute_resolution(resolution);
        }
    }

    /// Keep the winner, move the loser's children onto it, then delete the loser.
    fn execute_resolution(&mut self, resolution: Resolution) {
        let Resolution { winner, loser } = resolution;
        debug!(
            "duplicate {} resolved in favour of {}",
            self.ctx.graph.id(loser).unwrap_or_default(),
            self.ctx.graph.id(winner).unwrap_or_default()
        );
        let moved = match self.ctx.graph.migrate_children(loser, winner) {
            Ok(moved) => moved,
            Err(err) => {
                self.ctx.record_error(err);
                return;
            }
        };
        for child in moved {
            self.ctx.locks.invalidate(&self.ctx.graph, child);
            let child_index = self.ctx.graph.child_index(child).unwrap_or(0);
            self.notify(child, |t, ctx| t.on_parent_change(ctx, child, child_index));
            self.ctx.outbox.pending.push(Pending::Parent { object: child });
        }
        // Queued after the moves so the authority does not take the children down with it.
        let id = self.ctx.graph.id(loser).unwrap_or_default();
        self.ctx.outbox.pending.push(Pending::Delete { object: loser, id });
        let suppressed = self.suppress_host();
        if let Err(err) = self.remove_subtree(loser, Removal::Remote) {
            self.ctx.record_error(err);
        }
        self.release_host(suppressed);
    }

    fn notify_references(&mut self, id: ObjectId) {
        for property in self.ctx.graph.properties().references_to(id) {
            let Some(container) = self.ctx.graph.properties().container(property) else {
                continue;
            };
            self.notify(container, |t, ctx| t.on_reference_change(ctx, property));
        }
    }

    fn run_deferred(&mut self) {
        let mut ran = 0;
        while ran < self.ctx.config.max_deferred_per_tick {
            let Some(action) = self.ctx.deferred.pop_front() else {
                break;
            };
            action(&mut self.ctx);
            ran += 1;
        }
        self.ctx.report.deferred_run += ran;
        self.drain_changes();
    }

    /// Route recorded property changes: inbound ones to translators, local ones to the outbox.
    fn drain_changes(&mut self) {
        for change in self.ctx.graph.properties_mut().take_changes() {
            if self.ctx.applying_remote {
                self.registry.dispatch_change(&mut self.ctx, &change);
            } else {
                self.ctx.queue_local_change(&change);
            }
        }
    }

    fn notify(
        &mut self,
        node: ObjectKey,
        call: impl FnOnce(&mut Box<dyn Translator<S, H>>, &mut SyncContext<S, H>),
    ) {
        let Some(kind) = self.ctx.graph.kind(node) else {
            return;
        };
        if let Some(translator) = self.registry.translator_mut(kind) {
            call(translator, &mut self.ctx);
        }
    }

    /// Returns whether this call turned suppression on, for [`Dispatcher::release_host`].
    fn suppress_host(&mut self) -> bool {
        if self.ctx.host_suppressed {
            return false;
        }
        self.ctx.host_suppressed = true;
        self.ctx.host.set_suppressed(true);
        true
    }

    fn release_host(&mut self, suppressed: bool) {
        if suppressed {
            self.ctx.host_suppressed = false;
            self.ctx.host.set_suppressed(false);
        }
    }
}
