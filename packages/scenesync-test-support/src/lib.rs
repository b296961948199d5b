//! In-memory collaborators for exercising the dispatcher without an editor or a server.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use log::debug;
use scenesync_core::{
    Dispatcher, HostEvent, HostKey, HostProvider, ObjectId, ObjectKey, ObjectType,
    OutboundMessage, PathSegment, PropertyChange, PropertyKey, PropertyTree, RemoteEvent,
    RemoteObject, Session, SyncContext, Translator, UserId, UserInfo, Value,
};

pub const LOCAL_USER: UserId = UserId(1);
pub const OTHER_USER: UserId = UserId(2);

/// Idempotent `env_logger` setup for tests; honours `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub type TestDispatcher = Dispatcher<MemorySession, MemoryHost>;
pub type TestContext = SyncContext<MemorySession, MemoryHost>;

pub const SCENE: ObjectId = ObjectId(1);
pub const HIERARCHY: ObjectId = ObjectId(2);

pub fn dispatcher() -> TestDispatcher {
    init_logging();
    Dispatcher::new(MemorySession::new(LOCAL_USER), MemoryHost::default())
}

/// A dispatcher whose authority already holds a scene ([`SCENE`]) with one hierarchy
/// ([`HIERARCHY`]). Host entities with a `component` field are claimed as components, ones with
/// a `name` field as entities; entities use their `source` field as duplicate identity.
pub fn scene_dispatcher() -> (TestDispatcher, CallLog) {
    let log = new_log();
    let mut d = dispatcher();
    let translators = [
        RecordingTranslator::new(ObjectType::Scene, &log),
        RecordingTranslator::new(ObjectType::Hierarchy, &log),
        RecordingTranslator::new(ObjectType::Component, &log)
            .claiming(|e| e.fields.contains_key("component")),
        RecordingTranslator::new(ObjectType::Entity, &log)
            .claiming(|e| e.fields.contains_key("name"))
            .with_identity("source"),
    ];
    for translator in translators {
        let kind = translator.kind;
        if let Err(err) = d.register(kind, translator) {
            panic!("registering {kind}: {err}");
        }
    }
    let scene = RemoteObject::new(SCENE, ObjectType::Scene, PropertyTree::empty_dictionary())
        .with_child(RemoteObject::new(
            HIERARCHY,
            ObjectType::Hierarchy,
            PropertyTree::empty_dictionary(),
        ));
    d.context_mut().session.push(RemoteEvent::Create {
        parent: None,
        index: 0,
        object: scene,
    });
    d.tick();
    log.borrow_mut().clear();
    (d, log)
}

pub fn remote_entity(id: u64, name: &str) -> RemoteObject {
    RemoteObject::new(
        ObjectId(id),
        ObjectType::Entity,
        PropertyTree::dictionary([("name", PropertyTree::from(name))]),
    )
}

pub fn remote_component(id: u64, component: &str) -> RemoteObject {
    RemoteObject::new(
        ObjectId(id),
        ObjectType::Component,
        PropertyTree::dictionary([("component", PropertyTree::from(component))]),
    )
}

pub trait RemoteObjectExt {
    /// Add a top-level field to a dictionary-rooted snapshot.
    fn with_field(self, name: &str, value: impl Into<PropertyTree>) -> Self;
}

impl RemoteObjectExt for RemoteObject {
    fn with_field(mut self, name: &str, value: impl Into<PropertyTree>) -> Self {
        if let PropertyTree::Dictionary(fields) = &mut self.property {
            fields.insert(name.to_owned(), value.into());
        }
        self
    }
}

/// Host entity mirroring the live node with authority id `id`.
pub fn host_entity(d: &TestDispatcher, id: ObjectId) -> Option<HostKey> {
    let ctx = d.context();
    ctx.get_object(id).and_then(|node| ctx.entity_of(node))
}

/// Session double: inbound events are queued by the test, outbound messages are recorded.
#[derive(Debug, Default)]
pub struct MemorySession {
    user: Option<UserId>,
    inbox: VecDeque<RemoteEvent>,
    pub sent: Vec<OutboundMessage>,
    pub limits: HashMap<ObjectType, usize>,
    pub users: HashMap<UserId, UserInfo>,
}

impl MemorySession {
    pub fn new(user: UserId) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn push(&mut self, event: RemoteEvent) {
        self.inbox.push_back(event);
    }

    pub fn take_sent(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.sent)
    }
}

impl Session for MemorySession {
    fn local_user(&self) -> UserId {
        self.user.unwrap_or(LOCAL_USER)
    }

    fn send(&mut self, message: OutboundMessage) {
        debug!("sent {message:?}");
        self.sent.push(message);
    }

    fn poll(&mut self) -> Vec<RemoteEvent> {
        self.inbox.drain(..).collect()
    }

    fn user(&self, id: UserId) -> Option<UserInfo> {
        self.users.get(&id).cloned()
    }

    fn object_limit(&self, kind: ObjectType) -> Option<usize> {
        self.limits.get(&kind).copied()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostEntity {
    pub parent: Option<HostKey>,
    pub children: Vec<HostKey>,
    pub fields: BTreeMap<String, Value>,
}

/// Host double: a flat entity table with parent links. Edits made while suppressed are not
/// reported by `poll_changes`.
#[derive(Debug, Default)]
pub struct MemoryHost {
    next: u64,
    entities: BTreeMap<HostKey, HostEntity>,
    roots: Vec<HostKey>,
    dependents: HashMap<HostKey, Vec<HostKey>>,
    changes: Vec<HostEvent>,
    suppressed: bool,
    pub destroyed: Vec<HostKey>,
}

impl MemoryHost {
    pub fn spawn(&mut self, parent: Option<HostKey>) -> HostKey {
        self.next += 1;
        let key = HostKey(self.next);
        self.entities.insert(
            key,
            HostEntity {
                parent,
                ..HostEntity::default()
            },
        );
        match parent.and_then(|p| self.entities.get_mut(&p)) {
            Some(p) => p.children.push(key),
            None => self.roots.push(key),
        }
        self.report(HostEvent::Created {
            entity: key,
            parent,
        });
        key
    }

    pub fn spawn_with(&mut self, parent: Option<HostKey>, fields: &[(&str, Value)]) -> HostKey {
        let key = self.spawn(parent);
        if let Some(entity) = self.entities.get_mut(&key) {
            for (name, value) in fields {
                entity.fields.insert((*name).to_owned(), value.clone());
            }
        }
        key
    }

    pub fn set_field(&mut self, entity: HostKey, name: &str, value: Value) {
        let Some(e) = self.entities.get_mut(&entity) else {
            return;
        };
        e.fields.insert(name.to_owned(), value);
        self.report(HostEvent::PropertyChanged { entity });
    }

    pub fn remove_field(&mut self, entity: HostKey, name: &str) {
        let removed = self
            .entities
            .get_mut(&entity)
            .and_then(|e| e.fields.remove(name));
        if removed.is_some() {
            self.report(HostEvent::PropertyChanged { entity });
        }
    }

    pub fn reparent(&mut self, entity: HostKey, parent: Option<HostKey>, index: usize) {
        if !self.entities.contains_key(&entity) {
            return;
        }
        self.detach(entity);
        let siblings = match parent.and_then(|p| self.entities.get_mut(&p)) {
            Some(p) => &mut p.children,
            None => &mut self.roots,
        };
        let index = index.min(siblings.len());
        siblings.insert(index, entity);
        if let Some(e) = self.entities.get_mut(&entity) {
            e.parent = parent;
        }
        self.report(HostEvent::Reparented {
            entity,
            parent,
            index,
        });
    }

    pub fn add_dependent(&mut self, entity: HostKey, dependent: HostKey) {
        self.dependents.entry(entity).or_default().push(dependent);
    }

    pub fn get(&self, entity: HostKey) -> Option<&HostEntity> {
        self.entities.get(&entity)
    }

    pub fn field(&self, entity: HostKey, name: &str) -> Option<&Value> {
        self.entities.get(&entity)?.fields.get(name)
    }

    pub fn children(&self, entity: Option<HostKey>) -> Vec<HostKey> {
        match entity {
            Some(e) => self
                .entities
                .get(&e)
                .map(|e| e.children.clone())
                .unwrap_or_default(),
            None => self.roots.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    fn report(&mut self, event: HostEvent) {
        if !self.suppressed {
            self.changes.push(event);
        }
    }

    fn detach(&mut self, entity: HostKey) {
        let parent = self.entities.get(&entity).and_then(|e| e.parent);
        let siblings = match parent.and_then(|p| self.entities.get_mut(&p)) {
            Some(p) => &mut p.children,
            None => &mut self.roots,
        };
        siblings.retain(|c| *c != entity);
    }
}

impl HostProvider for MemoryHost {
    fn is_valid(&self, entity: HostKey) -> bool {
        self.entities.contains_key(&entity)
    }

    /// Removes the entity and everything below it.
    fn destroy(&mut self, entity: HostKey) {
        if !self.entities.contains_key(&entity) {
            return;
        }
        self.detach(entity);
        let mut stack = vec![entity];
        while let Some(key) = stack.pop() {
            if let Some(e) = self.entities.remove(&key) {
                stack.extend(e.children);
                self.destroyed.push(key);
            }
        }
        self.report(HostEvent::Deleted { entity });
    }

    fn dependents(&self, entity: HostKey) -> Vec<HostKey> {
        self.dependents.get(&entity).cloned().unwrap_or_default()
    }

    fn poll_changes(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.changes)
    }

    fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }
}

/// One translator callback, as seen by [`RecordingTranslator`].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Claim(HostKey),
    Create(ObjectKey, usize),
    Delete(ObjectKey),
    ConfirmCreate(ObjectKey),
    ConfirmDelete(ObjectKey, bool),
    Property(ObjectKey, String),
    Parent(ObjectKey, usize),
    Lock(ObjectKey),
    Unlock(ObjectKey),
    LockOwner(ObjectKey),
    SyncLocal(ObjectKey),
    Revert(ObjectKey),
    Restore(ObjectKey),
    Reference(PropertyKey),
}

pub type CallLog = Rc<RefCell<Vec<(ObjectType, Call)>>>;

type ClaimTest = Box<dyn Fn(&HostEntity) -> bool>;

/// Mirrors nodes of one type onto [`MemoryHost`] entities, copying top-level scalar fields,
/// and records every callback it receives.
pub struct RecordingTranslator {
    kind: ObjectType,
    log: CallLog,
    claims: Option<ClaimTest>,
    identity_field: Option<String>,
}

impl RecordingTranslator {
    pub fn new(kind: ObjectType, log: &CallLog) -> Self {
        Self {
            kind,
            log: log.clone(),
            claims: None,
            identity_field: None,
        }
    }

    /// Claim host entities matching `test` in `try_create`.
    pub fn claiming(mut self, test: impl Fn(&HostEntity) -> bool + 'static) -> Self {
        self.claims = Some(Box::new(test));
        self
    }

    /// Use the string field `field` as the duplicate-detection identity.
    pub fn with_identity(mut self, field: &str) -> Self {
        self.identity_field = Some(field.to_owned());
        self
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push((self.kind, call));
    }

    fn materialize(&self, ctx: &mut TestContext, node: ObjectKey, child_index: usize) {
        let parent = ctx
            .graph
            .parent(node)
            .and_then(|p| ctx.entity_of(p));
        let entity = ctx.host.spawn(parent);
        if parent.is_some() {
            ctx.host.reparent(entity, parent, child_index);
        }
        write_fields(ctx, node, entity);
        ctx.bind(node, entity);
    }
}

fn write_fields(ctx: &mut TestContext, node: ObjectKey, entity: HostKey) {
    let Some(root) = ctx.graph.property(node) else {
        return;
    };
    let fields: Vec<(String, Value)> = ctx
        .graph
        .properties()
        .fields(root)
        .into_iter()
        .filter_map(|name| {
            let value = ctx.graph.properties().get_value(root, &name)?.clone();
            Some((name, value))
        })
        .collect();
    for (name, value) in fields {
        if ctx.host.field(entity, &name) != Some(&value) {
            ctx.host.set_field(entity, &name, value);
        }
    }
}

impl Translator<MemorySession, MemoryHost> for RecordingTranslator {
    fn try_create(&mut self, ctx: &mut TestContext, entity: HostKey) -> Option<ObjectKey> {
        let host_entity = ctx.host.get(entity)?.clone();
        if !self.claims.as_ref().is_some_and(|test| test(&host_entity)) {
            return None;
        }
        let parent = host_entity.parent.and_then(|p| ctx.node_of(p));
        let tree = PropertyTree::dictionary(
            host_entity
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), PropertyTree::Value(value.clone()))),
        );
        let node = ctx.graph.create(self.kind, Some(&tree), parent, None).ok()?;
        ctx.bind(node, entity);
        self.record(Call::Claim(entity));
        Some(node)
    }

    fn identity_key(&self, ctx: &TestContext, node: ObjectKey) -> Option<String> {
        let field = self.identity_field.as_deref()?;
        let root = ctx.graph.property(node)?;
        match ctx.graph.properties().get_value(root, field)? {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn on_create(&mut self, ctx: &mut TestContext, node: ObjectKey, child_index: usize) {
        self.record(Call::Create(node, child_index));
        self.materialize(ctx, node, child_index);
    }

    fn on_delete(&mut self, _ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::Delete(node));
    }

    fn on_confirm_create(&mut self, _ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::ConfirmCreate(node));
    }

    fn on_confirm_delete(&mut self, _ctx: &mut TestContext, node: ObjectKey, unsubscribed: bool) {
        self.record(Call::ConfirmDelete(node, unsubscribed));
    }

    fn on_property_change(&mut self, ctx: &mut TestContext, change: &PropertyChange) {
        let Some(node) = change.container else {
            return;
        };
        self.record(Call::Property(node, change.path.to_string()));
        let Some(entity) = ctx.entity_of(node) else {
            return;
        };
        if let Some(PathSegment::Key(field)) = change.path.0.first() {
            let root = ctx.graph.property(node);
            match root.and_then(|r| ctx.graph.properties().get_value(r, field)).cloned() {
                Some(value) => ctx.host.set_field(entity, field, value),
                None => ctx.host.remove_field(entity, field),
            }
        }
    }

    fn on_parent_change(&mut self, ctx: &mut TestContext, node: ObjectKey, child_index: usize) {
        self.record(Call::Parent(node, child_index));
        let Some(entity) = ctx.entity_of(node) else {
            return;
        };
        let parent = ctx.graph.parent(node).and_then(|p| ctx.entity_of(p));
        ctx.host.reparent(entity, parent, child_index);
    }

    fn on_lock(&mut self, _ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::Lock(node));
    }

    fn on_unlock(&mut self, _ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::Unlock(node));
    }

    fn on_lock_owner_change(&mut self, _ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::LockOwner(node));
    }

    fn sync_local(&mut self, ctx: &mut TestContext, node: ObjectKey, entity: HostKey) {
        self.record(Call::SyncLocal(node));
        let (Some(root), Some(host_entity)) =
            (ctx.graph.property(node), ctx.host.get(entity).cloned())
        else {
            return;
        };
        for (name, value) in host_entity.fields {
            if ctx.graph.properties().get_value(root, &name) != Some(&value) {
                let _ = ctx.graph.properties_mut().set_value(root, &name, value);
            }
        }
    }

    fn revert(&mut self, ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::Revert(node));
        if let Some(entity) = ctx.entity_of(node) {
            write_fields(ctx, node, entity);
        }
    }

    fn restore(&mut self, ctx: &mut TestContext, node: ObjectKey) {
        self.record(Call::Restore(node));
        let index = ctx.graph.child_index(node).unwrap_or(0);
        self.materialize(ctx, node, index);
    }

    fn on_reference_change(&mut self, _ctx: &mut TestContext, property: PropertyKey) {
        self.record(Call::Reference(property));
    }
}

/// Calls recorded for `node`, in order.
pub fn calls_for(log: &CallLog, node: ObjectKey) -> Vec<Call> {
    log.borrow()
        .iter()
        .map(|(_, call)| call.clone())
        .filter(|call| match call {
            Call::Create(n, _)
            | Call::Delete(n)
            | Call::ConfirmCreate(n)
            | Call::ConfirmDelete(n, _)
            | Call::Property(n, _)
            | Call::Parent(n, _)
            | Call::Lock(n)
            | Call::Unlock(n)
            | Call::LockOwner(n)
            | Call::SyncLocal(n)
            | Call::Revert(n)
            | Call::Restore(n) => *n == node,
            Call::Claim(_) | Call::Reference(_) => false,
        })
        .collect()
}

pub fn new_log() -> CallLog {
    Rc::default()
}
