use std::collections::HashMap;

use log::debug;

use crate::dispatcher::SyncContext;
use crate::error::{Error, Result};
use crate::ids::{HostKey, ObjectKey, ObjectType, PropertyKey};
use crate::property::PropertyChange;
use crate::traits::{HostProvider, Session};

/// Handler for property changes of one object type at one field path.
pub type PathHandler<S, H> = Box<dyn FnMut(&mut SyncContext<S, H>, &PropertyChange)>;

/// Maps a host entity type onto replicated objects of one [`ObjectType`].
///
/// Every hook has a no-op default, so a translator only implements the events it cares about.
/// Hooks receive the [`SyncContext`] instead of reaching for global state.
pub trait Translator<S, H> {
    /// Called once at registration. Register type+path handlers here.
    fn initialize(&mut self, _kind: ObjectType, _handlers: &mut PathHandlers<S, H>) {}

    /// Claim a new host entity by creating a node for it. Returning `Some` stops the search.
    fn try_create(&mut self, _ctx: &mut SyncContext<S, H>, _entity: HostKey) -> Option<ObjectKey> {
        None
    }

    /// Identifying key used to detect two independently created copies of one source object.
    fn identity_key(&self, _ctx: &SyncContext<S, H>, _node: ObjectKey) -> Option<String> {
        None
    }

    /// Materialise a node created by the authority. Parents are always created first.
    fn on_create(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey, _child_index: usize) {}

    fn on_delete(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    fn on_confirm_create(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    fn on_confirm_delete(
        &mut self,
        _ctx: &mut SyncContext<S, H>,
        _node: ObjectKey,
        _unsubscribed: bool,
    ) {
    }

    fn on_property_change(&mut self, _ctx: &mut SyncContext<S, H>, _change: &PropertyChange) {}

    fn on_parent_change(
        &mut self,
        _ctx: &mut SyncContext<S, H>,
        _node: ObjectKey,
        _child_index: usize,
    ) {
    }

    fn on_lock(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    fn on_unlock(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    fn on_lock_owner_change(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    /// Copy the host entity's current state into the node's properties.
    fn sync_local(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey, _entity: HostKey) {}

    /// Push the replicated state back onto the host, discarding a blocked local edit.
    fn revert(&mut self, _ctx: &mut SyncContext<S, H>, _node: ObjectKey) {}

    /// Bring back the host entity of a node whose local delete was blocked.
    fn restore(&mut self, ctx: &mut SyncContext<S, H>, node: ObjectKey) {
        let index = ctx.graph.child_index(node).unwrap_or(0);
        self.on_create(ctx, node, index);
    }

    /// A reference property owned by this translator's node now resolves differently.
    fn on_reference_change(&mut self, _ctx: &mut SyncContext<S, H>, _property: PropertyKey) {}
}

/// Type+path routing table for property changes.
pub struct PathHandlers<S, H> {
    handlers: HashMap<(ObjectType, String), Vec<PathHandler<S, H>>>,
}

impl<S, H> Default for PathHandlers<S, H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S, H> PathHandlers<S, H> {
    /// Route changes under the dotted field path `path` (list indices ignored) on nodes of `kind`.
    pub fn on(
        &mut self,
        kind: ObjectType,
        path: &str,
        handler: impl FnMut(&mut SyncContext<S, H>, &PropertyChange) + 'static,
    ) {
        self.handlers
            .entry((kind, path.to_owned()))
            .or_default()
            .push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns true if at least one handler ran.
    pub fn dispatch(
        &mut self,
        ctx: &mut SyncContext<S, H>,
        kind: ObjectType,
        change: &PropertyChange,
    ) -> bool {
        let Some(handlers) = self.handlers.get_mut(&(kind, change.path.field_path())) else {
            return false;
        };
        for handler in handlers.iter_mut() {
            handler(ctx, change);
        }
        true
    }
}

/// One translator per object type, kept in registration order.
pub struct TranslatorRegistry<S, H> {
    order: Vec<ObjectType>,
    translators: HashMap<ObjectType, Box<dyn Translator<S, H>>>,
    handlers: PathHandlers<S, H>,
}

impl<S, H> Default for TranslatorRegistry<S, H> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            translators: HashMap::new(),
            handlers: PathHandlers::default(),
        }
    }
}

impl<S: Session, H: HostProvider> TranslatorRegistry<S, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the translator for `kind`. Catch-all translators must be registered last:
    /// `try_create` offers entities in registration order.
    pub fn register(
        &mut self,
        kind: ObjectType,
        mut translator: Box<dyn Translator<S, H>>,
    ) -> Result<()> {
        if self.translators.contains_key(&kind) {
            return Err(Error::InvalidOperation(format!(
                "a translator for {kind} is already registered"
            )));
        }
        translator.initialize(kind, &mut self.handlers);
        self.order.push(kind);
        self.translators.insert(kind, translator);
        debug!("registered translator for {kind}");
        Ok(())
    }

    pub fn contains(&self, kind: ObjectType) -> bool {
        self.translators.contains_key(&kind)
    }

    pub fn kinds(&self) -> &[ObjectType] {
        &self.order
    }

    pub fn translator_mut(&mut self, kind: ObjectType) -> Option<&mut Box<dyn Translator<S, H>>> {
        self.translators.get_mut(&kind)
    }

    pub fn translator(&self, kind: ObjectType) -> Option<&dyn Translator<S, H>> {
        self.translators.get(&kind).map(|t| t.as_ref())
    }

    pub fn handlers(&self) -> &PathHandlers<S, H> {
        &self.handlers
    }

    /// Offer `entity` to each translator in registration order; the first claim wins.
    pub fn try_create(
        &mut self,
        ctx: &mut SyncContext<S, H>,
        entity: HostKey,
    ) -> Option<(ObjectType, ObjectKey)> {
        for kind in &self.order {
            let Some(translator) = self.translators.get_mut(kind) else {
                continue;
            };
            if let Some(node) = translator.try_create(ctx, entity) {
                return Some((*kind, node));
            }
        }
        None
    }

    /// Route a change to the type+path handlers and then to the owning translator.
    pub fn dispatch_change(&mut self, ctx: &mut SyncContext<S, H>, change: &PropertyChange) {
        let Some(kind) = change.container.and_then(|c| ctx.graph.kind(c)) else {
            return;
        };
        self.handlers.dispatch(ctx, kind, change);
        if let Some(translator) = self.translators.get_mut(&kind) {
            translator.on_property_change(ctx, change);
        }
    }
}
