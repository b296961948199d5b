#![forbid(unsafe_code)]
//! Replicated scene-graph synchronization: an object tree with typed properties, per-type
//! translators that mirror it into a host environment, lock propagation and conflict
//! resolution. The session transport and the host entity system stay behind the traits in
//! [`traits`], so the engine can be driven by any editor and any authority.

pub mod config;
pub mod conflict;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod lock;
pub mod property;
pub mod traits;
pub mod translator;
pub mod waitlist;

pub use config::EngineConfig;
pub use conflict::{plan_removal, ConflictResolver, HistoryKind, RemovalPlan, Resolution};
pub use dispatcher::{CreateOutcome, Deferred, Dispatcher, SyncContext, TickReport};
pub use error::{Error, Result};
pub use events::{
    CreateRequest, HostEvent, OutboundMessage, PropertyDiff, RemoteEvent, RemoteObject, UserInfo,
};
pub use graph::{ObjectFlags, ObjectGraph, ReplicatedObject, SyncState};
pub use ids::{HostKey, ObjectId, ObjectKey, ObjectType, ParentRule, PropertyKey, UserId};
pub use lock::{
    EditGate, EditKind, LockLevel, LockManager, LockTransition, StaleHook, StaleNotice, StaleReason,
};
pub use property::{
    ChangeKind, PathSegment, PropertyChange, PropertyDelta, PropertyKind, PropertyPath,
    PropertyStore, PropertyTree, Value,
};
pub use traits::{HostProvider, Session};
pub use translator::{PathHandler, PathHandlers, Translator, TranslatorRegistry};
pub use waitlist::{CreateWaitlist, ParkedCreate};
