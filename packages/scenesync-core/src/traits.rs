use crate::events::{HostEvent, OutboundMessage, RemoteEvent, UserInfo};
use crate::ids::{HostKey, ObjectType, UserId};

/// Transport and authority. Ordering of `send` is preserved by the session.
pub trait Session {
    fn local_user(&self) -> UserId;

    fn send(&mut self, message: OutboundMessage);

    /// Drain the inbound events received since the last poll.
    fn poll(&mut self) -> Vec<RemoteEvent>;

    fn user(&self, _id: UserId) -> Option<UserInfo> {
        None
    }

    /// Per-type cap on live objects, if the session imposes one.
    fn object_limit(&self, _kind: ObjectType) -> Option<usize> {
        None
    }
}

/// The editing environment that owns the real entities.
pub trait HostProvider {
    fn is_valid(&self, entity: HostKey) -> bool;

    fn destroy(&mut self, entity: HostKey);

    /// Entities that must be removed before `entity` can be (e.g. components requiring it).
    fn dependents(&self, _entity: HostKey) -> Vec<HostKey> {
        Vec::new()
    }

    /// Drain local edits since the last poll.
    fn poll_changes(&mut self) -> Vec<HostEvent>;

    /// While suppressed, changes the engine makes to the host must not be reported back by
    /// `poll_changes`.
    fn set_suppressed(&mut self, suppressed: bool);
}
