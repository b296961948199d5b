#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunables for the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Deferred actions run per tick; the rest wait for the next tick.
    pub max_deferred_per_tick: usize,
    /// Tie-break duplicate creates of the same source object.
    pub resolve_duplicates: bool,
    /// Refuse local creates beyond the session's per-type object limit.
    pub enforce_object_limits: bool,
    /// Remote creates waiting for their parent. The oldest is dropped when full.
    pub max_parked_creates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_deferred_per_tick: 256,
            resolve_duplicates: true,
            enforce_object_limits: true,
            max_parked_creates: 1024,
        }
    }
}
