//! Entity lifecycle states and the transition rules between them.
//!
//! | From                | Event          | To                |
//! |---------------------|----------------|-------------------|
//! | Detached            | add            | Added             |
//! | Detached            | attach / load  | Unchanged         |
//! | Unchanged           | detect change  | Modified          |
//! | Unchanged, Modified | remove         | Deleted           |
//! | Added               | remove         | evicted           |
//! | Added, Modified     | accept changes | Unchanged         |
//! | Deleted             | accept changes | evicted           |
//!
//! Detaching evicts from any state. Forcing a state (bulk "mark as") is
//! allowed from every tracked state; forcing an Added entry to Deleted evicts
//! it because no row exists to delete.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an entity relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked by the session.
    Detached,
    /// Tracked, matches its snapshot.
    Unchanged,
    /// New; will be inserted.
    Added,
    /// Differs from its snapshot; will be updated.
    Modified,
    /// Marked for removal; will be deleted.
    Deleted,
}

impl EntityState {
    /// Returns true if a save has work to do for this state.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }

    /// Returns true if the entity is tracked.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        !matches!(self, Self::Detached)
    }

    /// Returns true if an entry in this state may have an unset key.
    #[must_use]
    pub const fn allows_unset_key(self) -> bool {
        matches!(self, Self::Detached | Self::Added)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "Detached",
            Self::Unchanged => "Unchanged",
            Self::Added => "Added",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// Something that happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Caller added a new instance.
    Add,
    /// Caller attached an existing instance, or it was loaded.
    Attach,
    /// Change detection found a field differing from the snapshot.
    DetectChange,
    /// Caller removed the entity.
    Remove,
    /// Caller detached the entity.
    Detach,
    /// A save wrote the entity successfully.
    AcceptChanges,
    /// Caller set the state directly.
    Force(EntityState),
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Attach => f.write_str("attach"),
            Self::DetectChange => f.write_str("detect change"),
            Self::Remove => f.write_str("remove"),
            Self::Detach => f.write_str("detach"),
            Self::AcceptChanges => f.write_str("accept changes"),
            Self::Force(state) => write!(f, "set state {state}"),
        }
    }
}

/// Outcome of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Entry stays tracked in the given state.
    To(EntityState),
    /// Entry leaves the identity map.
    Evict,
}

/// Computes the transition for `event` applied to an entry in `from`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidStateTransition`] if the event is not
/// meaningful in the current state.
pub fn next_state(from: EntityState, event: StateEvent) -> CoreResult<Transition> {
    use EntityState::{Added, Deleted, Detached, Modified, Unchanged};

    let transition = match (from, event) {
        (_, StateEvent::Detach) => Transition::Evict,

        (Detached, StateEvent::Add) => Transition::To(Added),
        (Added, StateEvent::Add) => Transition::To(Added),

        (Detached, StateEvent::Attach) => Transition::To(Unchanged),
        (Unchanged, StateEvent::Attach) => Transition::To(Unchanged),

        (Unchanged, StateEvent::DetectChange) => Transition::To(Modified),
        (Added | Modified | Deleted, StateEvent::DetectChange) => Transition::To(from),

        (Added, StateEvent::Remove) => Transition::Evict,
        (Unchanged | Modified | Deleted, StateEvent::Remove) => Transition::To(Deleted),

        (Added | Modified | Unchanged, StateEvent::AcceptChanges) => Transition::To(Unchanged),
        (Deleted, StateEvent::AcceptChanges) => Transition::Evict,

        (_, StateEvent::Force(Detached)) => Transition::Evict,
        (Added, StateEvent::Force(Deleted)) => Transition::Evict,
        (_, StateEvent::Force(target)) => Transition::To(target),

        _ => {
            return Err(CoreError::InvalidStateTransition {
                from,
                event: event.to_string(),
            })
        }
    };
    Ok(transition)
}

/// Checks the key invariant: only Detached or Added entries may have an
/// unset key.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if `state` requires a set key.
pub fn check_key(state: EntityState, key_is_set: bool) -> CoreResult<()> {
    if key_is_set || state.allows_unset_key() {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(format!(
            "an entity in state {state} must have its key set"
        )))
    }
}
