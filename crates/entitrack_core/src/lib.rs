//! # entitrack Core
//!
//! Change-tracking and persistence-orchestration engine.
//!
//! A [`Session`] tracks entity instances against a
//! [`StorageDriver`](entitrack_storage::StorageDriver) and turns their
//! changes into one transactional batch of writes:
//!
//! - **Identity map**: one tracked entry per (entity type, key)
//! - **State machine**: Detached, Unchanged, Added, Modified, Deleted
//! - **Snapshot diff**: field-level deltas against the values captured at
//!   attach or load time
//! - **Save orchestration**: dependency-ordered inserts, updates and deletes
//!   inside one transaction, applied to tracked state only after commit
//! - **Optimistic concurrency**: token or snapshot predicates, zero-row
//!   writes reported as [`CoreError::ConcurrencyConflict`]
//! - **Navigation loading**: lazy or explicit, routed through the identity
//!   map
//!
//! Entity types are described at runtime by [`EntityDescriptor`]s collected
//! in a [`DescriptorRegistry`]; the engine never generates SQL.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attach;
mod config;
mod conflict;
mod descriptor;
mod entity;
mod entry;
mod error;
mod identity;
mod loader;
mod plan;
mod save;
mod session;
mod snapshot;
mod state;
mod types;

pub use config::SessionConfig;
pub use conflict::write_predicate;
pub use descriptor::{
    Cardinality, DescriptorRegistry, EntityDescriptor, FieldType, ForeignKeySide, Navigation,
    ScalarField,
};
pub use entity::Entity;
pub use entry::{EntrySummary, FieldValues, TrackedEntry};
pub use error::{CoreError, CoreResult};
pub use identity::{IdentityMap, Tracked};
pub use plan::{WorkPlan, WriteOp};
pub use save::{CancelHandle, SaveResult};
pub use session::{EntityRef, Session};
pub use snapshot::{capture_snapshot, compute_change_set, ChangeSet, FieldChange};
pub use state::{next_state, EntityState, StateEvent, Transition};
pub use types::{EntityKey, EntryId, SessionId};
