//! # entitrack Testkit
//!
//! Test utilities for entitrack.
//!
//! This crate provides:
//! - A school model (standards, students, addresses, courses, teachers)
//!   over an in-memory store, with seeding helpers
//! - A recording storage driver that logs statements and injects failures
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use entitrack_testkit::prelude::*;
//!
//! let school = SchoolDb::new();
//! let standard = school.seed_standard("Grade 1");
//!
//! let mut session = school.session();
//! let found = session.find("Standard", standard).unwrap();
//! assert!(found.is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recording::*;
    pub use entitrack_core::{
        CoreError, Entity, EntityRef, EntityState, SaveResult, Session, SessionConfig,
    };
    pub use entitrack_storage::{
        InMemoryDriver, InMemoryStore, Predicate, Row, StatementKind, Value,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recording::*;
