//! kasho — change-data-capture replication with on-the-fly column
//! anonymization for PostgreSQL and MySQL.
//!
//! The replication core is four subsystems wired together by the two
//! service binaries:
//!
//! - [`capture`] — consumes the source's native CDC stream (logical
//!   decoding or the binlog) and normalizes it into ordered
//!   [`change::Change`] records.
//! - [`buffer`] — a durable, position-keyed log decoupling capture from
//!   apply, with fan-out subscribe-from-position and a network stream
//!   surface.
//! - [`transform`] — deterministic per-column fake-value substitution
//!   driven by declarative YAML config.
//! - [`apply`] — a resume-aware consumer rendering transformed changes
//!   into dialect SQL against the replica.
//!
//! The bootstrap ingester (`kasho-bootstrap`, a separate workspace
//! member) seeds the buffer from a SQL dump with synthetic positions
//! ordered before any live change.

pub mod apply;
pub mod buffer;
pub mod capture;
pub mod change;
pub mod config;
pub mod dialect;
pub mod error;
pub mod license;
pub mod transform;

pub use change::{Change, Position};
pub use error::KashoError;
