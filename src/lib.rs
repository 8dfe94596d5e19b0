//! rowsync — a continuous, heterogeneous database replication engine.
//!
//! Sources (MariaDB, MSSQL, PostgreSQL, MongoDB) are observed through a
//! single [`source::SourceAdapter`] trait and converged into a PostgreSQL
//! target warehouse by repeated snapshot/delta/reconciliation cycles. The
//! [`catalog`] module tracks per-table progress and status; the
//! [`statemachine`] drives one table through one cycle; the [`detector`]
//! decides and executes what that cycle actually does; the [`target`]
//! module is the only thing that ever writes to the warehouse; and
//! [`scheduler`] fans the whole thing out across tables and engines under
//! a shared [`runtime::Runtime`].

pub mod catalog;
pub mod cursor;
pub mod detector;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod statemachine;
pub mod target;
pub mod value;
