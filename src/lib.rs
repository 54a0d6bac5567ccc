//! marlin — a MySQL-compatible SQL server front end.
//!
//! The crate sits between raw client connections speaking the MySQL wire
//! protocol and a query engine implementing [`sql::SqlEngine`]. Its core is
//! the [`handler::Handler`]: per-query it parses, coerces bind variables,
//! registers the query in the server-wide process list, streams rows in
//! batches of 128 through a bounded channel, watches the client socket for
//! out-of-band disconnects, enforces the per-row read timeout, and keeps
//! session status flags coherent on every exit path.

pub mod config;
pub mod engine;
pub mod handler;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sockstate;
pub mod sql;
