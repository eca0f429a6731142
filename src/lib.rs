//! Crossroads - a split-horizon DNS forwarder.
//!
//! Queries are routed to upstream groups by domain rules, answers can be
//! re-resolved through another group based on the addresses they contain,
//! and the whole configuration can be swapped while requests are in flight.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod group;
pub mod handler;
pub mod hosts;
pub mod ping;
pub mod proxy;
pub mod redirect;
pub mod sink;
pub mod stats;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use handler::{Handler, Reply, Snapshot, Source};
