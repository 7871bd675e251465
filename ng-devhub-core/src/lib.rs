//! Device driver execution and hub reconciliation.
//!
//! - [`registry::ExecutorRegistry`] owns one [`executor::DriverExecutor`] per live device
//! - [`router::MessageRouter`] moves bus traffic into executors and the device service
//! - [`reconcile::ReconciliationEngine`] diffs hub reports against platform records

pub mod codec;
pub mod context;
pub mod driver;
pub mod executor;
pub mod reconcile;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod service;
