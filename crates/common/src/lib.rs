// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Pieces both ends of the admind protocol agree on: directory layout,
//! identity files, transaction naming and the runtime context.

pub mod config;
pub mod error;
pub mod identity;
pub mod layout;
pub mod transaction;

pub use config::{AdmindConfig, AdmindContext};
pub use error::{AdmindError, Result};
pub use identity::{DiscoveredServer, ServerIdentity};
pub use transaction::{AsyncStatus, TaskIdentifier, Transaction};
