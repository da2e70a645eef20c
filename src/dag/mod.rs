//! Content addressing and dependency ordering.
//!
//! - [`ContentHash`]: 32-byte SHA3-256 address used as the message id
//! - [`DagNodeOps`]: trait for messages that reference other messages
//! - [`dependency_order`]: sorts a batch so referenced messages come first

mod hash;
pub mod ops;

pub use hash::{current_timestamp_millis, ContentHash};
pub use ops::{dependency_order, DagNodeOps};
