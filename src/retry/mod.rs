//! Retry policies for a single endpoint
//!
//! The failover controller wraps every endpoint in a [`RetryExecutor`];
//! only transient provider errors are retried.

pub mod policy;

pub use policy::*;
