//! Concrete health checks
pub mod interface;
pub mod keepalived;
pub mod nas;
pub mod process;
