//! # coordination
//!
//! The shared presence registry every arbiter writes to and reads from.
//!
//! This library provides:
//! - **[`CoordinationStore`]**, the handful of key/value and lease operations
//!   the arbiter needs, with an etcd implementation ([`EtcdClient`]) and an
//!   in-memory one for tests ([`memory::MemoryStore`]).
//! - **[`KeyLayout`]**, the deterministic key names for presence and
//!   resource-availability records.
//! - **[`LeaseManager`]**, one task per configured VIP that keeps this node's
//!   priority registered under a lease and withdraws it on step down.
//! - **[`StepDownController`]**, the single owner of the step-down signal,
//!   driven by aggregated health results.

pub mod client;
pub mod error;
pub mod keys;
pub mod lease;
pub mod memory;
pub mod registry;
pub mod stepdown;
pub mod store;

pub use client::{EtcdClient, EtcdConfig};
pub use error::{StoreError, StoreResult};
pub use keys::KeyLayout;
pub use lease::LeaseManager;
pub use registry::{EntryId, EntrySnapshot, EntryState, RegistryEntry};
pub use stepdown::StepDownController;
pub use store::{CoordinationStore, KeepAliveEvent, KeepAliveStream, KeyValue, LeaseId, bounded};
