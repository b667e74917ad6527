//! Replicated Failover Store
//!
//! A peer-to-peer, partitioned, replicated in-memory key-value store for
//! failover state such as web sessions.
//!
//! ## Architecture Modules
//! The crate is split into three layers:
//!
//! - **`membership`**: The group-service boundary. Names members, reports view
//!   changes and moves opaque byte messages. `LocalCluster` implements it in
//!   process.
//! - **`command`**: Store operations as serializable commands, their wire
//!   format, the interceptor chain they pass through, and request/response
//!   correlation.
//! - **`storage`**: Versioned entries, key-to-member mapping and the
//!   `ReplicatedDataStore` façade applications use.

pub mod command;
pub mod membership;
pub mod storage;

pub use membership::service::{GroupService, GroupServiceRegistry};
pub use membership::types::MemberName;
pub use storage::config::StoreConfig;
pub use storage::error::{DataStoreError, StoreResult};
pub use storage::store::{ReplicatedDataStore, ReplicationStatus, SaveReceipt, StoreBuilder};
