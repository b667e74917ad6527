//! Replicated Data Store
//!
//! A partitioned, replicated in-memory key-value store for failover state.
//!
//! ## Core Concepts
//! - **Entries**: Every key maps to a versioned `DataStoreEntry`. Replicated
//!   updates apply in version order; early arrivals wait in a pending set.
//! - **Placement**: `KeyMapper` maps each key to one peer from the current
//!   view and remembers the previous view for failover lookups.
//! - **Replication**: The writer keeps the authoritative copy and ships a SAVE,
//!   TOUCH or REMOVE to the mapped peer, optionally waiting for an ack.
//! - **Access**: `ReplicatedDataStore` serves reads locally and falls back to
//!   loading from the likely replica holder when the local copy is missing.
//!
//! ## Entry Lifetime
//! An entry leaves the table only when a sweep finds it idle or expired; an
//! explicit remove leaves a tombstone for the sweeps to reclaim. A view
//! change does not drop entries: a replica whose key now maps elsewhere keeps
//! its copy, serving failover loads, until an idle or expiry sweep reclaims
//! it. A key restarted after eviction opens a new version lineage (see
//! `entry`), so the stale copy never shadows it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;

pub mod config;
pub mod entry;
pub mod error;
pub mod key_mapper;
pub mod store;
pub mod table;

#[cfg(test)]
mod tests;

/// Bounds every store key satisfies.
pub trait StoreKey:
    Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreKey for T where
    T: Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds every store value satisfies.
pub trait StoreValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
