//! Membership & Transport Boundary
//!
//! The replicated store treats group membership and message transport as an
//! external collaborator. This module defines that collaborator's contract and
//! ships an in-process implementation.
//!
//! ## Core Concepts
//! - **Group Service**: names the local member, lists current core members, reports view
//!   changes, and sends opaque byte messages to a named member (or to everyone).
//! - **Registry**: an explicit `GroupServiceRegistry` owned by whoever boots the store.
//! - **Local Cluster**: `LocalCluster` runs several members in one process, delivering each
//!   message on its own tokio task.

pub mod local;
pub mod service;
pub mod types;
