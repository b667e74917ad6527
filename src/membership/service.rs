//! Group Service Boundary
//!
//! The store does not detect failures or move bytes itself. It consumes a group
//! service that can name the local member, list the current core members,
//! notify listeners on view changes, and deliver opaque byte messages addressed
//! by member name and message token.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

use super::types::{MemberName, ViewChange};

/// Receives membership view changes.
///
/// May be invoked concurrently from transport threads.
pub trait GroupMemberEventListener: Send + Sync {
    fn on_view_change(&self, change: &ViewChange);
}

/// Receives inbound messages registered under a message token.
///
/// Implementations must never panic on malformed input: a bad message is
/// discarded and the receive path keeps running.
pub trait GroupMessageReceiver: Send + Sync {
    fn handle_message(&self, source: &MemberName, token: &str, payload: Bytes);
}

/// Membership and transport collaborator.
pub trait GroupService: Send + Sync {
    /// Name of the local member.
    fn member_name(&self) -> MemberName;

    /// Current alive-and-ready core members, including the local member.
    fn current_core_members(&self) -> Vec<MemberName>;

    fn register_member_event_listener(&self, id: &str, listener: Arc<dyn GroupMemberEventListener>);

    fn unregister_member_event_listener(&self, id: &str);

    fn register_message_receiver(&self, token: &str, receiver: Arc<dyn GroupMessageReceiver>);

    fn unregister_message_receiver(&self, token: &str);

    /// Sends `payload` to `target`, or to every other member when `target` is `None`.
    ///
    /// Returns `false` when the transport could not hand the message off. A
    /// broadcast counts as sent once any member accepted it.
    fn send_message(&self, target: Option<&MemberName>, token: &str, payload: Bytes) -> bool;
}

/// Explicit registry of group services keyed by group name.
///
/// Whoever boots the process owns the registry and passes it to the stores it
/// builds; there is no process-wide lookup.
pub struct GroupServiceRegistry {
    services: DashMap<String, Arc<dyn GroupService>>,
}

impl GroupServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
        })
    }

    /// Registers `service` under `group_name`, replacing any previous entry.
    pub fn register(&self, group_name: &str, service: Arc<dyn GroupService>) {
        self.services.insert(group_name.to_string(), service);
        tracing::info!("Registered group service for group '{}'", group_name);
    }

    pub fn lookup(&self, group_name: &str) -> Option<Arc<dyn GroupService>> {
        self.services
            .get(group_name)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, group_name: &str) -> Option<Arc<dyn GroupService>> {
        self.services.remove(group_name).map(|(_, service)| service)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for GroupServiceRegistry {
    fn default() -> Self {
        Self {
            services: DashMap::new(),
        }
    }
}
