//! In-Process Group Service
//!
//! `LocalCluster` hosts any number of named members inside one process and
//! implements the group-service contract for each of them. Membership is
//! explicit (`join` / `leave`), view changes are delivered synchronously to
//! every registered listener, and each message is delivered on its own tokio
//! task so handlers run concurrently, as they would behind a real transport.

use anyhow::{Result, bail};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::service::{GroupMemberEventListener, GroupMessageReceiver, GroupService};
use super::types::{MemberName, ViewChange};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SETTLE_LIMIT: Duration = Duration::from_secs(10);

pub struct LocalCluster {
    members: RwLock<Vec<MemberName>>,
    nodes: DashMap<MemberName, Arc<LocalGroupService>>,
    unreachable: DashSet<MemberName>,
    in_flight: Arc<AtomicUsize>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(Vec::new()),
            nodes: DashMap::new(),
            unreachable: DashSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Adds a member and notifies every existing member of the new view.
    pub fn join(self: &Arc<Self>, name: impl Into<MemberName>) -> Result<Arc<LocalGroupService>> {
        let name = name.into();
        if name.is_empty() {
            bail!("member name must not be empty");
        }

        let service = Arc::new(LocalGroupService {
            name: name.clone(),
            cluster: Arc::downgrade(self),
            listeners: DashMap::new(),
            receivers: DashMap::new(),
        });

        let change = {
            let mut members = self.members.write();
            if members.contains(&name) {
                bail!("member {} already joined", name);
            }
            let previous = members.clone();
            members.push(name.clone());
            members.sort();
            self.nodes.insert(name.clone(), service.clone());
            ViewChange::joined(name.clone(), members.clone(), previous)
        };

        tracing::info!("Member {} joined, cluster size now: {}", name, change.current.len());
        self.notify(&change);

        Ok(service)
    }

    /// Removes a member and notifies the survivors of the new view.
    pub fn leave(&self, name: &MemberName) -> Result<()> {
        let change = {
            let mut members = self.members.write();
            let Some(position) = members.iter().position(|member| member == name) else {
                bail!("member {} is not part of the cluster", name);
            };
            let previous = members.clone();
            members.remove(position);
            self.nodes.remove(name);
            ViewChange::left(name.clone(), members.clone(), previous)
        };

        self.unreachable.remove(name);
        tracing::info!("Member {} left, cluster size now: {}", name, change.current.len());
        self.notify(&change);

        Ok(())
    }

    /// Marks a member as unreachable: messages to or from it are refused.
    pub fn set_reachable(&self, name: &MemberName, reachable: bool) {
        if reachable {
            self.unreachable.remove(name);
        } else {
            self.unreachable.insert(name.clone());
        }
    }

    pub fn members(&self) -> Vec<MemberName> {
        self.members.read().clone()
    }

    pub fn service(&self, name: &MemberName) -> Option<Arc<LocalGroupService>> {
        self.nodes.get(name).map(|entry| entry.value().clone())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every delivered message (and everything it triggered) has
    /// been handled.
    pub async fn settle(&self) {
        let started = std::time::Instant::now();
        tokio::task::yield_now().await;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if started.elapsed() > SETTLE_LIMIT {
                tracing::warn!(
                    "Cluster did not settle, {} messages still in flight",
                    self.in_flight()
                );
                return;
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    fn notify(&self, change: &ViewChange) {
        let listeners: Vec<Arc<dyn GroupMemberEventListener>> = self
            .nodes
            .iter()
            .flat_map(|node| {
                node.value()
                    .listeners
                    .iter()
                    .map(|listener| listener.value().clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        for listener in listeners {
            listener.on_view_change(change);
        }
    }

    fn deliver(&self, source: &MemberName, target: &MemberName, token: &str, payload: Bytes) -> bool {
        if self.unreachable.contains(source) || self.unreachable.contains(target) {
            tracing::debug!("Dropping message {} -> {}: member unreachable", source, target);
            return false;
        }
        if !self.nodes.contains_key(source) {
            tracing::debug!("Dropping message from departed member {}", source);
            return false;
        }

        let receiver = match self.nodes.get(target) {
            Some(node) => match node.receivers.get(token) {
                Some(receiver) => receiver.value().clone(),
                None => {
                    tracing::trace!("No receiver for token '{}' on {}", token, target);
                    return false;
                }
            },
            None => {
                tracing::debug!("Dropping message to unknown member {}", target);
                return false;
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());
        let source = source.clone();
        let token = token.to_string();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _guard = guard;
                    receiver.handle_message(&source, &token, payload);
                });
            }
            Err(_) => {
                let _guard = guard;
                receiver.handle_message(&source, &token, payload);
            }
        }

        true
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One member's view of a `LocalCluster`.
pub struct LocalGroupService {
    name: MemberName,
    cluster: Weak<LocalCluster>,
    listeners: DashMap<String, Arc<dyn GroupMemberEventListener>>,
    receivers: DashMap<String, Arc<dyn GroupMessageReceiver>>,
}

impl LocalGroupService {
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}

impl GroupService for LocalGroupService {
    fn member_name(&self) -> MemberName {
        self.name.clone()
    }

    fn current_core_members(&self) -> Vec<MemberName> {
        self.cluster
            .upgrade()
            .map(|cluster| cluster.members())
            .unwrap_or_default()
    }

    fn register_member_event_listener(&self, id: &str, listener: Arc<dyn GroupMemberEventListener>) {
        self.listeners.insert(id.to_string(), listener);
    }

    fn unregister_member_event_listener(&self, id: &str) {
        self.listeners.remove(id);
    }

    fn register_message_receiver(&self, token: &str, receiver: Arc<dyn GroupMessageReceiver>) {
        self.receivers.insert(token.to_string(), receiver);
    }

    fn unregister_message_receiver(&self, token: &str) {
        self.receivers.remove(token);
    }

    fn send_message(&self, target: Option<&MemberName>, token: &str, payload: Bytes) -> bool {
        let Some(cluster) = self.cluster.upgrade() else {
            return false;
        };

        match target {
            Some(target) => cluster.deliver(&self.name, target, token, payload),
            None => {
                let mut delivered = false;
                for member in cluster.members() {
                    if member == self.name {
                        continue;
                    }
                    if cluster.deliver(&self.name, &member, token, payload.clone()) {
                        delivered = true;
                    } else {
                        tracing::debug!("Broadcast from {} skipped {}", self.name, member);
                    }
                }
                delivered
            }
        }
    }
}
