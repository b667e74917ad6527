//! Key -> Member Mapping
//!
//! Decides which peer a key replicates to. The table is rebuilt wholesale on
//! every view change under a write lock; lookups share a read lock, so a
//! reader never sees a half-built table.
//!
//! The local member is never part of the mapping: the member that writes a key
//! keeps the authoritative copy itself and ships replicas to the mapped peer.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::membership::service::GroupMemberEventListener;
use crate::membership::types::{MemberName, ViewChange};

const CHOICE_SEPARATOR: char = ':';

/// Ordered replica candidates for one slot of the mapping.
///
/// Rendered as the candidate names joined by `:`; the empty value is the
/// sentinel used when no peers exist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicaChoices(Vec<MemberName>);

impl ReplicaChoices {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(members: Vec<MemberName>) -> Self {
        Self(members)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn members(&self) -> &[MemberName] {
        &self.0
    }

    pub fn primary(&self) -> Option<&MemberName> {
        self.0.first()
    }
}

impl fmt::Display for ReplicaChoices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", CHOICE_SEPARATOR)?;
            }
            write!(f, "{}", member)?;
        }
        Ok(())
    }
}

impl FromStr for ReplicaChoices {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(CHOICE_SEPARATOR)
                .filter(|name| !name.is_empty())
                .map(MemberName::from)
                .collect(),
        ))
    }
}

/// Hashes a key with the process-independent default hasher.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Default)]
struct MappingState {
    members: Vec<MemberName>,
    replica_choices: Vec<ReplicaChoices>,
    previous_members: Vec<MemberName>,
}

pub struct KeyMapper {
    self_name: MemberName,
    replica_window: usize,
    state: RwLock<MappingState>,
}

impl KeyMapper {
    pub fn new(self_name: MemberName, replica_window: usize) -> Self {
        Self {
            self_name,
            replica_window: replica_window.max(1),
            state: RwLock::new(MappingState {
                replica_choices: vec![ReplicaChoices::empty()],
                ..MappingState::default()
            }),
        }
    }

    pub fn self_name(&self) -> &MemberName {
        &self.self_name
    }

    /// Rebuilds the mapping for a new view.
    ///
    /// `member` is the member the event is about; on a leave it is dropped from
    /// the previous-view snapshot as well, since its data is gone.
    pub fn on_view_change(
        &self,
        member: &MemberName,
        current: &[MemberName],
        previous: &[MemberName],
        is_join: bool,
    ) {
        let members = self.peers_of(current);
        let replica_choices = self.build_replica_choices(&members);
        let previous_members: Vec<MemberName> = self
            .peers_of(previous)
            .into_iter()
            .filter(|candidate| is_join || candidate != member)
            .collect();

        let mut state = self.state.write();
        state.members = members;
        state.replica_choices = replica_choices;
        state.previous_members = previous_members;

        tracing::info!(
            "Key mapper on {} rebuilt after {} {}: {} peer(s), {} previous",
            self.self_name,
            if is_join { "join of" } else { "departure of" },
            member,
            state.members.len(),
            state.previous_members.len()
        );
    }

    fn peers_of(&self, view: &[MemberName]) -> Vec<MemberName> {
        let mut peers: Vec<MemberName> = view
            .iter()
            .filter(|member| **member != self.self_name)
            .cloned()
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    fn build_replica_choices(&self, members: &[MemberName]) -> Vec<ReplicaChoices> {
        if members.is_empty() {
            return vec![ReplicaChoices::empty()];
        }
        let window = self.replica_window.min(members.len());
        (0..members.len())
            .map(|slot| {
                ReplicaChoices::new(
                    (0..window)
                        .map(|offset| members[(slot + offset) % members.len()].clone())
                        .collect(),
                )
            })
            .collect()
    }

    /// The peer a key replicates to, or `None` when there are no peers.
    pub fn get_mapped_instance(&self, key_hash: u64) -> Option<MemberName> {
        let state = self.state.read();
        if state.members.is_empty() {
            return None;
        }
        let index = (key_hash % state.members.len() as u64) as usize;
        Some(state.members[index].clone())
    }

    /// Replica candidates for a key; empty when there are no peers.
    pub fn get_replica_choices(&self, key_hash: u64) -> ReplicaChoices {
        let state = self.state.read();
        if state.members.is_empty() {
            return ReplicaChoices::empty();
        }
        let index = (key_hash % state.replica_choices.len() as u64) as usize;
        state.replica_choices[index].clone()
    }

    /// Where a key's data most likely lives after a view change.
    ///
    /// A caller-supplied `mapping_info` (the choices handed out when the key
    /// was written) wins; otherwise the key is hashed over the previous view.
    pub fn find_replica_instance(
        &self,
        key_hash: u64,
        mapping_info: Option<&ReplicaChoices>,
    ) -> Vec<MemberName> {
        if let Some(info) = mapping_info
            && !info.is_empty()
        {
            return info
                .members()
                .iter()
                .filter(|member| **member != self.self_name)
                .cloned()
                .collect();
        }

        let state = self.state.read();
        if state.previous_members.is_empty() {
            return Vec::new();
        }
        let index = (key_hash % state.previous_members.len() as u64) as usize;
        vec![state.previous_members[index].clone()]
    }

    pub fn members(&self) -> Vec<MemberName> {
        self.state.read().members.clone()
    }

    pub fn previous_members(&self) -> Vec<MemberName> {
        self.state.read().previous_members.clone()
    }

    pub fn replica_choice_table(&self) -> Vec<ReplicaChoices> {
        self.state.read().replica_choices.clone()
    }

    pub fn has_peers(&self) -> bool {
        !self.state.read().members.is_empty()
    }
}

impl GroupMemberEventListener for KeyMapper {
    fn on_view_change(&self, change: &ViewChange) {
        KeyMapper::on_view_change(
            self,
            &change.member,
            &change.current,
            &change.previous,
            change.is_join,
        );
    }
}
