use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a cluster member, as reported by the group service.
///
/// Member names are the only addressing the store knows about: the key mapper
/// sorts them, the command manager sends to them, and entries remember which
/// one holds the authoritative copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberName(pub String);

impl MemberName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generates a random, UUID v4-based member name.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for MemberName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A membership event delivered to `GroupMemberEventListener`s.
///
/// `member` is the member the event is about (the one that joined or left),
/// `current` and `previous` are the alive-and-ready sets after and before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChange {
    pub member: MemberName,
    pub current: Vec<MemberName>,
    pub previous: Vec<MemberName>,
    pub is_join: bool,
}

impl ViewChange {
    pub fn joined(member: MemberName, current: Vec<MemberName>, previous: Vec<MemberName>) -> Self {
        Self {
            member,
            current,
            previous,
            is_join: true,
        }
    }

    pub fn left(member: MemberName, current: Vec<MemberName>, previous: Vec<MemberName>) -> Self {
        Self {
            member,
            current,
            previous,
            is_join: false,
        }
    }
}
