use bytes::Bytes;
use std::fmt;

use crate::membership::types::MemberName;
use crate::storage::error::{DataStoreError, StoreResult};

/// First byte of every encoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    Save = 1,
    Remove = 2,
    Touch = 3,
    LoadRequest = 4,
    LoadResponse = 5,
    RemoveExpired = 6,
    SimpleAck = 7,
    Noop = 8,
}

impl Opcode {
    pub const ALL: [Opcode; 8] = [
        Opcode::Save,
        Opcode::Remove,
        Opcode::Touch,
        Opcode::LoadRequest,
        Opcode::LoadResponse,
        Opcode::RemoveExpired,
        Opcode::SimpleAck,
        Opcode::Noop,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Save => "SAVE",
            Opcode::Remove => "REMOVE",
            Opcode::Touch => "TOUCH",
            Opcode::LoadRequest => "LOAD_REQUEST",
            Opcode::LoadResponse => "LOAD_RESPONSE",
            Opcode::RemoveExpired => "REMOVE_EXPIRED",
            Opcode::SimpleAck => "SIMPLE_ACK",
            Opcode::Noop => "NOOP",
        }
    }

    /// Whether the command carries a key after the opcode byte.
    pub fn is_keyed(&self) -> bool {
        matches!(
            self,
            Opcode::Save
                | Opcode::Remove
                | Opcode::Touch
                | Opcode::LoadRequest
                | Opcode::LoadResponse
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Save),
            2 => Ok(Opcode::Remove),
            3 => Ok(Opcode::Touch),
            4 => Ok(Opcode::LoadRequest),
            5 => Ok(Opcode::LoadResponse),
            6 => Ok(Opcode::RemoveExpired),
            7 => Ok(Opcode::SimpleAck),
            8 => Ok(Opcode::Noop),
            other => Err(other),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Member(MemberName),
    Broadcast,
}

impl Destination {
    pub fn member(&self) -> Option<&MemberName> {
        match self {
            Destination::Member(member) => Some(member),
            Destination::Broadcast => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Member(member) => write!(f, "{}", member),
            Destination::Broadcast => f.write_str("<broadcast>"),
        }
    }
}

/// Per-opcode body of a command. Field order mirrors the wire layout.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<K> {
    Save {
        key: K,
        version: i64,
        last_accessed: u64,
        max_idle_ms: u64,
        ack_token: Option<u64>,
        value: Bytes,
    },
    Remove {
        key: K,
        version: i64,
        ack_token: Option<u64>,
    },
    Touch {
        key: K,
        version: i64,
        last_accessed: u64,
        max_idle_ms: u64,
        ack_token: Option<u64>,
    },
    LoadRequest {
        key: K,
        token: u64,
        originating: MemberName,
        /// Sent to one member rather than broadcast; a directed request is
        /// always answered, even on a miss.
        directed: bool,
    },
    LoadResponse {
        key: K,
        version: i64,
        token: u64,
        originating: MemberName,
        responding: MemberName,
        value: Option<Bytes>,
    },
    RemoveExpired,
    SimpleAck {
        token: u64,
    },
    Noop,
}

impl<K> Payload<K> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Payload::Save { .. } => Opcode::Save,
            Payload::Remove { .. } => Opcode::Remove,
            Payload::Touch { .. } => Opcode::Touch,
            Payload::LoadRequest { .. } => Opcode::LoadRequest,
            Payload::LoadResponse { .. } => Opcode::LoadResponse,
            Payload::RemoveExpired => Opcode::RemoveExpired,
            Payload::SimpleAck { .. } => Opcode::SimpleAck,
            Payload::Noop => Opcode::Noop,
        }
    }

    pub fn key(&self) -> Option<&K> {
        match self {
            Payload::Save { key, .. }
            | Payload::Remove { key, .. }
            | Payload::Touch { key, .. }
            | Payload::LoadRequest { key, .. }
            | Payload::LoadResponse { key, .. } => Some(key),
            Payload::RemoveExpired | Payload::SimpleAck { .. } | Payload::Noop => None,
        }
    }

    pub fn ack_token(&self) -> Option<u64> {
        match self {
            Payload::Save { ack_token, .. }
            | Payload::Remove { ack_token, .. }
            | Payload::Touch { ack_token, .. } => *ack_token,
            _ => None,
        }
    }
}

/// A store operation addressed to a member (or to everyone).
#[derive(Debug, Clone, PartialEq)]
pub struct Command<K> {
    pub destination: Destination,
    pub payload: Payload<K>,
}

impl<K> Command<K> {
    pub fn to_member(member: MemberName, payload: Payload<K>) -> Self {
        Self {
            destination: Destination::Member(member),
            payload,
        }
    }

    pub fn broadcast(payload: Payload<K>) -> Self {
        Self {
            destination: Destination::Broadcast,
            payload,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.payload.opcode()
    }

    pub fn key(&self) -> Option<&K> {
        self.payload.key()
    }

    /// Last check before a command is serialized. A command that lacks the
    /// routing information its receiver needs is refused here.
    pub fn validate_for_transmit(&self) -> StoreResult<()> {
        if let Destination::Member(member) = &self.destination
            && member.is_empty()
        {
            return Err(DataStoreError::Rejected(format!(
                "{} has an empty destination",
                self.opcode()
            )));
        }

        match &self.payload {
            Payload::LoadRequest { originating, .. } if originating.is_empty() => Err(
                DataStoreError::Rejected("LOAD_REQUEST without an originating member".to_string()),
            ),
            Payload::LoadResponse { responding, .. } if responding.is_empty() => Err(
                DataStoreError::Rejected("LOAD_RESPONSE without a responding member".to_string()),
            ),
            Payload::SimpleAck { token: 0 } => Err(DataStoreError::Rejected(
                "SIMPLE_ACK without a token".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// What a `ResponseMediator` slot is resolved with.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Acknowledged {
        responder: MemberName,
    },
    Loaded {
        version: i64,
        value: Option<Bytes>,
        responder: MemberName,
    },
}

impl CommandResponse {
    pub fn responder(&self) -> &MemberName {
        match self {
            CommandResponse::Acknowledged { responder } | CommandResponse::Loaded { responder, .. } => {
                responder
            }
        }
    }
}
