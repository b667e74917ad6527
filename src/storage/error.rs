use crate::command::codec::CodecError;
use crate::membership::types::MemberName;

/// The single coarse error surfaced by store operations.
///
/// Not-found and unacknowledged replication are outcomes, not errors.
#[derive(thiserror::Error, Debug)]
pub enum DataStoreError {
    /// Raised only while building a store.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store '{0}' is closed")]
    Closed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport refused message for {target}")]
    Transmit { target: String },

    /// A command vetoed its own transmission.
    #[error("command rejected: {0}")]
    Rejected(String),
}

impl DataStoreError {
    pub fn transmit(target: Option<&MemberName>) -> Self {
        Self::Transmit {
            target: target
                .map(|member| member.to_string())
                .unwrap_or_else(|| "<broadcast>".to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, DataStoreError>;
