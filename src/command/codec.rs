//! Command Wire Format
//!
//! Every command is framed as one opcode byte followed by its fields in a
//! fixed order. Integers are big-endian. Variable-length fields (keys, member
//! names, values) are a `u32` length followed by that many bytes.
//!
//! ```text
//! SAVE            op | key | version i64 | last_accessed u64 | max_idle u64 | ack u64 | value
//! REMOVE          op | key | version i64 | ack u64
//! TOUCH           op | key | version i64 | last_accessed u64 | max_idle u64 | ack u64
//! LOAD_REQUEST    op | key | token u64 | originating | directed u8
//! LOAD_RESPONSE   op | key | version i64 | token u64 | originating | responding | has_value u8 [| value]
//! REMOVE_EXPIRED  op
//! SIMPLE_ACK      op | token u64
//! NOOP            op
//! ```
//!
//! An ack token of zero means "no acknowledgement requested".
//!
//! Keys go through a `KeyTransformer` when one is configured, otherwise through
//! `bincode`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

use super::types::{Opcode, Payload};
use crate::membership::types::MemberName;

const NO_ACK: u64 = 0;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("empty message")]
    Empty,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid member name: {0}")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("key error: {0}")]
    Key(String),

    #[error("{0} trailing bytes after command")]
    TrailingBytes(usize),

    #[error("field of {0} bytes does not fit a u32 length prefix")]
    TooLarge(usize),
}

/// Turns keys into raw bytes and back, bypassing generic serialization.
pub trait KeyTransformer<K>: Send + Sync {
    fn to_bytes(&self, key: &K) -> Vec<u8>;
    fn from_bytes(&self, bytes: &[u8]) -> Result<K, String>;
}

/// UTF-8 bytes for `String` keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringKeyTransformer;

impl KeyTransformer<String> for StringKeyTransformer {
    fn to_bytes(&self, key: &String) -> Vec<u8> {
        key.as_bytes().to_vec()
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<String, String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
    }
}

/// Returns the opcode of an encoded message without decoding the rest.
pub fn peek_opcode(bytes: &[u8]) -> Option<Opcode> {
    bytes.first().and_then(|byte| Opcode::try_from(*byte).ok())
}

pub struct CommandCodec<K> {
    key_transformer: Option<Arc<dyn KeyTransformer<K>>>,
    _key: PhantomData<fn() -> K>,
}

impl<K> Clone for CommandCodec<K> {
    fn clone(&self) -> Self {
        Self {
            key_transformer: self.key_transformer.clone(),
            _key: PhantomData,
        }
    }
}

impl<K> Default for CommandCodec<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> CommandCodec<K> {
    pub fn new() -> Self {
        Self {
            key_transformer: None,
            _key: PhantomData,
        }
    }

    pub fn with_key_transformer(transformer: Arc<dyn KeyTransformer<K>>) -> Self {
        Self {
            key_transformer: Some(transformer),
            _key: PhantomData,
        }
    }

    pub fn has_key_transformer(&self) -> bool {
        self.key_transformer.is_some()
    }
}

impl<K> CommandCodec<K>
where
    K: Serialize + DeserializeOwned,
{
    pub fn encode(&self, payload: &Payload<K>) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(payload.opcode() as u8);

        if let Some(key) = payload.key() {
            let key_bytes = self.encode_key(key)?;
            put_field(&mut buf, &key_bytes)?;
        }

        match payload {
            Payload::Save {
                version,
                last_accessed,
                max_idle_ms,
                ack_token,
                value,
                ..
            } => {
                buf.put_i64(*version);
                buf.put_u64(*last_accessed);
                buf.put_u64(*max_idle_ms);
                buf.put_u64(ack_token.unwrap_or(NO_ACK));
                put_field(&mut buf, value)?;
            }
            Payload::Remove {
                version, ack_token, ..
            } => {
                buf.put_i64(*version);
                buf.put_u64(ack_token.unwrap_or(NO_ACK));
            }
            Payload::Touch {
                version,
                last_accessed,
                max_idle_ms,
                ack_token,
                ..
            } => {
                buf.put_i64(*version);
                buf.put_u64(*last_accessed);
                buf.put_u64(*max_idle_ms);
                buf.put_u64(ack_token.unwrap_or(NO_ACK));
            }
            Payload::LoadRequest {
                token,
                originating,
                directed,
                ..
            } => {
                buf.put_u64(*token);
                put_field(&mut buf, originating.as_str().as_bytes())?;
                buf.put_u8(u8::from(*directed));
            }
            Payload::LoadResponse {
                version,
                token,
                originating,
                responding,
                value,
                ..
            } => {
                buf.put_i64(*version);
                buf.put_u64(*token);
                put_field(&mut buf, originating.as_str().as_bytes())?;
                put_field(&mut buf, responding.as_str().as_bytes())?;
                match value {
                    Some(value) => {
                        buf.put_u8(1);
                        put_field(&mut buf, value)?;
                    }
                    None => buf.put_u8(0),
                }
            }
            Payload::SimpleAck { token } => buf.put_u64(*token),
            Payload::RemoveExpired | Payload::Noop => {}
        }

        Ok(buf.freeze())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Payload<K>, CodecError> {
        let mut reader = WireReader::new(bytes);
        let opcode = Opcode::try_from(reader.u8().map_err(|_| CodecError::Empty)?)
            .map_err(CodecError::UnknownOpcode)?;

        let payload = match opcode {
            Opcode::Save => {
                let key = self.read_key(&mut reader)?;
                let version = reader.i64()?;
                let last_accessed = reader.u64()?;
                let max_idle_ms = reader.u64()?;
                let ack_token = ack(reader.u64()?);
                let value = Bytes::copy_from_slice(reader.field()?);
                Payload::Save {
                    key,
                    version,
                    last_accessed,
                    max_idle_ms,
                    ack_token,
                    value,
                }
            }
            Opcode::Remove => {
                let key = self.read_key(&mut reader)?;
                Payload::Remove {
                    key,
                    version: reader.i64()?,
                    ack_token: ack(reader.u64()?),
                }
            }
            Opcode::Touch => {
                let key = self.read_key(&mut reader)?;
                Payload::Touch {
                    key,
                    version: reader.i64()?,
                    last_accessed: reader.u64()?,
                    max_idle_ms: reader.u64()?,
                    ack_token: ack(reader.u64()?),
                }
            }
            Opcode::LoadRequest => {
                let key = self.read_key(&mut reader)?;
                Payload::LoadRequest {
                    key,
                    token: reader.u64()?,
                    originating: reader.name()?,
                    directed: reader.u8()? != 0,
                }
            }
            Opcode::LoadResponse => {
                let key = self.read_key(&mut reader)?;
                let version = reader.i64()?;
                let token = reader.u64()?;
                let originating = reader.name()?;
                let responding = reader.name()?;
                let value = match reader.u8()? {
                    0 => None,
                    _ => Some(Bytes::copy_from_slice(reader.field()?)),
                };
                Payload::LoadResponse {
                    key,
                    version,
                    token,
                    originating,
                    responding,
                    value,
                }
            }
            Opcode::RemoveExpired => Payload::RemoveExpired,
            Opcode::SimpleAck => Payload::SimpleAck {
                token: reader.u64()?,
            },
            Opcode::Noop => Payload::Noop,
        };

        reader.finish()?;
        Ok(payload)
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>, CodecError> {
        match &self.key_transformer {
            Some(transformer) => Ok(transformer.to_bytes(key)),
            None => bincode::serialize(key).map_err(|e| CodecError::Key(e.to_string())),
        }
    }

    fn read_key(&self, reader: &mut WireReader<'_>) -> Result<K, CodecError> {
        let raw = reader.field()?;
        match &self.key_transformer {
            Some(transformer) => transformer.from_bytes(raw).map_err(CodecError::Key),
            None => bincode::deserialize(raw).map_err(|e| CodecError::Key(e.to_string())),
        }
    }
}

fn ack(token: u64) -> Option<u64> {
    (token != NO_ACK).then_some(token)
}

fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(field.len()).map_err(|_| CodecError::TooLarge(field.len()))?;
    buf.put_u32(len);
    buf.put_slice(field);
    Ok(())
}

/// Bounds-checked big-endian reader over a borrowed message.
struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn field(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn name(&mut self) -> Result<MemberName, CodecError> {
        let raw = self.field()?;
        Ok(MemberName::from(String::from_utf8(raw.to_vec())?))
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }
}
