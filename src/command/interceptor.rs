//! Interceptor Chain
//!
//! Interceptors sit between the command handler (head) and the transport
//! (tail). Outbound commands walk the chain head to tail, inbound commands walk
//! it tail to head. The chain is a plain slice fixed when the manager is built;
//! each call carries a `TransmitNext` / `ReceiveNext` cursor over the part of
//! the chain still ahead of it.
//!
//! An interceptor forwards by calling `next.proceed(..)`. Returning without
//! calling it swallows the command.

use dashmap::DashMap;
use std::sync::Arc;

use super::types::{Command, Opcode};
use crate::membership::types::MemberName;
use crate::storage::error::StoreResult;

pub type TransmitSink<'a, K> = dyn Fn(Command<K>) -> StoreResult<()> + 'a;
pub type ReceiveSink<'a, K> = dyn Fn(Command<K>, &MemberName) -> StoreResult<()> + 'a;

pub trait CommandInterceptor<K>: Send + Sync {
    fn name(&self) -> &str;

    fn on_transmit(&self, command: Command<K>, next: TransmitNext<'_, K>) -> StoreResult<()> {
        next.proceed(command)
    }

    fn on_receive(
        &self,
        command: Command<K>,
        initiator: &MemberName,
        next: ReceiveNext<'_, K>,
    ) -> StoreResult<()> {
        next.proceed(command, initiator)
    }
}

/// Remaining outbound path: interceptors not yet visited, then the transport.
pub struct TransmitNext<'a, K> {
    rest: &'a [Arc<dyn CommandInterceptor<K>>],
    sink: &'a TransmitSink<'a, K>,
}

impl<'a, K> TransmitNext<'a, K> {
    pub fn new(chain: &'a [Arc<dyn CommandInterceptor<K>>], sink: &'a TransmitSink<'a, K>) -> Self {
        Self { rest: chain, sink }
    }

    pub fn proceed(self, command: Command<K>) -> StoreResult<()> {
        match self.rest.split_first() {
            Some((interceptor, rest)) => interceptor.on_transmit(
                command,
                TransmitNext {
                    rest,
                    sink: self.sink,
                },
            ),
            None => (self.sink)(command),
        }
    }
}

/// Remaining inbound path: interceptors not yet visited, then the handler.
pub struct ReceiveNext<'a, K> {
    rest: &'a [Arc<dyn CommandInterceptor<K>>],
    sink: &'a ReceiveSink<'a, K>,
}

impl<'a, K> ReceiveNext<'a, K> {
    pub fn new(chain: &'a [Arc<dyn CommandInterceptor<K>>], sink: &'a ReceiveSink<'a, K>) -> Self {
        Self { rest: chain, sink }
    }

    pub fn proceed(self, command: Command<K>, initiator: &MemberName) -> StoreResult<()> {
        match self.rest.split_last() {
            Some((interceptor, rest)) => interceptor.on_receive(
                command,
                initiator,
                ReceiveNext {
                    rest,
                    sink: self.sink,
                },
            ),
            None => (self.sink)(command, initiator),
        }
    }
}

/// Counts commands per opcode in each direction.
#[derive(Default)]
pub struct StatsInterceptor {
    transmitted: DashMap<Opcode, u64>,
    received: DashMap<Opcode, u64>,
}

impl StatsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transmitted(&self, opcode: Opcode) -> u64 {
        self.transmitted.get(&opcode).map(|count| *count).unwrap_or(0)
    }

    pub fn received(&self, opcode: Opcode) -> u64 {
        self.received.get(&opcode).map(|count| *count).unwrap_or(0)
    }

    pub fn total_transmitted(&self) -> u64 {
        self.transmitted.iter().map(|count| *count.value()).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().map(|count| *count.value()).sum()
    }

    pub fn reset(&self) {
        self.transmitted.clear();
        self.received.clear();
    }
}

impl<K> CommandInterceptor<K> for StatsInterceptor {
    fn name(&self) -> &str {
        "stats"
    }

    fn on_transmit(&self, command: Command<K>, next: TransmitNext<'_, K>) -> StoreResult<()> {
        *self.transmitted.entry(command.opcode()).or_insert(0) += 1;
        next.proceed(command)
    }

    fn on_receive(
        &self,
        command: Command<K>,
        initiator: &MemberName,
        next: ReceiveNext<'_, K>,
    ) -> StoreResult<()> {
        *self.received.entry(command.opcode()).or_insert(0) += 1;
        next.proceed(command, initiator)
    }
}
