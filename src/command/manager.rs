use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::codec::{CommandCodec, peek_opcode};
use super::interceptor::{CommandInterceptor, ReceiveNext, TransmitNext};
use super::mediator::ResponseMediator;
use super::types::{Command, CommandResponse, Payload};
use crate::membership::service::{GroupMessageReceiver, GroupService};
use crate::membership::types::MemberName;
use crate::storage::entry::{ApplyOutcome, PendingUpdate, VERSION_SENTINEL, now_ms};
use crate::storage::error::{DataStoreError, StoreResult};
use crate::storage::table::EntryTable;
use crate::storage::{StoreKey, StoreValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManagerStats {
    pub transmitted: u64,
    pub received: u64,
    pub looped_back: u64,
    pub failed: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    transmitted: AtomicU64,
    received: AtomicU64,
    looped_back: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Routes commands between the local store and the group service.
///
/// Outbound: interceptors head to tail, then encode and send. A command
/// addressed to the local member skips the wire and is handled directly.
/// Inbound: decode, interceptors tail to head, then apply against the table.
pub struct CommandManager<K, V> {
    store_name: String,
    self_name: MemberName,
    group: Arc<dyn GroupService>,
    table: Arc<EntryTable<K, V>>,
    mediator: Arc<ResponseMediator>,
    codec: CommandCodec<K>,
    interceptors: Vec<Arc<dyn CommandInterceptor<K>>>,
    counters: Counters,
}

impl<K: StoreKey, V: StoreValue> CommandManager<K, V> {
    pub fn new(
        store_name: String,
        group: Arc<dyn GroupService>,
        table: Arc<EntryTable<K, V>>,
        mediator: Arc<ResponseMediator>,
        codec: CommandCodec<K>,
        interceptors: Vec<Arc<dyn CommandInterceptor<K>>>,
    ) -> Self {
        let self_name = group.member_name();
        Self {
            store_name,
            self_name,
            group,
            table,
            mediator,
            codec,
            interceptors,
            counters: Counters::default(),
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn self_name(&self) -> &MemberName {
        &self.self_name
    }

    pub fn mediator(&self) -> &Arc<ResponseMediator> {
        &self.mediator
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|interceptor| interceptor.name().to_string())
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            transmitted: self.counters.transmitted.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            looped_back: self.counters.looped_back.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Sends a command on its way. Failures are logged and counted here and
    /// returned to the caller; the manager never retries.
    pub fn execute(&self, command: Command<K>) -> StoreResult<()> {
        if command.destination.member() == Some(&self.self_name) {
            self.counters.looped_back.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Looping back {} on {}", command.opcode(), self.self_name);
            return self.receive(command, &self.self_name);
        }

        let opcode = command.opcode();
        let destination = command.destination.clone();
        let sink = |command: Command<K>| self.transmit(command);
        let result = TransmitNext::new(&self.interceptors, &sink).proceed(command);

        if let Err(e) = &result {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Failed to transmit {} from {} to {}: {}",
                opcode,
                self.self_name,
                destination,
                e
            );
        }
        result
    }

    fn transmit(&self, command: Command<K>) -> StoreResult<()> {
        command.validate_for_transmit()?;
        let bytes = self.codec.encode(&command.payload)?;
        let target = command.destination.member();

        if !self.group.send_message(target, &self.store_name, bytes) {
            return Err(DataStoreError::transmit(target));
        }
        self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&self, command: Command<K>, initiator: &MemberName) -> StoreResult<()> {
        let sink = |command: Command<K>, initiator: &MemberName| self.dispatch(command, initiator);
        ReceiveNext::new(&self.interceptors, &sink).proceed(command, initiator)
    }

    fn dispatch(&self, command: Command<K>, initiator: &MemberName) -> StoreResult<()> {
        match command.payload {
            Payload::Save {
                key,
                version,
                last_accessed,
                max_idle_ms,
                ack_token,
                value,
            } => {
                let update = PendingUpdate::Save {
                    value,
                    last_accessed,
                    max_idle_ms,
                };
                let outcome = self.table.apply_update(&key, version, update, initiator);
                self.log_outcome("SAVE", &key, version, outcome);
                if outcome == ApplyOutcome::Stale {
                    return Ok(());
                }
                self.acknowledge(ack_token, initiator)
            }
            Payload::Touch {
                key,
                version,
                last_accessed,
                max_idle_ms,
                ack_token,
            } => {
                let update = PendingUpdate::Touch {
                    last_accessed,
                    max_idle_ms,
                };
                let outcome = self.table.apply_update(&key, version, update, initiator);
                self.log_outcome("TOUCH", &key, version, outcome);
                if outcome == ApplyOutcome::Stale {
                    return Ok(());
                }
                self.acknowledge(ack_token, initiator)
            }
            Payload::Remove {
                key,
                version,
                ack_token,
            } => {
                self.table.apply_remove(&key, version, now_ms());
                tracing::debug!("Removed {:?} at version {} for {}", key, version, initiator);
                self.acknowledge(ack_token, initiator)
            }
            Payload::LoadRequest {
                key,
                token,
                originating,
                directed,
            } => {
                let state = self.table.load_state(&key)?;
                if state.is_none() && !directed {
                    tracing::trace!("No entry for {:?}, ignoring broadcast load", key);
                    return Ok(());
                }
                let (version, value) = match state {
                    Some((version, value)) => (version, Some(value)),
                    None => (VERSION_SENTINEL, None),
                };
                tracing::debug!(
                    "Answering load of {:?} from {} ({})",
                    key,
                    originating,
                    if value.is_some() { "hit" } else { "miss" }
                );
                self.execute(Command::to_member(
                    initiator.clone(),
                    Payload::LoadResponse {
                        key,
                        version,
                        token,
                        originating,
                        responding: self.self_name.clone(),
                        value,
                    },
                ))
            }
            Payload::LoadResponse {
                version,
                token,
                responding,
                value,
                ..
            } => {
                let response = CommandResponse::Loaded {
                    version,
                    value,
                    responder: responding,
                };
                if !self.mediator.set_result(token, response) {
                    tracing::debug!("Late load response {} from {}", token, initiator);
                }
                Ok(())
            }
            Payload::SimpleAck { token } => {
                let response = CommandResponse::Acknowledged {
                    responder: initiator.clone(),
                };
                if !self.mediator.set_result(token, response) {
                    tracing::debug!("Late acknowledgement {} from {}", token, initiator);
                }
                Ok(())
            }
            Payload::RemoveExpired => {
                let removed = self.table.remove_expired(now_ms());
                tracing::debug!(
                    "Removed {} expired entries on request from {}",
                    removed,
                    initiator
                );
                Ok(())
            }
            Payload::Noop => {
                tracing::trace!("NOOP from {}", initiator);
                Ok(())
            }
        }
    }

    fn acknowledge(&self, ack_token: Option<u64>, initiator: &MemberName) -> StoreResult<()> {
        match ack_token {
            Some(token) => self.execute(Command::to_member(
                initiator.clone(),
                Payload::SimpleAck { token },
            )),
            None => Ok(()),
        }
    }

    fn log_outcome(&self, op: &str, key: &K, version: i64, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied { drained } => tracing::trace!(
                "{} {:?} applied at version {} (+{} drained)",
                op,
                key,
                version,
                drained
            ),
            ApplyOutcome::Queued => {
                tracing::debug!("{} {:?} version {} queued behind a gap", op, key, version)
            }
            ApplyOutcome::Stale => {
                tracing::debug!("{} {:?} version {} is stale, dropped", op, key, version)
            }
        }
    }
}

impl<K: StoreKey, V: StoreValue> GroupMessageReceiver for CommandManager<K, V> {
    fn handle_message(&self, source: &MemberName, token: &str, payload: Bytes) {
        if token != self.store_name {
            tracing::trace!("Ignoring message for token '{}' on '{}'", token, self.store_name);
            return;
        }

        let decoded = match self.codec.decode(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                match peek_opcode(&payload) {
                    Some(opcode) => {
                        tracing::warn!("Discarding malformed {} from {}: {}", opcode, source, e)
                    }
                    None => tracing::warn!("Discarding undecodable message from {}: {}", source, e),
                }
                return;
            }
        };

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let opcode = decoded.opcode();
        let command = Command::to_member(self.self_name.clone(), decoded);
        if let Err(e) = self.receive(command, source) {
            tracing::warn!("Failed to handle {} from {}: {}", opcode, source, e);
        }
    }
}
