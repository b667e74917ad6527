use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::config::StoreConfig;
use super::entry::now_ms;
use super::error::{DataStoreError, StoreResult};
use super::key_mapper::{KeyMapper, ReplicaChoices, hash_key};
use super::table::{EntrySnapshot, EntryTable, LocalRead};
use super::{StoreKey, StoreValue};
use crate::command::codec::{CommandCodec, KeyTransformer};
use crate::command::interceptor::CommandInterceptor;
use crate::command::manager::CommandManager;
use crate::command::mediator::ResponseMediator;
use crate::command::types::{Command, CommandResponse, Payload};
use crate::membership::service::{GroupService, GroupServiceRegistry};
use crate::membership::types::MemberName;

/// Extracts the hash used for key placement.
pub type HashableKeyFn<K> = Arc<dyn Fn(&K) -> u64 + Send + Sync>;

/// How far a write got beyond the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// No peer to replicate to.
    LocalOnly,
    /// Handed to the transport; no acknowledgement requested.
    Sent,
    Acknowledged,
    /// Transport refused the command, or no acknowledgement arrived in time.
    Unacknowledged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub version: i64,
    pub replication: ReplicationStatus,
    /// Candidates that hold (or will hold) the replica. Hand these back to
    /// `get_with_mapping_info` to find the data after a failover.
    pub replica_choices: ReplicaChoices,
}

pub struct StoreBuilder<K, V> {
    config: StoreConfig,
    key_transformer: Option<Arc<dyn KeyTransformer<K>>>,
    hashable_key: Option<HashableKeyFn<K>>,
    interceptors: Vec<Arc<dyn CommandInterceptor<K>>>,
    _value: PhantomData<fn() -> V>,
}

impl<K: StoreKey, V: StoreValue> StoreBuilder<K, V> {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            key_transformer: None,
            hashable_key: None,
            interceptors: Vec::new(),
            _value: PhantomData,
        }
    }

    pub fn key_transformer(mut self, transformer: Arc<dyn KeyTransformer<K>>) -> Self {
        self.key_transformer = Some(transformer);
        self
    }

    pub fn hashable_key(mut self, hasher: impl Fn(&K) -> u64 + Send + Sync + 'static) -> Self {
        self.hashable_key = Some(Arc::new(hasher));
        self
    }

    /// Appends an interceptor. The first one added sits closest to the handler.
    pub fn interceptor(mut self, interceptor: Arc<dyn CommandInterceptor<K>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self, registry: &GroupServiceRegistry) -> StoreResult<ReplicatedDataStore<K, V>> {
        self.config.validate()?;

        let group = registry.lookup(&self.config.group_name).ok_or_else(|| {
            DataStoreError::Configuration(format!(
                "no group service registered for group '{}'",
                self.config.group_name
            ))
        })?;

        let self_name = group.member_name();
        if self_name.is_empty() {
            return Err(DataStoreError::Configuration(
                "group service reports an empty member name".to_string(),
            ));
        }

        let table = Arc::new(EntryTable::new(self.config.max_pending_updates));
        let key_mapper = Arc::new(KeyMapper::new(
            self_name.clone(),
            self.config.replica_window,
        ));
        let members = group.current_core_members();
        key_mapper.on_view_change(&self_name, &members, &members, true);

        let codec = match self.key_transformer {
            Some(transformer) => CommandCodec::with_key_transformer(transformer),
            None => CommandCodec::new(),
        };
        let mediator = Arc::new(ResponseMediator::new());
        let manager = Arc::new(CommandManager::new(
            self.config.store_name.clone(),
            group.clone(),
            table.clone(),
            mediator.clone(),
            codec,
            self.interceptors,
        ));

        group.register_member_event_listener(&self.config.store_name, key_mapper.clone());
        group.register_message_receiver(&self.config.store_name, manager.clone());

        tracing::info!(
            "Store '{}' started on {} in group '{}' ({} replication, {} peer(s))",
            self.config.store_name,
            self_name,
            self.config.group_name,
            if self.config.synchronous_replication {
                "synchronous"
            } else {
                "asynchronous"
            },
            key_mapper.members().len()
        );

        Ok(ReplicatedDataStore {
            config: self.config,
            self_name,
            group,
            table,
            key_mapper,
            mediator,
            manager,
            hashable_key: self
                .hashable_key
                .unwrap_or_else(|| Arc::new(|key: &K| hash_key(key))),
            closed: AtomicBool::new(false),
        })
    }
}

/// A member's handle on one replicated store.
///
/// The local table is authoritative for every key this member writes. Each
/// write is also shipped to the key's mapped peer; reads that miss locally ask
/// the members most likely to hold a replica.
pub struct ReplicatedDataStore<K, V> {
    config: StoreConfig,
    self_name: MemberName,
    group: Arc<dyn GroupService>,
    table: Arc<EntryTable<K, V>>,
    key_mapper: Arc<KeyMapper>,
    mediator: Arc<ResponseMediator>,
    manager: Arc<CommandManager<K, V>>,
    hashable_key: HashableKeyFn<K>,
    closed: AtomicBool,
}

impl<K: StoreKey, V: StoreValue> ReplicatedDataStore<K, V> {
    pub fn builder(config: StoreConfig) -> StoreBuilder<K, V> {
        StoreBuilder::new(config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn member_name(&self) -> &MemberName {
        &self.self_name
    }

    pub fn key_mapper(&self) -> &KeyMapper {
        &self.key_mapper
    }

    pub fn manager(&self) -> &CommandManager<K, V> {
        &self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(DataStoreError::Closed(self.config.store_name.clone()));
        }
        Ok(())
    }

    fn hash(&self, key: &K) -> u64 {
        (self.hashable_key)(key)
    }

    /// The peer `key` replicates to under the current view.
    pub fn mapped_instance(&self, key: &K) -> Option<MemberName> {
        self.key_mapper.get_mapped_instance(self.hash(key))
    }

    pub fn replica_choices(&self, key: &K) -> ReplicaChoices {
        self.key_mapper.get_replica_choices(self.hash(key))
    }

    /// Stores `value` locally under the next version and replicates it.
    pub async fn put(&self, key: K, value: V) -> StoreResult<SaveReceipt> {
        self.ensure_open()?;

        let bytes = Bytes::from(bincode::serialize(&value)?);
        let now = now_ms();
        let max_idle_ms = self.config.default_max_idle_ms;
        let version = self.table.save_local(&key, value, now, max_idle_ms);

        let hash = self.hash(&key);
        let target = self.key_mapper.get_mapped_instance(hash);
        let replica_choices = self.key_mapper.get_replica_choices(hash);
        tracing::debug!(
            "PUT {:?} v{} on {}, replica {:?}",
            key,
            version,
            self.self_name,
            target
        );

        let replication = self
            .replicate(target, |ack_token| Payload::Save {
                key,
                version,
                last_accessed: now,
                max_idle_ms,
                ack_token,
                value: bytes,
            })
            .await?;

        Ok(SaveReceipt {
            version,
            replication,
            replica_choices,
        })
    }

    pub async fn get(&self, key: &K) -> StoreResult<Option<V>> {
        self.get_with_mapping_info(key, None).await
    }

    /// Reads `key`, falling back to remote members when there is no local
    /// copy. A value found remotely is adopted locally.
    ///
    /// `mapping_info` is the `replica_choices` of an earlier `SaveReceipt`;
    /// without it, the replica is located from the previous view.
    pub async fn get_with_mapping_info(
        &self,
        key: &K,
        mapping_info: Option<&ReplicaChoices>,
    ) -> StoreResult<Option<V>> {
        self.ensure_open()?;

        match self.table.read_local(key, now_ms())? {
            LocalRead::Found(value) => return Ok(Some(value)),
            LocalRead::Removed => return Ok(None),
            LocalRead::Missing => {}
        }

        if !self.key_mapper.has_peers() {
            return Ok(None);
        }

        let candidates = self
            .key_mapper
            .find_replica_instance(self.hash(key), mapping_info);
        if candidates.is_empty() {
            tracing::debug!("GET {:?}: no replica candidate, broadcasting load", key);
            return self.load_from(key, None).await;
        }

        for candidate in candidates {
            if let Some(value) = self.load_from(key, Some(candidate)).await? {
                return Ok(Some(value));
            }
        }

        tracing::debug!("GET {:?}: not found on any replica", key);
        Ok(None)
    }

    async fn load_from(&self, key: &K, target: Option<MemberName>) -> StoreResult<Option<V>> {
        let timeout = self.config.load_timeout();
        let handle = self.mediator.register_pending_response(timeout);
        let payload = Payload::LoadRequest {
            key: key.clone(),
            token: handle.token(),
            originating: self.self_name.clone(),
            directed: target.is_some(),
        };
        let command = match target {
            Some(member) => Command::to_member(member, payload),
            None => Command::broadcast(payload),
        };

        match self.manager.execute(command) {
            Ok(()) => {}
            Err(DataStoreError::Transmit { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }

        match self.mediator.await_response(handle, timeout).await {
            Some(CommandResponse::Loaded {
                version,
                value: Some(bytes),
                responder,
            }) => {
                let value: V = bincode::deserialize(&bytes)?;
                let adopted = self.table.adopt(
                    key,
                    value.clone(),
                    version,
                    responder.clone(),
                    now_ms(),
                    self.config.default_max_idle_ms,
                );
                tracing::debug!(
                    "GET {:?}: loaded v{} from {} (adopted: {})",
                    key,
                    version,
                    responder,
                    adopted
                );
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Tombstones `key` locally and replicates the removal.
    pub async fn remove(&self, key: &K) -> StoreResult<ReplicationStatus> {
        self.ensure_open()?;

        let version = self.table.remove_local(key, now_ms());
        let target = self.mapped_instance(key);
        tracing::debug!("REMOVE {:?} v{} on {}", key, version, self.self_name);

        self.replicate(target, |ack_token| Payload::Remove {
            key: key.clone(),
            version,
            ack_token,
        })
        .await
    }

    /// Refreshes liveness metadata without changing the value. `None` when
    /// there is no live local entry for `key`.
    pub async fn touch(
        &self,
        key: &K,
        last_accessed: u64,
        max_idle: Duration,
    ) -> StoreResult<Option<SaveReceipt>> {
        self.ensure_open()?;

        let max_idle_ms = max_idle.as_millis() as u64;
        let Some(version) = self.table.touch_local(key, last_accessed, max_idle_ms) else {
            return Ok(None);
        };

        let hash = self.hash(key);
        let target = self.key_mapper.get_mapped_instance(hash);
        let replica_choices = self.key_mapper.get_replica_choices(hash);

        let replication = self
            .replicate(target, |ack_token| Payload::Touch {
                key: key.clone(),
                version,
                last_accessed,
                max_idle_ms,
                ack_token,
            })
            .await?;

        Ok(Some(SaveReceipt {
            version,
            replication,
            replica_choices,
        }))
    }

    async fn replicate(
        &self,
        target: Option<MemberName>,
        build: impl FnOnce(Option<u64>) -> Payload<K>,
    ) -> StoreResult<ReplicationStatus> {
        let Some(target) = target else {
            tracing::trace!("No peer to replicate to from {}", self.self_name);
            return Ok(ReplicationStatus::LocalOnly);
        };

        if !self.config.synchronous_replication {
            return match self.manager.execute(Command::to_member(target, build(None))) {
                Ok(()) => Ok(ReplicationStatus::Sent),
                Err(DataStoreError::Transmit { .. }) => Ok(ReplicationStatus::Unacknowledged),
                Err(e) => Err(e),
            };
        }

        let timeout = self.config.replication_timeout();
        let handle = self.mediator.register_pending_response(timeout);
        let command = Command::to_member(target.clone(), build(Some(handle.token())));

        match self.manager.execute(command) {
            Ok(()) => {}
            Err(DataStoreError::Transmit { .. }) => return Ok(ReplicationStatus::Unacknowledged),
            Err(e) => return Err(e),
        }

        match self.mediator.await_response(handle, timeout).await {
            Some(_) => Ok(ReplicationStatus::Acknowledged),
            None => {
                tracing::warn!(
                    "No acknowledgement from {} within {:?}",
                    target,
                    timeout
                );
                Ok(ReplicationStatus::Unacknowledged)
            }
        }
    }

    /// Evicts local entries unaccessed for longer than `idle_for`.
    pub fn remove_idle_entries(&self, idle_for: Duration) -> usize {
        let removed = self
            .table
            .remove_idle(now_ms(), idle_for.as_millis() as u64);
        if removed > 0 {
            tracing::info!(
                "Removed {} idle entries from '{}' on {}",
                removed,
                self.config.store_name,
                self.self_name
            );
        }
        removed
    }

    /// Evicts local entries past their own max idle time and asks every peer
    /// to do the same. Returns the local count.
    pub fn remove_expired(&self) -> StoreResult<usize> {
        self.ensure_open()?;

        let removed = self.table.remove_expired(now_ms());
        self.mediator.expire_overdue(Instant::now());

        if self.key_mapper.has_peers() {
            match self.manager.execute(Command::broadcast(Payload::RemoveExpired)) {
                Ok(()) => tracing::trace!("Asked peers of {} to remove expired entries", self.self_name),
                Err(e) => tracing::debug!(
                    "Peers of {} not asked to remove expired entries: {}",
                    self.self_name,
                    e
                ),
            }
        }

        tracing::debug!("Removed {} expired entries on {}", removed, self.self_name);
        Ok(removed)
    }

    /// Live entries in the local table.
    pub fn size(&self) -> usize {
        self.table.live_count()
    }

    /// Reads the local copy only, without refreshing its access time.
    pub fn get_local(&self, key: &K) -> StoreResult<Option<V>> {
        self.table.peek(key)
    }

    pub fn entry_snapshot(&self, key: &K) -> Option<EntrySnapshot> {
        self.table.snapshot(key)
    }

    /// Detaches from the group service and drops every entry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.group
            .unregister_message_receiver(&self.config.store_name);
        self.group
            .unregister_member_event_listener(&self.config.store_name);
        self.mediator.cancel_all();
        self.table.clear();

        tracing::info!(
            "Store '{}' closed on {}",
            self.config.store_name,
            self.self_name
        );
    }
}

impl<K, V> Drop for ReplicatedDataStore<K, V> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.group
                .unregister_message_receiver(&self.config.store_name);
            self.group
                .unregister_member_event_listener(&self.config.store_name);
        }
    }
}
