// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Kura Storage Abstraction
//!
//! [`StorageContainer`] provides an abstraction over [`Storage`]: the
//! transactional log and offset store behind a partitioned, append-only
//! log service. Topics, partitions, records, watermarks, producer epochs,
//! transactions and consumer group offsets are kept here, with fencing,
//! idempotence and transactional visibility enforced by the engine.
//!
//! ## Memory
//!
//! ```
//! # use kura_storage::{Error, StorageContainer};
//! # use url::Url;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let storage = StorageContainer::builder()
//!     .cluster_id("kura")
//!     .node_id(111)
//!     .advertised_listener(Url::parse("tcp://localhost:9092")?)
//!     .storage(Url::parse("memory://kura/")?)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::{
    InstrumentationScope, KeyValue, global,
    metrics::{Counter, Meter},
};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display, Formatter},
    io,
    marker::PhantomData,
    num::TryFromIntError,
    result,
    str::FromStr,
    sync::{Arc, LazyLock, PoisonError},
    time::{Duration, SystemTime, SystemTimeError},
};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

mod mem;

/// Storage Errors
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    DuplicateSequenceNumber {
        sequence: i32,
        expected: i32,
    },

    InvalidTxnTransition {
        transaction: String,
        state: Option<TxnState>,
        operation: &'static str,
    },

    Io(Arc<io::Error>),

    Message(String),

    OutOfOrderSequenceNumber {
        sequence: i32,
        expected: i32,
    },

    Poison,

    ProducerFenced {
        producer: i64,
        epoch: i16,
    },

    SerdeJson(Arc<serde_json::Error>),

    SystemTime(#[from] SystemTimeError),

    TopicAlreadyExists {
        topic: String,
    },

    TryFromInt(#[from] TryFromIntError),

    UnknownConsumerGroup(String),

    UnknownProducerId(i64),

    UnknownTopic(TopicId),

    UnknownTopicOrPartition(Topition),

    UnknownTransactionId(String),

    UnknownTxnState(String),

    UnstableOffsetCommit {
        group: String,
        topition: Topition,
    },

    UnsupportedStorageUrl(Url),

    Url(#[from] url::ParseError),

    Uuid(#[from] uuid::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(Arc::new(value))
    }
}

impl Error {
    /// Infrastructure failures are retry eligible, unlike the semantic
    /// errors (fencing, conflicts, invalid transitions) which are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Poison)
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Topic Partition (topition)
///
/// A topic partition pair, the unit of ordering and offset assignment.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Topition {
    topic: String,
    partition: i32,
}

impl Topition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        Self { topic, partition }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

/// Topic Id
///
/// An enumeration of either the name or UUID of a topic.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum TopicId {
    Name(String),
    Id(Uuid),
}

impl FromStr for TopicId {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        Ok(Self::Name(s.into()))
    }
}

impl From<&str> for TopicId {
    fn from(value: &str) -> Self {
        Self::Name(value.to_owned())
    }
}

impl From<String> for TopicId {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<Uuid> for TopicId {
    fn from(value: Uuid) -> Self {
        Self::Id(value)
    }
}

impl From<&Topition> for TopicId {
    fn from(value: &Topition) -> Self {
        value.topic.to_owned().into()
    }
}

/// Creatable Topic
///
/// The definition of a topic: partition count is fixed at creation.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct CreatableTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    pub is_internal: bool,
}

impl CreatableTopic {
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn num_partitions(self, num_partitions: i32) -> Self {
        Self {
            num_partitions,
            ..self
        }
    }

    pub fn replication_factor(self, replication_factor: i16) -> Self {
        Self {
            replication_factor,
            ..self
        }
    }

    pub fn is_internal(self, is_internal: bool) -> Self {
        Self {
            is_internal,
            ..self
        }
    }
}

/// Record Header
///
/// A key/value pair carried by a record, unique key per record.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Header {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Header {
    pub fn key(self, key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    pub fn value(self, value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
            ..self
        }
    }
}

/// Record
///
/// Producer id, epoch and sequence are present for idempotent producers
/// and are used for duplicate detection and epoch fencing.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Record {
    pub producer_id: Option<i64>,
    pub producer_epoch: Option<i16>,
    pub sequence: Option<i32>,
    pub timestamp: Option<SystemTime>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

impl Record {
    pub fn producer_id(self, producer_id: i64) -> Self {
        Self {
            producer_id: Some(producer_id),
            ..self
        }
    }

    pub fn producer_epoch(self, producer_epoch: i16) -> Self {
        Self {
            producer_epoch: Some(producer_epoch),
            ..self
        }
    }

    pub fn sequence(self, sequence: i32) -> Self {
        Self {
            sequence: Some(sequence),
            ..self
        }
    }

    pub fn timestamp(self, timestamp: SystemTime) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    pub fn key(self, key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }

    pub fn value(self, value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
            ..self
        }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.producer_id.is_some() && self.sequence.is_some()
    }
}

/// Isolation Level
///
/// A reader using [`IsolationLevel::ReadCommitted`] is bounded by the
/// last stable offset and never observes aborted transactional records.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum IsolationLevel {
    #[default]
    ReadUncommitted,
    ReadCommitted,
}

/// Offset Stage
///
/// An offset stage structure represents the `last_stable`, `high_watermark`
/// and `log_start` offsets, with `log_start <= last_stable <= high_watermark`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct OffsetStage {
    last_stable: i64,
    high_watermark: i64,
    log_start: i64,
}

impl OffsetStage {
    pub fn new(last_stable: i64, high_watermark: i64, log_start: i64) -> Self {
        Self {
            last_stable,
            high_watermark,
            log_start,
        }
    }

    pub fn last_stable(&self) -> i64 {
        self.last_stable
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark
    }

    pub fn log_start(&self) -> i64 {
        self.log_start
    }
}

/// Offset Commit Request
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct OffsetCommitRequest {
    pub offset: i64,
    pub leader_epoch: Option<i32>,
    pub timestamp: Option<SystemTime>,
    pub metadata: Option<String>,
}

impl OffsetCommitRequest {
    pub fn offset(self, offset: i64) -> Self {
        Self { offset, ..self }
    }

    pub fn leader_epoch(self, leader_epoch: i32) -> Self {
        Self {
            leader_epoch: Some(leader_epoch),
            ..self
        }
    }

    pub fn metadata(self, metadata: impl Into<String>) -> Self {
        Self {
            metadata: Some(metadata.into()),
            ..self
        }
    }
}

/// Transaction Offset Commit Request
///
/// Offsets buffered within a transaction, materialized into the consumer
/// offset store only on commit.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TxnOffsetCommitRequest {
    pub transaction_id: String,
    pub group_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub offsets: Vec<(Topition, OffsetCommitRequest)>,
}

/// Transaction State
///
/// The unset initial state is `Option::<TxnState>::None`: a transaction
/// detail exists for a producer epoch but no work has begun.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum TxnState {
    Begin,
    PrepareCommit,
    PrepareAbort,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_prepared(&self) -> bool {
        match self {
            Self::PrepareAbort | Self::PrepareCommit => true,
            _otherwise => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Committed | Self::Aborted => true,
            _otherwise => false,
        }
    }
}

impl FromStr for TxnState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABORTED" => Ok(TxnState::Aborted),
            "BEGIN" => Ok(TxnState::Begin),
            "COMMITTED" => Ok(TxnState::Committed),
            "PREPARE_ABORT" => Ok(TxnState::PrepareAbort),
            "PREPARE_COMMIT" => Ok(TxnState::PrepareCommit),
            otherwise => Err(Error::UnknownTxnState(otherwise.to_owned())),
        }
    }
}

impl From<TxnState> for String {
    fn from(value: TxnState) -> Self {
        match value {
            TxnState::Begin => "BEGIN".into(),
            TxnState::PrepareCommit => "PREPARE_COMMIT".into(),
            TxnState::PrepareAbort => "PREPARE_ABORT".into(),
            TxnState::Committed => "COMMITTED".into(),
            TxnState::Aborted => "ABORTED".into(),
        }
    }
}

/// Version representing an `e_tag` used in conditional updates of consumer
/// group detail.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Version {
    e_tag: Option<String>,
    version: Option<String>,
}

impl Version {
    pub fn e_tag(self, e_tag: impl Into<String>) -> Self {
        Self {
            e_tag: Some(e_tag.into()),
            ..self
        }
    }

    pub fn e_tag_str(&self) -> Option<&str> {
        self.e_tag.as_deref()
    }
}

/// Producer Id Response
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ProducerIdResponse {
    pub id: i64,
    pub epoch: i16,
}

impl Default for ProducerIdResponse {
    fn default() -> Self {
        Self { id: 1, epoch: 0 }
    }
}

/// Conditional Update Errors
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpdateError<T> {
    Error(#[from] Error),

    MissingEtag,

    Outdated { current: T, version: Version },

    SerdeJson(Arc<serde_json::Error>),

    Uuid(#[from] uuid::Error),
}

impl<T: Debug> Display for UpdateError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<T> From<serde_json::Error> for UpdateError<T> {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(Arc::new(value))
    }
}

/// Storage
///
/// The core storage abstraction. All storage engines implement this type.
#[async_trait]
pub trait Storage: Clone + Debug + Send + Sync + 'static {
    /// Create a topic on this storage. Creation is idempotent for an
    /// identical definition; a differing definition for an existing name
    /// is an error.
    async fn create_topic(&self, topic: CreatableTopic, validate_only: bool) -> Result<Uuid>;

    /// Delete a topic, its partitions, records and committed offsets.
    async fn delete_topic(&self, topic: &TopicId) -> Result<()>;

    /// Resolve a topic name and partition index into a topition.
    async fn resolve_topition(&self, topic: &str, partition: i32) -> Result<Topition>;

    /// Produce a record to this storage, returning the assigned offset.
    async fn produce(
        &self,
        transaction_id: Option<&str>,
        topition: &Topition,
        record: Record,
    ) -> Result<i64>;

    /// Fetch records from storage starting at an offset.
    async fn fetch(
        &self,
        topition: &Topition,
        offset: i64,
        max_records: u32,
        isolation: IsolationLevel,
    ) -> Result<Vec<(i64, Record)>>;

    /// Query the offset stage for a topic partition.
    async fn offset_stage(&self, topition: &Topition) -> Result<OffsetStage>;

    /// Advance the log start offset, never beyond the last stable offset,
    /// releasing records below it. Returns the new log start.
    async fn delete_records(&self, topition: &Topition, before_offset: i64) -> Result<i64>;

    /// Initialise a transactional or idempotent producer in this storage.
    /// An id and epoch of -1 allocates a fresh producer at epoch zero; an
    /// existing id bumps its epoch after fencing.
    async fn init_producer(
        &self,
        transaction_id: Option<&str>,
        transaction_timeout_ms: i32,
        producer_id: Option<i64>,
        producer_epoch: Option<i16>,
    ) -> Result<ProducerIdResponse>;

    /// Begin a transaction for a producer.
    async fn txn_begin(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        transaction_timeout_ms: i32,
    ) -> Result<()>;

    /// Enlist partitions in a transaction.
    async fn txn_add_partitions(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        partitions: &[Topition],
    ) -> Result<()>;

    /// Add offsets to a transaction for a producer.
    async fn txn_add_offsets(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
    ) -> Result<()>;

    /// Buffer consumer offsets within a transaction.
    async fn txn_offset_commit(&self, offsets: TxnOffsetCommitRequest) -> Result<()>;

    /// Commit or abort a running transaction.
    async fn txn_end(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        committed: bool,
    ) -> Result<()>;

    /// Conditionally update the detail of a group in this storage.
    async fn update_group(
        &self,
        group_id: &str,
        detail: Bytes,
        version: Option<Version>,
    ) -> Result<Version, UpdateError<Bytes>>;

    /// Commit offsets for one or more topic partitions in a consumer
    /// group, applied atomically.
    async fn offset_commit(
        &self,
        group_id: &str,
        retention_time_ms: Option<Duration>,
        offsets: &[(Topition, OffsetCommitRequest)],
    ) -> Result<()>;

    /// Fetch committed offsets for one or more topic partitions in a
    /// consumer group, -1 where nothing has been committed.
    async fn offset_fetch(
        &self,
        group_id: Option<&str>,
        topics: &[Topition],
        require_stable: Option<bool>,
    ) -> Result<BTreeMap<Topition, i64>>;

    /// Fetch all committed offsets in a consumer group.
    async fn committed_offset_topitions(&self, group_id: &str) -> Result<BTreeMap<Topition, i64>>;

    /// Run periodic maintenance on this storage.
    async fn maintain(&self) -> Result<()> {
        Ok(())
    }

    async fn cluster_id(&self) -> Result<String>;

    async fn node(&self) -> Result<i32>;

    async fn advertised_listener(&self) -> Result<Url>;
}

/// Storage Container
#[derive(Clone)]
pub enum StorageContainer {
    Memory(mem::Engine),
}

impl Debug for StorageContainer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(_) => f
                .debug_tuple(stringify!(StorageContainer::Memory))
                .finish(),
        }
    }
}

impl StorageContainer {
    pub fn builder() -> PhantomBuilder {
        PhantomBuilder::default()
    }
}

/// A [`StorageContainer`] builder
#[derive(Clone, Debug, Default)]
pub struct Builder<N, C, A, S> {
    node_id: N,
    cluster_id: C,
    advertised_listener: A,
    storage: S,
}

type PhantomBuilder =
    Builder<PhantomData<i32>, PhantomData<String>, PhantomData<Url>, PhantomData<Url>>;

impl<N, C, A, S> Builder<N, C, A, S> {
    pub fn node_id(self, node_id: i32) -> Builder<i32, C, A, S> {
        Builder {
            node_id,
            cluster_id: self.cluster_id,
            advertised_listener: self.advertised_listener,
            storage: self.storage,
        }
    }

    pub fn cluster_id(self, cluster_id: impl Into<String>) -> Builder<N, String, A, S> {
        Builder {
            node_id: self.node_id,
            cluster_id: cluster_id.into(),
            advertised_listener: self.advertised_listener,
            storage: self.storage,
        }
    }

    pub fn advertised_listener(self, advertised_listener: impl Into<Url>) -> Builder<N, C, Url, S> {
        Builder {
            node_id: self.node_id,
            cluster_id: self.cluster_id,
            advertised_listener: advertised_listener.into(),
            storage: self.storage,
        }
    }

    pub fn storage(self, storage: Url) -> Builder<N, C, A, Url> {
        debug!(%storage);

        Builder {
            node_id: self.node_id,
            cluster_id: self.cluster_id,
            advertised_listener: self.advertised_listener,
            storage,
        }
    }
}

impl Builder<i32, String, Url, Url> {
    pub async fn build(self) -> Result<StorageContainer> {
        match self.storage.scheme() {
            "memory" => Ok(StorageContainer::Memory(mem::Engine::new(
                self.cluster_id.as_str(),
                self.node_id,
                self.advertised_listener.clone(),
            ))),

            _unsupported => Err(Error::UnsupportedStorageUrl(self.storage.clone())),
        }
    }
}

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

static STORAGE_CONTAINER_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("kura_storage_container_requests")
        .with_description("kura storage container requests")
        .build()
});

static STORAGE_CONTAINER_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("kura_storage_container_errors")
        .with_description("kura storage container errors")
        .build()
});

#[async_trait]
impl Storage for StorageContainer {
    #[instrument(skip_all)]
    async fn create_topic(&self, topic: CreatableTopic, validate_only: bool) -> Result<Uuid> {
        let attributes = [KeyValue::new("method", "create_topic")];

        match self {
            Self::Memory(engine) => engine.create_topic(topic, validate_only),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn delete_topic(&self, topic: &TopicId) -> Result<()> {
        let attributes = [KeyValue::new("method", "delete_topic")];

        match self {
            Self::Memory(engine) => engine.delete_topic(topic),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn resolve_topition(&self, topic: &str, partition: i32) -> Result<Topition> {
        let attributes = [KeyValue::new("method", "resolve_topition")];

        match self {
            Self::Memory(engine) => engine.resolve_topition(topic, partition),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn produce(
        &self,
        transaction_id: Option<&str>,
        topition: &Topition,
        record: Record,
    ) -> Result<i64> {
        let attributes = [KeyValue::new("method", "produce")];

        match self {
            Self::Memory(engine) => engine.produce(transaction_id, topition, record),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn fetch(
        &self,
        topition: &Topition,
        offset: i64,
        max_records: u32,
        isolation: IsolationLevel,
    ) -> Result<Vec<(i64, Record)>> {
        let attributes = [KeyValue::new("method", "fetch")];

        match self {
            Self::Memory(engine) => engine.fetch(topition, offset, max_records, isolation),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn offset_stage(&self, topition: &Topition) -> Result<OffsetStage> {
        let attributes = [KeyValue::new("method", "offset_stage")];

        match self {
            Self::Memory(engine) => engine.offset_stage(topition),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn delete_records(&self, topition: &Topition, before_offset: i64) -> Result<i64> {
        let attributes = [KeyValue::new("method", "delete_records")];

        match self {
            Self::Memory(engine) => engine.delete_records(topition, before_offset),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn init_producer(
        &self,
        transaction_id: Option<&str>,
        transaction_timeout_ms: i32,
        producer_id: Option<i64>,
        producer_epoch: Option<i16>,
    ) -> Result<ProducerIdResponse> {
        let attributes = [KeyValue::new("method", "init_producer")];

        match self {
            Self::Memory(engine) => engine.init_producer(
                transaction_id,
                transaction_timeout_ms,
                producer_id,
                producer_epoch,
            ),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn txn_begin(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        transaction_timeout_ms: i32,
    ) -> Result<()> {
        let attributes = [KeyValue::new("method", "txn_begin")];

        match self {
            Self::Memory(engine) => engine.txn_begin(
                transaction_id,
                producer_id,
                producer_epoch,
                transaction_timeout_ms,
            ),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn txn_add_partitions(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        partitions: &[Topition],
    ) -> Result<()> {
        let attributes = [KeyValue::new("method", "txn_add_partitions")];

        match self {
            Self::Memory(engine) => {
                engine.txn_add_partitions(transaction_id, producer_id, producer_epoch, partitions)
            }
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn txn_add_offsets(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
    ) -> Result<()> {
        let attributes = [KeyValue::new("method", "txn_add_offsets")];

        match self {
            Self::Memory(engine) => {
                engine.txn_add_offsets(transaction_id, producer_id, producer_epoch, group_id)
            }
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn txn_offset_commit(&self, offsets: TxnOffsetCommitRequest) -> Result<()> {
        let attributes = [KeyValue::new("method", "txn_offset_commit")];

        match self {
            Self::Memory(engine) => engine.txn_offset_commit(offsets),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn txn_end(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        committed: bool,
    ) -> Result<()> {
        let attributes = [KeyValue::new("method", "txn_end")];

        match self {
            Self::Memory(engine) => {
                engine.txn_end(transaction_id, producer_id, producer_epoch, committed)
            }
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn update_group(
        &self,
        group_id: &str,
        detail: Bytes,
        version: Option<Version>,
    ) -> Result<Version, UpdateError<Bytes>> {
        let attributes = [KeyValue::new("method", "update_group")];

        match self {
            Self::Memory(engine) => engine.update_group(group_id, detail, version),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn offset_commit(
        &self,
        group_id: &str,
        retention_time_ms: Option<Duration>,
        offsets: &[(Topition, OffsetCommitRequest)],
    ) -> Result<()> {
        let attributes = [KeyValue::new("method", "offset_commit")];

        match self {
            Self::Memory(engine) => engine.offset_commit(group_id, retention_time_ms, offsets),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn offset_fetch(
        &self,
        group_id: Option<&str>,
        topics: &[Topition],
        require_stable: Option<bool>,
    ) -> Result<BTreeMap<Topition, i64>> {
        let attributes = [KeyValue::new("method", "offset_fetch")];

        match self {
            Self::Memory(engine) => engine.offset_fetch(group_id, topics, require_stable),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn committed_offset_topitions(&self, group_id: &str) -> Result<BTreeMap<Topition, i64>> {
        let attributes = [KeyValue::new("method", "committed_offset_topitions")];

        match self {
            Self::Memory(engine) => engine.committed_offset_topitions(group_id),
        }
        .await
        .inspect(|_| {
            STORAGE_CONTAINER_REQUESTS.add(1, &attributes);
        })
        .inspect_err(|_| {
            STORAGE_CONTAINER_ERRORS.add(1, &attributes);
        })
    }

    #[instrument(skip_all)]
    async fn maintain(&self) -> Result<()> {
        match self {
            Self::Memory(engine) => engine.maintain(),
        }
        .await
    }

    async fn cluster_id(&self) -> Result<String> {
        match self {
            Self::Memory(engine) => engine.cluster_id(),
        }
        .await
    }

    async fn node(&self) -> Result<i32> {
        match self {
            Self::Memory(engine) => engine.node(),
        }
        .await
    }

    async fn advertised_listener(&self) -> Result<Url> {
        match self {
            Self::Memory(engine) => engine.advertised_listener(),
        }
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_state_round_trip() -> Result<()> {
        for state in [
            TxnState::Begin,
            TxnState::PrepareCommit,
            TxnState::PrepareAbort,
            TxnState::Committed,
            TxnState::Aborted,
        ] {
            assert_eq!(state, TxnState::from_str(String::from(state).as_str())?);
        }

        Ok(())
    }

    #[test]
    fn txn_state_prepared() {
        assert!(TxnState::PrepareCommit.is_prepared());
        assert!(TxnState::PrepareAbort.is_prepared());
        assert!(!TxnState::Begin.is_prepared());
        assert!(!TxnState::Committed.is_prepared());
    }

    #[tokio::test]
    async fn unsupported_storage_url() -> Result<()> {
        let outcome = StorageContainer::builder()
            .cluster_id("kura")
            .node_id(111)
            .advertised_listener(Url::parse("tcp://localhost:9092")?)
            .storage(Url::parse("wal://kura/")?)
            .build()
            .await;

        assert!(matches!(outcome, Err(Error::UnsupportedStorageUrl(_))));

        Ok(())
    }
}
