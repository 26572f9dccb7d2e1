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
//! In memory storage engine.
//!
//! Cluster metadata (topics, producers, transactions, groups and committed
//! offsets) is kept under one mutex, each partition log under its own,
//! reached through a registry. Lock order is always metadata first, then
//! log, so that epoch fencing and transactional offset capture are atomic
//! with the append they guard.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    mem::take,
    sync::{Arc, LazyLock, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::{KeyValue, metrics::Counter};
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use crate::{
    CreatableTopic, Error, IsolationLevel, METER, OffsetCommitRequest, OffsetStage,
    ProducerIdResponse, Record, Result, Storage, TopicId, Topition, TxnOffsetCommitRequest,
    TxnState, UpdateError, Version,
};

static REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("kura_storage_memory_requests")
        .with_description("kura memory storage engine requests")
        .build()
});

static ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("kura_storage_memory_errors")
        .with_description("kura memory storage engine errors")
        .build()
});

#[derive(Clone, Debug, Default)]
struct Meta {
    topics: BTreeMap<String, TopicMetadata>,
    producers: BTreeMap<i64, ProducerDetail>,
    transactions: BTreeMap<String, Txn>,
    groups: BTreeMap<String, Group>,
    consumer_offsets: BTreeMap<String, BTreeMap<Topition, CommittedOffset>>,
}

#[derive(Clone, Debug, Default)]
struct TopicMetadata {
    id: Uuid,
    topic: CreatableTopic,
}

/// The epoch ladder doubles as the fencing authority: the last key is the
/// only epoch accepted for new work.
#[derive(Clone, Debug, Default, PartialEq)]
struct ProducerDetail {
    sequences: BTreeMap<i16, BTreeMap<Topition, i32>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Txn {
    producer: i64,
    epochs: BTreeMap<i16, TxnDetail>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct TxnDetail {
    transaction_timeout_ms: i32,
    started_at: Option<SystemTime>,
    state: Option<TxnState>,
    produces: BTreeMap<Topition, Option<TxnProduceOffset>>,
    offsets: BTreeMap<String, BTreeMap<Topition, TxnCommitOffset>>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct TxnProduceOffset {
    offset_start: i64,
    offset_end: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct TxnCommitOffset {
    committed_offset: i64,
    leader_epoch: Option<i32>,
    metadata: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
struct Group {
    e_tag: Uuid,
    detail: Bytes,
}

#[derive(Clone, Debug, Default)]
struct CommittedOffset {
    offset: i64,
    leader_epoch: Option<i32>,
    timestamp: Option<SystemTime>,
    metadata: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct Log {
    low: i64,
    high: i64,
    records: BTreeMap<i64, Record>,
    aborted: Vec<TxnProduceOffset>,
}

/// In Memory Engine
#[derive(Clone, Debug)]
pub struct Engine {
    cluster: String,
    node: i32,
    advertised_listener: Url,
    meta: Arc<Mutex<Meta>>,
    logs: Arc<Mutex<BTreeMap<Topition, Arc<Mutex<Log>>>>>,
}

impl Engine {
    pub fn new(cluster: &str, node: i32, advertised_listener: Url) -> Self {
        Self {
            cluster: cluster.into(),
            node,
            advertised_listener,
            meta: Arc::new(Mutex::new(Meta::default())),
            logs: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn log(&self, topition: &Topition) -> Result<Arc<Mutex<Log>>> {
        self.logs
            .lock()
            .map_err(Into::into)
            .and_then(|registry| {
                registry
                    .get(topition)
                    .cloned()
                    .ok_or(Error::UnknownTopicOrPartition(topition.to_owned()))
            })
    }

    /// The minimum start offset over produce ranges of open transactions
    /// for this topition, the high watermark when none is open.
    fn last_stable(meta: &Meta, topition: &Topition, high: i64) -> i64 {
        meta.transactions
            .values()
            .flat_map(|txn| txn.epochs.values())
            .filter(|detail| detail.state.is_some_and(|state| !state.is_terminal()))
            .filter_map(|detail| detail.produces.get(topition).copied().flatten())
            .map(|range| range.offset_start)
            .min()
            .unwrap_or(high)
    }

    fn topition_known(meta: &Meta, topition: &Topition) -> Result<()> {
        meta.topics
            .get(topition.topic())
            .filter(|metadata| {
                topition.partition() >= 0 && topition.partition() < metadata.topic.num_partitions
            })
            .map(|_| ())
            .ok_or(Error::UnknownTopicOrPartition(topition.to_owned()))
    }

    fn txn_detail<'m>(
        meta: &'m mut Meta,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
    ) -> Result<&'m mut TxnDetail> {
        let Some(txn) = meta.transactions.get_mut(transaction_id) else {
            return Err(Error::UnknownTransactionId(transaction_id.to_owned()));
        };

        if txn.producer != producer_id {
            return Err(Error::UnknownProducerId(producer_id));
        }

        let Some(current) = txn.epochs.last_entry() else {
            return Err(Error::ProducerFenced {
                producer: producer_id,
                epoch: producer_epoch,
            });
        };

        if current.key() != &producer_epoch {
            return Err(Error::ProducerFenced {
                producer: producer_id,
                epoch: producer_epoch,
            });
        }

        Ok(current.into_mut())
    }

    fn begun<'m>(
        detail: &'m mut TxnDetail,
        transaction_id: &str,
        operation: &'static str,
    ) -> Result<&'m mut TxnDetail> {
        if detail.state == Some(TxnState::Begin) {
            Ok(detail)
        } else {
            Err(Error::InvalidTxnTransition {
                transaction: transaction_id.to_owned(),
                state: detail.state,
                operation,
            })
        }
    }

    fn sequence_check(
        meta: &mut Meta,
        producer: i64,
        epoch: i16,
        sequence: i32,
        topition: &Topition,
    ) -> Result<()> {
        let Some(detail) = meta.producers.get_mut(&producer) else {
            return Err(Error::UnknownProducerId(producer));
        };

        let Some(mut current) = detail.sequences.last_entry() else {
            return Err(Error::UnknownProducerId(producer));
        };

        if current.key() != &epoch {
            return Err(Error::ProducerFenced { producer, epoch });
        }

        match current.get_mut().entry(topition.to_owned()).or_default() {
            expected if sequence > *expected => Err(Error::OutOfOrderSequenceNumber {
                sequence,
                expected: *expected,
            }),

            expected if sequence < *expected => Err(Error::DuplicateSequenceNumber {
                sequence,
                expected: *expected,
            }),

            expected => {
                *expected += 1;
                Ok(())
            }
        }
    }

    /// Prepares the terminal intent and completes it: a commit materializes
    /// buffered offsets, an abort quarantines produce ranges so they never
    /// surface to a read committed reader. Caller holds the metadata lock.
    fn txn_end_locked(
        &self,
        meta: &mut Meta,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        committed: bool,
    ) -> Result<()> {
        let (produces, offsets) = {
            let detail = Self::txn_detail(meta, transaction_id, producer_id, producer_epoch)
                .and_then(|detail| Self::begun(detail, transaction_id, "txn_end"))?;

            _ = detail.state.replace(if committed {
                TxnState::PrepareCommit
            } else {
                TxnState::PrepareAbort
            });

            (take(&mut detail.produces), take(&mut detail.offsets))
        };

        if committed {
            for (group, topitions) in offsets {
                for (topition, commit) in topitions {
                    _ = meta
                        .consumer_offsets
                        .entry(group.clone())
                        .or_default()
                        .insert(
                            topition,
                            CommittedOffset {
                                offset: commit.committed_offset,
                                leader_epoch: commit.leader_epoch,
                                timestamp: Some(SystemTime::now()),
                                metadata: commit.metadata,
                            },
                        );
                }
            }
        } else {
            for (topition, range) in produces {
                let Some(range) = range else {
                    continue;
                };

                if let Ok(log) = self.log(&topition) {
                    log.lock()?.aborted.push(range);
                }
            }
        }

        let detail = Self::txn_detail(meta, transaction_id, producer_id, producer_epoch)?;
        _ = detail.state.replace(if committed {
            TxnState::Committed
        } else {
            TxnState::Aborted
        });

        Ok(())
    }
}

#[async_trait]
impl Storage for Engine {
    async fn create_topic(&self, topic: CreatableTopic, validate_only: bool) -> Result<Uuid> {
        debug!(cluster = self.cluster, ?topic, validate_only);

        if topic.num_partitions < 1 {
            return Err(Error::Message(format!(
                "num_partitions: {}",
                topic.num_partitions
            )));
        }

        let mut meta = self.meta.lock()?;

        match meta.topics.entry(topic.name.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().topic == topic {
                    Ok(occupied.get().id)
                } else {
                    Err(Error::TopicAlreadyExists {
                        topic: topic.name.clone(),
                    })
                }
            }

            Entry::Vacant(vacant) => {
                let id = Uuid::now_v7();

                if !validate_only {
                    let mut registry = self.logs.lock()?;

                    for partition in 0..topic.num_partitions {
                        _ = registry.insert(
                            Topition::new(topic.name.clone(), partition),
                            Arc::new(Mutex::new(Log::default())),
                        );
                    }

                    _ = vacant.insert(TopicMetadata { id, topic });
                }

                Ok(id)
            }
        }
    }

    async fn delete_topic(&self, topic: &TopicId) -> Result<()> {
        debug!(cluster = self.cluster, ?topic);

        let mut meta = self.meta.lock()?;

        let name = match topic {
            TopicId::Name(name) => meta
                .topics
                .contains_key(name)
                .then(|| name.to_owned())
                .ok_or(Error::UnknownTopic(topic.to_owned()))?,

            TopicId::Id(id) => meta
                .topics
                .iter()
                .find(|(_, metadata)| &metadata.id == id)
                .map(|(name, _)| name.to_owned())
                .ok_or(Error::UnknownTopic(topic.to_owned()))?,
        };

        _ = meta.topics.remove(&name);

        self.logs
            .lock()?
            .retain(|topition, _| topition.topic() != name);

        for offsets in meta.consumer_offsets.values_mut() {
            offsets.retain(|topition, _| topition.topic() != name);
        }

        for txn in meta.transactions.values_mut() {
            for detail in txn.epochs.values_mut() {
                detail.produces.retain(|topition, _| topition.topic() != name);

                for offsets in detail.offsets.values_mut() {
                    offsets.retain(|topition, _| topition.topic() != name);
                }
            }
        }

        Ok(())
    }

    async fn resolve_topition(&self, topic: &str, partition: i32) -> Result<Topition> {
        debug!(cluster = self.cluster, topic, partition);

        let meta = self.meta.lock()?;
        let topition = Topition::new(topic, partition);

        Self::topition_known(&meta, &topition).map(|()| topition)
    }

    async fn produce(
        &self,
        transaction_id: Option<&str>,
        topition: &Topition,
        record: Record,
    ) -> Result<i64> {
        debug!(cluster = self.cluster, transaction_id, ?topition, ?record);

        let attributes = [KeyValue::new("method", "produce")];
        REQUESTS.add(1, &attributes);

        let transactional = transaction_id
            .map(|transaction_id| {
                record
                    .producer_id
                    .zip(record.producer_epoch)
                    .map(|(producer_id, producer_epoch)| {
                        (transaction_id, producer_id, producer_epoch)
                    })
                    .ok_or(Error::Message(format!(
                        "transactional produce to {transaction_id} without a producer"
                    )))
            })
            .transpose()
            .inspect_err(|_| ERRORS.add(1, &attributes))?;

        // held across fencing, sequencing and the append so that a zombie
        // cannot pass the check and then write under a superseded epoch
        let mut meta = if record.is_idempotent() || transactional.is_some() {
            Some(self.meta.lock()?)
        } else {
            None
        };

        if let Some(meta) = meta.as_deref_mut() {
            if let Some((transaction_id, producer_id, producer_epoch)) = transactional {
                _ = Self::txn_detail(meta, transaction_id, producer_id, producer_epoch)
                    .and_then(|detail| Self::begun(detail, transaction_id, "produce"))
                    .inspect_err(|err| {
                        ERRORS.add(1, &attributes);
                        error!(?err, transaction_id, ?topition)
                    })?;
            }

            if let (Some(producer), Some(sequence)) = (record.producer_id, record.sequence) {
                Self::sequence_check(
                    meta,
                    producer,
                    record.producer_epoch.unwrap_or_default(),
                    sequence,
                    topition,
                )
                .inspect_err(|err| {
                    ERRORS.add(1, &attributes);
                    error!(?err, ?topition, producer, sequence)
                })?;
            }
        }

        let log = self.log(topition).inspect_err(|err| {
            ERRORS.add(1, &attributes);
            error!(?err, ?topition)
        })?;
        let mut log = log.lock()?;

        let offset = log.high;
        _ = log.records.insert(
            offset,
            Record {
                timestamp: record.timestamp.or_else(|| Some(SystemTime::now())),
                ..record
            },
        );
        log.high = offset + 1;

        if let (Some(meta), Some((transaction_id, producer_id, producer_epoch))) =
            (meta.as_deref_mut(), transactional)
        {
            let detail = Self::txn_detail(meta, transaction_id, producer_id, producer_epoch)?;

            _ = detail
                .produces
                .entry(topition.to_owned())
                .and_modify(|entry| {
                    let range = entry.get_or_insert(TxnProduceOffset {
                        offset_start: offset,
                        offset_end: offset,
                    });

                    if offset > range.offset_end {
                        range.offset_end = offset;
                    }
                })
                .or_insert(Some(TxnProduceOffset {
                    offset_start: offset,
                    offset_end: offset,
                }));
        }

        debug!(cluster = self.cluster, ?topition, offset);

        Ok(offset)
    }

    async fn fetch(
        &self,
        topition: &Topition,
        offset: i64,
        max_records: u32,
        isolation: IsolationLevel,
    ) -> Result<Vec<(i64, Record)>> {
        debug!(cluster = self.cluster, ?topition, offset, max_records, ?isolation);

        let meta = self.meta.lock()?;
        let log = self.log(topition)?;
        let log = log.lock()?;

        let limit = match isolation {
            IsolationLevel::ReadUncommitted => log.high,
            IsolationLevel::ReadCommitted => Self::last_stable(&meta, topition, log.high),
        };

        drop(meta);

        let start = offset.max(log.low);

        if start >= limit {
            return Ok(vec![]);
        }

        let records = log
            .records
            .range(start..limit)
            .filter(|(offset, _)| {
                isolation == IsolationLevel::ReadUncommitted
                    || !log
                        .aborted
                        .iter()
                        .any(|range| **offset >= range.offset_start && **offset <= range.offset_end)
            })
            .take(max_records as usize)
            .map(|(offset, record)| (*offset, record.clone()))
            .collect();

        Ok(records)
    }

    async fn offset_stage(&self, topition: &Topition) -> Result<OffsetStage> {
        debug!(cluster = self.cluster, ?topition);

        let meta = self.meta.lock()?;
        let log = self.log(topition)?;
        let log = log.lock()?;

        let high_watermark = log.high;
        let log_start = log.low;
        let last_stable = Self::last_stable(&meta, topition, high_watermark);

        debug!(
            cluster = self.cluster,
            ?topition,
            log_start,
            high_watermark,
            last_stable
        );

        Ok(OffsetStage::new(last_stable, high_watermark, log_start))
    }

    async fn delete_records(&self, topition: &Topition, before_offset: i64) -> Result<i64> {
        debug!(cluster = self.cluster, ?topition, before_offset);

        let meta = self.meta.lock()?;
        let log = self.log(topition)?;
        let mut log = log.lock()?;

        // retention may never pass a pending transactional write
        let stable = Self::last_stable(&meta, topition, log.high);
        let low = log.low.max(before_offset.min(stable));

        log.records = log.records.split_off(&low);
        log.aborted.retain(|range| range.offset_end >= low);
        log.low = low;

        Ok(low)
    }

    async fn init_producer(
        &self,
        transaction_id: Option<&str>,
        transaction_timeout_ms: i32,
        producer_id: Option<i64>,
        producer_epoch: Option<i16>,
    ) -> Result<ProducerIdResponse> {
        debug!(
            cluster = self.cluster,
            transaction_id, transaction_timeout_ms, producer_id, producer_epoch
        );

        let mut meta = self.meta.lock()?;

        match (producer_id, producer_epoch) {
            (Some(-1), Some(-1)) | (None, None) => {
                if let Some(transaction_id) = transaction_id {
                    if meta.transactions.contains_key(transaction_id) {
                        let (producer, current_epoch, state) = {
                            let txn = &meta.transactions[transaction_id];

                            let (epoch, detail) =
                                txn.epochs.last_key_value().ok_or(Error::Message(format!(
                                    "transaction without an epoch: {transaction_id}"
                                )))?;

                            (txn.producer, *epoch, detail.state)
                        };

                        // a still open transaction from the previous
                        // incarnation is aborted before handing out the
                        // bumped epoch
                        if state == Some(TxnState::Begin) {
                            self.txn_end_locked(
                                &mut meta,
                                transaction_id,
                                producer,
                                current_epoch,
                                false,
                            )?;
                        }

                        let epoch = current_epoch + 1;

                        _ = meta.producers.entry(producer).and_modify(|detail| {
                            _ = detail.sequences.insert(epoch, BTreeMap::new());
                        });

                        _ = meta
                            .transactions
                            .get_mut(transaction_id)
                            .ok_or(Error::UnknownTransactionId(transaction_id.to_owned()))?
                            .epochs
                            .insert(
                                epoch,
                                TxnDetail {
                                    transaction_timeout_ms,
                                    ..Default::default()
                                },
                            );

                        Ok(ProducerIdResponse {
                            id: producer,
                            epoch,
                        })
                    } else {
                        let id = meta
                            .producers
                            .last_key_value()
                            .map_or(1, |(id, _)| id + 1);

                        let mut detail = ProducerDetail::default();
                        assert_eq!(None, detail.sequences.insert(0, BTreeMap::new()));
                        assert_eq!(None, meta.producers.insert(id, detail));

                        let mut epochs = BTreeMap::new();
                        assert_eq!(
                            None,
                            epochs.insert(
                                0,
                                TxnDetail {
                                    transaction_timeout_ms,
                                    ..Default::default()
                                },
                            )
                        );

                        assert_eq!(
                            None,
                            meta.transactions
                                .insert(transaction_id.to_owned(), Txn { producer: id, epochs })
                        );

                        Ok(ProducerIdResponse { id, epoch: 0 })
                    }
                } else {
                    let id = meta
                        .producers
                        .last_key_value()
                        .map_or(1, |(id, _)| id + 1);

                    let mut detail = ProducerDetail::default();
                    assert_eq!(None, detail.sequences.insert(0, BTreeMap::new()));
                    assert_eq!(None, meta.producers.insert(id, detail));

                    Ok(ProducerIdResponse { id, epoch: 0 })
                }
            }

            (Some(id), Some(epoch)) if id > 0 => {
                let Some(detail) = meta.producers.get_mut(&id) else {
                    return Err(Error::UnknownProducerId(id));
                };

                let current = detail
                    .sequences
                    .last_key_value()
                    .map(|(current, _)| *current)
                    .ok_or(Error::UnknownProducerId(id))?;

                if current != epoch {
                    return Err(Error::ProducerFenced {
                        producer: id,
                        epoch,
                    });
                }

                let bumped = epoch + 1;
                assert_eq!(None, detail.sequences.insert(bumped, BTreeMap::new()));

                if let Some(transaction_id) = transaction_id
                    && let Some(txn) = meta.transactions.get_mut(transaction_id)
                    && txn.producer == id
                {
                    _ = txn.epochs.insert(
                        bumped,
                        TxnDetail {
                            transaction_timeout_ms,
                            ..Default::default()
                        },
                    );
                }

                Ok(ProducerIdResponse { id, epoch: bumped })
            }

            (producer_id, producer_epoch) => Err(Error::Message(format!(
                "producer id: {producer_id:?} with epoch: {producer_epoch:?}"
            ))),
        }
    }

    async fn txn_begin(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        transaction_timeout_ms: i32,
    ) -> Result<()> {
        debug!(
            cluster = self.cluster,
            transaction_id, producer_id, producer_epoch, transaction_timeout_ms
        );

        let mut meta = self.meta.lock()?;
        let detail = Self::txn_detail(&mut meta, transaction_id, producer_id, producer_epoch)?;

        if detail.state.is_some() || detail.started_at.is_some() {
            return Err(Error::InvalidTxnTransition {
                transaction: transaction_id.to_owned(),
                state: detail.state,
                operation: "txn_begin",
            });
        }

        _ = detail.state.replace(TxnState::Begin);
        _ = detail.started_at.replace(SystemTime::now());
        detail.transaction_timeout_ms = transaction_timeout_ms;

        Ok(())
    }

    async fn txn_add_partitions(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        partitions: &[Topition],
    ) -> Result<()> {
        debug!(
            cluster = self.cluster,
            transaction_id, producer_id, producer_epoch, ?partitions
        );

        let mut meta = self.meta.lock()?;

        for topition in partitions {
            Self::topition_known(&meta, topition)
                .inspect_err(|err| error!(?err, transaction_id, ?topition))?;
        }

        let detail = Self::txn_detail(&mut meta, transaction_id, producer_id, producer_epoch)
            .and_then(|detail| Self::begun(detail, transaction_id, "txn_add_partitions"))?;

        for topition in partitions {
            _ = detail.produces.entry(topition.to_owned()).or_insert(None);
        }

        Ok(())
    }

    async fn txn_add_offsets(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
    ) -> Result<()> {
        debug!(
            cluster = self.cluster,
            transaction_id, producer_id, producer_epoch, group_id
        );

        let mut meta = self.meta.lock()?;

        Self::txn_detail(&mut meta, transaction_id, producer_id, producer_epoch)
            .and_then(|detail| Self::begun(detail, transaction_id, "txn_add_offsets"))
            .map(|_| ())
    }

    async fn txn_offset_commit(&self, offsets: TxnOffsetCommitRequest) -> Result<()> {
        debug!(cluster = self.cluster, ?offsets);

        let mut meta = self.meta.lock()?;

        for (topition, _) in &offsets.offsets {
            Self::topition_known(&meta, topition)
                .inspect_err(|err| error!(?err, offsets.transaction_id, ?topition))?;
        }

        let detail = Self::txn_detail(
            &mut meta,
            &offsets.transaction_id,
            offsets.producer_id,
            offsets.producer_epoch,
        )
        .and_then(|detail| Self::begun(detail, &offsets.transaction_id, "txn_offset_commit"))?;

        for (topition, commit) in offsets.offsets {
            _ = detail
                .offsets
                .entry(offsets.group_id.clone())
                .or_default()
                .insert(
                    topition,
                    TxnCommitOffset {
                        committed_offset: commit.offset,
                        leader_epoch: commit.leader_epoch,
                        metadata: commit.metadata,
                    },
                );
        }

        Ok(())
    }

    async fn txn_end(
        &self,
        transaction_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        committed: bool,
    ) -> Result<()> {
        debug!(
            cluster = self.cluster,
            transaction_id, producer_id, producer_epoch, committed
        );

        let attributes = [KeyValue::new("method", "txn_end")];
        REQUESTS.add(1, &attributes);

        let mut meta = self.meta.lock()?;

        self.txn_end_locked(&mut meta, transaction_id, producer_id, producer_epoch, committed)
            .inspect_err(|err| {
                ERRORS.add(1, &attributes);
                error!(?err, transaction_id, producer_id, producer_epoch, committed)
            })
    }

    async fn update_group(
        &self,
        group_id: &str,
        detail: Bytes,
        version: Option<Version>,
    ) -> Result<Version, UpdateError<Bytes>> {
        debug!(cluster = self.cluster, group_id, ?version);

        let mut meta = self.meta.lock().map_err(Error::from)?;

        if let Some(current) = meta.groups.get_mut(group_id) {
            match version {
                None => Err(UpdateError::Outdated {
                    current: current.detail.clone(),
                    version: Version::default().e_tag(current.e_tag.to_string()),
                }),

                Some(version) => {
                    let Some(e_tag) = version.e_tag_str() else {
                        return Err(UpdateError::MissingEtag);
                    };

                    if e_tag == current.e_tag.to_string() {
                        let e_tag = Uuid::now_v7();
                        current.e_tag = e_tag;
                        current.detail = detail;

                        Ok(Version::default().e_tag(e_tag.to_string()))
                    } else {
                        Err(UpdateError::Outdated {
                            current: current.detail.clone(),
                            version: Version::default().e_tag(current.e_tag.to_string()),
                        })
                    }
                }
            }
        } else if version.is_none() {
            let e_tag = Uuid::now_v7();

            assert_eq!(
                None,
                meta.groups
                    .insert(group_id.to_owned(), Group { e_tag, detail })
            );

            Ok(Version::default().e_tag(e_tag.to_string()))
        } else {
            Err(UpdateError::Error(Error::UnknownConsumerGroup(
                group_id.to_owned(),
            )))
        }
    }

    async fn offset_commit(
        &self,
        group_id: &str,
        retention_time_ms: Option<Duration>,
        offsets: &[(Topition, OffsetCommitRequest)],
    ) -> Result<()> {
        debug!(cluster = self.cluster, group_id, ?retention_time_ms);

        let mut meta = self.meta.lock()?;

        // validated up front so that the commit applies fully or not at all
        for (topition, _) in offsets {
            Self::topition_known(&meta, topition)
                .inspect_err(|err| error!(?err, group_id, ?topition))?;
        }

        for (topition, commit) in offsets {
            _ = meta
                .consumer_offsets
                .entry(group_id.to_owned())
                .or_default()
                .insert(
                    topition.to_owned(),
                    CommittedOffset {
                        offset: commit.offset,
                        leader_epoch: commit.leader_epoch,
                        timestamp: commit.timestamp.or_else(|| Some(SystemTime::now())),
                        metadata: commit.metadata.clone(),
                    },
                );
        }

        Ok(())
    }

    async fn offset_fetch(
        &self,
        group_id: Option<&str>,
        topics: &[Topition],
        require_stable: Option<bool>,
    ) -> Result<BTreeMap<Topition, i64>> {
        debug!(cluster = self.cluster, group_id, ?topics, require_stable);

        let meta = self.meta.lock()?;

        let mut offsets = BTreeMap::new();

        for topition in topics {
            Self::topition_known(&meta, topition)?;

            if require_stable == Some(true)
                && let Some(group_id) = group_id
                && meta
                    .transactions
                    .values()
                    .flat_map(|txn| txn.epochs.values())
                    .filter(|detail| detail.state.is_some_and(|state| !state.is_terminal()))
                    .any(|detail| {
                        detail
                            .offsets
                            .get(group_id)
                            .is_some_and(|pending| pending.contains_key(topition))
                    })
            {
                return Err(Error::UnstableOffsetCommit {
                    group: group_id.to_owned(),
                    topition: topition.to_owned(),
                });
            }

            let offset = group_id
                .and_then(|group_id| meta.consumer_offsets.get(group_id))
                .and_then(|committed| committed.get(topition))
                .map_or(-1, |committed| committed.offset);

            assert_eq!(None, offsets.insert(topition.to_owned(), offset));
        }

        Ok(offsets)
    }

    async fn committed_offset_topitions(&self, group_id: &str) -> Result<BTreeMap<Topition, i64>> {
        debug!(cluster = self.cluster, group_id);

        let meta = self.meta.lock()?;

        Ok(meta
            .consumer_offsets
            .get(group_id)
            .map(|committed| {
                committed
                    .iter()
                    .map(|(topition, commit)| (topition.to_owned(), commit.offset))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cluster_id(&self) -> Result<String> {
        Ok(self.cluster.clone())
    }

    async fn node(&self) -> Result<i32> {
        Ok(self.node)
    }

    async fn advertised_listener(&self) -> Result<Url> {
        Ok(self.advertised_listener.clone())
    }
}
