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

use bytes::Bytes;
use kura_storage::{
    CreatableTopic, Error, Header, IsolationLevel, Record, Result, Storage, StorageContainer,
    Topition,
};
use tokio::task::JoinSet;
use tracing::debug;

mod common;

async fn topic_with_one_partition(sc: &StorageContainer) -> Result<Topition> {
    let name = common::alphanumeric_string(15);

    _ = sc
        .create_topic(
            CreatableTopic::default()
                .name(name.clone())
                .num_partitions(1)
                .replication_factor(1),
            false,
        )
        .await?;

    sc.resolve_topition(name.as_str(), 0).await
}

#[tokio::test]
async fn offsets_are_dense_and_monotonic() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    for n in 0..50 {
        let value = format!("Lorem ipsum dolor sit amet: {n}");

        let offset = sc
            .produce(
                None,
                &topition,
                Record::default().value(Bytes::copy_from_slice(value.as_bytes())),
            )
            .await?;

        assert_eq!(n, offset);
    }

    let stage = sc.offset_stage(&topition).await?;
    assert_eq!(0, stage.log_start());
    assert_eq!(50, stage.high_watermark());
    assert_eq!(50, stage.last_stable());

    Ok(())
}

#[tokio::test]
async fn concurrent_producers_observe_distinct_offsets() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    let mut tasks = JoinSet::new();

    for n in 0..32 {
        let sc = sc.clone();
        let topition = topition.clone();

        _ = tasks.spawn(async move {
            sc.produce(
                None,
                &topition,
                Record::default().value(Bytes::from(format!("{n}"))),
            )
            .await
        });
    }

    let mut offsets = vec![];

    while let Some(joined) = tasks.join_next().await {
        offsets.push(joined.expect("join")?);
    }

    offsets.sort();
    assert_eq!((0..32).collect::<Vec<i64>>(), offsets);

    Ok(())
}

#[tokio::test]
async fn idempotent_unknown_producer_id() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    assert!(matches!(
        sc.produce(
            None,
            &topition,
            Record::default()
                .value(Bytes::from_static(b"lorem"))
                .producer_id(54345)
                .producer_epoch(0)
                .sequence(0),
        )
        .await,
        Err(Error::UnknownProducerId(54345))
    ));

    Ok(())
}

#[tokio::test]
async fn idempotent_sequence_accounting() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    let producer = sc.init_producer(None, 0, Some(-1), Some(-1)).await?;
    debug!(?producer);

    for sequence in 0..5 {
        _ = sc
            .produce(
                None,
                &topition,
                Record::default()
                    .value(Bytes::from_static(b"lorem"))
                    .producer_id(producer.id)
                    .producer_epoch(producer.epoch)
                    .sequence(sequence),
            )
            .await?;
    }

    assert!(matches!(
        sc.produce(
            None,
            &topition,
            Record::default()
                .value(Bytes::from_static(b"replay"))
                .producer_id(producer.id)
                .producer_epoch(producer.epoch)
                .sequence(2),
        )
        .await,
        Err(Error::DuplicateSequenceNumber {
            sequence: 2,
            expected: 5
        })
    ));

    assert!(matches!(
        sc.produce(
            None,
            &topition,
            Record::default()
                .value(Bytes::from_static(b"gap"))
                .producer_id(producer.id)
                .producer_epoch(producer.epoch)
                .sequence(9),
        )
        .await,
        Err(Error::OutOfOrderSequenceNumber {
            sequence: 9,
            expected: 5
        })
    ));

    // a duplicate is rejected before any offset is assigned
    assert_eq!(5, sc.offset_stage(&topition).await?.high_watermark());

    Ok(())
}

#[tokio::test]
async fn fetch_returns_appended_records() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    for n in 0..10 {
        _ = sc
            .produce(
                None,
                &topition,
                Record::default()
                    .key(Bytes::from(format!("k{n}")))
                    .value(Bytes::from(format!("v{n}")))
                    .header(
                        Header::default()
                            .key(Bytes::from_static(b"origin"))
                            .value(Bytes::from_static(b"test")),
                    ),
            )
            .await?;
    }

    let records = sc
        .fetch(&topition, 3, 4, IsolationLevel::ReadUncommitted)
        .await?;

    assert_eq!(
        vec![3, 4, 5, 6],
        records.iter().map(|(offset, _)| *offset).collect::<Vec<_>>()
    );

    assert_eq!(
        Some(Bytes::from_static(b"v3")),
        records[0].1.value.clone()
    );

    Ok(())
}

#[tokio::test]
async fn delete_records_advances_log_start() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    for n in 0..10 {
        _ = sc
            .produce(
                None,
                &topition,
                Record::default().value(Bytes::from(format!("{n}"))),
            )
            .await?;
    }

    assert_eq!(7, sc.delete_records(&topition, 7).await?);

    let stage = sc.offset_stage(&topition).await?;
    assert_eq!(7, stage.log_start());
    assert_eq!(10, stage.high_watermark());

    // records below the log start are no longer served
    let records = sc
        .fetch(&topition, 0, 100, IsolationLevel::ReadUncommitted)
        .await?;
    assert_eq!(
        vec![7, 8, 9],
        records.iter().map(|(offset, _)| *offset).collect::<Vec<_>>()
    );

    // the log start never regresses
    assert_eq!(7, sc.delete_records(&topition, 3).await?);

    Ok(())
}

#[tokio::test]
async fn produce_to_unknown_topition() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    assert!(matches!(
        sc.produce(
            None,
            &Topition::new("never-created", 0),
            Record::default().value(Bytes::from_static(b"lorem")),
        )
        .await,
        Err(Error::UnknownTopicOrPartition(_))
    ));

    Ok(())
}
