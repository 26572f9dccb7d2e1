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

use kura_storage::{
    CreatableTopic, Error, OffsetCommitRequest, Result, Storage, StorageContainer, Topition,
};

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
async fn last_write_wins() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    let group_id = common::alphanumeric_string(15);

    sc.offset_commit(
        group_id.as_str(),
        None,
        &[(
            topition.clone(),
            OffsetCommitRequest::default().offset(5).leader_epoch(0),
        )],
    )
    .await?;

    assert_eq!(
        Some(&5),
        sc.offset_fetch(Some(group_id.as_str()), &[topition.clone()], None)
            .await?
            .get(&topition)
    );

    // no monotonic enforcement at this layer
    sc.offset_commit(
        group_id.as_str(),
        None,
        &[(
            topition.clone(),
            OffsetCommitRequest::default().offset(3).leader_epoch(0),
        )],
    )
    .await?;

    assert_eq!(
        Some(&3),
        sc.offset_fetch(Some(group_id.as_str()), &[topition.clone()], None)
            .await?
            .get(&topition)
    );

    Ok(())
}

#[tokio::test]
async fn commit_to_unknown_topition_applies_nothing() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;
    let topition = topic_with_one_partition(&sc).await?;

    let group_id = common::alphanumeric_string(15);

    assert!(matches!(
        sc.offset_commit(
            group_id.as_str(),
            None,
            &[
                (topition.clone(), OffsetCommitRequest::default().offset(5)),
                (
                    Topition::new("never-created", 0),
                    OffsetCommitRequest::default().offset(7),
                ),
            ],
        )
        .await,
        Err(Error::UnknownTopicOrPartition(_))
    ));

    assert_eq!(
        Some(&-1),
        sc.offset_fetch(Some(group_id.as_str()), &[topition.clone()], None)
            .await?
            .get(&topition)
    );

    Ok(())
}

#[tokio::test]
async fn committed_offsets_by_group() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let name = common::alphanumeric_string(15);
    _ = sc
        .create_topic(
            CreatableTopic::default()
                .name(name.clone())
                .num_partitions(3)
                .replication_factor(1),
            false,
        )
        .await?;

    let group_id = common::alphanumeric_string(15);

    let offsets = (0..3)
        .map(|partition| {
            (
                Topition::new(name.clone(), partition),
                OffsetCommitRequest::default().offset(i64::from(partition) * 10),
            )
        })
        .collect::<Vec<_>>();

    sc.offset_commit(group_id.as_str(), None, &offsets).await?;

    let committed = sc.committed_offset_topitions(group_id.as_str()).await?;

    assert_eq!(3, committed.len());

    for partition in 0..3 {
        assert_eq!(
            Some(&(i64::from(partition) * 10)),
            committed.get(&Topition::new(name.clone(), partition))
        );
    }

    assert!(
        sc.committed_offset_topitions("no-commits-here")
            .await?
            .is_empty()
    );

    Ok(())
}

#[tokio::test]
async fn offset_fetch_for_unknown_topition() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let group_id = common::alphanumeric_string(15);

    assert!(matches!(
        sc.offset_fetch(
            Some(group_id.as_str()),
            &[Topition::new("never-created", 0)],
            None,
        )
        .await,
        Err(Error::UnknownTopicOrPartition(_))
    ));

    Ok(())
}
