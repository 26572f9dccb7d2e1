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
use kura_storage::{Error, Result, Storage, UpdateError};

mod common;

#[tokio::test]
async fn conditional_group_update() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let group_id = common::alphanumeric_string(15);

    let v1 = sc
        .update_group(group_id.as_str(), Bytes::from_static(b"one"), None)
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    let v2 = sc
        .update_group(
            group_id.as_str(),
            Bytes::from_static(b"two"),
            Some(v1.clone()),
        )
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    assert_ne!(v1, v2);

    // a stale e_tag never mutates the stored detail
    match sc
        .update_group(
            group_id.as_str(),
            Bytes::from_static(b"three"),
            Some(v1.clone()),
        )
        .await
    {
        Err(UpdateError::Outdated { current, version }) => {
            assert_eq!(Bytes::from_static(b"two"), current);
            assert_eq!(v2, version);
        }

        otherwise => panic!("{otherwise:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn update_without_version_on_existing_group() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let group_id = common::alphanumeric_string(15);

    let v1 = sc
        .update_group(group_id.as_str(), Bytes::from_static(b"one"), None)
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    match sc
        .update_group(group_id.as_str(), Bytes::from_static(b"blind"), None)
        .await
    {
        Err(UpdateError::Outdated { current, version }) => {
            assert_eq!(Bytes::from_static(b"one"), current);
            assert_eq!(v1, version);
        }

        otherwise => panic!("{otherwise:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn racing_updates_from_the_same_read() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let group_id = common::alphanumeric_string(15);

    let read = sc
        .update_group(group_id.as_str(), Bytes::from_static(b"seed"), None)
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    // both observed the same e_tag: exactly one wins
    let winner = sc
        .update_group(
            group_id.as_str(),
            Bytes::from_static(b"winner"),
            Some(read.clone()),
        )
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    match sc
        .update_group(
            group_id.as_str(),
            Bytes::from_static(b"loser"),
            Some(read.clone()),
        )
        .await
    {
        Err(UpdateError::Outdated { current, version }) => {
            assert_eq!(Bytes::from_static(b"winner"), current);
            assert_eq!(winner, version);
        }

        otherwise => panic!("{otherwise:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn update_with_version_on_unknown_group() -> Result<()> {
    let _guard = common::init_tracing()?;

    let sc = common::storage_container("kura").await?;

    let group_id = common::alphanumeric_string(15);

    let other = sc
        .update_group("somewhere-else", Bytes::from_static(b"seed"), None)
        .await
        .map_err(|err| Error::Message(err.to_string()))?;

    assert!(matches!(
        sc.update_group(group_id.as_str(), Bytes::from_static(b"one"), Some(other))
            .await,
        Err(UpdateError::Error(Error::UnknownConsumerGroup(_)))
    ));

    Ok(())
}
