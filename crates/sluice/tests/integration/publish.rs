/*
 *  Copyright 2025-2026 Sluice Contributors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Publish lifecycle tests: creating publishes, adding item batches, and the
//! transition into a queued commit.

use std::sync::Arc;

use serial_test::serial;
use uuid::Uuid;

use sluice::error::{ConflictError, PublishError, ValidationError};
use sluice::models::task::CommitPayload;
use sluice::publish::{ItemInput, PublishManager};

use crate::fixtures::{get_or_init_fixture, test_key, test_settings};

async fn manager() -> (PublishManager, Arc<sluice::dal::DAL>) {
    let fixture = get_or_init_fixture().await;
    let mut guard = fixture.lock().unwrap_or_else(|e| e.into_inner());
    guard.reset_database().await;
    let dal = Arc::new(guard.get_dal());
    drop(guard);

    (
        PublishManager::new(dal.clone(), Arc::new(test_settings())),
        dal,
    )
}

#[tokio::test]
#[serial]
async fn test_create_and_get_publish() {
    let (manager, _dal) = manager().await;

    let publish = manager.create_publish("test").await.unwrap();
    assert_eq!(publish.env, "test");
    assert_eq!(publish.state, "PENDING");

    let loaded = manager
        .get_publish(publish.id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(loaded.id, publish.id);
    assert_eq!(loaded.state, "PENDING");
}

#[tokio::test]
#[serial]
async fn test_create_publish_rejects_unknown_environment() {
    let (manager, _dal) = manager().await;

    let err = manager.create_publish("staging").await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::Validation(ValidationError::UnknownEnvironment(_))
    ));
}

#[tokio::test]
#[serial]
async fn test_get_missing_publish_is_not_found() {
    let (manager, _dal) = manager().await;

    let err = manager.get_publish(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, PublishError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn test_add_items_stores_batch() {
    let (manager, dal) = manager().await;
    let publish = manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    let inserted = manager
        .add_items(
            id,
            vec![
                ItemInput::content(
                    "/content/a.rpm",
                    test_key('a'),
                    Some("application/x-rpm".to_string()),
                ),
                ItemInput::link("/content/alias.rpm", "/content/a.rpm"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    assert_eq!(dal.item().count(id).await.unwrap(), 2);

    let page = dal.item().page(id, 0, 10).await.unwrap();
    // Pages are ordered by web_uri.
    assert_eq!(page[0].web_uri, "/content/a.rpm");
    assert_eq!(page[1].web_uri, "/content/alias.rpm");
    assert!(page[1].is_link());
}

#[tokio::test]
#[serial]
async fn test_add_items_refreshes_publish_updated() {
    let (manager, _dal) = manager().await;
    let publish = manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    manager
        .add_items(
            id,
            vec![ItemInput::content("/content/a.rpm", test_key('a'), None)],
        )
        .await
        .unwrap();

    // Item activity counts as publish activity, which is what keeps a busy
    // publish out of the abandoned sweep.
    let reloaded = manager.get_publish(id).await.unwrap();
    assert!(reloaded.updated >= publish.updated);
}

#[tokio::test]
#[serial]
async fn test_add_items_rejects_path_already_stored() {
    let (manager, _dal) = manager().await;
    let publish = manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    manager
        .add_items(
            id,
            vec![ItemInput::content("/content/a.rpm", test_key('a'), None)],
        )
        .await
        .unwrap();

    let err = manager
        .add_items(
            id,
            vec![ItemInput::content("/content/a.rpm", test_key('b'), None)],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Validation(ValidationError::DuplicatePath(path)) if path == "/content/a.rpm"
    ));
}

#[tokio::test]
#[serial]
async fn test_rejected_batch_stores_nothing() {
    let (manager, dal) = manager().await;
    let publish = manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    let err = manager
        .add_items(
            id,
            vec![
                ItemInput::content("/content/a.rpm", test_key('a'), None),
                ItemInput::content("relative/path", test_key('b'), None),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Validation(ValidationError::InvalidPath(_))
    ));

    // The valid half of the batch must not have been stored either.
    assert_eq!(dal.item().count(id).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn test_request_commit_queues_task_and_freezes_publish() {
    let (manager, _dal) = manager().await;
    let publish = manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    manager
        .add_items(
            id,
            vec![ItemInput::content("/content/a.rpm", test_key('a'), None)],
        )
        .await
        .unwrap();

    let task = manager.request_commit(id).await.unwrap();
    assert_eq!(task.queue, "commits");
    assert_eq!(task.state, "queued");
    assert!(task.deadline.is_some());

    let payload: CommitPayload = serde_json::from_str(&task.payload).unwrap();
    assert_eq!(payload.publish_id, id);
    assert_eq!(payload.env, "test");

    let frozen = manager.get_publish(id).await.unwrap();
    assert_eq!(frozen.state, "COMMITTING");

    // Once committing, neither items nor a second commit are accepted.
    let err = manager
        .add_items(
            id,
            vec![ItemInput::content("/content/b.rpm", test_key('b'), None)],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Conflict(ConflictError::PublishNotPending { .. })
    ));

    let err = manager.request_commit(id).await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::Conflict(ConflictError::PublishNotPending { .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_request_flush_queues_task() {
    let (manager, _dal) = manager().await;

    let task = manager
        .request_flush("test", vec!["/content/listing".to_string()])
        .await
        .unwrap();
    assert_eq!(task.queue, "flushes");
    assert_eq!(task.state, "queued");

    let err = manager
        .request_flush("test", vec!["content/listing".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Validation(ValidationError::InvalidPath(_))
    ));

    let err = manager
        .request_flush("staging", vec!["/content/listing".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Validation(ValidationError::UnknownEnvironment(_))
    ));
}
