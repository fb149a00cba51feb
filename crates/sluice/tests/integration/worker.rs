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

//! Worker pool tests: queued tasks picked up and driven to a terminal
//! state, with publish bookkeeping on commit failures.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use uuid::Uuid;

use sluice::config::Settings;
use sluice::dal::DAL;
use sluice::error::StoreError;
use sluice::models::task::Task;
use sluice::publish::{ItemInput, PublishManager};
use sluice::store::MemoryStore;
use sluice::worker::WorkerPool;

use crate::fixtures::{
    get_or_init_fixture, test_environment_with_flush, test_key, test_settings,
    test_settings_builder, RecordingPurgeClient,
};

struct Rig {
    dal: Arc<DAL>,
    manager: PublishManager,
    pool: WorkerPool,
    store: Arc<MemoryStore>,
    purge: Arc<RecordingPurgeClient>,
}

async fn rig_with(settings: Settings) -> Rig {
    let fixture = get_or_init_fixture().await;
    let mut guard = fixture.lock().unwrap_or_else(|e| e.into_inner());
    guard.reset_database().await;
    let dal = Arc::new(guard.get_dal());
    drop(guard);

    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::new());
    let purge = Arc::new(RecordingPurgeClient::new());
    let pool = WorkerPool::new(
        dal.clone(),
        settings.clone(),
        store.clone(),
        purge.clone(),
    );

    Rig {
        manager: PublishManager::new(dal.clone(), settings),
        dal,
        pool,
        store,
        purge,
    }
}

async fn rig() -> Rig {
    rig_with(test_settings()).await
}

/// Polls until the task leaves the queue states or ten seconds pass.
async fn wait_for_terminal(dal: &DAL, id: Uuid) -> Task {
    for _ in 0..400 {
        let task = dal.task().get(id).await.unwrap().unwrap();
        if matches!(task.state.as_str(), "done" | "rejected") {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} never reached a terminal state", id);
}

#[tokio::test]
#[serial]
async fn test_pool_drives_commit_task_to_completion() {
    let rig = rig().await;
    rig.pool.start().await.unwrap();

    let publish = rig.manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();
    rig.manager
        .add_items(
            id,
            vec![
                ItemInput::content("/content/a.txt", test_key('a'), Some("text/plain".into())),
                ItemInput::content("/content/listing", test_key('b'), Some("text/plain".into())),
            ],
        )
        .await
        .unwrap();
    let task = rig.manager.request_commit(id).await.unwrap();

    let done = wait_for_terminal(&rig.dal, task.id.parse().unwrap()).await;
    assert_eq!(done.state, "done");

    let result: serde_json::Value = serde_json::from_str(done.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["items_written"], 2);
    assert!(done.result_expiry.is_some());

    // The API view of a done task reads COMPLETE.
    let external = sluice::schemas::Task::from(&done);
    assert_eq!(external.state, "COMPLETE");
    assert_eq!(external.links.self_link, format!("/task/{}", done.id));

    let committed = rig.dal.publish().get(id).await.unwrap().unwrap();
    assert_eq!(committed.state, "COMMITTED");
    assert_eq!(rig.store.entry_count(), 2);
    // Ordinary content lands before the entrypoint.
    assert_eq!(
        rig.store.written_paths(),
        vec!["/content/a.txt".to_string(), "/content/listing".to_string()]
    );

    rig.pool.shutdown().await;
}

/// A task claimed by a worker that dies is reclaimed by the maintenance
/// pass and completed by a live worker, with no duplicate store writes.
#[tokio::test]
#[serial]
async fn test_pool_recovers_task_claimed_by_dead_worker() {
    let rig = rig().await;

    let publish = rig.manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();
    rig.manager
        .add_items(
            id,
            vec![ItemInput::content(
                "/content/a.txt",
                test_key('a'),
                Some("text/plain".into()),
            )],
        )
        .await
        .unwrap();
    let task = rig.manager.request_commit(id).await.unwrap();

    // "ghost" claims the task and vanishes without ever heartbeating.
    rig.dal.task().claim("ghost").await.unwrap().unwrap();

    rig.pool.start().await.unwrap();

    let done = wait_for_terminal(&rig.dal, task.id.parse().unwrap()).await;
    assert_eq!(done.state, "done");
    assert_eq!(done.attempt, 1);

    let committed = rig.dal.publish().get(id).await.unwrap().unwrap();
    assert_eq!(committed.state, "COMMITTED");
    assert_eq!(rig.store.written_paths(), vec!["/content/a.txt".to_string()]);

    rig.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_pool_rejects_failing_commit_and_fails_publish() {
    let rig = rig().await;

    let publish = rig.manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();
    rig.manager
        .add_items(
            id,
            vec![ItemInput::content(
                "/content/a.txt",
                test_key('a'),
                Some("text/plain".into()),
            )],
        )
        .await
        .unwrap();
    rig.store
        .fail_path("/content/a.txt", StoreError::Permanent("denied".into()), 100);

    let task = rig.manager.request_commit(id).await.unwrap();
    rig.pool.start().await.unwrap();

    let rejected = wait_for_terminal(&rig.dal, task.id.parse().unwrap()).await;
    assert_eq!(rejected.state, "rejected");
    let result: serde_json::Value =
        serde_json::from_str(rejected.result.as_deref().unwrap()).unwrap();
    assert!(result["error"].as_str().unwrap().contains("phase 1"));

    let failed = rig.dal.publish().get(id).await.unwrap().unwrap();
    assert_eq!(failed.state, "FAILED");
    assert_eq!(rig.store.entry_count(), 0);

    rig.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_pool_executes_flush_task() {
    let rig = rig_with(
        test_settings_builder()
            .environment(test_environment_with_flush())
            .build(),
    )
    .await;
    rig.pool.start().await.unwrap();

    let task = rig
        .manager
        .request_flush("test", vec!["/content/a.rpm".to_string()])
        .await
        .unwrap();

    let done = wait_for_terminal(&rig.dal, task.id.parse().unwrap()).await;
    assert_eq!(done.state, "done");
    let result: serde_json::Value = serde_json::from_str(done.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["flushed_urls"], 1);

    assert_eq!(
        rig.purge.submitted(),
        vec!["https://cdn.example.com/content/a.rpm".to_string()]
    );

    rig.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_pool_rejects_task_from_unknown_queue() {
    let rig = rig().await;
    rig.pool.start().await.unwrap();

    let task = rig
        .dal
        .task()
        .enqueue("bogus", "{}".to_string(), 3, None)
        .await
        .unwrap();

    let rejected = wait_for_terminal(&rig.dal, task.id.parse().unwrap()).await;
    assert_eq!(rejected.state, "rejected");
    let result: serde_json::Value =
        serde_json::from_str(rejected.result.as_deref().unwrap()).unwrap();
    assert!(result["error"].as_str().unwrap().contains("unknown queue"));

    rig.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_pool_registers_and_deregisters_worker() {
    let rig = rig().await;

    rig.pool.start().await.unwrap();
    let workers = rig.dal.worker().list().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, rig.pool.worker_id());

    // Starting an already-running pool changes nothing.
    rig.pool.start().await.unwrap();
    assert_eq!(rig.dal.worker().list().await.unwrap().len(), 1);

    rig.pool.shutdown().await;
    assert!(rig.dal.worker().list().await.unwrap().is_empty());
}
