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

//! Commit engine tests: two-phase write ordering, link resolution, failure
//! containment and idempotent redo.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serial_test::serial;
use uuid::Uuid;

use sluice::commit::CommitEngine;
use sluice::config::Settings;
use sluice::error::{CommitError, StoreError};
use sluice::models::publish::PublishState;
use sluice::models::task::{CommitPayload, Task, COMMIT_QUEUE};
use sluice::publish::{ItemInput, PublishManager};
use sluice::store::{ConfigStore, MemoryStore};

use crate::fixtures::{
    get_or_init_fixture, test_environment, test_environment_with_flush, test_key, test_settings,
    test_settings_builder, RecordingPurgeClient,
};

struct Harness {
    dal: Arc<sluice::dal::DAL>,
    manager: PublishManager,
    engine: CommitEngine,
    store: Arc<MemoryStore>,
    purge: Arc<RecordingPurgeClient>,
}

async fn harness_with(settings: Settings) -> Harness {
    let fixture = get_or_init_fixture().await;
    let mut guard = fixture.lock().unwrap_or_else(|e| e.into_inner());
    guard.reset_database().await;
    let dal = Arc::new(guard.get_dal());
    drop(guard);

    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::new());
    let purge = Arc::new(RecordingPurgeClient::new());
    let engine = CommitEngine::new(
        dal.clone(),
        settings.clone(),
        store.clone(),
        purge.clone(),
    );

    Harness {
        manager: PublishManager::new(dal.clone(), settings),
        dal,
        engine,
        store,
        purge,
    }
}

async fn harness() -> Harness {
    harness_with(test_settings()).await
}

impl Harness {
    /// Creates a publish with `items` and requests its commit.
    async fn queued_commit(&self, items: Vec<ItemInput>) -> (Uuid, Task) {
        let publish = self.manager.create_publish("test").await.unwrap();
        let id: Uuid = publish.id.parse().unwrap();
        if !items.is_empty() {
            self.manager.add_items(id, items).await.unwrap();
        }
        let task = self.manager.request_commit(id).await.unwrap();
        (id, task)
    }

    async fn publish_state(&self, id: Uuid) -> String {
        self.dal.publish().get(id).await.unwrap().unwrap().state
    }
}

#[tokio::test]
#[serial]
async fn test_commit_writes_ordinary_content_before_entrypoints() {
    // A small page size forces several phase 1 passes.
    let h = harness_with(
        test_settings_builder()
            .environment(test_environment())
            .item_yield_size(2)
            .build(),
    )
    .await;

    let (id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.txt", test_key('a'), Some("text/plain".into())),
            ItemInput::content("/content/b.txt", test_key('b'), Some("text/plain".into())),
            ItemInput::content("/content/c.txt", test_key('c'), Some("text/plain".into())),
            ItemInput::content(
                "/content/repodata/repomd.xml",
                test_key('d'),
                Some("text/xml".into()),
            ),
            ItemInput::content("/content/listing", test_key('e'), Some("text/plain".into())),
        ])
        .await;

    let result = h.engine.run(&task).await.unwrap();
    assert_eq!(result["items_written"], 5);
    assert_eq!(result["deferred_items"], 2);
    assert_eq!(h.publish_state(id).await, "COMMITTED");

    // Every entrypoint lands after the last piece of ordinary content.
    let log = h.store.written_paths();
    assert_eq!(log.len(), 5);
    let last_ordinary = ["/content/a.txt", "/content/b.txt", "/content/c.txt"]
        .iter()
        .map(|p| log.iter().position(|l| l == p).unwrap())
        .max()
        .unwrap();
    let first_deferred = ["/content/listing", "/content/repodata/repomd.xml"]
        .iter()
        .map(|p| log.iter().position(|l| l == p).unwrap())
        .min()
        .unwrap();
    assert!(last_ordinary < first_deferred);

    // All entries of one commit share the payload's from_date.
    let payload: CommitPayload = serde_json::from_str(&task.payload).unwrap();
    for entry in h.store.snapshot("cdn-test-content") {
        assert_eq!(entry.from_date, payload.from_date);
    }
}

#[tokio::test]
#[serial]
async fn test_commit_resolves_links_to_target_content() {
    let h = harness().await;

    let (id, task) = h
        .queued_commit(vec![
            ItemInput::content(
                "/content/origin.rpm",
                test_key('a'),
                Some("application/x-rpm".into()),
            ),
            ItemInput::link("/content/alias.rpm", "/content/origin.rpm"),
        ])
        .await;

    h.engine.run(&task).await.unwrap();
    assert_eq!(h.publish_state(id).await, "COMMITTED");

    let now = Utc::now().naive_utc();
    let alias = h
        .store
        .get("cdn-test-content", "/content/alias.rpm", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alias.object_key, test_key('a'));
    assert_eq!(alias.content_type.as_deref(), Some("application/x-rpm"));
}

#[tokio::test]
#[serial]
async fn test_commit_rejects_dangling_link() {
    let h = harness().await;

    let (id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.rpm", test_key('a'), Some("text/plain".into())),
            ItemInput::link("/content/alias.rpm", "/content/missing.rpm"),
        ])
        .await;

    let err = h.engine.run(&task).await.unwrap_err();
    assert!(matches!(err, CommitError::UnresolvedLink { .. }));

    // Failing the publish is the worker's call, not the engine's.
    assert_eq!(h.publish_state(id).await, "COMMITTING");
    assert_eq!(h.store.entry_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_commit_rejects_link_to_link() {
    let h = harness().await;

    let (_id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.rpm", test_key('a'), Some("text/plain".into())),
            ItemInput::link("/content/first.rpm", "/content/a.rpm"),
            ItemInput::link("/content/second.rpm", "/content/first.rpm"),
        ])
        .await;

    let err = h.engine.run(&task).await.unwrap_err();
    assert!(matches!(
        err,
        CommitError::UnresolvedLink { web_uri, .. } if web_uri == "/content/second.rpm"
    ));
}

#[tokio::test]
#[serial]
async fn test_failed_phase_one_blocks_every_entrypoint_write() {
    let h = harness().await;

    let (id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.txt", test_key('a'), Some("text/plain".into())),
            ItemInput::content("/content/z.txt", test_key('b'), Some("text/plain".into())),
            ItemInput::content("/content/listing", test_key('c'), Some("text/plain".into())),
        ])
        .await;

    // One ordinary path hard-fails; the publish must fail with the
    // entrypoint never becoming visible.
    h.store
        .fail_path("/content/z.txt", StoreError::Permanent("rejected".into()), 100);

    let err = h.engine.run(&task).await.unwrap_err();
    assert!(matches!(
        err,
        CommitError::PhaseFailed { phase: "phase 1", .. }
    ));
    assert!(!h
        .store
        .written_paths()
        .iter()
        .any(|p| p == "/content/listing"));

    // The worker rejects the task and fails the publish.
    h.engine.fail_publish(&task).await;
    assert_eq!(h.publish_state(id).await, "FAILED");
}

#[tokio::test]
#[serial]
async fn test_commit_retries_transient_store_errors() {
    let h = harness().await;

    let (id, task) = h
        .queued_commit(vec![ItemInput::content(
            "/content/a.txt",
            test_key('a'),
            Some("text/plain".into()),
        )])
        .await;

    h.store
        .fail_path("/content/a.txt", StoreError::Transient("throttled".into()), 2);

    h.engine.run(&task).await.unwrap();
    assert_eq!(h.publish_state(id).await, "COMMITTED");
    // Two failed attempts plus the one that landed.
    assert!(h.store.write_attempts() >= 3);
}

#[tokio::test]
#[serial]
async fn test_commit_redo_produces_identical_snapshot() {
    let h = harness().await;

    let (id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.txt", test_key('a'), Some("text/plain".into())),
            ItemInput::content("/content/listing", test_key('b'), Some("text/plain".into())),
        ])
        .await;

    h.engine.run(&task).await.unwrap();
    let first = h.store.snapshot("cdn-test-content");

    // A requeued attempt reruns against a publish still in COMMITTING.
    assert!(h
        .dal
        .publish()
        .transition(id, PublishState::Committed, PublishState::Committing)
        .await
        .unwrap());

    h.engine.run(&task).await.unwrap();
    assert_eq!(h.store.snapshot("cdn-test-content"), first);
    assert_eq!(h.store.entry_count(), 2);
    assert_eq!(h.publish_state(id).await, "COMMITTED");
}

#[tokio::test]
#[serial]
async fn test_commit_of_empty_publish_completes_immediately() {
    let h = harness().await;

    let (id, task) = h.queued_commit(Vec::new()).await;

    let result = h.engine.run(&task).await.unwrap();
    assert_eq!(result["items_written"], 0);
    assert_eq!(h.publish_state(id).await, "COMMITTED");
    assert_eq!(h.store.entry_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_commit_refuses_publish_not_committing() {
    let h = harness().await;

    let publish = h.manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();

    // A commit task whose publish was never frozen: the task fails and the
    // publish is untouched.
    let payload = CommitPayload {
        publish_id: id,
        env: "test".to_string(),
        from_date: Utc::now().naive_utc(),
    };
    let task = h
        .dal
        .task()
        .enqueue(
            COMMIT_QUEUE,
            serde_json::to_string(&payload).unwrap(),
            2,
            None,
        )
        .await
        .unwrap();

    let err = h.engine.run(&task).await.unwrap_err();
    assert!(matches!(err, CommitError::WrongPublishState { .. }));
    assert_eq!(h.publish_state(id).await, "PENDING");

    // fail_publish only moves COMMITTING publishes.
    h.engine.fail_publish(&task).await;
    assert_eq!(h.publish_state(id).await, "PENDING");
}

#[tokio::test]
#[serial]
async fn test_commit_past_deadline_is_refused() {
    let h = harness().await;

    let publish = h.manager.create_publish("test").await.unwrap();
    let id: Uuid = publish.id.parse().unwrap();
    h.manager
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

    let now = Utc::now().naive_utc();
    let payload = CommitPayload {
        publish_id: id,
        env: "test".to_string(),
        from_date: now,
    };
    let task = h
        .dal
        .publish()
        .begin_commit(
            id,
            COMMIT_QUEUE,
            serde_json::to_string(&payload).unwrap(),
            2,
            now - ChronoDuration::hours(1),
            now,
        )
        .await
        .unwrap()
        .unwrap();

    let err = h.engine.run(&task).await.unwrap_err();
    assert!(matches!(err, CommitError::DeadlineExceeded { .. }));
    assert_eq!(h.store.entry_count(), 0);

    h.engine.fail_publish(&task).await;
    assert_eq!(h.publish_state(id).await, "FAILED");
}

#[tokio::test]
#[serial]
async fn test_commit_flushes_cache_for_written_paths() {
    let h = harness_with(
        test_settings_builder()
            .environment(test_environment_with_flush())
            .build(),
    )
    .await;

    let (_id, task) = h
        .queued_commit(vec![
            ItemInput::content("/content/a.rpm", test_key('a'), None),
            ItemInput::content("/content/listing", test_key('b'), None),
        ])
        .await;

    let result = h.engine.run(&task).await.unwrap();
    assert_eq!(result["flushed_urls"], 2);

    let submitted = h.purge.submitted();
    assert!(submitted.contains(&"https://cdn.example.com/content/a.rpm".to_string()));
    assert!(submitted.contains(&"https://cdn.example.com/content/listing".to_string()));
}

#[tokio::test]
#[serial]
async fn test_commit_without_flush_rules_skips_purging() {
    let h = harness().await;

    let (_id, task) = h
        .queued_commit(vec![ItemInput::content(
            "/content/a.rpm",
            test_key('a'),
            None,
        )])
        .await;

    let result = h.engine.run(&task).await.unwrap();
    assert_eq!(result["flushed_urls"], 0);
    assert_eq!(h.purge.call_count(), 0);
}
