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

//! Task queue tests: claim ordering and exclusivity, attempt accounting,
//! dead-worker recovery and deadline expiry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serial_test::serial;
use tokio::sync::Barrier;

use sluice::dal::DAL;
use sluice::database::Database;
use sluice::models::task::{TaskState, COMMIT_QUEUE, FLUSH_QUEUE};

use crate::fixtures::get_or_init_fixture;

async fn fresh() -> (DAL, Database) {
    let fixture = get_or_init_fixture().await;
    let mut guard = fixture.lock().unwrap_or_else(|e| e.into_inner());
    guard.reset_database().await;
    let database = guard.get_database();
    drop(guard);
    (DAL::new(database.clone()), database)
}

fn far_expiry() -> chrono::NaiveDateTime {
    Utc::now().naive_utc() + ChronoDuration::hours(1)
}

#[tokio::test]
#[serial]
async fn test_claim_takes_oldest_queued_task() {
    let (dal, _db) = fresh().await;

    let first = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();
    // Distinct mtimes decide the claim order.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = dal
        .task()
        .enqueue(FLUSH_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();

    let claimed = dal.task().claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.state, "consumed");
    assert_eq!(claimed.consumer_id.as_deref(), Some("worker-a"));

    let claimed = dal.task().claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);

    assert!(dal.task().claim("worker-a").await.unwrap().is_none());
}

/// Spawns many claimants against a shared queue and verifies no task is
/// handed to more than one of them.
#[tokio::test]
#[serial]
async fn test_concurrent_claiming_no_duplicates() {
    let (dal, database) = fresh().await;

    const NUM_TASKS: usize = 12;
    let mut created_ids = Vec::new();
    for _ in 0..NUM_TASKS {
        let task = dal
            .task()
            .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
            .await
            .unwrap();
        created_ids.push(task.id);
    }

    const NUM_WORKERS: usize = 6;
    let barrier = Arc::new(Barrier::new(NUM_WORKERS));
    let mut handles = Vec::new();

    for worker_id in 0..NUM_WORKERS {
        let db_clone = database.clone();
        let barrier_clone = barrier.clone();

        handles.push(tokio::spawn(async move {
            let dal = DAL::new(db_clone);
            let consumer = format!("worker-{}", worker_id);

            // All claimants start at once.
            barrier_clone.wait().await;

            let mut claimed = Vec::new();
            for _ in 0..NUM_TASKS {
                match dal.task().claim(&consumer).await {
                    Ok(Some(task)) => claimed.push(task.id),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Worker {} claim error: {:?}", worker_id, e);
                    }
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.expect("claimant panicked"));
    }

    let unique: HashSet<_> = all_claimed.iter().collect();
    assert_eq!(
        all_claimed.len(),
        unique.len(),
        "a task was claimed by more than one worker: {} claims over {} tasks",
        all_claimed.len(),
        unique.len()
    );
    assert_eq!(unique.len(), NUM_TASKS, "every queued task should be claimed");

    let created: HashSet<_> = created_ids.iter().collect();
    for id in &all_claimed {
        assert!(created.contains(id));
    }
}

#[tokio::test]
#[serial]
async fn test_requeue_accounts_attempts_until_rejection() {
    let (dal, _db) = fresh().await;

    let task = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 2, None)
        .await
        .unwrap();

    dal.task().claim("worker-a").await.unwrap().unwrap();
    let state = dal
        .task()
        .requeue_or_reject(&task.id, Some(r#"{"error":"boom"}"#.to_string()), far_expiry())
        .await
        .unwrap();
    assert_eq!(state, TaskState::Queued);

    let reloaded = dal.task().get(task.id.parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(reloaded.state, "queued");
    assert_eq!(reloaded.attempt, 1);
    assert!(reloaded.consumer_id.is_none());

    // Second failure exhausts the budget.
    dal.task().claim("worker-b").await.unwrap().unwrap();
    let state = dal
        .task()
        .requeue_or_reject(&task.id, Some(r#"{"error":"boom"}"#.to_string()), far_expiry())
        .await
        .unwrap();
    assert_eq!(state, TaskState::Rejected);

    let reloaded = dal.task().get(task.id.parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(reloaded.state, "rejected");
    assert_eq!(reloaded.result.as_deref(), Some(r#"{"error":"boom"}"#));
    assert!(reloaded.result_expiry.is_some());
}

#[tokio::test]
#[serial]
async fn test_mark_done_records_result() {
    let (dal, _db) = fresh().await;

    let task = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();
    dal.task().claim("worker-a").await.unwrap().unwrap();

    let expiry = far_expiry();
    dal.task()
        .mark_done(&task.id, Some(r#"{"items_written":5}"#.to_string()), expiry)
        .await
        .unwrap();

    let reloaded = dal.task().get(task.id.parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(reloaded.state, "done");
    assert_eq!(reloaded.result.as_deref(), Some(r#"{"items_written":5}"#));
    // Backends round timestamps differently, so compare coarsely.
    let stored = reloaded.result_expiry.unwrap();
    assert!((stored - expiry).num_seconds().abs() <= 1);
}

#[tokio::test]
#[serial]
async fn test_reclaim_lost_spares_live_workers() {
    let (dal, _db) = fresh().await;

    let now = Utc::now().naive_utc();
    dal.worker().heartbeat("alive", now).await.unwrap();

    let lost_task = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let held_task = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();

    // "ghost" never heartbeats, so its claim is orphaned.
    dal.task().claim("ghost").await.unwrap().unwrap();
    dal.task().claim("alive").await.unwrap().unwrap();

    let cutoff = now - ChronoDuration::seconds(1);
    let (requeued, rejected) = dal.task().reclaim_lost(cutoff, far_expiry()).await.unwrap();
    assert_eq!(requeued, vec![lost_task.id.clone()]);
    assert!(rejected.is_empty());

    let reloaded = dal
        .task()
        .get(lost_task.id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.state, "queued");
    assert_eq!(reloaded.attempt, 1);
    assert!(reloaded.consumer_id.is_none());

    let untouched = dal
        .task()
        .get(held_task.id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.state, "consumed");
    assert_eq!(untouched.consumer_id.as_deref(), Some("alive"));
}

#[tokio::test]
#[serial]
async fn test_reclaim_lost_rejects_task_out_of_attempts() {
    let (dal, _db) = fresh().await;

    let task = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 1, None)
        .await
        .unwrap();
    dal.task().claim("ghost").await.unwrap().unwrap();

    let cutoff = Utc::now().naive_utc();
    let (requeued, rejected) = dal.task().reclaim_lost(cutoff, far_expiry()).await.unwrap();
    assert!(requeued.is_empty());
    assert_eq!(rejected, vec![task.id.clone()]);

    let reloaded = dal.task().get(task.id.parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(reloaded.state, "rejected");
    assert_eq!(reloaded.result.as_deref(), Some(r#"{"error":"worker lost"}"#));
}

#[tokio::test]
#[serial]
async fn test_expire_deadlines_rejects_overdue_tasks_only() {
    let (dal, _db) = fresh().await;

    let now = Utc::now().naive_utc();
    let overdue_queued = dal
        .task()
        .enqueue(
            COMMIT_QUEUE,
            "{}".to_string(),
            3,
            Some(now - ChronoDuration::minutes(5)),
        )
        .await
        .unwrap();
    let overdue_consumed = dal
        .task()
        .enqueue(
            FLUSH_QUEUE,
            "{}".to_string(),
            3,
            Some(now - ChronoDuration::minutes(5)),
        )
        .await
        .unwrap();
    let with_time_left = dal
        .task()
        .enqueue(
            COMMIT_QUEUE,
            "{}".to_string(),
            3,
            Some(now + ChronoDuration::hours(1)),
        )
        .await
        .unwrap();
    let unbounded = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();

    // An overdue task already picked up by a worker expires too.
    let claimed = dal.task().claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, overdue_queued.id);
    let claimed = dal.task().claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, overdue_consumed.id);

    let expired = dal.task().expire_deadlines(now, far_expiry()).await.unwrap();
    let expired_ids: HashSet<_> = expired.iter().map(|t| t.id.clone()).collect();
    assert_eq!(
        expired_ids,
        HashSet::from([overdue_queued.id.clone(), overdue_consumed.id.clone()])
    );

    for id in [&overdue_queued.id, &overdue_consumed.id] {
        let reloaded = dal.task().get(id.parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(reloaded.state, "rejected");
        assert_eq!(
            reloaded.result.as_deref(),
            Some(r#"{"error":"deadline exceeded"}"#)
        );
    }

    for id in [&with_time_left.id, &unbounded.id] {
        let reloaded = dal.task().get(id.parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(reloaded.state, "queued");
    }
}

#[tokio::test]
#[serial]
async fn test_delete_expired_reaps_only_stale_results() {
    let (dal, _db) = fresh().await;

    let now = Utc::now().naive_utc();
    let stale = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let kept = dal
        .task()
        .enqueue(COMMIT_QUEUE, "{}".to_string(), 3, None)
        .await
        .unwrap();

    dal.task().claim("worker-a").await.unwrap().unwrap();
    dal.task()
        .mark_done(&stale.id, None, now - ChronoDuration::minutes(1))
        .await
        .unwrap();
    dal.task().claim("worker-a").await.unwrap().unwrap();
    dal.task().mark_done(&kept.id, None, far_expiry()).await.unwrap();

    let deleted = dal.task().delete_expired(now).await.unwrap();
    assert_eq!(deleted, 1);

    assert!(dal.task().get(stale.id.parse().unwrap()).await.unwrap().is_none());
    assert!(dal.task().get(kept.id.parse().unwrap()).await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn test_worker_heartbeat_upserts_and_stale_delete() {
    let (dal, _db) = fresh().await;

    let early = Utc::now().naive_utc() - ChronoDuration::minutes(10);
    dal.worker().heartbeat("w1", early).await.unwrap();
    dal.worker().heartbeat("w2", early).await.unwrap();

    // A later heartbeat updates the row in place.
    let now = Utc::now().naive_utc();
    dal.worker().heartbeat("w1", now).await.unwrap();

    let workers = dal.worker().list().await.unwrap();
    assert_eq!(workers.len(), 2);
    let w1 = workers.iter().find(|w| w.id == "w1").unwrap();
    assert!(w1.last_alive > early);

    let removed = dal
        .worker()
        .delete_stale(now - ChronoDuration::minutes(5))
        .await
        .unwrap();
    assert_eq!(removed, vec!["w2".to_string()]);

    dal.worker().deregister("w1").await.unwrap();
    assert!(dal.worker().list().await.unwrap().is_empty());
}
