use tasksync::runtime::{InMemoryReplicaStore, ReplicaStore};
use tasksync::sync::integrity::Integrity;
use tasksync::sync::reconcile::{Reconciler, Role};
use std::sync::Arc;
use serde_json::{json, Value};

async fn reconciler_with(node_id: &str, stored: Value) -> Reconciler {
    let store = Arc::new(InMemoryReplicaStore::new());
    store.set("t1", stored).await.expect("seed store");
    Reconciler::new(node_id, store)
}

fn update_from(source: &str, message_id: u64, body: Value) -> Value {
    let mut update = body;
    update["instanceId"] = json!("t1");
    update["node"] = json!({ "command": "update", "sourceNodeId": source });
    update["meta"]["messageId"] = json!(message_id);
    update
}

#[tokio::test]
async fn test_bystander_takes_the_whole_diff() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 } });
    let reconciler = reconciler_with("node-a", stored.clone()).await;

    let update = update_from("node-b", 10, json!({ "input": { "a": 2 }, "output": { "text": "x" } }));
    let r = reconciler
        .apply_update("t1", &stored, &update)
        .await
        .expect("applied")
        .expect("not stale");

    assert_eq!(r.role, Role::Bystander);
    assert_eq!(r.live["input"]["a"], json!(2));
    assert_eq!(r.live["output"]["text"], json!("x"));
    assert_eq!(r.integrity, Integrity::Unverifiable);

    let persisted = reconciler.store().get("t1").await.expect("get").expect("stored");
    assert_eq!(persisted["input"]["a"], json!(2));
    assert!(persisted["meta"]["hash"].is_u64());
}

#[tokio::test]
async fn test_source_echo_keeps_local_edits_and_clears_pending() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 } });
    let live = json!({
        "instanceId": "t1",
        "input": { "a": 3 },
        "node": { "commandPending": "update" }
    });
    let reconciler = reconciler_with("node-a", stored).await;

    let echo = update_from("node-a", 11, json!({ "input": { "a": 2 } }));
    let r = reconciler
        .apply_update("t1", &live, &echo)
        .await
        .expect("applied")
        .expect("not stale");

    assert_eq!(r.role, Role::Source);
    assert!(r.confirmed);
    // The user kept typing; the echo must not roll that back
    assert_eq!(r.live["input"]["a"], json!(3));
    assert!(r.live["node"].get("commandPending").is_none());
    assert_eq!(r.live["meta"]["messageId"], json!(11));
    // The replica still records what the hub accepted
    assert_eq!(r.stored["input"]["a"], json!(2));
}

#[tokio::test]
async fn test_pending_survives_foreign_updates() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 } });
    let live = json!({ "instanceId": "t1", "input": { "a": 1 }, "node": { "commandPending": "update" } });
    let reconciler = reconciler_with("node-a", stored).await;

    let update = update_from("node-b", 5, json!({ "output": { "text": "hi" } }));
    let r = reconciler
        .apply_update("t1", &live, &update)
        .await
        .expect("applied")
        .expect("not stale");
    assert!(!r.confirmed);
    assert_eq!(r.live["node"]["commandPending"], json!("update"));
}

#[tokio::test]
async fn test_lock_holder_ignores_foreign_input() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 }, "meta": { "locked": "node-a" } });
    let reconciler = reconciler_with("node-a", stored.clone()).await;

    let mut update = update_from("node-b", 7, json!({ "input": { "a": 9 }, "output": { "text": "bypassed" } }));
    update["node"]["commandArgs"] = json!({ "lockBypass": true });
    let r = reconciler
        .apply_update("t1", &stored, &update)
        .await
        .expect("applied")
        .expect("not stale");

    assert_eq!(r.role, Role::LockHolder);
    assert_eq!(r.live["input"]["a"], json!(1));
    assert_eq!(r.live["output"]["text"], json!("bypassed"));
}

#[tokio::test]
async fn test_output_is_frozen_for_non_holders_while_locked() {
    let stored = json!({
        "instanceId": "t1",
        "output": { "text": "from holder" },
        "meta": { "locked": "node-c" }
    });
    let reconciler = reconciler_with("node-a", stored.clone()).await;

    // node-b is neither source of truth nor lock holder
    let intruder = update_from("node-b", 1, json!({ "output": { "text": "intruder" }, "input": { "b": 1 } }));
    let r = reconciler
        .apply_update("t1", &stored, &intruder)
        .await
        .expect("applied")
        .expect("not stale");
    assert_eq!(r.live["output"]["text"], json!("from holder"));
    assert_eq!(r.stored["output"]["text"], json!("from holder"));
    assert_eq!(r.live["input"]["b"], json!(1));

    // The holder itself may write output
    let holder = update_from("node-c", 2, json!({ "output": { "text": "final" } }));
    let r = reconciler
        .apply_update("t1", &r.live, &holder)
        .await
        .expect("applied")
        .expect("not stale");
    assert_eq!(r.live["output"]["text"], json!("final"));
}

#[tokio::test]
async fn test_stale_updates_are_dropped_per_source() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 } });
    let reconciler = reconciler_with("node-a", stored.clone()).await;

    let newer = update_from("node-b", 20, json!({ "input": { "a": 2 } }));
    let older = update_from("node-b", 19, json!({ "input": { "a": 0 } }));
    assert!(reconciler.apply_update("t1", &stored, &newer).await.expect("ok").is_some());
    assert!(reconciler.apply_update("t1", &stored, &older).await.expect("ok").is_none());
    assert!(reconciler.apply_update("t1", &stored, &newer).await.expect("ok").is_none());

    // Another source has its own sequence
    let other = update_from("node-c", 1, json!({ "input": { "a": 5 } }));
    assert!(reconciler.apply_update("t1", &stored, &other).await.expect("ok").is_some());

    // After eviction the bookkeeping starts over
    reconciler.forget("t1");
    assert!(reconciler.apply_update("t1", &stored, &older).await.expect("ok").is_some());
}

#[tokio::test]
async fn test_sync_replaces_targeted_fields_wholesale() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1, "b": 2 } });
    let live = json!({ "instanceId": "t1", "input": { "a": 1, "b": 2, "draft": "x" } });
    let reconciler = reconciler_with("node-a", stored).await;

    let mut update = update_from("node-b", 3, json!({ "input": { "a": 5, "b": 2 } }));
    update["node"]["commandArgs"] = json!({ "sync": true });
    update["meta"]["hashDiff"] = json!(12345);
    let r = reconciler
        .apply_update("t1", &live, &update)
        .await
        .expect("applied")
        .expect("not stale");

    assert_eq!(r.role, Role::Sync);
    assert_eq!(r.integrity, Integrity::Unverifiable);
    assert_eq!(r.live["input"], json!({ "a": 5, "b": 2 }));
}

#[tokio::test]
async fn test_divergent_hash_is_reported_but_applied() {
    let stored = json!({ "instanceId": "t1", "input": { "a": 1 } });
    let reconciler = reconciler_with("node-a", stored.clone()).await;

    let mut update = update_from("node-b", 3, json!({ "input": { "a": 2 } }));
    update["meta"]["hashDiff"] = json!(1);
    let r = reconciler
        .apply_update("t1", &stored, &update)
        .await
        .expect("applied")
        .expect("not stale");
    assert!(r.integrity.is_diverged());
    assert_eq!(r.live["input"]["a"], json!(2));
}
