//! Supervisor behavior: restart recovery, admission, reconciliation, and
//! the expiry sweep.

mod common;

use common::*;
use logship_common::cycle::CycleUnit;
use logship_common::now_millis;
use logship_common::store::StateStore;
use logship_common::types::{InstanceState, OffsetRecord};
use logship_agent::manager::{InstanceAction, InstanceManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn engine(
    store: Arc<logship_common::store::InMemoryStateStore>,
    instance_limit: usize,
) -> Arc<InstanceManager> {
    let budget = new_budget(1024 * 1024);
    let transport = GateTransport::open();
    let registry = build_registry(
        HashMap::new(),
        transport,
        budget,
        store.clone() as Arc<dyn StateStore>,
        fast_pipeline_config(),
    );
    InstanceManager::new(
        "t1",
        fast_manager_config(instance_limit),
        fast_instance_config(),
        store,
        registry,
    )
}

#[tokio::test]
async fn restart_reinstates_only_default_instances() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::Day))
        .await
        .unwrap();

    let mut default_profile = instance_profile("t1", "a.log");
    default_profile.set_state(InstanceState::Default, 100);
    store.store_instance(&default_profile).await.unwrap();

    let mut finished_profile = instance_profile("t1", "b.log");
    finished_profile.set_state(InstanceState::Finished, now_millis());
    store.store_instance(&finished_profile).await.unwrap();

    let mut deleted_profile = instance_profile("t1", "c.log");
    deleted_profile.set_state(InstanceState::Delete, now_millis());
    store.store_instance(&deleted_profile).await.unwrap();

    let manager = engine(store.clone(), 10);
    manager.clone().start().await.unwrap();

    wait_for("default instance reinstated", || {
        manager.instance_count() == 1
    })
    .await;
    assert!(manager.get_instance("a.log").is_some());
    assert!(manager.get_instance("b.log").is_none());
    assert!(manager.get_instance("c.log").is_none());

    // A few more ticks must not change the picture.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.instance_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn admission_cap_drops_excess_adds() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::Day))
        .await
        .unwrap();

    let manager = engine(store.clone(), 2);
    manager.clone().start().await.unwrap();

    assert!(manager.submit_action(InstanceAction::add(instance_profile("t1", "a.log"))));
    assert!(manager.submit_action(InstanceAction::add(instance_profile("t1", "b.log"))));
    assert!(manager.submit_action(InstanceAction::add(instance_profile("t1", "c.log"))));

    wait_for("two instances admitted", || manager.instance_count() == 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.instance_count(), 2);
    assert!(manager.is_full());

    // The dropped add never reached the store either.
    assert!(store.get_instance("t1", "c.log").await.unwrap().is_none());
    assert!(!manager.all_instances_finished().await.unwrap());

    manager.stop().await;
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::Day))
        .await
        .unwrap();

    let manager = engine(store.clone(), 10);
    manager.clone().start().await.unwrap();

    // A profile written behind the manager's back gets picked up.
    store
        .store_instance(&instance_profile("t1", "a.log"))
        .await
        .unwrap();
    wait_for("reconcile adds instance", || manager.instance_count() == 1).await;
    let first = manager.get_instance("a.log").unwrap();

    // With no external change, further passes must not churn the instance.
    sleep(Duration::from_millis(200)).await;
    let second = manager.get_instance("a.log").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.instance_count(), 1);

    // Marking the record finished drains it from memory.
    let mut finished = instance_profile("t1", "a.log");
    finished.set_state(InstanceState::Finished, now_millis());
    store.store_instance(&finished).await.unwrap();
    wait_for("reconcile removes instance", || {
        manager.instance_count() == 0
    })
    .await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.instance_count(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn expiry_sweep_removes_aged_finished_records() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::Day))
        .await
        .unwrap();

    let four_cycles_ago = now_millis() - 4 * 24 * 3600 * 1000;
    let mut expired = instance_profile("t1", "old.log");
    expired.set_state(InstanceState::Finished, four_cycles_ago);
    store.store_instance(&expired).await.unwrap();
    store
        .save_offset(OffsetRecord::new(
            "t1".into(),
            "old.log".into(),
            "99".into(),
            "65021".into(),
        ))
        .await
        .unwrap();

    let mut fresh = instance_profile("t1", "new.log");
    fresh.set_state(InstanceState::Finished, now_millis());
    store.store_instance(&fresh).await.unwrap();

    let manager = engine(store.clone(), 10);
    manager.clone().start().await.unwrap();

    let mut swept = false;
    for _ in 0..1000 {
        if store.get_instance("t1", "old.log").await.unwrap().is_none() {
            swept = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(swept, "expired record never swept");
    assert!(store.get_offset("t1", "old.log").await.unwrap().is_none());

    // Recently finished records stay.
    assert!(store.get_instance("t1", "new.log").await.unwrap().is_some());

    manager.stop().await;
}

#[tokio::test]
async fn realtime_tasks_are_never_swept() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::RealTime))
        .await
        .unwrap();

    let long_ago = now_millis() - 365 * 24 * 3600 * 1000;
    let mut finished = instance_profile("t1", "old.log");
    finished.set_state(InstanceState::Finished, long_ago);
    store.store_instance(&finished).await.unwrap();

    let manager = engine(store.clone(), 10);
    manager.clone().start().await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(store.get_instance("t1", "old.log").await.unwrap().is_some());

    manager.stop().await;
}

#[tokio::test]
async fn sled_backed_restart_resumes_from_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();

    // First run: persist a live profile and a checkpoint, then "crash".
    {
        let store = Arc::new(logship_common::store::SledStateStore::open(dir.path()).unwrap());
        store
            .store_task(&task_profile("t1", CycleUnit::Day))
            .await
            .unwrap();
        store
            .store_instance(&instance_profile("t1", "a.log"))
            .await
            .unwrap();
        store
            .save_offset(OffsetRecord::new(
                "t1".into(),
                "a.log".into(),
                "17".into(),
                "65021".into(),
            ))
            .await
            .unwrap();
    }

    // Second run: the manager reinstates the instance and the checkpoint
    // is still there for its source to resume from.
    let store = Arc::new(logship_common::store::SledStateStore::open(dir.path()).unwrap());
    let budget = new_budget(1024 * 1024);
    let transport = GateTransport::open();
    let registry = build_registry(
        HashMap::new(),
        transport,
        budget,
        store.clone() as Arc<dyn StateStore>,
        fast_pipeline_config(),
    );
    let manager = InstanceManager::new(
        "t1",
        fast_manager_config(10),
        fast_instance_config(),
        store.clone(),
        registry,
    );
    manager.clone().start().await.unwrap();

    wait_for("instance reinstated from sled", || {
        manager.instance_count() == 1
    })
    .await;
    let offset = store.get_offset("t1", "a.log").await.unwrap().unwrap();
    assert_eq!(offset.offset, "17");

    manager.stop().await;
}

#[tokio::test]
async fn should_add_again_follows_store_state() {
    let store = new_store();
    store
        .store_task(&task_profile("t1", CycleUnit::Day))
        .await
        .unwrap();
    let manager = engine(store.clone(), 10);

    // Unknown instance: add.
    assert!(manager.should_add_again("a.log", 600).await.unwrap());

    // Finished, and the file was updated afterwards: a new generation.
    let mut finished = instance_profile("t1", "a.log");
    finished.set_state(InstanceState::Finished, 500);
    store.store_instance(&finished).await.unwrap();
    assert!(manager.should_add_again("a.log", 600).await.unwrap());
    assert!(!manager.should_add_again("a.log", 400).await.unwrap());
    assert!(!manager.should_add_again("a.log", 500).await.unwrap());

    // Deleted: add again.
    let mut deleted = instance_profile("t1", "a.log");
    deleted.set_state(InstanceState::Delete, 500);
    store.store_instance(&deleted).await.unwrap();
    assert!(manager.should_add_again("a.log", 0).await.unwrap());

    // Still live: skip.
    let mut live = instance_profile("t1", "a.log");
    live.set_state(InstanceState::Default, 500);
    store.store_instance(&live).await.unwrap();
    assert!(!manager.should_add_again("a.log", 600).await.unwrap());
}
