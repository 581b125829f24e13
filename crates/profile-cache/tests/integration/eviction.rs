use std::time::Duration;

use profile_cache::caching::{ErrorDisposition, ProfileCacheError};
use profile_cache::coordination::InMemoryCoordination;
use profile_cache::types::{ViewKey, ViewKind};

use crate::{Storage, call_tree_builder, caches, profile_key, setup, start_cluster, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expiry_hands_over_ownership() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::from_millis(10));
    let nodes = start_cluster(
        &ensemble,
        2,
        &caches(10, Some(Duration::from_millis(200))),
        &storage,
    )
    .await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let key = profile_key("app1");

    assert!(matches!(
        a.get_profile(&key).await,
        Err(ProfileCacheError::LoadInProgress(_))
    ));
    a.wait_for_load(&key).await;
    let err = b.get_profile(&key).await.unwrap_err();
    assert_eq!(err.disposition(), ErrorDisposition::Redirect(a.addr.clone()));

    // once the profile expired on `a`, its record is gone and `b` may load it
    wait_until(Duration::from_secs(5), || async {
        a.store().run_pending_tasks();
        a.owner_of(&key).await.is_none()
    })
    .await;
    assert_eq!(a.recorded_load().await, 0);

    assert!(matches!(
        b.get_profile(&key).await,
        Err(ProfileCacheError::LoadInProgress(_))
    ));
    b.wait_for_load(&key).await;
    assert_eq!(b.get_profile(&key).await.unwrap().loaded_by, b.addr);
    assert_eq!(a.owner_of(&key).await, Some(b.addr.clone()));
    assert_eq!(b.recorded_load().await, 1);
    assert_eq!(storage.loads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eviction_cascades_to_views() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::ZERO);
    let nodes = start_cluster(&ensemble, 1, &caches(1, None), &storage).await;
    let node = &nodes[0];
    let p1 = profile_key("app1");
    let p2 = profile_key("app2");

    node.get_profile(&p1).await.unwrap_err();
    node.wait_for_load(&p1).await;
    for trace in ["t1", "t2"] {
        node.coordinator
            .get_call_tree_view(&p1, trace, call_tree_builder())
            .await
            .unwrap();
    }
    node.coordinator
        .get_callees_tree_view(&p1, "t1", call_tree_builder())
        .await
        .unwrap();
    assert_eq!(node.store().dependent_views(&p1).len(), 3);

    // the second profile pushes the first one out of the cache
    node.get_profile(&p2).await.unwrap_err();
    node.wait_for_load(&p2).await;
    wait_until(Duration::from_secs(5), || async {
        node.store().run_pending_tasks();
        node.owner_of(&p1).await.is_none()
    })
    .await;

    assert!(node.store().get(&p1).is_none());
    assert!(node.store().dependent_views(&p1).is_empty());
    let view_key = ViewKey::new(p1.clone(), ViewKind::CallTree, "t1");
    assert!(node.store().get_view(&view_key).is_none());
    node.store().run_pending_tasks();
    assert_eq!(node.store().view_count(), 0);
    assert_eq!(node.owner_of(&p2).await, Some(node.addr.clone()));
    assert_eq!(node.recorded_load().await, 1);

    // views of evicted profiles are not served, and do not trigger a load
    let err = node
        .coordinator
        .get_call_tree_view(&p1, "t1", call_tree_builder())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProfileCacheError::NotFoundLocally { owner: None }
    ));
    assert_eq!(storage.loads(), 2);
}
