use std::time::Duration;

use profile_cache::caching::{ErrorDisposition, ProfileCacheError};
use profile_cache::coordination::InMemoryCoordination;

use crate::{Storage, TestNode, call_tree_builder, caches, profile_key, setup, start_cluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_load_across_cluster() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::from_millis(100));
    let nodes = start_cluster(&ensemble, 3, &caches(10, None), &storage).await;
    let key = profile_key("app1");

    // every node asks for the profile at the same time
    let results = futures::future::join_all(nodes.iter().map(|node| node.get_profile(&key))).await;

    let mut in_progress = 0;
    let mut redirects = Vec::new();
    for result in results {
        match result.map_err(|e| e.disposition()) {
            Err(ErrorDisposition::Retry) => in_progress += 1,
            Err(ErrorDisposition::Redirect(owner)) => redirects.push(owner),
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert_eq!(in_progress, 1);
    assert_eq!(storage.loads(), 1);

    let owner = nodes
        .iter()
        .find(|node| node.store().get(&key).is_some())
        .unwrap();
    assert!(redirects.iter().all(|addr| *addr == owner.addr));

    owner.wait_for_load(&key).await;
    let profile = owner.get_profile(&key).await.unwrap();
    assert_eq!(profile.loaded_by, owner.addr);

    for node in &nodes {
        assert_eq!(node.owner_of(&key).await, Some(owner.addr.clone()));
        let expected = if node.addr == owner.addr { 1 } else { 0 };
        assert_eq!(node.recorded_load().await, expected);
        assert_eq!(node.store().get(&key).is_some(), node.addr == owner.addr);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_spread_over_nodes() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::from_millis(10));
    let nodes = start_cluster(&ensemble, 2, &caches(10, None), &storage).await;
    let keys: Vec<_> = (0..6).map(|i| profile_key(&format!("app{i}"))).collect();

    // alternate nodes, so that each one loads half of the profiles
    for (i, key) in keys.iter().enumerate() {
        let result = nodes[i % 2].get_profile(key).await;
        assert!(matches!(result, Err(ProfileCacheError::LoadInProgress(_))));
    }

    for (i, key) in keys.iter().enumerate() {
        let owner = &nodes[i % 2];
        let other = &nodes[(i + 1) % 2];
        owner.wait_for_load(key).await;

        let err = other.get_profile(key).await.unwrap_err();
        assert_eq!(err.disposition(), ErrorDisposition::Redirect(owner.addr.clone()));

        let (samples, view) = owner
            .coordinator
            .get_call_tree_view(key, "t1", call_tree_builder())
            .await
            .unwrap();
        assert_eq!(samples, Some(10));
        assert_eq!(view.app, key.app);
    }

    assert_eq!(storage.loads(), 6);
    for node in &nodes {
        assert_eq!(node.recorded_load().await, 3);
    }
}

#[tokio::test]
async fn test_first_node_creates_namespace() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::ZERO);
    let first = TestNode::start(&ensemble, 3456, &caches(10, None), &storage).await;

    // setting up again finds the namespace in place
    let backend = first.coordinator.backend();
    assert!(!backend.ensure_base_paths_exist().await.unwrap());
    assert!(ensemble.stat("/profile-cache/nodesInfo/127.0.0.1:3456").is_some());

    let second = TestNode::start(&ensemble, 3457, &caches(10, None), &storage).await;
    assert!(second.coordinator.backend().node_info_exists().await.unwrap());
    assert_eq!(ensemble.children("/profile-cache/nodesInfo").len(), 2);
}
