use std::time::Duration;

use profile_cache::caching::{ErrorDisposition, ProfileCacheError};
use profile_cache::coordination::{ConnectionState, CoordinationService, InMemoryCoordination};

use crate::{Storage, caches, profile_key, setup, start_cluster, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspension_keeps_records() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::ZERO);
    let nodes = start_cluster(&ensemble, 2, &caches(10, None), &storage).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let key = profile_key("app1");

    a.get_profile(&key).await.unwrap_err();
    a.wait_for_load(&key).await;

    a.client.suspend();
    a.wait_for_state(ConnectionState::Disconnected).await;

    // the session survives, so other nodes keep redirecting to `a`
    let err = b.get_profile(&key).await.unwrap_err();
    assert_eq!(err.disposition(), ErrorDisposition::Redirect(a.addr.clone()));
    // and `a` keeps serving what it holds
    a.get_profile(&key).await.unwrap();
    assert!(matches!(
        a.get_profile(&profile_key("app2")).await,
        Err(ProfileCacheError::CoordinationUnavailable)
    ));

    a.client.resume();
    a.wait_for_state(ConnectionState::Connected).await;
    assert!(a.coordinator.backend().last_session_loss().is_none());
    assert_eq!(a.recorded_load().await, 1);
    assert_eq!(storage.loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_loss_resolves_conflicts() {
    setup();
    let ensemble = InMemoryCoordination::new();
    let storage = Storage::new(Duration::ZERO);
    let nodes = start_cluster(&ensemble, 2, &caches(10, None), &storage).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let p1 = profile_key("app1");
    let p2 = profile_key("app2");

    for key in [&p1, &p2] {
        a.get_profile(key).await.unwrap_err();
        a.wait_for_load(key).await;
    }
    assert_eq!(a.recorded_load().await, 2);

    // all records of `a` vanish with its session
    a.client.expire_session();
    a.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(b.owner_of(&p1).await, None);
    assert!(
        ensemble
            .stat(&a.coordinator.backend().paths().node(&a.addr))
            .is_none()
    );

    // meanwhile, `b` takes over one of the profiles
    b.get_profile(&p1).await.unwrap_err();
    b.wait_for_load(&p1).await;

    a.client.reconnect();
    a.wait_for_state(ConnectionState::Connected).await;
    assert!(a.coordinator.backend().last_session_loss().is_some());

    // `a` gives up its copy of the profile now owned by `b`, and restores the other record
    wait_until(Duration::from_secs(5), || async {
        a.store().run_pending_tasks();
        a.store().get(&p1).is_none() && a.recorded_load().await == 1
    })
    .await;
    assert_eq!(a.owner_of(&p1).await, Some(b.addr.clone()));
    assert_eq!(a.owner_of(&p2).await, Some(a.addr.clone()));

    let record = a.coordinator.backend().paths().profile(&p2);
    assert_eq!(
        ensemble.stat(&record).unwrap().ephemeral_owner,
        a.client.session_id()
    );

    let err = a.get_profile(&p1).await.unwrap_err();
    assert_eq!(err.disposition(), ErrorDisposition::Redirect(b.addr.clone()));
    a.get_profile(&p2).await.unwrap();
    assert_eq!(storage.loads(), 3);
}
