use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use profile_cache::caching::{
    CacheCoordinator, Cacheable, LoadError, LocalStore, Profile, ProfileCacheError, ProfileLoader,
    ViewBuilder,
};
use profile_cache::config::{CacheConfigs, CoordinationConfig, ProfileCacheConfig, RetryConfig};
use profile_cache::coordination::{
    ConnectionState, CoordinationBackend, InMemoryClient, InMemoryCoordination,
};
use profile_cache::types::{NodeAddr, ProfileKey};

pub use profile_cache_test::{setup, wait_until};

/// An aggregated profile, remembering which node loaded it.
#[derive(Debug)]
pub struct AggregatedProfile {
    pub app: String,
    pub loaded_by: NodeAddr,
    pub traces: Vec<(String, usize)>,
}

impl Cacheable for AggregatedProfile {}

impl Profile for AggregatedProfile {
    /// The number of samples of the trace.
    type SampleContext = usize;

    fn sample_context(&self, trace: &str) -> Option<usize> {
        self.traces
            .iter()
            .find(|(name, _)| name == trace)
            .map(|(_, samples)| *samples)
    }
}

#[derive(Debug)]
pub struct CallTree {
    pub app: String,
    pub trace: String,
}

impl Cacheable for CallTree {}

pub type Coordinator = CacheCoordinator<AggregatedProfile, CallTree>;

/// Counts loads across all nodes of a cluster.
#[derive(Debug)]
pub struct Storage {
    loads: AtomicUsize,
    latency: Duration,
}

impl Storage {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            latency,
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

struct NodeLoader {
    storage: Arc<Storage>,
    node: NodeAddr,
}

#[async_trait]
impl ProfileLoader<AggregatedProfile> for NodeLoader {
    async fn load(&self, key: &ProfileKey) -> Result<AggregatedProfile, LoadError> {
        self.storage.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.storage.latency).await;
        Ok(AggregatedProfile {
            app: key.app.clone(),
            loaded_by: self.node.clone(),
            traces: vec![("t1".into(), 10), ("t2".into(), 5)],
        })
    }
}

pub fn call_tree_builder() -> Arc<dyn ViewBuilder<AggregatedProfile, CallTree>> {
    Arc::new(|profile: &AggregatedProfile, trace: &str| CallTree {
        app: profile.app.clone(),
        trace: trace.into(),
    })
}

/// A CPU profile of `app`, parsed from its string form.
pub fn profile_key(app: &str) -> ProfileKey {
    let key: ProfileKey = "profiles/v0001/MFYHA===/MNWHK43UMVZDC===/OBZG6YZR/2017-01-20T12:37:20.551+05:30/1500/cpu_sample_work"
        .parse()
        .unwrap();
    ProfileKey {
        app: app.into(),
        ..key
    }
}

pub fn coordination_config() -> CoordinationConfig {
    CoordinationConfig {
        operation_timeout: Duration::from_secs(1),
        lock_timeout: Duration::from_secs(1),
        retry: RetryConfig {
            base_delay: Duration::from_millis(10),
            max_retries: 3,
            max_delay: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

pub fn caches(max_profiles: u64, idle: Option<Duration>) -> CacheConfigs {
    CacheConfigs {
        profiles: ProfileCacheConfig {
            max_weight: max_profiles,
            max_unused_for: idle,
        },
        ..Default::default()
    }
}

/// A query node taking part in a cluster.
pub struct TestNode {
    pub addr: NodeAddr,
    pub client: Arc<InMemoryClient>,
    pub coordinator: Coordinator,
    loader: Arc<NodeLoader>,
}

impl TestNode {
    pub async fn start(
        ensemble: &InMemoryCoordination,
        port: u16,
        caches: &CacheConfigs,
        storage: &Arc<Storage>,
    ) -> Self {
        let addr = NodeAddr::new("127.0.0.1", port);
        let client = ensemble.connect();
        let backend =
            CoordinationBackend::new(client.clone(), addr.clone(), coordination_config());
        let store = Arc::new(LocalStore::new(caches));
        let coordinator =
            CacheCoordinator::new(store, backend, tokio::runtime::Handle::current()).unwrap();
        coordinator.start().await.unwrap();

        let loader = Arc::new(NodeLoader {
            storage: Arc::clone(storage),
            node: addr.clone(),
        });
        Self {
            addr,
            client,
            coordinator,
            loader,
        }
    }

    pub async fn get_profile(
        &self,
        key: &ProfileKey,
    ) -> Result<Arc<AggregatedProfile>, ProfileCacheError> {
        self.coordinator.get_profile(key, self.loader.clone()).await
    }

    pub fn store(&self) -> &LocalStore<AggregatedProfile, CallTree> {
        self.coordinator.store()
    }

    /// Waits until the profile is loaded, or its load failed.
    pub async fn wait_for_load(&self, key: &ProfileKey) {
        wait_until(Duration::from_secs(5), || async {
            self.store()
                .get(key)
                .is_some_and(|handle| handle.is_complete())
        })
        .await;
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        wait_until(Duration::from_secs(5), || async {
            self.coordinator.backend().state() == state
        })
        .await;
    }

    /// The owner of a profile according to the coordination service.
    pub async fn owner_of(&self, key: &ProfileKey) -> Option<NodeAddr> {
        let backend = self.coordinator.backend();
        let lock = backend.lock().await.unwrap();
        backend
            .read_residency(&lock, key)
            .await
            .unwrap()
            .map(|residency| residency.record.owner())
    }

    /// The number of profiles this node is recorded to hold.
    pub async fn recorded_load(&self) -> i64 {
        self.coordinator
            .backend()
            .read_node_load(&self.addr)
            .await
            .unwrap()
            .map(|load| load.profiles_loaded)
            .unwrap_or_default()
    }
}

/// Starts `count` nodes on consecutive ports.
pub async fn start_cluster(
    ensemble: &InMemoryCoordination,
    count: u16,
    caches: &CacheConfigs,
    storage: &Arc<Storage>,
) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for port in 3456..3456 + count {
        nodes.push(TestNode::start(ensemble, port, caches, storage).await);
    }
    nodes
}
