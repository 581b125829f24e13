use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use profile_cache::caching::{
    CacheCoordinator, Cacheable, ErrorDisposition, LoadError, Profile, ProfileCacheError,
    ProfileLoader, ViewBuilder,
};
use profile_cache::config::Config;
use profile_cache::coordination::{InMemoryClient, InMemoryCoordination};
use profile_cache::types::{NodeAddr, ProfileKey};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of query nodes sharing one coordination ensemble.
    #[serde(default = "default_nodes")]
    pub nodes: u16,
    /// Concurrent requests per node.
    pub concurrency: usize,
    /// Number of distinct profiles requested.
    pub profiles: usize,
    /// How long loading a profile takes.
    #[serde(default, with = "humantime_serde")]
    pub load_latency: Duration,
    /// Utilization weight of every loaded profile.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Share of requests asking for a call tree instead of the profile.
    #[serde(default)]
    pub view_ratio: f64,
    /// Expires the session of a random node at this interval.
    #[serde(default, with = "humantime_serde")]
    pub chaos_interval: Option<Duration>,
}

fn default_nodes() -> u16 {
    3
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug)]
pub struct SimulatedProfile {
    app: String,
    weight: u32,
}

impl Cacheable for SimulatedProfile {
    fn utilization_weight(&self) -> u32 {
        self.weight
    }
}

impl Profile for SimulatedProfile {
    type SampleContext = String;

    fn sample_context(&self, trace: &str) -> Option<String> {
        Some(format!("{}:{trace}", self.app))
    }
}

#[derive(Debug)]
pub struct SimulatedView {
    _app: String,
}

impl Cacheable for SimulatedView {}

type Coordinator = CacheCoordinator<SimulatedProfile, SimulatedView>;

/// Stands in for the blob storage all nodes load profiles from.
#[derive(Debug)]
struct SimulatedStorage {
    latency: Duration,
    weight: u32,
    loads: AtomicUsize,
}

#[async_trait]
impl ProfileLoader<SimulatedProfile> for SimulatedStorage {
    async fn load(&self, key: &ProfileKey) -> Result<SimulatedProfile, LoadError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            // +/- 50% jitter
            let factor = rand::rng().random_range(0.5..1.5);
            tokio::time::sleep(self.latency.mul_f64(factor)).await;
        }
        Ok(SimulatedProfile {
            app: key.app.clone(),
            weight: self.weight,
        })
    }
}

/// Counts the outcomes of requests, including every hop and retry.
#[derive(Debug, Default)]
pub struct Counters {
    pub served: AtomicUsize,
    pub redirects: AtomicUsize,
    pub in_progress: AtomicUsize,
    pub unavailable: AtomicUsize,
    pub failed: AtomicUsize,
    pub gave_up: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

struct SimulatedNode {
    addr: NodeAddr,
    client: Arc<InMemoryClient>,
    coordinator: Coordinator,
}

/// A cluster of query nodes in this process, sharing one coordination ensemble.
pub struct Cluster {
    nodes: Vec<SimulatedNode>,
    keys: Vec<ProfileKey>,
    storage: Arc<SimulatedStorage>,
    view_builder: Arc<dyn ViewBuilder<SimulatedProfile, SimulatedView>>,
    view_ratio: f64,
    pub counters: Counters,
}

const MAX_ATTEMPTS: u32 = 20;

/// The address of the `index`th simulated node, counting ports up from the configured node.
fn node_addr(base: &NodeAddr, index: u16) -> Result<NodeAddr> {
    let port = base
        .port
        .checked_add(index)
        .with_context(|| format!("node {index} exceeds the port range starting at {base}"))?;
    Ok(NodeAddr::new(base.ip.clone(), port))
}

impl Cluster {
    pub async fn start(config: &Config, workload: &Workload, index: usize) -> Result<Self> {
        let ensemble =
            InMemoryCoordination::with_session_timeout(config.coordination.session_timeout);
        let runtime = tokio::runtime::Handle::current();

        let mut nodes = Vec::with_capacity(workload.nodes as usize);
        for i in 0..workload.nodes {
            let mut node_config = config.clone();
            node_config.node = node_addr(&config.node, i)?;
            let client = ensemble.connect();
            let coordinator =
                CacheCoordinator::create(&node_config, client.clone(), runtime.clone())
                    .await
                    .with_context(|| format!("failed to start node {}", node_config.node))?;
            nodes.push(SimulatedNode {
                addr: node_config.node,
                client,
                coordinator,
            });
        }
        anyhow::ensure!(!nodes.is_empty(), "workload {index} has no nodes");

        let template: ProfileKey = "profiles/v0001/MFYHA===/MNWHK43UMVZDC===/OBZG6YZR/2017-01-20T12:37:20.551+05:30/1500/cpu_sample_work"
            .parse()
            .context("invalid profile key template")?;
        let keys = (0..workload.profiles)
            .map(|i| ProfileKey {
                app: format!("workload{index}-app{i}"),
                ..template.clone()
            })
            .collect();

        let view_builder: Arc<dyn ViewBuilder<SimulatedProfile, SimulatedView>> =
            Arc::new(|profile: &SimulatedProfile, _trace: &str| SimulatedView {
                _app: profile.app.clone(),
            });

        Ok(Self {
            nodes,
            keys,
            storage: Arc::new(SimulatedStorage {
                latency: workload.load_latency,
                weight: workload.weight,
                loads: AtomicUsize::new(0),
            }),
            view_builder,
            view_ratio: workload.view_ratio.clamp(0.0, 1.0),
            counters: Counters::default(),
        })
    }

    pub fn loads(&self) -> usize {
        self.storage.loads.load(Ordering::Relaxed)
    }

    /// Requests a random profile from a random node, following redirects and retrying loads
    /// in progress until the request is served.
    pub async fn process_request(&self) {
        let (mut node, key, wants_view) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..self.nodes.len()),
                rng.random_range(0..self.keys.len().max(1)),
                rng.random_bool(self.view_ratio),
            )
        };
        let Some(key) = self.keys.get(key) else {
            return;
        };

        let mut backoff = Duration::from_millis(5);
        for _ in 0..MAX_ATTEMPTS {
            let coordinator = &self.nodes[node].coordinator;
            let result = if wants_view {
                match coordinator
                    .get_call_tree_view(key, "main", self.view_builder.clone())
                    .await
                {
                    Ok(_) => Ok(()),
                    // views never trigger a load, ask for the profile first
                    Err(e) if e.disposition() == ErrorDisposition::NotFound => coordinator
                        .get_profile(key, self.storage.clone())
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            } else {
                coordinator
                    .get_profile(key, self.storage.clone())
                    .await
                    .map(|_| ())
            };

            let error = match result {
                Ok(()) => {
                    Counters::bump(&self.counters.served);
                    return;
                }
                Err(error) => error,
            };
            match error.disposition() {
                ErrorDisposition::Redirect(owner) => {
                    Counters::bump(&self.counters.redirects);
                    match self.nodes.iter().position(|n| n.addr == owner) {
                        Some(owner) => node = owner,
                        None => {
                            Counters::bump(&self.counters.failed);
                            return;
                        }
                    }
                    continue;
                }
                ErrorDisposition::Retry => {
                    if matches!(error, ProfileCacheError::LoadInProgress(_)) {
                        Counters::bump(&self.counters.in_progress);
                    } else {
                        Counters::bump(&self.counters.unavailable);
                    }
                }
                ErrorDisposition::NotFound => {}
                ErrorDisposition::Failed => {
                    Counters::bump(&self.counters.failed);
                    return;
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(200));
        }
        Counters::bump(&self.counters.gave_up);
    }

    /// Expires the coordination session of a random node, and reconnects it shortly after.
    pub async fn inject_session_loss(&self) {
        let node = rand::rng().random_range(0..self.nodes.len());
        let node = &self.nodes[node];
        tracing::info!(node = %node.addr, "Expiring coordination session");
        node.client.expire_session();
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.client.reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_addr() {
        let base = NodeAddr::new("127.0.0.1", 8082);
        assert_eq!(node_addr(&base, 0).unwrap(), base);
        assert_eq!(node_addr(&base, 2).unwrap().port, 8084);

        let high = NodeAddr::new("127.0.0.1", u16::MAX - 1);
        assert_eq!(node_addr(&high, 1).unwrap().port, u16::MAX);
        assert!(node_addr(&high, 2).is_err());
    }
}
