//! Alias to bridge allocation for one deployment run
//!
//! The allocator is owned by a run and passed by reference to the stand
//! lifecycle. Allocations are cached per `(node, pool, alias)`, so every
//! interface of a tenant that names the same alias lands on the same L2
//! segment. Each node has its own shard, locked across probe and create.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::alias::{parse_bridge_ref, BridgeRef};
use super::interfaces::ResolvedInterface;
use super::ranges::BridgePolicy;
use crate::config::{NetworkSpec, StandConfig};
use crate::error::{StandError, StandResult};
use crate::gateway::{ClusterGateway, GatewayError};

/// Aliases that need a VLAN-aware bridge because some use carries a tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlanPlan {
    symbolic: HashSet<String>,
    reserved: HashSet<String>,
}

impl VlanPlan {
    /// Scan every interface of the batch. Unparseable entries are skipped,
    /// validation reports them separately.
    pub fn from_config(config: &StandConfig) -> Self {
        let mut plan = Self::default();
        for network in config.machines.iter().flat_map(|m| m.networks.iter()) {
            match parse_bridge_ref(network) {
                Ok(BridgeRef::Symbolic {
                    alias,
                    vlan: Some(_),
                }) => {
                    plan.symbolic.insert(alias);
                }
                Ok(BridgeRef::Reserved {
                    bridge,
                    vlan: Some(_),
                }) => {
                    plan.reserved.insert(bridge);
                }
                _ => {}
            }
        }
        plan
    }

    pub fn needs_vlan(&self, bridge_ref: &BridgeRef) -> bool {
        match bridge_ref {
            BridgeRef::Symbolic { alias, .. } => self.symbolic.contains(alias),
            BridgeRef::Reserved { bridge, .. } => self.reserved.contains(bridge),
        }
    }
}

/// A bridge handed out for an alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub bridge: String,
    pub vlan_aware: bool,
}

#[derive(Debug, Default)]
struct NodeBridges {
    /// (pool, alias) -> allocation
    allocations: HashMap<(String, String), Allocation>,
}

pub struct BridgeAllocator {
    gateway: Arc<dyn ClusterGateway>,
    policy: BridgePolicy,
    vlan_plan: VlanPlan,
    shards: DashMap<String, Arc<Mutex<NodeBridges>>>,
}

impl BridgeAllocator {
    pub fn new(gateway: Arc<dyn ClusterGateway>, policy: BridgePolicy) -> Self {
        Self {
            gateway,
            policy,
            vlan_plan: VlanPlan::default(),
            shards: DashMap::new(),
        }
    }

    /// Pre-scan the batch so tagged and untagged uses share a VLAN-aware bridge
    pub fn with_vlan_plan(mut self, config: &StandConfig) -> Self {
        self.vlan_plan = VlanPlan::from_config(config);
        self
    }

    pub fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    fn shard(&self, node: &str) -> Arc<Mutex<NodeBridges>> {
        self.shards
            .entry(node.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Resolve an alias (with optional `.vlan` suffix) to a bridge name
    pub async fn allocate(
        &self,
        node: &str,
        alias: &str,
        pool: &str,
        reserved: bool,
    ) -> StandResult<String> {
        let spec = NetworkSpec {
            bridge: alias.to_string(),
            reserved,
        };
        Ok(self.resolve(node, pool, &spec).await?.bridge)
    }

    /// Resolve one interface: the bridge plus the tag the interface carries
    pub async fn resolve(
        &self,
        node: &str,
        pool: &str,
        network: &NetworkSpec,
    ) -> StandResult<ResolvedInterface> {
        let bridge_ref =
            parse_bridge_ref(network).map_err(|e| StandError::Validation(e.to_string()))?;
        let vlan_aware = self.vlan_plan.needs_vlan(&bridge_ref) || bridge_ref.vlan().is_some();

        let bridge = match &bridge_ref {
            BridgeRef::Reserved { bridge, .. } => {
                self.ensure_reserved(node, bridge, vlan_aware).await?;
                bridge.clone()
            }
            BridgeRef::Symbolic { alias, .. } => {
                self.allocate_symbolic(node, pool, alias, vlan_aware)
                    .await?
                    .bridge
            }
        };

        Ok(ResolvedInterface {
            bridge,
            vlan: bridge_ref.vlan(),
        })
    }

    async fn ensure_reserved(&self, node: &str, bridge: &str, vlan_aware: bool) -> StandResult<()> {
        let shard = self.shard(node);
        let _guard = shard.lock().await;
        if self.gateway.bridge_exists(node, bridge).await? {
            return Ok(());
        }
        info!("Creating reserved bridge {} on {}", bridge, node);
        self.create(node, bridge, vlan_aware).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn allocate_symbolic(
        &self,
        node: &str,
        pool: &str,
        alias: &str,
        vlan_aware: bool,
    ) -> StandResult<Allocation> {
        let shard = self.shard(node);
        let mut bridges = shard.lock().await;
        let key = (pool.to_string(), alias.to_string());
        if let Some(existing) = bridges.allocations.get(&key) {
            debug!("Reusing {} for alias '{}'", existing.bridge, alias);
            return Ok(existing.clone());
        }

        let range = self.policy.range_for(alias);
        let taken: BTreeSet<String> = self.gateway.list_bridges(node).await?.into_iter().collect();

        for candidate in range.candidates() {
            if taken.contains(&candidate) {
                continue;
            }
            match self.create(node, &candidate, vlan_aware).await {
                Ok(()) => {
                    info!(
                        "Allocated {} for alias '{}'{}",
                        candidate,
                        alias,
                        if vlan_aware { " (VLAN aware)" } else { "" }
                    );
                    let allocation = Allocation {
                        bridge: candidate,
                        vlan_aware,
                    };
                    bridges.allocations.insert(key, allocation.clone());
                    return Ok(allocation);
                }
                // Taken concurrently by someone outside this run
                Err(GatewayError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StandError::ResourceConflict(format!(
            "no free bridge for alias '{}' in vmbr{:04}-vmbr{:04} on {}",
            alias, range.start, range.end, node
        )))
    }

    async fn create(&self, node: &str, bridge: &str, vlan_aware: bool) -> Result<(), GatewayError> {
        if vlan_aware {
            self.gateway.create_vlan_bridge(node, bridge).await
        } else {
            self.gateway.create_bridge(node, bridge).await
        }
    }

    /// Nodes on which this run allocated bridges
    pub fn touched_nodes(&self) -> BTreeSet<String> {
        self.shards.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Cached allocation for a key, if any
    pub async fn cached(&self, node: &str, pool: &str, alias: &str) -> Option<Allocation> {
        let shard = self.shards.get(node)?.value().clone();
        let bridges = shard.lock().await;
        bridges
            .allocations
            .get(&(pool.to_string(), alias.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineSpec;
    use crate::gateway::InMemoryCluster;

    fn allocator(cluster: &Arc<InMemoryCluster>) -> BridgeAllocator {
        BridgeAllocator::new(cluster.clone(), BridgePolicy::default())
    }

    #[tokio::test]
    async fn test_same_alias_same_bridge() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        let alloc = allocator(&cluster);
        let first = alloc.allocate("pve1", "hq", "alice", false).await.unwrap();
        let second = alloc.allocate("pve1", "hq", "alice", false).await.unwrap();
        assert_eq!(first, "vmbr1000");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_hq_inet_hq_creates_two_bridges() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        let alloc = allocator(&cluster);
        let a = alloc.allocate("pve1", "hq", "alice", false).await.unwrap();
        let b = alloc.allocate("pve1", "inet", "alice", false).await.unwrap();
        let c = alloc.allocate("pve1", "hq", "alice", false).await.unwrap();
        assert_eq!(a, c);
        assert_eq!(b, "vmbr2000");
        // vmbr0 plus the two allocated bridges
        assert_eq!(cluster.bridges_on("pve1").len(), 3);
    }

    #[tokio::test]
    async fn test_pools_are_isolated() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        let alloc = allocator(&cluster);
        let alice = alloc.allocate("pve1", "hq", "alice", false).await.unwrap();
        let bob = alloc.allocate("pve1", "hq", "bob", false).await.unwrap();
        assert_ne!(alice, bob);
        assert_eq!(bob, "vmbr1001");
    }

    #[tokio::test]
    async fn test_probe_skips_existing_bridges() {
        let cluster = Arc::new(
            InMemoryCluster::new(&["pve1"])
                .with_bridge("pve1", "vmbr9000")
                .with_bridge("pve1", "vmbr9001"),
        );
        let alloc = allocator(&cluster);
        let bridge = alloc.allocate("pve1", "dmz", "alice", false).await.unwrap();
        assert_eq!(bridge, "vmbr9002");
    }

    #[tokio::test]
    async fn test_vlan_use_makes_bridge_vlan_aware() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        let config = StandConfig::new(vec![
            MachineSpec::new(100, "pve1").with_network(NetworkSpec::new("hq")),
            MachineSpec::new(101, "pve1").with_network(NetworkSpec::new("hq.50")),
        ]);
        let alloc = allocator(&cluster).with_vlan_plan(&config);

        let plain = alloc
            .resolve("pve1", "alice", &NetworkSpec::new("hq"))
            .await
            .unwrap();
        let tagged = alloc
            .resolve("pve1", "alice", &NetworkSpec::new("hq.50"))
            .await
            .unwrap();

        assert_eq!(plain.bridge, tagged.bridge);
        assert_eq!(plain.vlan, None);
        assert_eq!(tagged.vlan, Some(50));
        assert_eq!(cluster.bridges_on("pve1").get(&plain.bridge), Some(&true));
    }

    #[tokio::test]
    async fn test_reserved_bridge_created_once_without_numbering() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        let alloc = allocator(&cluster);
        let a = alloc.allocate("pve1", "**lan**", "alice", false).await.unwrap();
        let b = alloc.allocate("pve1", "**lan**", "bob", false).await.unwrap();
        let c = alloc.allocate("pve1", "vmbr0", "bob", false).await.unwrap();
        assert_eq!(a, "lan");
        assert_eq!(b, "lan");
        assert_eq!(c, "vmbr0");
        assert!(cluster.bridges_on("pve1").contains_key("lan"));
    }

    #[tokio::test]
    async fn test_creation_failure_is_raised() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]));
        cluster.fail_bridge_creation();
        let alloc = allocator(&cluster);
        let result = alloc.allocate("pve1", "hq", "alice", false).await;
        assert!(matches!(result, Err(StandError::ClusterUnavailable(_))));
        assert!(alloc.cached("pve1", "alice", "hq").await.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_range_is_conflict() {
        let mut policy = BridgePolicy::default();
        policy.fallback = crate::network::BridgeRange::new(9000, 9001);
        let cluster = Arc::new(
            InMemoryCluster::new(&["pve1"])
                .with_bridge("pve1", "vmbr9000")
                .with_bridge("pve1", "vmbr9001"),
        );
        let alloc = BridgeAllocator::new(cluster.clone(), policy);
        let result = alloc.allocate("pve1", "dmz", "alice", false).await;
        assert!(matches!(result, Err(StandError::ResourceConflict(_))));
    }

    #[tokio::test]
    async fn test_touched_nodes() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1", "pve2"]));
        let alloc = allocator(&cluster);
        alloc.allocate("pve2", "hq", "alice", false).await.unwrap();
        assert_eq!(alloc.touched_nodes().into_iter().collect::<Vec<_>>(), vec!["pve2"]);
    }
}
