//! Merges a [`KafkaCluster`] and its [`KafkaNodePool`]s into one node topology.
//!
//! Building the topology is a pure function of its inputs. Node ids handed out by earlier passes
//! are read back from the pool status, which keeps node identities stable across passes.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::ResourceRequirements, kube::runtime::reflector::ObjectRef,
};

use crate::crd::{
    self, IMPLICIT_POOL_NAME, KafkaCluster,
    node_pool::KafkaNodePool,
    role::KafkaRole,
    storage::{self, ResolvedVolume, StorageSpec},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to identify the cluster"))]
    ClusterKey { source: crd::Error },

    #[snafu(display("node pool {pool} is declared more than once"))]
    DuplicatePoolName { pool: String },

    #[snafu(display("node pool {pool} declares no roles"))]
    EmptyRoleSet { pool: String },

    #[snafu(display(
        "node pool {pool} pins {actual} node ids, but requests {expected} replicas"
    ))]
    PinnedNodeIdCount {
        pool: String,
        expected: u16,
        actual: usize,
    },

    #[snafu(display("node pool {pool} pins node id {node_id} more than once"))]
    DuplicateNodeId { pool: String, node_id: u32 },

    #[snafu(display("node id {node_id} is claimed by node pools {pool} and {other_pool}"))]
    OverlappingNodeIds {
        node_id: u32,
        pool: String,
        other_pool: String,
    },

    #[snafu(display("node pool {pool} has invalid storage"))]
    InvalidStorage { source: storage::Error, pool: String },

    #[snafu(display("no node of the cluster has the broker role"))]
    MissingBrokerRole,

    #[snafu(display("the cluster uses KRaft, but no node has the controller role"))]
    MissingControllerRole,

    #[snafu(display(
        "node pool {pool} has the controller role, which requires the KRaft metadata manager"
    ))]
    ControllerRoleRequiresKraft { pool: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity and roles of one Kafka node. The node id doubles as the node's ordinal.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeRef {
    pub pool: String,
    pub node_id: u32,
    pub roles: BTreeSet<KafkaRole>,
}

impl NodeRef {
    pub fn has_role(&self, role: KafkaRole) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KafkaNode {
    pub node_ref: NodeRef,
    pub volumes: Vec<ResolvedVolume>,
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolTopology {
    pub name: String,
    pub roles: BTreeSet<KafkaRole>,
    pub node_ids: Vec<u32>,
    pub generation: Option<i64>,
    /// The pool stands in for a cluster without node pools and has no resource of its own.
    pub implicit: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    pub cluster: ObjectRef<KafkaCluster>,
    pub pools: Vec<PoolTopology>,
    /// Ordered by pool name, then node id.
    pub nodes: Vec<KafkaNode>,
}

impl Topology {
    /// Every role held by at least one node.
    pub fn roles(&self) -> BTreeSet<KafkaRole> {
        self.nodes
            .iter()
            .flat_map(|node| node.node_ref.roles.iter().copied())
            .collect()
    }

    pub fn pool_nodes<'a>(&'a self, pool: &'a str) -> impl Iterator<Item = &'a KafkaNode> + 'a {
        self.nodes
            .iter()
            .filter(move |node| node.node_ref.pool == pool)
    }
}

struct PoolInput<'a> {
    name: String,
    roles: BTreeSet<KafkaRole>,
    replicas: u16,
    storage: &'a StorageSpec,
    resources: Option<&'a ResourceRequirements>,
    pinned: Option<Vec<u32>>,
    assigned: &'a [u32],
    generation: Option<i64>,
    implicit: bool,
}

/// Builds the topology of `kafka` from `pools`. An empty pool list models the cluster as a single
/// implicit pool sized by `spec.replicas`.
pub fn build_topology(kafka: &KafkaCluster, pools: &[KafkaNodePool]) -> Result<Topology> {
    let cluster = kafka.cluster_ref().context(ClusterKeySnafu)?;

    let mut inputs = if pools.is_empty() {
        vec![implicit_pool(kafka)]
    } else {
        pools.iter().map(|pool| explicit_pool(kafka, pool)).collect()
    };
    // Order pools consistently, to avoid spurious downstream rewrites
    inputs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut names = BTreeSet::new();
    for input in &inputs {
        if !names.insert(input.name.as_str()) {
            return DuplicatePoolNameSnafu { pool: &input.name }.fail();
        }
        if input.roles.is_empty() {
            return EmptyRoleSetSnafu { pool: &input.name }.fail();
        }
        if !kafka.is_kraft_mode() && input.roles.contains(&KafkaRole::Controller) {
            return ControllerRoleRequiresKraftSnafu { pool: &input.name }.fail();
        }
        input
            .storage
            .validate()
            .context(InvalidStorageSnafu { pool: &input.name })?;
    }

    let node_ids = assign_node_ids(&inputs)?;

    let mut topology_pools = Vec::with_capacity(inputs.len());
    let mut nodes = Vec::new();
    for (input, ids) in inputs.iter().zip(node_ids) {
        for &node_id in &ids {
            nodes.push(KafkaNode {
                node_ref: NodeRef {
                    pool: input.name.clone(),
                    node_id,
                    roles: input.roles.clone(),
                },
                volumes: input.storage.resolve_for(node_id),
                resources: input.resources.cloned(),
            });
        }
        topology_pools.push(PoolTopology {
            name: input.name.clone(),
            roles: input.roles.clone(),
            node_ids: ids,
            generation: input.generation,
            implicit: input.implicit,
        });
    }

    let topology = Topology {
        cluster,
        pools: topology_pools,
        nodes,
    };

    let roles = topology.roles();
    if !roles.contains(&KafkaRole::Broker) {
        return MissingBrokerRoleSnafu.fail();
    }
    if kafka.is_kraft_mode() && !roles.contains(&KafkaRole::Controller) {
        return MissingControllerRoleSnafu.fail();
    }

    Ok(topology)
}

fn implicit_pool(kafka: &KafkaCluster) -> PoolInput<'_> {
    let roles = if kafka.is_kraft_mode() {
        BTreeSet::from([KafkaRole::Broker, KafkaRole::Controller])
    } else {
        BTreeSet::from([KafkaRole::Broker])
    };
    PoolInput {
        name: IMPLICIT_POOL_NAME.to_string(),
        roles,
        replicas: kafka.spec.replicas,
        storage: &kafka.spec.storage,
        resources: kafka.spec.resources.as_ref(),
        pinned: Some((0..u32::from(kafka.spec.replicas)).collect()),
        assigned: &[],
        generation: kafka.metadata.generation,
        implicit: true,
    }
}

fn explicit_pool<'a>(kafka: &'a KafkaCluster, pool: &'a KafkaNodePool) -> PoolInput<'a> {
    PoolInput {
        name: pool.name_unchecked().to_string(),
        roles: pool.spec.roles.clone(),
        replicas: pool.spec.replicas,
        storage: pool.spec.storage.as_ref().unwrap_or(&kafka.spec.storage),
        resources: pool
            .spec
            .resources
            .as_ref()
            .or(kafka.spec.resources.as_ref()),
        pinned: pool.spec.node_ids.clone(),
        assigned: pool.assigned_node_ids(),
        generation: pool.metadata.generation,
        implicit: false,
    }
}

/// Returns the sorted node ids of every pool, in the order of `inputs`.
///
/// Pinned ids are taken as is. Other pools keep the ids they were assigned before, releasing the
/// highest ones when scaled down; missing ids are filled with the lowest ids no pool uses.
fn assign_node_ids(inputs: &[PoolInput]) -> Result<Vec<Vec<u32>>> {
    let mut claimed = BTreeMap::<u32, &str>::new();
    let mut ids_per_pool = Vec::with_capacity(inputs.len());

    for input in inputs {
        let ids = match &input.pinned {
            Some(pinned) => {
                if pinned.len() != usize::from(input.replicas) {
                    return PinnedNodeIdCountSnafu {
                        pool: &input.name,
                        expected: input.replicas,
                        actual: pinned.len(),
                    }
                    .fail();
                }
                let mut unique = BTreeSet::new();
                for &node_id in pinned {
                    if !unique.insert(node_id) {
                        return DuplicateNodeIdSnafu {
                            pool: &input.name,
                            node_id,
                        }
                        .fail();
                    }
                }
                unique
            }
            None => input
                .assigned
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .take(usize::from(input.replicas))
                .collect(),
        };

        for &node_id in &ids {
            if let Some(other_pool) = claimed.insert(node_id, &input.name) {
                return OverlappingNodeIdsSnafu {
                    node_id,
                    pool: other_pool,
                    other_pool: &input.name,
                }
                .fail();
            }
        }
        ids_per_pool.push(ids);
    }

    let mut next_candidate = 0;
    for (input, ids) in inputs.iter().zip(ids_per_pool.iter_mut()) {
        while ids.len() < usize::from(input.replicas) {
            while claimed.contains_key(&next_candidate) {
                next_candidate += 1;
            }
            claimed.insert(next_candidate, &input.name);
            ids.insert(next_candidate);
        }
    }

    Ok(ids_per_pool
        .into_iter()
        .map(|ids| ids.into_iter().collect())
        .collect())
}
