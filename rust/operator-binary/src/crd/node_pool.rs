use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::ResourceRequirements,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

use crate::crd::{role::KafkaRole, storage::StorageSpec};

/// A group of Kafka nodes sharing roles, storage and resources.
///
/// A pool belongs to the [`KafkaCluster`](crate::crd::KafkaCluster) named by its
/// `kafka.stackable.tech/cluster` label.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "kafka.stackable.tech",
    version = "v1alpha1",
    kind = "KafkaNodePool",
    plural = "kafkanodepools",
    shortname = "kafkanodepool",
    status = "KafkaNodePoolStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaNodePoolSpec {
    pub replicas: u16,

    pub roles: BTreeSet<KafkaRole>,

    /// Falls back to the storage of the cluster when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Falls back to the resources of the cluster when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Explicitly pinned node ids. Must list exactly `replicas` ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<u32>>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaNodePoolStatus {
    /// Node ids assigned to this pool by the last reconciliation.
    #[serde(default)]
    pub node_ids: Vec<u32>,

    #[serde(default)]
    pub roles: BTreeSet<KafkaRole>,

    #[serde(default)]
    pub replicas: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KafkaNodePool {
    pub fn name_unchecked(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Ids assigned by earlier reconciliations, empty for new pools.
    pub fn assigned_node_ids(&self) -> &[u32] {
        self.status
            .as_ref()
            .map(|status| status.node_ids.as_slice())
            .unwrap_or_default()
    }
}
