pub mod condition;
pub mod node_pool;
pub mod pod_set;
pub mod role;
pub mod storage;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::ResourceRequirements,
    kube::{CustomResource, runtime::reflector::ObjectRef},
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
};
use strum::{Display, EnumIter, EnumString};

use crate::crd::storage::StorageSpec;

pub const APP_NAME: &str = "kafka";
pub const OPERATOR_NAME: &str = "kafka.stackable.tech";
/// Name of the pool used for clusters without any [`KafkaNodePool`](node_pool::KafkaNodePool).
pub const IMPLICIT_POOL_NAME: &str = "kafka";
// ports
pub const CONTROLLER_PORT_NAME: &str = "controller";
pub const CONTROLLER_PORT: u16 = 9093;
// directories
pub const STACKABLE_DATA_DIR: &str = "/stackable/data";
pub const STACKABLE_TLS_DIR: &str = "/stackable/tls";
// volumes
pub const TLS_VOLUME_NAME: &str = "tls";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("object has no name associated"))]
    NoName,
}

/// A Kafka cluster whose nodes are described by zero or more node pools.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "kafka.stackable.tech",
    version = "v1alpha1",
    kind = "KafkaCluster",
    plural = "kafkaclusters",
    shortname = "kafka",
    status = "KafkaClusterStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterSpec {
    /// Container image used for every Kafka node.
    pub image: String,

    /// Number of nodes when the cluster does not use node pools.
    #[serde(default)]
    pub replicas: u16,

    /// Kafka configuration applied to every node. Changes roll the nodes whose role reads the key.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    #[serde(default)]
    pub listeners: Vec<KafkaListener>,

    /// Storage used by node pools that do not declare their own.
    #[serde(default)]
    pub storage: StorageSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub cluster_config: KafkaClusterConfig,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaListener {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterConfig {
    #[serde(default)]
    pub metadata_manager: MetadataManager,

    /// Name of the Secret holding the node certificates. Issued and rotated outside of this
    /// operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetadataManager {
    #[default]
    ZooKeeper,
    KRaft,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Trigger identifier of the last completed reconciliation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation: Option<String>,
}

impl HasStatusCondition for KafkaCluster {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl KafkaCluster {
    pub fn is_kraft_mode(&self) -> bool {
        self.spec.cluster_config.metadata_manager == MetadataManager::KRaft
    }

    /// The Kafka cluster id when running in Kraft mode.
    ///
    /// In ZooKeeper mode the cluster id is a UUID generated by Kafka itself.
    pub fn cluster_id(&self) -> Option<&str> {
        match self.spec.cluster_config.metadata_manager {
            MetadataManager::KRaft => self.metadata.name.as_deref(),
            MetadataManager::ZooKeeper => None,
        }
    }

    pub fn cluster_ref(&self) -> Result<ObjectRef<Self>, Error> {
        let namespace = self.metadata.namespace.as_deref().context(NoNamespaceSnafu)?;
        let name = self.metadata.name.as_deref().context(NoNameSnafu)?;
        Ok(ObjectRef::new(name).within(namespace))
    }

    pub fn name_unchecked(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The pod set holding the pods of `pool`.
    pub fn pod_set_name(&self, pool: &str) -> String {
        format!("{}-{pool}", self.name_unchecked())
    }

    pub fn pod_name(&self, pool: &str, node_id: u32) -> String {
        format!("{}-{node_id}", self.pod_set_name(pool))
    }

    /// The headless Service giving every node a stable DNS name. Managed outside of this operator.
    pub fn headless_service_name(&self) -> String {
        format!("{}-kafka-nodes", self.name_unchecked())
    }
}
