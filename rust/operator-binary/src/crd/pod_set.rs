use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::Pod,
    kube::CustomResource,
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
};

/// Pod annotation holding the revision of the declared pod it was created from.
pub const POD_REVISION_ANNOTATION: &str = "kafka.stackable.tech/pod-revision";
/// Pod annotation holding the combined configuration fingerprint of all roles of the node.
pub const CONFIGURATION_HASH_ANNOTATION: &str = "kafka.stackable.tech/configuration-hash";
/// Pod annotation holding the fingerprint of the storage layout of the node.
pub const STORAGE_HASH_ANNOTATION: &str = "kafka.stackable.tech/storage-hash";

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("pod #{index} has no name"))]
    PodWithoutName { index: usize },

    #[snafu(display("pod {name} is declared more than once"))]
    DuplicatePodName { name: String },
}

/// An explicit list of fully specified pods, one per Kafka node.
///
/// Unlike a StatefulSet every pod can differ from its siblings, which allows nodes of one
/// cluster to use different roles, storage and resources.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "kafka.stackable.tech",
    version = "v1alpha1",
    kind = "KafkaPodSet",
    plural = "kafkapodsets",
    shortname = "kps",
    status = "KafkaPodSetStatus",
    derive = "PartialEq",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaPodSetSpec {
    /// Labels shared by all pods of the set.
    pub selector: BTreeMap<String, String>,

    pub pods: Vec<Pod>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaPodSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Number of declared pods.
    #[serde(default)]
    pub pods: u32,

    /// Pods running the current revision.
    #[serde(default)]
    pub current_pods: u32,

    /// Pods running the current revision and reporting readiness.
    #[serde(default)]
    pub ready_pods: u32,

    /// Pods whose operations keep failing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_pods: Vec<String>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Trigger identifier of the last pass that changed the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation: Option<String>,
}

impl HasStatusCondition for KafkaPodSet {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl KafkaPodSetSpec {
    /// Rejects pod lists the controller cannot act on.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        for (index, pod) in self.pods.iter().enumerate() {
            let name = pod
                .metadata
                .name
                .as_deref()
                .ok_or(Error::PodWithoutName { index })?;
            if !names.insert(name) {
                return DuplicatePodNameSnafu { name }.fail();
            }
        }
        Ok(())
    }

    pub fn pod_names(&self) -> impl Iterator<Item = &str> {
        self.pods.iter().filter_map(|pod| pod.metadata.name.as_deref())
    }
}
