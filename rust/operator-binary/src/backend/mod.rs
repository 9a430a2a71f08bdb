//! Storage backends the controllers read from and write to.

pub mod kube;
#[cfg(test)]
pub mod memory;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod},
    kube::{Resource, core::DynamicObject, runtime::reflector::ObjectRef},
};

use crate::crd::{
    KafkaCluster, KafkaClusterStatus,
    node_pool::{KafkaNodePool, KafkaNodePoolStatus},
    pod_set::{KafkaPodSet, KafkaPodSetStatus},
};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: ObjectRef<DynamicObject> },

    #[snafu(display("{object} does not exist"))]
    NotFound { object: ObjectRef<DynamicObject> },

    #[snafu(display("{operation} of {object} did not finish within {timeout:?}"))]
    Timeout {
        operation: &'static str,
        object: ObjectRef<DynamicObject>,
        timeout: Duration,
    },

    #[snafu(display("{operation} of {object} was rejected: {message}"))]
    Rejected {
        operation: &'static str,
        object: ObjectRef<DynamicObject>,
        message: String,
    },

    #[snafu(display("{operation} of {object} failed"))]
    Kube {
        source: stackable_operator::kube::Error,
        operation: &'static str,
        object: ObjectRef<DynamicObject>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How callers should react to a failed operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Lost an optimistic concurrency race, retry right away.
    Conflict,
    /// Retry with backoff.
    Transient,
    /// Retrying the same request cannot succeed.
    Invalid,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Conflict { .. } => ErrorClass::Conflict,
            Error::Rejected { .. } => ErrorClass::Invalid,
            Error::NotFound { .. } | Error::Timeout { .. } | Error::Kube { .. } => {
                ErrorClass::Transient
            }
        }
    }

    /// The object the failed operation was about.
    pub fn object(&self) -> &ObjectRef<DynamicObject> {
        match self {
            Error::Conflict { object }
            | Error::NotFound { object }
            | Error::Timeout { object, .. }
            | Error::Rejected { object, .. }
            | Error::Kube { object, .. } => object,
        }
    }
}

/// Pods and pod sets, as used by the pod set controller.
#[async_trait]
pub trait PodStore: Send + Sync {
    async fn get_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<Option<KafkaPodSet>>;

    /// Pods labelled as belonging to `pod_set`, including terminating ones.
    async fn list_pods(&self, pod_set: &KafkaPodSet) -> Result<Vec<Pod>>;

    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Sets the given labels and annotations, failing with a conflict if the pod changed since
    /// `resource_version` was observed.
    async fn patch_pod_metadata(
        &self,
        pod: &ObjectRef<Pod>,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Succeeds if the pod is already gone.
    async fn delete_pod(&self, pod: &ObjectRef<Pod>) -> Result<()>;

    async fn update_pod_set_status(
        &self,
        pod_set: &KafkaPodSet,
        status: &KafkaPodSetStatus,
    ) -> Result<()>;
}

/// Cluster specifications and the objects generated from them, as used by the cluster controller.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Option<KafkaCluster>>;

    async fn list_node_pools(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaNodePool>>;

    async fn list_pod_sets(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaPodSet>>;

    /// Replaces the pod set, returning it as stored, including its new generation.
    async fn apply_pod_set(&self, pod_set: &KafkaPodSet) -> Result<KafkaPodSet>;

    async fn delete_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<()>;

    /// Creates the claim unless it exists. Existing claims are never modified.
    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<bool>;

    async fn update_cluster_status(
        &self,
        kafka: &KafkaCluster,
        status: &KafkaClusterStatus,
    ) -> Result<()>;

    async fn update_node_pool_status(
        &self,
        pool: &KafkaNodePool,
        status: &KafkaNodePoolStatus,
    ) -> Result<()>;
}

/// Reference to a named object, or `None` if it lacks a name or namespace.
pub fn object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> Option<ObjectRef<K>> {
    let meta = obj.meta();
    Some(ObjectRef::new(meta.name.as_deref()?).within(meta.namespace.as_deref()?))
}
