//! [`PodStore`] and [`ClusterStore`] backed by the Kubernetes API.

use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use snafu::OptionExt;
use stackable_operator::{
    k8s_openapi::{
        NamespaceResourceScope,
        api::core::v1::{PersistentVolumeClaim, Pod},
    },
    kube::{
        self, Api, Client, Resource, ResourceExt,
        api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
        core::DynamicObject,
        runtime::reflector::{ObjectRef, Store},
    },
};

use crate::{
    backend::{ClusterStore, Error, PodStore, RejectedSnafu, Result, TimeoutSnafu, object_ref},
    crd::{
        KafkaCluster, KafkaClusterStatus,
        node_pool::{KafkaNodePool, KafkaNodePoolStatus},
        pod_set::{KafkaPodSet, KafkaPodSetStatus},
    },
    utils::{LABEL_CLUSTER, LABEL_POD_SET},
};

/// Talks to the API server, bounding every request by `timeout`.
///
/// Pods are read from a reflector store, which may lag behind the writes of a pass. Creating a
/// pod that already exists and deleting one that is already gone both succeed, so a pass acting
/// on a stale view repeats its predecessor instead of failing.
pub struct KubeBackend {
    client: Client,
    field_manager: String,
    timeout: Duration,
    pods: Store<Pod>,
}

impl KubeBackend {
    pub fn new(
        client: Client,
        field_manager: impl Into<String>,
        timeout: Duration,
        pods: Store<Pod>,
    ) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            timeout,
            pods,
        }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace.unwrap_or_default())
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        object: ObjectRef<DynamicObject>,
        request: impl Future<Output = kube::Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|source| api_error(source, operation, object)),
            Err(_) => TimeoutSnafu {
                operation,
                object,
                timeout: self.timeout,
            }
            .fail(),
        }
    }

    async fn patch_status<K>(&self, obj: &K, status: serde_json::Value) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
    {
        let object = checked_ref(obj, "update status")?;
        let api = self.api::<K>(object.namespace.as_deref());
        let patch = json!({ "status": status });
        self.call(
            "update status",
            object.clone().erase(),
            api.patch_status(&object.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PodStore for KubeBackend {
    async fn get_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<Option<KafkaPodSet>> {
        let api = self.api::<KafkaPodSet>(pod_set.namespace.as_deref());
        self.call("get", pod_set.clone().erase(), api.get_opt(&pod_set.name))
            .await
    }

    async fn list_pods(&self, pod_set: &KafkaPodSet) -> Result<Vec<Pod>> {
        let namespace = pod_set.namespace();
        let name = pod_set.name_any();
        Ok(self
            .pods
            .state()
            .into_iter()
            .filter(|pod| {
                pod.namespace() == namespace && pod.labels().get(LABEL_POD_SET) == Some(&name)
            })
            .map(|pod| Pod::clone(&pod))
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let object = checked_ref(pod, "create")?;
        let api = self.api::<Pod>(object.namespace.as_deref());
        match self
            .call(
                "create",
                object.clone().erase(),
                api.create(&PostParams::default(), pod),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict { .. }) => {
                tracing::debug!(pod = %object, "pod already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn patch_pod_metadata(
        &self,
        pod: &ObjectRef<Pod>,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut metadata = json!({
            "labels": labels,
            "annotations": annotations,
        });
        if let Some(resource_version) = resource_version {
            metadata["resourceVersion"] = json!(resource_version);
        }
        let patch = json!({ "metadata": metadata });

        let api = self.api::<Pod>(pod.namespace.as_deref());
        self.call(
            "patch",
            pod.clone().erase(),
            api.patch(&pod.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn delete_pod(&self, pod: &ObjectRef<Pod>) -> Result<()> {
        let api = self.api::<Pod>(pod.namespace.as_deref());
        match self
            .call(
                "delete",
                pod.clone().erase(),
                api.delete(&pod.name, &DeleteParams::default()),
            )
            .await
        {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn update_pod_set_status(
        &self,
        pod_set: &KafkaPodSet,
        status: &KafkaPodSetStatus,
    ) -> Result<()> {
        self.patch_status(pod_set, json!(status)).await
    }
}

#[async_trait]
impl ClusterStore for KubeBackend {
    async fn get_cluster(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Option<KafkaCluster>> {
        let api = self.api::<KafkaCluster>(cluster.namespace.as_deref());
        self.call("get", cluster.clone().erase(), api.get_opt(&cluster.name))
            .await
    }

    async fn list_node_pools(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaNodePool>> {
        let api = self.api::<KafkaNodePool>(cluster.namespace.as_deref());
        let pools = self
            .call(
                "list node pools",
                cluster.clone().erase(),
                api.list(&cluster_selector(cluster)),
            )
            .await?;
        Ok(pools.items)
    }

    async fn list_pod_sets(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaPodSet>> {
        let api = self.api::<KafkaPodSet>(cluster.namespace.as_deref());
        let pod_sets = self
            .call(
                "list pod sets",
                cluster.clone().erase(),
                api.list(&cluster_selector(cluster)),
            )
            .await?;
        Ok(pod_sets.items)
    }

    async fn apply_pod_set(&self, pod_set: &KafkaPodSet) -> Result<KafkaPodSet> {
        let object = checked_ref(pod_set, "apply")?;
        let api = self.api::<KafkaPodSet>(object.namespace.as_deref());
        // server-side apply with force takes over every field, dropping pods no longer declared
        self.call(
            "apply",
            object.clone().erase(),
            api.patch(
                &object.name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(pod_set),
            ),
        )
        .await
    }

    async fn delete_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<()> {
        let api = self.api::<KafkaPodSet>(pod_set.namespace.as_deref());
        match self
            .call(
                "delete",
                pod_set.clone().erase(),
                api.delete(&pod_set.name, &DeleteParams::foreground()),
            )
            .await
        {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let object = checked_ref(pvc, "create")?;
        let api = self.api::<PersistentVolumeClaim>(object.namespace.as_deref());
        match self
            .call("create", object.erase(), api.create(&PostParams::default(), pvc))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn update_cluster_status(
        &self,
        kafka: &KafkaCluster,
        status: &KafkaClusterStatus,
    ) -> Result<()> {
        self.patch_status(kafka, json!(status)).await
    }

    async fn update_node_pool_status(
        &self,
        pool: &KafkaNodePool,
        status: &KafkaNodePoolStatus,
    ) -> Result<()> {
        self.patch_status(pool, json!(status)).await
    }
}

fn cluster_selector(cluster: &ObjectRef<KafkaCluster>) -> ListParams {
    ListParams::default().labels(&format!("{LABEL_CLUSTER}={}", cluster.name))
}

fn checked_ref<K: Resource<DynamicType = ()>>(
    obj: &K,
    operation: &'static str,
) -> Result<ObjectRef<K>> {
    object_ref(obj).context(RejectedSnafu {
        operation,
        object: ObjectRef::<K>::new(&obj.name_any())
            .within(&obj.namespace().unwrap_or_default())
            .erase(),
        message: "object has no name or namespace",
    })
}

/// Maps API status codes onto the error classes the controllers react to.
fn api_error(source: kube::Error, operation: &'static str, object: ObjectRef<DynamicObject>) -> Error {
    if let kube::Error::Api(response) = &source {
        match response.code {
            404 => return Error::NotFound { object },
            // also covers AlreadyExists on create
            409 => return Error::Conflict { object },
            400 | 422 => {
                return Error::Rejected {
                    operation,
                    object,
                    message: response.message.clone(),
                };
            }
            _ => {}
        }
    }
    Error::Kube {
        source,
        operation,
        object,
    }
}
