//! In-memory backend for controller tests.
//!
//! Mimics the parts of the API server the controllers rely on: generations, resource versions,
//! optimistic concurrency and garbage collection of the pods of a deleted pod set. Failures can
//! be injected per operation and object name. Created pods report readiness right away unless
//! told otherwise.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus},
    kube::{Resource, ResourceExt, runtime::reflector::ObjectRef},
};

use crate::{
    backend::{ClusterStore, Error, PodStore, Result},
    crd::{
        KafkaCluster, KafkaClusterStatus,
        node_pool::{KafkaNodePool, KafkaNodePoolStatus},
        pod_set::{KafkaPodSet, KafkaPodSetStatus},
    },
    utils::{LABEL_CLUSTER, LABEL_POD_SET},
};

/// Namespace and name.
type Key = (String, String);

/// A mutating pod operation, as recorded by [`MemoryBackend::operations`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PodOperation {
    Create(String),
    Patch(String),
    Delete(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    Create,
    Patch,
    Delete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Failure {
    Conflict,
    Timeout,
}

struct InjectedFailure {
    kind: OperationKind,
    name: String,
    failure: Failure,
    remaining: u32,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<Key, KafkaCluster>,
    node_pools: BTreeMap<Key, KafkaNodePool>,
    pod_sets: BTreeMap<Key, KafkaPodSet>,
    pods: BTreeMap<Key, Pod>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    operations: Vec<PodOperation>,
    failures: Vec<InjectedFailure>,
    resource_version: u64,
    create_unready: bool,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Consumes one injected failure matching the operation, if any.
    fn injected(&mut self, kind: OperationKind, pod: &ObjectRef<Pod>) -> Result<()> {
        let Some(position) = self
            .failures
            .iter()
            .position(|f| f.kind == kind && f.name == pod.name && f.remaining > 0)
        else {
            return Ok(());
        };
        let injected = &mut self.failures[position];
        injected.remaining -= 1;
        match injected.failure {
            Failure::Conflict => Err(Error::Conflict {
                object: pod.clone().erase(),
            }),
            Failure::Timeout => Err(Error::Timeout {
                operation: "pod operation",
                object: pod.clone().erase(),
                timeout: Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cluster(&self, mut kafka: KafkaCluster) {
        let key = key_of(&kafka);
        let mut state = self.lock();
        let previous = state.clusters.get(&key);
        kafka.status = previous.and_then(|previous| previous.status.clone());
        kafka.metadata.generation =
            Some(previous.and_then(|p| p.metadata.generation).unwrap_or(0) + 1);
        kafka.metadata.resource_version = Some(state.next_resource_version());
        state.clusters.insert(key, kafka);
    }

    pub fn put_node_pool(&self, mut pool: KafkaNodePool) {
        let key = key_of(&pool);
        let mut state = self.lock();
        let previous = state.node_pools.get(&key);
        pool.status = previous.and_then(|previous| previous.status.clone());
        pool.metadata.generation =
            Some(previous.and_then(|p| p.metadata.generation).unwrap_or(0) + 1);
        pool.metadata.resource_version = Some(state.next_resource_version());
        state.node_pools.insert(key, pool);
    }

    pub fn delete_node_pool(&self, pool: &ObjectRef<KafkaNodePool>) {
        self.lock().node_pools.remove(&ref_key(pool));
    }

    pub fn cluster(&self, cluster: &ObjectRef<KafkaCluster>) -> Option<KafkaCluster> {
        self.lock().clusters.get(&ref_key(cluster)).cloned()
    }

    pub fn node_pool(&self, pool: &ObjectRef<KafkaNodePool>) -> Option<KafkaNodePool> {
        self.lock().node_pools.get(&ref_key(pool)).cloned()
    }

    pub fn pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Option<KafkaPodSet> {
        self.lock().pod_sets.get(&ref_key(pod_set)).cloned()
    }

    pub fn pod(&self, pod: &ObjectRef<Pod>) -> Option<Pod> {
        self.lock().pods.get(&ref_key(pod)).cloned()
    }

    /// Every pod, ordered by namespace and name.
    pub fn pods(&self) -> Vec<Pod> {
        self.lock().pods.values().cloned().collect()
    }

    pub fn pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.lock().pvcs.values().cloned().collect()
    }

    /// Stores a pod as is, as if it was changed by someone else.
    pub fn put_pod(&self, mut pod: Pod) {
        let key = key_of(&pod);
        let mut state = self.lock();
        pod.metadata.resource_version = Some(state.next_resource_version());
        state.pods.insert(key, pod);
    }

    /// Lets pods created from now on start out unready, until [`mark_ready`](Self::mark_ready).
    pub fn create_unready_pods(&self, unready: bool) {
        self.lock().create_unready = unready;
    }

    /// Lets the pod report readiness, as its readiness check would once Kafka is up.
    pub fn mark_ready(&self, pod: &ObjectRef<Pod>) {
        let mut state = self.lock();
        let resource_version = state.next_resource_version();
        if let Some(pod) = state.pods.get_mut(&ref_key(pod)) {
            set_ready(pod, true);
            pod.metadata.resource_version = Some(resource_version);
        }
    }

    /// Mutating pod operations in the order they were attempted, including failed ones.
    pub fn operations(&self) -> Vec<PodOperation> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Lets the next `times` operations of `kind` on the pod `name` fail.
    pub fn inject_failure(&self, kind: OperationKind, name: &str, failure: Failure, times: u32) {
        self.lock().failures.push(InjectedFailure {
            kind,
            name: name.to_string(),
            failure,
            remaining: times,
        });
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl PodStore for MemoryBackend {
    async fn get_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<Option<KafkaPodSet>> {
        Ok(self.pod_set(pod_set))
    }

    async fn list_pods(&self, pod_set: &KafkaPodSet) -> Result<Vec<Pod>> {
        let (namespace, name) = key_of(pod_set);
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|((pod_namespace, _), pod)| {
                *pod_namespace == namespace && pod.labels().get(LABEL_POD_SET) == Some(&name)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let key = key_of(pod);
        let object = ObjectRef::<Pod>::new(&key.1).within(&key.0);
        let mut state = self.lock();
        state.operations.push(PodOperation::Create(key.1.clone()));
        state.injected(OperationKind::Create, &object)?;
        if state.pods.contains_key(&key) {
            return Err(Error::Conflict {
                object: object.erase(),
            });
        }

        let mut pod = pod.clone();
        pod.metadata.uid = Some(format!("uid-{}", key.1));
        pod.metadata.resource_version = Some(state.next_resource_version());
        set_ready(&mut pod, !state.create_unready);
        state.pods.insert(key, pod);
        Ok(())
    }

    async fn patch_pod_metadata(
        &self,
        pod: &ObjectRef<Pod>,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.operations.push(PodOperation::Patch(pod.name.clone()));
        state.injected(OperationKind::Patch, pod)?;
        let next_resource_version = state.next_resource_version();
        let stored = state
            .pods
            .get_mut(&ref_key(pod))
            .ok_or_else(|| Error::NotFound {
                object: pod.clone().erase(),
            })?;
        if resource_version.is_some()
            && stored.metadata.resource_version.as_deref() != resource_version
        {
            return Err(Error::Conflict {
                object: pod.clone().erase(),
            });
        }

        stored
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        stored
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        stored.metadata.resource_version = Some(next_resource_version);
        Ok(())
    }

    async fn delete_pod(&self, pod: &ObjectRef<Pod>) -> Result<()> {
        let mut state = self.lock();
        state.operations.push(PodOperation::Delete(pod.name.clone()));
        state.injected(OperationKind::Delete, pod)?;
        state.pods.remove(&ref_key(pod));
        Ok(())
    }

    async fn update_pod_set_status(
        &self,
        pod_set: &KafkaPodSet,
        status: &KafkaPodSetStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .pod_sets
            .get_mut(&key_of(pod_set))
            .ok_or_else(|| Error::NotFound {
                object: ObjectRef::from_obj(pod_set).erase(),
            })?;
        stored.status = Some(status.clone());
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemoryBackend {
    async fn get_cluster(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Option<KafkaCluster>> {
        Ok(self.cluster(cluster))
    }

    async fn list_node_pools(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaNodePool>> {
        let (namespace, name) = ref_key(cluster);
        Ok(self
            .lock()
            .node_pools
            .iter()
            .filter(|((pool_namespace, _), pool)| {
                *pool_namespace == namespace && pool.labels().get(LABEL_CLUSTER) == Some(&name)
            })
            .map(|(_, pool)| pool.clone())
            .collect())
    }

    async fn list_pod_sets(&self, cluster: &ObjectRef<KafkaCluster>) -> Result<Vec<KafkaPodSet>> {
        let (namespace, name) = ref_key(cluster);
        Ok(self
            .lock()
            .pod_sets
            .iter()
            .filter(|((pod_set_namespace, _), pod_set)| {
                *pod_set_namespace == namespace
                    && pod_set.labels().get(LABEL_CLUSTER) == Some(&name)
            })
            .map(|(_, pod_set)| pod_set.clone())
            .collect())
    }

    async fn apply_pod_set(&self, pod_set: &KafkaPodSet) -> Result<KafkaPodSet> {
        let key = key_of(pod_set);
        let mut state = self.lock();
        let resource_version = state.next_resource_version();
        let mut applied = pod_set.clone();
        match state.pod_sets.get(&key) {
            Some(stored) => {
                let generation = stored.metadata.generation.unwrap_or(1);
                applied.metadata.uid = stored.metadata.uid.clone();
                applied.metadata.generation = Some(if stored.spec == pod_set.spec {
                    generation
                } else {
                    generation + 1
                });
                applied.status = stored.status.clone();
            }
            None => {
                applied.metadata.uid = Some(format!("uid-{}", key.1));
                applied.metadata.generation = Some(1);
            }
        }
        applied.metadata.resource_version = Some(resource_version);
        state.pod_sets.insert(key, applied.clone());
        Ok(applied)
    }

    async fn delete_pod_set(&self, pod_set: &ObjectRef<KafkaPodSet>) -> Result<()> {
        let (namespace, name) = ref_key(pod_set);
        let mut state = self.lock();
        state.pod_sets.remove(&(namespace.clone(), name.clone()));
        // owned pods are garbage collected
        state.pods.retain(|(pod_namespace, _), pod| {
            *pod_namespace != namespace || pod.labels().get(LABEL_POD_SET) != Some(&name)
        });
        Ok(())
    }

    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let key = key_of(pvc);
        let mut state = self.lock();
        if state.pvcs.contains_key(&key) {
            return Ok(false);
        }
        state.pvcs.insert(key, pvc.clone());
        Ok(true)
    }

    async fn update_cluster_status(
        &self,
        kafka: &KafkaCluster,
        status: &KafkaClusterStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .clusters
            .get_mut(&key_of(kafka))
            .ok_or_else(|| Error::NotFound {
                object: ObjectRef::from_obj(kafka).erase(),
            })?;
        stored.status = Some(status.clone());
        Ok(())
    }

    async fn update_node_pool_status(
        &self,
        pool: &KafkaNodePool,
        status: &KafkaNodePoolStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .node_pools
            .get_mut(&key_of(pool))
            .ok_or_else(|| Error::NotFound {
                object: ObjectRef::from_obj(pool).erase(),
            })?;
        stored.status = Some(status.clone());
        Ok(())
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn ref_key<K: Resource>(obj: &ObjectRef<K>) -> Key {
    (obj.namespace.clone().unwrap_or_default(), obj.name.clone())
}

fn set_ready(pod: &mut Pod, ready: bool) {
    pod.status.get_or_insert_with(PodStatus::default).conditions = Some(vec![PodCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        ..PodCondition::default()
    }]);
}
