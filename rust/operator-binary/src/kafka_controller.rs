//! Ensures that the pods of each [`KafkaCluster`] match its node pools and configuration.
//!
//! Every pass starts from the latest cluster and node pool specifications. It rebuilds the
//! topology, fingerprints and pod sets from scratch, writes them, and then waits for the
//! [`PodSetController`] to converge the pods before it reports the cluster status.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use const_format::concatcp;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    kube::{ResourceExt, core::DynamicObject, runtime::reflector::ObjectRef},
    logging::controller::ReconcilerError,
    status::condition::{ClusterConditionStatus, ClusterConditionType},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    backend::{self, ClusterStore, ErrorClass, PodStore},
    config::ControllerConfig,
    crd::{
        KafkaCluster, OPERATOR_NAME,
        condition::PassConditions,
        node_pool::{KafkaNodePool, KafkaNodePoolStatus},
    },
    fingerprint::{RelevanceTable, role_fingerprints},
    pod_set_controller::{PassOutcome, PassResult, PodSetController, PodSetRef, error_message},
    resource::{
        pod::PodTemplate,
        pod_set::{self, build_pod_sets},
        pvc::{self, build_pvcs},
    },
    topology::{self, Topology, build_topology},
    work_queue::{EnqueueOutcome, Task, WorkQueue, run_workers},
};

pub const KAFKA_CONTROLLER_NAME: &str = "kafkacluster";
pub const KAFKA_FULL_CONTROLLER_NAME: &str = concatcp!(KAFKA_CONTROLLER_NAME, '.', OPERATOR_NAME);

/// Condition reason for clusters that cannot be reconciled until their specification changes.
pub const INVALID_SPECIFICATION_REASON: &str = "InvalidSpecification";

pub type ClusterRef = ObjectRef<KafkaCluster>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("failed to read the KafkaCluster"))]
    GetCluster { source: backend::Error },

    #[snafu(display("failed to list the node pools of the cluster"))]
    ListNodePools { source: backend::Error },

    #[snafu(display("invalid cluster topology"))]
    BuildTopology { source: topology::Error },

    #[snafu(display("failed to build the pod sets"))]
    BuildPodSets { source: pod_set::Error },

    #[snafu(display("failed to build the PersistentVolumeClaims"))]
    BuildPvcs { source: pvc::Error },

    #[snafu(display("failed to create PersistentVolumeClaim {name}"))]
    EnsurePvc {
        source: backend::Error,
        name: String,
    },

    #[snafu(display("failed to apply pod set {name}"))]
    ApplyPodSet {
        source: backend::Error,
        name: String,
    },

    #[snafu(display("failed to list the pod sets of the cluster"))]
    ListPodSets { source: backend::Error },

    #[snafu(display("failed to delete orphaned pod set {name}"))]
    DeleteOrphanedPodSet {
        source: backend::Error,
        name: String,
    },

    #[snafu(display("failed to update the status of node pool {pool}"))]
    UpdateNodePoolStatus {
        source: backend::Error,
        pool: String,
    },

    #[snafu(display("failed to update the cluster status"))]
    UpdateClusterStatus { source: backend::Error },

    #[snafu(display("pod set {name} is invalid"))]
    InvalidPodSet { name: String },

    #[snafu(display("pod set {name} was deleted while the cluster was reconciled"))]
    PodSetDeleted { name: String },

    #[snafu(display(
        "pod sets did not converge within {timeout:?}: {}",
        pending.join(", ")
    ))]
    ConvergenceTimeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[snafu(display("the pod set controller has stopped"))]
    PodSetControllerStopped,
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::EnsurePvc { source, .. }
            | Error::ApplyPodSet { source, .. }
            | Error::DeleteOrphanedPodSet { source, .. }
            | Error::UpdateNodePoolStatus { source, .. } => Some(source.object().clone()),
            _ => None,
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::GetCluster { source }
            | Error::ListNodePools { source }
            | Error::EnsurePvc { source, .. }
            | Error::ApplyPodSet { source, .. }
            | Error::ListPodSets { source }
            | Error::DeleteOrphanedPodSet { source, .. }
            | Error::UpdateNodePoolStatus { source, .. }
            | Error::UpdateClusterStatus { source } => source.class(),
            Error::BuildTopology { .. }
            | Error::BuildPodSets { .. }
            | Error::BuildPvcs { .. }
            | Error::InvalidPodSet { .. } => ErrorClass::Invalid,
            Error::PodSetDeleted { .. }
            | Error::ConvergenceTimeout { .. }
            | Error::PodSetControllerStopped => ErrorClass::Transient,
        }
    }
}

pub struct KafkaController<B> {
    backend: Arc<B>,
    pod_sets: Arc<PodSetController<B>>,
    relevance: Arc<RelevanceTable>,
    config: ControllerConfig,
    queue: Arc<WorkQueue<ClusterRef>>,
    /// Consecutive failed passes per cluster.
    failed_passes: Mutex<HashMap<ClusterRef, u32>>,
}

impl<B: ClusterStore + PodStore + 'static> KafkaController<B> {
    pub fn new(
        backend: Arc<B>,
        pod_sets: Arc<PodSetController<B>>,
        relevance: Arc<RelevanceTable>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(
                KAFKA_CONTROLLER_NAME,
                config.queue_capacity,
            )),
            backend,
            pod_sets,
            relevance,
            config,
            failed_passes: Mutex::default(),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ClusterRef>> {
        &self.queue
    }

    /// Requests a reconciliation pass for `cluster`. `reason` is only used for logging.
    pub fn trigger(&self, cluster: ClusterRef, reason: impl Into<String>) -> EnqueueOutcome {
        self.queue.enqueue(cluster, reason)
    }

    /// Processes the queue with the configured number of workers until it is closed.
    pub async fn run(self: Arc<Self>) {
        let queue = Arc::clone(&self.queue);
        let workers = self.config.workers;
        tracing::info!(
            controller = KAFKA_FULL_CONTROLLER_NAME,
            workers,
            "starting controller"
        );
        run_workers(queue, workers, move |task| {
            let controller = Arc::clone(&self);
            async move { controller.reconcile(&task).await }
        })
        .await;
    }

    /// Runs one pass for `task`, returning when the cluster should be looked at again.
    #[tracing::instrument(
        skip(self, task),
        fields(cluster = %task.key, reconciliation = task.id, reason = %task.reason)
    )]
    pub async fn reconcile(&self, task: &Task<ClusterRef>) -> Option<Duration> {
        let kafka = match self
            .backend
            .get_cluster(&task.key)
            .await
            .context(GetClusterSnafu)
        {
            Ok(Some(kafka)) => kafka,
            Ok(None) => {
                tracing::debug!("cluster no longer exists");
                self.failures().remove(&task.key);
                return None;
            }
            Err(err) => return self.handle_error(None, task, err).await,
        };

        match self.reconcile_cluster(&kafka, task).await {
            Ok(pod_sets) => {
                self.failures().remove(&task.key);
                tracing::info!(pod_sets, "cluster reconciled");
                None
            }
            Err(err) => self.handle_error(Some(&kafka), task, err).await,
        }
    }

    /// One full pass, returning the number of converged pod sets.
    async fn reconcile_cluster(
        &self,
        kafka: &KafkaCluster,
        task: &Task<ClusterRef>,
    ) -> Result<usize> {
        let key = &task.key;
        let pools = self
            .backend
            .list_node_pools(key)
            .await
            .context(ListNodePoolsSnafu)?;
        let topology = build_topology(kafka, &pools).context(BuildTopologySnafu)?;
        let fingerprints = role_fingerprints(&kafka.spec.config, &self.relevance, &topology);
        tracing::debug!(
            nodes = topology.nodes.len(),
            ?fingerprints,
            "built cluster topology"
        );

        let template = PodTemplate::new(kafka, &topology, KAFKA_CONTROLLER_NAME);
        let pod_sets =
            build_pod_sets(&topology, &template, &fingerprints).context(BuildPodSetsSnafu)?;
        let pvcs = build_pvcs(&topology, &template).context(BuildPvcsSnafu)?;

        for pvc in &pvcs {
            let name = pvc.name_any();
            if self
                .backend
                .ensure_pvc(pvc)
                .await
                .context(EnsurePvcSnafu { name: &name })?
            {
                tracing::info!(pvc = name, "created PersistentVolumeClaim");
            }
        }

        // subscribe before writing, so that no outcome of the new generations is missed
        let mut outcomes = self.pod_sets.subscribe();
        let mut written = HashMap::new();
        for pod_set in &pod_sets {
            let name = pod_set.name_any();
            let applied = self
                .backend
                .apply_pod_set(pod_set)
                .await
                .context(ApplyPodSetSnafu { name: &name })?;
            written.insert(ObjectRef::from_obj(&applied), applied.metadata.generation);
        }

        let desired = pod_sets
            .iter()
            .map(|pod_set| pod_set.name_any())
            .collect::<BTreeSet<_>>();
        for orphan in self
            .backend
            .list_pod_sets(key)
            .await
            .context(ListPodSetsSnafu)?
        {
            let name = orphan.name_any();
            if desired.contains(&name) {
                continue;
            }
            tracing::info!(pod_set = name, "deleting pod set of a removed node pool");
            self.backend
                .delete_pod_set(&ObjectRef::from_obj(&orphan))
                .await
                .context(DeleteOrphanedPodSetSnafu { name: &name })?;
        }

        self.update_node_pool_statuses(&pools, &topology).await?;

        let reason = format!("reconciliation {} of cluster {key}", task.id);
        for pod_set in written.keys() {
            self.pod_sets.enqueue(pod_set.clone(), reason.as_str());
        }
        self.wait_for_pod_sets(&mut outcomes, written, &reason).await?;

        self.report_converged(kafka, task, pod_sets.len()).await?;
        Ok(pod_sets.len())
    }

    /// Records the node ids handed out to each pool, which later passes build upon.
    async fn update_node_pool_statuses(
        &self,
        pools: &[KafkaNodePool],
        topology: &Topology,
    ) -> Result<()> {
        for pool_topology in topology.pools.iter().filter(|pool| !pool.implicit) {
            let Some(pool) = pools
                .iter()
                .find(|pool| pool.name_unchecked() == pool_topology.name)
            else {
                continue;
            };
            let status = KafkaNodePoolStatus {
                node_ids: pool_topology.node_ids.clone(),
                roles: pool_topology.roles.clone(),
                replicas: pool.spec.replicas,
                observed_generation: pool_topology.generation,
            };
            if pool.status.as_ref() == Some(&status) {
                continue;
            }
            self.backend
                .update_node_pool_status(pool, &status)
                .await
                .context(UpdateNodePoolStatusSnafu {
                    pool: &pool_topology.name,
                })?;
        }
        Ok(())
    }

    /// Waits until every pod set in `pending` converged at or beyond the generation written for
    /// it.
    async fn wait_for_pod_sets(
        &self,
        outcomes: &mut broadcast::Receiver<PassOutcome>,
        mut pending: HashMap<PodSetRef, Option<i64>>,
        reason: &str,
    ) -> Result<()> {
        let timeout = self.config.convergence_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        while !pending.is_empty() {
            let outcome = match tokio::time::timeout_at(deadline, outcomes.recv()).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(RecvError::Lagged(missed))) => {
                    tracing::debug!(missed, "missed pod set outcomes, resubmitting pod sets");
                    for pod_set in pending.keys() {
                        self.pod_sets.enqueue(pod_set.clone(), reason);
                    }
                    continue;
                }
                Ok(Err(RecvError::Closed)) => return PodSetControllerStoppedSnafu.fail(),
                Err(_) => {
                    let mut pending = pending
                        .keys()
                        .map(|pod_set| pod_set.name.clone())
                        .collect::<Vec<_>>();
                    pending.sort();
                    return ConvergenceTimeoutSnafu { timeout, pending }.fail();
                }
            };

            let Some(written) = pending.get(&outcome.pod_set) else {
                continue;
            };
            if outcome.generation < *written && outcome.result != PassResult::Deleted {
                // a pass that started before the write
                continue;
            }
            match outcome.result {
                PassResult::Converged => {
                    tracing::debug!(pod_set = %outcome.pod_set, "pod set converged");
                    pending.remove(&outcome.pod_set);
                }
                PassResult::Invalid => {
                    return InvalidPodSetSnafu {
                        name: &outcome.pod_set.name,
                    }
                    .fail();
                }
                PassResult::Deleted => {
                    return PodSetDeletedSnafu {
                        name: &outcome.pod_set.name,
                    }
                    .fail();
                }
                PassResult::Progressing | PassResult::Failed => {}
            }
        }
        Ok(())
    }

    async fn report_converged(
        &self,
        kafka: &KafkaCluster,
        task: &Task<ClusterRef>,
        pod_sets: usize,
    ) -> Result<()> {
        let conditions = PassConditions::new()
            .with(
                ClusterConditionType::Available,
                ClusterConditionStatus::True,
                "Reconciled",
                Some(format!("{pod_sets} pod sets converged")),
            )
            .with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::False,
                "Reconciled",
                None,
            )
            .with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::False,
                "Reconciled",
                None,
            );
        self.update_status(kafka, task, &conditions)
            .await
            .context(UpdateClusterStatusSnafu)
    }

    /// Merges `conditions` into the cluster status. Nothing is written if the status would not
    /// change.
    async fn update_status(
        &self,
        kafka: &KafkaCluster,
        task: &Task<ClusterRef>,
        conditions: &PassConditions,
    ) -> backend::Result<()> {
        let current = kafka.status.clone().unwrap_or_default();
        let mut status = current.clone();
        status.conditions = conditions.compute(kafka);
        status.observed_generation = kafka.metadata.generation;
        status.cluster_id = kafka.cluster_id().map(str::to_string);
        if status == current {
            return Ok(());
        }

        status.last_reconciliation = Some(task.id.to_string());
        self.backend.update_cluster_status(kafka, &status).await
    }

    async fn handle_error(
        &self,
        kafka: Option<&KafkaCluster>,
        task: &Task<ClusterRef>,
        err: Error,
    ) -> Option<Duration> {
        let message = error_message(&err);
        match err.class() {
            ErrorClass::Invalid => {
                tracing::warn!(
                    category = err.category(),
                    error = &err as &dyn std::error::Error,
                    "cluster specification is invalid, not retrying until it changes"
                );
                self.failures().remove(&task.key);
                if let Some(kafka) = kafka {
                    self.report_failure(kafka, task, INVALID_SPECIFICATION_REASON, message)
                        .await;
                }
                None
            }
            ErrorClass::Conflict => {
                tracing::debug!(
                    category = err.category(),
                    error = &err as &dyn std::error::Error,
                    "conflict, retrying"
                );
                Some(Duration::ZERO)
            }
            ErrorClass::Transient => {
                let failed_passes = {
                    let mut failures = self.failures();
                    let failed_passes = failures.entry(task.key.clone()).or_default();
                    *failed_passes += 1;
                    *failed_passes
                };
                let retry_in = self.config.backoff(failed_passes);
                tracing::error!(
                    category = err.category(),
                    error = &err as &dyn std::error::Error,
                    failed_passes,
                    ?retry_in,
                    "failed to reconcile cluster"
                );
                if failed_passes > self.config.max_retries {
                    if let Some(kafka) = kafka {
                        self.report_failure(
                            kafka,
                            task,
                            "ReconciliationFailing",
                            format!("passes keep failing: {message}"),
                        )
                        .await;
                    }
                }
                Some(retry_in)
            }
        }
    }

    async fn report_failure(
        &self,
        kafka: &KafkaCluster,
        task: &Task<ClusterRef>,
        reason: &str,
        message: String,
    ) {
        let conditions = PassConditions::new()
            .with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::True,
                reason,
                Some(message),
            )
            .with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::False,
                reason,
                None,
            );
        if let Err(err) = self.update_status(kafka, task, &conditions).await {
            tracing::warn!(error = %err, "failed to report cluster failure");
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<ClusterRef, u32>> {
        self.failed_passes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
