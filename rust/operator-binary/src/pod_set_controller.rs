//! Converges the pods of every [`KafkaPodSet`] to the pods it declares.
//!
//! A pass compares the declared pods with the observed ones and then deletes, creates and patches
//! pods, each as an independent operation. Pods whose revision changed are rolled one at a time:
//! a pass deletes at most one of them, a later pass re-creates it once it is gone, and the next
//! one is only rolled after every pod of the set is Ready again.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use const_format::concatcp;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::Pod,
    kube::{ResourceExt, core::DynamicObject, runtime::reflector::ObjectRef},
    logging::controller::ReconcilerError,
    status::condition::{ClusterConditionStatus, ClusterConditionType},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::sync::broadcast;

use crate::{
    backend::{self, ErrorClass, PodStore},
    config::ControllerConfig,
    crd::{
        OPERATOR_NAME,
        condition::PassConditions,
        pod_set::{KafkaPodSet, KafkaPodSetStatus, POD_REVISION_ANNOTATION},
    },
    utils::{LABEL_POD_SET, hash_token},
    work_queue::{EnqueueOutcome, Task, WorkQueue, run_workers},
};

pub const POD_SET_CONTROLLER_NAME: &str = "kafkapodset";
pub const POD_SET_FULL_CONTROLLER_NAME: &str =
    concatcp!(POD_SET_CONTROLLER_NAME, '.', OPERATOR_NAME);

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

pub type PodSetRef = ObjectRef<KafkaPodSet>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to read the pod set"))]
    GetPodSet { source: backend::Error },

    #[snafu(display("failed to list the pods of the pod set"))]
    ListPods { source: backend::Error },

    #[snafu(display("invalid pod set"))]
    InvalidPodSet {
        source: crate::crd::pod_set::Error,
    },

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to compute the revision of pod {name}"))]
    SerializePod {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update the pod set status"))]
    UpdateStatus { source: backend::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::ListPods { source } | Error::UpdateStatus { source } => {
                Some(source.object().clone())
            }
            _ => None,
        }
    }
}

impl Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::GetPodSet { source }
            | Error::ListPods { source }
            | Error::UpdateStatus { source } => source.class(),
            Error::InvalidPodSet { .. }
            | Error::ObjectMissingMetadataForOwnerRef { .. }
            | Error::SerializePod { .. } => ErrorClass::Invalid,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PassResult {
    /// Every declared pod exists at its current revision.
    Converged,
    /// Pods are being rolled or are still terminating.
    Progressing,
    /// At least one operation failed, the pod set is retried.
    Failed,
    /// The pod set cannot be acted on until it changes.
    Invalid,
    /// The pod set no longer exists.
    Deleted,
}

/// Sent to every subscriber after each pass.
#[derive(Clone, Debug)]
pub struct PassOutcome {
    pub pod_set: PodSetRef,
    /// Generation of the pod set the pass worked on.
    pub generation: Option<i64>,
    pub result: PassResult,
    pub reconciliation: u64,
}

#[derive(Debug, Default)]
struct FailureCounts {
    /// Consecutive failed passes.
    passes: u32,
    /// Consecutive failed operations per pod.
    pods: BTreeMap<String, u32>,
}

pub struct PodSetController<B> {
    backend: Arc<B>,
    config: ControllerConfig,
    queue: Arc<WorkQueue<PodSetRef>>,
    outcomes: broadcast::Sender<PassOutcome>,
    failures: Mutex<HashMap<PodSetRef, FailureCounts>>,
}

impl<B: PodStore + 'static> PodSetController<B> {
    pub fn new(backend: Arc<B>, config: ControllerConfig) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            queue: Arc::new(WorkQueue::new(
                POD_SET_CONTROLLER_NAME,
                config.queue_capacity,
            )),
            backend,
            config,
            outcomes,
            failures: Mutex::default(),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<PodSetRef>> {
        &self.queue
    }

    pub fn enqueue(&self, pod_set: PodSetRef, reason: impl Into<String>) -> EnqueueOutcome {
        self.queue.enqueue(pod_set, reason)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PassOutcome> {
        self.outcomes.subscribe()
    }

    /// Processes the queue with the configured number of workers until it is closed.
    pub async fn run(self: Arc<Self>) {
        let queue = Arc::clone(&self.queue);
        let workers = self.config.workers;
        tracing::info!(
            controller = POD_SET_FULL_CONTROLLER_NAME,
            workers,
            "starting controller"
        );
        run_workers(queue, workers, move |task| {
            let controller = Arc::clone(&self);
            async move { controller.reconcile(&task).await }
        })
        .await;
    }

    /// Runs one pass for `task`, returning when the pod set should be looked at again.
    #[tracing::instrument(
        skip(self, task),
        fields(pod_set = %task.key, reconciliation = task.id, reason = %task.reason)
    )]
    pub async fn reconcile(&self, task: &Task<PodSetRef>) -> Option<Duration> {
        let (generation, result, requeue) = match self.reconcile_pod_set(task).await {
            Ok(pass) => pass,
            Err(err) => {
                let requeue = self.retry_delay(&task.key, err.class());
                tracing::error!(
                    category = err.category(),
                    error = &err as &dyn std::error::Error,
                    ?requeue,
                    "pod set pass failed"
                );
                (None, PassResult::Failed, requeue)
            }
        };

        // nobody listening is fine
        let _ = self.outcomes.send(PassOutcome {
            pod_set: task.key.clone(),
            generation,
            result,
            reconciliation: task.id,
        });
        requeue
    }

    async fn reconcile_pod_set(
        &self,
        task: &Task<PodSetRef>,
    ) -> Result<(Option<i64>, PassResult, Option<Duration>)> {
        let Some(pod_set) = self
            .backend
            .get_pod_set(&task.key)
            .await
            .context(GetPodSetSnafu)?
        else {
            tracing::debug!("pod set no longer exists");
            self.counts().remove(&task.key);
            return Ok((None, PassResult::Deleted, None));
        };
        let generation = pod_set.metadata.generation;

        let desired = match pod_set
            .spec
            .validate()
            .context(InvalidPodSetSnafu)
            .and_then(|()| prepare_pods(&pod_set))
        {
            Ok(desired) => desired,
            Err(err) => {
                self.report_invalid(&pod_set, task, &err).await;
                self.counts().remove(&task.key);
                return Ok((generation, PassResult::Invalid, None));
            }
        };

        let observed = self
            .backend
            .list_pods(&pod_set)
            .await
            .context(ListPodsSnafu)?;
        let plan = plan(&desired, &observed);
        let applied = self.apply(&task.key, &plan).await;

        let (result, requeue) = if !applied.failures.is_empty() {
            let class = if applied
                .failures
                .iter()
                .all(|(_, err)| err.class() == ErrorClass::Conflict)
            {
                ErrorClass::Conflict
            } else {
                ErrorClass::Transient
            };
            (PassResult::Failed, self.retry_delay(&task.key, class))
        } else if plan.stale > 0 || plan.terminating > 0 {
            self.reset_passes(&task.key);
            (PassResult::Progressing, Some(self.config.backoff_base))
        } else {
            self.reset_passes(&task.key);
            (PassResult::Converged, None)
        };

        if applied.changed() || plan.terminating > 0 || !applied.failures.is_empty() {
            tracing::info!(
                created = applied.created,
                deleted = applied.deleted,
                patched = applied.patched,
                failed = applied.failures.len(),
                outdated = plan.stale,
                terminating = plan.terminating,
                ?result,
                "pod set pass finished"
            );
        } else if plan.stale > 0 {
            tracing::debug!(
                outdated = plan.stale,
                "waiting for pods to become ready before rolling the next one"
            );
        } else {
            tracing::debug!("pod set is up to date");
        }

        let status = self.status(&pod_set, task, &desired, &observed, &plan, &applied, result);
        self.write_status(&pod_set, task, status)
            .await
            .context(UpdateStatusSnafu)?;

        Ok((generation, result, requeue))
    }

    /// Runs the operations of `plan`: deletions first, then creations, then metadata patches.
    async fn apply(&self, pod_set: &PodSetRef, plan: &Plan) -> Applied {
        let mut applied = Applied::default();
        for pod in &plan.deletes {
            let result = self.backend.delete_pod(pod).await;
            if self.record(pod_set, pod, "delete", result, &mut applied) {
                applied.deleted += 1;
            }
        }
        for (pod_ref, pod) in &plan.creates {
            let result = self.backend.create_pod(pod).await;
            if self.record(pod_set, pod_ref, "create", result, &mut applied) {
                applied.created += 1;
            }
        }
        for patch in &plan.patches {
            let result = self
                .backend
                .patch_pod_metadata(
                    &patch.pod,
                    patch.resource_version.as_deref(),
                    &patch.labels,
                    &patch.annotations,
                )
                .await;
            if self.record(pod_set, &patch.pod, "patch", result, &mut applied) {
                applied.patched += 1;
            }
        }

        let known = plan.pods.iter().map(String::as_str).collect::<BTreeSet<_>>();
        if let Some(counts) = self.counts().get_mut(pod_set) {
            counts.pods.retain(|pod, _| known.contains(pod.as_str()));
        }
        applied
    }

    /// Tracks the outcome of one pod operation, returning whether it succeeded.
    fn record(
        &self,
        pod_set: &PodSetRef,
        pod: &ObjectRef<Pod>,
        operation: &'static str,
        result: backend::Result<()>,
        applied: &mut Applied,
    ) -> bool {
        let mut counts = self.counts();
        let counts = counts.entry(pod_set.clone()).or_default();
        match result {
            Ok(()) => {
                counts.pods.remove(&pod.name);
                true
            }
            Err(err) => {
                let failures = counts.pods.entry(pod.name.clone()).or_default();
                *failures += 1;
                tracing::warn!(
                    pod = %pod.name,
                    operation,
                    failures = *failures,
                    error = %err,
                    "pod operation failed"
                );
                applied.failures.push((pod.clone(), err));
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn status(
        &self,
        pod_set: &KafkaPodSet,
        task: &Task<PodSetRef>,
        desired: &[(ObjectRef<Pod>, Pod)],
        observed: &[Pod],
        plan: &Plan,
        applied: &Applied,
        result: PassResult,
    ) -> KafkaPodSetStatus {
        let (degraded_pods, failed_passes) = {
            let counts = self.counts();
            let counts = counts.get(&task.key);
            let degraded_pods = counts
                .map(|counts| {
                    counts
                        .pods
                        .iter()
                        .filter(|(_, failures)| **failures > self.config.max_retries)
                        .map(|(pod, _)| pod.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            (degraded_pods, counts.map(|counts| counts.passes).unwrap_or(0))
        };

        let pods = desired.len() as u32;
        let created_or_current = (plan.current + applied.created) as u32;
        let mut status = pod_set.status.clone().unwrap_or_default();
        status.observed_generation = pod_set.metadata.generation;
        status.pods = pods;
        status.current_pods = created_or_current;
        status.ready_pods = plan.ready as u32;
        status.degraded_pods = degraded_pods;

        let mut conditions = PassConditions::new();
        conditions = if created_or_current == pods && applied.failures.is_empty() {
            conditions.with(
                ClusterConditionType::Available,
                ClusterConditionStatus::True,
                "PodsCurrent",
                None,
            )
        } else {
            conditions.with(
                ClusterConditionType::Available,
                ClusterConditionStatus::False,
                "PodsPending",
                Some(format!(
                    "{created_or_current} of {pods} pods run the current revision"
                )),
            )
        };
        conditions = match result {
            PassResult::Progressing => conditions.with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::True,
                "RollingPods",
                Some(format!(
                    "{} pods are outdated, {} are terminating",
                    plan.stale, plan.terminating
                )),
            ),
            _ if applied.changed() => conditions.with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::True,
                "PodsChanged",
                None,
            ),
            _ => conditions.with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::False,
                "PodsStable",
                None,
            ),
        };
        conditions = if !status.degraded_pods.is_empty() {
            conditions.with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::True,
                "PodOperationsFailing",
                Some(format!(
                    "operations keep failing for {}",
                    status.degraded_pods.join(", ")
                )),
            )
        } else if failed_passes > self.config.max_retries {
            conditions.with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::True,
                "ReconciliationFailing",
                Some("passes keep failing".to_string()),
            )
        } else {
            conditions.with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::False,
                "Healthy",
                None,
            )
        };
        status.conditions = conditions.compute(pod_set);

        tracing::trace!(observed = observed.len(), ?status, "computed pod set status");
        status
    }

    /// Stores `status` unless it matches the current one, stamping it with the pass that
    /// changed it.
    async fn write_status(
        &self,
        pod_set: &KafkaPodSet,
        task: &Task<PodSetRef>,
        mut status: KafkaPodSetStatus,
    ) -> backend::Result<()> {
        let current = pod_set.status.as_ref();
        status.last_reconciliation = current.and_then(|s| s.last_reconciliation.clone());
        if current == Some(&status) {
            return Ok(());
        }
        status.last_reconciliation = Some(task.id.to_string());
        self.backend.update_pod_set_status(pod_set, &status).await
    }

    /// Marks a pod set that cannot be acted on as degraded. It is not retried until it changes.
    async fn report_invalid(&self, pod_set: &KafkaPodSet, task: &Task<PodSetRef>, err: &Error) {
        tracing::error!(
            category = err.category(),
            error = err as &dyn std::error::Error,
            "pod set is invalid"
        );

        let mut status = pod_set.status.clone().unwrap_or_default();
        status.observed_generation = pod_set.metadata.generation;
        // availability is left as the last valid pass found it
        let conditions = PassConditions::new()
            .with(
                ClusterConditionType::Degraded,
                ClusterConditionStatus::True,
                "InvalidPodSet",
                Some(error_message(err)),
            )
            .with(
                ClusterConditionType::Progressing,
                ClusterConditionStatus::False,
                "InvalidPodSet",
                None,
            );
        status.conditions = conditions.compute(pod_set);
        if let Err(err) = self.write_status(pod_set, task, status).await {
            tracing::warn!(error = %err, "failed to report invalid pod set");
        }
    }

    /// Delay before the next pass after a failed one. Conflicts are retried right away and do
    /// not count as failed passes.
    fn retry_delay(&self, pod_set: &PodSetRef, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::Conflict => Some(Duration::ZERO),
            ErrorClass::Invalid | ErrorClass::Transient => {
                let mut counts = self.counts();
                let counts = counts.entry(pod_set.clone()).or_default();
                counts.passes += 1;
                if counts.passes > self.config.max_retries {
                    tracing::warn!(
                        failed_passes = counts.passes,
                        "pod set keeps failing, retrying at the capped interval"
                    );
                }
                Some(self.config.backoff(counts.passes))
            }
        }
    }

    fn reset_passes(&self, pod_set: &PodSetRef) {
        if let Some(counts) = self.counts().get_mut(pod_set) {
            counts.passes = 0;
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<PodSetRef, FailureCounts>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Operations that converge the observed pods of one pod set.
#[derive(Debug, Default)]
struct Plan {
    /// Orphaned pods, and at most one pod of an outdated revision.
    deletes: Vec<ObjectRef<Pod>>,
    creates: Vec<(ObjectRef<Pod>, Pod)>,
    patches: Vec<MetadataPatch>,
    /// Declared pods running an outdated revision, including the one rolled by this pass.
    stale: usize,
    /// Declared pods whose previous instance has not terminated yet.
    terminating: usize,
    /// Declared pods running the current revision.
    current: usize,
    ready: usize,
    /// Names of all declared and observed pods.
    pods: BTreeSet<String>,
}

#[derive(Debug)]
struct MetadataPatch {
    pod: ObjectRef<Pod>,
    resource_version: Option<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Applied {
    created: usize,
    deleted: usize,
    patched: usize,
    failures: Vec<(ObjectRef<Pod>, backend::Error)>,
}

impl Applied {
    fn changed(&self) -> bool {
        self.created + self.deleted + self.patched > 0
    }
}

/// The declared pods as they are created: in the namespace of the pod set, labelled with and
/// owned by it, and annotated with the revision of the declared pod.
fn prepare_pods(pod_set: &KafkaPodSet) -> Result<Vec<(ObjectRef<Pod>, Pod)>> {
    let namespace = pod_set.namespace().unwrap_or_default();
    let pod_set_name = pod_set.name_any();
    let owner_references = ObjectMetaBuilder::new()
        .ownerreference_from_resource(pod_set, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu)?
        .build()
        .owner_references;

    pod_set
        .spec
        .pods
        .iter()
        .map(|declared| {
            let name = declared.name_any();
            let revision = hash_token(
                &serde_json::to_vec(declared).context(SerializePodSnafu { name: &name })?,
            );

            let mut pod = declared.clone();
            pod.metadata.namespace = Some(namespace.clone());
            pod.metadata.owner_references = owner_references.clone();
            pod.labels_mut()
                .insert(LABEL_POD_SET.to_string(), pod_set_name.clone());
            pod.annotations_mut()
                .insert(POD_REVISION_ANNOTATION.to_string(), revision);
            Ok((ObjectRef::new(&name).within(&namespace), pod))
        })
        .collect()
}

fn plan(desired: &[(ObjectRef<Pod>, Pod)], observed: &[Pod]) -> Plan {
    let observed_by_name = observed
        .iter()
        .map(|pod| (pod.name_any(), pod))
        .collect::<BTreeMap<_, _>>();
    let desired_names = desired
        .iter()
        .map(|(pod, _)| pod.name.as_str())
        .collect::<BTreeSet<_>>();

    let mut plan = Plan {
        pods: observed_by_name
            .keys()
            .cloned()
            .chain(desired_names.iter().map(|name| name.to_string()))
            .collect(),
        ..Plan::default()
    };

    for (name, pod) in &observed_by_name {
        if !desired_names.contains(name.as_str()) && !is_terminating(pod) {
            plan.deletes
                .push(ObjectRef::new(name).within(&pod.namespace().unwrap_or_default()));
        }
    }

    let mut stale = Vec::new();
    for (pod_ref, pod) in desired {
        match observed_by_name.get(&pod_ref.name) {
            None => plan.creates.push((pod_ref.clone(), pod.clone())),
            Some(current) if is_terminating(current) => plan.terminating += 1,
            Some(current) if revision(current) != revision(pod) => {
                stale.push((pod_ref, is_ready(current)));
            }
            Some(current) => {
                plan.current += 1;
                if is_ready(current) {
                    plan.ready += 1;
                }
                if let Some(patch) = metadata_patch(pod_ref, pod, current) {
                    plan.patches.push(patch);
                }
            }
        }
    }
    plan.stale = stale.len();

    // one pod at a time, and only while no other pod of the set is missing or terminating
    if plan.creates.is_empty() && plan.terminating == 0 {
        stale.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));
        let unready = stale.iter().find(|(_, ready)| !ready);
        let next = match unready {
            Some(unready) => Some(unready),
            None if plan.ready == plan.current => stale.first(),
            None => None,
        };
        if let Some((pod_ref, _)) = next {
            plan.deletes.push((*pod_ref).clone());
        }
    }
    plan
}

/// Labels and annotations of `desired` that are missing from or differ on `current`.
fn metadata_patch(pod: &ObjectRef<Pod>, desired: &Pod, current: &Pod) -> Option<MetadataPatch> {
    fn drifted(
        desired: &BTreeMap<String, String>,
        current: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        desired
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    let labels = drifted(desired.labels(), current.labels());
    let annotations = drifted(desired.annotations(), current.annotations());
    if labels.is_empty() && annotations.is_empty() {
        return None;
    }
    Some(MetadataPatch {
        pod: pod.clone(),
        resource_version: current.resource_version(),
        labels,
        annotations,
    })
}

fn revision(pod: &Pod) -> Option<&str> {
    pod.annotations()
        .get(POD_REVISION_ANNOTATION)
        .map(String::as_str)
}

fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// The error and all of its sources, outermost first.
pub fn error_message(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}
