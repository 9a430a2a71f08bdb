use std::{fmt::Debug, hash::Hash, sync::Arc};

use anyhow::Context;
use clap::{Parser, crate_description, crate_version};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use stackable_operator::{
    cli::{Command, ProductOperatorRun},
    client,
    k8s_openapi::api::core::v1::Pod,
    kube::{
        Api, CustomResourceExt, Resource, ResourceExt,
        runtime::{
            WatchStreamExt,
            reflector::{self, ObjectRef, store::Writer},
            watcher,
        },
    },
    namespace::WatchNamespace,
};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::{JoinHandle, JoinSet},
};

use crate::{
    backend::kube::KubeBackend,
    config::{ControllerArgs, ControllerConfig},
    crd::{APP_NAME, KafkaCluster, OPERATOR_NAME, node_pool::KafkaNodePool, pod_set::KafkaPodSet},
    fingerprint::RelevanceTable,
    kafka_controller::{KAFKA_FULL_CONTROLLER_NAME, KafkaController},
    pod_set_controller::PodSetController,
    utils::{LABEL_CLUSTER, LABEL_POD_SET},
};

mod backend;
mod config;
mod crd;
mod fingerprint;
mod kafka_controller;
mod pod_set_controller;
mod resource;
#[cfg(test)]
mod test_utils;
mod topology;
mod utils;
mod work_queue;

mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(clap::Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<KafkaPodSetRun>,
}

#[derive(clap::Parser)]
struct KafkaPodSetRun {
    #[clap(flatten)]
    controller: ControllerArgs,
    #[clap(flatten)]
    common: ProductOperatorRun,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            for crd in [KafkaCluster::crd(), KafkaNodePool::crd(), KafkaPodSet::crd()] {
                print!("---\n{}", serde_yaml::to_string(&crd)?);
            }
        }
        Command::Run(KafkaPodSetRun {
            controller,
            common:
                ProductOperatorRun {
                    product_config: _,
                    watch_namespace,
                    tracing_target,
                },
        }) => {
            stackable_operator::logging::initialize_logging(
                "KAFKA_PODSET_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let config =
                ControllerConfig::from_args(&controller).context("invalid controller settings")?;
            let relevance = RelevanceTable::load(
                controller.relevance_table.as_deref(),
                &[
                    "deploy/config-spec/relevance.yaml",
                    "/etc/stackable/kafka-podset-operator/config-spec/relevance.yaml",
                ],
            )
            .context("failed to load the configuration relevance table")?;
            tracing::info!(
                version = relevance.version(),
                keys = relevance.len(),
                "loaded configuration relevance table"
            );

            let client = client::create_client(Some(OPERATOR_NAME.to_string()))
                .await
                .context("failed to create Kubernetes client")?;
            run_operator(client, config, relevance, watch_namespace).await?;
        }
    };

    Ok(())
}

async fn run_operator(
    client: client::Client,
    config: ControllerConfig,
    relevance: RelevanceTable,
    namespace: WatchNamespace,
) -> anyhow::Result<()> {
    let (pods, pods_writer) = reflector::store::<Pod>();
    let (pod_set_store, pod_sets_writer) = reflector::store::<KafkaPodSet>();
    let (clusters, clusters_writer) = reflector::store::<KafkaCluster>();
    let (pools, pools_writer) = reflector::store::<KafkaNodePool>();

    let backend = Arc::new(KubeBackend::new(
        client.as_kube_client(),
        KAFKA_FULL_CONTROLLER_NAME,
        config.operation_timeout,
        pods.clone(),
    ));
    let pod_sets = Arc::new(PodSetController::new(Arc::clone(&backend), config.clone()));
    let kafka = Arc::new(KafkaController::new(
        Arc::clone(&backend),
        Arc::clone(&pod_sets),
        Arc::new(relevance),
        config.clone(),
    ));

    let mut feeds = JoinSet::new();
    {
        let pod_sets = Arc::clone(&pod_sets);
        feeds.spawn(run_feed(
            namespace.get_api::<Pod>(&client),
            watcher::Config::default().labels(LABEL_POD_SET),
            pods_writer,
            move |pod: &Pod| {
                let (Some(namespace), Some(pod_set)) =
                    (pod.namespace(), pod.labels().get(LABEL_POD_SET))
                else {
                    return;
                };
                pod_sets.enqueue(
                    ObjectRef::new(pod_set).within(&namespace),
                    format!("pod {} changed", pod.name_any()),
                );
            },
        ));
    }
    {
        let pod_sets = Arc::clone(&pod_sets);
        let kafka = Arc::clone(&kafka);
        let store = pod_set_store.clone();
        feeds.spawn(run_feed(
            namespace.get_api::<KafkaPodSet>(&client),
            watcher::Config::default(),
            pod_sets_writer,
            move |pod_set: &KafkaPodSet| {
                let pod_set_ref = ObjectRef::from_obj(pod_set);
                if store.get(&pod_set_ref).is_some() {
                    pod_sets.enqueue(pod_set_ref, "pod set changed");
                } else if let Some(cluster) = pod_set.labels().get(LABEL_CLUSTER) {
                    // a deleted pod set is recreated by its cluster
                    kafka.trigger(
                        sibling(&pod_set_ref, cluster),
                        format!("pod set {} deleted", pod_set_ref.name),
                    );
                }
            },
        ));
    }
    {
        let kafka = Arc::clone(&kafka);
        feeds.spawn(run_feed(
            namespace.get_api::<KafkaCluster>(&client),
            watcher::Config::default(),
            clusters_writer,
            move |cluster: &KafkaCluster| {
                kafka.trigger(ObjectRef::from_obj(cluster), "cluster changed");
            },
        ));
    }
    {
        let kafka = Arc::clone(&kafka);
        feeds.spawn(run_feed(
            namespace.get_api::<KafkaNodePool>(&client),
            watcher::Config::default(),
            pools_writer,
            move |pool: &KafkaNodePool| {
                let Some(cluster) = pool.labels().get(LABEL_CLUSTER) else {
                    return;
                };
                let pool_ref = ObjectRef::from_obj(pool);
                kafka.trigger(
                    sibling(&pool_ref, cluster),
                    format!("node pool {} changed", pool_ref.name),
                );
            },
        ));
    }

    // passes act on the pod store, which must be complete
    let (pods_ready, pod_sets_ready, clusters_ready, pools_ready) = tokio::join!(
        pods.wait_until_ready(),
        pod_set_store.wait_until_ready(),
        clusters.wait_until_ready(),
        pools.wait_until_ready()
    );
    pods_ready
        .and(pod_sets_ready)
        .and(clusters_ready)
        .and(pools_ready)
        .context("a change feed stopped before its initial listing")?;
    tracing::info!("stores are ready");

    {
        let kafka = Arc::clone(&kafka);
        let interval = config.resync_interval;
        feeds.spawn(async move {
            let mut resync = tokio::time::interval(interval);
            resync.tick().await;
            loop {
                resync.tick().await;
                for cluster in clusters.state() {
                    kafka.trigger(ObjectRef::from_obj(cluster.as_ref()), "periodic resync");
                }
            }
        });
    }

    let mut pod_set_workers = tokio::spawn(Arc::clone(&pod_sets).run());
    let mut kafka_workers = tokio::spawn(Arc::clone(&kafka).run());

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to listen for the shutdown signal")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for the shutdown signal")?;
        }
        _ = sigterm.recv() => {}
    }
    tracing::info!(grace_period = ?config.shutdown_timeout, "shutting down");

    // running cluster passes still need the pod set controller
    let deadline = tokio::time::Instant::now() + config.shutdown_timeout;
    kafka.queue().close();
    drain(&mut kafka_workers, deadline, "cluster").await;
    pod_sets.queue().close();
    drain(&mut pod_set_workers, deadline, "pod set").await;
    feeds.shutdown().await;
    Ok(())
}

/// Waits for the workers of a closed queue, abandoning their passes at `deadline`.
async fn drain(workers: &mut JoinHandle<()>, deadline: tokio::time::Instant, controller: &str) {
    match tokio::time::timeout_at(deadline, &mut *workers).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(controller, error = &err as &dyn std::error::Error, "workers panicked")
        }
        Err(_) => {
            tracing::warn!(controller, "abandoning running passes");
            workers.abort();
        }
    }
}

/// Keeps `writer` in sync with the objects behind `api`, calling `on_change` for every object
/// that was applied or deleted.
async fn run_feed<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    on_change: impl Fn(&K) + Send + 'static,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut events = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .touched_objects()
        .boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(obj) => on_change(&obj),
            Err(err) => tracing::warn!(
                kind,
                error = &err as &dyn std::error::Error,
                "change feed failed, retrying"
            ),
        }
    }
}

/// Reference to the cluster `name` in the namespace of `obj`.
fn sibling<K: Resource<DynamicType = ()>>(obj: &ObjectRef<K>, name: &str) -> ObjectRef<KafkaCluster> {
    let cluster = ObjectRef::new(name);
    match &obj.namespace {
        Some(namespace) => cluster.within(namespace),
        None => cluster,
    }
}
