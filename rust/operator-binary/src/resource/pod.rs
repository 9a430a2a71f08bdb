use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::{
        meta::ObjectMetaBuilder,
        pod::{PodBuilder, container::ContainerBuilder},
    },
    k8s_openapi::{
        api::core::v1::{
            ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
            Probe, SecretVolumeSource, TCPSocketAction, Volume,
        },
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kvp::ObjectLabels,
};

use crate::{
    crd::{
        CONTROLLER_PORT, CONTROLLER_PORT_NAME, KafkaCluster, KafkaListener, STACKABLE_DATA_DIR,
        STACKABLE_TLS_DIR, TLS_VOLUME_NAME,
        pod_set::{CONFIGURATION_HASH_ANNOTATION, STORAGE_HASH_ANNOTATION},
        role::{KafkaRole, process_roles},
        storage::{StorageSpec, log_dirs, metadata_log_dir},
    },
    fingerprint::{RoleFingerprint, combined_fingerprint, storage_fingerprint},
    topology::{KafkaNode, Topology},
    utils::{
        LABEL_CLUSTER, LABEL_NODE_ID, NODE_ROLE, add_labels, app_version_label,
        build_recommended_labels,
    },
};

pub const KAFKA_CONTAINER_NAME: &str = "kafka";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid Container name [{name}]"))]
    InvalidContainerName {
        name: String,
        source: stackable_operator::builder::pod::container::Error,
    },

    #[snafu(display("failed to add needed volumeMount"))]
    AddVolumeMount {
        source: stackable_operator::builder::pod::container::Error,
    },

    #[snafu(display("failed to add needed volume"))]
    AddVolume {
        source: stackable_operator::builder::pod::Error,
    },

    #[snafu(display("failed to build Labels"))]
    LabelBuild {
        source: stackable_operator::kvp::LabelError,
    },

    #[snafu(display("failed to build Metadata"))]
    MetadataBuild {
        source: stackable_operator::builder::meta::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Cluster wide facts shared by every generated pod.
#[derive(Clone, Debug)]
pub struct PodTemplate<'a> {
    pub kafka: &'a KafkaCluster,
    pub cluster_name: String,
    pub namespace: String,
    pub image: String,
    /// Value of the recommended version label.
    pub app_version: String,
    pub listeners: Vec<KafkaListener>,
    pub tls_secret_name: Option<String>,
    pub headless_service: String,
    pub kraft: bool,
    pub cluster_id: Option<String>,
    /// `host:port` of every controller, empty unless the cluster uses KRaft.
    pub controller_quorum: Vec<String>,
    pub controller_name: &'a str,
}

impl<'a> PodTemplate<'a> {
    pub fn new(kafka: &'a KafkaCluster, topology: &Topology, controller_name: &'a str) -> Self {
        let namespace = topology.cluster.namespace.clone().unwrap_or_default();
        let headless_service = kafka.headless_service_name();
        let controller_quorum = topology
            .nodes
            .iter()
            .filter(|node| node.node_ref.has_role(KafkaRole::Controller))
            .map(|node| {
                format!(
                    "{pod}.{headless_service}.{namespace}.svc.cluster.local:{CONTROLLER_PORT}",
                    pod = kafka.pod_name(&node.node_ref.pool, node.node_ref.node_id),
                )
            })
            .collect();

        Self {
            kafka,
            cluster_name: topology.cluster.name.clone(),
            namespace,
            image: kafka.spec.image.clone(),
            app_version: app_version_label(&kafka.spec.image),
            listeners: kafka.spec.listeners.clone(),
            tls_secret_name: kafka.spec.cluster_config.tls_secret_name.clone(),
            headless_service,
            kraft: kafka.is_kraft_mode(),
            cluster_id: kafka.cluster_id().map(str::to_string),
            controller_quorum,
            controller_name,
        }
    }

    pub fn pod_set_name(&self, pool: &str) -> String {
        format!("{}-{pool}", self.cluster_name)
    }

    pub fn pod_name(&self, pool: &str, node_id: u32) -> String {
        format!("{}-{node_id}", self.pod_set_name(pool))
    }

    /// Recommended labels of objects generated for `pool`. Pools take the place of role groups.
    pub fn recommended_labels<'b>(
        &'b self,
        app_version: &'b str,
        pool: &'b str,
    ) -> ObjectLabels<'b, KafkaCluster> {
        build_recommended_labels(
            self.kafka,
            self.controller_name,
            app_version,
            NODE_ROLE,
            pool,
        )
    }

    /// Label linking generated objects back to the cluster.
    pub fn cluster_label(&self) -> (&'static str, String) {
        (LABEL_CLUSTER, self.cluster_name.clone())
    }
}

/// Builds the pod of one Kafka node.
///
/// The pod carries the fingerprint of every role the node holds. Fingerprints of other roles
/// are left out, so they cannot roll this node. Its storage layout is fingerprinted separately,
/// from the node's own volumes only.
pub fn build_node_pod(
    template: &PodTemplate,
    node: &KafkaNode,
    fingerprints: &BTreeMap<KafkaRole, RoleFingerprint>,
) -> Result<Pod> {
    let node_ref = &node.node_ref;
    let pod_name = template.pod_name(&node_ref.pool, node_ref.node_id);

    let mut labels = vec![
        template.cluster_label(),
        (LABEL_NODE_ID, node_ref.node_id.to_string()),
    ];
    labels.extend(
        node_ref
            .roles
            .iter()
            .map(|role| (role.label(), "true".to_string())),
    );

    let mut annotations = BTreeMap::new();
    for role in &node_ref.roles {
        if let Some(fingerprint) = fingerprints.get(role) {
            annotations.insert(
                role.fingerprint_annotation().to_string(),
                fingerprint.hash.clone(),
            );
        }
    }
    annotations.insert(
        CONFIGURATION_HASH_ANNOTATION.to_string(),
        combined_fingerprint(&node_ref.roles, fingerprints),
    );
    annotations.insert(
        STORAGE_HASH_ANNOTATION.to_string(),
        storage_fingerprint(node),
    );

    let mut metadata = ObjectMetaBuilder::new();
    metadata
        .name(&pod_name)
        .namespace(&template.namespace)
        .with_recommended_labels(
            template.recommended_labels(&template.app_version, &node_ref.pool),
        )
        .context(MetadataBuildSnafu)?;
    add_labels(&mut metadata, labels).context(LabelBuildSnafu)?;
    let mut metadata = metadata.build();
    metadata.annotations = Some(annotations);

    let mut cb_kafka = ContainerBuilder::new(KAFKA_CONTAINER_NAME).context(
        InvalidContainerNameSnafu {
            name: KAFKA_CONTAINER_NAME,
        },
    )?;
    let mut pod_builder = PodBuilder::new();

    cb_kafka
        .image(&template.image)
        .add_env_var("KAFKA_NODE_ID", node_ref.node_id.to_string())
        .add_env_var("KAFKA_LOG_DIRS", log_dirs(&node.volumes))
        .add_container_ports(container_ports(template, node));

    if template.kraft {
        cb_kafka
            .add_env_var("KAFKA_PROCESS_ROLES", process_roles(&node_ref.roles))
            .add_env_var(
                "KAFKA_CONTROLLER_QUORUM_BOOTSTRAP_SERVERS",
                template.controller_quorum.join(","),
            );
        if let Some(cluster_id) = &template.cluster_id {
            cb_kafka.add_env_var("KAFKA_CLUSTER_ID", cluster_id);
        }
    }
    if node_ref.has_role(KafkaRole::Controller) {
        cb_kafka.add_env_var("KAFKA_METADATA_LOG_DIR", metadata_log_dir(&node.volumes));
    }
    if let Some(resources) = &node.resources {
        cb_kafka.resources(resources.clone());
    }
    if let Some(port) = readiness_port(template, node) {
        cb_kafka.readiness_probe(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port.into()),
                ..TCPSocketAction::default()
            }),
            timeout_seconds: Some(5),
            period_seconds: Some(5),
            ..Probe::default()
        });
    }

    if node.volumes.is_empty() {
        cb_kafka
            .add_volume_mount(StorageSpec::EPHEMERAL_VOLUME_NAME, STACKABLE_DATA_DIR)
            .context(AddVolumeMountSnafu)?;
        pod_builder
            .add_volume(Volume {
                name: StorageSpec::EPHEMERAL_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            })
            .context(AddVolumeSnafu)?;
    }
    for volume in &node.volumes {
        cb_kafka
            .add_volume_mount(volume.volume_name(), volume.mount_path())
            .context(AddVolumeMountSnafu)?;
        pod_builder
            .add_volume(Volume {
                name: volume.volume_name(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: volume.claim_name(&pod_name),
                    ..PersistentVolumeClaimVolumeSource::default()
                }),
                ..Volume::default()
            })
            .context(AddVolumeSnafu)?;
    }
    if let Some(secret_name) = &template.tls_secret_name {
        cb_kafka
            .add_volume_mount(TLS_VOLUME_NAME, STACKABLE_TLS_DIR)
            .context(AddVolumeMountSnafu)?;
        pod_builder
            .add_volume(Volume {
                name: TLS_VOLUME_NAME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            })
            .context(AddVolumeSnafu)?;
    }

    pod_builder.add_container(cb_kafka.build());

    let mut pod_template = pod_builder.build_template();
    let pod_spec = pod_template.spec.get_or_insert_with(PodSpec::default);
    // stable DNS name through the headless service
    pod_spec.hostname = Some(pod_name);
    pod_spec.subdomain = Some(template.headless_service.clone());

    Ok(Pod {
        metadata,
        spec: pod_template.spec,
        status: None,
    })
}

fn container_ports(template: &PodTemplate, node: &KafkaNode) -> Vec<ContainerPort> {
    let mut ports = Vec::new();
    if node.node_ref.has_role(KafkaRole::Broker) {
        ports.extend(template.listeners.iter().map(|listener| ContainerPort {
            name: Some(listener.name.clone()),
            container_port: listener.port.into(),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }));
    }
    if node.node_ref.has_role(KafkaRole::Controller) {
        ports.push(ContainerPort {
            name: Some(CONTROLLER_PORT_NAME.to_string()),
            container_port: CONTROLLER_PORT.into(),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        });
    }
    ports
}

/// Brokers are ready once their first listener accepts connections, controller-only nodes
/// once the controller port does.
fn readiness_port(template: &PodTemplate, node: &KafkaNode) -> Option<u16> {
    if node.node_ref.has_role(KafkaRole::Broker) {
        if let Some(listener) = template.listeners.first() {
            return Some(listener.port);
        }
    }
    node.node_ref
        .has_role(KafkaRole::Controller)
        .then_some(CONTROLLER_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crd::role::KafkaRole,
        fingerprint::role_fingerprints,
        test_utils::{controllers_and_brokers, kraft_cluster, relevance_table, zookeeper_cluster},
        topology::build_topology,
    };

    fn env<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
        pod.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|env| env.name == name)?
            .value
            .as_deref()
    }

    fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
        pod.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }

    #[test]
    fn test_single_role_pods_only_carry_their_fingerprint() {
        let kafka = kraft_cluster(&[]);
        let topology = build_topology(&kafka, &controllers_and_brokers()).unwrap();
        let fingerprints = role_fingerprints(&kafka.spec.config, &relevance_table(), &topology);
        let template = PodTemplate::new(&kafka, &topology, "kafkacluster");

        let broker = topology.pool_nodes("brokers").next().unwrap();
        let pod = build_node_pod(&template, broker, &fingerprints).unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("my-cluster-brokers-0"));
        assert_eq!(
            annotation(&pod, KafkaRole::Broker.fingerprint_annotation()),
            Some(fingerprints[&KafkaRole::Broker].hash.as_str())
        );
        assert_eq!(
            annotation(&pod, KafkaRole::Controller.fingerprint_annotation()),
            None
        );
        assert_eq!(
            annotation(&pod, CONFIGURATION_HASH_ANNOTATION),
            Some(format!("broker:{}", fingerprints[&KafkaRole::Broker].hash).as_str())
        );
        assert_eq!(env(&pod, "KAFKA_PROCESS_ROLES"), Some("broker"));
        assert_eq!(env(&pod, "KAFKA_METADATA_LOG_DIR"), None);
        assert_eq!(env(&pod, "KAFKA_CLUSTER_ID"), Some("my-cluster"));
        assert_eq!(
            env(&pod, "KAFKA_CONTROLLER_QUORUM_BOOTSTRAP_SERVERS"),
            Some(
                "my-cluster-controllers-3.my-cluster-kafka-nodes.my-namespace.svc.cluster.local:9093,\
                 my-cluster-controllers-4.my-cluster-kafka-nodes.my-namespace.svc.cluster.local:9093,\
                 my-cluster-controllers-5.my-cluster-kafka-nodes.my-namespace.svc.cluster.local:9093"
            )
        );

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get("app.kubernetes.io/role-group").map(String::as_str),
            Some("brokers")
        );
        assert_eq!(
            labels.get("app.kubernetes.io/version").map(String::as_str),
            Some("3.9.1")
        );
        assert_eq!(
            labels.get(LABEL_CLUSTER).map(String::as_str),
            Some("my-cluster")
        );
        assert_eq!(labels.get(LABEL_NODE_ID).map(String::as_str), Some("0"));
        assert!(labels.contains_key(KafkaRole::Broker.label()));
        assert!(!labels.contains_key(KafkaRole::Controller.label()));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("my-cluster-brokers-0"));
        assert_eq!(spec.subdomain.as_deref(), Some("my-cluster-kafka-nodes"));
        let claim = spec.volumes.as_ref().unwrap()[0]
            .persistent_volume_claim
            .as_ref()
            .unwrap();
        assert_eq!(claim.claim_name, "data-0-my-cluster-brokers-0");
    }

    #[test]
    fn test_controller_pod() {
        let kafka = kraft_cluster(&[]);
        let topology = build_topology(&kafka, &controllers_and_brokers()).unwrap();
        let fingerprints = role_fingerprints(&kafka.spec.config, &relevance_table(), &topology);
        let template = PodTemplate::new(&kafka, &topology, "kafkacluster");

        let controller = topology.pool_nodes("controllers").next().unwrap();
        let pod = build_node_pod(&template, controller, &fingerprints).unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("my-cluster-controllers-3"));
        assert_eq!(env(&pod, "KAFKA_NODE_ID"), Some("3"));
        assert_eq!(
            env(&pod, "KAFKA_METADATA_LOG_DIR"),
            Some("/stackable/data/0/kafka-log")
        );
        assert_eq!(
            annotation(&pod, STORAGE_HASH_ANNOTATION),
            Some(storage_fingerprint(controller).as_str())
        );
        let ports = pod.spec.as_ref().unwrap().containers[0]
            .ports
            .clone()
            .unwrap_or_default();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container_port, 9093);
    }

    #[test]
    fn test_zookeeper_mode_has_no_kraft_settings() {
        let kafka = zookeeper_cluster(1);
        let topology = build_topology(&kafka, &[]).unwrap();
        let fingerprints = role_fingerprints(&kafka.spec.config, &relevance_table(), &topology);
        let template = PodTemplate::new(&kafka, &topology, "kafkacluster");

        let pod = build_node_pod(&template, &topology.nodes[0], &fingerprints).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("my-cluster-kafka-0"));
        assert_eq!(env(&pod, "KAFKA_PROCESS_ROLES"), None);
        assert_eq!(env(&pod, "KAFKA_CLUSTER_ID"), None);
        assert_eq!(env(&pod, "KAFKA_LOG_DIRS"), Some("/stackable/data/0/kafka-log"));
    }
}
