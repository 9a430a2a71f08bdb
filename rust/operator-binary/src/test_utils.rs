//! Fixtures shared by the unit tests.

use std::collections::BTreeSet;

use indoc::formatdoc;
use stackable_operator::status::condition::{ClusterCondition, ClusterConditionType};

use crate::{
    crd::{KafkaCluster, node_pool::KafkaNodePool, role::KafkaRole},
    fingerprint::RelevanceTable,
};

pub const NAMESPACE: &str = "my-namespace";
pub const CLUSTER_NAME: &str = "my-cluster";

pub fn relevance_table() -> RelevanceTable {
    RelevanceTable::from_yaml_str(include_str!(
        "../../../deploy/config-spec/relevance.yaml"
    ))
    .expect("the shipped relevance table must be valid")
}

pub fn kraft_cluster(config: &[(&str, &str)]) -> KafkaCluster {
    cluster("kraft", 0, config)
}

pub fn zookeeper_cluster(replicas: u16) -> KafkaCluster {
    cluster("zookeeper", replicas, &[])
}

fn cluster(metadata_manager: &str, replicas: u16, config: &[(&str, &str)]) -> KafkaCluster {
    let mut kafka: KafkaCluster = serde_yaml::from_str(&formatdoc! {"
        apiVersion: kafka.stackable.tech/v1alpha1
        kind: KafkaCluster
        metadata:
          name: {CLUSTER_NAME}
          namespace: {NAMESPACE}
          uid: 6c2d3e42-0c4e-4a0d-9a51-2a4d0e3b6f11
          generation: 1
        spec:
          image: docker.stackable.tech/stackable/kafka:3.9.1
          replicas: {replicas}
          listeners:
            - name: tls
              port: 9092
              tls: true
          storage:
            volumes:
              - id: 0
                size: 123Gi
                storageClass: foo
                deleteClaim: true
          clusterConfig:
            metadataManager: {metadata_manager}
    "})
    .expect("illegal test input");
    kafka.spec.config = config
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    kafka
}

pub fn node_pool(name: &str, replicas: u16, roles: &[KafkaRole], size: &str) -> KafkaNodePool {
    let mut pool: KafkaNodePool = serde_yaml::from_str(&formatdoc! {"
        apiVersion: kafka.stackable.tech/v1alpha1
        kind: KafkaNodePool
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          generation: 1
          labels:
            kafka.stackable.tech/cluster: {CLUSTER_NAME}
        spec:
          replicas: {replicas}
          roles: []
          storage:
            volumes:
              - id: 0
                size: {size}
                storageClass: gp99
    "})
    .expect("illegal test input");
    pool.spec.roles = roles.iter().copied().collect::<BTreeSet<_>>();
    pool
}

/// The motivating layout: three controller-only and three broker-only nodes.
pub fn controllers_and_brokers() -> Vec<KafkaNodePool> {
    vec![
        node_pool("controllers", 3, &[KafkaRole::Controller], "100Gi"),
        node_pool("brokers", 3, &[KafkaRole::Broker], "200Gi"),
    ]
}

pub fn find_condition(
    conditions: &[ClusterCondition],
    type_: ClusterConditionType,
) -> Option<&ClusterCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}
