use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{builder::meta::ObjectMetaBuilder, kvp::Labels};

use crate::{
    crd::{
        APP_NAME,
        pod_set::{KafkaPodSet, KafkaPodSetSpec},
        role::KafkaRole,
    },
    fingerprint::RoleFingerprint,
    resource::pod::{self, PodTemplate, build_node_pod},
    topology::Topology,
    utils::{NODE_ROLE, add_labels},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build pod of node {node_id} in pool {pool}"))]
    BuildPod {
        source: pod::Error,
        pool: String,
        node_id: u32,
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

/// Builds one pod set per pool of `topology`, in pool order.
///
/// A pool scaled to zero still gets an empty pod set, so that its pods are removed.
pub fn build_pod_sets(
    topology: &Topology,
    template: &PodTemplate,
    fingerprints: &BTreeMap<KafkaRole, RoleFingerprint>,
) -> Result<Vec<KafkaPodSet>> {
    let kafka = template.kafka;
    topology
        .pools
        .iter()
        .map(|pool| {
            let pods = topology
                .pool_nodes(&pool.name)
                .map(|node| {
                    build_node_pod(template, node, fingerprints).context(BuildPodSnafu {
                        pool: &pool.name,
                        node_id: node.node_ref.node_id,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut metadata = ObjectMetaBuilder::new();
            metadata
                .name_and_namespace(kafka)
                .name(template.pod_set_name(&pool.name))
                .ownerreference_from_resource(kafka, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_recommended_labels(
                    template.recommended_labels(&template.app_version, &pool.name),
                )
                .context(MetadataBuildSnafu)?;
            add_labels(&mut metadata, [template.cluster_label()]).context(LabelBuildSnafu)?;

            Ok(KafkaPodSet {
                metadata: metadata.build(),
                spec: KafkaPodSetSpec {
                    selector: Labels::role_group_selector(kafka, APP_NAME, NODE_ROLE, &pool.name)
                        .context(LabelBuildSnafu)?
                        .into(),
                    pods,
                },
                status: None,
            })
        })
        .collect()
}
