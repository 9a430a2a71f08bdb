use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder, commons::resources::PvcConfig,
    k8s_openapi::api::core::v1::PersistentVolumeClaim,
};

use crate::{
    resource::pod::PodTemplate,
    topology::Topology,
    utils::{LABEL_NODE_ID, add_labels},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
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

/// The PersistentVolumeClaims of every node in `topology`.
///
/// Claims outlive their pods. Only volumes flagged with `deleteClaim` are owned by the cluster and
/// removed together with it.
pub fn build_pvcs(
    topology: &Topology,
    template: &PodTemplate,
) -> Result<Vec<PersistentVolumeClaim>, Error> {
    let mut pvcs = Vec::new();
    for node in &topology.nodes {
        let pod_name = template.pod_name(&node.node_ref.pool, node.node_ref.node_id);
        for volume in &node.volumes {
            let mut pvc = PvcConfig {
                capacity: Some(volume.size.clone()),
                storage_class: volume.storage_class.clone(),
                ..PvcConfig::default()
            }
            .build_pvc(&volume.claim_name(&pod_name), Some(vec!["ReadWriteOnce"]));

            let mut metadata = ObjectMetaBuilder::new();
            metadata
                .name(volume.claim_name(&pod_name))
                .namespace(&template.namespace)
                // claims survive image upgrades, so they carry no version
                .with_recommended_labels(template.recommended_labels("none", &node.node_ref.pool))
                .context(MetadataBuildSnafu)?;
            add_labels(
                &mut metadata,
                [
                    template.cluster_label(),
                    (LABEL_NODE_ID, node.node_ref.node_id.to_string()),
                ],
            )
            .context(LabelBuildSnafu)?;
            if volume.delete_claim {
                metadata
                    .ownerreference_from_resource(template.kafka, None, Some(false))
                    .context(ObjectMissingMetadataForOwnerRefSnafu)?;
            }

            pvc.metadata = metadata.build();
            pvcs.push(pvc);
        }
    }
    Ok(pvcs)
}
