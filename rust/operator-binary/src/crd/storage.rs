use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    memory::MemoryQuantity,
    schemars::{self, JsonSchema},
};

use crate::crd::STACKABLE_DATA_DIR;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("volume id {id} is declared more than once"))]
    DuplicateVolumeId { id: u32 },

    #[snafu(display("volume {id} has an invalid size"))]
    InvalidVolumeSize {
        source: stackable_operator::memory::Error,
        id: u32,
    },

    #[snafu(display("volume {id} must request more than zero bytes"))]
    EmptyVolume { id: u32 },

    #[snafu(display("volume {id} declares more than one storage override for node {node_id}"))]
    DuplicateStorageOverride { id: u32, node_id: u32 },
}

/// JBOD storage of a Kafka node. An empty volume list means ephemeral storage.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Stable id of the volume. Used in the mount path and the PersistentVolumeClaim name.
    pub id: u32,

    /// Requested capacity, e.g. `100Gi`.
    pub size: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Delete the PersistentVolumeClaim together with the cluster.
    #[serde(default)]
    pub delete_claim: bool,

    /// Store the KRaft metadata log on this volume.
    #[serde(default)]
    pub kraft_metadata: bool,

    /// Storage classes pinned to individual nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<StorageOverride>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageOverride {
    pub node_id: u32,
    pub storage_class: Option<String>,
}

/// A volume as it applies to one particular node.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedVolume {
    pub id: u32,
    pub size: Quantity,
    pub storage_class: Option<String>,
    pub delete_claim: bool,
    pub kraft_metadata: bool,
}

impl ResolvedVolume {
    pub fn volume_name(&self) -> String {
        format!("data-{}", self.id)
    }

    pub fn claim_name(&self, pod_name: &str) -> String {
        format!("data-{}-{pod_name}", self.id)
    }

    pub fn mount_path(&self) -> String {
        format!("{STACKABLE_DATA_DIR}/{}", self.id)
    }

    pub fn log_dir(&self) -> String {
        format!("{}/kafka-log", self.mount_path())
    }
}

impl StorageSpec {
    pub const EPHEMERAL_VOLUME_NAME: &str = "data";

    pub fn validate(&self) -> Result<(), Error> {
        let mut ids = BTreeSet::new();
        for volume in &self.volumes {
            if !ids.insert(volume.id) {
                return DuplicateVolumeIdSnafu { id: volume.id }.fail();
            }
            let size = MemoryQuantity::try_from(&volume.size)
                .context(InvalidVolumeSizeSnafu { id: volume.id })?;
            ensure!(size.value > 0.0, EmptyVolumeSnafu { id: volume.id });
            let mut pinned = BTreeSet::new();
            for node_override in &volume.overrides {
                if !pinned.insert(node_override.node_id) {
                    return DuplicateStorageOverrideSnafu {
                        id: volume.id,
                        node_id: node_override.node_id,
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    /// The volumes of `node_id`, ordered by volume id. Pool level settings apply unless an
    /// override pins the node.
    pub fn resolve_for(&self, node_id: u32) -> Vec<ResolvedVolume> {
        let mut volumes = self
            .volumes
            .iter()
            .map(|volume| ResolvedVolume {
                id: volume.id,
                size: volume.size.clone(),
                storage_class: volume
                    .overrides
                    .iter()
                    .find(|o| o.node_id == node_id)
                    .map_or_else(|| volume.storage_class.clone(), |o| o.storage_class.clone()),
                delete_claim: volume.delete_claim,
                kraft_metadata: volume.kraft_metadata,
            })
            .collect::<Vec<_>>();
        volumes.sort_by_key(|volume| volume.id);
        volumes
    }
}

/// Comma separated `log.dirs` value for a set of resolved volumes.
pub fn log_dirs(volumes: &[ResolvedVolume]) -> String {
    if volumes.is_empty() {
        return format!("{STACKABLE_DATA_DIR}/kafka-log");
    }
    volumes
        .iter()
        .map(ResolvedVolume::log_dir)
        .collect::<Vec<_>>()
        .join(",")
}

/// Directory of the KRaft metadata log: the flagged volume, otherwise the lowest volume id.
pub fn metadata_log_dir(volumes: &[ResolvedVolume]) -> String {
    volumes
        .iter()
        .find(|v| v.kraft_metadata)
        .or_else(|| volumes.first())
        .map_or_else(
            || format!("{STACKABLE_DATA_DIR}/kafka-log"),
            ResolvedVolume::log_dir,
        )
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn storage() -> StorageSpec {
        serde_yaml::from_str(indoc! {"
            volumes:
              - id: 1
                size: 200Gi
                storageClass: gp99
                overrides:
                  - nodeId: 4
                    storageClass: local-nvme
              - id: 0
                size: 100Gi
                storageClass: gp99
                kraftMetadata: true
        "})
        .expect("illegal test input")
    }

    #[test]
    fn test_resolve_applies_pinned_overrides_only() {
        let storage = storage();
        let node_3 = storage.resolve_for(3);
        let node_4 = storage.resolve_for(4);

        assert_eq!(node_3.iter().map(|v| v.id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(node_3[1].storage_class.as_deref(), Some("gp99"));
        assert_eq!(node_4[1].storage_class.as_deref(), Some("local-nvme"));
        assert_eq!(node_4[0].storage_class.as_deref(), Some("gp99"));
    }

    #[test]
    fn test_log_dirs() {
        let volumes = storage().resolve_for(0);
        assert_eq!(
            log_dirs(&volumes),
            "/stackable/data/0/kafka-log,/stackable/data/1/kafka-log"
        );
        assert_eq!(metadata_log_dir(&volumes), "/stackable/data/0/kafka-log");
        assert_eq!(log_dirs(&[]), "/stackable/data/kafka-log");
        assert_eq!(volumes[1].claim_name("simple-kafka-brokers-3"), "data-1-simple-kafka-brokers-3");
    }

    #[test]
    fn test_duplicate_volume_ids_are_rejected() {
        let mut storage = storage();
        storage.volumes[1].id = 1;
        assert!(matches!(
            storage.validate(),
            Err(Error::DuplicateVolumeId { id: 1 })
        ));
    }

    #[rstest]
    #[case("100Gi", true)]
    #[case("512Mi", true)]
    #[case("lots", false)]
    #[case("100Gigabytes", false)]
    #[case("0Gi", false)]
    fn test_volume_size_is_validated(#[case] size: &str, #[case] valid: bool) {
        let mut storage = storage();
        storage.volumes[0].size = Quantity(size.to_string());
        assert_eq!(storage.validate().is_ok(), valid, "size {size}");
    }

    #[test]
    fn test_invalid_size_names_the_volume() {
        let storage: StorageSpec = serde_yaml::from_str(indoc! {"
            volumes:
              - id: 7
                size: a lot
        "})
        .expect("illegal test input");
        assert!(matches!(
            storage.validate(),
            Err(Error::InvalidVolumeSize { id: 7, .. })
        ));
    }
}
