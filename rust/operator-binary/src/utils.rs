use sha2::{Digest, Sha256};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    kvp::{Label, LabelError, ObjectLabels},
};

use crate::crd::{APP_NAME, KafkaCluster, OPERATOR_NAME};

/// Links a [`KafkaNodePool`](crate::crd::node_pool::KafkaNodePool) and every generated object to
/// the cluster it belongs to.
pub const LABEL_CLUSTER: &str = "kafka.stackable.tech/cluster";
/// The pod set that owns a pod.
pub const LABEL_POD_SET: &str = "kafka.stackable.tech/pod-set";
pub const LABEL_NODE_ID: &str = "kafka.stackable.tech/node-id";
pub const LABEL_BROKER_ROLE: &str = "kafka.stackable.tech/broker-role";
pub const LABEL_CONTROLLER_ROLE: &str = "kafka.stackable.tech/controller-role";

/// The only role in the recommended labels, node pools take the place of role groups.
pub const NODE_ROLE: &str = "node";

/// Number of bytes of a SHA-256 digest kept in a hash token.
const HASH_TOKEN_BYTES: usize = 8;
/// Longest value Kubernetes accepts for a label.
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Build recommended values for labels
pub fn build_recommended_labels<'a>(
    owner: &'a KafkaCluster,
    controller_name: &'a str,
    app_version: &'a str,
    role: &'a str,
    role_group: &'a str,
) -> ObjectLabels<'a, KafkaCluster> {
    ObjectLabels {
        owner,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name,
        role,
        role_group,
    }
}

/// Adds labels next to the recommended ones.
pub fn add_labels<'b>(
    metadata: &'b mut ObjectMetaBuilder,
    labels: impl IntoIterator<Item = (&'static str, String)>,
) -> Result<&'b mut ObjectMetaBuilder, LabelError> {
    for (key, value) in labels {
        metadata.with_label(Label::try_from((key, value.as_str()))?);
    }
    Ok(metadata)
}

/// The `app.kubernetes.io/version` value for an image: its tag, cut down to what a label value
/// may hold.
pub fn app_version_label(image: &str) -> String {
    let tag = image
        .rsplit_once('@')
        .map_or(image, |(name, _)| name)
        .rsplit_once(':')
        .filter(|(_, tag)| !tag.contains('/'))
        .map_or("", |(_, tag)| tag);
    let value: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();
    let value = value.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

/// Fixed-width token over a SHA-256 digest of `input`.
pub fn hash_token(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(&digest[..HASH_TOKEN_BYTES])
}

/// Appends a length-prefixed field, so that concatenated fields can never be confused with
/// each other.
pub fn push_field(buf: &mut Vec<u8>, field: &str) {
    buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
    buf.extend_from_slice(field.as_bytes());
}
