use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};
use strum::{Display, EnumString};

use crate::utils::{LABEL_BROKER_ROLE, LABEL_CONTROLLER_ROLE};

/// The process roles a Kafka node can take.
///
/// The declaration order is the fixed order used whenever per-role values are combined.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum KafkaRole {
    Broker,
    Controller,
}

impl KafkaRole {
    /// Pod annotation carrying the configuration fingerprint of this role.
    pub fn fingerprint_annotation(&self) -> &'static str {
        match self {
            KafkaRole::Broker => "kafka.stackable.tech/broker-configuration-hash",
            KafkaRole::Controller => "kafka.stackable.tech/controller-configuration-hash",
        }
    }

    /// Pod label marking nodes with this role, usable in selectors.
    pub fn label(&self) -> &'static str {
        match self {
            KafkaRole::Broker => LABEL_BROKER_ROLE,
            KafkaRole::Controller => LABEL_CONTROLLER_ROLE,
        }
    }
}

/// Comma separated role list as understood by the Kafka `process.roles` setting.
pub fn process_roles(roles: &BTreeSet<KafkaRole>) -> String {
    roles
        .iter()
        .map(KafkaRole::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
