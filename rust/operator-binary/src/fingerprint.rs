//! Role aware configuration fingerprints.
//!
//! Every role gets a fingerprint over just the configuration it reads, so that a change only
//! rolls the nodes that are affected by it. Which role reads which key is looked up in the
//! versioned relevance table shipped in `deploy/config-spec/relevance.yaml`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use serde::{
    Deserialize, Deserializer,
    de::{self, MapAccess, Visitor},
};
use snafu::{ResultExt, Snafu, ensure};
use strum::Display;

use crate::{
    crd::{
        role::KafkaRole,
        storage::{log_dirs, metadata_log_dir},
    },
    topology::{KafkaNode, Topology},
    utils::{hash_token, push_field},
};

/// The relevance table format understood by this operator.
pub const RELEVANCE_TABLE_VERSION: u32 = 1;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read relevance table {}", path.display()))]
    ReadTable {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse relevance table"))]
    ParseTable { source: serde_yaml::Error },

    #[snafu(display(
        "relevance table version {version} is not supported, expected {RELEVANCE_TABLE_VERSION}"
    ))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("relevance table contains an empty key"))]
    EmptyKey,

    #[snafu(display(
        "no relevance table found, searched {}",
        searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
    ))]
    NoTableFound { searched: Vec<PathBuf> },
}

/// Which nodes have to be rolled when a configuration key changes.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigScope {
    Broker,
    Controller,
    All,
    /// Only honoured when the cluster is created.
    Static,
}

impl ConfigScope {
    pub fn affects(&self, role: KafkaRole) -> bool {
        match self {
            ConfigScope::Broker => role == KafkaRole::Broker,
            ConfigScope::Controller => role == KafkaRole::Controller,
            ConfigScope::All => true,
            ConfigScope::Static => false,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RelevanceTableFile {
    version: u32,
    #[serde(default, deserialize_with = "unique_keys")]
    keys: BTreeMap<String, ConfigScope>,
}

fn unique_keys<'de, D>(deserializer: D) -> Result<BTreeMap<String, ConfigScope>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueKeys;

    impl<'de> Visitor<'de> for UniqueKeys {
        type Value = BTreeMap<String, ConfigScope>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of configuration keys to scopes")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut keys = BTreeMap::new();
            while let Some((key, scope)) = map.next_entry::<String, ConfigScope>()? {
                if keys.contains_key(&key) {
                    return Err(de::Error::custom(format!("duplicate key {key}")));
                }
                keys.insert(key, scope);
            }
            Ok(keys)
        }
    }

    deserializer.deserialize_map(UniqueKeys)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelevanceTable {
    version: u32,
    keys: BTreeMap<String, ConfigScope>,
}

impl RelevanceTable {
    pub fn from_yaml_str(input: &str) -> Result<Self, Error> {
        let file: RelevanceTableFile = serde_yaml::from_str(input).context(ParseTableSnafu)?;
        ensure!(
            file.version == RELEVANCE_TABLE_VERSION,
            UnsupportedVersionSnafu {
                version: file.version
            }
        );
        ensure!(
            file.keys.keys().all(|key| !key.trim().is_empty()),
            EmptyKeySnafu
        );
        Ok(Self {
            version: file.version,
            keys: file.keys,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let input = fs::read_to_string(path).context(ReadTableSnafu { path })?;
        Self::from_yaml_str(&input)
    }

    /// Loads `explicit` if given, otherwise the first of `candidates` that exists.
    pub fn load(explicit: Option<&Path>, candidates: &[&str]) -> Result<Self, Error> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match candidates.iter().map(Path::new).find(|path| path.exists()) {
            Some(path) => Self::from_file(path),
            None => NoTableFoundSnafu {
                searched: candidates.iter().map(PathBuf::from).collect::<Vec<_>>(),
            }
            .fail(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys missing from the table affect every role.
    pub fn scope(&self, key: &str) -> ConfigScope {
        self.keys.get(key).copied().unwrap_or(ConfigScope::All)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleFingerprint {
    pub role: KafkaRole,
    pub hash: String,
}

/// One fingerprint per role present in `topology`, over the cluster configuration alone.
///
/// Nothing specific to a node or pool goes in here, so that adding or removing nodes leaves the
/// fingerprints of the existing ones untouched.
pub fn role_fingerprints(
    config: &BTreeMap<String, String>,
    table: &RelevanceTable,
    topology: &Topology,
) -> BTreeMap<KafkaRole, RoleFingerprint> {
    topology
        .roles()
        .into_iter()
        .map(|role| (role, fingerprint_role(role, config, table)))
        .collect()
}

fn fingerprint_role(
    role: KafkaRole,
    config: &BTreeMap<String, String>,
    table: &RelevanceTable,
) -> RoleFingerprint {
    let mut canonical = Vec::new();
    push_field(&mut canonical, &role.to_string());
    // BTreeMap iteration is ordered by key
    for (key, value) in config {
        if table.scope(key).affects(role) {
            push_field(&mut canonical, key);
            push_field(&mut canonical, value);
        }
    }

    RoleFingerprint {
        role,
        hash: hash_token(&canonical),
    }
}

/// Fingerprint of the directories `node` itself writes to.
pub fn storage_fingerprint(node: &KafkaNode) -> String {
    let mut canonical = Vec::new();
    push_field(&mut canonical, "log.dirs");
    push_field(&mut canonical, &log_dirs(&node.volumes));
    if node.node_ref.has_role(KafkaRole::Controller) {
        push_field(&mut canonical, "metadata.log.dir");
        push_field(&mut canonical, &metadata_log_dir(&node.volumes));
    }
    hash_token(&canonical)
}

/// The fingerprints of every role in `roles`, tagged and listed in the fixed role order.
///
/// The role tags make a change of the role set visible, even when the fingerprints of the
/// remaining roles are unchanged.
pub fn combined_fingerprint(
    roles: &BTreeSet<KafkaRole>,
    fingerprints: &BTreeMap<KafkaRole, RoleFingerprint>,
) -> String {
    roles
        .iter()
        .filter_map(|role| fingerprints.get(role))
        .map(|fingerprint| format!("{}:{}", fingerprint.role, fingerprint.hash))
        .collect::<Vec<_>>()
        .join(",")
}
