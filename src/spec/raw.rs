//! Serde shape of the specification document before validation.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawDocument {
    pub(super) metadata: RawMetadata,
    #[serde(default)]
    pub(super) services: Vec<RawService>,
    #[serde(default)]
    pub(super) networks: Vec<RawNetwork>,
    #[serde(default)]
    pub(super) folders: Vec<RawFolder>,
    #[serde(default)]
    pub(super) groups: Vec<RawGroup>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawMetadata {
    pub(super) name: String,
    pub(super) folder_name: Option<String>,
    pub(super) description: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawService {
    pub(super) name: String,
    pub(super) image: Option<String>,
    pub(super) base: Option<String>,
    pub(super) cpus: Option<u32>,
    pub(super) memory_mb: Option<u32>,
    #[serde(default)]
    pub(super) packages: Vec<String>,
    pub(super) note: Option<String>,
    pub(super) instances: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawNetwork {
    pub(super) name: String,
    #[serde(default)]
    pub(super) shared: bool,
    pub(super) vlan: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawFolder {
    pub(super) name: String,
    pub(super) parent: Option<String>,
    pub(super) description: Option<String>,
    #[serde(default)]
    pub(super) services: Vec<String>,
    #[serde(default)]
    pub(super) networks: Vec<String>,
    pub(super) instances: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(super) struct RawGroup {
    pub(super) name: String,
    pub(super) folder: String,
    #[serde(default)]
    pub(super) services: Vec<String>,
    #[serde(default)]
    pub(super) networks: Vec<String>,
    #[serde(default)]
    pub(super) users: Vec<String>,
    pub(super) instances: Option<u32>,
    pub(super) enabled: Option<bool>,
}
