//! The recursive metadata document.
//!
//! Only the parts the agent reads are modelled. Everything else in the
//! server response is ignored during deserialization.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::MetadataError;

/// One snapshot of the metadata server contents.
///
/// Built fresh from every successful poll and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetadataDocument {
    #[serde(default)]
    pub instance: Option<Instance>,

    #[serde(default)]
    pub project: Option<Project>,
}

/// Instance-scoped metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub attributes: Option<Attributes>,

    #[serde(default)]
    pub network_interfaces: Option<Vec<NetworkInterface>>,
}

/// One virtual NIC as described by the metadata server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Hardware address, as reported by the server.
    #[serde(default)]
    pub mac: Option<String>,

    /// Raw forwarded IP strings. Validation happens in the address reconciler.
    #[serde(default)]
    pub forwarded_ips: Option<Vec<String>>,
}

/// Project-scoped metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub attributes: Option<Attributes>,
}

/// Opaque attribute map (`windows-keys`, `disable-account-manager`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Look up a raw attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up an attribute and parse it as a boolean flag.
    ///
    /// Returns `None` when the key is absent or the value is not a
    /// recognised boolean spelling.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_bool)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Attributes
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl MetadataDocument {
    /// Parse a document from the raw response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(body).map_err(MetadataError::Parse)
    }

    /// Instance attributes, if the document carries them.
    pub fn instance_attributes(&self) -> Option<&Attributes> {
        self.instance.as_ref()?.attributes.as_ref()
    }

    /// Project attributes, if the document carries them.
    pub fn project_attributes(&self) -> Option<&Attributes> {
        self.project.as_ref()?.attributes.as_ref()
    }

    /// Network interfaces, if the document carries them.
    pub fn network_interfaces(&self) -> Option<&[NetworkInterface]> {
        self.instance.as_ref()?.network_interfaces.as_deref()
    }
}
