//! Locating scripts in metadata.

use std::fmt;

use clap::ValueEnum;
use gce_metadata::{Attributes, MetadataDocument};
use tracing::info;

/// Which lifecycle hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScriptKind {
    Startup,
    Shutdown,
    Specialize,
}

impl ScriptKind {
    /// Attribute key prefix; the suffix follows after a hyphen.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Startup => "windows-startup-script",
            Self::Shutdown => "windows-shutdown-script",
            Self::Specialize => "sysprep-specialize-script",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Specialize => "specialize",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script flavour, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    Ps1,
    Cmd,
    Bat,
    /// The value is a URL to download; the real flavour comes from its extension.
    Url,
}

impl Suffix {
    pub const ALL: [Suffix; 4] = [Self::Ps1, Self::Cmd, Self::Bat, Self::Url];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ps1 => "ps1",
            Self::Cmd => "cmd",
            Self::Bat => "bat",
            Self::Url => "url",
        }
    }

    /// Runnable flavour named by a URL's trailing extension.
    pub fn from_url(url: &str) -> Option<Self> {
        [Self::Ps1, Self::Cmd, Self::Bat]
            .into_iter()
            .find(|s| url.ends_with(&format!(".{}", s.as_str())))
    }
}

/// One script attribute found in metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    pub key: String,
    pub suffix: Suffix,
    pub value: String,
}

/// Scripts of `kind` in one attribute map, in suffix order.
pub fn scripts_in(attributes: &Attributes, kind: ScriptKind) -> Vec<ScriptEntry> {
    Suffix::ALL
        .into_iter()
        .filter_map(|suffix| {
            let key = format!("{}-{}", kind.key_prefix(), suffix.as_str());
            let value = attributes.get(&key).filter(|v| !v.is_empty())?;
            info!(key = %key, "Found script in metadata");
            Some(ScriptEntry {
                key,
                suffix,
                value: value.to_string(),
            })
        })
        .collect()
}

/// Instance scripts, or project scripts when the instance defines none.
pub fn find_scripts(document: &MetadataDocument, kind: ScriptKind) -> Vec<ScriptEntry> {
    let instance = document
        .instance_attributes()
        .map(|a| scripts_in(a, kind))
        .unwrap_or_default();
    if !instance.is_empty() {
        return instance;
    }

    document
        .project_attributes()
        .map(|a| scripts_in(a, kind))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn document(instance: &[(&str, &str)], project: &[(&str, &str)]) -> MetadataDocument {
        let attrs = |pairs: &[(&str, &str)]| -> serde_json::Value {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
                .collect::<serde_json::Map<_, _>>()
                .into()
        };
        let body = serde_json::json!({
            "instance": {"attributes": attrs(instance)},
            "project": {"attributes": attrs(project)},
        });
        MetadataDocument::from_slice(body.to_string().as_bytes()).unwrap()
    }

    #[rstest]
    #[case(ScriptKind::Startup, "windows-startup-script")]
    #[case(ScriptKind::Shutdown, "windows-shutdown-script")]
    #[case(ScriptKind::Specialize, "sysprep-specialize-script")]
    fn test_key_prefix(#[case] kind: ScriptKind, #[case] prefix: &str) {
        assert_eq!(kind.key_prefix(), prefix);
    }

    #[test]
    fn test_scripts_in_suffix_order() {
        let doc = document(
            &[
                ("windows-startup-script-url", "gs://b/o.ps1"),
                ("windows-startup-script-cmd", "echo hi"),
                ("windows-startup-script-ps1", "Write-Host hi"),
                ("windows-shutdown-script-cmd", "echo bye"),
            ],
            &[],
        );

        let suffixes: Vec<Suffix> = find_scripts(&doc, ScriptKind::Startup)
            .into_iter()
            .map(|e| e.suffix)
            .collect();
        assert_eq!(suffixes, vec![Suffix::Ps1, Suffix::Cmd, Suffix::Url]);
    }

    #[test]
    fn test_empty_values_ignored() {
        let doc = document(&[("windows-startup-script-cmd", "")], &[]);
        assert!(find_scripts(&doc, ScriptKind::Startup).is_empty());
    }

    #[test]
    fn test_project_used_only_without_instance_scripts() {
        let doc = document(
            &[("windows-startup-script-cmd", "instance")],
            &[("windows-startup-script-ps1", "project")],
        );
        let scripts = find_scripts(&doc, ScriptKind::Startup);
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].value, "instance");

        let doc = document(
            &[("windows-shutdown-script-cmd", "other kind")],
            &[("windows-startup-script-ps1", "project")],
        );
        let scripts = find_scripts(&doc, ScriptKind::Startup);
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].key, "windows-startup-script-ps1");
        assert_eq!(scripts[0].value, "project");
    }

    #[test]
    fn test_no_attributes_at_all() {
        assert!(find_scripts(&MetadataDocument::default(), ScriptKind::Specialize).is_empty());
    }

    #[rstest]
    #[case("https://example.com/setup.ps1", Some(Suffix::Ps1))]
    #[case("gs://bucket/run.cmd", Some(Suffix::Cmd))]
    #[case("http://example.com/a.bat", Some(Suffix::Bat))]
    #[case("http://example.com/a.sh", None)]
    #[case("http://example.com/a.url", None)]
    fn test_suffix_from_url(#[case] url: &str, #[case] expected: Option<Suffix>) {
        assert_eq!(Suffix::from_url(url), expected);
    }
}
