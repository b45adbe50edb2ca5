//! Agent auto-update policy.
//!
//! The only effect is a marker in the side-store that the updater reads.
//! Update management cannot itself be switched off from metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gce_metadata::MetadataDocument;
use gce_reconcile::{Reader, Writer};
use tracing::info;

use crate::state::{SideStore, UPDATE_CHANNEL, UPDATE_CLIENT_STATE_PATH};

/// Domain name used in logs.
pub const DOMAIN: &str = "updates";

/// Instance attribute that turns agent auto-updates off.
pub const DISABLE_AGENT_UPDATES: &str = "disable-agent-updates";

/// Update flags, keyed by attribute name.
pub type UpdatePolicy = BTreeMap<String, bool>;

#[derive(Debug, Default, Clone, Copy)]
pub struct UpdatesReader;

impl Reader<UpdatePolicy> for UpdatesReader {
    fn extract(&self, document: &MetadataDocument) -> Option<UpdatePolicy> {
        // Missing attributes mean updates stay enabled.
        let disabled = document
            .instance_attributes()
            .and_then(|a| a.flag(DISABLE_AGENT_UPDATES))
            .unwrap_or(false);

        Some(UpdatePolicy::from([(
            DISABLE_AGENT_UPDATES.to_string(),
            disabled,
        )]))
    }

    fn equal(&self, a: Option<&UpdatePolicy>, b: Option<&UpdatePolicy>) -> bool {
        a == b
    }

    fn is_enabled(&self, _document: &MetadataDocument) -> bool {
        true
    }
}

/// Writes the `enabled` / `disabled` marker.
pub struct UpdatesWriter {
    store: Arc<dyn SideStore>,
}

impl UpdatesWriter {
    pub fn new(store: Arc<dyn SideStore>) -> Self {
        Self { store }
    }
}

fn marker(disabled: bool) -> &'static str {
    if disabled {
        "disabled"
    } else {
        "enabled"
    }
}

#[async_trait]
impl Writer<UpdatePolicy> for UpdatesWriter {
    async fn apply(&self, desired: &UpdatePolicy) -> Result<()> {
        let disabled = desired
            .get(DISABLE_AGENT_UPDATES)
            .copied()
            .unwrap_or(false);
        let value = marker(disabled);

        self.store
            .set_string(UPDATE_CLIENT_STATE_PATH, UPDATE_CHANNEL, value)
            .context("failed to write update marker")?;

        info!(updates = value, "Agent update policy written");
        Ok(())
    }
}
