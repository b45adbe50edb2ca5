//! Configuration for the guest agent.

use std::path::PathBuf;

use anyhow::Result;
use gce_metadata::DEFAULT_METADATA_URL;

/// Guest agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Metadata server base URL.
    pub metadata_url: String,

    /// Path of the side-store database.
    pub state_path: PathBuf,

    /// Device or file that receives credential and startup messages.
    pub serial_port: PathBuf,

    /// Group that accounts created from windows-keys are added to.
    pub admin_group: String,

    /// Interface to bind forwarded IPs to when no MAC matches.
    pub primary_interface: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let metadata_url = std::env::var("GCE_METADATA_URL")
            .unwrap_or_else(|_| DEFAULT_METADATA_URL.to_string());

        let state_path = std::env::var("GCE_AGENT_STATE_PATH")
            .unwrap_or_else(|_| "/var/lib/google/guest-agent/state.db".to_string())
            .into();

        let serial_port = std::env::var("GCE_AGENT_SERIAL_PORT")
            .unwrap_or_else(|_| "/dev/ttyS3".to_string())
            .into();

        let admin_group =
            std::env::var("GCE_AGENT_ADMIN_GROUP").unwrap_or_else(|_| "sudo".to_string());

        let primary_interface = std::env::var("GCE_AGENT_PRIMARY_INTERFACE")
            .ok()
            .filter(|s| !s.is_empty());

        let log_level =
            std::env::var("GCE_AGENT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            metadata_url,
            state_path,
            serial_port,
            admin_group,
            primary_interface,
            log_level,
        })
    }
}
