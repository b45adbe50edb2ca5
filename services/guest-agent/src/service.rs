//! Agent wiring: capabilities, managers, and the watcher.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use gce_metadata::{ClientConfig, MetadataClient, MetadataWatcher, WatcherConfig};
use gce_reconcile::Manager;
use tokio::sync::watch;
use tracing::{error, info};

use crate::accounts::{self, AccountsReader, AccountsWriter, KeySet};
use crate::addresses::{self, AddressReader, AddressWriter, ForwardedAddressSet};
use crate::config::Config;
use crate::os::{LinuxNetwork, LinuxUserAccounts, NetworkInterfaceService, UserAccountService};
use crate::serial::{self, SerialPort, SideChannel, StartupReport};
use crate::state::{SideStore, SqliteSideStore};
use crate::updates::{self, UpdatePolicy, UpdatesReader, UpdatesWriter};

const OS_RELEASE: &str = "/etc/os-release";

/// External systems the reconcilers act on.
#[derive(Clone)]
pub struct Capabilities {
    pub users: Arc<dyn UserAccountService>,
    pub network: Arc<dyn NetworkInterfaceService>,
    pub channel: Arc<dyn SideChannel>,
    pub store: Arc<dyn SideStore>,
}

/// Register the domain managers on `watcher`.
///
/// Managers run in the order accounts, addresses, updates for every
/// published document.
pub fn register_managers(
    watcher: &mut MetadataWatcher,
    capabilities: &Capabilities,
    primary_interface: Option<String>,
) {
    watcher.subscribe(Manager::new(
        accounts::DOMAIN,
        KeySet::new(),
        AccountsReader,
        AccountsWriter::new(
            Arc::clone(&capabilities.users),
            Arc::clone(&capabilities.channel),
            Arc::clone(&capabilities.store),
        ),
    ));

    watcher.subscribe(Manager::new(
        addresses::DOMAIN,
        ForwardedAddressSet::new(),
        AddressReader,
        AddressWriter::new(
            Arc::clone(&capabilities.network),
            Arc::clone(&capabilities.store),
        )
        .with_primary_interface(primary_interface),
    ));

    watcher.subscribe(Manager::new(
        updates::DOMAIN,
        UpdatePolicy::new(),
        UpdatesReader,
        UpdatesWriter::new(Arc::clone(&capabilities.store)),
    ));
}

/// `PRETTY_NAME` from an os-release file.
fn parse_os_release(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let value = line.trim().strip_prefix("PRETTY_NAME=")?;
        let value = value.trim_matches('"').trim_matches('\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Human readable OS version, or `unknown`.
pub fn os_version(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .as_deref()
        .and_then(parse_os_release)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Tell the host side the agent is up.
pub async fn announce_startup(channel: &dyn SideChannel, version: &str) -> Result<()> {
    serial::send(channel, &StartupReport::ready(version)).await
}

/// Build the production capabilities from configuration.
pub fn linux_capabilities(config: &Config) -> Result<Capabilities> {
    if let Some(parent) = config.state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteSideStore::open(&config.state_path)
        .with_context(|| format!("failed to open side-store {}", config.state_path.display()))?;

    Ok(Capabilities {
        users: Arc::new(LinuxUserAccounts::new(&config.admin_group)),
        network: Arc::new(LinuxNetwork),
        channel: Arc::new(SerialPort::new(&config.serial_port)),
        store: Arc::new(store),
    })
}

/// Run the agent until shutdown is signalled.
pub async fn run(
    config: Config,
    capabilities: Capabilities,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let client = MetadataClient::new(ClientConfig::with_base_url(&config.metadata_url))
        .context("failed to create metadata client")?;

    let mut watcher = MetadataWatcher::new(client, WatcherConfig::default());
    register_managers(&mut watcher, &capabilities, config.primary_interface.clone());

    let version = os_version(Path::new(OS_RELEASE));
    match announce_startup(capabilities.channel.as_ref(), &version).await {
        Ok(()) => info!(version = %version, "Agent ready"),
        Err(e) => error!(error = %e, "Failed to write startup message"),
    }

    watcher.run(shutdown).await;
    Ok(())
}
