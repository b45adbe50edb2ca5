//! Forwarded IP binding against the host's local routing table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use gce_reconcile::Writer;
use tracing::{error, info, warn};

use super::ForwardedAddressSet;
use crate::os::{Adapter, MacAddress, NetworkInterfaceService};
use crate::state::{SideStore, AGENT_PATH, FORWARDED_IPS};

/// Binds and unbinds forwarded IPs.
///
/// New addresses are diffed against what is live on the host, so an agent
/// restart does not rebind. Removals are diffed against what the agent
/// itself recorded, so addresses configured by anything else are left alone.
pub struct AddressWriter {
    network: Arc<dyn NetworkInterfaceService>,
    store: Arc<dyn SideStore>,
    primary_interface: Option<String>,
}

impl AddressWriter {
    pub fn new(network: Arc<dyn NetworkInterfaceService>, store: Arc<dyn SideStore>) -> Self {
        Self {
            network,
            store,
            primary_interface: None,
        }
    }

    /// Force the fallback adapter by name instead of picking the first
    /// IPv4 Ethernet adapter.
    pub fn with_primary_interface(mut self, name: Option<String>) -> Self {
        self.primary_interface = name;
        self
    }

    fn primary<'a>(&self, adapters: &'a [Adapter]) -> Option<&'a Adapter> {
        match &self.primary_interface {
            Some(name) => adapters.iter().find(|a| &a.name == name),
            None => adapters.iter().find(|a| a.is_primary_candidate()),
        }
    }

    /// Adapter for an interface: matched by MAC, else the primary adapter.
    fn target<'a>(&self, adapters: &'a [Adapter], mac: &MacAddress) -> Result<&'a Adapter> {
        adapters
            .iter()
            .find(|a| a.mac.as_ref() == Some(mac))
            .or_else(|| self.primary(adapters))
            .ok_or_else(|| anyhow!("unable to find primary network interface"))
    }

    /// Live forwarded addresses, with the adapter each one is bound to.
    async fn configured(&self, adapters: &[Adapter]) -> Result<BTreeMap<IpAddr, Adapter>> {
        let mut configured = BTreeMap::new();
        for adapter in adapters {
            let bound = self
                .network
                .bound_addresses(adapter)
                .await
                .with_context(|| format!("failed to list addresses on {}", adapter.name))?;
            for address in bound {
                configured.insert(address, adapter.clone());
            }
        }
        Ok(configured)
    }

    fn tracked(&self) -> Result<BTreeSet<IpAddr>> {
        let values = self
            .store
            .get_multi(AGENT_PATH, FORWARDED_IPS)
            .context("failed to read tracked forwarded IPs")?;

        Ok(values
            .iter()
            .filter_map(|v| match v.parse() {
                Ok(address) => Some(address),
                Err(_) => {
                    info!(ip = %v, "Could not parse tracked forwarded IP");
                    None
                }
            })
            .collect())
    }
}

/// One interface per address. An address listed under several interfaces
/// goes to the first in MAC order; the others are logged and skipped.
fn assign_owners(desired: &ForwardedAddressSet) -> BTreeMap<IpAddr, MacAddress> {
    let mut owners: BTreeMap<IpAddr, MacAddress> = BTreeMap::new();
    for (mac, addresses) in desired.interfaces() {
        for address in addresses {
            match owners.get(address) {
                Some(owner) => warn!(
                    address = %address,
                    interface = %mac,
                    owner = %owner,
                    "Forwarded IP listed on more than one interface, ignoring duplicate"
                ),
                None => {
                    owners.insert(*address, *mac);
                }
            }
        }
    }
    owners
}

fn join_or_none<T: Display>(items: impl IntoIterator<Item = T>) -> String {
    let joined: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    if joined.is_empty() {
        "None".to_string()
    } else {
        joined.join(", ")
    }
}

#[async_trait]
impl Writer<ForwardedAddressSet> for AddressWriter {
    async fn apply(&self, desired: &ForwardedAddressSet) -> Result<()> {
        let adapters = self
            .network
            .adapters()
            .await
            .context("failed to enumerate network adapters")?;
        let configured = self.configured(&adapters).await?;
        let tracked = self.tracked()?;
        let wanted = desired.all_addresses();

        let to_add: Vec<(MacAddress, IpAddr)> = assign_owners(desired)
            .into_iter()
            .filter(|(address, _)| !configured.contains_key(address))
            .map(|(address, mac)| (mac, address))
            .collect();
        let to_remove: Vec<IpAddr> = tracked.difference(&wanted).copied().collect();

        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(());
        }

        info!(
            "Changing forwarded IPs from {} to {} by adding {} and removing {}",
            join_or_none(configured.keys()),
            join_or_none(&wanted),
            join_or_none(to_add.iter().map(|(_, a)| a)),
            join_or_none(&to_remove)
        );

        let mut failures = 0usize;

        for (mac, address) in &to_add {
            let adapter = self.target(&adapters, mac)?;
            match self.network.bind(adapter, *address).await {
                Ok(()) => {
                    self.store
                        .add_multi(AGENT_PATH, FORWARDED_IPS, &address.to_string())
                        .context("failed to record forwarded IP")?;
                }
                Err(e) => {
                    error!(address = %address, interface = %adapter.name, error = %e, "Failed to add forwarded IP");
                    failures += 1;
                }
            }
        }

        let mut removed = Vec::new();
        for address in &to_remove {
            let Some(adapter) = configured.get(address) else {
                warn!(address = %address, "Forwarded IP is not bound to any interface, forgetting it");
                removed.push(address.to_string());
                continue;
            };
            match self.network.unbind(adapter, *address).await {
                Ok(()) => removed.push(address.to_string()),
                Err(e) => {
                    error!(address = %address, interface = %adapter.name, error = %e, "Failed to remove forwarded IP");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            self.store
                .remove_multi(AGENT_PATH, FORWARDED_IPS, &removed)
                .context("failed to forget removed forwarded IPs")?;
            bail!("{failures} forwarded IP change(s) failed");
        }

        let exact: Vec<String> = wanted.iter().map(ToString::to_string).collect();
        self.store
            .set_multi(AGENT_PATH, FORWARDED_IPS, &exact)
            .context("failed to record forwarded IPs")?;

        Ok(())
    }
}
