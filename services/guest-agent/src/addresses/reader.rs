use gce_metadata::MetadataDocument;
use gce_reconcile::Reader;
use tracing::{debug, info};

use super::ForwardedAddressSet;
use crate::os::MacAddress;

/// Instance attribute that disables forwarded IP management.
pub const DISABLE_ADDRESS_MANAGER: &str = "disable-address-manager";

#[derive(Debug, Default, Clone, Copy)]
pub struct AddressReader;

impl Reader<ForwardedAddressSet> for AddressReader {
    fn extract(&self, document: &MetadataDocument) -> Option<ForwardedAddressSet> {
        let interfaces = document.network_interfaces()?;
        let mut desired = ForwardedAddressSet::new();

        for interface in interfaces {
            let Some(raw_mac) = interface.mac.as_deref() else {
                debug!("Skipping network interface without a hardware address");
                continue;
            };
            let mac: MacAddress = match raw_mac.parse() {
                Ok(mac) => mac,
                Err(e) => {
                    info!(error = %e, "Skipping network interface");
                    continue;
                }
            };

            let addresses = desired.insert_interface(mac);
            for ip in interface.forwarded_ips.iter().flatten() {
                if ip.is_empty() {
                    continue;
                }
                match ip.parse() {
                    Ok(address) => {
                        addresses.insert(address);
                    }
                    Err(_) => info!(ip = %ip, interface = %mac, "Could not parse forwarded IP"),
                }
            }
        }

        Some(desired)
    }

    fn equal(&self, a: Option<&ForwardedAddressSet>, b: Option<&ForwardedAddressSet>) -> bool {
        a == b
    }

    fn is_enabled(&self, document: &MetadataDocument) -> bool {
        !document
            .instance_attributes()
            .and_then(|a| a.flag(DISABLE_ADDRESS_MANAGER))
            .unwrap_or(false)
    }
}
