//! Forwarded IP management.
//!
//! Load-balancer forwarded IPs are listed per virtual NIC in metadata and
//! must be bound locally so the guest accepts traffic for them.

mod reader;
mod writer;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::os::MacAddress;

pub use reader::{AddressReader, DISABLE_ADDRESS_MANAGER};
pub use writer::AddressWriter;

/// Domain name used in logs.
pub const DOMAIN: &str = "addresses";

/// Desired forwarded IPs, keyed by interface hardware address.
///
/// Two sets are equal only when they name the same interfaces with the
/// same addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedAddressSet(BTreeMap<MacAddress, BTreeSet<IpAddr>>);

impl ForwardedAddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interface, even one with no addresses.
    pub fn insert_interface(&mut self, mac: MacAddress) -> &mut BTreeSet<IpAddr> {
        self.0.entry(mac).or_default()
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (&MacAddress, &BTreeSet<IpAddr>)> {
        self.0.iter()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&BTreeSet<IpAddr>> {
        self.0.get(mac)
    }

    /// Every desired address across all interfaces.
    pub fn all_addresses(&self) -> BTreeSet<IpAddr> {
        self.0.values().flatten().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<I> FromIterator<(MacAddress, I)> for ForwardedAddressSet
where
    I: IntoIterator<Item = IpAddr>,
{
    fn from_iter<T: IntoIterator<Item = (MacAddress, I)>>(iter: T) -> Self {
        let mut set = Self::new();
        for (mac, addresses) in iter {
            set.insert_interface(mac).extend(addresses);
        }
        set
    }
}
