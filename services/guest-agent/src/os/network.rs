use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::mac::MacAddress;
use super::{run, stderr_of};

/// Route protocol number that marks routes owned by the agent.
const ROUTE_PROTO: &str = "66";

/// Errors from interface management.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected output from {command}: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One OS network adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub name: String,
    pub mac: Option<MacAddress>,
    pub is_ethernet: bool,
    pub has_ipv4: bool,
}

impl Adapter {
    /// Candidate for the primary interface.
    pub fn is_primary_candidate(&self) -> bool {
        self.is_ethernet && self.has_ipv4
    }
}

/// Forwarded-IP alias management.
#[async_trait]
pub trait NetworkInterfaceService: Send + Sync {
    /// Adapters in OS enumeration order.
    async fn adapters(&self) -> Result<Vec<Adapter>, NetworkError>;

    /// Addresses the agent has bound to `adapter`.
    async fn bound_addresses(&self, adapter: &Adapter) -> Result<BTreeSet<IpAddr>, NetworkError>;

    async fn bind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError>;

    async fn unbind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError>;
}

/// iproute2 backed implementation.
///
/// Forwarded IPs are local routes tagged with the agent's protocol number,
/// so they can be told apart from addresses configured by anything else.
#[derive(Debug, Clone, Default)]
pub struct LinuxNetwork;

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
}

fn prefix_for(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

async fn run_ip(args: &[&str]) -> Result<Vec<u8>, NetworkError> {
    let output = run("ip", args, None).await?;
    if !output.status.success() {
        return Err(NetworkError::Command {
            command: format!("ip {}", args.join(" ")),
            stderr: stderr_of(&output),
        });
    }
    Ok(output.stdout)
}

fn parse_json<'a, T: Deserialize<'a>>(args: &[&str], stdout: &'a [u8]) -> Result<T, NetworkError> {
    // `ip -j` prints nothing at all when there are no entries.
    let body: &[u8] = if stdout.iter().all(u8::is_ascii_whitespace) {
        b"[]"
    } else {
        stdout
    };
    serde_json::from_slice(body).map_err(|source| NetworkError::Parse {
        command: format!("ip {}", args.join(" ")),
        source,
    })
}

fn adapter_from(link: IpLink) -> Adapter {
    Adapter {
        mac: link.address.as_deref().and_then(|a| a.parse().ok()),
        is_ethernet: link.link_type.as_deref() == Some("ether"),
        has_ipv4: link
            .addr_info
            .iter()
            .any(|a| a.family.as_deref() == Some("inet")),
        name: link.ifname,
    }
}

fn route_destination(route: &IpRoute) -> Option<IpAddr> {
    let host = route.dst.split('/').next().unwrap_or(&route.dst);
    host.parse().ok()
}

#[async_trait]
impl NetworkInterfaceService for LinuxNetwork {
    async fn adapters(&self) -> Result<Vec<Adapter>, NetworkError> {
        let args = ["-j", "addr", "show"];
        let stdout = run_ip(&args).await?;
        let links: Vec<IpLink> = parse_json(&args, &stdout)?;
        Ok(links.into_iter().map(adapter_from).collect())
    }

    async fn bound_addresses(&self, adapter: &Adapter) -> Result<BTreeSet<IpAddr>, NetworkError> {
        let mut addresses = BTreeSet::new();
        for family in ["-4", "-6"] {
            let args = [
                family,
                "-j",
                "route",
                "show",
                "table",
                "local",
                "type",
                "local",
                "dev",
                adapter.name.as_str(),
                "proto",
                ROUTE_PROTO,
            ];
            let stdout = run_ip(&args).await?;
            let routes: Vec<IpRoute> = parse_json(&args, &stdout)?;
            addresses.extend(routes.iter().filter_map(route_destination));
        }
        Ok(addresses)
    }

    async fn bind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError> {
        let prefix = prefix_for(&address);
        run_ip(&[
            "route", "add", "to", "local", &prefix, "scope", "host", "dev", &adapter.name,
            "proto", ROUTE_PROTO,
        ])
        .await?;
        debug!(address = %address, interface = %adapter.name, "Forwarded IP bound");
        Ok(())
    }

    async fn unbind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError> {
        let prefix = prefix_for(&address);
        run_ip(&[
            "route", "delete", "to", "local", &prefix, "scope", "host", "dev", &adapter.name,
            "proto", ROUTE_PROTO,
        ])
        .await?;
        debug!(address = %address, interface = %adapter.name, "Forwarded IP unbound");
        Ok(())
    }
}
