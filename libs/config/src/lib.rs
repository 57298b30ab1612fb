use std::{net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use tracing::debug;

pub mod subnet;
pub mod wire;

use gatekeeper_core::pnet::{
    self,
    datalink::{MacAddr, NetworkInterface},
};

pub use subnet::{Policy, Pool, Subnet, SubnetError, SubnetTable};

/// MACs configured for the infrastructure roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Infrastructure {
    pub router: Option<MacAddr>,
    pub dns: Option<MacAddr>,
}

/// runtime network config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// interfaces that are either explicitly bound by the config or
    /// are up & ipv4
    interfaces: Vec<NetworkInterface>,
    domain: Option<String>,
    lease_time: Duration,
    pool: Pool,
    default_policy: Policy,
    subnets: SubnetTable,
    infrastructure: Infrastructure,
}

impl NetworkConfig {
    /// read and validate the yaml config at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )
    }

    /// validate a yaml config, binding to the interfaces present on this host
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let cfg: wire::Config = serde_yaml::from_str(s.as_ref())?;
        let found = pnet::datalink::interfaces()
            .into_iter()
            .filter(|e| e.is_up() && e.ips.iter().any(|i| i.is_ipv4()))
            .collect();
        let config = Self::from_wire(cfg, found)?;
        debug!(?config);
        Ok(config)
    }

    /// build from the wire format, selecting interfaces from `found`
    pub fn from_wire(cfg: wire::Config, found: Vec<NetworkInterface>) -> Result<Self> {
        let interfaces = found_or_default(found, cfg.interfaces.as_deref())?;
        debug!(?interfaces, "using v4 interfaces");

        let ungated = to_subnet(&cfg.subnets.ungated).context("invalid ungated subnet")?;
        let gated = match &cfg.subnets.gated {
            Some(gated) => to_subnet(gated).context("invalid gated subnet")?,
            // gated devices are handed the server itself as their gateway
            None => ungated.with_router(ungated.dhcp_server_ip()),
        };
        if gated == ungated {
            bail!("gated and ungated subnets are identical, gating would have no effect");
        }
        for subnet in [ungated, gated] {
            cfg.pool
                .validate(&subnet)
                .with_context(|| format!("pool does not fit {subnet}"))?;
        }

        let infrastructure = Infrastructure {
            router: parse_mac(cfg.infrastructure.router.as_deref())
                .context("bad infrastructure.router mac")?,
            dns: parse_mac(cfg.infrastructure.dns.as_deref())
                .context("bad infrastructure.dns mac")?,
        };

        // set total addr space for metrics
        gatekeeper_core::metrics::TOTAL_AVAILABLE_ADDRS.set(cfg.pool.len() as i64);

        Ok(Self {
            interfaces,
            domain: cfg.domain.filter(|d| !d.is_empty()),
            lease_time: Duration::from_secs(cfg.lease_time as u64),
            pool: cfg.pool,
            default_policy: cfg.default_policy,
            subnets: SubnetTable::new(ungated, gated),
            infrastructure,
        })
    }

    /// return the explicitly bound interfaces or every up v4 interface
    pub fn interfaces(&self) -> &[NetworkInterface] {
        self.interfaces.as_slice()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn default_policy(&self) -> Policy {
        self.default_policy
    }

    /// subnet devices resolve against when no override exists
    pub fn default_subnet(&self) -> Subnet {
        self.subnets.get(self.default_policy)
    }

    pub fn subnets(&self) -> &SubnetTable {
        &self.subnets
    }

    pub fn ungated(&self) -> Subnet {
        self.subnets.get(Policy::Ungated)
    }

    pub fn gated(&self) -> Subnet {
        self.subnets.get(Policy::Gated)
    }

    pub fn infrastructure(&self) -> Infrastructure {
        self.infrastructure
    }

    /// is `ip` one of the addresses this server answers as
    pub fn is_server_id(&self, ip: Ipv4Addr) -> bool {
        self.subnets
            .iter()
            .any(|(_, subnet)| subnet.dhcp_server_ip() == ip)
            || self
                .interfaces
                .iter()
                .flat_map(|int| int.ips.iter())
                .any(|net| net.ip() == ip)
    }
}

fn to_subnet(wire: &wire::Subnet) -> Result<Subnet, SubnetError> {
    Subnet::new(wire.network_mask, wire.dhcp_server, wire.router, wire.dns)
}

fn parse_mac(mac: Option<&str>) -> Result<Option<MacAddr>> {
    mac.map(|mac| {
        mac.trim()
            .replace('-', ":")
            .parse::<MacAddr>()
            .map_err(|err| anyhow::anyhow!("{mac}: {err:?}"))
    })
    .transpose()
}

/// Returns:
/// - interfaces matching the list supplied
/// - OR every interface found
fn found_or_default(
    found_interfaces: Vec<NetworkInterface>,
    interfaces: Option<&[wire::Interface]>,
) -> Result<Vec<NetworkInterface>> {
    Ok(match interfaces {
        Some(interfaces) => interfaces
            .iter()
            .map(|interface| {
                match found_interfaces.iter().find(|i| {
                    i.name == interface.name
                        && interface
                            .addr
                            .map(|addr| i.ips.iter().any(|ip| ip.contains(addr)))
                            .unwrap_or(true)
                }) {
                    Some(i) => Ok(i.clone()),
                    None => bail!(
                        "unable to find interface {} with ip {:?}",
                        interface.name,
                        interface.addr
                    ),
                }
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => found_interfaces,
    })
}
