//! serde types for the yaml network config, converted into the runtime
//! [`NetworkConfig`](crate::NetworkConfig) once validated
use std::{fmt, net::IpAddr, net::Ipv4Addr, str::FromStr};

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::subnet::{Policy, Pool};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub interfaces: Option<Vec<Interface>>,
    pub domain: Option<String>,
    #[serde(
        default = "default_lease_time",
        deserialize_with = "deserialize_duration"
    )]
    pub lease_time: u32,
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub default_policy: Policy,
    pub subnets: Subnets,
    #[serde(default)]
    pub infrastructure: Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subnets {
    pub ungated: Subnet,
    pub gated: Option<Subnet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subnet {
    pub network_mask: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// MACs of the infrastructure roles, when left out they are looked up at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct Infrastructure {
    pub router: Option<String>,
    pub dns: Option<String>,
}

/// `eth0` or `eth0@192.168.1.2`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interface {
    pub name: String,
    pub addr: Option<IpAddr>,
}

impl FromStr for Interface {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((name, addr)) => Ok(Interface {
                name: name.to_owned(),
                addr: Some(
                    addr.parse()
                        .with_context(|| format!("bad interface address in {s}"))?,
                ),
            }),
            None => Ok(Interface {
                name: s.to_owned(),
                addr: None,
            }),
        }
    }
}

impl TryFrom<String> for Interface {
    type Error = anyhow::Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Interface> for String {
    fn from(int: Interface) -> Self {
        int.to_string()
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}@{}", self.name, addr),
            None => f.write_str(&self.name),
        }
    }
}

pub const fn default_lease_time() -> u32 {
    86_400
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', or 's' are supported",
            other
        ),
    };

    num.checked_mul(num_seconds)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LeaseDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = match LeaseDuration::deserialize(de)? {
        LeaseDuration::Seconds(val) => {
            u32::try_from(val).map_err(|_| de::Error::custom("duration value too large"))?
        }
        LeaseDuration::String(s) => parse_duration(&s).map_err(de::Error::custom)?,
    };
    if secs == 0 {
        return Err(de::Error::custom("duration cannot be zero"));
    }
    Ok(secs)
}
