//! Devices, keyed by hardware address
use std::{fmt, net::Ipv4Addr, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use config::Subnet;
use gatekeeper_core::pnet::datalink::MacAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 48 bit hardware address, displayed upper-case and colon separated
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mac([u8; 6]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hardware address {0:?}")]
pub struct MacParseError(String);

impl Mac {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// from a `chaddr`, only 6 byte addresses are accepted
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Mac {
    type Err = MacParseError;

    /// accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_owned());
        let mut bytes = [0; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Mac {
    type Error = MacParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Mac> for String {
    fn from(mac: Mac) -> Self {
        mac.to_string()
    }
}

impl From<MacAddr> for Mac {
    fn from(mac: MacAddr) -> Self {
        let MacAddr(a, b, c, d, e, f) = mac;
        Self([a, b, c, d, e, f])
    }
}

impl From<Mac> for MacAddr {
    fn from(mac: Mac) -> Self {
        let [a, b, c, d, e, f] = mac.0;
        MacAddr(a, b, c, d, e, f)
    }
}

/// Static devices (router, this server, dns) are never re-addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub mac: Mac,
    pub ip_type: IpType,
    /// `None` until an address is assigned
    pub ip: Option<Ipv4Addr>,
    pub subnet: Subnet,
    pub hostname: Option<String>,
    pub class_id: Option<String>,
    /// set when an OFFER or NAK went out and no REQUEST has confirmed the
    /// current address yet
    pub pending_changes: bool,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vendor: Option<String>,
}

impl Device {
    pub fn is_static(&self) -> bool {
        self.ip_type == IpType::Static
    }

    /// not seen within `lease`. Never seen counts as stale, a `last_seen` in
    /// the future does not.
    pub fn is_stale(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.last_seen {
            None => true,
            Some(seen) => match now.signed_duration_since(seen).to_std() {
                Ok(age) => age > lease,
                Err(_) => false,
            },
        }
    }
}

/// Values a device is created with when first seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDefaults {
    ip_type: IpType,
    ip: Option<Ipv4Addr>,
    subnet: Subnet,
    hostname: Option<String>,
    class_id: Option<String>,
}

impl DeviceDefaults {
    /// an unaddressed dynamic device on `subnet`
    pub fn dynamic(subnet: Subnet) -> Self {
        Self {
            ip_type: IpType::Dynamic,
            ip: None,
            subnet,
            hostname: None,
            class_id: None,
        }
    }

    /// a static device pinned to `ip`
    pub fn infrastructure(ip: Ipv4Addr, subnet: Subnet) -> Self {
        Self {
            ip_type: IpType::Static,
            ip: Some(ip),
            subnet,
            hostname: None,
            class_id: None,
        }
    }

    pub fn hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn class_id(mut self, class_id: Option<String>) -> Self {
        self.class_id = class_id;
        self
    }

    pub(crate) fn into_device(self, mac: Mac) -> Device {
        Device {
            mac,
            ip_type: self.ip_type,
            ip: self.ip,
            subnet: self.subnet,
            hostname: self.hostname,
            class_id: self.class_id,
            pending_changes: false,
            last_seen: None,
            vendor: None,
        }
    }
}

/// Fields to change on a device, anything left unset is kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePatch {
    ip: Option<Option<Ipv4Addr>>,
    subnet: Option<Subnet>,
    hostname: Option<String>,
    class_id: Option<String>,
    pending_changes: Option<bool>,
    last_seen: Option<DateTime<Utc>>,
}

impl DevicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// set (or clear, with `None`) the address
    pub fn ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn subnet(mut self, subnet: Subnet) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// only overwrites when the message carried a hostname
    pub fn hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    /// only overwrites when the message carried a class id
    pub fn class_id(mut self, class_id: Option<String>) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn pending(mut self, pending: bool) -> Self {
        self.pending_changes = Some(pending);
        self
    }

    pub fn last_seen(mut self, now: DateTime<Utc>) -> Self {
        self.last_seen = Some(now);
        self
    }

    pub fn apply(&self, mut device: Device) -> Device {
        if let Some(ip) = self.ip {
            device.ip = ip;
        }
        if let Some(subnet) = self.subnet {
            device.subnet = subnet;
        }
        if let Some(hostname) = &self.hostname {
            device.hostname = Some(hostname.clone());
        }
        if let Some(class_id) = &self.class_id {
            device.class_id = Some(class_id.clone());
        }
        if let Some(pending) = self.pending_changes {
            device.pending_changes = pending;
        }
        if let Some(seen) = self.last_seen {
            device.last_seen = Some(seen);
        }
        device
    }
}
