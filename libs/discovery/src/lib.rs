//! # discovery
//!
//! Finds the hardware address behind an IPv4 address, either one of this
//! host's own interfaces or a neighbour in the kernel ARP table.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use pnet::datalink::{self, MacAddr};
use tracing::{debug, trace};

/// where linux exposes the neighbour table
pub const PROC_ARP: &str = "/proc/net/arp";

/// ATF_COM, the entry is resolved
const FLAG_COMPLETE: u32 = 0x2;

/// Address resolution against the local interfaces and the ARP table
#[derive(Debug, Clone)]
pub struct ArpDiscovery {
    table: PathBuf,
}

impl Default for ArpDiscovery {
    fn default() -> Self {
        Self::new(PROC_ARP)
    }
}

impl ArpDiscovery {
    /// read neighbours from `table`, formatted like `/proc/net/arp`
    pub fn new<P: AsRef<Path>>(table: P) -> Self {
        Self {
            table: table.as_ref().to_path_buf(),
        }
    }

    /// MAC of `ip`, checking this host's interfaces before the ARP table
    pub async fn resolve(&self, ip: Ipv4Addr) -> Result<Option<MacAddr>> {
        if let Some(mac) = local_mac(ip) {
            debug!(%ip, %mac, "address is local");
            return Ok(Some(mac));
        }
        self.arp_lookup(ip).await
    }

    /// MAC of a neighbour, `None` when there is no complete entry for `ip`
    pub async fn arp_lookup(&self, ip: Ipv4Addr) -> Result<Option<MacAddr>> {
        let table = tokio::fs::read_to_string(&self.table)
            .await
            .with_context(|| format!("failed to read {}", self.table.display()))?;
        let found = parse_arp_table(&table)
            .into_iter()
            .find_map(|(addr, mac)| (addr == ip).then_some(mac));
        trace!(%ip, ?found, "arp lookup");
        Ok(found)
    }
}

/// MAC of the interface on this host that owns `ip`
pub fn local_mac(ip: Ipv4Addr) -> Option<MacAddr> {
    datalink::interfaces()
        .into_iter()
        .find(|int| int.ips.iter().any(|net| net.ip() == ip))
        .and_then(|int| int.mac)
        .filter(|mac| *mac != MacAddr::zero())
}

/// Complete entries of a `/proc/net/arp` formatted table. The header and
/// anything that doesn't parse are skipped.
pub fn parse_arp_table(table: &str) -> Vec<(Ipv4Addr, MacAddr)> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip = cols.next()?.parse::<Ipv4Addr>().ok()?;
            let _hw_type = cols.next()?;
            let flags = u32::from_str_radix(cols.next()?.trim_start_matches("0x"), 16).ok()?;
            let mac = cols.next()?.parse::<MacAddr>().ok()?;
            (flags & FLAG_COMPLETE != 0 && mac != MacAddr::zero()).then_some((ip, mac))
        })
        .collect()
}
