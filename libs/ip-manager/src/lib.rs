//! # ip-manager
//!
//! `Allocator` owns the `ip -> device` table of every pool. Tables are keyed
//! by network prefix, so two subnets sharing a prefix (gated and ungated on
//! the same LAN) draw from the same table and can never hand out the same
//! address twice.
//!
//! Every read-then-write runs with that one table's lock held; persistence
//! goes through the [`DeviceRegistry`] while the lock is held and the table
//! is rolled back if the write fails.
//!
//! [`DeviceRegistry`]: registry::DeviceRegistry
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use config::{Pool, Subnet, SubnetTable};
use gatekeeper_core::metrics::RECLAIMED_ADDRS_COUNT;
use ipnet::Ipv4Net;
use registry::{Device, DevicePatch, DeviceRegistry, Mac, RegistryError, Storage};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

type Table = BTreeMap<Ipv4Addr, Mac>;

/// requests that can never succeed as asked, returned synchronously to the
/// caller with the table untouched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{0} is static, its address and subnet are pinned")]
    StaticDevice(Mac),
    #[error("{ip} is held by {held_by}, cannot give it to {claimed_by}")]
    AddressConflict {
        ip: Ipv4Addr,
        held_by: Mac,
        claimed_by: Mac,
    },
    #[error("{ip} is outside of {network}")]
    OutsideNetwork { ip: Ipv4Addr, network: Ipv4Net },
    #[error("{0} is not a configured subnet")]
    UnknownSubnet(Subnet),
}

#[derive(Error, Debug)]
pub enum IpError {
    #[error("no free address in {network}")]
    PoolExhausted { network: Ipv4Net },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug)]
pub struct Allocator<S> {
    registry: Arc<DeviceRegistry<S>>,
    pool: Pool,
    lease_time: Duration,
    /// infrastructure addresses of every subnet drawing from a table
    reserved: HashMap<Ipv4Net, BTreeSet<Ipv4Addr>>,
    tables: parking_lot::Mutex<HashMap<Ipv4Net, Arc<Mutex<Table>>>>,
}

impl<S: Storage> Allocator<S> {
    pub fn new(
        registry: Arc<DeviceRegistry<S>>,
        subnets: &SubnetTable,
        pool: Pool,
        lease_time: Duration,
    ) -> Self {
        let mut reserved: HashMap<Ipv4Net, BTreeSet<Ipv4Addr>> = HashMap::new();
        for (_, subnet) in subnets.iter() {
            reserved
                .entry(subnet.network())
                .or_default()
                .extend(subnet.reserved());
        }
        Self {
            registry,
            pool,
            lease_time,
            reserved,
            tables: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    fn table(&self, subnet: &Subnet) -> Arc<Mutex<Table>> {
        Arc::clone(self.tables.lock().entry(subnet.network()).or_default())
    }

    /// Give `device` an address in its subnet. A device that already holds
    /// an entry keeps it, otherwise the lowest free suffix of the pool is
    /// used. A full pool reclaims the least recently seen stale lease once.
    ///
    /// Returns the address and the device as persisted.
    #[instrument(level = "debug", skip_all, fields(mac = ?device.mac))]
    pub async fn assign(&self, device: &Device) -> Result<(Ipv4Addr, Device), IpError> {
        if device.is_static() {
            return Err(ConfigurationError::StaticDevice(device.mac).into());
        }
        let subnet = device.subnet;
        let table = self.table(&subnet);
        let mut table = table.lock().await;

        if let Some(ip) = held_by(&table, &device.mac).filter(|ip| subnet.contains(*ip)) {
            trace!(%ip, "device already holds an address");
            let device = self
                .registry
                .update(device, DevicePatch::new().ip(Some(ip)))
                .await?;
            return Ok((ip, device));
        }

        let ip = match self.next_free(&subnet, &table) {
            Some(ip) => ip,
            None => {
                if !self.reclaim(&subnet, &mut table).await? {
                    return Err(IpError::PoolExhausted {
                        network: subnet.network(),
                    });
                }
                self.next_free(&subnet, &table)
                    .ok_or(IpError::PoolExhausted {
                        network: subnet.network(),
                    })?
            }
        };

        table.insert(ip, device.mac);
        match self
            .registry
            .update(device, DevicePatch::new().ip(Some(ip)))
            .await
        {
            Ok(device) => {
                debug!(%ip, "assigned");
                Ok((ip, device))
            }
            Err(err) => {
                table.remove(&ip);
                Err(err.into())
            }
        }
    }

    fn next_free(&self, subnet: &Subnet, table: &Table) -> Option<Ipv4Addr> {
        let reserved = self.reserved.get(&subnet.network());
        self.pool.addrs(subnet).find(|ip| {
            !table.contains_key(ip) && !reserved.map_or(false, |set| set.contains(ip))
        })
    }

    /// Evict the least recently seen stale dynamic holder in the pool. An
    /// entry whose record is gone, or no longer holds that address, is
    /// released first without touching the store.
    /// Returns false when nothing could be freed.
    async fn reclaim(&self, subnet: &Subnet, table: &mut Table) -> Result<bool, IpError> {
        let now = Utc::now();
        let mut stale = Vec::new();
        let mut orphan = None;
        for (ip, mac) in table.iter() {
            if !self.pool.contains(subnet, *ip) {
                continue;
            }
            match self.registry.get(mac).await? {
                Some(holder) if holder.ip != Some(*ip) => {
                    orphan = Some((*ip, *mac));
                    break;
                }
                None => {
                    orphan = Some((*ip, *mac));
                    break;
                }
                Some(holder) if !holder.is_static() && holder.is_stale(now, self.lease_time) => {
                    stale.push((*ip, holder))
                }
                _ => {}
            }
        }
        if let Some((ip, mac)) = orphan {
            table.remove(&ip);
            RECLAIMED_ADDRS_COUNT.inc();
            info!(%ip, from = ?mac, "released orphaned table entry");
            return Ok(true);
        }
        // never seen sorts first
        stale.sort_by_key(|(_, holder)| holder.last_seen);

        let Some((ip, holder)) = stale.into_iter().next() else {
            return Ok(false);
        };
        self.registry
            .update(&holder, DevicePatch::new().ip(None))
            .await?;
        table.remove(&ip);
        RECLAIMED_ADDRS_COUNT.inc();
        info!(%ip, from = ?holder.mac, last_seen = ?holder.last_seen, "reclaimed stale lease");
        Ok(true)
    }

    /// put `ip` in the table for `device` without persisting anything
    pub async fn claim(&self, ip: Ipv4Addr, device: &Device) -> Result<(), IpError> {
        let subnet = device.subnet;
        if !subnet.contains(ip) {
            return Err(ConfigurationError::OutsideNetwork {
                ip,
                network: subnet.network(),
            }
            .into());
        }
        let table = self.table(&subnet);
        let mut table = table.lock().await;
        claim_in(&mut table, ip, device.mac)?;
        Ok(())
    }

    /// drop `ip` from the table, returns who held it
    pub async fn release(&self, subnet: &Subnet, ip: Ipv4Addr) -> Option<Mac> {
        self.table(subnet).lock().await.remove(&ip)
    }

    /// Move a dynamic device to `subnet`: its address is released and it is
    /// persisted unaddressed and pending on the new subnet.
    #[instrument(level = "debug", skip_all, fields(mac = ?device.mac, %subnet))]
    pub async fn relocate(&self, device: &Device, subnet: Subnet) -> Result<Device, IpError> {
        if device.is_static() {
            return Err(ConfigurationError::StaticDevice(device.mac).into());
        }
        let patch = DevicePatch::new().ip(None).subnet(subnet).pending(true);
        let old = self.table(&device.subnet);
        let mut old = old.lock().await;
        let released = held_by(&old, &device.mac);
        if let Some(ip) = released {
            old.remove(&ip);
        }
        match self.registry.update(device, patch).await {
            Ok(device) => {
                debug!(?released, "relocated");
                Ok(device)
            }
            Err(err) => {
                if let Some(ip) = released {
                    old.insert(ip, device.mac);
                }
                Err(err.into())
            }
        }
    }

    /// Rebuild the tables from persisted devices. Static devices go first;
    /// two static devices on one address is a configuration error, a dynamic
    /// device colliding with an existing holder (or sitting outside its
    /// subnet) loses its address.
    ///
    /// Returns how many addresses were loaded.
    pub async fn load(&self, mut devices: Vec<Device>) -> Result<usize, IpError> {
        devices.sort_by_key(|dev| !dev.is_static());
        let mut loaded = 0;
        for device in devices {
            let Some(ip) = device.ip else { continue };
            let subnet = device.subnet;
            if !subnet.contains(ip) {
                if device.is_static() {
                    return Err(ConfigurationError::OutsideNetwork {
                        ip,
                        network: subnet.network(),
                    }
                    .into());
                }
                warn!(mac = ?device.mac, %ip, "address outside of device subnet, clearing");
                self.registry
                    .update(&device, DevicePatch::new().ip(None))
                    .await?;
                continue;
            }
            let table = self.table(&subnet);
            let mut table = table.lock().await;
            match claim_in(&mut table, ip, device.mac) {
                Ok(()) => loaded += 1,
                Err(err) if device.is_static() => return Err(err.into()),
                Err(err) => {
                    warn!(?err, "conflicting lease, clearing");
                    self.registry
                        .update(&device, DevicePatch::new().ip(None))
                        .await?;
                }
            }
        }
        info!(loaded, "allocator tables loaded");
        Ok(loaded)
    }

    /// who holds `ip`
    pub async fn holder(&self, subnet: &Subnet, ip: Ipv4Addr) -> Option<Mac> {
        self.table(subnet).lock().await.get(&ip).copied()
    }

    /// every entry of the table `subnet` draws from, ascending
    pub async fn leased(&self, subnet: &Subnet) -> Vec<(Ipv4Addr, Mac)> {
        self.table(subnet)
            .lock()
            .await
            .iter()
            .map(|(ip, mac)| (*ip, *mac))
            .collect()
    }
}

fn held_by(table: &Table, mac: &Mac) -> Option<Ipv4Addr> {
    table
        .iter()
        .find_map(|(ip, holder)| (holder == mac).then_some(*ip))
}

/// a device holds at most one entry per table
fn claim_in(table: &mut Table, ip: Ipv4Addr, mac: Mac) -> Result<(), ConfigurationError> {
    match table.get(&ip) {
        Some(held_by) if *held_by != mac => Err(ConfigurationError::AddressConflict {
            ip,
            held_by: *held_by,
            claimed_by: mac,
        }),
        _ => {
            table.retain(|addr, holder| *holder != mac || *addr == ip);
            table.insert(ip, mac);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests;
