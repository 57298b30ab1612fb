use std::net::Ipv4Addr;

use anyhow::Result;
use config::{NetworkConfig, Subnet};
use discovery::ArpDiscovery;
use gatekeeper_core::{
    metrics::{GATED_DEVICES, KNOWN_DEVICES},
    pnet::datalink::MacAddr,
    tokio::{self, sync::broadcast::error::RecvError, task::JoinHandle},
    tracing::*,
};
use registry::{Device, DeviceDefaults, DeviceEvent, DeviceRegistry, GetOrCreate, Mac, Storage};
use tokio_util::sync::CancellationToken;

/// infrastructure roles pinned at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Router,
    Server,
    Dns,
}

/// Create the static devices for the router, this server and the dns server
/// (when it isn't this server). A configured MAC wins over discovery; a role
/// whose MAC can't be found is skipped.
///
/// Returns the roles that were pinned.
pub(crate) async fn bootstrap_infrastructure<S: Storage>(
    cfg: &NetworkConfig,
    registry: &DeviceRegistry<S>,
    arp: &ArpDiscovery,
) -> Result<Vec<Role>> {
    let subnet = cfg.ungated();
    let infra = cfg.infrastructure();
    let mut roles = vec![
        (Role::Router, subnet.router_ip(), infra.router),
        (Role::Server, subnet.dhcp_server_ip(), None),
    ];
    if subnet.dns_ip() != subnet.dhcp_server_ip() {
        roles.push((Role::Dns, subnet.dns_ip(), infra.dns));
    }

    let mut pinned = Vec::with_capacity(roles.len());
    for (role, ip, configured) in roles {
        let Some(mac) = find_mac(arp, ip, configured).await else {
            warn!(?role, %ip, "could not find hardware address, role not pinned");
            continue;
        };
        let mac = Mac::from(mac);
        match registry
            .get_or_create(&mac, DeviceDefaults::infrastructure(ip, subnet))
            .await?
        {
            GetOrCreate::Created(_) => {
                info!(?role, ?mac, %ip, "pinned infrastructure device");
                pinned.push(role);
            }
            GetOrCreate::Found(dev) if dev.is_static() && dev.ip == Some(ip) => {
                debug!(?role, ?mac, %ip, "infrastructure device already pinned");
                pinned.push(role);
            }
            GetOrCreate::Found(dev) => {
                warn!(?role, ?mac, %ip, ip_type = ?dev.ip_type, known_ip = ?dev.ip, "device already known with another address, not pinning");
            }
        }
    }
    Ok(pinned)
}

async fn find_mac(arp: &ArpDiscovery, ip: Ipv4Addr, configured: Option<MacAddr>) -> Option<MacAddr> {
    if configured.is_some() {
        return configured;
    }
    match arp.resolve(ip).await {
        Ok(mac) => mac,
        Err(err) => {
            warn!(?err, %ip, "address resolution failed");
            None
        }
    }
}

/// set the device gauges from a full listing
pub(crate) fn set_device_gauges(devices: &[Device], gated: Subnet) {
    KNOWN_DEVICES.set(devices.len() as i64);
    GATED_DEVICES.set(devices.iter().filter(|dev| dev.subnet == gated).count() as i64);
}

/// log device events and keep the device gauges current
pub(crate) fn spawn_event_logger<S: Storage>(
    registry: &DeviceRegistry<S>,
    gated: Subnet,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("device event logger stopping");
                    return;
                }
                event = events.recv() => match event {
                    Ok(event) => log_event(&event, gated),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "device event logger fell behind");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    })
}

fn log_event(event: &DeviceEvent, gated: Subnet) {
    match event {
        DeviceEvent::New(dev) => {
            KNOWN_DEVICES.inc();
            if dev.subnet == gated {
                GATED_DEVICES.inc();
            }
            info!(mac = ?dev.mac, hostname = ?dev.hostname, class_id = ?dev.class_id, "device joined");
        }
        DeviceEvent::Updated { before, after } => {
            match (before.subnet == gated, after.subnet == gated) {
                (false, true) => GATED_DEVICES.inc(),
                (true, false) => GATED_DEVICES.dec(),
                _ => {}
            }
            if before.ip != after.ip || before.subnet != after.subnet {
                info!(
                    mac = ?after.mac,
                    from = ?before.ip,
                    to = ?after.ip,
                    subnet = %after.subnet,
                    "device address changed"
                );
            } else {
                trace!(mac = ?after.mac, "device updated");
            }
        }
    }
}
