#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::fmt;

use chrono::Utc;
use config::{NetworkConfig, Subnet};
use gatekeeper_core::prelude::*;
use ip_manager::{Allocator, ConfigurationError, IpError};
use message_type::{populate_reply, Reply, Request, RequestType};
use registry::{
    Device, DeviceDefaults, DevicePatch, DeviceRegistry, GetOrCreate, Mac, Storage, SubnetPolicy,
};

pub mod metrics;

/// Answers DISCOVER with an OFFER and REQUEST with an ACK or NAK. Every
/// decision is re-derived from the stored device, nothing is kept between
/// messages.
pub struct Leases<S> {
    cfg: Arc<NetworkConfig>,
    registry: Arc<DeviceRegistry<S>>,
    policy: Arc<SubnetPolicy<S>>,
    allocator: Arc<Allocator<S>>,
}

impl<S> fmt::Debug for Leases<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leases").field("cfg", &self.cfg).finish()
    }
}

impl<S: Storage> Leases<S> {
    pub fn new(
        cfg: Arc<NetworkConfig>,
        registry: Arc<DeviceRegistry<S>>,
        policy: Arc<SubnetPolicy<S>>,
        allocator: Arc<Allocator<S>>,
    ) -> Self {
        Self {
            cfg,
            registry,
            policy,
            allocator,
        }
    }
}

impl<S: Storage> Register for Leases<S> {
    fn register(self, srv: &mut Server) {
        info!("Leases plugin registered");
        srv.plugin::<Self, _>(self);
    }
}

#[async_trait]
impl<S: Storage> Plugin for Leases<S> {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext) -> Result<Action> {
        let request = ctx
            .get_local::<Request>()
            .cloned()
            .context("MsgType plugin must run before Leases")?;

        let outcome = match request.msg_type {
            RequestType::Discover => self.discover(&request).await,
            RequestType::Request => self.request(&request).await,
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err(IpError::PoolExhausted { network }) => {
                gatekeeper_core::metrics::POOL_EXHAUSTED_COUNT.inc();
                error!(mac = ?request.mac, %network, "pool exhausted, no OFFER sent");
                return Ok(Action::NoResponse);
            }
            Err(err) => return Err(err.into()),
        };

        debug!(
            mac = ?request.mac,
            kind = ?reply.kind,
            yiaddr = %reply.yiaddr,
            subnet = %reply.subnet,
            "sending reply"
        );
        let resp = ctx
            .resp_msg_mut()
            .context("response message must be set before leases is run")?;
        populate_reply(resp, &request, &reply, &self.cfg);
        Ok(Action::Respond)
    }
}

impl<S: Storage> Leases<S> {
    async fn discover(&self, request: &Request) -> Result<Reply, IpError> {
        let device = self.resolve(request).await?;
        let (ip, device) = match device.ip {
            Some(ip) => (ip, device),
            None => self.allocator.assign(&device).await?,
        };
        let device = self
            .registry
            .update(&device, hints(request).pending(true).last_seen(Utc::now()))
            .await?;
        Ok(Reply::offer(ip, device.subnet))
    }

    async fn request(&self, request: &Request) -> Result<Reply, IpError> {
        let device = self.resolve(request).await?;
        let requested = request.address_requested();
        let confirmed = device.ip.filter(|ip| requested == Some(*ip));
        let device = self
            .registry
            .update(
                &device,
                hints(request)
                    .pending(confirmed.is_none())
                    .last_seen(Utc::now()),
            )
            .await?;

        match confirmed {
            Some(ip) => Ok(Reply::ack(ip, device.subnet)),
            None => {
                metrics::ADDRESS_MISMATCH_COUNT.inc();
                debug!(?requested, held = ?device.ip, "requested address is not the one held");
                Ok(Reply::nak(device.subnet))
            }
        }
    }

    /// Find or create the device for `request`. A dynamic device whose stored
    /// override names another subnet is moved there first.
    async fn resolve(&self, request: &Request) -> Result<Device, IpError> {
        let subnet = self.policy.resolve_subnet(&request.mac).await?;
        let defaults = DeviceDefaults::dynamic(subnet)
            .hostname(request.hostname.clone())
            .class_id(request.class_id.clone());
        let device = match self.registry.get_or_create(&request.mac, defaults).await? {
            GetOrCreate::Created(device) => {
                info!(mac = ?device.mac, %subnet, hostname = ?device.hostname, "new device");
                return Ok(device);
            }
            GetOrCreate::Found(device) => device,
        };
        if device.is_static() || device.subnet == subnet {
            return Ok(device);
        }
        info!(mac = ?device.mac, from = %device.subnet, to = %subnet, "subnet override changed, moving device");
        metrics::SUBNET_RECONCILED_COUNT.inc();
        self.allocator.relocate(&device, subnet).await
    }

    /// Move `mac` to `subnet`. Static devices are refused and left as they
    /// are. For a known device the old address is released and a new one
    /// assigned in `subnet`, its next REQUEST for the old address is NAKed
    /// unless the same address was handed out again. A device already on
    /// `subnet` keeps its address and is only marked pending.
    ///
    /// Returns the moved device, or `None` if `mac` hasn't been seen yet and
    /// only the override was recorded.
    #[instrument(level = "debug", skip(self))]
    pub async fn switch_subnet(&self, mac: &Mac, subnet: Subnet) -> Result<Option<Device>, IpError> {
        let policy = self
            .policy
            .subnets()
            .policy_of(&subnet)
            .ok_or(ConfigurationError::UnknownSubnet(subnet))?;
        let device = self.registry.get(mac).await?;
        if let Some(device) = device.as_ref().filter(|dev| dev.is_static()) {
            return Err(ConfigurationError::StaticDevice(device.mac).into());
        }
        self.policy.set_override(mac, policy).await?;

        let Some(device) = device else {
            debug!(%policy, "override recorded for unseen device");
            return Ok(None);
        };
        let device = if device.subnet == subnet {
            self.registry
                .update(&device, DevicePatch::new().pending(true))
                .await?
        } else {
            self.allocator.relocate(&device, subnet).await?
        };
        let (ip, device) = self.allocator.assign(&device).await?;
        metrics::SUBNET_SWITCH_COUNT.inc();
        info!(%ip, %policy, "device switched subnet");
        Ok(Some(device))
    }

    /// move `mac` to the gated subnet
    pub async fn gate(&self, mac: &Mac) -> Result<Option<Device>, IpError> {
        self.switch_subnet(mac, self.cfg.gated()).await
    }

    /// move `mac` to the ungated subnet
    pub async fn ungate(&self, mac: &Mac) -> Result<Option<Device>, IpError> {
        self.switch_subnet(mac, self.cfg.ungated()).await
    }
}

/// hostname and class id are taken from every message that carries them
fn hints(request: &Request) -> DevicePatch {
    DevicePatch::new()
        .hostname(request.hostname.clone())
        .class_id(request.class_id.clone())
}
