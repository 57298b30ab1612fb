//! # Server
//!
//! Contains the main server code which reads from UDP on every configured
//! interface and drives the plugins to completion, one message at a time
use anyhow::{Context, Result};
use pnet::{datalink::NetworkInterface, ipnetwork::IpNetwork, ipnetwork::Ipv4Network};
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, error, info, instrument, trace, warn};
use unix_udp_sock::{Source, Transmit, UdpSocket, UdpState};

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    os::unix::prelude::{FromRawFd, IntoRawFd},
    pin::Pin,
    sync::Arc,
    time::Instant,
};

pub mod context;
pub mod ioctl;
pub mod msg;
pub mod state;
pub mod typemap;
pub(crate) mod udp;

use crate::{
    config::cli::Config,
    handler::{Action, Plugin},
    metrics,
    server::{context::MsgContext, msg::SerialMsg, state::State, udp::UdpStream},
};

type PluginFn = Arc<dyn Plugin>;
type CtxStream = Pin<Box<dyn Stream<Item = io::Result<MsgContext>> + Send>>;

/// Holds the list of plugins, run in the order they were registered
pub struct Server {
    plugins: Vec<PluginFn>,
    state: Arc<State>,
    config: Config,
    interfaces: Vec<NetworkInterface>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// one socket per interface
struct Bound {
    soc: Arc<UdpSocket>,
    name: String,
    network: Option<Ipv4Network>,
}

impl Server {
    /// Make a new server listening on `interfaces`
    pub fn new(config: Config, interfaces: Vec<NetworkInterface>) -> Result<Server> {
        Ok(Server {
            plugins: Vec::new(),
            state: Arc::new(State::new()),
            config,
            interfaces,
        })
    }

    /// Add plugin to the end of the chain
    pub fn plugin<P, U>(&mut self, plugin: U) -> &mut Self
    where
        U: Into<Arc<P>>,
        P: Plugin,
    {
        self.plugins.push(plugin.into());
        self
    }

    /// start server, returns when `shutdown` resolves or the listener fails
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        tokio::select! {
            res = self.listen() => {
                if let Err(err) = res {
                    error!(?err, "error occurred in UDP listener");
                    return Err(err);
                }
            }
            res = shutdown => {
                info!("caught shutdown signal handler");
                if let Err(err) = res {
                    error!(?err);
                }
            }
        }
        Ok(())
    }

    /// if Some(()) - `resp_msg` will be sent to client
    /// if None - No response
    pub async fn run_handlers(&self, ctx: &mut MsgContext) -> Option<()> {
        for handler in &self.plugins {
            match handler.handle(ctx).await {
                Ok(Action::Respond) => return Some(()),
                Ok(Action::NoResponse) => {
                    ctx.resp_msg_take();
                    return None;
                }
                Err(err) => {
                    // the transaction is abandoned, client will retry
                    warn!(?err, "transaction abandoned");
                    ctx.resp_msg_take();
                    return None;
                }
                Ok(Action::Continue) => {}
            }
        }
        ctx.resp_msg().map(|_| ())
    }

    async fn listen(&self) -> Result<()> {
        let bound = self.bind_all()?;
        let udp_state = UdpState::new();

        let mut streams: StreamMap<usize, CtxStream> = StreamMap::new();
        for (idx, b) in bound.iter().enumerate() {
            let stream: CtxStream =
                Box::pin(UdpStream::new(Arc::clone(&b.soc), Arc::clone(&self.state)));
            streams.insert(idx, stream);
        }

        info!(interfaces = ?bound.iter().map(|b| &b.name).collect::<Vec<_>>(), "listening");
        while let Some((idx, ctx)) = streams.next().await {
            let mut ctx = match ctx {
                Ok(ctx) => ctx,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    metrics::MALFORMED_MSG_COUNT.inc();
                    debug!(?err, "dropping undecodable datagram");
                    continue;
                }
                Err(err) => {
                    error!(?err, "error reading from socket");
                    continue;
                }
            };
            if let Some(network) = bound[idx].network {
                ctx.set_interface(network);
            }
            if let Err(err) = self.handle(ctx, &bound[idx], &udp_state).await {
                error!(?err, "failed to reply");
            }
        }
        Ok(())
    }

    #[instrument(name = "v4", level = "debug", skip_all, fields(id = ctx.id(), iface = %bound.name))]
    async fn handle(&self, mut ctx: MsgContext, bound: &Bound, udp_state: &UdpState) -> Result<()> {
        let start = Instant::now();
        ctx.recv_metrics();
        trace!(meta = ?ctx.meta(), "received datagram");

        if self.run_handlers(&mut ctx).await.is_none() {
            return Ok(());
        }
        let dst_addr = ctx.resp_addr(
            self.config.is_default_port_v4(),
            socket2::SockRef::from(&*bound.soc),
        );
        let Some(resp) = ctx.resp_msg() else {
            return Ok(());
        };
        let msg = SerialMsg::from_msg(resp, dst_addr).context("failed to encode reply")?;
        // reply from the address the request was sent to, otherwise use the
        // interface index
        let meta = ctx.meta();
        let packet_src = meta
            .dst_local_ip
            .map(Source::Ip)
            .unwrap_or(Source::Interface(meta.ifindex));
        debug!(
            msg_type = ?resp.opts().msg_type(),
            ?dst_addr,
            source = ?packet_src,
            yiaddr = %resp.yiaddr(),
        );
        let transmit = Transmit::new(dst_addr, msg.msg()).src_ip(packet_src);
        bound
            .soc
            .send_msg(udp_state, transmit)
            .await
            .context("failed to send reply")?;
        ctx.set_dst_addr(dst_addr);
        if let Err(err) = ctx.sent_metrics(msg.bytes().len(), start.elapsed()) {
            error!(?err, "error counting sent metrics");
        }
        Ok(())
    }

    fn bind_all(&self) -> Result<Vec<Bound>> {
        let addr = self.config.v4_addr;
        if self.interfaces.is_empty() {
            let soc = create_socket(addr, None)?;
            return Ok(vec![Bound {
                soc: Arc::new(soc),
                name: "any".to_owned(),
                network: None,
            }]);
        }
        self.interfaces
            .iter()
            .map(|int| {
                let soc = create_socket(addr, Some(&int.name))
                    .with_context(|| format!("failed to bind {}", int.name))?;
                let network = int.ips.iter().find_map(|ip| match ip {
                    IpNetwork::V4(net) => Some(*net),
                    _ => None,
                });
                Ok(Bound {
                    soc: Arc::new(soc),
                    name: int.name.clone(),
                    network,
                })
            })
            .collect()
    }
}

#[instrument(level = "debug")]
fn create_socket(addr: SocketAddr, device: Option<&str>) -> Result<UdpSocket> {
    debug!("binding UDP socket");
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
    socket
        .set_reuse_address(true)
        .context("failed to set_reuse_address")?;
    if let Some(device) = device {
        // SO_BINDTODEVICE
        socket
            .bind_device(Some(device.as_bytes()))
            .context("failed to find interface")?;
    }
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking mode on socket")?;
    socket
        .bind(&addr.into())
        .context("failed to bind interface")?;

    let soc = UdpSocket::from_std(unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) })?;
    soc.set_broadcast(true).context("failed to set_broadcast")?;
    Ok(soc)
}
