#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use config::NetworkConfig;
use gatekeeper_core::{
    dhcproto::v4::{Message, Opcode},
    metrics,
    prelude::*,
};

pub mod reply;
pub mod request;

pub use crate::{
    reply::{populate_reply, Reply, ReplyKind},
    request::{ParseError, Request, RequestType},
};

/// First plugin in the chain. Parses the message into a [`Request`] stored in
/// the context locals and prepares an empty reply. Anything that isn't a
/// DISCOVER or REQUEST for this server stops here.
#[derive(Debug)]
pub struct MsgType {
    cfg: Arc<NetworkConfig>,
}

impl MsgType {
    pub fn new(cfg: Arc<NetworkConfig>) -> Result<Self> {
        Ok(Self { cfg })
    }
}

impl Register for MsgType {
    fn register(self, srv: &mut Server) {
        info!("MsgType plugin registered");
        srv.plugin::<Self, _>(self);
    }
}

#[async_trait]
impl Plugin for MsgType {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext) -> Result<Action> {
        let req = ctx.msg();
        if req.opcode() == Opcode::BootReply {
            debug!("BootReply not supported");
            return Ok(Action::NoResponse);
        }

        let request = match Request::try_from(req) {
            Ok(request) => request,
            Err(ParseError::Unsupported(msg_type)) => {
                debug!(?msg_type, "unsupported message type");
                return Ok(Action::NoResponse);
            }
            Err(err) => {
                metrics::MALFORMED_MSG_COUNT.inc();
                warn!(?err, src_addr = %ctx.src_addr(), "dropping malformed message");
                return Ok(Action::NoResponse);
            }
        };

        if let Some(server_id) = request.server_id {
            if !self.cfg.is_server_id(server_id) {
                debug!(%server_id, "message is addressed to another server");
                return Ok(Action::NoResponse);
            }
        }

        debug!(
            msg_type = ?request.msg_type,
            mac = ?request.mac,
            src_addr = %ctx.src_addr(),
            interface = ?ctx.interface(),
            req = %req,
        );
        let resp = util::new_msg(req);
        ctx.set_resp_msg(resp);
        ctx.set_local(request);
        Ok(Action::Continue)
    }
}

pub mod util {
    use std::net::{Ipv4Addr, SocketAddr};

    use gatekeeper_core::{server::msg::SerialMsg, unix_udp_sock::RecvMeta};

    use super::*;

    /// empty BOOTREPLY echoing the request header
    pub fn new_msg(req: &Message) -> Message {
        let mut msg = Message::new_with_id(
            req.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            req.giaddr(),
            req.chaddr(),
        );
        msg.set_opcode(Opcode::BootReply)
            .set_htype(req.htype())
            .set_flags(req.flags())
            .set_hops(req.hops());
        msg
    }

    /// for testing, a context as if `msg` arrived from a client on port 68
    pub fn blank_ctx(msg: &Message) -> Result<MsgContext> {
        let recv_addr: SocketAddr = "0.0.0.0:68".parse()?;
        let buf = SerialMsg::from_msg(msg, recv_addr)?;
        let meta = RecvMeta {
            addr: recv_addr,
            len: buf.bytes().len(),
            ifindex: 1,
            dst_ip: Some(Ipv4Addr::BROADCAST.into()),
            ..RecvMeta::default()
        };
        Ok(MsgContext::new(buf, meta, Arc::new(State::new()))?)
    }
}
