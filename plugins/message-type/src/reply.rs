//! Turning a lease decision into the outbound message
use std::net::Ipv4Addr;

use config::{NetworkConfig, Subnet};
use gatekeeper_core::dhcproto::v4::{self, DhcpOption, MessageType, OptionCode};

use crate::Request;

/// options this server knows how to answer with
const ANSWERED: &[OptionCode] = &[
    OptionCode::SubnetMask,
    OptionCode::Router,
    OptionCode::DomainNameServer,
    OptionCode::DomainName,
    OptionCode::ServerIdentifier,
    OptionCode::AddressLeaseTime,
    OptionCode::BroadcastAddr,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Offer,
    Ack,
    Nak,
}

impl From<ReplyKind> for MessageType {
    fn from(kind: ReplyKind) -> Self {
        match kind {
            ReplyKind::Offer => MessageType::Offer,
            ReplyKind::Ack => MessageType::Ack,
            ReplyKind::Nak => MessageType::Nak,
        }
    }
}

/// what the lease logic decided, `yiaddr` is ignored on a NAK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub yiaddr: Ipv4Addr,
    pub subnet: Subnet,
}

impl Reply {
    pub fn offer(yiaddr: Ipv4Addr, subnet: Subnet) -> Self {
        Self {
            kind: ReplyKind::Offer,
            yiaddr,
            subnet,
        }
    }

    pub fn ack(yiaddr: Ipv4Addr, subnet: Subnet) -> Self {
        Self {
            kind: ReplyKind::Ack,
            yiaddr,
            subnet,
        }
    }

    pub fn nak(subnet: Subnet) -> Self {
        Self {
            kind: ReplyKind::Nak,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            subnet,
        }
    }
}

/// Write `reply` into `resp`. OFFER and ACK carry the subnet options the
/// client listed in its parameter request list; a NAK carries only the
/// message type and server identifier.
pub fn populate_reply(resp: &mut v4::Message, request: &Request, reply: &Reply, cfg: &NetworkConfig) {
    let subnet = reply.subnet;
    resp.opts_mut()
        .insert(DhcpOption::MessageType(reply.kind.into()));

    if reply.kind == ReplyKind::Nak {
        resp.set_yiaddr(Ipv4Addr::UNSPECIFIED)
            .set_siaddr(Ipv4Addr::UNSPECIFIED);
        resp.opts_mut()
            .insert(DhcpOption::ServerIdentifier(subnet.dhcp_server_ip()));
        return;
    }

    resp.set_yiaddr(reply.yiaddr)
        .set_siaddr(subnet.dhcp_server_ip());
    for code in ANSWERED.iter().filter(|code| request.wants(**code)) {
        if let Some(opt) = answer(*code, &subnet, cfg) {
            resp.opts_mut().insert(opt);
        }
    }
}

fn answer(code: OptionCode, subnet: &Subnet, cfg: &NetworkConfig) -> Option<DhcpOption> {
    Some(match code {
        OptionCode::SubnetMask => DhcpOption::SubnetMask(subnet.network_mask()),
        OptionCode::Router => DhcpOption::Router(vec![subnet.router_ip()]),
        OptionCode::DomainNameServer => DhcpOption::DomainNameServer(vec![subnet.dns_ip()]),
        OptionCode::DomainName => DhcpOption::DomainName(cfg.domain()?.to_owned()),
        OptionCode::ServerIdentifier => DhcpOption::ServerIdentifier(subnet.dhcp_server_ip()),
        OptionCode::AddressLeaseTime => {
            DhcpOption::AddressLeaseTime(whole_seconds(cfg.lease_time()))
        }
        OptionCode::BroadcastAddr => DhcpOption::BroadcastAddr(subnet.broadcast()),
        _ => return None,
    })
}

fn whole_seconds(t: std::time::Duration) -> u32 {
    u32::try_from(t.as_secs()).unwrap_or(u32::MAX)
}
