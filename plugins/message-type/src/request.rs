//! The parts of an inbound message the lease logic looks at
use std::net::Ipv4Addr;

use gatekeeper_core::dhcproto::v4::{self, DhcpOption, MessageType, OptionCode};
use registry::Mac;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no message type option")]
    MissingMessageType,
    #[error("message type {0:?} is not handled")]
    Unsupported(MessageType),
    #[error("no client hardware address")]
    MissingHardwareAddress,
    #[error("client hardware address is {0} bytes, expected 6")]
    BadHardwareAddress(usize),
}

/// the two messages that start a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Discover,
    Request,
}

/// A decoded DISCOVER or REQUEST. Lives for one transaction, never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub xid: u32,
    pub flags: v4::Flags,
    pub mac: Mac,
    pub msg_type: RequestType,
    /// ciaddr, when not 0.0.0.0
    pub client_ip: Option<Ipv4Addr>,
    /// option 50
    pub requested_ip: Option<Ipv4Addr>,
    /// option 12
    pub hostname: Option<String>,
    /// option 60
    pub class_id: Option<String>,
    /// option 55
    pub parameter_request_list: Option<Vec<OptionCode>>,
    /// option 54, the server the client is talking to
    pub server_id: Option<Ipv4Addr>,
}

impl Request {
    /// did the client ask for `code` in its parameter request list
    pub fn wants(&self, code: OptionCode) -> bool {
        self.parameter_request_list
            .as_ref()
            .map_or(false, |prl| prl.contains(&code))
    }

    /// `requested_ip`, falling back to `client_ip`
    pub fn address_requested(&self) -> Option<Ipv4Addr> {
        self.requested_ip.or(self.client_ip)
    }
}

impl TryFrom<&v4::Message> for Request {
    type Error = ParseError;

    fn try_from(msg: &v4::Message) -> Result<Self, Self::Error> {
        let opts = msg.opts();
        let msg_type = match opts.msg_type() {
            Some(MessageType::Discover) => RequestType::Discover,
            Some(MessageType::Request) => RequestType::Request,
            Some(other) => return Err(ParseError::Unsupported(other)),
            None => return Err(ParseError::MissingMessageType),
        };
        let chaddr = msg.chaddr();
        if chaddr.is_empty() {
            return Err(ParseError::MissingHardwareAddress);
        }
        let mac = Mac::from_bytes(chaddr).ok_or(ParseError::BadHardwareAddress(chaddr.len()))?;

        let requested_ip = match opts.get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };
        let hostname = match opts.get(OptionCode::Hostname) {
            Some(DhcpOption::Hostname(name)) => Some(name.clone()),
            _ => None,
        };
        // only a hint, binary identifiers are kept lossily
        let class_id = match opts.get(OptionCode::ClassIdentifier) {
            Some(DhcpOption::ClassIdentifier(id)) => Some(String::from_utf8_lossy(id).into_owned()),
            _ => None,
        };
        let parameter_request_list = match opts.get(OptionCode::ParameterRequestList) {
            Some(DhcpOption::ParameterRequestList(prl)) => Some(prl.clone()),
            _ => None,
        };
        let server_id = match opts.get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(ip)) if !ip.is_unspecified() => Some(*ip),
            _ => None,
        };
        let ciaddr = msg.ciaddr();

        Ok(Self {
            xid: msg.xid(),
            flags: msg.flags(),
            mac,
            msg_type,
            client_ip: (!ciaddr.is_unspecified()).then_some(ciaddr),
            requested_ip,
            hostname,
            class_id,
            parameter_request_list,
            server_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(msg_type: MessageType, chaddr: &[u8]) -> v4::Message {
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = v4::Message::new(uns, uns, uns, uns, chaddr);
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        msg
    }

    #[test]
    fn test_parse_request() {
        let mut m = msg(MessageType::Request, &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        m.set_ciaddr([192, 168, 1, 7]);
        m.opts_mut()
            .insert(DhcpOption::RequestedIpAddress([192, 168, 1, 3].into()));
        m.opts_mut()
            .insert(DhcpOption::Hostname("laptop".to_owned()));
        m.opts_mut()
            .insert(DhcpOption::ClassIdentifier(b"android-dhcp-13".to_vec()));
        m.opts_mut()
            .insert(DhcpOption::ParameterRequestList(vec![
                OptionCode::SubnetMask,
                OptionCode::Router,
            ]));

        let req = Request::try_from(&m).unwrap();
        assert_eq!(req.msg_type, RequestType::Request);
        assert_eq!(req.mac.to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!(req.client_ip, Some([192, 168, 1, 7].into()));
        assert_eq!(req.requested_ip, Some([192, 168, 1, 3].into()));
        // option 50 wins over ciaddr
        assert_eq!(req.address_requested(), Some([192, 168, 1, 3].into()));
        assert_eq!(req.hostname.as_deref(), Some("laptop"));
        assert_eq!(req.class_id.as_deref(), Some("android-dhcp-13"));
        assert!(req.wants(OptionCode::Router));
        assert!(!req.wants(OptionCode::DomainNameServer));
        assert_eq!(req.server_id, None);
    }

    #[test]
    fn test_parse_minimal_discover() {
        let m = msg(MessageType::Discover, &[1, 2, 3, 4, 5, 6]);
        let req = Request::try_from(&m).unwrap();
        assert_eq!(req.msg_type, RequestType::Discover);
        assert_eq!(req.client_ip, None);
        assert_eq!(req.address_requested(), None);
        assert_eq!(req.parameter_request_list, None);
        assert!(!req.wants(OptionCode::SubnetMask));
    }

    #[test]
    fn test_parse_errors() {
        let m = msg(MessageType::Release, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            Request::try_from(&m),
            Err(ParseError::Unsupported(MessageType::Release))
        );

        let uns = Ipv4Addr::UNSPECIFIED;
        let m = v4::Message::new(uns, uns, uns, uns, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(Request::try_from(&m), Err(ParseError::MissingMessageType));

        let m = msg(MessageType::Discover, &[1, 2, 3, 4]);
        assert_eq!(Request::try_from(&m), Err(ParseError::BadHardwareAddress(4)));

    }

    #[test]
    fn test_binary_class_id_is_kept() {
        let mut m = msg(MessageType::Discover, &[1, 2, 3, 4, 5, 6]);
        m.opts_mut()
            .insert(DhcpOption::ClassIdentifier(vec![0x01, 0xff, 0xfe, b'x']));
        let req = Request::try_from(&m).unwrap();
        assert_eq!(req.class_id.as_deref(), Some("\u{1}\u{fffd}\u{fffd}x"));
    }
}
