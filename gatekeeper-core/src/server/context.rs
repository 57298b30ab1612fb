//! context of current server message
use chrono::{DateTime, Utc};
use dhcproto::{v4, Decodable, Decoder};
use pnet::ipnetwork::Ipv4Network;
use tracing::{error, trace};
use unix_udp_sock::RecvMeta;

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use crate::{
    metrics::{self, RECV_TYPE_COUNT, SENT_TYPE_COUNT},
    server::{msg::SerialMsg, state::State, typemap::TypeMap},
};

/// Context is what will be passed to the [handler] traits and mutated by
/// the plugins to enrich with data.
///
/// [handler]: crate::handler
pub struct MsgContext {
    /// underlying byte message and the address we received it from
    msg_buf: SerialMsg,
    /// address response sent to
    dst_addr: Option<SocketAddr>,
    /// time this context was created
    time: DateTime<Utc>,
    /// decoded from msg
    msg: v4::Message,
    /// response under construction
    resp_msg: Option<v4::Message>,
    /// a type map for use by plugins to store values
    type_map: TypeMap,
    /// unique id we assign to each `MsgContext`
    id: u64,
    /// metadata about the packet we received
    meta: RecvMeta,
    /// ip/mask of the interface we received msg on
    interface: Option<Ipv4Network>,
}

impl fmt::Debug for MsgContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgContext")
            .field("src_addr", &self.msg_buf.addr())
            .field("dst_addr", &self.dst_addr)
            .field("time", &self.time)
            .field("id", &self.id)
            .field("msg", &self.msg)
            .field("resp_msg", &self.resp_msg)
            .field("interface", &self.interface)
            .finish()
    }
}

impl MsgContext {
    /// Decode `msg_buf` into a new `MsgContext`
    pub fn new(msg_buf: SerialMsg, meta: RecvMeta, state: Arc<State>) -> io::Result<Self> {
        let msg = {
            let mut decoder = Decoder::new(msg_buf.bytes());
            v4::Message::decode(&mut decoder)
                .map_err(|op| io::Error::new(io::ErrorKind::InvalidData, op))?
        };

        Ok(Self {
            msg_buf,
            meta,
            dst_addr: None,
            time: Utc::now(),
            msg,
            type_map: TypeMap::new(),
            resp_msg: None,
            id: state.inc_id(),
            interface: None,
        })
    }

    /// Get the id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the `SerialMsg` bytes by shared ref
    pub fn bytes(&self) -> &[u8] {
        self.msg_buf.bytes()
    }

    /// return meta data associated with recv'd packet
    pub fn meta(&self) -> RecvMeta {
        self.meta
    }

    /// Get the `DateTime` that we first created this `MsgContext`
    ///
    /// [`DateTime`]: chrono::DateTime
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Store a value in the current `MsgContext` based on a type.
    /// This value will be available across any step in the lifecycle of a
    /// request
    ///
    /// If this type already exists, it will be returned
    pub fn set_local<U: Send + Sync + 'static>(&mut self, val: U) -> Option<U> {
        self.type_map.insert(val)
    }

    /// Return a value in the current `MsgContext` based on a type, or `None` if
    /// no such value is present.
    pub fn get_local<U: Send + Sync + 'static>(&self) -> Option<&U> {
        self.type_map.get::<U>()
    }

    /// Return a mutable reference to a value in the current `MsgContext` based
    /// on a type, or `None` if no such value is present.
    pub fn get_mut_local<U: Send + Sync + 'static>(&mut self) -> Option<&mut U> {
        self.type_map.get_mut::<U>()
    }

    /// Removes an item from the type map, returning it.
    pub fn remove_local<U: Send + Sync + 'static>(&mut self) -> Option<U> {
        self.type_map.remove::<U>()
    }

    /// address the message came from
    pub fn src_addr(&self) -> SocketAddr {
        self.msg_buf.addr()
    }

    /// Return the destination address and port IF it has been set.
    ///
    /// `dst_addr` is determined when a response is sent.
    pub fn dst_addr(&self) -> Option<SocketAddr> {
        self.dst_addr
    }

    /// Overrides the `dst_addr` with a new address/port.
    pub fn set_dst_addr(&mut self, addr: SocketAddr) {
        self.dst_addr = Some(addr);
    }

    /// The deserialized contents of `msg`
    pub fn msg(&self) -> &v4::Message {
        &self.msg
    }

    /// The contents of `resp_msg`
    pub fn resp_msg(&self) -> Option<&v4::Message> {
        self.resp_msg.as_ref()
    }

    /// sets the resp_msg with a `Message`
    pub fn set_resp_msg(&mut self, msg: v4::Message) {
        self.resp_msg = Some(msg);
    }

    /// take response message and replace with None
    pub fn resp_msg_take(&mut self) -> Option<v4::Message> {
        self.resp_msg.take()
    }

    /// The mutable deserialized contents of `resp_msg`
    pub fn resp_msg_mut(&mut self) -> Option<&mut v4::Message> {
        self.resp_msg.as_mut()
    }

    /// set the interface for the message
    pub fn set_interface(&mut self, interface: Ipv4Network) {
        self.interface = Some(interface);
    }

    /// the interface the message was received on
    pub fn interface(&self) -> Option<Ipv4Network> {
        self.interface
    }

    /// determine the response addr based on request. Sets response giaddr
    /// if we are talking to a relay. Injects into ARP cache if response will be
    /// unicast to yiaddr.
    //
    // From RFC 2131:
    //
    // 1. giaddr non-zero: send to the relay on the server port.
    // 2. giaddr zero, ciaddr non-zero: unicast to ciaddr.
    // 3. giaddr and ciaddr zero, broadcast bit set: broadcast.
    // 4. broadcast bit not set and giaddr/ciaddr zero: unicast to chaddr/yiaddr.
    // 5. giaddr zero: NAKs are always broadcast.
    pub fn resp_addr(&mut self, default_port: bool, soc: socket2::SockRef<'_>) -> SocketAddr {
        let req = self.msg();
        let giaddr = req.giaddr();
        let ciaddr = req.ciaddr();
        let broadcast = req.flags().broadcast();
        let is_nak = matches!(
            self.resp_msg().and_then(|resp| resp.opts().msg_type()),
            Some(v4::MessageType::Nak)
        );
        let yiaddr = self
            .resp_msg()
            .map(|msg| msg.yiaddr())
            .filter(|ip| !ip.is_unspecified());

        if !default_port {
            // not on 67, send back to where it came from. Useful for testing
            trace!("using non-default port for response");
            self.src_addr()
        } else if !giaddr.is_unspecified() {
            trace!("responding using giaddr");
            if let Some(resp) = self.resp_msg.as_mut() {
                resp.set_giaddr(giaddr);
            }
            (giaddr, v4::SERVER_PORT).into()
        } else if is_nak {
            trace!("broadcasting nak");
            (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
        } else if !ciaddr.is_unspecified() {
            trace!("responding using ciaddr");
            (ciaddr, v4::CLIENT_PORT).into()
        } else if let (false, Some(yiaddr)) = (broadcast, yiaddr) {
            trace!("responding using yiaddr");
            let htype = self.msg().htype();
            if let Err(err) = super::ioctl::inject_arp(soc, yiaddr, htype, self.msg().chaddr()) {
                error!(
                    ?err,
                    "failed to inject into ARP cache-- fall back to broadcast"
                );
                (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
            } else {
                (yiaddr, v4::CLIENT_PORT).into()
            }
        } else {
            trace!("use broadcast addr");
            (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
        }
    }

    /// records metrics for recvd DHCP message
    pub fn recv_metrics(&self) {
        metrics::DHCPV4_BYTES_RECV.inc_by(self.bytes().len() as u64);
        match self.msg().opts().msg_type() {
            Some(v4::MessageType::Discover) => RECV_TYPE_COUNT.discover.inc(),
            Some(v4::MessageType::Request) => RECV_TYPE_COUNT.request.inc(),
            Some(v4::MessageType::Decline) => RECV_TYPE_COUNT.decline.inc(),
            Some(v4::MessageType::Release) => RECV_TYPE_COUNT.release.inc(),
            Some(v4::MessageType::Offer) => RECV_TYPE_COUNT.offer.inc(),
            Some(v4::MessageType::Ack) => RECV_TYPE_COUNT.ack.inc(),
            Some(v4::MessageType::Nak) => RECV_TYPE_COUNT.nak.inc(),
            Some(v4::MessageType::Inform) => RECV_TYPE_COUNT.inform.inc(),
            _ => RECV_TYPE_COUNT.unknown.inc(),
        }
    }

    /// records metrics for sent DHCP message
    pub fn sent_metrics(&self, len: usize, elapsed: Duration) -> io::Result<()> {
        let elapsed = elapsed.as_secs_f64();
        metrics::DHCPV4_BYTES_SENT.inc_by(len as u64);
        let label = match self
            .resp_msg()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "v4 response not found"))?
            .opts()
            .msg_type()
        {
            Some(v4::MessageType::Offer) => {
                SENT_TYPE_COUNT.offer.inc();
                "offer"
            }
            Some(v4::MessageType::Ack) => {
                SENT_TYPE_COUNT.ack.inc();
                "ack"
            }
            Some(v4::MessageType::Nak) => {
                SENT_TYPE_COUNT.nak.inc();
                "nak"
            }
            _ => {
                SENT_TYPE_COUNT.unknown.inc();
                "unknown"
            }
        };
        metrics::DHCPV4_REPLY_DURATION
            .with_label_values(&[label])
            .observe(elapsed);
        Ok(())
    }
}
