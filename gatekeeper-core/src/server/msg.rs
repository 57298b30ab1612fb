//! SerialMsg defines raw bytes and an addr
use bytes::Bytes;
use dhcproto::{v4, Decodable, Encodable};

use std::{io, net::SocketAddr};

/// A message pulled from UDP and serialized to bytes, stored with a
/// [`SocketAddr`]
///
/// [`SocketAddr`]: std::net::SocketAddr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMsg {
    message: Bytes,
    addr: SocketAddr,
}

impl SerialMsg {
    /// Construct a new `SerialMsg` and the source or destination address
    pub fn new(message: Bytes, addr: SocketAddr) -> Self {
        SerialMsg { message, addr }
    }

    /// Encode a message and pair it with `addr`
    pub fn from_msg(msg: &v4::Message, addr: SocketAddr) -> io::Result<Self> {
        Ok(SerialMsg {
            message: msg
                .to_vec()
                .map_err(|op| io::Error::new(io::ErrorKind::InvalidData, op))?
                .into(),
            addr,
        })
    }

    /// Get a reference to the bytes
    pub fn bytes(&self) -> &[u8] {
        &self.message
    }

    /// Clone underlying `Bytes` pointer
    pub fn msg(&self) -> Bytes {
        self.message.clone()
    }

    /// Get the source or destination address (context dependent)
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Deserializes the inner data into a Message
    pub fn to_msg(&self) -> io::Result<v4::Message> {
        v4::Message::from_bytes(&self.message)
            .map_err(|op| io::Error::new(io::ErrorKind::InvalidData, op))
    }
}
