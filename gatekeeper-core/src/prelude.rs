//! gatekeeper prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait, dhcproto,
    handler::{Action, Plugin},
    pnet::datalink::{MacAddr, NetworkInterface},
    pnet::ipnetwork::{IpNetwork, Ipv4Network},
    server::{context::MsgContext, state::State},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    unix_udp_sock, Register, Server,
};

pub use std::{io, sync::Arc};
