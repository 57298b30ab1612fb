//! ARP cache injection, lets us unicast an OFFER/ACK to a client that has
//! no address yet
#![allow(missing_docs)]

use std::{io, mem, net::Ipv4Addr, os::unix::prelude::AsRawFd};

use dhcproto::v4;
use socket2::SockRef;

/// insert `ip -> chaddr` into the kernel ARP table with `SIOCSARP`
pub fn inject_arp(
    soc: SockRef<'_>,
    ip: Ipv4Addr,
    htype: v4::HType,
    chaddr: &[u8],
) -> io::Result<()> {
    // sa_data is 14 bytes
    if chaddr.len() > 14 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "hardware address too long for arp entry",
        ));
    }
    // SAFETY: both are plain C structs for which all-zero is a valid value
    let mut req: libc::arpreq = unsafe { mem::zeroed() };
    let mut proto: libc::sockaddr_in = unsafe { mem::zeroed() };
    proto.sin_family = libc::AF_INET as _;
    proto.sin_port = v4::CLIENT_PORT.to_be();
    proto.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    };
    // SAFETY: sockaddr_in and sockaddr have the same size
    req.arp_pa = unsafe { mem::transmute::<libc::sockaddr_in, libc::sockaddr>(proto) };
    req.arp_ha.sa_family = u8::from(htype) as _;
    for (dst, src) in req.arp_ha.sa_data.iter_mut().zip(chaddr) {
        *dst = *src as libc::c_char;
    }
    req.arp_flags = libc::ATF_COM;

    // SAFETY: fd belongs to a live v4 socket and `req` outlives the call
    let res = unsafe {
        libc::ioctl(
            soc.as_raw_fd(),
            libc::SIOCSARP,
            &req as *const libc::arpreq,
        )
    };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
