//! VRRP multicast socket plane.
//!
//! Raw IP-protocol-112 sockets bound to one interface, joined to the VRRP
//! multicast group, sending with TTL/hop-limit 255 and enforcing the same
//! limit on receive (RFC 5798 5.1.1.3 / 5.1.2.3). IPv4 receive parses the
//! delivered IP header; IPv6 receive takes hop limit and destination from
//! ancillary data.

use std::io::{self, IoSliceMut};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn6};
use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

use common::{Error, Result};

use crate::packet::{DecodeError, PseudoHeader, VRRPPacket};
use crate::types::{IpFamily, VRRP_MULTICAST_V4, VRRP_MULTICAST_V6, VRRP_PROTOCOL};

/// Receive buffer size; comfortably above any advertisement plus IP header.
const RECV_BUFFER_SIZE: usize = 2048;

/// Minimal IPv4 header length.
const IPV4_HEADER_MIN: usize = 20;

/// The resolved identity of the working interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
}

/// Why an incoming datagram never reached the state machine.
#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("TTL/hop limit {0}, expected 255")]
    TtlNotMax(u8),

    #[error("short or malformed IP header")]
    ShortIpHeader,

    #[error("hop limit or destination missing from ancillary data")]
    MissingAncillary,

    #[error("checksum validation failed")]
    BadChecksum,

    #[error(transparent)]
    Malformed(#[from] DecodeError),
}

/// Receive-path failure: either one dropped datagram or a socket error.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("datagram dropped: {0}")]
    Dropped(#[from] DropReason),
}

/// A validated advertisement together with the source address it arrived
/// from, as the state machine consumes it.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub packet: VRRPPacket,
    pub source: IpAddr,
}

/// Outbound seam between the state machine and the wire. The production
/// implementation is [`VRRPSocket`]; tests substitute in-memory links.
pub trait AdvertSink: Send + Sync {
    fn send_advert(&self, packet: &VRRPPacket) -> Result<()>;
}

/// Raw multicast socket for one virtual router.
pub struct VRRPSocket {
    inner: AsyncFd<Socket>,
    family: IpFamily,
    source_ip: IpAddr,
    ifindex: u32,
}

impl VRRPSocket {
    /// Open the raw protocol-112 socket on `iface` with every option
    /// RFC 5798 requires. Fails fast: any missing capability or option
    /// surfaces here, before the state machine starts.
    pub fn open(iface: &Interface, family: IpFamily, source_ip: IpAddr) -> Result<Self> {
        let domain = match family {
            IpFamily::V4 => Domain::IPV4,
            IpFamily::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(i32::from(VRRP_PROTOCOL))))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind_device(Some(iface.name.as_bytes()))?;

        match family {
            IpFamily::V4 => {
                socket.set_multicast_ttl_v4(255)?;
                socket.set_multicast_loop_v4(false)?;
                socket.set_tos(7)?;
                socket.join_multicast_v4_n(
                    &VRRP_MULTICAST_V4,
                    &InterfaceIndexOrAddress::Index(iface.index),
                )?;
                set_multicast_if_v4(&socket, iface.index)?;
            }
            IpFamily::V6 => {
                socket.set_multicast_hops_v6(255)?;
                socket.set_multicast_loop_v6(false)?;
                socket.join_multicast_v6(&VRRP_MULTICAST_V6, iface.index)?;
                socket.set_multicast_if_v6(iface.index)?;
                setsockopt(&socket, sockopt::Ipv6RecvHopLimit, &true).map_err(Error::socket)?;
                setsockopt(&socket, sockopt::Ipv6RecvPacketInfo, &true).map_err(Error::socket)?;
            }
        }

        Ok(Self {
            inner: AsyncFd::new(socket)?,
            family,
            source_ip,
            ifindex: iface.index,
        })
    }

    /// Receive one validated advertisement. Blocks until a datagram
    /// arrives; a datagram failing validation is reported as
    /// [`RecvError::Dropped`] so the caller can log and count it.
    pub async fn recv_advert(&self) -> std::result::Result<ReceivedPacket, RecvError> {
        loop {
            let mut guard = self.inner.readable().await?;
            let attempt = guard.try_io(|fd| match self.family {
                IpFamily::V4 => recv_v4(fd.get_ref()),
                IpFamily::V6 => recv_v6(fd.get_ref()),
            });
            match attempt {
                Ok(Ok(outcome)) => return outcome.map_err(RecvError::from),
                Ok(Err(err)) => return Err(RecvError::Io(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AdvertSink for VRRPSocket {
    /// Serialize `packet`, finalize the checksum against this socket's
    /// pseudo-header and write it to the multicast group.
    fn send_advert(&self, packet: &VRRPPacket) -> Result<()> {
        let mut packet = packet.clone();
        let group = self.family.multicast_group();
        let pshdr = PseudoHeader::new(self.source_ip, group, packet.packet_size() as u16);
        packet.set_checksum(&pshdr);

        let destination: SocketAddr = match group {
            IpAddr::V4(addr) => SocketAddrV4::new(addr, 0).into(),
            IpAddr::V6(addr) => SocketAddrV6::new(addr, 0, 0, self.ifindex).into(),
        };
        self.inner
            .get_ref()
            .send_to(&packet.to_bytes(), &destination.into())?;
        Ok(())
    }
}

impl Drop for VRRPSocket {
    fn drop(&mut self) {
        // best effort: the descriptor itself closes right after
        let socket = self.inner.get_ref();
        let _ = match self.family {
            IpFamily::V4 => socket.leave_multicast_v4_n(
                &VRRP_MULTICAST_V4,
                &InterfaceIndexOrAddress::Index(self.ifindex),
            ),
            IpFamily::V6 => socket.leave_multicast_v6(&VRRP_MULTICAST_V6, self.ifindex),
        };
    }
}

fn recv_v4(socket: &Socket) -> io::Result<std::result::Result<ReceivedPacket, DropReason>> {
    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
    let (len, peer) = socket.recv_from(&mut buf)?;
    // recv_from initialized buf[..len]
    let data = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
    let source = peer.as_socket().map(|addr| addr.ip());
    Ok(parse_v4_datagram(data, source))
}

fn recv_v6(socket: &Socket) -> io::Result<std::result::Result<ReceivedPacket, DropReason>> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let (len, source, hop_limit, destination) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg = cmsg_space!(libc::c_int, libc::in6_pktinfo);
        let msg = recvmsg::<SockaddrIn6>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(nix_to_io)?;

        let mut hop_limit = None;
        let mut destination = None;
        for cmsg in msg.cmsgs().map_err(nix_to_io)? {
            match cmsg {
                ControlMessageOwned::Ipv6HopLimit(hops) => {
                    hop_limit = Some(u8::try_from(hops).unwrap_or(0));
                }
                ControlMessageOwned::Ipv6PacketInfo(info) => {
                    destination = Some(Ipv6Addr::from(info.ipi6_addr.s6_addr));
                }
                _ => {}
            }
        }
        let source = msg.address.map(|addr| addr.ip());
        (msg.bytes, source, hop_limit, destination)
    };
    Ok(parse_v6_datagram(&buf[..len], source, hop_limit, destination))
}

/// Validate one raw IPv4 datagram: header sanity, TTL exactly 255, then
/// codec and checksum over the reconstructed pseudo-header.
fn parse_v4_datagram(
    data: &[u8],
    source: Option<IpAddr>,
) -> std::result::Result<ReceivedPacket, DropReason> {
    if data.len() < IPV4_HEADER_MIN {
        return Err(DropReason::ShortIpHeader);
    }
    let header_len = usize::from(data[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_MIN || data.len() < header_len {
        return Err(DropReason::ShortIpHeader);
    }

    let ttl = data[8];
    if ttl != 255 {
        return Err(DropReason::TtlNotMax(ttl));
    }

    let header_source = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let destination = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let source = source.unwrap_or(IpAddr::V4(header_source));

    let payload = &data[header_len..];
    let packet = VRRPPacket::decode(IpFamily::V4, payload)?;
    let pshdr = PseudoHeader::new(source, IpAddr::V4(destination), payload.len() as u16);
    if !packet.verify_checksum(&pshdr) {
        return Err(DropReason::BadChecksum);
    }

    Ok(ReceivedPacket { packet, source })
}

/// Validate one IPv6 payload using the metadata recvmsg supplied.
fn parse_v6_datagram(
    data: &[u8],
    source: Option<Ipv6Addr>,
    hop_limit: Option<u8>,
    destination: Option<Ipv6Addr>,
) -> std::result::Result<ReceivedPacket, DropReason> {
    let (Some(source), Some(hop_limit), Some(destination)) = (source, hop_limit, destination)
    else {
        return Err(DropReason::MissingAncillary);
    };
    if hop_limit != 255 {
        return Err(DropReason::TtlNotMax(hop_limit));
    }

    let packet = VRRPPacket::decode(IpFamily::V6, data)?;
    let pshdr = PseudoHeader::new(
        IpAddr::V6(source),
        IpAddr::V6(destination),
        data.len() as u16,
    );
    if !packet.verify_checksum(&pshdr) {
        return Err(DropReason::BadChecksum);
    }

    Ok(ReceivedPacket {
        packet,
        source: IpAddr::V6(source),
    })
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn set_multicast_if_v4(socket: &Socket, ifindex: u32) -> io::Result<()> {
    let mreqn = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr { s_addr: 0 },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: ifindex as i32,
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &mreqn as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Find a configured interface by name.
pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| Error::interface(format!("interface {name} not found")))
}

/// Pick the source address a virtual router advertises from: the first
/// global-unicast IPv4 address, or the first link-local IPv6 address, on
/// the interface.
pub fn preferred_source_ip(iface: &NetworkInterface, family: IpFamily) -> Result<IpAddr> {
    for network in &iface.ips {
        match (family, network.ip()) {
            (IpFamily::V4, IpAddr::V4(addr)) if is_global_unicast_v4(addr) => {
                return Ok(IpAddr::V4(addr));
            }
            (IpFamily::V6, IpAddr::V6(addr)) if is_link_local_v6(addr) => {
                return Ok(IpAddr::V6(addr));
            }
            _ => {}
        }
    }
    Err(Error::interface(format!(
        "no usable {family} source address on {}",
        iface.name
    )))
}

fn is_global_unicast_v4(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast())
}

fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
