//! Gratuitous address announcements.
//!
//! When a virtual router takes Mastership it must refresh the neighbor
//! caches on the broadcast domain: gratuitous ARP replies for IPv4 virtual
//! addresses, unsolicited Neighbor Advertisements for IPv6 ones.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::time::Duration;

use pnet::datalink::{self, Channel, Config as DatalinkConfig, DataLinkSender, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::icmpv6::ndp::{
    MutableNeighborAdvertPacket, NdpOption, NdpOptionTypes, NeighborAdvertFlags,
};
use pnet::packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Types};
use pnet::packet::MutablePacket;
use pnet::util::MacAddr;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use common::{Error, Result};

/// Advisory upper bound on how long one announcement write may block.
const WRITE_DEADLINE: Duration = Duration::from_micros(500);

const ETHERNET_ARP_LEN: usize = 42;
const NEIGHBOR_ADVERT_LEN: usize = 32;

/// Immutable view of a router handed to the announcer on Master entry.
#[derive(Debug, Clone)]
pub struct VipSnapshot {
    /// MAC of the working interface
    pub mac: MacAddr,
    /// Virtual addresses currently protected
    pub vips: Vec<IpAddr>,
}

/// One L2 broadcast per protected address. Underlying handles are released
/// on drop.
pub trait Announcer: Send {
    fn announce_all(&mut self, snapshot: &VipSnapshot) -> Result<()>;
}

/// Gratuitous ARP announcer for IPv4 virtual routers.
pub struct ArpAnnouncer {
    tx: Box<dyn DataLinkSender>,
}

impl ArpAnnouncer {
    pub fn new(iface: &NetworkInterface) -> Result<Self> {
        let config = DatalinkConfig {
            write_timeout: Some(WRITE_DEADLINE),
            ..Default::default()
        };
        match datalink::channel(iface, config) {
            Ok(Channel::Ethernet(tx, _rx)) => Ok(Self { tx }),
            Ok(_) => Err(Error::announce(format!(
                "interface {} does not provide an ethernet channel",
                iface.name
            ))),
            Err(err) => Err(Error::announce(format!(
                "open L2 channel on {}: {err}",
                iface.name
            ))),
        }
    }
}

impl Announcer for ArpAnnouncer {
    fn announce_all(&mut self, snapshot: &VipSnapshot) -> Result<()> {
        for vip in &snapshot.vips {
            let IpAddr::V4(vip) = vip else { continue };
            let frame = build_gratuitous_arp(snapshot.mac, *vip)?;
            match self.tx.send_to(&frame, None) {
                Some(Ok(())) => debug!(%vip, "sent gratuitous ARP"),
                Some(Err(err)) => {
                    return Err(Error::announce(format!("gratuitous ARP for {vip}: {err}")));
                }
                None => return Err(Error::announce("L2 channel refused the frame")),
            }
        }
        Ok(())
    }
}

/// Unsolicited Neighbor Advertisement announcer for IPv6 virtual routers.
pub struct NdpAnnouncer {
    socket: Socket,
    source: Ipv6Addr,
    ifindex: u32,
}

impl NdpAnnouncer {
    /// `source` must be the interface link-local address.
    pub fn new(source: Ipv6Addr, ifindex: u32) -> Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.set_multicast_hops_v6(255)?;
        socket.set_multicast_if_v6(ifindex)?;
        socket.bind(&SocketAddrV6::new(source, 0, 0, ifindex).into())?;
        Ok(Self {
            socket,
            source,
            ifindex,
        })
    }
}

impl Announcer for NdpAnnouncer {
    fn announce_all(&mut self, snapshot: &VipSnapshot) -> Result<()> {
        for vip in &snapshot.vips {
            let IpAddr::V6(target) = vip else { continue };
            let group = solicited_node_multicast(*target);
            let advert = build_neighbor_advert(snapshot.mac, *target, self.source, group)?;
            let destination = SocketAddrV6::new(group, 0, 0, self.ifindex);
            self.socket
                .send_to(&advert, &destination.into())
                .map_err(|err| {
                    Error::announce(format!("neighbor advertisement for {target}: {err}"))
                })?;
            debug!(vip = %target, "sent unsolicited neighbor advertisement");
        }
        Ok(())
    }
}

/// The solicited-node multicast group FF02::1:FFxx:xxxx for `ip`
/// (RFC 4291 2.7.1).
pub fn solicited_node_multicast(ip: Ipv6Addr) -> Ipv6Addr {
    let octets = ip.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | u16::from(octets[13]),
        u16::from(octets[14]) << 8 | u16::from(octets[15]),
    )
}

/// Ethernet broadcast frame carrying a gratuitous ARP reply: sender and
/// target protocol address are both the virtual IP, the sender hardware
/// address is the interface MAC.
fn build_gratuitous_arp(mac: MacAddr, vip: Ipv4Addr) -> Result<[u8; ETHERNET_ARP_LEN]> {
    let mut frame = [0u8; ETHERNET_ARP_LEN];
    let mut ethernet = MutableEthernetPacket::new(&mut frame)
        .ok_or_else(|| Error::announce("ARP frame buffer too small"))?;
    ethernet.set_destination(MacAddr::broadcast());
    ethernet.set_source(mac);
    ethernet.set_ethertype(EtherTypes::Arp);

    let mut arp = MutableArpPacket::new(ethernet.payload_mut())
        .ok_or_else(|| Error::announce("ARP payload buffer too small"))?;
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Reply);
    arp.set_sender_hw_addr(mac);
    arp.set_sender_proto_addr(vip);
    arp.set_target_hw_addr(MacAddr::broadcast());
    arp.set_target_proto_addr(vip);

    Ok(frame)
}

/// Unsolicited Neighbor Advertisement with the Override flag and a Source
/// Link-Layer Address option carrying the interface MAC.
fn build_neighbor_advert(
    mac: MacAddr,
    target: Ipv6Addr,
    source: Ipv6Addr,
    destination: Ipv6Addr,
) -> Result<[u8; NEIGHBOR_ADVERT_LEN]> {
    let mut buf = [0u8; NEIGHBOR_ADVERT_LEN];
    {
        let mut advert = MutableNeighborAdvertPacket::new(&mut buf)
            .ok_or_else(|| Error::announce("neighbor advertisement buffer too small"))?;
        advert.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
        advert.set_icmpv6_code(Icmpv6Code::new(0));
        advert.set_flags(NeighborAdvertFlags::Override);
        advert.set_target_addr(target);
        advert.set_options(&[NdpOption {
            option_type: NdpOptionTypes::SourceLLAddr,
            length: 1,
            data: mac.octets().to_vec(),
        }]);
    }

    let checksum = {
        let view = Icmpv6Packet::new(&buf)
            .ok_or_else(|| Error::announce("neighbor advertisement buffer too small"))?;
        icmpv6::checksum(&view, &source, &destination)
    };
    buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}
