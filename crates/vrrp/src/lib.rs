//! Virtual Router Redundancy Protocol (VRRP) Version 3
//!
//! Pure Rust implementation of RFC 5798 for first-hop router redundancy
//! on a single Linux interface, for IPv4 and IPv6 virtual routers.
//!
//! # Features
//!
//! - VRRPv3 advertisement codec with pseudo-header checksumming
//! - Raw multicast socket plane with strict TTL/hop-limit enforcement
//! - Priority-based master election with preemption and owner mode
//! - Gratuitous ARP / unsolicited Neighbor Advertisement on takeover
//! - Graceful shutdown (priority 0 advertisement)
//! - Per-transition callbacks for installing and removing virtual IPs
//!
//! # Example
//!
//! ```no_run
//! use vrrp::{VRRPConfig, VirtualRouter};
//!
//! # async fn example() -> common::Result<()> {
//! let mut config = VRRPConfig::default();
//! config.vrid = 51;
//! config.interface = "eth0".to_string();
//! config.virtual_ips.push("192.168.1.1".parse().unwrap());
//!
//! // Requires CAP_NET_RAW
//! let router = VirtualRouter::new(config)?;
//! let handle = router.handle();
//!
//! tokio::spawn(router.run());
//! handle.start().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("this crate needs Linux raw IP sockets with ancillary TTL/hop-limit delivery");

mod announce;
mod packet;
mod socket;
mod state_machine;
mod types;

pub use announce::{solicited_node_multicast, Announcer, ArpAnnouncer, NdpAnnouncer, VipSnapshot};
pub use pnet::util::MacAddr;
pub use packet::{DecodeError, PseudoHeader, VRRPPacket, VRRP_HEADER_LEN, VRRP_TYPE_ADVERTISEMENT};
pub use socket::{
    find_interface, preferred_source_ip, AdvertSink, DropReason, Interface, ReceivedPacket,
    RecvError, VRRPSocket,
};
pub use state_machine::{RouterHandle, TransitionHandler, VirtualRouter};
pub use types::{
    centis_to_duration, master_down_interval, skew_time, Event, IpFamily, Transition, VRRPConfig,
    VRRPState, VRRPStats, VRRPStatsSnapshot, DEFAULT_ADVERT_INTERVAL, DEFAULT_PRIORITY,
    MAX_ADVERT_INTERVAL, VRRP_MULTICAST_V4, VRRP_MULTICAST_V6, VRRP_PROTOCOL, VRRP_VERSION,
};
