//! VRRP data types and configuration.
//!
//! Based on RFC 5798: Virtual Router Redundancy Protocol (VRRP) Version 3

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{Error, Result};

/// VRRP protocol version (3 per RFC 5798)
pub const VRRP_VERSION: u8 = 3;

/// VRRP IP protocol number
pub const VRRP_PROTOCOL: u8 = 112;

/// VRRP multicast address for IPv4 (RFC 5798 5.1.1.2)
pub const VRRP_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// VRRP multicast address for IPv6 (RFC 5798 5.1.2.2)
pub const VRRP_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12);

/// Default priority for a backup router (RFC 5798 5.2.4)
pub const DEFAULT_PRIORITY: u8 = 100;

/// Default advertisement interval in centiseconds (1 second)
pub const DEFAULT_ADVERT_INTERVAL: u16 = 100;

/// Largest interval representable in the 12-bit Max Adver Int field
pub const MAX_ADVERT_INTERVAL: u16 = 0x0FFF;

/// Capacity of the received-advertisement queue between the reader task
/// and the state machine. Far above any realistic arrival rate, so a full
/// queue backpressures into the OS socket buffer.
pub const PACKET_QUEUE_SIZE: usize = 512;

/// Capacity of the control event channel.
pub const EVENT_CHANNEL_SIZE: usize = 1;

/// Convert a centisecond quantity (the wire unit) into a [`Duration`].
pub fn centis_to_duration(centis: u16) -> Duration {
    Duration::from_millis(u64::from(centis) * 10)
}

/// Skew_Time = ((256 - Priority) * Master_Adver_Interval) / 256, in
/// centiseconds. Computed in u32 so the intermediate product cannot wrap.
pub fn skew_time(master_adv_interval: u16, priority: u8) -> u16 {
    let scaled = u32::from(master_adv_interval) * u32::from(priority) / 256;
    master_adv_interval - scaled as u16
}

/// Master_Down_Interval = (3 * Master_Adver_Interval) + Skew_Time, in
/// centiseconds.
pub fn master_down_interval(master_adv_interval: u16, priority: u8) -> u16 {
    3 * master_adv_interval + skew_time(master_adv_interval, priority)
}

/// IP family a virtual router operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Width in bytes of one address in the advertisement body.
    pub fn addr_width(&self) -> usize {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 16,
        }
    }

    /// The VRRP multicast group for this family.
    pub fn multicast_group(&self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(VRRP_MULTICAST_V4),
            IpFamily::V6 => IpAddr::V6(VRRP_MULTICAST_V6),
        }
    }

    /// Whether `ip` belongs to this family.
    pub fn matches(&self, ip: IpAddr) -> bool {
        matches!(
            (self, ip),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// VRRP state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VRRPState {
    /// Initial state - waiting for a start command
    Init = 0,
    /// Master state - owning the virtual addresses, sending advertisements
    Master = 1,
    /// Backup state - monitoring the current master
    Backup = 2,
}

impl VRRPState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => VRRPState::Master,
            2 => VRRPState::Backup,
            _ => VRRPState::Init,
        }
    }
}

impl fmt::Display for VRRPState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VRRPState::Init => write!(f, "INIT"),
            VRRPState::Master => write!(f, "MASTER"),
            VRRPState::Backup => write!(f, "BACKUP"),
        }
    }
}

/// Control events consumed by the state machine. Everything that mutates a
/// running router flows through this single channel, so all router state
/// stays owned by the state-machine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Shutdown,
    AddVip(IpAddr),
    RemoveVip(IpAddr),
    SetPriority(u8),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start => write!(f, "START"),
            Event::Shutdown => write!(f, "SHUTDOWN"),
            Event::AddVip(ip) => write!(f, "ADD_VIP {ip}"),
            Event::RemoveVip(ip) => write!(f, "REMOVE_VIP {ip}"),
            Event::SetPriority(p) => write!(f, "SET_PRIORITY {p}"),
        }
    }
}

/// The six observable state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    InitToMaster,
    InitToBackup,
    MasterToInit,
    MasterToBackup,
    BackupToMaster,
    BackupToInit,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::InitToMaster => write!(f, "init to master"),
            Transition::InitToBackup => write!(f, "init to backup"),
            Transition::MasterToInit => write!(f, "master to init"),
            Transition::MasterToBackup => write!(f, "master to backup"),
            Transition::BackupToMaster => write!(f, "backup to master"),
            Transition::BackupToInit => write!(f, "backup to init"),
        }
    }
}

/// VRRP virtual router configuration.
#[derive(Debug, Clone)]
pub struct VRRPConfig {
    /// Virtual Router ID (1-255)
    pub vrid: u8,

    /// Network interface name
    pub interface: String,

    /// Address family the router operates on
    pub family: IpFamily,

    /// Priority for this router (1-255, 255 = IP address owner)
    pub priority: u8,

    /// Whether this router owns the virtual addresses (forces priority 255)
    pub owner: bool,

    /// Whether a higher-priority backup preempts a lower-priority master
    pub preempt: bool,

    /// Advertisement interval; clamped to [10 ms, 40.95 s] on conversion
    /// to the 12-bit centisecond wire field
    pub advert_interval: Duration,

    /// Virtual IP addresses to manage
    pub virtual_ips: Vec<IpAddr>,
}

impl Default for VRRPConfig {
    fn default() -> Self {
        Self {
            vrid: 1,
            interface: String::new(),
            family: IpFamily::V4,
            priority: DEFAULT_PRIORITY,
            owner: false,
            preempt: true,
            advert_interval: centis_to_duration(DEFAULT_ADVERT_INTERVAL),
            virtual_ips: Vec::new(),
        }
    }
}

impl VRRPConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.vrid == 0 {
            return Err(Error::config("VRID must be between 1 and 255"));
        }
        if self.priority == 0 {
            return Err(Error::config("priority must be between 1 and 255"));
        }
        if self.interface.is_empty() {
            return Err(Error::config("interface name is required"));
        }
        if self.virtual_ips.is_empty() {
            return Err(Error::config("at least one virtual IP is required"));
        }
        if let Some(ip) = self.virtual_ips.iter().find(|ip| !self.family.matches(**ip)) {
            return Err(Error::config(format!(
                "virtual IP {ip} does not match the configured {} family",
                self.family
            )));
        }
        Ok(())
    }

    /// Effective election priority: owners always advertise 255.
    pub fn effective_priority(&self) -> u8 {
        if self.owner {
            255
        } else {
            self.priority
        }
    }

    /// Advertisement interval in centiseconds, clamped to the representable
    /// range (minimum 10 ms, maximum 4095 centiseconds).
    pub fn advert_interval_centis(&self) -> u16 {
        let centis = self.advert_interval.as_millis() / 10;
        centis.clamp(1, u128::from(MAX_ADVERT_INTERVAL)) as u16
    }
}

/// VRRP statistics, shared between the reader task, the state machine and
/// any number of control handles.
#[derive(Debug, Default)]
pub struct VRRPStats {
    master_transitions: AtomicU64,
    backup_transitions: AtomicU64,
    adverts_sent: AtomicU64,
    adverts_received: AtomicU64,
    invalid_adverts: AtomicU64,
    priority_zero_received: AtomicU64,
    checksum_errors: AtomicU64,
}

/// A point-in-time copy of [`VRRPStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VRRPStatsSnapshot {
    pub master_transitions: u64,
    pub backup_transitions: u64,
    pub adverts_sent: u64,
    pub adverts_received: u64,
    pub invalid_adverts: u64,
    pub priority_zero_received: u64,
    pub checksum_errors: u64,
}

impl VRRPStats {
    pub fn master_transitions(&self) -> u64 {
        self.master_transitions.load(Ordering::Relaxed)
    }

    pub fn backup_transitions(&self) -> u64 {
        self.backup_transitions.load(Ordering::Relaxed)
    }

    pub fn adverts_sent(&self) -> u64 {
        self.adverts_sent.load(Ordering::Relaxed)
    }

    pub fn adverts_received(&self) -> u64 {
        self.adverts_received.load(Ordering::Relaxed)
    }

    pub fn invalid_adverts(&self) -> u64 {
        self.invalid_adverts.load(Ordering::Relaxed)
    }

    pub fn priority_zero_received(&self) -> u64 {
        self.priority_zero_received.load(Ordering::Relaxed)
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> VRRPStatsSnapshot {
        VRRPStatsSnapshot {
            master_transitions: self.master_transitions(),
            backup_transitions: self.backup_transitions(),
            adverts_sent: self.adverts_sent(),
            adverts_received: self.adverts_received(),
            invalid_adverts: self.invalid_adverts(),
            priority_zero_received: self.priority_zero_received(),
            checksum_errors: self.checksum_errors(),
        }
    }

    pub(crate) fn incr_master_transitions(&self) {
        self.master_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_backup_transitions(&self) {
        self.backup_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_adverts_sent(&self) {
        self.adverts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_adverts_received(&self) {
        self.adverts_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_invalid_adverts(&self) {
        self.invalid_adverts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_priority_zero(&self) {
        self.priority_zero_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_checksum_errors(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }
}
