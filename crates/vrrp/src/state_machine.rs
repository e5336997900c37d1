//! RFC 5798 virtual router state machine.
//!
//! One async task owns every piece of mutable router state and multiplexes
//! four sources: the control event channel, the bounded queue fed by the
//! reader task, the advertisement ticker (Master) and the master-down
//! timer (Backup). Exactly one source is consumed per iteration.
//!
//! RFC 5798 6.3. State Transition Diagram
//!
//! ```text
//!                    +---------------+
//!         +--------->|               |<-------------+
//!         |          |  Initialize   |              |
//!         |   +------|               |----------+   |
//!         |   |      +---------------+          |   |
//!         |   |                                 |   |
//!         |   V                                 V   |
//! +---------------+                       +---------------+
//! |               |---------------------->|               |
//! |    Master     |                       |    Backup     |
//! |               |<----------------------|               |
//! +---------------+                       +---------------+
//! ```

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use common::{Error, Result};

use crate::announce::{Announcer, ArpAnnouncer, NdpAnnouncer, VipSnapshot};
use crate::packet::VRRPPacket;
use crate::socket::{
    find_interface, preferred_source_ip, AdvertSink, DropReason, Interface, ReceivedPacket,
    RecvError, VRRPSocket,
};
use crate::types::{
    centis_to_duration, master_down_interval, skew_time, Event, IpFamily, Transition, VRRPConfig,
    VRRPState, VRRPStats, EVENT_CHANNEL_SIZE, PACKET_QUEUE_SIZE,
};

/// Callback invoked on the state-machine task when its transition fires.
/// Long-running handlers delay subsequent events; dispatching elsewhere is
/// the caller's responsibility.
pub type TransitionHandler = Box<dyn FnMut(&VirtualRouter) + Send>;

enum Flow {
    Continue,
    Exit,
}

enum Wake {
    Event(Option<Event>),
    Packet(ReceivedPacket),
    Timer,
}

/// One VRRPv3 virtual router instance.
pub struct VirtualRouter {
    vrid: u8,
    family: IpFamily,
    priority: u8,
    owner: bool,
    preempt: bool,
    /// Our own advertisement cadence, in centiseconds.
    advert_interval: u16,
    /// Cadence last observed from the current master, in centiseconds.
    master_adv_interval: u16,
    iface: Interface,
    source_ip: IpAddr,
    vips: BTreeSet<IpAddr>,
    state: Arc<AtomicU8>,
    stats: Arc<VRRPStats>,
    sink: Arc<dyn AdvertSink>,
    announcer: Box<dyn Announcer>,
    reader_socket: Option<Arc<VRRPSocket>>,
    reader: Option<JoinHandle<()>>,
    handlers: HashMap<Transition, TransitionHandler>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    packet_tx: mpsc::Sender<ReceivedPacket>,
    packet_rx: mpsc::Receiver<ReceivedPacket>,
}

impl VirtualRouter {
    /// Resolve the interface, discover a source address, open the
    /// multicast socket and the announcer, and return a router in the
    /// Initialize state. Every failure here is fatal; nothing has started.
    pub fn new(config: VRRPConfig) -> Result<Self> {
        config.validate()?;

        let netif = find_interface(&config.interface)?;
        let mac = netif
            .mac
            .ok_or_else(|| Error::interface(format!("interface {} has no MAC address", netif.name)))?;
        let iface = Interface {
            name: netif.name.clone(),
            index: netif.index,
            mac,
        };
        let source_ip = preferred_source_ip(&netif, config.family)?;

        let socket = Arc::new(VRRPSocket::open(&iface, config.family, source_ip)?);
        let announcer: Box<dyn Announcer> = match config.family {
            IpFamily::V4 => Box::new(ArpAnnouncer::new(&netif)?),
            IpFamily::V6 => {
                let IpAddr::V6(link_local) = source_ip else {
                    return Err(Error::interface(
                        "IPv6 virtual router requires a link-local source address",
                    ));
                };
                Box::new(NdpAnnouncer::new(link_local, iface.index)?)
            }
        };

        info!(
            vrid = config.vrid,
            interface = %iface.name,
            source = %source_ip,
            "virtual router initialized"
        );
        let sink: Arc<dyn AdvertSink> = socket.clone();
        Ok(Self::assemble(config, iface, source_ip, sink, announcer, Some(socket)))
    }

    fn assemble(
        config: VRRPConfig,
        iface: Interface,
        source_ip: IpAddr,
        sink: Arc<dyn AdvertSink>,
        announcer: Box<dyn Announcer>,
        reader_socket: Option<Arc<VRRPSocket>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        let priority = config.effective_priority();
        let advert_interval = config.advert_interval_centis();
        Self {
            vrid: config.vrid,
            family: config.family,
            priority,
            owner: config.owner || priority == 255,
            preempt: config.preempt,
            advert_interval,
            master_adv_interval: advert_interval,
            iface,
            source_ip,
            vips: config.virtual_ips.into_iter().collect(),
            state: Arc::new(AtomicU8::new(VRRPState::Init as u8)),
            stats: Arc::new(VRRPStats::default()),
            sink,
            announcer,
            reader_socket,
            reader: None,
            handlers: HashMap::new(),
            event_tx,
            event_rx,
            packet_tx,
            packet_rx,
        }
    }

    /// A cloneable control handle for this router.
    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            events: self.event_tx.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Register `handler` for `transition`, replacing any prior handler.
    /// Returns whether a handler was replaced.
    pub fn on_transition(
        &mut self,
        transition: Transition,
        handler: impl FnMut(&VirtualRouter) + Send + 'static,
    ) -> bool {
        self.handlers
            .insert(transition, Box::new(handler))
            .is_some()
    }

    pub fn vrid(&self) -> u8 {
        self.vrid
    }

    pub fn state(&self) -> VRRPState {
        VRRPState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn preempt(&self) -> bool {
        self.preempt
    }

    pub fn interface_name(&self) -> &str {
        &self.iface.name
    }

    pub fn preferred_source_ip(&self) -> IpAddr {
        self.source_ip
    }

    pub fn advert_interval(&self) -> Duration {
        centis_to_duration(self.advert_interval)
    }

    pub fn vips(&self) -> Vec<IpAddr> {
        self.vips.iter().copied().collect()
    }

    pub fn stats(&self) -> Arc<VRRPStats> {
        self.stats.clone()
    }

    /// RFC 5798 7.3: 00-00-5E-00-01-{VRID} for IPv4, 00-00-5E-00-02-{VRID}
    /// for IPv6. Computed for the caller's benefit; this core never
    /// installs it on the interface.
    pub fn virtual_mac(&self) -> MacAddr {
        match self.family {
            IpFamily::V4 => MacAddr::new(0x00, 0x00, 0x5e, 0x00, 0x01, self.vrid),
            IpFamily::V6 => MacAddr::new(0x00, 0x00, 0x5e, 0x00, 0x02, self.vrid),
        }
    }

    /// Run the state machine until a SHUTDOWN received in Initialize (or a
    /// closed control channel) terminates it. Consumes the router; sockets
    /// and announcer are released exactly once on return.
    pub async fn run(mut self) -> Result<()> {
        info!(
            vrid = self.vrid,
            priority = self.priority,
            family = %self.family,
            "state machine running"
        );
        loop {
            let flow = match self.state() {
                VRRPState::Init => self.run_initialize().await,
                VRRPState::Backup => self.run_backup().await,
                VRRPState::Master => self.run_master().await,
            };
            if matches!(flow, Flow::Exit) {
                break;
            }
        }
        self.stop_reader();
        info!(vrid = self.vrid, "state machine closed");
        Ok(())
    }

    async fn run_initialize(&mut self) -> Flow {
        match self.event_rx.recv().await {
            Some(Event::Start) => {
                // drop adverts queued during a previous tenure
                while self.packet_rx.try_recv().is_ok() {}
                self.spawn_reader();

                if self.owner || self.priority == 255 {
                    info!(vrid = self.vrid, "address owner, claiming mastership");
                    self.send_advertisement(self.priority);
                    self.announce_vips();
                    self.enter(VRRPState::Master, Transition::InitToMaster);
                } else {
                    self.master_adv_interval = self.advert_interval;
                    self.enter(VRRPState::Backup, Transition::InitToBackup);
                }
                Flow::Continue
            }
            Some(Event::Shutdown) | None => Flow::Exit,
            Some(event) => {
                self.apply_config_event(event);
                Flow::Continue
            }
        }
    }

    async fn run_backup(&mut self) -> Flow {
        let mut master_down_at =
            Instant::now() + centis_to_duration(self.master_down_interval());
        debug!(
            vrid = self.vrid,
            master_down_centis = self.master_down_interval(),
            "backup armed master-down timer"
        );

        loop {
            let wake = tokio::select! {
                event = self.event_rx.recv() => Wake::Event(event),
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => Wake::Packet(packet),
                    None => continue,
                },
                _ = time::sleep_until(master_down_at) => Wake::Timer,
            };

            match wake {
                Wake::Event(Some(Event::Shutdown)) | Wake::Event(None) => {
                    self.stop_reader();
                    self.enter(VRRPState::Init, Transition::BackupToInit);
                    return Flow::Continue;
                }
                Wake::Event(Some(Event::Start)) => {
                    debug!(vrid = self.vrid, "already started");
                }
                Wake::Event(Some(event)) => self.apply_config_event(event),
                Wake::Packet(received) => {
                    self.stats.incr_adverts_received();
                    let advert = &received.packet;
                    if advert.priority == 0 {
                        self.stats.incr_priority_zero();
                        debug!(
                            vrid = self.vrid,
                            "master resigned, master-down timer set to skew time"
                        );
                        master_down_at =
                            Instant::now() + centis_to_duration(self.skew_time());
                    } else if !self.preempt
                        || advert.priority > self.priority
                        || (advert.priority == self.priority
                            && ip_greater(received.source, self.source_ip))
                    {
                        self.master_adv_interval = advert.max_adv_interval.max(1);
                        master_down_at =
                            Instant::now() + centis_to_duration(self.master_down_interval());
                    } else {
                        debug!(
                            vrid = self.vrid,
                            peer_priority = advert.priority,
                            "discarding advertisement from lower-priority peer"
                        );
                    }
                }
                Wake::Timer => {
                    info!(vrid = self.vrid, "master down interval expired, taking over");
                    self.send_advertisement(self.priority);
                    self.announce_vips();
                    self.enter(VRRPState::Master, Transition::BackupToMaster);
                    return Flow::Continue;
                }
            }
        }
    }

    async fn run_master(&mut self) -> Flow {
        // entry advertisement was just sent; first tick one full period later
        let period = centis_to_duration(self.advert_interval);
        let mut ticker = time::interval_at(Instant::now() + period, period);

        loop {
            let wake = tokio::select! {
                event = self.event_rx.recv() => Wake::Event(event),
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => Wake::Packet(packet),
                    None => continue,
                },
                _ = ticker.tick() => Wake::Timer,
            };

            match wake {
                Wake::Event(Some(Event::Shutdown)) | Wake::Event(None) => {
                    drop(ticker);
                    // resign: one best-effort priority-0 advertisement
                    self.send_advertisement(0);
                    self.stop_reader();
                    self.enter(VRRPState::Init, Transition::MasterToInit);
                    return Flow::Continue;
                }
                Wake::Event(Some(Event::Start)) => {
                    debug!(vrid = self.vrid, "already started");
                }
                Wake::Event(Some(event)) => self.apply_config_event(event),
                Wake::Packet(received) => {
                    self.stats.incr_adverts_received();
                    let advert = &received.packet;
                    if advert.priority == 0 {
                        // a resigning master is no contender; the backups
                        // race on their skew time, we keep advertising
                        self.stats.incr_priority_zero();
                    } else if advert.priority > self.priority
                        || (advert.priority == self.priority
                            && ip_greater(received.source, self.source_ip))
                    {
                        info!(
                            vrid = self.vrid,
                            peer = %received.source,
                            peer_priority = advert.priority,
                            "yielding mastership to higher-priority peer"
                        );
                        self.master_adv_interval = advert.max_adv_interval.max(1);
                        self.enter(VRRPState::Backup, Transition::MasterToBackup);
                        return Flow::Continue;
                    } else {
                        debug!(
                            vrid = self.vrid,
                            peer_priority = advert.priority,
                            "discarding advertisement from lower-priority peer"
                        );
                    }
                }
                Wake::Timer => self.send_advertisement(self.priority),
            }
        }
    }

    /// Handle a runtime reconfiguration event, in any state.
    fn apply_config_event(&mut self, event: Event) {
        match event {
            Event::AddVip(ip) => {
                if !self.family.matches(ip) {
                    warn!(vrid = self.vrid, vip = %ip, "ignoring VIP of the wrong family");
                } else if self.vips.insert(ip) {
                    info!(vrid = self.vrid, vip = %ip, "virtual IP added");
                }
            }
            Event::RemoveVip(ip) => {
                if self.vips.remove(&ip) {
                    info!(vrid = self.vrid, vip = %ip, "virtual IP removed");
                }
            }
            Event::SetPriority(priority) => {
                if self.owner && priority != 255 {
                    warn!(
                        vrid = self.vrid,
                        "address owner must keep priority 255, ignoring"
                    );
                } else if priority == 0 {
                    warn!(
                        vrid = self.vrid,
                        "priority 0 is reserved for resignation, ignoring"
                    );
                } else {
                    info!(vrid = self.vrid, priority, "priority changed");
                    self.priority = priority;
                }
            }
            Event::Start | Event::Shutdown => {}
        }
    }

    /// Record the new state and invoke the registered transition handler,
    /// if any, synchronously on this task.
    fn enter(&mut self, next: VRRPState, transition: Transition) {
        self.state.store(next as u8, Ordering::SeqCst);
        match next {
            VRRPState::Master => self.stats.incr_master_transitions(),
            VRRPState::Backup => self.stats.incr_backup_transitions(),
            VRRPState::Init => {}
        }
        info!(vrid = self.vrid, %transition, "state transition");

        if let Some(mut handler) = self.handlers.remove(&transition) {
            handler(self);
            self.handlers.insert(transition, handler);
            debug!(vrid = self.vrid, %transition, "transition handler called");
        }
    }

    /// Assemble and send one advertisement carrying the protected VIPs.
    /// A failed send is logged; it never changes state.
    fn send_advertisement(&self, priority: u8) {
        let packet = VRRPPacket::new(
            self.vrid,
            priority,
            self.advert_interval,
            self.vips.iter().copied().collect(),
        );
        match self.sink.send_advert(&packet) {
            Ok(()) => {
                self.stats.incr_adverts_sent();
                debug!(vrid = self.vrid, priority, "sent advertisement");
            }
            Err(err) => {
                warn!(vrid = self.vrid, error = %err, "failed to send advertisement");
            }
        }
    }

    /// Hand the announcer an immutable snapshot of what we now own.
    fn announce_vips(&mut self) {
        let snapshot = VipSnapshot {
            mac: self.iface.mac,
            vips: self.vips.iter().copied().collect(),
        };
        if let Err(err) = self.announcer.announce_all(&snapshot) {
            warn!(vrid = self.vrid, error = %err, "address announcement failed");
        }
    }

    fn skew_time(&self) -> u16 {
        skew_time(self.master_adv_interval, self.priority)
    }

    fn master_down_interval(&self) -> u16 {
        master_down_interval(self.master_adv_interval, self.priority)
    }

    /// Spawn the reader task: it filters foreign VRIDs and feeds the
    /// bounded queue, blocking (and thereby backpressuring the OS socket
    /// buffer) when the queue is full.
    fn spawn_reader(&mut self) {
        let Some(socket) = self.reader_socket.clone() else {
            return;
        };
        let queue = self.packet_tx.clone();
        let stats = self.stats.clone();
        let vrid = self.vrid;
        self.reader = Some(tokio::spawn(async move {
            debug!(vrid, "advertisement reader running");
            loop {
                match socket.recv_advert().await {
                    Ok(received) => {
                        if received.packet.vrid != vrid {
                            // other virtual routers share the multicast group
                            continue;
                        }
                        if queue.send(received).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Dropped(reason)) => {
                        if matches!(reason, DropReason::BadChecksum) {
                            stats.incr_checksum_errors();
                        }
                        stats.incr_invalid_adverts();
                        warn!(vrid, %reason, "discarded datagram");
                    }
                    Err(RecvError::Io(err)) => {
                        warn!(vrid, error = %err, "receive socket closed");
                        break;
                    }
                }
            }
            debug!(vrid, "advertisement reader stopped");
        }));
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    #[cfg(test)]
    fn packet_sender(&self) -> mpsc::Sender<ReceivedPacket> {
        self.packet_tx.clone()
    }
}

/// Cloneable control surface of a running [`VirtualRouter`]. All mutation
/// is routed through the router's event channel so the state-machine task
/// remains the single writer.
#[derive(Clone)]
pub struct RouterHandle {
    events: mpsc::Sender<Event>,
    state: Arc<AtomicU8>,
    stats: Arc<VRRPStats>,
}

impl RouterHandle {
    /// Start the router (Initialize -> Master/Backup).
    pub async fn start(&self) -> Result<()> {
        self.send(Event::Start).await
    }

    /// Stop the router and terminate its state machine. The first
    /// SHUTDOWN returns it to Initialize with the state-specific side
    /// effects (a Master resigns with one priority-0 advertisement), the
    /// second ends the loop.
    pub async fn stop(&self) -> Result<()> {
        if self.state() != VRRPState::Init {
            self.send(Event::Shutdown).await?;
        }
        let _ = self.events.send(Event::Shutdown).await;
        Ok(())
    }

    pub async fn add_vip(&self, ip: IpAddr) -> Result<()> {
        self.send(Event::AddVip(ip)).await
    }

    pub async fn remove_vip(&self, ip: IpAddr) -> Result<()> {
        self.send(Event::RemoveVip(ip)).await
    }

    /// Request a priority change; ignored by address owners (they stay at
    /// 255) and for the reserved value 0.
    pub async fn set_priority(&self, priority: u8) -> Result<()> {
        self.send(Event::SetPriority(priority)).await
    }

    pub fn state(&self) -> VRRPState {
        VRRPState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> Arc<VRRPStats> {
        self.stats.clone()
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::other("virtual router is no longer running"))
    }
}

/// Byte-lexicographic greater-than over equal-length addresses; the RFC
/// tiebreak for equal priorities. Mismatched families never compare
/// greater.
fn ip_greater(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a > b,
        (IpAddr::V6(a), IpAddr::V6(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct TestLink {
        source: IpAddr,
        peer: Mutex<Option<mpsc::Sender<ReceivedPacket>>>,
        sent: Mutex<Vec<(Instant, VRRPPacket)>>,
    }

    impl TestLink {
        fn new(source: &str) -> Arc<Self> {
            Arc::new(Self {
                source: source.parse().unwrap(),
                peer: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn connect(&self, peer: mpsc::Sender<ReceivedPacket>) {
            *self.peer.lock().unwrap() = Some(peer);
        }

        fn sent(&self) -> Vec<(Instant, VRRPPacket)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl AdvertSink for TestLink {
        fn send_advert(&self, packet: &VRRPPacket) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), packet.clone()));
            if let Some(peer) = self.peer.lock().unwrap().as_ref() {
                let _ = peer.try_send(ReceivedPacket {
                    packet: packet.clone(),
                    source: self.source,
                });
            }
            Ok(())
        }
    }

    struct CountingAnnouncer(Arc<AtomicUsize>);

    impl Announcer for CountingAnnouncer {
        fn announce_all(&mut self, _snapshot: &VipSnapshot) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RouterParams {
        priority: u8,
        owner: bool,
        preempt: bool,
        source: &'static str,
    }

    fn test_router(
        params: RouterParams,
        link: Arc<TestLink>,
        announces: Arc<AtomicUsize>,
    ) -> VirtualRouter {
        let config = VRRPConfig {
            vrid: 7,
            interface: "test0".to_string(),
            family: IpFamily::V4,
            priority: params.priority,
            owner: params.owner,
            preempt: params.preempt,
            advert_interval: Duration::from_secs(1),
            virtual_ips: vec!["10.0.0.100".parse().unwrap()],
        };
        let iface = Interface {
            name: "test0".to_string(),
            index: 1,
            mac: MacAddr::new(0x02, 0, 0, 0, 0, params.priority),
        };
        VirtualRouter::assemble(
            config,
            iface,
            params.source.parse().unwrap(),
            link,
            Box::new(CountingAnnouncer(announces)),
            None,
        )
    }

    fn backup_params(priority: u8, source: &'static str) -> RouterParams {
        RouterParams {
            priority,
            owner: false,
            preempt: true,
            source,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_backup_wins_election() {
        let link_a = TestLink::new("10.0.0.10");
        let link_b = TestLink::new("10.0.0.20");
        let announces_a = Arc::new(AtomicUsize::new(0));
        let announces_b = Arc::new(AtomicUsize::new(0));

        let a = test_router(backup_params(150, "10.0.0.10"), link_a.clone(), announces_a.clone());
        let b = test_router(backup_params(100, "10.0.0.20"), link_b.clone(), announces_b.clone());
        link_a.connect(b.packet_sender());
        link_b.connect(a.packet_sender());

        let handle_a = a.handle();
        let handle_b = b.handle();
        tokio::spawn(a.run());
        tokio::spawn(b.run());
        handle_a.start().await.unwrap();
        handle_b.start().await.unwrap();

        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handle_a.state(), VRRPState::Master);
        assert_eq!(handle_b.state(), VRRPState::Backup);
        assert_eq!(announces_a.load(Ordering::SeqCst), 1);
        assert_eq!(announces_b.load(Ordering::SeqCst), 0);
        assert!(handle_b.stats().adverts_received() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_greater_source_ip_wins() {
        let link_a = TestLink::new("10.0.0.10");
        let link_b = TestLink::new("10.0.0.20");
        let announces = Arc::new(AtomicUsize::new(0));

        let a = test_router(backup_params(100, "10.0.0.10"), link_a.clone(), announces.clone());
        let b = test_router(backup_params(100, "10.0.0.20"), link_b.clone(), announces.clone());
        link_a.connect(b.packet_sender());
        link_b.connect(a.packet_sender());

        let handle_a = a.handle();
        let handle_b = b.handle();
        tokio::spawn(a.run());
        tokio::spawn(b.run());
        handle_a.start().await.unwrap();
        handle_b.start().await.unwrap();

        time::sleep(Duration::from_secs(15)).await;

        assert_eq!(handle_a.state(), VRRPState::Backup);
        assert_eq!(handle_b.state(), VRRPState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_resignation_elects_backup_within_skew_time() {
        let link_a = TestLink::new("10.0.0.10");
        let link_b = TestLink::new("10.0.0.20");
        let announces = Arc::new(AtomicUsize::new(0));

        let a = test_router(
            RouterParams {
                priority: 255,
                owner: true,
                preempt: true,
                source: "10.0.0.10",
            },
            link_a.clone(),
            announces.clone(),
        );
        let mut b = test_router(backup_params(100, "10.0.0.20"), link_b.clone(), announces.clone());
        link_a.connect(b.packet_sender());
        link_b.connect(a.packet_sender());

        let (elected_tx, mut elected_rx) = mpsc::unbounded_channel();
        b.on_transition(Transition::BackupToMaster, move |_router| {
            let _ = elected_tx.send(Instant::now());
        });

        let handle_a = a.handle();
        let handle_b = b.handle();
        tokio::spawn(a.run());
        tokio::spawn(b.run());
        handle_a.start().await.unwrap();
        handle_b.start().await.unwrap();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle_a.state(), VRRPState::Master);
        assert_eq!(handle_b.state(), VRRPState::Backup);

        let resigned_at = Instant::now();
        handle_a.stop().await.unwrap();
        time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handle_a.state(), VRRPState::Init);
        assert_eq!(handle_b.state(), VRRPState::Master);

        // the final advertisement resigns with priority 0
        let final_advert = link_a.sent().last().unwrap().1.clone();
        assert_eq!(final_advert.priority, 0);

        // B elected itself after skew time (61 cs for priority 100 at a
        // 1 s master interval), far below the 361 cs master-down interval
        let elected_at = elected_rx.recv().await.unwrap();
        let elapsed = elected_at - resigned_at;
        assert!(
            elapsed >= Duration::from_millis(610) && elapsed < Duration::from_millis(700),
            "election took {elapsed:?}, expected about 610 ms"
        );
        assert!(handle_b.stats().priority_zero_received() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preempt_disabled_backup_never_takes_over() {
        let link_a = TestLink::new("10.0.0.10");
        let link_b = TestLink::new("10.0.0.20");
        let announces = Arc::new(AtomicUsize::new(0));

        let a = test_router(backup_params(100, "10.0.0.10"), link_a.clone(), announces.clone());
        let b = test_router(
            RouterParams {
                priority: 200,
                owner: false,
                preempt: false,
                source: "10.0.0.20",
            },
            link_b.clone(),
            announces.clone(),
        );
        link_a.connect(b.packet_sender());
        link_b.connect(a.packet_sender());

        let handle_a = a.handle();
        let handle_b = b.handle();
        tokio::spawn(a.run());
        handle_a.start().await.unwrap();

        // let A win the election before B arrives
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle_a.state(), VRRPState::Master);

        tokio::spawn(b.run());
        handle_b.start().await.unwrap();

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle_a.state(), VRRPState::Master);
        assert_eq!(
            handle_b.state(),
            VRRPState::Backup,
            "without preemption a higher-priority backup must not displace a live master"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn master_advertises_at_exact_intervals() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(
            RouterParams {
                priority: 255,
                owner: true,
                preempt: true,
                source: "10.0.0.10",
            },
            link.clone(),
            announces.clone(),
        );

        let handle = router.handle();
        tokio::spawn(router.run());
        handle.start().await.unwrap();

        time::sleep(Duration::from_millis(5500)).await;

        let sent = link.sent();
        assert!(sent.len() >= 5, "expected several advertisements, got {}", sent.len());
        for pair in sent.windows(2) {
            assert_eq!(
                pair[1].0 - pair[0].0,
                Duration::from_secs(1),
                "advertisements must be exactly one interval apart"
            );
        }
        assert_eq!(handle.stats().adverts_sent(), sent.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_the_state_machine() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(
            RouterParams {
                priority: 255,
                owner: true,
                preempt: true,
                source: "10.0.0.10",
            },
            link.clone(),
            announces.clone(),
        );

        let handle = router.handle();
        let machine = tokio::spawn(router.run());
        handle.start().await.unwrap();
        time::sleep(Duration::from_secs(2)).await;

        handle.stop().await.unwrap();
        machine.await.unwrap().unwrap();
        assert_eq!(handle.state(), VRRPState::Init);

        // a stopped router rejects further commands
        assert!(handle.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn vip_mutation_flows_through_the_event_channel() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(
            RouterParams {
                priority: 255,
                owner: true,
                preempt: true,
                source: "10.0.0.10",
            },
            link.clone(),
            announces.clone(),
        );

        let handle = router.handle();
        tokio::spawn(router.run());
        handle.start().await.unwrap();
        time::sleep(Duration::from_millis(100)).await;

        let extra: IpAddr = "10.0.0.101".parse().unwrap();
        handle.add_vip(extra).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        let latest = link.sent().last().unwrap().1.clone();
        assert!(latest.addresses.contains(&extra));
        assert_eq!(latest.addresses.len(), 2);

        handle.remove_vip(extra).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        let latest = link.sent().last().unwrap().1.clone();
        assert!(!latest.addresses.contains(&extra));
        assert_eq!(latest.addresses.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn owner_ignores_priority_downgrades() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(
            RouterParams {
                priority: 255,
                owner: true,
                preempt: true,
                source: "10.0.0.10",
            },
            link.clone(),
            announces.clone(),
        );

        let handle = router.handle();
        tokio::spawn(router.run());
        handle.start().await.unwrap();

        handle.set_priority(50).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        let latest = link.sent().last().unwrap().1.clone();
        assert_eq!(latest.priority, 255);
    }

    #[tokio::test(start_paused = true)]
    async fn solo_master_applies_priority_change() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(backup_params(100, "10.0.0.10"), link.clone(), announces.clone());

        let handle = router.handle();
        tokio::spawn(router.run());
        handle.start().await.unwrap();

        // no master on the wire: elected after the master-down interval
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.state(), VRRPState::Master);

        handle.set_priority(42).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        let latest = link.sent().last().unwrap().1.clone();
        assert_eq!(latest.priority, 42);
    }

    #[test]
    fn transition_handler_registration_reports_replacement() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let mut router = test_router(backup_params(100, "10.0.0.10"), link, announces);

        assert!(!router.on_transition(Transition::InitToBackup, |_| {}));
        assert!(router.on_transition(Transition::InitToBackup, |_| {}));
        assert!(!router.on_transition(Transition::BackupToMaster, |_| {}));
    }

    #[test]
    fn virtual_mac_embeds_family_and_vrid() {
        let link = TestLink::new("10.0.0.10");
        let announces = Arc::new(AtomicUsize::new(0));
        let router = test_router(backup_params(100, "10.0.0.10"), link, announces);
        assert_eq!(
            router.virtual_mac(),
            MacAddr::new(0x00, 0x00, 0x5e, 0x00, 0x01, 7)
        );
    }

    #[test]
    fn ip_ordering_tiebreak() {
        let low: IpAddr = "10.0.0.10".parse().unwrap();
        let high: IpAddr = "10.0.0.20".parse().unwrap();
        assert!(ip_greater(high, low));
        assert!(!ip_greater(low, high));
        assert!(!ip_greater(low, low));
        assert!(!ip_greater("fe80::1".parse().unwrap(), low));
    }
}
