//! Two-node failover demo.
//!
//! Run one instance per machine (or network namespace) on a shared
//! segment; the higher priority wins the election and the other takes
//! over when it dies or resigns.
//!
//! Usage:
//!   failover <interface> <vrid> <priority> <virtual-ip>
//!
//! Requires CAP_NET_RAW:
//!   sudo setcap cap_net_raw+ep target/release/examples/failover

use std::env;
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use tokio::signal;
use tracing::info;

use vrrp::{IpFamily, Transition, VRRPConfig, VirtualRouter};

#[tokio::main]
async fn main() -> ExitCode {
    common::logging::init_with("vrrp=info,failover=info");

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: {} <interface> <vrid> <priority> <virtual-ip>", args[0]);
        return ExitCode::FAILURE;
    }

    let interface = args[1].clone();
    let Ok(vrid) = args[2].parse::<u8>() else {
        eprintln!("invalid VRID {:?}", args[2]);
        return ExitCode::FAILURE;
    };
    let Ok(priority) = args[3].parse::<u8>() else {
        eprintln!("invalid priority {:?}", args[3]);
        return ExitCode::FAILURE;
    };
    let Ok(vip) = args[4].parse::<IpAddr>() else {
        eprintln!("invalid virtual IP {:?}", args[4]);
        return ExitCode::FAILURE;
    };

    let config = VRRPConfig {
        vrid,
        interface,
        family: if vip.is_ipv4() { IpFamily::V4 } else { IpFamily::V6 },
        priority,
        owner: priority == 255,
        preempt: true,
        advert_interval: Duration::from_secs(1),
        virtual_ips: vec![vip],
    };

    let mut router = match VirtualRouter::new(config) {
        Ok(router) => router,
        Err(err) => {
            eprintln!("failed to create virtual router: {err}");
            eprintln!("(raw VRRP sockets need CAP_NET_RAW)");
            return ExitCode::FAILURE;
        }
    };

    // this is where a deployment installs and removes the virtual IP on
    // the interface, e.g. via `ip addr add`/`ip addr del`
    router.on_transition(Transition::BackupToMaster, move |router| {
        info!(vips = ?router.vips(), "took over as master");
    });
    router.on_transition(Transition::InitToMaster, move |router| {
        info!(vips = ?router.vips(), "took over as master");
    });
    router.on_transition(Transition::MasterToBackup, move |router| {
        info!(vips = ?router.vips(), "yielded mastership");
    });

    let handle = router.handle();
    let machine = tokio::spawn(router.run());

    if let Err(err) = handle.start().await {
        eprintln!("failed to start: {err}");
        return ExitCode::FAILURE;
    }
    info!("running, press Ctrl+C for graceful shutdown");

    if signal::ctrl_c().await.is_err() {
        eprintln!("failed to wait for Ctrl+C");
        return ExitCode::FAILURE;
    }
    info!("shutting down");

    if let Err(err) = handle.stop().await {
        eprintln!("failed to stop: {err}");
    }
    let _ = machine.await;

    let stats = handle.stats().snapshot();
    info!(
        adverts_sent = stats.adverts_sent,
        adverts_received = stats.adverts_received,
        master_transitions = stats.master_transitions,
        "final statistics"
    );
    ExitCode::SUCCESS
}
