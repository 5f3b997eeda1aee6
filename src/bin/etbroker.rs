use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use etbroker::remote::discovery::locate;
use etbroker::{DiscoveryConfig, DiscoveryMethod, EtSystem, RemoteSystem, SystemConfig};

#[derive(Parser)]
#[command(name = "etbroker", version, about = "Event transfer broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a system and serve it until the duration elapses (forever by default).
    Start(StartArgs),
    /// Find a running system and print its statistics.
    Monitor(MonitorArgs),
}

#[derive(Args)]
struct StartArgs {
    /// JSON system configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(short = 'n', long)]
    events: Option<usize>,
    #[arg(short = 's', long)]
    event_size: Option<usize>,
    /// Comma-separated event counts per group.
    #[arg(long, value_delimiter = ',')]
    groups: Option<Vec<usize>>,
    /// Back the event pool with this file.
    #[arg(long)]
    segment: Option<PathBuf>,
    /// Gateway TCP address.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Discovery UDP port.
    #[arg(long)]
    udp_port: Option<u16>,
    /// Seconds between statistics lines.
    #[arg(long, default_value_t = 10)]
    stats_every: u64,
    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Args)]
struct MonitorArgs {
    /// System name to look for.
    #[arg(long, default_value = "et")]
    name: String,
    /// Gateway address; skips discovery.
    #[arg(long)]
    addr: Option<SocketAddr>,
    /// Ask this host directly instead of multicasting.
    #[arg(long)]
    host: Option<IpAddr>,
    #[arg(long)]
    broadcast: bool,
    #[arg(long, default_value_t = etbroker::config::DEFAULT_PORT)]
    udp_port: u16,
    /// Seconds between refreshes; prints once when absent.
    #[arg(long)]
    interval: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Commands::Start(args) => start(args),
        Commands::Monitor(args) => monitor(args),
    }
}

fn start(args: StartArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(events) = args.events {
        config.events = events;
    }
    if let Some(size) = args.event_size {
        config.event_size = size;
    }
    if let Some(groups) = args.groups {
        config.groups = groups;
    }
    if args.segment.is_some() {
        config.segment_path = args.segment;
    }
    let mut gateway = config.gateway.take().unwrap_or_default();
    if let Some(listen) = args.listen {
        gateway.tcp_addr = listen;
    }
    if args.udp_port.is_some() {
        gateway.udp_port = args.udp_port;
    }
    config.gateway = Some(gateway);

    let system = EtSystem::create(config).context("failed to create system")?;
    if let Some(addr) = system.gateway_addr() {
        info!("serving {} on {addr}", system.config().name);
    }

    let started = Instant::now();
    let every = Duration::from_secs(args.stats_every.max(1));
    loop {
        thread::sleep(every);
        let stats = system.system_stats()?;
        info!(
            "heartbeat {} | processes {} | attachments {} | stations {} | temps {}/{}",
            stats.heartbeat, stats.processes, stats.attachments, stats.stations, stats.temps, stats.max_temps
        );
        for station in system.stations()? {
            info!(
                "  {:<24} {:?} att={} in={} out={}",
                station.name, station.status, station.attachments, station.input.count, station.output.count
            );
        }
        if let Some(limit) = args.duration {
            if started.elapsed() >= Duration::from_secs(limit) {
                break;
            }
        }
    }
    system.close()?;
    Ok(())
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let addr = match args.addr {
        Some(addr) => addr,
        None => {
            let method = match (args.host, args.broadcast) {
                (Some(host), _) => DiscoveryMethod::Direct(host),
                (None, true) => DiscoveryMethod::Broadcast,
                (None, false) => DiscoveryMethod::Multicast(etbroker::config::DEFAULT_MULTICAST),
            };
            let discovery = DiscoveryConfig {
                port: args.udp_port,
                method,
                ..DiscoveryConfig::default()
            };
            let located = locate(&args.name, &discovery)
                .with_context(|| format!("no system named {} answered", args.name))?;
            info!("found {} on {}", args.name, located.host);
            located.addr
        }
    };
    if addr.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        bail!("cannot connect to an unspecified address");
    }
    let remote = RemoteSystem::connect(addr, "etbroker-monitor").context("failed to connect")?;
    loop {
        let stats = remote.system_stats()?;
        println!(
            "{} @ {addr}: heartbeat {} processes {} attachments {} stations {} events {}x{}B temps {}/{}",
            remote.info().system,
            stats.heartbeat,
            stats.processes,
            stats.attachments,
            stats.stations,
            stats.events,
            stats.event_size,
            stats.temps,
            stats.max_temps
        );
        for station in remote.stations()? {
            println!(
                "  {:>3} {:<24} {:?} att={} in={} out={}",
                station.id.index(),
                station.name,
                station.status,
                station.attachments,
                station.input,
                station.output
            );
        }
        match args.interval {
            Some(secs) => thread::sleep(Duration::from_secs(secs.max(1))),
            None => break,
        }
    }
    remote.close()?;
    Ok(())
}
