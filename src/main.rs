use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use gpsntpd::clock::{ClockState, MonotonicTicks, SharedClock, TickCounter};
use gpsntpd::config::SystemConfig;
use gpsntpd::controller::DisciplineController;
use gpsntpd::gps;
use gpsntpd::net::{self, UdpTransport};
use gpsntpd::ntp_client::NtpClient;
use gpsntpd::ntp_server::NtpServer;
use gpsntpd::pps::{PpsCapture, PpsMailbox};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port to serve NTP on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not poll upstream NTP servers
    #[arg(long)]
    no_client: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!("gpsntpd v{} starting", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let counter = Arc::new(MonotonicTicks::new());
    if config.clock.nominal_tick_hz != counter.nominal_hz() {
        warn!(
            "clock.nominal_tick_hz {} ignored: the hosted counter runs at {} Hz",
            config.clock.nominal_tick_hz,
            counter.nominal_hz()
        );
        config.clock.nominal_tick_hz = counter.nominal_hz();
    }

    let clock = Arc::new(SharedClock::new(ClockState::unsynchronized(
        counter.ticks(),
        counter.nominal_hz(),
    )));
    let mailbox = Arc::new(PpsMailbox::new());
    let window_ticks = config.clock.correlation_window_ms * counter.nominal_hz() as u64 / 1000;
    let capture = Arc::new(PpsCapture::new(mailbox.clone(), window_ticks));

    // Startup failures below are fatal; everything after is retried in-loop.
    let socket = net::create_server_socket(config.server.bind, config.server.port)?;
    net::log_interfaces(config.server.port);

    let mut handles = Vec::new();

    match &config.pps.device {
        #[cfg(target_os = "linux")]
        Some(path) => {
            let device = gpsntpd::pps::linux::KernelPps::open(path)?;
            let (counter, capture, running) = (counter.clone(), capture.clone(), running.clone());
            handles.push(thread::spawn(move || {
                gpsntpd::pps::linux::run(device, counter, capture, running)
            }));
        }
        #[cfg(not(target_os = "linux"))]
        Some(path) => warn!("PPS device {} unsupported on this platform", path.display()),
        None => warn!("No PPS device configured; GPS discipline unavailable"),
    }

    if let Some(path) = &config.gps.feed {
        let feed = File::open(path)
            .with_context(|| format!("Failed to open GPS feed {}", path.display()))?;
        info!("[GPS] Reading events from {}", path.display());
        let (counter, capture, running) = (counter.clone(), capture.clone(), running.clone());
        // Not joined: a quiet feed keeps the read blocked.
        thread::spawn(move || gps::run(BufReader::new(feed), counter, capture, running));
    }

    let (corrections_tx, corrections_rx) = mpsc::channel();
    if args.no_client {
        info!("[NTP-Client] Disabled (--no-client)");
        drop(corrections_tx);
    } else {
        let transport = UdpTransport::new(config.pool.query_timeout())?;
        let client = NtpClient::new(transport, clock.clone(), counter.clone(), config.pool.clone());
        let running = running.clone();
        handles.push(thread::spawn(move || client.run(corrections_tx, running)));
    }

    let controller = DisciplineController::new(clock.clone(), counter.clone(), config.clock.clone());
    {
        let running = running.clone();
        handles.push(thread::spawn(move || controller.run(mailbox, corrections_rx, running)));
    }

    let server = NtpServer::new(socket, clock, counter);
    {
        let running = running.clone();
        handles.push(thread::spawn(move || {
            if let Err(e) = server.run(running) {
                error!("[NTP-Server] {}", e);
            }
        }));
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("A worker thread panicked");
        }
    }

    info!("Exiting.");
    Ok(())
}
