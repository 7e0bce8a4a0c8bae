// Monitor example
//
// Runs the polling monitor, optionally with the device simulator attached,
// and prints every event it emits.

use biosignal_relay::{
    DeviceDiscovery, DeviceRegistry, FhirFormatter, Monitor, MonitorConfig, MonitorEvent,
    NoDiscovery, NoDriver, Reply, Request, SerialPortDiscovery, SystemProbe,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "monitor")]
#[command(version = "1.0")]
#[command(about = "Acquire biosensor data and relay observations")]
#[command(long_about = "Discover attached biosensors, poll them every tick and relay classified observations to the consumer application over a pipe or UDP.")]
struct Args {
    /// Configuration file
    #[arg(short, long, help = "TOML configuration file")]
    config: Option<PathBuf>,

    /// Attach the device simulator
    #[arg(short, long, help = "Attach the synthetic device at startup")]
    simulator: bool,

    /// Skip USB discovery
    #[arg(long, help = "Do not enumerate attached USB devices")]
    no_discovery: bool,

    /// Observation subject
    #[arg(long, help = "Subject reference written into every observation, e.g. Patient/123")]
    subject: Option<String>,

    /// Run time in seconds
    #[arg(short, long, help = "Stop after this many seconds (runs until Ctrl+C when omitted)")]
    duration: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::DeviceAdded { code, name } => println!("+ {code} ({name})"),
        MonitorEvent::DeviceInitialized { code } => println!("✓ {code} initialized"),
        MonitorEvent::DeviceRemoved { code } => println!("- {code} removed"),
        MonitorEvent::Readings { code, observations } => {
            for o in observations {
                println!(
                    "  {code} #{} {:<4} {:>8.2} {:<3} {:?}",
                    o.channel, o.signal, o.value, o.unit, o.range_state
                );
            }
        }
        MonitorEvent::BatchSent { code, records } => {
            log::debug!("{code}: sent {records} records");
        }
        MonitorEvent::Warning { code, kind, message } => {
            println!("! {} {kind}: {message}", code.as_deref().unwrap_or("monitor"));
        }
        MonitorEvent::Error { code, kind, message } => {
            println!("✗ {} {kind}: {message}", code.as_deref().unwrap_or("monitor"));
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut config = MonitorConfig::load(args.config.as_deref())?;
    config.attach_simulator |= args.simulator;

    println!("Biosignal Relay Monitor");
    println!("=======================");
    println!("Tick: {}ms", config.tick_ms);
    println!("Consumer: {}", config.consumer_application);
    println!("Simulator: {}", if config.attach_simulator { "attached" } else { "off" });
    println!("Press Ctrl+C to stop\n");

    let discovery: Box<dyn DeviceDiscovery> = if args.no_discovery {
        Box::new(NoDiscovery)
    } else {
        Box::new(SerialPortDiscovery)
    };
    let registry = DeviceRegistry::with_defaults(Arc::new(NoDriver::new("NeurobitDrv64")));
    let (monitor, events) = Monitor::new(config, registry, discovery, Box::new(SystemProbe::new()));
    let formatter = match args.subject {
        Some(subject) => FhirFormatter::new().with_subject(subject),
        None => FhirFormatter::new(),
    };
    let monitor = monitor.with_formatter(Box::new(formatter));
    let handle = monitor.spawn()?;

    let deadline = args
        .duration
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    while deadline.map_or(true, |d| Instant::now() < d) {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            print_event(&event);
        }
    }

    if let Reply::Devices(devices) = handle.request(Request::ListDevices)? {
        println!("\n{} devices at shutdown", devices.len());
        for device in devices {
            println!(
                "  {} {} retrieve={:?} send={:?} failures={}",
                device.code, device.state, device.retrieve_mode, device.send_mode, device.failures
            );
        }
    }
    handle.stop();
    Ok(())
}
