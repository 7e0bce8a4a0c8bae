// UDP feed example
//
// Sends retrieve records to a network-mode device, e.g. the simulator started
// with `retrieve_mode = "Network"`, and optionally listens for the batches
// relayed back.

use biosignal_relay::{codec, RetrieveFrame};
use chrono::Utc;
use clap::Parser;
use std::f64::consts::TAU;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "udp_feed")]
#[command(version = "1.0")]
#[command(about = "Feed synthetic retrieve records over UDP")]
struct Args {
    /// Port the device listens on
    #[arg(short, long, default_value_t = 8053, help = "Retrieve port of the device")]
    port: u16,

    /// Records per second
    #[arg(short, long, default_value_t = 40, help = "Datagrams sent per second")]
    rate: u32,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 10, help = "How long to feed records")]
    duration: u64,

    /// Port to receive relayed batches on
    #[arg(short, long, help = "Also print batches relayed to this port")]
    listen: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
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

    println!("UDP Retrieve Feed");
    println!("=================");
    println!("Target: 127.0.0.1:{}", args.port);
    println!("Rate: {} records/s for {}s\n", args.rate, args.duration);

    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let listener = args
        .listen
        .map(|port| {
            let listener = UdpSocket::bind(("127.0.0.1", port))?;
            listener.set_nonblocking(true)?;
            Ok::<_, std::io::Error>(listener)
        })
        .transpose()?;

    let interval = Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1)));
    let start = Instant::now();
    let mut sent = 0u64;
    let mut buf = vec![0u8; 65_536];

    while start.elapsed() < Duration::from_secs(args.duration) {
        let t = start.elapsed().as_secs_f64();
        let mut frame = RetrieveFrame::new(Utc::now().timestamp_millis());
        frame.push("EKG", 70.0 + 15.0 * (TAU * 1.2 * t).sin(), 0);
        frame.push("GSR", 5.0 + 2.0 * (TAU * 0.05 * t).sin(), 1);

        let record = codec::encode(&frame);
        socket.send_to(record.as_bytes(), ("127.0.0.1", args.port))?;
        log::debug!("sent {}", record);
        sent += 1;

        if let Some(listener) = &listener {
            while let Ok(len) = listener.recv(&mut buf) {
                println!("{}", String::from_utf8_lossy(&buf[..len]));
            }
        }
        std::thread::sleep(interval);
    }

    println!("\n✓ Sent {sent} records");
    Ok(())
}
