use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tunedsock::error::{ErrorKind, SocketResult, TransientExt};
use tunedsock::socket::datagram::DatagramSocket;
use tunedsock::socket::stats::TrafficStats;
use tunedsock::socket::stream::StreamSocket;
use tunedsock::tuning::accelerator_env::init_accelerator_environment;
use tunedsock::tuning::TuningProfile;

const LOOPBACK: &str = "127.0.0.1";
const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Default,
    LowLatency,
    HighThroughput,
    Conservative,
}

#[derive(Parser)]
struct Args {
    #[clap(value_enum)]
    protocol: Protocol,

    #[clap(long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    #[clap(long, default_value_t = 1024)]
    message_size: usize,

    #[clap(long, default_value_t = 100_000)]
    message_count: usize,

    /// export the accelerated transport's settings before any socket is created
    #[clap(long, default_value_t = false)]
    init_accelerator: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.message_size == 0 || args.message_count == 0 {
        bail!("message size and count must be positive");
    }

    let profile = match args.preset {
        Preset::Default => TuningProfile::default(),
        Preset::LowLatency => TuningProfile::low_latency(),
        Preset::HighThroughput => TuningProfile::high_throughput(),
        Preset::Conservative => TuningProfile::conservative(),
    };
    profile.validate()?;

    if args.init_accelerator {
        init_accelerator_environment(&profile);
    }

    let started = Instant::now();
    let (sender_stats, receiver_stats) = match args.protocol {
        Protocol::Tcp => run_tcp(&profile, args.message_size, args.message_count)?,
        Protocol::Udp => run_udp(&profile, args.message_size, args.message_count)?,
    };
    let elapsed = started.elapsed().as_secs_f64();

    info!("{:?} with {:?} preset: {} messages of {} bytes in {:.3}s", args.protocol, args.preset, args.message_count, args.message_size, elapsed);
    info!("  {:.0} messages/s, {:.1} MB/s", receiver_stats.rx_packets as f64 / elapsed, receiver_stats.rx_bytes as f64 / elapsed / 1_000_000.0);
    info!("  sender:   {:?}", sender_stats);
    info!("  receiver: {:?}", receiver_stats);
    Ok(())
}

/// Sends the whole buffer, continuing after short writes and retrying while the socket would block
fn send_fully(mut send: impl FnMut(&[u8]) -> SocketResult<usize>, data: &[u8]) -> SocketResult<()> {
    let mut offset = 0;
    while offset < data.len() {
        match send(&data[offset..]).transient_as_none()? {
            Some(n) => offset += n,
            None => thread::yield_now(),
        }
    }
    Ok(())
}

fn run_tcp(profile: &TuningProfile, message_size: usize, message_count: usize) -> anyhow::Result<(TrafficStats, TrafficStats)> {
    let mut listener = StreamSocket::new(profile.clone())?;
    listener.bind(LOOPBACK, 0)?;
    listener.listen(1)?;
    let port = listener.local_addr()
        .ok_or_else(|| anyhow!("listener has no local address"))?
        .port();

    let sender_profile = profile.clone();
    let sender = thread::spawn(move || -> anyhow::Result<TrafficStats> {
        let mut client = StreamSocket::new(sender_profile)?;
        client.connect(LOOPBACK, port, TIMEOUT)?;
        let message = vec![0x5A_u8; message_size];
        for _ in 0..message_count {
            send_fully(|buf| client.send(buf), &message)?;
        }
        let stats = client.stats();
        client.close()?;
        Ok(stats)
    });

    let mut peer = listener.accept(TIMEOUT)?;
    info!("receiving from {}", peer.peer_addr());
    let mut buf = vec![0u8; message_size];
    loop {
        match peer.recv(&mut buf, TIMEOUT) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Closed => break,
            Err(e) => return Err(e.into()),
        }
    }

    let sender_stats = sender.join()
        .map_err(|_| anyhow!("sender thread panicked"))??;
    Ok((sender_stats, peer.stats()))
}

fn run_udp(profile: &TuningProfile, message_size: usize, message_count: usize) -> anyhow::Result<(TrafficStats, TrafficStats)> {
    let mut receiver = DatagramSocket::new(profile.clone())?;
    receiver.bind(LOOPBACK, 0)?;
    let port = receiver.local_addr()
        .ok_or_else(|| anyhow!("receiver has no local address"))?
        .port();

    let sender_profile = profile.clone();
    let sender = thread::spawn(move || -> anyhow::Result<TrafficStats> {
        let mut socket = DatagramSocket::new(sender_profile)?;
        socket.connect(LOOPBACK, port)?;
        let message = vec![0x5A_u8; message_size];
        for _ in 0..message_count {
            send_fully(|buf| socket.send(buf), &message)?;
        }
        Ok(socket.stats())
    });

    let mut buf = vec![0u8; message_size.max(1)];
    let mut first_timestamp = None;
    let mut last_timestamp = 0;
    for _ in 0..message_count {
        match receiver.recv_from(&mut buf, Some(Duration::from_millis(500))) {
            Ok(datagram) => {
                first_timestamp.get_or_insert(datagram.timestamp_ns);
                last_timestamp = datagram.timestamp_ns;
            }
            Err(e) if e.kind() == ErrorKind::Timeout => {
                warn!("no more datagrams arriving - assuming the rest was dropped");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(first) = first_timestamp {
        info!("receive window by capture timestamps: {} µs", last_timestamp.saturating_sub(first) / 1000);
    }

    let sender_stats = sender.join()
        .map_err(|_| anyhow!("sender thread panicked"))??;
    let receiver_stats = receiver.stats();
    if receiver_stats.rx_packets < sender_stats.tx_packets {
        warn!("{} of {} datagrams were lost", sender_stats.tx_packets - receiver_stats.rx_packets, sender_stats.tx_packets);
    }
    Ok((sender_stats, receiver_stats))
}
