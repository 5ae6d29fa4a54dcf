use std::env;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use getopts::Options;
use log::{info, warn};
use simple_logger::SimpleLogger;

use vnetsim::config::{Bandwidth, Config};
use vnetsim::vci::address::WorkerId;
use vnetsim::vci::oracle::StaticModel;
use vnetsim::vci::registry::Registry;
use vnetsim::vci::time::SimTime;
use vnetsim::vci::Vci;
use vnetsim::vnet::SocketKind;

const TICK: Duration = Duration::from_millis(10);
const PORT: u16 = 5001;

struct Args {
    kibps: u64,
    latency: Duration,
    reliability: f64,
    size: usize,
    seed: u64,
    duration: Duration,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T, name: &str) -> Result<T, String> {
    match value {
        Some(v) => v.parse().map_err(|_| format!("invalid {}: {}", name, v)),
        None => Ok(default),
    }
}

fn other(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.to_owned())
}

/// Streams `args.size` bytes between two hosts and returns how many
/// arrived and when the last one did.
fn bulk_transfer(args: &Args) -> io::Result<(usize, SimTime)> {
    let config = Config {
        seed: args.seed,
        ..Config::default()
    };
    let model = StaticModel::new(Duration::from_secs(1)).link(1, 2, args.latency, args.reliability);
    let mut vci = Vci::new(config, WorkerId::new(1, 0), Arc::new(model), Registry::new());

    let bandwidth = Bandwidth::symmetric(args.kibps);
    let client = vci
        .add_host("client", 1, bandwidth)
        .ok_or_else(|| other("address space exhausted"))?;
    let server = vci
        .add_host("server", 2, bandwidth)
        .ok_or_else(|| other("address space exhausted"))?;
    let remote = SocketAddrV4::new(server.to_ipv4(), PORT);

    let listener = vci
        .with_host(server, |stack, ctx| -> io::Result<_> {
            let fd = stack.socket(SocketKind::Stream, ctx);
            stack.bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT))?;
            stack.listen(fd, 1)?;
            Ok(fd)
        })
        .ok_or_else(|| other("server host missing"))??;
    let sender = vci
        .with_host(client, |stack, ctx| -> io::Result<_> {
            let fd = stack.socket(SocketKind::Stream, ctx);
            stack.connect(fd, remote, ctx)?;
            Ok(fd)
        })
        .ok_or_else(|| other("client host missing"))??;

    let data: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();
    let mut child = None;
    let mut sent = 0;
    let mut received = 0;
    let mut finished = SimTime::ZERO;
    let mut buf = vec![0u8; 64 * 1024];
    let mut clock = SimTime::ZERO;
    let end = SimTime::ZERO + args.duration;

    while clock < end && received < data.len() {
        if sent < data.len() {
            let rest = &data[sent..];
            let written = vci
                .with_host(client, |stack, ctx| stack.send(sender, rest, ctx))
                .ok_or_else(|| other("client host missing"))?;
            match written {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        clock += TICK;
        vci.run_until(clock);

        let progress = vci
            .with_host(server, |stack, ctx| -> io::Result<usize> {
                if child.is_none() {
                    match stack.accept(listener, ctx) {
                        Ok((fd, peer)) => {
                            info!("accepted {} at {}", peer, ctx.now());
                            child = Some(fd);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                        Err(e) => return Err(e),
                    }
                }
                let Some(fd) = child else {
                    return Ok(0);
                };
                let mut total = 0;
                loop {
                    match stack.recv(fd, &mut buf, ctx) {
                        Ok(0) => return Ok(total),
                        Ok(n) => {
                            if buf[..n] != data[received + total..received + total + n] {
                                return Err(io::Error::new(io::ErrorKind::InvalidData, "stream corrupted"));
                            }
                            total += n;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                        Err(e) => return Err(e),
                    }
                }
            })
            .ok_or_else(|| other("server host missing"))??;

        if progress > 0 {
            received += progress;
            finished = vci.now();
        }
    }

    if let Some(info) = vci.host(client).and_then(|host| host.stack().tcp_info(sender)) {
        info!(
            "sender: {} una={} nxt={} cwnd={} ssthresh={:?}",
            info.state, info.snd_una, info.snd_nxt, info.cwnd, info.ssthresh
        );
    }
    Ok((received, finished))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();

    opts.optopt("b", "bandwidth", "host bandwidth in KiB/s, 0 for unlimited", "KIBPS");
    opts.optopt("l", "latency", "one-way latency in milliseconds", "MS");
    opts.optopt("r", "reliability", "packet delivery probability", "P");
    opts.optopt("n", "size", "bytes to transfer", "BYTES");
    opts.optopt("", "seed", "seed for packet loss", "SEED");
    opts.optopt("d", "duration", "simulated seconds to run at most", "SECS");
    opts.optflag("v", "verbose", "debug logging");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(_) => return println!("{}", opts.short_usage(&args[0])),
    };

    let parsed = (|| -> Result<Args, String> {
        Ok(Args {
            kibps: parse_or(matches.opt_str("b"), 1024, "bandwidth")?,
            latency: Duration::from_millis(parse_or(matches.opt_str("l"), 20, "latency")?),
            reliability: parse_or(matches.opt_str("r"), 1.0, "reliability")?,
            size: parse_or(matches.opt_str("n"), 1 << 20, "size")?,
            seed: parse_or(matches.opt_str("seed"), 1, "seed")?,
            duration: Duration::from_secs(parse_or(matches.opt_str("d"), 60, "duration")?),
        })
    })();
    let args = match parsed {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return println!("{}", opts.usage(&opts.short_usage(&args[0])));
        }
    };

    let level = if matches.opt_present("v") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    SimpleLogger::new()
        .with_utc_timestamps()
        .with_level(level)
        .env()
        .init()
        .unwrap();

    info!(
        "transferring {} bytes at {} KiB/s, latency {:?}, reliability {}",
        args.size, args.kibps, args.latency, args.reliability
    );

    match bulk_transfer(&args) {
        Ok((received, finished)) if received == args.size => {
            let secs = finished.since(SimTime::ZERO).as_secs_f64();
            let rate = if secs > 0.0 { received as f64 / secs / 1024.0 } else { 0.0 };
            info!("received {} bytes by {} ({:.1} KiB/s)", received, finished, rate);
        }
        Ok((received, _)) => warn!("only {} of {} bytes arrived", received, args.size),
        Err(e) => {
            log::error!("transfer failed: {}", e);
            std::process::exit(1);
        }
    }

    print!("{}", vnetsim::prometheus::gather_text());
}
