// cancapture/src/bin/cancap.rs
//
// Command line tool to capture, log, and replay CAN bus traffic.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Simple CLI tool to capture CAN bus traffic to a log file and to replay
//! it, from the Linux command line.

use anyhow::{anyhow, Context, Result};
use cancapture::{
    available_interfaces, config::DEFAULT_INTERFACE, CanChannel, CaptureConfig, ChannelEvent,
    Column, LogStore, Packet, PeriodicSender, Timestamp, BITRATES,
};
use clap::{arg, value_parser, ArgAction, ArgMatches, Command};
use itertools::Itertools;
use log::{info, warn};
use std::{
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    thread,
    time::Duration,
};

// Make the app version the same as the package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// How often the main thread checks for a Ctrl-C
const QUIT_CHECK: Duration = Duration::from_millis(250);

// --------------------------------------------------------------------------

/// Installs a Ctrl-C handler, returning the flag it sets.
fn quit_flag() -> Result<Arc<AtomicBool>> {
    let quit = Arc::new(AtomicBool::new(false));
    let q = Arc::clone(&quit);
    ctrlc::set_handler(move || q.store(true, Ordering::Relaxed))
        .context("installing the Ctrl-C handler")?;
    Ok(quit)
}

/// Parses a hex number, with or without a "0x" prefix.
fn parse_hex(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid hex number '{}'", s))
}

// --------------------------------------------------------------------------

/// Process the 'list' subcommand.
fn list_cmd() -> Result<()> {
    let ifaces = available_interfaces()?;
    if ifaces.is_empty() {
        println!("No CAN interfaces found");
    }
    for iface in ifaces {
        let state = if iface.up { "up" } else { "down" };
        println!("{:<12} {}", iface.name, state);
    }
    Ok(())
}

/// Process the 'bitrates' subcommand.
fn bitrates_cmd() -> Result<()> {
    for rate in BITRATES {
        println!("{:>14}  {:#06X}", rate.label, rate.code);
    }
    Ok(())
}

/// Process the 'capture' subcommand.
///
/// Captures traffic until Ctrl-C (or a packet count), printing every packet
/// and optionally saving the log.
fn capture_cmd(opts: &ArgMatches) -> Result<()> {
    let mut cfg = match opts.get_one::<String>("config") {
        Some(path) => CaptureConfig::from_file(path)?,
        None => CaptureConfig::default(),
    };

    if let Some(iface) = opts.get_one::<String>("iface") {
        cfg.interface = iface.clone();
    }
    if let Some(filters) = opts.get_many::<String>("filter") {
        cfg.filters = filters.cloned().collect();
    }
    if let Some(path) = opts.get_one::<String>("output") {
        cfg.log_file = Some(path.into());
    }
    let max_count = opts.get_one::<usize>("count").copied();

    if let Some(rate) = cfg.bitrate() {
        info!("Bus configured for {}", rate);
    }

    let channel = Arc::new(CanChannel::new());
    cfg.apply_filters(&channel)?;

    let rx = channel.subscribe();
    channel
        .start(&cfg.interface)
        .with_context(|| format!("starting capture on {}", cfg.interface))?;

    let sender = if cfg.jobs.is_empty() {
        None
    } else {
        let sender = PeriodicSender::new(Arc::clone(&channel))?;
        cfg.apply_jobs(&sender);
        Some(sender)
    };

    let quit = quit_flag()?;
    let mut log = LogStore::new();

    while !quit.load(Ordering::Relaxed) {
        match rx.recv_timeout(QUIT_CHECK) {
            Ok(ChannelEvent::PacketArrived(packet)) => {
                println!("{}", packet);
                log.append(&packet);
                if max_count.map_or(false, |n| log.row_count() >= n) {
                    break;
                }
            }
            Ok(ChannelEvent::StatusChanged(_)) | Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(sender);
    channel.stop();
    eprintln!("{}", channel.status());

    if let Some(path) = &cfg.log_file {
        log.save(path)
            .with_context(|| format!("saving the log to {}", path.display()))?;
        eprintln!("Saved {} packets to {}", log.row_count(), path.display());
    }
    Ok(())
}

/// Process the 'send' subcommand.
fn send_cmd(opts: &ArgMatches) -> Result<()> {
    let iface = opts
        .get_one::<String>("iface")
        .map(String::as_str)
        .unwrap_or(DEFAULT_INTERFACE);
    let id = parse_hex(opts.get_one::<String>("id").map_or("", String::as_str))?;
    let extended = opts.get_one::<bool>("extended").copied().unwrap_or(false);

    let packet = match opts.get_one::<u8>("rtr") {
        Some(dlc) => Packet::new_remote(id, extended, *dlc)?,
        None => {
            let digits: String = opts
                .get_one::<String>("data")
                .map_or("", String::as_str)
                .split_whitespace()
                .collect();
            let data = hex::decode(&digits).context("invalid data bytes")?;
            Packet::new(id, extended, &data)?
        }
    };

    let channel = CanChannel::new();
    channel
        .start(iface)
        .with_context(|| format!("opening {}", iface))?;

    let res = channel.send(&packet);
    channel.stop();

    match res? {
        Some(sent) => println!("{}", sent),
        None => return Err(anyhow!("The channel stopped before the frame was sent")),
    }
    Ok(())
}

/// Process the 'replay' subcommand.
///
/// Sends the packets of a log file, keeping the recorded gaps between them
/// unless told not to.
fn replay_cmd(opts: &ArgMatches) -> Result<()> {
    let iface = opts
        .get_one::<String>("iface")
        .map(String::as_str)
        .unwrap_or(DEFAULT_INTERFACE);
    let file = opts.get_one::<String>("file").map_or("", String::as_str);
    let no_delay = opts.get_one::<bool>("fast").copied().unwrap_or(false);

    let mut log = LogStore::new();
    log.load(file)
        .with_context(|| format!("reading the log {}", file))?;

    let channel = CanChannel::new();
    channel
        .start(iface)
        .with_context(|| format!("opening {}", iface))?;

    let quit = quit_flag()?;
    let mut prev: Option<Timestamp> = None;
    let mut nsent = 0;

    for (i, row) in log.rows().iter().enumerate() {
        if quit.load(Ordering::Relaxed) {
            break;
        }
        if row.is_empty() {
            continue;
        }
        let packet = match row.to_packet() {
            Ok(packet) if packet.error => continue,
            Ok(packet) => packet,
            Err(err) => {
                warn!("Skipping row {}: {}", i, err);
                continue;
            }
        };

        if let (Some(prev), false) = (prev, no_delay) {
            thread::sleep(packet.timestamp.saturating_since(&prev));
        }
        prev = Some(packet.timestamp);

        if let Some(sent) = channel.send(&packet)? {
            println!("{}", sent);
            nsent += 1;
        }
    }

    channel.stop();
    eprintln!("Replayed {} of {} rows", nsent, log.row_count());
    Ok(())
}

/// Process the 'dump' subcommand.
fn dump_cmd(opts: &ArgMatches) -> Result<()> {
    let file = opts.get_one::<String>("file").map_or("", String::as_str);

    let mut log = LogStore::new();
    log.load(file)
        .with_context(|| format!("reading the log {}", file))?;

    println!("{}", Column::ALL.iter().map(|c| c.title()).join("\t"));
    for row in log.rows() {
        let line = Column::ALL
            .iter()
            .map(|&col| row.get(col).unwrap_or(""))
            .join("\t");
        println!("{}", line);
    }
    Ok(())
}

// --------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let opts = Command::new("cancap")
        .version(VERSION)
        .about("Capture, log, and replay CAN bus traffic on Linux")
        .disable_help_flag(true)
        .arg(
            arg!(--help "Print help information")
                .short('?')
                .action(ArgAction::Help)
                .global(true),
        )
        .subcommand(Command::new("list").about("List the CAN interfaces"))
        .subcommand(Command::new("bitrates").about("List the standard bit rates"))
        .subcommand(
            Command::new("capture")
                .about("Capture traffic until Ctrl-C")
                .arg(
                    arg!([iface] "The CAN interface to use, like 'can0', 'vcan0', etc")
                        .index(1),
                )
                .arg(
                    arg!(-f --filter <SPEC> "A receive filter: 'ID:MASK', 'ID~MASK' or '#ERRMASK'")
                        .required(false)
                        .action(ArgAction::Append),
                )
                .arg(arg!(-o --output <FILE> "Save the capture to a log file").required(false))
                .arg(arg!(-c --config <FILE> "Read settings from a TOML file").required(false))
                .arg(
                    arg!(-n --count <N> "Stop after this many packets")
                        .required(false)
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("send")
                .about("Send a single frame")
                .arg(arg!(<iface> "The CAN interface to use").index(1))
                .arg(arg!(<id> "The CAN ID, in hex").index(2))
                .arg(arg!([data] "The data bytes, in hex").index(3))
                .arg(
                    arg!(-e --extended "Use an extended (29-bit) ID")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(-r --rtr <DLC> "Send a remote request for DLC bytes")
                        .required(false)
                        .value_parser(value_parser!(u8)),
                ),
        )
        .subcommand(
            Command::new("replay")
                .about("Send the packets of a log file")
                .arg(arg!(<iface> "The CAN interface to use").index(1))
                .arg(arg!(<file> "The log file").index(2))
                .arg(
                    arg!(--fast "Don't keep the recorded gaps between packets")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the contents of a log file")
                .arg(arg!(<file> "The log file").index(1)),
        )
        .get_matches();

    let res = match opts.subcommand() {
        Some(("list", _)) => list_cmd(),
        Some(("bitrates", _)) => bitrates_cmd(),
        Some(("capture", sub_opts)) => capture_cmd(sub_opts),
        Some(("send", sub_opts)) => send_cmd(sub_opts),
        Some(("replay", sub_opts)) => replay_cmd(sub_opts),
        Some(("dump", sub_opts)) => dump_cmd(sub_opts),
        _ => Err(anyhow!("Need to specify a subcommand (-? for help).")),
    };

    if let Err(err) = res {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}
