// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Reliable chunked transfer over an unreliable packet radio
mod chunker;
mod clock;
mod config;
mod engine;
mod error;
mod host;
mod power;
mod protocol;
mod radio;
mod receiver;
mod sender;
mod wake;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use clock::SystemClock;
use config::{LinkConfig, SleepPolicy};
use engine::RadioLink;
use error::LinkError;
use host::{HostChannel, SerialHost, StreamHost};
use power::{NullPower, PowerControl, SerialLinePower};
use radio::{RadioChannel, SerialRadio, UdpRadio};
use wake::WakeCoordinator;

const DEFAULT_BAUD: u32 = 115_200;

#[derive(Parser)]
#[command(name = "nrflink")]
#[command(about = "Reliable byte-stream transfer over an unreliable packet radio", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. info or nrflink=debug (RUST_LOG wins if set)
    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    log_level: String,

    /// Radio channel: udp:LOCAL:PEER or serial:PATH[@BAUD]
    #[arg(short, long, global = true, value_name = "SPEC")]
    radio: Option<String>,

    /// Fraction of outgoing UDP packets to drop, for exercising retries
    #[arg(long, global = true, default_value = "0.0", value_name = "RATE")]
    drop_rate: f64,

    /// Host channel: stdio or PATH[@BAUD]
    #[arg(long, global = true, default_value = "stdio", value_name = "SPEC")]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read transfers from the host and push them over the radio
    Send,
    /// Listen on the radio and forward transfers to the host
    Receive {
        /// Serial port whose modem lines drive the wake line and radio power
        #[arg(long, value_name = "PATH")]
        wake_line: Option<String>,

        /// Overrides sleep.policy from the configuration
        #[arg(long, value_enum)]
        sleep_policy: Option<SleepPolicy>,
    },
}

/// Splits `PATH[@BAUD]`.
fn parse_port(spec: &str) -> Result<(String, u32), String> {
    match spec.rsplit_once('@') {
        Some((path, baud)) => {
            let baud = baud.parse::<u32>()
                .map_err(|_| format!("Invalid baud rate: {}", baud))?;
            Ok((path.to_string(), baud))
        }
        None => Ok((spec.to_string(), DEFAULT_BAUD)),
    }
}

/// Splits `LOCAL:PEER` where both halves are socket addresses.
fn parse_udp_pair(spec: &str) -> Result<(SocketAddr, SocketAddr), String> {
    spec.match_indices(':')
        .find_map(|(i, _)| {
            let local = spec[..i].parse::<SocketAddr>().ok()?;
            let peer = spec[i + 1..].parse::<SocketAddr>().ok()?;
            Some((local, peer))
        })
        .ok_or_else(|| format!("Invalid UDP radio: {}. Expected udp:LOCAL:PEER", spec))
}

fn open_radio(spec: &str, drop_rate: f64, config: &LinkConfig) -> Result<Box<dyn RadioChannel>, String> {
    if let Some(pair) = spec.strip_prefix("udp:") {
        let (local, peer) = parse_udp_pair(pair)?;
        let radio = UdpRadio::bind(local, peer, drop_rate)
            .map_err(|e| format!("Failed to bind {}: {}", local, e))?;
        info!("UDP radio {} -> {}", radio.local_addr().unwrap_or(local), peer);
        return Ok(Box::new(radio));
    }

    if let Some(port) = spec.strip_prefix("serial:") {
        let (path, baud) = parse_port(port)?;
        let radio = SerialRadio::open(&path, baud, config.radio.clone())
            .map_err(|e| format!("Failed to open radio {}: {}", path, e))?;
        info!("serial radio on {} at {} baud, channel {}", path, baud, config.radio.channel);
        return Ok(Box::new(radio));
    }

    Err(format!("Invalid radio: {}. Expected udp:LOCAL:PEER or serial:PATH[@BAUD]", spec))
}

fn open_host(spec: &str) -> Result<Box<dyn HostChannel>, String> {
    if spec == "stdio" {
        return Ok(Box::new(StreamHost::stdio()));
    }

    let (path, baud) = parse_port(spec)?;
    let host = SerialHost::open(&path, baud)
        .map_err(|e| format!("Failed to open host port {}: {}", path, e))?;
    info!("host on {} at {} baud", path, baud);
    Ok(Box::new(host))
}

fn load_config(cli: &Cli) -> Result<LinkConfig, String> {
    let config = match &cli.config {
        Some(path) => LinkConfig::load(path).map_err(|e| e.to_string())?,
        None => LinkConfig::default(),
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout may be the host channel
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let Some(radio_spec) = cli.radio.as_deref() else {
        error!("No radio given. Use --radio udp:LOCAL:PEER or --radio serial:PATH[@BAUD]");
        std::process::exit(1);
    };

    let radio = match open_radio(radio_spec, cli.drop_rate, &config) {
        Ok(radio) => radio,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let host = match open_host(&cli.host) {
        Ok(host) => host,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let link = RadioLink::new(radio, Box::new(SystemClock::new()), config.timing.clone());

    let result = match cli.command {
        Commands::Send => run_sender(link, host, config),
        Commands::Receive { wake_line, sleep_policy } => {
            if let Some(policy) = sleep_policy {
                config.sleep.policy = policy;
            }
            let power: Box<dyn PowerControl> = match wake_line {
                Some(path) => match SerialLinePower::open(&path) {
                    Ok(power) => Box::new(power),
                    Err(e) => {
                        error!("Failed to open wake line {}: {}", path, e);
                        std::process::exit(1);
                    }
                },
                None => Box::new(NullPower),
            };
            run_receiver(link, host, power, config)
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run_sender(link: RadioLink, host: Box<dyn HostChannel>, config: LinkConfig) -> Result<(), LinkError> {
    use sender::{SenderFsm, SenderState};

    info!("sender ready");
    let mut state = SenderFsm::new(link, host, config);

    loop {
        let from = state.state_name();
        state = state.step()?;
        if state.state_name() != from {
            debug!("sender {} -> {}", from, state.state_name());
        }
    }
}

fn run_receiver(
    link: RadioLink,
    host: Box<dyn HostChannel>,
    power: Box<dyn PowerControl>,
    config: LinkConfig,
) -> Result<(), LinkError> {
    use receiver::{ReceiverFsm, ReceiverState};

    info!("receiver ready, sleep policy {:?}", config.sleep.policy);
    let wake = WakeCoordinator::from_config(power, &config);
    let mut state = ReceiverFsm::new(link, host, wake, config);

    loop {
        let from = state.state_name();
        state = state.step()?;
        if state.state_name() != from {
            debug!("receiver {} -> {}", from, state.state_name());
        }
    }
}
