//! Reference driver for the riptide transport: a hello-exchange server, a client, or
//! both in one process. Exits when a line arrives on stdin.

use clap::{App, Arg};
use riptide::{
    Address, ChannelKind, Config, DeflateCompressor, Event, FamilyMode, Host, Instance,
};
use riptide::network::UdpNetwork;
use serde_derive::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use undertow::logging;

const DEFAULT_PORT: u16 = 64242;
const CONFIG_FILE: &str = "netrunner.toml";

const HELLOS: [&str; 4] = [
    "Hello world!",
    "Hello another world!",
    "Hello world in an another world! Yet another hello world with an yet another hello world!",
    "Hello another world in an world! Yet another hello world with an yet another hello world!",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DriverConfig {
    port: u16,
    channels: usize,
    transport: Config,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            port: DEFAULT_PORT,
            channels: 4,
            transport: Config::default(),
        }
    }
}

fn load_config() -> DriverConfig {
    match std::fs::read_to_string(CONFIG_FILE) {
        Ok(text) => serdeconv::from_toml_str(&text).expect("Malformed netrunner.toml"),
        Err(_) => DriverConfig::default(),
    }
}

fn make_host(config: &DriverConfig, log: &logging::Logger, port: u16) -> (Host, Address) {
    let instance = Instance::new(config.transport.clone(), log);
    let network = UdpNetwork::new(log).expect("Network construction failed");

    let mut host = Host::create(instance, Box::new(network));
    host.set_compressor(Box::new(DeflateCompressor::new()));

    let kinds = vec![ChannelKind::ReliableOrdered; config.channels];
    let bound = host
        .start(&Address::any_v4(port), FamilyMode::V4, &kinds)
        .expect("Bind failed");

    (host, bound)
}

fn run_server(config: DriverConfig, log: logging::Logger, stop: Arc<AtomicBool>) {
    let (mut host, bound) = make_host(&config, &log, config.port);
    logging::info!(log, "server listening"; "address" => %bound);

    while !stop.load(Ordering::Relaxed) {
        let event = match host.service(50) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(error) => {
                logging::error!(log, "service failed"; "error" => ?error);
                break;
            }
        };

        match event {
            Event::CheckConnectionToken { peer, .. } => {
                host.accept_connection_token(peer).ok();
            }
            Event::CheckAuthenticationToken { peer, .. } => {
                host.accept_authentication_token(peer).ok();
            }
            Event::Connect { peer, .. } => {
                logging::info!(log, "peer connected"; "peer" => ?peer);
                for hello in HELLOS.iter() {
                    host.send(peer, 0, hello.as_bytes()).ok();
                }
            }
            Event::Receive { peer, channel, message } => {
                // Echo traffic straight back on the same channel.
                host.send(peer, channel, &message).ok();
            }
            Event::Disconnect { peer, reason } => {
                logging::info!(log, "peer disconnected"; "peer" => ?peer, "reason" => reason);
            }
            Event::Mtu { peer, mtu } => {
                logging::info!(log, "path mtu settled"; "peer" => ?peer, "mtu" => mtu);
            }
            _ => (),
        }
    }
}

fn run_client(config: DriverConfig, log: logging::Logger, remote: String, stop: Arc<AtomicBool>) {
    let (mut host, _) = make_host(&config, &log, 0);

    let target = match Address::parse(&format!("{}:{}", remote, config.port)) {
        Ok(address) => address,
        Err(_) => host
            .resolve(&remote, config.port)
            .expect("Host resolution failed"),
    };

    let peer = host
        .connect(&target, config.channels, 0)
        .expect("Connect failed");
    logging::info!(log, "connecting"; "target" => %target, "peer" => ?peer);

    while !stop.load(Ordering::Relaxed) {
        let event = match host.service(50) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(error) => {
                logging::error!(log, "service failed"; "error" => ?error);
                break;
            }
        };

        match event {
            Event::Approval { peer, .. } => {
                logging::info!(log, "handshake approved"; "peer" => ?peer);
            }
            Event::Connect { peer, .. } => {
                logging::info!(log, "connected"; "peer" => ?peer);
            }
            Event::Receive { channel, message, .. } => {
                logging::info!(log, "message";
                               "channel" => channel,
                               "text" => String::from_utf8_lossy(&message).into_owned());
            }
            Event::Denial { reason, .. } => {
                logging::warn!(log, "connection denied"; "reason" => ?reason);
                break;
            }
            Event::Disconnect { reason, .. } => {
                logging::info!(log, "disconnected"; "reason" => reason);
                break;
            }
            Event::Mtu { mtu, .. } => {
                logging::info!(log, "path mtu settled"; "mtu" => mtu);
            }
            _ => (),
        }
    }
}

fn main() {
    let matches = App::new("netrunner")
        .about("riptide reference driver")
        .arg(Arg::with_name("role").help("Server, Client, or anything else for both"))
        .arg(Arg::with_name("remote").help("Remote host for the client role"))
        .get_matches();

    let config = load_config();
    let log = logging::terminal();
    let stop = Arc::new(AtomicBool::new(false));

    let role = matches.value_of("role").unwrap_or("both").to_lowercase();
    let remote = matches.value_of("remote").unwrap_or("127.0.0.1").to_string();

    let mut workers = Vec::new();

    if role != "client" {
        let server_config = config.clone();
        let server_log = log.new(logging::o!("role" => "server"));
        let server_stop = stop.clone();
        workers.push(std::thread::spawn(move || {
            run_server(server_config, server_log, server_stop)
        }));
    }

    if role != "server" {
        let client_config = config.clone();
        let client_log = log.new(logging::o!("role" => "client"));
        let client_stop = stop.clone();
        workers.push(std::thread::spawn(move || {
            run_client(client_config, client_log, remote, client_stop)
        }));
    }

    // A line on stdin shuts everything down.
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok();
    stop.store(true, Ordering::Relaxed);

    for worker in workers {
        worker.join().ok();
    }
}
