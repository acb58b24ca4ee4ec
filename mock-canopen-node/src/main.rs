//! # Mock CANopen Node
//!
//! A CANopen node simulator that serves an object dictionary over SDO.
//!
//! This mock node:
//! - Answers expedited, segmented and block SDO transfers on the CAN bus
//! - Serves simulated sensor values that change on every read
//! - Accepts writes to its device name and control word
//! - Streams a firmware-like program domain in both directions
//!
//! ## Usage
//!
//! ```bash
//! # Start the mock node on vcan0 with node ID 4
//! cargo run -p mock-canopen-node -- --interface vcan0 --node-id 4
//!
//! # Or take everything from a config file
//! cargo run -p mock-canopen-node -- --config node.toml
//! ```

mod config;
mod logger;
mod object_dictionary;

use std::path::Path;
use std::time::Duration;

use canopen_sdo::transport::from_can_frame;
use canopen_sdo::{Completion, SdoServer, SystemClock};
use config::NodeConfig;
use log::{debug, error, info, warn};
use object_dictionary::{ObjectDictionary, PROGRAM_DATA};
use socketcan::{CanSocket, Socket};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut config_problem = None;
    let mut config = match config::config_path(&args) {
        Some(path) => NodeConfig::load(Path::new(path)).unwrap_or_else(|e| {
            config_problem = Some(format!("{} ({}), using defaults", e, path));
            NodeConfig::default()
        }),
        None => NodeConfig::default(),
    };
    config.apply_args(&args);

    if let Err(e) = logger::init(config.log_level()) {
        eprintln!("⚠ Logger not installed: {}", e);
    }
    if let Some(problem) = config_problem {
        warn!("{}", problem);
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("🤖 Mock CANopen Node Starting...");
    info!("   Interface: {}", config.interface);
    info!("   Node ID: {}", config.node_id);

    // Open CAN socket
    let socket = match CanSocket::open(&config.interface) {
        Ok(sock) => {
            info!("CAN socket opened successfully");
            sock
        }
        Err(e) => {
            error!("Failed to open CAN socket: {}", e);
            eprintln!("\nTroubleshooting:");
            eprintln!("  1. Create virtual CAN interface:");
            eprintln!("     sudo modprobe vcan");
            eprintln!("     sudo ip link add dev vcan0 type vcan");
            eprintln!("     sudo ip link set up vcan0");
            eprintln!("  2. Check interface exists: ip link show");
            std::process::exit(1);
        }
    };

    // Short read timeout so the server gets polled between frames
    if let Err(e) = socket.set_read_timeout(Duration::from_millis(10)) {
        warn!("Failed to set socket timeout: {}", e);
    }

    let mut dictionary = ObjectDictionary::new();
    dictionary.add_test_objects_for_node(config.node_id);
    info!("Object dictionary loaded with {} objects", dictionary.len());
    info!("📋 Available SDO Objects:");
    dictionary.print_summary();

    let mut server = match SdoServer::new(config.sdo.clone(), config.node_id, socket, dictionary, SystemClock::new()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start SDO server: {}", e);
            std::process::exit(1);
        }
    };
    register_hooks(&mut server);

    info!("🚀 Mock node is running!");
    info!("   Waiting for SDO requests on COB-ID 0x{:03X}...", 0x600 + config.node_id as u16);
    info!("   Press Ctrl+C to stop");

    // Main loop: feed received frames to the server, then let it stream and time out
    loop {
        match server.transport().read_frame() {
            Ok(frame) => {
                if let Some((cob_id, data)) = from_can_frame(&frame) {
                    if !server.handle_frame(cob_id, &data) {
                        debug!("Ignoring frame on COB-ID 0x{:03X}", cob_id);
                    }
                }
            }
            Err(err) => {
                // Timeout or no data - this is normal, just continue
                if err.kind() != std::io::ErrorKind::WouldBlock && err.kind() != std::io::ErrorKind::TimedOut {
                    warn!("CAN read error: {}", err);
                }
            }
        }
        server.poll();
    }
}

fn register_hooks(server: &mut SdoServer<CanSocket, ObjectDictionary, SystemClock>) {
    server.on_read(|request, dictionary| {
        dictionary.refresh(request.address)?;
        debug!("📤 Read of {} on channel {}", request.address, request.channel);
        Ok(Completion::Ready)
    });
    server.on_write(|request, _| {
        info!("📥 {} written", request.address);
        Ok(Completion::Ready)
    });
    server.on_domain_read(|chunk, dictionary| {
        dictionary.stage_program_chunk(chunk)?;
        Ok(Completion::Ready)
    });
    server.on_domain_write(|chunk, dictionary| {
        if chunk.address == PROGRAM_DATA {
            dictionary.store_program_chunk(chunk)?;
        }
        Ok(Completion::Ready)
    });
    server.on_abort(|request, code| {
        warn!("SDO transfer of {} aborted: {}", request.address, code.description());
    });
}
