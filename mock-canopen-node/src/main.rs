//! Mock CAN-to-UDP bridge with one simulated CANopen node.
//!
//! ```bash
//! # Node 4 behind a bridge on the gateway's default port
//! cargo run -p mock-canopen-node -- --listen 127.0.0.1:9999 --node-id 4
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mock_canopen_node::{parse_object_file, BridgeOptions, MockBridge, ObjectDictionary, SdoServer};

#[derive(Parser)]
#[command(name = "mock-node", version, about = "Simulated CANopen node behind a CAN-to-UDP bridge")]
struct Args {
    /// UDP address the bridge listens on
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    listen: SocketAddr,

    /// Node id of the simulated node
    #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=127))]
    node_id: u8,

    /// TPDO1 period in milliseconds, 0 disables it
    #[arg(long, default_value_t = 100)]
    tpdo_ms: u64,

    /// Node heartbeat period in milliseconds, 0 disables it
    #[arg(long, default_value_t = 0)]
    heartbeat_ms: u64,

    /// TOML file with extra `[[object]]` entries
    #[arg(short, long)]
    objects: Option<PathBuf>,

    /// Emit an EMCY with this error code once connected, e.g. 0x4210
    #[arg(long)]
    emcy: Option<String>,
}

fn period(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut object_dict = ObjectDictionary::new();
    object_dict.add_test_objects_for_node(args.node_id);
    if let Some(path) = &args.objects {
        let text = std::fs::read_to_string(path)?;
        object_dict.add_entries(parse_object_file(&text)?)?;
    }

    println!("Mock CANopen node {} ({} objects)", args.node_id, object_dict.len());
    for line in object_dict.summary() {
        println!("  {}", line);
    }

    let options = BridgeOptions {
        tpdo_period: period(args.tpdo_ms),
        heartbeat_period: period(args.heartbeat_ms),
        mute_sdo: false,
    };
    let bridge = MockBridge::bind(args.listen, SdoServer::new(args.node_id, object_dict), options).await?;
    let handle = bridge.spawn()?;
    println!("Bridge listening on {}, SDO requests on COB-ID 0x{:03X}", handle.addr(), 0x600 + args.node_id as u16);
    println!("Press Ctrl+C to stop");

    if let Some(code) = &args.emcy {
        let code = match code.strip_prefix("0x") {
            Some(hex) => u16::from_str_radix(hex, 16)?,
            None => code.parse()?,
        };
        // the bridge only knows where to send once the host has probed it
        while handle.stats().probes == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.emergency(code, 0x01);
    }

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
