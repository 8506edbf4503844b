use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use canopen_common::{parse_hex_bytes, EmergencyMessage, ErrorMessage, PdoMessage, SdoDataType, SdoValue};
use canopen_gateway::{Gateway, GatewayConfig};
use clap::{Parser, Subcommand};
use log::{info, warn};

const VERSION: &str = concat!(
    env!("APP_VERSION"),
    " (",
    env!("GIT_HASH"),
    env!("GIT_DIRTY"),
    " ",
    env!("GIT_BRANCH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Talk to CANopen nodes through a CAN-to-UDP bridge.
#[derive(Parser)]
#[command(name = "canopen-gateway")]
#[command(version = VERSION)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "CANOPEN_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bridge IPv4 address
    #[arg(short, long)]
    bridge: Option<String>,

    /// Bridge UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// SDO timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expedited SDO upload
    Read {
        #[arg(value_parser = parse_u8)]
        node: u8,
        #[arg(value_parser = parse_u16)]
        index: u16,
        #[arg(value_parser = parse_u8)]
        subindex: u8,
        /// Decode as u8, u16, u32, i8, i16, i32, f32, string or bytes
        #[arg(short = 'T', long = "type", default_value = "bytes")]
        data_type: SdoDataType,
    },
    /// Expedited SDO download
    Write {
        #[arg(value_parser = parse_u8)]
        node: u8,
        #[arg(value_parser = parse_u16)]
        index: u16,
        #[arg(value_parser = parse_u8)]
        subindex: u8,
        value: String,
        #[arg(short = 'T', long = "type", default_value = "u32")]
        data_type: SdoDataType,
    },
    /// Send one PDO (cob_id = pdo + node)
    Pdo {
        #[arg(value_parser = parse_u8)]
        node: u8,
        #[arg(value_parser = parse_u16)]
        pdo: u16,
        /// Hex bytes, e.g. "01 02 0A"
        data: String,
    },
    /// Print inbound PDO and EMCY frames
    Monitor {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Emit the configured heartbeat while monitoring
        #[arg(long)]
        heartbeat: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn parse_int(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("'{}': {}", text, e))
}

fn parse_u8(text: &str) -> Result<u8, String> {
    u8::try_from(parse_int(text)?).map_err(|e| format!("'{}': {}", text, e))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    u16::try_from(parse_int(text)?).map_err(|e| format!("'{}': {}", text, e))
}

fn load_config(cli: &Cli) -> Result<GatewayConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load_from(path)?,
        None => GatewayConfig::load(),
    };
    if let Some(bridge) = &cli.bridge {
        config.bridge_address = bridge.clone();
    }
    if let Some(port) = cli.port {
        config.bridge_port = port;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.sdo_timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: GatewayConfig) -> Result<Gateway, Box<dyn Error>> {
    let gateway = Gateway::new(config);
    if gateway.config().recorder.enabled {
        match gateway.config().recording_directory() {
            Some(dir) => {
                gateway.recorder().enable(&dir)?;
            }
            None => warn!("No recording directory available, recording disabled"),
        }
    }
    gateway.connect_configured().await?;
    if let Some(local) = gateway.local_addr().await {
        info!("Listening on {}", local);
    }
    Ok(gateway)
}

async fn monitor(gateway: &Gateway, seconds: Option<u64>, heartbeat: bool) -> Result<(), Box<dyn Error>> {
    gateway.register_pdo_sink(|pdo: &PdoMessage| {
        println!("PDO  0x{:03X} [{}] {:02X?}", pdo.cob_id, pdo.length, pdo.data());
    });
    gateway.register_error_sink(|err: &ErrorMessage| match EmergencyMessage::parse(err.cob_id, &err.payload) {
        Some(emcy) => println!("{}", emcy),
        None => println!("ERR  0x{:03X} {:02X?}", err.cob_id, err.payload),
    });
    if heartbeat {
        gateway.start_heartbeat(gateway.config().heartbeat_period());
    }

    let mut state = gateway.watch_state();
    let wait = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::select! {
        _ = wait => info!("Monitoring finished"),
        _ = state.wait_for(|s| !s.is_connected()) => warn!("Bridge connection lost"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let timeout = config.sdo_timeout();

    match cli.command {
        Commands::Config { save } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                println!("# saved to {}", path.display());
            }
            return Ok(());
        }
        Commands::Read { node, index, subindex, data_type } => {
            let gateway = connect(config).await?;
            let result = gateway.read_sdo(node, index, subindex, timeout).await;
            gateway.disconnect().await?;
            let read = result?;
            let value = canopen_common::parse_payload(read.data(), data_type)?;
            println!("0x{:04X}:{:02X} = {}", index, subindex, value);
        }
        Commands::Write { node, index, subindex, value, data_type } => {
            let value = SdoValue::parse_as(data_type, &value)?;
            let gateway = connect(config).await?;
            let result = gateway.write_value(node, index, subindex, &value, timeout).await;
            gateway.disconnect().await?;
            result?;
            println!("0x{:04X}:{:02X} <- {}", index, subindex, value);
        }
        Commands::Pdo { node, pdo, data } => {
            let bytes = parse_hex_bytes(&data)?;
            let gateway = connect(config).await?;
            let result = gateway.write_pdo(node, pdo, &bytes).await;
            gateway.disconnect().await?;
            result?;
        }
        Commands::Monitor { seconds, heartbeat } => {
            let gateway = connect(config).await?;
            monitor(&gateway, seconds, heartbeat).await?;
            if gateway.is_connected() {
                gateway.disconnect().await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hex_and_decimal_arguments() {
        assert_eq!(parse_u16("0x2000"), Ok(0x2000));
        assert_eq!(parse_u8("12"), Ok(12));
        assert!(parse_u8("0x100").is_err());

        let cli = Cli::try_parse_from(["canopen-gateway", "--port", "10000", "read", "2", "0x1017", "0", "-T", "u16"]).unwrap();
        assert_eq!(cli.port, Some(10000));
        assert!(matches!(
            cli.command,
            Commands::Read { node: 2, index: 0x1017, subindex: 0, data_type: SdoDataType::UInt16 }
        ));
    }
}
