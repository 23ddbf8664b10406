use clap::Parser;
use ecto_modbus::{Config, Device, DeviceKind, RtuServer, StateFeed};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uom::si::thermodynamic_temperature::degree_celsius;

#[derive(Parser)]
#[command(name = "ecto-modbus-slave")]
#[command(about = "Emulate Ectocontrol devices as Modbus RTU slaves on an RS-485 bus")]
struct Args {
    /// YAML config file
    #[arg(short, long)]
    config: PathBuf,

    /// Serial port, overrides the one in the config
    #[arg(short, long)]
    port: Option<String>,

    /// Log every request the slaves answer
    #[arg(long)]
    log_requests: bool,

    /// Do not read commands from stdin; run until Ctrl-C or link failure
    #[arg(long)]
    no_stdin: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Switch { addr: u8, channel: usize, on: bool },
    Timer {
        addr: u8,
        channel: usize,
        on: bool,
        seconds: f64,
    },
    State { entity_id: String, value: String },
    Show { addr: u8 },
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(format!("expected on/off, got {:?}", other)),
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

fn parse_channel(s: &str) -> Result<usize, String> {
    s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["switch", addr, channel, state] => Ok(Command::Switch {
                addr: parse_address(addr)?,
                channel: parse_channel(channel)?,
                on: parse_on_off(state)?,
            }),
            ["timer", addr, channel, state, seconds] => Ok(Command::Timer {
                addr: parse_address(addr)?,
                channel: parse_channel(channel)?,
                on: parse_on_off(state)?,
                seconds: seconds
                    .parse()
                    .map_err(|e: std::num::ParseFloatError| e.to_string())?,
            }),
            ["state", entity_id, value @ ..] if !value.is_empty() => Ok(Command::State {
                entity_id: entity_id.to_string(),
                value: value.join(" "),
            }),
            ["show", addr] => Ok(Command::Show {
                addr: parse_address(addr)?,
            }),
            _ => Err(format!(
                "unknown command {:?} (switch|timer|state|show)",
                line.trim()
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let port = args.port.unwrap_or_else(|| config.port.clone());

    let mut server = RtuServer::new(config.server());
    server.set_on_error(|e| tracing::warn!("Modbus error: {}", e));
    if args.log_requests {
        server.set_on_request_handled(|slave, request, response| {
            tracing::info!("Slave {}: {:02X?} -> {:02X?}", slave, request, response);
        });
    }

    let feed = Arc::new(StateFeed::new());
    for device_config in &config.devices {
        let device = server.add_device_with(
            device_config.addr,
            device_config.kind,
            device_config.profile(),
            device_config.entity_id.as_deref(),
        )?;
        let addr = device.address();
        device.set_state_change_callback(move |channel, on| {
            tracing::info!(
                "Device {} channel {} switched {} by master",
                addr,
                channel,
                if on { "on" } else { "off" }
            );
        });
        device.track_entity(&feed);
        tracing::info!(
            "Registered {} at address {} (uid 0x{:06X})",
            device.kind(),
            addr,
            device.uid()
        );
    }

    tracing::info!(
        "Opening {} ({:?}) at {} baud...",
        port,
        config.port_type,
        config.baudrate
    );
    server.start_serial(&port)?;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        cancel_signal.cancel();
    });

    let mut lines = (!args.no_stdin).then(|| BufReader::new(tokio::io::stdin()).lines());
    let link_down = server.finished();
    tokio::pin!(link_down);
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut link_down => {
                tracing::error!("Serial link is down");
                break;
            }
            line = next_line(&mut lines) => line?,
        };
        let Some(line) = line else {
            tracing::info!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => run_command(&server, &feed, command),
            Err(e) => tracing::warn!("{}", e),
        }
    }

    server.stop().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Next stdin line, or never when stdin is not read.
async fn next_line(lines: &mut Option<Lines<BufReader<Stdin>>>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn run_command(server: &RtuServer, feed: &StateFeed, command: Command) {
    let device = |addr: u8| {
        let device = server.device(addr);
        if device.is_none() {
            tracing::warn!("No device at address {}", addr);
        }
        device
    };

    match command {
        Command::Switch { addr, channel, on } => {
            if let Some(device) = device(addr) {
                match device.set_switch_state(channel, on) {
                    Ok(true) => tracing::info!("Device {} channel {} -> {}", addr, channel, on),
                    Ok(false) => tracing::info!("Device {} channel {} unchanged", addr, channel),
                    Err(e) => tracing::warn!("Device {}: {}", addr, e),
                }
            }
        }
        Command::Timer {
            addr,
            channel,
            on,
            seconds,
        } => {
            if let Some(device) = device(addr) {
                match device.set_timer(channel, on, seconds) {
                    Ok(_) => tracing::info!(
                        "Device {} timer {} = 0x{:04X}",
                        addr,
                        channel,
                        device.get_timer(channel).unwrap_or_default()
                    ),
                    Err(e) => tracing::warn!("Device {}: {}", addr, e),
                }
            }
        }
        Command::State { entity_id, value } => {
            let delivered = feed.publish(&entity_id, Some(value));
            if delivered == 0 {
                tracing::warn!("Nobody tracks {}", entity_id);
            }
        }
        Command::Show { addr } => {
            if let Some(device) = device(addr) {
                print_device(&device);
            }
        }
    }
}

fn print_device(device: &Device) {
    println!("Address:   {}", device.address());
    println!("Kind:      {}", device.kind());
    println!("UID:       0x{:06X}", device.uid());
    if let Ok(identity) = device.identity() {
        println!("Identity:  {:04X?}", identity);
    }
    match device.kind() {
        DeviceKind::BinarySensor | DeviceKind::Relay => {
            let states: String = device
                .channel_states()
                .iter()
                .map(|&on| if on { '1' } else { '0' })
                .collect();
            println!("Channels:  {}", states);
            if device.kind() == DeviceKind::Relay {
                println!("Timers:    {:04X?}", device.timers());
            }
        }
        DeviceKind::Temperature => match device.temperature() {
            Some(t) => println!("Value:     {:.1}°C", t.get::<degree_celsius>()),
            None => println!("Value:     -"),
        },
    }
    if let Some(entity_id) = device.entity_id() {
        println!("Entity:    {}", entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            "switch 5 0 on".parse::<Command>().unwrap(),
            Command::Switch {
                addr: 5,
                channel: 0,
                on: true
            }
        );
        assert_eq!(
            "timer 0x05 3 off 2.5".parse::<Command>().unwrap(),
            Command::Timer {
                addr: 5,
                channel: 3,
                on: false,
                seconds: 2.5
            }
        );
        assert_eq!(
            "state sensor.boiler 21.5".parse::<Command>().unwrap(),
            Command::State {
                entity_id: "sensor.boiler".into(),
                value: "21.5".into()
            }
        );
        assert_eq!("show 6".parse::<Command>().unwrap(), Command::Show { addr: 6 });
    }

    #[test]
    fn stdin_can_be_turned_off() {
        let args = Args::try_parse_from(["ecto-modbus-slave", "-c", "ecto.yaml", "--no-stdin"])
            .unwrap();
        assert!(args.no_stdin);
        assert_eq!(args.config, PathBuf::from("ecto.yaml"));

        let args = Args::try_parse_from(["ecto-modbus-slave", "--config", "ecto.yaml"]).unwrap();
        assert!(!args.no_stdin);
    }

    #[test]
    fn rejects_garbage() {
        assert!("switch 5 0 maybe".parse::<Command>().is_err());
        assert!("state sensor.boiler".parse::<Command>().is_err());
        assert!("reboot".parse::<Command>().is_err());
        assert!("show 300".parse::<Command>().is_err());
    }
}
