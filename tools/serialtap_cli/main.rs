// tools/serialtap_cli/main.rs
//
// Command-line front end: list ports, monitor a device, send a message.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use serialtap_lib::io::serial::list_serial_ports;
use serialtap_lib::settings::{self, AppSettings};
use serialtap_lib::{logging, parse_delimiter, ConnectionConfig, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "serialtap")]
#[command(about = "Serial line monitor - frame, watch and talk to serial devices")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to <config dir>/serialtap/settings.toml)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Also write logs to a timestamped file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print every message received from a device until Ctrl-C
    Monitor {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Send one message, optionally waiting for a reply
    Send {
        #[command(flatten)]
        port: PortArgs,

        /// Message to send (the write terminator is appended)
        message: String,

        /// Wait this long for a single reply line (0 = don't wait)
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },
}

#[derive(clap::Args, Debug)]
struct PortArgs {
    /// Device path, e.g. /dev/ttyUSB0 or COM3
    port: Option<String>,

    /// Use a named profile from the settings file
    #[arg(long, short)]
    profile: Option<String>,

    #[arg(long, short)]
    baud: Option<u32>,

    /// Incoming message delimiter (escapes like \r\n or hex like 0x0D0A)
    #[arg(long)]
    delimiter: Option<String>,

    /// Appended to outgoing messages (same syntax as --delimiter)
    #[arg(long)]
    terminator: Option<String>,
}

impl PortArgs {
    /// Profile settings first, then explicit flags on top
    fn connection(&self, settings: &AppSettings) -> Result<ConnectionConfig, String> {
        let mut config = match &self.profile {
            Some(name) => settings
                .find_profile(name)
                .map(|p| p.connection.clone())
                .ok_or_else(|| format!("Unknown profile: {}", name))?,
            None => ConnectionConfig::new(
                self.port
                    .clone()
                    .ok_or("A port or --profile is required")?,
            ),
        };

        if let (Some(_), Some(port)) = (&self.profile, &self.port) {
            config.path = port.clone();
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(text) = &self.delimiter {
            config.read_termination = delimiter_string(text)?;
        }
        if let Some(text) = &self.terminator {
            config.write_termination = delimiter_string(text)?;
        }
        Ok(config)
    }
}

fn delimiter_string(text: &str) -> Result<String, String> {
    let bytes = parse_delimiter(text)?;
    String::from_utf8(bytes).map_err(|_| format!("Delimiter is not valid UTF-8: {}", text))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match cli.settings.clone().map(Ok).unwrap_or_else(settings::settings_path) {
        Ok(path) => settings::load_settings(&path),
        Err(e) => Err(e),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = cli.log_dir.clone().or_else(|| settings.reports_dir.clone());
    if let Err(e) = logging::init_logging(&settings.log_filter, log_dir.as_deref()) {
        eprintln!("warning: {}", e);
    }

    let result = match cli.command {
        Command::List { json } => list(json),
        Command::Monitor { port } => monitor(port.connection(&settings)).await,
        Command::Send {
            port,
            message,
            wait_ms,
        } => send(port.connection(&settings), &message, wait_ms).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn list(json: bool) -> Result<(), String> {
    let ports = list_serial_ports().map_err(|e| e.to_string())?;

    if json {
        let text = serde_json::to_string_pretty(&ports).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let ids = match (port.vendor_id, port.product_id) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => String::new(),
        };
        println!(
            "{:<28} {:<10} {:<10} {}",
            port.identifier,
            port.port_type,
            ids,
            port.product.or(port.manufacturer).unwrap_or_default()
        );
    }
    Ok(())
}

async fn monitor(config: Result<ConnectionConfig, String>) -> Result<(), String> {
    let config = config?;
    let registry = SessionRegistry::serial();
    let session = registry
        .get_or_create(config)
        .await
        .map_err(|e| e.to_string())?;
    let mut messages = session.subscribe();

    eprintln!(
        "Monitoring {} at {} (Ctrl-C to stop)",
        session.identifier(),
        session.config().line_summary()
    );

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            item = messages.next() => match item {
                Some(Ok(line)) => println!("{}", line),
                Some(Err(e)) => break Err(e.to_string()),
                None => break Ok(()),
            },
        }
    };

    registry.shutdown().await;
    result
}

async fn send(
    config: Result<ConnectionConfig, String>,
    message: &str,
    wait_ms: u64,
) -> Result<(), String> {
    let config = config?;
    let identifier = config.path.clone();
    let registry = SessionRegistry::serial();
    let session = registry
        .get_or_create(config)
        .await
        .map_err(|e| e.to_string())?;

    // Register the read before writing so a fast reply is not missed
    let reply = if wait_ms > 0 {
        Some(
            session
                .pending_read(Some(Duration::from_millis(wait_ms)))
                .map_err(|e| e.to_string())?,
        )
    } else {
        None
    };

    let result = async {
        registry
            .dispatch(&identifier, message)
            .await
            .map_err(|e| e.to_string())?;
        session.flush().await.map_err(|e| e.to_string())?;
        if let Some(reply) = reply {
            let line = reply.wait().await.map_err(|e| e.to_string())?;
            println!("{}", line);
        }
        Ok(())
    }
    .await;

    registry.shutdown().await;
    result
}
