//! ca-daemon: EN 50221 host for DVB Common Interface slots.
//!
//! Opens one worker per configured CA device and, when given a PMT section,
//! asks the module to descramble every stream of that program.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use ci_protocol::PmtSection;
use ci_stack::config::{Config, SlotSection};
use ci_stack::logging;
use ci_stack::transport::DeviceLink;
use ci_stack::{
    LogCallbacks, ResourceRegistry, SlotCommand, SlotHandle, SlotWorker, TransportLayer,
};

/// ca-daemon - EN 50221 host for DVB CI slots
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// CA device to open, overrides the [[slot]] list of the config file
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Slot number on the CA device, sent as the first byte of every frame
    #[arg(short, long)]
    slot: Option<u8>,

    /// File holding one raw PMT section of the program to descramble
    #[arg(short, long)]
    pmt: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

fn load_pmt(path: &PathBuf) -> Result<PmtSection, Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let section = PmtSection::parse(&data)
        .map_err(|e| format!("Invalid PMT section in {}: {}", path.display(), e))?;
    Ok(section)
}

fn slot_name(slot: &SlotSection) -> String {
    format!("{}#{}", slot.device.display(), slot.index)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("ca-daemon.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match Config::load(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        Config::default()
    };

    // Command line takes precedence over the config file
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let slots = match &args.device {
        Some(device) => vec![SlotSection {
            device: device.clone(),
            index: args.slot.unwrap_or(0),
        }],
        None => file_config.slots.clone(),
    };
    if slots.is_empty() {
        error!("No CA slot configured, use --device or a [[slot]] section");
        return Err("no CA slot configured".into());
    }

    let pmt = match &args.pmt {
        Some(path) => Some(load_pmt(path)?),
        None => None,
    };

    let transport_config = file_config.transport_config();
    let app_config = file_config.application_config();
    let registry = Arc::new(ResourceRegistry::standard());

    info!("ca-daemon starting...");
    info!("  Link buffer size: {}", transport_config.link_buffer_size);
    info!("  Poll interval: {:?}", transport_config.poll_interval);
    info!("  Response timeout: {:?}", transport_config.response_timeout);
    info!("  Resources: {}", registry.len());

    let mut handles = Vec::new();
    for slot in &slots {
        let name = slot_name(slot);
        let link = match DeviceLink::open(
            &slot.device,
            slot.index,
            transport_config.link_buffer_size,
        ) {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to open {}: {}", slot.device.display(), e);
                continue;
            }
        };
        let mut transport = TransportLayer::new(transport_config.clone());
        transport.add_slot(Box::new(link));

        let worker = SlotWorker::new(
            name.clone(),
            transport,
            registry.clone(),
            app_config.clone(),
            Box::new(LogCallbacks),
        );
        info!("  Slot: {}", name);
        handles.push(SlotHandle::spawn(worker));
    }
    if handles.is_empty() {
        return Err("no CA slot could be opened".into());
    }

    if let Some(section) = &pmt {
        info!(
            "Descrambling program {} ({} streams)",
            section.program_number,
            section.streams.len()
        );
        for handle in &handles {
            let mut commands = vec![SlotCommand::UpdatePmt(section.clone())];
            commands.extend(section.streams.iter().map(|stream| SlotCommand::SelectStream {
                program_number: section.program_number,
                pid: stream.elementary_pid,
            }));
            for cmd in commands {
                if let Err(e) = handle.send(cmd) {
                    warn!("[{}] {}", handle.name(), e);
                }
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    for handle in handles {
        handle.shutdown().await;
    }

    Ok(())
}
