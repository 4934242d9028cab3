//! PS02 Bridge
//!
//! A headless bridge that connects to one PS02 pressure sensor over USB or
//! BLE and streams its frames as JSON lines, optionally recording raw
//! samples to CSV.

mod cli;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ps_detect::PortScanner;
use ps_protocol::{Frame, Transport};
use ps_session::{RecordingConfig, SessionEngine, StartOutcome, StopOutcome};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command, PortsArgs, ScanArgs, SettingsArgs, StreamArgs};
use settings::Settings;

/// One frame as printed on stdout
#[derive(Serialize)]
struct FrameLine<'a> {
    seq: u8,
    samples: &'a [i16],
}

impl<'a> From<&'a Frame> for FrameLine<'a> {
    fn from(frame: &'a Frame) -> Self {
        Self {
            seq: frame.seq,
            samples: &frame.samples,
        }
    }
}

fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    ["ps_bridge", "ps_protocol", "ps_detect", "ps_session", "ps_sim"]
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the frame feed, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(cli.verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Settings::load();

    match cli.command {
        Command::Stream(args) => stream(args, settings).await,
        Command::Scan(args) => scan(args, settings).await,
        Command::Ports(args) => ports(args, settings),
        Command::Settings(args) => show_settings(args, settings),
    }
}

async fn stream(args: StreamArgs, settings: Settings) -> anyhow::Result<()> {
    let transport: Transport = args.transport.map(Into::into).unwrap_or(settings.transport);

    let mut config = settings.session;
    if let Some(serial) = args.serial {
        config.usb.prefer_serial = Some(serial);
    }
    if let Some(address) = args.address {
        config.ble.prefer_address = Some(address);
    }
    if let Some(prefix) = args.prefix {
        config.ble.name_prefix = prefix;
    }

    let recording = match args.record {
        Some(dir) => RecordingConfig {
            enabled: true,
            directory: Some(dir),
        },
        None => settings.recording,
    };

    let engine = Arc::new(SessionEngine::with_hardware(config));
    engine.configure_recording(recording);
    if let Some(gain) = args.gain {
        engine.set_gain(gain).context("invalid --gain")?;
    }

    info!("Starting PS02 bridge over {}", transport);
    let starter = Arc::clone(&engine);
    let outcome = tokio::task::spawn_blocking(move || starter.start(transport))
        .await?
        .with_context(|| format!("could not start a {} session", transport))?;
    if let StartOutcome::Started(status) = &outcome {
        info!(
            "Streaming from {} at gain {}",
            status.device.as_deref().unwrap_or("unknown device"),
            status.gain
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut printed: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            frame = engine.pop_frame_async(Duration::from_secs(1)) => {
                let Some(frame) = frame else {
                    if !engine.status().reader_alive {
                        warn!("Frame reader is not running");
                    }
                    continue;
                };
                println!("{}", serde_json::to_string(&FrameLine::from(&frame))?);
                printed += 1;
                if args.frames.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
        }
    }

    let status = engine.status();
    info!(
        "Read {} frames ({} malformed, {} dropped from the queue)",
        status.frames_read, status.protocol_errors, status.frames_dropped
    );

    let stopper = Arc::clone(&engine);
    match tokio::task::spawn_blocking(move || stopper.stop()).await?? {
        StopOutcome::Stopped { export: Some(path) } => {
            info!("Recording saved");
            eprintln!("{}", path.display());
        }
        StopOutcome::Pending { export } => {
            warn!("Device teardown still running, waiting for it before exit");
            while engine.status().running {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if let Some(path) = export.filter(|p| p.exists()) {
                info!("Recording saved");
                eprintln!("{}", path.display());
            }
        }
        StopOutcome::Stopped { export: None } | StopOutcome::AlreadyStopped => {}
    }
    Ok(())
}

async fn scan(args: ScanArgs, settings: Settings) -> anyhow::Result<()> {
    let mut config = settings.session;
    if let Some(seconds) = args.seconds {
        config.ble.scan_ms = seconds * 1000;
    }
    if let Some(prefix) = args.prefix {
        config.ble.name_prefix = prefix;
    }

    let engine = SessionEngine::with_hardware(config);
    let report = tokio::task::spawn_blocking(move || engine.list_ble_devices())
        .await?
        .context("BLE scan failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn ports(args: PortsArgs, settings: Settings) -> anyhow::Result<()> {
    let vidpid = args.vidpid.unwrap_or(settings.session.usb.vidpid);
    let ports = PortScanner::new()
        .enumerate_ports()
        .context("could not enumerate serial ports")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        let marker = if port.matches(&vidpid) { "PS02" } else { "-" };
        println!("{:<24} {:<5} {}", port.port, marker, port.hardware_id());
    }
    Ok(())
}

fn show_settings(args: SettingsArgs, settings: Settings) -> anyhow::Result<()> {
    if args.save {
        let path = settings.save().map_err(anyhow::Error::msg)?;
        eprintln!("Saved {}", path.display());
    } else if let Some(path) = Settings::settings_path() {
        eprintln!("{}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
