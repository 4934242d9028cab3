use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ps_detect::VidPid;
use ps_protocol::Transport;

#[derive(Parser)]
#[command(
    name = "ps-bridge",
    version,
    about = "Stream PS02 pressure sensor frames over USB or BLE",
    long_about = "Connects to a PS02 sensor, prints each frame as a JSON line on stdout and\n\
                  optionally records raw samples to CSV. Logs go to stderr; set RUST_LOG to tune."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stream frames from a sensor until interrupted
    Stream(StreamArgs),
    /// List nearby BLE devices
    Scan(ScanArgs),
    /// List serial ports and mark PS02 sensors
    Ports(PortsArgs),
    /// Show the settings file location and contents
    Settings(SettingsArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Usb,
    Ble,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Usb => Transport::Usb,
            TransportArg::Ble => Transport::Ble,
        }
    }
}

#[derive(Args)]
pub struct StreamArgs {
    /// Transport to connect over (defaults to the saved setting)
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Gain 0-15 to configure before streaming
    #[arg(short, long)]
    pub gain: Option<i64>,

    /// Record raw samples and export them to this directory on exit
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    pub frames: Option<u64>,

    /// Prefer the USB sensor with this serial number
    #[arg(long)]
    pub serial: Option<String>,

    /// Connect only to the BLE sensor with this address
    #[arg(long)]
    pub address: Option<String>,

    /// BLE name prefix to accept
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct ScanArgs {
    /// Scan duration in seconds
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Name prefix to flag in the listing
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct PortsArgs {
    /// Vendor/product identifier to match, e.g. 1915:521A
    #[arg(long)]
    pub vidpid: Option<VidPid>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct SettingsArgs {
    /// Write the current settings (defaults if none exist) back to disk
    #[arg(long)]
    pub save: bool,
}
