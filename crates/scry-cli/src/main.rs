use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::hex_utils::parse_hex_address;

#[derive(Parser)]
#[command(name = "scry")]
#[command(about = "Inspect and drive a live process through scry-core")]
#[command(version)]
struct Cli {
    /// Target process id
    #[arg(long, global = true)]
    pid: Option<u32>,

    /// Target process executable name (used when --pid is absent)
    #[arg(long, global = true, env = "SCRY_PROCESS")]
    process: Option<String>,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "scry.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump raw bytes
    Hexdump {
        #[arg(value_parser = parse_hex_address)]
        address: u64,
        #[arg(default_value_t = 256)]
        size: usize,
        /// Hide the ASCII column
        #[arg(long)]
        no_ascii: bool,
    },
    /// Snapshot a remote dictionary (or hash set with --set)
    Dict {
        #[arg(value_parser = parse_hex_address)]
        address: u64,
        #[arg(long)]
        set: bool,
    },
    /// Read a managed UTF-16 string object
    String {
        #[arg(value_parser = parse_hex_address)]
        address: u64,
    },
    /// Run a function inside the target through the call bridge
    Call {
        #[arg(value_parser = parse_hex_address)]
        function: u64,
        /// Up to four register arguments
        #[arg(value_parser = parse_hex_address, num_args = 0..=4)]
        args: Vec<u64>,
        /// Remove the hook after the call
        #[arg(long)]
        uninstall: bool,
    },
    /// Run the feature scheduler and report gate and session changes until Ctrl+C
    Watch {
        /// Address holding the local entity pointer
        #[arg(long, value_parser = parse_hex_address)]
        entity: Option<u64>,
        /// Offset of the sub handle pointer inside the local entity
        #[arg(long, value_parser = parse_hex_address, default_value = "0")]
        sub_offset: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scry=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = scry_core::load_config_or_default(&cli.config)?;
    let target = commands::Target {
        pid: cli.pid,
        process: cli.process.as_deref(),
    };

    info!("scry {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Hexdump {
            address,
            size,
            no_ascii,
        } => commands::hexdump::run(&target, address, size, !no_ascii),
        Command::Dict { address, set } => commands::dict::run(&target, &config, address, set),
        Command::String { address } => commands::string::run(&target, address),
        Command::Call {
            function,
            args,
            uninstall,
        } => commands::call::run(&target, &config, function, &args, uninstall),
        Command::Watch { entity, sub_offset } => {
            commands::watch::run(&target, &config, entity, sub_offset)
        }
    }
}
