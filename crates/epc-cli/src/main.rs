//! epc - command-line tool for EPC devices
//!
//! Builds and converts parameter files, talks to a device over CAN and
//! decodes pulled datalogs.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::{DatalogArgs, MetaArg, PullArgs};
use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

const DEFAULT_FILTER: &str = "epc=info,epc_nv=info,epc_ccp=info";
const VERBOSE_FILTER: &str = "epc=debug,epc_nv=debug,epc_ccp=debug,epc_bus=debug";

#[derive(Parser)]
#[command(name = "epc")]
#[command(author, version, about = "EPC parameter, device and datalog tool")]
#[command(propagate_version = true)]
struct Cli {
    /// CAN interface for commands that talk to a device
    #[arg(short, long, global = true, env = "EPC_INTERFACE")]
    interface: Option<String>,

    /// Device manifest (JSON)
    #[arg(short, long, global = true, env = "EPC_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, env = "EPC_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build value sets from overlay recipes
    Valueset {
        /// Recipe configuration (JSON or TOML)
        #[arg(long)]
        configuration: PathBuf,
    },

    /// Convert between .epp and .pmvs parameter files
    Convert {
        /// Input file (.epp or .pmvs)
        input: PathBuf,

        /// Output file (.epp or .pmvs)
        output: PathBuf,
    },

    /// List the parameters of a device
    Params,

    /// Read parameter slot(s) from the device
    Read {
        /// Parameter name or `;`-separated path
        name: String,

        /// Slot(s) to read; every supported slot when omitted
        #[arg(long, value_enum)]
        meta: Vec<MetaArg>,
    },

    /// Write a parameter slot on the device
    Write {
        /// Parameter name or `;`-separated path
        name: String,

        /// Physical value or enumeration label
        value: String,

        /// Slot to write
        #[arg(long, value_enum, default_value = "value")]
        meta: MetaArg,

        /// Save to non-volatile memory afterwards
        #[arg(long)]
        save: bool,
    },

    /// Save the device's parameters to non-volatile memory
    Save,

    /// Upload device memory over CCP
    Pull {
        /// Start address in addressable units (e.g. 0x1000)
        #[arg(long, value_parser = commands::parse_address)]
        address: u32,

        /// Number of octets to upload
        #[arg(long)]
        length: usize,

        /// Address extension
        #[arg(long, default_value = "0")]
        extension: u8,

        /// Output file
        #[arg(long)]
        file: PathBuf,

        /// Write a hex dump instead of raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Decode a pulled datalog into CSV
    Datalog {
        /// Raw datalog file
        log: PathBuf,

        /// Variables file (YAML or JSON)
        #[arg(long)]
        variables: PathBuf,

        /// CSV output; defaults to the log path with a .csv extension
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Bits per addressable unit; taken from the manifest when omitted
        #[arg(long)]
        bits_per_byte: Option<u32>,

        /// Software hash (prefix) every block must carry
        #[arg(long)]
        expected_hash: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(
        cli.interface.as_deref(),
        cli.manifest.as_deref(),
        cli.no_color,
    );

    let ctx = OutputContext::new(cli.output, merged.no_color, cli.quiet);

    match &cli.command {
        Commands::Valueset { configuration } => {
            commands::valueset(configuration, &ctx)?;
        }

        Commands::Convert { input, output } => {
            commands::convert(merged.require_manifest()?, input, output, &ctx)?;
        }

        Commands::Params => {
            commands::params(merged.require_manifest()?, &ctx)?;
        }

        Commands::Read { name, meta } => {
            let device =
                commands::open_device(merged.require_manifest()?, merged.require_interface()?)?;
            commands::read(&device, name, meta, &ctx).await?;
        }

        Commands::Write {
            name,
            value,
            meta,
            save,
        } => {
            let device =
                commands::open_device(merged.require_manifest()?, merged.require_interface()?)?;
            commands::write(&device, name, value, *meta, *save, &ctx).await?;
        }

        Commands::Save => {
            let device =
                commands::open_device(merged.require_manifest()?, merged.require_interface()?)?;
            commands::save_to_nv(&device, &ctx).await?;
        }

        Commands::Pull {
            address,
            length,
            extension,
            file,
            hex,
        } => {
            commands::pull(
                PullArgs {
                    manifest: merged.require_manifest()?,
                    interface: merged.require_interface()?,
                    extension: *extension,
                    address: *address,
                    length: *length,
                    file,
                    hex: *hex,
                },
                &ctx,
            )
            .await?;
        }

        Commands::Datalog {
            log,
            variables,
            csv,
            bits_per_byte,
            expected_hash,
        } => {
            let bits_per_byte = match (bits_per_byte, &merged.manifest) {
                (Some(bits), _) => *bits,
                (None, Some(manifest)) => epc_nv::DeviceManifest::from_file(manifest)?
                    .bits_per_byte
                    .unwrap_or(8),
                (None, None) => 8,
            };
            commands::datalog(
                DatalogArgs {
                    log,
                    variables,
                    csv: csv.as_deref(),
                    bits_per_byte,
                    expected_hash: expected_hash.clone(),
                },
                &ctx,
            )?;
        }
    }

    Ok(())
}
