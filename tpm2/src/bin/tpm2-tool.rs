// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 housekeeping CLI

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tpm2::{TpmAlgId, TpmContext, TpmHt, TpmlPcrSelection, TransportConfig};

/// Talk to a TPM 2.0 device
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device path, or `unix:<path>` for a socket; auto-detected if unset
    #[arg(long, env = "TPM_DEVICE")]
    device: Option<String>,

    /// Maximum accepted response size in bytes
    #[arg(long, default_value_t = TransportConfig::default().max_response_size)]
    max_response_size: usize,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random bytes with the TPM RNG
    Random(RandomArgs),
    /// Read PCR values
    PcrRead(PcrReadArgs),
    /// Show the TPM clock
    Clock,
    /// List loaded handles
    Handles(HandlesArgs),
    /// Flush every transient object
    FlushAll,
    /// Print the public area and name of a loaded object
    ReadPublic(ReadPublicArgs),
}

#[derive(Parser)]
struct RandomArgs {
    /// number of bytes to generate
    #[arg(short = 'n', long, default_value_t = 32)]
    bytes: usize,

    /// write raw bytes instead of hex
    #[arg(long)]
    raw: bool,
}

#[derive(Parser)]
struct PcrReadArgs {
    /// hash bank, e.g. sha1 or sha256
    #[arg(long, default_value = "sha256")]
    bank: String,

    /// PCR indices, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0,1,2,3,4,5,6,7")]
    pcrs: Vec<u32>,
}

#[derive(Parser)]
struct HandlesArgs {
    /// list persistent handles instead of transient ones
    #[arg(long)]
    persistent: bool,
}

#[derive(Parser)]
struct ReadPublicArgs {
    /// object handle, hex with or without 0x
    handle: String,
}

fn parse_handle(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid handle {s}"))
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(io::stderr).init();
    }

    let cli = Cli::parse();
    let mut ctx = TpmContext::new(cli.device.as_deref()).context("failed to open TPM")?;
    ctx.device_mut()
        .set_max_response_size(cli.max_response_size)?;
    info!("using TPM device {}", ctx.device_path());

    match cli.command {
        Commands::Random(args) => {
            let data = ctx.get_random(args.bytes)?;
            let mut stdout = io::stdout();
            if args.raw {
                stdout.write_all(&data)?;
            } else {
                writeln!(stdout, "{}", hex::encode(data))?;
            }
        }
        Commands::PcrRead(args) => {
            let bank = TpmAlgId::from_name(&args.bank)
                .with_context(|| format!("unknown hash bank {}", args.bank))?;
            let selection = TpmlPcrSelection::single(bank, &args.pcrs);
            for (index, value) in ctx.pcr_read(&selection)? {
                println!("{}:{index:>2}: {}", bank.name(), hex::encode(value));
            }
        }
        Commands::Clock => {
            let time = ctx.read_clock()?;
            println!("time:          {}", time.time);
            println!("clock:         {}", time.clock_info.clock);
            println!("reset count:   {}", time.clock_info.reset_count);
            println!("restart count: {}", time.clock_info.restart_count);
            println!("safe:          {}", time.clock_info.safe);
        }
        Commands::Handles(args) => {
            let handle_type = if args.persistent {
                TpmHt::Persistent
            } else {
                TpmHt::Transient
            };
            for handle in ctx.list_handles(handle_type)? {
                println!("0x{handle:08x}");
            }
        }
        Commands::FlushAll => {
            let flushed = ctx.flush_all()?;
            info!("flushed {flushed} transient handles");
        }
        Commands::ReadPublic(args) => {
            let handle = parse_handle(&args.handle)?;
            let out = ctx.read_public(handle)?;
            println!("public: {}", hex::encode(out.public));
            println!("name:   {}", hex::encode(out.name));
        }
    }
    Ok(())
}
