// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Request, issue and decode TPM-bound program certificates

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fs_err as fs;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::de::DeserializeOwned;
use tracing::info;

use tpm2::{tpm_rh, HierarchyAuth, TpmAlgId, TpmContext, TpmHt};
use tpm_attest::{
    client_decode_server_response, construct_client_request, construct_server_response,
    generate_hw_cert, generate_self_signed_policy_cert, ClientConfig, PcrSelection,
    PolicyAuthority, ProgramCertRequest, ProgramCertResponse, SigningInstructions,
    DEFAULT_EK_HANDLE, DEFAULT_QUOTE_KEY_HANDLE,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a quote key and make it persistent
    Provision(ProvisionArgs),
    /// Sign the TPM's endorsement key with the policy key (test deployments)
    Endorse(EndorseArgs),
    /// Quote a fresh program key and write a certificate request
    Request(RequestArgs),
    /// Verify a request and issue the program certificate
    Issue(IssueArgs),
    /// Recover the program certificate from a response
    Decode(DecodeArgs),
    /// Create a self-signed policy certificate and key
    SelfSign(SelfSignArgs),
}

#[derive(Args)]
struct DeviceArgs {
    /// TPM device path, or `unix:<path>` for a socket; auto-detected if unset
    #[arg(long, env = "TPM_DEVICE")]
    device: Option<String>,
}

#[derive(Args)]
struct PolicyArgs {
    /// policy certificate (PEM)
    #[arg(long, env = "POLICY_CERT")]
    policy_cert: PathBuf,

    /// policy private key (PEM)
    #[arg(long, env = "POLICY_KEY")]
    policy_key: PathBuf,
}

#[derive(Args)]
struct ClientArgs {
    /// client configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    program_name: Option<String>,

    /// PCR selection as `bank:1,2,3`
    #[arg(long)]
    pcrs: Option<String>,

    /// quote key handle
    #[arg(long, default_value_t = format!("0x{DEFAULT_QUOTE_KEY_HANDLE:08x}"))]
    quote_handle: String,
}

#[derive(Args)]
struct ProvisionArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// owner hierarchy password, hex
    #[arg(long, default_value = "")]
    owner_password: String,

    /// persistent handle for the quote key
    #[arg(long, default_value_t = format!("0x{DEFAULT_QUOTE_KEY_HANDLE:08x}"))]
    persistent: String,

    /// quote signature hash
    #[arg(long, default_value = "sha256")]
    hash: String,
}

#[derive(Args)]
struct EndorseArgs {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    /// endorsement key handle
    #[arg(long, default_value_t = format!("0x{DEFAULT_EK_HANDLE:08x}"))]
    ek_handle: String,

    /// output endorsement certificate (DER)
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct RequestArgs {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    client: ClientArgs,

    /// endorsement certificate (DER)
    #[arg(long)]
    ek_cert: PathBuf,

    /// output request (JSON)
    #[arg(long)]
    out: PathBuf,

    /// output program private key (PKCS#8 PEM)
    #[arg(long)]
    key_out: PathBuf,
}

#[derive(Args)]
struct IssueArgs {
    #[command(flatten)]
    policy: PolicyArgs,

    /// signing instructions (JSON); defaults apply if unset
    #[arg(long)]
    instructions: Option<PathBuf>,

    /// certificate request (JSON)
    #[arg(long)]
    request: PathBuf,

    /// output response (JSON)
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct DecodeArgs {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    client: ClientArgs,

    /// endorsement key handle
    #[arg(long, default_value_t = format!("0x{DEFAULT_EK_HANDLE:08x}"))]
    ek_handle: String,

    /// server response (JSON)
    #[arg(long)]
    response: PathBuf,

    /// output certificate (DER)
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct SelfSignArgs {
    /// signing instructions (JSON); defaults apply if unset
    #[arg(long)]
    instructions: Option<PathBuf>,

    #[arg(long)]
    cert_out: PathBuf,

    #[arg(long)]
    key_out: PathBuf,
}

fn parse_handle(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid handle {s}"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn instructions(path: Option<&Path>) -> Result<SigningInstructions> {
    match path {
        Some(path) => read_json(path),
        None => Ok(SigningInstructions::default()),
    }
}

fn open_tpm(args: &DeviceArgs) -> Result<TpmContext> {
    let ctx = TpmContext::new(args.device.as_deref()).context("failed to open TPM")?;
    info!("using TPM device {}", ctx.device_path());
    Ok(ctx)
}

impl ClientArgs {
    fn config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => read_json(path)?,
            None => ClientConfig::default(),
        };
        if let Some(name) = &self.program_name {
            config.program_name = name.clone();
        }
        if let Some(pcrs) = &self.pcrs {
            config.pcr_selection = PcrSelection::parse_arg(pcrs)
                .with_context(|| format!("invalid PCR selection {pcrs}"))?;
        }
        Ok(config)
    }
}

fn provision(args: ProvisionArgs) -> Result<()> {
    let mut ctx = open_tpm(&args.device)?;
    let persistent = parse_handle(&args.persistent)?;
    let hash = TpmAlgId::from_name(&args.hash)
        .with_context(|| format!("unknown hash {}", args.hash))?;

    if ctx.list_handles(TpmHt::Persistent)?.contains(&persistent) {
        info!("evicting existing object at 0x{persistent:08x}");
        ctx.evict_control(persistent, persistent, &args.owner_password)?;
    }
    let auth = HierarchyAuth {
        owner: args.owner_password.clone(),
        ..Default::default()
    };
    let hierarchy = ctx.create_key_hierarchy(&auth, hash, false)?;
    ctx.evict_control(hierarchy.quote_handle, persistent, &args.owner_password)?;
    ctx.flush_context(hierarchy.quote_handle)?;
    ctx.flush_context(hierarchy.primary_handle)?;
    info!(
        "quote key persisted at 0x{persistent:08x} under hierarchy 0x{:08x}",
        tpm_rh::OWNER
    );
    println!("name: {}", hex::encode(hierarchy.quote_name));
    Ok(())
}

fn endorse(args: EndorseArgs) -> Result<()> {
    let authority = PolicyAuthority::load(&args.policy.policy_cert, &args.policy.policy_key)?;
    let mut ctx = open_tpm(&args.device)?;
    let ek_handle = parse_handle(&args.ek_handle)?;
    let public = ctx.read_public(ek_handle)?;
    let template = tpm2::Tpm2bPublic {
        public_area: public.public,
    }
    .decode()?;
    let ek_public = tpm_qvl::public_key_from_tpm(&template)?;
    let der = generate_hw_cert(&authority, &ek_public)?;
    fs::write(&args.out, der)?;
    Ok(())
}

fn request(args: RequestArgs) -> Result<()> {
    let config = args.client.config()?;
    let quote_handle = parse_handle(&args.client.quote_handle)?;
    let ek_cert = fs::read(&args.ek_cert)?;
    let mut ctx = open_tpm(&args.device)?;

    let (request, program_key) = construct_client_request(&mut ctx, quote_handle, &ek_cert, &config)?;
    let key_pem = program_key
        .private()?
        .to_pkcs8_pem(LineEnding::LF)
        .context("failed to encode program key")?;
    write_json(&args.out, &request)?;
    fs::write(&args.key_out, key_pem.as_bytes())?;
    Ok(())
}

fn issue(args: IssueArgs) -> Result<()> {
    let authority = PolicyAuthority::load(&args.policy.policy_cert, &args.policy.policy_key)?;
    let instructions = instructions(args.instructions.as_deref())?;
    let request: ProgramCertRequest = read_json(&args.request)?;
    let issuance = construct_server_response(&authority, &instructions, &request)?;
    write_json(&args.out, &issuance.response)
}

fn decode(args: DecodeArgs) -> Result<()> {
    let config = args.client.config()?;
    let quote_handle = parse_handle(&args.client.quote_handle)?;
    let ek_handle = parse_handle(&args.ek_handle)?;
    let response: ProgramCertResponse = read_json(&args.response)?;
    let mut ctx = open_tpm(&args.device)?;

    let cert = client_decode_server_response(&mut ctx, quote_handle, ek_handle, &config, &response)?;
    fs::write(&args.out, cert)?;
    Ok(())
}

fn self_sign(args: SelfSignArgs) -> Result<()> {
    let instructions = instructions(args.instructions.as_deref())?;
    let authority = generate_self_signed_policy_cert(&instructions)?;
    fs::write(&args.cert_out, authority.cert_pem())?;
    fs::write(&args.key_out, authority.key_pem())?;
    Ok(())
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(io::stderr).init();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Provision(args) => provision(args),
        Commands::Endorse(args) => endorse(args),
        Commands::Request(args) => request(args),
        Commands::Issue(args) => issue(args),
        Commands::Decode(args) => decode(args),
        Commands::SelfSign(args) => self_sign(args),
    }
}
