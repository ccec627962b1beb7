use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod config;
pub mod decode;
pub mod loopback;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode and validate a captured PDU stream.
    Decode(DecodeArgs),
    /// Run host and controller queue pairs against each other over TCP loopback.
    Loopback(LoopbackArgs),
    /// Show or validate a queue pair configuration.
    Config(ConfigArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Decode(args) => decode::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Config(args) => config::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Capture file holding raw PDU bytes.
    #[arg(required_unless_present = "hex")]
    pub path: Option<PathBuf>,
    /// Hex-encoded PDU bytes instead of a file.
    #[arg(long, conflicts_with = "path")]
    pub hex: Option<String>,
    /// Header digests were negotiated.
    #[arg(long)]
    pub header_digest: bool,
    /// Data digests were negotiated.
    #[arg(long)]
    pub data_digest: bool,
    /// PDU data alignment (dwords minus one).
    #[arg(long, default_value = "0")]
    pub pda: u8,
    /// Largest PDU accepted (e.g. 1m, 256k).
    #[arg(long, value_parser = parse_size)]
    pub max_pdu_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Write commands to issue.
    #[arg(long, default_value = "8")]
    pub writes: usize,
    /// Read commands to issue.
    #[arg(long, default_value = "8")]
    pub reads: usize,
    /// Transfer size per command (e.g. 512, 64k, 1m).
    #[arg(long, default_value = "64k", value_parser = parse_size)]
    pub size: usize,
    /// Enable header and data digests on both ends.
    #[arg(long)]
    pub digests: bool,
    /// Accelerated tags on the host side.
    #[arg(long)]
    pub accelerated_tags: Option<u16>,
    /// Controller completes reads with a SUCCESS-flagged data PDU.
    #[arg(long)]
    pub c2h_success: bool,
    /// Keep issuing rounds until interrupted.
    #[arg(long)]
    pub continuous: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RoleArg {
    Host,
    Controller,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// JSON configuration file; defaults are shown when omitted.
    pub path: Option<PathBuf>,
    /// Role whose defaults to show.
    #[arg(long, value_enum, default_value = "host", conflicts_with = "path")]
    pub role: RoleArg,
    /// Only check the file; print nothing on success.
    #[arg(long, requires = "path")]
    pub validate: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse a byte count with an optional `k`, `m` or `g` suffix (powers of 1024).
pub fn parse_size(input: &str) -> Result<usize, String> {
    let input = input.trim().to_ascii_lowercase();
    if input.is_empty() {
        return Err("size must not be empty".to_string());
    }

    let digits = input.trim_end_matches(['k', 'm', 'g', 'b', 'i']);
    let suffix = &input[digits.len()..];
    let scale: usize = match suffix {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        _ => return Err(format!("unsupported size suffix: {suffix}")),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid size value: {input}"))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size too large: {input}"))
}

pub(crate) fn usage(message: impl Into<String>) -> CliError {
    CliError::new(USAGE, message)
}
