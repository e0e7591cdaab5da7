//! opcstream CLI
//!
//! Encode a file into a transformed part, decode it back, or inspect an
//! encoded part.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use opcstream_rs::{
    key_from_hex, Aes256BlockCipher, CompressionMethod, FormatVersion, PartStream,
    PartStreamBuilder, StreamConfig, StreamContext, VersionPair, LENGTH_PREFIX_SIZE,
};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "opcstream")]
#[command(about = "Encode, decode and inspect transformed package parts")]
struct Cli {
    /// TOML stream configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write INPUT through the stream stack into OUTPUT
    Encode {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Read INPUT through the stream stack into OUTPUT
    Decode {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Print what can be learned about an encoded part as JSON
    Inspect {
        input: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
    },
}

#[derive(Args, Debug)]
struct StackArgs {
    /// Compression codec (deflate, zstd, lz4)
    #[arg(long)]
    compress: Option<CompressionMethod>,

    /// File holding a 256-bit key as hex
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Feature id of the format version header
    #[arg(long)]
    feature_id: Option<String>,

    /// Code version (major.minor) paired with --feature-id
    #[arg(long = "format-version", default_value = "1.0")]
    format_version: VersionPair,
}

impl StackArgs {
    fn builder(&self, ctx: &StreamContext, with_version: bool) -> Result<PartStreamBuilder> {
        let mut builder = PartStreamBuilder::new(ctx);

        if let Some(path) = &self.key_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            let key = key_from_hex(&text)?;
            builder = builder.encrypted(Arc::new(Aes256BlockCipher::new(&key)));
        }

        if let Some(method) = self.compress {
            builder = builder.compressed_with(method);
        }

        if with_version {
            if let Some(feature_id) = &self.feature_id {
                builder =
                    builder.versioned(FormatVersion::new(feature_id.clone(), self.format_version));
            }
        }
        Ok(builder)
    }
}

#[derive(Serialize, Debug)]
struct Inspection {
    path: PathBuf,
    physical_length: u64,
    /// Plaintext length recorded in the cleartext prefix of an encrypted part
    #[serde(skip_serializing_if = "Option::is_none")]
    encrypted_length_prefix: Option<u64>,
    decoded_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<FormatVersion>,
}

fn load_context(path: Option<&Path>) -> Result<StreamContext> {
    let config = match path {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StreamConfig::default(),
    };
    Ok(StreamContext::new(config))
}

fn encode(input: &Path, output: &Path, stack: &StackArgs, ctx: &StreamContext) -> Result<()> {
    let mut source =
        File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let raw = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;

    let mut part = stack.builder(ctx, true)?.create(raw)?;
    let copied = io::copy(&mut source, &mut part)?;
    part.close()?;

    info!(bytes = copied, output = %output.display(), "encoded part");
    Ok(())
}

fn decode(input: &Path, output: &Path, stack: &StackArgs, ctx: &StreamContext) -> Result<()> {
    let raw = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let mut sink =
        File::create(output).with_context(|| format!("creating {}", output.display()))?;

    let mut part = stack.builder(ctx, true)?.open(raw)?;
    let copied = io::copy(&mut part, &mut sink)?;
    part.close()?;

    info!(bytes = copied, output = %output.display(), "decoded part");
    Ok(())
}

fn inspect(input: &Path, stack: &StackArgs, ctx: &StreamContext) -> Result<Inspection> {
    let mut raw = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let physical_length = raw.length()?;

    let encrypted_length_prefix = if stack.key_file.is_some() && physical_length > 0 {
        if physical_length < LENGTH_PREFIX_SIZE {
            bail!("{} is too short to hold a length prefix", input.display());
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
        raw.read_exact(&mut prefix)?;
        raw.seek(SeekFrom::Start(0))?;
        Some(u64::from_le_bytes(prefix))
    } else {
        None
    };

    // Parse the header ourselves so a feature id mismatch still reports it
    let mut part = stack.builder(ctx, false)?.open(raw)?;
    let mut decoded_length = part.length()?;
    let version = if stack.feature_id.is_some() && decoded_length > 0 {
        part.seek(SeekFrom::Start(0))?;
        let version = FormatVersion::read_from(&mut part)?;
        decoded_length -= version.byte_len().min(decoded_length);
        Some(version)
    } else {
        None
    };
    part.close()?;

    Ok(Inspection {
        path: input.to_path_buf(),
        physical_length,
        encrypted_length_prefix,
        decoded_length,
        version,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = load_context(cli.config.as_deref())?;

    match &cli.command {
        Command::Encode {
            input,
            output,
            stack,
        } => encode(input, output, stack, &ctx),
        Command::Decode {
            input,
            output,
            stack,
        } => decode(input, output, stack, &ctx),
        Command::Inspect { input, stack } => {
            let report = inspect(input, stack, &ctx)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
