//! `keyenvelope` CLI for provider management and file encryption.

#![warn(clippy::pedantic, clippy::nursery)]

mod config;
mod provider;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keyenvelope::audit::{AuditSink, MemoryAuditLog};
use keyenvelope::derivation::PerUserKeyDerivation;
use keyenvelope::envelope::EnvelopeEncryption;
use keyenvelope::kms::KmsProvider;
use secrecy::{ExposeSecret, SecretVec};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{read_config, secret_from_env, Config};
use crate::provider::DynProvider;

#[derive(Parser)]
#[command(name = "keyenvelope")]
#[command(about = "Envelope encryption and KMS key management", long_about = None)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "keyenvelope.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the configured provider is reachable
    Health,
    /// Show the current KEK identifier and version
    KekInfo,
    /// Rotate the KEK
    Rotate,
    /// Generate a wrapped master secret for per-user key derivation
    ProvisionMaster,
    /// Encrypt a file into a serialized envelope
    Encrypt {
        /// Input file, `-` for stdin
        #[arg(short, long)]
        input: PathBuf,
        /// Output file, stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Encrypt under this user's derived key instead of a fresh envelope
        #[arg(long)]
        user: Option<String>,
    },
    /// Decrypt a serialized envelope or per-user record
    Decrypt {
        /// Input file, `-` for stdin
        #[arg(short, long)]
        input: PathBuf,
        /// Output file, stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Decrypt a record produced with `encrypt --user`
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = read_config(&cli.config)?;

    match cli.command {
        Commands::Health => {
            let provider = provider::build(&config.provider).await?;
            if let Err(e) = provider.initialize().await {
                println!("{}: unhealthy ({e})", provider.name());
                return Ok(ExitCode::FAILURE);
            }
            if provider.health_check().await {
                println!("{}: healthy", provider.name());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{}: unhealthy", provider.name());
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::KekInfo => {
            let provider = provider::connect(&config.provider).await?;
            let meta = provider.kek_metadata().await?;
            println!("provider: {}", provider.name());
            println!("kek id:   {}", meta.id);
            println!("version:  {}", meta.version);
            match provider.per_user_deks() {
                Some(per_user) => println!("per-user: {:?}", per_user.semantics()),
                None => println!("per-user: unsupported"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rotate => {
            let provider = provider::connect(&config.provider).await?;
            let before = provider.kek_metadata().await?;
            if !provider.rotate_key().await {
                bail!("{} provider did not rotate the KEK", provider.name());
            }
            let after = provider.kek_metadata().await?;
            println!("rotated {}: {} -> {}", after.id, before.version, after.version);
            Ok(ExitCode::SUCCESS)
        }
        Commands::ProvisionMaster => {
            let provider = provider::connect(&config.provider).await?;
            let wrapped = PerUserKeyDerivation::provision_master_secret(&provider).await?;
            println!("master_secret = \"{wrapped}\"");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Encrypt { input, output, user } => {
            let plaintext = read_input(&input)?;
            let provider = provider::connect(&config.provider).await?;
            let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());
            let encrypted = match user {
                Some(user) => {
                    let derivation = derivation(&config, provider, audit).await?;
                    derivation.encrypt_for_user(&user, &plaintext)?
                }
                None => {
                    EnvelopeEncryption::new(provider, audit).encrypt_to_string(&plaintext).await?
                }
            };
            write_output(output.as_deref(), encrypted.as_bytes())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Decrypt { input, output, user } => {
            let data = read_input(&input)?;
            let data = String::from_utf8(data).context("input is not a text envelope")?;
            let data = data.trim();
            let provider = provider::connect(&config.provider).await?;
            let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());
            let plaintext = match user {
                Some(user) => {
                    let derivation = derivation(&config, provider, audit).await?;
                    derivation.decrypt_for_user(&user, data)?
                }
                None => {
                    let engine = EnvelopeEncryption::new(provider, audit);
                    let decrypted = engine.decrypt_from_str(data).await?;
                    if decrypted.needs_rotation {
                        tracing::warn!(
                            "envelope was wrapped under an older KEK version; re-encrypt it"
                        );
                    }
                    decrypted.data
                }
            };
            write_output(output.as_deref(), &plaintext)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn derivation(
    config: &Config,
    provider: DynProvider,
    audit: Arc<dyn AuditSink>,
) -> anyhow::Result<PerUserKeyDerivation<DynProvider>> {
    let wrapped = config
        .master_secret
        .as_deref()
        .context("per-user operations need master_secret; run `keyenvelope provision-master`")?;
    let pepper = match &config.pepper_env {
        Some(var) => SecretVec::new(secret_from_env(var)?.expose_secret().as_bytes().to_vec()),
        None => SecretVec::new(Vec::new()),
    };
    let derivation = PerUserKeyDerivation::new(provider, wrapped, pepper, audit);
    derivation.initialize().await?;
    Ok(derivation)
}

fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_output(path: Option<&Path>, data: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => std::fs::write(path, data)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
            Ok(())
        }
    }
}
