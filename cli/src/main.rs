// uwbpair: UWB pairing command-line tools
//
// Inspect pairing records, manage the pairing configuration and work with
// signed provisioning scripts.

mod config;
mod record;
mod script;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use record::RecordKind;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use uwb_pairing_core::session::RoleProfile;
use uwb_pairing_core::{init_logging, LoggingConfig, PairingConfig};

#[derive(Parser)]
#[command(name = "uwbpair")]
#[command(about = "UWB secure ranging pairing tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or encode pairing records
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Manage the pairing configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Sign, verify and dry-run provisioning scripts
    Script {
        #[command(subcommand)]
        action: ScriptAction,
    },
    /// Show the built-in role profiles
    Profiles,
}

#[derive(Subcommand)]
enum RecordAction {
    /// Decode TLV hex into JSON
    Inspect {
        #[arg(value_enum)]
        kind: RecordKind,
        hex: String,
    },
    /// Encode a JSON record file into TLV hex
    Encode {
        #[arg(value_enum)]
        kind: RecordKind,
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration file
    Validate,
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Subcommand)]
enum ScriptAction {
    /// Generate a script signing key
    Keygen {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Sign an unsigned script
    Sign {
        #[arg(short, long)]
        key: PathBuf,
        script: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Verify a signed script against trusted public keys
    Verify {
        script: PathBuf,
        #[arg(short, long = "trust", required = true)]
        trusted: Vec<String>,
    },
    /// Verify, then run the script against an in-memory secure element
    DryRun {
        script: PathBuf,
        #[arg(short, long = "trust", required = true)]
        trusted: Vec<String>,
    },
}

/// Installs logging; the guard keeps the file writer alive
fn setup_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let Some(file) = &logging.file else {
        init_logging(logging);
        return Ok(None);
    };

    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = file.file_name().context("Log file path has no file name")?;
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false);
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::config_file(cli.config.as_deref())?;
    let (pairing, load_error) = config::load_or_default(&config_path);
    let _guard = setup_logging(&pairing.logging)?;
    tracing::debug!(config = %config_path.display(), "uwbpair starting");
    if let Some(e) = load_error {
        tracing::warn!(error = %format!("{e:#}"), "Using default configuration");
        eprintln!("{} {:#} (using defaults)", "warning:".yellow().bold(), e);
    }

    match cli.command {
        Commands::Record { action } => cmd_record(action),
        Commands::Config { action } => cmd_config(action, &config_path),
        Commands::Script { action } => cmd_script(action).await,
        Commands::Profiles => cmd_profiles(),
    }
}

fn cmd_record(action: RecordAction) -> Result<()> {
    match action {
        RecordAction::Inspect { kind, hex } => {
            println!("{}", record::inspect(kind, &hex)?);
        }
        RecordAction::Encode { kind, file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}", record::encode(kind, &json)?);
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            config::save(&PairingConfig::default(), path)?;
            println!("{} Configuration written", "✓".green());
            println!("  {}", path.display().to_string().bright_cyan());
        }
        ConfigAction::Validate => {
            if !path.exists() {
                anyhow::bail!("No config at {}", path.display());
            }
            let loaded = config::load(path)?;
            if RoleProfile::by_name(&loaded.session.profile).is_none() {
                anyhow::bail!("Unknown role profile: {}", loaded.session.profile);
            }
            println!("{} {} is valid", "✓".green(), path.display());
        }
        ConfigAction::Set { key, value } => {
            let mut current = config::load(path)?;
            config::set(&mut current, &key, &value)?;
            config::save(&current, path)?;
            println!("{} {} = {}", "✓".green(), key, value.bright_cyan());
        }
        ConfigAction::Get { key } => {
            let current = config::load(path)?;
            match config::get(&current, &key) {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::List => {
            let current = config::load(path)?;
            println!("{}", "Configuration".bold());
            for (key, value) in config::list(&current) {
                println!("  {:<24} {}", key, value.bright_cyan());
            }
        }
    }
    Ok(())
}

async fn cmd_script(action: ScriptAction) -> Result<()> {
    match action {
        ScriptAction::Keygen { out } => {
            let public_key = script::keygen(&out)?;
            println!("{} Signing key written to {}", "✓".green(), out.display());
            println!("  Public Key: {}", public_key.bright_yellow());
            println!();
            println!(
                "{}",
                "Keep the key file private; share only the public key.".bright_red()
            );
        }
        ScriptAction::Sign { key, script: path, out } => {
            let signed = script::sign(&key, &path)?;
            match out {
                Some(out) => {
                    std::fs::write(&out, signed)
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    println!("{} Signed script written to {}", "✓".green(), out.display());
                }
                None => println!("{}", signed),
            }
        }
        ScriptAction::Verify { script: path, trusted } => {
            let verified = script::verify(&path, &trusted)?;
            println!("{} Signature valid", "✓".green());
            script::print_summary(&verified)?;
        }
        ScriptAction::DryRun { script: path, trusted } => {
            let verified = script::verify(&path, &trusted)?;
            script::print_summary(&verified)?;
            println!();
            println!("{}", "Dry run".bold());
            let outcomes = script::dry_run(&verified).await?;
            println!();
            println!("{} {} ADF operation(s)", "✓".green(), outcomes.len());
        }
    }
    Ok(())
}

fn cmd_profiles() -> Result<()> {
    println!("{}", "Role Profiles".bold());
    for profile in [RoleProfile::pacs_controller(), RoleProfile::pacs_controlee()] {
        println!();
        println!("  {}", profile.name.bright_cyan());
        println!("    UWB role:       {:?}", profile.uwb_role);
        println!("    Secure role:    {:?}", profile.secure_role);
        println!("    Discovery:      {:?}", profile.discovery);
        println!("    ADF OID:        {}", hex::encode(&profile.adf.oid));
        println!(
            "    Capability TLV: {}",
            hex::encode(profile.capability.to_bytes()).dimmed()
        );
    }
    Ok(())
}
