//! `tiervault` CLI: local front end for the `tiervault-core` engines.
//!
//! Classifies secrets, encrypts and decrypts payloads under the configured
//! master key, and evaluates access policies against a request context.
//! Results are written to stdout as JSON; logs go to stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tiervault_core::classifier::{self, ClassificationHints};
use tiervault_core::config::EngineConfig;
use tiervault_core::crypto::MasterKey;
use tiervault_core::encryption::{EncryptedPayload, EncryptionEngine};
use tiervault_core::metadata::{SecretMetadata, SecurityLevel};
use tiervault_core::policy::{AccessContext, AccessPolicy, PolicyEngine};
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";

// ── CLI structure ────────────────────────────────────────────────────

/// tiervault: classify, protect and gate access to secrets.
#[derive(Parser)]
#[command(
    name = "tiervault",
    version,
    about = "tiervault CLI: classify secrets, encrypt payloads, evaluate access policies",
    long_about = None,
    after_help = "Environment variables:\n  \
         TIERVAULT_MASTER_KEY     64 hex chars, required for encrypt/decrypt\n  \
         TIERVAULT_SCRYPT_LOG_N   scrypt cost exponent (default: 14)\n  \
         TIERVAULT_LOG_LEVEL      log filter when RUST_LOG is unset (default: info)\n\n\
         Examples:\n  \
         tiervault classify db/password --value hunter2\n  \
         echo -n hello | tiervault encrypt --key-id app/token --level secret > payload.json\n  \
         tiervault decrypt payload.json"
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh random master key as hex.
    Keygen,
    /// Classify a secret and print its metadata.
    Classify {
        /// Secret name.
        name: String,
        /// Secret value. Read from stdin when omitted.
        #[arg(long)]
        value: Option<String>,
        /// Force a security level instead of inferring one.
        #[arg(long)]
        level: Option<SecurityLevel>,
    },
    /// Encrypt a value and print the payload.
    Encrypt {
        /// Key id the payload is bound to.
        #[arg(long)]
        key_id: String,
        /// Security level; selects the cipher.
        #[arg(long)]
        level: SecurityLevel,
        /// Value to encrypt. Read from stdin when omitted.
        #[arg(long)]
        value: Option<String>,
        /// Associated data, bound by AEAD ciphers only.
        #[arg(long)]
        aad: Option<String>,
    },
    /// Decrypt a payload file (`-` for stdin) and print the plaintext.
    Decrypt {
        payload: PathBuf,
        /// Associated data given at encryption time.
        #[arg(long)]
        aad: Option<String>,
    },
    /// Check a payload file's encryption metadata without decrypting.
    Validate { payload: PathBuf },
    /// Evaluate access to a secret and print the decision.
    Evaluate {
        /// JSON file with one policy or an array of policies.
        #[arg(long)]
        policies: PathBuf,
        /// JSON file with the access context.
        #[arg(long)]
        context: PathBuf,
        /// Secret being accessed.
        #[arg(long)]
        secret_id: String,
        /// JSON file with the secret's metadata.
        #[arg(long, conflicts_with = "value")]
        metadata: Option<PathBuf>,
        /// Classify this value (under `secret_id`) instead of reading metadata.
        #[arg(long)]
        value: Option<String>,
    },
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => return fail(&anyhow::Error::new(e).context("invalid configuration")),
    };
    init_logging(&config.log_level, cli.json_logs);

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn fail(e: &anyhow::Error) -> ExitCode {
    eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
    ExitCode::FAILURE
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: &EngineConfig, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Keygen => {
            println!("{}", hex::encode(MasterKey::generate().as_bytes()));
            Ok(())
        }
        Commands::Classify { name, value, level } => cmd_classify(&name, value, level),
        Commands::Encrypt {
            key_id,
            level,
            value,
            aad,
        } => cmd_encrypt(config, &key_id, level, value, aad.as_deref()).await,
        Commands::Decrypt { payload, aad } => cmd_decrypt(config, &payload, aad.as_deref()).await,
        Commands::Validate { payload } => cmd_validate(&payload),
        Commands::Evaluate {
            policies,
            context,
            secret_id,
            metadata,
            value,
        } => cmd_evaluate(&policies, &context, &secret_id, metadata.as_deref(), value).await,
    }
}

// ── Commands ─────────────────────────────────────────────────────────

fn cmd_classify(name: &str, value: Option<String>, level: Option<SecurityLevel>) -> Result<()> {
    let value = value_or_stdin(value)?;
    let hints = ClassificationHints {
        security_level: level,
        ..ClassificationHints::default()
    };
    let metadata = classifier::classify(name, &value, Some(&hints));
    print_json(&metadata)
}

async fn cmd_encrypt(
    config: &EngineConfig,
    key_id: &str,
    level: SecurityLevel,
    value: Option<String>,
    aad: Option<&str>,
) -> Result<()> {
    let engine = engine(config)?;
    let value = value_or_stdin(value)?;
    let payload = engine
        .encrypt(value.as_bytes(), key_id, level, aad.map(str::as_bytes))
        .await
        .context("encryption failed")?;
    print_json(&payload)
}

async fn cmd_decrypt(config: &EngineConfig, path: &Path, aad: Option<&str>) -> Result<()> {
    let engine = engine(config)?;
    let payload: EncryptedPayload = read_json(path)?;
    let plaintext = engine
        .decrypt(&payload.encrypted, &payload.metadata, aad.map(str::as_bytes))
        .await
        .context("decryption failed")?;
    let text = String::from_utf8(plaintext).context("plaintext is not valid UTF-8")?;
    println!("{text}");
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let payload: EncryptedPayload = read_json(path)?;
    payload
        .metadata
        .validate()
        .context("payload metadata is invalid")?;
    println!("valid");
    Ok(())
}

async fn cmd_evaluate(
    policies: &Path,
    context: &Path,
    secret_id: &str,
    metadata: Option<&Path>,
    value: Option<String>,
) -> Result<()> {
    let engine = PolicyEngine::default();
    for policy in read_policies(policies)? {
        let id = policy.id.clone();
        engine
            .add_policy(policy)
            .await
            .with_context(|| format!("policy '{id}' rejected"))?;
    }

    let context: AccessContext = read_json(context)?;
    let metadata: SecretMetadata = match (metadata, value) {
        (Some(path), _) => read_json(path)?,
        (None, Some(value)) => classifier::classify(secret_id, &value, None),
        (None, None) => bail!("either --metadata or --value is required"),
    };

    let decision = engine.evaluate_access(secret_id, &metadata, &context).await;
    debug!(granted = decision.granted, "decision ready");
    print_json(&decision)
}

// ── Helpers ──────────────────────────────────────────────────────────

fn engine(config: &EngineConfig) -> Result<EncryptionEngine> {
    if config.master_key.is_none() {
        bail!("TIERVAULT_MASTER_KEY must be set (generate one with `tiervault keygen`)");
    }
    Ok(config.build_encryption_engine())
}

fn value_or_stdin(value: Option<String>) -> Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read value from stdin")?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_owned())
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = read_input(path)?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_policies(path: &Path) -> Result<Vec<AccessPolicy>> {
    let body = read_input(path)?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let policies = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|p: AccessPolicy| vec![p])
    };
    policies.with_context(|| format!("{} is not a policy document", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to format JSON")?;
    println!("{out}");
    Ok(())
}
