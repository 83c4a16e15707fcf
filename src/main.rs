use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use pqvault::audit::TracingAuditSink;
use pqvault::config::CoreConfig;
use pqvault::pq::{ML_DSA_65, ML_KEM_768};
use pqvault::recovery::{combine, split, Share, ShareFile};
use pqvault::storage::MemoryStore;
use pqvault::{Result, VaultCore, VaultError};

const PASSPHRASE_ENV: &str = "PQVAULT_PASSPHRASE";

#[derive(Parser)]
#[command(name = "pqvault")]
#[command(about = "Post-quantum vault key management and threshold recovery")]
#[command(version)]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Self-test the post-quantum primitives and print the capability report
    Probe,
    /// Print algorithm parameters
    Algorithms,
    /// Split a hex secret into Shamir shares
    Split {
        #[arg(long)]
        secret: String,
        #[arg(long, short = 'n')]
        shares: usize,
        #[arg(long, short = 't')]
        threshold: u8,
        /// Write passphrase-protected share files here instead of printing hex
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Reconstruct a secret from hex shares or share files
    Combine {
        #[arg(long = "share")]
        shares: Vec<String>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };

    match cli.command {
        Commands::Probe => {
            let core = VaultCore::new(config, Arc::new(MemoryStore::new()), Arc::new(TracingAuditSink))?;
            core.start();
            println!("{}", serde_json::to_string_pretty(&core.report())?);
        }
        Commands::Algorithms => {
            let params = json!({
                "ML-KEM-768": ML_KEM_768,
                "ML-DSA-65": ML_DSA_65,
                "aead": pqvault::crypto::aead::ALGORITHM,
            });
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
        Commands::Split {
            secret,
            shares,
            threshold,
            out_dir,
        } => {
            let secret = hex::decode(secret.trim())
                .map_err(|e| VaultError::Config(format!("secret is not hex: {e}")))?;
            let parts = split(&secret, shares, threshold)?;
            match out_dir {
                Some(dir) => {
                    let passphrase = passphrase()?;
                    std::fs::create_dir_all(&dir)?;
                    for share in &parts {
                        let path = dir.join(format!("share-{}.json", share.index));
                        ShareFile::seal(share, None, passphrase.as_bytes(), &config.share_file.kdf)?
                            .save(&path)?;
                        println!("{}", path.display());
                    }
                }
                None => {
                    for share in &parts {
                        println!("{}", share.to_hex());
                    }
                }
            }
        }
        Commands::Combine { shares, files } => {
            let mut parsed = shares
                .iter()
                .map(|s| Share::from_hex(s.trim()))
                .collect::<Result<Vec<_>>>()?;
            if !files.is_empty() {
                let passphrase = passphrase()?;
                for path in &files {
                    parsed.push(ShareFile::load(path)?.open(passphrase.as_bytes())?);
                }
            }
            let secret = combine(&parsed)?;
            println!("{}", hex::encode(secret.as_bytes()));
        }
    }
    Ok(())
}

fn passphrase() -> Result<String> {
    std::env::var(PASSPHRASE_ENV)
        .map_err(|_| VaultError::Config(format!("{PASSPHRASE_ENV} must be set to use share files")))
}
