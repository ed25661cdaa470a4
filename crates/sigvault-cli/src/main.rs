//! sigvault - local password vault and threshold signing demo
//!
//! usage:
//!   SIGVAULT_PASSWORD=... sigvault vault create --account alice --generate
//!   SIGVAULT_PASSWORD=... sigvault vault open --account alice
//!   sigvault demo --message "hello" --offline 3
//!
//! data stored in ~/.sigvault/

mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rand::rngs::OsRng;
use serde::Serialize;
use sigvault::domain::software::SoftwareDomain;
use sigvault::{
    CeremonyReport, Config, Coordinator, GroupPublicKey, MemoryAudit, PasswordVault, SecretKey,
    SignedMessage, SigningRequest,
};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::store::SledVaultStore;

const PASSWORD_ENV: &str = "SIGVAULT_PASSWORD";
const NEW_PASSWORD_ENV: &str = "SIGVAULT_NEW_PASSWORD";

/// sigvault - non-custodial signing
#[derive(Parser)]
#[command(name = "sigvault")]
#[command(about = "sigvault - password vault and threshold signing")]
#[command(version)]
struct Cli {
    /// toml config (default: built-in 2-of-3)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// data directory (default: ~/.sigvault)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// password-protected secrets on this machine
    #[command(subcommand)]
    Vault(VaultCommand),
    /// keygen and sign across in-process software domains
    Demo(DemoArgs),
    /// print the effective config
    Config,
}

#[derive(Subcommand)]
enum VaultCommand {
    /// seal a secret under $SIGVAULT_PASSWORD
    Create {
        #[arg(short, long)]
        account: String,
        /// secret to seal, hex encoded
        #[arg(long, conflicts_with = "generate", required_unless_present = "generate")]
        secret_hex: Option<String>,
        /// seal a fresh signing key instead
        #[arg(long)]
        generate: bool,
    },
    /// print the sealed secret, hex encoded
    Open {
        #[arg(short, long)]
        account: String,
    },
    /// re-seal under $SIGVAULT_NEW_PASSWORD
    Passwd {
        #[arg(short, long)]
        account: String,
    },
    /// print a backup blob as json
    Export {
        #[arg(short, long)]
        account: String,
    },
    /// read a backup blob from a file and print its secret
    Restore {
        #[arg(short, long)]
        file: PathBuf,
    },
    Delete {
        #[arg(short, long)]
        account: String,
    },
    List,
}

#[derive(Args)]
struct DemoArgs {
    /// message to sign
    #[arg(short, long)]
    message: String,
    /// participant to take offline after keygen (repeatable)
    #[arg(long)]
    offline: Vec<u32>,
}

#[derive(Serialize)]
struct DemoOutput {
    verifying_key: GroupPublicKey,
    signed: Option<SignedMessage>,
    error: Option<String>,
    ceremonies: Vec<CeremonyReport>,
}

fn password(var: &str) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    let value = std::env::var(var).with_context(|| format!("{} not set", var))?;
    if value.is_empty() {
        bail!("{} is empty", var);
    }
    Ok(Zeroizing::new(value.into_bytes()))
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".sigvault")
    })
}

fn open_vault(cli: &Cli, config: &Config) -> anyhow::Result<PasswordVault<SledVaultStore>> {
    let dir = data_dir(cli);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let store = SledVaultStore::open(dir.join("db"))?;
    Ok(PasswordVault::new(store, config)?)
}

fn run_vault(cli: &Cli, config: &Config, cmd: &VaultCommand) -> anyhow::Result<()> {
    let vault = open_vault(cli, config)?;
    match cmd {
        VaultCommand::Create {
            account,
            secret_hex,
            generate,
        } => {
            let pw = password(PASSWORD_ENV)?;
            let secret = match (secret_hex, generate) {
                (Some(h), _) => Zeroizing::new(hex::decode(h).context("secret is not hex")?),
                (None, true) => {
                    let key = SecretKey::generate(&mut OsRng);
                    println!("{}", hex::encode(key.public_key().to_bytes()));
                    Zeroizing::new(key.to_bytes().to_vec())
                }
                (None, false) => bail!("pass --secret-hex or --generate"),
            };
            vault.create(account, &pw, &secret)?;
            info!(account, "vault sealed");
        }
        VaultCommand::Open { account } => {
            let pw = password(PASSWORD_ENV)?;
            let secret = vault.open(account, &pw)?;
            println!("{}", hex::encode(&secret[..]));
        }
        VaultCommand::Passwd { account } => {
            let old = password(PASSWORD_ENV)?;
            let new = password(NEW_PASSWORD_ENV)?;
            vault.change_password(account, &old, &new)?;
            info!(account, "password changed");
        }
        VaultCommand::Export { account } => {
            let pw = password(PASSWORD_ENV)?;
            let blob = vault.export_backup(account, &pw)?;
            println!("{}", serde_json::to_string_pretty(&blob)?);
        }
        VaultCommand::Restore { file } => {
            let pw = password(PASSWORD_ENV)?;
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let blob = serde_json::from_str(&raw).context("not a backup blob")?;
            let secret = vault.import_backup(&blob, &pw)?;
            println!("{}", hex::encode(&secret[..]));
        }
        VaultCommand::Delete { account } => {
            if !vault.delete(account)? {
                warn!(account, "no vault to delete");
            }
        }
        VaultCommand::List => {
            for account in vault.store().accounts()? {
                println!("{}", account);
            }
        }
    }
    Ok(())
}

async fn run_demo(config: Config, args: &DemoArgs) -> anyhow::Result<()> {
    let domains: Vec<Arc<SoftwareDomain>> = (1..=config.participant_count)
        .map(|i| {
            Arc::new(
                SoftwareDomain::new(format!("soft-hsm-{}", i)).with_session_ttl(config.session_ttl()),
            )
        })
        .collect();
    let audit = Arc::new(MemoryAudit::new());
    let coordinator = Coordinator::new(config, domains.clone())?.with_audit(audit.clone());

    let key = coordinator.keygen().await?;
    info!(key_id = %key.key_id, "demo key ready");

    for index in &args.offline {
        let Some(domain) = index.checked_sub(1).and_then(|i| domains.get(i as usize)) else {
            bail!("no participant {}", index);
        };
        domain.kill()?;
    }

    let request = SigningRequest::new(args.message.as_bytes().to_vec()).with_client("cli-demo");
    let (signed, error) = match coordinator.sign(&key, request).await {
        Ok(signed) => {
            key.verifying_key
                .verify(args.message.as_bytes(), &signed.signature)?;
            (Some(signed), None)
        }
        Err(e) => {
            warn!(error = %e, "demo signing failed");
            (None, Some(e.client_message().to_string()))
        }
    };

    let out = DemoOutput {
        verifying_key: key.verifying_key,
        signed,
        error,
        ceremonies: audit.reports(),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sigvault=info".parse()?)
                .add_directive("sigvault_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    info!("sigvault v{}", env!("CARGO_PKG_VERSION"));
    info!("  threshold: {}-of-{}", config.threshold, config.participant_count);
    info!("  work factor: {}", config.pbkdf_work_factor);

    match &cli.command {
        Command::Vault(cmd) => run_vault(&cli, &config, cmd),
        Command::Demo(args) => {
            warn!("demo domains are software only - no hardware isolation");
            run_demo(config, args).await
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
