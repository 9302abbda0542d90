use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use stratus_core::auth::{self, AuthKeeper, Permission};
use stratus_core::config::AppConfig;
use stratus_core::store::memory::MemoryPersistentStore;

#[derive(Parser)]
#[command(name = "stratus-cli")]
#[command(about = "Management tool for the Stratus scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Scheduler repo path; defaults to $STRATUS_SCHEDULER_PATH.
    #[arg(long)]
    repo: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an API token signed with the scheduler secret.
    GetApiKey {
        /// Permission to assign: read, write, sign, or admin.
        #[arg(long)]
        perm: String,
    },

    /// Print the effective layered configuration.
    ConfigShow,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_dir = cli
        .repo
        .map(std::path::PathBuf::from)
        .unwrap_or_else(auth::default_repo_dir);

    match cli.command {
        Commands::GetApiKey { perm } => {
            let Some(permission) = Permission::parse(&perm) else {
                bail!("unknown permission '{perm}'; expected read, write, sign, or admin");
            };
            let secret =
                auth::load_or_create_secret(&repo_dir).context("scheduler secret unavailable")?;
            // Token issuance only needs the secret; registrations are not
            // consulted for operator tokens.
            let region = stratus_core::store::Region::parse("default")
                .map_err(|e| anyhow::anyhow!("region parse failed: {e}"))?;
            let keeper = AuthKeeper::new(secret, Arc::new(MemoryPersistentStore::new(region)));
            let token = keeper
                .global_token(&[permission])
                .map_err(|e| anyhow::anyhow!("token generation failed: {e}"))?;
            println!("{token}");
        }
        Commands::ConfigShow => {
            let config = AppConfig::load().context("configuration loading failed")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
