use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use idvault::cli::{
    handle_encrypt_command, handle_health, handle_prune, handle_snapshots, handle_sweep,
    handle_validate, key_provider_from_env, EncryptCommands,
};
use idvault::config::{paths::VaultPaths, settings::Settings};
use idvault::{CancelToken, Vault};

#[derive(Parser)]
#[command(
    name = "idvault",
    author = "Kaylee Beyene",
    version,
    about = "Backup and restore engine for cloud identity directories",
    long_about = "idvault stores versioned, deduplicated snapshots of an identity \
                  directory. This binary inspects and maintains the snapshot store; \
                  backups and restores are driven through the library API."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and write default settings
    Init,

    /// Show current configuration and paths
    Config,

    /// List stored snapshots, newest first
    #[command(alias = "ls")]
    Snapshots {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Verify every chunk and checksum of a snapshot
    Validate {
        /// Snapshot id, or 'latest'
        snapshot: String,
    },

    /// Apply the retention policy from settings
    Prune {
        /// Show what would be pruned without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Check that the storage backend is reachable
    Health,

    /// Remove chunks left behind by cancelled or failed backups
    Sweep,

    /// Encryption management commands
    #[command(subcommand)]
    Encrypt(EncryptCommands),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Initialize paths and settings
    let paths = VaultPaths::new()?;
    let mut settings = Settings::load_or_create(&paths)?;

    let command = match cli.command {
        Some(command) => command,
        None => {
            println!("idvault - identity directory backup and restore");
            println!();
            println!("Run 'idvault --help' for usage information.");
            return Ok(());
        }
    };

    match command {
        Commands::Init => {
            println!("Initializing idvault at: {}", paths.base_dir().display());
            paths.ensure_directories()?;
            settings.save(&paths)?;
            println!("Settings written to {}", paths.settings_file().display());
            return Ok(());
        }
        Commands::Config => {
            println!("idvault Configuration");
            println!("=====================");
            println!("Base directory:  {}", paths.base_dir().display());
            println!("Settings file:   {}", paths.settings_file().display());
            println!("Audit log:       {}", paths.audit_log().display());
            println!();
            println!("Settings:");
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        Commands::Encrypt(cmd) => {
            handle_encrypt_command(&paths, &mut settings, cmd)?;
            return Ok(());
        }
        _ => {}
    }

    let mut builder = Vault::builder(paths, settings.clone());
    if let Some(keys) = key_provider_from_env(&settings)? {
        builder = builder.key_provider(keys);
    }
    let vault = builder.build().await?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match command {
        Commands::Snapshots { verbose } => handle_snapshots(&vault, verbose, &cancel).await?,
        Commands::Validate { snapshot } => {
            if !handle_validate(&vault, &snapshot, &cancel).await? {
                bail!("snapshot {} failed validation", snapshot);
            }
        }
        Commands::Prune { dry_run } => handle_prune(&vault, dry_run, &cancel).await?,
        Commands::Health => {
            if !handle_health(&vault).await {
                bail!("storage backend is unreachable");
            }
        }
        Commands::Sweep => handle_sweep(&vault, &cancel).await?,
        Commands::Init | Commands::Config | Commands::Encrypt(_) => {}
    }

    Ok(())
}
