use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volback_engine::{
    BackupRepository, BackupRequest, BackupService, EngineConfig, JsonFileRepository, Volume,
    VolumeRepository,
};
use volback_storage::ObjectStore;

#[derive(Parser)]
#[command(name = "volback", version, about = "Chunked incremental volume backups")]
struct Cli {
    /// Engine configuration file (TOML); falls back to VOLBACK_* variables
    #[arg(long, env = "VOLBACK_CONFIG")]
    config: Option<PathBuf>,
    /// Directory holding backup and volume records
    #[arg(long, env = "VOLBACK_STATE_DIR", default_value = "/var/lib/volback/state")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage volume records
    Volumes {
        #[command(subcommand)]
        command: VolumeCommand,
    },
    /// Back up a volume image
    Backup(BackupArgs),
    /// Restore a backup into a volume image
    Restore(RestoreArgs),
    /// Delete a backup and its objects
    Delete {
        /// Backup ID
        backup: String,
    },
    /// Print a backup's metadata document
    Show {
        /// Backup ID
        backup: String,
    },
    /// List backup records
    List,
}

#[derive(Subcommand)]
enum VolumeCommand {
    List,
    Add(VolumeArgs),
}

#[derive(Args)]
struct VolumeArgs {
    /// Volume ID
    id: String,
    /// Size in GiB
    #[arg(long)]
    size_gib: u64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    volume_type: Option<String>,
    #[arg(long)]
    availability_zone: Option<String>,
}

#[derive(Args)]
struct BackupArgs {
    /// Volume ID
    #[arg(long)]
    volume: String,
    /// Image file or block device to read
    #[arg(long)]
    image: PathBuf,
    /// Parent backup for an incremental backup
    #[arg(long)]
    parent: Option<String>,
    /// Container to write into instead of the configured one
    #[arg(long)]
    container: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Args)]
struct RestoreArgs {
    /// Backup ID
    #[arg(long)]
    backup: String,
    /// Destination volume ID
    #[arg(long)]
    volume: String,
    /// Image file or block device to write
    #[arg(long)]
    image: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,volback_engine=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;
    config.validate().context("invalid engine configuration")?;

    let store = config
        .storage
        .open()
        .await
        .context("failed to open object store")?;
    info!("Using {} object store", store.name());

    let repo = Arc::new(
        JsonFileRepository::new(&cli.state_dir)
            .await
            .with_context(|| format!("failed to open state directory {:?}", cli.state_dir))?,
    );
    let service = BackupService::new(config, store, repo.clone(), repo.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Volumes { command } => match command {
            VolumeCommand::List => print_json(&repo.list_volumes().await?)?,
            VolumeCommand::Add(args) => {
                let mut volume = Volume::new(args.id, args.size_gib);
                volume.display_name = args.name;
                volume.display_description = args.description;
                volume.volume_type_id = args.volume_type;
                volume.availability_zone = args.availability_zone;
                repo.save_volume(&volume).await?;
                print_json(&volume)?;
            }
        },
        Command::Backup(args) => {
            let mut image = File::open(&args.image)
                .await
                .with_context(|| format!("failed to open {:?}", args.image))?;
            let backup = service
                .create_backup(BackupRequest {
                    volume_id: args.volume,
                    parent_id: args.parent,
                    container: args.container,
                    name: args.name,
                    description: args.description,
                })
                .await?;
            let backup = service
                .backup(&backup.id, &mut image, &cancel)
                .await
                .with_context(|| format!("backup {} failed", backup.id))?;
            print_json(&backup)?;
        }
        Command::Restore(args) => {
            let mut image = open_destination(&args.image).await?;
            let volume = service
                .restore(&args.backup, &args.volume, &mut image, &cancel)
                .await
                .with_context(|| format!("restore of backup {} failed", args.backup))?;
            print_json(&volume)?;
        }
        Command::Delete { backup } => {
            let backup = service
                .delete_backup(&backup)
                .await
                .with_context(|| format!("delete of backup {} failed", backup))?;
            print_json(&backup)?;
        }
        Command::Show { backup } => {
            let document = service.read_metadata(&backup).await?;
            print_json(&document)?;
        }
        Command::List => {
            let mut backups = repo.list_backups().await?;
            backups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            print_json(&backups)?;
        }
    }

    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::from_env()?);
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {:?}", path))
}

/// Open a restore target without truncating it
async fn open_destination(path: &Path) -> Result<File> {
    if path.is_dir() {
        bail!("{:?} is a directory", path);
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("failed to open {:?}", path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
