//! pvault: pattern-unlocked encrypted vault CLI
//!
//! Vault commands:
//!   init                      - write a default config, create the device salt
//!   unlock / stats            - open the vault a pattern addresses
//!   put / get / ls / rm       - manage files inside it
//!   rename / rotate           - display name, pattern change
//!
//! Recovery, duress and backup commands live under their own subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use pvault_backup::{BackupManager, BackupVersionEntry};
use pvault_core::config::{expand_tilde, PvaultConfig};
use pvault_core::types::BackupStage;
use pvault_core::{PvaultError, PvaultResult};
use pvault_crypto::{Pattern, VaultKey};
use pvault_storage::{build_operator, RemoteStore, S3Credentials};
use pvault_vault::VaultService;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pvault",
    version,
    about = "Pattern-unlocked encrypted file vault",
    long_about = "pvault: store files in plausibly-deniable encrypted vaults, each opened by its own unlock pattern"
)]
struct Cli {
    /// Path to pvault.toml configuration file
    #[arg(long, short = 'c', env = "PVAULT_CONFIG", default_value = "~/.config/pvault/config.toml")]
    config: PathBuf,

    /// Unlock pattern as node indices, e.g. 0,6,12,18,24,20 (prompted if absent)
    #[arg(long, short = 'p', global = true, env = "PVAULT_PATTERN", hide_env_values = true)]
    pattern: Option<String>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, env = "PVAULT_LOG")]
    log: Option<String>,

    /// Log output format
    #[arg(long, env = "PVAULT_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config (if missing) and create the device salt
    Init,

    /// Open the vault for a pattern and show its usage
    Unlock,

    /// Store a local file in the vault
    Put {
        /// Local file to store
        path: PathBuf,
        /// Name inside the vault (default: the file name)
        #[arg(long)]
        name: Option<String>,
        /// MIME type recorded with the file
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Decrypt a stored file to a local path
    Get {
        /// File id (see `pvault ls`)
        id: Uuid,
        /// Destination path
        dest: PathBuf,
    },

    /// List files in the vault
    Ls,

    /// Delete a file from the vault
    Rm {
        id: Uuid,
    },

    /// Change the vault's pattern; content is not re-encrypted
    Rotate {
        /// New pattern (prompted if absent)
        #[arg(long)]
        new_pattern: Option<String>,
    },

    /// Show capacity and usage
    Stats,

    /// Set or clear the vault's display name
    Rename {
        name: Option<String>,
    },

    /// Recovery phrase management
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },

    /// Duress vault designation
    Duress {
        #[command(subcommand)]
        action: DuressAction,
    },

    /// Encrypted remote backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum RecoveryAction {
    /// Register a recovery phrase for the vault (generated if not given)
    Save {
        #[arg(long)]
        phrase: Option<String>,
    },
    /// Find the vault and pattern a phrase belongs to (phrase is prompted)
    Recover,
    /// Replace the vault's phrase with a new one
    Regenerate {
        #[arg(long)]
        phrase: Option<String>,
    },
    /// Remove the vault's recovery phrase
    Delete,
}

#[derive(Subcommand, Debug)]
enum DuressAction {
    /// Make the vault this pattern opens the duress vault
    Set,
    /// Remove the duress designation
    Clear,
    /// Show whether the pattern's vault is the duress vault
    Status,
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// Back up the vault (resumes an interrupted run)
    Run,
    /// Replace the local vault with the latest backup for this pattern
    Restore,
    /// List backup versions for this pattern
    List,
    /// Check the latest backup against this pattern without downloading
    Verify,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = PvaultConfig::load(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);
    debug!(config = %config_path.display(), "pvault starting");

    match cli.command {
        Commands::Init => cmd_init(&config, &config_path),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        command => {
            let ctx = Ctx::open(config, cli.pattern)?;
            run(&ctx, command).await
        }
    }
}

async fn run(ctx: &Ctx, command: Commands) -> Result<()> {
    match command {
        Commands::Unlock | Commands::Stats => cmd_stats(ctx).await,
        Commands::Put { path, name, mime } => cmd_put(ctx, &path, name, mime).await,
        Commands::Get { id, dest } => cmd_get(ctx, id, dest).await,
        Commands::Ls => cmd_ls(ctx).await,
        Commands::Rm { id } => {
            let key = ctx.unlock().await?;
            ctx.service.delete_file(&key, id).await?;
            println!("Deleted {id}");
            Ok(())
        }
        Commands::Rotate { new_pattern } => cmd_rotate(ctx, new_pattern).await,
        Commands::Rename { name } => {
            let key = ctx.unlock().await?;
            ctx.service.set_custom_name(&key, name.clone()).await?;
            match name {
                Some(n) => println!("Vault renamed to {n:?}"),
                None => println!("Vault name cleared"),
            }
            Ok(())
        }
        Commands::Recovery { action } => cmd_recovery(ctx, action).await,
        Commands::Duress { action } => cmd_duress(ctx, action).await,
        Commands::Backup { action } => cmd_backup(ctx, action).await,
        Commands::Init | Commands::Config { .. } => Ok(()),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared context ────────────────────────────────────────────────────────────

struct Ctx {
    config: PvaultConfig,
    service: VaultService,
    pattern: Option<String>,
}

impl Ctx {
    fn open(config: PvaultConfig, pattern: Option<String>) -> PvaultResult<Self> {
        let store = pvault_secrets::open_store(&config.secrets).map_err(|e| PvaultError::Secrets(e.to_string()))?;
        let service = VaultService::open(&config, store).map_err(|e| PvaultError::Vault(e.to_string()))?;
        Ok(Self {
            config,
            service,
            pattern,
        })
    }

    fn pattern(&self) -> Result<Pattern> {
        read_pattern(self.config.pattern.grid_size, self.pattern.as_deref(), "Pattern")
    }

    /// Unlock through the service so a duress pattern behaves exactly like
    /// any other.
    async fn unlock(&self) -> Result<VaultKey> {
        Ok(self.service.unlock(self.pattern()?).await?.key)
    }

    fn backups(&self) -> PvaultResult<BackupManager> {
        let creds = S3Credentials::from_env().ok_or_else(|| {
            PvaultError::Config(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables."
                    .into(),
            )
        })?;
        let op = build_operator(&self.config.backup, &creds).map_err(|e| PvaultError::Backup(e.to_string()))?;
        let remote = RemoteStore::new(op, &self.config.backup.prefix);
        let staging = expand_tilde(&self.config.vault.root).join("staging");
        Ok(BackupManager::new(
            self.service.storage().clone(),
            remote,
            self.service.deriver().clone(),
            self.config.backup.clone(),
            staging,
        ))
    }
}

fn read_pattern(grid_size: u8, given: Option<&str>, prompt: &str) -> Result<Pattern> {
    let input = match given {
        Some(p) => zeroize::Zeroizing::new(p.to_string()),
        None => zeroize::Zeroizing::new(
            rpassword::prompt_password(format!("{prompt} (node indices, comma-separated): "))
                .context("reading pattern")?,
        ),
    };
    Pattern::parse(grid_size, &input).map_err(|e| PvaultError::Config(e.to_string()).into())
}

// ── `pvault init` / `pvault config show` ──────────────────────────────────────

fn cmd_init(config: &PvaultConfig, config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir: {}", parent.display()))?;
        }
        let toml = toml::to_string_pretty(config).context("serializing default config")?;
        std::fs::write(config_path, toml).with_context(|| format!("writing config: {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
    }

    let ctx = Ctx::open(config.clone(), None)?;
    println!("Vault directory: {}", ctx.service.storage().dir().display());
    println!("Secret store:    {}", config.secrets.backend);
    println!("Blob size:       {}", fmt_bytes(config.vault.blob_size));
    info!("pvault initialised");
    Ok(())
}

fn cmd_config_show(config: &PvaultConfig, config_path: &Path) -> Result<()> {
    println!("# config: {}", config_path.display());
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

// ── Vault commands ────────────────────────────────────────────────────────────

async fn cmd_stats(ctx: &Ctx) -> Result<()> {
    let key = ctx.unlock().await?;
    let stats = ctx.service.vault_stats(&key).await?;
    let name = ctx.service.storage().load_index(&key)?.custom_name;
    if let Some(name) = name {
        println!("Vault:     {name}");
    }
    println!("Files:     {}", stats.files);
    println!("Used:      {} of {}", fmt_bytes(stats.used), fmt_bytes(stats.capacity));
    println!("Available: {}", fmt_bytes(stats.available()));
    if stats.deleted > 0 {
        println!("Deleted:   {} (space not reclaimed)", stats.deleted);
    }
    Ok(())
}

async fn cmd_put(ctx: &Ctx, path: &Path, name: Option<String>, mime: String) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("not a file: {}", path.display());
    }
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("path has no file name")?,
    };
    let key = ctx.unlock().await?;

    let pb = make_spinner("put");
    pb.set_message(name.clone());
    let id = ctx
        .service
        .store_path(&key, path.to_path_buf(), name.clone(), mime)
        .await
        .with_context(|| format!("storing {}", path.display()));
    pb.finish_and_clear();
    let id = id?;

    println!("Stored {name}");
    println!("  id: {id}");
    Ok(())
}

async fn cmd_get(ctx: &Ctx, id: Uuid, dest: PathBuf) -> Result<()> {
    let key = ctx.unlock().await?;
    let entry = ctx
        .service
        .retrieve_to_path(&key, id, dest.clone())
        .await
        .with_context(|| format!("retrieving {id}"))?;
    println!("{} → {} ({})", entry.filename, dest.display(), fmt_bytes(entry.original_size));
    Ok(())
}

async fn cmd_ls(ctx: &Ctx) -> Result<()> {
    let key = ctx.unlock().await?;
    let mut files = ctx.service.list_files(&key).await?;
    if files.is_empty() {
        println!("(empty)");
        return Ok(());
    }
    files.sort_by_key(|f| f.created_at);
    println!("{:<36}  {:>10}  {:<24}  NAME", "ID", "SIZE", "TYPE");
    for f in files {
        println!(
            "{:<36}  {:>10}  {:<24}  {}",
            f.file_id,
            fmt_bytes(f.original_size),
            f.mime_type,
            f.filename
        );
    }
    Ok(())
}

async fn cmd_rotate(ctx: &Ctx, new_pattern: Option<String>) -> Result<()> {
    let old_key = ctx.unlock().await?;
    let grid = ctx.config.pattern.grid_size;
    let new = read_pattern(grid, new_pattern.as_deref(), "New pattern")?;
    if new_pattern.is_none() {
        let confirm = read_pattern(grid, None, "Repeat new pattern")?;
        if confirm != new {
            anyhow::bail!("patterns do not match");
        }
    }
    ctx.service.change_pattern(&old_key, new).await?;
    println!("Pattern changed");
    Ok(())
}

// ── `pvault recovery` ─────────────────────────────────────────────────────────

async fn cmd_recovery(ctx: &Ctx, action: RecoveryAction) -> Result<()> {
    let recovery = ctx.service.recovery().clone();
    match action {
        RecoveryAction::Save { phrase } => {
            let pattern = ctx.pattern()?;
            let key = ctx.service.unlock(pattern.clone()).await?.key;
            let phrase = match phrase {
                Some(p) => zeroize::Zeroizing::new(p),
                None => recovery.generate_phrase()?,
            };
            recovery.save(&phrase, &pattern, &key)?;
            println!("Recovery phrase saved. Write it down:");
            println!();
            println!("  {}", phrase.as_str());
        }
        RecoveryAction::Recover => {
            let phrase = zeroize::Zeroizing::new(rpassword::prompt_password("Recovery phrase: ").context("reading phrase")?);
            let pattern = recovery.recover_pattern(&phrase)?;
            let key = ctx.service.recover(phrase.as_str().to_owned()).await?;
            let stats = ctx.service.vault_stats(&key).await?;
            let nodes: Vec<String> = pattern.nodes().iter().map(u8::to_string).collect();
            println!("Vault found ({} files)", stats.files);
            println!("  pattern: {}", nodes.join(","));
        }
        RecoveryAction::Regenerate { phrase } => {
            let key = ctx.unlock().await?;
            let phrase = recovery.regenerate(&key, phrase.as_deref())?;
            println!("New recovery phrase:");
            println!();
            println!("  {}", phrase.as_str());
        }
        RecoveryAction::Delete => {
            let key = ctx.unlock().await?;
            recovery.delete(&key)?;
            println!("Recovery phrase removed");
        }
    }
    Ok(())
}

// ── `pvault duress` ───────────────────────────────────────────────────────────

async fn cmd_duress(ctx: &Ctx, action: DuressAction) -> Result<()> {
    let duress = ctx.service.duress().clone();
    match action {
        DuressAction::Set => {
            let key = ctx.unlock().await?;
            duress.set_as_duress_vault(&key)?;
            println!("Duress vault set. Unlocking it will destroy every other vault.");
        }
        DuressAction::Clear => {
            duress.clear()?;
            println!("Duress designation cleared");
        }
        DuressAction::Status => {
            let key = ctx.unlock().await?;
            if duress.is_duress_key(&key)? {
                println!("This vault is the duress vault");
            } else {
                println!("This vault is not the duress vault");
            }
        }
    }
    Ok(())
}

// ── `pvault backup` ───────────────────────────────────────────────────────────

async fn cmd_backup(ctx: &Ctx, action: BackupAction) -> Result<()> {
    let backups = ctx.backups()?;
    let pattern = ctx.pattern()?;

    match action {
        BackupAction::Run => {
            let key = ctx.service.unlock(pattern.clone()).await?.key;
            let cancel = cancel_on_ctrl_c();
            let progress = track_progress(backups.subscribe(), "backup");
            let entry = backups.perform_backup(&key, &pattern, &cancel).await;
            finish_progress(progress).await;
            let entry = entry.map_err(|e| PvaultError::Backup(e.to_string()))?;
            println!("Backup complete:");
            print_version(&entry);
        }
        BackupAction::Restore => {
            let key = ctx.service.unlock(pattern.clone()).await?.key;
            let backup_key = backups.derive_backup_key(pattern).await?;
            let cancel = cancel_on_ctrl_c();
            let progress = track_progress(backups.subscribe(), "restore");
            let summary = backups.restore_backup(&backup_key, &key, &cancel).await;
            finish_progress(progress).await;
            let summary = summary.map_err(|e| PvaultError::Backup(e.to_string()))?;
            println!("Restored backup {}", summary.backup_id);
            println!("  files: {}", summary.file_count);
            println!("  bytes: {}", fmt_bytes(summary.bytes));
        }
        BackupAction::List => {
            let backup_key = backups.derive_backup_key(pattern).await?;
            let versions = backups.list_versions(&backup_key).await?;
            if versions.is_empty() {
                println!("No backups for this pattern");
            }
            for entry in versions {
                print_version(&entry);
                println!();
            }
        }
        BackupAction::Verify => {
            let backup_key = backups.derive_backup_key(pattern).await?;
            match backups.latest_version(&backup_key).await? {
                None => println!("No backups for this pattern"),
                Some(entry) if backups.verify_pattern_before_download(&backup_key, &entry) => {
                    println!("Latest backup {} matches this pattern", entry.backup_id);
                }
                Some(entry) => anyhow::bail!("backup {} does not match this pattern", entry.backup_id),
            }
        }
    }
    Ok(())
}

fn print_version(entry: &BackupVersionEntry) {
    println!("  id:      {}", entry.backup_id);
    println!("  created: {} ms since epoch", entry.created_at);
    println!("  files:   {}", entry.file_count);
    println!("  size:    {} in {} chunks", fmt_bytes(entry.total_size), entry.chunks.len());
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling…");
            token.cancel();
        }
    });
    cancel
}

/// Wait for the progress display to draw its last state.
async fn finish_progress(progress: tokio::task::JoinHandle<()>) {
    if let Err(e) = progress.await {
        debug!(error = %e, "progress display task ended abnormally");
    }
}

/// Drive a progress bar from the backup stage channel until a terminal stage.
fn track_progress(mut rx: watch::Receiver<BackupStage>, prefix: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pb = make_spinner(prefix);
        loop {
            let stage = rx.borrow_and_update().clone();
            match &stage {
                BackupStage::Idle => {}
                BackupStage::Deriving => pb.set_message("deriving backup key"),
                BackupStage::Packing => pb.set_message("encrypting vault"),
                BackupStage::Uploading { done, total } | BackupStage::Downloading { done, total } => {
                    if pb.length() != Some(*total) {
                        pb.set_style(bar_style());
                        pb.set_length(*total);
                    }
                    pb.set_position(*done);
                    pb.set_message(if matches!(stage, BackupStage::Uploading { .. }) {
                        "uploading chunks"
                    } else {
                        "downloading chunks"
                    });
                }
                BackupStage::Finalizing => pb.set_message("finalizing"),
                BackupStage::Complete => pb.finish_with_message("done"),
                BackupStage::Failed { reason } => pb.abandon_with_message(format!("failed: {reason}")),
            }
            if stage.is_terminal() || rx.changed().await.is_err() {
                break;
            }
        }
    })
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn make_spinner(prefix: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
