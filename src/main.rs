//! cryptmirror - Passthrough FUSE filesystem with content encryption
//!
//! Usage:
//!   cryptmirror mount <root> <mount_point>  - Mount a view of <root>
//!   cryptmirror unmount <mount_point>       - Unmount
//!   cryptmirror status <file>               - Show how a backing file is stored
//!   cryptmirror encrypt <file>              - Encrypt a backing file in place
//!   cryptmirror decrypt <file>              - Decrypt a backing file in place
//!   cryptmirror init                        - Write the default configuration

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use cryptmirror::{
    config::{Config, UnmanagedWritePolicy},
    context::{self, MountContext},
    crypto::{AeadCipher, Passphrase},
    fs::{
        marker, AuditOps, ContentState, CryptFs, EncryptingOps, Operations, PassthroughOps,
        TransformEngine, XattrStore,
    },
};
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "cryptmirror")]
#[command(author = "cryptmirror Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Mirror a directory through FUSE, encrypting file contents at rest")]
struct Cli {
    /// Configuration file path [default: ~/.config/cryptmirror/config.json]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PassphraseArgs {
    /// Read the passphrase from this environment variable instead of prompting
    #[arg(long, value_name = "VAR")]
    passphrase_env: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Backing directory
        root: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        #[command(flatten)]
        passphrase: PassphraseArgs,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Rewrite files through a temp file and rename
        #[arg(long)]
        atomic_writes: bool,

        /// Writes to unmarked files: passthrough, adopt or refuse
        #[arg(long, value_name = "POLICY")]
        unmanaged_writes: Option<UnmanagedWritePolicy>,

        /// Plain mirror without any content transform
        #[arg(long, conflicts_with_all = ["atomic_writes", "unmanaged_writes"])]
        plain: bool,

        /// Log every operation on the cryptmirror::audit target
        #[arg(long)]
        audit: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show how a backing file is stored
    Status {
        /// Backing file
        file: PathBuf,
    },

    /// Encrypt a backing file in place
    Encrypt {
        /// Backing file
        file: PathBuf,

        #[command(flatten)]
        passphrase: PassphraseArgs,
    },

    /// Decrypt a backing file in place and mark it plaintext
    Decrypt {
        /// Backing file
        file: PathBuf,

        #[command(flatten)]
        passphrase: PassphraseArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),

        Commands::Mount {
            root,
            mount_point,
            passphrase,
            allow_other,
            atomic_writes,
            unmanaged_writes,
            plain,
            audit,
        } => {
            let mut config = Config::load_or_default(config_path)?;
            config.mount.allow_other |= allow_other;
            config.mount.atomic_writes |= atomic_writes;
            if let Some(policy) = unmanaged_writes {
                config.mount.unmanaged_writes = policy;
            }
            cmd_mount(&config, &root, &mount_point, &passphrase, plain, audit)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status { file } => cmd_status(config_path, &file),

        Commands::Encrypt { file, passphrase } => {
            cmd_convert(config_path, &file, &passphrase, ContentState::Encrypted)
        }

        Commands::Decrypt { file, passphrase } => {
            cmd_convert(config_path, &file, &passphrase, ContentState::Plaintext)
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", config_path);
    }

    Config::default()
        .save(config_path)
        .with_context(|| format!("writing {:?}", config_path))?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn read_passphrase(args: &PassphraseArgs) -> anyhow::Result<Passphrase> {
    let passphrase = match &args.passphrase_env {
        Some(var) => std::env::var(var)
            .with_context(|| format!("environment variable {} is not set", var))?,
        None => rpassword::prompt_password("Enter encryption passphrase: ")
            .context("failed to read passphrase")?,
    };

    if passphrase.is_empty() {
        bail!("passphrase must not be empty");
    }
    Ok(Passphrase::from(passphrase))
}

fn cmd_mount(
    config: &Config,
    root: &Path,
    mount_point: &Path,
    passphrase: &PassphraseArgs,
    plain: bool,
    audit: bool,
) -> anyhow::Result<()> {
    info!("Starting cryptmirror...");

    let ctx = if plain {
        context::ensure_unprivileged()?;
        MountContext::new(root, Passphrase::new(Vec::new()))?
    } else {
        MountContext::bootstrap(root, read_passphrase(passphrase)?)?
    };

    let mut ops: Box<dyn Operations> = if plain {
        Box::new(PassthroughOps::default())
    } else {
        Box::new(EncryptingOps::from_config(config))
    };
    if audit {
        ops = Box::new(AuditOps::new(ops));
    }

    // Modes requested by callers reach the backing store unmasked
    nix::sys::stat::umask(Mode::empty());

    std::fs::create_dir_all(mount_point)
        .with_context(|| format!("creating mount point {:?}", mount_point))?;

    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fsname.clone()),
        fuser::MountOption::DefaultPermissions,
    ];
    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    if config.mount.atomic_writes {
        info!("Atomic writes enabled");
    }
    info!(
        "Mounting {:?} at {:?} (unmanaged writes: {:?})",
        ctx.backing_root(),
        mount_point,
        config.mount.unmanaged_writes
    );

    let fs = CryptFs::new(ctx, ops);
    fuser::mount2(fs, mount_point, &options)
        .with_context(|| format!("mounting at {:?}", mount_point))?;

    info!("Unmounted");
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> anyhow::Result<()> {
    info!("Unmounting {:?}...", mount_point);

    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("running fusermount")?;

    if !output.status.success() {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!("Unmounted successfully");
    Ok(())
}

fn engine(config_path: &Path) -> anyhow::Result<TransformEngine> {
    let config = Config::load_or_default(config_path)?;
    let cipher = AeadCipher::new(config.encryption);
    Ok(TransformEngine::new(Arc::new(cipher), Arc::new(XattrStore)))
}

fn regular_file(file: &Path) -> anyhow::Result<std::fs::Metadata> {
    let meta = std::fs::symlink_metadata(file).with_context(|| format!("{:?}", file))?;
    if !meta.is_file() {
        bail!("{:?} is not a regular file", file);
    }
    Ok(meta)
}

fn cmd_status(config_path: &Path, file: &Path) -> anyhow::Result<()> {
    let meta = regular_file(file)?;
    let engine = engine(config_path)?;
    let state = marker::classify(engine.attributes(), file)?;

    println!("File: {:?}", file);
    println!("State: {}", state);
    println!("Stored size: {} bytes", meta.len());
    if state == ContentState::Encrypted {
        println!(
            "Logical size: {} bytes",
            engine.logical_len(state, meta.len())
        );
    }

    Ok(())
}

fn cmd_convert(
    config_path: &Path,
    file: &Path,
    passphrase: &PassphraseArgs,
    target: ContentState,
) -> anyhow::Result<()> {
    regular_file(file)?;
    context::ensure_unprivileged()?;

    let engine = engine(config_path)?;
    let passphrase = read_passphrase(passphrase)?;

    let previous = engine
        .convert(file, &passphrase, target)
        .with_context(|| format!("converting {:?}", file))?;

    if previous == target {
        warn!("{:?} is already {}", file, target);
    } else {
        info!("{:?}: {} -> {}", file, previous, target);
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
