use clap::{ArgAction, Parser, Subcommand};
use holdfast::backup::{backup, BackupOptions};
use holdfast::crypto::KeyConfig;
use holdfast::error::{Error, Result};
use holdfast::gc::collect_garbage;
use holdfast::repo::{Repository, StorageConfig};
use holdfast::restore::restore_snapshot;
use holdfast::scan::scan;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// holdfast — a content-addressed deduplicating backup engine
#[derive(Parser, Debug)]
#[command(
    name = "holdfast",
    version,
    about = "A content-addressed deduplicating backup engine 🔒",
    long_about = "holdfast scans your filesystem into a local metadata cache, \
                  serializes changed files and directories into immutable \
                  content-addressed objects, and uploads them — optionally \
                  compressed and sealed to a public key — to a repository. \
                  Snapshots capture each backup root at a point in time; \
                  garbage collection reclaims objects no snapshot reaches."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the local cache database for this repository
    #[arg(short, long, global = true, default_value = "holdfast.db")]
    cache: PathBuf,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new repository and local cache database
    Init {
        /// Directory to store repository contents in
        #[arg(long)]
        storage_path: PathBuf,

        /// Compress object payloads before upload
        #[arg(long)]
        compress: bool,

        /// Seal object payloads to a freshly generated key pair
        #[arg(long)]
        encrypt: bool,

        /// Password protecting the private key (or set HOLDFAST_PASSWORD)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Add filesystem paths as backup roots
    Addroot {
        /// Paths to start backing up
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Skip scanning the new roots now (run a scan before backing up)
        #[arg(long)]
        skip_scan: bool,
    },

    /// Stop backing up a root (existing snapshots are unaffected)
    Delroot {
        /// Root path to remove
        root: PathBuf,
    },

    /// List the configured backup roots
    Listroots,

    /// Scan all tracked paths for changes
    Scan,

    /// Upload changed entries and record one snapshot per root
    Backup {
        /// Process everything on one thread (for debugging)
        #[arg(long)]
        single: bool,
    },

    /// List recorded snapshots
    Snapshots,

    /// Restore a snapshot into a directory
    Restore {
        /// Snapshot id (see `snapshots`)
        snapshot: i64,

        /// Directory to restore into
        #[arg(short, long)]
        output: PathBuf,

        /// Decryption password (or set HOLDFAST_PASSWORD)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Delete objects no snapshot reaches
    Gc,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(&cli) {
        eprintln!("{} {}", colored::Colorize::red("error:"), e);
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        tracing::Level::ERROR
    } else {
        match cli.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Init {
            storage_path,
            compress,
            encrypt,
            password,
        } => cmd_init(cli, storage_path, *compress, *encrypt, password.as_deref()),
        Command::Addroot { roots, skip_scan } => cmd_addroot(cli, roots, *skip_scan),
        Command::Delroot { root } => cmd_delroot(cli, root),
        Command::Listroots => cmd_listroots(cli),
        Command::Scan => cmd_scan(cli),
        Command::Backup { single } => cmd_backup(cli, *single),
        Command::Snapshots => cmd_snapshots(cli),
        Command::Restore {
            snapshot,
            output,
            password,
        } => cmd_restore(cli, *snapshot, output, password.as_deref()),
        Command::Gc => cmd_gc(cli),
    }
}

// ─── Command Implementations ────────────────────────────────────────────────

fn cmd_init(
    cli: &Cli,
    storage_path: &Path,
    compress: bool,
    encrypt: bool,
    password: Option<&str>,
) -> Result<()> {
    let keys = if encrypt {
        let password = resolve_password(password).ok_or_else(|| {
            Error::Config(
                "encryption requires a password (use --password or HOLDFAST_PASSWORD)".into(),
            )
        })?;
        eprintln!("  Generating encryption keys…");
        let keys = KeyConfig::generate(&password)?;
        eprintln!("  Do not lose your password; you will need it to restore.");
        Some(keys)
    } else {
        None
    };

    Repository::create(
        &cli.cache,
        StorageConfig::Local {
            base_dir: storage_path.to_path_buf(),
        },
        compress,
        keys,
    )?;

    eprintln!(
        "{} Initialized repository (cache: {})",
        colored::Colorize::green("✓"),
        cli.cache.display(),
    );
    eprintln!("  Next step: add some backup roots with the 'addroot' command");
    Ok(())
}

fn cmd_addroot(cli: &Cli, roots: &[PathBuf], skip_scan: bool) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;
    let cache = repo.cache();

    let tx = cache.immediate()?;
    for root in roots {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Config(format!("cannot resolve {}: {e}", root.display())))?;
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "not a directory: {}",
                root.display()
            )));
        }
        cache.add_root(&root)?;
        eprintln!("{} Added root: {}", colored::Colorize::green("✓"), root.display());
    }
    tx.commit()?;

    if skip_scan {
        eprintln!("  Skipping scan; make sure you run a scan before a backup.");
        return Ok(());
    }

    eprintln!("  Scanning new roots (the first scan builds the metadata cache)…");
    let pb = spinner("scan");
    let scanned = scan(
        cache,
        &mut |done, _total| {
            pb.set_position(done);
        },
        true,
    )?;
    pb.finish_and_clear();
    eprintln!("  {} entries added to the backup set", scanned);
    Ok(())
}

fn cmd_delroot(cli: &Cli, root: &Path) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;
    let root = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());

    if repo.cache().remove_root(&root)? {
        eprintln!("{} Removed root: {}", colored::Colorize::green("✓"), root.display());
    } else {
        return Err(Error::Config(format!(
            "not a backup root: {}",
            root.display()
        )));
    }
    Ok(())
}

fn cmd_listroots(cli: &Cli) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;
    let roots = repo.cache().roots()?;
    if roots.is_empty() {
        eprintln!("No backup roots configured.");
        return Ok(());
    }
    for root in roots {
        println!("{}", root.printable_path());
    }
    Ok(())
}

fn cmd_scan(cli: &Cli) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;

    let pb = spinner("scan");
    let scanned = scan(
        repo.cache(),
        &mut |done, total| {
            if let Some(total) = total {
                pb.set_length(total);
            }
            pb.set_position(done);
        },
        false,
    )?;
    pb.finish_and_clear();

    eprintln!(
        "{} Scanned {} entries; {} need backup",
        colored::Colorize::green("✓"),
        scanned,
        repo.cache().dirty_count()?,
    );
    Ok(())
}

fn cmd_backup(cli: &Cli, single: bool) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;

    let cancel = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(&cancel);

    let total = repo.cache().dirty_count()?;
    let pb = bar(total, "backup");
    let stats = backup(
        &repo,
        &mut |done, _total| {
            pb.set_position(done);
        },
        &BackupOptions {
            single,
            cancel: Some(cancel),
        },
    )?;
    pb.finish_and_clear();

    if stats.interrupted {
        eprintln!(
            "{} Backup interrupted: {}/{} entries processed; the rest stay queued",
            colored::Colorize::yellow("⚠"),
            stats.processed,
            stats.total,
        );
    } else {
        eprintln!(
            "{} Backed up {} entries, wrote {} snapshot(s)",
            colored::Colorize::green("✓"),
            stats.processed,
            stats.snapshots,
        );
    }
    Ok(())
}

fn cmd_snapshots(cli: &Cli) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;
    let snapshots = repo.cache().snapshots()?;
    if snapshots.is_empty() {
        eprintln!("No snapshots recorded.");
        return Ok(());
    }

    eprintln!("{:>4}  {:19}  {}", "#", "Date", "Root path");
    eprintln!("{}", "─".repeat(60));
    for snap in snapshots {
        let date = chrono::DateTime::from_timestamp(snap.date, 0)
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| snap.date.to_string());
        eprintln!(
            "{:>4}  {:19}  {}",
            snap.id,
            date,
            String::from_utf8_lossy(snap.path.as_os_str().as_encoded_bytes()),
        );
    }
    Ok(())
}

fn cmd_restore(cli: &Cli, snapshot_id: i64, output: &Path, password: Option<&str>) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;

    let snapshot = repo
        .cache()
        .snapshot(snapshot_id)?
        .ok_or_else(|| Error::Config(format!("no such snapshot: {snapshot_id}")))?;

    let key = if repo.encrypter().key_required() {
        let password = resolve_password(password).ok_or_else(|| {
            Error::Config(
                "this repository is encrypted; a password is required \
                 (use --password or HOLDFAST_PASSWORD)"
                    .into(),
            )
        })?;
        Some(repo.unlock_key(&password)?)
    } else {
        None
    };

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    eprintln!(
        "  Restoring snapshot {} of {} into {}",
        snapshot_id,
        String::from_utf8_lossy(snapshot.path.as_os_str().as_encoded_bytes()),
        output.display(),
    );
    restore_snapshot(&repo, &snapshot, output, key.as_ref())?;
    eprintln!("{} Restore finished (best-effort; see log for any skips)", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_gc(cli: &Cli) -> Result<()> {
    let repo = Repository::open(&cli.cache)?;

    let cancel = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(&cancel);

    let pb = spinner("gc");
    let stats = collect_garbage(
        &repo,
        &mut |deleted, _| {
            pb.set_position(deleted);
        },
        Some(&cancel),
    )?;
    pb.finish_and_clear();

    if stats.deleted > 0 {
        eprint!("  Running database vacuum…");
        repo.cache().vacuum()?;
        eprintln!(" done");
    }

    eprintln!(
        "{} Deleted {} garbage object(s), reclaimed {} bytes",
        colored::Colorize::green("✓"),
        stats.deleted,
        stats.bytes_reclaimed,
    );
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn resolve_password(flag: Option<&str>) -> Option<String> {
    flag.map(String::from)
        .or_else(|| std::env::var("HOLDFAST_PASSWORD").ok())
}

fn install_interrupt_handler(cancel: &Arc<AtomicBool>) {
    let cancel = Arc::clone(cancel);
    let result = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Ctrl-C caught. Finishing in-flight work, please wait…");
        cancel.store(true, Ordering::SeqCst);
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
}

fn bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "  {{spinner:.green}} {label} [{{bar:30.cyan/dim}}] {{pos}}/{{len}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}

fn spinner(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template(&format!("  {{spinner:.green}} {label} {{pos}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb
}
