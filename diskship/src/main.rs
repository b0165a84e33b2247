use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;
use dialoguer::{Input, theme::ColorfulTheme};
use diskship_core::{
    BlockDevice, CancelToken, Confirm, DiskSizeProbe, ExportOutcome, ExportRequest, Exporter,
    LinePrompt, LocalObjectStore, ObjectPath,
};
use std::io::{self, IsTerminal, stdin, stdout};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "diskship")]
#[command(about = "Stream a block device into a compressed archive in object storage", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a block device as a tar.gz object
    Export(ExportArgs),
    /// Print the exact size of a block device
    Probe {
        /// Block device to measure
        #[arg(required = true)]
        device: PathBuf,
    },
}

#[derive(Args)]
struct ExportArgs {
    /// Block device to export (e.g. /dev/sdb)
    #[arg(short, long, env = "DISKSHIP_DEVICE")]
    device: PathBuf,

    /// Destination object, as scheme://bucket/object-key
    #[arg(short = 'o', long, env = "DISKSHIP_DESTINATION")]
    destination: String,

    /// Comma-separated license identifiers to embed in manifest.json
    #[arg(short, long, value_delimiter = ',')]
    licenses: Vec<String>,

    /// Gzip level, from 1 (fastest) to 9 (smallest)
    #[arg(short = 'c', long, default_value_t = 6)]
    level: u32,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,

    /// Directory where buckets are mounted; objects land in <root>/<bucket>/<key>
    #[arg(long, env = "DISKSHIP_STORE_ROOT")]
    store_root: PathBuf,

    /// Seconds between progress lines, 0 to disable
    #[arg(long, default_value_t = 1)]
    progress_interval: u64,
}

/// On Unix, hides the `^C` echo while an export runs so the cancellation message
/// stays readable. The terminal settings are restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original) = &self.original {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

/// Interactive yes/no prompt for terminals.
struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&mut self, destination: &ObjectPath, disk_size: u64) -> diskship_core::Result<bool> {
        println!(
            "{} This will upload {} bytes ({:.1} GB) to:",
            style("NOTE:").yellow().bold(),
            disk_size,
            disk_size as f64 / (1024.0 * 1024.0 * 1024.0),
        );
        println!("  Destination: {}", style(destination).cyan());
        println!();

        let answer = Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Proceed? [y/N]")
            .allow_empty(true)
            .interact_text()
            .map_err(|e| diskship_core::Error::Prompt(io::Error::other(e)))?;

        Ok(diskship_core::confirm::is_affirmative(&answer))
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("diskship={level},diskship_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_export(args: ExportArgs, cancel: CancelToken) -> Result<()> {
    // Validate everything before the device is touched.
    let request = ExportRequest::new(
        args.device,
        &args.destination,
        args.licenses,
        args.level,
        !args.yes,
    )?;

    let device = BlockDevice::open(request.device())?;
    let store = LocalObjectStore::new(&args.store_root);
    tracing::debug!(
        device = %device.path().display(),
        store_root = %args.store_root.display(),
        "opened device and object store"
    );

    println!("  Device:      {}", style(device.path().display()).cyan());
    println!("  Destination: {}", style(request.destination()).cyan());
    if !request.licenses().is_empty() {
        println!("  Licenses:    {}", request.licenses().join(", "));
    }
    println!("  Level:       {}", request.level().get());
    println!();

    let interval = (args.progress_interval > 0).then(|| Duration::from_secs(args.progress_interval));
    let mut exporter = Exporter::new(request)
        .with_cancel_token(cancel)
        .with_progress_interval(interval);

    let mut prompt: Box<dyn Confirm> = if stdin().is_terminal() {
        Box::new(TerminalPrompt)
    } else {
        Box::new(LinePrompt::new(stdin().lock(), stdout()))
    };

    let outcome = exporter
        .run(device, &store, Some(prompt.as_mut()), |line| println!("{line}"))
        .with_context(|| match exporter.failed_during() {
            Some(phase) => format!("export failed during {phase}"),
            None => "export failed".to_string(),
        })?;

    match outcome {
        ExportOutcome::Completed(summary) => {
            let ratio = if summary.bytes_read > 0 {
                summary.bytes_uploaded as f64 / summary.bytes_read as f64 * 100.0
            } else {
                0.0
            };
            println!(
                "\n✨ Exported {} bytes to {} ({} bytes compressed, {:.1}%) in {:.1?}.",
                summary.disk_size,
                style(&summary.destination).cyan(),
                summary.bytes_uploaded,
                ratio,
                summary.elapsed,
            );
        }
        ExportOutcome::Declined => {
            println!("Export cancelled. Nothing was written.");
        }
    }

    Ok(())
}

fn run_probe(path: PathBuf) -> Result<()> {
    let mut device = BlockDevice::open(&path)?;
    let size = device.disk_size()?;
    println!(
        "{:<15} {} bytes ({:.1} GB)",
        device,
        size,
        size as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling export...");
        tracing::warn!("interrupt received, cancelling export");
        handler_token.cancel();
    })
    .context("failed to install Ctrl+C handler")?;

    match cli.command {
        Commands::Export(args) => run_export(args, cancel),
        Commands::Probe { device } => run_probe(device),
    }
}
