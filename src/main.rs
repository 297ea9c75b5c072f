use std::path::PathBuf;
use std::sync::Arc;

mod common;
mod compact;
mod convert;
mod error;
mod guestfs;
mod image;
mod lvm;
mod merge;
mod ploop;
mod resize;

use clap::{Parser, Subcommand};

use crate::common::cancel::{SignalGuard, Token};
use crate::common::paths::{is_ploop, resolve_disk_path};
use crate::common::units::{parse_size_mb, SizeUnit};
use crate::common::{log, Executor, LoggingExecutor, RealExecutor, Runner};
use crate::compact::{Compact, CompactInfo};
use crate::convert::{Convert, Preallocation};
use crate::error::{Error, Result};
use crate::resize::info::ResizeInfo;
use crate::resize::ResizeRequest;

/// Offline virtual disk image manipulation tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable information messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the commands that would run, without modifying anything
    #[arg(short = 'n', long = "dry-run", global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Change the virtual disk capacity
    Resize {
        /// New virtual disk size (N, NK, NM, NG or NT; default unit MiB)
        #[arg(long)]
        size: Option<String>,

        /// Resize the last partition and its filesystem as well
        #[arg(long = "resize_partition")]
        resize_partition: bool,

        /// Forcibly drop the suspended state
        #[arg(long)]
        force: bool,

        /// Display size estimates instead of resizing
        #[arg(short, long)]
        info: bool,

        /// Units for the estimates (K, M or G)
        #[arg(long)]
        units: Option<String>,

        /// Full path to the disk
        #[arg(long)]
        hdd: PathBuf,
    },
    /// Reclaim unused space from the image
    Compact {
        /// Forcibly drop the suspended state
        #[arg(long)]
        force: bool,

        /// Display block usage estimates instead of compacting
        #[arg(short, long)]
        info: bool,

        /// Full path to the disk
        #[arg(long)]
        hdd: PathBuf,
    },
    /// Collapse disk snapshots into a single image
    Merge {
        /// Merge external snapshots (default: internal)
        #[arg(long)]
        external: bool,

        /// Full path to the disk
        #[arg(long)]
        hdd: PathBuf,
    },
    /// Convert the image preallocation policy
    Convert {
        /// Convert to expanding (lazily allocated)
        #[arg(long)]
        expanding: bool,

        /// Convert to plain (fully allocated)
        #[arg(long)]
        plain: bool,

        /// Full path to the disk
        #[arg(long)]
        hdd: PathBuf,
    },
}

fn dispatch(command: Commands, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
    match command {
        Commands::Resize {
            size,
            resize_partition,
            force,
            info,
            units,
            hdd,
        } => {
            let disk = resolve_disk_path(&hdd)?;
            if info {
                let unit = units
                    .as_deref()
                    .map(SizeUnit::from_arg)
                    .transpose()?
                    .unwrap_or(SizeUnit::Mega);
                if is_ploop(&disk) {
                    return ploop::resize_info(&disk, runner);
                }
                ResizeInfo { disk, unit }.execute(runner, executor)
            } else {
                let size =
                    size.ok_or_else(|| Error::InvalidArgs("Target size not found".into()))?;
                let size_mb = parse_size_mb(&size)?;
                if is_ploop(&disk) {
                    return ploop::resize(&disk, size_mb, executor);
                }
                ResizeRequest {
                    disk,
                    size_mb,
                    resize_last_partition: resize_partition,
                    force,
                }
                .execute(runner, executor)
            }
        }
        Commands::Compact { force, info, hdd } => {
            let disk = resolve_disk_path(&hdd)?;
            if info {
                if is_ploop(&disk) {
                    return Err(ploop::unsupported());
                }
                CompactInfo { disk }.execute(runner, executor)
            } else {
                if is_ploop(&disk) {
                    return ploop::compact(&disk, executor);
                }
                Compact { disk, force }.execute(runner, executor)
            }
        }
        Commands::Merge { external, hdd } => {
            let disk = resolve_disk_path(&hdd)?;
            if is_ploop(&disk) {
                return ploop::merge(&disk, executor);
            }
            merge::run(&disk, external, runner, executor)
        }
        Commands::Convert {
            expanding,
            plain,
            hdd,
        } => {
            if expanding == plain {
                return Err(Error::InvalidArgs(
                    "Either --plain or --expanding must be specified".into(),
                ));
            }
            let disk = resolve_disk_path(&hdd)?;
            if is_ploop(&disk) {
                return Err(ploop::unsupported());
            }
            let preallocation = if plain {
                Preallocation::Plain
            } else {
                Preallocation::Expanding
            };
            Convert {
                disk,
                preallocation,
            }
            .execute(runner, executor)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let token = Token::new();
    let _signals = SignalGuard::install(Arc::clone(&token))?;

    let runner = Runner::new(&token);
    let executor: Arc<dyn Executor> = if cli.dry_run {
        Arc::new(LoggingExecutor)
    } else {
        Arc::new(RealExecutor::new(runner.clone()))
    };

    dispatch(cli.command, &runner, &executor)
}

fn main() {
    let cli = Cli::parse();
    log::init(cli.verbose);

    if let Err(err) = run(cli) {
        log::error(err.to_string());
        std::process::exit(err.exit_code());
    }
}
