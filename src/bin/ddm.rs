//! `ddm` command-line front end.
//!
//! Thin glue over the `dirtree` and `engine` crates: argument parsing,
//! tracing setup, and exit-code mapping. Exit codes: 0 no action/no diff,
//! 1 recoverable or diff found, 2 unrecoverable or bit rot, 10 I/O or
//! argument error, 100 usage error.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use dirtree::{diff2, diff3, tracing_warning_sink, CompareOpt, DirectoryTree, ScanOpt};
use engine::{EngineError, StdinPrompter, TreeManager};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ddm",
    version,
    about = "Directory backup and integrity verification with two redundant metadata manifests",
    after_help = "\
A backup maintained by ddm consists of three witnesses: the backup directory
content plus two copies of a metadata manifest describing every file,
directory and symbolic link under it. 'scrub' reconciles the witnesses
two-against-one to detect and repair silent corruption; 'backup' makes the
backup equal to the source while keeping the manifests in sync."
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory (or re-serialize a manifest) in the manifest format
    Ls {
        /// Directory to list, or manifest file to re-serialize
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Omit content hashes from the listing
        #[arg(short = 'n', long = "omit-hash")]
        omit_hash: bool,

        /// Write the listing to this file instead of stdout; the file must
        /// not already exist
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Compare two or three directories and/or manifest files
    Diff {
        /// Directories to scan or manifest files to parse
        #[arg(num_args = 2..=3)]
        paths: Vec<PathBuf>,

        /// Omit content hashes while scanning
        #[arg(short = 'n', long = "omit-hash")]
        omit_hash: bool,

        /// Write the diff to this file instead of stdout; the file must
        /// not already exist
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Fields to ignore, comma- or space-separated:
        /// perm, owner, mtime, size, hash, symlink, all
        #[arg(short, long)]
        ignore: Option<String>,
    },

    /// Verify the backup directory against its two metadata manifests
    Scrub {
        /// Source directory, used to rescue lost backup entries
        #[arg(short, long, requires = "target")]
        source: Option<PathBuf>,

        /// Backup directory to scrub
        #[arg(short = 't', long)]
        target: PathBuf,

        /// First copy of the metadata manifest
        meta1: PathBuf,

        /// Second copy of the metadata manifest
        meta2: PathBuf,

        /// Attempt to fix inconsistencies in the backup directory
        #[arg(long)]
        fixup: bool,

        /// Scan source and backup sequentially instead of in parallel
        #[arg(long)]
        singlethread: bool,
    },

    /// Make the backup directory equal to the source directory
    Backup {
        /// Source directory (never written to)
        #[arg(short, long)]
        source: PathBuf,

        /// Backup directory
        #[arg(short = 't', long)]
        target: PathBuf,

        /// The two metadata manifest files; omit both for a plain backup
        /// without integrity tracking
        #[arg(num_args = 0..=2)]
        metadata: Vec<PathBuf>,

        /// Attempt to fix inconsistencies found by the pre-backup scrub
        #[arg(long)]
        fixup: bool,

        /// Skip hashing unchanged files during the scan (hashes are
        /// recomputed for the manifest afterwards)
        #[arg(short = 'n', long = "omit-hash")]
        omit_hash: bool,

        /// Scan source and backup sequentially instead of in parallel
        #[arg(long)]
        singlethread: bool,
    },
}

const EXIT_IO: u8 = 10;
const EXIT_USAGE: u8 = 100;

#[derive(Debug)]
enum AppError {
    Engine(EngineError),
    Tree(dirtree::TreeError),
    Io { op: &'static str, path: PathBuf, source: io::Error },
    OutputExists(PathBuf),
    Usage(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(error) => error.fmt(f),
            Self::Tree(error) => error.fmt(f),
            Self::Io { op, path, source } => {
                write!(f, "failed to {op} '{}': {source}", path.display())
            }
            Self::OutputExists(path) => {
                write!(f, "output file '{}' already exists, aborting", path.display())
            }
            Self::Usage(message) => f.write_str(message),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(error: EngineError) -> Self {
        Self::Engine(error)
    }
}

impl From<dirtree::TreeError> for AppError {
    fn from(error: dirtree::TreeError) -> Self {
        Self::Tree(error)
    }
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            _ => EXIT_IO,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = error.print();
            return ExitCode::from(code);
        }
    };
    init_tracing(cli.verbose);
    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::from(error.exit_code())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .init();
}

fn run(command: Commands) -> Result<u8, AppError> {
    match command {
        Commands::Ls {
            path,
            omit_hash,
            out,
        } => cmd_ls(&path, omit_hash, out.as_deref()),
        Commands::Diff {
            paths,
            omit_hash,
            out,
            ignore,
        } => cmd_diff(&paths, omit_hash, out.as_deref(), ignore.as_deref()),
        Commands::Scrub {
            source,
            target,
            meta1,
            meta2,
            fixup,
            singlethread,
        } => cmd_scrub(
            source.as_deref(),
            &target,
            &meta1,
            &meta2,
            fixup,
            !singlethread,
        ),
        Commands::Backup {
            source,
            target,
            metadata,
            fixup,
            omit_hash,
            singlethread,
        } => cmd_backup(&source, &target, &metadata, fixup, omit_hash, !singlethread),
    }
}

fn scan_opt(omit_hash: bool) -> ScanOpt {
    if omit_hash {
        ScanOpt::OmitHash
    } else {
        ScanOpt::ComputeHash
    }
}

/// Opens `-o FILE` for writing, refusing to clobber an existing file, or
/// falls back to stdout.
fn open_output(out: Option<&Path>) -> Result<Box<dyn Write>, AppError> {
    match out {
        None => Ok(Box::new(io::stdout().lock())),
        Some(path) => {
            if path.exists() {
                return Err(AppError::OutputExists(path.to_path_buf()));
            }
            let file = fs::File::create(path).map_err(|source| AppError::Io {
                op: "create output file",
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Box::new(file))
        }
    }
}

fn cmd_ls(path: &Path, omit_hash: bool, out: Option<&Path>) -> Result<u8, AppError> {
    let tree = DirectoryTree::from_path(path, scan_opt(omit_hash), tracing_warning_sink())?;
    let mut writer = open_output(out)?;
    tree.write_to(&mut writer).map_err(|source| AppError::Io {
        op: "write listing to",
        path: out.unwrap_or_else(|| Path::new("<stdout>")).to_path_buf(),
        source,
    })?;
    Ok(0)
}

fn cmd_diff(
    paths: &[PathBuf],
    omit_hash: bool,
    out: Option<&Path>,
    ignore: Option<&str>,
) -> Result<u8, AppError> {
    let opt = match ignore {
        Some(ignore) => ignore.parse::<CompareOpt>()?,
        None => CompareOpt::default(),
    };
    let warnings = tracing_warning_sink();
    let trees: Vec<DirectoryTree> = paths
        .iter()
        .map(|path| DirectoryTree::from_path(path, scan_opt(omit_hash), warnings.clone()))
        .collect::<Result<_, _>>()?;

    let (rendered, found) = match trees.as_slice() {
        [a, b] => {
            let diff = diff2(a, b, &opt);
            (diff.to_string(), !diff.is_empty())
        }
        [a, b, c] => {
            let diff = diff3(a, b, c, &opt);
            (diff.to_string(), !diff.is_empty())
        }
        _ => unreachable!("clap enforces two or three paths"),
    };
    let mut writer = open_output(out)?;
    writer
        .write_all(rendered.as_bytes())
        .map_err(|source| AppError::Io {
            op: "write diff to",
            path: out.unwrap_or_else(|| Path::new("<stdout>")).to_path_buf(),
            source,
        })?;
    Ok(u8::from(found))
}

fn cmd_scrub(
    source: Option<&Path>,
    target: &Path,
    meta1: &Path,
    meta2: &Path,
    fixup: bool,
    parallel: bool,
) -> Result<u8, AppError> {
    tracing::info!(
        "scrubbing backup directory {} against metadata files {} and {}",
        target.display(),
        meta1.display(),
        meta2.display()
    );
    let warnings = tracing_warning_sink();
    let mut tm = match source {
        Some(source) => {
            tracing::info!("using source directory {}", source.display());
            TreeManager::with_source(
                source,
                target,
                meta1,
                meta2,
                ScanOpt::ComputeHash,
                parallel,
                &warnings,
            )?
        }
        None => {
            TreeManager::without_source(target, meta1, meta2, ScanOpt::ComputeHash, &warnings)?
        }
    };
    let mut prompter = StdinPrompter;
    let outcome = engine::scrub(&mut tm, fixup, &mut prompter);
    // Manifests marked for saving are flushed even when the engine bailed
    // out, so repairs made before the failure are not lost.
    let committed = tm.commit();
    let outcome = outcome?;
    committed?;
    Ok(outcome.exit_code())
}

fn cmd_backup(
    source: &Path,
    target: &Path,
    metadata: &[PathBuf],
    fixup: bool,
    omit_hash: bool,
    parallel: bool,
) -> Result<u8, AppError> {
    let warnings = tracing_warning_sink();
    let mut prompter = StdinPrompter;
    match metadata {
        [] => {
            tracing::info!(
                "backing up directory {} to directory {}",
                source.display(),
                target.display()
            );
            let outcome =
                engine::backup_plain(source, target, parallel, &warnings, &mut prompter)?;
            Ok(outcome.exit_code())
        }
        [meta1, meta2] => {
            tracing::info!(
                "backing up directory {} to directory {} with metadata files {} and {}",
                source.display(),
                target.display(),
                meta1.display(),
                meta2.display()
            );
            let mut tm = TreeManager::with_source(
                source,
                target,
                meta1,
                meta2,
                scan_opt(omit_hash),
                parallel,
                &warnings,
            )?;
            let outcome = engine::backup(&mut tm, fixup, !omit_hash, &mut prompter);
            let committed = tm.commit();
            let outcome = outcome?;
            committed?;
            Ok(outcome.exit_code())
        }
        _ => Err(AppError::Usage(
            "backup takes either no metadata files or exactly two".to_string(),
        )),
    }
}
