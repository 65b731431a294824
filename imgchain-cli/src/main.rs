use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::env::VarError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use imgchain_core::dispatch::{
    execute, Action, Collaborators, DumpRequest, Outcome, RestoreOutcome, RestoreRequest, VerifyRequest,
};
use imgchain_core::dump::{FileFormat, StreamSummary};
use imgchain_core::progress::ProgressReporter;
use imgchain_core::{ChainSource, DecodeLimits, ResolveOptions, SessionOptions, TargetFormat, VerificationReport};

const DEFAULT_CHUNK: usize = 4 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "IMGCHAIN_LOG_FORMAT";

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => <Self as ValueEnum>::from_str(value.trim(), true)
                .map(Some)
                .map_err(|_| anyhow::anyhow!("invalid {}={value:?}; expected one of: human, json", Self::ENV_KEY)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => bail!("{} contains non-UTF-8 bytes", Self::ENV_KEY),
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override.or(LogFormat::from_env()?).unwrap_or(LogFormat::Human);
    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }
    Ok(format)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Raw,
    Sparse,
}

impl From<FormatArg> for TargetFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Raw => TargetFormat::Raw,
            FormatArg::Sparse => TargetFormat::Sparse,
        }
    }
}

#[derive(Parser)]
#[command(name = "imgchain", version, about = "Restore and verify disk images from incremental backup chains")]
struct Cli {
    /// Log output format. Precedence: `--log-format` > `IMGCHAIN_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args)]
struct Selection {
    /// Backup-set directory
    input: PathBuf,
    /// Explicit comma-separated list of files to use, in order
    #[arg(long)]
    sequence: Option<String>,
    /// Only disks whose name matches this glob
    #[arg(long)]
    disk: Option<String>,
}

impl Selection {
    fn source(&self) -> ChainSource {
        match &self.sequence {
            Some(list) => ChainSource::sequence(&self.input, list),
            None => ChainSource::Directory(self.input.clone()),
        }
    }

    fn resolve(&self, until: Option<u32>) -> ResolveOptions {
        ResolveOptions { disk: self.disk.clone(), checkpoint: until }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Print header and frame index of each backup file
    Dump {
        #[command(flatten)]
        sel: Selection,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Recompute recorded checksums without restoring
    Verify {
        #[command(flatten)]
        sel: Selection,
        /// Point in time: only links up to this checkpoint
        #[arg(long)]
        until: Option<u32>,
        /// Also check restored <disk>.img files in this directory
        #[arg(long)]
        image_dir: Option<PathBuf>,
    },
    /// Rebuild disk images
    Restore {
        #[command(flatten)]
        sel: Selection,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        until: Option<u32>,
        /// Copy raw full backups byte-for-byte
        #[arg(long, default_value_t = false)]
        raw: bool,
        #[arg(long, default_value_t = false)]
        preallocate: bool,
        #[arg(long, value_enum, default_value_t = FormatArg::Raw)]
        format: FormatArg,
        #[arg(long, default_value_t = DEFAULT_CHUNK)]
        chunk_size: usize,
        /// Restore disks one after another
        #[arg(long, default_value_t = false)]
        sequential: bool,
        /// Do not copy the config snapshot
        #[arg(long, default_value_t = false)]
        no_config: bool,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    debug!(?log_format, "logging initialised");
    match cli.cmd {
        Cmd::Dump { sel, json } => dump(&sel, json)?,
        Cmd::Verify { sel, until, image_dir } => verify(&sel, until, image_dir)?,
        Cmd::Restore { sel, output, until, raw, preallocate, format, chunk_size, sequential, no_config, progress } => {
            let session = SessionOptions {
                raw_passthrough: raw,
                preallocate,
                format: format.into(),
                chunk_size,
                limits: DecodeLimits::default(),
            };
            let mut req = RestoreRequest::new(sel.source(), output);
            req.resolve = sel.resolve(until);
            req.session = session;
            req.copy_config = !no_config;
            // no hypervisor client is wired into the command line
            req.define = false;
            req.parallel = !sequential;
            restore(req, progress)?;
        }
    }
    Ok(())
}

fn input_context(sel: &Selection) -> String {
    format!("backup set {}", sel.input.display())
}

fn dump(sel: &Selection, json: bool) -> Result<()> {
    let action = Action::Dump(DumpRequest {
        source: sel.source(),
        resolve: sel.resolve(None),
        limits: DecodeLimits::default(),
    });
    let Outcome::Dumped(summaries) = execute(action, &Collaborators::default()).with_context(|| input_context(sel))?
    else {
        bail!("unexpected outcome for dump");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    for s in &summaries {
        print_summary(s);
    }
    Ok(())
}

fn print_summary(s: &StreamSummary) {
    let label = s.label.as_deref().unwrap_or("-");
    println!("{}: disk={} kind={} label={} seq={} size={}", s.file, s.disk, s.kind, label, s.sequence, s.file_size);
    let Some(meta) = &s.metadata else {
        if s.format == FileFormat::Raw {
            println!("  raw image");
        }
        return;
    };
    println!(
        "  stream v{} virtual-size={} compressed={} checksum={} checkpoint={} parent={} date={}",
        meta.stream_version,
        meta.virtual_size,
        meta.compressed,
        meta.checksum.as_str(),
        meta.checkpoint_name.as_deref().unwrap_or("-"),
        meta.parent_checkpoint.as_deref().unwrap_or("-"),
        meta.date,
    );
    println!(
        "  data: {} frames, {} bytes; zero: {} frames, {} bytes",
        s.data_frames, s.data_bytes, s.zero_frames, s.zero_bytes
    );
    for f in &s.frames {
        println!("    {:<4} off={:#014x} len={:<12} at={}", f.kind.tag(), f.offset, f.length, f.position);
    }
}

fn verify(sel: &Selection, until: Option<u32>, image_dir: Option<PathBuf>) -> Result<()> {
    let action = Action::Verify(VerifyRequest {
        source: sel.source(),
        resolve: sel.resolve(until),
        limits: DecodeLimits::default(),
        image_dir,
    });
    let outcome = execute(action, &Collaborators::default()).with_context(|| input_context(sel))?;
    let Outcome::Verified(reports) = &outcome else {
        bail!("unexpected outcome for verify");
    };
    for r in reports {
        print_report(r);
    }
    if !outcome.is_success() {
        let n: usize = reports.iter().map(|r| r.mismatches.len()).sum();
        bail!("verification failed: {n} mismatches");
    }
    Ok(())
}

fn print_report(r: &VerificationReport) {
    let what = match &r.image {
        Some(img) => format!("image {}", img.display()),
        None => "backup files".to_string(),
    };
    println!(
        "{}: {} ({} files): {} checked, {} unchecked, {} mismatches",
        r.disk,
        what,
        r.files,
        r.blocks_checked,
        r.blocks_unchecked,
        r.mismatches.len()
    );
    for m in &r.mismatches {
        println!(
            "  MISMATCH {} off={:#x} len={} expected={} actual={}",
            m.path.display(),
            m.offset,
            m.length,
            m.expected,
            m.actual
        );
    }
}

fn restore(req: RestoreRequest, show_progress: bool) -> Result<()> {
    let input = req.source.dir().to_path_buf();
    let collab = Collaborators { progress: ProgressReporter::new(show_progress), ..Collaborators::default() };
    let outcome = execute(Action::Restore(req), &collab)
        .with_context(|| format!("backup set {}", input.display()))?;
    let Outcome::Restored(r) = &outcome else {
        bail!("unexpected outcome for restore");
    };
    print_restore(r, &input);
    info!(disks = r.disks.len(), failed = r.failed().count(), "restore finished");
    if !outcome.is_success() {
        bail!("{} of {} disks failed to restore", r.failed().count(), r.disks.len());
    }
    Ok(())
}

fn print_restore(r: &RestoreOutcome, input: &Path) {
    if r.disks.is_empty() {
        println!("nothing to restore from {}", input.display());
    }
    for d in &r.disks {
        match &d.result {
            Ok(s) => println!(
                "{} -> {}: {} links, {} bytes, {} data bytes, {} zero bytes",
                d.disk,
                d.target.display(),
                s.links_applied,
                s.logical_size,
                s.applied.data_bytes + s.raw_bytes,
                s.applied.zero_bytes
            ),
            Err(e) => println!("{} -> {}: FAILED: {e}", d.disk, d.target.display()),
        }
    }
    if let Some(cfg) = &r.config {
        println!("config -> {}", cfg.display());
    }
}
