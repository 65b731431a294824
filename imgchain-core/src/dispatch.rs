//! Entry point tying resolution, restore, verification and dump together.
//!
//! Each [`Action`] carries only what its execution needs; [`execute`]
//! resolves the chain set once and routes to the matching engine.
//! Hypervisor and transport concerns stay behind the collaborator traits.

use crate::chain::{config_snapshots, resolve, select_config, BackupChain, ChainSource, ResolveOptions};
use crate::dump::{dump, StreamSummary};
use crate::error::{Error, Result};
use crate::progress::ProgressReporter;
use crate::session::{CancelToken, ReconstructionSession, SessionOptions, SessionResult};
use crate::stream::DecodeLimits;
use crate::target::RemoteSink;
use crate::verify::{verify, verify_image, VerificationReport};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// File name the selected config snapshot is copied to in the output directory.
pub const RESTORED_CONFIG: &str = "vmconfig.xml";

/// Supplies domain configuration snapshots.
pub trait ConfigProvider {
    /// XML bytes of the snapshot for `sequence`, or the latest one for `None`.
    fn snapshot(&self, sequence: Option<u32>) -> Result<Option<Vec<u8>>>;
}

/// Hypervisor client used once every disk has been restored.
pub trait DomainClient {
    fn define_domain(&self, config: &[u8], autostart: bool) -> Result<bool>;
    fn refresh_pool(&self, path: &Path) -> Result<()>;
}

/// Reads `vmconfig*.xml` snapshots from a backup-set directory.
#[derive(Clone, Debug)]
pub struct DirConfigProvider {
    dir: PathBuf,
}

impl DirConfigProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ConfigProvider for DirConfigProvider {
    fn snapshot(&self, sequence: Option<u32>) -> Result<Option<Vec<u8>>> {
        let Some(snap) = select_config(config_snapshots(&self.dir)?, sequence) else {
            return Ok(None);
        };
        fs::read(&snap.path).map(Some).map_err(|e| Error::io(&snap.path, e))
    }
}

#[derive(Clone, Debug)]
pub struct DumpRequest {
    pub source: ChainSource,
    pub resolve: ResolveOptions,
    pub limits: DecodeLimits,
}

#[derive(Clone, Debug)]
pub struct VerifyRequest {
    pub source: ChainSource,
    pub resolve: ResolveOptions,
    pub limits: DecodeLimits,
    /// Also check restored `<disk>.img` files in this directory.
    pub image_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RestoreRequest {
    pub source: ChainSource,
    pub resolve: ResolveOptions,
    pub output: PathBuf,
    pub session: SessionOptions,
    /// Copy the matching config snapshot next to the restored images.
    pub copy_config: bool,
    /// Define the domain through the [`DomainClient`], if one is supplied.
    pub define: bool,
    /// Restore disks concurrently.
    pub parallel: bool,
}

impl RestoreRequest {
    pub fn new(source: ChainSource, output: impl Into<PathBuf>) -> Self {
        Self {
            source,
            resolve: ResolveOptions::default(),
            output: output.into(),
            session: SessionOptions::default(),
            copy_config: true,
            define: true,
            parallel: true,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Action {
    Dump(DumpRequest),
    Verify(VerifyRequest),
    Restore(RestoreRequest),
}

/// External services available to [`execute`]. All optional.
#[derive(Default)]
pub struct Collaborators<'a> {
    pub sink: Option<&'a dyn RemoteSink>,
    pub domain: Option<&'a dyn DomainClient>,
    /// Defaults to the snapshot selected while resolving the backup set.
    pub config: Option<&'a dyn ConfigProvider>,
    pub progress: ProgressReporter,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct DiskOutcome {
    pub disk: String,
    pub target: PathBuf,
    pub result: Result<SessionResult>,
}

#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub disks: Vec<DiskOutcome>,
    pub config: Option<PathBuf>,
    pub domain_defined: Option<bool>,
}

impl RestoreOutcome {
    pub fn failed(&self) -> impl Iterator<Item = &DiskOutcome> {
        self.disks.iter().filter(|d| d.result.is_err())
    }
}

#[derive(Debug)]
pub enum Outcome {
    Dumped(Vec<StreamSummary>),
    Verified(Vec<VerificationReport>),
    Restored(RestoreOutcome),
}

impl Outcome {
    /// False when verification found mismatches or any disk failed to restore.
    pub fn is_success(&self) -> bool {
        match self {
            Outcome::Dumped(_) => true,
            Outcome::Verified(reports) => reports.iter().all(VerificationReport::is_clean),
            Outcome::Restored(r) => r.failed().next().is_none(),
        }
    }
}

/// Chain and structural errors are returned as `Err`; per-disk restore
/// failures and checksum mismatches are reported inside the [`Outcome`].
pub fn execute(action: Action, collab: &Collaborators) -> Result<Outcome> {
    match action {
        Action::Dump(req) => {
            let set = resolve(&req.source, &req.resolve)?;
            let mut out = Vec::new();
            for chain in &set.chains {
                out.extend(dump(chain, req.limits)?);
            }
            Ok(Outcome::Dumped(out))
        }
        Action::Verify(req) => {
            let set = resolve(&req.source, &req.resolve)?;
            let mut reports = Vec::new();
            for chain in &set.chains {
                reports.push(verify(chain, req.limits)?);
                if let Some(dir) = &req.image_dir {
                    reports.push(verify_image(chain, &target_path(dir, chain), req.limits)?);
                }
            }
            Ok(Outcome::Verified(reports))
        }
        Action::Restore(req) => restore(&req, collab).map(Outcome::Restored),
    }
}

/// `<output>/<disk>.img`
pub fn target_path(output: &Path, chain: &BackupChain) -> PathBuf {
    output.join(format!("{}.img", chain.disk))
}

fn collab_err(e: std::io::Error) -> Error {
    Error::Collaborator(e.to_string())
}

fn restore(req: &RestoreRequest, collab: &Collaborators) -> Result<RestoreOutcome> {
    let set = resolve(&req.source, &req.resolve)?;
    let mut outcome = RestoreOutcome::default();
    if set.chains.is_empty() {
        info!("no disk matched the filter, nothing to restore");
        return Ok(outcome);
    }

    match collab.sink {
        Some(sink) => {
            if !sink.exists(&req.output).map_err(collab_err)? {
                sink.mkdir(&req.output).map_err(collab_err)?;
            }
        }
        None => fs::create_dir_all(&req.output).map_err(|e| Error::io(&req.output, e))?,
    }

    let (sink, progress, cancel) = (collab.sink, &collab.progress, &collab.cancel);
    let run_one = |chain: &BackupChain| {
        let target = target_path(&req.output, chain);
        let mut session = ReconstructionSession::new(&req.session, progress.clone(), cancel.clone());
        if let Some(sink) = sink {
            session = session.with_sink(sink);
        }
        let result = session.run(chain, &target);
        if let Err(e) = &result {
            error!(disk = %chain.disk, error = %e, "restore failed");
        }
        DiskOutcome { disk: chain.disk.clone(), target, result }
    };

    progress.set_stage("restore");
    progress.start();
    outcome.disks = if req.parallel && set.chains.len() > 1 {
        set.chains.par_iter().map(run_one).collect()
    } else {
        set.chains.iter().map(run_one).collect()
    };
    progress.stop();

    let failed = outcome.failed().count();
    if failed > 0 {
        warn!(failed, "not every disk was restored, skipping config and domain steps");
        return Ok(outcome);
    }
    if set.manual {
        if req.copy_config || req.define {
            info!("manual sequence, skipping config and domain steps");
        }
        return Ok(outcome);
    }
    if !req.copy_config && !req.define {
        return Ok(outcome);
    }

    let config = match collab.config {
        Some(p) => p.snapshot(set.checkpoint)?,
        None => match &set.config {
            Some(snap) => Some(fs::read(&snap.path).map_err(|e| Error::io(&snap.path, e))?),
            None => None,
        },
    };
    let Some(config) = config else {
        warn!("no config snapshot found, skipping config and domain steps");
        return Ok(outcome);
    };

    if req.copy_config {
        let dest = req.output.join(RESTORED_CONFIG);
        match sink {
            Some(sink) => {
                let mut w = sink.create(&dest).map_err(collab_err)?;
                w.write_at(0, &config).and_then(|_| w.flush()).map_err(collab_err)?;
            }
            None => fs::write(&dest, &config).map_err(|e| Error::io(&dest, e))?,
        }
        info!(path = %dest.display(), "copied config snapshot");
        outcome.config = Some(dest);
    }
    if req.define {
        if let Some(domain) = collab.domain {
            let defined = domain.define_domain(&config, set.autostart)?;
            domain.refresh_pool(&req.output)?;
            info!(defined, autostart = set.autostart, "domain definition done");
            outcome.domain_defined = Some(defined);
        }
    }
    Ok(outcome)
}
