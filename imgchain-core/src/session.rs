use crate::apply::{apply, ApplyContext, ApplyResult};
use crate::chain::BackupChain;
use crate::error::{Error, Result};
use crate::progress::ProgressReporter;
use crate::stream::{DecodeLimits, FrameReader};
use crate::target::{DiskTarget, RemoteSink, TargetFormat, TargetSpec};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{info, info_span, warn};

/// Cooperative cancellation flag, checked between frames.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Copy a raw full image byte-for-byte instead of replaying frames.
    pub raw_passthrough: bool,
    pub preallocate: bool,
    pub format: TargetFormat,
    /// Upper bound for a single target write.
    pub chunk_size: usize,
    pub limits: DecodeLimits,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            raw_passthrough: false,
            preallocate: false,
            format: TargetFormat::Raw,
            chunk_size: 4 * 1024 * 1024,
            limits: DecodeLimits::default(),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct SessionResult {
    pub disk: String,
    pub target: PathBuf,
    pub logical_size: u64,
    pub links_applied: usize,
    /// Bytes copied by the raw passthrough path.
    pub raw_bytes: u64,
    pub applied: ApplyResult,
}

/// Rebuilds one disk by applying its chain, in order, onto a fresh target.
pub struct ReconstructionSession<'a> {
    options: &'a SessionOptions,
    progress: ProgressReporter,
    cancel: CancelToken,
    sink: Option<&'a dyn RemoteSink>,
}

struct Plan {
    logical_size: u64,
    raw_base: bool,
    total_bytes: u64,
}

impl<'a> ReconstructionSession<'a> {
    pub fn new(options: &'a SessionOptions, progress: ProgressReporter, cancel: CancelToken) -> Self {
        Self { options, progress, cancel, sink: None }
    }

    pub fn with_sink(mut self, sink: &'a dyn RemoteSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn link_failed(chain: &BackupChain, index: usize, source: Error) -> Error {
        Error::LinkFailed {
            disk: chain.disk.clone(),
            index,
            path: chain.links[index].path.clone(),
            source: Box::new(source),
        }
    }

    /// Read every link's header before touching the target so that corrupt
    /// headers and size conflicts fail early.
    fn plan(&self, chain: &BackupChain) -> Result<Plan> {
        let mut plan = Plan { logical_size: 0, raw_base: false, total_bytes: 0 };
        let raw_base = self.options.raw_passthrough
            && chain.raw_base().map_err(|e| Self::link_failed(chain, 0, e))?;
        for (i, link) in chain.links.iter().enumerate() {
            if i == 0 && raw_base {
                let len = std::fs::metadata(&link.path)
                    .map_err(|e| Self::link_failed(chain, 0, Error::io(&link.path, e)))?
                    .len();
                plan.raw_base = true;
                plan.logical_size = len;
                plan.total_bytes += len;
                continue;
            }
            let rd = FrameReader::open(&link.path, self.options.limits)
                .map_err(|e| Self::link_failed(chain, i, e))?;
            let meta = rd.metadata();
            if i == 0 {
                plan.logical_size = meta.virtual_size;
            } else if meta.virtual_size != plan.logical_size {
                let e = Error::SizeMismatch {
                    disk: chain.disk.clone(),
                    path: link.path.clone(),
                    expected: plan.logical_size,
                    actual: meta.virtual_size,
                };
                return Err(Self::link_failed(chain, i, e));
            }
            plan.total_bytes += meta.data_size;
        }
        Ok(plan)
    }

    pub fn run(&self, chain: &BackupChain, target_path: &Path) -> Result<SessionResult> {
        let span = info_span!("restore", disk = %chain.disk);
        let _enter = span.enter();

        let mut result = SessionResult {
            disk: chain.disk.clone(),
            target: target_path.to_path_buf(),
            logical_size: 0,
            links_applied: 0,
            raw_bytes: 0,
            applied: ApplyResult::default(),
        };
        if chain.is_empty() {
            info!("nothing to restore");
            return Ok(result);
        }

        let plan = self.plan(chain)?;
        result.logical_size = plan.logical_size;
        self.progress.add_links_total(chain.len() as u64);
        self.progress.add_bytes_total(plan.total_bytes);

        let spec = TargetSpec {
            path: target_path.to_path_buf(),
            format: self.options.format,
            preallocate: self.options.preallocate,
            chunk_size: self.options.chunk_size,
        };
        let mut target = match self.sink {
            Some(sink) => DiskTarget::create_remote(&chain.disk, &spec, plan.logical_size, sink)?,
            None => DiskTarget::create_local(&chain.disk, &spec, plan.logical_size)?,
        };
        info!(
            target = %target_path.display(),
            size = plan.logical_size,
            links = chain.len(),
            "restoring"
        );

        let ctx = ApplyContext { cancel: &self.cancel, progress: &self.progress };
        for (i, link) in chain.links.iter().enumerate() {
            let outcome = if i == 0 && plan.raw_base {
                self.copy_raw(&mut target, &link.path).map(|n| result.raw_bytes = n)
            } else {
                FrameReader::open(&link.path, self.options.limits)
                    .and_then(|rd| apply(&mut target, &link.path, rd, &ctx))
                    .map(|r| result.applied.merge(&r))
            };
            if let Err(e) = outcome {
                // the partially written target stays on disk for inspection
                warn!(link = %link.file_name(), error = %e, "restore stopped");
                return Err(Self::link_failed(chain, i, e));
            }
            result.links_applied += 1;
            self.progress.inc_link();
            info!(link = %link.file_name(), kind = %link.kind, "applied");
        }

        target.finalize()?;
        Ok(result)
    }

    fn copy_raw(&self, target: &mut DiskTarget, path: &Path) -> Result<u64> {
        let f = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut rd = BufReader::new(f);
        let mut buf = vec![0u8; self.options.chunk_size.max(4096)];
        let mut off = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled { disk: target.disk.clone(), offset: off });
            }
            let n = rd.read(&mut buf).map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            target.write_data(off, &buf[..n])?;
            off += n as u64;
            self.progress.add_bytes(n as u64);
        }
        Ok(off)
    }
}
