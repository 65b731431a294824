use crate::error::{Error, Result};
use crate::progress::ProgressReporter;
use crate::session::CancelToken;
use crate::stream::StreamFrame;
use crate::target::DiskTarget;
use serde::Serialize;
use std::path::Path;
use tracing::trace;

pub struct ApplyContext<'a> {
    pub cancel: &'a CancelToken,
    pub progress: &'a ProgressReporter,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub frames: u64,
    pub data_bytes: u64,
    pub zero_bytes: u64,
    /// Part of `zero_bytes` that was deallocated instead of written.
    pub punched_bytes: u64,
}

impl ApplyResult {
    pub fn merge(&mut self, other: &ApplyResult) {
        self.frames += other.frames;
        self.data_bytes += other.data_bytes;
        self.zero_bytes += other.zero_bytes;
        self.punched_bytes += other.punched_bytes;
    }
}

/// Replay one file's frames onto `target`, in stream order.
///
/// Earlier links' bytes may be overwritten freely. Each frame is applied
/// completely or the whole call fails; cancellation is only observed
/// between frames.
pub fn apply<I>(target: &mut DiskTarget, source: &Path, frames: I, ctx: &ApplyContext) -> Result<ApplyResult>
where
    I: IntoIterator<Item = Result<StreamFrame>>,
{
    let mut res = ApplyResult::default();
    for frame in frames {
        let frame = frame?;
        if let Some(ext) = frame.extent() {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled { disk: target.disk.clone(), offset: ext.offset });
            }
        }
        match frame {
            StreamFrame::Metadata(meta) => {
                if meta.virtual_size != target.logical_size {
                    return Err(Error::SizeMismatch {
                        disk: target.disk.clone(),
                        path: source.to_path_buf(),
                        expected: target.logical_size,
                        actual: meta.virtual_size,
                    });
                }
            }
            StreamFrame::Data(d) => {
                trace!(offset = d.extent.offset, len = d.extent.length, "data");
                target.write_data(d.extent.offset, &d.payload)?;
                res.data_bytes += d.extent.length;
                ctx.progress.add_bytes(d.extent.length);
            }
            StreamFrame::Zero(e) => {
                trace!(offset = e.offset, len = e.length, "zero");
                res.punched_bytes += target.zero_range(e.offset, e.length)?;
                res.zero_bytes += e.length;
            }
            StreamFrame::Stop => {
                res.frames += 1;
                break;
            }
        }
        res.frames += 1;
    }
    Ok(res)
}
