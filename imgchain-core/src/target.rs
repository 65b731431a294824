use crate::error::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk representation of a restored disk.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    /// Plain image; zero-runs are written as zero bytes.
    #[default]
    Raw,
    /// Allocate-on-write image: sized up front without allocating, zero-runs
    /// are deallocated when the writer can punch holes.
    Sparse,
}

/// Positional writer over a target image. Implemented for local files and
/// by remote sinks.
pub trait ImageWriter: Send {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    /// Reserve storage for the first `len` bytes, extending the image if needed.
    fn allocate(&mut self, len: u64) -> io::Result<()>;
    /// Deallocate a range so it reads back as zeros. `Ok(false)` when the
    /// writer cannot do this; callers then write zeros instead.
    fn punch_hole(&mut self, offset: u64, len: u64) -> io::Result<bool>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Destination on another host. Restored bytes flow through the writers it
/// hands out with the same write-at-offset semantics as a local file.
pub trait RemoteSink: Sync {
    fn exists(&self, path: &Path) -> io::Result<bool>;
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    fn create(&self, path: &Path) -> io::Result<Box<dyn ImageWriter>>;
}

/// Local image file, created fresh and exclusively locked while open.
pub struct LocalImage {
    file: File,
}

impl LocalImage {
    pub fn create_new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        FileExt::try_lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl ImageWriter for LocalImage {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn allocate(&mut self, len: u64) -> io::Result<()> {
        FileExt::allocate(&self.file, len)
    }

    fn punch_hole(&mut self, offset: u64, len: u64) -> io::Result<bool> {
        punch_hole(&self.file, offset, len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Drop for LocalImage {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let (Ok(off), Ok(n)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len)) else {
        return Ok(false);
    };
    // SAFETY: the descriptor stays open for the duration of the call and
    // fallocate does not touch user memory.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            off,
            n,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<bool> {
    Ok(false)
}

/// Where and how to materialise one disk.
#[derive(Clone, Debug)]
pub struct TargetSpec {
    pub path: PathBuf,
    pub format: TargetFormat,
    pub preallocate: bool,
    /// Upper bound on a single write or zero-fill call.
    pub chunk_size: usize,
}

/// The image being written for one disk. Owned by exactly one session.
///
/// The image only grows through explicit `set_len`/`allocate` calls at the
/// end offsets of the extents being applied, and to the logical size when
/// finalised.
pub struct DiskTarget {
    pub disk: String,
    pub path: PathBuf,
    pub logical_size: u64,
    pub format: TargetFormat,
    pub preallocate: bool,
    chunk_size: usize,
    writer: Box<dyn ImageWriter>,
    allocated: u64,
    zeros: Vec<u8>,
}

fn write_err(disk: &str, offset: u64, source: io::Error) -> Error {
    Error::Restore { disk: disk.to_string(), offset, source }
}

impl DiskTarget {
    /// Create a new local image at `spec.path`. Refuses to replace anything.
    pub fn create_local(disk: &str, spec: &TargetSpec, logical_size: u64) -> Result<Self> {
        if spec.path.exists() {
            return Err(Error::TargetExists { path: spec.path.clone() });
        }
        let writer = LocalImage::create_new(&spec.path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::TargetExists { path: spec.path.clone() },
            _ => write_err(disk, 0, e),
        })?;
        Self::with_writer(disk, spec, logical_size, Box::new(writer))
    }

    /// Create the image through a remote sink.
    pub fn create_remote(
        disk: &str,
        spec: &TargetSpec,
        logical_size: u64,
        sink: &dyn RemoteSink,
    ) -> Result<Self> {
        let exists = sink.exists(&spec.path).map_err(|e| Error::Collaborator(e.to_string()))?;
        if exists {
            return Err(Error::TargetExists { path: spec.path.clone() });
        }
        let writer = sink.create(&spec.path).map_err(|e| Error::Collaborator(e.to_string()))?;
        Self::with_writer(disk, spec, logical_size, writer)
    }

    pub fn with_writer(
        disk: &str,
        spec: &TargetSpec,
        logical_size: u64,
        mut writer: Box<dyn ImageWriter>,
    ) -> Result<Self> {
        if spec.preallocate {
            writer.allocate(logical_size).map_err(|e| write_err(disk, 0, e))?;
        } else if spec.format == TargetFormat::Sparse {
            writer.set_len(logical_size).map_err(|e| write_err(disk, 0, e))?;
        }
        let allocated = writer.len().map_err(|e| write_err(disk, 0, e))?;
        debug!(
            disk,
            path = %spec.path.display(),
            logical_size,
            format = ?spec.format,
            preallocate = spec.preallocate,
            "created target"
        );
        Ok(Self {
            disk: disk.to_string(),
            path: spec.path.clone(),
            logical_size,
            format: spec.format,
            preallocate: spec.preallocate,
            chunk_size: spec.chunk_size.max(4096),
            writer,
            allocated,
            zeros: Vec::new(),
        })
    }

    /// Whether zero-runs are deallocated rather than written.
    pub fn punches_holes(&self) -> bool {
        self.format == TargetFormat::Sparse && !self.preallocate
    }

    fn ensure_len(&mut self, at: u64, end: u64) -> Result<()> {
        if end > self.allocated {
            self.writer.set_len(end).map_err(|e| write_err(&self.disk, at, e))?;
            self.allocated = end;
        }
        Ok(())
    }

    pub fn write_data(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        self.ensure_len(offset, offset + payload.len() as u64)?;
        let mut at = offset;
        for chunk in payload.chunks(self.chunk_size) {
            self.writer.write_at(at, chunk).map_err(|e| write_err(&self.disk, at, e))?;
            at += chunk.len() as u64;
        }
        Ok(())
    }

    /// Make `[offset, offset+length)` read as zeros. Returns how many of
    /// those bytes were deallocated instead of written.
    pub fn zero_range(&mut self, offset: u64, length: u64) -> Result<u64> {
        let end = offset + length;
        // bytes past the current end read as zero once the image is extended
        let written_end = end.min(self.allocated);
        let mut punched = 0;
        if written_end > offset {
            let span = written_end - offset;
            if self.punches_holes()
                && self.writer.punch_hole(offset, span).map_err(|e| write_err(&self.disk, offset, e))?
            {
                punched = span;
            } else {
                self.write_zeros(offset, written_end)?;
            }
        }
        self.ensure_len(offset, end)?;
        Ok(punched)
    }

    fn write_zeros(&mut self, start: u64, end: u64) -> Result<()> {
        if self.zeros.is_empty() {
            self.zeros = vec![0u8; self.chunk_size];
        }
        let mut at = start;
        while at < end {
            let n = (end - at).min(self.zeros.len() as u64) as usize;
            self.writer.write_at(at, &self.zeros[..n]).map_err(|e| write_err(&self.disk, at, e))?;
            at += n as u64;
        }
        Ok(())
    }

    /// Extend to the logical size, flush, and release the writer.
    pub fn finalize(mut self) -> Result<u64> {
        let size = self.logical_size;
        self.ensure_len(size, size)?;
        self.writer.flush().map_err(|e| write_err(&self.disk, size, e))?;
        Ok(self.allocated)
    }
}
