use crate::chain::BackupChain;
use crate::digest::{crc32_hex, ChecksumKind};
use crate::error::{Error, Result};
use crate::stream::{DecodeLimits, Extent, FrameReader, StreamFrame};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COMPARE_CHUNK: usize = 1 << 20;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Backup file the frame came from.
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    pub expected: String,
    pub actual: String,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct VerificationReport {
    pub disk: String,
    /// Restored image checked against the chain, if any.
    pub image: Option<PathBuf>,
    pub files: usize,
    pub raw_files: usize,
    pub blocks_checked: u64,
    pub blocks_unchecked: u64,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    fn new(disk: &str) -> Self {
        Self { disk: disk.to_string(), ..Self::default() }
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    fn record(&mut self, m: Mismatch) {
        warn!(
            disk = %self.disk,
            file = %m.path.display(),
            offset = m.offset,
            expected = %m.expected,
            actual = %m.actual,
            "checksum mismatch"
        );
        self.mismatches.push(m);
    }
}

/// Walk every frame of every link and recompute recorded checksums.
///
/// Mismatches are collected across the whole chain. Structural decode
/// errors end the walk immediately.
pub fn verify(chain: &BackupChain, limits: DecodeLimits) -> Result<VerificationReport> {
    let mut rep = VerificationReport::new(&chain.disk);
    let raw_base = chain.raw_base()?;
    for (i, link) in chain.links.iter().enumerate() {
        rep.files += 1;
        if i == 0 && raw_base {
            debug!(file = %link.file_name(), "raw image, no frames to verify");
            rep.raw_files += 1;
            continue;
        }
        let rd = FrameReader::open(&link.path, limits)?;
        let kind = rd.metadata().checksum;
        for frame in rd {
            let StreamFrame::Data(d) = frame? else { continue };
            let (Some(expected), Some(actual)) = (d.checksum, kind.digest_hex(&d.payload)) else {
                rep.blocks_unchecked += 1;
                continue;
            };
            rep.blocks_checked += 1;
            if expected != actual {
                rep.record(Mismatch {
                    path: link.path.clone(),
                    offset: d.extent.offset,
                    length: d.extent.length,
                    expected,
                    actual,
                });
            }
        }
    }
    info!(
        disk = %chain.disk,
        checked = rep.blocks_checked,
        unchecked = rep.blocks_unchecked,
        mismatches = rep.mismatches.len(),
        "verified chain"
    );
    Ok(rep)
}

/// Disjoint, merged `[start, end)` ranges.
#[derive(Default, Debug)]
struct RangeSet {
    map: BTreeMap<u64, u64>,
}

impl RangeSet {
    fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let (mut s, mut e) = (start, end);
        let touching: Vec<u64> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|(_, &re)| re >= start)
            .map(|(&rs, _)| rs)
            .collect();
        for rs in touching {
            if let Some(re) = self.map.remove(&rs) {
                s = s.min(rs);
                e = e.max(re);
            }
        }
        self.map.insert(s, e);
    }

    /// Sub-ranges of `[start, end)` not covered by the set.
    fn gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }
        let mut at = start;
        if let Some((_, &re)) = self.map.range(..=start).next_back() {
            at = at.max(re);
        }
        for (&rs, &re) in self.map.range((Bound::Excluded(start), Bound::Excluded(end))) {
            if at >= end {
                break;
            }
            if rs > at {
                out.push((at, rs));
            }
            at = at.max(re);
        }
        if at < end {
            out.push((at, end));
        }
        out
    }
}

struct ImageReader {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
}

impl ImageReader {
    fn read(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        self.buf.resize(len, 0);
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io(&self.path, e))?;
        self.file.read_exact(&mut self.buf).map_err(|e| Error::io(&self.path, e))?;
        Ok(&self.buf)
    }

    /// Offset of the first non-zero byte in the range, if any.
    fn first_nonzero(&mut self, start: u64, end: u64) -> Result<Option<u64>> {
        let mut at = start;
        while at < end {
            let n = (end - at).min(COMPARE_CHUNK as u64) as usize;
            if let Some(i) = self.read(at, n)?.iter().position(|&b| b != 0) {
                return Ok(Some(at + i as u64));
            }
            at += n as u64;
        }
        Ok(None)
    }
}

fn chain_size(chain: &BackupChain, limits: DecodeLimits) -> Result<u64> {
    let Some(base) = chain.base() else { return Ok(0) };
    if chain.raw_base()? {
        return Ok(std::fs::metadata(&base.path).map_err(|e| Error::io(&base.path, e))?.len());
    }
    Ok(FrameReader::open(&base.path, limits)?.metadata().virtual_size)
}

/// Check a restored image against the chain it was built from.
///
/// Links are walked newest first so that every byte is checked against the
/// link that last wrote it. Data frames fully visible in the image are
/// compared by digest (crc32 when the stream recorded none); data frames
/// partly overwritten by a later link are counted as unchecked. Zero-runs
/// must read back as zeros wherever they are still visible.
pub fn verify_image(chain: &BackupChain, image: &Path, limits: DecodeLimits) -> Result<VerificationReport> {
    let mut rep = VerificationReport::new(&chain.disk);
    rep.image = Some(image.to_path_buf());
    let expected_size = chain_size(chain, limits)?;
    let file = File::open(image).map_err(|e| Error::io(image, e))?;
    let actual_size = file.metadata().map_err(|e| Error::io(image, e))?.len();
    if actual_size != expected_size {
        return Err(Error::SizeMismatch {
            disk: chain.disk.clone(),
            path: image.to_path_buf(),
            expected: expected_size,
            actual: actual_size,
        });
    }
    let mut img = ImageReader { file, path: image.to_path_buf(), buf: Vec::new() };
    let mut covered = RangeSet::default();

    let raw_base = chain.raw_base()?;
    for (i, link) in chain.links.iter().enumerate().rev() {
        rep.files += 1;
        if i == 0 && raw_base {
            rep.raw_files += 1;
            verify_raw_link(&mut rep, &mut img, &covered, &link.path, expected_size)?;
            covered.insert(0, expected_size);
            continue;
        }
        let rd = FrameReader::open(&link.path, limits)?;
        let kind = match rd.metadata().checksum {
            ChecksumKind::None => ChecksumKind::Crc32,
            k => k,
        };
        for frame in rd {
            match frame? {
                StreamFrame::Data(d) => {
                    let Extent { offset, length } = d.extent;
                    let gaps = covered.gaps(offset, d.extent.end());
                    if gaps.is_empty() {
                        continue;
                    }
                    if gaps != [(offset, d.extent.end())] {
                        rep.blocks_unchecked += 1;
                    } else {
                        let expected = match d.checksum {
                            Some(c) => c,
                            None => crc32_hex(&d.payload),
                        };
                        let bytes = img.read(offset, length as usize)?;
                        let actual = kind.digest_hex(bytes).unwrap_or_default();
                        rep.blocks_checked += 1;
                        if expected != actual {
                            rep.record(Mismatch { path: link.path.clone(), offset, length, expected, actual });
                        }
                    }
                    covered.insert(offset, d.extent.end());
                }
                StreamFrame::Zero(e) => {
                    let gaps = covered.gaps(e.offset, e.end());
                    if !gaps.is_empty() {
                        rep.blocks_checked += 1;
                    }
                    for (s, end) in gaps {
                        if let Some(at) = img.first_nonzero(s, end)? {
                            rep.record(Mismatch {
                                path: link.path.clone(),
                                offset: e.offset,
                                length: e.length,
                                expected: "zeros".into(),
                                actual: format!("non-zero byte at {at:#x}"),
                            });
                            break;
                        }
                    }
                    covered.insert(e.offset, e.end());
                }
                StreamFrame::Metadata(_) | StreamFrame::Stop => {}
            }
        }
    }
    info!(
        disk = %chain.disk,
        image = %image.display(),
        checked = rep.blocks_checked,
        unchecked = rep.blocks_unchecked,
        mismatches = rep.mismatches.len(),
        "verified image"
    );
    Ok(rep)
}

fn verify_raw_link(
    rep: &mut VerificationReport,
    img: &mut ImageReader,
    covered: &RangeSet,
    raw: &Path,
    size: u64,
) -> Result<()> {
    let mut src = File::open(raw).map_err(|e| Error::io(raw, e))?;
    let mut want = vec![0u8; COMPARE_CHUNK];
    for (start, end) in covered.gaps(0, size) {
        rep.blocks_checked += 1;
        let mut at = start;
        while at < end {
            let n = (end - at).min(COMPARE_CHUNK as u64) as usize;
            src.seek(SeekFrom::Start(at)).map_err(|e| Error::io(raw, e))?;
            src.read_exact(&mut want[..n]).map_err(|e| Error::io(raw, e))?;
            let got = img.read(at, n)?;
            if got != &want[..n] {
                rep.record(Mismatch {
                    path: raw.to_path_buf(),
                    offset: at,
                    length: n as u64,
                    expected: crc32_hex(&want[..n]),
                    actual: crc32_hex(got),
                });
                break;
            }
            at += n as u64;
        }
    }
    Ok(())
}
