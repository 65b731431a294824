//! Sparse extent stream codec.
//!
//! A stream file is a sequence of frames, each introduced by a fixed 40-byte
//! ASCII header `<kind> <offset:016x> <length:016x>\r\n`. The first frame is
//! always `meta` (JSON metadata), the last is `stop`. `data` frames carry a
//! payload (optionally zstd-compressed) and, when the stream records
//! checksums, a hex digest line. `zero` frames carry nothing.

use crate::digest::ChecksumKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// kind (4) + ' ' + offset (16) + ' ' + length (16) + "\r\n"
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 16 + 1 + 16 + 2;
const TERM: &[u8] = b"\r\n";
/// Compressed data frames put their on-disk payload length on its own line.
const CLEN_LINE_LEN: usize = 16 + 2;
pub const STREAM_VERSION: u32 = 2;
/// Leading bytes of every stream file. Files without them are raw images.
pub const STREAM_MAGIC: &[u8] = b"meta ";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Meta,
    Data,
    Zero,
    Stop,
}

impl FrameKind {
    pub fn tag(self) -> &'static str {
        match self {
            FrameKind::Meta => "meta",
            FrameKind::Data => "data",
            FrameKind::Zero => "zero",
            FrameKind::Stop => "stop",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"meta" => Some(FrameKind::Meta),
            b"data" => Some(FrameKind::Data),
            b"zero" => Some(FrameKind::Zero),
            b"stop" => Some(FrameKind::Stop),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StreamMetadata {
    pub stream_version: u32,
    /// Logical size of the disk the stream describes.
    pub virtual_size: u64,
    /// Sum of data frame lengths, informational only.
    pub data_size: u64,
    pub disk_name: String,
    pub checkpoint_name: Option<String>,
    pub parent_checkpoint: Option<String>,
    pub incremental: bool,
    pub compressed: bool,
    pub checksum: ChecksumKind,
    pub date: String,
}

impl StreamMetadata {
    pub fn new(disk_name: &str, virtual_size: u64) -> Self {
        Self {
            stream_version: STREAM_VERSION,
            virtual_size,
            data_size: 0,
            disk_name: disk_name.to_string(),
            checkpoint_name: None,
            parent_checkpoint: None,
            incremental: false,
            compressed: false,
            checksum: ChecksumKind::None,
            date: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub extent: Extent,
    pub payload: Vec<u8>,
    /// Recorded hex digest, present when the stream records checksums.
    pub checksum: Option<String>,
    /// Byte position of the frame header inside the stream file.
    pub position: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    Metadata(StreamMetadata),
    Data(DataFrame),
    Zero(Extent),
    Stop,
}

impl StreamFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            StreamFrame::Metadata(_) => FrameKind::Meta,
            StreamFrame::Data(_) => FrameKind::Data,
            StreamFrame::Zero(_) => FrameKind::Zero,
            StreamFrame::Stop => FrameKind::Stop,
        }
    }

    pub fn extent(&self) -> Option<Extent> {
        match self {
            StreamFrame::Data(d) => Some(d.extent),
            StreamFrame::Zero(e) => Some(*e),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecodeLimits {
    pub max_frame_bytes: u64,
    pub max_metadata_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_frame_bytes: 256 * 1024 * 1024, max_metadata_bytes: 1024 * 1024 }
    }
}

/// True when `path` does not begin with a stream metadata frame.
pub fn is_raw_image(path: &Path) -> Result<bool> {
    let f = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut head = Vec::with_capacity(STREAM_MAGIC.len());
    f.take(STREAM_MAGIC.len() as u64).read_to_end(&mut head).map_err(|e| Error::io(path, e))?;
    Ok(head != STREAM_MAGIC)
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u64::from_str_radix(std::str::from_utf8(field).ok()?, 16).ok()
}

fn parse_header(hdr: &[u8; FRAME_HEADER_LEN]) -> std::result::Result<(FrameKind, u64, u64), String> {
    let kind = FrameKind::from_tag(&hdr[0..4])
        .ok_or_else(|| format!("unknown frame kind {:?}", String::from_utf8_lossy(&hdr[0..4])))?;
    if hdr[4] != b' ' || hdr[21] != b' ' || &hdr[38..40] != TERM {
        return Err("malformed frame header".into());
    }
    let offset = parse_hex(&hdr[5..21]).ok_or("bad offset field")?;
    let length = parse_hex(&hdr[22..38]).ok_or("bad length field")?;
    Ok((kind, offset, length))
}

fn encode_header(kind: FrameKind, offset: u64, length: u64) -> String {
    format!("{} {:016x} {:016x}\r\n", kind.tag(), offset, length)
}

/// Lazy decoder over one stream file. Yields the metadata frame first and
/// ends after `stop`; restartable only by reopening the file.
pub struct FrameReader<R> {
    inner: R,
    path: PathBuf,
    limits: DecodeLimits,
    meta: StreamMetadata,
    position: u64,
    last_end: u64,
    pending_meta: bool,
    done: bool,
}

impl FrameReader<BufReader<File>> {
    pub fn open(path: &Path, limits: DecodeLimits) -> Result<Self> {
        let f = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::new(BufReader::with_capacity(1 << 20, f), path, limits)
    }
}

impl<R: Read> FrameReader<R> {
    /// Reads and validates the metadata frame.
    pub fn new(inner: R, path: impl Into<PathBuf>, limits: DecodeLimits) -> Result<Self> {
        let mut rd = Self {
            inner,
            path: path.into(),
            limits,
            meta: StreamMetadata::new("", 0),
            position: 0,
            last_end: 0,
            pending_meta: true,
            done: false,
        };
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        rd.read_exact_tracked(&mut hdr, "metadata frame")?;
        if &hdr[0..4] != FrameKind::Meta.tag().as_bytes() {
            return Err(rd.corrupt(0, "missing metadata frame"));
        }
        let (_, offset, length) = parse_header(&hdr).map_err(|r| rd.corrupt(0, r))?;
        if offset != 0 {
            return Err(rd.corrupt(0, format!("metadata frame has non-zero offset {offset:#x}")));
        }
        if length > rd.limits.max_metadata_bytes {
            return Err(rd.corrupt(0, format!("metadata too large: {length} bytes")));
        }
        let json_at = rd.position;
        let mut json = vec![0u8; length as usize];
        rd.read_exact_tracked(&mut json, "metadata")?;
        rd.expect_term("metadata")?;
        let meta: StreamMetadata = serde_json::from_slice(&json)
            .map_err(|e| rd.corrupt(json_at, format!("metadata: {e}")))?;
        if meta.stream_version != STREAM_VERSION {
            return Err(rd.corrupt(
                json_at,
                format!("unsupported stream version {}", meta.stream_version),
            ));
        }
        rd.meta = meta;
        Ok(rd)
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed from the underlying reader so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn corrupt(&self, position: u64, reason: impl Into<String>) -> Error {
        Error::corrupt(&self.path, position, reason)
    }

    fn read_exact_tracked(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let start = self.position;
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.corrupt(start, format!("unexpected end of stream reading {what}")))
            }
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    fn expect_term(&mut self, what: &str) -> Result<()> {
        let start = self.position;
        let mut t = [0u8; 2];
        self.read_exact_tracked(&mut t, what)?;
        if t != TERM {
            return Err(self.corrupt(start, format!("{what} not terminated")));
        }
        Ok(())
    }

    fn check_extent(&mut self, start: u64, offset: u64, length: u64) -> Result<Extent> {
        if offset < self.last_end {
            return Err(self.corrupt(
                start,
                format!("extent at {offset:#x} overlaps previous extent ending at {:#x}", self.last_end),
            ));
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| self.corrupt(start, "extent end overflows"))?;
        if end > self.meta.virtual_size {
            return Err(self.corrupt(
                start,
                format!("extent ends at {end:#x} past virtual size {:#x}", self.meta.virtual_size),
            ));
        }
        self.last_end = end;
        Ok(Extent { offset, length })
    }

    fn read_payload(&mut self, start: u64, length: u64) -> Result<Vec<u8>> {
        if !self.meta.compressed {
            let mut payload = vec![0u8; length as usize];
            self.read_exact_tracked(&mut payload, "data payload")?;
            return Ok(payload);
        }
        let line_at = self.position;
        let mut line = [0u8; CLEN_LINE_LEN];
        self.read_exact_tracked(&mut line, "compressed length")?;
        let clen = match parse_hex(&line[..16]) {
            Some(n) if &line[16..] == TERM => n,
            _ => return Err(self.corrupt(line_at, "bad compressed length line")),
        };
        if clen > self.limits.max_frame_bytes {
            return Err(self.corrupt(line_at, format!("compressed payload too large: {clen} bytes")));
        }
        let mut compressed = vec![0u8; clen as usize];
        self.read_exact_tracked(&mut compressed, "compressed payload")?;
        let mut payload = Vec::with_capacity(length as usize);
        zstd::stream::read::Decoder::new(&compressed[..])
            .and_then(|d| d.take(length + 1).read_to_end(&mut payload))
            .map_err(|e| self.corrupt(start, format!("zstd: {e}")))?;
        if payload.len() as u64 != length {
            return Err(self.corrupt(
                start,
                format!("declared length {length} but payload decompressed to {}", payload.len()),
            ));
        }
        Ok(payload)
    }

    fn read_checksum(&mut self) -> Result<Option<String>> {
        let width = self.meta.checksum.hex_len();
        if width == 0 {
            return Ok(None);
        }
        let at = self.position;
        let mut digest = vec![0u8; width];
        self.read_exact_tracked(&mut digest, "checksum")?;
        if !digest.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b)) {
            return Err(self.corrupt(at, "checksum is not lowercase hex"));
        }
        self.expect_term("checksum")?;
        // all bytes checked as ASCII above
        Ok(Some(String::from_utf8_lossy(&digest).into_owned()))
    }

    fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if self.pending_meta {
            self.pending_meta = false;
            return Ok(Some(StreamFrame::Metadata(self.meta.clone())));
        }
        if self.done {
            return Ok(None);
        }
        let start = self.position;
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        self.read_exact_tracked(&mut hdr, "frame header")?;
        let (kind, offset, length) = parse_header(&hdr).map_err(|r| self.corrupt(start, r))?;
        match kind {
            FrameKind::Meta => Err(self.corrupt(start, "unexpected second metadata frame")),
            FrameKind::Stop => {
                if offset != 0 || length != 0 {
                    return Err(self.corrupt(start, "stop frame with non-zero fields"));
                }
                self.done = true;
                Ok(Some(StreamFrame::Stop))
            }
            FrameKind::Zero => Ok(Some(StreamFrame::Zero(self.check_extent(start, offset, length)?))),
            FrameKind::Data => {
                if length == 0 {
                    return Err(self.corrupt(start, "empty data frame"));
                }
                if length > self.limits.max_frame_bytes {
                    return Err(self.corrupt(start, format!("data frame too large: {length} bytes")));
                }
                let extent = self.check_extent(start, offset, length)?;
                let payload = self.read_payload(start, length)?;
                let term_at = self.position;
                let mut t = [0u8; 2];
                self.read_exact_tracked(&mut t, "data terminator")?;
                if t != TERM {
                    return Err(self.corrupt(
                        term_at,
                        format!("declared length {length} does not match payload"),
                    ));
                }
                let checksum = self.read_checksum()?;
                Ok(Some(StreamFrame::Data(DataFrame { extent, payload, checksum, position: start })))
            }
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<StreamFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                // corruption is terminal for the file
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Serialize one frame as it would appear in a stream described by `meta`.
pub fn encode_frame(frame: &StreamFrame, meta: &StreamMetadata) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match frame {
        StreamFrame::Metadata(m) => {
            let json = serde_json::to_vec(m).map_err(|e| Error::Encode(format!("metadata: {e}")))?;
            out.extend_from_slice(encode_header(FrameKind::Meta, 0, json.len() as u64).as_bytes());
            out.extend_from_slice(&json);
            out.extend_from_slice(TERM);
        }
        StreamFrame::Data(d) => {
            if d.payload.len() as u64 != d.extent.length {
                return Err(Error::Encode(format!(
                    "extent length {} does not match payload of {} bytes",
                    d.extent.length,
                    d.payload.len()
                )));
            }
            out.extend_from_slice(
                encode_header(FrameKind::Data, d.extent.offset, d.extent.length).as_bytes(),
            );
            if meta.compressed {
                let z = zstd::stream::encode_all(&d.payload[..], 0)
                    .map_err(|e| Error::Encode(format!("zstd: {e}")))?;
                out.extend_from_slice(format!("{:016x}\r\n", z.len()).as_bytes());
                out.extend_from_slice(&z);
            } else {
                out.extend_from_slice(&d.payload);
            }
            out.extend_from_slice(TERM);
            if meta.checksum != ChecksumKind::None {
                let digest = match &d.checksum {
                    Some(given) if given.len() == meta.checksum.hex_len() => given.clone(),
                    Some(given) => {
                        return Err(Error::Encode(format!(
                            "checksum {given:?} is not a {} digest",
                            meta.checksum.as_str()
                        )))
                    }
                    None => meta.checksum.digest_hex(&d.payload).unwrap_or_default(),
                };
                out.extend_from_slice(digest.as_bytes());
                out.extend_from_slice(TERM);
            }
        }
        StreamFrame::Zero(e) => {
            out.extend_from_slice(encode_header(FrameKind::Zero, e.offset, e.length).as_bytes());
        }
        StreamFrame::Stop => out.extend_from_slice(encode_header(FrameKind::Stop, 0, 0).as_bytes()),
    }
    Ok(out)
}

/// Sequential stream encoder enforcing the same ordering rules as the decoder.
pub struct StreamWriter<W: Write> {
    inner: W,
    path: PathBuf,
    meta: StreamMetadata,
    last_end: u64,
}

impl StreamWriter<BufWriter<File>> {
    pub fn create(path: &Path, meta: StreamMetadata) -> Result<Self> {
        let f = File::create(path).map_err(|e| Error::io(path, e))?;
        Self::new(BufWriter::new(f), path, meta)
    }
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W, path: impl Into<PathBuf>, meta: StreamMetadata) -> Result<Self> {
        let mut w = Self { inner, path: path.into(), meta, last_end: 0 };
        let bytes = encode_frame(&StreamFrame::Metadata(w.meta.clone()), &w.meta)?;
        w.emit(&bytes)?;
        Ok(w)
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.meta
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).map_err(|e| Error::io(&self.path, e))
    }

    fn check(&mut self, offset: u64, length: u64) -> Result<()> {
        if offset < self.last_end {
            return Err(Error::Encode(format!(
                "extent at {offset:#x} overlaps previous extent ending at {:#x}",
                self.last_end
            )));
        }
        let end = offset.saturating_add(length);
        if end > self.meta.virtual_size {
            return Err(Error::Encode(format!(
                "extent ends at {end:#x} past virtual size {:#x}",
                self.meta.virtual_size
            )));
        }
        self.last_end = end;
        Ok(())
    }

    pub fn write_data(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        self.write_data_with_checksum(offset, payload, None)
    }

    /// Like [`write_data`](Self::write_data) but records `checksum` verbatim
    /// instead of computing it from the payload.
    pub fn write_data_with_checksum(
        &mut self,
        offset: u64,
        payload: &[u8],
        checksum: Option<String>,
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::Encode("empty data frame".into()));
        }
        self.check(offset, payload.len() as u64)?;
        let frame = StreamFrame::Data(DataFrame {
            extent: Extent { offset, length: payload.len() as u64 },
            payload: payload.to_vec(),
            checksum,
            position: 0,
        });
        let bytes = encode_frame(&frame, &self.meta)?;
        self.emit(&bytes)
    }

    pub fn write_zero(&mut self, offset: u64, length: u64) -> Result<()> {
        self.check(offset, length)?;
        let bytes = encode_frame(&StreamFrame::Zero(Extent { offset, length }), &self.meta)?;
        self.emit(&bytes)
    }

    /// Writes the stop frame and hands back the inner writer.
    pub fn finish(mut self) -> Result<W> {
        let bytes = encode_frame(&StreamFrame::Stop, &self.meta)?;
        self.emit(&bytes)?;
        self.inner.flush().map_err(|e| Error::io(&self.path, e))?;
        Ok(self.inner)
    }
}
