use crate::chain::BackupChain;
use crate::error::{Error, Result};
use crate::naming::{BackupFile, BackupKind};
use crate::stream::{is_raw_image, DecodeLimits, FrameKind, FrameReader, StreamFrame, StreamMetadata};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Raw,
    Stream,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEntry {
    pub kind: FrameKind,
    pub offset: u64,
    pub length: u64,
    /// Byte position of the frame header in the file.
    pub position: u64,
}

/// Header and frame index of one backup file.
#[derive(Serialize, Clone, Debug)]
pub struct StreamSummary {
    pub file: String,
    pub path: PathBuf,
    pub disk: String,
    pub kind: BackupKind,
    pub label: Option<String>,
    pub sequence: u32,
    pub format: FileFormat,
    pub file_size: u64,
    pub metadata: Option<StreamMetadata>,
    pub data_frames: u64,
    pub zero_frames: u64,
    pub data_bytes: u64,
    pub zero_bytes: u64,
    pub frames: Vec<FrameEntry>,
}

pub fn summarize(file: &BackupFile, limits: DecodeLimits) -> Result<StreamSummary> {
    let file_size = std::fs::metadata(&file.path).map_err(|e| Error::io(&file.path, e))?.len();
    let mut s = StreamSummary {
        file: file.file_name(),
        path: file.path.clone(),
        disk: file.disk.clone(),
        kind: file.kind,
        label: file.label.clone(),
        sequence: file.sequence,
        format: FileFormat::Raw,
        file_size,
        metadata: None,
        data_frames: 0,
        zero_frames: 0,
        data_bytes: 0,
        zero_bytes: 0,
        frames: Vec::new(),
    };
    if is_raw_image(&file.path)? {
        return Ok(s);
    }
    s.format = FileFormat::Stream;
    let mut rd = FrameReader::open(&file.path, limits)?;
    s.metadata = Some(rd.metadata().clone());
    loop {
        let position = rd.position();
        let Some(frame) = rd.next() else { break };
        let entry = match frame? {
            StreamFrame::Metadata(_) => FrameEntry { kind: FrameKind::Meta, offset: 0, length: 0, position: 0 },
            StreamFrame::Data(d) => {
                s.data_frames += 1;
                s.data_bytes += d.extent.length;
                FrameEntry { kind: FrameKind::Data, offset: d.extent.offset, length: d.extent.length, position }
            }
            StreamFrame::Zero(e) => {
                s.zero_frames += 1;
                s.zero_bytes += e.length;
                FrameEntry { kind: FrameKind::Zero, offset: e.offset, length: e.length, position }
            }
            StreamFrame::Stop => FrameEntry { kind: FrameKind::Stop, offset: 0, length: 0, position },
        };
        s.frames.push(entry);
    }
    Ok(s)
}

/// Summaries for every link of `chain`, in chain order. Never writes.
pub fn dump(chain: &BackupChain, limits: DecodeLimits) -> Result<Vec<StreamSummary>> {
    chain.links.iter().map(|f| summarize(f, limits)).collect()
}
