use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

/// Per-frame checksum algorithm recorded in a stream's metadata.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    None,
    Crc32,
    Blake3,
}

impl ChecksumKind {
    /// Width of the hex digest line, 0 when no checksum is recorded.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc32 => 8,
            ChecksumKind::Blake3 => 64,
        }
    }

    pub fn digest_hex(self, data: &[u8]) -> Option<String> {
        match self {
            ChecksumKind::None => None,
            ChecksumKind::Crc32 => Some(crc32_hex(data)),
            ChecksumKind::Blake3 => Some(blake3::hash(data).to_hex().to_string()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumKind::None => "none",
            ChecksumKind::Crc32 => "crc32",
            ChecksumKind::Blake3 => "blake3",
        }
    }
}

pub fn crc32_hex(data: &[u8]) -> String {
    let mut h = Crc32::new();
    h.update(data);
    format!("{:08x}", h.finalize())
}
