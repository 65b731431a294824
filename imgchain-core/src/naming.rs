//! Backup-set file naming.
//!
//! Data files: `<disk>.<kind>[.<label>...][.<seq>].data`, kind one of
//! `full`, `inc`, `diff`, `copy`. Config snapshots:
//! `vmconfig[.<label>...][.<seq>].xml`. This is the only place file names are
//! interpreted; everything downstream works on [`BackupFile`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DATA_SUFFIX: &str = ".data";
pub const CONFIG_PREFIX: &str = "vmconfig";
pub const CONFIG_SUFFIX: &str = ".xml";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
    Differential,
    Copy,
}

impl BackupKind {
    fn from_token(tok: &str) -> Option<Self> {
        match tok {
            "full" => Some(BackupKind::Full),
            "inc" => Some(BackupKind::Incremental),
            "diff" => Some(BackupKind::Differential),
            "copy" => Some(BackupKind::Copy),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "inc",
            BackupKind::Differential => "diff",
            BackupKind::Copy => "copy",
        }
    }

    /// Full and copy backups can head a chain.
    pub fn is_base(self) -> bool {
        matches!(self, BackupKind::Full | BackupKind::Copy)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One backup artifact as identified by its file name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub disk: String,
    pub kind: BackupKind,
    pub label: Option<String>,
    /// 0 for full/copy, the numeric suffix for inc/diff.
    pub sequence: u32,
}

impl BackupFile {
    /// Parse `path`'s file name; `None` if it is not a backup data file.
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (disk, kind, label, sequence) = parse_data_name(name)?;
        Some(Self { path: path.to_path_buf(), disk, kind, label, sequence })
    }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

fn parse_data_name(name: &str) -> Option<(String, BackupKind, Option<String>, u32)> {
    let stem = name.strip_suffix(DATA_SUFFIX)?;
    let parts: Vec<&str> = stem.split('.').collect();
    // disk names never start with a kind token, so the first kind token wins
    let kind_at = parts.iter().skip(1).position(|p| BackupKind::from_token(p).is_some())? + 1;
    let disk = parts[..kind_at].join(".");
    if disk.is_empty() {
        return None;
    }
    let kind = BackupKind::from_token(parts[kind_at])?;
    let mut rest = &parts[kind_at + 1..];
    let mut sequence = None;
    if let Some((last, head)) = rest.split_last() {
        if let Ok(n) = last.parse::<u32>() {
            sequence = Some(n);
            rest = head;
        }
    }
    let label = if rest.is_empty() { None } else { Some(rest.join(".")) };
    let sequence = match (kind.is_base(), sequence) {
        (true, None) => 0,
        (true, Some(_)) => return None,
        (false, Some(n)) if n > 0 => n,
        (false, _) => return None,
    };
    Some((disk, kind, label, sequence))
}

/// A domain configuration snapshot stored next to the data files.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    /// `None` for an unsuffixed `vmconfig.xml`.
    pub sequence: Option<u32>,
}

impl ConfigSnapshot {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix(CONFIG_PREFIX)?.strip_suffix(CONFIG_SUFFIX)?;
        if stem.is_empty() {
            return Some(Self { path: path.to_path_buf(), sequence: None });
        }
        let stem = stem.strip_prefix('.')?;
        let sequence = stem.rsplit('.').next().and_then(|s| s.parse::<u32>().ok());
        Some(Self { path: path.to_path_buf(), sequence })
    }
}
