use crate::error::{ChainError, Error, Result};
use crate::naming::{BackupFile, BackupKind, ConfigSnapshot};
use crate::stream::is_raw_image;
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where the chain comes from.
#[derive(Clone, Debug)]
pub enum ChainSource {
    /// Every `*.data` file in a backup-set directory.
    Directory(PathBuf),
    /// An explicit ordered list of file names inside `dir`.
    Sequence { dir: PathBuf, files: Vec<String> },
}

impl ChainSource {
    /// Build a manual sequence from a comma-separated list.
    pub fn sequence(dir: &Path, list: &str) -> Self {
        let files = list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        ChainSource::Sequence { dir: dir.to_path_buf(), files: files.collect() }
    }

    pub fn dir(&self) -> &Path {
        match self {
            ChainSource::Directory(d) => d,
            ChainSource::Sequence { dir, .. } => dir,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Glob over disk names; `None` selects every disk.
    pub disk: Option<String>,
    /// Point-in-time restore: keep links up to and including this sequence.
    pub checkpoint: Option<u32>,
}

/// Ordered links for one disk: a full or copy backup, then its increments.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BackupChain {
    pub disk: String,
    pub links: Vec<BackupFile>,
}

impl BackupChain {
    pub fn base(&self) -> Option<&BackupFile> {
        self.links.first()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// True when the chain's base is a full or copy backup stored as a raw
    /// image. Only the base may be raw; every later link must be a stream.
    pub fn raw_base(&self) -> Result<bool> {
        match self.base() {
            Some(base) if base.kind.is_base() => is_raw_image(&base.path),
            _ => Ok(false),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedSet {
    pub dir: PathBuf,
    /// One chain per selected disk, sorted by disk name. Empty when the
    /// disk filter matched nothing.
    pub chains: Vec<BackupChain>,
    /// Built from a manual sequence; no matching config snapshot is implied.
    pub manual: bool,
    pub config: Option<ConfigSnapshot>,
    pub autostart: bool,
    pub checkpoint: Option<u32>,
}

impl ResolvedSet {
    pub fn chain(&self, disk: &str) -> Option<&BackupChain> {
        self.chains.iter().find(|c| c.disk == disk)
    }
}

pub fn resolve(source: &ChainSource, opts: &ResolveOptions) -> Result<ResolvedSet> {
    let filter = opts.disk.as_deref().map(matcher).transpose()?;
    let set = match source {
        ChainSource::Directory(dir) => resolve_dir(dir, filter.as_ref(), opts.checkpoint)?,
        ChainSource::Sequence { dir, files } => {
            resolve_sequence(dir, files, filter.as_ref(), opts.checkpoint)?
        }
    };
    info!(
        dir = %set.dir.display(),
        disks = set.chains.len(),
        manual = set.manual,
        checkpoint = ?set.checkpoint,
        "resolved backup set"
    );
    for c in &set.chains {
        debug!(disk = %c.disk, links = c.len(), "chain");
    }
    Ok(set)
}

fn matcher(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ChainError::BadFilter { pattern: pattern.into(), reason: e.to_string() }.into())
}

fn resolve_dir(dir: &Path, filter: Option<&GlobMatcher>, checkpoint: Option<u32>) -> Result<ResolvedSet> {
    let data_glob = matcher("*.data")?;
    let config_glob = matcher("vmconfig*.xml")?;
    let autostart_glob = matcher("autostart.*")?;

    let mut files = Vec::new();
    let mut configs = Vec::new();
    let mut autostart = false;
    for ent in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let ent = ent.map_err(|e| Error::io(dir, e.into()))?;
        if !ent.file_type().is_file() {
            continue;
        }
        let name = ent.file_name();
        if data_glob.is_match(name) {
            match BackupFile::parse(ent.path()) {
                Some(f) if f.kind == BackupKind::Differential => {
                    // differentials are restored through an explicit sequence only
                    debug!(file = %f.file_name(), "skipping differential backup");
                }
                Some(f) => files.push(f),
                None => warn!(file = %ent.path().display(), "ignoring unrecognised data file"),
            }
        } else if config_glob.is_match(name) {
            configs.extend(ConfigSnapshot::parse(ent.path()));
        } else if autostart_glob.is_match(name) {
            autostart = true;
        }
    }
    if files.is_empty() {
        return Err(ChainError::NoDataFiles.into());
    }

    if let Some(k) = checkpoint {
        let known = configs.iter().any(|c| c.sequence == Some(k)) || files.iter().any(|f| f.sequence == k);
        if !known {
            return Err(ChainError::CheckpointNotFound(k).into());
        }
        files.retain(|f| f.sequence <= k);
    }
    if let Some(m) = filter {
        files.retain(|f| m.is_match(&f.disk));
    }

    let mut by_disk: BTreeMap<String, Vec<BackupFile>> = BTreeMap::new();
    for f in files {
        by_disk.entry(f.disk.clone()).or_default().push(f);
    }
    let mut chains = Vec::with_capacity(by_disk.len());
    for (disk, mut links) in by_disk {
        links.sort_by_key(|f| (!f.kind.is_base(), f.sequence));
        validate_ordered(&disk, &links)?;
        chains.push(BackupChain { disk, links });
    }

    let config = select_config(configs, checkpoint);
    Ok(ResolvedSet { dir: dir.to_path_buf(), chains, manual: false, config, autostart, checkpoint })
}

fn resolve_sequence(
    dir: &Path,
    names: &[String],
    filter: Option<&GlobMatcher>,
    checkpoint: Option<u32>,
) -> Result<ResolvedSet> {
    // kinds are checked from the names alone, before anything is opened
    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let f = BackupFile::parse(&dir.join(name))
            .ok_or_else(|| ChainError::BadFileName(name.clone()))?;
        files.push(f);
    }
    let first = files.first().ok_or(ChainError::EmptySequence)?;
    if !first.kind.is_base() {
        return Err(ChainError::SequenceStart.into());
    }
    for f in &files {
        std::fs::metadata(&f.path).map_err(|e| Error::io(&f.path, e))?;
    }

    if let Some(k) = checkpoint {
        if !files.iter().any(|f| f.sequence == k) {
            return Err(ChainError::CheckpointNotFound(k).into());
        }
        files.retain(|f| f.sequence <= k);
    }
    if let Some(m) = filter {
        files.retain(|f| m.is_match(&f.disk));
    }

    // group per disk, keeping the caller's order inside each group
    let mut chains: Vec<BackupChain> = Vec::new();
    for f in files {
        match chains.iter_mut().find(|c| c.disk == f.disk) {
            Some(c) => c.links.push(f),
            None => chains.push(BackupChain { disk: f.disk.clone(), links: vec![f] }),
        }
    }
    for c in &chains {
        validate_manual(c)?;
    }
    chains.sort_by(|a, b| a.disk.cmp(&b.disk));
    Ok(ResolvedSet {
        dir: dir.to_path_buf(),
        chains,
        manual: true,
        config: None,
        autostart: false,
        checkpoint,
    })
}

/// Directory chains: one base first, then incrementals 1..=n with no gaps.
fn validate_ordered(disk: &str, links: &[BackupFile]) -> Result<()> {
    let Some((base, rest)) = links.split_first() else {
        return Ok(());
    };
    if !base.kind.is_base() {
        return Err(ChainError::MissingBase(disk.into()).into());
    }
    let mut expected = 1u32;
    for f in rest {
        if f.kind.is_base() {
            return Err(ChainError::MultipleBases {
                disk: disk.into(),
                first: base.file_name(),
                second: f.file_name(),
            }
            .into());
        }
        if f.sequence < expected {
            return Err(ChainError::DuplicateLink { disk: disk.into(), seq: f.sequence }.into());
        }
        if f.sequence > expected {
            return Err(ChainError::MissingLink { disk: disk.into(), seq: expected }.into());
        }
        expected += 1;
    }
    Ok(())
}

fn validate_manual(chain: &BackupChain) -> Result<()> {
    let Some((base, rest)) = chain.links.split_first() else {
        return Ok(());
    };
    if !base.kind.is_base() {
        return Err(ChainError::MissingBase(chain.disk.clone()).into());
    }
    if let Some(dup) = rest.iter().find(|f| f.kind.is_base()) {
        return Err(ChainError::MultipleBases {
            disk: chain.disk.clone(),
            first: base.file_name(),
            second: dup.file_name(),
        }
        .into());
    }
    for (i, f) in rest.iter().enumerate() {
        if rest[..i].iter().any(|p| p.kind == f.kind && p.sequence == f.sequence) {
            return Err(ChainError::DuplicateLink { disk: chain.disk.clone(), seq: f.sequence }.into());
        }
    }
    Ok(())
}

/// Config snapshots stored directly in `dir`.
pub fn config_snapshots(dir: &Path) -> Result<Vec<ConfigSnapshot>> {
    let config_glob = matcher("vmconfig*.xml")?;
    let mut out = Vec::new();
    for ent in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let ent = ent.map_err(|e| Error::io(dir, e.into()))?;
        if ent.file_type().is_file() && config_glob.is_match(ent.file_name()) {
            out.extend(ConfigSnapshot::parse(ent.path()));
        }
    }
    Ok(out)
}

/// The snapshot for checkpoint `k`, or the latest one when no checkpoint is given.
pub fn select_config(configs: Vec<ConfigSnapshot>, checkpoint: Option<u32>) -> Option<ConfigSnapshot> {
    match checkpoint {
        Some(k) => configs.into_iter().find(|c| c.sequence == Some(k)),
        None => configs.into_iter().max_by_key(|c| c.sequence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> BackupFile {
        BackupFile::parse(Path::new(name)).unwrap()
    }

    #[test]
    fn ordered_chain_accepts_contiguous_increments() {
        let links = vec![file("vda.full.data"), file("vda.inc.1.data"), file("vda.inc.2.data")];
        validate_ordered("vda", &links).unwrap();
    }

    #[test]
    fn ordered_chain_rejects_gap_and_duplicate() {
        let gap = vec![file("vda.full.data"), file("vda.inc.2.data")];
        assert!(matches!(
            validate_ordered("vda", &gap),
            Err(Error::Chain(ChainError::MissingLink { seq: 1, .. }))
        ));
        let dup = vec![file("vda.full.data"), file("vda.inc.1.data"), file("vda.inc.a.1.data")];
        assert!(matches!(
            validate_ordered("vda", &dup),
            Err(Error::Chain(ChainError::DuplicateLink { seq: 1, .. }))
        ));
    }

    #[test]
    fn ordered_chain_needs_single_base() {
        let none = vec![file("vda.inc.1.data")];
        assert!(matches!(validate_ordered("vda", &none), Err(Error::Chain(ChainError::MissingBase(_)))));
        let two = vec![file("vda.full.data"), file("vda.copy.data")];
        assert!(matches!(
            validate_ordered("vda", &two),
            Err(Error::Chain(ChainError::MultipleBases { .. }))
        ));
    }

    #[test]
    fn manual_sequence_start_is_checked_without_io() {
        let src = ChainSource::sequence(Path::new("/nonexistent/backup"), "vda.inc.1.data, vda.full.data");
        let err = resolve(&src, &ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Chain(ChainError::SequenceStart)), "{err}");
    }

    #[test]
    fn config_selection_prefers_checkpoint_then_latest() {
        let cfgs = || {
            vec![
                ConfigSnapshot::parse(Path::new("vmconfig.x.0.xml")).unwrap(),
                ConfigSnapshot::parse(Path::new("vmconfig.x.2.xml")).unwrap(),
                ConfigSnapshot::parse(Path::new("vmconfig.x.1.xml")).unwrap(),
            ]
        };
        assert_eq!(select_config(cfgs(), None).unwrap().sequence, Some(2));
        assert_eq!(select_config(cfgs(), Some(1)).unwrap().sequence, Some(1));
        assert!(select_config(cfgs(), Some(7)).is_none());
    }
}
