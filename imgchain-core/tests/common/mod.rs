#![allow(dead_code)]

use imgchain_core::digest::ChecksumKind;
use imgchain_core::naming::{BackupFile, BackupKind};
use imgchain_core::stream::{StreamMetadata, StreamWriter};
use imgchain_core::target::{ImageWriter, RemoteSink};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = vec![0u8; len];
    rng.fill_bytes(&mut v);
    v
}

#[derive(Clone, Debug)]
pub enum Op {
    Data(u64, Vec<u8>),
    /// Data frame recorded with a wrong digest.
    BadData(u64, Vec<u8>),
    Zero(u64, u64),
}

/// Apply `ops` to an in-memory image, the reference for restore results.
pub fn apply_model(image: &mut [u8], ops: &[Op]) {
    for op in ops {
        match op {
            Op::Data(off, bytes) | Op::BadData(off, bytes) => {
                let o = *off as usize;
                image[o..o + bytes.len()].copy_from_slice(bytes);
            }
            Op::Zero(off, len) => {
                let o = *off as usize;
                image[o..o + *len as usize].fill(0);
            }
        }
    }
}

/// Builds one stream file inside a backup-set directory.
pub struct StreamBuilder {
    path: PathBuf,
    meta: StreamMetadata,
    ops: Vec<Op>,
}

impl StreamBuilder {
    pub fn new(dir: &Path, name: &str, virtual_size: u64) -> Self {
        let parsed = BackupFile::parse(Path::new(name));
        let disk = parsed.as_ref().map(|f| f.disk.clone()).unwrap_or_else(|| "vda".into());
        let mut meta = StreamMetadata::new(&disk, virtual_size);
        meta.checksum = ChecksumKind::Crc32;
        meta.incremental = parsed.map(|f| f.kind == BackupKind::Incremental).unwrap_or(false);
        Self { path: dir.join(name), meta, ops: Vec::new() }
    }

    pub fn checksum(mut self, kind: ChecksumKind) -> Self {
        self.meta.checksum = kind;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.meta.compressed = true;
        self
    }

    pub fn data(mut self, offset: u64, bytes: Vec<u8>) -> Self {
        self.ops.push(Op::Data(offset, bytes));
        self
    }

    pub fn bad_data(mut self, offset: u64, bytes: Vec<u8>) -> Self {
        self.ops.push(Op::BadData(offset, bytes));
        self
    }

    pub fn zero(mut self, offset: u64, len: u64) -> Self {
        self.ops.push(Op::Zero(offset, len));
        self
    }

    pub fn ops(mut self, ops: &[Op]) -> Self {
        self.ops.extend_from_slice(ops);
        self
    }

    pub fn write(mut self) -> PathBuf {
        self.meta.data_size = self
            .ops
            .iter()
            .map(|op| match op {
                Op::Data(_, b) | Op::BadData(_, b) => b.len() as u64,
                Op::Zero(..) => 0,
            })
            .sum();
        let bad_digest = "0".repeat(self.meta.checksum.hex_len());
        let mut w = StreamWriter::create(&self.path, self.meta).unwrap();
        for op in &self.ops {
            match op {
                Op::Data(off, b) => w.write_data(*off, b).unwrap(),
                Op::BadData(off, b) => w.write_data_with_checksum(*off, b, Some(bad_digest.clone())).unwrap(),
                Op::Zero(off, len) => w.write_zero(*off, *len).unwrap(),
            }
        }
        w.finish().unwrap();
        self.path
    }
}

/// Full backup of `len` bytes written as data frames of `frame` bytes.
pub fn full_backup(dir: &Path, name: &str, content: &[u8], frame: usize) -> PathBuf {
    let mut b = StreamBuilder::new(dir, name, content.len() as u64);
    for (i, chunk) in content.chunks(frame).enumerate() {
        b = b.data((i * frame) as u64, chunk.to_vec());
    }
    b.write()
}

pub fn touch(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, contents).unwrap();
    p
}

/// Remote sink keeping every file in memory.
#[derive(Default)]
pub struct MemSink {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
    dirs: Mutex<HashSet<PathBuf>>,
}

impl MemSink {
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let files = self.files.lock().unwrap();
        files.get(path).map(|f| f.lock().unwrap().clone())
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

pub struct MemWriter(Arc<Mutex<Vec<u8>>>);

impl ImageWriter for MemWriter {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.0.lock().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.lock().unwrap().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.0.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn allocate(&mut self, len: u64) -> io::Result<()> {
        let mut data = self.0.lock().unwrap();
        if (data.len() as u64) < len {
            data.resize(len as usize, 0);
        }
        Ok(())
    }

    fn punch_hole(&mut self, _offset: u64, _len: u64) -> io::Result<bool> {
        Ok(false)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteSink for MemSink {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path))
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        self.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn ImageWriter>> {
        let buf = Arc::new(Mutex::new(Vec::new()));
        self.files.lock().unwrap().insert(path.to_path_buf(), buf.clone());
        Ok(Box::new(MemWriter(buf)))
    }
}
