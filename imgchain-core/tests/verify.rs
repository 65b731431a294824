mod common;

use common::*;
use imgchain_core::chain::{resolve, ChainSource, ResolveOptions};
use imgchain_core::digest::ChecksumKind;
use imgchain_core::dispatch::{execute, Action, Collaborators, Outcome, RestoreRequest, VerifyRequest};
use imgchain_core::stream::{DecodeLimits, FRAME_HEADER_LEN};
use imgchain_core::{verify, verify_image, Error};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

fn chain(dir: &Path) -> imgchain_core::BackupChain {
    let mut set = resolve(&ChainSource::Directory(dir.into()), &ResolveOptions::default()).unwrap();
    set.chains.remove(0)
}

fn restore(dir: &Path, out: &Path) {
    let mut req = RestoreRequest::new(ChainSource::Directory(dir.into()), out);
    req.copy_config = false;
    let outcome = execute(Action::Restore(req), &Collaborators::default()).unwrap();
    assert!(outcome.is_success());
}

#[test]
fn clean_chain_has_no_mismatches() {
    let td = tempfile::tempdir().unwrap();
    let size = 32 * MIB as usize;
    full_backup(td.path(), "vdb.full.data", &random_bytes(1, size), 4 * MIB as usize);
    StreamBuilder::new(td.path(), "vdb.inc.1.data", size as u64).data(0, random_bytes(2, 4096)).write();

    let rep = verify(&chain(td.path()), DecodeLimits::default()).unwrap();
    assert!(rep.is_clean());
    assert_eq!(rep.files, 2);
    assert_eq!(rep.blocks_checked, 9);
    assert_eq!(rep.blocks_unchecked, 0);
}

#[test]
fn all_mismatches_are_collected_across_the_chain() {
    let td = tempfile::tempdir().unwrap();
    StreamBuilder::new(td.path(), "vda.full.data", 64 * KIB)
        .data(0, vec![1u8; 4096])
        .bad_data(8192, vec![2u8; 4096])
        .zero(16384, 4096)
        .bad_data(32768, vec![3u8; 4096])
        .write();
    StreamBuilder::new(td.path(), "vda.inc.1.data", 64 * KIB)
        .checksum(ChecksumKind::Blake3)
        .compressed()
        .bad_data(0, vec![4u8; 100])
        .data(200, vec![5u8; 100])
        .write();

    let rep = verify(&chain(td.path()), DecodeLimits::default()).unwrap();
    assert_eq!(rep.blocks_checked, 5);
    let found: Vec<(String, u64)> = rep
        .mismatches
        .iter()
        .map(|m| (m.path.file_name().unwrap().to_string_lossy().into_owned(), m.offset))
        .collect();
    assert_eq!(
        found,
        [
            ("vda.full.data".to_string(), 8192),
            ("vda.full.data".to_string(), 32768),
            ("vda.inc.1.data".to_string(), 0)
        ]
    );
    assert_eq!(rep.mismatches[0].expected, "00000000");
    assert_eq!(rep.mismatches[2].actual.len(), 64);
}

#[test]
fn streams_without_checksums_are_still_decoded() {
    let td = tempfile::tempdir().unwrap();
    StreamBuilder::new(td.path(), "vda.full.data", 16 * KIB)
        .checksum(ChecksumKind::None)
        .data(0, vec![1u8; 1024])
        .data(4096, vec![1u8; 1024])
        .write();
    let rep = verify(&chain(td.path()), DecodeLimits::default()).unwrap();
    assert!(rep.is_clean());
    assert_eq!((rep.blocks_checked, rep.blocks_unchecked), (0, 2));
}

#[test]
fn corrupt_frame_header_fails_immediately() {
    let td = tempfile::tempdir().unwrap();
    let p = StreamBuilder::new(td.path(), "vda.full.data", 16 * KIB)
        .bad_data(0, vec![1u8; 1024])
        .data(4096, vec![1u8; 1024])
        .write();
    let bytes = std::fs::read(&p).unwrap();
    // second data frame header: after the first frame's payload, terminator and crc line
    let first = bytes.windows(5).position(|w| w == b"data ").unwrap();
    let second = first + FRAME_HEADER_LEN + 1024 + 2 + 8 + 2;
    assert_eq!(&bytes[second..second + 5], b"data ");
    let mut f = std::fs::OpenOptions::new().write(true).open(&p).unwrap();
    f.seek(SeekFrom::Start(second as u64)).unwrap();
    f.write_all(b"dXta").unwrap();
    drop(f);

    match verify(&chain(td.path()), DecodeLimits::default()).unwrap_err() {
        Error::CorruptStream { position, reason, .. } => {
            assert_eq!(position, second as u64);
            assert!(reason.contains("unknown frame kind"), "{reason}");
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn frames_over_the_limit_are_corrupt() {
    let td = tempfile::tempdir().unwrap();
    StreamBuilder::new(td.path(), "vda.full.data", MIB).data(0, vec![1u8; 64 * KIB as usize]).write();
    let limits = DecodeLimits { max_frame_bytes: 4096, ..DecodeLimits::default() };
    let err = verify(&chain(td.path()), limits).unwrap_err();
    assert!(err.to_string().contains("too large"), "{err}");
}

#[test]
fn restored_image_verifies_against_chain() {
    let td = tempfile::tempdir().unwrap();
    let input = td.path().join("in");
    std::fs::create_dir(&input).unwrap();
    let size = 512 * KIB;
    full_backup(&input, "vda.full.data", &random_bytes(9, size as usize), 64 * KIB as usize);
    StreamBuilder::new(&input, "vda.inc.1.data", size)
        .data(60 * KIB, random_bytes(10, 8 * KIB as usize))
        .zero(128 * KIB, 64 * KIB)
        .write();
    StreamBuilder::new(&input, "vda.inc.2.data", size)
        .checksum(ChecksumKind::None)
        .data(130 * KIB, random_bytes(11, 2 * KIB as usize))
        .write();
    let out = td.path().join("out");
    restore(&input, &out);

    let c = chain(&input);
    let img = out.join("vda.img");
    let rep = verify_image(&c, &img, DecodeLimits::default()).unwrap();
    assert!(rep.is_clean(), "{:?}", rep.mismatches);
    // the first two full frames are partly overwritten by inc.1, the third entirely
    assert_eq!(rep.blocks_unchecked, 2);
    assert_eq!(rep.blocks_checked, 3 + 5);

    let verified = execute(
        Action::Verify(VerifyRequest {
            source: ChainSource::Directory(input.clone()),
            resolve: ResolveOptions::default(),
            limits: DecodeLimits::default(),
            image_dir: Some(out.clone()),
        }),
        &Collaborators::default(),
    )
    .unwrap();
    let Outcome::Verified(reports) = &verified else { panic!() };
    assert_eq!(reports.len(), 2);
    assert!(verified.is_success());

    // flip a byte inside a zero-run and inside a data frame
    let mut bytes = std::fs::read(&img).unwrap();
    bytes[150 * KIB as usize] = 1;
    bytes[300 * KIB as usize] ^= 0xff;
    std::fs::write(&img, &bytes).unwrap();
    let rep = verify_image(&c, &img, DecodeLimits::default()).unwrap();
    let offsets: Vec<u64> = rep.mismatches.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, [128 * KIB, 256 * KIB]);
    assert!(rep.mismatches[0].actual.contains("non-zero"));
}

#[test]
fn image_of_wrong_size_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    full_backup(td.path(), "vda.full.data", &random_bytes(1, 64 * KIB as usize), 16 * KIB as usize);
    let img = touch(td.path(), "vda.img", &[0u8; 100]);
    let err = verify_image(&chain(td.path()), &img, DecodeLimits::default()).unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected, actual: 100, .. } if expected == 64 * KIB));
}

#[test]
fn damaged_incremental_is_corrupt_not_raw() {
    let td = tempfile::tempdir().unwrap();
    let input = td.path().join("in");
    std::fs::create_dir(&input).unwrap();
    full_backup(&input, "vda.full.data", &random_bytes(14, 64 * KIB as usize), 16 * KIB as usize);
    let inc = StreamBuilder::new(&input, "vda.inc.1.data", 64 * KIB)
        .data(0, vec![1u8; 4096])
        .bad_data(8192, vec![2u8; 4096])
        .write();
    let out = td.path().join("out");
    restore(&input, &out);

    let mut bytes = std::fs::read(&inc).unwrap();
    bytes[0] = b'X';
    std::fs::write(&inc, &bytes).unwrap();

    let c = chain(&input);
    for err in [
        verify(&c, DecodeLimits::default()).unwrap_err(),
        verify_image(&c, &out.join("vda.img"), DecodeLimits::default()).unwrap_err(),
    ] {
        match err {
            Error::CorruptStream { path, position, .. } => {
                assert_eq!(path, inc);
                assert_eq!(position, 0);
            }
            other => panic!("unexpected {other}"),
        }
    }

    let req = VerifyRequest {
        source: ChainSource::Directory(input.clone()),
        resolve: ResolveOptions::default(),
        limits: DecodeLimits::default(),
        image_dir: None,
    };
    assert!(execute(Action::Verify(req), &Collaborators::default()).is_err());
}
