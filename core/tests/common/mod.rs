// Shared fixtures for the end-to-end rescue tests: a patterned input
// file, an output file, a mapfile path, and a fault model built from
// byte ranges that must fail to read.

use blockrescue::block::{Block, Sblock, Status};
use blockrescue::domain::Domain;
use blockrescue::mapfile::Mapbook;
use blockrescue::{RescueOptions, Rescuebook};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct Fixture {
    // owns the directory for the lifetime of the test
    pub dir: TempDir,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub map_path: PathBuf,
    pub size: u64,
}

/// Deterministic non-zero pattern so sparse logic never kicks in by
/// accident and corruption is easy to spot.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251 + 1) as u8).collect()
}

pub fn setup(data: &[u8]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("input.img");
    let output_path = dir.path().join("output.img");
    let map_path = dir.path().join("rescue.map");
    let mut f = File::create(&input_path).unwrap();
    f.write_all(data).unwrap();
    f.sync_all().unwrap();
    Fixture {
        dir,
        input_path,
        output_path,
        map_path,
        size: data.len() as u64,
    }
}

/// Fault model: everything is readable except the given ranges
pub fn faults(total: u64, bad: &[(u64, u64)]) -> Domain {
    let mut sblocks = Vec::new();
    let mut pos = 0;
    for &(bpos, bsize) in bad {
        if bpos > pos {
            sblocks.push(Sblock::new(Block::new(pos, bpos - pos), Status::Finished));
        }
        sblocks.push(Sblock::new(Block::new(bpos, bsize), Status::BadSector));
        pos = bpos + bsize;
    }
    if pos < total {
        sblocks.push(Sblock::new(Block::new(pos, total - pos), Status::Finished));
    }
    Domain::from_finished(&sblocks, 0, None)
}

/// Build an engine over the fixture; an empty `bad` list means a
/// fault-free input.
pub fn engine(fx: &Fixture, bad: &[(u64, u64)], opts: RescueOptions) -> Rescuebook {
    blockrescue::reset_interrupted();
    let input = File::open(&fx.input_path).unwrap();
    let output = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&fx.output_path)
        .unwrap();
    let map = Mapbook::open(Some(&fx.map_path), fx.size).unwrap();
    let domain = Domain::new(0, Some(fx.size));
    let test_domain = (!bad.is_empty()).then(|| faults(fx.size, bad));
    Rescuebook::new(
        fx.input_path.clone(),
        input,
        output,
        map,
        domain,
        test_domain,
        0,
        opts,
    )
}

/// Snapshot of the map as (pos, size, status char) triples
pub fn map_blocks(book: &Rescuebook) -> Vec<(u64, u64, char)> {
    book.map()
        .iter()
        .map(|sb| (sb.pos(), sb.size(), sb.status().as_char()))
        .collect()
}

/// Small options tuned for the test scenarios: 512-byte sectors,
/// 4096-byte clusters, no flush throttling
pub fn test_options() -> RescueOptions {
    RescueOptions {
        hardbs: 512,
        cluster: 8,
        flush_ops: 1,
        ..RescueOptions::default()
    }
}
