// Mapbook - the in-memory extent map backing the on-disk mapfile.
//
// An ordered sequence of status-tagged blocks that exactly partitions
// a contiguous range. Invariants held by every mutator:
//   - blocks strictly ascend and touch (no gaps, no overlaps)
//   - no two adjacent blocks share a status
//   - every block has a nonzero size

pub mod codec;

use crate::block::{Block, Sblock, Status};
use crate::{internal_error, RescueError, RescueResult};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Phase marker persisted in the mapfile header. `F` and `G` are
/// written by fill and generate tools sharing the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentStatus {
    Copying,
    Trimming,
    Scraping,
    Retrying,
    Filling,
    Generating,
    Finished,
}

impl CurrentStatus {
    pub fn as_char(self) -> char {
        match self {
            CurrentStatus::Copying => '?',
            CurrentStatus::Trimming => '*',
            CurrentStatus::Scraping => '/',
            CurrentStatus::Retrying => '-',
            CurrentStatus::Filling => 'F',
            CurrentStatus::Generating => 'G',
            CurrentStatus::Finished => '+',
        }
    }

    pub fn from_char(ch: char) -> Option<CurrentStatus> {
        match ch {
            '?' => Some(CurrentStatus::Copying),
            '*' => Some(CurrentStatus::Trimming),
            '/' => Some(CurrentStatus::Scraping),
            '-' => Some(CurrentStatus::Retrying),
            'F' => Some(CurrentStatus::Filling),
            'G' => Some(CurrentStatus::Generating),
            '+' => Some(CurrentStatus::Finished),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CurrentStatus::Copying => "copying",
            CurrentStatus::Trimming => "trimming",
            CurrentStatus::Scraping => "scraping",
            CurrentStatus::Retrying => "retrying",
            CurrentStatus::Filling => "filling",
            CurrentStatus::Generating => "generating",
            CurrentStatus::Finished => "finished",
        }
    }
}

/// Net change in the number of blocks per status after a mutation,
/// used by the engine for error accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusDelta([i64; 5]);

impl StatusDelta {
    fn index(st: Status) -> usize {
        match st {
            Status::NonTried => 0,
            Status::NonTrimmed => 1,
            Status::NonScraped => 2,
            Status::BadSector => 3,
            Status::Finished => 4,
        }
    }

    pub fn of(&self, st: Status) -> i64 {
        self.0[Self::index(st)]
    }
}

#[derive(Debug, Clone)]
pub struct Mapbook {
    path: Option<PathBuf>,
    loaded: bool,
    current_pos: u64,
    current_status: CurrentStatus,
    current_pass: u32,
    sblocks: Vec<Sblock>,
    trailing_comments: Vec<String>,
}

impl Mapbook {
    /// Blank map: a single `non_tried` block covering `[0, extent_end)`.
    pub fn create(extent_end: u64, path: Option<PathBuf>) -> Mapbook {
        let sblocks = if extent_end > 0 {
            vec![Sblock::new(Block::new(0, extent_end), Status::NonTried)]
        } else {
            Vec::new()
        };
        Mapbook {
            path,
            loaded: false,
            current_pos: 0,
            current_status: CurrentStatus::Copying,
            current_pass: 1,
            sblocks,
            trailing_comments: Vec::new(),
        }
    }

    /// Parse an existing mapfile and verify its invariants.
    pub fn load(path: &Path) -> RescueResult<Mapbook> {
        let parsed = codec::read_mapfile(path)?;
        let mut book = Mapbook {
            path: Some(path.to_path_buf()),
            loaded: true,
            current_pos: parsed.current_pos,
            current_status: parsed.current_status,
            current_pass: parsed.current_pass,
            sblocks: parsed.sblocks,
            trailing_comments: parsed.trailing_comments,
        };
        // ordering, gaps and overlaps were rejected by the codec;
        // same-status neighbours are merged here
        book.compact();
        Ok(book)
    }

    /// Load `path` when it exists, otherwise start blank; either way the
    /// map is extended with `non_tried` space to reach `extent_end`.
    pub fn open(path: Option<&Path>, extent_end: u64) -> RescueResult<Mapbook> {
        let mut book = match path {
            Some(p) if p.exists() => Mapbook::load(p)?,
            _ => Mapbook::create(extent_end, path.map(Path::to_path_buf)),
        };
        if book.loaded {
            // normalise a map that does not start at zero
            if let Some(first) = book.sblocks.first() {
                if first.pos() > 0 {
                    let lead = Sblock::new(Block::new(0, first.pos()), Status::NonTried);
                    book.sblocks.insert(0, lead);
                    book.compact();
                }
            }
            if extent_end > book.extent().end() {
                book.truncate_vector(extent_end, true);
            }
        }
        Ok(book)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Whether the map was read from disk rather than created blank
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn blank(&self) -> bool {
        !self.loaded
    }

    pub fn current_pos(&self) -> u64 {
        self.current_pos
    }

    pub fn set_current_pos(&mut self, pos: u64) {
        self.current_pos = pos;
    }

    pub fn current_status(&self) -> CurrentStatus {
        self.current_status
    }

    pub fn set_current_status(&mut self, st: CurrentStatus) {
        self.current_status = st;
    }

    pub fn current_pass(&self) -> u32 {
        self.current_pass
    }

    pub fn set_current_pass(&mut self, pass: u32) {
        self.current_pass = pass;
    }

    /// Input size recorded by a finished mapfile, for size verification
    pub fn mapfile_isize(&self) -> Option<u64> {
        if self.loaded && self.current_status == CurrentStatus::Finished {
            Some(self.extent().end())
        } else {
            None
        }
    }

    pub fn sblocks(&self) -> usize {
        self.sblocks.len()
    }

    pub fn sblock(&self, i: usize) -> &Sblock {
        &self.sblocks[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sblock> {
        self.sblocks.iter()
    }

    /// Covered range `[map_begin, map_end)`
    pub fn extent(&self) -> Block {
        match (self.sblocks.first(), self.sblocks.last()) {
            (Some(first), Some(last)) => Block::new(first.pos(), last.end() - first.pos()),
            _ => Block::empty(0),
        }
    }

    /// Binary search for the block containing `pos`
    pub fn find_index(&self, pos: u64) -> Option<usize> {
        if !self.extent().contains(pos) {
            return None;
        }
        let i = self
            .sblocks
            .partition_point(|sb| sb.end() <= pos);
        debug_assert!(self.sblocks[i].block().contains(pos));
        Some(i)
    }

    /// Narrow `b` to the first chunk at or after `b.pos` whose status is
    /// `st`, preserving `b.size` as an upper bound and cropping to a
    /// single block. `b` becomes empty when no such chunk exists; its
    /// position may move past the original end, which callers bounded
    /// by a range must check for.
    pub fn find_chunk(&self, b: &mut Block, st: Status) {
        if b.is_empty() {
            return;
        }
        let extent = self.extent();
        if extent.is_empty() || b.pos() >= extent.end() {
            *b = Block::empty(b.pos());
            return;
        }
        let size = b.size();
        let pos = b.pos().max(extent.pos());
        let mut i = self.find_index(pos).unwrap_or_else(|| {
            internal_error("find_chunk position fell outside the map");
        });
        while i < self.sblocks.len() && self.sblocks[i].status() != st {
            i += 1;
        }
        if i == self.sblocks.len() {
            *b = Block::empty(pos);
            return;
        }
        let pos = pos.max(self.sblocks[i].pos());
        let capped = Block::new(pos, size.min(u64::MAX - pos));
        *b = capped.crop(&self.sblocks[i].block());
    }

    /// Backward counterpart of [`find_chunk`]: narrow `b` to the last
    /// chunk ending at or before `b.end` whose status is `st`.
    pub fn rfind_chunk(&self, b: &mut Block, st: Status) {
        if b.is_empty() {
            return;
        }
        let extent = self.extent();
        if extent.is_empty() || b.end() <= extent.pos() {
            *b = Block::empty(b.pos());
            return;
        }
        let size = b.size();
        let end = b.end().min(extent.end());
        let mut i = self.find_index(end - 1).unwrap_or_else(|| {
            internal_error("rfind_chunk position fell outside the map");
        });
        loop {
            if self.sblocks[i].status() == st {
                break;
            }
            if i == 0 {
                *b = Block::empty(b.pos());
                return;
            }
            i -= 1;
        }
        let end = end.min(self.sblocks[i].end());
        let pos = self.sblocks[i].pos().max(end.saturating_sub(size));
        *b = Block::new(pos, end - pos);
    }

    /// Replace the status of block `i` in place, merging with either
    /// neighbour when statuses come to match.
    pub fn change_sblock_status(&mut self, i: usize, st: Status) {
        self.sblocks[i].set_status(st);
        if i + 1 < self.sblocks.len() && self.sblocks[i].status() == self.sblocks[i + 1].status() {
            let next = self.sblocks.remove(i + 1);
            self.sblocks[i].join(&next);
        }
        if i > 0 && self.sblocks[i - 1].status() == self.sblocks[i].status() {
            let cur = self.sblocks.remove(i);
            self.sblocks[i - 1].join(&cur);
        }
        self.audit_merged();
    }

    /// Split block `i` at absolute position `pos`, both halves keeping
    /// the status. No-op when `pos` already falls on a boundary.
    pub fn split_sblock_by(&mut self, pos: u64, i: usize) {
        let sb = self.sblocks[i];
        if pos <= sb.pos() || pos >= sb.end() {
            return;
        }
        let (left, right) = sb.split_at(pos);
        self.sblocks[i] = left;
        self.sblocks.insert(i + 1, right);
        self.audit();
    }

    /// Rewrite the status of an arbitrary chunk of the map. The
    /// bordering blocks are split where the chunk edges fall mid-block,
    /// the interior is replaced, and same-status neighbours are merged.
    /// Returns the net change in block counts per status.
    pub fn change_chunk_status(&mut self, b: Block, st: Status) -> StatusDelta {
        if b.is_empty() {
            return StatusDelta::default();
        }
        if !self.extent().includes(&b) {
            internal_error("chunk outside the mapped range");
        }
        let before = self.status_counts();

        let i = self.find_index(b.pos()).unwrap();
        self.split_sblock_by(b.pos(), i);
        if b.end() < self.extent().end() {
            let j = self.find_index(b.end()).unwrap();
            self.split_sblock_by(b.end(), j);
        }
        let first = self.find_index(b.pos()).unwrap();
        let mut last = first;
        while last < self.sblocks.len() && self.sblocks[last].end() <= b.end() {
            last += 1;
        }
        self.sblocks
            .splice(first..last, [Sblock::new(b, st)]);
        self.compact();

        let after = self.status_counts();
        let mut delta = StatusDelta::default();
        for (k, d) in delta.0.iter_mut().enumerate() {
            *d = after[k] - before[k];
        }
        delta
    }

    /// Shrink or extend the mapped range to end at `end`. Extension
    /// appends `non_tried` space when `fill_with_non_tried` is set.
    pub fn truncate_vector(&mut self, end: u64, fill_with_non_tried: bool) {
        let extent = self.extent();
        if end <= extent.pos() {
            internal_error("truncation would empty the map");
        }
        if end < extent.end() {
            let i = self.find_index(end).unwrap();
            self.split_sblock_by(end, i);
            let cut = self.find_index(end).unwrap();
            self.sblocks.truncate(cut);
        } else if end > extent.end() && fill_with_non_tried {
            let tail = Sblock::new(Block::new(extent.end(), end - extent.end()), Status::NonTried);
            self.sblocks.push(tail);
            self.compact();
        }
        self.audit();
    }

    /// Merge every run of same-status adjacent blocks. Idempotent.
    pub fn compact(&mut self) {
        let mut compacted: Vec<Sblock> = Vec::with_capacity(self.sblocks.len());
        for sb in self.sblocks.drain(..) {
            if let Some(last) = compacted.last_mut() {
                if last.join(&sb) {
                    continue;
                }
            }
            compacted.push(sb);
        }
        self.sblocks = compacted;
        self.audit_merged();
    }

    fn status_counts(&self) -> [i64; 5] {
        let mut counts = [0i64; 5];
        for sb in &self.sblocks {
            counts[StatusDelta::index(sb.status())] += 1;
        }
        counts
    }

    /// Debug-time invariant walk. A split leaves same-status
    /// neighbours on purpose, so that check runs only where the
    /// merged form is guaranteed.
    fn audit(&self) {
        #[cfg(debug_assertions)]
        {
            for (i, sb) in self.sblocks.iter().enumerate() {
                if sb.size() == 0 {
                    internal_error("zero-sized block in map");
                }
                if i > 0 && self.sblocks[i - 1].end() != sb.pos() {
                    internal_error("blocks are not adjacent");
                }
            }
        }
    }

    fn audit_merged(&self) {
        self.audit();
        #[cfg(debug_assertions)]
        for pair in self.sblocks.windows(2) {
            if pair[0].status() == pair[1].status() {
                internal_error("adjacent blocks share a status");
            }
        }
    }

    pub fn render(&self) -> String {
        codec::render(
            self.current_pos,
            self.current_status,
            self.current_pass,
            &self.sblocks,
            &self.trailing_comments,
        )
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(self.render().as_bytes())
    }

    /// Atomic rewrite of the backing mapfile
    pub fn save(&self) -> RescueResult<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| RescueError::env("no mapfile path to save to"))?;
        codec::write_atomic(path, &self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn book(parts: &[(u64, u64, Status)]) -> Mapbook {
        let mut b = Mapbook::create(parts.last().map_or(0, |p| p.0 + p.1), None);
        for &(pos, size, st) in parts {
            b.change_chunk_status(Block::new(pos, size), st);
        }
        b
    }

    #[test]
    fn test_blank_map() {
        let b = Mapbook::create(0x1000, None);
        assert_eq!(b.sblocks(), 1);
        assert_eq!(b.sblock(0).status(), Status::NonTried);
        assert_eq!(b.extent(), Block::new(0, 0x1000));
        assert!(b.blank());
    }

    #[test]
    fn test_find_index() {
        let b = book(&[(0, 0x100, Status::Finished), (0x100, 0x100, Status::BadSector)]);
        assert_eq!(b.find_index(0), Some(0));
        assert_eq!(b.find_index(0xFF), Some(0));
        assert_eq!(b.find_index(0x100), Some(1));
        assert_eq!(b.find_index(0x200), None);
    }

    #[test]
    fn test_change_chunk_splits_edges() {
        let mut b = Mapbook::create(0x1000, None);
        b.change_chunk_status(Block::new(0x100, 0x200), Status::Finished);
        assert_eq!(b.sblocks(), 3);
        assert_eq!(b.sblock(0).block(), Block::new(0, 0x100));
        assert_eq!(b.sblock(1).block(), Block::new(0x100, 0x200));
        assert_eq!(b.sblock(1).status(), Status::Finished);
        assert_eq!(b.sblock(2).block(), Block::new(0x300, 0xD00));
    }

    #[test]
    fn test_change_chunk_merges_neighbours() {
        let mut b = Mapbook::create(0x300, None);
        b.change_chunk_status(Block::new(0, 0x100), Status::Finished);
        b.change_chunk_status(Block::new(0x200, 0x100), Status::Finished);
        b.change_chunk_status(Block::new(0x100, 0x100), Status::Finished);
        assert_eq!(b.sblocks(), 1);
        assert_eq!(b.sblock(0).status(), Status::Finished);
    }

    #[test]
    fn test_change_chunk_idempotent() {
        let mut b = Mapbook::create(0x1000, None);
        let chunk = Block::new(0x80, 0x100);
        let first = b.change_chunk_status(chunk, Status::BadSector);
        let snapshot: Vec<_> = b.iter().cloned().collect();
        let second = b.change_chunk_status(chunk, Status::BadSector);
        assert_eq!(snapshot, b.iter().cloned().collect::<Vec<_>>());
        assert_ne!(first, StatusDelta::default());
        assert_eq!(second, StatusDelta::default());
    }

    #[test]
    fn test_delta_accounting() {
        let mut b = Mapbook::create(0x1000, None);
        let d = b.change_chunk_status(Block::new(0x100, 0x100), Status::BadSector);
        assert_eq!(d.of(Status::BadSector), 1);
        assert_eq!(d.of(Status::NonTried), 1); // one block became two
        let d = b.change_chunk_status(Block::new(0x100, 0x100), Status::NonTried);
        assert_eq!(d.of(Status::BadSector), -1);
    }

    #[test]
    fn test_split_then_compact_is_identity() {
        let mut b = book(&[(0, 0x100, Status::Finished), (0x100, 0x300, Status::NonScraped)]);
        let snapshot: Vec<_> = b.iter().cloned().collect();
        b.split_sblock_by(0x80, 0);
        b.split_sblock_by(0x200, 2);
        assert_eq!(b.sblocks(), 4);
        b.compact();
        assert_eq!(snapshot, b.iter().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn test_change_sblock_status_merges() {
        let mut b = book(&[(0, 0x100, Status::Finished), (0x100, 0x100, Status::BadSector)]);
        // 3 blocks: finished, bad, non_tried
        assert_eq!(b.sblocks(), 3);
        b.change_sblock_status(1, Status::Finished);
        assert_eq!(b.sblocks(), 2);
        assert_eq!(b.sblock(0).block(), Block::new(0, 0x200));
    }

    #[test]
    fn test_truncate_vector() {
        let mut b = Mapbook::create(0x1000, None);
        b.change_chunk_status(Block::new(0, 0x100), Status::Finished);
        b.truncate_vector(0x80, false);
        assert_eq!(b.extent().end(), 0x80);
        b.truncate_vector(0x200, true);
        assert_eq!(b.extent().end(), 0x200);
        assert_eq!(b.sblock(b.sblocks() - 1).status(), Status::NonTried);
    }

    #[test]
    fn test_find_chunk() {
        let b = book(&[
            (0, 0x100, Status::Finished),
            (0x100, 0x100, Status::BadSector),
            (0x200, 0x100, Status::Finished),
        ]);
        let mut chunk = Block::new(0, 0x1000);
        b.find_chunk(&mut chunk, Status::BadSector);
        assert_eq!(chunk, Block::new(0x100, 0x100));

        // size is an upper bound
        let mut chunk = Block::new(0, 0x40);
        b.find_chunk(&mut chunk, Status::BadSector);
        assert_eq!(chunk, Block::new(0x100, 0x40));

        // no such chunk
        let mut chunk = Block::new(0x200, 0x100);
        b.find_chunk(&mut chunk, Status::BadSector);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_rfind_chunk() {
        let b = book(&[
            (0, 0x100, Status::BadSector),
            (0x200, 0x100, Status::BadSector),
        ]);
        let mut chunk = Block::new(0, 0x300);
        b.rfind_chunk(&mut chunk, Status::BadSector);
        assert_eq!(chunk, Block::new(0x200, 0x100));

        let mut chunk = Block::new(0, 0x180);
        b.rfind_chunk(&mut chunk, Status::BadSector);
        assert_eq!(chunk, Block::new(0, 0x100));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.map");
        let mut b = book(&[
            (0, 0x2000, Status::Finished),
            (0x2000, 0x200, Status::BadSector),
        ]);
        b.set_path(path.clone());
        b.set_current_pos(0x2200);
        b.set_current_status(CurrentStatus::Scraping);
        b.set_current_pass(2);
        b.save().unwrap();

        let loaded = Mapbook::load(&path).unwrap();
        assert_eq!(loaded.current_pos(), 0x2200);
        assert_eq!(loaded.current_status(), CurrentStatus::Scraping);
        assert_eq!(loaded.current_pass(), 2);
        assert_eq!(
            loaded.iter().cloned().collect::<Vec<_>>(),
            b.iter().cloned().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_open_extends_loaded_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.map");
        let mut b = book(&[(0, 0x100, Status::Finished)]);
        b.truncate_vector(0x100, false);
        b.set_path(path.clone());
        b.save().unwrap();

        let opened = Mapbook::open(Some(&path), 0x400).unwrap();
        assert_eq!(opened.extent().end(), 0x400);
        assert_eq!(opened.sblock(opened.sblocks() - 1).status(), Status::NonTried);
        assert!(opened.loaded());
    }

    fn arb_status() -> impl Strategy<Value = Status> {
        prop::sample::select(Status::ALL.to_vec())
    }

    proptest! {
        // any sequence of chunk rewrites keeps the partition invariants
        #[test]
        fn prop_mutations_keep_invariants(
            ops in prop::collection::vec((0u64..0x1000, 1u64..0x400, arb_status()), 1..40)
        ) {
            let mut b = Mapbook::create(0x1400, None);
            for (pos, size, st) in ops {
                let chunk = Block::new(pos, size.min(0x1400 - pos));
                if chunk.is_empty() { continue; }
                b.change_chunk_status(chunk, st);
                // the audit inside every mutator would have panicked on
                // a violation; verify coverage explicitly as well
                prop_assert_eq!(b.extent(), Block::new(0, 0x1400));
                let mut end = 0;
                for sb in b.iter() {
                    prop_assert_eq!(sb.pos(), end);
                    end = sb.end();
                }
                prop_assert_eq!(end, 0x1400);
            }
        }

        #[test]
        fn prop_chunk_rewrite_idempotent(
            pos in 0u64..0x800, size in 1u64..0x400, st in arb_status()
        ) {
            let mut b = Mapbook::create(0x1000, None);
            b.change_chunk_status(Block::new(0x200, 0x300), Status::Finished);
            b.change_chunk_status(Block::new(0x600, 0x100), Status::BadSector);
            b.change_chunk_status(Block::new(pos, size), st);
            let snapshot: Vec<_> = b.iter().cloned().collect();
            let delta = b.change_chunk_status(Block::new(pos, size), st);
            prop_assert_eq!(delta, StatusDelta::default());
            prop_assert_eq!(snapshot, b.iter().cloned().collect::<Vec<_>>());
        }
    }
}
