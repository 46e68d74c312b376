// Rescue domain - the portion of the input the user wants rescued,
// kept as an ordered disjoint sequence of blocks.

use crate::block::{Block, Sblock, Status};
use crate::mapfile::codec;
use crate::RescueResult;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    blocks: Vec<Block>,
}

impl Domain {
    /// Domain covering the window `[pos, pos + max_size)`.
    /// With no size bound the window extends to the end of the
    /// addressable range and is narrowed later to the input size.
    pub fn new(pos: u64, max_size: Option<u64>) -> Domain {
        let size = max_size.unwrap_or(u64::MAX - pos);
        let b = Block::new(pos, size);
        Domain {
            blocks: if b.is_empty() { Vec::new() } else { vec![b] },
        }
    }

    /// Domain restricted to the `finished` areas of a reference mapfile,
    /// cropped to the window `[pos, pos + max_size)`.
    pub fn from_mapfile(pos: u64, max_size: Option<u64>, path: &Path) -> RescueResult<Domain> {
        let parsed = codec::read_mapfile(path)?;
        Ok(Domain::from_finished(&parsed.sblocks, pos, max_size))
    }

    /// Same restriction applied to an already-parsed block sequence
    pub fn from_finished(sblocks: &[Sblock], pos: u64, max_size: Option<u64>) -> Domain {
        let window = Block::new(pos, max_size.unwrap_or(u64::MAX - pos));
        let blocks = sblocks
            .iter()
            .filter(|sb| sb.status() == Status::Finished)
            .map(|sb| sb.block().crop(&window))
            .filter(|b| !b.is_empty())
            .collect();
        Domain { blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks
    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Start of the first block; 0 for an empty domain
    pub fn pos(&self) -> u64 {
        self.blocks.first().map_or(0, |b| b.pos())
    }

    /// End of the last block; 0 for an empty domain
    pub fn end(&self) -> u64 {
        self.blocks.last().map_or(0, |b| b.end())
    }

    /// Span from first to last block, gaps included
    pub fn size(&self) -> u64 {
        self.end() - self.pos()
    }

    /// Sum of the block sizes, gaps excluded
    pub fn in_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size()).sum()
    }

    pub fn includes_pos(&self, pos: u64) -> bool {
        self.blocks.iter().any(|b| b.contains(pos))
    }

    /// True when a single domain block fully contains `b`
    pub fn includes(&self, b: &Block) -> bool {
        self.blocks.iter().any(|db| db.includes(b))
    }

    /// True when the whole domain lies before `b`
    pub fn precedes(&self, b: &Block) -> bool {
        self.end() <= b.pos()
    }

    /// Largest prefix of `b` lying inside a single domain block;
    /// empty when `b.pos` is outside the domain.
    pub fn prefix_of(&self, b: &Block) -> Block {
        for db in &self.blocks {
            if db.contains(b.pos()) {
                return b.crop(db);
            }
        }
        Block::empty(b.pos())
    }

    /// Intersect every block with `bound`, dropping what falls outside
    pub fn crop(&mut self, bound: Block) {
        self.blocks = self
            .blocks
            .iter()
            .map(|b| b.crop(&bound))
            .filter(|b| !b.is_empty())
            .collect();
    }

    /// Drop everything at or beyond `end`
    pub fn crop_end(&mut self, end: u64) {
        self.crop(Block::new(0, end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_window_domain() {
        let d = Domain::new(100, Some(400));
        assert_eq!(d.pos(), 100);
        assert_eq!(d.end(), 500);
        assert_eq!(d.in_size(), 400);
        assert!(d.includes(&Block::new(100, 400)));
        assert!(!d.includes(&Block::new(100, 401)));
    }

    #[test]
    fn test_empty_domain() {
        let d = Domain::new(10, Some(0));
        assert!(d.is_empty());
        assert_eq!(d.in_size(), 0);
    }

    #[test]
    fn test_unbounded_domain() {
        let d = Domain::new(0, None);
        assert!(d.includes_pos(u64::MAX - 1));
    }

    #[test]
    fn test_crop() {
        let mut d = Domain::new(0, Some(1000));
        d.crop_end(600);
        assert_eq!(d.end(), 600);
        d.crop(Block::new(700, 100));
        assert!(d.is_empty());
    }

    #[test]
    fn test_from_mapfile_restricts_to_finished() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# test map").unwrap();
        writeln!(f, "0x0 + 1").unwrap();
        writeln!(f, "0x0 0x100 +").unwrap();
        writeln!(f, "0x100 0x100 -").unwrap();
        writeln!(f, "0x200 0x100 +").unwrap();
        f.flush().unwrap();

        let d = Domain::from_mapfile(0, None, f.path()).unwrap();
        assert_eq!(d.blocks(), 2);
        assert!(d.includes(&Block::new(0, 0x100)));
        assert!(!d.includes_pos(0x180));
        assert!(d.includes(&Block::new(0x200, 0x100)));

        let narrowed = Domain::from_mapfile(0x40, Some(0x40), f.path()).unwrap();
        assert_eq!(narrowed.in_size(), 0x40);
        assert_eq!(narrowed.pos(), 0x40);
    }

    #[test]
    fn test_prefix_of() {
        let mut d = Domain::new(0, Some(100));
        d.crop(Block::new(0, 50));
        let p = d.prefix_of(&Block::new(40, 30));
        assert_eq!(p, Block::new(40, 10));
        assert!(d.prefix_of(&Block::new(60, 10)).is_empty());
    }
}
