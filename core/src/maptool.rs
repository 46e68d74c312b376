// Status-file algebra: operations treating mapfiles as first-class
// values. Logical combinators work on the `finished` bit of two maps
// over a shared domain; the rest are rewrites, queries and summaries
// of a single map.

use crate::block::{Block, Status};
use crate::domain::Domain;
use crate::mapfile::codec;
use crate::mapfile::Mapbook;
use crate::{RescueError, RescueResult};
use serde::Serialize;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

/// Blocks of the map that lie entirely inside the domain, in order.
/// Partially overlapping blocks are left untouched by the rewrites.
fn in_domain<'a>(book: &'a Mapbook, domain: &'a Domain) -> impl Iterator<Item = &'a crate::block::Sblock> {
    book.iter()
        .take_while(|sb| !domain.precedes(&sb.block()))
        .filter(|sb| domain.includes(&sb.block()))
}

/// Status of `other` at `pos` together with the end of the containing
/// chunk; positions outside the mapped range count as not finished.
fn chunk_at(other: &Mapbook, pos: u64) -> (Option<Status>, u64) {
    let extent = other.extent();
    if extent.is_empty() || pos >= extent.end() {
        return (None, u64::MAX);
    }
    if pos < extent.pos() {
        return (None, extent.pos());
    }
    let i = other
        .find_index(pos)
        .unwrap_or_else(|| crate::internal_error("position fell outside the other map"));
    (Some(other.sblock(i).status()), other.sblock(i).end())
}

/// Apply AND / OR / XOR over the `finished` bits of `other` onto `book`.
pub fn combine(book: &mut Mapbook, other: &Mapbook, domain: &Domain, op: LogicOp) {
    let mut changes: Vec<(Block, Status)> = Vec::new();
    for sb in in_domain(book, domain) {
        let mut pos = sb.pos();
        while pos < sb.end() {
            let (st, chunk_end) = chunk_at(other, pos);
            let end = chunk_end.min(sb.end());
            let piece = Block::new(pos, end - pos);
            let other_finished = st == Some(Status::Finished);
            match op {
                LogicOp::And => {
                    if sb.status() == Status::Finished && !other_finished {
                        changes.push((piece, Status::BadSector));
                    }
                }
                LogicOp::Or => {
                    if sb.status() != Status::Finished && other_finished {
                        changes.push((piece, Status::Finished));
                    }
                }
                LogicOp::Xor => {
                    if other_finished {
                        let st = if sb.status() == Status::Finished {
                            Status::BadSector
                        } else {
                            Status::Finished
                        };
                        changes.push((piece, st));
                    }
                }
            }
            pos = end;
        }
    }
    for (b, st) in changes {
        book.change_chunk_status(b, st);
    }
    book.compact();
}

/// Rewrite every block whose status appears in `from` to the
/// corresponding status in `to`. `to` must be at least as long as
/// `from`; the CLI right-pads it with its final character.
pub fn change_types(book: &mut Mapbook, domain: &Domain, from: &[Status], to: &[Status]) {
    let mut changes: Vec<(Block, Status)> = Vec::new();
    for sb in in_domain(book, domain) {
        if let Some(j) = from.iter().position(|&st| st == sb.status()) {
            changes.push((sb.block(), to[j]));
        }
    }
    for (b, st) in changes {
        book.change_chunk_status(b, st);
    }
    book.compact();
}

/// The documented inversion: only `finished` flips to `bad_sector`;
/// every other status becomes `finished`. Deliberately not self-inverse.
pub fn invert(book: &mut Mapbook, domain: &Domain) {
    change_types(
        book,
        domain,
        &Status::ALL,
        &[
            Status::Finished,
            Status::Finished,
            Status::Finished,
            Status::Finished,
            Status::BadSector,
        ],
    );
}

/// Equal iff the domains agree and the per-byte status sequences agree
pub fn compare(a: &Mapbook, b: &Mapbook, domain_a: &Domain, domain_b: &Domain) -> bool {
    if domain_a != domain_b {
        return false;
    }
    let blocks_a: Vec<_> = in_domain(a, domain_a).collect();
    let blocks_b: Vec<_> = in_domain(b, domain_b).collect();
    blocks_a == blocks_b
}

/// Emit one decimal block number per line, ascending, for every
/// `hardbs`-sized block of the selected types. `offset` shifts input
/// positions into output positions before the division.
pub fn list_blocks(
    book: &Mapbook,
    domain: &Domain,
    types: &[Status],
    hardbs: u64,
    offset: i64,
    out: &mut impl Write,
) -> RescueResult<()> {
    let hardbs = hardbs as i128;
    let mut last_block: i128 = -1;
    for sb in in_domain(book, domain) {
        if !types.contains(&sb.status()) {
            continue;
        }
        let mut block = (sb.pos() as i128 + offset as i128) / hardbs;
        while block * hardbs < sb.end() as i128 + offset as i128 {
            match block.cmp(&last_block) {
                std::cmp::Ordering::Greater => {
                    last_block = block;
                    writeln!(out, "{block}")?;
                }
                std::cmp::Ordering::Less => crate::internal_error("block out of order"),
                std::cmp::Ordering::Equal => {}
            }
            block += 1;
        }
    }
    Ok(())
}

/// Build a mapfile from block numbers read one per line: listed blocks
/// inside the domain get `type1`, everything else `type2`.
pub fn create_from_blocks(
    domain: &Domain,
    hardbs: u64,
    type1: Status,
    type2: Status,
    input: impl BufRead,
) -> RescueResult<Mapbook> {
    let mut book = Mapbook::create(domain.end(), None);
    book.change_chunk_status(Block::new(0, domain.end()), type2);
    for (idx, line) in input.lines().enumerate() {
        let linenum = idx + 1;
        let line = line?;
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        let bad_line = || RescueError::CorruptMapfile {
            path: "stdin".to_string(),
            line: linenum,
            reason: "error reading block number".to_string(),
        };
        let block: i64 = codec::parse_c_u64(token)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(bad_line)?;
        // positions past i64::MAX / hardbs would overflow byte math
        if block > i64::MAX / hardbs as i64 {
            return Err(bad_line());
        }
        let b = Block::new(block as u64 * hardbs, hardbs);
        if domain.includes(&b) {
            book.change_chunk_status(b, type1);
        }
    }
    book.truncate_vector(domain.end(), true);
    Ok(book)
}

/// True iff every byte of the domain covered by the map is `finished`
pub fn is_done(book: &Mapbook, domain: &Domain) -> bool {
    for sb in book.iter() {
        if sb.status() == Status::Finished {
            continue;
        }
        if domain.iter().any(|db| db.overlaps(&sb.block())) {
            return false;
        }
    }
    true
}

/// Totals and area counts per status, plus the error-run count
#[derive(Debug, Default, Clone, Serialize)]
pub struct Summary {
    pub size_non_tried: u64,
    pub size_non_trimmed: u64,
    pub size_non_scraped: u64,
    pub size_bad_sector: u64,
    pub size_finished: u64,
    pub areas_non_tried: u64,
    pub areas_non_trimmed: u64,
    pub areas_non_scraped: u64,
    pub areas_bad_sector: u64,
    pub areas_finished: u64,
    /// Maximal runs of error-status blocks, runs broken by domain gaps
    pub errors: u64,
}

impl Summary {
    pub fn errsize(&self) -> u64 {
        self.size_non_trimmed + self.size_non_scraped + self.size_bad_sector
    }
}

pub fn summarize(book: &Mapbook, domain: &Domain) -> Summary {
    let mut s = Summary::default();
    let mut first_block = true;
    let mut good = true;
    let mut old_status: Option<Status> = None;
    for sb in book.iter() {
        if domain.precedes(&sb.block()) {
            break;
        }
        if !domain.includes(&sb.block()) {
            first_block = true;
            good = true;
            continue;
        }
        let new_area = first_block || old_status != Some(sb.status());
        first_block = false;
        match sb.status() {
            Status::NonTried => {
                s.size_non_tried += sb.size();
                good = true;
                if new_area {
                    s.areas_non_tried += 1;
                }
            }
            Status::Finished => {
                s.size_finished += sb.size();
                good = true;
                if new_area {
                    s.areas_finished += 1;
                }
            }
            Status::NonTrimmed => {
                s.size_non_trimmed += sb.size();
                if good {
                    good = false;
                    s.errors += 1;
                }
                if new_area {
                    s.areas_non_trimmed += 1;
                }
            }
            Status::NonScraped => {
                s.size_non_scraped += sb.size();
                if good {
                    good = false;
                    s.errors += 1;
                }
                if new_area {
                    s.areas_non_scraped += 1;
                }
            }
            Status::BadSector => {
                s.size_bad_sector += sb.size();
                if good {
                    good = false;
                    s.errors += 1;
                }
                if new_area {
                    s.areas_bad_sector += 1;
                }
            }
        }
        old_status = Some(sb.status());
    }
    s
}

/// Human-readable rendering of a summary
pub fn show_status(book: &Mapbook, domain: &Domain, out: &mut impl Write) -> std::io::Result<()> {
    use crate::units::{format_num, format_percentage};
    let s = summarize(book, domain);
    let domain_size = domain.in_size();
    writeln!(
        out,
        "current pos: {:>10}B,  current status: {}",
        format_num(book.current_pos()),
        book.current_status().name()
    )?;
    writeln!(
        out,
        "domain size: {:>10}B,  in {:>4} area(s)",
        format_num(domain_size),
        domain.blocks()
    )?;
    writeln!(
        out,
        "    rescued: {:>10}B,  in {:>4} area(s)  ({})",
        format_num(s.size_finished),
        s.areas_finished,
        format_percentage(s.size_finished, domain_size)
    )?;
    writeln!(
        out,
        "  non-tried: {:>10}B,  in {:>4} area(s)  ({})",
        format_num(s.size_non_tried),
        s.areas_non_tried,
        format_percentage(s.size_non_tried, domain_size)
    )?;
    writeln!(
        out,
        "\n    errsize: {:>10}B,  errors: {:>7}  ({})",
        format_num(s.errsize()),
        s.errors,
        format_percentage(s.errsize(), domain_size)
    )?;
    writeln!(
        out,
        "non-trimmed: {:>10}B,  in {:>4} area(s)  ({})",
        format_num(s.size_non_trimmed),
        s.areas_non_trimmed,
        format_percentage(s.size_non_trimmed, domain_size)
    )?;
    writeln!(
        out,
        "non-scraped: {:>10}B,  in {:>4} area(s)  ({})",
        format_num(s.size_non_scraped),
        s.areas_non_scraped,
        format_percentage(s.size_non_scraped, domain_size)
    )?;
    writeln!(
        out,
        " bad-sector: {:>10}B,  in {:>4} area(s)  ({})",
        format_num(s.size_bad_sector),
        s.areas_bad_sector,
        format_percentage(s.size_bad_sector, domain_size)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(extent: u64, parts: &[(u64, u64, Status)]) -> Mapbook {
        let mut b = Mapbook::create(extent, None);
        for &(pos, size, st) in parts {
            b.change_chunk_status(Block::new(pos, size), st);
        }
        b
    }

    fn blocks(b: &Mapbook) -> Vec<(u64, u64, Status)> {
        b.iter().map(|sb| (sb.pos(), sb.size(), sb.status())).collect()
    }

    #[test]
    fn test_and_concrete() {
        // A = {0,4096,+},{4096,4096,-}; B = {0,2048,+},{2048,6144,-}
        let mut a = book(8192, &[(0, 4096, Status::Finished), (4096, 4096, Status::BadSector)]);
        let b = book(8192, &[(0, 2048, Status::Finished), (2048, 6144, Status::BadSector)]);
        let domain = Domain::new(0, Some(8192));
        combine(&mut a, &b, &domain, LogicOp::And);
        assert_eq!(
            blocks(&a),
            vec![(0, 2048, Status::Finished), (2048, 6144, Status::BadSector)]
        );
    }

    #[test]
    fn test_and_or_self_identity() {
        let parts = [
            (0, 0x100, Status::Finished),
            (0x100, 0x80, Status::BadSector),
            (0x180, 0x80, Status::NonScraped),
        ];
        let domain = Domain::new(0, Some(0x400));
        for op in [LogicOp::And, LogicOp::Or] {
            let mut a = book(0x400, &parts);
            let same = book(0x400, &parts);
            let before = blocks(&a);
            combine(&mut a, &same, &domain, op);
            assert_eq!(blocks(&a), before, "{op:?} with itself must be identity");
        }
    }

    #[test]
    fn test_xor_self() {
        // finished everywhere A was finished becomes bad, rest unchanged
        let mut a = book(0x400, &[(0, 0x100, Status::Finished), (0x100, 0x80, Status::NonTrimmed)]);
        let same = a.clone();
        let domain = Domain::new(0, Some(0x400));
        combine(&mut a, &same, &domain, LogicOp::Xor);
        assert_eq!(
            blocks(&a),
            vec![
                (0, 0x100, Status::BadSector),
                (0x100, 0x80, Status::NonTrimmed),
                (0x180, 0x280, Status::NonTried),
            ]
        );
    }

    #[test]
    fn test_or_fills_from_other() {
        let mut a = book(0x200, &[(0, 0x100, Status::BadSector)]);
        let b = book(0x200, &[(0x80, 0x100, Status::Finished)]);
        let domain = Domain::new(0, Some(0x200));
        combine(&mut a, &b, &domain, LogicOp::Or);
        assert_eq!(
            blocks(&a),
            vec![
                (0, 0x80, Status::BadSector),
                (0x80, 0x100, Status::Finished),
                (0x180, 0x80, Status::NonTried),
            ]
        );
    }

    #[test]
    fn test_invert_mapping() {
        let mut a = book(
            0x500,
            &[
                (0x100, 0x100, Status::Finished),
                (0x200, 0x100, Status::BadSector),
                (0x300, 0x100, Status::NonTrimmed),
                (0x400, 0x100, Status::NonScraped),
            ],
        );
        let domain = Domain::new(0, Some(0x500));
        invert(&mut a, &domain);
        assert_eq!(
            blocks(&a),
            vec![
                (0, 0x100, Status::Finished),
                (0x100, 0x100, Status::BadSector),
                (0x200, 0x300, Status::Finished),
            ]
        );
    }

    #[test]
    fn test_double_invert_maps_errors_to_bad() {
        let parts = [
            (0, 0x100, Status::Finished),
            (0x100, 0x100, Status::NonTrimmed),
        ];
        let domain = Domain::new(0, Some(0x300));
        let mut twice = book(0x300, &parts);
        invert(&mut twice, &domain);
        invert(&mut twice, &domain);
        // non-finished statuses collapse to bad_sector, finished survives
        assert_eq!(
            blocks(&twice),
            vec![(0, 0x100, Status::Finished), (0x100, 0x200, Status::BadSector)]
        );
    }

    #[test]
    fn test_compare() {
        let parts = [(0, 0x100, Status::Finished), (0x100, 0x100, Status::BadSector)];
        let a = book(0x200, &parts);
        let b = book(0x200, &parts);
        let c = book(0x200, &[(0, 0x200, Status::Finished)]);
        let d = Domain::new(0, Some(0x200));
        assert!(compare(&a, &a, &d, &d));
        assert!(compare(&a, &b, &d, &d));
        assert_eq!(compare(&a, &c, &d, &d), compare(&c, &a, &d, &d));
        assert!(!compare(&a, &c, &d, &d));
        assert!(!compare(&a, &b, &d, &Domain::new(0, Some(0x100))));
    }

    #[test]
    fn test_list_blocks() {
        let a = book(0x1000, &[(0x200, 0x400, Status::BadSector)]);
        let domain = Domain::new(0, Some(0x1000));
        let mut out = Vec::new();
        list_blocks(&a, &domain, &[Status::BadSector], 512, 0, &mut out).unwrap();
        let listed: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(listed, vec!["1", "2"]);

        // offset shifts the numbering
        let mut out = Vec::new();
        list_blocks(&a, &domain, &[Status::BadSector], 512, 1024, &mut out).unwrap();
        let listed: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(listed, vec!["3", "4"]);
    }

    #[test]
    fn test_create_from_blocks() {
        let domain = Domain::new(0, Some(0x1000));
        let input = b"1\n3\n3\n" as &[u8];
        let book = create_from_blocks(&domain, 512, Status::BadSector, Status::Finished, input)
            .unwrap();
        assert_eq!(
            blocks(&book),
            vec![
                (0, 512, Status::Finished),
                (512, 512, Status::BadSector),
                (1024, 512, Status::Finished),
                (1536, 512, Status::BadSector),
                (2048, 0x1000 - 2048, Status::Finished),
            ]
        );
    }

    #[test]
    fn test_create_from_blocks_overflow_guard() {
        let domain = Domain::new(0, Some(0x1000));
        let too_big = format!("{}\n", i64::MAX / 512 + 1);
        let err = create_from_blocks(
            &domain,
            512,
            Status::BadSector,
            Status::Finished,
            too_big.as_bytes(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let limit = format!("{}\n", i64::MAX / 512);
        assert!(create_from_blocks(
            &domain,
            512,
            Status::BadSector,
            Status::Finished,
            limit.as_bytes(),
        )
        .is_ok());
    }

    #[test]
    fn test_is_done() {
        let full = 0x2000;
        let done = book(full, &[(0, full, Status::Finished)]);
        let domain = Domain::new(0, Some(full));
        assert!(is_done(&done, &domain));

        let partial = book(full, &[(0, full - 512, Status::Finished), (full - 512, 512, Status::BadSector)]);
        assert!(!is_done(&partial, &domain));
        // the bad tail is outside a narrower domain
        assert!(is_done(&partial, &Domain::new(0, Some(full - 512))));
    }

    #[test]
    fn test_summarize_error_runs() {
        // two adjacent error areas of different statuses form ONE run
        let a = book(
            0x600,
            &[
                (0x100, 0x100, Status::NonTrimmed),
                (0x200, 0x100, Status::BadSector),
                (0x400, 0x100, Status::BadSector),
            ],
        );
        let domain = Domain::new(0, Some(0x600));
        let s = summarize(&a, &domain);
        assert_eq!(s.errors, 2);
        assert_eq!(s.areas_non_trimmed, 1);
        assert_eq!(s.areas_bad_sector, 2);
        assert_eq!(s.errsize(), 0x300);
        assert_eq!(s.size_finished, 0);
        assert_eq!(s.size_non_tried, 0x300);
    }
}
