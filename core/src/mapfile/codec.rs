// Text codec for the rescue mapfile.
//
// Line-oriented: `#` lines are comments, the first data line is the
// header `current_pos current_status [current_pass]`, every following
// data line is `pos size status`. Blocks must ascend with no gaps or
// overlaps. Individual lines are parsed with nom combinators; the
// driver walks the file line by line so corruption errors carry the
// offending line number. The serialised form is canonical: a generated
// comment header, hexadecimal numbers with a `0x` prefix, and any
// trailing comments of the source file preserved verbatim.

use super::CurrentStatus;
use crate::block::{Block, Sblock, Status};
use crate::{RescueError, RescueResult};
use nom::bytes::complete::take_till1;
use nom::character::complete::{anychar, space0, space1};
use nom::combinator::{all_consuming, map_opt, opt};
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ParsedMapfile {
    pub current_pos: u64,
    pub current_status: CurrentStatus,
    pub current_pass: u32,
    pub sblocks: Vec<Sblock>,
    pub trailing_comments: Vec<String>,
}

fn corrupt(label: &str, line: usize, reason: impl Into<String>) -> RescueError {
    RescueError::CorruptMapfile {
        path: label.to_string(),
        line,
        reason: reason.into(),
    }
}

/// C-style integer: `0x` hex, leading `0` octal, decimal otherwise.
pub fn parse_c_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

fn number(input: &str) -> IResult<&str, u64> {
    map_opt(take_till1(|c: char| c.is_whitespace()), parse_c_u64)(input)
}

fn block_status(input: &str) -> IResult<&str, Status> {
    map_opt(anychar, Status::from_char)(input)
}

fn current_status(input: &str) -> IResult<&str, CurrentStatus> {
    map_opt(anychar, CurrentStatus::from_char)(input)
}

/// `current_pos current_status [current_pass]`
fn header_line(input: &str) -> IResult<&str, (u64, CurrentStatus, Option<u64>)> {
    all_consuming(terminated(
        tuple((
            preceded(space0, number),
            preceded(space1, current_status),
            opt(preceded(space1, number)),
        )),
        space0,
    ))(input)
}

/// `pos size status`
fn block_line(input: &str) -> IResult<&str, (u64, u64, Status)> {
    all_consuming(terminated(
        tuple((
            preceded(space0, number),
            preceded(space1, number),
            preceded(space1, block_status),
        )),
        space0,
    ))(input)
}

pub fn parse(text: &str, label: &str) -> RescueResult<ParsedMapfile> {
    let mut header: Option<(u64, CurrentStatus, u32)> = None;
    let mut sblocks: Vec<Sblock> = Vec::new();
    // comments not yet attributed; flushed when a data line follows
    let mut pending_comments: Vec<String> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') {
            pending_comments.push(line.to_string());
            continue;
        }
        pending_comments.clear();

        if header.is_none() {
            let (_, (pos, status, pass)) = header_line(line)
                .map_err(|_| corrupt(label, lineno, "malformed header line"))?;
            let pass = match pass {
                None => 1,
                Some(p) if p >= 1 && p <= u32::MAX as u64 => p as u32,
                Some(_) => return Err(corrupt(label, lineno, "bad current_pass")),
            };
            header = Some((pos, status, pass));
            continue;
        }

        let (_, (pos, size, status)) = block_line(line)
            .map_err(|_| corrupt(label, lineno, "malformed block line"))?;
        if size == 0 {
            return Err(corrupt(label, lineno, "zero-sized block"));
        }
        if pos.checked_add(size).is_none() {
            return Err(corrupt(label, lineno, "block end overflows"));
        }
        if let Some(last) = sblocks.last() {
            if pos < last.end() {
                return Err(corrupt(label, lineno, "blocks overlap or are out of order"));
            }
            if pos > last.end() {
                return Err(corrupt(label, lineno, "gap between blocks"));
            }
        }
        sblocks.push(Sblock::new(Block::new(pos, size), status));
    }

    let (current_pos, current_status, current_pass) =
        header.ok_or_else(|| corrupt(label, text.lines().count().max(1), "missing header"))?;

    Ok(ParsedMapfile {
        current_pos,
        current_status,
        current_pass,
        sblocks,
        trailing_comments: pending_comments,
    })
}

pub fn read_mapfile(path: &Path) -> RescueResult<ParsedMapfile> {
    let text = fs::read_to_string(path)?;
    parse(&text, &path.display().to_string())
}

/// Render the canonical mapfile text.
pub fn render(
    current_pos: u64,
    current_status: CurrentStatus,
    current_pass: u32,
    sblocks: &[Sblock],
    trailing_comments: &[String],
) -> String {
    let mut out = String::new();
    out.push_str("# Rescue map. Created by blockrescue\n");
    out.push_str(&format!(
        "# Saved: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str("# current_pos  current_status  current_pass\n");
    out.push_str(&format!(
        "{:#010X}     {}               {}\n",
        current_pos,
        current_status.as_char(),
        current_pass
    ));
    out.push_str("#      pos        size  status\n");
    for sb in sblocks {
        out.push_str(&format!(
            "{:#010X}  {:#010X}  {}\n",
            sb.pos(),
            sb.size(),
            sb.status().as_char()
        ));
    }
    for comment in trailing_comments {
        out.push_str(comment);
        out.push('\n');
    }
    out
}

/// Destructive-replace write: the new contents land in `<path>.tmp`,
/// are synced, and take the place of the old file via rename. A crash
/// leaves the previous snapshot intact.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}
