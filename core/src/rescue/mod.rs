// Rescue engine - the four-phase state machine that drives reads of
// the input, writes of the output and mutations of the mapbook.
//
// Phases run in order: copying, trimming, scraping, retrying. Good
// regions are rescued first; each later phase attacks what the
// previous one left behind at a finer granularity.

pub mod skip;

use crate::block::{Block, Status};
use crate::domain::Domain;
use crate::io::{self, ReadOutcome};
use crate::loggers::{RateLogger, ReadLogger};
use crate::mapfile::{CurrentStatus, Mapbook};
use crate::maptool;
use crate::{RescueError, RescueResult};
use serde::{Deserialize, Serialize};
use skip::SkipController;
use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default cluster: 128 sectors of 512 bytes = 64 KiB per copy read
pub const DEFAULT_HARDBS: usize = 512;
pub const DEFAULT_CLUSTER: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescueOptions {
    /// Sector size of the input device
    pub hardbs: usize,
    /// Sectors per read attempt during the copying phase
    pub cluster: usize,
    /// Retry passes over bad sectors; negative means until interrupted
    pub max_retries: i32,
    pub skipbs: u64,
    pub max_skipbs: u64,
    pub min_read_rate: Option<u64>,
    pub max_read_rate: Option<u64>,
    pub max_error_rate: Option<u64>,
    /// Maximum error areas allowed; `new_errors_only` counts only the
    /// ones not already present in the loaded mapfile
    pub max_errors: Option<u64>,
    pub new_errors_only: bool,
    /// Maximum time without a successful read
    pub timeout: Option<Duration>,
    /// Wait between passes
    pub pause: Duration,
    pub reverse: bool,
    pub unidirectional: bool,
    pub no_trim: bool,
    pub no_scrape: bool,
    pub retrim: bool,
    pub try_again: bool,
    pub complete_only: bool,
    pub sparse: bool,
    pub synchronous: bool,
    /// Direct disc access (O_DIRECT) for the input / output files
    pub direct_in: bool,
    pub direct_out: bool,
    pub exit_on_error: bool,
    pub reopen_on_error: bool,
    pub verify_on_error: bool,
    /// Bitset selecting copying passes 1-3; `None` runs them all
    pub cpass: Option<u8>,
    /// Mapfile flush scheduling: elapsed time or mutation count,
    /// whichever trips first
    pub flush_interval: Duration,
    pub flush_ops: u32,
}

impl Default for RescueOptions {
    fn default() -> Self {
        Self {
            hardbs: DEFAULT_HARDBS,
            cluster: DEFAULT_CLUSTER,
            max_retries: 0,
            skipbs: skip::DEFAULT_SKIPBS,
            max_skipbs: skip::MAX_SKIPBS,
            min_read_rate: None,
            max_read_rate: None,
            max_error_rate: None,
            max_errors: None,
            new_errors_only: false,
            timeout: None,
            pause: Duration::ZERO,
            reverse: false,
            unidirectional: false,
            no_trim: false,
            no_scrape: false,
            retrim: false,
            try_again: false,
            complete_only: false,
            sparse: false,
            synchronous: false,
            direct_in: false,
            direct_out: false,
            exit_on_error: false,
            reopen_on_error: false,
            verify_on_error: false,
            cpass: None,
            flush_interval: Duration::from_secs(30),
            flush_ops: 1024,
        }
    }
}

impl RescueOptions {
    pub fn cluster_bytes(&self) -> u64 {
        (self.cluster * self.hardbs) as u64
    }
}

/// Final totals reported after a run
#[derive(Debug, Clone, Serialize)]
pub struct RescueSummary {
    pub rescued: u64,
    pub errsize: u64,
    pub errors: u64,
}

pub struct Rescuebook {
    map: Mapbook,
    domain: Domain,
    /// Finished areas of a test-mode mapfile define what is readable;
    /// reads outside them fail synthetically
    test_domain: Option<Domain>,
    opts: RescueOptions,
    input_path: PathBuf,
    input: File,
    output: File,
    /// Output position minus input position
    offset: i64,
    rate_log: Option<RateLogger>,
    read_log: Option<ReadLogger>,
    start: Instant,
    last_good: Instant,
    last_flush: Instant,
    ops_since_flush: u32,
    initial_errors: u64,
    resume_pos: Option<u64>,
    // one-second rate window
    tick_start: Instant,
    bytes_this_tick: u64,
    errsize_at_tick: u64,
    slow_reads: bool,
    rescued_this_run: u64,
    /// Highest output end touched, for extending a sparse file at exit
    out_end: u64,
    last_good_read: Option<Block>,
}

impl Rescuebook {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_path: PathBuf,
        input: File,
        output: File,
        map: Mapbook,
        mut domain: Domain,
        test_domain: Option<Domain>,
        offset: i64,
        opts: RescueOptions,
    ) -> Rescuebook {
        if opts.complete_only {
            domain.crop(map.extent());
        }
        let initial_errors = maptool::summarize(&map, &domain).errors;
        let resume_pos = (map.loaded()
            && map.current_status() == CurrentStatus::Copying
            && domain.includes_pos(map.current_pos()))
        .then(|| map.current_pos());
        let now = Instant::now();
        Rescuebook {
            map,
            domain,
            test_domain,
            opts,
            input_path,
            input,
            output,
            offset,
            rate_log: None,
            read_log: None,
            start: now,
            last_good: now,
            last_flush: now,
            ops_since_flush: 0,
            initial_errors,
            resume_pos,
            tick_start: now,
            bytes_this_tick: 0,
            errsize_at_tick: 0,
            slow_reads: false,
            rescued_this_run: 0,
            out_end: 0,
            last_good_read: None,
        }
    }

    pub fn with_rate_log(mut self, log: RateLogger) -> Rescuebook {
        self.rate_log = Some(log);
        self
    }

    pub fn with_read_log(mut self, log: ReadLogger) -> Rescuebook {
        self.read_log = Some(log);
        self
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn map(&self) -> &Mapbook {
        &self.map
    }

    /// Run every enabled phase. The mapfile is flushed on every exit
    /// path so the resume point is never lost.
    pub fn do_rescue(&mut self) -> RescueResult<RescueSummary> {
        if self.opts.retrim {
            self.remap(&[Status::NonScraped, Status::BadSector], Status::NonTrimmed);
        }
        if self.opts.try_again {
            self.remap(&[Status::NonTrimmed, Status::NonScraped], Status::NonTried);
        }
        let result = self.run_phases();
        let flush = self.flush_mapfile();
        match result {
            Ok(()) => {
                flush?;
                if self.opts.sparse {
                    self.extend_sparse_output()?;
                }
                let s = maptool::summarize(&self.map, &self.domain);
                info!(
                    rescued = s.size_finished,
                    errsize = s.errsize(),
                    errors = s.errors,
                    "rescue finished"
                );
                Ok(RescueSummary {
                    rescued: s.size_finished,
                    errsize: s.errsize(),
                    errors: s.errors,
                })
            }
            // the primary failure wins; a flush error at this point
            // cannot be reported any better
            Err(e) => Err(e),
        }
    }

    fn run_phases(&mut self) -> RescueResult<()> {
        self.copy_non_tried()?;
        if !self.opts.no_trim {
            self.trim_errors()?;
        }
        if !self.opts.no_scrape {
            self.scrape_errors()?;
        }
        if self.opts.max_retries != 0 {
            self.retry_bad_sectors()?;
        }
        self.map.set_current_status(CurrentStatus::Finished);
        Ok(())
    }

    /// Rewrite all areas of the given statuses inside the domain
    fn remap(&mut self, from: &[Status], to: Status) {
        let mut changes = Vec::new();
        for sb in self.map.iter() {
            if !from.contains(&sb.status()) {
                continue;
            }
            for db in self.domain.iter() {
                let piece = sb.block().crop(db);
                if !piece.is_empty() {
                    changes.push(piece);
                }
            }
        }
        for b in changes {
            self.map.change_chunk_status(b, to);
        }
    }

    // ----- phase 1: copying -----

    fn copy_non_tried(&mut self) -> RescueResult<()> {
        for pass in 1..=3u32 {
            if self.next_chunk(Status::NonTried, None, false).is_none() {
                break;
            }
            if let Some(bits) = self.opts.cpass {
                if bits & (1 << (pass - 1)) == 0 {
                    continue;
                }
            }
            let reverse = self.opts.reverse ^ (!self.opts.unidirectional && pass % 2 == 0);
            let skipping = pass < 3 && self.opts.skipbs > 0;
            self.map.set_current_pass(pass);
            self.enter_phase(CurrentStatus::Copying)?;
            info!(pass, reverse, skipping, "copying non-tried blocks");
            self.copy_pass(reverse, skipping)?;
            self.flush_mapfile()?;
            if self.opts.pause > Duration::ZERO
                && self.next_chunk(Status::NonTried, None, false).is_some()
            {
                std::thread::sleep(self.opts.pause);
            }
        }
        Ok(())
    }

    fn copy_pass(&mut self, reverse: bool, skipping: bool) -> RescueResult<()> {
        let mut skip = SkipController::new(
            if skipping { self.opts.skipbs } else { 0 },
            self.opts.max_skipbs,
        );
        let cbytes = self.opts.cluster_bytes();
        let natural_start = if reverse { self.domain.end() } else { self.domain.pos() };
        let mut cursor = match self.resume_pos.take() {
            Some(p) if !reverse => p,
            _ => natural_start,
        };
        let mut wrapped = cursor == natural_start;
        loop {
            self.check_interrupt()?;
            self.check_timeout()?;
            let chunk = match self.next_chunk(Status::NonTried, Some(cursor), reverse) {
                Some(c) => c,
                None if !wrapped => {
                    wrapped = true;
                    cursor = natural_start;
                    continue;
                }
                None => break,
            };
            // fall back to sector reads once the remaining area is slow
            if self.slow_reads && skip.enabled() {
                self.slow_reads = false;
                let jump = skip.on_error();
                let (mark, next) = if reverse {
                    let start = chunk.end().saturating_sub(jump).max(chunk.pos());
                    (Block::new(start, chunk.end() - start), start)
                } else {
                    let end = chunk.pos().saturating_add(jump).min(chunk.end());
                    (Block::new(chunk.pos(), end - chunk.pos()), end)
                };
                debug!(pos = mark.pos(), size = mark.size(), "skipping slow area");
                self.map.change_chunk_status(mark, Status::NonTrimmed);
                cursor = next;
                continue;
            }
            let b = bound_to_grid(chunk, reverse, cbytes);
            let outcome = self.copy_and_update(b, reverse)?;
            let good = outcome.bytes as u64;
            if let Some(err) = outcome.error {
                warn!(pos = b.pos() + good, error = %err, "read error");
                let err_pos = b.pos() + good;
                if reverse {
                    // the failed tail plus the region leapt backward over
                    self.map
                        .change_chunk_status(Block::new(err_pos, b.end() - err_pos), Status::NonTrimmed);
                    let target = if skip.enabled() {
                        b.pos().saturating_sub(skip.on_error()).max(chunk.pos())
                    } else {
                        b.pos()
                    };
                    if target < b.pos() {
                        self.map
                            .change_chunk_status(Block::new(target, b.pos() - target), Status::NonTrimmed);
                    }
                    cursor = target;
                } else {
                    // the failed area and the skip distance become one
                    // non-trimmed region for the later phases
                    let target = if skip.enabled() {
                        err_pos.saturating_add(skip.on_error()).min(chunk.end())
                    } else {
                        b.end()
                    };
                    self.map
                        .change_chunk_status(Block::new(err_pos, target - err_pos), Status::NonTrimmed);
                    cursor = target;
                }
                self.handle_read_error(err_pos)?;
            } else if outcome.bytes < b.size() as usize {
                // EOF: the input ends here, nothing beyond is reachable
                let eof = b.pos() + good;
                info!(pos = eof, "end of input reached");
                self.domain.crop_end(eof);
                if !reverse {
                    break;
                }
                cursor = b.pos();
            } else {
                skip.on_success();
                cursor = if reverse { b.pos() } else { b.end() };
            }
            self.after_iteration()?;
        }
        Ok(())
    }

    // ----- phase 2: trimming -----

    fn trim_errors(&mut self) -> RescueResult<()> {
        if self.next_chunk(Status::NonTrimmed, None, false).is_none() {
            return Ok(());
        }
        self.enter_phase(CurrentStatus::Trimming)?;
        info!("trimming failed areas");
        let hardbs = self.opts.hardbs as u64;
        while let Some(chunk) = self.next_chunk(Status::NonTrimmed, None, false) {
            // read inward from the leading edge until a sector fails
            let mut pos = chunk.pos();
            let mut fwd_stop = chunk.end();
            while pos < chunk.end() {
                self.check_interrupt()?;
                self.check_timeout()?;
                let end = grid_end(pos, hardbs).min(chunk.end());
                let sector = Block::new(pos, end - pos);
                let outcome = self.copy_and_update(sector, false)?;
                if outcome.bytes < sector.size() as usize {
                    let bad_pos = sector.pos() + outcome.bytes as u64;
                    self.map
                        .change_chunk_status(Block::new(bad_pos, end - bad_pos), Status::BadSector);
                    self.handle_read_error(bad_pos)?;
                    fwd_stop = end;
                    break;
                }
                pos = end;
                self.after_iteration()?;
            }
            if fwd_stop >= chunk.end() {
                continue; // the whole area read fine or failed at its tail
            }
            // read inward from the trailing edge until a sector fails
            let mut end = chunk.end();
            while end > fwd_stop {
                self.check_interrupt()?;
                self.check_timeout()?;
                let spos = grid_start(end - 1, hardbs).max(fwd_stop);
                let sector = Block::new(spos, end - spos);
                let outcome = self.copy_and_update(sector, true)?;
                if outcome.bytes < sector.size() as usize {
                    let bad_pos = sector.pos() + outcome.bytes as u64;
                    self.map
                        .change_chunk_status(Block::new(bad_pos, end - bad_pos), Status::BadSector);
                    self.handle_read_error(bad_pos)?;
                    // whatever lies between the two failures waits for
                    // the scraping phase
                    if spos > fwd_stop {
                        self.map.change_chunk_status(
                            Block::new(fwd_stop, spos - fwd_stop),
                            Status::NonScraped,
                        );
                    }
                    break;
                }
                end = spos;
                self.after_iteration()?;
            }
        }
        self.flush_mapfile()
    }

    // ----- phase 3: scraping -----

    fn scrape_errors(&mut self) -> RescueResult<()> {
        if self.next_chunk(Status::NonScraped, None, false).is_none() {
            return Ok(());
        }
        self.enter_phase(CurrentStatus::Scraping)?;
        info!("scraping remaining areas sector by sector");
        let reverse = self.opts.reverse;
        let hardbs = self.opts.hardbs as u64;
        let mut cursor = if reverse { self.domain.end() } else { self.domain.pos() };
        while let Some(chunk) = self.next_chunk(Status::NonScraped, Some(cursor), reverse) {
            self.check_interrupt()?;
            self.check_timeout()?;
            let sector = bound_to_grid(chunk, reverse, hardbs);
            let outcome = self.copy_and_update(sector, reverse)?;
            if outcome.bytes < sector.size() as usize {
                let bad_pos = sector.pos() + outcome.bytes as u64;
                self.map.change_chunk_status(
                    Block::new(bad_pos, sector.end() - bad_pos),
                    Status::BadSector,
                );
                self.handle_read_error(bad_pos)?;
            }
            cursor = if reverse { sector.pos() } else { sector.end() };
            self.after_iteration()?;
        }
        self.flush_mapfile()
    }

    // ----- phase 4: retrying -----

    fn retry_bad_sectors(&mut self) -> RescueResult<()> {
        if self.next_chunk(Status::BadSector, None, false).is_none() {
            return Ok(());
        }
        self.enter_phase(CurrentStatus::Retrying)?;
        let hardbs = self.opts.hardbs as u64;
        let mut pass = 0u32;
        loop {
            if self.next_chunk(Status::BadSector, None, false).is_none() {
                break;
            }
            if self.opts.max_retries >= 0 && pass >= self.opts.max_retries as u32 {
                break;
            }
            pass += 1;
            let reverse = self.opts.reverse ^ (!self.opts.unidirectional && pass % 2 == 0);
            info!(pass, reverse, "retrying bad sectors");
            let mut cursor = if reverse { self.domain.end() } else { self.domain.pos() };
            while let Some(chunk) = self.next_chunk(Status::BadSector, Some(cursor), reverse) {
                self.check_interrupt()?;
                self.check_timeout()?;
                let sector = bound_to_grid(chunk, reverse, hardbs);
                // success turns the sector finished; failure leaves it bad
                let _ = self.copy_and_update(sector, reverse)?;
                cursor = if reverse { sector.pos() } else { sector.end() };
                self.after_iteration()?;
            }
            self.flush_mapfile()?;
            if self.opts.pause > Duration::ZERO {
                std::thread::sleep(self.opts.pause);
            }
        }
        Ok(())
    }

    // ----- shared plumbing -----

    /// Next chunk of the given status inside the domain. Forward scans
    /// start at `cursor` (domain start when `None`); reverse scans end
    /// at `cursor` (domain end when `None`).
    fn next_chunk(&self, st: Status, cursor: Option<u64>, reverse: bool) -> Option<Block> {
        if !reverse {
            let mut pos = cursor.unwrap_or_else(|| self.domain.pos());
            loop {
                let mut b = Block::new(pos, u64::MAX - pos);
                self.map.find_chunk(&mut b, st);
                if b.is_empty() {
                    return None;
                }
                let piece = self
                    .domain
                    .iter()
                    .filter_map(|db| {
                        let c = b.crop(db);
                        (!c.is_empty()).then_some(c)
                    })
                    .min_by_key(|c| c.pos());
                match piece {
                    Some(p) => return Some(p),
                    None => pos = b.end(),
                }
            }
        } else {
            let mut end = cursor.unwrap_or_else(|| self.domain.end());
            loop {
                if end == 0 {
                    return None;
                }
                let mut b = Block::new(0, end);
                self.map.rfind_chunk(&mut b, st);
                if b.is_empty() {
                    return None;
                }
                let piece = self
                    .domain
                    .iter()
                    .filter_map(|db| {
                        let c = b.crop(db);
                        (!c.is_empty()).then_some(c)
                    })
                    .max_by_key(|c| c.end());
                match piece {
                    Some(p) => return Some(p),
                    None => end = b.pos(),
                }
            }
        }
    }

    /// Read a block, write the good part to the output and mark it
    /// finished. Only write failures are errors; read outcomes are data.
    fn copy_and_update(&mut self, b: Block, reverse: bool) -> RescueResult<ReadOutcome> {
        let mut buf = vec![0u8; b.size() as usize];
        let outcome = self.read_input(&mut buf, b.pos());
        let good = outcome.bytes;
        if good > 0 {
            let gb = Block::new(b.pos(), good as u64);
            self.write_output(&buf[..good], gb.pos())?;
            self.map.change_chunk_status(gb, Status::Finished);
            self.rescued_this_run += good as u64;
            self.bytes_this_tick += good as u64;
            self.last_good = Instant::now();
            self.last_good_read = Some(gb);
        }
        if let Some(log) = &mut self.read_log {
            log.log(b.pos(), b.size() as usize, good, outcome.error.is_some())?;
        }
        self.map.set_current_pos(if reverse { b.pos() } else { b.pos() + good as u64 });
        self.ops_since_flush += 1;
        Ok(outcome)
    }

    fn read_input(&mut self, buf: &mut [u8], pos: u64) -> ReadOutcome {
        if let Some(td) = &self.test_domain {
            let want = Block::new(pos, buf.len() as u64);
            let readable = td.prefix_of(&want);
            if readable.size() < want.size() {
                let n = readable.size() as usize;
                if n > 0 {
                    let out = io::readblock(&self.input, &mut buf[..n], pos);
                    if out.error.is_some() || out.bytes < n {
                        return out;
                    }
                }
                return ReadOutcome {
                    bytes: n,
                    error: Some(std::io::Error::from_raw_os_error(libc::EIO)),
                };
            }
        }
        io::readblock(&self.input, buf, pos)
    }

    /// A write failure is fatal; the caller's final flush preserves the
    /// resume point.
    fn write_output(&mut self, data: &[u8], ipos: u64) -> RescueResult<()> {
        let opos = ipos as i64 + self.offset;
        debug_assert!(opos >= 0);
        let opos = opos as u64;
        self.out_end = self.out_end.max(opos + data.len() as u64);
        if self.opts.sparse && io::is_all_zero(data) {
            return Ok(());
        }
        io::writeblock(&self.output, data, opos).map_err(|e| {
            warn!(pos = opos, error = %e, "write error on output");
            RescueError::Io(e)
        })?;
        if self.opts.synchronous {
            self.output.sync_data()?;
        }
        Ok(())
    }

    /// Skipped zero clusters at the tail still need the file to reach
    /// its full length
    fn extend_sparse_output(&mut self) -> RescueResult<()> {
        let len = self.output.metadata()?.len();
        if len < self.out_end {
            self.output.set_len(self.out_end)?;
        }
        Ok(())
    }

    /// Error bounds are enforced before anything touches the device
    /// again: exit-on-error must halt without another syscall.
    fn handle_read_error(&mut self, pos: u64) -> RescueResult<()> {
        if let Some(max) = self.opts.max_errors {
            let errors = maptool::summarize(&self.map, &self.domain).errors;
            let counted = if self.opts.new_errors_only {
                errors.saturating_sub(self.initial_errors)
            } else {
                errors
            };
            if counted > max {
                return Err(RescueError::env(format!(
                    "too many{} error areas: {counted}",
                    if self.opts.new_errors_only { " new" } else { "" }
                )));
            }
        }
        if self.opts.exit_on_error {
            return Err(RescueError::env(format!("read error at position {pos}")));
        }
        if self.opts.reopen_on_error {
            debug!("reopening input after read error");
            let mut open = std::fs::OpenOptions::new();
            open.read(true);
            if self.opts.direct_in {
                use std::os::unix::fs::OpenOptionsExt;
                open.custom_flags(libc::O_DIRECT);
            }
            self.input = open.open(&self.input_path)?;
        }
        if self.opts.verify_on_error {
            if let Some(gb) = self.last_good_read {
                let size = (self.opts.hardbs as u64).min(gb.size());
                let mut buf = vec![0u8; size as usize];
                let check = self.read_input(&mut buf, gb.pos());
                if check.error.is_some() || check.bytes < buf.len() {
                    return Err(RescueError::env(
                        "a previously good sector no longer reads; aborting",
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_interrupt(&mut self) -> RescueResult<()> {
        if crate::is_interrupted() {
            info!("interrupt received, saving mapfile");
            self.flush_mapfile()?;
            return Err(RescueError::Interrupted(crate::interrupt_signum()));
        }
        Ok(())
    }

    fn check_timeout(&mut self) -> RescueResult<()> {
        if let Some(t) = self.opts.timeout {
            if self.last_good.elapsed() > t {
                self.flush_mapfile()?;
                return Err(RescueError::Timeout(t.as_secs()));
            }
        }
        Ok(())
    }

    /// Record the phase in the header before any of its I/O happens
    fn enter_phase(&mut self, st: CurrentStatus) -> RescueResult<()> {
        self.map.set_current_status(st);
        self.flush_mapfile()
    }

    fn flush_mapfile(&mut self) -> RescueResult<()> {
        self.ops_since_flush = 0;
        self.last_flush = Instant::now();
        if self.map.path().is_none() {
            return Ok(());
        }
        self.map.save()
    }

    /// Once-per-iteration housekeeping: the one-second rate window,
    /// rate limits and the periodic mapfile flush
    fn after_iteration(&mut self) -> RescueResult<()> {
        if self.tick_start.elapsed() >= Duration::from_secs(1) {
            let elapsed = self.start.elapsed().as_secs().max(1);
            let s = maptool::summarize(&self.map, &self.domain);
            let current_rate = self.bytes_this_tick;
            let avg_rate = self.rescued_this_run / elapsed;
            if let Some(log) = &mut self.rate_log {
                log.log(
                    elapsed,
                    self.map.current_pos(),
                    current_rate,
                    avg_rate,
                    s.errors,
                    s.errsize(),
                )?;
            }
            if let Some(max) = self.opts.max_error_rate {
                let grown = s.errsize().saturating_sub(self.errsize_at_tick);
                if grown > max {
                    return Err(RescueError::env(format!(
                        "error rate {grown} B/s exceeds the limit"
                    )));
                }
            }
            if let Some(min) = self.opts.min_read_rate {
                self.slow_reads = current_rate < min;
            }
            self.errsize_at_tick = s.errsize();
            self.bytes_this_tick = 0;
            self.tick_start = Instant::now();
        }
        if let Some(max) = self.opts.max_read_rate {
            if self.bytes_this_tick > max {
                std::thread::sleep(
                    Duration::from_secs(1).saturating_sub(self.tick_start.elapsed()),
                );
            }
        }
        if self.last_flush.elapsed() >= self.opts.flush_interval
            || self.ops_since_flush >= self.opts.flush_ops
        {
            self.flush_mapfile()?;
        }
        Ok(())
    }
}

/// Crop `chunk` to the read grid: forward reads stop at the next
/// `unit` boundary, reverse reads start at the previous one.
fn bound_to_grid(chunk: Block, reverse: bool, unit: u64) -> Block {
    if !reverse {
        let end = grid_end(chunk.pos(), unit).min(chunk.end());
        Block::new(chunk.pos(), end - chunk.pos())
    } else {
        let pos = grid_start(chunk.end() - 1, unit).max(chunk.pos());
        Block::new(pos, chunk.end() - pos)
    }
}

fn grid_end(pos: u64, unit: u64) -> u64 {
    (pos / unit + 1) * unit
}

fn grid_start(pos: u64, unit: u64) -> u64 {
    pos / unit * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_to_grid_forward() {
        let chunk = Block::new(100, 10_000);
        let b = bound_to_grid(chunk, false, 4096);
        assert_eq!(b, Block::new(100, 3996));
        // already aligned
        let b = bound_to_grid(Block::new(4096, 10_000), false, 4096);
        assert_eq!(b, Block::new(4096, 4096));
        // smaller than a cluster
        let b = bound_to_grid(Block::new(0, 100), false, 4096);
        assert_eq!(b, Block::new(0, 100));
    }

    #[test]
    fn test_bound_to_grid_reverse() {
        let chunk = Block::new(0, 10_000);
        let b = bound_to_grid(chunk, true, 4096);
        assert_eq!(b, Block::new(8192, 1808));
        let b = bound_to_grid(Block::new(0, 8192), true, 4096);
        assert_eq!(b, Block::new(4096, 4096));
        let b = bound_to_grid(Block::new(4000, 50), true, 4096);
        assert_eq!(b, Block::new(4000, 50));
    }

    #[test]
    fn test_options_cluster_bytes() {
        let opts = RescueOptions::default();
        assert_eq!(opts.cluster_bytes(), 65536);
    }
}
