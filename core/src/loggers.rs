// Append-only log sinks for rescue telemetry.
//
// The rate log records one tab-delimited row per interval:
// elapsed seconds, input position, current rate, average rate, error
// area count and error size. The read log records every attempted
// read with its outcome.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct RateLogger {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RateLogger {
    pub fn create(path: &Path) -> io::Result<RateLogger> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "# Rates log. Created by blockrescue at {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(out, "# Time\tIpos\tCurrent_rate\tAverage_rate\tErrors\tErrsize")?;
        Ok(RateLogger {
            path: path.to_path_buf(),
            out,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(
        &mut self,
        elapsed_sec: u64,
        ipos: u64,
        current_rate: u64,
        avg_rate: u64,
        errors: u64,
        errsize: u64,
    ) -> io::Result<()> {
        writeln!(
            self.out,
            "{elapsed_sec}\t0x{ipos:X}\t{current_rate}\t{avg_rate}\t{errors}\t{errsize}"
        )?;
        self.out.flush()
    }
}

pub struct ReadLogger {
    path: PathBuf,
    out: BufWriter<File>,
    start: Instant,
}

impl ReadLogger {
    pub fn create(path: &Path) -> io::Result<ReadLogger> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "# Reads log. Created by blockrescue at {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(out, "# Time\tIpos\tSize\tCopied\tOutcome")?;
        Ok(ReadLogger {
            path: path.to_path_buf(),
            out,
            start: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One row per attempted read; `copied` is what actually arrived
    pub fn log(&mut self, pos: u64, size: usize, copied: usize, failed: bool) -> io::Result<()> {
        writeln!(
            self.out,
            "{:.3}\t0x{pos:X}\t{size}\t{copied}\t{}",
            self.start.elapsed().as_secs_f64(),
            if failed { '-' } else { '+' }
        )?;
        self.out.flush()
    }
}
