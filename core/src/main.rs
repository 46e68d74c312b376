use blockrescue::domain::Domain;
use blockrescue::loggers::{RateLogger, ReadLogger};
use blockrescue::mapfile::{codec, CurrentStatus, Mapbook};
use blockrescue::rescue::skip;
use blockrescue::units::{format_num, parse_num, parse_time_interval, set_binary_prefixes};
use blockrescue::{io, RescueError, RescueOptions, Rescuebook};
use clap::Parser;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "blockrescue")]
#[command(about = "Copies data from one file or block device to another,\n\
rescuing the good parts first in case of read errors.")]
#[command(version)]
struct Cli {
    /// Input file or block device
    infile: PathBuf,

    /// Output file or block device
    outfile: PathBuf,

    /// Rescue map; without one a rescue cannot be resumed
    mapfile: Option<PathBuf>,

    /// Minimum read rate of good areas in bytes/s
    #[arg(short = 'a', long, value_name = "BYTES")]
    min_read_rate: Option<String>,

    /// Mark non-trimmed and non-scraped areas as non-tried
    #[arg(short = 'A', long)]
    try_again: bool,

    /// Sector size of the input device
    #[arg(short = 'b', long, value_name = "BYTES", default_value = "512")]
    sector_size: String,

    /// Show binary multipliers in numbers instead of SI
    #[arg(short = 'B', long)]
    binary_prefixes: bool,

    /// Sectors to copy at a time
    #[arg(short = 'c', long, value_name = "SECTORS")]
    cluster_size: Option<String>,

    /// Don't read new data beyond mapfile limits
    #[arg(short = 'C', long)]
    complete_only: bool,

    /// Use direct disc access for the input file
    #[arg(short = 'd', long)]
    idirect: bool,

    /// Use direct disc access for the output file
    #[arg(short = 'D', long)]
    odirect: bool,

    /// Maximum number of error areas allowed; +N counts only new ones
    #[arg(short = 'e', long, value_name = "[+]N", allow_hyphen_values = true)]
    max_errors: Option<String>,

    /// Maximum rate of read errors in bytes/s
    #[arg(short = 'E', long, value_name = "BYTES")]
    max_error_rate: Option<String>,

    /// Overwrite an output device or partition
    #[arg(short = 'f', long)]
    force: bool,

    /// Simulate read errors outside the finished areas of this mapfile
    #[arg(short = 'H', long, value_name = "FILE")]
    test_mode: Option<PathBuf>,

    /// Starting position of the rescue domain in the input file
    #[arg(short = 'i', long, value_name = "BYTES")]
    input_position: Option<String>,

    /// Verify the input size against the size recorded in the mapfile
    #[arg(short = 'I', long)]
    verify_input_size: bool,

    /// Reread the latest good sector after every read error
    #[arg(short = 'J', long)]
    verify_on_error: bool,

    /// Initial size to skip on read error, optionally with a maximum
    #[arg(short = 'K', long, value_name = "[SIZE][,MAX]")]
    skip_size: Option<String>,

    /// Accept an incomplete domain or test-mode mapfile
    #[arg(short = 'L', long)]
    loose_domain: bool,

    /// Restrict the domain to the finished blocks of this mapfile
    #[arg(short = 'm', long, value_name = "FILE")]
    domain_mapfile: Option<PathBuf>,

    /// Mark failed blocks as non-trimmed again
    #[arg(short = 'M', long)]
    retrim: bool,

    /// Skip the scraping phase
    #[arg(short = 'n', long)]
    no_scrape: bool,

    /// Skip the trimming phase
    #[arg(short = 'N', long)]
    no_trim: bool,

    /// Starting position in the output file
    #[arg(short = 'o', long, value_name = "BYTES")]
    output_position: Option<String>,

    /// Reopen the input file after every read error
    #[arg(short = 'O', long)]
    reopen_on_error: bool,

    /// Preallocate space on disc for the output file
    #[arg(short = 'p', long)]
    preallocate: bool,

    /// Suppress all messages
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Retry passes over bad sectors; -1 means until interrupted
    #[arg(
        short = 'r',
        long,
        value_name = "N",
        default_value = "0",
        allow_hyphen_values = true
    )]
    retry_passes: i32,

    /// Reverse the direction of all passes
    #[arg(short = 'R', long)]
    reverse: bool,

    /// Maximum size of input data to be copied
    #[arg(short = 's', long = "size", value_name = "BYTES")]
    max_size: Option<String>,

    /// Use sparse writes for the output file
    #[arg(short = 'S', long)]
    sparse: bool,

    /// Truncate the output file to zero size before copying
    #[arg(short = 't', long)]
    truncate: bool,

    /// Maximum time since the last successful read
    #[arg(short = 'T', long, value_name = "INTERVAL")]
    timeout: Option<String>,

    /// Run all passes in the same direction
    #[arg(short = 'u', long)]
    unidirectional: bool,

    /// Be verbose; repeat for more detail
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Extend the output file to be at least this long
    #[arg(short = 'x', long, value_name = "BYTES")]
    extend_outfile: Option<String>,

    /// Exit after the first read error
    #[arg(short = 'X', long)]
    exit_on_error: bool,

    /// Use synchronous writes for the output file
    #[arg(short = 'y', long)]
    synchronous: bool,

    /// Maximum read rate in bytes/s
    #[arg(short = 'Z', long, value_name = "BYTES")]
    max_read_rate: Option<String>,

    /// Ask for confirmation before starting the copy
    #[arg(long)]
    ask: bool,

    /// Select which copying passes to run, e.g. 1,2
    #[arg(long, value_name = "N[,N]")]
    cpass: Option<String>,

    /// Time to wait between passes
    #[arg(long, value_name = "INTERVAL")]
    pause: Option<String>,

    /// Log rates and error sizes to this file
    #[arg(long, value_name = "FILE")]
    log_rates: Option<PathBuf>,

    /// Log every read operation to this file
    #[arg(long, value_name = "FILE")]
    log_reads: Option<PathBuf>,
}

fn init_logging(quiet: bool, verbose: u8) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn env_err(msg: impl Into<String>) -> RescueError {
    RescueError::env(msg)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

fn check_identical(cli: &Cli) -> Result<(), RescueError> {
    if same_file(&cli.infile, &cli.outfile) {
        return Err(env_err("infile and outfile are the same"));
    }
    if let Some(map) = &cli.mapfile {
        if same_file(&cli.infile, map) {
            return Err(env_err("infile and mapfile are the same"));
        }
        if same_file(&cli.outfile, map) {
            return Err(env_err("outfile and mapfile are the same"));
        }
    }
    Ok(())
}

fn parse_cpass(arg: &str) -> Result<u8, RescueError> {
    let mut bits = 0u8;
    for part in arg.split(',') {
        match part {
            "0" => {}
            "1" => bits |= 1,
            "2" => bits |= 2,
            "3" => bits |= 4,
            _ => return Err(env_err(format!("bad list of passes '{arg}'"))),
        }
    }
    Ok(bits)
}

fn parse_skip_size(arg: &str, hardbs: u64) -> Result<(u64, u64), RescueError> {
    let (first, second) = match arg.split_once(',') {
        Some((a, b)) => (a, Some(b)),
        None => (arg, None),
    };
    let mut skipbs = skip::DEFAULT_SKIPBS;
    if !first.is_empty() {
        skipbs = parse_num(first, hardbs).map_err(|e| env_err(e.to_string()))?;
    }
    let max_skipbs = match second {
        Some(s) => parse_num(s, hardbs).map_err(|e| env_err(e.to_string()))?,
        None => skip::MAX_SKIPBS,
    };
    if skipbs > 0 && skipbs < skip::DEFAULT_SKIPBS {
        return Err(env_err("minimum initial skip size is 64KiB"));
    }
    if skipbs > max_skipbs {
        return Err(env_err("initial skip size is larger than max skip size"));
    }
    Ok((skipbs, max_skipbs.min(skip::MAX_SKIPBS)))
}

/// Loose mode accepts any mapfile as a domain source; otherwise the
/// referenced rescue must have run to completion.
fn load_reference_domain(
    path: &Path,
    pos: u64,
    max_size: Option<u64>,
    loose: bool,
) -> Result<Domain, RescueError> {
    let parsed = codec::read_mapfile(path)?;
    if !loose && parsed.current_status != CurrentStatus::Finished {
        return Err(env_err(format!(
            "mapfile '{}' is unfinished; use --loose-domain to accept it",
            path.display()
        )));
    }
    Ok(Domain::from_finished(&parsed.sblocks, pos, max_size))
}

fn build_options(cli: &Cli, hardbs: u64) -> Result<RescueOptions, RescueError> {
    let num = |arg: &Option<String>| -> Result<Option<u64>, RescueError> {
        arg.as_deref()
            .map(|s| parse_num(s, hardbs).map_err(|e| env_err(e.to_string())))
            .transpose()
    };
    let mut opts = RescueOptions {
        hardbs: hardbs as usize,
        ..RescueOptions::default()
    };
    if let Some(c) = &cli.cluster_size {
        let sectors = parse_num(c, hardbs).map_err(|e| env_err(e.to_string()))?;
        if sectors == 0 {
            return Err(env_err("cluster size must be at least one sector"));
        }
        opts.cluster = sectors as usize;
    } else {
        opts.cluster = ((65536 / hardbs) as usize).max(1);
    }
    if let Some(k) = &cli.skip_size {
        let (skipbs, max_skipbs) = parse_skip_size(k, hardbs)?;
        opts.skipbs = skipbs;
        opts.max_skipbs = max_skipbs;
    }
    if let Some(e) = &cli.max_errors {
        opts.new_errors_only = e.starts_with('+');
        let digits = e.strip_prefix('+').unwrap_or(e);
        opts.max_errors =
            Some(parse_num(digits, 0).map_err(|err| env_err(err.to_string()))?);
    }
    opts.min_read_rate = num(&cli.min_read_rate)?;
    opts.max_read_rate = num(&cli.max_read_rate)?;
    opts.max_error_rate = num(&cli.max_error_rate)?;
    opts.max_retries = cli.retry_passes;
    if let Some(t) = &cli.timeout {
        opts.timeout = Some(parse_time_interval(t).map_err(|e| env_err(e.to_string()))?);
    }
    if let Some(p) = &cli.pause {
        opts.pause = parse_time_interval(p).map_err(|e| env_err(e.to_string()))?;
    }
    if let Some(c) = &cli.cpass {
        opts.cpass = Some(parse_cpass(c)?);
    }
    opts.reverse = cli.reverse;
    opts.unidirectional = cli.unidirectional;
    opts.no_trim = cli.no_trim;
    opts.no_scrape = cli.no_scrape;
    opts.retrim = cli.retrim;
    opts.try_again = cli.try_again;
    opts.complete_only = cli.complete_only;
    opts.sparse = cli.sparse;
    opts.synchronous = cli.synchronous;
    opts.exit_on_error = cli.exit_on_error;
    opts.reopen_on_error = cli.reopen_on_error;
    opts.verify_on_error = cli.verify_on_error;
    opts.direct_in = cli.idirect;
    opts.direct_out = cli.odirect;
    Ok(opts)
}

fn run(cli: &Cli) -> Result<(), RescueError> {
    set_binary_prefixes(cli.binary_prefixes);
    check_identical(cli)?;

    let hardbs = parse_num(&cli.sector_size, 512).map_err(|e| env_err(e.to_string()))?;
    if hardbs == 0 {
        return Err(env_err("sector size must be at least 1"));
    }
    let opts = build_options(cli, hardbs)?;

    let ipos = cli
        .input_position
        .as_deref()
        .map(|s| parse_num(s, hardbs).map_err(|e| env_err(e.to_string())))
        .transpose()?
        .unwrap_or(0);
    let opos = cli
        .output_position
        .as_deref()
        .map(|s| parse_num(s, hardbs).map_err(|e| env_err(e.to_string())))
        .transpose()?
        .unwrap_or(ipos);
    let max_size = cli
        .max_size
        .as_deref()
        .map(|s| parse_num(s, hardbs).map_err(|e| env_err(e.to_string())))
        .transpose()?;
    let offset = opos as i64 - ipos as i64;

    if let Some(map) = &cli.mapfile {
        if map.exists() && !fs::metadata(map)?.is_file() {
            return Err(env_err("mapfile exists and is not a regular file"));
        }
    }

    // open input and size it
    let mut in_open = OpenOptions::new();
    in_open.read(true);
    if cli.idirect {
        in_open.custom_flags(libc::O_DIRECT);
    }
    let mut input = in_open
        .open(&cli.infile)
        .map_err(|e| env_err(format!("can't open input file: {e}")))?;
    let mut isize = input
        .seek(SeekFrom::End(0))
        .map_err(|_| env_err("input file is not seekable"))?;

    // test mode narrows what is readable
    let test_domain = cli
        .test_mode
        .as_deref()
        .map(|p| load_reference_domain(p, 0, None, cli.loose_domain))
        .transpose()?;
    if let Some(td) = &test_domain {
        if isize == 0 || isize > td.end() {
            isize = td.end();
        }
    }

    // rescue domain
    let mut domain = match &cli.domain_mapfile {
        Some(p) => load_reference_domain(p, ipos, max_size, cli.loose_domain)?,
        None => Domain::new(ipos, max_size),
    };
    if isize > 0 {
        domain.crop_end(isize);
    }
    if domain.is_empty() {
        println!("Nothing to do: empty domain.");
        return Ok(());
    }

    let map = Mapbook::open(cli.mapfile.as_deref(), domain.end().max(isize))?;

    if cli.verify_input_size {
        match map.mapfile_isize() {
            Some(recorded) if recorded == isize => {}
            Some(recorded) => {
                return Err(env_err(format!(
                    "input file size {isize} differs from size {recorded} in mapfile"
                )))
            }
            None => {
                return Err(env_err(
                    "can't verify input size: mapfile is missing or unfinished",
                ))
            }
        }
    }
    if cli.truncate && !map.blank() {
        return Err(env_err(
            "outfile truncation and mapfile input are incompatible",
        ));
    }
    if cli.complete_only && map.blank() {
        return Err(env_err(
            "nothing to complete: mapfile is missing or empty",
        ));
    }

    // sparse writes, preallocation and extension only work on regular
    // files, so those keep the check active even under --force
    let output_is_special = fs::metadata(&cli.outfile)
        .map(|md| !md.is_file())
        .unwrap_or(false);
    if output_is_special
        && (cli.extend_outfile.is_some() || !cli.force || cli.preallocate || cli.sparse)
    {
        return Err(env_err(if !cli.force {
            "output file exists and is not a regular file; \
             use --force if you really want to overwrite it"
        } else if cli.extend_outfile.is_some() {
            "only regular files can be extended"
        } else if cli.preallocate {
            "only regular files can be preallocated"
        } else {
            "only regular files can be sparse"
        }));
    }

    // open output
    let mut out_open = OpenOptions::new();
    out_open.write(true).create(true);
    if cli.truncate {
        out_open.truncate(true);
    }
    if cli.odirect {
        out_open.custom_flags(libc::O_DIRECT);
    }
    let output = out_open
        .open(&cli.outfile)
        .map_err(|e| env_err(format!("can't open output file: {e}")))?;

    if let Some(x) = &cli.extend_outfile {
        let min_size = parse_num(x, hardbs).map_err(|e| env_err(e.to_string()))?;
        if output.metadata()?.len() < min_size {
            output.set_len(min_size)?;
        }
    }
    if cli.preallocate {
        let start = (domain.pos() as i64 + offset) as libc::off_t;
        let len = domain.size() as libc::off_t;
        let ret = unsafe { libc::posix_fallocate(output.as_raw_fd(), start, len) };
        if ret != 0 {
            return Err(env_err("can't preallocate output file"));
        }
    }

    if !cli.quiet {
        println!(
            "About to copy {}Bytes from '{}' to '{}'",
            format_num(domain.in_size()),
            cli.infile.display(),
            cli.outfile.display()
        );
        println!(
            "    Starting positions: infile = {}B,  outfile = {}B",
            format_num(domain.pos()),
            format_num((domain.pos() as i64 + offset) as u64)
        );
        println!(
            "    Copy block size: {:3} sectors       Sector size: {}Bytes",
            opts.cluster,
            format_num(hardbs)
        );
        if opts.skipbs > 0 {
            println!("    Initial skip size: {} sectors", opts.skipbs / hardbs);
        } else {
            println!("    Skipping disabled");
        }
    }
    if cli.ask {
        print!("Proceed (y/N)? ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).ok();
        if !answer.trim_start().to_lowercase().starts_with('y') {
            return Err(env_err("cancelled by user"));
        }
    }

    io::set_signals()?;

    let mut book = Rescuebook::new(
        cli.infile.clone(),
        input,
        output,
        map,
        domain,
        test_domain,
        offset,
        opts,
    );
    if let Some(p) = &cli.log_rates {
        book = book.with_rate_log(
            RateLogger::create(p).map_err(|e| env_err(format!("can't open rates log: {e}")))?,
        );
    }
    if let Some(p) = &cli.log_reads {
        book = book.with_read_log(
            ReadLogger::create(p).map_err(|e| env_err(format!("can't open reads log: {e}")))?,
        );
    }

    let summary = book.do_rescue()?;
    if !cli.quiet {
        println!("Finished");
        println!(
            "     rescued: {}B,  errsize: {}B,  errors: {}",
            format_num(summary.rescued),
            format_num(summary.errsize),
            summary.errors
        );
    }
    Ok(())
}

fn main() {
    blockrescue::exit_on_panic();
    // exit status 2 is reserved for corrupt mapfiles; a bad command
    // line is an environmental problem
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    init_logging(cli.quiet, cli.verbose);

    match run(&cli) {
        Ok(()) => {}
        Err(RescueError::Interrupted(signum)) => {
            eprintln!("blockrescue: interrupted by signal {signum}");
            std::process::exit(io::signaled_exit());
        }
        Err(e) => {
            eprintln!("blockrescue: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
