// rescuemap - manipulates rescue mapfiles, shows their contents,
// combines them, and tests rescue status.

use blockrescue::block::Status;
use blockrescue::domain::Domain;
use blockrescue::mapfile::Mapbook;
use blockrescue::maptool::{self, LogicOp};
use blockrescue::units::{parse_num, set_binary_prefixes};
use blockrescue::RescueError;
use clap::{ArgGroup, Parser};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rescuemap")]
#[command(about = "Manipulates rescue mapfiles, shows their contents,\n\
combines them, and tests rescue status.")]
#[command(version)]
#[command(group = ArgGroup::new("operation").required(true).multiple(false))]
struct Cli {
    /// The mapfile to operate on
    mapfile: PathBuf,

    /// Change the block types of a mapfile: OLDTYPES,NEWTYPES
    #[arg(short = 'a', long, value_name = "OT,NT", group = "operation")]
    change_types: Option<String>,

    /// Block (sector) size in bytes
    #[arg(short = 'b', long, value_name = "BYTES", default_value = "512")]
    block_size: String,

    /// Show binary multipliers in numbers instead of SI
    #[arg(short = 'B', long)]
    binary_prefixes: bool,

    /// Create a mapfile from the list of block numbers on stdin
    #[arg(
        short = 'c',
        long,
        value_name = "TYPES",
        num_args = 0..=1,
        default_missing_value = "+-",
        group = "operation"
    )]
    create_mapfile: Option<String>,

    /// Delete the mapfile if the rescue is finished
    #[arg(short = 'd', long, group = "operation")]
    delete_if_done: bool,

    /// Return 0 if the rescue is finished
    #[arg(short = 'D', long, group = "operation")]
    done_status: bool,

    /// Overwrite an existing output file
    #[arg(short = 'f', long)]
    force: bool,

    /// Starting position of the rescue domain
    #[arg(short = 'i', long, value_name = "BYTES")]
    input_position: Option<String>,

    /// Print block numbers of the given types (?*/-+)
    #[arg(short = 'l', long, value_name = "TYPES", group = "operation")]
    list_blocks: Option<String>,

    /// Restrict the domain to the finished blocks of this mapfile
    #[arg(short = 'm', long, value_name = "FILE")]
    domain_mapfile: Option<PathBuf>,

    /// Invert block types: finished becomes bad, everything else finished
    #[arg(short = 'n', long = "invert-mapfile", group = "operation")]
    invert: bool,

    /// Starting position in the output file
    #[arg(short = 'o', long, value_name = "BYTES")]
    output_position: Option<String>,

    /// Compare block types in the domain of both files
    #[arg(short = 'p', long, value_name = "FILE", group = "operation")]
    compare_mapfile: Option<PathBuf>,

    /// Suppress all messages
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Maximum size of the rescue domain
    #[arg(short = 's', long = "size", value_name = "BYTES")]
    max_size: Option<String>,

    /// Show a summary of the mapfile contents
    #[arg(short = 't', long, group = "operation")]
    show_status: bool,

    /// Be verbose; repeat for more detail
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// XOR the finished blocks in FILE with the mapfile
    #[arg(short = 'x', long, value_name = "FILE", group = "operation")]
    xor_mapfile: Option<PathBuf>,

    /// AND the finished blocks in FILE with the mapfile
    #[arg(short = 'y', long, value_name = "FILE", group = "operation")]
    and_mapfile: Option<PathBuf>,

    /// OR the finished blocks in FILE with the mapfile
    #[arg(short = 'z', long, value_name = "FILE", group = "operation")]
    or_mapfile: Option<PathBuf>,
}

fn env_err(msg: impl Into<String>) -> RescueError {
    RescueError::env(msg)
}

fn parse_types(arg: &str, option: &str) -> Result<Vec<Status>, RescueError> {
    let types: Option<Vec<Status>> = arg.chars().map(Status::from_char).collect();
    match types {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(env_err(format!("invalid type for '{option}' option"))),
    }
}

/// `OLDTYPES,NEWTYPES`; the new list is right-padded with its final type
fn parse_change_types(arg: &str) -> Result<(Vec<Status>, Vec<Status>), RescueError> {
    let (old, new) = arg
        .split_once(',')
        .ok_or_else(|| env_err("invalid type for 'change-types' option"))?;
    let old = parse_types(old, "change-types")?;
    let mut new = parse_types(new, "change-types")?;
    while new.len() < old.len() {
        new.push(*new.last().unwrap());
    }
    Ok((old, new))
}

fn parse_create_types(arg: &str) -> Result<(Status, Status), RescueError> {
    let types = parse_types(arg, "create-mapfile")?;
    match types[..] {
        [a, b] if a != b => Ok((a, b)),
        _ => Err(env_err("invalid type for 'create-mapfile' option")),
    }
}

/// Load the mapfile and narrow the domain to its extent.
/// A missing file is environmental; an empty domain ends the run early.
fn load_book(path: &Path, domain: &Domain) -> Result<Option<(Mapbook, Domain)>, RescueError> {
    if !path.exists() {
        return Err(env_err(format!("mapfile '{}' does not exist", path.display())));
    }
    let book = Mapbook::load(path)?;
    let mut domain = domain.clone();
    domain.crop(book.extent());
    if domain.is_empty() {
        eprintln!("rescuemap: empty domain");
        return Ok(None);
    }
    Ok(Some((book, domain)))
}

fn write_result(book: &Mapbook) -> Result<(), RescueError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    book.write_to(&mut out)?;
    out.flush()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<i32, RescueError> {
    set_binary_prefixes(cli.binary_prefixes);
    let hardbs = parse_num(&cli.block_size, 512).map_err(|e| env_err(e.to_string()))?;
    if hardbs == 0 {
        return Err(env_err("block size must be at least 1"));
    }
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

    let base_domain = match &cli.domain_mapfile {
        Some(p) => Domain::from_mapfile(ipos, max_size, p)?,
        None => Domain::new(ipos, max_size),
    };

    // create works without an existing mapfile and writes to it
    if let Some(types) = &cli.create_mapfile {
        let (type1, type2) = parse_create_types(types)?;
        if cli.mapfile.exists() && !cli.force {
            return Err(env_err(format!(
                "mapfile '{}' exists; use --force to overwrite it",
                cli.mapfile.display()
            )));
        }
        if base_domain.is_empty() {
            eprintln!("rescuemap: empty domain");
            return Ok(0);
        }
        let stdin = std::io::stdin();
        let mut book =
            maptool::create_from_blocks(&base_domain, hardbs, type1, type2, stdin.lock())?;
        book.set_path(cli.mapfile.clone());
        book.save()?;
        return Ok(0);
    }

    let Some((mut book, domain)) = load_book(&cli.mapfile, &base_domain)? else {
        return Ok(0);
    };

    if let Some(arg) = &cli.change_types {
        let (old, new) = parse_change_types(arg)?;
        maptool::change_types(&mut book, &domain, &old, &new);
        write_result(&book)?;
        return Ok(0);
    }
    if cli.invert {
        maptool::invert(&mut book, &domain);
        write_result(&book)?;
        return Ok(0);
    }
    if let Some(other) = cli
        .and_mapfile
        .as_deref()
        .or(cli.or_mapfile.as_deref())
        .or(cli.xor_mapfile.as_deref())
    {
        let op = if cli.and_mapfile.is_some() {
            LogicOp::And
        } else if cli.or_mapfile.is_some() {
            LogicOp::Or
        } else {
            LogicOp::Xor
        };
        let Some((other_book, _)) = load_book(other, &base_domain)? else {
            return Ok(0);
        };
        maptool::combine(&mut book, &other_book, &domain, op);
        write_result(&book)?;
        return Ok(0);
    }
    if let Some(other) = &cli.compare_mapfile {
        let Some((other_book, other_domain)) = load_book(other, &base_domain)? else {
            return Ok(0);
        };
        if maptool::compare(&book, &other_book, &domain, &other_domain) {
            return Ok(0);
        }
        if !cli.quiet {
            eprintln!(
                "rescuemap: mapfiles '{}' and '{}' differ",
                cli.mapfile.display(),
                other.display()
            );
        }
        return Ok(1);
    }
    if let Some(types) = &cli.list_blocks {
        let types = parse_types(types, "list-blocks")?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let offset = opos as i64 - ipos as i64;
        maptool::list_blocks(&book, &domain, &types, hardbs, offset, &mut out)?;
        out.flush()?;
        return Ok(0);
    }
    if cli.done_status || cli.delete_if_done {
        if !maptool::is_done(&book, &domain) {
            if !cli.quiet {
                eprintln!("rescuemap: mapfile '{}' not done", cli.mapfile.display());
            }
            return Ok(1);
        }
        if cli.delete_if_done {
            std::fs::remove_file(&cli.mapfile)
                .map_err(|e| env_err(format!("error deleting mapfile: {e}")))?;
            if cli.verbose > 0 {
                eprintln!(
                    "rescuemap: mapfile '{}' successfully deleted",
                    cli.mapfile.display()
                );
            }
        }
        return Ok(0);
    }
    if cli.show_status {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        maptool::show_status(&book, &domain, &mut out)?;
        return Ok(0);
    }
    unreachable!("clap guarantees exactly one operation")
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
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("rescuemap: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
