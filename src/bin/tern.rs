//! Command-line front end for the tern hybrid triple store.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tern::{
    admin::{open_store, stats, verify, AdminOpenOptions, StatsReport, VerifyLevel, VerifyReport},
    codec::SortedIndexCodec,
    logging::init_logging,
    CompactionStats, HybridStore, RoutePlan, StoreOptions, Synchronous, Term, Triple,
    TriplePattern,
};

#[derive(Parser, Debug)]
#[command(
    name = "tern",
    version,
    about = "Administrative CLI for the tern hybrid triple store",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        default_value = "warn",
        env = "TERN_LOG",
        help = "Log filter directive (e.g. info, tern=debug)"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Print structured responses as JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_name = "FILE", help = "TOML file with store options")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, help = "Journal synchronous mode override")]
    synchronous: Option<SynchronousArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a store, optionally loading an N-Triples file into the first snapshot")]
    Init {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, value_name = "FILE", help = "N-Triples file for the initial snapshot")]
        load: Option<PathBuf>,
    },

    #[command(about = "Insert triples given as N-Triples lines")]
    Insert(WriteCmd),

    #[command(about = "Delete triples given as N-Triples lines")]
    Delete(WriteCmd),

    #[command(about = "Print triples matching a pattern")]
    Lookup(LookupCmd),

    #[command(about = "Run one compaction cycle")]
    Compact {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Show store counters and file sizes")]
    Stats {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Check the store for inconsistencies")]
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },
}

#[derive(Args, Debug)]
struct WriteCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(value_name = "TRIPLE", help = "N-Triples line, e.g. '<s> <p> \"o\" .'")]
    triples: Vec<String>,

    #[arg(long, value_name = "FILE", help = "Read N-Triples lines from a file")]
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LookupCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(short = 's', long, value_name = "TERM", help = "Bound subject")]
    subject: Option<String>,

    #[arg(short = 'p', long, value_name = "TERM", help = "Bound predicate")]
    predicate: Option<String>,

    #[arg(short = 'o', long, value_name = "TERM", help = "Bound object")]
    object: Option<String>,

    #[arg(long, help = "Print the routing decision instead of the matches")]
    explain: bool,

    #[arg(long, help = "Stop after this many triples")]
    limit: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for Synchronous {
    fn from(mode: SynchronousArg) -> Self {
        match mode {
            SynchronousArg::Full => Synchronous::Full,
            SynchronousArg::Normal => Synchronous::Normal,
            SynchronousArg::Off => Synchronous::Off,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let open_opts = build_open_options(&cli.open)?;

    match cli.command {
        Command::Init { dir, load } => {
            let triples = match load {
                Some(path) => read_triples(&path)?,
                None => Vec::new(),
            };
            let count = triples.len();
            let store = HybridStore::create(
                &dir,
                open_opts.codec.clone(),
                triples,
                open_opts.store.clone().background_compaction(false),
            )?;
            println!(
                "created {} at epoch {} with {} triples",
                dir.display(),
                store.epoch(),
                count
            );
            store.close()?;
        }
        Command::Insert(cmd) => {
            let store = open_store(&cmd.dir, &open_opts)?;
            let mut added = 0usize;
            for triple in collect_write_triples(&cmd)? {
                if store.insert(&triple)? {
                    added += 1;
                }
            }
            println!("inserted {added}");
            store.close()?;
        }
        Command::Delete(cmd) => {
            let store = open_store(&cmd.dir, &open_opts)?;
            let mut removed = 0usize;
            for triple in collect_write_triples(&cmd)? {
                if store.delete(&triple)? {
                    removed += 1;
                }
            }
            println!("deleted {removed}");
            store.close()?;
        }
        Command::Lookup(cmd) => {
            let store = open_store(&cmd.dir, &open_opts)?;
            let pattern = TriplePattern::new(
                parse_bound(cmd.subject.as_deref())?,
                parse_bound(cmd.predicate.as_deref())?,
                parse_bound(cmd.object.as_deref())?,
            );
            if cmd.explain {
                let plan = store.explain(&pattern)?;
                emit(cli.json, &plan, || print_plan_text(&plan))?;
            } else {
                let limit = cmd.limit.unwrap_or(usize::MAX);
                let mut printed = 0usize;
                for triple in store.lookup(&pattern)?.take(limit) {
                    println!("{}", triple?);
                    printed += 1;
                }
                eprintln!("{printed} triples");
            }
        }
        Command::Compact { dir } => {
            let store = open_store(&dir, &open_opts)?;
            let report = store.compact_now()?;
            emit(cli.json, &report, || print_compaction_text(&report))?;
            store.close()?;
        }
        Command::Stats { dir } => {
            let store = open_store(&dir, &open_opts)?;
            let report = stats(&store);
            emit(cli.json, &report, || print_stats_text(&report))?;
        }
        Command::Verify { dir, level } => {
            let store = open_store(&dir, &open_opts)?;
            let report = verify(&store, level.into())?;
            emit(cli.json, &report, || print_verify_text(&report))?;
            if !report.success {
                drop(store);
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> Result<AdminOpenOptions, Box<dyn Error>> {
    let mut store = match args.config.as_ref() {
        Some(path) => StoreOptions::from_toml_file(path)?,
        None => StoreOptions::default(),
    };
    if let Some(mode) = args.synchronous {
        store = store.synchronous(mode.into());
    }
    Ok(AdminOpenOptions {
        store,
        background: false,
        create_if_missing: false,
        codec: Arc::new(SortedIndexCodec),
    })
}

fn parse_bound(raw: Option<&str>) -> Result<Option<Term>, Box<dyn Error>> {
    Ok(raw.map(Term::parse).transpose()?)
}

fn parse_lines(text: &str, origin: &str) -> Result<Vec<Triple>, Box<dyn Error>> {
    let mut triples = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let triple = Triple::parse_line(trimmed)
            .map_err(|err| format!("{origin}:{}: {err}", number + 1))?;
        triples.push(triple);
    }
    Ok(triples)
}

fn read_triples(path: &Path) -> Result<Vec<Triple>, Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    parse_lines(&text, &path.display().to_string())
}

fn collect_write_triples(cmd: &WriteCmd) -> Result<Vec<Triple>, Box<dyn Error>> {
    let mut triples = parse_lines(&cmd.triples.join("\n"), "argument")?;
    if let Some(path) = cmd.file.as_ref() {
        triples.extend(read_triples(path)?);
    }
    if triples.is_empty() {
        return Err("no triples given".into());
    }
    Ok(triples)
}

fn emit<T, F>(json: bool, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    if json {
        let json = serde_json::to_string_pretty(value)?;
        println!("{json}");
    } else {
        printer();
    }
    Ok(())
}

fn print_plan_text(plan: &RoutePlan) {
    let slots: Vec<&str> = plan.delta_slots.iter().map(|slot| slot.label()).collect();
    println!(
        "snapshot={} delta={} slots=[{}]",
        plan.scan_snapshot,
        plan.scan_delta,
        slots.join(",")
    );
}

fn print_compaction_text(report: &CompactionStats) {
    println!(
        "Compaction installed epoch {} in {} ms: {} snapshot triples ({} folded, {} purged, {} pending deletes)",
        report.epoch,
        report.duration_ms,
        report.snapshot_triples,
        report.frozen_triples,
        report.tombstones_purged,
        report.pending_deletes
    );
    println!(
        "  remapped={} remap_failures={}",
        report.remapped, report.remap_failures
    );
}

fn print_stats_text(report: &StatsReport) {
    let store = &report.store;
    println!(
        "Store: epoch={} phase={} codec={}",
        store.epoch, store.phase, report.codec
    );
    println!(
        "  snapshot_triples={} tombstones={} logical_triples={}",
        store.snapshot_triples, store.tombstones, store.logical_triples
    );
    println!(
        "  delta a={} b={} active={} frozen={}",
        store.delta_triples.a,
        store.delta_triples.b,
        store.active.label(),
        store.frozen.map(|slot| slot.label()).unwrap_or("-")
    );
    println!();
    println!(
        "Manifest: format_version={} generations a={} b={}",
        report.manifest.format_version,
        report.manifest.delta_generations.a,
        report.manifest.delta_generations.b
    );
    println!(
        "Filesystem: snapshot={} tombstones={} delta_a={} delta_b={} path={}",
        report.filesystem.snapshot_bytes,
        report.filesystem.tombstone_bytes,
        report.filesystem.delta_bytes.a,
        report.filesystem.delta_bytes.b,
        report.filesystem.path
    );
    if let Some(last) = &report.last_compaction {
        println!();
        print_compaction_text(last);
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} scanned={} logical={} tombstones={} delta={}",
        report.level,
        report.success,
        report.counts.scanned,
        report.counts.logical,
        report.counts.tombstones,
        report.counts.delta,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
