//! Binary entry point for the colstore administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colstore::admin::{
    compact, dump, stats, verify, AdminError, AdminOpenOptions, CompactReport, DumpReport, StatsReport,
    VerifyLevel, VerifyReport,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "colstore",
    version,
    about = "Administrative CLI for colstore database files",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        env = "COLSTORE_MAX_NODE_SIZE",
        help = "Fan-out used for trees rebuilt by compact"
    )]
    max_node_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Verify on-disk structures")]
    Verify {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Fast,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },

    #[command(about = "Show file, allocator and per-column statistics")]
    Stats {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Print the contents of every table")]
    Dump {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_name = "INDEX", help = "Dump only this table")]
        table: Option<usize>,

        #[arg(long, default_value_t = 20, help = "Rows printed per table")]
        max_rows: usize,
    },

    #[command(about = "Rewrite the database into a new file holding only live nodes")]
    Compact {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_name = "PATH", help = "Destination file (must not exist)")]
        into: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
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
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        let code = err.downcast_ref::<AdminError>().map_or(1, AdminError::exit_code);
        std::process::exit(code);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_open_options(args: &OpenArgs) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::inspect();
    if let Some(max) = args.max_node_size {
        opts.db = opts.db.max_node_size(max);
    }
    opts
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli.open);

    match cli.command {
        Command::Verify { db_path, level } => {
            let report = verify(&db_path, level.into())?;
            emit(&cli.format, &report, |fmt| print_verify_text(fmt, &report))?;
            report.ensure_success()?;
        }
        Command::Stats { db_path } => {
            let report = stats(&db_path, &open_opts)?;
            emit(&cli.format, &report, |fmt| print_stats_text(fmt, &report))?;
        }
        Command::Dump {
            db_path,
            table,
            max_rows,
        } => {
            let report = dump(&db_path, &open_opts, table, max_rows)?;
            emit(&cli.format, &report, |fmt| print_dump_text(fmt, &report))?;
        }
        Command::Compact { db_path, into } => {
            let report = compact(&db_path, &into, &open_opts)?;
            emit(&cli.format, &report, |fmt| print_compact_text(fmt, &report))?;
        }
    }
    Ok(())
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_verify_text(_: OutputFormat, report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} file_bytes={} nodes={} node_bytes={} tables={} columns={} rows={}",
        report.level,
        report.success,
        report.counts.file_bytes,
        report.counts.nodes,
        report.counts.node_bytes,
        report.counts.tables,
        report.counts.columns,
        report.counts.rows,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_stats_text(_: OutputFormat, report: &StatsReport) {
    println!("File:");
    println!(
        "  path={} size_bytes={} version={} top_ref={}",
        report.file.path, report.file.size_bytes, report.file.version, report.file.top_ref
    );
    println!("Allocator:");
    println!(
        "  baseline={} slabs={} slab_bytes={} free_chunks={} free_bytes={} live_bytes={}",
        report.alloc.baseline,
        report.alloc.slabs,
        report.alloc.slab_bytes,
        report.alloc.free_chunks,
        report.alloc.free_bytes,
        report.alloc.live_bytes
    );
    for table in &report.tables {
        println!("Table {} ({} rows):", table.index, table.rows);
        for col in &table.columns {
            println!(
                "  [{}] {} indexed={} unique={} depth={} leaves={} inner_nodes={}",
                col.index,
                col.kind,
                col.indexed,
                col.unique,
                col.depth,
                col.leaves,
                col.inner_nodes
            );
        }
    }
}

fn print_dump_text(_: OutputFormat, report: &DumpReport) {
    println!("Version {}", report.version);
    for table in &report.tables {
        println!(
            "Table {} ({} rows): {}",
            table.index,
            table.rows,
            table.columns.join(", ")
        );
        for (row, cells) in table.values.iter().enumerate() {
            let rendered: Vec<String> = cells.iter().map(|v| v.to_string()).collect();
            println!("  {row}: {}", rendered.join(" | "));
        }
        if table.values.len() < table.rows {
            println!("  ... {} more", table.rows - table.values.len());
        }
    }
}

fn print_compact_text(_: OutputFormat, report: &CompactReport) {
    println!(
        "Compacted {} -> {} (version {}): {} -> {} bytes",
        report.source,
        report.destination,
        report.version,
        report.bytes_before,
        report.bytes_after
    );
}
