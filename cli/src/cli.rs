use anyhow::{anyhow, bail, Result};
use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use oxli::{BackendKind, Sketch};
use std::str::FromStr;

pub fn build_cli() -> App<'static, 'static> {
    App::new("oxli")
        .version(crate_version!())
        .author(crate_authors!())
        .about("K-mer counting, graph partitioning and read trimming on probabilistic sketches")
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::ArgRequiredElseHelp)
        .subcommand(count_command())
        .subcommand(info_command())
        .subcommand(hist_command())
        .subcommand(trim_command())
        .subcommand(partition_command())
        .subcommand(cardinality_command())
}

fn count_command() -> App<'static, 'static> {
    let mut count_command = SubCommand::with_name("count")
        .about("Count k-mers from FASTA/Q file(s) into a sketch file")
        .arg(
            Arg::with_name("INPUT")
                .help("Sequence file(s) to count")
                .multiple(true)
                .required(true),
        )
        .arg(
            Arg::with_name("bigcount")
                .short("b")
                .long("bigcount")
                .help("Track counts past 255 exactly (byte backend only)"),
        )
        .arg(
            Arg::with_name("small")
                .long("small-count")
                .conflicts_with("bigcount")
                .help("Use 4-bit counters at half the memory"),
        );
    count_command = add_output_options(count_command);
    count_command = add_sketch_options(count_command);
    add_threads_option(count_command)
}

fn info_command() -> App<'static, 'static> {
    SubCommand::with_name("info")
        .about("Display shape and occupancy of sketch file(s)")
        .arg(
            Arg::with_name("INPUT")
                .help("Sketch file(s) to inspect")
                .multiple(true)
                .required(true),
        )
}

fn hist_command() -> App<'static, 'static> {
    let hist_command = SubCommand::with_name("hist")
        .about("Histogram of k-mer abundances in a sequence file")
        .arg(
            Arg::with_name("SKETCH")
                .help("Counting sketch file")
                .required(true),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Sequence file to bin")
                .required(true),
        )
        .arg(
            Arg::with_name("squash")
                .long("no-zero")
                .help("Omit abundances with zero k-mers"),
        );
    add_output_options(hist_command)
}

fn trim_command() -> App<'static, 'static> {
    let trim_command = SubCommand::with_name("trim")
        .about("Trim reads at the first low-abundance k-mer")
        .arg(
            Arg::with_name("SKETCH")
                .help("Counting sketch file")
                .required(true),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Sequence file(s) to trim")
                .multiple(true)
                .required(true),
        )
        .arg(
            Arg::with_name("cutoff")
                .short("C")
                .long("cutoff")
                .help("Trim at the first k-mer below this abundance")
                .takes_value(true)
                .default_value("2"),
        );
    add_output_options(trim_command)
}

fn partition_command() -> App<'static, 'static> {
    let mut partition_command = SubCommand::with_name("partition")
        .about("Stream reads into connected components")
        .arg(
            Arg::with_name("INPUT")
                .help("Sequence file(s) to partition")
                .multiple(true)
                .required(true),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Also write a JSON component map alongside the table")
                .takes_value(true),
        );
    partition_command = add_output_options(partition_command);
    add_sketch_options(partition_command)
}

fn cardinality_command() -> App<'static, 'static> {
    SubCommand::with_name("cardinality")
        .about("Estimate the number of distinct k-mers per file")
        .arg(
            Arg::with_name("INPUT")
                .help("Sequence file(s) to estimate")
                .multiple(true)
                .required(true),
        )
        .arg(
            Arg::with_name("ksize")
                .short("k")
                .long("ksize")
                .help("K-mer size (1..32)")
                .takes_value(true)
                .default_value("20"),
        )
        .arg(
            Arg::with_name("error_rate")
                .short("e")
                .long("error-rate")
                .help("Relative error of the estimate")
                .takes_value(true)
                .default_value("0.01"),
        )
}

fn add_sketch_options<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("ksize")
            .short("k")
            .long("ksize")
            .help("K-mer size (1..32)")
            .takes_value(true)
            .default_value("21"),
    )
    .arg(
        Arg::with_name("n_tables")
            .short("N")
            .long("n-tables")
            .help("Number of hash tables (1..20)")
            .takes_value(true)
            .default_value("4"),
    )
    .arg(
        Arg::with_name("max_tablesize")
            .short("x")
            .long("max-tablesize")
            .help("Buckets per table")
            .takes_value(true)
            .default_value("1000000"),
    )
    .arg(
        Arg::with_name("max_memory")
            .short("M")
            .long("max-memory-usage")
            .help("Total memory budget in bytes; overrides --max-tablesize")
            .takes_value(true)
            .conflicts_with("max_tablesize"),
    )
}

fn add_output_options<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("output_file")
            .short("o")
            .long("output")
            .help("Output to this file")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("force")
            .short("f")
            .long("force")
            .help("Overwrite the output file if it exists"),
    )
}

fn add_threads_option<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("threads")
            .short("T")
            .long("threads")
            .help("Worker threads for file consumption")
            .takes_value(true)
            .default_value("1"),
    )
}

pub fn get_int_arg<T: FromStr>(matches: &ArgMatches, key: &str) -> Result<T> {
    let display_key = key.replace('_', "-");
    matches
        .value_of(key)
        .ok_or_else(|| anyhow!("Bad {}", display_key))?
        .parse::<T>()
        .map_err(|_| anyhow!("{} must be a positive integer", display_key))
}

pub fn get_float_arg(matches: &ArgMatches, key: &str, limit: f64) -> Result<f64> {
    let display_key = key.replace('_', "-");
    matches
        .value_of(key)
        .ok_or_else(|| anyhow!("Bad {}", display_key))?
        .parse::<f64>()
        .map_err(|_| anyhow!("{} must be a number", display_key))
        .and_then(|r| {
            if 0f64 <= r && r <= limit {
                return Ok(r);
            }
            bail!("{} must be between 0 and {}", display_key, limit)
        })
}

/// Build a sketch from the shared shape flags; `-M` wins over `-x`.
pub fn parse_sketch_options(matches: &ArgMatches, kind: BackendKind) -> Result<Sketch> {
    let ksize: usize = get_int_arg(matches, "ksize")?;
    let n_tables: usize = get_int_arg(matches, "n_tables")?;
    let sketch = if matches.is_present("max_memory") {
        let max_memory: u64 = get_int_arg(matches, "max_memory")?;
        Sketch::with_memory(kind, ksize, n_tables, max_memory)?
    } else {
        let max_tablesize: u64 = get_int_arg(matches, "max_tablesize")?;
        match kind {
            BackendKind::Bit => Sketch::nodetable(ksize, n_tables, max_tablesize)?,
            BackendKind::Nibble => Sketch::smallcounttable(ksize, n_tables, max_tablesize)?,
            _ => Sketch::counttable(ksize, n_tables, max_tablesize)?,
        }
    };
    Ok(sketch)
}
