use std::fs::File;
use std::io::{stdout, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;

use crate::cli::{get_float_arg, get_int_arg, parse_sketch_options};
use oxli::errors::OxliError;
use oxli::parser::{BrokenPairedReader, ReadParser, Record};
use oxli::{
    BackendKind, Graph, HllCounter, Sketch, StreamingPartitioner, DEFAULT_BLOCKSIZE,
    MAX_FALSE_POSITIVE_RATE,
};

mod cli;

fn output_to<F>(output_fn: F, output: Option<&str>, force: bool) -> Result<()>
where
    F: Fn(&mut dyn Write) -> Result<()>,
{
    match output {
        None => {
            let mut out = stdout();
            output_fn(&mut out)?;
        }
        Some(o) => {
            check_overwrite(o, force)?;
            let file =
                File::create(o).context(format!("unable to create '{}'", o))?;
            let mut out = BufWriter::new(file);
            output_fn(&mut out)?;
        }
    };
    Ok(())
}

fn check_overwrite(path: &str, force: bool) -> Result<()> {
    if !force && Path::new(path).exists() {
        bail!("output file '{}' already exists; use --force to overwrite", path);
    }
    Ok(())
}

fn write_record(writer: &mut dyn Write, record: &Record, trim_at: usize) -> Result<()> {
    let seq = &record.sequence[..trim_at];
    match &record.quality {
        Some(quality) => {
            writer.write_all(b"@")?;
            writer.write_all(&record.name)?;
            writer.write_all(b"\n")?;
            writer.write_all(seq)?;
            writer.write_all(b"\n+\n")?;
            writer.write_all(&quality[..trim_at])?;
            writer.write_all(b"\n")?;
        }
        None => {
            writer.write_all(b">")?;
            writer.write_all(&record.name)?;
            writer.write_all(b"\n")?;
            writer.write_all(seq)?;
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let matches = cli::build_cli().get_matches();

    match matches.subcommand() {
        ("count", Some(matches)) => count(matches),
        ("info", Some(matches)) => info(matches),
        ("hist", Some(matches)) => hist(matches),
        ("trim", Some(matches)) => trim(matches),
        ("partition", Some(matches)) => partition(matches),
        ("cardinality", Some(matches)) => cardinality(matches),
        other => bail!("Unknown subcommand: {:?}", other.0),
    }
}

fn count(matches: &ArgMatches) -> Result<()> {
    let kind = if matches.is_present("small") {
        BackendKind::Nibble
    } else {
        BackendKind::Byte
    };
    let mut sketch = parse_sketch_options(matches, kind)?;
    if matches.is_present("bigcount") {
        sketch.set_use_bigcount(true)?;
    }
    let threads: usize = get_int_arg(matches, "threads")?;

    let filenames: Vec<_> = matches
        .values_of("INPUT")
        .ok_or_else(|| anyhow!("Bad INPUT"))?
        .collect();
    for filename in &filenames {
        let (n_reads, n_kmers) = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?;
            pool.install(|| sketch.consume_seqfile_parallel(filename, DEFAULT_BLOCKSIZE))?
        } else {
            sketch.consume_seqfile(filename)?
        };
        eprintln!("{}: {} reads, {} k-mers", filename, n_reads, n_kmers);
    }

    let rate = sketch.expected_collisions();
    if rate > MAX_FALSE_POSITIVE_RATE {
        return Err(OxliError::Saturation(rate).into());
    }
    if rate > 0.15 {
        eprintln!(
            "WARNING: the counts are probably unreliable (collision rate {:.3}); \
             increase the table size",
            rate
        );
    }

    let default_output = format!("{}.ct", filenames[0]);
    let output = matches.value_of("output_file").unwrap_or(&default_output);
    check_overwrite(output, matches.is_present("force"))?;
    sketch.save(output)?;
    eprintln!("saved sketch to {}", output);
    Ok(())
}

fn info(matches: &ArgMatches) -> Result<()> {
    for filename in matches.values_of("INPUT").ok_or_else(|| anyhow!("Bad INPUT"))? {
        let sketch = Sketch::load(filename)?;
        println!("{}", filename);
        println!("  k-mer size: {}", sketch.ksize());
        println!("  backend: {:?}", sketch.backend());
        println!("  number of tables: {}", sketch.n_tables());
        println!(
            "  table sizes: {}",
            sketch
                .table_sizes()
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("  occupied buckets: {}", sketch.n_occupied());
        println!("  expected collision rate: {:.6}", sketch.expected_collisions());
        println!("  bigcount: {}", sketch.use_bigcount());
    }
    Ok(())
}

fn hist(matches: &ArgMatches) -> Result<()> {
    let sketch = Sketch::load(matches.value_of("SKETCH").unwrap())?;
    let input = matches.value_of("INPUT").unwrap();
    let tracking = Sketch::new(BackendKind::Bit, sketch.ksize(), sketch.table_sizes())?;
    let dist = sketch.abundance_distribution(input, &tracking)?;

    let total: u64 = dist.iter().sum();
    let squash = matches.is_present("squash");
    output_to(
        |writer| {
            writeln!(writer, "abundance\tcount\tcumulative\tcumulative_fraction")?;
            let mut cumulative = 0u64;
            for (abundance, &count) in dist.iter().enumerate() {
                if squash && count == 0 {
                    continue;
                }
                cumulative += count;
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{:.3}",
                    abundance,
                    count,
                    cumulative,
                    cumulative as f64 / total.max(1) as f64
                )?;
                if cumulative == total {
                    break;
                }
            }
            Ok(())
        },
        matches.value_of("output_file"),
        matches.is_present("force"),
    )
}

fn trim(matches: &ArgMatches) -> Result<()> {
    let sketch = Sketch::load(matches.value_of("SKETCH").unwrap())?;
    sketch.check_fp_rate(MAX_FALSE_POSITIVE_RATE)?;
    let cutoff: u64 = get_int_arg(matches, "cutoff")?;
    let ksize = sketch.ksize();
    let filenames: Vec<_> = matches
        .values_of("INPUT")
        .ok_or_else(|| anyhow!("Bad INPUT"))?
        .collect();

    output_to(
        |writer| {
            let mut n_kept = 0u64;
            let mut n_dropped = 0u64;
            for filename in &filenames {
                let parser = ReadParser::from_path(filename)?;
                while let Some(mut record) = parser.next_record()? {
                    record.clean_sequence();
                    let (_, trim_at) = sketch.trim_on_abundance(&record.sequence, cutoff);
                    if trim_at < ksize {
                        n_dropped += 1;
                        continue;
                    }
                    write_record(writer, &record, trim_at)?;
                    n_kept += 1;
                }
            }
            eprintln!("kept {} reads, dropped {}", n_kept, n_dropped);
            Ok(())
        },
        matches.value_of("output_file"),
        matches.is_present("force"),
    )
}

fn partition(matches: &ArgMatches) -> Result<()> {
    let graph = Graph::new(parse_sketch_options(matches, BackendKind::Bit)?);
    let partitioner = StreamingPartitioner::new(&graph);
    let filenames: Vec<_> = matches
        .values_of("INPUT")
        .ok_or_else(|| anyhow!("Bad INPUT"))?
        .collect();

    for filename in &filenames {
        let parser = ReadParser::from_path(filename)?;
        for chunk in BrokenPairedReader::new(parser) {
            let mut chunk = chunk?;
            chunk.first.clean_sequence();
            match chunk.second.as_mut() {
                Some(second) => {
                    second.clean_sequence();
                    partitioner.consume_pair(&chunk.first.sequence, &second.sequence)?;
                }
                None => {
                    partitioner.consume(&chunk.first.sequence)?;
                }
            }
        }
    }
    eprintln!("{} components", partitioner.n_components());

    if let Some(json_path) = matches.value_of("json") {
        check_overwrite(json_path, matches.is_present("force"))?;
        partitioner.save_json(json_path, filenames[0])?;
    }
    output_to(
        |writer| {
            for (id, tags) in partitioner.components() {
                let joined = tags
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                writeln!(writer, "{}\t{}\t{}", id, tags.len(), joined)?;
            }
            Ok(())
        },
        matches.value_of("output_file"),
        matches.is_present("force"),
    )
}

fn cardinality(matches: &ArgMatches) -> Result<()> {
    let ksize: usize = get_int_arg(matches, "ksize")?;
    let error_rate = get_float_arg(matches, "error_rate", 1f64)?;
    for filename in matches.values_of("INPUT").ok_or_else(|| anyhow!("Bad INPUT"))? {
        let mut hll = HllCounter::new(error_rate, ksize)?;
        hll.consume_seqfile(filename)?;
        println!("{}\t{}", filename, hll.estimate_cardinality());
    }
    Ok(())
}

/// 1 for recoverable input/configuration problems, 2 for anything that
/// points at corrupt state or an internal failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OxliError>() {
        Some(OxliError::Config(_))
        | Some(OxliError::Value(_))
        | Some(OxliError::Io(_))
        | Some(OxliError::Needletail(_))
        | Some(OxliError::Saturation(_))
        | Some(OxliError::BadLength { .. })
        | Some(OxliError::BadAlphabet(_)) => 1,
        Some(_) => 2,
        None => 1,
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(exit_code(&err));
    }
}
