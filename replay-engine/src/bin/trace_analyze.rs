//! Reduce a recorded trace file to aggregate statistics: IOPS, latency,
//! read/write mix, request sizes and optional spatial-locality histograms.

use std::path::PathBuf;

use clap::Parser;

use replay_engine::{
    core::{attach_first_namespace, EngineError},
    logger,
    trace::{format_event, AnalyzerOpts, TraceAnalyzer, TraceReader},
};

#[derive(Debug, Parser)]
#[command(
    name = "trace-analyze",
    about = "Summarize a recorded NVMe I/O trace file"
)]
struct Args {
    /// Trace file produced by trace-record.
    #[arg(short = 'f')]
    file: PathBuf,

    /// Print every event.
    #[arg(short = 'd')]
    per_event: bool,

    /// Include the raw timestamp with every event (needs -d).
    #[arg(short = 't')]
    with_tsc: bool,

    /// Per-LBA read/write histogram.
    #[arg(short = 'b')]
    lba_hist: bool,

    /// Per-zone read/write histogram.
    #[arg(short = 'z')]
    zone_hist: bool,

    /// Emulated device URIs; a zoned one supplies the zone size.
    #[arg(short = 'D')]
    devices: Vec<String>,

    /// Zone size in sectors, when no zoned device is attached.
    #[arg(long = "zone-size")]
    zone_size: Option<u64>,
}

/// Underline a report heading with the given marker.
fn print_uline(marker: char, len: usize) {
    println!("{}", marker.to_string().repeat(len));
}

fn resolve_zone_size(args: &Args) -> Result<Option<u64>, EngineError> {
    if let Some(size) = args.zone_size {
        return Ok(Some(size));
    }
    if !args.zone_hist {
        return Ok(None);
    }
    if args.devices.is_empty() {
        return Err(EngineError::Argument {
            msg: "-z needs --zone-size or a zoned device via -D".to_string(),
        });
    }
    let (_ctrlr, ns) = attach_first_namespace(&args.devices)?;
    if !ns.is_zoned() {
        return Err(EngineError::Argument {
            msg: "-z needs a zoned namespace".to_string(),
        });
    }
    Ok(Some(ns.zone_size_sectors()))
}

fn run(args: Args) -> Result<(), EngineError> {
    if args.with_tsc && !args.per_event {
        return Err(EngineError::Argument {
            msg: "-t must be used with -d".to_string(),
        });
    }

    let zone_size = resolve_zone_size(&args)?;

    if args.per_event {
        for rec in TraceReader::open(&args.file)? {
            println!("{}", format_event(&rec?, args.with_tsc));
        }
    }

    let analyzer = TraceAnalyzer::new(AnalyzerOpts {
        lba_hist: args.lba_hist,
        zone_hist: args.zone_hist,
        zone_size,
    })?;
    let analysis = analyzer.analyze(&args.file)?;

    println!("\nTrace Analysis");
    print_uline('=', 64);

    println!("{:<20}:  {:.3}", "IOPS", analysis.iops());
    println!(
        "{:<20}:  MIN   {:<20.3} MAX   {:<20.3} AVG {:<20.3}",
        "Latency (us)",
        analysis.latency_min_us(),
        analysis.latency_max_us(),
        analysis.latency_avg_us()
    );
    println!(
        "{:<20}:  READ  {:<20} WRITE {:<20} R/W {:6.3} %",
        "Number of R/W",
        analysis.reads,
        analysis.writes,
        analysis.rw_ratio()
    );
    println!(
        "{:<20}:  SUBMIT {:<19} COMPLETE {:<16} NO LATENCY {}",
        "Events", analysis.submits, analysis.completes, analysis.no_latency
    );

    if !analysis.size_hist.is_empty() {
        println!("{:<20}:", "R/W Request size");
        for (blocks, (reads, writes)) in &analysis.size_hist {
            println!(
                "{:>6} blocks  r {:<8} w {:<8}",
                blocks, reads, writes
            );
        }
    }

    if args.lba_hist && !analysis.lba_hist.is_empty() {
        println!("\nLBA Access Histogram");
        print_uline('=', 64);
        for (lba, (reads, writes)) in &analysis.lba_hist {
            println!(
                "LBA {:#010x}  r {:<8} w {:<8}",
                lba, reads, writes
            );
        }
    }

    if args.zone_hist && !analysis.zone_hist.is_empty() {
        let zone_size = zone_size.unwrap_or(1);
        println!("\nZone Access Histogram");
        print_uline('=', 64);
        for (zone, (reads, writes)) in &analysis.zone_hist {
            println!(
                "ZSLBA {:#010x}  r {:<8} w {:<8}",
                zone * zone_size,
                reads,
                writes
            );
        }
    }

    Ok(())
}

fn main() {
    logger::init("INFO");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
