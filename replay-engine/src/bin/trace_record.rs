//! Capture NVMe submit/complete tracepoints from a driver trace ring into a
//! trace file.

use std::path::PathBuf;

use clap::Parser;

use replay_engine::{
    core::EngineError,
    logger,
    trace::{RecorderOpts, TraceRecorder},
};

#[derive(Debug, Parser)]
#[command(
    name = "trace-record",
    about = "Capture NVMe I/O tracepoints to a trace file"
)]
struct Args {
    /// Trace shm name of a running process (mutually exclusive with -f).
    #[arg(short = 's', conflicts_with = "file")]
    shm_name: Option<String>,

    /// Tracepoint ring file to read (mutually exclusive with -s).
    #[arg(short = 'f')]
    file: Option<PathBuf>,

    /// Shared memory id, used with -s.
    #[arg(short = 'i')]
    shm_id: Option<i32>,

    /// Trace pid, used with -s.
    #[arg(short = 'p')]
    pid: Option<u32>,

    /// Restrict to a single logical core.
    #[arg(short = 'c')]
    lcore: Option<u32>,

    /// Output file; defaults to <name>.bin.
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Dump every record written.
    #[arg(short = 'd')]
    debug: bool,
}

fn run(args: Args) -> Result<(), EngineError> {
    let (ring_path, base) = match (&args.shm_name, &args.file) {
        (Some(name), None) => {
            if args.shm_id.is_none() && args.pid.is_none() {
                return Err(EngineError::Argument {
                    msg: "one of -i or -p must be specified with -s"
                        .to_string(),
                });
            }
            (
                pmd_rs::shm_path(name, args.shm_id, args.pid),
                name.clone(),
            )
        }
        (None, Some(file)) => {
            let base = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "trace".to_string());
            (file.clone(), base)
        }
        _ => {
            return Err(EngineError::Argument {
                msg: "one of -s and -f must be specified".to_string(),
            });
        }
    };

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.bin", base)));

    let cursor = pmd_rs::TraceCursor::open(&ring_path, args.lcore)
        .map_err(|source| EngineError::TraceRing {
            source,
        })?;
    let tsc_rate = cursor.tsc_rate();
    println!("TSC Rate: {}", tsc_rate);
    println!("Output .bin file: {}", output.display());

    let mut recorder = TraceRecorder::create(
        &output,
        RecorderOpts {
            debug_dump: args.debug,
        },
    )?;
    recorder.consume(cursor, tsc_rate)?;
    let (written, skipped) = recorder.finish()?;
    println!("Records written: {} (skipped {})", written, skipped);
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
