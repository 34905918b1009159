//! Replay a recorded trace file against a namespace, preserving command
//! order and queue-depth backpressure.

use std::{path::PathBuf, rc::Rc};

use clap::Parser;

use replay_engine::{
    core::{
        attach_first_namespace,
        EngineError,
        ReplayDispatcher,
        ReplayOpts,
    },
    logger,
    trace::TraceReader,
};

#[derive(Debug, Parser)]
#[command(
    name = "trace-replay",
    about = "Replay a recorded NVMe I/O trace against a namespace"
)]
struct Args {
    /// Trace file produced by trace-record.
    #[arg(short = 'f')]
    file: PathBuf,

    /// Report the first N zones after the replay (0 = all zones).
    #[arg(short = 'z')]
    zone_report: Option<u64>,

    /// Queue depth; defaults to the queue pair's size.
    #[arg(short = 'q')]
    queue_depth: Option<u32>,

    /// Enable driver tracing for the given tracepoint group.
    #[arg(short = 'e')]
    tpoint_group: Option<String>,

    /// Emulated device URIs.
    #[arg(short = 'D')]
    devices: Vec<String>,
}

fn run(args: Args) -> Result<(), EngineError> {
    if let Some(depth) = args.queue_depth {
        if depth == 0 {
            return Err(EngineError::Argument {
                msg: "queue depth must be at least 1".to_string(),
            });
        }
    }

    let (controller, ns) = attach_first_namespace(&args.devices)?;
    let qp = controller
        .alloc_io_qpair(pmd_rs::Controller::default_io_qpair_opts())
        .map_err(|source| EngineError::Driver {
            source,
        })?;

    if let Some(group) = &args.tpoint_group {
        pmd_rs::validate_tpoint_group(group).map_err(|_| {
            EngineError::Argument {
                msg: format!("invalid tpoint group name {}", group),
            }
        })?;
        let path = pmd_rs::shm_path("trace_replay", None, None);
        let ring = pmd_rs::TraceRing::create(&path)
            .map_err(|source| EngineError::Driver {
                source,
            })?;
        println!("Tracepoint ring: {}", path.display());
        qp.enable_tracing(Rc::new(std::cell::RefCell::new(ring)));
    }

    let dispatcher = ReplayDispatcher::new(
        ns,
        qp,
        ReplayOpts {
            queue_depth: args.queue_depth,
            zone_report: args.zone_report,
        },
    );
    println!("Queue depth is {}.", dispatcher.queue_depth());
    dispatcher.identify();

    let reader = TraceReader::open(&args.file)?;
    let outcome = dispatcher.replay(reader)?;

    let stats = outcome.stats;
    let ms = stats.duration_ticks as f64 * 1000.0
        / stats.tsc_rate.max(1) as f64;
    println!("\nWorkload Replay Information");
    println!("{:<16}: {:>15}", "Requests number", stats.replayed);
    println!("{:<16}: {:>15}", "Records skipped", stats.skipped);
    println!("{:<16}: {:>15}", "Device errors", stats.errors);
    println!("{:<16}: {:>15.3} (ms)", "Total time", ms);

    if let Some(report) = outcome.zone_report {
        println!("\nNVMe ZNS Zone Report ({} zones)", report.len());
        for desc in report {
            println!(
                "ZSLBA: {:#018x} ZCAP: {:#018x} WP: {:#018x} ZS: {:<14} \
                 ZT: {}",
                desc.zslba, desc.zcap, desc.wp, desc.state, desc.zt
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
