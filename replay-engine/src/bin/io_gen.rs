//! Generate a synthetic workload and drive it through the replay engine.

use std::rc::Rc;

use clap::Parser;

use replay_engine::{
    core::{
        attach_first_namespace,
        EngineError,
        ReplayDispatcher,
        ReplayOpts,
    },
    logger,
    workload::{generate, Pattern, WorkloadOpts},
};

#[derive(Debug, Parser)]
#[command(
    name = "io-gen",
    about = "Generate a synthetic workload and dispatch it to a namespace"
)]
struct Args {
    /// Workload pattern: seq or rand.
    #[arg(short = 'w')]
    workload: Pattern,

    /// Blocks per command (power of two).
    #[arg(short = 'b', default_value_t = 8)]
    blocks: u32,

    /// Fraction of reads for the random pattern, 0..1.
    #[arg(short = 'm', default_value_t = 0.0)]
    read_ratio: f64,

    /// Commands to generate in the random pattern.
    #[arg(short = 'n', default_value_t = 1000)]
    count: u64,

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
        let path = pmd_rs::shm_path("io_gen", None, None);
        let ring = pmd_rs::TraceRing::create(&path).map_err(|source| {
            EngineError::Driver {
                source,
            }
        })?;
        println!("Tracepoint ring: {}", path.display());
        qp.enable_tracing(Rc::new(std::cell::RefCell::new(ring)));
    }

    let records = generate(
        &ns,
        &WorkloadOpts {
            pattern: args.workload,
            blocks: args.blocks,
            read_ratio: args.read_ratio,
            count: args.count,
        },
    )?;
    println!("Generated {} commands.", records.len());

    let dispatcher = ReplayDispatcher::new(
        ns,
        qp,
        ReplayOpts {
            queue_depth: args.queue_depth,
            zone_report: None,
        },
    );
    dispatcher.identify();

    let outcome = dispatcher.replay(records.into_iter().map(Ok))?;
    let stats = outcome.stats;
    let ms = stats.duration_ticks as f64 * 1000.0
        / stats.tsc_rate.max(1) as f64;
    println!("{:<16}: {:>15}", "Requests number", stats.replayed);
    println!("{:<16}: {:>15}", "Device errors", stats.errors);
    println!("{:<16}: {:>15.3} (ms)", "Total time", ms);
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
