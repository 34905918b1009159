//! End-to-end: drive a crafted workload through the dispatcher with driver
//! tracing enabled, record the ring into a trace file, analyze it, then
//! replay the file against fresh namespaces and check the resulting zone
//! state.

use std::{cell::RefCell, rc::Rc};

use pmd_rs::{NvmeOpc, QueuePairOpts, TraceCursor, TraceRing, ZoneState};
use replay_engine::{
    core::{ReplayDispatcher, ReplayOpts},
    trace::{
        AnalyzerOpts,
        RecorderOpts,
        TraceAnalyzer,
        TraceReader,
        TraceRecorder,
        TRACE_RECORD_SIZE,
    },
};

pub mod common;
use common::{attach, submit, zns_bus, zone_mgmt};

const ZONE_SIZE: u64 = 0x100;
const ZONE_CAP: u64 = 0x100;
const ZONES_USED: u64 = 16;

/// The recorded workload: 198 appends into zones 0..16, 102 reads from the
/// same zones, then 6 opens, 4 closes and 2 finishes. Returns the records
/// and the per-zone block counts written.
fn scenario_stream(
) -> (Vec<replay_engine::trace::TraceRecord>, Vec<u64>) {
    const SIZES: [u32; 6] = [1, 2, 4, 8, 16, 32];

    let mut recs = Vec::new();
    let mut fill = vec![0u64; ZONES_USED as usize];
    let mut seq = 0u64;

    let mut appended = 0;
    let mut zone = 0usize;
    while appended < 198 {
        let nlb = SIZES[appended % SIZES.len()];
        // Round-robin over the zones, skipping any that cannot take the
        // append without crossing its capacity.
        let mut probe = 0;
        while fill[zone] + u64::from(nlb) > ZONE_CAP {
            zone = (zone + 1) % ZONES_USED as usize;
            probe += 1;
            assert!(probe <= ZONES_USED, "workload does not fit");
        }
        recs.push(submit(
            seq,
            NvmeOpc::ZoneAppend,
            zone as u64 * ZONE_SIZE,
            nlb,
        ));
        fill[zone] += u64::from(nlb);
        zone = (zone + 1) % ZONES_USED as usize;
        seq += 1;
        appended += 1;
    }

    for i in 0 .. 102u64 {
        let slba = (i % ZONES_USED) * ZONE_SIZE + (i % 8);
        recs.push(submit(seq, NvmeOpc::Read, slba, 4));
        seq += 1;
    }

    for z in 0 .. 6u64 {
        recs.push(zone_mgmt(seq, 0x3, z * ZONE_SIZE, false)); // Open
        seq += 1;
    }
    for z in 0 .. 4u64 {
        recs.push(zone_mgmt(seq, 0x1, z * ZONE_SIZE, false)); // Close
        seq += 1;
    }
    for z in 4 .. 6u64 {
        recs.push(zone_mgmt(seq, 0x2, z * ZONE_SIZE, false)); // Finish
        seq += 1;
    }

    (recs, fill)
}

#[test]
fn record_analyze_replay_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("ring");
    let trace_path = dir.path().join("trace.bin");

    let (stream, fill) = scenario_stream();
    let total_cmds = stream.len() as u64;
    assert_eq!(total_cmds, 198 + 102 + 12);

    // Run the workload with tracing enabled.
    {
        let (ctrlr, ns) = attach(&zns_bus(32, ZONE_SIZE, ZONE_CAP, 0));
        let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();
        let ring = TraceRing::create(&ring_path).unwrap();
        qp.enable_tracing(Rc::new(RefCell::new(ring)));

        let dispatcher =
            ReplayDispatcher::new(ns, qp, ReplayOpts::default());
        let outcome =
            dispatcher.replay(stream.into_iter().map(Ok)).unwrap();
        assert_eq!(outcome.stats.replayed, total_cmds);
        assert_eq!(outcome.stats.errors, 0);
        assert_eq!(outcome.stats.skipped, 0);
    }

    // Record the ring into a trace file. Every replayed command plus the
    // initial reset-all shows up as one submit and one complete; the queue
    // pair create/destroy tracepoints are filtered.
    let cursor = TraceCursor::open(&ring_path, None).unwrap();
    let tsc_rate = cursor.tsc_rate();
    let mut recorder =
        TraceRecorder::create(&trace_path, RecorderOpts::default()).unwrap();
    recorder.consume(cursor, tsc_rate).unwrap();
    let (written, skipped) = recorder.finish().unwrap();
    assert_eq!(written, (total_cmds + 1) * 2);
    assert_eq!(skipped, 2);
    assert_eq!(
        std::fs::metadata(&trace_path).unwrap().len(),
        written * TRACE_RECORD_SIZE as u64
    );

    // First record is the epoch.
    let first = TraceReader::open(&trace_path)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(first.tsc_timestamp, 0);

    // Reading and rewriting the records must reproduce the file
    // byte-for-byte.
    let copy_path = dir.path().join("copy.bin");
    {
        use std::io::Write;
        let mut out = std::fs::File::create(&copy_path).unwrap();
        for rec in TraceReader::open(&trace_path).unwrap() {
            out.write_all(&rec.unwrap().to_bytes()).unwrap();
        }
    }
    assert_eq!(
        std::fs::read(&trace_path).unwrap(),
        std::fs::read(&copy_path).unwrap()
    );

    // Analyze: R/W mix and zone locality.
    let analysis = TraceAnalyzer::new(AnalyzerOpts {
        lba_hist: false,
        zone_hist: true,
        zone_size: Some(ZONE_SIZE),
    })
    .unwrap()
    .analyze(&trace_path)
    .unwrap();
    assert_eq!(analysis.reads, 102);
    assert_eq!(analysis.writes, 198);
    assert!((analysis.rw_ratio() - 34.0).abs() < 0.01);
    assert_eq!(analysis.submits, (total_cmds + 1));
    assert_eq!(analysis.completes, (total_cmds + 1));
    assert!(analysis
        .zone_hist
        .keys()
        .all(|zone| *zone < ZONES_USED));

    // Replay the recorded file twice against fresh namespaces; both runs
    // must agree on the final zone state.
    let mut snapshots = Vec::new();
    for _ in 0 .. 2 {
        let (ctrlr, ns) = attach(&zns_bus(32, ZONE_SIZE, ZONE_CAP, 0));
        let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();
        let dispatcher = ReplayDispatcher::new(
            ns,
            qp,
            ReplayOpts {
                queue_depth: Some(16),
                zone_report: Some(0),
            },
        );
        let reader = TraceReader::open(&trace_path).unwrap();
        let outcome = dispatcher.replay(reader).unwrap();

        assert!(outcome.stats.max_outstanding <= 16);
        assert_eq!(outcome.stats.errors, 0);

        let zones = outcome.zones.clone().unwrap();
        // Opens 0..6, closes 0..4, finishes 4..6.
        for z in 0 .. 4 {
            assert_eq!(zones[z].state, ZoneState::Closed, "zone {}", z);
        }
        for z in 4 .. 6 {
            assert_eq!(zones[z].state, ZoneState::Full, "zone {}", z);
            assert_eq!(zones[z].wp, zones[z].zslba + ZONE_CAP);
        }
        // Every touched zone's write pointer matches the blocks appended
        // to it (unless a finish moved it to capacity).
        for (z, blocks) in fill.iter().enumerate().filter(|(z, _)| {
            *z < ZONES_USED as usize && !(4 .. 6).contains(z)
        }) {
            assert_eq!(
                zones[z].wp,
                zones[z].zslba + blocks,
                "zone {}",
                z
            );
        }

        // The device-side report agrees with the host model.
        let report = outcome.zone_report.unwrap();
        for (model, device) in zones.iter().zip(report.iter()) {
            assert_eq!(model.wp, device.wp);
            assert_eq!(model.state, device.state);
        }

        snapshots.push(zones);
    }
    assert_eq!(snapshots[0], snapshots[1]);
}
