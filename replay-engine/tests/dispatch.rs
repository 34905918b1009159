//! Dispatcher behavior around device errors, malformed records, write
//! coercion and device loss.

use pmd_rs::{NvmeOpc, QueuePairOpts, ZoneState};
use replay_engine::{
    core::{EngineError, ReplayDispatcher, ReplayOpts},
    trace::TraceReader,
    workload::{generate, Pattern, WorkloadOpts},
};

pub mod common;
use common::{attach, nvm_bus, submit, zns_bus, zone_mgmt};

#[test]
fn device_error_is_logged_and_replay_continues() {
    // Zone capacity of 8 blocks; the second append to zone 0 must fail
    // with Zone Is Full while the rest of the stream still runs.
    let (ctrlr, ns) = attach(&zns_bus(4, 0x10, 0x8, 0));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();

    let stream = vec![
        submit(0, NvmeOpc::ZoneAppend, 0x00, 8),
        submit(1, NvmeOpc::ZoneAppend, 0x00, 1),
        submit(2, NvmeOpc::ZoneAppend, 0x10, 1),
        submit(3, NvmeOpc::ZoneAppend, 0x10, 1),
        submit(4, NvmeOpc::ZoneAppend, 0x10, 1),
    ];

    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let outcome = dispatcher.replay(stream.into_iter().map(Ok)).unwrap();

    assert_eq!(outcome.stats.replayed, 5);
    assert_eq!(outcome.stats.errors, 1);

    let zones = outcome.zones.unwrap();
    assert_eq!(zones[0].state, ZoneState::Full);
    assert_eq!(zones[1].wp, zones[1].zslba + 3);
}

#[test]
fn malformed_records_are_skipped_and_counted() {
    let (ctrlr, ns) = attach(&zns_bus(4, 0x100, 0x100, 0));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();

    let stream = vec![
        // Unknown opcode.
        replay_engine::trace::TraceRecord {
            opc: 0x42,
            ..submit(0, NvmeOpc::Read, 0, 1)
        },
        // LBA beyond the namespace.
        submit(1, NvmeOpc::Read, 0x100_0000, 1),
        // Append larger than the max zone append size (64 blocks).
        submit(2, NvmeOpc::ZoneAppend, 0, 0x50),
        // Unknown zone send action.
        zone_mgmt(3, 0x7f, 0, false),
        // A command that actually runs.
        submit(4, NvmeOpc::ZoneAppend, 0, 4),
    ];

    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let outcome = dispatcher.replay(stream.into_iter().map(Ok)).unwrap();

    assert_eq!(outcome.stats.replayed, 1);
    assert_eq!(outcome.stats.skipped, 4);
    assert_eq!(outcome.stats.errors, 0);
    assert_eq!(outcome.zones.unwrap()[0].wp, 4);
}

#[test]
fn recorded_writes_are_coerced_to_appends_on_zns() {
    let (ctrlr, ns) = attach(&zns_bus(4, 0x100, 0x100, 0));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();

    // A conventional write in the middle of zone 1; on a zoned namespace
    // it must land at the zone's write pointer instead.
    let stream = vec![
        submit(0, NvmeOpc::Write, 0x105, 4),
        submit(1, NvmeOpc::Write, 0x105, 4),
    ];

    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let outcome = dispatcher.replay(stream.into_iter().map(Ok)).unwrap();

    assert_eq!(outcome.stats.errors, 0);
    let zones = outcome.zones.unwrap();
    assert_eq!(zones[1].state, ZoneState::ImplicitOpen);
    assert_eq!(zones[1].wp, zones[1].zslba + 8);
}

#[test]
fn conventional_namespace_replays_in_place() {
    let (ctrlr, ns) = attach(&nvm_bus(0x1000));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();

    let stream = vec![
        submit(0, NvmeOpc::Write, 0x10, 8),
        submit(1, NvmeOpc::Read, 0x10, 8),
        submit(2, NvmeOpc::WriteZeroes, 0x20, 8),
        // Zone management on a conventional namespace is not replayable.
        zone_mgmt(3, 0x4, 0, true),
    ];

    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let outcome = dispatcher.replay(stream.into_iter().map(Ok)).unwrap();

    assert_eq!(outcome.stats.replayed, 3);
    assert_eq!(outcome.stats.skipped, 1);
    assert_eq!(outcome.stats.errors, 0);
    assert!(outcome.zones.is_none());
}

#[test]
fn lost_device_fails_the_replay() {
    let (ctrlr, ns) = attach(&zns_bus(4, 0x100, 0x100, 0));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();
    ctrlr.detach();

    let stream = vec![submit(0, NvmeOpc::ZoneAppend, 0, 1)];
    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let err = dispatcher.replay(stream.into_iter().map(Ok)).unwrap_err();
    assert!(matches!(err, EngineError::DeviceLost { .. }));
}

#[test]
fn empty_stream_drains_to_zero() {
    let (ctrlr, ns) = attach(&zns_bus(4, 0x100, 0x100, 0));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();
    let dispatcher = ReplayDispatcher::new(ns, qp, ReplayOpts::default());
    let outcome = dispatcher.replay(Vec::new().into_iter()).unwrap();
    assert_eq!(outcome.stats.replayed, 0);
    assert_eq!(outcome.stats.max_outstanding, 0);
}

#[test]
fn seq_generator_fills_open_zones_through_the_engine() {
    // 8 open zones of 0x400 blocks, 4-block appends: the generator must
    // produce 8 * (0x400 / 4) commands and the replay must leave all eight
    // zones Full.
    let (ctrlr, ns) = attach(&zns_bus(16, 0x400, 0x400, 8));
    let qp = ctrlr.alloc_io_qpair(QueuePairOpts::default()).unwrap();

    let records = generate(
        &ns,
        &WorkloadOpts {
            pattern: Pattern::Seq,
            blocks: 4,
            read_ratio: 0.0,
            count: 0,
        },
    )
    .unwrap();
    assert_eq!(records.len(), 8 * (0x400 / 4));

    let dispatcher = ReplayDispatcher::new(
        ns,
        qp,
        ReplayOpts {
            queue_depth: None,
            zone_report: Some(8),
        },
    );
    let outcome =
        dispatcher.replay(records.into_iter().map(Ok)).unwrap();

    assert_eq!(outcome.stats.errors, 0);
    let report = outcome.zone_report.unwrap();
    assert_eq!(report.len(), 8);
    assert!(report.iter().all(|z| z.state == ZoneState::Full));
}

#[test]
fn truncated_file_never_reaches_the_dispatcher() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.bin");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&submit(0, NvmeOpc::Read, 0, 1).to_bytes()).unwrap();
    f.write_all(&[0u8; 10]).unwrap();
    drop(f);

    assert!(matches!(
        TraceReader::open(&path),
        Err(EngineError::MalformedFile { .. })
    ));
}
