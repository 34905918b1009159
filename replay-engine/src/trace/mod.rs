//!
//! Trace file handling: the record schema, the recorder filling files from
//! the driver's tracepoint ring, the chunked reader and the analyzer.

pub use analysis::{
    format_event,
    Analysis,
    AnalyzerOpts,
    LatencyAccumulator,
    TraceAnalyzer,
};
pub use reader::{TraceReader, READ_CHUNK_RECORDS};
pub use recorder::{RecorderOpts, TraceRecorder};
pub use schema::{Tracepoint, TraceRecord, TPOINT_NAME_LEN, TRACE_RECORD_SIZE};

mod analysis;
mod reader;
mod recorder;
mod schema;
