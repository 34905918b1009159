//! Chunked trace file reader: a lazy, finite, non-restartable stream of
//! records with a small bounded buffer, so arbitrarily large trace files
//! can be replayed without holding them in memory.

use std::{
    collections::VecDeque,
    convert::TryInto,
    fs::File,
    io::Read,
    path::Path,
};

use snafu::ResultExt;

use crate::{
    core::{EngineError, MalformedFile, TraceFileIo},
    trace::schema::{TraceRecord, TRACE_RECORD_SIZE},
};

/// Records fetched per chunk.
pub const READ_CHUNK_RECORDS: usize = 10_000;

#[derive(Debug)]
pub struct TraceReader {
    file: File,
    path: String,
    /// Total records in the file, from its size.
    total: u64,
    fetched: u64,
    chunk: VecDeque<TraceRecord>,
    failed: bool,
}

impl TraceReader {
    /// Open a trace file. Fails immediately when the file size is not a
    /// multiple of the record size; a truncated file never surfaces partial
    /// records downstream.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let display = path.display().to_string();
        let file = File::open(path).context(TraceFileIo {
            path: display.clone(),
        })?;
        let len = file
            .metadata()
            .context(TraceFileIo {
                path: display.clone(),
            })?
            .len();
        if len % TRACE_RECORD_SIZE as u64 != 0 {
            return MalformedFile {
                path: display,
                reason: format!(
                    "file size {} is not a multiple of the record size {}",
                    len, TRACE_RECORD_SIZE
                ),
            }
            .fail();
        }
        Ok(Self {
            file,
            path: display,
            total: len / TRACE_RECORD_SIZE as u64,
            fetched: 0,
            chunk: VecDeque::new(),
            failed: false,
        })
    }

    pub fn total_records(&self) -> u64 {
        self.total
    }

    fn fetch_chunk(&mut self) -> Result<(), EngineError> {
        let want = (self.total - self.fetched)
            .min(READ_CHUNK_RECORDS as u64) as usize;
        let mut raw = vec![0u8; want * TRACE_RECORD_SIZE];
        self.file.read_exact(&mut raw).map_err(|_| {
            // A short chunk before the recorded end means the file changed
            // underneath us.
            MalformedFile {
                path: self.path.clone(),
                reason: "short read".to_string(),
            }
            .build()
        })?;
        for rec in raw.chunks_exact(TRACE_RECORD_SIZE) {
            let rec: &[u8; TRACE_RECORD_SIZE] = rec.try_into().unwrap();
            self.chunk.push_back(TraceRecord::from_bytes(rec).map_err(
                |_| {
                    MalformedFile {
                        path: self.path.clone(),
                        reason: "unknown tracepoint tag".to_string(),
                    }
                    .build()
                },
            )?);
        }
        self.fetched += want as u64;
        Ok(())
    }
}

impl Iterator for TraceReader {
    type Item = Result<TraceRecord, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.chunk.is_empty() {
            if self.fetched >= self.total {
                return None;
            }
            if let Err(e) = self.fetch_chunk() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        self.chunk.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;
    use crate::trace::schema::Tracepoint;

    fn write_records(path: &Path, n: usize) {
        let mut f = File::create(path).unwrap();
        for i in 0 .. n {
            let rec = TraceRecord {
                lcore: 0,
                tsc_rate: 1_000_000_000,
                tsc_timestamp: i as u64,
                obj_id: i as u64,
                tsc_sc_time: 0,
                tpoint: Tracepoint::Submit,
                opc: 0x02,
                cid: i as u16,
                nsid: 1,
                cpl: 0,
                cdw10: i as u32,
                cdw11: 0,
                cdw12: 0,
                cdw13: 0,
            };
            f.write_all(&rec.to_bytes()).unwrap();
        }
    }

    #[test]
    fn empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        File::create(&path).unwrap();
        let mut rdr = TraceReader::open(&path).unwrap();
        assert_eq!(rdr.total_records(), 0);
        assert!(rdr.next().is_none());
    }

    #[test]
    fn streams_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        write_records(&path, 100);
        let rdr = TraceReader::open(&path).unwrap();
        let recs: Vec<_> = rdr.collect::<Result<_, _>>().unwrap();
        assert_eq!(recs.len(), 100);
        assert_eq!(recs[99].tsc_timestamp, 99);
    }

    #[test]
    fn truncated_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.bin");
        write_records(&path, 3);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        f.set_len(len - 10).unwrap();

        assert_matches!(
            TraceReader::open(&path),
            Err(EngineError::MalformedFile { .. })
        );
    }
}
