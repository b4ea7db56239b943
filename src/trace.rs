//! Per-unit task event tracer.
//!
//! When enabled, every executed task records `(context, unit, start, end, state)` with
//! timestamps in microseconds since init. At finalize the events of each execution
//! context (worker thread) are written to `trace_<unit>.<context>.csv`.
use crate::error::{DartError, DartResult};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use thread_local::ThreadLocal;

pub(crate) const TRACE_HEADER: &str = "context, unit, start, end, state";

#[derive(Debug, Clone)]
pub(crate) struct TraceEvent {
    pub(crate) context: usize,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) state: &'static str,
}

pub(crate) struct Tracer {
    enabled: bool,
    unit: usize,
    start: Instant,
    dir: PathBuf,
    events: ThreadLocal<Mutex<Vec<TraceEvent>>>,
}

impl Tracer {
    pub(crate) fn new(unit: usize, enabled: bool, dir: impl Into<PathBuf>) -> Tracer {
        Tracer {
            enabled,
            unit,
            start: Instant::now(),
            dir: dir.into(),
            events: ThreadLocal::new(),
        }
    }

    /// Microseconds since the tracer was created
    pub(crate) fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub(crate) fn record(&self, context: usize, start: u64, end: u64, state: &'static str) {
        if self.enabled {
            self.events
                .get_or(|| Mutex::new(Vec::new()))
                .lock()
                .push(TraceEvent {
                    context,
                    start,
                    end,
                    state,
                });
        }
    }

    fn by_context(&self) -> BTreeMap<usize, Vec<TraceEvent>> {
        let mut contexts: BTreeMap<usize, Vec<TraceEvent>> = BTreeMap::new();
        for events in self.events.iter() {
            for event in events.lock().iter() {
                contexts.entry(event.context).or_default().push(event.clone());
            }
        }
        for events in contexts.values_mut() {
            events.sort_by_key(|e| e.start);
        }
        contexts
    }

    /// Write one csv file per context, returns the written paths
    pub(crate) fn write_files(&self) -> DartResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        if !self.enabled {
            return Ok(paths);
        }
        for (context, events) in self.by_context() {
            let path = self
                .dir
                .join(format!("trace_{}.{}.csv", self.unit, context));
            let write = || -> std::io::Result<()> {
                let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
                writeln!(file, "{TRACE_HEADER}")?;
                for e in events.iter() {
                    writeln!(
                        file,
                        "{}, {}, {}, {}, {}",
                        e.context, self.unit, e.start, e.end, e.state
                    )?;
                }
                file.flush()
            };
            if let Err(err) = write() {
                tracing::error!("unit {} failed to write {:?}: {err}", self.unit, path);
                return Err(DartError::Other);
            }
            paths.push(path);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_records_nothing() {
        let tracer = Tracer::new(0, false, std::env::temp_dir());
        tracer.record(0, 1, 2, "DONE");
        assert!(tracer.write_files().unwrap().is_empty());
    }

    #[test]
    fn csv_per_context() {
        let dir = std::env::temp_dir().join(format!("dart_trace_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let tracer = Tracer::new(3, true, &dir);
        tracer.record(0, 10, 20, "DONE");
        tracer.record(1, 5, 7, "CANCELLED");
        tracer.record(0, 1, 2, "DONE");
        let paths = tracer.write_files().unwrap();
        assert_eq!(paths.len(), 2);
        let content = std::fs::read_to_string(dir.join("trace_3.0.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], TRACE_HEADER);
        assert_eq!(lines[1], "0, 3, 1, 2, DONE");
        assert_eq!(lines[2], "0, 3, 10, 20, DONE");
        let content = std::fs::read_to_string(dir.join("trace_3.1.csv")).unwrap();
        assert!(content.contains("1, 3, 5, 7, CANCELLED"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
