use std::time::{SystemTime, UNIX_EPOCH};

use crate::labels::LabelSet;

/// A single measurement for a metric at a particular timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: LabelSet,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Milliseconds since the Unix epoch, for samples without an explicit
/// timestamp.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Where scraped samples go. Implementations must tolerate concurrent
/// appends from arbitrarily many scrape loops.
pub trait SampleSink: Send + Sync {
    fn append(&self, sample: Sample);
}

/// A sink that logs appended samples. Stands in for a storage backend
/// so the binary is usable on its own.
pub struct LogSink;

impl SampleSink for LogSink {
    fn append(&self, sample: Sample) {
        debug!(
            message = "append sample",
            name = %sample.name,
            labels = %sample.labels,
            value = sample.value,
            timestamp = sample.timestamp,
        );
    }
}
