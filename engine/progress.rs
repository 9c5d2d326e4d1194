use std::fmt;
use std::ops::Range;
use std::time::Duration;

/// What a worker reports back once its partition is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub index: usize,
    pub rows: Range<usize>,
    pub comparisons: u64,
    pub elapsed: Duration,
}

impl fmt::Display for PartitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} (rows {}..{}, {} comparisons) in {:.2?}",
            self.index, self.rows.start, self.rows.end, self.comparisons, self.elapsed
        )
    }
}

/// Observer for reporting incremental progress of a distance computation.
///
/// Callbacks run on the dispatching thread, never on a worker.
pub trait ComputeProgressObserver {
    fn on_start(&mut self, total_comparisons: u64, partitions: usize) {
        let _ = (total_comparisons, partitions);
    }
    fn on_partition_done(&mut self, report: &PartitionReport) {
        let _ = report;
    }
    fn on_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopComputeProgress;

impl ComputeProgressObserver for NoopComputeProgress {}
