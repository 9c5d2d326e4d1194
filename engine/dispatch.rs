// ========================================================================================
//
//                        The parallel dispatcher: fan-out & join
//
// ========================================================================================
//
// This module is the only coordination point of a computation. It copies the
// allele matrix into shared memory, cuts the row space into one balanced range per
// pool thread, submits one self-contained task per range, and blocks until every
// task has reported back. Workers never talk to each other and take no locks: the
// partition guarantees that no two of them ever write the same output cell.

use crate::kernel::{self, OutputRows};
use crate::partition::{Partition, PartitionError};
use crate::progress::{ComputeProgressObserver, NoopComputeProgress, PartitionReport};
use crate::shared::{self, DistanceMatrix, InputHandle, OutputHandle, StoreError};
use crate::types::{AlleleCall, KernelParams, MatrixShape, Metric};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use ndarray::ArrayView2;
use rayon::ThreadPool;
use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use thiserror::Error;

// ========================================================================================
//                          Public API, options & error handling
// ========================================================================================

/// Per-run knobs for [`compute_with`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComputeOptions {
    /// Rows below `start` are skipped; the output has `n_samples - start` rows.
    pub start: usize,
    pub params: KernelParams,
    /// Bound on the wait for workers. `None` blocks until every task finishes.
    pub timeout: Option<Duration>,
}

/// Failures raised inside a worker task.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not attach shared region: {0}")]
    Attach(#[from] StoreError),
    #[error("kernel rejected its block: {0}")]
    Kernel(&'static str),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("the worker pool has no threads")]
    EmptyPool,
    #[error("compute was called from a thread of the pool it dispatches to")]
    CalledFromWorker,
    #[error("invalid kernel parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("worker for partition {partition} (rows {rows:?}) failed: {source}")]
    Worker {
        partition: usize,
        rows: Range<usize>,
        #[source]
        source: WorkerError,
    },
    #[error("workers did not finish within {timeout:.2?} ({finished} of {total} partitions done)")]
    Timeout {
        timeout: Duration,
        finished: usize,
        total: usize,
    },
    #[error("a worker task was dropped by the pool before it reported back")]
    Disconnected,
}

/// Computes the lower-triangular distance matrix of `matrix` with one task per
/// thread of `pool`, skipping rows below `start`.
///
/// Blocks until every task has finished.
pub fn compute<T: AlleleCall>(
    matrix: ArrayView2<'_, T>,
    metric: Metric,
    pool: &ThreadPool,
    start: usize,
) -> Result<DistanceMatrix, DispatchError> {
    let options = ComputeOptions {
        start,
        ..ComputeOptions::default()
    };
    compute_with(matrix, metric, pool, &options, &mut NoopComputeProgress)
}

/// The full form of [`compute`]: custom kernel parameters, an optional bounded
/// wait and a progress observer.
///
/// If any worker fails, the dispatcher still waits for the remaining tasks, then
/// discards the whole output and returns the first failure.
pub fn compute_with<T: AlleleCall>(
    matrix: ArrayView2<'_, T>,
    metric: Metric,
    pool: &ThreadPool,
    options: &ComputeOptions,
    observer: &mut dyn ComputeProgressObserver,
) -> Result<DistanceMatrix, DispatchError> {
    // --- Pre-flight checks: nothing has been allocated yet ---
    let workers = pool.current_num_threads();
    if workers == 0 {
        return Err(DispatchError::EmptyPool);
    }
    if pool.current_thread_index().is_some() {
        return Err(DispatchError::CalledFromWorker);
    }
    options
        .params
        .validate()
        .map_err(DispatchError::InvalidParams)?;

    let run_start = Instant::now();
    let n_samples = matrix.nrows();
    let partition = Partition::triangular(n_samples, options.start, workers)?;

    // --- Copy-in and output allocation ---
    let input = shared::create_input(matrix)?;
    let input_shape = input.descriptor().shape;
    let output = shared::create_output(MatrixShape::new(
        partition.n_rows() - partition.start(),
        partition.n_rows(),
    ))?;
    debug!(
        "Dispatching {} distances over {} partitions: {:?}",
        metric,
        partition.len(),
        partition.ranges()
    );
    observer.on_start(partition.total_comparisons(), partition.len());

    // --- Fan-out ---
    let (tx, rx) = crossbeam_channel::unbounded();
    for (index, rows) in partition.ranges().iter().cloned().enumerate() {
        let task = WorkerTask {
            index,
            metric,
            input: input.clone(),
            output: output.clone(),
            shape: input_shape,
            rows,
            start: partition.start(),
            params: options.params,
        };
        let tx = tx.clone();
        pool.spawn(move || task.run_and_report(&tx));
    }
    drop(tx);
    // Every task holds its own handle; the workers keep the region mapped.
    input.release();

    // --- Join ---
    if let Err(err) = join_outcomes(&rx, partition.len(), options.timeout, observer) {
        warn!("Discarding output '{}'", output.descriptor().name);
        output.release();
        return Err(err);
    }

    // SAFETY: every task has reported, and each drops its attachments before
    // sending its outcome, so no row slice of the output is alive.
    let dist = unsafe { DistanceMatrix::from_finished(output, partition.start()) };
    info!(
        "Computed {} {} distances for {} samples into '{}' in {:.2?}",
        partition.total_comparisons(),
        metric,
        n_samples,
        dist.name(),
        run_start.elapsed()
    );
    Ok(dist)
}

/// Collects one outcome per task, in completion order.
///
/// Keeps draining after a failure so that no task is still writing when the
/// caller discards the output, then returns the first failure. A timeout returns
/// immediately; stragglers keep their own region handles alive.
fn join_outcomes(
    rx: &Receiver<TaskOutcome>,
    total: usize,
    timeout: Option<Duration>,
    observer: &mut dyn ComputeProgressObserver,
) -> Result<(), DispatchError> {
    let deadline = timeout.map(|t| (t, Instant::now() + t));
    let mut first_failure = None;
    for finished in 0..total {
        let outcome = match deadline {
            None => rx.recv().map_err(|_| DispatchError::Disconnected)?,
            Some((timeout, at)) => match rx.recv_deadline(at) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Timed out after {timeout:.2?} with {finished} of {total} partitions done");
                    return Err(DispatchError::Timeout {
                        timeout,
                        finished,
                        total,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DispatchError::Disconnected),
            },
        };

        match outcome.result {
            Ok(report) => {
                debug!("Finished {report}");
                observer.on_partition_done(&report);
            }
            Err(source) => {
                warn!(
                    "Worker for partition {} (rows {:?}) failed: {source}",
                    outcome.index, outcome.rows
                );
                if first_failure.is_none() {
                    first_failure = Some(DispatchError::Worker {
                        partition: outcome.index,
                        rows: outcome.rows,
                        source,
                    });
                }
            }
        }
    }
    observer.on_finish();

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ========================================================================================
//                                   The worker task
// ========================================================================================

/// The unit of work sent to one pool thread.
struct WorkerTask<T> {
    index: usize,
    metric: Metric,
    input: InputHandle<T>,
    output: OutputHandle,
    shape: MatrixShape,
    rows: Range<usize>,
    start: usize,
    params: KernelParams,
}

struct TaskOutcome {
    index: usize,
    rows: Range<usize>,
    result: Result<PartitionReport, WorkerError>,
}

impl<T: AlleleCall> WorkerTask<T> {
    fn run_and_report(self, tx: &Sender<TaskOutcome>) {
        let index = self.index;
        let rows = self.rows.clone();
        // Unwinding drops the task's attachments before the outcome is sent.
        let result = panic::catch_unwind(AssertUnwindSafe(move || self.run()))
            .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload))));
        // The dispatcher only hangs up after a timeout, when nobody listens.
        let _ = tx.send(TaskOutcome {
            index,
            rows,
            result,
        });
    }

    fn run(self) -> Result<PartitionReport, WorkerError> {
        let started = Instant::now();
        let WorkerTask {
            index,
            metric,
            input,
            output,
            shape,
            rows,
            start,
            params,
        } = self;

        if rows.is_empty() {
            return Ok(PartitionReport {
                index,
                rows,
                comparisons: 0,
                elapsed: started.elapsed(),
            });
        }

        let local = match (rows.start.checked_sub(start), rows.end.checked_sub(start)) {
            (Some(s), Some(e)) => s..e,
            _ => return Err(WorkerError::Kernel("Assigned rows precede the output start row")),
        };

        let input = input.attach(shape)?;
        let output = output.attach(MatrixShape::new(shape.rows - start, shape.rows))?;
        let alleles = input.rows();
        let comparisons = {
            // SAFETY: this task's rows come from a `Partition`, whose ranges are
            // pairwise disjoint, so no other worker holds a slice overlapping them.
            let cells = unsafe { output.rows_mut(local)? };
            let mut out =
                OutputRows::new(cells, rows.clone(), shape.rows).map_err(WorkerError::Kernel)?;
            kernel::fill_rows(metric, &alleles, &mut out, &params)
        };
        output.release();
        input.release();

        Ok(PartitionReport {
            index,
            rows,
            comparisons,
            elapsed: started.elapsed(),
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::pair_distance;
    use crate::partition;
    use ndarray::{Array2, array, s};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pool(threads: usize) -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    fn random_profiles(n_samples: usize, n_loci: usize, seed: u64) -> Array2<u32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n_samples, n_loci), |_| {
            // A quarter of the cells uncalled, the rest drawn from a few alleles.
            if rng.gen_bool(0.25) { 0 } else { rng.gen_range(1..5) }
        })
    }

    #[derive(Default)]
    struct Recorder {
        total: u64,
        partitions: usize,
        done: Vec<PartitionReport>,
        finished: bool,
    }
    impl ComputeProgressObserver for Recorder {
        fn on_start(&mut self, total_comparisons: u64, partitions: usize) {
            self.total = total_comparisons;
            self.partitions = partitions;
        }
        fn on_partition_done(&mut self, report: &PartitionReport) {
            self.done.push(report.clone());
        }
        fn on_finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn concrete_scenario_matches_hand_trace() {
        let matrix = array![[1u32, 2, 0], [1, 2, 3], [1, 0, 3], [2, 2, 3]];
        let dist = compute(matrix.view(), Metric::Synchronized, &pool(2), 0).unwrap();
        assert_eq!(
            dist.to_owned(),
            array![[0, 0, 0, 0], [1, 0, 0, 0], [1, 1, 0, 0], [2, 1, 2, 0]]
        );
        assert_eq!(dist.get(3, 2), Some(2));
        assert_eq!(dist.get(2, 3), None);
    }

    #[test]
    fn parallel_output_equals_single_worker_output() {
        let matrix = random_profiles(97, 40, 11);
        for metric in Metric::ALL {
            let single = compute(matrix.view(), metric, &pool(1), 0).unwrap();
            for threads in [2, 3, 8] {
                let parallel = compute(matrix.view(), metric, &pool(threads), 0).unwrap();
                assert_eq!(single.view(), parallel.view(), "{metric} with {threads} threads");
            }
        }
    }

    #[test]
    fn every_lower_cell_matches_the_pairwise_kernel() {
        let matrix = random_profiles(31, 17, 3);
        let params = KernelParams::default();
        for metric in Metric::ALL {
            let dist = compute(matrix.view(), metric, &pool(4), 0).unwrap();
            for i in 0..31 {
                for j in 0..31 {
                    let expected = if j < i {
                        pair_distance(metric, matrix.row(i).as_slice().unwrap(), matrix.row(j).as_slice().unwrap(), &params)
                    } else {
                        0
                    };
                    assert_eq!(dist.view()[[i, j]], expected, "{metric} at ({i}, {j})");
                }
            }
        }
    }

    #[test]
    fn start_offset_reproduces_the_tail_of_a_full_run() {
        let matrix = random_profiles(40, 12, 5);
        let full = compute(matrix.view(), Metric::Probabilistic, &pool(3), 0).unwrap();
        let tail = compute(matrix.view(), Metric::Probabilistic, &pool(3), 25).unwrap();
        assert_eq!(tail.shape(), MatrixShape::new(15, 40));
        assert_eq!(tail.start(), 25);
        assert_eq!(tail.view(), full.view().slice(s![25.., ..]));
    }

    #[test]
    fn repeated_runs_are_identical() {
        let matrix = random_profiles(50, 20, 9);
        let first = compute(matrix.view(), Metric::Asynchronous, &pool(4), 0).unwrap();
        let second = compute(matrix.view(), Metric::Asynchronous, &pool(4), 0).unwrap();
        assert_eq!(first.view(), second.view());
    }

    #[test]
    fn more_workers_than_rows_is_fine() {
        let matrix = array![[1u16, 2], [1, 3]];
        let dist = compute(matrix.view(), Metric::Synchronized, &pool(8), 0).unwrap();
        assert_eq!(dist.to_owned(), array![[0, 0], [1, 0]]);
    }

    #[test]
    fn start_equal_to_sample_count_yields_an_empty_matrix() {
        let matrix = array![[1u16, 2], [1, 3]];
        let dist = compute(matrix.view(), Metric::Synchronized, &pool(2), 2).unwrap();
        assert_eq!(dist.view().dim(), (0, 2));
    }

    #[test]
    fn contract_violations_fail_before_dispatch() {
        let matrix = array![[1u32, 2], [3, 4]];
        let workers = pool(2);
        assert!(matches!(
            compute(matrix.view(), Metric::Synchronized, &workers, 3),
            Err(DispatchError::Partition(PartitionError::StartOutOfRange { .. }))
        ));

        let empty = Array2::<u32>::zeros((0, 3));
        assert!(matches!(
            compute(empty.view(), Metric::Synchronized, &workers, 0),
            Err(DispatchError::Store(StoreError::EmptyMatrix { .. }))
        ));

        let options = ComputeOptions {
            params: KernelParams { allowed_missing: 3.0 },
            ..ComputeOptions::default()
        };
        assert!(matches!(
            compute_with(matrix.view(), Metric::Synchronized, &workers, &options, &mut NoopComputeProgress),
            Err(DispatchError::InvalidParams(_))
        ));
    }

    #[test]
    fn dispatching_from_inside_the_pool_is_refused() {
        let matrix = array![[1u32, 2], [3, 4]];
        let workers = pool(2);
        let result = workers.install(|| compute(matrix.view(), Metric::Synchronized, &workers, 0).map(|d| d.to_owned()));
        assert!(matches!(result, Err(DispatchError::CalledFromWorker)));
    }

    #[test]
    fn observer_sees_every_partition() {
        let matrix = random_profiles(60, 8, 1);
        let mut recorder = Recorder::default();
        let options = ComputeOptions {
            start: 10,
            timeout: Some(Duration::from_secs(600)),
            ..ComputeOptions::default()
        };
        compute_with(matrix.view(), Metric::Synchronized, &pool(4), &options, &mut recorder).unwrap();

        assert_eq!(recorder.partitions, 4);
        assert_eq!(recorder.done.len(), 4);
        assert!(recorder.finished);
        assert_eq!(recorder.total, (60 * 59 - 10 * 9) / 2);
        let sum: u64 = recorder.done.iter().map(|r| r.comparisons).sum();
        assert_eq!(sum, recorder.total);
    }

    #[test]
    fn worker_reports_attach_mismatch() {
        let matrix = array![[1u32, 2], [3, 4]];
        let input = shared::create_input(matrix.view()).unwrap();
        let output = shared::create_output(MatrixShape::new(2, 2)).unwrap();
        let task = WorkerTask {
            index: 0,
            metric: Metric::Synchronized,
            input,
            output,
            shape: MatrixShape::new(2, 3),
            rows: 0..2,
            start: 0,
            params: KernelParams::default(),
        };
        assert!(matches!(
            task.run(),
            Err(WorkerError::Attach(StoreError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn worker_with_empty_range_does_nothing() {
        let matrix = array![[1u32, 2]];
        let input = shared::create_input(matrix.view()).unwrap();
        let output = shared::create_output(MatrixShape::new(1, 1)).unwrap();
        let task = WorkerTask {
            index: 3,
            metric: Metric::Probabilistic,
            input,
            output,
            shape: MatrixShape::new(1, 2),
            rows: 1..1,
            start: 0,
            params: KernelParams::default(),
        };
        let report = task.run().unwrap();
        assert_eq!(report.comparisons, 0);
        assert_eq!(report.index, 3);
    }

    fn report(index: usize, rows: Range<usize>) -> TaskOutcome {
        TaskOutcome {
            index,
            rows: rows.clone(),
            result: Ok(PartitionReport {
                index,
                comparisons: partition::comparisons(&rows),
                rows,
                elapsed: Duration::ZERO,
            }),
        }
    }

    fn failure(index: usize, rows: Range<usize>, message: &str) -> TaskOutcome {
        TaskOutcome {
            index,
            rows,
            result: Err(WorkerError::Panicked(message.to_string())),
        }
    }

    #[test]
    fn join_drains_every_outcome_and_returns_the_first_failure() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(report(0, 0..5)).unwrap();
        tx.send(failure(2, 7..8, "first")).unwrap();
        tx.send(report(1, 5..7)).unwrap();
        tx.send(failure(3, 8..9, "second")).unwrap();
        tx.send(report(4, 9..10)).unwrap();
        drop(tx);

        let mut recorder = Recorder::default();
        let err = join_outcomes(&rx, 5, None, &mut recorder).unwrap_err();
        match err {
            DispatchError::Worker {
                partition,
                rows,
                source: WorkerError::Panicked(message),
            } => {
                assert_eq!(partition, 2);
                assert_eq!(rows, 7..8);
                assert_eq!(message, "first");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(rx.is_empty());
        let indices: Vec<usize> = recorder.done.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 4]);
        assert!(recorder.finished);
    }

    #[test]
    fn join_succeeds_once_every_task_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(report(1, 3..6)).unwrap();
        tx.send(report(0, 0..3)).unwrap();
        let mut recorder = Recorder::default();
        join_outcomes(&rx, 2, Some(Duration::from_secs(5)), &mut recorder).unwrap();
        assert_eq!(recorder.done.len(), 2);
        assert!(recorder.finished);
        drop(tx);
    }

    #[test]
    fn join_gives_up_at_the_deadline() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(report(0, 0..4)).unwrap();
        let mut recorder = Recorder::default();
        let err = join_outcomes(&rx, 3, Some(Duration::from_millis(20)), &mut recorder).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Timeout {
                finished: 1,
                total: 3,
                ..
            }
        ));
        assert_eq!(recorder.done.len(), 1);
        assert!(!recorder.finished);
        drop(tx);
    }

    #[test]
    fn join_reports_tasks_lost_by_the_pool() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(report(0, 0..4)).unwrap();
        drop(tx);
        let err = join_outcomes(&rx, 2, None, &mut NoopComputeProgress).unwrap_err();
        assert!(matches!(err, DispatchError::Disconnected));
    }

    #[test]
    fn slow_workers_hit_the_bounded_wait() {
        let matrix = random_profiles(2000, 800, 21);
        let options = ComputeOptions {
            timeout: Some(Duration::from_millis(1)),
            ..ComputeOptions::default()
        };
        let result = compute_with(
            matrix.view(),
            Metric::Synchronized,
            &pool(2),
            &options,
            &mut NoopComputeProgress,
        );
        match result {
            Err(DispatchError::Timeout {
                timeout,
                finished,
                total,
            }) => {
                assert_eq!(timeout, Duration::from_millis(1));
                assert_eq!(finished, 0);
                assert_eq!(total, 2);
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("2000 samples finished within a millisecond"),
        }
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload), "boom 7");
    }
}
