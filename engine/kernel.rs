// ========================================================================================
//
//                      The kernel: allocation-free pairwise distances
//
// ========================================================================================
//
// This module contains the innermost loops of the engine. A worker hands it a
// read-only view of the allele matrix, a contiguous range of query rows and the
// matching rows of the output matrix. Every query row `i` is compared against all
// reference rows `j < i`. Nothing here allocates, and the metric is resolved once
// per call so the loops are monomorphic.

use crate::types::{AlleleCall, KernelParams, Metric};
use std::ops::Range;

// ========================================================================================
//                            Public API & type definitions
// ========================================================================================

/// A validated, zero-cost view over a row-major allele matrix.
///
/// The constructor guarantees the slice length is a whole number of rows, so row
/// extraction inside the hot loops can never straddle two samples.
#[derive(Clone, Copy)]
pub struct AlleleRows<'a, T> {
    data: &'a [T],
    n_loci: usize,
}

impl<'a, T: AlleleCall> AlleleRows<'a, T> {
    #[inline]
    pub fn new(data: &'a [T], n_loci: usize) -> Result<Self, &'static str> {
        if n_loci == 0 {
            return Err("Allele matrix must have at least one locus column");
        }
        if data.len() % n_loci != 0 {
            return Err("Mismatched allele data: slice length is not a multiple of the locus count");
        }
        Ok(Self { data, n_loci })
    }

    #[inline(always)]
    pub fn n_loci(&self) -> usize {
        self.n_loci
    }

    #[inline(always)]
    pub fn n_rows(&self) -> usize {
        self.data.len() / self.n_loci
    }

    #[inline(always)]
    pub fn row(&self, idx: usize) -> &'a [T] {
        let offset = idx * self.n_loci;
        &self.data[offset..offset + self.n_loci]
    }
}

/// A mutable view over the output rows a single worker owns.
///
/// `rows` are absolute sample indices; row `rows.start` of the matrix is the first
/// row of `data`. Each output row is `cols` wide.
pub struct OutputRows<'a> {
    data: &'a mut [i32],
    rows: Range<usize>,
    cols: usize,
}

impl<'a> OutputRows<'a> {
    #[inline]
    pub fn new(data: &'a mut [i32], rows: Range<usize>, cols: usize) -> Result<Self, &'static str> {
        if rows.end > cols {
            return Err("Output rows reach past the last sample column");
        }
        if data.len() != rows.len() * cols {
            return Err("Mismatched output data: slice length does not equal rows * cols");
        }
        Ok(Self { data, rows, cols })
    }

    #[inline(always)]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }
}

/// Loci counts collected in one pass over a pair of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairTally {
    /// Loci called in both rows.
    pub compared: u32,
    /// Loci called in both rows with different alleles.
    pub differing: u32,
    /// Loci called in the reference row.
    pub reference_calls: u32,
}

/// Counts the called loci of a row.
#[inline(always)]
pub fn count_calls<T: AlleleCall>(row: &[T]) -> u32 {
    row.iter().map(|&a| a.is_called() as u32).sum()
}

/// Walks both rows once and tallies the loci they can be compared on.
///
/// The body is written with integer arithmetic instead of nested branches so that
/// the compiler is free to vectorize it.
#[inline(always)]
pub fn tally_pair<T: AlleleCall>(query: &[T], reference: &[T]) -> PairTally {
    let mut compared = 0u32;
    let mut differing = 0u32;
    let mut reference_calls = 0u32;
    for (&q, &r) in query.iter().zip(reference) {
        let r_called = r.is_called() as u32;
        let both = r_called & (q.is_called() as u32);
        reference_calls += r_called;
        compared += both;
        differing += both & ((q != r) as u32);
    }
    PairTally {
        compared,
        differing,
        reference_calls,
    }
}

/// Computes one distance between a query row and a reference row.
///
/// This is the scalar entry point used by tests and by callers that only need a
/// handful of values. Bulk work goes through [`fill_rows`].
pub fn pair_distance<T: AlleleCall>(
    metric: Metric,
    query: &[T],
    reference: &[T],
    params: &KernelParams,
) -> i32 {
    debug_assert_eq!(query.len(), reference.len());
    let n_loci = query.len() as f64;
    let query_calls = count_calls(query);
    let tally = tally_pair(query, reference);
    match metric {
        Metric::Synchronized => Synchronized::finish(query_calls, tally, n_loci, params),
        Metric::Asynchronous => Asynchronous::finish(query_calls, tally, n_loci, params),
        Metric::Probabilistic => Probabilistic::finish(query_calls, tally, n_loci, params),
    }
}

/// Fills every meaningful cell of `out`: for each query row `i` in `out.rows()`,
/// the cells `0..i` receive `d(i, j)`. Cells with `j >= i` are left untouched.
///
/// Returns the number of pairs computed.
pub fn fill_rows<T: AlleleCall>(
    metric: Metric,
    alleles: &AlleleRows<'_, T>,
    out: &mut OutputRows<'_>,
    params: &KernelParams,
) -> u64 {
    debug_assert!(out.rows().end <= alleles.n_rows());
    // The one and only metric dispatch of a worker task.
    match metric {
        Metric::Synchronized => fill_rows_with::<Synchronized, T>(alleles, out, params),
        Metric::Asynchronous => fill_rows_with::<Asynchronous, T>(alleles, out, params),
        Metric::Probabilistic => fill_rows_with::<Probabilistic, T>(alleles, out, params),
    }
}

// ========================================================================================
//                              The kernel implementation
// ========================================================================================

/// The part of a metric that differs between the three kernels: how a tally is
/// turned into an integer distance.
trait PairMetric {
    fn finish(query_calls: u32, tally: PairTally, n_loci: f64, params: &KernelParams) -> i32;
}

struct Synchronized;
struct Asynchronous;
struct Probabilistic;

/// Inflates the comparison when the expected number of comparable loci `ll`
/// exceeds the observed one, then scales the mismatch fraction to `n_loci`.
#[inline(always)]
fn corrected_distance(tally: PairTally, ll: f64, n_loci: f64) -> i32 {
    let mut ad = tally.differing as f64;
    let mut al = tally.compared as f64;
    if ll > al {
        ad += ll - al;
        al = ll;
    }
    if al > 0.0 {
        (ad / al * n_loci).round() as i32
    } else {
        n_loci as i32
    }
}

impl PairMetric for Synchronized {
    #[inline(always)]
    fn finish(query_calls: u32, tally: PairTally, n_loci: f64, params: &KernelParams) -> i32 {
        let expected = query_calls.max(tally.reference_calls) as f64;
        let ll = expected - params.allowed_missing * n_loci;
        corrected_distance(tally, ll, n_loci)
    }
}

impl PairMetric for Asynchronous {
    #[inline(always)]
    fn finish(query_calls: u32, tally: PairTally, n_loci: f64, params: &KernelParams) -> i32 {
        let ll = query_calls as f64 - params.allowed_missing * n_loci;
        corrected_distance(tally, ll, n_loci)
    }
}

impl PairMetric for Probabilistic {
    #[inline(always)]
    fn finish(_: u32, tally: PairTally, n_loci: f64, _: &KernelParams) -> i32 {
        // `compared + 1 >= 1` and `differing <= compared`, so the log argument
        // stays in (0, 1] and no zero check is required.
        let mismatch = (tally.differing as f64 + 0.5) / (tally.compared as f64 + 1.0);
        (-(-mismatch).ln_1p() * n_loci * 100.0).round() as i32
    }
}

#[inline]
fn fill_rows_with<K: PairMetric, T: AlleleCall>(
    alleles: &AlleleRows<'_, T>,
    out: &mut OutputRows<'_>,
    params: &KernelParams,
) -> u64 {
    let n_loci = alleles.n_loci() as f64;
    let cols = out.cols;
    let rows = out.rows();
    let first = rows.start;
    let mut pairs = 0u64;

    for i in rows {
        let query = alleles.row(i);
        let query_calls = count_calls(query);
        let offset = (i - first) * cols;
        let out_row = &mut out.data[offset..offset + i];
        for (j, cell) in out_row.iter_mut().enumerate() {
            let tally = tally_pair(query, alleles.row(j));
            *cell = K::finish(query_calls, tally, n_loci, params);
        }
        pairs += i as u64;
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: [u32; 12] = [1, 2, 0, 1, 2, 3, 1, 0, 3, 2, 2, 3];

    fn fill(metric: Metric, data: &[u32], n_loci: usize) -> Vec<i32> {
        let alleles = AlleleRows::new(data, n_loci).unwrap();
        let n = alleles.n_rows();
        let mut buf = vec![0i32; n * n];
        let mut out = OutputRows::new(&mut buf, 0..n, n).unwrap();
        fill_rows(metric, &alleles, &mut out, &KernelParams::default());
        buf
    }

    #[test]
    fn tally_counts_shared_and_differing_calls() {
        let tally = tally_pair(&[2u32, 2, 3, 0], &[1u32, 2, 0, 4]);
        assert_eq!(
            tally,
            PairTally {
                compared: 2,
                differing: 1,
                reference_calls: 3,
            }
        );
    }

    #[test]
    fn synchronized_matches_hand_trace() {
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            1, 0, 0, 0,
            1, 1, 0, 0,
            2, 1, 2, 0,
        ];
        assert_eq!(fill(Metric::Synchronized, &EXAMPLE, 3), expected);
    }

    #[test]
    fn asynchronous_matches_hand_trace() {
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            1, 0, 0, 0,
            1, 0, 0, 0,
            2, 1, 2, 0,
        ];
        assert_eq!(fill(Metric::Asynchronous, &EXAMPLE, 3), expected);
    }

    #[test]
    fn probabilistic_matches_hand_trace() {
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            55, 0, 0, 0,
            86, 55, 0, 0,
            208, 141, 208, 0,
        ];
        assert_eq!(fill(Metric::Probabilistic, &EXAMPLE, 3), expected);
    }

    #[test]
    fn symmetric_metrics_do_not_depend_on_row_order() {
        let rows: [[u16; 6]; 4] = [
            [1, 2, 3, 0, 5, 0],
            [1, 0, 4, 4, 5, 6],
            [0, 0, 0, 1, 1, 1],
            [7, 2, 3, 4, 0, 6],
        ];
        let params = KernelParams::default();
        for metric in Metric::ALL.into_iter().filter(|m| m.is_symmetric()) {
            for a in &rows {
                for b in &rows {
                    assert_eq!(
                        pair_distance(metric, a, b, &params),
                        pair_distance(metric, b, a, &params),
                        "{metric} is not symmetric for {a:?} / {b:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn asynchronous_depends_on_which_row_is_the_query() {
        assert!(!Metric::Asynchronous.is_symmetric());
        let dense = [1u32, 2, 3];
        let sparse = [1u32, 0, 0];
        let params = KernelParams::default();
        assert_eq!(pair_distance(Metric::Asynchronous, &dense, &sparse, &params), 2);
        assert_eq!(pair_distance(Metric::Asynchronous, &sparse, &dense, &params), 0);
    }

    #[test]
    fn uncalled_rows_give_maximal_distance() {
        let called = [3i32, 1, 4, 1, 5];
        let empty = [0i32; 5];
        let params = KernelParams::default();
        for metric in [Metric::Synchronized, Metric::Asynchronous] {
            assert_eq!(pair_distance(metric, &called, &empty, &params), 5);
            assert_eq!(pair_distance(metric, &empty, &called, &params), 5);
            assert_eq!(pair_distance(metric, &empty, &empty, &params), 5);
        }
        // ln(2) * 5 * 100 = 346.57...
        assert_eq!(pair_distance(Metric::Probabilistic, &called, &empty, &params), 347);
    }

    #[test]
    fn identical_complete_rows_are_at_distance_zero() {
        let row = [4u8, 8, 15, 16, 23, 42];
        let params = KernelParams::default();
        assert_eq!(pair_distance(Metric::Synchronized, &row, &row, &params), 0);
        assert_eq!(pair_distance(Metric::Asynchronous, &row, &row, &params), 0);
        // -ln(1 - 0.5 / 7) * 6 * 100 = 44.46...
        assert_eq!(pair_distance(Metric::Probabilistic, &row, &row, &params), 44);
    }

    #[test]
    fn allowed_missing_controls_the_penalty() {
        let query = [1u32, 2, 3, 4];
        let reference = [1u32, 2, 0, 0];
        let strict = KernelParams { allowed_missing: 0.0 };
        let lenient = KernelParams { allowed_missing: 0.5 };
        // ll = 4 > al = 2: ad = 2, al = 4 -> 2.
        assert_eq!(pair_distance(Metric::Synchronized, &query, &reference, &strict), 2);
        // ll = 4 - 2 = 2, no inflation -> 0.
        assert_eq!(pair_distance(Metric::Synchronized, &query, &reference, &lenient), 0);
    }

    #[test]
    fn cells_on_and_above_the_diagonal_stay_untouched() {
        let alleles = AlleleRows::new(&EXAMPLE, 3).unwrap();
        let mut buf = vec![-1i32; 2 * 4];
        let mut out = OutputRows::new(&mut buf, 2..4, 4).unwrap();
        let pairs = fill_rows(
            Metric::Synchronized,
            &alleles,
            &mut out,
            &KernelParams::default(),
        );
        assert_eq!(pairs, 2 + 3);
        assert_eq!(buf, vec![1, 1, -1, -1, 2, 1, 2, -1]);
    }

    #[test]
    fn views_reject_inconsistent_dimensions() {
        assert!(AlleleRows::new(&[1u32, 2, 3], 2).is_err());
        assert!(AlleleRows::new(&[1u32, 2, 3], 0).is_err());
        let mut buf = vec![0i32; 6];
        assert!(OutputRows::new(&mut buf, 0..2, 4).is_err());
        let mut buf = vec![0i32; 10];
        assert!(OutputRows::new(&mut buf, 3..5, 2).is_err());
    }
}
