// ========================================================================================
//
//                          Triangular work partitioning
//
// ========================================================================================
//
// Row `i` of the distance matrix costs `i` comparisons, so the cumulative cost of
// rows `[0, r)` grows as `r^2 / 2`. Cutting the row space on a square-root
// progression of that cumulative area hands every worker the same number of
// pairs. An equal split by row count would give the last worker almost twice the
// average load for large matrices.

use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot partition work across zero workers")]
    NoWorkers,
    #[error("start row {start} lies beyond the last sample ({n_rows} rows)")]
    StartOutOfRange { start: usize, n_rows: usize },
}

/// An ordered list of half-open row ranges covering `[start, n_rows)` without
/// gaps or overlaps. Ranges may be empty when there are fewer rows than workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    ranges: Vec<Range<usize>>,
    start: usize,
    n_rows: usize,
}

impl Partition {
    /// Splits `[start, n_rows)` into `parts` ranges of near-equal comparison count.
    ///
    /// Boundaries are accumulated in floating point and rounded only once every
    /// boundary is known, so rounding error does not compound from one range to
    /// the next.
    pub fn triangular(n_rows: usize, start: usize, parts: usize) -> Result<Self, PartitionError> {
        if parts == 0 {
            return Err(PartitionError::NoWorkers);
        }
        if start > n_rows {
            return Err(PartitionError::StartOutOfRange { start, n_rows });
        }

        let n = n_rows as f64;
        let s0 = start as f64;
        let per_part = (n * n - s0 * s0) / parts as f64;

        let mut bounds = Vec::with_capacity(parts + 1);
        bounds.push(s0);
        let mut s = s0;
        for _ in 0..parts {
            let e = (s * s + per_part).sqrt();
            bounds.push(e);
            s = e;
        }

        // Round half up, then pin both ends. The float progression lands on
        // `n_rows` only up to rounding error.
        let mut cuts: Vec<usize> = bounds
            .iter()
            .map(|&b| ((b + 0.5).floor() as usize).clamp(start, n_rows))
            .collect();
        cuts[0] = start;
        cuts[parts] = n_rows;
        for k in 1..cuts.len() {
            if cuts[k] < cuts[k - 1] {
                cuts[k] = cuts[k - 1];
            }
        }

        let ranges = cuts.windows(2).map(|w| w[0]..w[1]).collect();
        Ok(Self {
            ranges,
            start,
            n_rows,
        })
    }

    #[inline]
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// The number of `(i, j), j < i` pairs across all ranges.
    pub fn total_comparisons(&self) -> u64 {
        comparisons(&(self.start..self.n_rows))
    }
}

/// The exact number of `(i, j), j < i` pairs whose query row lies in `rows`.
#[inline]
pub fn comparisons(rows: &Range<usize>) -> u64 {
    if rows.is_empty() {
        return 0;
    }
    let triangle = |r: u64| r * r.saturating_sub(1) / 2;
    triangle(rows.end as u64) - triangle(rows.start as u64)
}
