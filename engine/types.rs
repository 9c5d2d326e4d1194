// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fraction of loci a sample may leave uncalled before the distance kernels
/// start inflating its mismatch count.
pub const DEFAULT_ALLOWED_MISSING: f64 = 0.03;

/// An integer allele identifier as stored in an allele matrix cell.
///
/// Zero means "no call". Any positive value identifies an allele at that locus.
/// The trait is sealed over the primitive integer types so that the kernels can
/// be monomorphized per element width without any conversion in the hot loop.
pub trait AlleleCall: Copy + PartialEq + Send + Sync + fmt::Debug + 'static {
    /// Returns `true` when the cell holds an allele call.
    fn is_called(self) -> bool;

    /// Returns `true` for values that cannot be an allele call or the missing
    /// marker. Only signed element types can produce such values.
    fn is_malformed(self) -> bool;
}

macro_rules! impl_unsigned_allele_call {
    ($($t:ty),*) => {
        $(
            impl AlleleCall for $t {
                #[inline(always)]
                fn is_called(self) -> bool {
                    self != 0
                }

                #[inline(always)]
                fn is_malformed(self) -> bool {
                    false
                }
            }
        )*
    };
}

macro_rules! impl_signed_allele_call {
    ($($t:ty),*) => {
        $(
            impl AlleleCall for $t {
                #[inline(always)]
                fn is_called(self) -> bool {
                    self > 0
                }

                #[inline(always)]
                fn is_malformed(self) -> bool {
                    self < 0
                }
            }
        )*
    };
}

impl_unsigned_allele_call!(u8, u16, u32, u64);
impl_signed_allele_call!(i16, i32, i64);

/// The logical dimensions of a row-major matrix held in a shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixShape {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    #[inline]
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// The number of cells, or `None` if it does not fit in a `usize`.
    #[inline]
    pub fn checked_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

impl fmt::Display for MatrixShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// The closed set of distance metrics the engine can compute.
///
/// The selector is matched exactly once per worker task. Each arm runs a row loop
/// that is fully monomorphized for the metric, so the innermost loop never
/// branches on the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Symmetric distance corrected by the larger call count of the two rows.
    Synchronized,
    /// Directional distance corrected by the call count of the query row only.
    Asynchronous,
    /// Symmetric, continuity-corrected log-likelihood style distance.
    Probabilistic,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::Synchronized,
        Metric::Asynchronous,
        Metric::Probabilistic,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Self::Synchronized => "synchronized",
            Self::Asynchronous => "asynchronous",
            Self::Probabilistic => "probabilistic",
        }
    }

    /// Whether `d(i, j) == d(j, i)` holds for every pair of rows.
    pub fn is_symmetric(self) -> bool {
        !matches!(self, Self::Asynchronous)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronized" | "syn" => Ok(Self::Synchronized),
            "asynchronous" | "asyn" => Ok(Self::Asynchronous),
            "probabilistic" | "p" => Ok(Self::Probabilistic),
            other => Err(format!(
                "Unknown metric '{other}'. Expected 'synchronized', 'asynchronous' or 'probabilistic'."
            )),
        }
    }
}

/// Tunables shared by every kernel invocation of one computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    /// Fraction of `n_loci` that may be uncalled without penalty. Only the
    /// synchronized and asynchronous metrics read it.
    pub allowed_missing: f64,
}

impl KernelParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.allowed_missing) {
            return Err(format!(
                "allowed_missing must lie in [0, 1], got {}",
                self.allowed_missing
            ));
        }
        Ok(())
    }
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            allowed_missing: DEFAULT_ALLOWED_MISSING,
        }
    }
}
