// ========================================================================================
//
//                              The shared matrix store
//
// ========================================================================================
//
// ### Purpose ###
//
// The allele matrix is copied exactly once, into an anonymous memory mapping that
// every worker reads through its own reference-counted attachment. The distance
// matrix lives in a second mapping that workers write into in place. A region is
// unmapped when the last handle or attachment to it is dropped, so a creator may
// release its handle while workers are still attached.
//
// ### Ownership ###
//
// * Input region: sealed read-only after the copy. Nobody can mutate it.
// * Output region: written through raw row slices handed out by
//   `DistanceRegion::rows_mut`. Exclusivity of those rows is an invariant of the
//   partition, not a runtime lock.

use crate::kernel::AlleleRows;
use crate::types::{AlleleCall, MatrixShape};
use log::debug;
use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::{Array2, ArrayView2};
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, Range};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static REGION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("allele matrix is empty ({shape}); at least one sample and one locus are required")]
    EmptyMatrix { shape: MatrixShape },
    #[error("allele matrix holds a negative value at row {row}, column {col}")]
    NegativeAllele { row: usize, col: usize },
    #[error("shared region '{name}' with shape {shape} exceeds the addressable size")]
    SizeOverflow { name: String, shape: MatrixShape },
    #[error("failed to allocate {bytes} bytes for shared region '{name}': {source}")]
    Allocation {
        name: String,
        bytes: usize,
        #[source]
        source: io::Error,
    },
    #[error("shared region '{name}' holds a {actual} matrix but {expected} was requested")]
    ShapeMismatch {
        name: String,
        expected: MatrixShape,
        actual: MatrixShape,
    },
    #[error("shared region '{name}' stores {actual}-byte elements but {expected}-byte elements were requested")]
    WidthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("rows {rows:?} fall outside shared region '{name}' ({available} rows)")]
    RowsOutOfRange {
        name: String,
        rows: Range<usize>,
        available: usize,
    },
}

/// Everything a process needs to find and interpret a shared region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub name: String,
    pub shape: MatrixShape,
    pub element_width: usize,
}

/// A block of shared memory holding a row-major matrix.
pub trait Region: Send + Sync {
    type Element;

    fn descriptor(&self) -> &RegionDescriptor;
}

fn next_region_name(kind: &str) -> String {
    let seq = REGION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("hccdist.{kind}.{}.{seq}", std::process::id())
}

fn region_bytes<T>(name: &str, shape: MatrixShape) -> Result<usize, StoreError> {
    shape
        .checked_len()
        .and_then(|cells| cells.checked_mul(size_of::<T>()))
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or_else(|| StoreError::SizeOverflow {
            name: name.to_string(),
            shape,
        })
}

fn map_anonymous(name: &str, bytes: usize) -> Result<MmapMut, StoreError> {
    // A zero-length mapping is rejected by the OS; keep one element of slack.
    MmapOptions::new()
        .len(bytes.max(size_of::<u64>()))
        .map_anon()
        .map_err(|source| StoreError::Allocation {
            name: name.to_string(),
            bytes,
            source,
        })
}

// ========================================================================================
//                                 Handles & attachments
// ========================================================================================

/// An owning handle to a shared region. Cloning a handle does not copy data.
pub struct SharedHandle<R> {
    region: Arc<R>,
}

impl<R> Clone for SharedHandle<R> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
        }
    }
}

impl<R: Region> SharedHandle<R> {
    fn new(region: R) -> Self {
        Self {
            region: Arc::new(region),
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &RegionDescriptor {
        self.region.descriptor()
    }

    /// Maps the region for use by a worker without copying it.
    ///
    /// Fails fast if the region does not hold a matrix of the shape the caller was
    /// told to expect.
    pub fn attach(&self, expected: MatrixShape) -> Result<Attached<R>, StoreError> {
        let descriptor = self.region.descriptor();
        if descriptor.shape != expected {
            return Err(StoreError::ShapeMismatch {
                name: descriptor.name.clone(),
                expected,
                actual: descriptor.shape,
            });
        }
        let width = size_of::<R::Element>();
        if descriptor.element_width != width {
            return Err(StoreError::WidthMismatch {
                name: descriptor.name.clone(),
                expected: width,
                actual: descriptor.element_width,
            });
        }
        Ok(Attached {
            region: Arc::clone(&self.region),
        })
    }

    /// Gives up this handle. The mapping itself is removed once every other
    /// handle and attachment is gone.
    pub fn release(self) {
        debug!(
            "Releasing handle to '{}' ({} references remain)",
            self.region.descriptor().name,
            Arc::strong_count(&self.region) - 1
        );
    }

    /// The number of live handles and attachments, this one included.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.region)
    }
}

/// A worker's mapping of a shared region.
pub struct Attached<R> {
    region: Arc<R>,
}

impl<R: Region> Attached<R> {
    pub fn release(self) {}
}

impl<R> Deref for Attached<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.region
    }
}

pub type InputHandle<T> = SharedHandle<AlleleRegion<T>>;
pub type OutputHandle = SharedHandle<DistanceRegion>;

// ========================================================================================
//                                   The input region
// ========================================================================================

/// A read-only copy of an allele matrix.
pub struct AlleleRegion<T> {
    descriptor: RegionDescriptor,
    map: Mmap,
    marker: PhantomData<T>,
}

impl<T: AlleleCall> AlleleRegion<T> {
    pub fn as_slice(&self) -> &[T] {
        let len = self.descriptor.shape.rows * self.descriptor.shape.cols;
        // SAFETY: the mapping is page aligned, at least `len * size_of::<T>()` bytes
        // long, and was fully initialised from a `[T]` before it was sealed.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().cast::<T>(), len) }
    }

    pub fn rows(&self) -> AlleleRows<'_, T> {
        // Shape was validated non-empty on creation, so this cannot fail.
        AlleleRows::new(self.as_slice(), self.descriptor.shape.cols)
            .unwrap_or_else(|msg| unreachable!("{msg}"))
    }
}

impl<T: AlleleCall> Region for AlleleRegion<T> {
    type Element = T;

    fn descriptor(&self) -> &RegionDescriptor {
        &self.descriptor
    }
}

impl<T> Drop for AlleleRegion<T> {
    fn drop(&mut self) {
        debug!("Unmapping shared region '{}'", self.descriptor.name);
    }
}

/// Copies `matrix` into a fresh shared region and returns its handle.
///
/// The matrix must be non-empty and free of negative values.
pub fn create_input<T: AlleleCall>(matrix: ArrayView2<'_, T>) -> Result<InputHandle<T>, StoreError> {
    let shape = MatrixShape::new(matrix.nrows(), matrix.ncols());
    if shape.is_empty() {
        return Err(StoreError::EmptyMatrix { shape });
    }
    if let Some(((row, col), _)) = matrix.indexed_iter().find(|(_, v)| v.is_malformed()) {
        return Err(StoreError::NegativeAllele { row, col });
    }

    let name = next_region_name("mat");
    let bytes = region_bytes::<T>(&name, shape)?;
    let mut map = map_anonymous(&name, bytes)?;
    {
        let len = shape.rows * shape.cols;
        // SAFETY: the mapping is page aligned and `bytes` long; it is exclusively
        // owned here and every element is overwritten below.
        let dest = unsafe { std::slice::from_raw_parts_mut(map.as_mut_ptr().cast::<T>(), len) };
        match matrix.as_slice() {
            Some(src) => dest.copy_from_slice(src),
            None => dest
                .iter_mut()
                .zip(matrix.iter())
                .for_each(|(d, &s)| *d = s),
        }
    }
    let map = map.make_read_only().map_err(|source| StoreError::Allocation {
        name: name.clone(),
        bytes,
        source,
    })?;

    debug!("Created shared input region '{name}' ({shape}, {bytes} bytes)");
    Ok(SharedHandle::new(AlleleRegion {
        descriptor: RegionDescriptor {
            name,
            shape,
            element_width: size_of::<T>(),
        },
        map,
        marker: PhantomData,
    }))
}

// ========================================================================================
//                                   The output region
// ========================================================================================

/// A zero-filled `i32` matrix that workers write into concurrently.
pub struct DistanceRegion {
    descriptor: RegionDescriptor,
    base: NonNull<i32>,
    // Keeps the mapping alive. Only reached through `base` after construction.
    map: MmapMut,
}

// SAFETY: the region is a plain block of `i32`s. Concurrent access is limited to
// disjoint row ranges handed out by `rows_mut`, whose callers uphold exclusivity.
unsafe impl Send for DistanceRegion {}
unsafe impl Sync for DistanceRegion {}

impl DistanceRegion {
    /// Returns the mutable cells of `rows` (region-relative row indices).
    ///
    /// # Safety
    /// No other live slice obtained from this region may overlap `rows`. The
    /// dispatcher upholds this by handing each worker one range of a
    /// [`Partition`](crate::partition::Partition).
    pub unsafe fn rows_mut(&self, rows: Range<usize>) -> Result<&mut [i32], StoreError> {
        let shape = self.descriptor.shape;
        if rows.start > rows.end || rows.end > shape.rows {
            return Err(StoreError::RowsOutOfRange {
                name: self.descriptor.name.clone(),
                rows,
                available: shape.rows,
            });
        }
        let offset = rows.start * shape.cols;
        let len = rows.len() * shape.cols;
        // SAFETY: bounds were checked above; exclusivity is the caller's contract.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) })
    }

    /// Returns every cell of the region.
    ///
    /// # Safety
    /// No slice from [`Self::rows_mut`] may be alive.
    pub unsafe fn cells(&self) -> &[i32] {
        let shape = self.descriptor.shape;
        // SAFETY: the mapping holds `rows * cols` zero-initialised `i32`s.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), shape.rows * shape.cols) }
    }
}

impl Region for DistanceRegion {
    type Element = i32;

    fn descriptor(&self) -> &RegionDescriptor {
        &self.descriptor
    }
}

impl Drop for DistanceRegion {
    fn drop(&mut self) {
        debug!(
            "Unmapping shared region '{}' ({} bytes)",
            self.descriptor.name,
            self.map.len()
        );
    }
}

/// Allocates a zero-filled `rows x cols` distance region and returns its handle.
pub fn create_output(shape: MatrixShape) -> Result<OutputHandle, StoreError> {
    let name = next_region_name("dist");
    let bytes = region_bytes::<i32>(&name, shape)?;
    // Anonymous mappings are zero-filled by the kernel.
    let mut map = map_anonymous(&name, bytes)?;
    let base = NonNull::new(map.as_mut_ptr().cast::<i32>()).ok_or_else(|| {
        StoreError::Allocation {
            name: name.clone(),
            bytes,
            source: io::Error::other("mapping returned a null address"),
        }
    })?;

    debug!("Created shared output region '{name}' ({shape}, {bytes} bytes)");
    Ok(SharedHandle::new(DistanceRegion {
        descriptor: RegionDescriptor {
            name,
            shape,
            element_width: size_of::<i32>(),
        },
        base,
        map,
    }))
}

// ========================================================================================
//                            The caller-owned distance matrix
// ========================================================================================

/// The result of a computation: an `(n_samples - start) x n_samples` matrix whose
/// row `r` holds the distances of sample `start + r` to samples `0..start + r`.
///
/// The backing region is released when this value is dropped, on every path.
pub struct DistanceMatrix {
    handle: OutputHandle,
    start: usize,
}

impl DistanceMatrix {
    /// Wraps an output region once no worker can write to it any more.
    ///
    /// # Safety
    /// Every attachment that has ever handed out row slices must be dropped.
    pub(crate) unsafe fn from_finished(handle: OutputHandle, start: usize) -> Self {
        Self { handle, start }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn n_samples(&self) -> usize {
        self.handle.descriptor().shape.cols
    }

    pub fn shape(&self) -> MatrixShape {
        self.handle.descriptor().shape
    }

    pub fn name(&self) -> &str {
        &self.handle.descriptor().name
    }

    pub fn view(&self) -> ArrayView2<'_, i32> {
        let shape = self.shape();
        // SAFETY: `from_finished` guarantees no writer is alive.
        let cells = unsafe { self.handle.region.cells() };
        ArrayView2::from_shape((shape.rows, shape.cols), cells)
            .unwrap_or_else(|e| unreachable!("distance region shape is consistent: {e}"))
    }

    /// The distance of sample `i` to sample `j`, both absolute indices. Only
    /// defined for `start <= i < n_samples` and `j < i`.
    pub fn get(&self, i: usize, j: usize) -> Option<i32> {
        if i < self.start || i >= self.n_samples() || j >= i {
            return None;
        }
        Some(self.view()[[i - self.start, j]])
    }

    pub fn to_owned(&self) -> Array2<i32> {
        self.view().to_owned()
    }

    /// Releases the backing region now instead of at scope exit.
    pub fn release(self) {}
}

impl Drop for DistanceMatrix {
    fn drop(&mut self) {
        debug!("Releasing distance matrix '{}'", self.handle.descriptor().name);
    }
}
