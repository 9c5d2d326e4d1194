#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Parallel pairwise distances between cgMLST allele profiles.
//!
//! The allele matrix is copied once into shared memory, the lower triangle of the
//! distance matrix is cut into row ranges of equal comparison count, and every
//! thread of a rayon pool fills its own rows in place.

pub mod config;
pub mod dispatch;
pub mod io;
pub mod kernel;
pub mod partition;
pub mod progress;
pub mod shared;
pub mod types;

pub use dispatch::{ComputeOptions, DispatchError, compute, compute_with};
pub use shared::DistanceMatrix;
pub use types::{AlleleCall, KernelParams, Metric};
