#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::explicit_into_iter_loop,
    clippy::filter_map_next,
    clippy::fn_params_excessive_bools,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::mem_forget,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::ptr_as_ptr,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add,
    clippy::todo,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::verbose_file_reads,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
#![allow(unsafe_code)]

//! `patch-match` is a light API for approximate nearest-neighbor patch
//! matching over multi-channel feature grids, the correspondence engine of
//! analogy-based image synthesis pipelines.
//!
//! Given a target [`FeatureGrid`] and a pool of source grids, typically
//! intermediate activations of an external encoder, a [`Session`] finds
//! for every target location the best-scoring source patch under a local
//! similarity metric with an optional diversity bias, then reconstructs a
//! dense output grid by averaging the overlapping matched patches.
//!
//! The search is the PatchMatch family: randomized initialization, raster
//! propagation sweeps that spread good matches to neighbors, and shrinking
//! random probes that escape local optima, iterated until the mean score
//! stops improving. Fields seed across resolution levels (coarse runs make
//! fine runs cheap) and across repeated runs at the same resolution.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` validates the source pool and all
//! parameters. `Session` has a `run()` method that performs the matching
//! and returns a [`MatchOutput`].
//!
//! ## Usage
//! ```no_run
//! # let style: patch_match::FeatureGrid = unimplemented!();
//! # let target: patch_match::FeatureGrid = unimplemented!();
//! let mut session = patch_match::Session::builder()
//!     .add_source(style)
//!     .variety(0.1)
//!     .quality(2e-3)
//!     .seed(0)
//!     .build().expect("failed to build session");
//!
//! let out = session.run(&target, None).expect("matching failed");
//! println!("mean score {} after {} passes", out.mean_score, out.iterations);
//! ```
mod errors;
mod field;
mod grid;
mod matcher;
use matcher::*;
mod reconstruct;
pub mod session;
mod sliced;
mod unsync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use errors::Error;
pub use field::{Cell, CorrespondenceField, PatchLoc};
pub use grid::FeatureGrid;
pub use session::{MatchProgress, PassUpdate, Session, SessionBuilder};
pub(crate) use grid::SourcePool;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: usize,
    pub height: usize,
}

impl Dims {
    pub fn square(size: usize) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

pub(crate) struct Parameters {
    appearance_channels: Option<usize>,
    semantic_weight: f32,
    variety: f32,
    quality: f32,
    max_iterations: usize,
    search_radius_log2: u32,
    kernel_size: usize,
    seed: u64,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            appearance_channels: None,
            semantic_weight: 0.0,
            variety: 0.0,
            quality: 2e-3,
            max_iterations: 50,
            search_radius_log2: 8,
            kernel_size: 3,
            seed: 0,
            max_thread_count: None,
        }
    }
}

impl Parameters {
    fn to_matcher_params(&self, appearance: usize) -> MatcherParams {
        MatcherParams {
            kernel_size: self.kernel_size,
            appearance_channels: appearance,
            semantic_weight: self.semantic_weight,
            variety: self.variety,
            quality: self.quality,
            max_iterations: self.max_iterations,
            search_radius_log2: self.search_radius_log2,
            seed: self.seed,
            max_thread_count: self.max_thread_count.unwrap_or_else(num_cpus::get),
        }
    }
}

/// Usage statistics of a finished match
#[derive(Clone, Copy, Debug)]
pub struct MatchStats {
    /// Fraction of distinct source patches among all winners
    pub used: f32,
    /// Fraction of the distinct winners that were chosen by more than one
    /// target location
    pub duplicates: f32,
    /// Fraction of locations whose winner changed since the previous run
    /// (1.0 on the first run)
    pub changed: f32,
}

/// The result of a `Session::run()`
pub struct MatchOutput {
    /// Final best-known match per interior target location
    pub field: CorrespondenceField,
    /// Matched patches merged back into a grid of the target's shape
    pub output: FeatureGrid,
    /// Mean score across the field when the loop stopped
    pub mean_score: f32,
    /// Number of propagation + random-search passes executed
    pub iterations: usize,
    /// False when the iteration cap was hit or the run was cancelled
    /// before the quality threshold was met
    pub converged: bool,
    pub stats: MatchStats,
}

/// Cooperative cancellation for the convergence loop, checked between
/// outer iterations.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the loop to stop after the current iteration.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
