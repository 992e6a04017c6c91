use crate::*;

/// A patch-matching session for one resolution level.
///
/// Calling [`run`](Session::run) matches a target feature grid against the
/// session's source pool and returns the correspondence field together with
/// the reconstructed output grid. A session can be run repeatedly, once
/// per outer iteration of the caller's optimization, and reuses the
/// previous field as a warm candidate set each time, while the diversity
/// bias is recomputed against the new target.
///
/// # Example
/// ```no_run
/// # let style: patch_match::FeatureGrid = unimplemented!();
/// # let target: patch_match::FeatureGrid = unimplemented!();
/// let mut session = patch_match::Session::builder()
///     .add_source(style)
///     .variety(0.2)
///     .seed(10)
///     .build().expect("failed to build session");
///
/// let out = session.run(&target, None).expect("matching failed");
/// assert!(out.converged);
/// ```
pub struct Session {
    matcher: Matcher,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Runs the PatchMatch convergence loop against `target` and
    /// reconstructs the matched output.
    ///
    /// A non-converged run (iteration cap reached or cancelled) is not an
    /// error; the best field found so far is returned with
    /// `converged: false`.
    pub fn run(
        &mut self,
        target: &FeatureGrid,
        progress: Option<Box<dyn MatchProgress>>,
    ) -> Result<MatchOutput, Error> {
        self.matcher.run(target, progress)
    }

    /// Matches `target` by exhaustively scoring the pool in slices of
    /// `slice_len` source grids, bounding peak memory. Equivalent to the
    /// iterative search for small pools, exact for all of them.
    pub fn run_exhaustive(
        &mut self,
        target: &FeatureGrid,
        slice_len: usize,
    ) -> Result<MatchOutput, Error> {
        self.matcher.run_exhaustive(target, slice_len)
    }
}

/// Builds a session by setting parameters and adding source grids; `build`
/// checks all of the provided inputs so matching itself cannot fail on
/// malformed shapes.
#[derive(Default)]
pub struct SessionBuilder {
    sources: Vec<FeatureGrid>,
    warm_start: Option<CorrespondenceField>,
    cancel: Option<CancelToken>,
    cache: bool,
    params: Parameters,
}

impl SessionBuilder {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source grid to the searchable pool.
    pub fn add_source(mut self, source: FeatureGrid) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds several source grids to the searchable pool.
    pub fn add_sources<I: IntoIterator<Item = FeatureGrid>>(mut self, sources: I) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Number of leading channels treated as appearance (used for
    /// similarity scoring). Any remaining channels are semantic guidance.
    ///
    /// Default: all channels.
    pub fn appearance_channels(mut self, count: usize) -> Self {
        self.params.appearance_channels = Some(count);
        self
    }

    /// Relative weight of the semantic channels during normalization.
    /// Zero removes them from scoring entirely.
    ///
    /// Default: 0.0
    pub fn semantic_weight(mut self, weight: f32) -> Self {
        self.params.semantic_weight = weight;
        self
    }

    /// Bias toward statistically distinctive source patches. Zero gives
    /// pure nearest-neighbor matching.
    ///
    /// Default: 0.0
    pub fn variety(mut self, coefficient: f32) -> Self {
        self.params.variety = coefficient;
        self
    }

    /// Mean-score improvement below which the convergence loop stops.
    ///
    /// Default: 2e-3
    pub fn quality(mut self, threshold: f32) -> Self {
        self.params.quality = threshold;
        self
    }

    /// Hard cap on outer iterations, the safeguard against pathological
    /// inputs that never meet the quality threshold.
    ///
    /// Default: 50
    pub fn max_iterations(mut self, cap: usize) -> Self {
        self.params.max_iterations = cap;
        self
    }

    /// Random search probes start at radius `2^n` and halve each step.
    ///
    /// Default: 8
    pub fn search_radius_log2(mut self, n: u32) -> Self {
        self.params.search_radius_log2 = n;
        self
    }

    /// Odd width of the scored patch neighborhood.
    ///
    /// Default: 3
    pub fn kernel_size(mut self, size: usize) -> Self {
        self.params.kernel_size = size;
        self
    }

    /// Changes the deterministic seed. Runs with the same seed, inputs and
    /// parameters produce identical correspondence fields regardless of
    /// the thread count.
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Controls the maximum number of threads that will be spawned at any
    /// one time in parallel.
    ///
    /// Default: the number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Seeds the first run from a coarser resolution level's field. Row and
    /// column components are upsampled, the scores recomputed here.
    pub fn warm_start(mut self, field: CorrespondenceField) -> Self {
        self.warm_start = Some(field);
        self
    }

    /// A token the caller can trip to stop the convergence loop between
    /// iterations, bounding wall-clock time.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Reuses the winning indices of the previous exhaustive run instead of
    /// re-searching. Only affects [`Session::run_exhaustive`].
    ///
    /// Default: false
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// source grids were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let pool = SourcePool::new(self.sources, self.params.kernel_size)?;
        if pool.grids().iter().any(|g| !g.is_finite()) {
            return Err(Error::NumericDivergence(errors::NumericDivergence {
                stage: "source pool preparation",
            }));
        }

        let channels = pool.channels();
        let appearance = self.params.appearance_channels.unwrap_or(channels);
        if appearance == 0 || appearance > channels {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: channels as f32,
                value: appearance as f32,
                name: "appearance-channels",
            }));
        }

        let matcher = Matcher::new(
            pool,
            self.warm_start,
            self.cache,
            self.cancel.unwrap_or_default(),
            self.params.to_matcher_params(appearance),
        );

        Ok(Session { matcher })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.kernel_size % 2 == 0 || self.params.kernel_size < 3 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 3.0,
                max: 31.0,
                value: self.params.kernel_size as f32,
                name: "kernel-size",
            }));
        }

        if self.params.variety < 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::MAX,
                value: self.params.variety,
                name: "variety",
            }));
        }

        if self.params.semantic_weight < 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::MAX,
                value: self.params.semantic_weight,
                name: "semantic-weight",
            }));
        }

        if self.params.quality <= 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: 1.0,
                value: self.params.quality,
                name: "quality",
            }));
        }

        if self.params.max_iterations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f32::MAX,
                value: 0.0,
                name: "max-iterations",
            }));
        }

        if self.params.search_radius_log2 == 0 || self.params.search_radius_log2 > 30 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 30.0,
                value: self.params.search_radius_log2 as f32,
                name: "search-radius-log2",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// The state of one outer iteration of the convergence loop
#[derive(Clone, Copy, Debug)]
pub struct PassUpdate {
    /// Index of the completed propagation + random-search pass
    pub pass: usize,
    /// Mean score across the whole field after the pass
    pub mean_score: f32,
    /// Change in mean score relative to the previous pass
    pub improvement: f32,
}

/// Allows the matcher to update external callers with the progress of the
/// convergence loop
pub trait MatchProgress {
    fn update(&mut self, info: PassUpdate);
}

impl<G> MatchProgress for G
where
    G: FnMut(PassUpdate) + Send,
{
    fn update(&mut self, info: PassUpdate) {
        self(info)
    }
}
