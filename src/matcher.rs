use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::collections::HashMap;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    errors,
    field::{Cell, CorrespondenceField, PatchLoc},
    grid::{FeatureGrid, SourcePool},
    reconstruct::reconstruct,
    session::{MatchProgress, PassUpdate},
    sliced,
    unsync::UnsyncCells,
    CancelToken, Error, MatchOutput, MatchStats,
};

#[derive(Debug)]
pub(crate) struct MatcherParams {
    /// Odd kernel width of the scored neighborhood (3 by default).
    pub(crate) kernel_size: usize,
    /// Appearance channel count of the raw grids; the rest is semantic.
    pub(crate) appearance_channels: usize,
    pub(crate) semantic_weight: f32,
    /// Variety coefficient of the diversity bias; 0 disables it.
    pub(crate) variety: f32,
    /// Mean-score improvement below which the convergence loop stops.
    pub(crate) quality: f32,
    /// Hard cap on outer iterations; exceeding it is reported as
    /// non-convergence, not an error.
    pub(crate) max_iterations: usize,
    /// Random search starts probing at radius `2^search_radius_log2` and
    /// halves it each probe.
    pub(crate) search_radius_log2: u32,
    pub(crate) seed: u64,
    pub(crate) max_thread_count: usize,
}

/// The matching engine for one resolution level.
///
/// Owns the source pool (raw content for reconstruction, a normalized copy
/// for scoring), the bias field, and the correspondence field of the
/// previous run, which seeds history reuse on the next one.
pub(crate) struct Matcher {
    raw_pool: SourcePool,
    pool: SourcePool,
    bias: Vec<Vec<f32>>,
    previous: Option<CorrespondenceField>,
    warm: Option<CorrespondenceField>,
    cached: Option<CorrespondenceField>,
    cache: bool,
    cancel: CancelToken,
    params: MatcherParams,
    run_index: u64,
}

impl Matcher {
    pub(crate) fn new(
        raw_pool: SourcePool,
        warm: Option<CorrespondenceField>,
        cache: bool,
        cancel: CancelToken,
        params: MatcherParams,
    ) -> Self {
        let pool =
            raw_pool.map(|g| g.normalized(params.appearance_channels, params.semantic_weight));
        let bias = raw_pool
            .grids()
            .iter()
            .map(|g| {
                let d = g.dims();
                vec![0.0; d.height * d.width]
            })
            .collect();

        Self {
            raw_pool,
            pool,
            bias,
            previous: None,
            warm,
            cached: None,
            cache,
            cancel,
            params,
            run_index: 0,
        }
    }

    #[inline]
    fn halo(&self) -> usize {
        self.params.kernel_size / 2
    }

    #[inline]
    fn bias_at(&self, loc: PatchLoc) -> f32 {
        let grid = self.pool.grid(loc.source as usize);
        self.bias[loc.source as usize][loc.row as usize * grid.dims().width + loc.col as usize]
    }

    /// Clamps a proposed source coordinate into the interior of its grid.
    /// Out-of-range guesses are routine when seeding across resolutions or
    /// from a field built against a different pool, so this is recovery,
    /// not an error path.
    #[inline]
    fn clamp_loc(&self, source: u32, row: i64, col: i64) -> PatchLoc {
        let source = source.min(self.pool.len() as u32 - 1);
        let dims = self.pool.grid(source as usize).dims();
        let halo = self.halo() as i64;
        PatchLoc {
            source,
            row: row.max(halo).min(dims.height as i64 - 1 - halo) as u32,
            col: col.max(halo).min(dims.width as i64 - 1 - halo) as u32,
        }
    }

    fn item_seed(&self, pass: u64, flat: usize) -> u64 {
        self.params.seed ^ (self.run_index << 48) ^ (pass << 32) ^ flat as u64
    }

    // ---------------------------------------------------------------------
    // Initialization (cold, warm from coarser level, history reuse)
    // ---------------------------------------------------------------------

    fn initialize(&mut self, current: &FeatureGrid) -> CorrespondenceField {
        let halo = self.halo();
        let target = current.dims();
        let interior = crate::Dims::new(target.width - 2 * halo, target.height - 2 * halo);

        let mut field = match self.warm.take() {
            // warm start from a coarser level is authoritative; scores are
            // recomputed because patch content differs at this resolution.
            // A matching interior may still carry a halo from a different
            // kernel size, so the field is rebound to this session's halo.
            Some(coarse) => {
                if coarse.dims() == interior {
                    coarse.with_halo(halo)
                } else {
                    coarse.upsample(target, halo)
                }
            }
            None => {
                let mut field = CorrespondenceField::new(target, halo);
                let dims = field.dims();
                let sources = self.pool.len() as u32;
                for b in 0..dims.height {
                    for a in 0..dims.width {
                        let mut rng = Pcg32::seed_from_u64(self.item_seed(0, b * dims.width + a));
                        let source = if sources > 1 {
                            rng.gen_range(0..sources)
                        } else {
                            0
                        };
                        let sd = self.pool.grid(source as usize).dims();
                        let loc = PatchLoc::new(
                            source,
                            rng.gen_range(halo as u32..(sd.height - halo) as u32),
                            rng.gen_range(halo as u32..(sd.width - halo) as u32),
                        );
                        field.set_cell(b, a, Cell { loc, score: 0.0 });
                    }
                }
                field
            }
        };

        self.score_all(current, &mut field);

        // history reuse only applies at the same resolution
        if let Some(prior) = &self.previous {
            if prior.dims() == field.dims() {
                field.merge_better(prior);
            }
        }

        field
    }

    /// Clamps and (re)scores every cell; parallel, no inter-cell dependency.
    fn score_all(&self, current: &FeatureGrid, field: &mut CorrespondenceField) {
        let dims = field.dims();
        let kernel = self.params.kernel_size;
        let pool = &self.pool;
        let cells = UnsyncCells::new(field.cells_mut());

        self.for_each_row(dims.height, |b| {
            for a in 0..dims.width {
                let idx = b * dims.width + a;
                let mut cell = cells.read_at(idx);
                cell.loc = self.clamp_loc(
                    cell.loc.source,
                    i64::from(cell.loc.row),
                    i64::from(cell.loc.col),
                );
                cell.score =
                    patch_score(current, pool.grid(cell.loc.source as usize), cell.loc, b, a, kernel);
                #[allow(unsafe_code)]
                unsafe {
                    cells.assign_at(idx, cell);
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // Propagation
    // ---------------------------------------------------------------------

    /// One raster sweep spreading good matches to their neighbors. Each
    /// location consumes a just-updated neighbor from the same sweep, so
    /// this pass is sequential by construction.
    fn propagate(&self, current: &FeatureGrid, field: &mut CorrespondenceField, pass: usize) {
        let dims = field.dims();
        let even = pass % 2 == 0;
        let d: i64 = if even { -1 } else { 1 };
        let kernel = self.params.kernel_size;

        for bi in 0..dims.height {
            let b = if even { bi } else { dims.height - 1 - bi };
            for ai in 0..dims.width {
                let a = if even { ai } else { dims.width - 1 - ai };

                for &(dr, dc) in &[(0, d), (d, 0)] {
                    let nb = (b as i64 + dr).max(0).min(dims.height as i64 - 1) as usize;
                    let na = (a as i64 + dc).max(0).min(dims.width as i64 - 1) as usize;
                    let neighbor = field.cell(nb, na);

                    // the neighbor's patch, shifted back by the same raster
                    // displacement
                    let cand = self.clamp_loc(
                        neighbor.loc.source,
                        i64::from(neighbor.loc.row) - dr,
                        i64::from(neighbor.loc.col) - dc,
                    );

                    let incumbent = field.cell(b, a);
                    let score = patch_score(
                        current,
                        self.pool.grid(cand.source as usize),
                        cand,
                        b,
                        a,
                        kernel,
                    );
                    if score + self.bias_at(cand) > incumbent.score + self.bias_at(incumbent.loc) {
                        field.set_cell(b, a, Cell { loc: cand, score });
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Random search
    // ---------------------------------------------------------------------

    /// Probes a shrinking random walk around each cell's current best match;
    /// the escape hatch for local optima that propagation cannot reach.
    /// Parallel: each location only writes its own cell.
    fn random_search(&self, current: &FeatureGrid, field: &mut CorrespondenceField, pass: usize) {
        let dims = field.dims();
        let kernel = self.params.kernel_size;
        let radius_log2 = self.params.search_radius_log2;
        let pool = &self.pool;
        let cells = UnsyncCells::new(field.cells_mut());

        self.for_each_row(dims.height, |b| {
            for a in 0..dims.width {
                let idx = b * dims.width + a;
                let mut rng = Pcg32::seed_from_u64(self.item_seed(1 + pass as u64, idx));

                let start = cells.read_at(idx);
                let source = start.loc.source;
                let mut row = i64::from(start.loc.row);
                let mut col = i64::from(start.loc.col);

                for radius in (1..=radius_log2).rev() {
                    let w = 1i64 << radius;
                    // the walk continues from the probe whether or not it
                    // was adopted
                    let probe = self.clamp_loc(
                        source,
                        row + rng.gen_range(-w..w),
                        col + rng.gen_range(-w..w),
                    );
                    row = i64::from(probe.row);
                    col = i64::from(probe.col);

                    let incumbent = cells.read_at(idx);
                    let score = patch_score(
                        current,
                        pool.grid(probe.source as usize),
                        probe,
                        b,
                        a,
                        kernel,
                    );
                    if score + self.bias_at(probe)
                        > incumbent.score + self.bias_at(incumbent.loc)
                    {
                        #[allow(unsafe_code)]
                        unsafe {
                            cells.assign_at(idx, Cell { loc: probe, score });
                        }
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // Diversity bias
    // ---------------------------------------------------------------------

    /// Gram-divergence variety term, recomputed whenever the target content
    /// changes: `sum((pix_gram - target_gram) * (pool_gram - target_gram))`
    /// per source location, scaled by the variety coefficient.
    fn compute_bias(&mut self, current: &FeatureGrid) {
        let variety = self.params.variety;
        if variety == 0.0 {
            for per_grid in &mut self.bias {
                for v in per_grid.iter_mut() {
                    *v = 0.0;
                }
            }
            return;
        }

        let channels = self.pool.channels();
        let pool_gram = pool_gram(&self.pool);
        let target_gram = grid_gram(current);

        // a = pool_gram - target_gram; bias(v) = variety * (v'av - k) with
        // k folding in the constant target-gram part
        let mut a = vec![0.0f32; channels * channels];
        let mut k = 0.0f32;
        for i in 0..channels * channels {
            a[i] = pool_gram[i] - target_gram[i];
            k += target_gram[i] * a[i];
        }

        for source in 0..self.pool.len() {
            let grid = self.pool.grid(source);
            let dims = grid.dims();
            let per_grid = &mut self.bias[source];
            let cells = UnsyncCells::new(per_grid.as_mut_slice());

            parallel_rows(self.params.max_thread_count, dims.height, |y| {
                let mut v = vec![0.0f32; channels];
                for x in 0..dims.width {
                    for (c, slot) in v.iter_mut().enumerate() {
                        *slot = grid.get(c, y, x);
                    }
                    let mut vav = 0.0f32;
                    for (p, &vp) in v.iter().enumerate() {
                        let row = &a[p * channels..(p + 1) * channels];
                        let mut acc = 0.0f32;
                        for (q, &vq) in v.iter().enumerate() {
                            acc += vq * row[q];
                        }
                        vav += vp * acc;
                    }
                    #[allow(unsafe_code)]
                    unsafe {
                        cells.assign_at(y * dims.width + x, variety * (vav - k));
                    }
                }
            });
        }
    }

    // ---------------------------------------------------------------------
    // Convergence loop & entry points
    // ---------------------------------------------------------------------

    fn check_target(&self, target: &FeatureGrid) -> Result<(), Error> {
        let kernel = self.params.kernel_size;
        let dims = target.dims();
        if target.channels() != self.raw_pool.channels()
            || dims.height < kernel
            || dims.width < kernel
        {
            return Err(Error::ShapeMismatch(errors::ShapeMismatch {
                expected: (self.raw_pool.channels(), kernel, kernel),
                actual: (target.channels(), dims.height, dims.width),
                what: "target grid",
            }));
        }
        if !target.is_finite() {
            return Err(Error::NumericDivergence(errors::NumericDivergence {
                stage: "target feature preparation",
            }));
        }
        Ok(())
    }

    /// Full PatchMatch run: initialization, then alternating propagation and
    /// random search until the mean-score improvement drops below the
    /// quality threshold, the iteration cap is hit, or the caller cancels.
    pub(crate) fn run(
        &mut self,
        target: &FeatureGrid,
        mut progress: Option<Box<dyn MatchProgress>>,
    ) -> Result<MatchOutput, Error> {
        self.check_target(target)?;
        let current = target.normalized(
            self.params.appearance_channels,
            self.params.semantic_weight,
        );

        self.compute_bias(&current);
        let mut field = self.initialize(&current);

        let mut mean = field.mean_score();
        let mut iterations = 0;
        let mut converged = false;

        for pass in 0..self.params.max_iterations {
            if self.cancel.is_cancelled() {
                break;
            }

            self.propagate(&current, &mut field, pass);
            self.random_search(&current, &mut field, pass);
            iterations = pass + 1;

            let next = field.mean_score();
            if !next.is_finite() {
                return Err(Error::NumericDivergence(errors::NumericDivergence {
                    stage: "patch matching",
                }));
            }

            if let Some(ref mut progress) = progress {
                progress.update(PassUpdate {
                    pass,
                    mean_score: next,
                    improvement: next - mean,
                });
            }

            if next - mean < self.params.quality {
                converged = true;
                break;
            }
            mean = next;
        }

        self.finish(target, field, iterations, converged)
    }

    /// Exhaustive slice-batched matching: every interior pool location is
    /// scored per target location, slice by slice to bound memory. With
    /// caching enabled the winning indices of the previous call are reused
    /// and only rescored.
    pub(crate) fn run_exhaustive(
        &mut self,
        target: &FeatureGrid,
        slice_len: usize,
    ) -> Result<MatchOutput, Error> {
        self.check_target(target)?;
        let current = target.normalized(
            self.params.appearance_channels,
            self.params.semantic_weight,
        );

        self.compute_bias(&current);

        let halo = self.halo();
        let interior = crate::Dims::new(
            current.dims().width - 2 * halo,
            current.dims().height - 2 * halo,
        );
        let field = match self.cached.take() {
            Some(mut cached) if cached.dims() == interior => {
                self.score_all(&current, &mut cached);
                cached
            }
            _ => {
                let mut field = CorrespondenceField::new(current.dims(), self.halo());
                sliced::match_exhaustive(
                    &current,
                    &self.pool,
                    &self.bias,
                    slice_len,
                    self.params.kernel_size,
                    self.params.max_thread_count,
                    &mut field,
                );
                field
            }
        };

        if !field.mean_score().is_finite() {
            return Err(Error::NumericDivergence(errors::NumericDivergence {
                stage: "patch matching",
            }));
        }
        if self.cache {
            self.cached = Some(field.clone());
        }

        self.finish(target, field, 1, true)
    }

    fn finish(
        &mut self,
        target: &FeatureGrid,
        field: CorrespondenceField,
        iterations: usize,
        converged: bool,
    ) -> Result<MatchOutput, Error> {
        let stats = self.collect_stats(&field);
        self.previous = Some(field.clone());
        self.run_index += 1;

        let output = reconstruct(&self.raw_pool, &field, target.dims(), target.channels())?;

        Ok(MatchOutput {
            mean_score: field.mean_score(),
            field,
            output,
            iterations,
            converged,
            stats,
        })
    }

    fn collect_stats(&self, field: &CorrespondenceField) -> MatchStats {
        let total = field.cells().len();
        let mut winners: HashMap<(u32, u32, u32), u32> = HashMap::new();
        for c in field.cells() {
            *winners
                .entry((c.loc.source, c.loc.row, c.loc.col))
                .or_insert(0) += 1;
        }
        let repeated = winners.values().filter(|&&n| n > 1).count();

        let changed = match &self.previous {
            Some(prev) if prev.dims() == field.dims() => {
                let same = field
                    .cells()
                    .iter()
                    .zip(prev.cells())
                    .filter(|(n, p)| n.loc == p.loc)
                    .count();
                1.0 - same as f32 / total as f32
            }
            _ => 1.0,
        };

        MatchStats {
            used: winners.len() as f32 / total as f32,
            duplicates: repeated as f32 / winners.len() as f32,
            changed,
        }
    }

    fn for_each_row<F: Fn(usize) + Sync>(&self, rows: usize, work: F) {
        parallel_rows(self.params.max_thread_count, rows, work);
    }
}

/// Similarity score of the kernel neighborhood around target location
/// `(b + halo, a + halo)` against the source neighborhood around `loc`:
/// the sum over all offsets of the per-channel products. The hot path.
#[inline]
pub(crate) fn patch_score(
    current: &FeatureGrid,
    source: &FeatureGrid,
    loc: PatchLoc,
    b: usize,
    a: usize,
    kernel: usize,
) -> f32 {
    let halo = kernel / 2;
    let top = loc.row as usize - halo;
    let left = loc.col as usize - halo;

    let mut score = 0.0f32;
    for c in 0..current.channels() {
        for ky in 0..kernel {
            let srow = &source.row(c, top + ky)[left..left + kernel];
            let trow = &current.row(c, b + ky)[a..a + kernel];
            for (s, t) in srow.iter().zip(trow) {
                score += s * t;
            }
        }
    }
    score
}

/// Second-moment (Gram) matrix of a grid, treating every spatial location
/// as a sample over the channel dimension.
pub(crate) fn grid_gram(grid: &FeatureGrid) -> Vec<f32> {
    let channels = grid.channels();
    let dims = grid.dims();
    let samples = (dims.height * dims.width) as f64;

    let mut gram = vec![0.0f64; channels * channels];
    for y in 0..dims.height {
        for x in 0..dims.width {
            for p in 0..channels {
                let vp = f64::from(grid.get(p, y, x));
                for q in p..channels {
                    gram[p * channels + q] += vp * f64::from(grid.get(q, y, x));
                }
            }
        }
    }

    let mut out = vec![0.0f32; channels * channels];
    for p in 0..channels {
        for q in p..channels {
            let v = (gram[p * channels + q] / samples) as f32;
            out[p * channels + q] = v;
            out[q * channels + p] = v;
        }
    }
    out
}

fn pool_gram(pool: &SourcePool) -> Vec<f32> {
    let channels = pool.channels();
    let total = pool.location_count() as f64;

    let mut gram = vec![0.0f64; channels * channels];
    for grid in pool.grids() {
        let dims = grid.dims();
        let weight = (dims.height * dims.width) as f64;
        for (i, v) in grid_gram(grid).iter().enumerate() {
            gram[i] += f64::from(*v) * weight;
        }
    }
    gram.iter()
        .map(|v| (*v / total) as f32)
        .collect()
}

/// Runs `work(row)` for every row, fanning out over scoped worker threads
/// pulling rows from a shared counter. Falls back to a plain loop on wasm
/// and for a single worker.
pub(crate) fn parallel_rows<F: Fn(usize) + Sync>(max_workers: usize, rows: usize, work: F) {
    #[cfg(target_arch = "wasm32")]
    {
        let _ = max_workers;
        for row in 0..rows {
            work(row);
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let n_workers = max_workers.min(rows);
        if n_workers <= 1 {
            for row in 0..rows {
                work(row);
            }
            return;
        }

        let next_row = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..n_workers {
                scope.spawn(|_| loop {
                    let row = next_row.fetch_add(1, Ordering::Relaxed);
                    if row >= rows {
                        break;
                    }
                    work(row);
                });
            }
        })
        .unwrap();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Dims;

    fn gradient(dims: Dims) -> FeatureGrid {
        FeatureGrid::from_fn(1, dims, |_, y, x| (y * dims.width + x) as f32 * 0.01)
    }

    #[test]
    fn patch_score_matches_manual_sum() {
        let grid = gradient(Dims::square(5));
        // self-score at the same center: sum of squares over the window
        let loc = PatchLoc::new(0, 2, 2);
        let mut expected = 0.0f32;
        for y in 1..4 {
            for x in 1..4 {
                let v = grid.get(0, y, x);
                expected += v * v;
            }
        }
        let got = patch_score(&grid, &grid, loc, 1, 1, 3);
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn gram_of_identity_like_grid() {
        let grid = FeatureGrid::from_fn(2, Dims::square(2), |c, _, _| if c == 0 { 1.0 } else { 2.0 });
        let gram = grid_gram(&grid);
        // E[v v'] for the constant vector (1, 2)
        assert!((gram[0] - 1.0).abs() < 1e-6);
        assert!((gram[1] - 2.0).abs() < 1e-6);
        assert!((gram[2] - 2.0).abs() < 1e-6);
        assert!((gram[3] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn parallel_rows_visits_every_row_once() {
        let hits: Vec<std::sync::atomic::AtomicUsize> =
            (0..64).map(|_| std::sync::atomic::AtomicUsize::new(0)).collect();
        parallel_rows(4, 64, |row| {
            hits[row].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        });
        assert!(hits
            .iter()
            .all(|h| h.load(std::sync::atomic::Ordering::Relaxed) == 1));
    }
}
