//! Slice-batched exhaustive matching for source pools too large to score
//! in one pass. Splitting must not change results, only memory footprint.

use std::ops::Range;

use crate::{
    field::{Cell, CorrespondenceField, PatchLoc},
    grid::{FeatureGrid, SourcePool},
    matcher::{parallel_rows, patch_score},
    unsync::UnsyncCells,
};

/// Finite, restartable iterator over fixed-size slices of the pool,
/// yielding the covered source index range alongside the grids.
pub(crate) struct SliceIter<'a> {
    grids: &'a [FeatureGrid],
    slice_len: usize,
    next: usize,
}

impl<'a> SliceIter<'a> {
    pub fn new(pool: &'a SourcePool, slice_len: usize) -> Self {
        Self {
            grids: pool.grids(),
            slice_len: slice_len.max(1),
            next: 0,
        }
    }
}

impl<'a> Iterator for SliceIter<'a> {
    type Item = (Range<usize>, &'a [FeatureGrid]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.grids.len() {
            return None;
        }
        let start = self.next;
        let end = (start + self.slice_len).min(self.grids.len());
        self.next = end;
        Some((start..end, &self.grids[start..end]))
    }
}

/// Scores every interior pool location against every target location,
/// slice by slice, retaining the running best match per location.
///
/// The history buffer carries the largest correlation magnitude seen across
/// the slices processed so far and scales the variety bias, so that a bias
/// computed once stays comparable no matter how the pool was partitioned.
/// Scoring within a slice is parallel over target rows; the history update
/// is sequential across slices because each slice reads the previous
/// running maximum.
pub(crate) fn match_exhaustive(
    current: &FeatureGrid,
    pool: &SourcePool,
    bias: &[Vec<f32>],
    slice_len: usize,
    kernel: usize,
    max_workers: usize,
    field: &mut CorrespondenceField,
) {
    let halo = kernel / 2;
    let dims = field.dims();
    let total = dims.height * dims.width;

    let mut history = vec![1.0f32; total];
    let mut adjusted_best = vec![f32::NEG_INFINITY; total];
    let mut slice_peak = vec![0.0f32; total];

    let cells = UnsyncCells::new(field.cells_mut());

    for (range, grids) in SliceIter::new(pool, slice_len) {
        for peak in slice_peak.iter_mut() {
            *peak = 0.0;
        }

        let best = UnsyncCells::new(adjusted_best.as_mut_slice());
        let peaks = UnsyncCells::new(slice_peak.as_mut_slice());
        let history_ref = &history;

        parallel_rows(max_workers, dims.height, |b| {
            for a in 0..dims.width {
                let idx = b * dims.width + a;
                let scale = history_ref[idx];
                let mut winner = cells.read_at(idx);
                let mut winning = best.read_at(idx);
                let mut peak = 0.0f32;

                for (offset, grid) in grids.iter().enumerate() {
                    let source = (range.start + offset) as u32;
                    let gd = grid.dims();
                    let per_grid = &bias[source as usize];

                    for row in halo..gd.height - halo {
                        for col in halo..gd.width - halo {
                            let loc = PatchLoc::new(source, row as u32, col as u32);
                            let raw = patch_score(current, grid, loc, b, a, kernel);
                            peak = peak.max(raw.abs());

                            let adjusted = raw + per_grid[row * gd.width + col] * scale;
                            if adjusted > winning {
                                winning = adjusted;
                                winner = Cell { loc, score: raw };
                            }
                        }
                    }
                }

                #[allow(unsafe_code)]
                unsafe {
                    cells.assign_at(idx, winner);
                    best.assign_at(idx, winning);
                    peaks.assign_at(idx, peak);
                }
            }
        });

        for (h, peak) in history.iter_mut().zip(slice_peak.iter()) {
            *h = h.max(*peak);
        }
    }
}
