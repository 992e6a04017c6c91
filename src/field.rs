use crate::Dims;

/// Location of a candidate patch center inside the source pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchLoc {
    pub source: u32,
    pub row: u32,
    pub col: u32,
}

impl PatchLoc {
    pub fn new(source: u32, row: u32, col: u32) -> Self {
        Self { source, row, col }
    }
}

/// One entry of the correspondence field: the best-known match for a target
/// location, plus its score.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cell {
    pub loc: PatchLoc,
    pub score: f32,
}

/// Per-location best-known matches for the interior of a target grid.
///
/// The field covers `target - 2 * halo` locations per axis; the border is
/// excluded because scoring needs a full kernel neighborhood. Entry `(b, a)`
/// describes the target location `(b + halo, a + halo)`.
#[derive(Clone)]
pub struct CorrespondenceField {
    height: usize,
    width: usize,
    halo: usize,
    cells: Vec<Cell>,
}

impl CorrespondenceField {
    pub(crate) fn new(target: Dims, halo: usize) -> Self {
        let height = target.height - 2 * halo;
        let width = target.width - 2 * halo;
        Self {
            height,
            width,
            halo,
            cells: vec![Cell::default(); height * width],
        }
    }

    /// Interior dimensions covered by the field.
    pub fn dims(&self) -> Dims {
        Dims::new(self.width, self.height)
    }

    pub(crate) fn halo(&self) -> usize {
        self.halo
    }

    /// Rebinds the field to a different halo. The interior it covers is
    /// unchanged; only the mapping back to absolute target coordinates
    /// (and hence reconstruction coverage) moves.
    pub(crate) fn with_halo(mut self, halo: usize) -> Self {
        self.halo = halo;
        self
    }

    #[inline]
    pub fn cell(&self, b: usize, a: usize) -> Cell {
        self.cells[b * self.width + a]
    }

    #[inline]
    pub(crate) fn set_cell(&mut self, b: usize, a: usize, cell: Cell) {
        self.cells[b * self.width + a] = cell;
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    /// Mean score across the whole field, the quantity driven by the
    /// convergence loop.
    pub fn mean_score(&self) -> f32 {
        let sum: f64 = self.cells.iter().map(|c| f64::from(c.score)).sum();
        (sum / self.cells.len() as f64) as f32
    }

    /// History reuse: keep, per location, whichever of the two candidates
    /// scored higher. Both fields must cover the same interior.
    pub(crate) fn merge_better(&mut self, prior: &Self) {
        debug_assert_eq!(self.cells.len(), prior.cells.len());
        for (cell, old) in self.cells.iter_mut().zip(prior.cells.iter()) {
            if old.score > cell.score {
                *cell = *old;
            }
        }
    }

    /// Seeds a finer-resolution field from this one. Row/column components
    /// are bilinearly interpolated and scaled by the resolution ratio, the
    /// source index is copied from the nearest coarse cell. Scores are left
    /// at zero: patch content differs at the new resolution, so the caller
    /// recomputes them (and clamps coordinates to the new interior bounds).
    pub(crate) fn upsample(&self, target: Dims, halo: usize) -> Self {
        let mut fine = Self::new(target, halo);
        let ratio_y = fine.height as f32 / self.height as f32;
        let ratio_x = fine.width as f32 / self.width as f32;

        for b in 0..fine.height {
            for a in 0..fine.width {
                let fy = (b as f32 / ratio_y).min((self.height - 1) as f32);
                let fx = (a as f32 / ratio_x).min((self.width - 1) as f32);
                let y0 = fy.floor() as usize;
                let x0 = fx.floor() as usize;
                let y1 = (y0 + 1).min(self.height - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let ty = fy - y0 as f32;
                let tx = fx - x0 as f32;

                let sample = |sel: &dyn Fn(PatchLoc) -> f32| -> f32 {
                    let v00 = sel(self.cell(y0, x0).loc);
                    let v01 = sel(self.cell(y0, x1).loc);
                    let v10 = sel(self.cell(y1, x0).loc);
                    let v11 = sel(self.cell(y1, x1).loc);
                    (v00 * (1.0 - tx) + v01 * tx) * (1.0 - ty)
                        + (v10 * (1.0 - tx) + v11 * tx) * ty
                };

                let row = sample(&|l: PatchLoc| l.row as f32) * ratio_y;
                let col = sample(&|l: PatchLoc| l.col as f32) * ratio_x;
                let nearest = self.cell(
                    if ty < 0.5 { y0 } else { y1 },
                    if tx < 0.5 { x0 } else { x1 },
                );

                let idx = b * fine.width + a;
                fine.cells[idx] = Cell {
                    loc: PatchLoc::new(
                        nearest.loc.source,
                        row.round().max(0.0) as u32,
                        col.round().max(0.0) as u32,
                    ),
                    score: 0.0,
                };
            }
        }
        fine
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn field_with(locs: &[(u32, u32)], width: usize, halo: usize) -> CorrespondenceField {
        let height = locs.len() / width;
        let mut field = CorrespondenceField::new(
            Dims::new(width + 2 * halo, height + 2 * halo),
            halo,
        );
        for (i, &(row, col)) in locs.iter().enumerate() {
            field.cells[i] = Cell {
                loc: PatchLoc::new(0, row, col),
                score: 0.0,
            };
        }
        field
    }

    #[test]
    fn merge_keeps_higher_scoring_candidate() {
        let mut fresh = field_with(&[(1, 1), (2, 2)], 2, 1);
        fresh.cells[0].score = 5.0;
        fresh.cells[1].score = 1.0;

        let mut prior = field_with(&[(3, 3), (4, 4)], 2, 1);
        prior.cells[0].score = 2.0;
        prior.cells[1].score = 9.0;

        fresh.merge_better(&prior);
        assert_eq!(fresh.cell(0, 0).loc, PatchLoc::new(0, 1, 1));
        assert_eq!(fresh.cell(0, 1).loc, PatchLoc::new(0, 4, 4));
        assert!((fresh.cell(0, 1).score - 9.0).abs() < f32::EPSILON);
    }

    #[test]
    fn upsample_scales_coordinates_and_clears_scores() {
        let mut coarse = field_with(&[(2, 3); 16], 4, 1);
        for cell in &mut coarse.cells {
            cell.score = 7.0;
        }

        let fine = coarse.upsample(Dims::new(10, 10), 1);
        assert_eq!(fine.dims(), Dims::new(8, 8));
        for b in 0..8 {
            for a in 0..8 {
                let cell = fine.cell(b, a);
                // constant coarse maps stay constant after interpolation
                assert_eq!(cell.loc.row, 4);
                assert_eq!(cell.loc.col, 6);
                assert_eq!(cell.score, 0.0);
            }
        }
    }

    #[test]
    fn mean_score_averages_all_cells() {
        let mut field = field_with(&[(1, 1); 4], 2, 1);
        for (i, cell) in field.cells.iter_mut().enumerate() {
            cell.score = i as f32;
        }
        assert!((field.mean_score() - 1.5).abs() < 1e-6);
    }
}
