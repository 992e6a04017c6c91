//! Overlap-average reconstruction of a dense output grid from the final
//! correspondence field.

use crate::{
    errors,
    field::CorrespondenceField,
    grid::{FeatureGrid, SourcePool},
    Dims, Error,
};

/// Gathers the full source patch behind every matched location (halo
/// included, so adjacent patches overlap) and averages all contributions
/// landing on each output element. The redundancy smooths out seams a
/// center-pixel-only copy would leave behind.
pub(crate) fn reconstruct(
    pool: &SourcePool,
    field: &CorrespondenceField,
    target: Dims,
    channels: usize,
) -> Result<FeatureGrid, Error> {
    let halo = field.halo();
    let kernel = 2 * halo + 1;
    let dims = field.dims();

    let mut output = FeatureGrid::new(channels, target);
    let mut counts = vec![0u32; target.height * target.width];

    for b in 0..dims.height {
        for a in 0..dims.width {
            let cell = field.cell(b, a);
            let grid = pool.grid(cell.loc.source as usize);
            let top = cell.loc.row as usize - halo;
            let left = cell.loc.col as usize - halo;

            for ky in 0..kernel {
                for kx in 0..kernel {
                    counts[(b + ky) * target.width + (a + kx)] += 1;
                    for c in 0..channels {
                        let v = output.get(c, b + ky, a + kx) + grid.get(c, top + ky, left + kx);
                        output.set(c, b + ky, a + kx, v);
                    }
                }
            }
        }
    }

    for y in 0..target.height {
        for x in 0..target.width {
            let count = counts[y * target.width + x];
            debug_assert!(count > 0, "every output element receives a contribution");
            let scale = 1.0 / count as f32;
            for c in 0..channels {
                output.set(c, y, x, output.get(c, y, x) * scale);
            }
        }
    }

    if !output.is_finite() {
        return Err(Error::NumericDivergence(errors::NumericDivergence {
            stage: "patch reconstruction",
        }));
    }

    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::field::{Cell, PatchLoc};

    #[test]
    fn identity_field_reproduces_the_source() {
        let dims = Dims::square(6);
        let source = FeatureGrid::from_fn(2, dims, |c, y, x| (c * 100 + y * 10 + x) as f32);
        let pool = SourcePool::new(vec![source.clone()], 3).unwrap();

        let mut field = CorrespondenceField::new(dims, 1);
        let interior = field.dims();
        for b in 0..interior.height {
            for a in 0..interior.width {
                field.set_cell(
                    b,
                    a,
                    Cell {
                        loc: PatchLoc::new(0, b as u32 + 1, a as u32 + 1),
                        score: 0.0,
                    },
                );
            }
        }

        let output = reconstruct(&pool, &field, dims, 2).unwrap();
        for c in 0..2 {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    assert!(
                        (output.get(c, y, x) - source.get(c, y, x)).abs() < 1e-4,
                        "mismatch at ({}, {}, {})",
                        c,
                        y,
                        x
                    );
                }
            }
        }
    }

    #[test]
    fn constant_field_covers_every_element() {
        let dims = Dims::new(7, 5);
        let source = FeatureGrid::from_fn(1, Dims::square(8), |_, _, _| 3.0);
        let pool = SourcePool::new(vec![source], 3).unwrap();

        let mut field = CorrespondenceField::new(dims, 1);
        let interior = field.dims();
        for b in 0..interior.height {
            for a in 0..interior.width {
                field.set_cell(
                    b,
                    a,
                    Cell {
                        loc: PatchLoc::new(0, 4, 4),
                        score: 0.0,
                    },
                );
            }
        }

        let output = reconstruct(&pool, &field, dims, 1).unwrap();
        for y in 0..dims.height {
            for x in 0..dims.width {
                assert!((output.get(0, y, x) - 3.0).abs() < 1e-6);
            }
        }
    }
}
