use crate::{errors, Dims, Error};

/// A multi-channel 2-D feature array in channel-major (c, y, x) order.
///
/// Grids are produced by an external encoder; this crate only consumes them
/// for matching and produces them from reconstruction. A leading
/// "appearance" channel range participates in similarity scoring, any
/// remaining channels are semantic guidance weighted separately (see
/// [`crate::SessionBuilder::semantic_weight`]).
#[derive(Clone)]
pub struct FeatureGrid {
    data: Vec<f32>,
    channels: usize,
    height: usize,
    width: usize,
}

impl FeatureGrid {
    /// Creates a zero-filled grid.
    pub fn new(channels: usize, dims: Dims) -> Self {
        Self {
            data: vec![0.0; channels * dims.height * dims.width],
            channels,
            height: dims.height,
            width: dims.width,
        }
    }

    /// Creates a grid by evaluating `f(channel, y, x)` at every element.
    pub fn from_fn<F: FnMut(usize, usize, usize) -> f32>(
        channels: usize,
        dims: Dims,
        mut f: F,
    ) -> Self {
        let mut grid = Self::new(channels, dims);
        for c in 0..channels {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    grid.data[(c * dims.height + y) * dims.width + x] = f(c, y, x);
                }
            }
        }
        grid
    }

    /// Wraps an existing channel-major buffer, validating its length.
    pub fn from_raw(channels: usize, dims: Dims, data: Vec<f32>) -> Result<Self, Error> {
        let expected = channels * dims.height * dims.width;
        if data.len() != expected {
            return Err(Error::ShapeMismatch(errors::ShapeMismatch {
                expected: (channels, dims.height, dims.width),
                actual: (data.len(), 1, 1),
                what: "raw feature buffer",
            }));
        }
        Ok(Self {
            data,
            channels,
            height: dims.height,
            width: dims.width,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn dims(&self) -> Dims {
        Dims::new(self.width, self.height)
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
        self.data[(c * self.height + y) * self.width + x] = value;
    }

    /// One full row of a single channel, the unit the scoring loop strides over.
    #[inline]
    pub(crate) fn row(&self, c: usize, y: usize) -> &[f32] {
        let start = (c * self.height + y) * self.width;
        &self.data[start..start + self.width]
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Rescales the grid for matching: appearance channels are divided by
    /// three times their per-location L2 norm, semantic channels by their
    /// norm times `semantic_weight`. With a zero weight the semantic
    /// channels are dropped entirely so they cannot influence scoring.
    pub(crate) fn normalized(&self, appearance: usize, semantic_weight: f32) -> Self {
        let semantic = if semantic_weight > 0.0 {
            self.channels - appearance
        } else {
            0
        };
        let mut out = Self::new(appearance + semantic, self.dims());

        for y in 0..self.height {
            for x in 0..self.width {
                let mut ni = 0.0f32;
                for c in 0..appearance {
                    let v = self.get(c, y, x);
                    ni += v * v;
                }
                let ni = ni.sqrt().max(f32::EPSILON) * 3.0;
                for c in 0..appearance {
                    out.set(c, y, x, self.get(c, y, x) / ni);
                }

                if semantic > 0 {
                    let mut ns = 0.0f32;
                    for c in appearance..self.channels {
                        let v = self.get(c, y, x);
                        ns += v * v;
                    }
                    let ns = ns.sqrt().max(f32::EPSILON) * semantic_weight;
                    for c in appearance..self.channels {
                        out.set(c, y, x, self.get(c, y, x) / ns);
                    }
                }
            }
        }
        out
    }
}

/// The searchable corpus of source grids, immutable during a matching run.
pub(crate) struct SourcePool {
    grids: Vec<FeatureGrid>,
}

impl SourcePool {
    /// Validates that every grid shares a channel depth and can hold at
    /// least one full kernel neighborhood.
    pub fn new(grids: Vec<FeatureGrid>, kernel_size: usize) -> Result<Self, Error> {
        if grids.is_empty() {
            return Err(Error::NoSources);
        }

        let channels = grids[0].channels();
        for grid in &grids {
            let dims = grid.dims();
            if grid.channels() != channels || dims.height < kernel_size || dims.width < kernel_size
            {
                return Err(Error::ShapeMismatch(errors::ShapeMismatch {
                    expected: (channels, kernel_size, kernel_size),
                    actual: (grid.channels(), dims.height, dims.width),
                    what: "source grid",
                }));
            }
        }

        Ok(Self { grids })
    }

    pub fn channels(&self) -> usize {
        self.grids[0].channels()
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn grids(&self) -> &[FeatureGrid] {
        &self.grids
    }

    #[inline]
    pub fn grid(&self, source: usize) -> &FeatureGrid {
        &self.grids[source]
    }

    /// Total number of spatial locations across all grids, used to size the
    /// bias field and to compute pool statistics.
    pub fn location_count(&self) -> usize {
        self.grids
            .iter()
            .map(|g| {
                let d = g.dims();
                d.height * d.width
            })
            .sum()
    }

    pub fn map<F: Fn(&FeatureGrid) -> FeatureGrid>(&self, f: F) -> Self {
        Self {
            grids: self.grids.iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_buffer_length_is_checked() {
        assert!(FeatureGrid::from_raw(2, Dims::new(3, 3), vec![0.0; 18]).is_ok());
        assert!(FeatureGrid::from_raw(2, Dims::new(3, 3), vec![0.0; 17]).is_err());
    }

    #[test]
    fn pool_rejects_mismatched_channel_depth() {
        let a = FeatureGrid::new(2, Dims::square(4));
        let b = FeatureGrid::new(3, Dims::square(4));
        assert!(SourcePool::new(vec![a.clone()], 3).is_ok());
        assert!(SourcePool::new(vec![a, b], 3).is_err());
    }

    #[test]
    fn pool_rejects_grids_smaller_than_kernel() {
        let tiny = FeatureGrid::new(1, Dims::square(2));
        assert!(SourcePool::new(vec![tiny], 3).is_err());
    }

    #[test]
    fn zero_semantic_weight_drops_guidance_channels() {
        let grid = FeatureGrid::from_fn(4, Dims::square(3), |c, _, _| c as f32 + 1.0);
        assert_eq!(grid.normalized(2, 0.0).channels(), 2);
        assert_eq!(grid.normalized(2, 1.0).channels(), 4);
    }
}
