use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) expected: (usize, usize, usize),
    pub(crate) actual: (usize, usize, usize),
    pub(crate) what: &'static str,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {}x{}x{} but {}x{}x{} is required",
            self.what,
            self.actual.0,
            self.actual.1,
            self.actual.2,
            self.expected.0,
            self.expected.1,
            self.expected.2,
        )
    }
}

#[derive(Debug)]
pub struct NumericDivergence {
    pub(crate) stage: &'static str,
}

impl fmt::Display for NumericDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "non-finite values encountered during {}; the input features are corrupt",
            self.stage
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// Target and source grids have incompatible channel depths or spatial
    /// extents, detected before any search pass begins
    ShapeMismatch(ShapeMismatch),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// Scores or reconstructed output contained NaN/infinity, usually
    /// propagated from corrupt upstream features
    NumericDivergence(NumericDivergence),
    /// There are no source grids to match against
    NoSources,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::NumericDivergence(nd) => write!(f, "{}", nd),
            Self::NoSources => write!(
                f,
                "at least 1 source grid must be available as a matching corpus"
            ),
        }
    }
}
