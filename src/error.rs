//! Error types for convlower

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using convlower's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating a convolution description.
///
/// Every variant is a configuration error: it is detected at construction,
/// before any device resource is touched, and is never silently clamped.
/// Internal table-consistency violations are defects of this crate, not user
/// errors, and fail fast via assertions instead of surfacing here.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter that must be at least one is zero
    #[error("invalid parameter '{name}': got {value}, must be >= 1")]
    InvalidParameter {
        /// The parameter name
        name: &'static str,
        /// The rejected value
        value: usize,
    },

    /// Operand element types cannot be combined
    #[error("unsupported operand dtype pairing: {a} x {b}")]
    UnsupportedDTypePair {
        /// Element type of operand A
        a: DType,
        /// Element type of operand B
        b: DType,
    },

    /// A derived output extent is non-positive
    #[error(
        "empty output on axis {axis}: input={input}, filter={filter}, \
         stride={stride}, pad={pad}, upsample={upsample}"
    )]
    EmptyOutput {
        /// Spatial axis name ("d", "h" or "w")
        axis: &'static str,
        /// Input extent on that axis
        input: usize,
        /// Filter extent on that axis
        filter: usize,
        /// Stride on that axis
        stride: usize,
        /// Padding on that axis
        pad: usize,
        /// Upsample (filter dilation) factor on that axis
        upsample: usize,
    },

    /// The dilated filter footprint does not fit inside the input volume
    #[error("dilated filter footprint ({footprint}) exceeds input extent ({input}) on axis {axis}")]
    FilterExceedsInput {
        /// Spatial axis name ("d", "h" or "w")
        axis: &'static str,
        /// Dilated filter footprint on that axis
        footprint: usize,
        /// Input extent on that axis
        input: usize,
    },
}
