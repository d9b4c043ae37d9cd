//! convlower: lowering of dense convolutions onto implicit-GEMM GPU kernels.
//!
//! Given a convolution description ([`spec::ConvParams`]), this crate derives
//! everything a driver needs to run it as a tiled matrix multiplication that
//! never materializes the im2col matrix:
//!
//! - [`shape`] maps the convolution geometry to GEMM dimensions and packed
//!   operand layouts,
//! - [`lut`] precomputes the address-delta and boundary-mask tables the
//!   kernel walks instead of doing per-element index arithmetic,
//! - the code generator renders the kernel source for one lowered operation,
//! - [`launch`] picks tiles and lays out the argument binding order,
//! - [`locks`] models the split-K accumulation protocol,
//! - [`reference`] evaluates the same convolution on the host for
//!   verification.
//!
//! [`op::ConvOp`] runs the whole pipeline and is the usual entry point:
//!
//! ```
//! use convlower::op::ConvOp;
//! use convlower::spec::ConvParams;
//!
//! let op = ConvOp::new(ConvParams {
//!     nb: 1,
//!     nc: 4,
//!     a_extents: (1, 8, 8),
//!     filter: (1, 3, 3),
//!     nf: 8,
//!     pad: (0, 1, 1),
//!     ..ConvParams::default()
//! })?;
//! let source = op.source();
//! let plan = op.launch_plan();
//! assert_eq!(plan.grid[2], 1);
//! # Ok::<(), convlower::error::Error>(())
//! ```
//!
//! All user-facing validation happens at construction and surfaces as
//! [`error::Error`]; internal table inconsistencies are treated as defects
//! and fail fast.

pub mod driver;
pub mod dtype;
pub mod error;
pub mod launch;
pub mod locks;
pub mod lut;
pub mod op;
pub mod reference;
pub mod shape;
pub mod spec;

mod codegen;

pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use launch::{KernelArg, LaunchPlan, TileConfig};
pub use op::{CacheKey, ConvOp};
pub use spec::{ConvParams, ConvSpec, Direction};
