//! The lowered convolution operation.
//!
//! [`ConvOp`] runs the whole lowering pipeline at construction: validate the
//! parameters, map the geometry to a GEMM, build the address-delta and
//! boundary-mask tables, and fix the tile configuration. Everything after
//! `new` is a read-only query: kernel text, launch plan, table images, cache
//! key. The three tables are built independently but must agree on the phase
//! geometry; a mismatch is a defect of this crate and fails fast.

use bytemuck::cast_slice;

use crate::codegen;
use crate::driver::{DeviceTables, DriverBackend, OperandBuffers};
use crate::dtype::DType;
use crate::error::Result;
use crate::launch::{self, KernelArg, LaunchPlan, TileConfig};
use crate::lut::{AddressDeltaTable, BoundaryMaskTable, DeltaMode, PhaseGeometry};
use crate::shape::{self, GemmMapping, Layouts};
use crate::spec::{ConvParams, ConvSpec, Direction};

/// Largest table image, in bytes, that the emitter places in constant
/// address space.
const CONST_BUDGET_BYTES: usize = 4096;

/// A fully lowered convolution, ready for code generation and launch.
pub struct ConvOp {
    spec: ConvSpec,
    gemm: GemmMapping,
    layouts: Layouts,
    tiles: TileConfig,
    a_deltas: AddressDeltaTable,
    b_deltas: AddressDeltaTable,
    masks: BoundaryMaskTable,
}

/// Everything that makes two lowered operations share one compiled kernel.
///
/// Totally ordered so it can key an ordered kernel cache.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    direction: Direction,
    a_dtype: DType,
    b_dtype: DType,
    nb: usize,
    nc: usize,
    nf: usize,
    input: [usize; 3],
    filter: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
    upsample: [usize; 3],
    bias: bool,
    tiles: TileConfig,
    a_cst: bool,
    b_cst: bool,
    mask_cst: bool,
    b_lut: bool,
}

impl ConvOp {
    /// Lower a convolution with heuristically chosen tiles.
    pub fn new(params: ConvParams) -> Result<Self> {
        let spec = ConvSpec::new(params)?;
        let (gemm, layouts) = shape::map(&spec)?;
        let tiles = launch::default_params(&spec, &gemm);
        Ok(Self::from_parts(spec, gemm, layouts, tiles))
    }

    /// Lower a convolution with an explicit tile configuration.
    ///
    /// The tile depth must not exceed [`crate::lut::MAX_TK`], and for Wgrad
    /// the N tile must divide the output-channel count; violations are
    /// caller defects and panic.
    pub fn with_tiles(params: ConvParams, tiles: TileConfig) -> Result<Self> {
        let spec = ConvSpec::new(params)?;
        let (gemm, layouts) = shape::map(&spec)?;
        Ok(Self::from_parts(spec, gemm, layouts, tiles))
    }

    fn from_parts(spec: ConvSpec, gemm: GemmMapping, layouts: Layouts, tiles: TileConfig) -> Self {
        assert!(tiles.tm >= 1 && tiles.tn >= 1 && tiles.split_k >= 1);
        if spec.direction() == Direction::Wgrad {
            assert!(
                spec.nf() % tiles.tn == 0,
                "wgrad N tile ({}) must divide the output-channel count ({})",
                tiles.tn,
                spec.nf()
            );
        }
        let geom = PhaseGeometry::new(tiles.tk, gemm.fs);
        // lanes of the delta tables and mask bits index the same walk; for
        // Fprop/Bprop it runs over (channel, filter tap), for Wgrad over
        // (batch, output pixel)
        let walk_dims = match spec.direction() {
            Direction::Fprop | Direction::Bprop => spec.filter(),
            Direction::Wgrad => gemm.out,
        };
        let a_deltas = AddressDeltaTable::build(geom, walk_dims, &layouts.a_walk, false);
        let b_deltas = AddressDeltaTable::build(geom, walk_dims, &layouts.b_walk, spec.flip());
        let masks = match spec.direction() {
            Direction::Fprop | Direction::Bprop => BoundaryMaskTable::build_xprop(
                geom,
                spec.filter(),
                spec.upsample(),
                spec.pad(),
            ),
            Direction::Wgrad => BoundaryMaskTable::build_wgrad(
                geom,
                gemm.out,
                spec.filter(),
                spec.stride(),
                spec.upsample(),
                spec.pad(),
                spec.input(),
            ),
        };
        // the three tables cycle over one shared phase geometry
        assert_eq!(a_deltas.geometry(), b_deltas.geometry());
        assert_eq!(a_deltas.geometry(), masks.geometry());

        ConvOp {
            spec,
            gemm,
            layouts,
            tiles,
            a_deltas,
            b_deltas,
            masks,
        }
    }

    /// The validated spec
    pub fn spec(&self) -> &ConvSpec {
        &self.spec
    }

    /// Derived GEMM dimensions
    pub fn gemm(&self) -> &GemmMapping {
        &self.gemm
    }

    /// Operand layouts and reduction-walk strides
    pub fn layouts(&self) -> &Layouts {
        &self.layouts
    }

    /// Tile configuration
    pub fn tiles(&self) -> &TileConfig {
        &self.tiles
    }

    /// Element count of operand A
    pub fn a_len(&self) -> usize {
        self.layouts.a.len()
    }

    /// Element count of operand B
    pub fn b_len(&self) -> usize {
        self.layouts.b.len()
    }

    /// Element count of the output
    pub fn c_len(&self) -> usize {
        self.layouts.c.len()
    }

    /// Output shape, padded to five axes
    pub fn c_shape(&self) -> [usize; 5] {
        self.layouts.c.shape
    }

    /// Shared phase geometry of the lookup tables
    pub fn geometry(&self) -> PhaseGeometry {
        self.a_deltas.geometry()
    }

    /// Address-delta table for operand A
    pub fn a_deltas(&self) -> &AddressDeltaTable {
        &self.a_deltas
    }

    /// Address-delta table for operand B
    pub fn b_deltas(&self) -> &AddressDeltaTable {
        &self.b_deltas
    }

    /// Boundary masks
    pub fn masks(&self) -> &BoundaryMaskTable {
        &self.masks
    }

    /// Device image of the A-delta table.
    ///
    /// In lookup mode the phase-increment region follows the deltas; the
    /// generated kernel walks both regions through the same base pointer.
    pub fn a_delta_image(&self) -> Vec<i32> {
        let mut image = self.a_deltas.as_slice().to_vec();
        if self.a_deltas.mode() == DeltaMode::Lookup {
            image.extend(self.geometry().phase_increments());
        }
        image
    }

    /// Device image of the B-delta table.
    pub fn b_delta_image(&self) -> Vec<i32> {
        self.b_deltas.as_slice().to_vec()
    }

    /// Device image of the mask table.
    pub fn mask_image(&self) -> &[u32] {
        self.masks.as_slice()
    }

    /// Whether the A-delta image fits the constant-memory budget
    pub fn is_a_deltas_cst(&self) -> bool {
        self.a_delta_image().len() * 4 <= CONST_BUDGET_BYTES
    }

    /// Whether the B-delta image fits the constant-memory budget
    pub fn is_b_deltas_cst(&self) -> bool {
        self.b_delta_image().len() * 4 <= CONST_BUDGET_BYTES
    }

    /// Whether the mask image fits the constant-memory budget
    pub fn is_mask_cst(&self) -> bool {
        self.mask_image().len() * 4 <= CONST_BUDGET_BYTES
    }

    /// Whether operand B needs phase-dependent deltas
    pub fn b_lut(&self) -> bool {
        self.b_deltas.mode() == DeltaMode::Lookup
    }

    /// Kernel source for this operation
    pub fn source(&self) -> String {
        codegen::kernel_source(self)
    }

    /// Launch plan for this operation
    pub fn launch_plan(&self) -> LaunchPlan {
        LaunchPlan::new(&self.spec, &self.gemm, &self.tiles)
    }

    /// Key under which the compiled kernel may be cached and reused
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            direction: self.spec.direction(),
            a_dtype: self.spec.a_dtype(),
            b_dtype: self.spec.b_dtype(),
            nb: self.spec.nb(),
            nc: self.spec.nc(),
            nf: self.spec.nf(),
            input: self.spec.input(),
            filter: self.spec.filter(),
            stride: self.spec.stride(),
            pad: self.spec.pad(),
            upsample: self.spec.upsample(),
            bias: self.spec.bias(),
            tiles: self.tiles,
            a_cst: self.is_a_deltas_cst(),
            b_cst: self.is_b_deltas_cst(),
            mask_cst: self.is_mask_cst(),
            b_lut: self.b_lut(),
        }
    }

    /// Multiply-accumulate work of one launch, counted as two flops each
    pub fn num_flops(&self) -> u64 {
        2 * self.gemm.m as u64 * self.gemm.n as u64 * self.gemm.k as u64
    }

    /// Materialize the lookup tables (and split-K lock scratch) on a device.
    pub fn init<D: DriverBackend>(
        &self,
        driver: &D,
    ) -> std::result::Result<DeviceTables<D>, D::Error> {
        let a = driver.alloc_readonly(cast_slice(&self.a_delta_image()))?;
        let b = driver.alloc_readonly(cast_slice(&self.b_delta_image()))?;
        let m = driver.alloc_readonly(cast_slice(self.mask_image()))?;
        let plan = self.launch_plan();
        let locks = if plan.lock_words > 0 {
            Some(driver.alloc_zeroed(plan.lock_words * 4)?)
        } else {
            None
        };
        Ok(DeviceTables {
            a_deltas: a,
            b_deltas: b,
            masks: m,
            locks,
        })
    }

    /// Bind all arguments in plan order and submit one launch.
    pub fn enqueue<D: DriverBackend>(
        &self,
        driver: &D,
        kernel: &mut D::Kernel,
        stream: &D::Stream,
        bufs: &OperandBuffers<'_, D>,
        tables: &DeviceTables<D>,
    ) -> std::result::Result<(), D::Error> {
        let plan = self.launch_plan();
        if let Some(locks) = &tables.locks {
            driver.zero_buffer(locks)?;
        }
        for (index, arg) in plan.args.iter().enumerate() {
            match arg {
                KernelArg::A => driver.bind_buffer(kernel, index, bufs.a)?,
                KernelArg::B => driver.bind_buffer(kernel, index, bufs.b)?,
                KernelArg::C => driver.bind_buffer(kernel, index, bufs.c)?,
                KernelArg::Bias => {
                    // arg list carries a bias slot only when the spec declares
                    // one; a missing buffer is a caller defect
                    let bias = bufs
                        .bias
                        .expect("spec declares a bias but no bias buffer was supplied");
                    driver.bind_buffer(kernel, index, bias)?
                }
                KernelArg::ADeltas => driver.bind_buffer(kernel, index, &tables.a_deltas)?,
                KernelArg::BDeltas => driver.bind_buffer(kernel, index, &tables.b_deltas)?,
                KernelArg::Masks => {
                    driver.bind_buffer(kernel, index, &tables.masks)?;
                }
                KernelArg::Locks => {
                    let locks = tables
                        .locks
                        .as_ref()
                        .expect("split-K plan without lock scratch");
                    driver.bind_buffer(kernel, index, locks)?
                }
                KernelArg::Scalar(_, value) => driver.bind_scalar(kernel, index, *value)?,
            }
        }
        driver.launch(kernel, plan.grid, plan.threads, stream)
    }
}
