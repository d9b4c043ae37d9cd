//! Tile selection and launch planning.
//!
//! [`TileConfig`] fixes the block tile of the implicit GEMM; [`default_params`]
//! picks one heuristically from the problem extents. [`LaunchPlan`] turns a
//! mapped operation into everything a driver needs for one submission: grid
//! geometry, thread count, lock-buffer size and the exact argument order the
//! generated kernel expects.

use crate::shape::GemmMapping;
use crate::spec::{ConvSpec, Direction};

/// Conservative upper bound on the first two grid dimensions; sizes the
/// split-K lock buffer so it can be allocated once and reused across specs.
pub const MAX_GRID: (usize, usize) = (256, 256);

/// Default reduction tile depth.
pub const DEFAULT_TK: usize = 8;

/// Reduction extent above which the planner splits K across blocks.
const SPLIT_K_THRESHOLD: usize = 4096;

/// Block-tile candidates, largest first.
const TILE_CANDIDATES: [usize; 4] = [128, 64, 32, 16];

/// Output elements computed per thread, per axis.
const THREAD_TILE: usize = 4;

/// Block tile of the implicit GEMM.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileConfig {
    /// Tile extent along GEMM M
    pub tm: usize,
    /// Tile extent along GEMM N
    pub tn: usize,
    /// Reduction tile depth
    pub tk: usize,
    /// Number of blocks the reduction is split across
    pub split_k: usize,
}

/// Heuristic tile choice for a mapped problem.
///
/// Picks the largest candidate tile that does not overhang the extent. For
/// Wgrad the N tile must additionally divide the output-channel count, so
/// that no tile straddles a filter-tap boundary and each block addresses a
/// single tap. K is split only when the reduction is deep and the tile grid
/// fits the lock-buffer bound; past that bound the reduction stays in one
/// block.
pub fn default_params(spec: &ConvSpec, gemm: &GemmMapping) -> TileConfig {
    let pick = |extent: usize| {
        TILE_CANDIDATES
            .iter()
            .copied()
            .find(|&t| t <= extent)
            .unwrap_or(TILE_CANDIDATES[TILE_CANDIDATES.len() - 1])
    };
    let tm = pick(gemm.m);
    let tn = match spec.direction() {
        Direction::Fprop | Direction::Bprop => pick(gemm.n),
        Direction::Wgrad => {
            let nf = spec.nf();
            (1..=nf.min(TILE_CANDIDATES[0]))
                .rev()
                .find(|&t| nf % t == 0)
                .unwrap_or(1)
        }
    };
    let grid_fits =
        gemm.m.div_ceil(tm) <= MAX_GRID.0 && gemm.n.div_ceil(tn) <= MAX_GRID.1;
    TileConfig {
        tm,
        tn,
        tk: DEFAULT_TK,
        split_k: if gemm.k >= SPLIT_K_THRESHOLD && grid_fits { 4 } else { 1 },
    }
}

/// One argument slot of the generated kernel, in binding order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelArg {
    /// Operand A buffer
    A,
    /// Operand B buffer
    B,
    /// Output buffer
    C,
    /// Bias buffer (present iff the spec carries a bias)
    Bias,
    /// Address-delta table for A (with the phase-increment region appended)
    ADeltas,
    /// Address-delta table for B
    BDeltas,
    /// Boundary-mask table
    Masks,
    /// Split-K lock buffer (present iff the reduction is split)
    Locks,
    /// Scalar argument with its kernel-side name
    Scalar(&'static str, i64),
}

/// Everything a driver needs to submit one launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Grid dimensions: M tiles, N tiles, split-K blocks
    pub grid: [usize; 3],
    /// Threads per block
    pub threads: usize,
    /// Grid bound the lock buffer was sized for
    pub max_grid: (usize, usize),
    /// i32 words of lock scratch required (0 when K is not split)
    pub lock_words: usize,
    /// Kernel arguments in binding order
    pub args: Vec<KernelArg>,
}

/// Scalar kernel arguments shared by the plan and the generated source,
/// in binding order.
pub(crate) fn scalar_args(spec: &ConvSpec, gemm: &GemmMapping) -> Vec<(&'static str, i64)> {
    let input = spec.input();
    vec![
        ("M", gemm.m as i64),
        ("N", gemm.n as i64),
        ("K", gemm.k as i64),
        ("AD", input[0] as i64),
        ("AH", input[1] as i64),
        ("AW", input[2] as i64),
        ("CD", gemm.out[0] as i64),
        ("CH", gemm.out[1] as i64),
        ("CW", gemm.out[2] as i64),
    ]
}

impl LaunchPlan {
    /// Build the plan for a mapped operation and tile choice.
    pub fn new(spec: &ConvSpec, gemm: &GemmMapping, tiles: &TileConfig) -> Self {
        let grid = [
            gemm.m.div_ceil(tiles.tm),
            gemm.n.div_ceil(tiles.tn),
            tiles.split_k,
        ];
        if tiles.split_k > 1 {
            // the lock buffer indexes tiles by (grid0, grid1)
            assert!(
                grid[0] <= MAX_GRID.0 && grid[1] <= MAX_GRID.1,
                "split-K grid {}x{} exceeds the lock buffer bound {}x{}",
                grid[0],
                grid[1],
                MAX_GRID.0,
                MAX_GRID.1
            );
        }
        let threads = (tiles.tm * tiles.tn / (THREAD_TILE * THREAD_TILE)).clamp(32, 1024);
        let lock_words = if tiles.split_k > 1 {
            crate::locks::lock_words(MAX_GRID)
        } else {
            0
        };

        let mut args = vec![KernelArg::A, KernelArg::B, KernelArg::C];
        if spec.bias() {
            args.push(KernelArg::Bias);
        }
        args.push(KernelArg::ADeltas);
        args.push(KernelArg::BDeltas);
        args.push(KernelArg::Masks);
        if tiles.split_k > 1 {
            args.push(KernelArg::Locks);
        }
        for (name, value) in scalar_args(spec, gemm) {
            args.push(KernelArg::Scalar(name, value));
        }

        LaunchPlan {
            grid,
            threads,
            max_grid: MAX_GRID,
            lock_words,
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;
    use crate::spec::ConvParams;

    fn mapped(params: ConvParams) -> (ConvSpec, GemmMapping) {
        let spec = ConvSpec::new(params).unwrap();
        let (gemm, _) = shape::map(&spec).unwrap();
        (spec, gemm)
    }

    #[test]
    fn test_default_tiles_shrink_to_extent() {
        let (spec, gemm) = mapped(ConvParams {
            nb: 1,
            nc: 8,
            a_extents: (1, 6, 6),
            filter: (1, 3, 3),
            nf: 20,
            pad: (0, 1, 1),
            ..ConvParams::default()
        });
        // m = 36, n = 20, k = 72
        let t = default_params(&spec, &gemm);
        assert_eq!((t.tm, t.tn, t.tk, t.split_k), (32, 16, DEFAULT_TK, 1));
    }

    #[test]
    fn test_wgrad_tile_divides_output_channels() {
        let (spec, gemm) = mapped(ConvParams {
            nb: 2,
            nc: 8,
            a_extents: (1, 9, 9),
            filter: (1, 3, 3),
            nf: 24,
            pad: (0, 1, 1),
            direction: crate::spec::Direction::Wgrad,
            ..ConvParams::default()
        });
        let t = default_params(&spec, &gemm);
        assert_eq!(t.tn, 24);
        assert_eq!(gemm.n % t.tn, 0);
    }

    #[test]
    fn test_grid_covers_output() {
        let (spec, gemm) = mapped(ConvParams {
            nb: 2,
            nc: 4,
            a_extents: (1, 19, 19),
            filter: (1, 3, 3),
            nf: 10,
            pad: (0, 1, 1),
            ..ConvParams::default()
        });
        let tiles = default_params(&spec, &gemm);
        let plan = LaunchPlan::new(&spec, &gemm, &tiles);
        // every output element falls inside some tile, with no spare tile row
        assert!(plan.grid[0] * tiles.tm >= gemm.m);
        assert!((plan.grid[0] - 1) * tiles.tm < gemm.m);
        assert!(plan.grid[1] * tiles.tn >= gemm.n);
        assert!((plan.grid[1] - 1) * tiles.tn < gemm.n);
        assert_eq!(plan.grid[2], 1);
        assert_eq!(plan.lock_words, 0);
    }

    #[test]
    fn test_split_k_plan_carries_locks() {
        let (spec, gemm) = mapped(ConvParams {
            nb: 1,
            nc: 512,
            a_extents: (1, 8, 8),
            filter: (1, 3, 3),
            nf: 32,
            pad: (0, 1, 1),
            ..ConvParams::default()
        });
        assert!(gemm.k >= 4096);
        let tiles = default_params(&spec, &gemm);
        let plan = LaunchPlan::new(&spec, &gemm, &tiles);
        assert_eq!(plan.grid[2], 4);
        assert_eq!(plan.lock_words, 2 * 256 * 256);
        assert!(plan.args.contains(&KernelArg::Locks));
    }

    #[test]
    fn test_split_k_yields_to_the_lock_bound() {
        // deep reduction, but 512 M tiles overflow the 256-tile lock bound:
        // the reduction stays in one block and planning still succeeds
        let (spec, gemm) = mapped(ConvParams {
            nb: 16,
            nc: 512,
            a_extents: (1, 64, 64),
            filter: (1, 3, 3),
            nf: 32,
            pad: (0, 1, 1),
            ..ConvParams::default()
        });
        assert!(gemm.k >= 4096);
        let tiles = default_params(&spec, &gemm);
        assert_eq!(tiles.split_k, 1);
        let plan = LaunchPlan::new(&spec, &gemm, &tiles);
        assert_eq!(plan.grid, [512, 1, 1]);
        assert_eq!(plan.lock_words, 0);
        assert!(!plan.args.contains(&KernelArg::Locks));
    }

    #[test]
    fn test_argument_order() {
        let (spec, gemm) = mapped(ConvParams {
            nb: 1,
            nc: 4,
            a_extents: (1, 8, 8),
            filter: (1, 3, 3),
            nf: 8,
            pad: (0, 1, 1),
            bias: true,
            ..ConvParams::default()
        });
        let tiles = default_params(&spec, &gemm);
        let plan = LaunchPlan::new(&spec, &gemm, &tiles);
        assert_eq!(
            &plan.args[..7],
            &[
                KernelArg::A,
                KernelArg::B,
                KernelArg::C,
                KernelArg::Bias,
                KernelArg::ADeltas,
                KernelArg::BDeltas,
                KernelArg::Masks,
            ]
        );
        assert!(matches!(plan.args[7], KernelArg::Scalar("M", _)));
    }
}
