//! Consumed driver-layer interface.
//!
//! The lowering core never talks to a GPU directly. It describes buffers,
//! argument order and grid geometry, and hands them to an implementation of
//! [`DriverBackend`] supplied by the embedding runtime. Driver failures
//! (allocation, compilation, launch) propagate unchanged through
//! `DriverBackend::Error`; this core performs no retries because all of its
//! own work is deterministic host-side computation.

/// Minimal device interface the lowering core depends on.
pub trait DriverBackend {
    /// Opaque device buffer handle
    type Buffer;
    /// Opaque kernel object with bindable arguments
    type Kernel;
    /// Submission stream
    type Stream;
    /// Driver-level failure
    type Error: std::error::Error;

    /// Allocate a read-only (constant) buffer and copy host data into it
    /// verbatim.
    fn alloc_readonly(&self, bytes: &[u8]) -> Result<Self::Buffer, Self::Error>;

    /// Allocate a zero-initialized scratch buffer.
    fn alloc_zeroed(&self, bytes: usize) -> Result<Self::Buffer, Self::Error>;

    /// Reset a scratch buffer to zero.
    fn zero_buffer(&self, buffer: &Self::Buffer) -> Result<(), Self::Error>;

    /// Bind a buffer argument at a fixed position.
    fn bind_buffer(
        &self,
        kernel: &mut Self::Kernel,
        index: usize,
        buffer: &Self::Buffer,
    ) -> Result<(), Self::Error>;

    /// Bind a scalar argument at a fixed position.
    fn bind_scalar(
        &self,
        kernel: &mut Self::Kernel,
        index: usize,
        value: i64,
    ) -> Result<(), Self::Error>;

    /// Launch a kernel over a 3D grid on a stream.
    fn launch(
        &self,
        kernel: &Self::Kernel,
        grid: [usize; 3],
        threads: usize,
        stream: &Self::Stream,
    ) -> Result<(), Self::Error>;
}

/// Device mirrors of the host-side lookup tables, plus the split-K lock
/// scratch when the plan needs one.
///
/// The operation owns these; operand buffers stay with the caller.
pub struct DeviceTables<D: DriverBackend> {
    /// Address deltas for operand A
    pub a_deltas: D::Buffer,
    /// Address deltas for operand B
    pub b_deltas: D::Buffer,
    /// Boundary masks
    pub masks: D::Buffer,
    /// Per-output-tile lock/counter words (split-K only)
    pub locks: Option<D::Buffer>,
}

/// Borrowed operand buffers for one enqueue.
pub struct OperandBuffers<'a, D: DriverBackend> {
    /// Operand A
    pub a: &'a D::Buffer,
    /// Operand B
    pub b: &'a D::Buffer,
    /// Output C
    pub c: &'a D::Buffer,
    /// Optional bias, length = output channels
    pub bias: Option<&'a D::Buffer>,
}
