//! The `loom` module provides the foundational types the layer operations are built from.
//!
//! ## Key Components
//! 1. **Numerical System**:
//!    - Element types (`f32`, `f16`, `i32`, `u8`, etc.) and their `DataType` tags.
//!    - The `Num` arithmetic shared by the accelerator datapath and CPU kernels.
//!
//! 2. **Shapes and Loop Nests**:
//!    - Convolution, linear and pooling shapes, and the windowed output-size rule.
//!    - Ordered loop nests over the seven convolution dimensions, with presets.
//!
//! 3. **Memory**:
//!    - Byte-addressed buffers on a capacity-limited `Heap`.
//!    - Tensor layouts as a base location plus signed per-axis strides.
//!
//! 4. **Execution Model**:
//!    - Iteration programs: per-level stride triples and trip counts.
//!    - The `Accelerator` submission contract, completion addressing and
//!      a software emulator of the hardware.

pub mod device;
pub mod layout;
pub mod loops;
pub mod memory;
pub mod num;
pub mod program;
pub mod shape;
