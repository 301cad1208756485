//! Translates neural-network layers (2D convolution, linear, max/average pooling)
//! into strided iteration programs for a fixed-function multiply-accumulate
//! accelerator, and runs pooling directly on the CPU.
//!
//! ```no_run
//! use lat_nn::{
//!     hal::frontend::EngineBuilder,
//!     loom::{
//!         device::EmulatorBuilder, loops::LoopNest, memory::{Heap, MemoryConfig},
//!         shape::ConvShape,
//!     },
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let heap = Heap::new(1 << 20);
//! let engine = EngineBuilder::new(EmulatorBuilder::new(heap.clone()).build(), heap).build();
//!
//! let shape = ConvShape::new(1, 3, 8, [32, 32], [3, 3]);
//! let input = engine.alloc_activation::<f32>(1, 3, 32, 32, MemoryConfig(0))?;
//! let weights = engine.alloc_filter::<f32>(8, 3, 3, 3, MemoryConfig(0))?;
//! let output = engine.conv2d_alloc::<f32>(&input, &weights, &shape, &LoopNest::OUTPUT_STATIONARY)?;
//! engine.free(output)?;
//! # Ok(())
//! # }
//! ```

pub mod hal;
pub mod loom;
