//! Layer-level entry points.
//!
//! Convolution and linear layers are compiled into iteration programs and
//! dispatched to the accelerator; every call blocks until the accelerator signals
//! completion. Pooling has no accelerator path and runs on the CPU.
//!
//! The `*_alloc` variants allocate a dense output in the input's memory region.
//! Outputs of accelerated layers are zeroed first, since the accelerator
//! accumulates into whatever the output holds. The caller owns the returned
//! layout and releases it with [`Engine::free`].

use thiserror::Error;

use super::{
    compile::{CompileError, Operands, compile, compile_linear},
    cpu::pool::{self, PoolError},
};
use crate::loom::{
    device::{Accelerator, CoreId, DispatchError, Pending, submit},
    layout::{ActivationLayout, FilterLayout, LayoutError, dense_strides},
    loops::LoopNest,
    memory::{Heap, MemoryConfig, MemoryError, MemoryLocation, WORD_SIZE},
    num::{Num, Scalar},
    program::IterationProgram,
    shape::{ConvShape, LinearShape, PoolShape, ShapeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("layer error: {0}")]
    Compile(#[from] CompileError),
    #[error("layer error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("layer error: {0}")]
    Memory(#[from] MemoryError),
    #[error("layer error: {0}")]
    Shape(#[from] ShapeError),
    #[error("layer error: {0}")]
    Pool(#[from] PoolError),
    #[error("layer error: {0} is not implemented")]
    Unimplemented(&'static str),
}

/// Runs layers on behalf of one core.
#[derive(Debug, Clone)]
pub struct Engine<A> {
    accelerator: A,
    heap: Heap,
    core: CoreId,
    advisories: bool,
}

#[derive(Debug, Clone)]
pub struct EngineBuilder<A> {
    pub accelerator: A,
    pub heap: Heap,
    pub core: CoreId,
    pub advisories: bool,
}

impl<A: Accelerator> EngineBuilder<A> {
    pub fn new(accelerator: A, heap: Heap) -> Self {
        Self {
            accelerator,
            heap,
            core: CoreId::default(),
            advisories: true,
        }
    }

    /// The core issuing work. Completions are addressed to it.
    pub fn core(mut self, core: impl Into<CoreId>) -> Self {
        self.core = core.into();
        self
    }

    /// Whether to log a performance warning whenever a layer falls back to the CPU.
    pub fn advisories(mut self, advisories: bool) -> Self {
        self.advisories = advisories;
        self
    }

    pub fn build(self) -> Engine<A> {
        let Self {
            accelerator,
            heap,
            core,
            advisories,
        } = self;
        Engine {
            accelerator,
            heap,
            core,
            advisories,
        }
    }
}

impl<A: Accelerator> Engine<A> {
    #[inline]
    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    fn advise(&self, message: &str) {
        if self.advisories {
            log::warn!("{message}");
        }
    }

    fn check_groups(&self, groups: u32) -> Result<(), LayerError> {
        if groups <= 1 {
            return Ok(());
        }
        if cfg!(feature = "strict") {
            return Err(LayerError::Unimplemented("grouped convolution"));
        }
        log::warn!("grouped convolution is not implemented; computing {groups} groups as one");
        Ok(())
    }

    /// Hands a compiled program to the accelerator without waiting for it.
    #[inline]
    pub fn submit(&self, program: IterationProgram) -> Result<Pending, DispatchError> {
        submit(&self.accelerator, self.core, program)
    }

    /// Accumulates the convolution of `input` with `weights` into `output`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn conv2d<T: Scalar>(
        &self,
        input: &ActivationLayout,
        weights: &FilterLayout,
        output: &ActivationLayout,
        shape: &ConvShape,
        nest: &LoopNest,
    ) -> Result<(), LayerError> {
        self.check_groups(shape.groups)?;
        let operands = Operands::new(input, weights, output);
        let program = compile::<T>(operands, shape, nest)?;
        self.submit(program)?.wait()?;
        Ok(())
    }

    /// Accumulates `weights × input` into `output` for every batch element.
    ///
    /// Inputs and outputs are laid out along the channel axis.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn linear<T: Scalar>(
        &self,
        input: &ActivationLayout,
        weights: &FilterLayout,
        output: &ActivationLayout,
        shape: &LinearShape,
        nest: &LoopNest,
    ) -> Result<(), LayerError> {
        let operands = Operands::new(input, weights, output);
        let program = compile_linear::<T>(operands, shape, nest)?;
        self.submit(program)?.wait()?;
        Ok(())
    }

    pub fn max_pool_2d<T: Num>(
        &self,
        input: &ActivationLayout,
        output: &ActivationLayout,
        shape: &PoolShape,
    ) -> Result<(), LayerError> {
        self.advise("max pooling is not accelerated; running on the CPU");
        pool::max_pool_2d::<T>(&self.heap, input, output, shape)?;
        Ok(())
    }

    pub fn avg_pool_2d<T: Num>(
        &self,
        input: &ActivationLayout,
        output: &ActivationLayout,
        shape: &PoolShape,
    ) -> Result<(), LayerError> {
        self.advise(
            "average pooling is not accelerated; running on the CPU with a division per window",
        );
        pool::avg_pool_2d::<T>(&self.heap, input, output, shape)?;
        Ok(())
    }

    /// The error reported when a tensor is too large to even be sized.
    fn overflow(&self) -> MemoryError {
        MemoryError::OutOfMemory {
            requested: usize::MAX,
            available: self.heap.available(),
        }
    }

    /// Allocates `bytes` and lays a tensor out over them, releasing the buffer if that fails.
    fn alloc_dense<L>(
        &self,
        bytes: Option<usize>,
        config: MemoryConfig,
        layout: impl FnOnce(MemoryLocation) -> Result<L, LayoutError>,
    ) -> Result<L, MemoryError> {
        let bytes = bytes.ok_or_else(|| self.overflow())?;
        let data = self.heap.alloc(bytes, config)?;
        match layout(data) {
            Ok(layout) => Ok(layout),
            Err(_) => {
                self.heap.free(data)?;
                Err(self.overflow())
            }
        }
    }

    /// Allocates a dense activation tensor. Contents are uninitialised.
    pub fn alloc_activation<T: Scalar>(
        &self,
        batch_size: u32,
        channels: u32,
        height: u32,
        width: u32,
        config: MemoryConfig,
    ) -> Result<ActivationLayout, MemoryError> {
        let bytes = dense_bytes::<T, 4>([width, height, channels, batch_size]);
        self.alloc_dense(bytes, config, |data| {
            ActivationLayout::dense::<T>(data, channels, height, width)
        })
    }

    /// Allocates a dense activation tensor filled with zeros.
    pub fn alloc_activation_zeroed<T: Scalar>(
        &self,
        batch_size: u32,
        channels: u32,
        height: u32,
        width: u32,
        config: MemoryConfig,
    ) -> Result<ActivationLayout, MemoryError> {
        let layout = self.alloc_activation::<T>(batch_size, channels, height, width, config)?;
        let cleared = self.heap.buffer(layout.data.buffer).and_then(|buffer| {
            self.heap
                .clear_words(layout.data, buffer.len() / WORD_SIZE, config)
        });
        if let Err(err) = cleared {
            self.heap.free(layout.data)?;
            return Err(err);
        }
        Ok(layout)
    }

    /// Allocates dense convolution weights. Contents are uninitialised.
    pub fn alloc_filter<T: Scalar>(
        &self,
        out_channels: u32,
        in_channels: u32,
        height: u32,
        width: u32,
        config: MemoryConfig,
    ) -> Result<FilterLayout, MemoryError> {
        let bytes = dense_bytes::<T, 4>([width, height, in_channels, out_channels]);
        self.alloc_dense(bytes, config, |data| {
            FilterLayout::dense::<T>(data, out_channels, in_channels, height, width)
        })
    }

    /// Returns a tensor's buffer to the heap.
    pub fn free(&self, layout: impl Into<MemoryLocation>) -> Result<(), MemoryError> {
        self.heap.free(layout.into())
    }

    /// Runs `f` on a freshly allocated `output`, releasing it again if `f` fails.
    fn with_output(
        &self,
        output: ActivationLayout,
        f: impl FnOnce(&ActivationLayout) -> Result<(), LayerError>,
    ) -> Result<ActivationLayout, LayerError> {
        match f(&output) {
            Ok(()) => Ok(output),
            Err(err) => {
                self.heap.free(output.data)?;
                Err(err)
            }
        }
    }

    /// Convolves into a newly allocated, dense output.
    pub fn conv2d_alloc<T: Scalar>(
        &self,
        input: &ActivationLayout,
        weights: &FilterLayout,
        shape: &ConvShape,
        nest: &LoopNest,
    ) -> Result<ActivationLayout, LayerError> {
        shape.validate()?;
        self.check_groups(shape.groups)?;
        let output = self.alloc_activation_zeroed::<T>(
            shape.batch_size,
            shape.out_channels,
            shape.output_height(),
            shape.output_width(),
            input.data.config,
        )?;
        self.with_output(output, |output| {
            self.conv2d::<T>(input, weights, output, shape, nest)
        })
    }

    /// Runs a linear layer into a newly allocated, dense output of `[batch, outputs, 1, 1]`.
    pub fn linear_alloc<T: Scalar>(
        &self,
        input: &ActivationLayout,
        weights: &FilterLayout,
        shape: &LinearShape,
        nest: &LoopNest,
    ) -> Result<ActivationLayout, LayerError> {
        let output = self.alloc_activation_zeroed::<T>(
            shape.batch_size,
            shape.outputs,
            1,
            1,
            input.data.config,
        )?;
        self.with_output(output, |output| {
            self.linear::<T>(input, weights, output, shape, nest)
        })
    }

    fn pool_output<T: Scalar>(
        &self,
        input: &ActivationLayout,
        shape: &PoolShape,
    ) -> Result<ActivationLayout, LayerError> {
        shape.validate()?;
        let output = self.alloc_activation::<T>(
            shape.batch_size,
            shape.channels,
            shape.output_height(),
            shape.output_width(),
            input.data.config,
        )?;
        Ok(output)
    }

    pub fn max_pool_2d_alloc<T: Num>(
        &self,
        input: &ActivationLayout,
        shape: &PoolShape,
    ) -> Result<ActivationLayout, LayerError> {
        let output = self.pool_output::<T>(input, shape)?;
        self.with_output(output, |output| {
            self.max_pool_2d::<T>(input, output, shape)
        })
    }

    pub fn avg_pool_2d_alloc<T: Num>(
        &self,
        input: &ActivationLayout,
        shape: &PoolShape,
    ) -> Result<ActivationLayout, LayerError> {
        let output = self.pool_output::<T>(input, shape)?;
        self.with_output(output, |output| {
            self.avg_pool_2d::<T>(input, output, shape)
        })
    }
}

/// Bytes of a dense tensor over `extents`, or `None` if that does not fit in memory.
fn dense_bytes<T: Scalar, const N: usize>(extents: [u32; N]) -> Option<usize> {
    let (_, block) = dense_strides(size_of::<T>(), extents).ok()?;
    usize::try_from(block).ok()
}
