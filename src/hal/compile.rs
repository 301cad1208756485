//! Compiles a convolution's shape and a loop nest into an [`IterationProgram`].
//!
//! Each loop tag maps to one level whose strides and trip count depend only on
//! the tag, never on its position in the nest. Any permutation of the nest
//! therefore computes the same result; only the data reuse pattern changes.
//!
//! | Loop           | input                 | weights         | output         | count             |
//! |----------------|-----------------------|-----------------|----------------|-------------------|
//! | `Batch`        | batch                 | 0               | batch          | batch size        |
//! | `InChannels`   | channel               | in channel      | 0              | in channels       |
//! | `OutChannels`  | 0                     | out channel     | channel        | out channels      |
//! | `ImageWidth`   | column × stride       | 0               | column         | output width      |
//! | `ImageHeight`  | row × stride          | 0               | row            | output height     |
//! | `FilterWidth`  | column × dilation     | column          | 0              | filter width      |
//! | `FilterHeight` | row × dilation        | row             | 0              | filter height     |

use thiserror::Error;

use crate::loom::{
    layout::{ActivationLayout, FilterLayout},
    loops::{Loop, LoopError, LoopNest},
    num::Scalar,
    program::{IterationProgram, Level},
    shape::{ConvShape, LinearShape, ShapeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("compile error: {0}")]
    Loop(#[from] LoopError),
    #[error("compile error: {0}")]
    Shape(#[from] ShapeError),
    #[error("compile error: stride of loop {0} overflows")]
    Overflow(Loop),
}

/// The three tensors of a convolution or linear layer.
#[derive(Debug, Clone, Copy)]
pub struct Operands<'a> {
    pub input: &'a ActivationLayout,
    pub weights: &'a FilterLayout,
    pub output: &'a ActivationLayout,
}

impl<'a> Operands<'a> {
    #[inline]
    pub fn new(
        input: &'a ActivationLayout,
        weights: &'a FilterLayout,
        output: &'a ActivationLayout,
    ) -> Self {
        Self {
            input,
            weights,
            output,
        }
    }
}

impl Loop {
    /// The iteration level this loop contributes to a convolution program.
    pub fn level(self, operands: Operands, shape: &ConvShape) -> Result<Level, CompileError> {
        let Operands {
            input,
            weights,
            output,
        } = operands;
        let scale = |stride: isize, factor: u32| {
            stride
                .checked_mul(factor as isize)
                .ok_or(CompileError::Overflow(self))
        };

        let level = match self {
            Loop::Batch => Level::new(
                input.batch_stride,
                0,
                output.batch_stride,
                shape.batch_size,
            ),
            Loop::InChannels => Level::new(
                input.channel_stride,
                weights.in_channel_stride,
                0,
                shape.in_channels,
            ),
            Loop::OutChannels => Level::new(
                0,
                weights.out_channel_stride,
                output.channel_stride,
                shape.out_channels,
            ),
            Loop::ImageWidth => Level::new(
                scale(input.column_stride, shape.stride)?,
                0,
                output.column_stride,
                shape.output_width(),
            ),
            Loop::ImageHeight => Level::new(
                scale(input.row_stride, shape.stride)?,
                0,
                output.row_stride,
                shape.output_height(),
            ),
            Loop::FilterWidth => Level::new(
                scale(input.column_stride, shape.dilation)?,
                weights.column_stride,
                0,
                shape.filter_width,
            ),
            Loop::FilterHeight => Level::new(
                scale(input.row_stride, shape.dilation)?,
                weights.row_stride,
                0,
                shape.filter_height,
            ),
        };
        Ok(level)
    }
}

/// Compiles a 2D convolution over elements of type `T`.
///
/// `shape.groups` is not taken into account: the program is that of an ungrouped convolution.
pub fn compile<T: Scalar>(
    operands: Operands,
    shape: &ConvShape,
    nest: &LoopNest,
) -> Result<IterationProgram, CompileError> {
    shape.validate()?;

    let levels = nest
        .iter()
        .map(|tag| tag.level(operands, shape))
        .collect::<Result<Vec<_>, _>>()?;
    let program = IterationProgram {
        levels,
        input: operands.input.data,
        weights: operands.weights.data,
        output: operands.output.data,
        r#type: T::DATA_TYPE,
    };
    log::trace!("compiled {nest} into {program}");
    Ok(program)
}

/// Compiles a linear layer as a 1x1 convolution over the channel axes.
#[inline]
pub fn compile_linear<T: Scalar>(
    operands: Operands,
    shape: &LinearShape,
    nest: &LoopNest,
) -> Result<IterationProgram, CompileError> {
    compile::<T>(operands, &ConvShape::from(*shape), nest)
}

/// Compiles a convolution whose loop order is given as raw tags.
pub fn compile_raw<T: Scalar>(
    operands: Operands,
    shape: &ConvShape,
    tags: &[u32],
) -> Result<IterationProgram, CompileError> {
    let nest = LoopNest::from_raw(tags)?;
    compile::<T>(operands, shape, &nest)
}
