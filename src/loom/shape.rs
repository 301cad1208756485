#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shape error: stride must be at least 1")]
    ZeroStride,
    #[error("shape error: dilation must be at least 1")]
    ZeroDilation,
    #[error("shape error: pooling window must contain at least one element")]
    EmptyWindow,
}

/// Determines how many positions (in pixels) a window of `window_size` can take
/// along an axis of `input_size`. Applies to any windowed computation, e.g.
/// convolution or pooling.
///
/// This is the PyTorch `Conv2d` output-size formula without the padding term:
/// `floor((input - dilation * (window - 1) - 1) / stride) + 1`, clamped to zero.
/// A zero `stride` has no valid placements and also yields zero.
pub const fn output_size(input_size: u32, window_size: u32, stride: u32, dilation: u32) -> u32 {
    if stride == 0 {
        return 0;
    }
    let span = dilation as i64 * (window_size as i64 - 1);
    let size = (input_size as i64 - span - 1).div_euclid(stride as i64) + 1;
    if size < 0 { 0 } else { size as u32 }
}

/// Size and shape of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvShape {
    pub batch_size: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub filter_width: u32,
    pub filter_height: u32,
    /// Channels (both in and out) are partitioned into this many groups.
    pub groups: u32,
    /// Step size (in pixels) between adjacent filter positions.
    pub stride: u32,
    /// Distance between activation pixels multiplied by adjacent weights.
    pub dilation: u32,
}

impl Default for ConvShape {
    fn default() -> Self {
        Self {
            batch_size: 1,
            in_channels: 1,
            out_channels: 1,
            image_width: 1,
            image_height: 1,
            filter_width: 1,
            filter_height: 1,
            groups: 1,
            stride: 1,
            dilation: 1,
        }
    }
}

impl ConvShape {
    /// A shape with unit `groups`, `stride` and `dilation`.
    pub fn new(
        batch_size: u32,
        in_channels: u32,
        out_channels: u32,
        [image_width, image_height]: [u32; 2],
        [filter_width, filter_height]: [u32; 2],
    ) -> Self {
        Self {
            batch_size,
            in_channels,
            out_channels,
            image_width,
            image_height,
            filter_width,
            filter_height,
            ..Default::default()
        }
    }

    #[inline]
    pub fn with_stride(self, stride: u32) -> Self {
        Self { stride, ..self }
    }

    #[inline]
    pub fn with_dilation(self, dilation: u32) -> Self {
        Self { dilation, ..self }
    }

    #[inline]
    pub fn with_groups(self, groups: u32) -> Self {
        Self { groups, ..self }
    }

    #[inline]
    pub fn output_width(&self) -> u32 {
        output_size(
            self.image_width,
            self.filter_width,
            self.stride,
            self.dilation,
        )
    }

    #[inline]
    pub fn output_height(&self) -> u32 {
        output_size(
            self.image_height,
            self.filter_height,
            self.stride,
            self.dilation,
        )
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.stride == 0 {
            return Err(ShapeError::ZeroStride);
        }
        if self.dilation == 0 {
            return Err(ShapeError::ZeroDilation);
        }
        Ok(())
    }
}

/// Size of a fully-connected layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearShape {
    pub batch_size: u32,
    pub inputs: u32,
    pub outputs: u32,
}

impl LinearShape {
    pub fn new(batch_size: u32, inputs: u32, outputs: u32) -> Self {
        Self {
            batch_size,
            inputs,
            outputs,
        }
    }
}

/// The accelerator only understands convolutions, so a linear layer is encoded
/// as a 1x1, stride-1 convolution over the channel axes.
impl From<LinearShape> for ConvShape {
    fn from(value: LinearShape) -> Self {
        Self {
            batch_size: value.batch_size,
            in_channels: value.inputs,
            out_channels: value.outputs,
            ..Default::default()
        }
    }
}

/// Size and shape of a 2D pooling window. No dilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolShape {
    pub batch_size: u32,
    pub channels: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub window_width: u32,
    pub window_height: u32,
    /// In pixels.
    pub stride: u32,
}

impl PoolShape {
    pub fn new(
        batch_size: u32,
        channels: u32,
        [input_width, input_height]: [u32; 2],
        [window_width, window_height]: [u32; 2],
        stride: u32,
    ) -> Self {
        Self {
            batch_size,
            channels,
            input_width,
            input_height,
            window_width,
            window_height,
            stride,
        }
    }

    /// Number of window positions along the width. Only full windows count.
    #[inline]
    pub fn output_width(&self) -> u32 {
        output_size(self.input_width, self.window_width, self.stride, 1)
    }

    /// Number of window positions along the height. Only full windows count.
    #[inline]
    pub fn output_height(&self) -> u32 {
        output_size(self.input_height, self.window_height, self.stride, 1)
    }

    #[inline]
    pub fn window_len(&self) -> u32 {
        self.window_width * self.window_height
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.stride == 0 {
            return Err(ShapeError::ZeroStride);
        }
        if self.window_width == 0 || self.window_height == 0 {
            return Err(ShapeError::EmptyWindow);
        }
        Ok(())
    }
}
