//! How 4D tensors are laid out in memory.
//!
//! A layout is a base location plus one signed stride (in bytes) per logical axis.
//! Extents are not part of a layout; they live in the shapes passed alongside.
//! Negative strides are allowed and make rotation and transposition trivial.
//! A zero stride means the tensor does not vary along that axis (broadcast).

use thiserror::Error;

use super::{memory::MemoryLocation, num::Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("layout error: dense strides overflow")]
    Overflow,
}

/// Dense row-major strides of elements of `size` bytes over `extents`, innermost first.
///
/// Returns the stride of each axis together with the size of the whole block,
/// which is the stride of the next outer axis.
pub fn dense_strides<const N: usize>(
    size: usize,
    extents: [u32; N],
) -> Result<([isize; N], isize), LayoutError> {
    let mut strides = [0; N];
    let mut stride = isize::try_from(size).map_err(|_| LayoutError::Overflow)?;
    for (slot, extent) in strides.iter_mut().zip(extents) {
        *slot = stride;
        stride = isize::try_from(extent)
            .ok()
            .and_then(|extent| stride.checked_mul(extent))
            .ok_or(LayoutError::Overflow)?;
    }
    Ok((strides, stride))
}

/// Layout of a 4D activation tensor `[batch, channel, row, column]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationLayout {
    pub data: MemoryLocation,
    pub batch_stride: isize,
    pub channel_stride: isize,
    /// Distance between horizontally adjacent elements, i.e. one step along the width.
    pub column_stride: isize,
    /// Distance between vertically adjacent elements, i.e. one step along the height.
    pub row_stride: isize,
}

impl ActivationLayout {
    /// Canonical dense row-major strides for `[batch, channels, height, width]`.
    /// The batch extent does not influence the strides.
    ///
    /// Strides are named by the axis they step along: `column_stride` is one
    /// element and `row_stride` is `width` elements. This is the reverse of the
    /// `row_stride = element` naming, which is only right for square images,
    /// since the width loop of a convolution walks `column_stride`.
    pub fn dense<T: Scalar>(
        data: MemoryLocation,
        channels: u32,
        height: u32,
        width: u32,
    ) -> Result<Self, LayoutError> {
        let ([column_stride, row_stride, channel_stride], batch_stride) =
            dense_strides(size_of::<T>(), [width, height, channels])?;
        Ok(Self {
            data,
            batch_stride,
            channel_stride,
            column_stride,
            row_stride,
        })
    }

    /// Byte offset (from the buffer start) of element `[batch, channel, row, column]`.
    #[inline]
    pub fn offset(&self, batch: u32, channel: u32, row: u32, column: u32) -> isize {
        self.data.offset
            + batch as isize * self.batch_stride
            + channel as isize * self.channel_stride
            + row as isize * self.row_stride
            + column as isize * self.column_stride
    }
}

/// Layout of 4D convolution weights `[out_channel, in_channel, row, column]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterLayout {
    pub data: MemoryLocation,
    pub in_channel_stride: isize,
    pub out_channel_stride: isize,
    pub column_stride: isize,
    pub row_stride: isize,
    /// Distance between channel groups. Grouped convolution is not compiled yet.
    pub group_stride: isize,
}

impl FilterLayout {
    /// Canonical dense strides for `[out_channels, in_channels, height, width]`.
    pub fn dense<T: Scalar>(
        data: MemoryLocation,
        out_channels: u32,
        in_channels: u32,
        height: u32,
        width: u32,
    ) -> Result<Self, LayoutError> {
        let ([column_stride, row_stride, in_channel_stride, out_channel_stride], group_stride) =
            dense_strides(size_of::<T>(), [width, height, in_channels, out_channels])?;
        Ok(Self {
            data,
            in_channel_stride,
            out_channel_stride,
            column_stride,
            row_stride,
            group_stride,
        })
    }

    /// Byte offset (from the buffer start) of weight `[out_channel, in_channel, row, column]`.
    #[inline]
    pub fn offset(&self, out_channel: u32, in_channel: u32, row: u32, column: u32) -> isize {
        self.data.offset
            + out_channel as isize * self.out_channel_stride
            + in_channel as isize * self.in_channel_stride
            + row as isize * self.row_stride
            + column as isize * self.column_stride
    }
}

impl From<ActivationLayout> for MemoryLocation {
    #[inline]
    fn from(value: ActivationLayout) -> Self {
        value.data
    }
}

impl From<FilterLayout> for MemoryLocation {
    #[inline]
    fn from(value: FilterLayout) -> Self {
        value.data
    }
}
