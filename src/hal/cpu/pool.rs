use itertools::iproduct;
use thiserror::Error;

use crate::loom::{
    layout::ActivationLayout,
    memory::{Heap, MemoryError, load, overlaps, span, store},
    num::Num,
    shape::{PoolShape, ShapeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pooling error: {0}")]
    Shape(#[from] ShapeError),
    #[error("pooling error: {0}")]
    Memory(#[from] MemoryError),
}

/// Which reduction a pooling kernel applies to each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduce {
    Max,
    Average,
}

/// Reduces every full window of `input` with its maximum value.
pub fn max_pool_2d<T: Num>(
    heap: &Heap,
    input: &ActivationLayout,
    output: &ActivationLayout,
    shape: &PoolShape,
) -> Result<(), PoolError> {
    pool::<T>(heap, input, output, shape, Reduce::Max)
}

/// Reduces every full window of `input` with its mean. Integer types truncate.
pub fn avg_pool_2d<T: Num>(
    heap: &Heap,
    input: &ActivationLayout,
    output: &ActivationLayout,
    shape: &PoolShape,
) -> Result<(), PoolError> {
    pool::<T>(heap, input, output, shape, Reduce::Average)
}

fn pool<T: Num>(
    heap: &Heap,
    input: &ActivationLayout,
    output: &ActivationLayout,
    shape: &PoolShape,
    reduce: Reduce,
) -> Result<(), PoolError> {
    shape.validate()?;

    let source = heap.buffer(input.data.buffer)?;
    let target = heap.buffer(output.data.buffer)?;

    // input and output may share a buffer as long as their regions are disjoint
    let (height, width) = (shape.output_height(), shape.output_width());
    let reach = |count: u32, window: u32| match count {
        0 => 0,
        count => (count - 1) * shape.stride + window,
    };
    let size = size_of::<T>();
    let read = span(
        input.data.offset,
        size,
        [
            (input.batch_stride, shape.batch_size),
            (input.channel_stride, shape.channels),
            (input.row_stride, reach(height, shape.window_height)),
            (input.column_stride, reach(width, shape.window_width)),
        ],
    );
    let written = span(
        output.data.offset,
        size,
        [
            (output.batch_stride, shape.batch_size),
            (output.channel_stride, shape.channels),
            (output.row_stride, height),
            (output.column_stride, width),
        ],
    );
    if source.id() == target.id() && overlaps(&read, &written) {
        return Err(MemoryError::Aliased(target.id()).into());
    }

    let source = (source.id() != target.id()).then(|| source.read());
    let mut target = target.write();

    let stride = shape.stride;
    let windows = iproduct!(0..shape.batch_size, 0..shape.channels, 0..height, 0..width);
    for (batch, channel, y, x) in windows {
        let value = {
            let source: &[u8] = match &source {
                Some(guard) => &guard[..],
                None => &target[..],
            };
            let window = iproduct!(0..shape.window_height, 0..shape.window_width).map(|(dy, dx)| {
                let offset = input.offset(batch, channel, y * stride + dy, x * stride + dx);
                load::<T>(source, offset)
            });
            match reduce {
                Reduce::Max => window_max(window)?,
                Reduce::Average => window_sum(window)?.div_count(shape.window_len()),
            }
        };
        store(&mut target, output.offset(batch, channel, y, x), value)?;
    }
    Ok(())
}

fn window_max<T: Num>(
    mut window: impl Iterator<Item = Result<T, MemoryError>>,
) -> Result<T, MemoryError> {
    // windows are never empty after validation
    let first = window.next().unwrap_or_else(|| Ok(T::zero()))?;
    window.try_fold(first, |max, value| {
        let value = value?;
        Ok(if value > max { value } else { max })
    })
}

fn window_sum<T: Num>(
    mut window: impl Iterator<Item = Result<T, MemoryError>>,
) -> Result<T, MemoryError> {
    window.try_fold(T::zero(), |sum, value| Ok(sum.accumulate(value?)))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use super::{PoolError, avg_pool_2d, max_pool_2d};
    use crate::loom::{
        layout::ActivationLayout,
        memory::{Heap, MemoryConfig, MemoryError, UNINIT_FILL},
        num::Scalar,
        shape::{PoolShape, ShapeError},
    };

    fn tensor<T: Scalar>(
        heap: &Heap,
        [channels, height, width]: [u32; 3],
        values: &[T],
    ) -> Result<ActivationLayout, Box<dyn Error>> {
        let location = heap.alloc(size_of::<T>() * values.len().max(1), MemoryConfig(0))?;
        heap.write_slice(location, values)?;
        Ok(ActivationLayout::dense::<T>(location, channels, height, width)?)
    }

    fn ramp<T: Scalar>(count: usize, f: impl Fn(usize) -> T) -> Vec<T> {
        (1..=count).map(f).collect_vec()
    }

    #[test]
    fn test_max_pool() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = tensor(&heap, [1, 4, 4], &ramp(16, |x| x as f32))?;
        let output = tensor(&heap, [1, 2, 2], &[0.0f32; 4])?;
        let shape = PoolShape::new(1, 1, [4, 4], [2, 2], 2);

        max_pool_2d::<f32>(&heap, &input, &output, &shape)?;
        assert_eq!(heap.read_slice::<f32>(output.data, 4)?, [6.0, 8.0, 14.0, 16.0]);
        Ok(())
    }

    #[test]
    fn test_avg_pool() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let shape = PoolShape::new(1, 1, [4, 4], [2, 2], 2);

        let input = tensor(&heap, [1, 4, 4], &ramp(16, |x| x as f32))?;
        let output = tensor(&heap, [1, 2, 2], &[0.0f32; 4])?;
        avg_pool_2d::<f32>(&heap, &input, &output, &shape)?;
        assert_eq!(heap.read_slice::<f32>(output.data, 4)?, [3.5, 5.5, 11.5, 13.5]);

        let input = tensor(&heap, [1, 4, 4], &ramp(16, |x| x as i32))?;
        let output = tensor(&heap, [1, 2, 2], &[0i32; 4])?;
        avg_pool_2d::<i32>(&heap, &input, &output, &shape)?;
        assert_eq!(heap.read_slice::<i32>(output.data, 4)?, [3, 5, 11, 13]);

        let input = tensor(&heap, [1, 4, 4], &ramp(16, |x| f16::from_f32(x as f32)))?;
        let output = tensor(&heap, [1, 2, 2], &[f16::ZERO; 4])?;
        avg_pool_2d::<f16>(&heap, &input, &output, &shape)?;
        let output = heap.read_slice::<f16>(output.data, 4)?;
        assert_eq!(output.iter().map(|x| x.to_f32()).collect_vec(), [3.5, 5.5, 11.5, 13.5]);
        Ok(())
    }

    #[test]
    fn test_overlapping_windows_over_channels() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        // two batches of two 3x3 channels; channel values are negated in the second batch
        let values = (0..2)
            .cartesian_product(0..2)
            .flat_map(|(batch, channel)| {
                let sign: i16 = if batch == 0 { 1 } else { -1 };
                (0..9).map(move |x| sign * (10 * channel + x))
            })
            .collect_vec();
        let input = tensor(&heap, [2, 3, 3], &values)?;
        let output = tensor(&heap, [2, 2, 2], &[0i16; 16])?;
        let shape = PoolShape::new(2, 2, [3, 3], [2, 2], 1);

        max_pool_2d::<i16>(&heap, &input, &output, &shape)?;
        assert_eq!(
            heap.read_slice::<i16>(output.data, 16)?,
            [
                4, 5, 7, 8, //
                14, 15, 17, 18, //
                0, -1, -3, -4, //
                -10, -11, -13, -14,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_window_larger_than_input() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = tensor(&heap, [1, 2, 2], &[1u8, 2, 3, 4])?;
        let output = heap.alloc(4, MemoryConfig(0))?;
        let output = ActivationLayout::dense::<u8>(output, 1, 1, 1)?;
        let shape = PoolShape::new(1, 1, [2, 2], [3, 3], 1);

        max_pool_2d::<u8>(&heap, &input, &output, &shape)?;
        avg_pool_2d::<u8>(&heap, &input, &output, &shape)?;
        assert_eq!(heap.read_slice::<u8>(output.data, 4)?, [UNINIT_FILL; 4]);
        Ok(())
    }

    #[test]
    fn test_input_and_output_in_one_arena() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        // 16 inputs followed by room for 4 outputs
        let arena = heap.alloc(80, MemoryConfig(0))?;
        heap.write_slice(arena, &ramp(16, |x| x as f32))?;
        let input = ActivationLayout::dense::<f32>(arena, 1, 4, 4)?;
        let output = ActivationLayout::dense::<f32>(arena.offset_by(64), 1, 2, 2)?;
        let shape = PoolShape::new(1, 1, [4, 4], [2, 2], 2);

        max_pool_2d::<f32>(&heap, &input, &output, &shape)?;
        assert_eq!(heap.read_slice::<f32>(output.data, 4)?, [6.0, 8.0, 14.0, 16.0]);
        assert_eq!(heap.read_slice::<f32>(arena, 16)?, ramp(16, |x| x as f32));

        // the output now covers the last input row
        let output = ActivationLayout::dense::<f32>(arena.offset_by(48), 1, 2, 2)?;
        assert_eq!(
            avg_pool_2d::<f32>(&heap, &input, &output, &shape),
            Err(PoolError::Memory(MemoryError::Aliased(arena.buffer)))
        );
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = tensor(&heap, [1, 2, 2], &[1u32, 2, 3, 4])?;
        let shape = PoolShape::new(1, 1, [2, 2], [1, 1], 1);

        assert_eq!(
            max_pool_2d::<u32>(&heap, &input, &input, &shape),
            Err(PoolError::Memory(MemoryError::Aliased(input.data.buffer)))
        );
        assert_eq!(
            avg_pool_2d::<u32>(&heap, &input, &input, &PoolShape { stride: 0, ..shape }),
            Err(PoolError::Shape(ShapeError::ZeroStride))
        );
        Ok(())
    }
}
