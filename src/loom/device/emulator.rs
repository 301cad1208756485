use half::f16;

use super::{Accelerator, DeviceError, MAX_LOOP_DEPTH, Notifier};
use crate::loom::{
    memory::{Heap, MemoryError, MemoryLocation, load, overlaps, span, store},
    num::{DataType, Num},
    program::{IterationProgram, Level},
};

/// A submitted program travelling to the worker.
#[derive(Debug)]
struct Submission {
    program: IterationProgram,
    notifier: Notifier,
}

/// Executes iteration programs against a [`Heap`].
#[derive(Debug, Clone)]
pub struct Backend {
    heap: Heap,
}

impl Backend {
    #[inline]
    pub fn new(heap: Heap) -> Self {
        Self { heap }
    }

    pub fn execute(&self, program: &IterationProgram) -> Result<(), DeviceError> {
        match program.r#type {
            DataType::F32 => self.run::<f32>(program),
            DataType::F16 => self.run::<f16>(program),
            DataType::I32 => self.run::<i32>(program),
            DataType::I16 => self.run::<i16>(program),
            DataType::U8 => self.run::<u8>(program),
            DataType::U16 => self.run::<u16>(program),
            DataType::U32 => self.run::<u32>(program),
        }
    }

    fn run<T: Num>(&self, program: &IterationProgram) -> Result<(), DeviceError> {
        let input = self.heap.buffer(program.input.buffer)?;
        let weights = self.heap.buffer(program.weights.buffer)?;
        let output = self.heap.buffer(program.output.buffer)?;

        let levels = &program.levels;
        if levels.iter().any(|level| level.count == 0) {
            return Ok(());
        }

        // operands may share a buffer as long as the output region is disjoint
        let size = program.r#type.size();
        let region = |location: MemoryLocation, stride: fn(&Level) -> isize| {
            let axes = levels.iter().map(|level| (stride(level), level.count));
            span(location.offset, size, axes)
        };
        let target = region(program.output, |level| level.strides.output);
        let sources = [
            (program.input, region(program.input, |level| level.strides.input)),
            (program.weights, region(program.weights, |level| level.strides.weights)),
        ];
        for (location, source) in sources {
            if location.buffer == output.id() && overlaps(&source, &target) {
                return Err(MemoryError::Aliased(output.id()).into());
            }
        }

        // every buffer is locked once; reads are taken before the write
        let input_guard = (input.id() != output.id()).then(|| input.read());
        let weights_guard = (weights.id() != output.id() && weights.id() != input.id())
            .then(|| weights.read());
        let mut output = output.write();

        let mut index = vec![0u32; levels.len()];
        let (mut x, mut w, mut y) = (
            program.input.offset,
            program.weights.offset,
            program.output.offset,
        );
        loop {
            let value = {
                let output: &[u8] = &output[..];
                let input: &[u8] = match &input_guard {
                    Some(guard) => &guard[..],
                    None => output,
                };
                let weights: &[u8] = match &weights_guard {
                    Some(guard) => &guard[..],
                    None if weights.id() == program.output.buffer => output,
                    None => input,
                };
                T::mul_add(load(output, y)?, load(input, x)?, load(weights, w)?)
            };
            store(&mut output, y, value)?;

            // advance the innermost level, carrying outwards like an odometer
            let mut depth = levels.len();
            loop {
                let Some(level) = depth.checked_sub(1) else {
                    return Ok(());
                };
                depth = level;

                let Level { strides, count } = levels[level];
                index[level] += 1;
                if index[level] < count {
                    x += strides.input;
                    w += strides.weights;
                    y += strides.output;
                    break;
                }

                let rewind = (count - 1) as isize;
                index[level] = 0;
                x -= strides.input * rewind;
                w -= strides.weights * rewind;
                y -= strides.output * rewind;
            }
        }
    }
}

/// A software implementation of the accelerator.
///
/// Programs are executed one at a time, in submission order, on a worker thread.
#[derive(Debug, Clone)]
pub struct Emulator {
    max_depth: usize,
    sender: flume::Sender<Submission>,
}

impl Accelerator for Emulator {
    #[inline]
    fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[inline]
    fn submit(&self, program: IterationProgram, notifier: Notifier) {
        // if the worker is gone the notifier is dropped and the waiter disconnects
        _ = self.sender.send(Submission { program, notifier })
    }
}

#[derive(Debug, Clone)]
pub struct EmulatorBuilder {
    pub heap: Heap,
    pub max_depth: usize,
}

impl EmulatorBuilder {
    pub fn new(heap: Heap) -> Self {
        let max_depth = MAX_LOOP_DEPTH;
        Self { heap, max_depth }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn build(self) -> Emulator {
        let (sender, receiver) = flume::unbounded();
        let backend = Backend::new(self.heap);
        std::thread::spawn(move || serve(backend, receiver));

        let max_depth = self.max_depth;
        Emulator { max_depth, sender }
    }
}

fn serve(backend: Backend, receiver: flume::Receiver<Submission>) {
    while let Ok(Submission { program, notifier }) = receiver.recv() {
        let result = backend.execute(&program);
        if let Err(err) = &result {
            log::error!("program for {} failed: {err}", notifier.address());
        }
        notifier.notify(result);
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Backend, EmulatorBuilder};
    use crate::loom::{
        device::{CoreId, DeviceError, DispatchError, submit},
        memory::{Heap, MemoryConfig, MemoryError, MemoryLocation},
        num::{DataType, Scalar},
        program::{IterationProgram, Level},
    };

    fn upload<T: Scalar>(heap: &Heap, values: &[T]) -> Result<MemoryLocation, MemoryError> {
        let location = heap.alloc(size_of_val(values), MemoryConfig(0))?;
        heap.write_slice(location, values)?;
        Ok(location)
    }

    #[test]
    fn test_dot_product() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[1i32, 2, 3, 4])?;
        let weights = upload(&heap, &[5i32, 6, 7, 8])?;
        let output = upload(&heap, &[100i32])?;

        let program = IterationProgram {
            levels: vec![Level::new(4, 4, 0, 4)],
            input,
            weights,
            output,
            r#type: DataType::I32,
        };
        Backend::new(heap.clone()).execute(&program)?;

        // accumulates onto the existing contents
        assert_eq!(heap.read_slice::<i32>(output, 1)?, [100 + 5 + 12 + 21 + 32]);
        Ok(())
    }

    #[test]
    fn test_zero_stride_broadcasts() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[1.0f32, 2.0, 3.0])?;
        let weights = upload(&heap, &[0.5f32])?;
        let output = upload(&heap, &[0.0f32; 6])?;

        // outer: two output rows reusing the same input; inner: three columns
        let program = IterationProgram {
            levels: vec![Level::new(0, 0, 12, 2), Level::new(4, 0, 4, 3)],
            input,
            weights,
            output,
            r#type: DataType::F32,
        };
        Backend::new(heap.clone()).execute(&program)?;

        assert_eq!(
            heap.read_slice::<f32>(output, 6)?,
            [0.5, 1.0, 1.5, 0.5, 1.0, 1.5]
        );
        Ok(())
    }

    #[test]
    fn test_negative_stride_reverses() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[1u16, 2, 3, 4])?;
        let weights = upload(&heap, &[10u16])?;
        let output = upload(&heap, &[0u16; 4])?;

        let program = IterationProgram {
            levels: vec![Level::new(-2, 0, 2, 4)],
            input: input.offset_by(6),
            weights,
            output,
            r#type: DataType::U16,
        };
        Backend::new(heap.clone()).execute(&program)?;

        assert_eq!(heap.read_slice::<u16>(output, 4)?, [40, 30, 20, 10]);
        Ok(())
    }

    #[test]
    fn test_empty_level_does_nothing() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[1i32])?;
        let weights = upload(&heap, &[1i32])?;
        let output = upload(&heap, &[7i32])?;

        let program = IterationProgram {
            levels: vec![Level::new(4, 4, 4, 1000), Level::new(0, 0, 0, 0)],
            input,
            weights,
            output,
            r#type: DataType::I32,
        };
        Backend::new(heap.clone()).execute(&program)?;

        assert_eq!(heap.read_slice::<i32>(output, 1)?, [7]);
        Ok(())
    }

    #[test]
    fn test_operands_in_one_arena() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let arena = upload(&heap, &[1i32, 2, 3, 4, 5, 6, 7, 8, 100, 0])?;
        let backend = Backend::new(heap.clone());

        let program = IterationProgram {
            levels: vec![Level::new(4, 4, 0, 4)],
            input: arena,
            weights: arena.offset_by(16),
            output: arena.offset_by(32),
            r#type: DataType::I32,
        };
        backend.execute(&program)?;
        assert_eq!(heap.read_slice::<i32>(arena, 10)?[8..], [100 + 5 + 12 + 21 + 32, 0]);

        // weights and output interleaved, one element apart
        let program = IterationProgram {
            levels: vec![Level::new(0, 8, 8, 2)],
            input: arena,
            weights: arena.offset_by(8),
            output: arena.offset_by(12),
            r#type: DataType::I32,
        };
        assert!(matches!(
            backend.execute(&program),
            Err(DeviceError::Memory(MemoryError::Aliased(_)))
        ));

        // the output region may touch an input but not overlap it
        let program = IterationProgram {
            levels: vec![Level::new(4, 0, 4, 2)],
            input: arena,
            weights: arena.offset_by(4),
            output: arena.offset_by(4),
            r#type: DataType::I32,
        };
        assert!(matches!(
            backend.execute(&program),
            Err(DeviceError::Memory(MemoryError::Aliased(_)))
        ));
        let program = IterationProgram {
            output: arena.offset_by(8),
            ..program
        };
        backend.execute(&program)?;
        assert_eq!(heap.read_slice::<i32>(arena, 4)?, [1, 2, 3 + 2, 4 + 2 * 2]);
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[1i32, 2])?;
        let output = upload(&heap, &[0i32])?;
        let backend = Backend::new(heap.clone());

        let program = IterationProgram {
            levels: vec![Level::new(4, 4, 0, 3)],
            input,
            weights: input,
            output,
            r#type: DataType::I32,
        };
        assert!(matches!(
            backend.execute(&program),
            Err(DeviceError::Memory(MemoryError::OutOfBounds { .. }))
        ));

        let program = IterationProgram {
            output: input,
            ..program
        };
        assert!(matches!(
            backend.execute(&program),
            Err(DeviceError::Memory(MemoryError::Aliased(_)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_emulator_dispatch() -> Result<(), Box<dyn Error>> {
        let heap = Heap::new(1 << 10);
        let input = upload(&heap, &[3u8, 4])?;
        let weights = upload(&heap, &[5u8, 6])?;
        let output = upload(&heap, &[0u8])?;
        let emulator = EmulatorBuilder::new(heap.clone()).max_depth(1).build();

        let program = IterationProgram {
            levels: vec![Level::new(1, 1, 0, 2)],
            input,
            weights,
            output,
            r#type: DataType::U8,
        };
        submit(&emulator, CoreId(2), program.clone())?
            .wait_async()
            .await?;
        assert_eq!(heap.read_slice::<u8>(output, 1)?, [39]);

        let program = IterationProgram {
            levels: vec![program.levels[0]; 2],
            ..program
        };
        assert!(matches!(
            submit(&emulator, CoreId(2), program),
            Err(DispatchError::TooDeep { depth: 2, max: 1 })
        ));

        let program = IterationProgram {
            levels: vec![Level::new(1, 1, 0, 8)],
            input,
            weights,
            output,
            r#type: DataType::U8,
        };
        assert!(matches!(
            submit(&emulator, CoreId(2), program)?.wait(),
            Err(DispatchError::Device(DeviceError::Memory(_)))
        ));
        Ok(())
    }
}
