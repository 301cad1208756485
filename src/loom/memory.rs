use std::{
    ops::Range,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use derive_more::{Deref, Display, From, Into};
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::num::Scalar;

/// Size in bytes of one word written by the bulk zero-fill primitive.
pub const WORD_SIZE: usize = 4;

/// Fresh buffers are filled with this byte so that reads of uninitialised memory stand out.
pub const UNINIT_FILL: u8 = 0xcd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("allocation of {requested} bytes failed: {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("buffer {0} does not exist")]
    UnknownBuffer(BufferId),
    #[error("access of {size} bytes at offset {offset} is outside buffer of {len} bytes")]
    OutOfBounds { offset: isize, size: usize, len: usize },
    #[error("offset {offset} is not aligned to element size {size}")]
    Misaligned { offset: isize, size: usize },
    #[error("buffer {0} is read and written in overlapping regions by one call")]
    Aliased(BufferId),
    #[error("buffer is in memory region {actual}, not {expected}")]
    Region {
        expected: MemoryConfig,
        actual: MemoryConfig,
    },
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BufferId(uid::Id<BufferId>);

/// Memory-region configuration tag, i.e. which memory group a buffer lives in.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct MemoryConfig(pub u32);

/// Where a tensor's first element lives: a buffer plus a byte offset into it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{buffer}+{offset} ({config})")]
pub struct MemoryLocation {
    pub buffer: BufferId,
    /// Offset in bytes from the start of the buffer.
    pub offset: isize,
    pub config: MemoryConfig,
}

impl MemoryLocation {
    /// The same buffer, `bytes` further along.
    #[inline]
    pub fn offset_by(self, bytes: isize) -> Self {
        let offset = self.offset + bytes;
        Self { offset, ..self }
    }
}

/// Resolves a byte offset to the byte range of one `T`.
#[inline]
fn element_range<T: Scalar>(
    len: usize,
    offset: isize,
) -> Result<std::ops::Range<usize>, MemoryError> {
    let size = size_of::<T>();
    if offset.rem_euclid(size as isize) != 0 {
        return Err(MemoryError::Misaligned { offset, size });
    }
    match usize::try_from(offset) {
        Ok(start) if start + size <= len => Ok(start..start + size),
        _ => Err(MemoryError::OutOfBounds { offset, size, len }),
    }
}

/// Reads one element at a byte offset.
#[inline]
pub fn load<T: Scalar>(bytes: &[u8], offset: isize) -> Result<T, MemoryError> {
    let range = element_range::<T>(bytes.len(), offset)?;
    Ok(bytemuck::pod_read_unaligned(&bytes[range]))
}

/// Writes one element at a byte offset.
#[inline]
pub fn store<T: Scalar>(bytes: &mut [u8], offset: isize, value: T) -> Result<(), MemoryError> {
    let range = element_range::<T>(bytes.len(), offset)?;
    bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
    Ok(())
}

/// Byte range touched by a strided walk over elements of `size` bytes, starting at
/// `offset`, with one `(stride, count)` pair per axis. Empty if any count is zero.
pub fn span(
    offset: isize,
    size: usize,
    axes: impl IntoIterator<Item = (isize, u32)>,
) -> Range<isize> {
    let (mut start, mut end) = (offset, offset);
    for (stride, count) in axes {
        let Some(steps) = count.checked_sub(1) else {
            return offset..offset;
        };
        let reach = stride.saturating_mul(steps as isize);
        if reach < 0 {
            start = start.saturating_add(reach);
        } else {
            end = end.saturating_add(reach);
        }
    }
    start..end.saturating_add(size as isize)
}

/// Whether two byte ranges share at least one byte.
#[inline]
pub fn overlaps(x: &Range<isize>, y: &Range<isize>) -> bool {
    x.start < y.end && y.start < x.end
}

/// A block of device memory.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    config: MemoryConfig,
    data: Arc<RwLock<Box<[u8]>>>,
}

impl Buffer {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct HeapState {
    buffers: HashMap<BufferId, Buffer>,
    used: usize,
}

/// The memory allocator. Cloning yields another handle to the same heap.
#[derive(Debug, Clone)]
pub struct Heap {
    capacity: usize,
    state: Arc<RwLock<HeapState>>,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        let state = Default::default();
        Self { capacity, state }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.state().used
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    #[inline]
    fn state(&self) -> RwLockReadGuard<'_, HeapState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn state_mut(&self) -> RwLockWriteGuard<'_, HeapState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests `bytes` bytes, rounded up to whole words. Contents are uninitialised.
    pub fn alloc(&self, bytes: usize, config: MemoryConfig) -> Result<MemoryLocation, MemoryError> {
        let mut state = self.state_mut();
        let available = self.capacity - state.used;
        let size = bytes.div_ceil(WORD_SIZE).saturating_mul(WORD_SIZE);
        if size > available {
            return Err(MemoryError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let id = BufferId::default();
        let data = Arc::new(RwLock::new(vec![UNINIT_FILL; size].into_boxed_slice()));
        let buffer = Buffer { id, config, data };
        state.buffers.insert(id, buffer);
        state.used += size;
        log::trace!("alloc {size} bytes as buffer {id} in region {config}");

        Ok(MemoryLocation {
            buffer: id,
            offset: 0,
            config,
        })
    }

    /// Returns the buffer holding `location` to the heap.
    pub fn free(&self, location: MemoryLocation) -> Result<(), MemoryError> {
        let mut state = self.state_mut();
        let buffer = state
            .buffers
            .remove(&location.buffer)
            .ok_or(MemoryError::UnknownBuffer(location.buffer))?;
        state.used -= buffer.len();
        Ok(())
    }

    pub fn buffer(&self, id: BufferId) -> Result<Buffer, MemoryError> {
        self.state()
            .buffers
            .get(&id)
            .cloned()
            .ok_or(MemoryError::UnknownBuffer(id))
    }

    /// Writes zero to `words` words starting at `location`, through memory region `config`.
    pub fn clear_words(
        &self,
        location: MemoryLocation,
        words: usize,
        config: MemoryConfig,
    ) -> Result<(), MemoryError> {
        let buffer = self.buffer(location.buffer)?;
        if buffer.config() != config {
            return Err(MemoryError::Region {
                expected: config,
                actual: buffer.config(),
            });
        }

        let mut data = buffer.write();
        let len = data.len();
        let size = words * WORD_SIZE;
        let range = match usize::try_from(location.offset) {
            Ok(start) if start + size <= len => start..start + size,
            _ => {
                return Err(MemoryError::OutOfBounds {
                    offset: location.offset,
                    size,
                    len,
                });
            }
        };
        data[range].fill(0);
        Ok(())
    }

    /// Copies densely packed `values` to memory starting at `location`.
    pub fn write_slice<T: Scalar>(
        &self,
        location: MemoryLocation,
        values: &[T],
    ) -> Result<(), MemoryError> {
        let buffer = self.buffer(location.buffer)?;
        let mut data = buffer.write();
        let step = size_of::<T>() as isize;
        for (index, &value) in values.iter().enumerate() {
            store(&mut data, location.offset + index as isize * step, value)?;
        }
        Ok(())
    }

    /// Copies `count` densely packed elements starting at `location`.
    pub fn read_slice<T: Scalar>(
        &self,
        location: MemoryLocation,
        count: usize,
    ) -> Result<Vec<T>, MemoryError> {
        let buffer = self.buffer(location.buffer)?;
        let data = buffer.read();
        let step = size_of::<T>() as isize;
        (0..count)
            .map(|index| load(&data, location.offset + index as isize * step))
            .collect()
    }
}
