use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{memory::MemoryLocation, num::DataType};

/// Per-level address increments (in bytes) of the three operands.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({input}, {weights}, {output})")]
pub struct LevelStrides {
    pub input: isize,
    pub weights: isize,
    pub output: isize,
}

/// One loop of an [`IterationProgram`].
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{strides} x {count}")]
pub struct Level {
    pub strides: LevelStrides,
    pub count: u32,
}

impl Level {
    #[inline]
    pub fn new(input: isize, weights: isize, output: isize, count: u32) -> Self {
        let strides = LevelStrides {
            input,
            weights,
            output,
        };
        Self { strides, count }
    }
}

/// A compiled, hardware-dispatchable loop nest.
///
/// Levels run outermost first. At every point of the iteration space the
/// accelerator performs `output += input * weights` on the addressed elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationProgram {
    pub levels: Vec<Level>,
    pub input: MemoryLocation,
    pub weights: MemoryLocation,
    pub output: MemoryLocation,
    /// Element type of all three operands.
    pub r#type: DataType,
}

impl IterationProgram {
    #[inline]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Total number of multiply-accumulate operations the program performs.
    #[inline]
    pub fn points(&self) -> u64 {
        self.levels.iter().map(|level| level.count as u64).product()
    }
}

impl std::fmt::Display for IterationProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: [{}]", self.r#type, self.levels.iter().format(", "))
    }
}
