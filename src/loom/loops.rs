use std::borrow::Cow;

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("unsupported convolution loop tag: {0}")]
    Unsupported(u32),
}

/// Dimensions that loops can iterate over.
/// Not all dimensions apply to all computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum Loop {
    Batch = 0,
    InChannels = 1,
    OutChannels = 2,
    ImageWidth = 3,
    ImageHeight = 4,
    FilterWidth = 5,
    FilterHeight = 6,
}

impl Loop {
    pub const ALL: [Loop; 7] = [
        Loop::Batch,
        Loop::InChannels,
        Loop::OutChannels,
        Loop::ImageWidth,
        Loop::ImageHeight,
        Loop::FilterWidth,
        Loop::FilterHeight,
    ];
}

impl TryFrom<u32> for Loop {
    type Error = LoopError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match Loop::ALL.get(value as usize) {
            Some(&tag) => Ok(tag),
            None => {
                log::error!("unsupported convolution loop tag: {value}");
                Err(LoopError::Unsupported(value))
            }
        }
    }
}

impl From<Loop> for u32 {
    #[inline]
    fn from(value: Loop) -> Self {
        value as u32
    }
}

/// A collection of loops, from outermost to innermost.
///
/// Convolutions typically iterate over all seven [`Loop`] dimensions, and linear
/// layers over `Batch`, `InChannels` and `OutChannels`. A nest may reasonably
/// contain more loops (e.g. when tiling) or fewer (e.g. when some dimensions are
/// known to be of size 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct LoopNest(Cow<'static, [Loop]>);

impl LoopNest {
    /// The way one would write a convolution by hand.
    /// Innermost loops are very short, so parallelism isn't great.
    pub const NAIVE: Self = Self(Cow::Borrowed(&[
        Loop::Batch,
        Loop::OutChannels,
        Loop::InChannels,
        Loop::ImageHeight,
        Loop::ImageWidth,
        Loop::FilterHeight,
        Loop::FilterWidth,
    ]));

    /// Output remains constant in both inner loops.
    /// Can accumulate in both accelerator dimensions.
    pub const OUTPUT_STATIONARY: Self = Self(Cow::Borrowed(&[
        Loop::Batch,
        Loop::OutChannels,
        Loop::ImageHeight,
        Loop::ImageWidth,
        Loop::FilterHeight,
        Loop::FilterWidth,
        Loop::InChannels,
    ]));

    /// Input remains constant in the penultimate loop. Can broadcast along rows.
    pub const INPUT_STATIONARY: Self = Self(Cow::Borrowed(&[
        Loop::Batch,
        Loop::InChannels,
        Loop::ImageHeight,
        Loop::ImageWidth,
        Loop::FilterHeight,
        Loop::OutChannels,
        Loop::FilterWidth,
    ]));

    /// Weights remain constant in the inner loops.
    /// Can broadcast in both accelerator dimensions.
    pub const WEIGHT_STATIONARY: Self = Self(Cow::Borrowed(&[
        Loop::OutChannels,
        Loop::InChannels,
        Loop::FilterHeight,
        Loop::FilterWidth,
        Loop::Batch,
        Loop::ImageHeight,
        Loop::ImageWidth,
    ]));

    /// Fully-connected layers: all spatial dimensions have size 1.
    pub const LINEAR: Self = Self(Cow::Borrowed(&[
        Loop::Batch,
        Loop::OutChannels,
        Loop::InChannels,
    ]));

    /// The four canonical convolution orders.
    pub const PRESETS: [Self; 4] = [
        Self::NAIVE,
        Self::OUTPUT_STATIONARY,
        Self::INPUT_STATIONARY,
        Self::WEIGHT_STATIONARY,
    ];

    pub fn new(loops: impl Into<Vec<Loop>>) -> Self {
        Self(Cow::Owned(loops.into()))
    }

    /// Decodes a nest from raw tags (`Batch = 0` through `FilterHeight = 6`).
    pub fn from_raw(tags: &[u32]) -> Result<Self, LoopError> {
        let loops = tags
            .iter()
            .map(|&tag| Loop::try_from(tag))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(loops))
    }
}

impl Default for LoopNest {
    #[inline]
    fn default() -> Self {
        Self::NAIVE
    }
}

impl From<Vec<Loop>> for LoopNest {
    #[inline]
    fn from(value: Vec<Loop>) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Loop, LoopError, LoopNest};

    #[test]
    fn test_presets_are_permutations() {
        for nest in LoopNest::PRESETS {
            assert_eq!(nest.len(), 7);
            let sorted = nest.iter().copied().sorted().collect_vec();
            assert_eq!(sorted, Loop::ALL.to_vec(), "{nest} is not a permutation");
        }
        assert!(LoopNest::PRESETS.iter().all_unique());
    }

    #[test]
    fn test_stationary_operands() {
        // output index is fixed across the two innermost loops
        let nest = &LoopNest::OUTPUT_STATIONARY;
        assert_eq!(nest[5..], [Loop::FilterWidth, Loop::InChannels]);
        // input is held while output channels advance
        let nest = &LoopNest::INPUT_STATIONARY;
        assert_eq!(nest[5], Loop::OutChannels);
        // weights are held across batch and spatial loops
        let nest = &LoopNest::WEIGHT_STATIONARY;
        assert_eq!(nest[5..], [Loop::ImageHeight, Loop::ImageWidth]);
    }

    #[test]
    fn test_from_raw() -> Result<(), Box<dyn Error>> {
        let nest = LoopNest::from_raw(&[0, 2, 1, 4, 3, 6, 5])?;
        assert_eq!(nest, LoopNest::NAIVE);

        let tags = LoopNest::WEIGHT_STATIONARY
            .iter()
            .map(|&tag| u32::from(tag))
            .collect_vec();
        assert_eq!(LoopNest::from_raw(&tags)?, LoopNest::WEIGHT_STATIONARY);

        assert_eq!(
            LoopNest::from_raw(&[0, 1, 7]),
            Err(LoopError::Unsupported(7))
        );
        Ok(())
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LoopNest::LINEAR.to_string(),
            "[Batch, OutChannels, InChannels]"
        );
        assert_eq!(LoopNest::default(), LoopNest::NAIVE);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string(&LoopNest::INPUT_STATIONARY)?;
        let nest: LoopNest = serde_json::from_str(&json)?;
        assert_eq!(nest, LoopNest::INPUT_STATIONARY);
        Ok(())
    }
}
