use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    I32,
    I16,
    U8,
    U16,
    U32,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::I32 => 4,
            DataType::I16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

macro_rules! impl_zero {
    ($($t:ty),+) => {
        $(
            impl Zero for $t {
                #[inline]
                fn zero() -> Self {
                    0 as $t
                }
            }
        )+
    };
}

impl_zero!(f32, i32, i16, u8, u16, u32);

impl Zero for f16 {
    #[inline]
    fn zero() -> Self {
        Self::ZERO
    }
}

pub trait Scalar: Sized + Zeroable + Pod + Zero + Send + Sync {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i16 {
    const DATA_TYPE: DataType = DataType::I16;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

/// Element arithmetic used by the accelerator datapath and the CPU kernels.
///
/// Integer types wrap on overflow, like the fixed-width hardware does.
pub trait Num: Scalar + PartialOrd + std::fmt::Debug {
    /// Returns `acc + x * y`.
    fn mul_add(acc: Self, x: Self, y: Self) -> Self;

    /// Returns `self + rhs`.
    fn accumulate(self, rhs: Self) -> Self;

    /// Divides by an element count. Integers truncate toward zero.
    ///
    /// There is no hardware divider on the target cores, so this is slow.
    fn div_count(self, count: u32) -> Self;
}

macro_rules! impl_num_int {
    ($($t:ty),+) => {
        $(
            impl Num for $t {
                #[inline]
                fn mul_add(acc: Self, x: Self, y: Self) -> Self {
                    acc.wrapping_add(x.wrapping_mul(y))
                }

                #[inline]
                fn accumulate(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }

                #[inline]
                fn div_count(self, count: u32) -> Self {
                    (self as i64 / count as i64) as $t
                }
            }
        )+
    };
}

impl_num_int!(i32, i16, u8, u16, u32);

impl Num for f32 {
    #[inline]
    fn mul_add(acc: Self, x: Self, y: Self) -> Self {
        acc + x * y
    }

    #[inline]
    fn accumulate(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn div_count(self, count: u32) -> Self {
        self / count as f32
    }
}

impl Num for f16 {
    #[inline]
    fn mul_add(acc: Self, x: Self, y: Self) -> Self {
        acc + x * y
    }

    #[inline]
    fn accumulate(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn div_count(self, count: u32) -> Self {
        f16::from_f32(self.to_f32() / count as f32)
    }
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{DataType, Num, Scalar};

    #[test]
    fn test_data_type_size() {
        assert_eq!(f32::DATA_TYPE.size(), size_of::<f32>());
        assert_eq!(f16::DATA_TYPE.size(), size_of::<f16>());
        assert_eq!(i16::DATA_TYPE.size(), size_of::<i16>());
        assert_eq!(DataType::U8.size(), 1);
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(u8::mul_add(250, 3, 2), 0);
        assert_eq!(i16::accumulate(i16::MAX, 1), i16::MIN);
    }

    #[test]
    fn test_div_count() {
        assert_eq!(14i32.div_count(4), 3);
        assert_eq!((-14i32).div_count(4), -3);
        assert_eq!(200u8.div_count(300), 0);
        assert_eq!(14.0f32.div_count(4), 3.5);
        assert_eq!(f16::from_f32(14.0).div_count(4), f16::from_f32(3.5));
    }
}
