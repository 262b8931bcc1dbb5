use bytemuck::Pod;
use half::{bf16, f16};
use num_traits::NumCast;

/// Element type of a tensor storage.
///
/// The set is closed over what checkpoint storages can carry; quantized
/// storages and complex-double have no entry and resolve to `None` in
/// [`DataType::from_storage_class`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub enum DataType {
    // Floating point
    BF16,
    F16,
    F32,
    F64,
    // Integers
    I8,
    I16,
    I32,
    I64,
    U8,
    // Other
    Bool,
    Complex64,
}

impl DataType {
    pub fn size_in_bits(&self) -> usize {
        match self {
            DataType::BF16 => 16,
            DataType::F16 => 16,
            DataType::F32 => 32,
            DataType::F64 => 64,
            DataType::I8 => 8,
            DataType::I16 => 16,
            DataType::I32 => 32,
            DataType::I64 => 64,
            DataType::U8 => 8,
            DataType::Bool => 8,
            DataType::Complex64 => 64,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bits().div_ceil(8)
    }

    /// Width of the unit that byte-order swapping operates on. Complex
    /// numbers swap per component, single-byte types not at all.
    pub fn swap_width(&self) -> usize {
        match self {
            DataType::Complex64 => 4,
            other => other.size_in_bytes(),
        }
    }

    /// Maps a storage class name from the checkpoint stream to the element
    /// type it carries. `CompleteFloatStorage` is an alias some writers use
    /// for the complex-float storage class.
    pub fn from_storage_class(name: &str) -> Option<DataType> {
        match name {
            "DoubleStorage" => Some(DataType::F64),
            "FloatStorage" => Some(DataType::F32),
            "HalfStorage" => Some(DataType::F16),
            "LongStorage" => Some(DataType::I64),
            "IntStorage" => Some(DataType::I32),
            "ShortStorage" => Some(DataType::I16),
            "CharStorage" => Some(DataType::I8),
            "ByteStorage" => Some(DataType::U8),
            "BoolStorage" => Some(DataType::Bool),
            "BFloat16Storage" => Some(DataType::BF16),
            "ComplexFloatStorage" | "CompleteFloatStorage" => {
                Some(DataType::Complex64)
            },
            _ => None,
        }
    }
}

pub trait ArrayElement: NumCast + Pod {
    fn data_type() -> DataType;
}

impl ArrayElement for f16 {
    fn data_type() -> DataType {
        DataType::F16
    }
}

impl ArrayElement for bf16 {
    fn data_type() -> DataType {
        DataType::BF16
    }
}

impl ArrayElement for f32 {
    fn data_type() -> DataType {
        DataType::F32
    }
}

impl ArrayElement for f64 {
    fn data_type() -> DataType {
        DataType::F64
    }
}

impl ArrayElement for i8 {
    fn data_type() -> DataType {
        DataType::I8
    }
}

impl ArrayElement for i16 {
    fn data_type() -> DataType {
        DataType::I16
    }
}

impl ArrayElement for i32 {
    fn data_type() -> DataType {
        DataType::I32
    }
}

impl ArrayElement for i64 {
    fn data_type() -> DataType {
        DataType::I64
    }
}

impl ArrayElement for u8 {
    fn data_type() -> DataType {
        DataType::U8
    }
}
