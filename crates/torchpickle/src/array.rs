use ndarray::{ArrayView, IxDyn};
use thiserror::Error;

use crate::{ArrayElement, DataType};

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error(
        "Size mismatch: array of shape {shape:?} and data type \
        {data_type:?} expected to be {expected_size} bytes, got {actual_size} bytes."
    )]
    SizeMismatch {
        data_type: DataType,
        shape: Box<[usize]>,
        expected_size: usize,
        actual_size: usize,
    },
}

pub fn size_for_shape(
    shape: &[usize],
    data_type: DataType,
) -> usize {
    let num_elements: usize = shape.iter().product();
    num_elements * data_type.size_in_bytes()
}

/// A host tensor: an owned byte buffer plus a shape and an element type.
///
/// Memory is always contiguous in row-major order; the unpickler discards
/// stride information on reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    buffer: Vec<u8>,
    shape: Box<[usize]>,
    data_type: DataType,
}

impl Array {
    pub fn from_bytes(
        buffer: Vec<u8>,
        shape: &[usize],
        data_type: DataType,
    ) -> Result<Self, ArrayError> {
        let expected_size = size_for_shape(shape, data_type);
        if buffer.len() != expected_size {
            return Err(ArrayError::SizeMismatch {
                data_type,
                shape: shape.into(),
                expected_size,
                actual_size: buffer.len(),
            });
        }
        Ok(Self {
            buffer,
            shape: shape.into(),
            data_type,
        })
    }

    pub fn zeros(
        shape: &[usize],
        data_type: DataType,
    ) -> Self {
        Self {
            buffer: vec![0u8; size_for_shape(shape, data_type)],
            shape: shape.into(),
            data_type,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn validate_element_type<T: ArrayElement>(&self) {
        assert_eq!(
            T::data_type(),
            self.data_type,
            "Invalid data type, expected {:?}, actual {:?}",
            T::data_type(),
            self.data_type
        );
    }

    pub fn as_slice<T: ArrayElement>(&self) -> &[T] {
        self.validate_element_type::<T>();
        bytemuck::cast_slice(self.as_bytes())
    }

    pub fn as_slice_mut<T: ArrayElement>(&mut self) -> &mut [T] {
        self.validate_element_type::<T>();
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    pub fn as_view<T: ArrayElement>(&self) -> ArrayView<'_, T, IxDyn> {
        ArrayView::from_shape(IxDyn(self.shape()), self.as_slice::<T>())
            .expect("contiguous buffer always reshapes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_validates_size() {
        let ok = Array::from_bytes(vec![0u8; 24], &[2, 3], DataType::F32);
        assert!(ok.is_ok());

        let err = Array::from_bytes(vec![0u8; 23], &[2, 3], DataType::F32);
        assert!(matches!(err, Err(ArrayError::SizeMismatch { .. })));
    }

    #[test]
    fn test_scalar_shape() {
        let a = Array::from_bytes(vec![0u8; 8], &[], DataType::F64).unwrap();
        assert_eq!(a.num_elements(), 1);
        assert_eq!(a.as_slice::<f64>(), &[0.0]);
    }

    #[test]
    fn test_typed_view() {
        let bytes = 1.5f32
            .to_le_bytes()
            .iter()
            .chain(2.5f32.to_le_bytes().iter())
            .copied()
            .collect::<Vec<u8>>();
        let a = Array::from_bytes(bytes, &[2], DataType::F32).unwrap();
        let view = a.as_view::<f32>();
        assert_eq!(view[[0]], 1.5);
        assert_eq!(view[[1]], 2.5);
    }
}
