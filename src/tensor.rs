//! Tensor values flowing through the graph
//!
//! Tensors are flat `Vec<f32>` buffers with an explicit shape, the same
//! representation the reference executor dispatches on. Quantized tensors
//! carry their own frozen quantization parameters so a kernel never has to
//! look anywhere else to dequantize an input.

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::observer::QParams;

/// Dense float tensor: flat data plus shape
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor, checking that the data length matches the shape
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(QuantError::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { data, shape })
    }

    /// Construct without checking; caller guarantees `data.len() == product(shape)`.
    pub(crate) fn from_raw(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self { data, shape }
    }

    /// Tensor with every element set to `value`
    pub fn filled(value: f32, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Storage dtype of a quantized tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantDType {
    /// Unsigned 8-bit, representable range [0, 255]
    Quint8,
    /// Signed 8-bit, representable range [-128, 127]
    Qint8,
}

impl QuantDType {
    /// Full representable integer range of the storage type
    pub fn range(self) -> (i32, i32) {
        match self {
            QuantDType::Quint8 => (0, 255),
            QuantDType::Qint8 => (-128, 127),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuantDType::Quint8 => "quint8",
            QuantDType::Qint8 => "qint8",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "quint8" => Ok(QuantDType::Quint8),
            "qint8" => Ok(QuantDType::Qint8),
            other => Err(QuantError::InvalidAttribute(format!(
                "unknown quantized dtype '{other}'"
            ))),
        }
    }
}

/// Backing storage for quantized data
#[derive(Debug, Clone, PartialEq)]
pub enum QuantData {
    U8(Vec<u8>),
    I8(Vec<i8>),
}

impl QuantData {
    pub fn len(&self) -> usize {
        match self {
            QuantData::U8(v) => v.len(),
            QuantData::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the stored integer values widened to i32
    pub fn iter_i32(&self) -> Box<dyn Iterator<Item = i32> + '_> {
        match self {
            QuantData::U8(v) => Box::new(v.iter().map(|&q| i32::from(q))),
            QuantData::I8(v) => Box::new(v.iter().map(|&q| i32::from(q))),
        }
    }
}

/// Affine-quantized tensor: integer storage plus its frozen QParams
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub(crate) data: QuantData,
    pub(crate) shape: Vec<usize>,
    pub(crate) qparams: QParams,
}

impl QuantizedTensor {
    pub fn data(&self) -> &QuantData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn qparams(&self) -> QParams {
        self.qparams
    }

    pub fn dtype(&self) -> QuantDType {
        match self.data {
            QuantData::U8(_) => QuantDType::Quint8,
            QuantData::I8(_) => QuantDType::Qint8,
        }
    }
}

/// A runtime value: either a float tensor or a quantized tensor
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Float(Tensor),
    Quantized(QuantizedTensor),
}

impl TensorValue {
    pub fn as_float(&self) -> Result<&Tensor> {
        match self {
            TensorValue::Float(t) => Ok(t),
            TensorValue::Quantized(_) => Err(QuantError::InvalidGraph(
                "expected float tensor, got quantized".to_string(),
            )),
        }
    }

    pub fn as_quantized(&self) -> Result<&QuantizedTensor> {
        match self {
            TensorValue::Quantized(q) => Ok(q),
            TensorValue::Float(_) => Err(QuantError::InvalidGraph(
                "expected quantized tensor, got float".to_string(),
            )),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::Float(t) => t.shape(),
            TensorValue::Quantized(q) => q.shape(),
        }
    }
}

impl From<Tensor> for TensorValue {
    fn from(t: Tensor) -> Self {
        TensorValue::Float(t)
    }
}

impl From<QuantizedTensor> for TensorValue {
    fn from(q: QuantizedTensor) -> Self {
        TensorValue::Quantized(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_shape() {
        assert!(Tensor::new(vec![1.0, 2.0], vec![2]).is_ok());
        assert!(Tensor::new(vec![1.0, 2.0], vec![3]).is_err());
    }

    #[test]
    fn test_filled() {
        let t = Tensor::filled(0.5, vec![2, 3]);
        assert_eq!(t.len(), 6);
        assert!(t.data().iter().all(|&x| x == 0.5));
    }

    #[test]
    fn test_dtype_ranges() {
        assert_eq!(QuantDType::Quint8.range(), (0, 255));
        assert_eq!(QuantDType::Qint8.range(), (-128, 127));
    }

    #[test]
    fn test_dtype_parse_roundtrip() {
        for dtype in [QuantDType::Quint8, QuantDType::Qint8] {
            assert_eq!(QuantDType::parse(dtype.as_str()).unwrap(), dtype);
        }
        assert!(QuantDType::parse("int4").is_err());
    }

    #[test]
    fn test_value_accessors() {
        let v = TensorValue::from(Tensor::filled(1.0, vec![2]));
        assert!(v.as_float().is_ok());
        assert!(v.as_quantized().is_err());
        assert_eq!(v.shape(), &[2]);
    }
}
