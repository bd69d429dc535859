//! Affine quantize/dequantize and the fixed-point reference kernels
//!
//! The fused `quantized::*` kernels dequantize their inputs, run the float
//! reference kernel, and requantize against the frozen output parameters.
//! That makes them numerically identical to the unfused
//! dequantize → op → quantize chain the Fusion pass collapses, which is the
//! property the fusion-equivalence tests lean on.

use crate::error::Result;
use crate::observer::QParams;
use crate::tensor::{QuantData, QuantDType, QuantizedTensor, Tensor};

use super::float;

/// Quantize a float tensor: `q = clamp(round(x / scale) + zero_point)`
pub fn quantize(input: &Tensor, qparams: QParams, dtype: QuantDType) -> QuantizedTensor {
    let quantize_one = |x: f32| -> i32 {
        let q = (x / qparams.scale).round() as i32 + qparams.zero_point;
        q.clamp(qparams.qmin, qparams.qmax)
    };

    let data = match dtype {
        QuantDType::Quint8 => QuantData::U8(
            input
                .data()
                .iter()
                .map(|&x| quantize_one(x).clamp(0, 255) as u8)
                .collect(),
        ),
        QuantDType::Qint8 => QuantData::I8(
            input
                .data()
                .iter()
                .map(|&x| quantize_one(x).clamp(-128, 127) as i8)
                .collect(),
        ),
    };

    QuantizedTensor {
        data,
        shape: input.shape().to_vec(),
        qparams,
    }
}

/// Dequantize back to float: `x = scale * (q - zero_point)`
pub fn dequantize(input: &QuantizedTensor) -> Tensor {
    let qp = input.qparams;
    let data = input
        .data
        .iter_i32()
        .map(|q| (q - qp.zero_point) as f32 * qp.scale)
        .collect();
    Tensor::from_raw(data, input.shape.to_vec())
}

/// Fixed-point 2D convolution
pub fn conv2d(
    input: &QuantizedTensor,
    weight: &QuantizedTensor,
    bias: Option<&Tensor>,
    stride: (usize, usize),
    padding: (usize, usize),
    out_qparams: QParams,
    out_dtype: QuantDType,
) -> Result<QuantizedTensor> {
    let x = dequantize(input);
    let w = dequantize(weight);
    let y = float::conv2d(&x, &w, bias, stride, padding)?;
    Ok(quantize(&y, out_qparams, out_dtype))
}

/// Fixed-point affine transform
pub fn linear(
    input: &QuantizedTensor,
    weight: &QuantizedTensor,
    bias: Option<&Tensor>,
    out_qparams: QParams,
    out_dtype: QuantDType,
) -> Result<QuantizedTensor> {
    let x = dequantize(input);
    let w = dequantize(weight);
    let y = float::linear(&x, &w, bias)?;
    Ok(quantize(&y, out_qparams, out_dtype))
}

/// Fixed-point elementwise addition
pub fn add(
    a: &QuantizedTensor,
    b: &QuantizedTensor,
    out_qparams: QParams,
    out_dtype: QuantDType,
) -> Result<QuantizedTensor> {
    let y = float::add(&dequantize(a), &dequantize(b))?;
    Ok(quantize(&y, out_qparams, out_dtype))
}

/// Fixed-point addition followed by rectification
pub fn add_relu(
    a: &QuantizedTensor,
    b: &QuantizedTensor,
    out_qparams: QParams,
    out_dtype: QuantDType,
) -> Result<QuantizedTensor> {
    let y = float::relu(&float::add(&dequantize(a), &dequantize(b))?);
    Ok(quantize(&y, out_qparams, out_dtype))
}

/// Fixed-point rectifier
pub fn relu(
    input: &QuantizedTensor,
    out_qparams: QParams,
    out_dtype: QuantDType,
) -> QuantizedTensor {
    let y = float::relu(&dequantize(input));
    quantize(&y, out_qparams, out_dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn qp(scale: f32, zero_point: i32, qmin: i32, qmax: i32) -> QParams {
        QParams {
            scale,
            zero_point,
            qmin,
            qmax,
        }
    }

    #[test]
    fn test_quantize_known_values() {
        let x = Tensor::new(vec![0.0, 1.0, 2.0, -1.0], vec![4]).unwrap();
        let q = quantize(&x, qp(0.5, 10, 0, 255), QuantDType::Quint8);

        // round(x / 0.5) + 10, clamped to [0, 255]
        let QuantData::U8(ref data) = q.data else {
            panic!("expected u8 storage");
        };
        assert_eq!(data, &[10, 12, 14, 8]);
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        let x = Tensor::new(vec![-100.0, 100.0], vec![2]).unwrap();
        let q = quantize(&x, qp(0.1, 0, 0, 255), QuantDType::Quint8);

        let QuantData::U8(ref data) = q.data else {
            panic!("expected u8 storage");
        };
        assert_eq!(data, &[0, 255]);
    }

    #[test]
    fn test_zero_is_exact() {
        let x = Tensor::new(vec![0.0], vec![1]).unwrap();
        let q = quantize(&x, qp(0.037, 42, 0, 255), QuantDType::Quint8);
        assert_eq!(dequantize(&q).data()[0], 0.0);
    }

    #[test]
    fn test_dequantize_error_bounded_by_half_scale() {
        let scale = 4.0 / 255.0;
        let x = Tensor::new(vec![0.0, 0.5, 1.234, 3.999], vec![4]).unwrap();
        let q = quantize(&x, qp(scale, 0, 0, 255), QuantDType::Quint8);
        let y = dequantize(&q);

        for (a, b) in x.data().iter().zip(y.data().iter()) {
            assert!((a - b).abs() <= scale / 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_fused_add_matches_unfused_chain() {
        let in_qp = qp(0.02, 128, 0, 255);
        let out_qp = qp(0.04, 128, 0, 255);

        let a = quantize(
            &Tensor::new(vec![0.1, -0.4, 1.0], vec![3]).unwrap(),
            in_qp,
            QuantDType::Quint8,
        );
        let b = quantize(
            &Tensor::new(vec![0.3, 0.2, -0.6], vec![3]).unwrap(),
            in_qp,
            QuantDType::Quint8,
        );

        let fused = add(&a, &b, out_qp, QuantDType::Quint8).unwrap();
        let unfused = quantize(
            &float::add(&dequantize(&a), &dequantize(&b)).unwrap(),
            out_qp,
            QuantDType::Quint8,
        );
        assert_eq!(fused, unfused);
    }

    #[test]
    fn test_fused_conv_matches_unfused_chain() {
        let x_qp = qp(0.05, 0, 0, 255);
        let w_qp = qp(0.01, 0, -128, 127);
        let y_qp = qp(0.2, 4, 0, 255);

        let x = quantize(&Tensor::filled(1.0, vec![1, 1, 3, 3]), x_qp, QuantDType::Quint8);
        let w = quantize(&Tensor::filled(0.5, vec![1, 1, 2, 2]), w_qp, QuantDType::Qint8);
        let b = Tensor::new(vec![0.25], vec![1]).unwrap();

        let fused = conv2d(&x, &w, Some(&b), (1, 1), (0, 0), y_qp, QuantDType::Quint8).unwrap();
        let unfused = quantize(
            &float::conv2d(&dequantize(&x), &dequantize(&w), Some(&b), (1, 1), (0, 0)).unwrap(),
            y_qp,
            QuantDType::Quint8,
        );
        assert_eq!(fused, unfused);

        let y = dequantize(&fused);
        // 4 taps of (1.0 * 0.5) + 0.25 bias ≈ 2.25, within output scale
        assert_abs_diff_eq!(y.data()[0], 2.25, epsilon = 0.2);
    }
}
