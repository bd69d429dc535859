//! Float reference kernels (naive direct implementations)

use crate::error::{QuantError, Result};
use crate::tensor::Tensor;

fn shape_err(expected: &[usize], got: &[usize]) -> QuantError {
    QuantError::ShapeMismatch {
        expected: expected.to_vec(),
        got: got.to_vec(),
    }
}

/// 2D convolution over NCHW input with OIHW weights
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Tensor> {
    let &[n, c_in, h, w] = input.shape() else {
        return Err(shape_err(&[0, 0, 0, 0], input.shape()));
    };
    let &[c_out, wc_in, kh, kw] = weight.shape() else {
        return Err(shape_err(&[0, 0, 0, 0], weight.shape()));
    };
    if wc_in != c_in {
        return Err(shape_err(&[c_out, c_in, kh, kw], weight.shape()));
    }
    if let Some(b) = bias {
        if b.shape() != [c_out] {
            return Err(shape_err(&[c_out], b.shape()));
        }
    }

    let (sh, sw) = stride;
    let (ph, pw) = padding;
    let oh = (h + 2 * ph).saturating_sub(kh) / sh + 1;
    let ow = (w + 2 * pw).saturating_sub(kw) / sw + 1;

    let x = input.data();
    let k = weight.data();
    let mut out = vec![0.0f32; n * c_out * oh * ow];

    for ni in 0..n {
        for co in 0..c_out {
            let b = bias.map_or(0.0, |b| b.data()[co]);
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = b;
                    for ci in 0..c_in {
                        for ky in 0..kh {
                            let iy = oy * sh + ky;
                            if iy < ph || iy - ph >= h {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = ox * sw + kx;
                                if ix < pw || ix - pw >= w {
                                    continue;
                                }
                                let xi = ((ni * c_in + ci) * h + (iy - ph)) * w + (ix - pw);
                                let ki = ((co * c_in + ci) * kh + ky) * kw + kx;
                                acc += x[xi] * k[ki];
                            }
                        }
                    }
                    out[((ni * c_out + co) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }

    Ok(Tensor::from_raw(out, vec![n, c_out, oh, ow]))
}

/// Affine transform: `input [m, k] × weight [n, k]ᵀ + bias [n]`
pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let &[m, k] = input.shape() else {
        return Err(shape_err(&[0, 0], input.shape()));
    };
    let &[n, wk] = weight.shape() else {
        return Err(shape_err(&[0, 0], weight.shape()));
    };
    if wk != k {
        return Err(shape_err(&[n, k], weight.shape()));
    }
    if let Some(b) = bias {
        if b.shape() != [n] {
            return Err(shape_err(&[n], b.shape()));
        }
    }

    let x = input.data();
    let w = weight.data();
    let mut out = vec![0.0f32; m * n];
    for mi in 0..m {
        for ni in 0..n {
            let mut acc = bias.map_or(0.0, |b| b.data()[ni]);
            for ki in 0..k {
                acc += x[mi * k + ki] * w[ni * k + ki];
            }
            out[mi * n + ni] = acc;
        }
    }

    Ok(Tensor::from_raw(out, vec![m, n]))
}

/// Elementwise addition; shapes must match
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.shape() != b.shape() {
        return Err(shape_err(a.shape(), b.shape()));
    }
    let out = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| x + y)
        .collect();
    Ok(Tensor::from_raw(out, a.shape().to_vec()))
}

/// Elementwise rectifier
pub fn relu(input: &Tensor) -> Tensor {
    let out = input.data().iter().map(|&x| x.max(0.0)).collect();
    Tensor::from_raw(out, input.shape().to_vec())
}
