//! Calibration observers and the quantization-parameter model
//!
//! An [`Observer`] accumulates running min/max statistics for one value
//! during calibration and derives frozen `(scale, zero_point)` parameters
//! from them. There is a single observer type; activation and weight
//! behavior differ only by [`ObserverConfig`].
//!
//! Observer state lives in a side-table on the module keyed by
//! [`ValueId`](crate::graph::ValueId), not on graph nodes, so graph
//! structure stays immutable during calibration.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::graph::ValueId;
use crate::tensor::QuantDType;

/// Floor for derived scales. A degenerate observed range (min == max) is a
/// numeric policy case, not an error: the scale is clamped here instead of
/// dividing by zero.
pub const SCALE_EPS: f32 = 1e-10;

/// Per-tensor quantization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QScheme {
    /// Asymmetric: zero_point derived from the observed minimum
    PerTensorAffine,
    /// Symmetric: zero_point fixed at 0, scale from the max absolute value
    PerTensorSymmetric,
}

/// Configuration record for one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub dtype: QuantDType,
    pub qscheme: QScheme,
    pub qmin: i32,
    pub qmax: i32,
}

impl ObserverConfig {
    /// Default activation observer: per-tensor affine over unsigned 8-bit [0, 255]
    pub fn activation() -> Self {
        Self {
            dtype: QuantDType::Quint8,
            qscheme: QScheme::PerTensorAffine,
            qmin: 0,
            qmax: 255,
        }
    }

    /// Default weight observer: per-tensor symmetric over signed 8-bit [-128, 127]
    pub fn weight() -> Self {
        Self {
            dtype: QuantDType::Qint8,
            qscheme: QScheme::PerTensorSymmetric,
            qmin: -128,
            qmax: 127,
        }
    }
}

/// The activation/weight observer configuration pair handed to Prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QConfig {
    pub activation: ObserverConfig,
    pub weight: ObserverConfig,
}

impl Default for QConfig {
    fn default() -> Self {
        Self {
            activation: ObserverConfig::activation(),
            weight: ObserverConfig::weight(),
        }
    }
}

/// Frozen quantization parameters plus the integer range they were derived
/// against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    pub scale: f32,
    pub zero_point: i32,
    pub qmin: i32,
    pub qmax: i32,
}

/// Stateful calibration unit attached to one quantizable value
#[derive(Debug, Clone)]
pub struct Observer {
    config: ObserverConfig,
    running_min: Option<f32>,
    running_max: Option<f32>,
    batches: usize,
}

/// Mutable observer state for one method, keyed by the observe node's
/// output value
pub type ObserverTable = FxHashMap<ValueId, Observer>;

impl Observer {
    pub fn new(config: ObserverConfig) -> Self {
        Self {
            config,
            running_min: None,
            running_max: None,
            batches: 0,
        }
    }

    pub fn config(&self) -> ObserverConfig {
        self.config
    }

    /// Fold one observed batch into the running min/max. Safe to call zero
    /// or more times before parameters are requested.
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }

        let batch_min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let batch_max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        self.running_min = Some(self.running_min.map_or(batch_min, |m| m.min(batch_min)));
        self.running_max = Some(self.running_max.map_or(batch_max, |m| m.max(batch_max)));
        self.batches += 1;
    }

    /// Number of batches folded in so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Whether any data has been observed
    pub fn has_data(&self) -> bool {
        self.batches > 0
    }

    /// Derive frozen quantization parameters from the current statistics.
    ///
    /// Pure and deterministic: calling twice without an intervening
    /// `observe` yields identical results.
    ///
    /// Affine: the observed range is widened to include 0.0 so zero is
    /// exactly representable, then `scale = (max - min) / (qmax - qmin)`
    /// and `zero_point = round(qmin - min/scale)` clamped into range.
    /// Symmetric: `zero_point = 0`, `scale = max(|min|, |max|) / qmax`.
    pub fn calculate_qparams(&self) -> QParams {
        let min = self.running_min.unwrap_or(0.0);
        let max = self.running_max.unwrap_or(0.0);
        let (qmin, qmax) = (self.config.qmin, self.config.qmax);

        match self.config.qscheme {
            QScheme::PerTensorSymmetric => {
                let max_abs = min.abs().max(max.abs());
                let scale = (max_abs / qmax as f32).max(SCALE_EPS);
                QParams {
                    scale,
                    zero_point: 0,
                    qmin,
                    qmax,
                }
            }
            QScheme::PerTensorAffine => {
                let min = min.min(0.0);
                let max = max.max(0.0);
                let scale = ((max - min) / (qmax - qmin) as f32).max(SCALE_EPS);
                let zero_point = (qmin as f32 - min / scale).round() as i32;
                QParams {
                    scale,
                    zero_point: zero_point.clamp(qmin, qmax),
                    qmin,
                    qmax,
                }
            }
        }
    }
}
