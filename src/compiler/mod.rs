//! Pipeline driver
//!
//! Runs the four quantization stages over a module in one call:
//!
//! ```text
//! GraphModule
//!     ↓
//! 1. Prepare   → insert observers at quantizable sites
//!     ↓
//! 2. Calibrate → run forward over representative batches (side effects only)
//!     ↓
//! 3. Convert   → freeze qparams, insert quantize/dequantize, fold weights
//!     ↓
//! 4. Fuse      → collapse dequantize→op→quantize chains
//! ```
//!
//! Stages are strictly sequential; a failed stage returns the error and the
//! caller's module is left untouched (prepare/convert work on clones).

use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Result;
use crate::graph::{convert, fuse, prepare, GraphModule};
use crate::observer::QConfig;
use crate::tensor::TensorValue;

pub(crate) mod executor;

/// End-to-end quantization driver
pub struct Quantizer {
    qconfig: QConfig,
}

impl Quantizer {
    /// Create a driver with the default activation/weight observer configs
    pub fn new() -> Self {
        Self {
            qconfig: QConfig::default(),
        }
    }

    /// Override the observer configuration pair
    pub fn with_qconfig(mut self, qconfig: QConfig) -> Self {
        self.qconfig = qconfig;
        self
    }

    /// Quantize `entry` of `module`, calibrating over the given batches.
    ///
    /// Each batch is one full set of forward inputs. Convert fails with
    /// `InsufficientCalibrationData` when `batches` is empty, since no
    /// observer will have seen data.
    pub fn quantize(
        &self,
        module: &GraphModule,
        entry: &str,
        batches: &[Vec<TensorValue>],
    ) -> Result<(GraphModule, QuantizeStats)> {
        let start = Instant::now();

        let stage = Instant::now();
        let mut instrumented = prepare(module, entry, &self.qconfig)?;
        let observers_inserted = instrumented.observer_count(entry);
        let prepare_time = stage.elapsed();

        let stage = Instant::now();
        for batch in batches {
            instrumented.forward(entry, batch)?;
        }
        let calibrate_time = stage.elapsed();
        info!("calibrated '{entry}' over {} batches", batches.len());

        let stage = Instant::now();
        let mut quantized = convert(&instrumented, entry)?;
        let convert_time = stage.elapsed();

        let stage = Instant::now();
        let sites_fused = fuse(quantized.graph_mut(entry)?);
        let fuse_time = stage.elapsed();

        let stats = QuantizeStats {
            observers_inserted,
            calibration_batches: batches.len(),
            sites_fused,
            prepare_time,
            calibrate_time,
            convert_time,
            fuse_time,
            total_time: start.elapsed(),
        };
        info!("quantization complete: {stats}");

        Ok((quantized, stats))
    }
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics from one pipeline run
#[derive(Debug, Clone)]
pub struct QuantizeStats {
    /// Observers inserted by Prepare (== sites converted)
    pub observers_inserted: usize,
    /// Calibration batches executed
    pub calibration_batches: usize,
    /// Sites collapsed by Fusion
    pub sites_fused: usize,
    pub prepare_time: Duration,
    pub calibrate_time: Duration,
    pub convert_time: Duration,
    pub fuse_time: Duration,
    pub total_time: Duration,
}

impl std::fmt::Display for QuantizeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} observers, {} batches, {} fused sites in {:?} \
             (prepare {:?} | calibrate {:?} | convert {:?} | fuse {:?})",
            self.observers_inserted,
            self.calibration_batches,
            self.sites_fused,
            self.total_time,
            self.prepare_time,
            self.calibrate_time,
            self.convert_time,
            self.fuse_time,
        )
    }
}
