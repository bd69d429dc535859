//! Reference kernels dispatched by operator name
//!
//! Float kernels cover the quantizable allowlist; quantized kernels are the
//! fixed-point equivalents the Fusion pass targets. These back the
//! reference interpreter used for calibration and tests — a production
//! execution engine is an external collaborator.

pub mod float;
pub mod quantized;
