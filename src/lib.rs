//! # quantgraph — graph-mode static post-training quantization
//!
//! Rewrites a floating-point computational graph into an equivalent graph
//! over fixed-point affine-quantized tensors, preserving output behavior
//! within calibrated numeric tolerance.
//!
//! ## Pipeline
//!
//! ```text
//! float GraphModule
//!     ↓
//! prepare   → observers inserted at quantizable sites
//!     ↓
//! calibrate → forward() over representative inputs (observer side effects)
//!     ↓
//! convert   → quantize/dequantize pairs, weights folded to quantized constants
//!     ↓
//! fuse      → dequantize→op→quantize chains collapsed into quantized::* ops
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use quantgraph::{Quantizer, GraphModule, Graph, Tensor};
//!
//! # fn build_graph() -> Graph { Graph::new() }
//! let module = GraphModule::new(build_graph());
//! let batch = vec![Tensor::filled(0.5, vec![1, 3, 8, 8]).into()];
//!
//! let (quantized, stats) = Quantizer::new().quantize(&module, "forward", &[batch])?;
//! println!("{stats}");
//! # Ok::<(), quantgraph::QuantError>(())
//! ```
//!
//! Quantization parameters derive from running min/max statistics: affine
//! `uint8` for activations, symmetric `int8` for weights. The tensor
//! execution engine that serves the fused graph is an external
//! collaborator; the reference interpreter here exists to drive calibration
//! and the test scenarios.

pub mod compiler;
pub mod error;
pub mod graph;
pub mod observer;
pub mod ops;
pub mod tensor;

// Re-exports for convenient access
pub use compiler::{QuantizeStats, Quantizer};
pub use error::{QuantError, Result};
pub use graph::{
    convert, fuse, prepare, AttrValue, Graph, GraphModule, Node, NodeId, ValueId, FORWARD,
    QUANTIZABLE_OPS,
};
pub use observer::{Observer, ObserverConfig, QConfig, QParams, QScheme, SCALE_EPS};
pub use tensor::{QuantDType, QuantizedTensor, Tensor, TensorValue};
