// Graph module
//
// The IR all passes operate on, the module wrapper that owns it, and the
// four-stage quantization pass pipeline:
//
//   prepare  → insert observers at quantizable sites
//   (calibrate: run the instrumented module; no structural change)
//   convert  → replace observers with quantize/dequantize pairs,
//              fold weights to quantized constants
//   fuse     → collapse dequantize→op→quantize chains into
//              quantized::* operators

pub mod ir;
pub mod module;
pub mod passes;

// Re-exports for convenience
pub use ir::{AttrValue, DataEdge, Graph, NewOp, Node, NodeId, ValueId};
pub use module::{GraphModule, FORWARD};
pub use passes::{convert, fuse, prepare, QUANTIZABLE_OPS};
