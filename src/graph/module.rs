// GraphModule: the unit of transformation
//
// Owns one graph per entry point (method) plus the observer side-table the
// Prepare pass fills in. Parameters live in each graph's constant table.

use rustc_hash::FxHashMap;

use crate::compiler::executor;
use crate::error::{QuantError, Result};
use crate::observer::ObserverTable;
use crate::tensor::TensorValue;

use super::ir::Graph;

/// The default entry point name
pub const FORWARD: &str = "forward";

/// A module under transformation: named method graphs plus per-method
/// observer state
#[derive(Debug, Clone, Default)]
pub struct GraphModule {
    methods: FxHashMap<String, Graph>,
    pub(crate) observers: FxHashMap<String, ObserverTable>,
}

impl GraphModule {
    /// Create a module with the given graph as its `forward` method
    pub fn new(graph: Graph) -> Self {
        let mut module = Self::default();
        module.add_method(FORWARD, graph);
        module
    }

    /// Register a method graph under a name
    pub fn add_method(&mut self, name: impl Into<String>, graph: Graph) {
        self.methods.insert(name.into(), graph);
    }

    /// Look up a method graph
    pub fn graph(&self, method: &str) -> Result<&Graph> {
        self.methods
            .get(method)
            .ok_or_else(|| QuantError::UnknownMethod(method.to_string()))
    }

    /// Look up a method graph mutably
    pub fn graph_mut(&mut self, method: &str) -> Result<&mut Graph> {
        self.methods
            .get_mut(method)
            .ok_or_else(|| QuantError::UnknownMethod(method.to_string()))
    }

    /// Number of live observers attached to a method
    pub fn observer_count(&self, method: &str) -> usize {
        self.observers.get(method).map_or(0, |table| table.len())
    }

    /// Whether any method still carries observers
    pub fn has_observers(&self) -> bool {
        self.observers.values().any(|t| !t.is_empty())
    }

    /// Run a method on the given inputs through the reference interpreter.
    ///
    /// This is the calibration path: `observe` bookkeeping nodes update
    /// their side-table entries as a side effect and pass their input
    /// through unchanged. Graph structure is never modified.
    pub fn forward(&mut self, method: &str, inputs: &[TensorValue]) -> Result<Vec<TensorValue>> {
        let graph = self
            .methods
            .get(method)
            .ok_or_else(|| QuantError::UnknownMethod(method.to_string()))?;
        let observers = self.observers.get_mut(method);
        executor::run(graph, observers, inputs)
    }
}
