// Graph intermediate representation
//
// Dataflow representation of a module method using petgraph. Nodes carry an
// operator name, ordered input/output value names, and constant attributes.
// Wiring is name-based: a value name is produced by exactly one node output
// (or is a graph input / constant) and consumed by any number of node
// inputs. The petgraph edge set mirrors the name wiring and is kept in sync
// by every mutating helper, so def/use walks and toposort stay valid.

use anyhow::{anyhow, bail, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use rustc_hash::FxHashMap;

use crate::tensor::TensorValue;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Identity of one produced value: producing node plus output slot.
/// Side-tables (observer state) key on this, never on node fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId {
    pub node: NodeId,
    pub slot: u8,
}

/// Constant attribute value attached to a node
#[derive(Debug, Clone)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Str(String),
    /// Nested control-flow body (e.g. an `if` branch)
    Graph(Box<Graph>),
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Int(a), AttrValue::Int(b)) => a == b,
            (AttrValue::Float(a), AttrValue::Float(b)) => a.to_bits() == b.to_bits(),
            (AttrValue::Ints(a), AttrValue::Ints(b)) => a == b,
            (AttrValue::Floats(a), AttrValue::Floats(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (AttrValue::Str(a), AttrValue::Str(b)) => a == b,
            (AttrValue::Graph(a), AttrValue::Graph(b)) => a.structurally_equal(b),
            _ => false,
        }
    }
}

/// A node in the computation graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node name, unique within the graph (used in diagnostics)
    pub name: String,
    /// Operator identity (e.g. "conv2d", "quantize", "quantized::linear")
    pub op_type: String,
    /// Ordered input value names
    pub input_names: Vec<String>,
    /// Ordered output value names
    pub output_names: Vec<String>,
    /// Attribute name → constant value
    pub attributes: FxHashMap<String, AttrValue>,
}

impl Node {
    /// Get attribute by name
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn attr_f32(&self, name: &str) -> Option<f32> {
        match self.attr(name) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        match self.attr(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        match self.attr(name) {
            Some(AttrValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attr(name) {
            Some(AttrValue::Ints(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

/// Data dependency edge: which output slot feeds which input slot
#[derive(Debug, Clone, PartialEq)]
pub struct DataEdge {
    pub output_slot: u8,
    pub input_slot: u8,
}

/// Computation graph for one module method
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// The underlying petgraph structure
    graph: StableGraph<Node, DataEdge>,

    /// Value name → producer mapping: name → (node, output_slot)
    producers: FxHashMap<String, (NodeId, u8)>,

    /// Ordered graph input value names
    inputs: Vec<String>,

    /// Ordered graph output value names
    outputs: Vec<String>,

    /// Constant values (parameters, folded weights) by name
    constants: FxHashMap<String, TensorValue>,

    /// Counter for generated names
    fresh: u32,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph input value
    pub fn add_input(&mut self, name: impl Into<String>) {
        self.inputs.push(name.into());
    }

    /// Register a graph output value
    pub fn add_output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }

    /// Register a named constant
    pub fn add_constant(&mut self, name: impl Into<String>, value: TensorValue) -> Result<()> {
        let name = name.into();
        if self.constants.contains_key(&name) {
            bail!("duplicate constant '{name}'");
        }
        self.constants.insert(name, value);
        Ok(())
    }

    pub fn constant(&self, name: &str) -> Option<&TensorValue> {
        self.constants.get(name)
    }

    pub fn has_constant(&self, name: &str) -> bool {
        self.constants.contains_key(name)
    }

    pub fn remove_constant(&mut self, name: &str) -> Option<TensorValue> {
        self.constants.remove(name)
    }

    pub fn constants(&self) -> impl Iterator<Item = (&String, &TensorValue)> {
        self.constants.iter()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Start building a new operation
    pub fn add_op(&mut self, op_type: impl Into<String>) -> NewOp<'_> {
        NewOp::new(self, op_type.into())
    }

    /// Get node by ID
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    /// Get mutable node by ID
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(id)
    }

    /// Iterate all nodes (arbitrary order)
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|n| (id, n)))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Find all nodes with the given operator, in index order
    pub fn find_nodes(&self, op_type: &str) -> Vec<NodeId> {
        let mut found: Vec<NodeId> = self
            .nodes()
            .filter(|(_, n)| n.op_type == op_type)
            .map(|(id, _)| id)
            .collect();
        found.sort_unstable();
        found
    }

    /// Producer of a value, if it is a node output
    pub fn producer(&self, value: &str) -> Option<(NodeId, u8)> {
        self.producers.get(value).copied()
    }

    /// All (node, input_slot) pairs consuming a value
    pub fn consumers(&self, value: &str) -> Vec<(NodeId, usize)> {
        let mut found: Vec<(NodeId, usize)> = self
            .nodes()
            .flat_map(|(id, n)| {
                n.input_names
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| name.as_str() == value)
                    .map(move |(slot, _)| (id, slot))
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_unstable();
        found
    }

    /// The single consumer of a value, if there is exactly one and the
    /// value is not also a graph output
    pub fn sole_consumer(&self, value: &str) -> Option<NodeId> {
        if self.outputs.iter().any(|o| o == value) {
            return None;
        }
        match self.consumers(value).as_slice() {
            [(id, _)] => Some(*id),
            _ => None,
        }
    }

    /// Compute topological order
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        toposort(&self.graph, None).map_err(|_| anyhow!("graph contains cycles"))
    }

    /// Remove a node. Fails if any of its outputs is still consumed or is a
    /// graph output; callers rewire first. This is what keeps the
    /// no-dangling-edge contract mechanical.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .graph
            .node_weight(id)
            .ok_or_else(|| anyhow!("no such node: {id:?}"))?;

        for output in &node.output_names {
            if self.outputs.iter().any(|o| o == output) {
                bail!("cannot remove producer of graph output '{output}'");
            }
            if !self.consumers(output).is_empty() {
                bail!("cannot remove node '{}': output '{output}' still has consumers", node.name);
            }
        }

        let outputs = node.output_names.clone();
        for output in &outputs {
            self.producers.remove(output);
        }
        self.graph.remove_node(id);
        Ok(())
    }

    /// Remove a node without the consumer guard. For passes that
    /// immediately re-establish a producer for the freed output names;
    /// callers must leave the graph valid before returning.
    pub(crate) fn remove_node_unchecked(&mut self, id: NodeId) {
        if let Some(node) = self.graph.node_weight(id) {
            let outputs = node.output_names.clone();
            for output in &outputs {
                self.producers.remove(output);
            }
            self.graph.remove_node(id);
        }
    }

    /// Redirect every consumer of `old` (node inputs and the graph output
    /// list) to `new`
    pub fn replace_value(&mut self, old: &str, new: &str) {
        self.replace_value_except(old, new, &[]);
    }

    /// Like [`replace_value`](Self::replace_value) but leaves the listed
    /// nodes' inputs untouched (used when splicing a node after a value)
    pub fn replace_value_except(&mut self, old: &str, new: &str, except: &[NodeId]) {
        let ids: Vec<NodeId> = self.graph.node_indices().collect();
        for id in ids {
            if except.contains(&id) {
                continue;
            }
            if let Some(node) = self.graph.node_weight_mut(id) {
                for input in &mut node.input_names {
                    if input == old {
                        *input = new.to_string();
                    }
                }
            }
        }
        for output in &mut self.outputs {
            if output == old {
                *output = new.to_string();
            }
        }
        self.sync_edges();
    }

    /// Generate a fresh name with the given prefix
    pub fn fresh_name(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}.{}", self.fresh);
        self.fresh += 1;
        name
    }

    /// Rebuild the petgraph edge set from the name wiring
    pub(crate) fn sync_edges(&mut self) {
        self.graph.clear_edges();
        let edges: Vec<(NodeId, NodeId, DataEdge)> = self
            .graph
            .node_indices()
            .flat_map(|id| {
                let node = &self.graph[id];
                node.input_names
                    .iter()
                    .enumerate()
                    .filter_map(|(input_slot, input)| {
                        self.producers.get(input).map(|&(src, output_slot)| {
                            (
                                src,
                                id,
                                DataEdge {
                                    output_slot,
                                    input_slot: input_slot as u8,
                                },
                            )
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        for (src, dst, edge) in edges {
            self.graph.add_edge(src, dst, edge);
        }
    }

    /// Check structural soundness: every referenced value resolves to a
    /// producer, a graph input, or a constant, and the graph is acyclic.
    /// Passes call this before returning successfully.
    pub fn validate(&self) -> Result<()> {
        let resolves = |name: &str| {
            self.producers.contains_key(name)
                || self.inputs.iter().any(|i| i == name)
                || self.constants.contains_key(name)
        };

        for (_, node) in self.nodes() {
            for input in &node.input_names {
                if !resolves(input) {
                    bail!("node '{}' consumes dangling value '{input}'", node.name);
                }
            }
        }
        for output in &self.outputs {
            if !resolves(output) {
                bail!("graph output '{output}' has no producer");
            }
        }
        self.topological_sort()?;
        Ok(())
    }

    /// Structural equality: same inputs, outputs, constants, and the same
    /// node set (by name, operator, wiring, and attributes)
    pub fn structurally_equal(&self, other: &Graph) -> bool {
        if self.inputs != other.inputs
            || self.outputs != other.outputs
            || self.constants != other.constants
        {
            return false;
        }

        let collect = |g: &Graph| {
            let mut nodes: Vec<Node> = g.nodes().map(|(_, n)| n.clone()).collect();
            nodes.sort_by(|a, b| a.name.cmp(&b.name));
            nodes
        };
        collect(self) == collect(other)
    }
}

/// Builder for adding operations to the graph
pub struct NewOp<'a> {
    graph: &'a mut Graph,
    node: Node,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut Graph, op_type: String) -> Self {
        Self {
            graph,
            node: Node {
                name: String::new(),
                op_type,
                input_names: Vec::new(),
                output_names: Vec::new(),
                attributes: FxHashMap::default(),
            },
        }
    }

    /// Set node name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node.name = name.into();
        self
    }

    /// Append an input value name
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.node.input_names.push(name.into());
        self
    }

    /// Append an output value name
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.node.output_names.push(name.into());
        self
    }

    /// Set an attribute
    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.node.attributes.insert(name.into(), value);
        self
    }

    /// Finish building and add to graph
    pub fn finish(mut self) -> NodeId {
        if self.node.name.is_empty() {
            self.node.name = self.graph.fresh_name(&self.node.op_type);
        }

        let outputs = self.node.output_names.clone();
        let id = self.graph.graph.add_node(self.node);
        for (slot, output) in outputs.iter().enumerate() {
            self.graph.producers.insert(output.clone(), (id, slot as u8));
        }
        self.graph.sync_edges();
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn linear_chain() -> Graph {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_op("relu").name("a").input("x").output("y").finish();
        g.add_op("relu").name("b").input("y").output("z").finish();
        g.add_output("z");
        g
    }

    #[test]
    fn test_builder_registers_producers_and_edges() {
        let g = linear_chain();
        assert_eq!(g.node_count(), 2);
        assert!(g.producer("y").is_some());
        assert_eq!(g.consumers("y").len(), 1);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_toposort_orders_dependencies() {
        let g = linear_chain();
        let order = g.topological_sort().unwrap();
        let pos = |name: &str| {
            order
                .iter()
                .position(|&id| g.node(id).unwrap().name == name)
                .unwrap()
        };
        assert!(pos("a") < pos("b"));
    }

    #[test]
    fn test_remove_node_guards_consumers() {
        let mut g = linear_chain();
        let a = g.find_nodes("relu")[0];
        // "a" still feeds "b"
        assert!(g.remove_node(a).is_err());
    }

    #[test]
    fn test_replace_value_rewires_consumers_and_outputs() {
        let mut g = linear_chain();
        g.add_op("relu").name("c").input("x").output("w").finish();
        g.replace_value("z", "w");

        assert_eq!(g.outputs(), &["w".to_string()]);
        let b = g
            .nodes()
            .find(|(_, n)| n.name == "b")
            .map(|(id, _)| id)
            .unwrap();
        // b's output z now has no consumers and is no longer a graph output
        assert!(g.remove_node(b).is_ok());
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_validate_detects_dangling_input() {
        let mut g = Graph::new();
        g.add_op("relu").input("ghost").output("y").finish();
        g.add_output("y");
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_structural_equality() {
        let g = linear_chain();
        let mut h = g.clone();
        assert!(g.structurally_equal(&h));

        h.add_op("relu").name("extra").input("x").output("q").finish();
        assert!(!g.structurally_equal(&h));
    }

    #[test]
    fn test_constants() {
        let mut g = Graph::new();
        g.add_constant("w", Tensor::filled(1.0, vec![2]).into()).unwrap();
        assert!(g.has_constant("w"));
        assert!(g.add_constant("w", Tensor::filled(2.0, vec![2]).into()).is_err());
    }

    #[test]
    fn test_sole_consumer() {
        let g = linear_chain();
        assert!(g.sole_consumer("y").is_some());
        // z is a graph output
        assert!(g.sole_consumer("z").is_none());
    }
}
