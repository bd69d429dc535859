// Prepare pass
//
// Inserts one observer per quantizable value: an `observe` bookkeeping node
// spliced after the value plus a fresh entry in the module's observer
// side-table. Activation observers land on allowlisted op outputs and
// quant_stub outputs; weight observers land on constant weight inputs.
// An `add` whose sole consumer is a `relu` is a single site observed at the
// relu output, which is what lets Fusion form quantized::add_relu later.

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::error::{QuantError, Result};
use crate::graph::ir::{AttrValue, Graph, NodeId, ValueId};
use crate::graph::module::GraphModule;
use crate::observer::{Observer, ObserverConfig, QConfig};

/// Operators whose outputs (and weight inputs) are quantizable
pub const QUANTIZABLE_OPS: &[&str] = &["conv2d", "linear", "add", "relu"];

/// Input slot holding the weight constant, per operator
fn weight_input_slot(op_type: &str) -> Option<usize> {
    match op_type {
        "conv2d" | "linear" => Some(1),
        _ => None,
    }
}

fn contains_quantizable(graph: &Graph) -> bool {
    graph.nodes().any(|(_, node)| {
        QUANTIZABLE_OPS.contains(&node.op_type.as_str())
            || node
                .attributes
                .values()
                .any(|attr| matches!(attr, AttrValue::Graph(sub) if contains_quantizable(sub)))
    })
}

/// Instrument a method for calibration.
///
/// Returns a new module with observers inserted; the input module is never
/// modified. Fails with [`QuantError::UnsupportedGraphConstruct`] when a
/// quantizable op is guarded by control flow this pass cannot statically
/// instrument (a nested graph attribute), before any site is transformed.
pub fn prepare(module: &GraphModule, entry: &str, qconfig: &QConfig) -> Result<GraphModule> {
    let graph = module.graph(entry)?;

    // Reject statically uninstrumentable sites up front; the scan runs to
    // completion before anything is cloned or mutated.
    for (_, node) in graph.nodes() {
        let guarded = node
            .attributes
            .values()
            .any(|attr| matches!(attr, AttrValue::Graph(sub) if contains_quantizable(sub)));
        if guarded {
            return Err(QuantError::UnsupportedGraphConstruct {
                pass: "prepare",
                node: node.name.clone(),
            });
        }
    }

    let mut out = module.clone();
    let mut pending: Vec<(ValueId, ObserverConfig)> = Vec::new();

    {
        let g = out.graph_mut(entry)?;
        let (activation_sites, weight_sites) = collect_sites(g)?;

        for value in &activation_sites {
            let id = insert_observe(g, value);
            debug!("observing activation '{value}'");
            pending.push((ValueId { node: id, slot: 0 }, qconfig.activation));
        }
        for value in &weight_sites {
            let id = insert_observe(g, value);
            debug!("observing weight '{value}'");
            pending.push((ValueId { node: id, slot: 0 }, qconfig.weight));
        }

        g.validate()?;
    }

    let table = out.observers.entry(entry.to_string()).or_default();
    for (value, config) in pending {
        table.insert(value, Observer::new(config));
    }

    info!(
        "prepare: instrumented '{entry}' with {} observers",
        out.observer_count(entry)
    );
    Ok(out)
}

/// Splice an `observe` node after `value`: all existing consumers (and the
/// graph output list) are redirected to the observed copy.
fn insert_observe(g: &mut Graph, value: &str) -> NodeId {
    let obs_out = format!("{value}.obs");
    let id = g.add_op("observe").input(value).output(&obs_out).finish();
    g.replace_value_except(value, &obs_out, &[id]);
    id
}

/// Walk the graph in topological order collecting quantizable sites.
/// Every site gets its own observer; accumulator state is never shared.
fn collect_sites(g: &Graph) -> Result<(Vec<String>, Vec<String>)> {
    let mut activations: Vec<String> = Vec::new();
    let mut weights: Vec<String> = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut compound_relu: FxHashSet<NodeId> = FxHashSet::default();

    for id in g.topological_sort()? {
        let Some(node) = g.node(id) else { continue };

        if node.op_type == "quant_stub" {
            if let Some(output) = node.output_names.first() {
                if seen.insert(output.clone()) {
                    activations.push(output.clone());
                }
            }
            continue;
        }

        if !QUANTIZABLE_OPS.contains(&node.op_type.as_str()) {
            continue;
        }
        if node.op_type == "relu" && compound_relu.contains(&id) {
            continue;
        }

        let Some(output) = node.output_names.first() else {
            continue;
        };

        // add + relu is one site, observed at the relu output
        let mut site = output.clone();
        if node.op_type == "add" {
            if let Some(relu_id) = g.sole_consumer(output) {
                if let Some(relu) = g.node(relu_id) {
                    if relu.op_type == "relu" {
                        compound_relu.insert(relu_id);
                        site = relu.output_names[0].clone();
                    }
                }
            }
        }
        if seen.insert(site.clone()) {
            activations.push(site);
        }

        if let Some(slot) = weight_input_slot(&node.op_type) {
            if let Some(weight) = node.input_names.get(slot) {
                if g.has_constant(weight) && seen.insert(weight.clone()) {
                    weights.push(weight.clone());
                }
            }
        }
    }

    Ok((activations, weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn linear_module() -> GraphModule {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_constant("fc.weight", Tensor::filled(1.0, vec![2, 2]).into())
            .unwrap();
        g.add_op("linear")
            .name("fc")
            .input("x")
            .input("fc.weight")
            .output("y")
            .finish();
        g.add_output("y");
        GraphModule::new(g)
    }

    #[test]
    fn test_prepare_inserts_activation_and_weight_observers() {
        let module = linear_module();
        let instrumented = prepare(&module, "forward", &QConfig::default()).unwrap();

        assert_eq!(instrumented.observer_count("forward"), 2);
        let g = instrumented.graph("forward").unwrap();
        assert_eq!(g.find_nodes("observe").len(), 2);
        // the original module is untouched
        assert_eq!(module.graph("forward").unwrap().find_nodes("observe").len(), 0);
    }

    #[test]
    fn test_prepare_observes_graph_output_through_rewire() {
        let module = linear_module();
        let instrumented = prepare(&module, "forward", &QConfig::default()).unwrap();
        let g = instrumented.graph("forward").unwrap();

        // the graph output now reads the observed value
        assert_eq!(g.outputs(), &["y.obs".to_string()]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_add_relu_is_one_site() {
        let mut g = Graph::new();
        g.add_input("a");
        g.add_input("b");
        g.add_op("add").name("sum").input("a").input("b").output("s").finish();
        g.add_op("relu").name("act").input("s").output("r").finish();
        g.add_output("r");

        let instrumented =
            prepare(&GraphModule::new(g), "forward", &QConfig::default()).unwrap();
        // one observer at the relu output, none between add and relu
        assert_eq!(instrumented.observer_count("forward"), 1);
        let g = instrumented.graph("forward").unwrap();
        assert!(g.producer("r.obs").is_some());
        assert!(g.producer("s.obs").is_none());
    }

    #[test]
    fn test_control_flow_rejected_without_mutation() {
        let mut sub = Graph::new();
        sub.add_input("xb");
        sub.add_constant("w", Tensor::filled(1.0, vec![1, 1, 1, 1]).into())
            .unwrap();
        sub.add_op("conv2d").input("xb").input("w").output("yb").finish();
        sub.add_output("yb");

        let mut g = Graph::new();
        g.add_input("x");
        g.add_input("cond");
        g.add_op("if")
            .name("branch")
            .input("cond")
            .input("x")
            .attr("then_branch", AttrValue::Graph(Box::new(sub)))
            .output("y")
            .finish();
        g.add_output("y");

        let module = GraphModule::new(g);
        let snapshot = module.graph("forward").unwrap().clone();

        let err = prepare(&module, "forward", &QConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            QuantError::UnsupportedGraphConstruct { pass: "prepare", ref node } if node == "branch"
        ));
        assert!(module.graph("forward").unwrap().structurally_equal(&snapshot));
    }

    #[test]
    fn test_shared_weight_gets_single_observer() {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_constant("w", Tensor::filled(1.0, vec![2, 2]).into()).unwrap();
        g.add_op("linear").name("fc1").input("x").input("w").output("y1").finish();
        g.add_op("linear").name("fc2").input("x").input("w").output("y2").finish();
        g.add_output("y1");
        g.add_output("y2");

        let instrumented =
            prepare(&GraphModule::new(g), "forward", &QConfig::default()).unwrap();
        // two activation observers, one shared-weight observer
        assert_eq!(instrumented.observer_count("forward"), 3);
    }
}
