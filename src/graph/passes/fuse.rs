// Fusion pass
//
// Collapses dequantize → op → quantize chains into single fixed-point
// operators. A site matches when every quantizable input of the op is fed
// by a dequantize node and the op's sole consumer is a quantize node; the
// fused node consumes the quantized values directly, inherits the quantize
// node's output name (downstream wiring untouched), and carries the frozen
// output parameters forward as `out_*` attributes. A site with no fused
// kernel in the registry is left exactly as Convert produced it — no match
// is not a failure.

use tracing::{debug, info};

use crate::graph::ir::{AttrValue, Graph, Node, NodeId};

/// Operators with known fixed-point kernel equivalents
const FUSION_REGISTRY: &[(&str, &str)] = &[
    ("conv2d", "quantized::conv2d"),
    ("linear", "quantized::linear"),
    ("add", "quantized::add"),
    ("relu", "quantized::relu"),
];

fn fused_op(op_type: &str) -> Option<&'static str> {
    FUSION_REGISTRY
        .iter()
        .find(|(op, _)| *op == op_type)
        .map(|(_, fused)| *fused)
}

/// Input slots that must carry quantized tensors for the fused kernel
fn quantized_input_slots(op_type: &str) -> &'static [usize] {
    match op_type {
        "conv2d" | "linear" => &[0, 1],
        "add" => &[0, 1],
        _ => &[0],
    }
}

/// Fuse all matching sites in place. Never fails; returns the number of
/// sites fused.
pub fn fuse(graph: &mut Graph) -> usize {
    let Ok(order) = graph.topological_sort() else {
        return 0;
    };

    let mut fused = 0;
    for id in order {
        // earlier rewrites may have consumed this node
        if graph.node(id).is_none() {
            continue;
        }
        if try_fuse_site(graph, id) {
            fused += 1;
        }
    }

    if fused > 0 {
        info!("fuse: collapsed {fused} quantized sites");
    }
    fused
}

fn try_fuse_site(g: &mut Graph, id: NodeId) -> bool {
    let Some(node) = g.node(id).cloned() else {
        return false;
    };
    let Some(simple_fused) = fused_op(&node.op_type) else {
        return false;
    };
    if node.output_names.len() != 1 {
        return false;
    }

    // add + relu fuses as one compound kernel
    let (tail_id, tail_output, fused_name) = match compound_relu(g, &node) {
        Some((relu_id, relu_out)) => (Some(relu_id), relu_out, "quantized::add_relu"),
        None => (None, node.output_names[0].clone(), simple_fused),
    };

    // the chain must terminate in a quantize node
    let Some(q_id) = g.sole_consumer(&tail_output) else {
        return false;
    };
    let Some(q_node) = g.node(q_id).cloned() else {
        return false;
    };
    if q_node.op_type != "quantize" {
        return false;
    }

    // every quantizable input must be fed by a dequantize
    let mut fused_inputs = node.input_names.clone();
    let mut dequant_ids: Vec<NodeId> = Vec::new();
    for &slot in quantized_input_slots(&node.op_type) {
        let Some(input) = node.input_names.get(slot) else {
            return false;
        };
        let Some((producer_id, _)) = g.producer(input) else {
            return false;
        };
        let Some(producer) = g.node(producer_id) else {
            return false;
        };
        if producer.op_type != "dequantize" {
            return false;
        }
        fused_inputs[slot] = producer.input_names[0].clone();
        if !dequant_ids.contains(&producer_id) {
            dequant_ids.push(producer_id);
        }
    }

    // carry the frozen output parameters forward
    let Some(out_attrs) = output_attrs(&q_node) else {
        return false;
    };

    debug!("fusing '{}' into {fused_name}", node.name);

    let out_name = q_node.output_names[0].clone();
    g.remove_node_unchecked(q_id);
    if let Some(relu_id) = tail_id {
        g.remove_node_unchecked(relu_id);
    }
    g.remove_node_unchecked(id);

    let mut op = g.add_op(fused_name).name(&node.name);
    for input in &fused_inputs {
        op = op.input(input);
    }
    op = op.output(&out_name);
    for (key, value) in node.attributes {
        op = op.attr(key, value);
    }
    for (key, value) in out_attrs {
        op = op.attr(key, value);
    }
    op.finish();

    // drop dequantize nodes the fused kernel bypassed, unless something
    // else still reads them
    for dq_id in dequant_ids {
        let _ = g.remove_node(dq_id);
    }

    true
}

/// Detect the add→relu compound: the add's sole consumer is a relu
fn compound_relu(g: &Graph, node: &Node) -> Option<(NodeId, String)> {
    if node.op_type != "add" {
        return None;
    }
    let relu_id = g.sole_consumer(&node.output_names[0])?;
    let relu = g.node(relu_id)?;
    if relu.op_type != "relu" {
        return None;
    }
    Some((relu_id, relu.output_names[0].clone()))
}

/// Translate a quantize node's parameter attributes into the fused node's
/// `out_*` attributes
fn output_attrs(q_node: &Node) -> Option<Vec<(String, AttrValue)>> {
    Some(vec![
        (
            "out_scale".to_string(),
            AttrValue::Float(q_node.attr_f32("scale")?),
        ),
        (
            "out_zero_point".to_string(),
            AttrValue::Int(q_node.attr_i64("zero_point")?),
        ),
        (
            "out_qmin".to_string(),
            AttrValue::Int(q_node.attr_i64("qmin")?),
        ),
        (
            "out_qmax".to_string(),
            AttrValue::Int(q_node.attr_i64("qmax")?),
        ),
        (
            "out_dtype".to_string(),
            AttrValue::Str(q_node.attr_str("dtype")?.to_string()),
        ),
    ])
}
