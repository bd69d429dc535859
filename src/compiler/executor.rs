//! Reference graph interpreter
//!
//! Walks a method graph in topological order with a name-keyed tensor
//! cache, dispatching kernels by operator name. During calibration the
//! `observe` bookkeeping nodes update their observer side-table entries as
//! a side effect and pass their input through unchanged; execution never
//! mutates graph structure.

use rustc_hash::FxHashMap;

use crate::error::{QuantError, Result};
use crate::graph::{Graph, Node, NodeId, ValueId};
use crate::observer::{ObserverTable, QParams};
use crate::ops::{float, quantized};
use crate::tensor::{QuantDType, TensorValue};

/// Execute a graph on the given inputs.
///
/// `observers` is present only while the module is instrumented; a graph
/// containing `observe` nodes without a matching table entry is invalid.
pub(crate) fn run(
    graph: &Graph,
    mut observers: Option<&mut ObserverTable>,
    inputs: &[TensorValue],
) -> Result<Vec<TensorValue>> {
    if inputs.len() != graph.inputs().len() {
        return Err(QuantError::InvalidGraph(format!(
            "expected {} inputs, got {}",
            graph.inputs().len(),
            inputs.len()
        )));
    }

    let mut cache: FxHashMap<String, TensorValue> = FxHashMap::default();
    for (name, value) in graph.constants() {
        cache.insert(name.clone(), value.clone());
    }
    for (name, value) in graph.inputs().iter().zip(inputs.iter()) {
        cache.insert(name.clone(), value.clone());
    }

    for id in graph.topological_sort()? {
        let node = graph
            .node(id)
            .ok_or_else(|| QuantError::InvalidGraph(format!("missing node {id:?}")))?;

        let args: Vec<TensorValue> = node
            .input_names
            .iter()
            .map(|name| {
                cache
                    .get(name)
                    .cloned()
                    .ok_or_else(|| QuantError::MissingConstant(name.clone()))
            })
            .collect::<Result<_>>()?;

        let outputs = eval_node(id, node, &args, observers.as_deref_mut())?;
        if outputs.len() != node.output_names.len() {
            return Err(QuantError::InvalidGraph(format!(
                "node '{}' produced {} outputs, declared {}",
                node.name,
                outputs.len(),
                node.output_names.len()
            )));
        }
        for (name, value) in node.output_names.iter().zip(outputs) {
            cache.insert(name.clone(), value);
        }
    }

    graph
        .outputs()
        .iter()
        .map(|name| {
            cache
                .get(name)
                .cloned()
                .ok_or_else(|| QuantError::MissingConstant(name.clone()))
        })
        .collect()
}

fn eval_node(
    id: NodeId,
    node: &Node,
    args: &[TensorValue],
    observers: Option<&mut ObserverTable>,
) -> Result<Vec<TensorValue>> {
    let arg = |i: usize| -> Result<&TensorValue> {
        args.get(i).ok_or_else(|| {
            QuantError::InvalidGraph(format!("node '{}' missing input {i}", node.name))
        })
    };

    match node.op_type.as_str() {
        // Author-placed boundary markers are float identities until Convert
        // consumes them.
        "quant_stub" | "dequant_stub" => Ok(vec![arg(0)?.clone()]),

        "observe" => {
            let table = observers.ok_or_else(|| {
                QuantError::InvalidGraph(format!(
                    "observe node '{}' without an observer table",
                    node.name
                ))
            })?;
            let observer = table.get_mut(&ValueId { node: id, slot: 0 }).ok_or_else(|| {
                QuantError::InvalidGraph(format!(
                    "observe node '{}' has no side-table entry",
                    node.name
                ))
            })?;
            observer.observe(arg(0)?.as_float()?.data());
            Ok(vec![arg(0)?.clone()])
        }

        "quantize" => {
            let qparams = node_qparams(node, "")?;
            let dtype = node_dtype(node, "dtype")?;
            Ok(vec![
                quantized::quantize(arg(0)?.as_float()?, qparams, dtype).into(),
            ])
        }

        "dequantize" => Ok(vec![quantized::dequantize(arg(0)?.as_quantized()?).into()]),

        "conv2d" => {
            let (stride, padding) = conv_geometry(node);
            let bias = match args.get(2) {
                Some(v) => Some(v.as_float()?),
                None => None,
            };
            Ok(vec![float::conv2d(
                arg(0)?.as_float()?,
                arg(1)?.as_float()?,
                bias,
                stride,
                padding,
            )?
            .into()])
        }

        "linear" => {
            let bias = match args.get(2) {
                Some(v) => Some(v.as_float()?),
                None => None,
            };
            Ok(vec![
                float::linear(arg(0)?.as_float()?, arg(1)?.as_float()?, bias)?.into(),
            ])
        }

        "add" => Ok(vec![
            float::add(arg(0)?.as_float()?, arg(1)?.as_float()?)?.into(),
        ]),

        "relu" => Ok(vec![float::relu(arg(0)?.as_float()?).into()]),

        "quantized::conv2d" => {
            let (stride, padding) = conv_geometry(node);
            let qparams = node_qparams(node, "out_")?;
            let dtype = node_dtype(node, "out_dtype")?;
            let bias = match args.get(2) {
                Some(v) => Some(v.as_float()?),
                None => None,
            };
            Ok(vec![quantized::conv2d(
                arg(0)?.as_quantized()?,
                arg(1)?.as_quantized()?,
                bias,
                stride,
                padding,
                qparams,
                dtype,
            )?
            .into()])
        }

        "quantized::linear" => {
            let qparams = node_qparams(node, "out_")?;
            let dtype = node_dtype(node, "out_dtype")?;
            let bias = match args.get(2) {
                Some(v) => Some(v.as_float()?),
                None => None,
            };
            Ok(vec![quantized::linear(
                arg(0)?.as_quantized()?,
                arg(1)?.as_quantized()?,
                bias,
                qparams,
                dtype,
            )?
            .into()])
        }

        "quantized::add" => {
            let qparams = node_qparams(node, "out_")?;
            let dtype = node_dtype(node, "out_dtype")?;
            Ok(vec![quantized::add(
                arg(0)?.as_quantized()?,
                arg(1)?.as_quantized()?,
                qparams,
                dtype,
            )?
            .into()])
        }

        "quantized::add_relu" => {
            let qparams = node_qparams(node, "out_")?;
            let dtype = node_dtype(node, "out_dtype")?;
            Ok(vec![quantized::add_relu(
                arg(0)?.as_quantized()?,
                arg(1)?.as_quantized()?,
                qparams,
                dtype,
            )?
            .into()])
        }

        "quantized::relu" => {
            let qparams = node_qparams(node, "out_")?;
            let dtype = node_dtype(node, "out_dtype")?;
            Ok(vec![
                quantized::relu(arg(0)?.as_quantized()?, qparams, dtype).into(),
            ])
        }

        other => Err(QuantError::UnsupportedOp(other.to_string())),
    }
}

/// Read frozen qparams from node attributes with the given prefix
/// ("" for quantize nodes, "out_" for fused kernels)
fn node_qparams(node: &Node, prefix: &str) -> Result<QParams> {
    let f32_attr = |suffix: &str| {
        node.attr_f32(&format!("{prefix}{suffix}"))
            .ok_or_else(|| QuantError::MissingAttribute(format!("{prefix}{suffix}")))
    };
    let i64_attr = |suffix: &str| {
        node.attr_i64(&format!("{prefix}{suffix}"))
            .ok_or_else(|| QuantError::MissingAttribute(format!("{prefix}{suffix}")))
    };

    Ok(QParams {
        scale: f32_attr("scale")?,
        zero_point: i64_attr("zero_point")? as i32,
        qmin: i64_attr("qmin")? as i32,
        qmax: i64_attr("qmax")? as i32,
    })
}

fn node_dtype(node: &Node, attr: &str) -> Result<QuantDType> {
    let s = node
        .attr_str(attr)
        .ok_or_else(|| QuantError::MissingAttribute(attr.to_string()))?;
    QuantDType::parse(s)
}

/// Stride/padding attributes with the usual defaults
fn conv_geometry(node: &Node) -> ((usize, usize), (usize, usize)) {
    let pair = |name: &str, default: usize| match node.attr_ints(name) {
        Some([a, b]) => (*a as usize, *b as usize),
        _ => (default, default),
    };
    (pair("stride", 1), pair("padding", 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphModule;
    use crate::observer::{Observer, ObserverConfig};
    use crate::tensor::Tensor;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_forward_small_float_graph() {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_constant("w", Tensor::new(vec![1.0, 1.0], vec![1, 2]).unwrap().into())
            .unwrap();
        g.add_op("linear").input("x").input("w").output("y").finish();
        g.add_op("relu").input("y").output("out").finish();
        g.add_output("out");

        let mut module = GraphModule::new(g);
        let x = Tensor::new(vec![2.0, -5.0], vec![1, 2]).unwrap();
        let out = module.forward("forward", &[x.into()]).unwrap();

        // linear sums to -3.0, relu clamps to 0
        assert_abs_diff_eq!(out[0].as_float().unwrap().data()[0], 0.0);
    }

    #[test]
    fn test_observe_node_updates_side_table() {
        let mut g = Graph::new();
        g.add_input("x");
        let obs_id = g.add_op("observe").input("x").output("x.obs").finish();
        g.add_output("x.obs");

        let mut module = GraphModule::new(g);
        module.observers.entry("forward".to_string()).or_default().insert(
            ValueId {
                node: obs_id,
                slot: 0,
            },
            Observer::new(ObserverConfig::activation()),
        );

        let x = Tensor::new(vec![1.0, 3.0], vec![2]).unwrap();
        let out = module.forward("forward", &[x.clone().into()]).unwrap();

        // Pass-through value, mutated statistics
        assert_eq!(out[0].as_float().unwrap().data(), x.data());
        let table = &module.observers["forward"];
        let observer = &table[&ValueId {
            node: obs_id,
            slot: 0,
        }];
        assert_eq!(observer.batches(), 1);
    }

    #[test]
    fn test_unknown_op_is_an_error() {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_op("gelu").input("x").output("y").finish();
        g.add_output("y");

        let mut module = GraphModule::new(g);
        let err = module
            .forward("forward", &[Tensor::filled(1.0, vec![1]).into()])
            .unwrap_err();
        assert!(matches!(err, QuantError::UnsupportedOp(_)));
    }
}
