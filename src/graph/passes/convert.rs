// Convert pass
//
// Replaces every observer with its frozen quantization parameters: each
// observed activation gets a quantize → dequantize node pair carrying the
// parameters as constant attributes; observed weights are resolved by
// quantizing the constant once at compile time and emitting only the
// dequantize node (weights never change across inferences, so the runtime
// quantize is folded away — numerically identical to the runtime path).
// Author-placed quant_stub nodes are consumed by the quantize that replaces
// them; dequant_stub nodes are spliced out since every quantized region
// already ends in a Convert-emitted dequantize.

use tracing::{debug, info};

use crate::error::{QuantError, Result};
use crate::graph::ir::{AttrValue, Graph, NodeId, ValueId};
use crate::graph::module::GraphModule;
use crate::observer::QParams;
use crate::ops::quantized;
use crate::tensor::QuantDType;

struct SitePlan {
    id: NodeId,
    qparams: QParams,
    dtype: QuantDType,
}

/// Replace observers with quantize/dequantize operations.
///
/// Returns a new module; the input module is never modified. Fails with
/// [`QuantError::InsufficientCalibrationData`] if any observer has seen no
/// batches — checked for every site before anything is transformed. On a
/// module with no observers this is a no-op.
pub fn convert(module: &GraphModule, entry: &str) -> Result<GraphModule> {
    let graph = module.graph(entry)?;
    let observe_nodes = graph.find_nodes("observe");
    let table = module.observers.get(entry);

    if observe_nodes.is_empty() && table.map_or(true, |t| t.is_empty()) {
        debug!("convert: no observers on '{entry}', nothing to do");
        return Ok(module.clone());
    }
    let table = table.ok_or_else(|| {
        QuantError::InvalidGraph(format!("'{entry}' has observe nodes but no observer table"))
    })?;

    // Freeze parameters for every site up front; any uncalibrated observer
    // aborts the pass before the clone is touched.
    let mut plans: Vec<SitePlan> = Vec::with_capacity(observe_nodes.len());
    for &id in &observe_nodes {
        let node = graph
            .node(id)
            .ok_or_else(|| QuantError::InvalidGraph(format!("missing node {id:?}")))?;
        let observer = table.get(&ValueId { node: id, slot: 0 }).ok_or_else(|| {
            QuantError::InvalidGraph(format!(
                "observe node '{}' has no side-table entry",
                node.name
            ))
        })?;
        if !observer.has_data() {
            return Err(QuantError::InsufficientCalibrationData {
                node: node.name.clone(),
            });
        }
        plans.push(SitePlan {
            id,
            qparams: observer.calculate_qparams(),
            dtype: observer.config().dtype,
        });
    }

    let mut out = module.clone();
    {
        // Node indices are preserved by the clone (StableGraph keeps its
        // arena layout), so the plans apply directly.
        let g = out.graph_mut(entry)?;
        for plan in &plans {
            convert_site(g, plan)?;
        }
        for id in g.find_nodes("dequant_stub") {
            let node = g
                .node(id)
                .ok_or_else(|| QuantError::InvalidGraph(format!("missing node {id:?}")))?
                .clone();
            g.replace_value(&node.output_names[0], &node.input_names[0]);
            g.remove_node(id)?;
        }
        g.validate()?;
    }
    out.observers.remove(entry);

    info!("convert: quantized {} sites on '{entry}'", plans.len());
    Ok(out)
}

fn convert_site(g: &mut Graph, plan: &SitePlan) -> Result<()> {
    let node = g
        .node(plan.id)
        .ok_or_else(|| QuantError::InvalidGraph(format!("missing node {:?}", plan.id)))?
        .clone();
    let observed = node.input_names[0].clone();
    let obs_out = node.output_names[0].clone();

    if g.has_constant(&observed) {
        fold_weight(g, plan, &observed, &obs_out)?;
    } else {
        insert_quant_dequant(g, plan, &observed, &obs_out)?;
    }
    Ok(())
}

/// Weight site: quantize the constant at compile time, emit only the
/// dequantize node.
fn fold_weight(g: &mut Graph, plan: &SitePlan, weight: &str, obs_out: &str) -> Result<()> {
    let value = g
        .constant(weight)
        .ok_or_else(|| QuantError::MissingConstant(weight.to_string()))?;
    let folded = quantized::quantize(value.as_float()?, plan.qparams, plan.dtype);

    let folded_name = format!("{weight}.quant");
    let dq_out = format!("{weight}.dq");
    g.add_constant(&folded_name, folded.into())?;
    g.add_op("dequantize")
        .input(&folded_name)
        .output(&dq_out)
        .finish();

    g.replace_value(obs_out, &dq_out);
    g.remove_node(plan.id)?;
    // The float weight is fully superseded by the folded constant.
    g.remove_constant(weight);

    debug!("folded weight '{weight}' (scale {})", plan.qparams.scale);
    Ok(())
}

/// Activation site: synthesize quantize → dequantize wired to the
/// observer's original consumers. A quant_stub producing the observed value
/// is consumed by the quantize node rather than duplicated around.
fn insert_quant_dequant(g: &mut Graph, plan: &SitePlan, observed: &str, obs_out: &str) -> Result<()> {
    let stub = g.producer(observed).filter(|(pid, _)| {
        g.node(*pid)
            .map_or(false, |n| n.op_type == "quant_stub")
    });
    let quantize_input = match stub {
        Some((stub_id, _)) => {
            let stub_node = g
                .node(stub_id)
                .ok_or_else(|| QuantError::InvalidGraph(format!("missing node {stub_id:?}")))?;
            stub_node.input_names[0].clone()
        }
        None => observed.to_string(),
    };

    let qp = plan.qparams;
    let q_out = format!("{observed}.q");
    let dq_out = format!("{observed}.dq");
    g.add_op("quantize")
        .input(&quantize_input)
        .output(&q_out)
        .attr("scale", AttrValue::Float(qp.scale))
        .attr("zero_point", AttrValue::Int(i64::from(qp.zero_point)))
        .attr("qmin", AttrValue::Int(i64::from(qp.qmin)))
        .attr("qmax", AttrValue::Int(i64::from(qp.qmax)))
        .attr("dtype", AttrValue::Str(plan.dtype.as_str().to_string()))
        .finish();
    g.add_op("dequantize").input(&q_out).output(&dq_out).finish();

    g.replace_value(obs_out, &dq_out);
    g.remove_node(plan.id)?;
    if let Some((stub_id, _)) = stub {
        g.remove_node(stub_id)?;
    }

    debug!(
        "quantized activation '{observed}' (scale {}, zero_point {})",
        qp.scale, qp.zero_point
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::passes::prepare;
    use crate::observer::QConfig;
    use crate::tensor::{Tensor, TensorValue};

    fn calibrated_linear_module() -> GraphModule {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_constant("fc.weight", Tensor::filled(0.5, vec![2, 2]).into())
            .unwrap();
        g.add_op("linear")
            .name("fc")
            .input("x")
            .input("fc.weight")
            .output("y")
            .finish();
        g.add_output("y");

        let module = GraphModule::new(g);
        let mut instrumented = prepare(&module, "forward", &QConfig::default()).unwrap();
        let x = Tensor::new(vec![1.0, 2.0], vec![1, 2]).unwrap();
        instrumented.forward("forward", &[x.into()]).unwrap();
        instrumented
    }

    #[test]
    fn test_convert_replaces_observers_with_quant_dequant() {
        let instrumented = calibrated_linear_module();
        let converted = convert(&instrumented, "forward").unwrap();

        let g = converted.graph("forward").unwrap();
        assert!(g.find_nodes("observe").is_empty());
        assert!(!converted.has_observers());
        // activation q/dq pair; weight contributes only a dequantize
        assert_eq!(g.find_nodes("quantize").len(), 1);
        assert_eq!(g.find_nodes("dequantize").len(), 2);
    }

    #[test]
    fn test_convert_folds_weight_to_quantized_constant() {
        let instrumented = calibrated_linear_module();
        let converted = convert(&instrumented, "forward").unwrap();

        let g = converted.graph("forward").unwrap();
        assert!(matches!(
            g.constant("fc.weight.quant"),
            Some(TensorValue::Quantized(_))
        ));
        // the float weight is gone
        assert!(!g.has_constant("fc.weight"));
    }

    #[test]
    fn test_convert_requires_calibration() {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_constant("fc.weight", Tensor::filled(0.5, vec![2, 2]).into())
            .unwrap();
        g.add_op("linear").input("x").input("fc.weight").output("y").finish();
        g.add_output("y");

        let instrumented =
            prepare(&GraphModule::new(g), "forward", &QConfig::default()).unwrap();
        let err = convert(&instrumented, "forward").unwrap_err();
        assert!(matches!(err, QuantError::InsufficientCalibrationData { .. }));
        // the instrumented module still carries its observers
        assert_eq!(instrumented.observer_count("forward"), 2);
    }

    #[test]
    fn test_convert_is_noop_when_already_converted() {
        let instrumented = calibrated_linear_module();
        let converted = convert(&instrumented, "forward").unwrap();
        let again = convert(&converted, "forward").unwrap();

        assert!(converted
            .graph("forward")
            .unwrap()
            .structurally_equal(again.graph("forward").unwrap()));
    }

    #[test]
    fn test_convert_consumes_stubs() {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_op("quant_stub").name("qs").input("x").output("x.quant").finish();
        g.add_op("relu").input("x.quant").output("y").finish();
        g.add_op("dequant_stub").name("dqs").input("y").output("out").finish();
        g.add_output("out");

        let mut instrumented =
            prepare(&GraphModule::new(g), "forward", &QConfig::default()).unwrap();
        let x = Tensor::new(vec![-1.0, 2.0], vec![2]).unwrap();
        instrumented.forward("forward", &[x.into()]).unwrap();

        let converted = convert(&instrumented, "forward").unwrap();
        let g = converted.graph("forward").unwrap();
        assert!(g.find_nodes("quant_stub").is_empty());
        assert!(g.find_nodes("dequant_stub").is_empty());
        // the stub seam became a real quantize fed by the raw input
        let q = g.find_nodes("quantize");
        assert!(q
            .iter()
            .any(|&id| g.node(id).unwrap().input_names == ["x".to_string()]));
    }
}
