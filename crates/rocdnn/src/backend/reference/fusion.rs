//! Fused operator chains.
//!
//! Compilation resolves every operator's descriptors into a [`Step`] and
//! rejects chains outside the two supported shapes. Execution threads one
//! dense intermediate through the steps and writes only the final result.

use super::conv::{self, Geometry};
use super::layers::{self, BnShape};
use super::memory;
use crate::activation::ActivationParams;
use crate::backend::{
    ConvPass, DescriptorConfig, FusionOpSpec, OpBinding, RawDescriptor, RawOp,
};
use crate::batchnorm::{param_layout, MIN_EPSILON};
use crate::convolution::ConvAlgorithm;
use crate::scalar::Scalar;
use crate::tensor::TensorLayout;
use crate::types::{ActivationMode, BatchNormMode, ConvFwdAlgorithm, FusionDirection};
use crate::{DnnError, DnnResult};
use rustc_hash::FxHashMap;

const COMPILE: &str = "miopenCompileFusionPlan";
const EXECUTE: &str = "miopenExecuteFusionPlan";

/// Resolves a descriptor id to its configuration.
pub(super) type Lookup<'a> = dyn Fn(RawDescriptor) -> DnnResult<DescriptorConfig> + 'a;

/// A plan as the backend stores it.
#[derive(Debug)]
pub(super) struct Plan {
    pub(super) direction: FusionDirection,
    pub(super) input: RawDescriptor,
    pub(super) ops: Vec<(RawOp, FusionOpSpec)>,
    pub(super) algorithm: Option<ConvFwdAlgorithm>,
    pub(super) compiled: Option<Compiled>,
}

impl Plan {
    pub(super) fn new(direction: FusionDirection, input: RawDescriptor) -> Self {
        Self {
            direction,
            input,
            ops: Vec::new(),
            algorithm: None,
            compiled: None,
        }
    }
}

#[derive(Debug)]
enum Step {
    Conv {
        geometry: Geometry,
        weights: TensorLayout,
        algorithm: ConvFwdAlgorithm,
    },
    Bias {
        bias: TensorLayout,
    },
    Activation {
        mode: ActivationMode,
    },
    ActivationBackward {
        mode: ActivationMode,
    },
    BatchNormInference {
        mode: BatchNormMode,
        params: TensorLayout,
    },
    BatchNormForward {
        mode: BatchNormMode,
        params: TensorLayout,
        running_stats: bool,
    },
    BatchNormBackward {
        mode: BatchNormMode,
        params: TensorLayout,
    },
}

/// A validated chain with every layout resolved.
#[derive(Debug)]
pub(super) struct Compiled {
    pub(super) input: TensorLayout,
    pub(super) output: TensorLayout,
    steps: Vec<(TensorLayout, Step)>,
}

fn tensor(op: &'static str, lookup: &Lookup<'_>, desc: RawDescriptor) -> DnnResult<TensorLayout> {
    match lookup(desc)? {
        DescriptorConfig::Tensor(layout) => Ok(layout),
        other => Err(DnnError::bad_param(
            op,
            format!("expected a tensor descriptor, got {:?}", other.kind()),
        )),
    }
}

fn conv_geometry(
    op: &'static str,
    lookup: &Lookup<'_>,
    input: &TensorLayout,
    conv: RawDescriptor,
    weights: RawDescriptor,
) -> DnnResult<(Geometry, TensorLayout, TensorLayout)> {
    let params = match lookup(conv)? {
        DescriptorConfig::Convolution(params) => params,
        other => {
            return Err(DnnError::bad_param(
                op,
                format!("expected a convolution descriptor, got {:?}", other.kind()),
            ))
        }
    };
    let wl = tensor(op, lookup, weights)?;
    let dims = params.output_dims(&input.dims, &wl.dims)?;
    let output = TensorLayout::packed(input.data_type, &dims)?;
    let geometry = Geometry::new(op, &params, input, &wl, &output)?;
    Ok((geometry, wl, output))
}

/// Geometry of the plan's convolution, which always sees the plan input.
pub(super) fn plan_conv_geometry(op: &'static str, plan: &Plan, lookup: &Lookup<'_>) -> DnnResult<Geometry> {
    let input = tensor(op, lookup, plan.input)?;
    plan.ops
        .iter()
        .find_map(|(_, spec)| match *spec {
            FusionOpSpec::ConvForward { conv, weights } => Some((conv, weights)),
            _ => None,
        })
        .ok_or_else(|| DnnError::bad_param(op, "plan has no convolution operator"))
        .and_then(|(conv, weights)| conv_geometry(op, lookup, &input, conv, weights))
        .map(|(geometry, _, _)| geometry)
}

/// Forward algorithms applicable to `geometry`, most preferred first.
pub(super) fn forward_algorithms(geometry: &Geometry) -> Vec<ConvFwdAlgorithm> {
    conv::candidates(ConvPass::Forward)
        .iter()
        .filter(|&&a| geometry.workspace_for(a).is_some())
        .filter_map(|&a| match a {
            ConvAlgorithm::Forward(a) => Some(a),
            _ => None,
        })
        .collect()
}

/// Position of an operator in the forward chain `conv -> bias -> bn -> act`.
const fn forward_stage(spec: &FusionOpSpec) -> Option<u8> {
    match spec {
        FusionOpSpec::ConvForward { .. } => Some(0),
        FusionOpSpec::BiasForward { .. } => Some(1),
        FusionOpSpec::BatchNormInference { .. } | FusionOpSpec::BatchNormForward { .. } => Some(2),
        FusionOpSpec::ActivationForward { .. } => Some(3),
        FusionOpSpec::ActivationBackward { .. } | FusionOpSpec::BatchNormBackward { .. } => None,
    }
}

fn check_chain(ops: &[(RawOp, FusionOpSpec)]) -> DnnResult<()> {
    let specs: Vec<&FusionOpSpec> = ops.iter().map(|(_, spec)| spec).collect();
    let stages: Vec<Option<u8>> = specs.iter().map(|s| forward_stage(s)).collect();

    if stages.iter().all(Option::is_some) {
        let ordered = stages.windows(2).all(|w| w[0] < w[1]);
        if !ordered {
            return Err(DnnError::unsupported(
                COMPILE,
                "forward operators must follow conv -> bias -> batchnorm -> activation, each at most once",
            ));
        }
        return Ok(());
    }

    match specs.as_slice() {
        [FusionOpSpec::ActivationBackward { mode }]
        | [FusionOpSpec::ActivationBackward { mode }, FusionOpSpec::BatchNormBackward { .. }] => {
            if matches!(mode, ActivationMode::Abs | ActivationMode::Power) {
                return Err(DnnError::unsupported(
                    COMPILE,
                    format!("fused {mode} gradient needs the forward input"),
                ));
            }
            Ok(())
        }
        _ => Err(DnnError::unsupported(
            COMPILE,
            "backward chains must be activation-backward -> batchnorm-backward",
        )),
    }
}

/// Validate and resolve `plan`.
pub(super) fn compile(plan: &Plan, lookup: &Lookup<'_>) -> DnnResult<Compiled> {
    if plan.direction != FusionDirection::Vertical {
        return Err(DnnError::not_implemented(
            COMPILE,
            "only vertical fusion is supported",
        ));
    }
    if plan.ops.is_empty() {
        return Err(DnnError::bad_param(COMPILE, "plan has no operators"));
    }
    let input = tensor(COMPILE, lookup, plan.input)?;
    if !input.data_type.is_floating_point() {
        return Err(DnnError::unsupported(
            COMPILE,
            format!("cannot fuse {} tensors", input.data_type),
        ));
    }
    check_chain(&plan.ops)?;

    let mut current = input.clone();
    let mut steps = Vec::with_capacity(plan.ops.len());
    for (_, spec) in &plan.ops {
        let reaching = current.clone();
        let step = match *spec {
            FusionOpSpec::ConvForward { conv, weights } => {
                let (geometry, weights, output) = conv_geometry(COMPILE, lookup, &current, conv, weights)?;
                let algorithm = match plan.algorithm {
                    Some(a) => a,
                    None => forward_algorithms(&geometry).first().copied().ok_or_else(|| {
                        DnnError::unsupported(COMPILE, "no algorithm applies to the fused convolution")
                    })?,
                };
                current = output;
                Step::Conv {
                    geometry,
                    weights,
                    algorithm,
                }
            }
            FusionOpSpec::BiasForward { bias } => {
                let bias = tensor(COMPILE, lookup, bias)?;
                if !layers::broadcasts(&bias.dims_usize(), &current.dims_usize()) {
                    return Err(DnnError::bad_param(
                        COMPILE,
                        format!("bias {bias} does not broadcast to {current}"),
                    ));
                }
                Step::Bias { bias }
            }
            FusionOpSpec::ActivationForward { mode } => Step::Activation { mode },
            FusionOpSpec::ActivationBackward { mode } => Step::ActivationBackward { mode },
            FusionOpSpec::BatchNormInference { mode, params } => Step::BatchNormInference {
                mode,
                params: tensor(COMPILE, lookup, params)?,
            },
            FusionOpSpec::BatchNormForward {
                mode,
                running_stats,
            } => Step::BatchNormForward {
                mode,
                params: param_layout(mode, &current)?,
                running_stats,
            },
            FusionOpSpec::BatchNormBackward { mode } => Step::BatchNormBackward {
                mode,
                params: param_layout(mode, &current)?,
            },
        };
        steps.push((reaching, step));
    }

    Ok(Compiled {
        input,
        output: current,
        steps,
    })
}

fn scaled(mut values: Vec<f32>, alpha: Scalar) -> Vec<f32> {
    let alpha = alpha.value();
    if (alpha - 1.0).abs() > f32::EPSILON {
        values.iter_mut().for_each(|v| *v *= alpha);
    }
    values
}

fn activation(mode: ActivationMode, c: &crate::backend::ActivationCoefficients) -> ActivationParams {
    ActivationParams::new(mode).with_coefficients(c.alpha, c.beta, c.gamma)
}

fn mismatch(step: &Step) -> DnnError {
    DnnError::bad_param(EXECUTE, format!("arguments do not fit operator {step:?}"))
}

impl Compiled {
    /// Run the chain on `input`, returning the final tensor.
    pub(super) fn run(
        &self,
        ops: &[(RawOp, FusionOpSpec)],
        bindings: &FxHashMap<u64, OpBinding>,
        input: Vec<f32>,
    ) -> DnnResult<Vec<f32>> {
        let mut current = input;
        for ((op, _), (layout, step)) in ops.iter().zip(&self.steps) {
            let binding = bindings.get(&op.as_raw()).ok_or_else(|| {
                DnnError::bad_param(EXECUTE, format!("operator {} has no arguments", op.as_raw()))
            })?;
            current = Self::apply(step, layout, binding, current)?;
        }
        Ok(current)
    }

    fn apply(step: &Step, layout: &TensorLayout, binding: &OpBinding, x: Vec<f32>) -> DnnResult<Vec<f32>> {
        let dims = layout.dims_usize();
        let out = match (step, *binding) {
            (
                Step::Conv {
                    geometry,
                    weights,
                    algorithm,
                },
                OpBinding::ConvForward { alpha, weights: w, .. },
            ) => {
                let w = memory::load(EXECUTE, weights, w)?;
                let algorithm = ConvAlgorithm::Forward(*algorithm);
                let mut scratch = if conv::uses_im2col(algorithm) {
                    vec![0.0f32; geometry.workspace_for(algorithm).unwrap_or(0) / 4]
                } else {
                    Vec::new()
                };
                let col = (!scratch.is_empty()).then_some(scratch.as_mut_slice());
                scaled(geometry.run(ConvPass::Forward, col, &x, &w), alpha)
            }
            (Step::Bias { bias }, OpBinding::BiasForward { alpha, bias: b, .. }) => {
                let b = memory::load(EXECUTE, bias, b)?;
                let b = layers::broadcast(&b, &bias.dims_usize(), &dims);
                scaled(x.iter().zip(&b).map(|(v, b)| v + b).collect(), alpha)
            }
            (
                Step::Activation { mode },
                OpBinding::ActivationForward {
                    alpha,
                    coefficients,
                    ..
                },
            ) => {
                let p = activation(*mode, &coefficients);
                scaled(x.iter().map(|&v| layers::activate(&p, v)).collect(), alpha)
            }
            (
                Step::ActivationBackward { mode },
                OpBinding::ActivationBackward {
                    alpha,
                    y,
                    coefficients,
                    ..
                },
            ) => {
                let p = activation(*mode, &coefficients);
                let y = memory::load(EXECUTE, layout, y)?;
                let dx = x
                    .iter()
                    .zip(&y)
                    .map(|(&d, &y)| d * layers::slope_from_output(&p, y).unwrap_or(0.0))
                    .collect();
                scaled(dx, alpha)
            }
            (
                Step::BatchNormInference { mode, params },
                OpBinding::BatchNormInference {
                    alpha,
                    scale,
                    bias,
                    mean,
                    variance,
                    epsilon,
                    ..
                },
            ) => {
                let shape = BnShape::new(*mode, &dims);
                let scale = memory::load(EXECUTE, params, scale)?;
                let bias = memory::load(EXECUTE, params, bias)?;
                let mean = memory::load(EXECUTE, params, mean)?;
                let variance = memory::load(EXECUTE, params, variance)?;
                let inv = layers::inverse_std(&variance, epsilon);
                scaled(shape.normalize(&x, &scale, &bias, &mean, &inv), alpha)
            }
            (
                Step::BatchNormForward {
                    mode,
                    params,
                    running_stats,
                },
                OpBinding::BatchNormForward {
                    alpha,
                    scale,
                    bias,
                    saved_mean,
                    saved_inv_variance,
                    running_mean,
                    running_variance,
                    factor,
                    epsilon,
                    ..
                },
            ) => {
                let shape = BnShape::new(*mode, &dims);
                let scale = memory::load(EXECUTE, params, scale)?;
                let bias = memory::load(EXECUTE, params, bias)?;
                let (mean, variance) = shape.statistics(&x);
                let inv = layers::inverse_std(&variance, epsilon);
                memory::store_optional(EXECUTE, params, saved_mean, &mean)?;
                memory::store_optional(EXECUTE, params, saved_inv_variance, &inv)?;
                if *running_stats {
                    super::update_running(
                        EXECUTE,
                        params,
                        &shape,
                        factor,
                        (running_mean, running_variance),
                        &mean,
                        &variance,
                    )?;
                }
                scaled(shape.normalize(&x, &scale, &bias, &mean, &inv), alpha)
            }
            (
                Step::BatchNormBackward { mode, params },
                OpBinding::BatchNormBackward {
                    alpha,
                    x: input,
                    scale,
                    scale_diff,
                    bias_diff,
                    saved_mean,
                    saved_inv_variance,
                    ..
                },
            ) => {
                let shape = BnShape::new(*mode, &dims);
                let input = memory::load(EXECUTE, layout, input)?;
                let scale = memory::load(EXECUTE, params, scale)?;
                let (mean, inv) = super::saved_or_recomputed(
                    EXECUTE,
                    params,
                    &shape,
                    &input,
                    (saved_mean, saved_inv_variance),
                    MIN_EPSILON,
                )?;
                let (dx, dscale, dbias) = shape.gradients(&input, &x, &scale, &mean, &inv);
                memory::store_optional(EXECUTE, params, scale_diff, &dscale)?;
                memory::store_optional(EXECUTE, params, bias_diff, &dbias)?;
                scaled(dx, alpha)
            }
            _ => return Err(mismatch(step)),
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn op(spec: FusionOpSpec) -> (RawOp, FusionOpSpec) {
        (RawOp(0), spec)
    }

    #[test]
    fn test_chain_shapes() {
        let d = RawDescriptor(1);
        let conv = FusionOpSpec::ConvForward {
            conv: d,
            weights: d,
        };
        let bias = FusionOpSpec::BiasForward { bias: d };
        let relu = FusionOpSpec::ActivationForward {
            mode: ActivationMode::Relu,
        };
        let relu_grad = FusionOpSpec::ActivationBackward {
            mode: ActivationMode::Relu,
        };
        let bn_grad = FusionOpSpec::BatchNormBackward {
            mode: BatchNormMode::Spatial,
        };

        assert!(check_chain(&[op(conv), op(bias), op(relu)]).is_ok());
        assert!(check_chain(&[op(bias), op(relu)]).is_ok());
        assert!(check_chain(&[op(relu_grad), op(bn_grad)]).is_ok());
        for bad in [
            vec![op(relu), op(bias)],
            vec![op(conv), op(conv)],
            vec![op(bn_grad), op(relu_grad)],
            vec![op(relu), op(bn_grad)],
            vec![op(FusionOpSpec::ActivationBackward {
                mode: ActivationMode::Abs,
            })],
        ] {
            assert!(matches!(
                check_chain(&bad),
                Err(DnnError::UnsupportedOp { .. })
            ));
        }
    }

    #[test]
    fn test_integer_input_unsupported() {
        let mut plan = Plan::new(FusionDirection::Vertical, RawDescriptor(1));
        plan.ops.push(op(FusionOpSpec::ActivationForward {
            mode: ActivationMode::Relu,
        }));
        let lookup = |_: RawDescriptor| -> DnnResult<DescriptorConfig> {
            Ok(DescriptorConfig::Tensor(
                TensorLayout::packed(DataType::Int8, &[1, 1, 1, 1]).unwrap(),
            ))
        };
        assert!(matches!(
            compile(&plan, &lookup),
            Err(DnnError::UnsupportedOp { .. })
        ));
    }
}
