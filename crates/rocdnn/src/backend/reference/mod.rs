//! Host reference backend.
//!
//! Every object lives in one mutex-guarded table keyed by a monotonically
//! increasing id; destroyed ids are removed, so using one afterwards fails
//! with [`DnnError::BadParam`]. Kernels read and write host memory through
//! the raw addresses in [`DevicePtr`]s, computing in `f32`.
//!
//! Convolution algorithms differ in applicability and workspace, mirroring
//! the vendor library, but GEMM variants are the only ones with a distinct
//! lowering; the rest share the direct kernels.

mod conv;
mod fusion;
mod layers;
mod memory;

use self::conv::Geometry;
use self::fusion::Plan;
use self::layers::BnShape;
use crate::activation::ActivationParams;
use crate::backend::{
    Backend, BatchNormBackwardArgs, BatchNormBackwardScales, BatchNormInferenceArgs,
    BatchNormTrainingArgs, ConvBuffers, ConvPass, ConvProblem, DescriptorConfig, DescriptorKind,
    FusionOpSpec, OpBinding, RawArgs, RawDescriptor, RawHandle, RawOp, RawPlan, SearchRequest,
    TensorArg, Workspace,
};
use crate::batchnorm::param_layout;
use crate::convolution::{ConvAlgorithm, ConvolutionParams, PerformanceRecord};
use crate::lrn::LrnParams;
use crate::memory::DevicePtr;
use crate::pooling::PoolingParams;
use crate::rnn::RnnParams;
use crate::scalar::Scalar;
use crate::tensor::{TensorLayout, MAX_TENSOR_RANK};
use crate::types::{
    BatchNormMode, ConvFwdAlgorithm, DataType, FusionDirection, IndexType, PoolingMode, TensorOp,
};
use crate::{DnnError, DnnResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
struct HandleState {
    stream: u64,
    profiling: bool,
    kernel_time: f32,
}

#[derive(Debug)]
struct DescriptorEntry {
    kind: DescriptorKind,
    config: Option<DescriptorConfig>,
    index_type: IndexType,
}

#[derive(Debug, Default)]
struct State {
    handles: FxHashMap<u64, HandleState>,
    descriptors: FxHashMap<u64, DescriptorEntry>,
    plans: FxHashMap<u64, Plan>,
    /// Operator id to owning plan and position.
    ops: FxHashMap<u64, (u64, usize)>,
    args: FxHashMap<u64, FxHashMap<u64, OpBinding>>,
}

/// Backend running every operation on the host.
///
/// Buffers must be host memory, such as [`HostBuffer`](crate::HostBuffer).
pub struct ReferenceBackend {
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl ReferenceBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(
        descriptors: &FxHashMap<u64, DescriptorEntry>,
        op: &'static str,
        desc: RawDescriptor,
    ) -> DnnResult<DescriptorConfig> {
        let entry = descriptors
            .get(&desc.as_raw())
            .ok_or_else(|| DnnError::bad_param(op, format!("unknown descriptor {}", desc.as_raw())))?;
        entry.config.clone().ok_or_else(|| {
            DnnError::bad_param(op, format!("{:?} descriptor {} was never set", entry.kind, desc.as_raw()))
        })
    }

    fn config(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<DescriptorConfig> {
        Self::lookup(&self.state.lock().descriptors, op, desc)
    }

    fn tensor(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<TensorLayout> {
        match self.config(op, desc)? {
            DescriptorConfig::Tensor(layout) => Ok(layout),
            other => Err(wrong_kind(op, DescriptorKind::Tensor, &other)),
        }
    }

    fn conv_params(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<ConvolutionParams> {
        match self.config(op, desc)? {
            DescriptorConfig::Convolution(params) => Ok(params),
            other => Err(wrong_kind(op, DescriptorKind::Convolution, &other)),
        }
    }

    fn activation(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<ActivationParams> {
        match self.config(op, desc)? {
            DescriptorConfig::Activation(params) => Ok(params),
            other => Err(wrong_kind(op, DescriptorKind::Activation, &other)),
        }
    }

    fn pooling(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<(PoolingParams, IndexType)> {
        let state = self.state.lock();
        let index = state
            .descriptors
            .get(&desc.as_raw())
            .map_or(IndexType::default(), |e| e.index_type);
        match Self::lookup(&state.descriptors, op, desc)? {
            DescriptorConfig::Pooling(params) => Ok((params, index)),
            other => Err(wrong_kind(op, DescriptorKind::Pooling, &other)),
        }
    }

    fn lrn(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<LrnParams> {
        match self.config(op, desc)? {
            DescriptorConfig::Lrn(params) => Ok(params),
            other => Err(wrong_kind(op, DescriptorKind::Lrn, &other)),
        }
    }

    fn rnn(&self, op: &'static str, desc: RawDescriptor) -> DnnResult<RnnParams> {
        match self.config(op, desc)? {
            DescriptorConfig::Rnn(params) => Ok(params),
            other => Err(wrong_kind(op, DescriptorKind::Rnn, &other)),
        }
    }

    fn load(&self, op: &'static str, arg: TensorArg) -> DnnResult<(TensorLayout, Vec<f32>)> {
        let layout = self.tensor(op, arg.desc)?;
        let values = memory::load(op, &layout, arg.ptr)?;
        Ok((layout, values))
    }

    fn store(
        &self,
        op: &'static str,
        arg: TensorArg,
        values: &[f32],
        alpha: Scalar,
        beta: Scalar,
    ) -> DnnResult<()> {
        let layout = self.tensor(op, arg.desc)?;
        memory::store(op, &layout, arg.ptr, values, alpha, beta)
    }

    fn with_handle<T>(
        &self,
        op: &'static str,
        handle: RawHandle,
        f: impl FnOnce(&mut HandleState) -> T,
    ) -> DnnResult<T> {
        let mut state = self.state.lock();
        let entry = state
            .handles
            .get_mut(&handle.as_raw())
            .ok_or_else(|| DnnError::bad_param(op, format!("unknown handle {}", handle.as_raw())))?;
        Ok(f(entry))
    }

    /// Run one kernel submitted through `handle`, timing it when profiling.
    fn kernel<T>(
        &self,
        op: &'static str,
        handle: RawHandle,
        f: impl FnOnce() -> DnnResult<T>,
    ) -> DnnResult<T> {
        let profiling = self.with_handle(op, handle, |h| h.profiling)?;
        let start = Instant::now();
        let out = f()?;
        if profiling {
            let elapsed = start.elapsed().as_secs_f32() * 1000.0;
            self.with_handle(op, handle, |h| h.kernel_time = elapsed)?;
        }
        tracing::trace!(op, handle = handle.as_raw(), "reference kernel done");
        Ok(out)
    }

    fn conv_setup(&self, op: &'static str, problem: &ConvProblem) -> DnnResult<(Geometry, [TensorLayout; 3])> {
        let params = self.conv_params(op, problem.conv)?;
        let x = self.tensor(op, problem.x)?;
        let w = self.tensor(op, problem.w)?;
        let y = self.tensor(op, problem.y)?;
        let geometry = Geometry::new(op, &params, &x, &w, &y)?;
        Ok((geometry, [x, w, y]))
    }

    fn plan_geometry(&self, op: &'static str, plan: RawPlan) -> DnnResult<Option<Geometry>> {
        let state = self.state.lock();
        let entry = plan_entry(&state.plans, op, plan)?;
        let has_conv = entry
            .ops
            .iter()
            .any(|(_, spec)| matches!(spec, FusionOpSpec::ConvForward { .. }));
        if !has_conv {
            return Ok(None);
        }
        let descriptors = &state.descriptors;
        let lookup = |d: RawDescriptor| Self::lookup(descriptors, op, d);
        fusion::plan_conv_geometry(op, entry, &lookup).map(Some)
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReferenceBackend")
            .field("handles", &state.handles.len())
            .field("descriptors", &state.descriptors.len())
            .field("plans", &state.plans.len())
            .finish()
    }
}

fn wrong_kind(op: &'static str, expected: DescriptorKind, got: &DescriptorConfig) -> DnnError {
    DnnError::bad_param(
        op,
        format!("expected a {expected:?} descriptor, got {:?}", got.kind()),
    )
}

fn plan_entry<'s>(plans: &'s FxHashMap<u64, Plan>, op: &'static str, plan: RawPlan) -> DnnResult<&'s Plan> {
    plans
        .get(&plan.as_raw())
        .ok_or_else(|| DnnError::bad_param(op, format!("unknown fusion plan {}", plan.as_raw())))
}

fn default_layout(rank: usize) -> DnnResult<TensorLayout> {
    TensorLayout::packed(DataType::Float32, &vec![1; rank])
}

fn same_dims(op: &'static str, a: &TensorLayout, b: &TensorLayout) -> DnnResult<()> {
    if a.dims == b.dims {
        Ok(())
    } else {
        Err(DnnError::bad_param(op, format!("{a} and {b} differ in shape")))
    }
}

fn require_rank4(op: &'static str, layout: &TensorLayout) -> DnnResult<()> {
    if layout.rank() == 4 {
        Ok(())
    } else {
        Err(DnnError::bad_param(op, format!("expected an NCHW tensor, got {layout}")))
    }
}

/// Check a workspace holds `needed` bytes.
fn require_workspace(op: &'static str, workspace: Workspace, needed: usize) -> DnnResult<()> {
    if workspace.bytes < needed || (needed > 0 && workspace.ptr.is_null()) {
        return Err(DnnError::bad_param(
            op,
            format!("workspace of {} bytes, {needed} required", workspace.bytes),
        ));
    }
    Ok(())
}

const fn conv_op(pass: ConvPass) -> &'static str {
    match pass {
        ConvPass::Forward => "miopenConvolutionForward",
        ConvPass::BackwardData => "miopenConvolutionBackwardData",
        ConvPass::BackwardWeights => "miopenConvolutionBackwardWeights",
    }
}

/// Run one convolution pass and blend the result into its output.
#[allow(clippy::too_many_arguments)]
fn run_conv(
    op: &'static str,
    geometry: &Geometry,
    [x, w, y]: &[TensorLayout; 3],
    algorithm: ConvAlgorithm,
    buffers: &ConvBuffers,
    alpha: Scalar,
    beta: Scalar,
    workspace: Workspace,
) -> DnnResult<()> {
    let pass = algorithm.pass();
    let (a, b, out, out_ptr) = match pass {
        ConvPass::Forward => (
            memory::load(op, x, buffers.x)?,
            memory::load(op, w, buffers.w)?,
            y,
            buffers.y,
        ),
        ConvPass::BackwardData => (
            memory::load(op, y, buffers.y)?,
            memory::load(op, w, buffers.w)?,
            x,
            buffers.x,
        ),
        ConvPass::BackwardWeights => (
            memory::load(op, x, buffers.x)?,
            memory::load(op, y, buffers.y)?,
            w,
            buffers.w,
        ),
    };
    let result = if conv::uses_im2col(algorithm) {
        let bytes = geometry.workspace_for(algorithm).unwrap_or(0);
        // Safety: the caller checked the workspace spans `bytes`.
        let col = unsafe { memory::floats_mut(workspace.ptr, bytes / 4) };
        geometry.run(pass, Some(col), &a, &b)
    } else {
        geometry.run(pass, None, &a, &b)
    };
    memory::store(op, out, out_ptr, &result, alpha, beta)
}

/// `running = (1 - factor) * running + factor * batch`, with the unbiased
/// batch variance.
#[allow(clippy::cast_possible_truncation)]
fn update_running(
    op: &'static str,
    params: &TensorLayout,
    shape: &BnShape,
    factor: f64,
    (running_mean, running_variance): (DevicePtr, DevicePtr),
    mean: &[f32],
    variance: &[f32],
) -> DnnResult<()> {
    let f = factor as f32;
    let m = shape.members();
    let correction = if m > 1 { m as f32 / (m - 1) as f32 } else { 1.0 };
    if let Some(old) = memory::load_optional(op, params, running_mean)? {
        let new: Vec<f32> = old.iter().zip(mean).map(|(o, b)| (1.0 - f) * o + f * b).collect();
        memory::overwrite(op, params, running_mean, &new)?;
    }
    if let Some(old) = memory::load_optional(op, params, running_variance)? {
        let new: Vec<f32> = old
            .iter()
            .zip(variance)
            .map(|(o, v)| (1.0 - f) * o + f * v * correction)
            .collect();
        memory::overwrite(op, params, running_variance, &new)?;
    }
    Ok(())
}

/// Saved statistics when both are given, batch statistics otherwise.
fn saved_or_recomputed(
    op: &'static str,
    params: &TensorLayout,
    shape: &BnShape,
    x: &[f32],
    (saved_mean, saved_inv): (DevicePtr, DevicePtr),
    epsilon: f64,
) -> DnnResult<(Vec<f32>, Vec<f32>)> {
    let mean = memory::load_optional(op, params, saved_mean)?;
    let inv = memory::load_optional(op, params, saved_inv)?;
    Ok(match (mean, inv) {
        (Some(mean), Some(inv)) => (mean, inv),
        _ => {
            let (mean, variance) = shape.statistics(x);
            let inv = layers::inverse_std(&variance, epsilon);
            (mean, inv)
        }
    })
}

const fn binding_fits(spec: &FusionOpSpec, binding: &OpBinding) -> bool {
    matches!(
        (spec, binding),
        (FusionOpSpec::ConvForward { .. }, OpBinding::ConvForward { .. })
            | (FusionOpSpec::BiasForward { .. }, OpBinding::BiasForward { .. })
            | (FusionOpSpec::ActivationForward { .. }, OpBinding::ActivationForward { .. })
            | (FusionOpSpec::ActivationBackward { .. }, OpBinding::ActivationBackward { .. })
            | (FusionOpSpec::BatchNormInference { .. }, OpBinding::BatchNormInference { .. })
            | (FusionOpSpec::BatchNormForward { .. }, OpBinding::BatchNormForward { .. })
            | (FusionOpSpec::BatchNormBackward { .. }, OpBinding::BatchNormBackward { .. })
    )
}

#[allow(clippy::too_many_arguments)]
impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    fn create_handle(&self) -> DnnResult<RawHandle> {
        let id = self.next_id();
        self.state.lock().handles.insert(id, HandleState::default());
        Ok(RawHandle(id))
    }

    fn destroy_handle(&self, handle: RawHandle) -> DnnResult<()> {
        self.state
            .lock()
            .handles
            .remove(&handle.as_raw())
            .map(drop)
            .ok_or_else(|| DnnError::bad_param("miopenDestroy", "unknown handle"))
    }

    fn set_stream(&self, handle: RawHandle, stream: u64) -> DnnResult<()> {
        self.with_handle("miopenSetStream", handle, |h| h.stream = stream)
    }

    fn stream(&self, handle: RawHandle) -> DnnResult<u64> {
        self.with_handle("miopenGetStream", handle, |h| h.stream)
    }

    fn enable_profiling(&self, handle: RawHandle, enable: bool) -> DnnResult<()> {
        self.with_handle("miopenEnableProfiling", handle, |h| h.profiling = enable)
    }

    fn kernel_time(&self, handle: RawHandle) -> DnnResult<f32> {
        self.with_handle("miopenGetKernelTime", handle, |h| h.kernel_time)
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    fn create_descriptor(&self, kind: DescriptorKind) -> DnnResult<RawDescriptor> {
        let id = self.next_id();
        self.state.lock().descriptors.insert(
            id,
            DescriptorEntry {
                kind,
                config: None,
                index_type: IndexType::default(),
            },
        );
        Ok(RawDescriptor(id))
    }

    fn destroy_descriptor(&self, kind: DescriptorKind, desc: RawDescriptor) -> DnnResult<()> {
        const OP: &str = "miopenDestroyDescriptor";
        let mut state = self.state.lock();
        match state.descriptors.get(&desc.as_raw()) {
            Some(entry) if entry.kind == kind => {
                state.descriptors.remove(&desc.as_raw());
                Ok(())
            }
            Some(entry) => Err(DnnError::bad_param(
                OP,
                format!("descriptor is a {:?}, not a {kind:?}", entry.kind),
            )),
            None => Err(DnnError::bad_param(OP, "unknown descriptor")),
        }
    }

    fn set_descriptor(&self, desc: RawDescriptor, config: &DescriptorConfig) -> DnnResult<()> {
        const OP: &str = "miopenSetDescriptor";
        let mut state = self.state.lock();
        let entry = state
            .descriptors
            .get_mut(&desc.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown descriptor"))?;
        if entry.kind != config.kind() {
            return Err(wrong_kind(OP, entry.kind, config));
        }
        entry.config = Some(config.clone());
        Ok(())
    }

    fn get_descriptor(
        &self,
        desc: RawDescriptor,
        kind: DescriptorKind,
        rank: usize,
    ) -> DnnResult<DescriptorConfig> {
        const OP: &str = "miopenGetDescriptor";
        let state = self.state.lock();
        let entry = state
            .descriptors
            .get(&desc.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown descriptor"))?;
        if entry.kind != kind {
            return Err(DnnError::bad_param(
                OP,
                format!("descriptor is a {:?}, not a {kind:?}", entry.kind),
            ));
        }
        match &entry.config {
            None if kind == DescriptorKind::Tensor => {
                if rank == 0 || rank > MAX_TENSOR_RANK {
                    return Err(DnnError::bad_param(OP, format!("cannot read {rank} dimensions")));
                }
                Ok(DescriptorConfig::Tensor(default_layout(rank)?))
            }
            None => Err(DnnError::bad_param(OP, "descriptor was never set")),
            Some(DescriptorConfig::Tensor(layout)) if layout.rank() != rank => Err(DnnError::bad_param(
                OP,
                format!("requested {rank} dimensions of a rank-{} tensor", layout.rank()),
            )),
            Some(DescriptorConfig::Convolution(params)) if params.spatial_rank() != rank => {
                Err(DnnError::bad_param(
                    OP,
                    format!(
                        "requested {rank} spatial dimensions of a {}-d convolution",
                        params.spatial_rank()
                    ),
                ))
            }
            Some(config) => Ok(config.clone()),
        }
    }

    fn tensor_num_bytes(&self, desc: RawDescriptor) -> DnnResult<usize> {
        const OP: &str = "miopenGetTensorNumBytes";
        let state = self.state.lock();
        match state.descriptors.get(&desc.as_raw()) {
            Some(DescriptorEntry {
                config: Some(DescriptorConfig::Tensor(layout)),
                ..
            }) => Ok(layout.num_bytes()),
            Some(DescriptorEntry {
                kind: DescriptorKind::Tensor,
                config: None,
                ..
            }) => Ok(default_layout(MAX_TENSOR_RANK)?.num_bytes()),
            Some(_) => Err(DnnError::bad_param(OP, "not a tensor descriptor")),
            None => Err(DnnError::bad_param(OP, "unknown descriptor")),
        }
    }

    fn set_pooling_index_type(&self, desc: RawDescriptor, index: IndexType) -> DnnResult<()> {
        const OP: &str = "miopenSetPoolingIndexType";
        let mut state = self.state.lock();
        match state.descriptors.get_mut(&desc.as_raw()) {
            Some(entry) if entry.kind == DescriptorKind::Pooling => {
                entry.index_type = index;
                Ok(())
            }
            _ => Err(DnnError::bad_param(OP, "not a pooling descriptor")),
        }
    }

    fn pooling_index_type(&self, desc: RawDescriptor) -> DnnResult<IndexType> {
        const OP: &str = "miopenGetPoolingIndexType";
        let state = self.state.lock();
        match state.descriptors.get(&desc.as_raw()) {
            Some(entry) if entry.kind == DescriptorKind::Pooling => Ok(entry.index_type),
            _ => Err(DnnError::bad_param(OP, "not a pooling descriptor")),
        }
    }

    fn derive_batch_norm_descriptor(
        &self,
        derived: RawDescriptor,
        x: RawDescriptor,
        mode: BatchNormMode,
    ) -> DnnResult<()> {
        const OP: &str = "miopenDeriveBNTensorDescriptor";
        let xl = self.tensor(OP, x)?;
        if !(4..=5).contains(&xl.rank()) {
            return Err(DnnError::bad_param(
                OP,
                format!("batch normalization needs a rank 4 or 5 input, got {xl}"),
            ));
        }
        let layout = param_layout(mode, &xl)?;
        self.set_descriptor(derived, &DescriptorConfig::Tensor(layout))
    }

    // ------------------------------------------------------------------
    // Convolution
    // ------------------------------------------------------------------

    fn conv_output_dim(
        &self,
        conv: RawDescriptor,
        x: RawDescriptor,
        w: RawDescriptor,
    ) -> DnnResult<Vec<i32>> {
        const OP: &str = "miopenGetConvolutionNdForwardOutputDim";
        let params = self.conv_params(OP, conv)?;
        let xl = self.tensor(OP, x)?;
        let wl = self.tensor(OP, w)?;
        Ok(params.output_dims(&xl.dims, &wl.dims)?.to_vec())
    }

    fn conv_workspace_size(&self, handle: RawHandle, problem: &ConvProblem) -> DnnResult<usize> {
        let op = conv_op(problem.pass);
        self.with_handle(op, handle, |_| ())?;
        let (geometry, _) = self.conv_setup(op, problem)?;
        Ok(geometry.max_workspace(problem.pass))
    }

    fn find_conv_algorithms(
        &self,
        handle: RawHandle,
        problem: &ConvProblem,
        buffers: &ConvBuffers,
        request: &SearchRequest,
    ) -> DnnResult<Vec<PerformanceRecord>> {
        let op = conv_op(problem.pass);
        let (geometry, layouts) = self.conv_setup(op, problem)?;
        let workspace = request.workspace;
        let candidates = conv::candidates(problem.pass)
            .iter()
            .filter(|&&a| request.exhaustive || !conv::exhaustive_only(a))
            .filter_map(|&a| geometry.workspace_for(a).map(|bytes| (a, bytes)))
            .filter(|&(_, bytes)| require_workspace(op, workspace, bytes).is_ok());

        let mut records = Vec::new();
        for (algorithm, bytes) in candidates {
            let start = Instant::now();
            self.kernel(op, handle, || {
                run_conv(op, &geometry, &layouts, algorithm, buffers, Scalar::ONE, Scalar::ZERO, workspace)
            })?;
            records.push(PerformanceRecord {
                algorithm,
                time_ms: start.elapsed().as_secs_f32() * 1000.0,
                workspace_bytes: bytes,
            });
        }
        records.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
        records.truncate(request.request_count);
        tracing::debug!(op, found = records.len(), "algorithm search finished");
        Ok(records)
    }

    fn convolution(
        &self,
        handle: RawHandle,
        problem: &ConvProblem,
        algorithm: ConvAlgorithm,
        buffers: &ConvBuffers,
        alpha: Scalar,
        beta: Scalar,
        workspace: Workspace,
    ) -> DnnResult<()> {
        let op = conv_op(problem.pass);
        if algorithm.pass() != problem.pass {
            return Err(DnnError::bad_param(
                op,
                format!("{algorithm} cannot run a {} pass", problem.pass.name()),
            ));
        }
        let (geometry, layouts) = self.conv_setup(op, problem)?;
        let needed = geometry
            .workspace_for(algorithm)
            .ok_or_else(|| DnnError::bad_param(op, format!("{algorithm} does not apply to this problem")))?;
        require_workspace(op, workspace, needed)?;
        self.kernel(op, handle, || {
            run_conv(op, &geometry, &layouts, algorithm, buffers, alpha, beta, workspace)
        })
    }

    fn convolution_forward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        bias: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenConvolutionForwardBias";
        self.kernel(OP, handle, || {
            let (bl, b) = self.load(OP, bias)?;
            let yl = self.tensor(OP, y.desc)?;
            let (from, to) = (bl.dims_usize(), yl.dims_usize());
            if !layers::broadcasts(&from, &to) {
                return Err(DnnError::bad_param(OP, format!("bias {bl} does not broadcast to {yl}")));
            }
            memory::store(OP, &yl, y.ptr, &layers::broadcast(&b, &from, &to), alpha, beta)
        })
    }

    fn convolution_backward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        dy: TensorArg,
        beta: Scalar,
        db: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenConvolutionBackwardBias";
        self.kernel(OP, handle, || {
            let (yl, d) = self.load(OP, dy)?;
            let bl = self.tensor(OP, db.desc)?;
            let (from, to) = (yl.dims_usize(), bl.dims_usize());
            if !layers::broadcasts(&to, &from) {
                return Err(DnnError::bad_param(OP, format!("{bl} is not a reduction of {yl}")));
            }
            memory::store(OP, &bl, db.ptr, &layers::reduce(&d, &from, &to), alpha, beta)
        })
    }

    // ------------------------------------------------------------------
    // Tensor operations
    // ------------------------------------------------------------------

    fn set_tensor(&self, handle: RawHandle, y: TensorArg, value: Scalar) -> DnnResult<()> {
        const OP: &str = "miopenSetTensor";
        self.kernel(OP, handle, || {
            let layout = self.tensor(OP, y.desc)?;
            memory::overwrite(OP, &layout, y.ptr, &vec![value.value(); layout.volume()])
        })
    }

    fn scale_tensor(&self, handle: RawHandle, y: TensorArg, alpha: Scalar) -> DnnResult<()> {
        const OP: &str = "miopenScaleTensor";
        self.kernel(OP, handle, || {
            let (_, values) = self.load(OP, y)?;
            self.store(OP, y, &values, alpha, Scalar::ZERO)
        })
    }

    fn transform_tensor(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenTransformTensor";
        self.kernel(OP, handle, || {
            let (xl, values) = self.load(OP, x)?;
            same_dims(OP, &xl, &self.tensor(OP, y.desc)?)?;
            self.store(OP, y, &values, alpha, beta)
        })
    }

    fn op_tensor(
        &self,
        handle: RawHandle,
        op: TensorOp,
        alpha1: Scalar,
        a: TensorArg,
        alpha2: Scalar,
        b: TensorArg,
        beta: Scalar,
        c: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenOpTensor";
        self.kernel(OP, handle, || {
            let (al, av) = self.load(OP, a)?;
            let (bl, bv) = self.load(OP, b)?;
            let cl = self.tensor(OP, c.desc)?;
            same_dims(OP, &al, &cl)?;
            let (from, to) = (bl.dims_usize(), cl.dims_usize());
            if !layers::broadcasts(&from, &to) {
                return Err(DnnError::bad_param(OP, format!("{bl} does not broadcast to {cl}")));
            }
            let bv = layers::broadcast(&bv, &from, &to);
            let (s1, s2) = (alpha1.value(), alpha2.value());
            let out: Vec<f32> = av.iter().zip(&bv).map(|(&a, &b)| op.apply(s1 * a, s2 * b)).collect();
            memory::store(OP, &cl, c.ptr, &out, Scalar::ONE, beta)
        })
    }

    // ------------------------------------------------------------------
    // Activation, softmax
    // ------------------------------------------------------------------

    fn activation_forward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenActivationForward";
        self.kernel(OP, handle, || {
            let params = self.activation(OP, desc)?;
            let (_, xv) = self.load(OP, x)?;
            let out: Vec<f32> = xv.iter().map(|&v| layers::activate(&params, v)).collect();
            self.store(OP, y, &out, alpha, beta)
        })
    }

    fn activation_backward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        y: TensorArg,
        dy: TensorArg,
        x: TensorArg,
        beta: Scalar,
        dx: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenActivationBackward";
        self.kernel(OP, handle, || {
            let params = self.activation(OP, desc)?;
            let (_, yv) = self.load(OP, y)?;
            let (_, dyv) = self.load(OP, dy)?;
            let (_, xv) = self.load(OP, x)?;
            let out: Vec<f32> = (0..xv.len())
                .map(|i| dyv[i] * layers::slope(&params, xv[i], yv[i]))
                .collect();
            self.store(OP, dx, &out, alpha, beta)
        })
    }

    fn softmax_forward(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenSoftmaxForward";
        self.kernel(OP, handle, || {
            let (xl, xv) = self.load(OP, x)?;
            let out = layers::softmax(&xl.dims_usize(), &xv);
            self.store(OP, y, &out, alpha, beta)
        })
    }

    fn softmax_backward(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        y: TensorArg,
        dy: TensorArg,
        beta: Scalar,
        dx: TensorArg,
    ) -> DnnResult<()> {
        const OP: &str = "miopenSoftmaxBackward";
        self.kernel(OP, handle, || {
            let (yl, yv) = self.load(OP, y)?;
            let (_, dyv) = self.load(OP, dy)?;
            let out = layers::softmax_grad(&yl.dims_usize(), &yv, &dyv);
            self.store(OP, dx, &out, alpha, beta)
        })
    }

    // ------------------------------------------------------------------
    // Pooling, LRN
    // ------------------------------------------------------------------

    fn pooling_output_dim(&self, desc: RawDescriptor, x: RawDescriptor) -> DnnResult<Vec<i32>> {
        const OP: &str = "miopenGetPoolingForwardOutputDim";
        let (params, _) = self.pooling(OP, desc)?;
        let xl = self.tensor(OP, x)?;
        Ok(params.output_dims(&xl.dims)?.to_vec())
    }

    fn pooling_workspace_size(&self, desc: RawDescriptor, y: RawDescriptor) -> DnnResult<usize> {
        const OP: &str = "miopenPoolingGetWorkSpaceSize";
        let (_, index) = self.pooling(OP, desc)?;
        Ok(self.tensor(OP, y)?.volume() * index.size_bytes())
    }

    fn pooling_forward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
        do_backward: bool,
        workspace: Workspace,
    ) -> DnnResult<()> {
        const OP: &str = "miopenPoolingForward";
        self.kernel(OP, handle, || {
            let (params, index) = self.pooling(OP, desc)?;
            let (xl, xv) = self.load(OP, x)?;
            let yl = self.tensor(OP, y.desc)?;
            require_rank4(OP, &xl)?;
            let (out, argmax) = layers::pool(&params, &xl.dims_usize(), &yl.dims_usize(), &xv);
            if do_backward && params.mode == PoolingMode::Max {
                let needed = argmax.len() * index.size_bytes();
                require_workspace(OP, workspace, needed)?;
                // Safety: the workspace spans `needed` bytes.
                let bytes = unsafe { memory::bytes_mut(workspace.ptr, needed) };
                layers::encode_indices(&argmax, index.size_bytes(), bytes);
            }
            memory::store(OP, &yl, y.ptr, &out, alpha, beta)
        })
    }

    fn pooling_backward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        y: TensorArg,
        dy: TensorArg,
        x: TensorArg,
        beta: Scalar,
        dx: TensorArg,
        workspace: Workspace,
    ) -> DnnResult<()> {
        const OP: &str = "miopenPoolingBackward";
        self.kernel(OP, handle, || {
            let (params, index) = self.pooling(OP, desc)?;
            let yl = self.tensor(OP, y.desc)?;
            let xl = self.tensor(OP, x.desc)?;
            require_rank4(OP, &xl)?;
            let (_, dyv) = self.load(OP, dy)?;
            let argmax = if params.mode == PoolingMode::Max {
                let needed = yl.volume() * index.size_bytes();
                require_workspace(OP, workspace, needed)?;
                // Safety: the workspace spans `needed` bytes.
                let bytes = unsafe { memory::bytes_mut(workspace.ptr, needed) };
                layers::decode_indices(bytes, index.size_bytes(), yl.volume())
            } else {
                Vec::new()
            };
            let out = layers::pool_grad(&params, &xl.dims_usize(), &yl.dims_usize(), &dyv, &argmax);
            self.store(OP, dx, &out, alpha, beta)
        })
    }

    fn lrn_workspace_size(&self, y: RawDescriptor) -> DnnResult<usize> {
        let layout = self.tensor("miopenLRNGetWorkSpaceSize", y)?;
        Ok(layout.volume() * std::mem::size_of::<f32>())
    }

    fn lrn_forward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
        do_backward: bool,
        workspace: Workspace,
    ) -> DnnResult<()> {
        const OP: &str = "miopenLRNForward";
        self.kernel(OP, handle, || {
            let params = self.lrn(OP, desc)?;
            let (xl, xv) = self.load(OP, x)?;
            require_rank4(OP, &xl)?;
            let scale = layers::lrn_scale(&params, &xl.dims_usize(), &xv);
            if do_backward {
                require_workspace(OP, workspace, scale.len() * 4)?;
                // Safety: the workspace spans one float per element.
                unsafe { memory::floats_mut(workspace.ptr, scale.len()) }.copy_from_slice(&scale);
            }
            let out = layers::lrn(&params, &xv, &scale);
            self.store(OP, y, &out, alpha, beta)
        })
    }

    fn lrn_backward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        y: TensorArg,
        dy: TensorArg,
        x: TensorArg,
        beta: Scalar,
        dx: TensorArg,
        workspace: Workspace,
    ) -> DnnResult<()> {
        const OP: &str = "miopenLRNBackward";
        self.kernel(OP, handle, || {
            let params = self.lrn(OP, desc)?;
            let (xl, xv) = self.load(OP, x)?;
            require_rank4(OP, &xl)?;
            let (_, yv) = self.load(OP, y)?;
            let (_, dyv) = self.load(OP, dy)?;
            require_workspace(OP, workspace, xv.len() * 4)?;
            // Safety: the workspace spans one float per element.
            let scale = unsafe { memory::floats_mut(workspace.ptr, xv.len()) }.to_vec();
            let out = layers::lrn_grad(&params, &xl.dims_usize(), &xv, &yv, &dyv, &scale);
            self.store(OP, dx, &out, alpha, beta)
        })
    }

    // ------------------------------------------------------------------
    // Batch normalization
    // ------------------------------------------------------------------

    fn batch_norm_inference(
        &self,
        handle: RawHandle,
        mode: BatchNormMode,
        alpha: Scalar,
        beta: Scalar,
        x: TensorArg,
        y: TensorArg,
        params: &BatchNormInferenceArgs,
    ) -> DnnResult<()> {
        const OP: &str = "miopenBatchNormalizationForwardInference";
        self.kernel(OP, handle, || {
            let (xl, xv) = self.load(OP, x)?;
            let pl = self.tensor(OP, params.desc)?;
            let shape = BnShape::new(mode, &xl.dims_usize());
            let scale = memory::load(OP, &pl, params.scale)?;
            let bias = memory::load(OP, &pl, params.bias)?;
            let mean = memory::load_optional(OP, &pl, params.mean)?;
            let variance = memory::load_optional(OP, &pl, params.variance)?;
            let (mean, variance) = match (mean, variance) {
                (Some(mean), Some(variance)) => (mean, variance),
                _ => shape.statistics(&xv),
            };
            let inv = layers::inverse_std(&variance, params.epsilon);
            let out = shape.normalize(&xv, &scale, &bias, &mean, &inv);
            self.store(OP, y, &out, alpha, beta)
        })
    }

    fn batch_norm_training(
        &self,
        handle: RawHandle,
        mode: BatchNormMode,
        alpha: Scalar,
        beta: Scalar,
        x: TensorArg,
        y: TensorArg,
        params: &BatchNormTrainingArgs,
    ) -> DnnResult<()> {
        const OP: &str = "miopenBatchNormalizationForwardTraining";
        self.kernel(OP, handle, || {
            let (xl, xv) = self.load(OP, x)?;
            let pl = self.tensor(OP, params.desc)?;
            let shape = BnShape::new(mode, &xl.dims_usize());
            let scale = memory::load(OP, &pl, params.scale)?;
            let bias = memory::load(OP, &pl, params.bias)?;
            let (mean, variance) = shape.statistics(&xv);
            let inv = layers::inverse_std(&variance, params.epsilon);
            update_running(
                OP,
                &pl,
                &shape,
                params.factor,
                (params.running_mean, params.running_variance),
                &mean,
                &variance,
            )?;
            memory::store_optional(OP, &pl, params.save_mean, &mean)?;
            memory::store_optional(OP, &pl, params.save_inv_variance, &inv)?;
            let out = shape.normalize(&xv, &scale, &bias, &mean, &inv);
            self.store(OP, y, &out, alpha, beta)
        })
    }

    fn batch_norm_backward(
        &self,
        handle: RawHandle,
        mode: BatchNormMode,
        scales: &BatchNormBackwardScales,
        x: TensorArg,
        dy: TensorArg,
        dx: TensorArg,
        params: &BatchNormBackwardArgs,
    ) -> DnnResult<()> {
        const OP: &str = "miopenBatchNormalizationBackward";
        self.kernel(OP, handle, || {
            let (xl, xv) = self.load(OP, x)?;
            let (_, dyv) = self.load(OP, dy)?;
            let pl = self.tensor(OP, params.desc)?;
            let shape = BnShape::new(mode, &xl.dims_usize());
            let scale = memory::load(OP, &pl, params.scale)?;
            let (mean, inv) = saved_or_recomputed(
                OP,
                &pl,
                &shape,
                &xv,
                (params.saved_mean, params.saved_inv_variance),
                params.epsilon,
            )?;
            let (dxv, dscale, dbias) = shape.gradients(&xv, &dyv, &scale, &mean, &inv);
            self.store(OP, dx, &dxv, scales.alpha_data, scales.beta_data)?;
            for (ptr, values) in [(params.scale_diff, &dscale), (params.bias_diff, &dbias)] {
                if !ptr.is_null() {
                    memory::store(OP, &pl, ptr, values, scales.alpha_param, scales.beta_param)?;
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // RNN sizing
    // ------------------------------------------------------------------

    fn rnn_workspace_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        xs: &[RawDescriptor],
    ) -> DnnResult<usize> {
        const OP: &str = "miopenGetRNNWorkspaceSize";
        self.with_handle(OP, handle, |_| ())?;
        let params = self.rnn(OP, desc)?;
        let batches = xs
            .iter()
            .map(|&x| Ok(self.tensor(OP, x)?.dims_usize()[0]))
            .collect::<DnnResult<Vec<usize>>>()?;
        Ok(layers::rnn_workspace_elements(&params, &batches) * params.data_type.size_bytes())
    }

    fn rnn_training_reserve_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        xs: &[RawDescriptor],
    ) -> DnnResult<usize> {
        // Activations are kept for every gate and the hidden state.
        Ok(2 * self.rnn_workspace_size(handle, desc, xs)?)
    }

    fn rnn_params_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        x: RawDescriptor,
        data_type: DataType,
    ) -> DnnResult<usize> {
        const OP: &str = "miopenGetRNNParamsSize";
        self.with_handle(OP, handle, |_| ())?;
        let params = self.rnn(OP, desc)?;
        let xl = self.tensor(OP, x)?;
        let input = xl.dims_usize().get(1).copied().unwrap_or(0);
        Ok(layers::rnn_param_elements(&params, input) * data_type.size_bytes())
    }

    // ------------------------------------------------------------------
    // Fusion
    // ------------------------------------------------------------------

    fn create_fusion_plan(
        &self,
        direction: FusionDirection,
        input: RawDescriptor,
    ) -> DnnResult<RawPlan> {
        const OP: &str = "miopenCreateFusionPlan";
        if direction != FusionDirection::Vertical {
            return Err(DnnError::not_implemented(OP, "only vertical fusion is supported"));
        }
        self.tensor(OP, input)?;
        let id = self.next_id();
        self.state.lock().plans.insert(id, Plan::new(direction, input));
        Ok(RawPlan(id))
    }

    fn destroy_fusion_plan(&self, plan: RawPlan) -> DnnResult<()> {
        let mut state = self.state.lock();
        let removed = state
            .plans
            .remove(&plan.as_raw())
            .ok_or_else(|| DnnError::bad_param("miopenDestroyFusionPlan", "unknown fusion plan"))?;
        for (op, _) in &removed.ops {
            state.ops.remove(&op.as_raw());
        }
        Ok(())
    }

    fn create_fusion_op(&self, plan: RawPlan, spec: &FusionOpSpec) -> DnnResult<RawOp> {
        const OP: &str = "miopenCreateOp";
        let id = self.next_id();
        let mut state = self.state.lock();
        let entry = state
            .plans
            .get_mut(&plan.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown fusion plan"))?;
        if entry.compiled.is_some() {
            return Err(DnnError::bad_param(OP, "plan is already compiled"));
        }
        let index = entry.ops.len();
        entry.ops.push((RawOp(id), *spec));
        state.ops.insert(id, (plan.as_raw(), index));
        Ok(RawOp(id))
    }

    fn compile_fusion_plan(&self, handle: RawHandle, plan: RawPlan) -> DnnResult<()> {
        const OP: &str = "miopenCompileFusionPlan";
        self.with_handle(OP, handle, |_| ())?;
        let mut state = self.state.lock();
        let State {
            descriptors, plans, ..
        } = &mut *state;
        let entry = plans
            .get_mut(&plan.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown fusion plan"))?;
        if entry.compiled.is_some() {
            return Err(DnnError::bad_param(OP, "plan is already compiled"));
        }
        let descriptors = &*descriptors;
        let lookup = |d: RawDescriptor| Self::lookup(descriptors, OP, d);
        let compiled = fusion::compile(entry, &lookup)?;
        tracing::debug!(plan = plan.as_raw(), output = %compiled.output, "reference plan compiled");
        entry.compiled = Some(compiled);
        Ok(())
    }

    fn fusion_workspace_size(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<usize> {
        const OP: &str = "miopenFusionPlanGetWorkSpaceSize";
        self.with_handle(OP, handle, |_| ())?;
        match self.plan_geometry(OP, plan)? {
            None => Ok(0),
            Some(geometry) => geometry
                .workspace_for(ConvAlgorithm::Forward(algorithm))
                .ok_or_else(|| DnnError::bad_param(OP, format!("{algorithm} does not apply to the fused convolution"))),
        }
    }

    fn fusion_conv_algorithms(
        &self,
        plan: RawPlan,
        request_count: usize,
    ) -> DnnResult<Vec<ConvFwdAlgorithm>> {
        const OP: &str = "miopenFusionPlanConvolutionGetAlgo";
        let geometry = self
            .plan_geometry(OP, plan)?
            .ok_or_else(|| DnnError::bad_param(OP, "plan has no convolution operator"))?;
        let mut algorithms = fusion::forward_algorithms(&geometry);
        algorithms.truncate(request_count);
        Ok(algorithms)
    }

    fn fusion_set_conv_algorithm(
        &self,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<()> {
        const OP: &str = "miopenFusionPlanConvolutionSetAlgo";
        let geometry = self
            .plan_geometry(OP, plan)?
            .ok_or_else(|| DnnError::bad_param(OP, "plan has no convolution operator"))?;
        if geometry.workspace_for(ConvAlgorithm::Forward(algorithm)).is_none() {
            return Err(DnnError::bad_param(
                OP,
                format!("{algorithm} does not apply to the fused convolution"),
            ));
        }
        let mut state = self.state.lock();
        let entry = state
            .plans
            .get_mut(&plan.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown fusion plan"))?;
        if entry.compiled.is_some() {
            return Err(DnnError::bad_param(OP, "plan is already compiled"));
        }
        entry.algorithm = Some(algorithm);
        Ok(())
    }

    fn create_operator_args(&self) -> DnnResult<RawArgs> {
        let id = self.next_id();
        self.state.lock().args.insert(id, FxHashMap::default());
        Ok(RawArgs(id))
    }

    fn destroy_operator_args(&self, args: RawArgs) -> DnnResult<()> {
        self.state
            .lock()
            .args
            .remove(&args.as_raw())
            .map(drop)
            .ok_or_else(|| DnnError::bad_param("miopenDestroyOperatorArgs", "unknown argument table"))
    }

    fn set_operator_args(&self, args: RawArgs, op: RawOp, binding: &OpBinding) -> DnnResult<()> {
        const OP: &str = "miopenSetOpArgs";
        let mut state = self.state.lock();
        let &(plan, index) = state
            .ops
            .get(&op.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown fusion operator"))?;
        let spec = state
            .plans
            .get(&plan)
            .and_then(|p| p.ops.get(index))
            .map(|(_, spec)| *spec)
            .ok_or_else(|| DnnError::bad_param(OP, "operator's plan was destroyed"))?;
        if !binding_fits(&spec, binding) {
            return Err(DnnError::bad_param(
                OP,
                format!("arguments {binding:?} do not fit operator {spec:?}"),
            ));
        }
        state
            .args
            .get_mut(&args.as_raw())
            .ok_or_else(|| DnnError::bad_param(OP, "unknown argument table"))?
            .insert(op.as_raw(), *binding);
        Ok(())
    }

    fn execute_fusion_plan(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        input: TensorArg,
        output: TensorArg,
        args: RawArgs,
    ) -> DnnResult<()> {
        const OP: &str = "miopenExecuteFusionPlan";
        self.kernel(OP, handle, || {
            let il = self.tensor(OP, input.desc)?;
            let ol = self.tensor(OP, output.desc)?;
            let state = self.state.lock();
            let entry = plan_entry(&state.plans, OP, plan)?;
            let compiled = entry
                .compiled
                .as_ref()
                .ok_or_else(|| DnnError::bad_param(OP, "plan has not been compiled"))?;
            same_dims(OP, &il, &compiled.input)?;
            same_dims(OP, &ol, &compiled.output)?;
            let bindings = state
                .args
                .get(&args.as_raw())
                .ok_or_else(|| DnnError::bad_param(OP, "unknown argument table"))?;
            let x = memory::load(OP, &il, input.ptr)?;
            let out = compiled.run(&entry.ops, bindings, x)?;
            memory::overwrite(OP, &ol, output.ptr, &out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceMemory, HostBuffer};

    fn tensor(backend: &ReferenceBackend, dims: &[i32]) -> RawDescriptor {
        let desc = backend.create_descriptor(DescriptorKind::Tensor).unwrap();
        let layout = TensorLayout::packed(DataType::Float32, dims).unwrap();
        backend
            .set_descriptor(desc, &DescriptorConfig::Tensor(layout))
            .unwrap();
        desc
    }

    #[test]
    fn test_destroyed_ids_are_rejected() {
        let backend = ReferenceBackend::new();
        let handle = backend.create_handle().unwrap();
        backend.destroy_handle(handle).unwrap();
        assert!(matches!(backend.stream(handle), Err(DnnError::BadParam { .. })));
        assert!(backend.destroy_handle(handle).is_err());

        let desc = tensor(&backend, &[2, 2]);
        assert_eq!(backend.tensor_num_bytes(desc).unwrap(), 16);
        assert!(backend.destroy_descriptor(DescriptorKind::Pooling, desc).is_err());
        backend.destroy_descriptor(DescriptorKind::Tensor, desc).unwrap();
        assert!(backend.tensor_num_bytes(desc).is_err());
    }

    #[test]
    fn test_descriptor_kinds_are_checked() {
        let backend = ReferenceBackend::new();
        let desc = backend.create_descriptor(DescriptorKind::Lrn).unwrap();
        let layout = TensorLayout::packed(DataType::Float32, &[1]).unwrap();
        assert!(backend
            .set_descriptor(desc, &DescriptorConfig::Tensor(layout))
            .is_err());
        assert!(matches!(
            backend.get_descriptor(desc, DescriptorKind::Lrn, 0),
            Err(DnnError::BadParam { .. })
        ));
    }

    #[test]
    fn test_profiling_records_kernel_time() {
        let backend = ReferenceBackend::new();
        let handle = backend.create_handle().unwrap();
        backend.enable_profiling(handle, true).unwrap();
        let desc = tensor(&backend, &[64]);
        let buf = HostBuffer::<f32>::new(64);
        backend
            .set_tensor(handle, TensorArg::new(desc, buf.device_ptr()), Scalar::from(2.0f32))
            .unwrap();
        assert!(backend.kernel_time(handle).unwrap() >= 0.0);
        assert_eq!(buf.to_vec(), vec![2.0; 64]);
    }

    #[test]
    fn test_inapplicable_algorithm_rejected() {
        let backend = ReferenceBackend::new();
        let handle = backend.create_handle().unwrap();
        let conv = backend.create_descriptor(DescriptorKind::Convolution).unwrap();
        backend
            .set_descriptor(
                conv,
                &DescriptorConfig::Convolution(ConvolutionParams::new(&[0, 0], &[2, 2], &[1, 1])),
            )
            .unwrap();
        let problem = ConvProblem {
            pass: ConvPass::Forward,
            conv,
            x: tensor(&backend, &[1, 1, 4, 4]),
            w: tensor(&backend, &[1, 1, 2, 2]),
            y: tensor(&backend, &[1, 1, 2, 2]),
        };
        let (x, w, y) = (
            HostBuffer::<f32>::new(16),
            HostBuffer::<f32>::new(4),
            HostBuffer::<f32>::new(4),
        );
        let buffers = ConvBuffers {
            x: x.device_ptr(),
            w: w.device_ptr(),
            y: y.device_ptr(),
        };
        let err = backend
            .convolution(
                handle,
                &problem,
                ConvAlgorithm::Forward(ConvFwdAlgorithm::Winograd),
                &buffers,
                Scalar::ONE,
                Scalar::ZERO,
                Workspace::none(),
            )
            .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));

        // GEMM needs its im2col buffer.
        let err = backend
            .convolution(
                handle,
                &problem,
                ConvAlgorithm::Forward(ConvFwdAlgorithm::Gemm),
                &buffers,
                Scalar::ONE,
                Scalar::ZERO,
                Workspace::none(),
            )
            .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_bindings_must_fit_operator() {
        let backend = ReferenceBackend::new();
        let input = tensor(&backend, &[1, 1, 1, 1]);
        let plan = backend
            .create_fusion_plan(FusionDirection::Vertical, input)
            .unwrap();
        let op = backend
            .create_fusion_op(
                plan,
                &FusionOpSpec::ActivationForward {
                    mode: crate::types::ActivationMode::Relu,
                },
            )
            .unwrap();
        let args = backend.create_operator_args().unwrap();
        let bias = OpBinding::BiasForward {
            alpha: Scalar::ONE,
            beta: Scalar::ZERO,
            bias: DevicePtr::null(),
        };
        assert!(backend.set_operator_args(args, op, &bias).is_err());

        backend.destroy_fusion_plan(plan).unwrap();
        assert!(backend.set_operator_args(args, op, &bias).is_err());
        backend.destroy_operator_args(args).unwrap();
    }
}
