//! Convolution algorithm planning.
//!
//! Choosing a convolution algorithm is a three-step protocol, run once per
//! problem shape:
//!
//! ```text
//!  Unconfigured ──workspace_size──▶ WorkspaceSized ──find──▶ Searched
//!                                                              │
//!                                   select_fastest / select_within_budget
//!                                                              ▼
//!                                                       AlgorithmBound
//! ```
//!
//! The planner is generic over a direction marker ([`Forward`],
//! [`BackwardData`], [`BackwardWeights`]). Each direction has its own
//! algorithm enumeration, so a backward-data algorithm can never be handed to
//! a forward execution.

use crate::backend::{ConvBuffers, ConvPass, ConvProblem, SearchRequest, Workspace};
use crate::convolution::{ConvolutionDescriptor, ConvolutionParams};
use crate::handle::Handle;
use crate::memory::{DeviceMemory, DevicePtr};
use crate::tensor::{TensorDescriptor, TensorLayout};
use crate::types::{ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm, ConvFwdAlgorithm};
use crate::{DnnError, DnnResult};
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// An algorithm of any convolution pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConvAlgorithm {
    /// Forward algorithm.
    Forward(ConvFwdAlgorithm),
    /// Backward-data algorithm.
    BackwardData(ConvBwdDataAlgorithm),
    /// Backward-weights algorithm.
    BackwardWeights(ConvBwdWeightsAlgorithm),
}

impl ConvAlgorithm {
    /// The pass the algorithm belongs to.
    #[must_use]
    pub const fn pass(self) -> ConvPass {
        match self {
            Self::Forward(_) => ConvPass::Forward,
            Self::BackwardData(_) => ConvPass::BackwardData,
            Self::BackwardWeights(_) => ConvPass::BackwardWeights,
        }
    }

    /// Native value of the algorithm within its pass.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Forward(a) => a.as_raw(),
            Self::BackwardData(a) => a.as_raw(),
            Self::BackwardWeights(a) => a.as_raw(),
        }
    }

    /// Decode a native value for `pass`.
    #[must_use]
    pub const fn from_raw(pass: ConvPass, raw: i32) -> Option<Self> {
        match pass {
            ConvPass::Forward => match ConvFwdAlgorithm::from_raw(raw) {
                Some(a) => Some(Self::Forward(a)),
                None => None,
            },
            ConvPass::BackwardData => match ConvBwdDataAlgorithm::from_raw(raw) {
                Some(a) => Some(Self::BackwardData(a)),
                None => None,
            },
            ConvPass::BackwardWeights => match ConvBwdWeightsAlgorithm::from_raw(raw) {
                Some(a) => Some(Self::BackwardWeights(a)),
                None => None,
            },
        }
    }

    /// Algorithm name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Forward(a) => a.name(),
            Self::BackwardData(a) => a.name(),
            Self::BackwardWeights(a) => a.name(),
        }
    }
}

impl fmt::Display for ConvAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pass().name(), self.name())
    }
}

/// One benchmarked algorithm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceRecord {
    /// Algorithm measured.
    pub algorithm: ConvAlgorithm,
    /// Measured time in milliseconds.
    pub time_ms: f32,
    /// Workspace the algorithm needs.
    pub workspace_bytes: usize,
}

mod sealed {
    pub trait Sealed {}
}

/// A convolution pass, as a type.
pub trait ConvDirection: sealed::Sealed + 'static {
    /// Algorithm enumeration of the pass.
    type Algorithm: Copy + fmt::Debug + PartialEq + Eq + Hash + Send + Sync;

    /// The pass.
    const PASS: ConvPass;

    /// Tag an algorithm.
    fn wrap(algorithm: Self::Algorithm) -> ConvAlgorithm;

    /// Untag an algorithm of this pass.
    fn unwrap(algorithm: ConvAlgorithm) -> Option<Self::Algorithm>;
}

/// Forward pass marker.
#[derive(Clone, Copy, Debug)]
pub enum Forward {}

/// Backward-data pass marker.
#[derive(Clone, Copy, Debug)]
pub enum BackwardData {}

/// Backward-weights pass marker.
#[derive(Clone, Copy, Debug)]
pub enum BackwardWeights {}

impl sealed::Sealed for Forward {}
impl sealed::Sealed for BackwardData {}
impl sealed::Sealed for BackwardWeights {}

impl ConvDirection for Forward {
    type Algorithm = ConvFwdAlgorithm;
    const PASS: ConvPass = ConvPass::Forward;

    fn wrap(algorithm: ConvFwdAlgorithm) -> ConvAlgorithm {
        ConvAlgorithm::Forward(algorithm)
    }

    fn unwrap(algorithm: ConvAlgorithm) -> Option<ConvFwdAlgorithm> {
        match algorithm {
            ConvAlgorithm::Forward(a) => Some(a),
            _ => None,
        }
    }
}

impl ConvDirection for BackwardData {
    type Algorithm = ConvBwdDataAlgorithm;
    const PASS: ConvPass = ConvPass::BackwardData;

    fn wrap(algorithm: ConvBwdDataAlgorithm) -> ConvAlgorithm {
        ConvAlgorithm::BackwardData(algorithm)
    }

    fn unwrap(algorithm: ConvAlgorithm) -> Option<ConvBwdDataAlgorithm> {
        match algorithm {
            ConvAlgorithm::BackwardData(a) => Some(a),
            _ => None,
        }
    }
}

impl ConvDirection for BackwardWeights {
    type Algorithm = ConvBwdWeightsAlgorithm;
    const PASS: ConvPass = ConvPass::BackwardWeights;

    fn wrap(algorithm: ConvBwdWeightsAlgorithm) -> ConvAlgorithm {
        ConvAlgorithm::BackwardWeights(algorithm)
    }

    fn unwrap(algorithm: ConvAlgorithm) -> Option<ConvBwdWeightsAlgorithm> {
        match algorithm {
            ConvAlgorithm::BackwardWeights(a) => Some(a),
            _ => None,
        }
    }
}

/// Hash of everything an algorithm choice depends on.
pub(crate) fn fingerprint(
    pass: ConvPass,
    params: &ConvolutionParams,
    x: &TensorLayout,
    w: &TensorLayout,
    y: &TensorLayout,
) -> u64 {
    let mut hasher = FxHasher::default();
    pass.hash(&mut hasher);
    params.hash(&mut hasher);
    x.hash(&mut hasher);
    w.hash(&mut hasher);
    y.hash(&mut hasher);
    hasher.finish()
}

/// An algorithm chosen by a [`Planner`], valid for one problem shape.
pub struct BoundAlgorithm<D: ConvDirection> {
    algorithm: D::Algorithm,
    workspace_bytes: usize,
    time_ms: f32,
    fingerprint: u64,
    _direction: PhantomData<fn() -> D>,
}

impl<D: ConvDirection> BoundAlgorithm<D> {
    /// The algorithm.
    #[must_use]
    pub fn algorithm(&self) -> D::Algorithm {
        self.algorithm
    }

    /// Workspace the algorithm needs.
    #[must_use]
    pub const fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }

    /// Time measured during the search.
    #[must_use]
    pub const fn time_ms(&self) -> f32 {
        self.time_ms
    }

    pub(crate) const fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl<D: ConvDirection> Clone for BoundAlgorithm<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: ConvDirection> Copy for BoundAlgorithm<D> {}

impl<D: ConvDirection> fmt::Debug for BoundAlgorithm<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundAlgorithm")
            .field("algorithm", &self.algorithm)
            .field("workspace_bytes", &self.workspace_bytes)
            .field("time_ms", &self.time_ms)
            .finish()
    }
}

/// Where a [`Planner`] is in its protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannerState {
    /// Nothing queried yet.
    Unconfigured,
    /// Workspace size known.
    WorkspaceSized,
    /// Ranked results available.
    Searched,
    /// An algorithm has been handed out.
    AlgorithmBound,
}

/// Algorithm planner for one convolution problem and pass.
///
/// Tensors are always named in forward order: `x` is the input (or `dx`),
/// `w` the filter (or `dw`), `y` the output (or `dy`).
pub struct Planner<D: ConvDirection> {
    conv: ConvolutionDescriptor,
    x: TensorDescriptor,
    w: TensorDescriptor,
    y: TensorDescriptor,
    fingerprint: u64,
    state: PlannerState,
    workspace_bytes: usize,
    results: Vec<PerformanceRecord>,
    _direction: PhantomData<fn() -> D>,
}

impl Planner<Forward> {
    /// Plan `y = conv(x, w)`.
    ///
    /// # Errors
    ///
    /// See [`Planner::new`].
    pub fn forward(
        conv: &ConvolutionDescriptor,
        x: &TensorDescriptor,
        w: &TensorDescriptor,
        y: &TensorDescriptor,
    ) -> DnnResult<Self> {
        Self::new(conv, x, w, y)
    }
}

impl Planner<BackwardData> {
    /// Plan `dx = conv^T(dy, w)`.
    ///
    /// # Errors
    ///
    /// See [`Planner::new`].
    pub fn backward_data(
        conv: &ConvolutionDescriptor,
        dy: &TensorDescriptor,
        w: &TensorDescriptor,
        dx: &TensorDescriptor,
    ) -> DnnResult<Self> {
        Self::new(conv, dx, w, dy)
    }
}

impl Planner<BackwardWeights> {
    /// Plan `dw = corr(x, dy)`.
    ///
    /// # Errors
    ///
    /// See [`Planner::new`].
    pub fn backward_weights(
        conv: &ConvolutionDescriptor,
        dy: &TensorDescriptor,
        x: &TensorDescriptor,
        dw: &TensorDescriptor,
    ) -> DnnResult<Self> {
        Self::new(conv, x, dw, dy)
    }
}

impl<D: ConvDirection> Planner<D> {
    /// Create a planner; tensors in forward order.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if a descriptor is unset, the element
    /// types differ, or `y` is not the convolution's output shape for `x`
    /// and `w`.
    pub fn new(
        conv: &ConvolutionDescriptor,
        x: &TensorDescriptor,
        w: &TensorDescriptor,
        y: &TensorDescriptor,
    ) -> DnnResult<Self> {
        const OP: &str = "Planner::new";
        let xl = x.require_layout(OP)?;
        let wl = w.require_layout(OP)?;
        let yl = y.require_layout(OP)?;
        if xl.data_type != wl.data_type || xl.data_type != yl.data_type {
            return Err(DnnError::bad_param(
                OP,
                format!("mixed element types {xl}, {wl}, {yl}"),
            ));
        }
        let expected = conv.params().output_dims(&xl.dims, &wl.dims)?;
        if expected != yl.dims {
            return Err(DnnError::bad_param(
                OP,
                format!("output {yl} does not match expected {:?}", expected.as_slice()),
            ));
        }
        Ok(Self {
            fingerprint: fingerprint(D::PASS, conv.params(), &xl, &wl, &yl),
            conv: conv.clone(),
            x: x.clone(),
            w: w.clone(),
            y: y.clone(),
            state: PlannerState::Unconfigured,
            workspace_bytes: 0,
            results: Vec::new(),
            _direction: PhantomData,
        })
    }

    /// Current protocol state.
    #[must_use]
    pub const fn state(&self) -> PlannerState {
        self.state
    }

    /// Ranked results of the last search (empty before one).
    #[must_use]
    pub fn results(&self) -> &[PerformanceRecord] {
        &self.results
    }

    fn problem(&self) -> ConvProblem {
        ConvProblem {
            pass: D::PASS,
            conv: self.conv.raw(),
            x: self.x.raw(),
            w: self.w.raw(),
            y: self.y.raw(),
        }
    }

    /// Query the workspace the most demanding applicable algorithm needs.
    ///
    /// Calling it again restarts the protocol.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn workspace_size(&mut self, handle: &Handle) -> DnnResult<usize> {
        let bytes = handle
            .backend()
            .conv_workspace_size(handle.raw(), &self.problem())?;
        self.workspace_bytes = bytes;
        self.results.clear();
        self.state = PlannerState::WorkspaceSized;
        Ok(bytes)
    }

    /// Benchmark applicable algorithms against real buffers.
    ///
    /// The pass's output buffer is overwritten. The workspace must be at
    /// least as large as [`workspace_size`](Self::workspace_size) reported;
    /// it may be omitted when that size is zero. Results are sorted by
    /// ascending time and capped at the configured request count.
    ///
    /// # Errors
    ///
    /// - [`DnnError::InvalidState`] before `workspace_size`
    /// - [`DnnError::BadParam`] if the workspace is smaller than reported
    /// - [`DnnError::InvalidValue`] if a buffer is smaller than its tensor
    /// - [`DnnError::SearchFailed`] if no algorithm applies
    pub fn find(
        &mut self,
        handle: &Handle,
        x: &dyn DeviceMemory,
        w: &dyn DeviceMemory,
        y: &dyn DeviceMemory,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<&[PerformanceRecord]> {
        const OP: &str = "Planner::find";
        if self.state == PlannerState::Unconfigured {
            return Err(DnnError::invalid_state(
                OP,
                "workspace_size must be queried before searching",
            ));
        }
        let provided = workspace.map_or(0, DeviceMemory::size_bytes);
        if provided < self.workspace_bytes {
            return Err(DnnError::bad_param(
                OP,
                format!(
                    "workspace of {provided} bytes is smaller than the {} bytes required",
                    self.workspace_bytes
                ),
            ));
        }
        let buffers = ConvBuffers {
            x: self.x.arg(x, "x", OP)?.ptr,
            w: self.w.arg(w, "w", OP)?.ptr,
            y: self.y.arg(y, "y", OP)?.ptr,
        };
        let find = handle.runtime().config().find;
        let request = SearchRequest {
            request_count: find.request_count,
            exhaustive: find.exhaustive,
            workspace: Workspace {
                ptr: workspace.map_or(DevicePtr::null(), DeviceMemory::device_ptr),
                bytes: provided,
            },
        };

        let mut records = handle.backend().find_conv_algorithms(
            handle.raw(),
            &self.problem(),
            &buffers,
            &request,
        )?;
        if let Some(stray) = records.iter().find(|r| D::unwrap(r.algorithm).is_none()) {
            return Err(DnnError::internal(
                OP,
                format!("search for {} returned {}", D::PASS.name(), stray.algorithm),
            ));
        }
        records.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
        records.truncate(find.request_count);
        if records.is_empty() {
            return Err(DnnError::SearchFailed {
                op: OP,
                reason: format!("no {} algorithm applies to this problem", D::PASS.name()),
            });
        }

        for record in &records {
            tracing::debug!(
                algorithm = %record.algorithm,
                time_ms = record.time_ms,
                workspace = record.workspace_bytes,
                "candidate"
            );
        }
        self.results = records;
        self.state = PlannerState::Searched;
        Ok(&self.results)
    }

    /// Bind the fastest algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] before a search.
    pub fn select_fastest(&mut self) -> DnnResult<BoundAlgorithm<D>> {
        self.select_where("Planner::select_fastest", |_| true)
    }

    /// Bind the fastest algorithm needing at most `budget` workspace bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] before a search and
    /// [`DnnError::SearchFailed`] if nothing fits the budget.
    pub fn select_within_budget(&mut self, budget: usize) -> DnnResult<BoundAlgorithm<D>> {
        self.select_where("Planner::select_within_budget", |r| {
            r.workspace_bytes <= budget
        })
    }

    /// Bind a specific algorithm from the search results.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] before a search and
    /// [`DnnError::BadParam`] if the search did not return `algorithm`.
    pub fn select(&mut self, algorithm: D::Algorithm) -> DnnResult<BoundAlgorithm<D>> {
        const OP: &str = "Planner::select";
        let wanted = D::wrap(algorithm);
        self.select_where(OP, |r| r.algorithm == wanted)
            .map_err(|err| match err {
                DnnError::SearchFailed { .. } => DnnError::bad_param(
                    OP,
                    format!("{wanted} was not among the search results"),
                ),
                other => other,
            })
    }

    fn select_where(
        &mut self,
        op: &'static str,
        accept: impl Fn(&PerformanceRecord) -> bool,
    ) -> DnnResult<BoundAlgorithm<D>> {
        if !matches!(
            self.state,
            PlannerState::Searched | PlannerState::AlgorithmBound
        ) {
            return Err(DnnError::invalid_state(op, "no search results to select from"));
        }
        let record = self
            .results
            .iter()
            .find(|r| accept(r))
            .copied()
            .ok_or_else(|| DnnError::SearchFailed {
                op,
                reason: "no searched algorithm satisfies the constraint".to_string(),
            })?;
        let algorithm = D::unwrap(record.algorithm)
            .ok_or_else(|| DnnError::internal(op, "search result of another pass"))?;
        self.state = PlannerState::AlgorithmBound;
        Ok(BoundAlgorithm {
            algorithm,
            workspace_bytes: record.workspace_bytes,
            time_ms: record.time_ms,
            fingerprint: self.fingerprint,
            _direction: PhantomData,
        })
    }
}

impl<D: ConvDirection> fmt::Debug for Planner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("pass", &D::PASS)
            .field("state", &self.state)
            .field("workspace_bytes", &self.workspace_bytes)
            .field("results", &self.results)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;
    use crate::runtime::Runtime;
    use crate::types::DataType;

    struct Problem {
        rt: Runtime,
        conv: ConvolutionDescriptor,
        x: TensorDescriptor,
        w: TensorDescriptor,
        y: TensorDescriptor,
    }

    fn problem() -> Problem {
        let rt = Runtime::reference();
        let conv = ConvolutionDescriptor::new(
            &rt,
            ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1]),
        )
        .unwrap();
        let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 8, 8]).unwrap();
        let w = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4, 3, 3, 3]).unwrap();
        let y = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 4, 8, 8]).unwrap();
        Problem { rt, conv, x, w, y }
    }

    #[test]
    fn test_algorithm_tags() {
        let a = Forward::wrap(ConvFwdAlgorithm::Winograd);
        assert_eq!(a.pass(), ConvPass::Forward);
        assert_eq!(Forward::unwrap(a), Some(ConvFwdAlgorithm::Winograd));
        assert_eq!(BackwardData::unwrap(a), None);
        assert_eq!(
            ConvAlgorithm::from_raw(ConvPass::BackwardWeights, 0),
            Some(ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::Gemm))
        );
        assert_eq!(a.to_string(), "forward/winograd");
    }

    #[test]
    fn test_new_rejects_wrong_output_shape() {
        let p = problem();
        let bad = TensorDescriptor::with_shape(&p.rt, DataType::Float32, &[1, 4, 6, 6]).unwrap();
        let err = Planner::forward(&p.conv, &p.x, &p.w, &bad).unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_find_requires_workspace_query() {
        let p = problem();
        let rt = &p.rt;
        let handle = Handle::new(rt);
        let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
        let (x, w, y) = (
            HostBuffer::<f32>::new(192),
            HostBuffer::<f32>::new(108),
            HostBuffer::<f32>::new(256),
        );
        let err = planner.find(&handle, &x, &w, &y, None).unwrap_err();
        assert!(matches!(err, DnnError::InvalidState { .. }));
        assert_eq!(planner.state(), PlannerState::Unconfigured);
    }

    #[test]
    fn test_select_before_search() {
        let p = problem();
        let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
        assert!(matches!(
            planner.select_fastest(),
            Err(DnnError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_full_protocol() {
        let p = problem();
        let handle = Handle::new(&p.rt);
        let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
        let bytes = planner.workspace_size(&handle).unwrap();
        assert_eq!(planner.state(), PlannerState::WorkspaceSized);

        let (x, w, y) = (
            HostBuffer::<f32>::filled(192, 1.0),
            HostBuffer::<f32>::filled(108, 1.0),
            HostBuffer::<f32>::new(256),
        );
        let ws = HostBuffer::<u8>::new(bytes);
        let results = planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
        assert!(!results.is_empty() && results.len() <= 4);
        assert!(results.windows(2).all(|p| p[0].time_ms <= p[1].time_ms));

        let bound = planner.select_fastest().unwrap();
        assert_eq!(planner.state(), PlannerState::AlgorithmBound);
        assert_eq!(Forward::wrap(bound.algorithm()), planner.results()[0].algorithm);

        let lean = planner.select_within_budget(0).unwrap();
        assert_eq!(lean.workspace_bytes(), 0);
    }

    #[test]
    fn test_select_specific_algorithm() {
        let p = problem();
        let handle = Handle::new(&p.rt);
        let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
        let bytes = planner.workspace_size(&handle).unwrap();
        let (x, w, y) = (
            HostBuffer::<f32>::new(192),
            HostBuffer::<f32>::new(108),
            HostBuffer::<f32>::new(256),
        );
        let ws = HostBuffer::<u8>::new(bytes);
        let found: Vec<_> = planner
            .find(&handle, &x, &w, &y, Some(&ws))
            .unwrap()
            .iter()
            .filter_map(|r| Forward::unwrap(r.algorithm))
            .collect();
        let bound = planner.select(found[0]).unwrap();
        assert_eq!(bound.algorithm(), found[0]);

        let missing = ConvFwdAlgorithm::ALL
            .iter()
            .copied()
            .find(|a| !found.contains(a));
        if let Some(missing) = missing {
            assert!(matches!(
                planner.select(missing),
                Err(DnnError::BadParam { .. })
            ));
        }
    }
}
