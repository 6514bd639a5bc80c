//! Vendor backend: `libMIOpen` and `libamdhip64` loaded at runtime.
//!
//! The libraries are opened with `libloading`, every entry point is resolved
//! up front, and the libraries are then leaked so the function pointers stay
//! valid for the life of the process. A missing library or symbol surfaces
//! as [`DnnError::BackendUnavailable`] from [`MiopenBackend::load`].
//!
//! Raw ids are the native object pointers. Native statuses are converted at
//! each call site with [`Status::check`], tagged with the native function
//! name.
//!
//! The library cannot report everything it was told: transpose output
//! padding and the RNN element type are kept in a shadow table and merged
//! into what [`Backend::get_descriptor`] reads back.

use super::{
    Backend, BatchNormBackwardArgs, BatchNormBackwardScales, BatchNormInferenceArgs,
    BatchNormTrainingArgs, ConvBuffers, ConvPass, ConvProblem, DescriptorConfig, DescriptorKind,
    FusionOpSpec, OpBinding, RawArgs, RawDescriptor, RawHandle, RawOp, RawPlan, SearchRequest,
    TensorArg, Workspace,
};
use crate::activation::ActivationParams;
use crate::config::LibraryConfig;
use crate::convolution::{ConvAlgorithm, ConvolutionParams, PerformanceRecord};
use crate::lrn::LrnParams;
use crate::memory::DevicePtr;
use crate::pooling::PoolingParams;
use crate::rnn::RnnParams;
use crate::scalar::Scalar;
use crate::status::Status;
use crate::stream::Streamer;
use crate::tensor::{TensorLayout, MAX_TENSOR_RANK};
use crate::types::{
    ActivationMode, BatchNormMode, ConvFwdAlgorithm, ConvolutionMode, DataType, FusionDirection,
    IndexType, LrnMode, PoolingMode, RnnAlgorithm, RnnBiasMode, RnnDirection, RnnInputMode,
    RnnMode, TensorOp,
};
use crate::{DnnError, DnnResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::{c_int, c_uint, c_void, OsString};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Native types
// ============================================================================

/// `miopenStatus_t` / `hipError_t`.
type NativeStatus = c_int;

/// Any opaque native object or device address.
type Ptr = *mut c_void;

/// Host scalar (`alpha`, `beta`).
type CPtr = *const c_void;

/// `miopenConvAlgoPerf_t`; the leading union holds one algorithm enum.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct ConvAlgoPerf {
    algorithm: c_int,
    time: f32,
    memory: usize,
}

type FnCreate = unsafe extern "C" fn(*mut Ptr) -> NativeStatus;
type FnDestroy = unsafe extern "C" fn(Ptr) -> NativeStatus;
/// `(handle, alpha, x_desc, x, beta, y_desc, y)`
type FnUnary = unsafe extern "C" fn(Ptr, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr) -> NativeStatus;
/// `(handle, alpha, y_desc, y, dy_desc, dy, beta, dx_desc, dx)`
type FnUnaryBackward =
    unsafe extern "C" fn(Ptr, CPtr, Ptr, Ptr, Ptr, Ptr, CPtr, Ptr, Ptr) -> NativeStatus;
type FnConvWorkspace = unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, Ptr, *mut usize) -> NativeStatus;
type FnConvFind = unsafe extern "C" fn(
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    c_int,
    *mut c_int,
    *mut ConvAlgoPerf,
    Ptr,
    usize,
    bool,
) -> NativeStatus;
type FnConvRun = unsafe extern "C" fn(
    Ptr,
    CPtr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    Ptr,
    c_int,
    CPtr,
    Ptr,
    Ptr,
    Ptr,
    usize,
) -> NativeStatus;
type FnRnnSize = unsafe extern "C" fn(Ptr, Ptr, c_int, *const Ptr, *mut usize) -> NativeStatus;
type FnCreateOpMode = unsafe extern "C" fn(Ptr, *mut Ptr, c_int) -> NativeStatus;
type FnSetArgsPtr = unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, Ptr) -> NativeStatus;

// ============================================================================
// Dynamic library loading
// ============================================================================

macro_rules! native_api {
    (
        $(#[$meta:meta])*
        struct $api:ident {
            $($field:ident: $ty:ty = $sym:literal,)+
        }
    ) => {
        $(#[$meta])*
        struct $api {
            $($field: $ty,)+
        }

        impl $api {
            /// Resolve every entry point, then leak `lib` to keep them valid.
            ///
            /// # Safety
            ///
            /// The declared signatures must match the library's ABI.
            unsafe fn resolve(lib: libloading::Library) -> Result<Self, String> {
                let api = Self {
                    $($field: *lib
                        .get::<$ty>($sym)
                        .map_err(|e| format!("{}: {e}", String::from_utf8_lossy($sym)))?,)+
                };
                std::mem::forget(lib);
                Ok(api)
            }
        }
    };
}

native_api! {
    /// `libMIOpen` entry points.
    struct MiopenApi {
        create: FnCreate = b"miopenCreate",
        destroy: FnDestroy = b"miopenDestroy",
        set_stream: unsafe extern "C" fn(Ptr, Ptr) -> NativeStatus = b"miopenSetStream",
        get_stream: unsafe extern "C" fn(Ptr, *mut Ptr) -> NativeStatus = b"miopenGetStream",
        enable_profiling: unsafe extern "C" fn(Ptr, bool) -> NativeStatus = b"miopenEnableProfiling",
        get_kernel_time: unsafe extern "C" fn(Ptr, *mut f32) -> NativeStatus = b"miopenGetKernelTime",

        create_tensor: FnCreate = b"miopenCreateTensorDescriptor",
        destroy_tensor: FnDestroy = b"miopenDestroyTensorDescriptor",
        set_tensor_desc: unsafe extern "C" fn(Ptr, c_int, c_int, *const c_int, *const c_int) -> NativeStatus
            = b"miopenSetTensorDescriptor",
        get_tensor_size: unsafe extern "C" fn(Ptr, *mut c_int) -> NativeStatus
            = b"miopenGetTensorDescriptorSize",
        get_tensor_desc: unsafe extern "C" fn(Ptr, *mut c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGetTensorDescriptor",
        tensor_num_bytes: unsafe extern "C" fn(Ptr, *mut usize) -> NativeStatus
            = b"miopenGetTensorNumBytes",
        set_tensor: unsafe extern "C" fn(Ptr, Ptr, Ptr, CPtr) -> NativeStatus = b"miopenSetTensor",
        scale_tensor: unsafe extern "C" fn(Ptr, Ptr, Ptr, CPtr) -> NativeStatus = b"miopenScaleTensor",
        transform_tensor: FnUnary = b"miopenTransformTensor",
        op_tensor: unsafe extern "C" fn(Ptr, c_int, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr) -> NativeStatus
            = b"miopenOpTensor",

        create_conv: FnCreate = b"miopenCreateConvolutionDescriptor",
        destroy_conv: FnDestroy = b"miopenDestroyConvolutionDescriptor",
        init_conv: unsafe extern "C" fn(Ptr, c_int, *const c_int, *const c_int, *const c_int, c_int) -> NativeStatus
            = b"miopenInitConvolutionNdDescriptor",
        get_conv: unsafe extern "C" fn(Ptr, c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGetConvolutionNdDescriptor",
        set_group_count: unsafe extern "C" fn(Ptr, c_int) -> NativeStatus
            = b"miopenSetConvolutionGroupCount",
        get_group_count: unsafe extern "C" fn(Ptr, *mut c_int) -> NativeStatus
            = b"miopenGetConvolutionGroupCount",
        set_output_padding: unsafe extern "C" fn(Ptr, c_int, *const c_int) -> NativeStatus
            = b"miopenSetTransposeConvNdOutputPadding",
        conv_output_dim: unsafe extern "C" fn(Ptr, Ptr, Ptr, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGetConvolutionNdForwardOutputDim",
        fwd_workspace: FnConvWorkspace = b"miopenConvolutionForwardGetWorkSpaceSize",
        bwd_data_workspace: FnConvWorkspace = b"miopenConvolutionBackwardDataGetWorkSpaceSize",
        bwd_weights_workspace: FnConvWorkspace = b"miopenConvolutionBackwardWeightsGetWorkSpaceSize",
        find_fwd: FnConvFind = b"miopenFindConvolutionForwardAlgorithm",
        find_bwd_data: FnConvFind = b"miopenFindConvolutionBackwardDataAlgorithm",
        find_bwd_weights: FnConvFind = b"miopenFindConvolutionBackwardWeightsAlgorithm",
        conv_fwd: FnConvRun = b"miopenConvolutionForward",
        conv_bwd_data: FnConvRun = b"miopenConvolutionBackwardData",
        conv_bwd_weights: FnConvRun = b"miopenConvolutionBackwardWeights",
        conv_fwd_bias: FnUnary = b"miopenConvolutionForwardBias",
        conv_bwd_bias: FnUnary = b"miopenConvolutionBackwardBias",

        create_activation: FnCreate = b"miopenCreateActivationDescriptor",
        destroy_activation: FnDestroy = b"miopenDestroyActivationDescriptor",
        set_activation: unsafe extern "C" fn(Ptr, c_int, f64, f64, f64) -> NativeStatus
            = b"miopenSetActivationDescriptor",
        get_activation: unsafe extern "C" fn(Ptr, *mut c_int, *mut f64, *mut f64, *mut f64) -> NativeStatus
            = b"miopenGetActivationDescriptor",
        activation_fwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr) -> NativeStatus
            = b"miopenActivationForward",
        activation_bwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, CPtr, Ptr, Ptr) -> NativeStatus
            = b"miopenActivationBackward",
        softmax_fwd: FnUnary = b"miopenSoftmaxForward",
        softmax_bwd: FnUnaryBackward = b"miopenSoftmaxBackward",

        create_pooling: FnCreate = b"miopenCreatePoolingDescriptor",
        destroy_pooling: FnDestroy = b"miopenDestroyPoolingDescriptor",
        set_pooling: unsafe extern "C" fn(Ptr, c_int, c_int, c_int, c_int, c_int, c_int, c_int) -> NativeStatus
            = b"miopenSet2dPoolingDescriptor",
        get_pooling: unsafe extern "C" fn(Ptr, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGet2dPoolingDescriptor",
        set_index_type: unsafe extern "C" fn(Ptr, c_int) -> NativeStatus = b"miopenSetPoolingIndexType",
        get_index_type: unsafe extern "C" fn(Ptr, *mut c_int) -> NativeStatus = b"miopenGetPoolingIndexType",
        pooling_output_dim: unsafe extern "C" fn(Ptr, Ptr, *mut c_int, *mut c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGetPoolingForwardOutputDim",
        pooling_workspace: unsafe extern "C" fn(Ptr, Ptr, *mut usize) -> NativeStatus
            = b"miopenPoolingGetWorkSpaceSizeV2",
        pooling_fwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr, bool, Ptr, usize) -> NativeStatus
            = b"miopenPoolingForward",
        pooling_bwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, CPtr, Ptr, Ptr, Ptr) -> NativeStatus
            = b"miopenPoolingBackward",

        create_lrn: FnCreate = b"miopenCreateLRNDescriptor",
        destroy_lrn: FnDestroy = b"miopenDestroyLRNDescriptor",
        set_lrn: unsafe extern "C" fn(Ptr, c_int, c_uint, f64, f64, f64) -> NativeStatus
            = b"miopenSetLRNDescriptor",
        get_lrn: unsafe extern "C" fn(Ptr, *mut c_int, *mut c_uint, *mut f64, *mut f64, *mut f64) -> NativeStatus
            = b"miopenGetLRNDescriptor",
        lrn_workspace: unsafe extern "C" fn(Ptr, *mut usize) -> NativeStatus = b"miopenLRNGetWorkSpaceSize",
        lrn_fwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, CPtr, Ptr, Ptr, bool, Ptr) -> NativeStatus
            = b"miopenLRNForward",
        lrn_bwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, CPtr, Ptr, Ptr, Ptr) -> NativeStatus
            = b"miopenLRNBackward",

        derive_bn: unsafe extern "C" fn(Ptr, Ptr, c_int) -> NativeStatus = b"miopenDeriveBNTensorDescriptor",
        bn_inference: unsafe extern "C" fn(Ptr, c_int, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, f64) -> NativeStatus
            = b"miopenBatchNormalizationForwardInference",
        bn_training: unsafe extern "C" fn(Ptr, c_int, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, f64, Ptr, Ptr, f64, Ptr, Ptr) -> NativeStatus
            = b"miopenBatchNormalizationForwardTraining",
        bn_backward: unsafe extern "C" fn(Ptr, c_int, CPtr, CPtr, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, f64, Ptr, Ptr) -> NativeStatus
            = b"miopenBatchNormalizationBackward",

        create_rnn: FnCreate = b"miopenCreateRNNDescriptor",
        destroy_rnn: FnDestroy = b"miopenDestroyRNNDescriptor",
        set_rnn: unsafe extern "C" fn(Ptr, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int) -> NativeStatus
            = b"miopenSetRNNDescriptor",
        get_rnn: unsafe extern "C" fn(Ptr, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenGetRNNDescriptor",
        rnn_workspace: FnRnnSize = b"miopenGetRNNWorkspaceSize",
        rnn_reserve: FnRnnSize = b"miopenGetRNNTrainingReserveSize",
        rnn_params: unsafe extern "C" fn(Ptr, Ptr, Ptr, *mut usize, c_int) -> NativeStatus
            = b"miopenGetRNNParamsSize",

        create_plan: unsafe extern "C" fn(*mut Ptr, c_int, Ptr) -> NativeStatus = b"miopenCreateFusionPlan",
        destroy_plan: FnDestroy = b"miopenDestroyFusionPlan",
        compile_plan: unsafe extern "C" fn(Ptr, Ptr) -> NativeStatus = b"miopenCompileFusionPlan",
        plan_workspace: unsafe extern "C" fn(Ptr, Ptr, *mut usize, c_int) -> NativeStatus
            = b"miopenFusionPlanGetWorkSpaceSize",
        plan_get_algo: unsafe extern "C" fn(Ptr, c_int, *mut c_int, *mut c_int) -> NativeStatus
            = b"miopenFusionPlanConvolutionGetAlgo",
        plan_set_algo: unsafe extern "C" fn(Ptr, c_int) -> NativeStatus = b"miopenFusionPlanConvolutionSetAlgo",
        op_conv: unsafe extern "C" fn(Ptr, *mut Ptr, Ptr, Ptr) -> NativeStatus = b"miopenCreateOpConvForward",
        op_bias: unsafe extern "C" fn(Ptr, *mut Ptr, Ptr) -> NativeStatus = b"miopenCreateOpBiasForward",
        op_activation_fwd: FnCreateOpMode = b"miopenCreateOpActivationForward",
        op_activation_bwd: FnCreateOpMode = b"miopenCreateOpActivationBackward",
        op_bn_inference: unsafe extern "C" fn(Ptr, *mut Ptr, c_int, Ptr) -> NativeStatus
            = b"miopenCreateOpBatchNormInference",
        op_bn_fwd: unsafe extern "C" fn(Ptr, *mut Ptr, c_int, bool) -> NativeStatus
            = b"miopenCreateOpBatchNormForward",
        op_bn_bwd: FnCreateOpMode = b"miopenCreateOpBatchNormBackward",
        create_args: FnCreate = b"miopenCreateOperatorArgs",
        destroy_args: FnDestroy = b"miopenDestroyOperatorArgs",
        args_conv: FnSetArgsPtr = b"miopenSetOpArgsConvForward",
        args_bias: FnSetArgsPtr = b"miopenSetOpArgsBiasForward",
        args_activation_fwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, f64, f64, f64) -> NativeStatus
            = b"miopenSetOpArgsActivForward",
        args_activation_bwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, Ptr, Ptr, f64, f64, f64) -> NativeStatus
            = b"miopenSetOpArgsActivBackward",
        args_bn_inference: unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, f64) -> NativeStatus
            = b"miopenSetOpArgsBatchNormInference",
        args_bn_fwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, f64, f64) -> NativeStatus
            = b"miopenSetOpArgsBatchNormForward",
        args_bn_bwd: unsafe extern "C" fn(Ptr, Ptr, CPtr, CPtr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr) -> NativeStatus
            = b"miopenSetOpArgsBatchNormBackward",
        execute_plan: unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Ptr) -> NativeStatus
            = b"miopenExecuteFusionPlan",
    }
}

native_api! {
    /// `libamdhip64` entry points for stream management.
    struct HipApi {
        stream_create: FnCreate = b"hipStreamCreate",
        stream_destroy: FnDestroy = b"hipStreamDestroy",
        stream_synchronize: FnDestroy = b"hipStreamSynchronize",
        device_synchronize: unsafe extern "C" fn() -> NativeStatus = b"hipDeviceSynchronize",
    }
}

const MIOPEN_NAMES: &[&str] = &["libMIOpen.so.1", "libMIOpen.so"];
const HIP_NAMES: &[&str] = &["libamdhip64.so.6", "libamdhip64.so.5", "libamdhip64.so"];

/// Open `explicit`, or the first of `defaults` that loads.
fn open(explicit: Option<&Path>, defaults: &[&str]) -> DnnResult<libloading::Library> {
    let candidates: Vec<OsString> = match explicit {
        Some(path) => vec![path.as_os_str().to_owned()],
        None => defaults.iter().map(OsString::from).collect(),
    };
    let mut last = String::from("no library candidates");
    for name in candidates {
        tracing::debug!(library = %name.to_string_lossy(), "loading vendor library");
        // Safety: the ROCm libraries' initializers have no preconditions.
        match unsafe { libloading::Library::new(&name) } {
            Ok(lib) => return Ok(lib),
            Err(err) => last = format!("{}: {err}", name.to_string_lossy()),
        }
    }
    Err(DnnError::BackendUnavailable(last))
}

fn hip_check(code: NativeStatus, op: &'static str) -> DnnResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(DnnError::internal(op, format!("hip error {code}")))
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn object(raw: u64) -> Ptr {
    raw as usize as Ptr
}

fn id(ptr: Ptr) -> u64 {
    ptr as usize as u64
}

fn h(handle: RawHandle) -> Ptr {
    object(handle.as_raw())
}

fn d(desc: RawDescriptor) -> Ptr {
    object(desc.as_raw())
}

fn m(ptr: DevicePtr) -> Ptr {
    ptr.as_mut_ptr()
}

fn decode<T>(op: &'static str, raw: c_int, from_raw: fn(i32) -> Option<T>) -> DnnResult<T> {
    from_raw(raw).ok_or_else(|| DnnError::internal(op, format!("library returned unknown value {raw}")))
}

fn int(op: &'static str, value: usize) -> DnnResult<c_int> {
    c_int::try_from(value).map_err(|_| DnnError::bad_param(op, format!("{value} exceeds the native range")))
}

// ============================================================================
// Streams
// ============================================================================

/// A HIP stream owned by the caller.
pub struct HipStream {
    api: Arc<HipApi>,
    raw: u64,
}

impl HipStream {
    /// Block until every device operation has finished.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InternalError`] with the HIP error code.
    pub fn device_synchronize(&self) -> DnnResult<()> {
        // Safety: no arguments.
        hip_check(unsafe { (self.api.device_synchronize)() }, "hipDeviceSynchronize")
    }
}

impl Streamer for HipStream {
    fn as_raw(&self) -> u64 {
        self.raw
    }

    fn sync(&self) -> DnnResult<()> {
        // Safety: `raw` was created by `hipStreamCreate` and is still alive.
        hip_check(unsafe { (self.api.stream_synchronize)(object(self.raw)) }, "hipStreamSynchronize")
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        // Safety: the stream is destroyed exactly once.
        let code = unsafe { (self.api.stream_destroy)(object(self.raw)) };
        if code != 0 {
            tracing::warn!(stream = self.raw, code, "hipStreamDestroy failed");
        }
    }
}

impl fmt::Debug for HipStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HipStream").field("raw", &format_args!("{:#x}", self.raw)).finish()
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Backend forwarding every call to `libMIOpen`.
pub struct MiopenBackend {
    api: MiopenApi,
    hip: Arc<HipApi>,
    /// Configurations as set, for fields the library cannot report.
    shadow: Mutex<FxHashMap<u64, DescriptorConfig>>,
}

impl MiopenBackend {
    /// Load the vendor libraries from `config`'s paths or the default
    /// locations.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BackendUnavailable`] if a library or one of its
    /// entry points cannot be found.
    pub fn load(config: &LibraryConfig) -> DnnResult<Self> {
        let miopen = open(config.miopen.as_deref(), MIOPEN_NAMES)?;
        // Safety: `MiopenApi` mirrors the declarations of `miopen.h`.
        let api = unsafe { MiopenApi::resolve(miopen) }.map_err(DnnError::BackendUnavailable)?;
        let hip = open(config.hip.as_deref(), HIP_NAMES)?;
        // Safety: `HipApi` mirrors the declarations of `hip_runtime_api.h`.
        let hip = unsafe { HipApi::resolve(hip) }.map_err(DnnError::BackendUnavailable)?;
        tracing::info!("loaded MIOpen and HIP runtime libraries");
        Ok(Self {
            api,
            hip: Arc::new(hip),
            shadow: Mutex::new(FxHashMap::default()),
        })
    }

    /// Create a HIP stream to bind to handles.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InternalError`] with the HIP error code.
    pub fn create_stream(&self) -> DnnResult<HipStream> {
        let mut raw: Ptr = std::ptr::null_mut();
        // Safety: `raw` is a valid out-pointer.
        hip_check(unsafe { (self.hip.stream_create)(&mut raw) }, "hipStreamCreate")?;
        Ok(HipStream {
            api: Arc::clone(&self.hip),
            raw: id(raw),
        })
    }

    fn create(&self, f: FnCreate, op: &'static str) -> DnnResult<u64> {
        let mut raw: Ptr = std::ptr::null_mut();
        // Safety: `raw` is a valid out-pointer.
        Status::check(unsafe { f(&mut raw) }, op)?;
        Ok(id(raw))
    }

    fn conv_entry_points(&self, pass: ConvPass) -> (FnConvWorkspace, FnConvFind, FnConvRun, &'static str) {
        let api = &self.api;
        match pass {
            ConvPass::Forward => (api.fwd_workspace, api.find_fwd, api.conv_fwd, "miopenConvolutionForward"),
            ConvPass::BackwardData => (
                api.bwd_data_workspace,
                api.find_bwd_data,
                api.conv_bwd_data,
                "miopenConvolutionBackwardData",
            ),
            ConvPass::BackwardWeights => (
                api.bwd_weights_workspace,
                api.find_bwd_weights,
                api.conv_bwd_weights,
                "miopenConvolutionBackwardWeights",
            ),
        }
    }

    fn get_tensor(&self, desc: RawDescriptor, rank: usize) -> DnnResult<TensorLayout> {
        const OP: &str = "miopenGetTensorDescriptor";
        let mut size: c_int = 0;
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.get_tensor_size)(d(desc), &mut size) }, "miopenGetTensorDescriptorSize")?;
        if usize::try_from(size).ok() != Some(rank) {
            return Err(DnnError::bad_param(
                OP,
                format!("requested {rank} dimensions of a rank-{size} tensor"),
            ));
        }
        let mut data_type: c_int = 0;
        let mut dims = [0 as c_int; MAX_TENSOR_RANK];
        let mut strides = [0 as c_int; MAX_TENSOR_RANK];
        // Safety: both arrays hold at least `size` entries.
        Status::check(
            unsafe {
                (self.api.get_tensor_desc)(d(desc), &mut data_type, dims.as_mut_ptr(), strides.as_mut_ptr())
            },
            OP,
        )?;
        let data_type = decode(OP, data_type, DataType::from_raw)?;
        TensorLayout::new(data_type, &dims[..rank], Some(&strides[..rank]))
    }

    fn get_convolution(&self, desc: RawDescriptor, rank: usize) -> DnnResult<ConvolutionParams> {
        const OP: &str = "miopenGetConvolutionNdDescriptor";
        let mut spatial: c_int = 0;
        let mut pad = vec![0 as c_int; rank];
        let mut stride = vec![0 as c_int; rank];
        let mut dilation = vec![0 as c_int; rank];
        let mut mode: c_int = 0;
        let mut groups: c_int = 1;
        // Safety: every array holds `rank` entries.
        unsafe {
            Status::check(
                (self.api.get_conv)(
                    d(desc),
                    int(OP, rank)?,
                    &mut spatial,
                    pad.as_mut_ptr(),
                    stride.as_mut_ptr(),
                    dilation.as_mut_ptr(),
                    &mut mode,
                ),
                OP,
            )?;
            Status::check((self.api.get_group_count)(d(desc), &mut groups), "miopenGetConvolutionGroupCount")?;
        }
        if usize::try_from(spatial).ok() != Some(rank) {
            return Err(DnnError::bad_param(
                OP,
                format!("requested {rank} spatial dimensions of a {spatial}-d convolution"),
            ));
        }
        let mut params = ConvolutionParams::new(&pad, &stride, &dilation)
            .with_mode(decode(OP, mode, ConvolutionMode::from_raw)?)
            .with_groups(groups);
        if let Some(DescriptorConfig::Convolution(set)) = self.shadow.lock().get(&desc.as_raw()) {
            params.output_padding.clone_from(&set.output_padding);
        }
        Ok(params)
    }

    fn set_convolution(&self, desc: RawDescriptor, params: &ConvolutionParams) -> DnnResult<()> {
        let rank = int("miopenInitConvolutionNdDescriptor", params.spatial_rank())?;
        // Safety: each slice holds `rank` entries.
        unsafe {
            Status::check(
                (self.api.init_conv)(
                    d(desc),
                    rank,
                    params.pad.as_ptr(),
                    params.stride.as_ptr(),
                    params.dilation.as_ptr(),
                    params.mode.as_raw(),
                ),
                "miopenInitConvolutionNdDescriptor",
            )?;
            Status::check(
                (self.api.set_group_count)(d(desc), params.group_count),
                "miopenSetConvolutionGroupCount",
            )?;
            if let Some(adj) = &params.output_padding {
                Status::check(
                    (self.api.set_output_padding)(d(desc), rank, adj.as_ptr()),
                    "miopenSetTransposeConvNdOutputPadding",
                )?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MiopenBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiopenBackend")
            .field("shadowed", &self.shadow.lock().len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
impl Backend for MiopenBackend {
    fn name(&self) -> &'static str {
        "miopen"
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    fn create_handle(&self) -> DnnResult<RawHandle> {
        self.create(self.api.create, "miopenCreate").map(RawHandle)
    }

    fn destroy_handle(&self, handle: RawHandle) -> DnnResult<()> {
        // Safety: the handle was created by `miopenCreate`.
        Status::check(unsafe { (self.api.destroy)(h(handle)) }, "miopenDestroy")
    }

    fn set_stream(&self, handle: RawHandle, stream: u64) -> DnnResult<()> {
        // Safety: `stream` is a HIP stream or the default stream (null).
        Status::check(unsafe { (self.api.set_stream)(h(handle), object(stream)) }, "miopenSetStream")
    }

    fn stream(&self, handle: RawHandle) -> DnnResult<u64> {
        let mut stream: Ptr = std::ptr::null_mut();
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.get_stream)(h(handle), &mut stream) }, "miopenGetStream")?;
        Ok(id(stream))
    }

    fn enable_profiling(&self, handle: RawHandle, enable: bool) -> DnnResult<()> {
        // Safety: plain arguments.
        Status::check(unsafe { (self.api.enable_profiling)(h(handle), enable) }, "miopenEnableProfiling")
    }

    fn kernel_time(&self, handle: RawHandle) -> DnnResult<f32> {
        let mut time = 0.0f32;
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.get_kernel_time)(h(handle), &mut time) }, "miopenGetKernelTime")?;
        Ok(time)
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    fn create_descriptor(&self, kind: DescriptorKind) -> DnnResult<RawDescriptor> {
        let api = &self.api;
        let (f, op) = match kind {
            DescriptorKind::Tensor => (api.create_tensor, "miopenCreateTensorDescriptor"),
            DescriptorKind::Convolution => (api.create_conv, "miopenCreateConvolutionDescriptor"),
            DescriptorKind::Activation => (api.create_activation, "miopenCreateActivationDescriptor"),
            DescriptorKind::Pooling => (api.create_pooling, "miopenCreatePoolingDescriptor"),
            DescriptorKind::Lrn => (api.create_lrn, "miopenCreateLRNDescriptor"),
            DescriptorKind::Rnn => (api.create_rnn, "miopenCreateRNNDescriptor"),
        };
        self.create(f, op).map(RawDescriptor)
    }

    fn destroy_descriptor(&self, kind: DescriptorKind, desc: RawDescriptor) -> DnnResult<()> {
        let api = &self.api;
        let (f, op) = match kind {
            DescriptorKind::Tensor => (api.destroy_tensor, "miopenDestroyTensorDescriptor"),
            DescriptorKind::Convolution => (api.destroy_conv, "miopenDestroyConvolutionDescriptor"),
            DescriptorKind::Activation => (api.destroy_activation, "miopenDestroyActivationDescriptor"),
            DescriptorKind::Pooling => (api.destroy_pooling, "miopenDestroyPoolingDescriptor"),
            DescriptorKind::Lrn => (api.destroy_lrn, "miopenDestroyLRNDescriptor"),
            DescriptorKind::Rnn => (api.destroy_rnn, "miopenDestroyRNNDescriptor"),
        };
        self.shadow.lock().remove(&desc.as_raw());
        // Safety: the descriptor was created by the matching create call.
        Status::check(unsafe { f(d(desc)) }, op)
    }

    fn set_descriptor(&self, desc: RawDescriptor, config: &DescriptorConfig) -> DnnResult<()> {
        let api = &self.api;
        let raw = d(desc);
        // Safety: every array argument holds as many entries as its count.
        unsafe {
            match config {
                DescriptorConfig::Tensor(layout) => Status::check(
                    (api.set_tensor_desc)(
                        raw,
                        layout.data_type.as_raw(),
                        int("miopenSetTensorDescriptor", layout.rank())?,
                        layout.dims.as_ptr(),
                        layout.strides.as_ptr(),
                    ),
                    "miopenSetTensorDescriptor",
                )?,
                DescriptorConfig::Convolution(params) => self.set_convolution(desc, params)?,
                DescriptorConfig::Activation(p) => Status::check(
                    (api.set_activation)(raw, p.mode.as_raw(), p.alpha, p.beta, p.gamma),
                    "miopenSetActivationDescriptor",
                )?,
                DescriptorConfig::Pooling(p) => Status::check(
                    (api.set_pooling)(
                        raw,
                        p.mode.as_raw(),
                        p.window[0],
                        p.window[1],
                        p.pad[0],
                        p.pad[1],
                        p.stride[0],
                        p.stride[1],
                    ),
                    "miopenSet2dPoolingDescriptor",
                )?,
                DescriptorConfig::Lrn(p) => Status::check(
                    (api.set_lrn)(raw, p.mode.as_raw(), p.n, p.alpha, p.beta, p.k),
                    "miopenSetLRNDescriptor",
                )?,
                DescriptorConfig::Rnn(p) => Status::check(
                    (api.set_rnn)(
                        raw,
                        p.hidden_size,
                        p.layers,
                        p.input_mode.as_raw(),
                        p.direction.as_raw(),
                        p.mode.as_raw(),
                        p.bias_mode.as_raw(),
                        p.algorithm.as_raw(),
                        p.data_type.as_raw(),
                    ),
                    "miopenSetRNNDescriptor",
                )?,
            }
        }
        self.shadow.lock().insert(desc.as_raw(), config.clone());
        Ok(())
    }

    fn get_descriptor(
        &self,
        desc: RawDescriptor,
        kind: DescriptorKind,
        rank: usize,
    ) -> DnnResult<DescriptorConfig> {
        let api = &self.api;
        let raw = d(desc);
        Ok(match kind {
            DescriptorKind::Tensor => DescriptorConfig::Tensor(self.get_tensor(desc, rank)?),
            DescriptorKind::Convolution => DescriptorConfig::Convolution(self.get_convolution(desc, rank)?),
            DescriptorKind::Activation => {
                const OP: &str = "miopenGetActivationDescriptor";
                let mut mode: c_int = 0;
                let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, 0.0);
                // Safety: out-pointers.
                Status::check(unsafe { (api.get_activation)(raw, &mut mode, &mut alpha, &mut beta, &mut gamma) }, OP)?;
                DescriptorConfig::Activation(ActivationParams {
                    mode: decode(OP, mode, ActivationMode::from_raw)?,
                    alpha,
                    beta,
                    gamma,
                })
            }
            DescriptorKind::Pooling => {
                const OP: &str = "miopenGet2dPoolingDescriptor";
                let mut v = [0 as c_int; 7];
                let [mode, wh, ww, ph, pw, sh, sw] = &mut v;
                // Safety: out-pointers.
                Status::check(unsafe { (api.get_pooling)(raw, mode, wh, ww, ph, pw, sh, sw) }, OP)?;
                DescriptorConfig::Pooling(PoolingParams {
                    mode: decode(OP, v[0], PoolingMode::from_raw)?,
                    window: [v[1], v[2]],
                    pad: [v[3], v[4]],
                    stride: [v[5], v[6]],
                })
            }
            DescriptorKind::Lrn => {
                const OP: &str = "miopenGetLRNDescriptor";
                let (mut mode, mut n): (c_int, c_uint) = (0, 0);
                let (mut alpha, mut beta, mut k) = (0.0, 0.0, 0.0);
                // Safety: out-pointers.
                Status::check(unsafe { (api.get_lrn)(raw, &mut mode, &mut n, &mut alpha, &mut beta, &mut k) }, OP)?;
                DescriptorConfig::Lrn(LrnParams {
                    mode: decode(OP, mode, LrnMode::from_raw)?,
                    n,
                    alpha,
                    beta,
                    k,
                })
            }
            DescriptorKind::Rnn => {
                const OP: &str = "miopenGetRNNDescriptor";
                let mut v = [0 as c_int; 7];
                let [mode, algorithm, input, direction, bias, hidden, layers] = &mut v;
                // Safety: out-pointers.
                Status::check(
                    unsafe { (api.get_rnn)(raw, mode, algorithm, input, direction, bias, hidden, layers) },
                    OP,
                )?;
                let data_type = match self.shadow.lock().get(&desc.as_raw()) {
                    Some(DescriptorConfig::Rnn(set)) => set.data_type,
                    _ => DataType::Float32,
                };
                DescriptorConfig::Rnn(RnnParams {
                    mode: decode(OP, v[0], RnnMode::from_raw)?,
                    algorithm: decode(OP, v[1], RnnAlgorithm::from_raw)?,
                    input_mode: decode(OP, v[2], RnnInputMode::from_raw)?,
                    direction: decode(OP, v[3], RnnDirection::from_raw)?,
                    bias_mode: decode(OP, v[4], RnnBiasMode::from_raw)?,
                    hidden_size: v[5],
                    layers: v[6],
                    data_type,
                })
            }
        })
    }

    fn tensor_num_bytes(&self, desc: RawDescriptor) -> DnnResult<usize> {
        let mut bytes = 0usize;
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.tensor_num_bytes)(d(desc), &mut bytes) }, "miopenGetTensorNumBytes")?;
        Ok(bytes)
    }

    fn set_pooling_index_type(&self, desc: RawDescriptor, index: IndexType) -> DnnResult<()> {
        // Safety: plain arguments.
        Status::check(
            unsafe { (self.api.set_index_type)(d(desc), index.as_raw()) },
            "miopenSetPoolingIndexType",
        )
    }

    fn pooling_index_type(&self, desc: RawDescriptor) -> DnnResult<IndexType> {
        const OP: &str = "miopenGetPoolingIndexType";
        let mut raw: c_int = 0;
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.get_index_type)(d(desc), &mut raw) }, OP)?;
        decode(OP, raw, IndexType::from_raw)
    }

    fn derive_batch_norm_descriptor(
        &self,
        derived: RawDescriptor,
        x: RawDescriptor,
        mode: BatchNormMode,
    ) -> DnnResult<()> {
        // Safety: both descriptors are live tensor descriptors.
        Status::check(
            unsafe { (self.api.derive_bn)(d(derived), d(x), mode.as_raw()) },
            "miopenDeriveBNTensorDescriptor",
        )
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
        let mut rank: c_int = 0;
        let mut dims = [0 as c_int; MAX_TENSOR_RANK];
        // Safety: `dims` holds the largest rank the library reports.
        Status::check(
            unsafe { (self.api.conv_output_dim)(d(conv), d(x), d(w), &mut rank, dims.as_mut_ptr()) },
            "miopenGetConvolutionNdForwardOutputDim",
        )?;
        let rank = usize::try_from(rank).unwrap_or(0).min(MAX_TENSOR_RANK);
        Ok(dims[..rank].to_vec())
    }

    fn conv_workspace_size(&self, handle: RawHandle, problem: &ConvProblem) -> DnnResult<usize> {
        let (f, _, _, op) = self.conv_entry_points(problem.pass);
        let (a, b) = match problem.pass {
            ConvPass::Forward => (problem.w, problem.x),
            ConvPass::BackwardData => (problem.y, problem.w),
            ConvPass::BackwardWeights => (problem.y, problem.x),
        };
        let out = match problem.pass {
            ConvPass::Forward => problem.y,
            ConvPass::BackwardData => problem.x,
            ConvPass::BackwardWeights => problem.w,
        };
        let mut bytes = 0usize;
        // Safety: out-pointer; descriptors are live.
        Status::check(unsafe { f(h(handle), d(a), d(b), d(problem.conv), d(out), &mut bytes) }, op)?;
        Ok(bytes)
    }

    fn find_conv_algorithms(
        &self,
        handle: RawHandle,
        problem: &ConvProblem,
        buffers: &ConvBuffers,
        request: &SearchRequest,
    ) -> DnnResult<Vec<PerformanceRecord>> {
        let (_, f, _, op) = self.conv_entry_points(problem.pass);
        let ((a, ap), (b, bp), (out, out_ptr)) = conv_operands(problem, buffers);
        let mut perf = vec![ConvAlgoPerf::default(); request.request_count.max(1)];
        let mut returned: c_int = 0;
        // Safety: `perf` holds `request_count` records; buffers were checked
        // against their descriptors by the caller.
        Status::check(
            unsafe {
                f(
                    h(handle),
                    d(a),
                    m(ap),
                    d(b),
                    m(bp),
                    d(problem.conv),
                    d(out),
                    m(out_ptr),
                    int(op, perf.len())?,
                    &mut returned,
                    perf.as_mut_ptr(),
                    m(request.workspace.ptr),
                    request.workspace.bytes,
                    request.exhaustive,
                )
            },
            op,
        )?;
        perf.truncate(usize::try_from(returned).unwrap_or(0));
        perf.iter()
            .map(|p| {
                let algorithm = ConvAlgorithm::from_raw(problem.pass, p.algorithm).ok_or_else(|| {
                    DnnError::internal(op, format!("library returned unknown algorithm {}", p.algorithm))
                })?;
                Ok(PerformanceRecord {
                    algorithm,
                    time_ms: p.time,
                    workspace_bytes: p.memory,
                })
            })
            .collect()
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
        let (_, _, f, op) = self.conv_entry_points(problem.pass);
        if algorithm.pass() != problem.pass {
            return Err(DnnError::bad_param(
                op,
                format!("{algorithm} cannot run a {} pass", problem.pass.name()),
            ));
        }
        let ((a, ap), (b, bp), (out, out_ptr)) = conv_operands(problem, buffers);
        // Safety: scalars outlive the call; buffers were checked by the caller.
        Status::check(
            unsafe {
                f(
                    h(handle),
                    alpha.as_ptr(),
                    d(a),
                    m(ap),
                    d(b),
                    m(bp),
                    d(problem.conv),
                    algorithm.as_raw(),
                    beta.as_ptr(),
                    d(out),
                    m(out_ptr),
                    m(workspace.ptr),
                    workspace.bytes,
                )
            },
            op,
        )
    }

    fn convolution_forward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        bias: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.conv_fwd_bias)(
                    h(handle),
                    alpha.as_ptr(),
                    d(bias.desc),
                    m(bias.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                )
            },
            "miopenConvolutionForwardBias",
        )
    }

    fn convolution_backward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        dy: TensorArg,
        beta: Scalar,
        db: TensorArg,
    ) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.conv_bwd_bias)(
                    h(handle),
                    alpha.as_ptr(),
                    d(dy.desc),
                    m(dy.ptr),
                    beta.as_ptr(),
                    d(db.desc),
                    m(db.ptr),
                )
            },
            "miopenConvolutionBackwardBias",
        )
    }

    // ------------------------------------------------------------------
    // Tensor operations
    // ------------------------------------------------------------------

    fn set_tensor(&self, handle: RawHandle, y: TensorArg, value: Scalar) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe { (self.api.set_tensor)(h(handle), d(y.desc), m(y.ptr), value.as_ptr()) },
            "miopenSetTensor",
        )
    }

    fn scale_tensor(&self, handle: RawHandle, y: TensorArg, alpha: Scalar) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe { (self.api.scale_tensor)(h(handle), d(y.desc), m(y.ptr), alpha.as_ptr()) },
            "miopenScaleTensor",
        )
    }

    fn transform_tensor(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.transform_tensor)(
                    h(handle),
                    alpha.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                )
            },
            "miopenTransformTensor",
        )
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
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.op_tensor)(
                    h(handle),
                    op.as_raw(),
                    alpha1.as_ptr(),
                    d(a.desc),
                    m(a.ptr),
                    alpha2.as_ptr(),
                    d(b.desc),
                    m(b.ptr),
                    beta.as_ptr(),
                    d(c.desc),
                    m(c.ptr),
                )
            },
            "miopenOpTensor",
        )
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
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.activation_fwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                )
            },
            "miopenActivationForward",
        )
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
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.activation_bwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    d(dy.desc),
                    m(dy.ptr),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(dx.desc),
                    m(dx.ptr),
                )
            },
            "miopenActivationBackward",
        )
    }

    fn softmax_forward(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.softmax_fwd)(
                    h(handle),
                    alpha.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                )
            },
            "miopenSoftmaxForward",
        )
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
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.softmax_bwd)(
                    h(handle),
                    alpha.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    d(dy.desc),
                    m(dy.ptr),
                    beta.as_ptr(),
                    d(dx.desc),
                    m(dx.ptr),
                )
            },
            "miopenSoftmaxBackward",
        )
    }

    // ------------------------------------------------------------------
    // Pooling, LRN
    // ------------------------------------------------------------------

    fn pooling_output_dim(&self, desc: RawDescriptor, x: RawDescriptor) -> DnnResult<Vec<i32>> {
        let (mut n, mut c, mut hh, mut w): (c_int, c_int, c_int, c_int) = (0, 0, 0, 0);
        // Safety: out-pointers.
        Status::check(
            unsafe { (self.api.pooling_output_dim)(d(desc), d(x), &mut n, &mut c, &mut hh, &mut w) },
            "miopenGetPoolingForwardOutputDim",
        )?;
        Ok(vec![n, c, hh, w])
    }

    fn pooling_workspace_size(&self, desc: RawDescriptor, y: RawDescriptor) -> DnnResult<usize> {
        let mut bytes = 0usize;
        // Safety: out-pointer.
        Status::check(
            unsafe { (self.api.pooling_workspace)(d(desc), d(y), &mut bytes) },
            "miopenPoolingGetWorkSpaceSizeV2",
        )?;
        Ok(bytes)
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
        // Safety: operands and workspace were checked by the caller.
        Status::check(
            unsafe {
                (self.api.pooling_fwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    do_backward,
                    m(workspace.ptr),
                    workspace.bytes,
                )
            },
            "miopenPoolingForward",
        )
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
        // Safety: operands and workspace were checked by the caller.
        Status::check(
            unsafe {
                (self.api.pooling_bwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    d(dy.desc),
                    m(dy.ptr),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(dx.desc),
                    m(dx.ptr),
                    m(workspace.ptr),
                )
            },
            "miopenPoolingBackward",
        )
    }

    fn lrn_workspace_size(&self, y: RawDescriptor) -> DnnResult<usize> {
        let mut bytes = 0usize;
        // Safety: out-pointer.
        Status::check(unsafe { (self.api.lrn_workspace)(d(y), &mut bytes) }, "miopenLRNGetWorkSpaceSize")?;
        Ok(bytes)
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
        // Safety: operands and workspace were checked by the caller.
        Status::check(
            unsafe {
                (self.api.lrn_fwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    do_backward,
                    m(workspace.ptr),
                )
            },
            "miopenLRNForward",
        )
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
        // Safety: operands and workspace were checked by the caller.
        Status::check(
            unsafe {
                (self.api.lrn_bwd)(
                    h(handle),
                    d(desc),
                    alpha.as_ptr(),
                    d(y.desc),
                    m(y.ptr),
                    d(dy.desc),
                    m(dy.ptr),
                    d(x.desc),
                    m(x.ptr),
                    beta.as_ptr(),
                    d(dx.desc),
                    m(dx.ptr),
                    m(workspace.ptr),
                )
            },
            "miopenLRNBackward",
        )
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
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.bn_inference)(
                    h(handle),
                    mode.as_raw(),
                    alpha.as_ptr(),
                    beta.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    d(y.desc),
                    m(y.ptr),
                    d(params.desc),
                    m(params.scale),
                    m(params.bias),
                    m(params.mean),
                    m(params.variance),
                    params.epsilon,
                )
            },
            "miopenBatchNormalizationForwardInference",
        )
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
        // Safety: operands were checked by the caller; null outputs are skipped.
        Status::check(
            unsafe {
                (self.api.bn_training)(
                    h(handle),
                    mode.as_raw(),
                    alpha.as_ptr(),
                    beta.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    d(y.desc),
                    m(y.ptr),
                    d(params.desc),
                    m(params.scale),
                    m(params.bias),
                    params.factor,
                    m(params.running_mean),
                    m(params.running_variance),
                    params.epsilon,
                    m(params.save_mean),
                    m(params.save_inv_variance),
                )
            },
            "miopenBatchNormalizationForwardTraining",
        )
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
        // Safety: operands were checked by the caller; null saved statistics
        // make the library recompute them.
        Status::check(
            unsafe {
                (self.api.bn_backward)(
                    h(handle),
                    mode.as_raw(),
                    scales.alpha_data.as_ptr(),
                    scales.beta_data.as_ptr(),
                    scales.alpha_param.as_ptr(),
                    scales.beta_param.as_ptr(),
                    d(x.desc),
                    m(x.ptr),
                    d(dy.desc),
                    m(dy.ptr),
                    d(dx.desc),
                    m(dx.ptr),
                    d(params.desc),
                    m(params.scale),
                    m(params.scale_diff),
                    m(params.bias_diff),
                    params.epsilon,
                    m(params.saved_mean),
                    m(params.saved_inv_variance),
                )
            },
            "miopenBatchNormalizationBackward",
        )
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
        rnn_size(self.api.rnn_workspace, handle, desc, xs, "miopenGetRNNWorkspaceSize")
    }

    fn rnn_training_reserve_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        xs: &[RawDescriptor],
    ) -> DnnResult<usize> {
        rnn_size(self.api.rnn_reserve, handle, desc, xs, "miopenGetRNNTrainingReserveSize")
    }

    fn rnn_params_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        x: RawDescriptor,
        data_type: DataType,
    ) -> DnnResult<usize> {
        let mut bytes = 0usize;
        // Safety: out-pointer.
        Status::check(
            unsafe { (self.api.rnn_params)(h(handle), d(desc), d(x), &mut bytes, data_type.as_raw()) },
            "miopenGetRNNParamsSize",
        )?;
        Ok(bytes)
    }

    // ------------------------------------------------------------------
    // Fusion
    // ------------------------------------------------------------------

    fn create_fusion_plan(
        &self,
        direction: FusionDirection,
        input: RawDescriptor,
    ) -> DnnResult<RawPlan> {
        let mut raw: Ptr = std::ptr::null_mut();
        // Safety: out-pointer.
        Status::check(
            unsafe { (self.api.create_plan)(&mut raw, direction.as_raw(), d(input)) },
            "miopenCreateFusionPlan",
        )?;
        Ok(RawPlan(id(raw)))
    }

    fn destroy_fusion_plan(&self, plan: RawPlan) -> DnnResult<()> {
        // Safety: the plan was created by `miopenCreateFusionPlan`.
        Status::check(unsafe { (self.api.destroy_plan)(object(plan.as_raw())) }, "miopenDestroyFusionPlan")
    }

    fn create_fusion_op(&self, plan: RawPlan, spec: &FusionOpSpec) -> DnnResult<RawOp> {
        let api = &self.api;
        let p = object(plan.as_raw());
        let mut raw: Ptr = std::ptr::null_mut();
        // Safety: out-pointer; descriptors are live.
        let (code, op) = unsafe {
            match *spec {
                FusionOpSpec::ConvForward { conv, weights } => {
                    ((api.op_conv)(p, &mut raw, d(conv), d(weights)), "miopenCreateOpConvForward")
                }
                FusionOpSpec::BiasForward { bias } => {
                    ((api.op_bias)(p, &mut raw, d(bias)), "miopenCreateOpBiasForward")
                }
                FusionOpSpec::ActivationForward { mode } => (
                    (api.op_activation_fwd)(p, &mut raw, mode.as_raw()),
                    "miopenCreateOpActivationForward",
                ),
                FusionOpSpec::ActivationBackward { mode } => (
                    (api.op_activation_bwd)(p, &mut raw, mode.as_raw()),
                    "miopenCreateOpActivationBackward",
                ),
                FusionOpSpec::BatchNormInference { mode, params } => (
                    (api.op_bn_inference)(p, &mut raw, mode.as_raw(), d(params)),
                    "miopenCreateOpBatchNormInference",
                ),
                FusionOpSpec::BatchNormForward {
                    mode,
                    running_stats,
                } => (
                    (api.op_bn_fwd)(p, &mut raw, mode.as_raw(), running_stats),
                    "miopenCreateOpBatchNormForward",
                ),
                FusionOpSpec::BatchNormBackward { mode } => (
                    (api.op_bn_bwd)(p, &mut raw, mode.as_raw()),
                    "miopenCreateOpBatchNormBackward",
                ),
            }
        };
        Status::check(code, op)?;
        Ok(RawOp(id(raw)))
    }

    fn compile_fusion_plan(&self, handle: RawHandle, plan: RawPlan) -> DnnResult<()> {
        // Safety: live handle and plan.
        Status::check(
            unsafe { (self.api.compile_plan)(h(handle), object(plan.as_raw())) },
            "miopenCompileFusionPlan",
        )
    }

    fn fusion_workspace_size(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<usize> {
        let mut bytes = 0usize;
        // Safety: out-pointer.
        Status::check(
            unsafe {
                (self.api.plan_workspace)(h(handle), object(plan.as_raw()), &mut bytes, algorithm.as_raw())
            },
            "miopenFusionPlanGetWorkSpaceSize",
        )?;
        Ok(bytes)
    }

    fn fusion_conv_algorithms(
        &self,
        plan: RawPlan,
        request_count: usize,
    ) -> DnnResult<Vec<ConvFwdAlgorithm>> {
        const OP: &str = "miopenFusionPlanConvolutionGetAlgo";
        let mut raw = vec![0 as c_int; request_count.max(1)];
        let mut returned: c_int = 0;
        // Safety: `raw` holds `request_count` entries.
        Status::check(
            unsafe {
                (self.api.plan_get_algo)(
                    object(plan.as_raw()),
                    int(OP, raw.len())?,
                    &mut returned,
                    raw.as_mut_ptr(),
                )
            },
            OP,
        )?;
        raw.truncate(usize::try_from(returned).unwrap_or(0).min(request_count));
        raw.into_iter()
            .map(|a| decode(OP, a, ConvFwdAlgorithm::from_raw))
            .collect()
    }

    fn fusion_set_conv_algorithm(
        &self,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<()> {
        // Safety: live plan.
        Status::check(
            unsafe { (self.api.plan_set_algo)(object(plan.as_raw()), algorithm.as_raw()) },
            "miopenFusionPlanConvolutionSetAlgo",
        )
    }

    fn create_operator_args(&self) -> DnnResult<RawArgs> {
        self.create(self.api.create_args, "miopenCreateOperatorArgs").map(RawArgs)
    }

    fn destroy_operator_args(&self, args: RawArgs) -> DnnResult<()> {
        // Safety: the table was created by `miopenCreateOperatorArgs`.
        Status::check(unsafe { (self.api.destroy_args)(object(args.as_raw())) }, "miopenDestroyOperatorArgs")
    }

    fn set_operator_args(&self, args: RawArgs, op: RawOp, binding: &OpBinding) -> DnnResult<()> {
        let api = &self.api;
        let (a, o) = (object(args.as_raw()), object(op.as_raw()));
        // Safety: scalars are copied by the library; device pointers must
        // stay valid until execution, which the fusion args wrapper ensures.
        let (code, name) = unsafe {
            match binding {
                OpBinding::ConvForward { alpha, beta, weights } => (
                    (api.args_conv)(a, o, alpha.as_ptr(), beta.as_ptr(), m(*weights)),
                    "miopenSetOpArgsConvForward",
                ),
                OpBinding::BiasForward { alpha, beta, bias } => (
                    (api.args_bias)(a, o, alpha.as_ptr(), beta.as_ptr(), m(*bias)),
                    "miopenSetOpArgsBiasForward",
                ),
                OpBinding::ActivationForward {
                    alpha,
                    beta,
                    coefficients: c,
                } => (
                    (api.args_activation_fwd)(a, o, alpha.as_ptr(), beta.as_ptr(), c.alpha, c.beta, c.gamma),
                    "miopenSetOpArgsActivForward",
                ),
                OpBinding::ActivationBackward {
                    alpha,
                    beta,
                    y,
                    coefficients: c,
                } => (
                    (api.args_activation_bwd)(
                        a,
                        o,
                        alpha.as_ptr(),
                        beta.as_ptr(),
                        m(*y),
                        std::ptr::null_mut(),
                        c.alpha,
                        c.beta,
                        c.gamma,
                    ),
                    "miopenSetOpArgsActivBackward",
                ),
                OpBinding::BatchNormInference {
                    alpha,
                    beta,
                    scale,
                    bias,
                    mean,
                    variance,
                    epsilon,
                } => (
                    (api.args_bn_inference)(
                        a,
                        o,
                        alpha.as_ptr(),
                        beta.as_ptr(),
                        m(*scale),
                        m(*bias),
                        m(*mean),
                        m(*variance),
                        *epsilon,
                    ),
                    "miopenSetOpArgsBatchNormInference",
                ),
                OpBinding::BatchNormForward {
                    alpha,
                    beta,
                    scale,
                    bias,
                    saved_mean,
                    saved_inv_variance,
                    running_mean,
                    running_variance,
                    factor,
                    epsilon,
                } => (
                    (api.args_bn_fwd)(
                        a,
                        o,
                        alpha.as_ptr(),
                        beta.as_ptr(),
                        m(*scale),
                        m(*bias),
                        m(*saved_mean),
                        m(*saved_inv_variance),
                        m(*running_mean),
                        m(*running_variance),
                        *factor,
                        *epsilon,
                    ),
                    "miopenSetOpArgsBatchNormForward",
                ),
                OpBinding::BatchNormBackward {
                    alpha,
                    beta,
                    x,
                    scale,
                    bias,
                    scale_diff,
                    bias_diff,
                    saved_mean,
                    saved_inv_variance,
                } => (
                    (api.args_bn_bwd)(
                        a,
                        o,
                        alpha.as_ptr(),
                        beta.as_ptr(),
                        m(*x),
                        m(*scale),
                        m(*bias),
                        m(*scale_diff),
                        m(*bias_diff),
                        m(*saved_mean),
                        m(*saved_inv_variance),
                    ),
                    "miopenSetOpArgsBatchNormBackward",
                ),
            }
        };
        Status::check(code, name)
    }

    fn execute_fusion_plan(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        input: TensorArg,
        output: TensorArg,
        args: RawArgs,
    ) -> DnnResult<()> {
        // Safety: operands were checked by the caller.
        Status::check(
            unsafe {
                (self.api.execute_plan)(
                    h(handle),
                    object(plan.as_raw()),
                    d(input.desc),
                    m(input.ptr),
                    d(output.desc),
                    m(output.ptr),
                    object(args.as_raw()),
                )
            },
            "miopenExecuteFusionPlan",
        )
    }
}

type Operand = (RawDescriptor, DevicePtr);

/// `(first input, second input, output)` in native argument order.
fn conv_operands(problem: &ConvProblem, buffers: &ConvBuffers) -> (Operand, Operand, Operand) {
    let x = (problem.x, buffers.x);
    let w = (problem.w, buffers.w);
    let y = (problem.y, buffers.y);
    match problem.pass {
        ConvPass::Forward => (x, w, y),
        ConvPass::BackwardData => (y, w, x),
        ConvPass::BackwardWeights => (y, x, w),
    }
}

fn rnn_size(
    f: FnRnnSize,
    handle: RawHandle,
    desc: RawDescriptor,
    xs: &[RawDescriptor],
    op: &'static str,
) -> DnnResult<usize> {
    let steps: Vec<Ptr> = xs.iter().map(|&x| d(x)).collect();
    let mut bytes = 0usize;
    // Safety: `steps` holds one descriptor per sequence step.
    Status::check(
        unsafe { f(h(handle), d(desc), int(op, steps.len())?, steps.as_ptr(), &mut bytes) },
        op,
    )?;
    Ok(bytes)
}
