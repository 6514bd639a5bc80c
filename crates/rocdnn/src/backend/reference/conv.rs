//! Convolution kernels.
//!
//! Every pass of both convolution modes reduces to one of three
//! cross-correlation kernels over a precomputed tap list:
//!
//! | pass             | cross-correlation | transpose          |
//! |------------------|-------------------|--------------------|
//! | forward          | `correlate`       | `correlate_t`      |
//! | backward-data    | `correlate_t`     | `correlate`        |
//! | backward-weights | `weight_grad`     | `weight_grad` (swapped) |
//!
//! In transpose mode the roles of `x` and `y` swap: `y` is the
//! correlation input and `x` its output. GEMM algorithms lower the
//! correlation through an im2col matrix held in the caller's workspace;
//! all other algorithms run the tap loops directly.

use crate::backend::ConvPass;
use crate::convolution::{ConvAlgorithm, ConvolutionParams};
use crate::tensor::TensorLayout;
use crate::types::{ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm, ConvFwdAlgorithm, ConvolutionMode};
use crate::{DnnError, DnnResult};

const FORWARD: &[ConvAlgorithm] = &[
    ConvAlgorithm::Forward(ConvFwdAlgorithm::Winograd),
    ConvAlgorithm::Forward(ConvFwdAlgorithm::ImplicitGemm),
    ConvAlgorithm::Forward(ConvFwdAlgorithm::Direct),
    ConvAlgorithm::Forward(ConvFwdAlgorithm::Gemm),
    ConvAlgorithm::Forward(ConvFwdAlgorithm::Fft),
];

const BACKWARD_DATA: &[ConvAlgorithm] = &[
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::Winograd),
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::ImplicitGemm),
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::Direct),
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::Gemm),
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::TransposeGemm),
    ConvAlgorithm::BackwardData(ConvBwdDataAlgorithm::Fft),
];

const BACKWARD_WEIGHTS: &[ConvAlgorithm] = &[
    ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::Winograd),
    ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::ImplicitGemm),
    ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::Direct),
    ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::Gemm),
];

/// Algorithms of `pass`, most preferred first.
pub(super) const fn candidates(pass: ConvPass) -> &'static [ConvAlgorithm] {
    match pass {
        ConvPass::Forward => FORWARD,
        ConvPass::BackwardData => BACKWARD_DATA,
        ConvPass::BackwardWeights => BACKWARD_WEIGHTS,
    }
}

/// Whether a heuristic search skips `algorithm`; only an exhaustive search
/// benchmarks it.
pub(super) const fn exhaustive_only(algorithm: ConvAlgorithm) -> bool {
    matches!(
        algorithm,
        ConvAlgorithm::Forward(ConvFwdAlgorithm::Fft)
            | ConvAlgorithm::BackwardData(
                ConvBwdDataAlgorithm::Fft | ConvBwdDataAlgorithm::TransposeGemm
            )
    )
}

/// Whether `algorithm` lowers through im2col.
pub(super) const fn uses_im2col(algorithm: ConvAlgorithm) -> bool {
    matches!(
        algorithm,
        ConvAlgorithm::Forward(ConvFwdAlgorithm::Gemm)
            | ConvAlgorithm::BackwardData(
                ConvBwdDataAlgorithm::Gemm | ConvBwdDataAlgorithm::TransposeGemm
            )
            | ConvAlgorithm::BackwardWeights(ConvBwdWeightsAlgorithm::Gemm)
    )
}

#[derive(Clone, Copy, Debug)]
struct Tap {
    out: usize,
    kernel: usize,
    input: usize,
}

/// A convolution problem in cross-correlation terms.
#[derive(Debug)]
pub(super) struct Geometry {
    transpose: bool,
    batch: usize,
    groups: usize,
    in_channels: usize,
    out_channels: usize,
    in_volume: usize,
    out_volume: usize,
    kernel: Vec<usize>,
    kernel_volume: usize,
    padded_volume: usize,
    unit_stride: bool,
    unit_dilation: bool,
    taps: Vec<Tap>,
}

fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for d in (0..dims.len()).rev() {
        out[d] = flat % dims[d];
        flat /= dims[d];
    }
}

impl Geometry {
    /// Resolve `x (*) w -> y`, checking `y` has the forward output shape.
    pub(super) fn new(
        op: &'static str,
        params: &ConvolutionParams,
        x: &TensorLayout,
        w: &TensorLayout,
        y: &TensorLayout,
    ) -> DnnResult<Self> {
        let expected = params.output_dims(&x.dims, &w.dims)?;
        if expected.as_slice() != y.dims.as_slice() {
            return Err(DnnError::bad_param(
                op,
                format!("output is {y}, convolution produces {expected:?}"),
            ));
        }
        if x.data_type != w.data_type || x.data_type != y.data_type {
            return Err(DnnError::bad_param(
                op,
                format!(
                    "mixed data types {}/{}/{}",
                    x.data_type, w.data_type, y.data_type
                ),
            ));
        }
        let transpose = params.mode == ConvolutionMode::Transpose;
        let (input, output) = if transpose { (y, x) } else { (x, y) };
        let input_dims = input.dims_usize();
        let output_dims = output.dims_usize();
        let w_dims = w.dims_usize();
        let spatial = params.spatial_rank();

        let in_sp = &input_dims[2..];
        let out_sp = &output_dims[2..];
        let kernel: Vec<usize> = w_dims[2..].to_vec();
        let in_volume: usize = in_sp.iter().product();
        let out_volume: usize = out_sp.iter().product();
        let kernel_volume: usize = kernel.iter().product();
        let padded_volume = in_sp
            .iter()
            .zip(&params.pad)
            .map(|(&d, &p)| d + 2 * p.max(0) as usize)
            .product();

        let mut taps = Vec::with_capacity(out_volume * kernel_volume);
        let mut o_idx = vec![0usize; spatial];
        let mut k_idx = vec![0usize; spatial];
        for out in 0..out_volume {
            unravel(out, out_sp, &mut o_idx);
            'kernel: for k in 0..kernel_volume {
                unravel(k, &kernel, &mut k_idx);
                let mut input_flat = 0usize;
                for d in 0..spatial {
                    let pos = i64::from(params.stride[d]) * o_idx[d] as i64
                        - i64::from(params.pad[d])
                        + i64::from(params.dilation[d]) * k_idx[d] as i64;
                    if pos < 0 || pos >= in_sp[d] as i64 {
                        continue 'kernel;
                    }
                    input_flat = input_flat * in_sp[d] + pos as usize;
                }
                taps.push(Tap {
                    out,
                    kernel: k,
                    input: input_flat,
                });
            }
        }

        Ok(Self {
            transpose,
            batch: x.dims_usize()[0],
            groups: params.group_count.max(1) as usize,
            in_channels: input_dims[1],
            out_channels: output_dims[1],
            in_volume,
            out_volume,
            kernel,
            kernel_volume,
            padded_volume,
            unit_stride: params.stride.iter().all(|&s| s == 1),
            unit_dilation: params.dilation.iter().all(|&d| d == 1),
            taps,
        })
    }

    fn group_in(&self) -> usize {
        self.in_channels / self.groups
    }

    fn group_out(&self) -> usize {
        self.out_channels / self.groups
    }

    fn im2col_len(&self) -> usize {
        self.group_in() * self.kernel_volume * self.out_volume
    }

    /// Workspace `algorithm` needs, or `None` when it does not apply.
    pub(super) fn workspace_for(&self, algorithm: ConvAlgorithm) -> Option<usize> {
        let two_d = self.kernel.len() == 2;
        let ungrouped = self.groups == 1;
        let winograd = two_d
            && self.kernel == [3, 3]
            && self.unit_stride
            && self.unit_dilation
            && ungrouped;
        let fft = two_d && self.unit_stride && self.unit_dilation && ungrouped && !self.transpose;
        let im2col = self.im2col_len() * 4;
        let fft_bytes = self.batch * (self.in_channels + self.out_channels) * self.padded_volume * 2 * 4;

        match algorithm {
            ConvAlgorithm::Forward(a) => match a {
                ConvFwdAlgorithm::Gemm => Some(im2col),
                ConvFwdAlgorithm::Direct => Some(0),
                ConvFwdAlgorithm::ImplicitGemm => ungrouped.then_some(0),
                ConvFwdAlgorithm::Winograd => winograd.then_some(0),
                ConvFwdAlgorithm::Fft => fft.then_some(fft_bytes),
            },
            ConvAlgorithm::BackwardData(a) => match a {
                ConvBwdDataAlgorithm::Gemm => Some(im2col),
                ConvBwdDataAlgorithm::TransposeGemm => ungrouped.then_some(im2col),
                ConvBwdDataAlgorithm::Direct => Some(0),
                ConvBwdDataAlgorithm::ImplicitGemm => ungrouped.then_some(0),
                ConvBwdDataAlgorithm::Winograd => winograd.then_some(0),
                ConvBwdDataAlgorithm::Fft => fft.then_some(fft_bytes),
            },
            ConvAlgorithm::BackwardWeights(a) => match a {
                ConvBwdWeightsAlgorithm::Gemm => Some(im2col),
                ConvBwdWeightsAlgorithm::Direct => Some(0),
                ConvBwdWeightsAlgorithm::ImplicitGemm => ungrouped.then_some(0),
                ConvBwdWeightsAlgorithm::Winograd => winograd.then_some(0),
            },
        }
    }

    /// Largest workspace any applicable algorithm of `pass` needs.
    pub(super) fn max_workspace(&self, pass: ConvPass) -> usize {
        candidates(pass)
            .iter()
            .filter_map(|&a| self.workspace_for(a))
            .max()
            .unwrap_or(0)
    }

    /// Compute the tensor `pass` writes.
    ///
    /// Operands are dense and in forward order: `(x, w)` for forward,
    /// `(dy, w)` for backward-data and `(x, dy)` for backward-weights.
    /// `col` selects the im2col lowering and must hold
    /// [`workspace_for`](Self::workspace_for) bytes of a GEMM algorithm.
    pub(super) fn run(&self, pass: ConvPass, col: Option<&mut [f32]>, a: &[f32], b: &[f32]) -> Vec<f32> {
        match (pass, self.transpose) {
            (ConvPass::Forward, false) | (ConvPass::BackwardData, true) => self.correlate(a, b, col),
            (ConvPass::Forward, true) | (ConvPass::BackwardData, false) => {
                self.correlate_t(a, b, col)
            }
            (ConvPass::BackwardWeights, false) => self.weight_grad(a, b, col),
            (ConvPass::BackwardWeights, true) => self.weight_grad(b, a, col),
        }
    }

    fn in_at(&self, n: usize, channel: usize) -> usize {
        (n * self.in_channels + channel) * self.in_volume
    }

    fn out_at(&self, n: usize, channel: usize) -> usize {
        (n * self.out_channels + channel) * self.out_volume
    }

    fn w_at(&self, oc: usize, c: usize) -> usize {
        (oc * self.group_in() + c) * self.kernel_volume
    }

    fn im2col(&self, input: &[f32], n: usize, group: usize, col: &mut [f32]) {
        col.fill(0.0);
        for c in 0..self.group_in() {
            let base = self.in_at(n, group * self.group_in() + c);
            for tap in &self.taps {
                col[(c * self.kernel_volume + tap.kernel) * self.out_volume + tap.out] =
                    input[base + tap.input];
            }
        }
    }

    fn col2im(&self, col: &[f32], n: usize, group: usize, input: &mut [f32]) {
        for c in 0..self.group_in() {
            let base = self.in_at(n, group * self.group_in() + c);
            for tap in &self.taps {
                input[base + tap.input] +=
                    col[(c * self.kernel_volume + tap.kernel) * self.out_volume + tap.out];
            }
        }
    }

    fn correlate(&self, input: &[f32], w: &[f32], col: Option<&mut [f32]>) -> Vec<f32> {
        let mut out = vec![0.0f32; self.batch * self.out_channels * self.out_volume];
        let rows = self.group_in() * self.kernel_volume;
        match col {
            Some(col) => {
                let col = &mut col[..self.im2col_len()];
                for n in 0..self.batch {
                    for g in 0..self.groups {
                        self.im2col(input, n, g, col);
                        for ko in 0..self.group_out() {
                            let oc = g * self.group_out() + ko;
                            let dst = self.out_at(n, oc);
                            let filter = &w[self.w_at(oc, 0)..self.w_at(oc, 0) + rows];
                            for (r, &wv) in filter.iter().enumerate() {
                                let src = &col[r * self.out_volume..(r + 1) * self.out_volume];
                                for (o, &cv) in src.iter().enumerate() {
                                    out[dst + o] += wv * cv;
                                }
                            }
                        }
                    }
                }
            }
            None => {
                for n in 0..self.batch {
                    for oc in 0..self.out_channels {
                        let g = oc / self.group_out();
                        let dst = self.out_at(n, oc);
                        for c in 0..self.group_in() {
                            let src = self.in_at(n, g * self.group_in() + c);
                            let filter = self.w_at(oc, c);
                            for tap in &self.taps {
                                out[dst + tap.out] += w[filter + tap.kernel] * input[src + tap.input];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn correlate_t(&self, output: &[f32], w: &[f32], col: Option<&mut [f32]>) -> Vec<f32> {
        let mut input = vec![0.0f32; self.batch * self.in_channels * self.in_volume];
        let rows = self.group_in() * self.kernel_volume;
        match col {
            Some(col) => {
                let col = &mut col[..self.im2col_len()];
                for n in 0..self.batch {
                    for g in 0..self.groups {
                        col.fill(0.0);
                        for ko in 0..self.group_out() {
                            let oc = g * self.group_out() + ko;
                            let src = &output[self.out_at(n, oc)..self.out_at(n, oc) + self.out_volume];
                            let filter = &w[self.w_at(oc, 0)..self.w_at(oc, 0) + rows];
                            for (r, &wv) in filter.iter().enumerate() {
                                let dst = &mut col[r * self.out_volume..(r + 1) * self.out_volume];
                                for (d, &dv) in dst.iter_mut().zip(src) {
                                    *d += wv * dv;
                                }
                            }
                        }
                        self.col2im(col, n, g, &mut input);
                    }
                }
            }
            None => {
                for n in 0..self.batch {
                    for oc in 0..self.out_channels {
                        let g = oc / self.group_out();
                        let src = self.out_at(n, oc);
                        for c in 0..self.group_in() {
                            let dst = self.in_at(n, g * self.group_in() + c);
                            let filter = self.w_at(oc, c);
                            for tap in &self.taps {
                                input[dst + tap.input] += w[filter + tap.kernel] * output[src + tap.out];
                            }
                        }
                    }
                }
            }
        }
        input
    }

    fn weight_grad(&self, input: &[f32], output: &[f32], col: Option<&mut [f32]>) -> Vec<f32> {
        let rows = self.group_in() * self.kernel_volume;
        let mut dw = vec![0.0f32; self.out_channels * rows];
        match col {
            Some(col) => {
                let col = &mut col[..self.im2col_len()];
                for n in 0..self.batch {
                    for g in 0..self.groups {
                        self.im2col(input, n, g, col);
                        for ko in 0..self.group_out() {
                            let oc = g * self.group_out() + ko;
                            let src = &output[self.out_at(n, oc)..self.out_at(n, oc) + self.out_volume];
                            let base = self.w_at(oc, 0);
                            for r in 0..rows {
                                let lowered = &col[r * self.out_volume..(r + 1) * self.out_volume];
                                dw[base + r] += lowered.iter().zip(src).map(|(a, b)| a * b).sum::<f32>();
                            }
                        }
                    }
                }
            }
            None => {
                for n in 0..self.batch {
                    for oc in 0..self.out_channels {
                        let g = oc / self.group_out();
                        let src = self.out_at(n, oc);
                        for c in 0..self.group_in() {
                            let x = self.in_at(n, g * self.group_in() + c);
                            let filter = self.w_at(oc, c);
                            for tap in &self.taps {
                                dw[filter + tap.kernel] += input[x + tap.input] * output[src + tap.out];
                            }
                        }
                    }
                }
            }
        }
        dw
    }
}
