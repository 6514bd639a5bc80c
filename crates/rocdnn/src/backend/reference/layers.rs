//! Element-wise and normalization kernels.
//!
//! All kernels take dense row-major vectors and NCHW-style dimension lists;
//! blending with the destination happens in [`super::memory::store`].

use crate::activation::ActivationParams;
use crate::lrn::LrnParams;
use crate::pooling::PoolingParams;
use crate::rnn::RnnParams;
use crate::types::{ActivationMode, BatchNormMode, LrnMode, PoolingMode, RnnInputMode};

// ----------------------------------------------------------------------
// Broadcasting
// ----------------------------------------------------------------------

/// Whether `from` broadcasts to `to`: equal rank, every dimension equal or 1.
pub(super) fn broadcasts(from: &[usize], to: &[usize]) -> bool {
    from.len() == to.len() && from.iter().zip(to).all(|(&f, &t)| f == t || f == 1)
}

fn broadcast_index(mut flat: usize, from: &[usize], to: &[usize]) -> usize {
    let mut index = 0;
    let mut scale = 1;
    for d in (0..to.len()).rev() {
        let i = flat % to[d];
        flat /= to[d];
        if from[d] != 1 {
            index += i * scale;
        }
        scale *= from[d];
    }
    index
}

/// Expand `values` of shape `from` to shape `to`.
pub(super) fn broadcast(values: &[f32], from: &[usize], to: &[usize]) -> Vec<f32> {
    let volume: usize = to.iter().product();
    (0..volume)
        .map(|i| values[broadcast_index(i, from, to)])
        .collect()
}

/// Sum `values` of shape `from` down to the broadcast shape `to`.
pub(super) fn reduce(values: &[f32], from: &[usize], to: &[usize]) -> Vec<f32> {
    let mut out = vec![0.0f32; to.iter().product()];
    for (i, &v) in values.iter().enumerate() {
        out[broadcast_index(i, to, from)] += v;
    }
    out
}

// ----------------------------------------------------------------------
// Activation
// ----------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
pub(super) fn activate(p: &ActivationParams, x: f32) -> f32 {
    let (a, b, g) = (p.alpha as f32, p.beta as f32, p.gamma as f32);
    match p.mode {
        ActivationMode::PassThrough => x,
        ActivationMode::Logistic => 1.0 / (1.0 + (-x).exp()),
        ActivationMode::Tanh => b * (a * x).tanh(),
        ActivationMode::Relu => x.max(0.0),
        ActivationMode::SoftRelu => x.exp().ln_1p(),
        ActivationMode::Abs => x.abs(),
        ActivationMode::Power => (a + b * x).powf(g),
        ActivationMode::ClippedRelu => x.max(0.0).min(a),
        ActivationMode::LeakyRelu => {
            if x > 0.0 {
                x
            } else {
                a * x
            }
        }
        ActivationMode::Elu => {
            if x > 0.0 {
                x
            } else {
                a * x.exp_m1()
            }
        }
    }
}

/// `f'(x)` recovered from the forward output alone.
///
/// `None` for functions that are not invertible from `y`.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn slope_from_output(p: &ActivationParams, y: f32) -> Option<f32> {
    let (a, b) = (p.alpha as f32, p.beta as f32);
    Some(match p.mode {
        ActivationMode::PassThrough => 1.0,
        ActivationMode::Logistic => y * (1.0 - y),
        ActivationMode::Tanh => {
            if b == 0.0 {
                0.0
            } else {
                a * (b - y * y / b)
            }
        }
        ActivationMode::Relu => f32::from(u8::from(y > 0.0)),
        ActivationMode::SoftRelu => -(-y).exp_m1(),
        ActivationMode::ClippedRelu => f32::from(u8::from(y > 0.0 && y < a)),
        ActivationMode::LeakyRelu => {
            if y > 0.0 {
                1.0
            } else {
                a
            }
        }
        ActivationMode::Elu => {
            if y > 0.0 {
                1.0
            } else {
                y + a
            }
        }
        ActivationMode::Abs | ActivationMode::Power => return None,
    })
}

/// `f'(x)`, using `x` where `y` does not determine it.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn slope(p: &ActivationParams, x: f32, y: f32) -> f32 {
    let (a, b, g) = (p.alpha as f32, p.beta as f32, p.gamma as f32);
    match p.mode {
        ActivationMode::Abs => x.signum() * f32::from(u8::from(x != 0.0)),
        ActivationMode::Power => g * b * (a + b * x).powf(g - 1.0),
        _ => slope_from_output(p, y).unwrap_or(0.0),
    }
}

// ----------------------------------------------------------------------
// Softmax
// ----------------------------------------------------------------------

fn channel_split(dims: &[usize]) -> (usize, usize, usize) {
    let batch = dims.first().copied().unwrap_or(1);
    let channels = dims.get(1).copied().unwrap_or(1);
    let inner = dims.iter().skip(2).product();
    (batch, channels, inner)
}

pub(super) fn softmax(dims: &[usize], x: &[f32]) -> Vec<f32> {
    let (batch, channels, inner) = channel_split(dims);
    let mut y = vec![0.0f32; x.len()];
    for n in 0..batch {
        for s in 0..inner {
            let at = |c: usize| (n * channels + c) * inner + s;
            let max = (0..channels).map(|c| x[at(c)]).fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0;
            for c in 0..channels {
                let e = (x[at(c)] - max).exp();
                y[at(c)] = e;
                total += e;
            }
            for c in 0..channels {
                y[at(c)] /= total;
            }
        }
    }
    y
}

pub(super) fn softmax_grad(dims: &[usize], y: &[f32], dy: &[f32]) -> Vec<f32> {
    let (batch, channels, inner) = channel_split(dims);
    let mut dx = vec![0.0f32; y.len()];
    for n in 0..batch {
        for s in 0..inner {
            let at = |c: usize| (n * channels + c) * inner + s;
            let dot: f32 = (0..channels).map(|c| dy[at(c)] * y[at(c)]).sum();
            for c in 0..channels {
                dx[at(c)] = y[at(c)] * (dy[at(c)] - dot);
            }
        }
    }
    dx
}

// ----------------------------------------------------------------------
// Pooling
// ----------------------------------------------------------------------

struct Window {
    h0: i64,
    w0: i64,
}

fn window(p: &PoolingParams, oh: usize, ow: usize) -> Window {
    Window {
        h0: oh as i64 * i64::from(p.stride[0]) - i64::from(p.pad[0]),
        w0: ow as i64 * i64::from(p.stride[1]) - i64::from(p.pad[1]),
    }
}

/// Input positions `(local index, flat plane index)` a window covers.
fn window_cells(p: &PoolingParams, win: &Window, h: usize, w: usize) -> Vec<(usize, usize)> {
    let [kh, kw] = [p.window[0] as usize, p.window[1] as usize];
    let mut cells = Vec::with_capacity(kh * kw);
    for i in 0..kh {
        for j in 0..kw {
            let (ih, iw) = (win.h0 + i as i64, win.w0 + j as i64);
            if ih >= 0 && iw >= 0 && (ih as usize) < h && (iw as usize) < w {
                cells.push((i * kw + j, ih as usize * w + iw as usize));
            }
        }
    }
    cells
}

fn divisor(p: &PoolingParams, cells: usize) -> f32 {
    match p.mode {
        PoolingMode::AverageInclusive => (p.window[0] * p.window[1]) as f32,
        _ => cells.max(1) as f32,
    }
}

/// Pool `x`; the second vector holds the window-local position of every
/// maximum (max mode only).
pub(super) fn pool(p: &PoolingParams, x_dims: &[usize], y_dims: &[usize], x: &[f32]) -> (Vec<f32>, Vec<usize>) {
    let planes = x_dims[0] * x_dims[1];
    let (h, w) = (x_dims[2], x_dims[3]);
    let (oh, ow) = (y_dims[2], y_dims[3]);
    let mut y = Vec::with_capacity(planes * oh * ow);
    let mut argmax = Vec::new();
    for plane in 0..planes {
        let src = &x[plane * h * w..(plane + 1) * h * w];
        for i in 0..oh {
            for j in 0..ow {
                let cells = window_cells(p, &window(p, i, j), h, w);
                match p.mode {
                    PoolingMode::Max => {
                        let mut best: Option<(usize, f32)> = None;
                        for &(local, at) in &cells {
                            if best.map_or(true, |(_, v)| src[at] > v) {
                                best = Some((local, src[at]));
                            }
                        }
                        let (local, value) = best.unwrap_or((0, 0.0));
                        y.push(value);
                        argmax.push(local);
                    }
                    PoolingMode::Average | PoolingMode::AverageInclusive => {
                        let total: f32 = cells.iter().map(|&(_, at)| src[at]).sum();
                        y.push(total / divisor(p, cells.len()));
                    }
                }
            }
        }
    }
    (y, argmax)
}

/// Route `dy` back to the input positions.
pub(super) fn pool_grad(
    p: &PoolingParams,
    x_dims: &[usize],
    y_dims: &[usize],
    dy: &[f32],
    argmax: &[usize],
) -> Vec<f32> {
    let planes = x_dims[0] * x_dims[1];
    let (h, w) = (x_dims[2], x_dims[3]);
    let (oh, ow) = (y_dims[2], y_dims[3]);
    let kw = p.window[1] as usize;
    let mut dx = vec![0.0f32; planes * h * w];
    for plane in 0..planes {
        let dst = plane * h * w;
        for i in 0..oh {
            for j in 0..ow {
                let out = (plane * oh + i) * ow + j;
                let win = window(p, i, j);
                match p.mode {
                    PoolingMode::Max => {
                        let local = argmax[out];
                        let ih = win.h0 + (local / kw) as i64;
                        let iw = win.w0 + (local % kw) as i64;
                        if ih >= 0 && iw >= 0 && (ih as usize) < h && (iw as usize) < w {
                            dx[dst + ih as usize * w + iw as usize] += dy[out];
                        }
                    }
                    PoolingMode::Average | PoolingMode::AverageInclusive => {
                        let cells = window_cells(p, &win, h, w);
                        let share = dy[out] / divisor(p, cells.len());
                        for (_, at) in cells {
                            dx[dst + at] += share;
                        }
                    }
                }
            }
        }
    }
    dx
}

/// Store window positions as little-endian integers `width` bytes wide.
pub(super) fn encode_indices(indices: &[usize], width: usize, out: &mut [u8]) {
    for (chunk, &index) in out.chunks_exact_mut(width).zip(indices) {
        chunk.copy_from_slice(&(index as u64).to_le_bytes()[..width]);
    }
}

pub(super) fn decode_indices(bytes: &[u8], width: usize, count: usize) -> Vec<usize> {
    bytes
        .chunks_exact(width)
        .take(count)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw[..width].copy_from_slice(chunk);
            u64::from_le_bytes(raw) as usize
        })
        .collect()
}

// ----------------------------------------------------------------------
// LRN
// ----------------------------------------------------------------------

fn lrn_span(p: &LrnParams) -> (usize, usize) {
    let n = p.n as usize;
    let pre = (n - 1) / 2;
    (pre, n - pre - 1)
}

#[allow(clippy::cast_possible_truncation)]
fn lrn_coefficient(p: &LrnParams) -> f32 {
    let n = f64::from(p.n);
    let per = match p.mode {
        LrnMode::CrossChannel => n,
        LrnMode::WithinChannel => n * n,
    };
    (p.alpha / per) as f32
}

fn span(center: usize, below: usize, above: usize, len: usize) -> std::ops::Range<usize> {
    center.saturating_sub(below)..(center + above + 1).min(len)
}

/// Sum `values` over each element's window; `transposed` sums over the
/// windows containing the element instead.
fn window_sum(p: &LrnParams, dims: &[usize], values: &[f32], transposed: bool) -> Vec<f32> {
    let (pre, post) = lrn_span(p);
    let (below, above) = if transposed { (post, pre) } else { (pre, post) };
    let (batch, channels, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let plane = h * w;
    let mut out = vec![0.0f32; values.len()];
    for n in 0..batch {
        for c in 0..channels {
            for i in 0..h {
                for j in 0..w {
                    let at = (n * channels + c) * plane + i * w + j;
                    out[at] = match p.mode {
                        LrnMode::CrossChannel => span(c, below, above, channels)
                            .map(|k| values[(n * channels + k) * plane + i * w + j])
                            .sum(),
                        LrnMode::WithinChannel => span(i, below, above, h)
                            .flat_map(|ii| span(j, below, above, w).map(move |jj| (ii, jj)))
                            .map(|(ii, jj)| values[(n * channels + c) * plane + ii * w + jj])
                            .sum(),
                    };
                }
            }
        }
    }
    out
}

/// Per-element scale `k + coef * sum(x^2)`.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn lrn_scale(p: &LrnParams, dims: &[usize], x: &[f32]) -> Vec<f32> {
    let squares: Vec<f32> = x.iter().map(|v| v * v).collect();
    let coef = lrn_coefficient(p);
    window_sum(p, dims, &squares, false)
        .into_iter()
        .map(|s| p.k as f32 + coef * s)
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn lrn(p: &LrnParams, x: &[f32], scale: &[f32]) -> Vec<f32> {
    x.iter()
        .zip(scale)
        .map(|(v, s)| v * s.powf(-(p.beta as f32)))
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn lrn_grad(
    p: &LrnParams,
    dims: &[usize],
    x: &[f32],
    y: &[f32],
    dy: &[f32],
    scale: &[f32],
) -> Vec<f32> {
    let beta = p.beta as f32;
    let ratio: Vec<f32> = dy
        .iter()
        .zip(y)
        .zip(scale)
        .map(|((d, y), s)| d * y / s)
        .collect();
    let gathered = window_sum(p, dims, &ratio, true);
    let coef = 2.0 * beta * lrn_coefficient(p);
    (0..x.len())
        .map(|i| dy[i] * scale[i].powf(-beta) - coef * x[i] * gathered[i])
        .collect()
}

// ----------------------------------------------------------------------
// Batch normalization
// ----------------------------------------------------------------------

/// How elements of an `[N, C, spatial...]` tensor map onto parameters.
#[derive(Clone, Copy, Debug)]
pub(super) struct BnShape {
    mode: BatchNormMode,
    batch: usize,
    channels: usize,
    spatial: usize,
}

impl BnShape {
    pub(super) fn new(mode: BatchNormMode, dims: &[usize]) -> Self {
        let (batch, channels, spatial) = channel_split(dims);
        Self {
            mode,
            batch,
            channels,
            spatial,
        }
    }

    /// Number of parameters per vector.
    pub(super) fn params(&self) -> usize {
        match self.mode {
            BatchNormMode::Spatial => self.channels,
            BatchNormMode::PerActivation => self.channels * self.spatial,
        }
    }

    /// Elements reduced into each parameter.
    pub(super) fn members(&self) -> usize {
        match self.mode {
            BatchNormMode::Spatial => self.batch * self.spatial,
            BatchNormMode::PerActivation => self.batch,
        }
    }

    fn param_of(&self, element: usize) -> usize {
        let s = element % self.spatial.max(1);
        let c = (element / self.spatial.max(1)) % self.channels.max(1);
        match self.mode {
            BatchNormMode::Spatial => c,
            BatchNormMode::PerActivation => c * self.spatial + s,
        }
    }

    /// Biased batch mean and variance per parameter.
    pub(super) fn statistics(&self, x: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let m = self.members().max(1) as f32;
        let mut mean = vec![0.0f32; self.params()];
        for (i, &v) in x.iter().enumerate() {
            mean[self.param_of(i)] += v;
        }
        mean.iter_mut().for_each(|v| *v /= m);
        let mut variance = vec![0.0f32; self.params()];
        for (i, &v) in x.iter().enumerate() {
            let p = self.param_of(i);
            variance[p] += (v - mean[p]) * (v - mean[p]);
        }
        variance.iter_mut().for_each(|v| *v /= m);
        (mean, variance)
    }

    /// `scale * (x - mean) * inv_std + bias`.
    pub(super) fn normalize(
        &self,
        x: &[f32],
        scale: &[f32],
        bias: &[f32],
        mean: &[f32],
        inv_std: &[f32],
    ) -> Vec<f32> {
        x.iter()
            .enumerate()
            .map(|(i, &v)| {
                let p = self.param_of(i);
                scale[p] * (v - mean[p]) * inv_std[p] + bias[p]
            })
            .collect()
    }

    /// `(dx, dscale, dbias)` of a training-mode normalization.
    pub(super) fn gradients(
        &self,
        x: &[f32],
        dy: &[f32],
        scale: &[f32],
        mean: &[f32],
        inv_std: &[f32],
    ) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let m = self.members().max(1) as f32;
        let mut dscale = vec![0.0f32; self.params()];
        let mut dbias = vec![0.0f32; self.params()];
        for (i, (&v, &d)) in x.iter().zip(dy).enumerate() {
            let p = self.param_of(i);
            dbias[p] += d;
            dscale[p] += d * (v - mean[p]) * inv_std[p];
        }
        let dx = x
            .iter()
            .zip(dy)
            .enumerate()
            .map(|(i, (&v, &d))| {
                let p = self.param_of(i);
                let xhat = (v - mean[p]) * inv_std[p];
                scale[p] * inv_std[p] / m * (m * d - dbias[p] - xhat * dscale[p])
            })
            .collect();
        (dx, dscale, dbias)
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn inverse_std(variance: &[f32], epsilon: f64) -> Vec<f32> {
    variance
        .iter()
        .map(|&v| 1.0 / (f64::from(v) + epsilon).sqrt() as f32)
        .collect()
}

// ----------------------------------------------------------------------
// RNN sizing
// ----------------------------------------------------------------------

fn usize_of(v: i32) -> usize {
    usize::try_from(v).unwrap_or(0)
}

/// Elements of all weight matrices and bias vectors.
pub(super) fn rnn_param_elements(p: &RnnParams, input_size: usize) -> usize {
    let h = usize_of(p.hidden_size);
    let gates = p.mode.gate_count();
    let dirs = p.direction.count();
    let bias = match p.bias_mode {
        crate::types::RnnBiasMode::WithBias => 2 * gates * h,
        crate::types::RnnBiasMode::NoBias => 0,
    };
    (0..usize_of(p.layers))
        .map(|layer| {
            let input = match (layer, p.input_mode) {
                (0, RnnInputMode::Skip) => 0,
                (0, RnnInputMode::Linear) => input_size,
                _ => h * dirs,
            };
            dirs * (gates * h * input + gates * h * h + bias)
        })
        .sum()
}

/// Elements of the inference workspace for per-step batch sizes.
pub(super) fn rnn_workspace_elements(p: &RnnParams, batches: &[usize]) -> usize {
    let rows: usize = batches.iter().sum();
    rows * usize_of(p.hidden_size)
        * p.direction.count()
        * (p.mode.gate_count() + 1)
        * usize_of(p.layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RnnMode, DataType};

    #[test]
    fn test_broadcast_and_reduce() {
        let b = broadcast(&[1.0, 2.0], &[1, 2, 1], &[2, 2, 2]);
        assert_eq!(b, vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(reduce(&b, &[2, 2, 2], &[1, 2, 1]), vec![6.0, 12.0]);
        assert!(broadcasts(&[1, 3, 1, 1], &[2, 3, 4, 4]));
        assert!(!broadcasts(&[2, 3], &[2, 3, 1]));
    }

    #[test]
    fn test_activation_slopes() {
        let tanh = ActivationParams::new(ActivationMode::Tanh).with_coefficients(2.0, 3.0, 0.0);
        let x = 0.3f32;
        let y = activate(&tanh, x);
        let numeric = (activate(&tanh, x + 1e-3) - activate(&tanh, x - 1e-3)) / 2e-3;
        assert!((slope(&tanh, x, y) - numeric).abs() < 1e-2);

        let elu = ActivationParams::new(ActivationMode::Elu).with_coefficients(0.5, 0.0, 0.0);
        let y = activate(&elu, -1.0);
        assert!((slope(&elu, -1.0, y) - 0.5 * (-1.0f32).exp()).abs() < 1e-6);

        let power = ActivationParams::new(ActivationMode::Power).with_coefficients(1.0, 2.0, 2.0);
        assert_eq!(slope_from_output(&power, 9.0), None);
        assert_eq!(slope(&power, 1.0, 9.0), 12.0);
    }

    #[test]
    fn test_pool_padding_modes() {
        let p = PoolingParams::new(PoolingMode::Average, &[2, 2], &[1, 1], &[2, 2]).unwrap();
        let x = [4.0f32];
        let (y, _) = pool(&p, &[1, 1, 1, 1], &[1, 1, 1, 1], &x);
        assert_eq!(y, vec![4.0]);
        let inclusive = PoolingParams {
            mode: PoolingMode::AverageInclusive,
            ..p
        };
        let (y, _) = pool(&inclusive, &[1, 1, 1, 1], &[1, 1, 1, 1], &x);
        assert_eq!(y, vec![1.0]);
    }

    #[test]
    fn test_index_codec() {
        let mut bytes = vec![0u8; 6];
        encode_indices(&[1, 300, 65535], 2, &mut bytes);
        assert_eq!(decode_indices(&bytes, 2, 3), vec![1, 300, 65535]);
    }

    #[test]
    fn test_within_channel_window() {
        let p = LrnParams {
            mode: LrnMode::WithinChannel,
            n: 3,
            alpha: 9.0,
            beta: 1.0,
            k: 0.0,
        };
        // coef = alpha / n^2 = 1; corner window covers a 2x2 block.
        let s = lrn_scale(&p, &[1, 1, 2, 2], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(s, vec![4.0; 4]);
    }

    #[test]
    fn test_batch_norm_gradient_sums_vanish() {
        let shape = BnShape::new(BatchNormMode::Spatial, &[2, 1, 2]);
        let x = [1.0f32, 2.0, 4.0, 7.0];
        let dy = [0.5f32, -1.0, 2.0, 0.25];
        let (mean, var) = shape.statistics(&x);
        let inv = inverse_std(&var, 1e-5);
        let (dx, _, dbias) = shape.gradients(&x, &dy, &[1.5], &mean, &inv);
        assert!((dbias[0] - 1.75).abs() < 1e-6);
        assert!(dx.iter().sum::<f32>().abs() < 1e-4);
    }

    #[test]
    fn test_rnn_sizes() {
        let mut p = RnnParams::new(RnnMode::Lstm, 4, 1);
        p.data_type = DataType::Float32;
        assert_eq!(rnn_param_elements(&p, 3), 144);
        p.input_mode = RnnInputMode::Skip;
        assert_eq!(rnn_param_elements(&p, 3), 96);
        assert_eq!(rnn_workspace_elements(&p, &[2, 1]), 3 * 4 * 5);
    }
}
