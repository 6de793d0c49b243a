// CUDA kernel source — compiled to PTX once per DeviceContext via NVRTC
//
// Every device-side operation Ember dispatches lives here as a named
// `extern "C"` global in one compilation unit. The loader compiles the
// unit when a DeviceContext is created and resolves functions by name;
// nothing else in the framework knows anything about the compiled bytes.
//
// Conventions:
// - All buffers are contiguous and flat; shape bookkeeping happens on the
//   host side of the kernel handle that launches these.
// - Scalar-heavy kernels (lowering, optimizer steps) take their
//   configuration through a small device buffer uploaded at stage time,
//   keeping launch signatures short.
// - col2vol accumulates with atomicAdd: overlapping receptive fields
//   contribute to the same input cell and must sum, not overwrite.

/// Name under which the compiled PTX module is registered.
pub const MODULE_NAME: &str = "ember";

/// Every kernel in [`KERNEL_SOURCE`], in load order.
pub const KERNEL_NAMES: &[&str] = &[
    "fill_f32",
    "bias_add_f32",
    "bias_grad_f32",
    "relu_f32",
    "relu_grad_f32",
    "sigmoid_f32",
    "sigmoid_grad_f32",
    "tanh_f32",
    "tanh_grad_f32",
    "vol2col_f32",
    "col2vol_f32",
    "col_max_f32",
    "col_max_scatter_f32",
    "sgd_step_f32",
    "adam_step_f32",
    "rmsprop_step_f32",
];

/// All kernel source code in one compilation unit.
pub const KERNEL_SOURCE: &str = r#"

//  FILL

extern "C" __global__ void fill_f32(float* out, float val, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) out[i] = val;
}

//  BIAS
//
// y laid out as repeated [bias_len, inner] blocks. bias_add broadcasts the
// bias across blocks; bias_grad sums gradient contributions back into it.

extern "C" __global__ void bias_add_f32(float* y, const float* bias,
                                        unsigned int bias_len, unsigned int inner,
                                        unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) y[i] += bias[(i / inner) % bias_len];
}

extern "C" __global__ void bias_grad_f32(float* db, const float* dy,
                                         unsigned int outer, unsigned int bias_len,
                                         unsigned int inner) {
    unsigned int j = blockIdx.x * blockDim.x + threadIdx.x;
    if (j >= bias_len) return;
    float acc = 0.0f;
    for (unsigned int o = 0; o < outer; ++o) {
        const float* block = dy + (o * bias_len + j) * inner;
        for (unsigned int c = 0; c < inner; ++c) acc += block[c];
    }
    db[j] = acc;
}

//  ELEMENTWISE MAPS (activations and their derivatives)

extern "C" __global__ void relu_f32(float* y, const float* x, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) y[i] = x[i] > 0.0f ? x[i] : 0.0f;
}

extern "C" __global__ void relu_grad_f32(float* dx, const float* x, const float* dy,
                                         unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) dx[i] = x[i] > 0.0f ? dy[i] : 0.0f;
}

extern "C" __global__ void sigmoid_f32(float* y, const float* x, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) y[i] = 1.0f / (1.0f + expf(-x[i]));
}

// Derivative in terms of the forward output: s'(x) = y * (1 - y).
extern "C" __global__ void sigmoid_grad_f32(float* dx, const float* y, const float* dy,
                                            unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) dx[i] = y[i] * (1.0f - y[i]) * dy[i];
}

extern "C" __global__ void tanh_f32(float* y, const float* x, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) y[i] = tanhf(x[i]);
}

extern "C" __global__ void tanh_grad_f32(float* dx, const float* y, const float* dy,
                                         unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) dx[i] = (1.0f - y[i] * y[i]) * dy[i];
}

//  SPATIAL LOWERING
//
// cfg layout (20 ints):
//   [0] batch  [1] channels
//   [2..5]  kernel   [5..8]  stride   [8..11] padding   [11..14] dilation
//   [14..17] vol extents   [17..20] col extents
// One thread per (batch element, column row); each thread walks the output
// cells of its row. Column memory is batch-major: ((elt*rows + row)*cells + cell).

extern "C" __global__ void vol2col_f32(const float* vol, float* col, const int* cfg,
                                       unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    int channels = cfg[1];
    int k0 = cfg[2], k1 = cfg[3], k2 = cfg[4];
    int s0 = cfg[5], s1 = cfg[6], s2 = cfg[7];
    int p0 = cfg[8], p1 = cfg[9], p2 = cfg[10];
    int q0 = cfg[11], q1 = cfg[12], q2 = cfg[13];
    int v0 = cfg[14], v1 = cfg[15], v2 = cfg[16];
    int c0 = cfg[17], c1 = cfg[18], c2 = cfg[19];
    int rows = channels * k0 * k1 * k2;
    int cells = c0 * c1 * c2;
    int elt = i / rows;
    int row = i % rows;
    int w_off = row % k2;
    int h_off = (row / k2) % k1;
    int d_off = (row / (k2 * k1)) % k0;
    int c_vol = row / (k2 * k1 * k0);
    long vol_base = (long)elt * channels * v0 * v1 * v2;
    long col_base = ((long)elt * rows + row) * cells;
    for (int dc = 0; dc < c0; ++dc) {
        int dv = dc * s0 - p0 + d_off * q0;
        for (int hc = 0; hc < c1; ++hc) {
            int hv = hc * s1 - p1 + h_off * q1;
            for (int wc = 0; wc < c2; ++wc) {
                int wv = wc * s2 - p2 + w_off * q2;
                long ci = col_base + ((long)dc * c1 + hc) * c2 + wc;
                if (dv >= 0 && dv < v0 && hv >= 0 && hv < v1 && wv >= 0 && wv < v2) {
                    long vi = vol_base + (((long)c_vol * v0 + dv) * v1 + hv) * v2 + wv;
                    col[ci] = vol[vi];
                } else {
                    col[ci] = 0.0f;
                }
            }
        }
    }
}

extern "C" __global__ void col2vol_f32(float* vol, const float* col, const int* cfg,
                                       unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    int channels = cfg[1];
    int k0 = cfg[2], k1 = cfg[3], k2 = cfg[4];
    int s0 = cfg[5], s1 = cfg[6], s2 = cfg[7];
    int p0 = cfg[8], p1 = cfg[9], p2 = cfg[10];
    int q0 = cfg[11], q1 = cfg[12], q2 = cfg[13];
    int v0 = cfg[14], v1 = cfg[15], v2 = cfg[16];
    int c0 = cfg[17], c1 = cfg[18], c2 = cfg[19];
    int rows = channels * k0 * k1 * k2;
    int cells = c0 * c1 * c2;
    int elt = i / rows;
    int row = i % rows;
    int w_off = row % k2;
    int h_off = (row / k2) % k1;
    int d_off = (row / (k2 * k1)) % k0;
    int c_vol = row / (k2 * k1 * k0);
    long vol_base = (long)elt * channels * v0 * v1 * v2;
    long col_base = ((long)elt * rows + row) * cells;
    for (int dc = 0; dc < c0; ++dc) {
        int dv = dc * s0 - p0 + d_off * q0;
        for (int hc = 0; hc < c1; ++hc) {
            int hv = hc * s1 - p1 + h_off * q1;
            for (int wc = 0; wc < c2; ++wc) {
                int wv = wc * s2 - p2 + w_off * q2;
                if (dv >= 0 && dv < v0 && hv >= 0 && hv < v1 && wv >= 0 && wv < v2) {
                    long vi = vol_base + (((long)c_vol * v0 + dv) * v1 + hv) * v2 + wv;
                    long ci = col_base + ((long)dc * c1 + hc) * c2 + wc;
                    // Overlapping receptive fields hit the same input cell
                    // from different rows; contributions must sum.
                    atomicAdd(vol + vi, col[ci]);
                }
            }
        }
    }
}

//  COLUMN MAX (pooling over the lowered matrix)
//
// col holds [batch][channels * kvol][cells]; one thread per output cell
// (batch, channel, cell) takes the max over the kvol taps of its channel
// and records which tap won, so the backward pass can scatter into it.

extern "C" __global__ void col_max_f32(const float* col, float* y, int* idx,
                                       unsigned int channels, unsigned int kvol,
                                       unsigned int cells, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    unsigned int cell = i % cells;
    unsigned int c = (i / cells) % channels;
    unsigned int b = i / (cells * channels);
    long base = (((long)b * channels + c) * kvol) * cells + cell;
    float best = col[base];
    int best_k = 0;
    for (unsigned int k = 1; k < kvol; ++k) {
        float v = col[base + (long)k * cells];
        if (v > best) { best = v; best_k = (int)k; }
    }
    y[i] = best;
    idx[i] = best_k;
}

extern "C" __global__ void col_max_scatter_f32(float* dcol, const int* idx,
                                               const float* dy,
                                               unsigned int channels, unsigned int kvol,
                                               unsigned int cells, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    unsigned int cell = i % cells;
    unsigned int c = (i / cells) % channels;
    unsigned int b = i / (cells * channels);
    long base = (((long)b * channels + c) * kvol) * cells + cell;
    dcol[base + (long)idx[i] * cells] = dy[i];
}

//  OPTIMIZER STEPS
//
// hp is a small device buffer of hyperparameters uploaded at stage time.

// hp: [lr, momentum, dampening, weight_decay, nesterov]
extern "C" __global__ void sgd_step_f32(float* p, const float* g, float* v,
                                        const float* hp, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float lr = hp[0], mu = hp[1], damp = hp[2], wd = hp[3];
    int nesterov = hp[4] != 0.0f;
    float gi = g[i] + wd * p[i];
    if (mu != 0.0f) {
        float vi = mu * v[i] + (1.0f - damp) * gi;
        v[i] = vi;
        gi = nesterov ? gi + mu * vi : vi;
    }
    p[i] -= lr * gi;
}

// hp: [lr, beta1, beta2, eps, weight_decay, 1-beta1^t, 1-beta2^t, amsgrad]
extern "C" __global__ void adam_step_f32(float* p, const float* g, float* m, float* r,
                                         float* rmax, const float* hp, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float lr = hp[0], b1 = hp[1], b2 = hp[2], eps = hp[3], wd = hp[4];
    float c1 = hp[5], c2 = hp[6];
    int amsgrad = hp[7] != 0.0f;
    float gi = g[i] + wd * p[i];
    m[i] = b1 * m[i] + (1.0f - b1) * gi;
    r[i] = b2 * r[i] + (1.0f - b2) * gi * gi;
    float mhat = m[i] / c1;
    float rhat;
    if (amsgrad) {
        rmax[i] = fmaxf(rmax[i], r[i]);
        rhat = rmax[i] / c2;
    } else {
        rhat = r[i] / c2;
    }
    p[i] -= lr * mhat / (sqrtf(rhat) + eps);
}

// hp: [lr, alpha, eps, weight_decay]
extern "C" __global__ void rmsprop_step_f32(float* p, const float* g, float* v,
                                            const float* hp, unsigned int n) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float lr = hp[0], alpha = hp[1], eps = hp[2], wd = hp[3];
    float gi = g[i] + wd * p[i];
    v[i] = alpha * v[i] + (1.0f - alpha) * gi * gi;
    p[i] -= lr * gi / (sqrtf(v[i]) + eps);
}
"#;
