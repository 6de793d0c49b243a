use rayon::prelude::*;

use crate::bail;
use crate::error::{Error, Result};

// Spatial lowering — vol2col / col2vol
//
// Convolution and pooling are lowered to matrix multiplication: vol2col
// gathers every receptive-field patch of an N-d input into a column
// matrix, GEMM does the arithmetic, and col2vol scatters a column-shaped
// gradient back into input space. col2vol must *accumulate*: when the
// stride is smaller than the kernel extent, receptive fields overlap and
// several column cells refer to the same input cell — their gradient
// contributions sum.
//
// Dimensionality is normalized to three spatial axes (missing leading
// axes have extent 1) so 1-D, 2-D and 3-D convolution and pooling share
// one implementation.
//
// Column memory is batch-major: ((elt * rows + row) * cells + cell) with
// rows = channels * kernel_volume and cells = col0 * col1 * col2. GEMMs
// walk the per-batch column blocks by offset.

/// Number of spatial axes everything is normalized to.
pub const MAX_DIMS: usize = 3;

/// Normalize an int-or-list argument onto the trailing axes of a
/// MAX_DIMS-long array, leading axes keeping `default`.
///
/// `dim_fix(1, &[3, 3], 2)` → `[1, 3, 3]`.
pub fn dim_fix(default: usize, arg: &[usize], dims: usize) -> [usize; MAX_DIMS] {
    let mut out = [default; MAX_DIMS];
    let take = dims.min(arg.len()).min(MAX_DIMS);
    for j in 0..take {
        out[MAX_DIMS - take + j] = arg[arg.len() - take + j];
    }
    out
}

/// Fixed configuration of one lowering: everything needed to map between
/// volume space and column space. Stateless given this configuration —
/// the same instance serves the forward data path and the backward
/// gradient path by swapping source and destination buffers.
#[derive(Debug, Clone)]
pub struct Lowering {
    pub batch: usize,
    pub channels: usize,
    pub kernel: [usize; MAX_DIMS],
    pub stride: [usize; MAX_DIMS],
    pub padding: [usize; MAX_DIMS],
    pub dilation: [usize; MAX_DIMS],
    /// Input spatial extents.
    pub vol: [usize; MAX_DIMS],
    /// Output spatial extents, derived from the rest.
    pub col: [usize; MAX_DIMS],
}

impl Lowering {
    /// Derive the output extents from the input extents:
    /// `col = (vol + 2*padding - dilation*(kernel-1) - 1) / stride + 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch: usize,
        channels: usize,
        vol: [usize; MAX_DIMS],
        kernel: [usize; MAX_DIMS],
        stride: [usize; MAX_DIMS],
        padding: [usize; MAX_DIMS],
        dilation: [usize; MAX_DIMS],
    ) -> Result<Self> {
        let mut col = [0usize; MAX_DIMS];
        for i in 0..MAX_DIMS {
            if stride[i] == 0 || kernel[i] == 0 {
                return Err(Error::Unsupported(format!(
                    "zero kernel or stride extent on axis {i}"
                )));
            }
            let span = 2 * padding[i] + vol[i];
            let reach = dilation[i] * (kernel[i] - 1) + 1;
            if span < reach {
                return Err(Error::ShapeMismatch {
                    expected: crate::shape::Shape::new(kernel.to_vec()),
                    got: crate::shape::Shape::new(vol.to_vec()),
                });
            }
            col[i] = (span - reach) / stride[i] + 1;
        }
        Ok(Lowering {
            batch,
            channels,
            kernel,
            stride,
            padding,
            dilation,
            vol,
            col,
        })
    }

    /// Kernel volume: taps per channel.
    pub fn kernel_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Rows of the column matrix: channels × kernel volume.
    pub fn rows(&self) -> usize {
        self.channels * self.kernel_volume()
    }

    /// Output cells per batch element.
    pub fn cells(&self) -> usize {
        self.col.iter().product()
    }

    /// Input cells per batch element (all channels).
    pub fn vol_len(&self) -> usize {
        self.channels * self.vol.iter().product::<usize>()
    }

    /// Total column matrix length.
    pub fn col_len(&self) -> usize {
        self.batch * self.rows() * self.cells()
    }

    /// Gather: volume → column matrix. Out-of-range taps write zero
    /// (zero-padding semantics).
    pub fn vol2col(&self, vol: &[f32], col: &mut [f32]) -> Result<()> {
        self.check_lengths(vol.len(), col.len())?;
        let rows = self.rows();
        let cells = self.cells();
        let per_batch_vol = self.vol_len();
        col.par_chunks_mut(rows * cells)
            .enumerate()
            .for_each(|(elt, col_block)| {
                let vol_block = &vol[elt * per_batch_vol..(elt + 1) * per_batch_vol];
                for row in 0..rows {
                    self.walk_row(row, |tap_in_range, vol_idx, cell| {
                        col_block[row * cells + cell] = if tap_in_range { vol_block[vol_idx] } else { 0.0 };
                    });
                }
            });
        Ok(())
    }

    /// Scatter-accumulate: column matrix → volume. Contributions from
    /// overlapping receptive fields sum into the same input cell; the
    /// caller decides whether the destination starts zeroed.
    pub fn col2vol(&self, col: &[f32], vol: &mut [f32]) -> Result<()> {
        self.check_lengths(vol.len(), col.len())?;
        let rows = self.rows();
        let cells = self.cells();
        let per_batch_vol = self.vol_len();
        vol.par_chunks_mut(per_batch_vol)
            .enumerate()
            .for_each(|(elt, vol_block)| {
                let col_block = &col[elt * rows * cells..(elt + 1) * rows * cells];
                for row in 0..rows {
                    self.walk_row(row, |tap_in_range, vol_idx, cell| {
                        if tap_in_range {
                            vol_block[vol_idx] += col_block[row * cells + cell];
                        }
                    });
                }
            });
        Ok(())
    }

    /// The [20-int] configuration block the device kernels consume.
    pub(crate) fn device_config(&self) -> Vec<i32> {
        let mut cfg = Vec::with_capacity(20);
        cfg.push(self.batch as i32);
        cfg.push(self.channels as i32);
        for arr in [&self.kernel, &self.stride, &self.padding, &self.dilation, &self.vol, &self.col] {
            cfg.extend(arr.iter().map(|&x| x as i32));
        }
        cfg
    }

    /// Visit every output cell of one column row, reporting whether the
    /// tap lands inside the volume and, when it does, the flat (single
    /// batch element, all channels) volume index.
    fn walk_row(&self, row: usize, mut visit: impl FnMut(bool, usize, usize)) {
        let [k0, k1, k2] = self.kernel;
        let w_off = row % k2;
        let h_off = (row / k2) % k1;
        let d_off = (row / (k2 * k1)) % k0;
        let c_vol = row / (k2 * k1 * k0);
        let [v0, v1, v2] = self.vol;
        let [c0, c1, c2] = self.col;
        let mut cell = 0usize;
        for dc in 0..c0 {
            let dv = (dc * self.stride[0] + d_off * self.dilation[0]) as isize
                - self.padding[0] as isize;
            for hc in 0..c1 {
                let hv = (hc * self.stride[1] + h_off * self.dilation[1]) as isize
                    - self.padding[1] as isize;
                for wc in 0..c2 {
                    let wv = (wc * self.stride[2] + w_off * self.dilation[2]) as isize
                        - self.padding[2] as isize;
                    let inside = dv >= 0
                        && (dv as usize) < v0
                        && hv >= 0
                        && (hv as usize) < v1
                        && wv >= 0
                        && (wv as usize) < v2;
                    let vol_idx = if inside {
                        ((c_vol * v0 + dv as usize) * v1 + hv as usize) * v2 + wv as usize
                    } else {
                        0
                    };
                    visit(inside, vol_idx, cell);
                    cell += 1;
                }
            }
        }
    }

    fn check_lengths(&self, vol_len: usize, col_len: usize) -> Result<()> {
        let want_vol = self.batch * self.vol_len();
        if vol_len != want_vol {
            bail!("lowering: volume buffer has {vol_len} elements, expected {want_vol}");
        }
        let want_col = self.col_len();
        if col_len != want_col {
            bail!("lowering: column buffer has {col_len} elements, expected {want_col}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> Lowering {
        // 5×5 single-channel input, 3×3 kernel, stride 1, padding 1.
        Lowering::new(
            1,
            1,
            [1, 5, 5],
            [1, 3, 3],
            [1, 1, 1],
            [0, 1, 1],
            [1, 1, 1],
        )
        .unwrap()
    }

    #[test]
    fn dim_fix_normalizes_trailing_axes() {
        assert_eq!(dim_fix(1, &[3, 3], 2), [1, 3, 3]);
        assert_eq!(dim_fix(0, &[2], 1), [0, 0, 2]);
        assert_eq!(dim_fix(1, &[7], 3), [1, 1, 7]);
        assert_eq!(dim_fix(1, &[2, 3, 4], 3), [2, 3, 4]);
    }

    #[test]
    fn output_extents_formula() {
        let l = canonical();
        assert_eq!(l.col, [1, 5, 5]);
        // 5 input, kernel 3, stride 2, no padding → floor((5-3)/2)+1 = 2
        let l2 = Lowering::new(1, 1, [1, 5, 5], [1, 3, 3], [1, 2, 2], [0, 0, 0], [1, 1, 1]).unwrap();
        assert_eq!(l2.col, [1, 2, 2]);
        // Dilation widens the reach: kernel 3 dilation 2 reaches 5.
        let l3 = Lowering::new(1, 1, [1, 7, 7], [1, 3, 3], [1, 1, 1], [0, 0, 0], [1, 2, 2]).unwrap();
        assert_eq!(l3.col, [1, 3, 3]);
    }

    #[test]
    fn gather_produces_padded_neighborhoods() {
        let l = canonical();
        let vol: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let mut col = vec![0.0f32; l.col_len()];
        l.vol2col(&vol, &mut col).unwrap();
        assert_eq!(l.rows(), 9);
        assert_eq!(l.cells(), 25);
        // Column 0 is the zero-padded 3×3 neighborhood of input cell (0,0).
        let column0: Vec<f32> = (0..9).map(|r| col[r * 25]).collect();
        assert_eq!(column0, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 5.0, 6.0]);
        // Column 12 (center cell (2,2)) is the full neighborhood of 12.
        let column12: Vec<f32> = (0..9).map(|r| col[r * 25 + 12]).collect();
        assert_eq!(
            column12,
            vec![6.0, 7.0, 8.0, 11.0, 12.0, 13.0, 16.0, 17.0, 18.0]
        );
    }

    #[test]
    fn scatter_accumulates_overlap_counts() {
        // All-ones kernel, stride 1: vol2col then col2vol writes, at each
        // input cell, the number of receptive fields containing it.
        let l = canonical();
        let vol = vec![1.0f32; 25];
        let mut col = vec![0.0f32; l.col_len()];
        l.vol2col(&vol, &mut col).unwrap();
        // Replace gathered values with ones so the scatter counts taps.
        for c in col.iter_mut() {
            *c = 1.0;
        }
        let mut back = vec![0.0f32; 25];
        l.col2vol(&col, &mut back).unwrap();
        // Interior cells are covered by all 9 overlapping fields,
        // corners only by 4, edges by 6.
        assert_eq!(back[12], 9.0);
        assert_eq!(back[0], 4.0);
        assert_eq!(back[2], 6.0);
    }

    #[test]
    fn batch_blocks_are_independent() {
        let l = Lowering::new(2, 1, [1, 3, 3], [1, 2, 2], [1, 1, 1], [0, 0, 0], [1, 1, 1]).unwrap();
        let mut vol = vec![0.0f32; 18];
        for (i, v) in vol.iter_mut().enumerate() {
            *v = i as f32;
        }
        let mut col = vec![0.0f32; l.col_len()];
        l.vol2col(&vol, &mut col).unwrap();
        let rows = l.rows();
        let cells = l.cells();
        // First cell of batch element 1 gathers from the second volume block.
        assert_eq!(col[rows * cells], 9.0);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let l = canonical();
        let vol = vec![0.0f32; 24];
        let mut col = vec![0.0f32; l.col_len()];
        assert!(l.vol2col(&vol, &mut col).is_err());
    }
}
