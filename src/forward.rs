//! Forward operator: boundary padding + valid-mode stencil convolution.

use crate::stencil::{assemble_stencil, split_parameters};
use crate::types::{CalibrationProblem, Field, Stencil, StencilError, KERNEL_SIZE, NUM_CHANNELS};
use ndarray::{s, Array3, ArrayView3};

// ─────────────────────────────────────────────────────────────
//  Boundary padding
// ─────────────────────────────────────────────────────────────

/// Grow a `(R, C, K)` grid to `(R+2, C+2, K)`.
///
/// The ghost column on the left copies column 1, the one on the right
/// copies column C-2 (the second cell in from each edge, not the edge
/// itself).  Ghost rows copy rows 1 and R-2 of the column-padded grid,
/// so each ghost corner holds the diagonally reflected interior cell,
/// e.g. `padded[0, 0] == x[1, 1]`.
pub fn pad_boundary(x: ArrayView3<f64>) -> Result<Array3<f64>, StencilError> {
    let (rows, cols, channels) = x.dim();
    if rows < 2 || cols < 2 {
        return Err(StencilError::Shape(format!(
            "cannot pad a {rows}×{cols} grid; need at least 2×2"
        )));
    }

    let mut padded = Array3::zeros((rows + 2, cols + 2, channels));
    padded.slice_mut(s![1..rows + 1, 1..cols + 1, ..]).assign(&x);
    // Columns first, over the interior rows.
    padded.slice_mut(s![1..rows + 1, 0, ..]).assign(&x.slice(s![.., 1, ..]));
    padded
        .slice_mut(s![1..rows + 1, cols + 1, ..])
        .assign(&x.slice(s![.., cols - 2, ..]));
    // Then full-width rows, which carries the corners along.
    let top = padded.slice(s![2, .., ..]).to_owned();
    let bottom = padded.slice(s![rows - 1, .., ..]).to_owned();
    padded.slice_mut(s![0, .., ..]).assign(&top);
    padded.slice_mut(s![rows + 1, .., ..]).assign(&bottom);

    Ok(padded)
}

// ─────────────────────────────────────────────────────────────
//  Convolution
// ─────────────────────────────────────────────────────────────

/// Valid-mode, stride-1 multi-channel cross-correlation:
///
///   out[i, j, o] = Σ_{r, c, k}  input[i + r, j + c, k] · w[r, c, k, o]
///
/// A `(P, Q, 3)` input yields a `(P-2, Q-2, 3)` output.
pub fn convolve_valid(input: ArrayView3<f64>, stencil: &Stencil) -> Result<Array3<f64>, StencilError> {
    let (rows, cols, channels) = input.dim();
    if channels != NUM_CHANNELS {
        return Err(StencilError::Shape(format!(
            "convolution input must have {NUM_CHANNELS} channels, got {channels}"
        )));
    }
    if rows < KERNEL_SIZE || cols < KERNEL_SIZE {
        return Err(StencilError::Shape(format!(
            "convolution input {rows}×{cols} is smaller than the {KERNEL_SIZE}×{KERNEL_SIZE} kernel"
        )));
    }

    let w = stencil.weights();
    let out_rows = rows - KERNEL_SIZE + 1;
    let out_cols = cols - KERNEL_SIZE + 1;
    let mut out = Array3::zeros((out_rows, out_cols, NUM_CHANNELS));

    for i in 0..out_rows {
        for j in 0..out_cols {
            for r in 0..KERNEL_SIZE {
                for c in 0..KERNEL_SIZE {
                    for k in 0..NUM_CHANNELS {
                        let v = input[[i + r, j + c, k]];
                        for o in 0..NUM_CHANNELS {
                            out[[i, j, o]] += v * w[[r, c, k, o]];
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Pad a response field and apply the stencil; the result has the same
/// N × N × 3 shape as the response.
pub fn apply_stencil(response: &Field, stencil: &Stencil) -> Result<Field, StencilError> {
    let padded = pad_boundary(response.data().view())?;
    Field::new(convolve_valid(padded.view(), stencil)?)
}

/// Predicted load field for parameter vector `theta`.
pub fn predict(problem: &CalibrationProblem, theta: &[f64]) -> Result<Field, StencilError> {
    let unknown = split_parameters(theta)?;
    let stencil = assemble_stencil(&problem.known, &unknown);
    apply_stencil(&problem.response, &stencil)
}
