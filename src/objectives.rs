//! Loss terms: interior mean-squared error and the optional stencil
//! regularisers (singularity and mirror-symmetry penalties).

use crate::stencil::param_index;
use crate::types::{PenaltyWeights, StencilError, NUM_PARAMS, NUM_UNKNOWN_KERNELS};
use ndarray::{s, Array2, Array3, ArrayView3};

// ─────────────────────────────────────────────────────────────
//  Data misfit
// ─────────────────────────────────────────────────────────────

/// `predicted - measured` on the interior cells `[1..N-1, 1..N-1, :]`.
pub fn interior_residual(predicted: ArrayView3<f64>, measured: ArrayView3<f64>) -> Result<Array3<f64>, StencilError> {
    if predicted.dim() != measured.dim() {
        return Err(StencilError::Shape(format!(
            "predicted {:?} and measured {:?} differ",
            predicted.dim(),
            measured.dim()
        )));
    }
    let (rows, cols, _) = predicted.dim();
    if rows < 3 || cols < 3 {
        return Err(StencilError::Shape(format!("{rows}×{cols} grid has no interior")));
    }
    let inner = s![1..rows - 1, 1..cols - 1, ..];
    Ok(&predicted.slice(inner) - &measured.slice(inner))
}

/// Mean squared error over interior cells only.  Boundary cells never
/// contribute.
pub fn interior_mse(predicted: ArrayView3<f64>, measured: ArrayView3<f64>) -> Result<f64, StencilError> {
    let r = interior_residual(predicted, measured)?;
    Ok(r.iter().map(|v| v * v).sum::<f64>() / r.len() as f64)
}

// ─────────────────────────────────────────────────────────────
//  Singularity penalty   Σ_b |Σ_ij w_b[i,j]|
// ─────────────────────────────────────────────────────────────

fn kernel_sum(theta: &[f64], block: usize) -> f64 {
    theta[param_index(block, 0, 0)..param_index(block + 1, 0, 0)].iter().sum()
}

/// Zero when every unknown kernel sums to zero (rigid-body modes carry
/// no load).
pub fn singularity_penalty(theta: &[f64]) -> f64 {
    (0..NUM_UNKNOWN_KERNELS).map(|b| kernel_sum(theta, b).abs()).sum()
}

/// Subgradient `sign(Σ w_b)` on every entry of kernel b; 0 at the kink.
pub fn singularity_penalty_grad(grad: &mut [f64], theta: &[f64], weight: f64) {
    for b in 0..NUM_UNKNOWN_KERNELS {
        let sum = kernel_sum(theta, b);
        let g = if sum > 0.0 {
            weight
        } else if sum < 0.0 {
            -weight
        } else {
            0.0
        };
        for r in 0..3 {
            for c in 0..3 {
                grad[param_index(b, r, c)] += g;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Symmetry penalty   Σ_b Σ_pairs (w_b[p] - w_b[q])²
// ─────────────────────────────────────────────────────────────

/// Entry pairs that a mirror-symmetric kernel keeps equal.
pub static SYMMETRY_PAIRS: [((usize, usize), (usize, usize)); 4] = [
    ((0, 0), (2, 2)),
    ((1, 0), (1, 2)),
    ((0, 1), (2, 1)),
    ((0, 2), (2, 0)),
];

fn symmetry_terms(block: usize) -> impl Iterator<Item = (usize, usize)> {
    SYMMETRY_PAIRS
        .iter()
        .map(move |&((r1, c1), (r2, c2))| (param_index(block, r1, c1), param_index(block, r2, c2)))
}

pub fn symmetry_penalty(theta: &[f64]) -> f64 {
    (0..NUM_UNKNOWN_KERNELS)
        .flat_map(symmetry_terms)
        .map(|(p, q)| (theta[p] - theta[q]).powi(2))
        .sum()
}

pub fn symmetry_penalty_grad(grad: &mut [f64], theta: &[f64], weight: f64) {
    for (p, q) in (0..NUM_UNKNOWN_KERNELS).flat_map(symmetry_terms) {
        let g = 2.0 * weight * (theta[p] - theta[q]);
        grad[p] += g;
        grad[q] -= g;
    }
}

/// Constant Hessian of the symmetry penalty.
pub fn symmetry_penalty_hessian(hess: &mut Array2<f64>, weight: f64) {
    for (p, q) in (0..NUM_UNKNOWN_KERNELS).flat_map(symmetry_terms) {
        let h = 2.0 * weight;
        hess[[p, p]] += h;
        hess[[q, q]] += h;
        hess[[p, q]] -= h;
        hess[[q, p]] -= h;
    }
}

// ─────────────────────────────────────────────────────────────
//  Weighted regularisation
// ─────────────────────────────────────────────────────────────

pub fn penalty_loss(theta: &[f64], weights: &PenaltyWeights) -> f64 {
    debug_assert_eq!(theta.len(), NUM_PARAMS);
    let mut total = 0.0;
    if weights.singularity != 0.0 {
        total += weights.singularity * singularity_penalty(theta);
    }
    if weights.symmetry != 0.0 {
        total += weights.symmetry * symmetry_penalty(theta);
    }
    total
}

pub fn penalty_grad(grad: &mut [f64], theta: &[f64], weights: &PenaltyWeights) {
    if weights.singularity != 0.0 {
        singularity_penalty_grad(grad, theta, weights.singularity);
    }
    if weights.symmetry != 0.0 {
        symmetry_penalty_grad(grad, theta, weights.symmetry);
    }
}

/// The singularity term is piecewise linear and adds nothing here.
pub fn penalty_hessian(hess: &mut Array2<f64>, weights: &PenaltyWeights) {
    if weights.symmetry != 0.0 {
        symmetry_penalty_hessian(hess, weights.symmetry);
    }
}
