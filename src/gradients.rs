//! Closed-form loss, gradient and Hessian of the calibration objective.
//!
//! The forward operator is linear in the unknown kernel entries, so the
//! interior residual is affine in θ:
//!
//!   r(θ) = r₀ + J θ,        J[(i,j,o), p] = P[i+1+dr_p, j+1+dc_p, in_p]  if o = out_p
//!
//! where P is the padded response.  With M interior residual entries:
//!
//!   L(θ)  = |r|² / M
//!   ∇L    = (2/M) Jᵀ r
//!   ∇²L   = (2/M) Jᵀ J          (constant)
//!
//! J is assembled once as a sparse matrix; everything else is a pure
//! function of θ.  No AD framework needed.

use crate::forward::{pad_boundary, predict};
use crate::objectives::{interior_mse, interior_residual, penalty_grad, penalty_hessian, penalty_loss};
use crate::stencil::param_index;
use crate::types::{
    CalibrationProblem, Field, StencilError, KERNEL_SIZE, NUM_CHANNELS, NUM_PARAMS, UNKNOWN_BLOCKS,
};
use ndarray::Array2;
use sprs::{CsMat, TriMat};

/// Loss, gradient and Hessian at one parameter vector.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub params: Vec<f64>,
    pub loss: f64,
    pub gradient: Vec<f64>,
    pub hessian: Array2<f64>,
}

/// Objective oracle for one calibration problem.
///
/// Immutable after construction: `loss`, `gradient` and `hessian` may be
/// called in any order and any number of times for the same θ.
#[derive(Debug)]
pub struct Evaluator<'a> {
    problem: &'a CalibrationProblem,
    /// ∂r/∂θ  (M × 36, CSC).
    jacobian: CsMat<f64>,
    /// (2/M) JᵀJ.
    data_hessian: Array2<f64>,
    num_residuals: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(problem: &'a CalibrationProblem) -> Result<Self, StencilError> {
        for (name, field) in [("response", &problem.response), ("load", &problem.load)] {
            if !field.data().iter().all(|v| v.is_finite()) {
                return Err(StencilError::NumericalInstability(format!(
                    "{name} field contains non-finite values"
                )));
            }
        }

        let jacobian = build_jacobian(problem)?;
        let num_residuals = jacobian.rows();

        let jt = jacobian.transpose_view().to_csc();
        let gram = &jt * &jacobian;
        let scale = 2.0 / num_residuals as f64;
        let mut data_hessian = Array2::zeros((NUM_PARAMS, NUM_PARAMS));
        for (&v, (r, c)) in gram.iter() {
            data_hessian[[r, c]] += scale * v;
        }

        Ok(Self { problem, jacobian, data_hessian, num_residuals })
    }

    pub fn problem(&self) -> &CalibrationProblem {
        self.problem
    }

    /// Number of residual entries M the mean runs over.
    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    /// Sparse sensitivity matrix ∂r/∂θ.
    pub fn jacobian(&self) -> &CsMat<f64> {
        &self.jacobian
    }

    /// Predicted load field at θ.
    pub fn predict(&self, theta: &[f64]) -> Result<Field, StencilError> {
        predict(self.problem, theta)
    }

    /// Full-grid `predicted - measured`, boundary included.
    pub fn residual(&self, theta: &[f64]) -> Result<Field, StencilError> {
        let predicted = self.predict(theta)?;
        Field::new(predicted.data() - self.problem.load.data())
    }

    /// Interior residual flattened in row order `(i, j, o)`.
    fn interior_residual_vec(&self, theta: &[f64]) -> Result<Vec<f64>, StencilError> {
        let predicted = self.predict(theta)?;
        let r = interior_residual(predicted.data().view(), self.problem.load.data().view())?;
        Ok(r.iter().copied().collect())
    }

    pub fn loss(&self, theta: &[f64]) -> Result<f64, StencilError> {
        let predicted = self.predict(theta)?;
        let mse = interior_mse(predicted.data().view(), self.problem.load.data().view())?;
        let total = mse + penalty_loss(theta, &self.problem.options.penalties);
        check_finite_scalar("loss", total)
    }

    pub fn gradient(&self, theta: &[f64]) -> Result<Vec<f64>, StencilError> {
        let r = self.interior_residual_vec(theta)?;
        let mut grad = self.data_gradient(&r);
        penalty_grad(&mut grad, theta, &self.problem.options.penalties);
        check_finite_slice("gradient", &grad)?;
        Ok(grad)
    }

    /// Compute both L(θ) and ∇L(θ) from one forward pass.
    pub fn value_and_gradient(&self, theta: &[f64]) -> Result<(f64, Vec<f64>), StencilError> {
        let r = self.interior_residual_vec(theta)?;
        let penalties = &self.problem.options.penalties;

        let mse = r.iter().map(|v| v * v).sum::<f64>() / self.num_residuals as f64;
        let loss = check_finite_scalar("loss", mse + penalty_loss(theta, penalties))?;

        let mut grad = self.data_gradient(&r);
        penalty_grad(&mut grad, theta, penalties);
        check_finite_slice("gradient", &grad)?;
        Ok((loss, grad))
    }

    /// ∇²L(θ).  The data term is constant; θ only enters through the
    /// parameter-length check.
    pub fn hessian(&self, theta: &[f64]) -> Result<Array2<f64>, StencilError> {
        if theta.len() != NUM_PARAMS {
            return Err(StencilError::Shape(format!(
                "parameter vector must have {NUM_PARAMS} entries, got {}",
                theta.len()
            )));
        }
        let mut hess = self.data_hessian.clone();
        penalty_hessian(&mut hess, &self.problem.options.penalties);
        if let Some(((r, c), v)) = hess.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(StencilError::NumericalInstability(format!(
                "Hessian entry ({r}, {c}) is {v}"
            )));
        }
        Ok(hess)
    }

    pub fn evaluate(&self, theta: &[f64]) -> Result<Evaluation, StencilError> {
        let (loss, gradient) = self.value_and_gradient(theta)?;
        let hessian = self.hessian(theta)?;
        Ok(Evaluation { params: theta.to_vec(), loss, gradient, hessian })
    }

    /// (2/M) Jᵀ r.
    fn data_gradient(&self, r: &[f64]) -> Vec<f64> {
        let scale = 2.0 / self.num_residuals as f64;
        self.jacobian
            .outer_iterator()
            .map(|col| col.iter().map(|(row, &v)| v * r[row]).sum::<f64>() * scale)
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Sensitivity assembly
// ─────────────────────────────────────────────────────────────

/// Row of residual entry `(i, j, o)` of the `(N-2) × (N-2) × 3` interior.
#[inline]
fn residual_row(i: usize, j: usize, o: usize, interior: usize) -> usize {
    (i * interior + j) * NUM_CHANNELS + o
}

fn build_jacobian(problem: &CalibrationProblem) -> Result<CsMat<f64>, StencilError> {
    let n = problem.grid_size();
    let interior = n - 2;
    let padded = pad_boundary(problem.response.data().view())?;
    let rows = interior * interior * NUM_CHANNELS;

    let mut tri = TriMat::new((rows, NUM_PARAMS));
    for (b, &(input, output)) in UNKNOWN_BLOCKS.iter().enumerate() {
        for dr in 0..KERNEL_SIZE {
            for dc in 0..KERNEL_SIZE {
                let p = param_index(b, dr, dc);
                for i in 0..interior {
                    for j in 0..interior {
                        // Interior cell (i+1, j+1) of the prediction reads
                        // padded[(i+1) + dr, (j+1) + dc].
                        let v = padded[[i + 1 + dr, j + 1 + dc, input]];
                        if v != 0.0 {
                            tri.add_triplet(residual_row(i, j, output, interior), p, v);
                        }
                    }
                }
            }
        }
    }
    Ok(tri.to_csc())
}

fn check_finite_scalar(what: &str, v: f64) -> Result<f64, StencilError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(StencilError::NumericalInstability(format!("{what} is {v}")))
    }
}

fn check_finite_slice(what: &str, v: &[f64]) -> Result<(), StencilError> {
    match v.iter().position(|x| !x.is_finite()) {
        Some(i) => Err(StencilError::NumericalInstability(format!("{what}[{i}] is {}", v[i]))),
        None => Ok(()),
    }
}
