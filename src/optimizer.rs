//! Optimisation drivers.
//!
//! `run_bfgs` wraps the closed-form oracle into argmin's `CostFunction`
//! + `Gradient` traits and runs L-BFGS.  `run_newton` dispatches on
//! [`NewtonMethod`]: a line-search Newton-CG loop, a trust-region Newton
//! loop with a Steihaug-Toint subproblem, or full Newton steps through a
//! sparse LDLᵀ factorisation.  None of them know any physics; they only
//! see the [`Evaluator`].  All three second-order loops stop as soon as
//! `‖∇L‖₂ ≤ gradient_tolerance`.
//!
//! Uses `Vec<f64>` as the argmin parameter type to avoid ndarray version
//! conflicts with argmin-math.

use crate::gradients::Evaluator;
use crate::types::{CalibrationProblem, FitResult, NewtonMethod, SolverOptions, StencilError, NUM_PARAMS};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ndarray::{Array1, Array2, ArrayView1};
use sprs::{FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;
use std::cell::{Cell, RefCell};

/// Sufficient-decrease constant of the Newton-CG backtracking search.
const ARMIJO_C1: f64 = 1e-4;
/// Step length below which the backtracking search gives up.
const MIN_STEP: f64 = 1e-10;
/// Trust-region acceptance threshold on actual / predicted decrease.
const TRUST_ETA: f64 = 0.125;
/// LDLᵀ pivots below this fraction of the largest count as zero.
const PIVOT_TOLERANCE: f64 = 1e-9;
/// Relative residual of the CG solve that replaces a singular LDLᵀ step.
const FALLBACK_CG_TOLERANCE: f64 = 1e-10;

const BUDGET_EXHAUSTED: &str = "cost evaluation budget exhausted";

// ─────────────────────────────────────────────────────────────
//  Evaluation budget
// ─────────────────────────────────────────────────────────────

/// Counts cost evaluations and remembers the best point seen, so a run
/// cut short by the budget still has something to return.
struct EvaluationBudget {
    limit: Option<usize>,
    count: Cell<usize>,
    gradients: Cell<usize>,
    exhausted: Cell<bool>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
}

impl EvaluationBudget {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            count: Cell::new(0),
            gradients: Cell::new(0),
            exhausted: Cell::new(false),
            best: RefCell::new(None),
        }
    }

    fn record(&self, theta: &[f64], loss: f64) {
        let mut best = self.best.borrow_mut();
        let improved = best.as_ref().map_or(true, |(_, l)| loss < *l);
        if improved {
            *best = Some((theta.to_vec(), loss));
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Borrowed evaluator + budget so argmin can call cost and gradient.
/// The evaluator is immutable, so no result caching is needed to keep
/// the calls consistent.
struct StencilObjective<'e, 'p> {
    evaluator: &'e Evaluator<'p>,
    budget: &'e EvaluationBudget,
}

fn to_argmin(e: StencilError) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

impl<'e, 'p> CostFunction for StencilObjective<'e, 'p> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let used = self.budget.count.get();
        if self.budget.limit.is_some_and(|limit| used >= limit) {
            self.budget.exhausted.set(true);
            return Err(argmin::core::Error::msg(BUDGET_EXHAUSTED));
        }
        self.budget.count.set(used + 1);
        let loss = self.evaluator.loss(theta).map_err(to_argmin)?;
        self.budget.record(theta, loss);
        Ok(loss)
    }
}

impl<'e, 'p> Gradient for StencilObjective<'e, 'p> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.budget.gradients.set(self.budget.gradients.get() + 1);
        self.evaluator.gradient(theta).map_err(to_argmin)
    }
}

// ─────────────────────────────────────────────────────────────
//  Small vector helpers
// ─────────────────────────────────────────────────────────────

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn check_length(theta: &[f64]) -> Result<(), StencilError> {
    if theta.len() == NUM_PARAMS {
        Ok(())
    } else {
        Err(StencilError::Shape(format!(
            "initial parameter vector must have {NUM_PARAMS} entries, got {}",
            theta.len()
        )))
    }
}

/// Loss and gradient norm at the final point.
fn finish(
    evaluator: &Evaluator,
    params: Vec<f64>,
    iterations: usize,
    evaluations: usize,
    converged: impl FnOnce(f64) -> bool,
    message: String,
) -> Result<FitResult, StencilError> {
    let (loss, grad) = evaluator.value_and_gradient(&params)?;
    let gradient_norm = norm(&grad);
    let converged = converged(gradient_norm);
    if converged {
        log::info!("converged after {iterations} iterations: loss={loss:.6e}, |g|={gradient_norm:.3e}");
    } else {
        log::warn!(
            "stopped without convergence after {iterations} iterations ({message}): loss={loss:.6e}, |g|={gradient_norm:.3e}"
        );
    }
    Ok(FitResult {
        params,
        loss,
        gradient_norm,
        iterations,
        evaluations,
        converged,
        message,
    })
}

// ─────────────────────────────────────────────────────────────
//  L-BFGS
// ─────────────────────────────────────────────────────────────

/// L-BFGS from the zero parameter vector.
pub fn run_bfgs(problem: &CalibrationProblem) -> Result<FitResult, StencilError> {
    run_bfgs_from(problem, &[0.0; NUM_PARAMS])
}

/// L-BFGS from `init`, bounded by `max_iterations` and `max_evaluations`.
pub fn run_bfgs_from(problem: &CalibrationProblem, init: &[f64]) -> Result<FitResult, StencilError> {
    check_length(init)?;
    let opts = &problem.options;
    let evaluator = Evaluator::new(problem)?;
    let tol = opts.lbfgs_gradient_tolerance;

    let (loss0, grad0) = evaluator.value_and_gradient(init)?;
    log::info!("L-BFGS start: loss={loss0:.6e}, |g|={:.3e}", norm(&grad0));
    if norm(&grad0) <= tol {
        return finish(&evaluator, init.to_vec(), 0, 1, |_| true, "gradient below tolerance at start".into());
    }

    let budget = EvaluationBudget::new(Some(opts.max_evaluations));
    let objective = StencilObjective { evaluator: &evaluator, budget: &budget };

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, opts.lbfgs_memory)
        .with_tolerance_grad(tol)?
        .with_tolerance_cost(opts.lbfgs_cost_tolerance)?;

    let run = Executor::new(objective, solver)
        .configure(|config| {
            config
                .param(init.to_vec())
                .max_iters(opts.max_iterations as u64)
        })
        .run();

    let evaluations = budget.count.get();
    match run {
        Ok(result) => {
            let state = result.state();
            let best = state
                .get_best_param()
                .cloned()
                .ok_or_else(|| StencilError::Solver("L-BFGS returned no best parameters".into()))?;
            let solver_converged = matches!(
                state.get_termination_reason(),
                Some(TerminationReason::SolverConverged)
            );
            let message = match state.get_termination_reason() {
                Some(reason) => format!("{reason:?}"),
                None => "terminated".into(),
            };
            let iterations = state.get_iter() as usize;
            finish(&evaluator, best, iterations, evaluations, |g| solver_converged || g <= tol, message)
        }
        Err(_) if budget.exhausted.get() => {
            let (best, _) = budget
                .best
                .borrow_mut()
                .take()
                .unwrap_or_else(|| (init.to_vec(), loss0));
            // argmin drops its state on error; gradient calls past the
            // initial one stand in for the iteration count.
            finish(
                &evaluator,
                best,
                budget.gradients.get().saturating_sub(1),
                evaluations,
                |_| false,
                format!("{BUDGET_EXHAUSTED} ({} evaluations)", opts.max_evaluations),
            )
        }
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────────
//  Second-order methods
// ─────────────────────────────────────────────────────────────

/// Second-order minimisation from the zero parameter vector, using
/// `problem.options.newton_method`.
pub fn run_newton(problem: &CalibrationProblem) -> Result<FitResult, StencilError> {
    run_newton_from(problem, &[0.0; NUM_PARAMS])
}

/// Second-order minimisation from `init`.  Converged means
/// `‖∇L‖₂ ≤ gradient_tolerance` at the returned point.
pub fn run_newton_from(problem: &CalibrationProblem, init: &[f64]) -> Result<FitResult, StencilError> {
    check_length(init)?;
    let opts = &problem.options;
    let evaluator = Evaluator::new(problem)?;
    let tol = opts.gradient_tolerance;

    let (loss0, grad0) = evaluator.value_and_gradient(init)?;
    log::info!(
        "{:?} start: loss={loss0:.6e}, |g|={:.3e}",
        opts.newton_method,
        norm(&grad0)
    );
    if norm(&grad0) <= tol {
        return finish(&evaluator, init.to_vec(), 0, 1, |_| true, "gradient below tolerance at start".into());
    }

    match opts.newton_method {
        NewtonMethod::NewtonCg => newton_cg(&evaluator, init, opts),
        NewtonMethod::TrustRegion => trust_region(&evaluator, init, opts),
        NewtonMethod::Direct => direct_newton(&evaluator, init, opts),
    }
}

/// Forcing term `min(0.5, √‖g‖)·‖g‖` of the inexact inner solves.
fn forcing_tolerance(g_norm: f64) -> f64 {
    0.5_f64.min(g_norm.sqrt()) * g_norm
}

/// Approximately solve `H p = -g` by conjugate gradients, stopping at
/// `‖r‖ ≤ tol` or at the first direction of non-positive curvature.
///
/// Started from zero, the iterates stay in the Krylov space of `g`, so
/// on a singular positive semi-definite `H` with `g` in its range this
/// converges to the minimum-norm solution.
fn truncated_cg(hess: &Array2<f64>, grad: &[f64], tol: f64) -> Vec<f64> {
    let n = grad.len();
    let g = ArrayView1::from(grad);

    let mut x = Array1::<f64>::zeros(n);
    let mut r = g.mapv(|v| -v);
    let mut d = r.clone();
    let mut rr = r.dot(&r);

    for k in 0..20 * n {
        if rr.sqrt() <= tol {
            break;
        }
        let hd = hess.dot(&d);
        let curvature = d.dot(&hd);
        if curvature <= 0.0 {
            if k == 0 {
                return g.iter().map(|v| -v).collect();
            }
            break;
        }
        let alpha = rr / curvature;
        x.scaled_add(alpha, &d);
        r.scaled_add(-alpha, &hd);
        let rr_new = r.dot(&r);
        d = &r + &(d * (rr_new / rr));
        rr = rr_new;
    }
    x.to_vec()
}

fn newton_cg(evaluator: &Evaluator, init: &[f64], opts: &SolverOptions) -> Result<FitResult, StencilError> {
    let tol = opts.gradient_tolerance;
    let mut x = init.to_vec();
    let (mut f, mut g) = evaluator.value_and_gradient(&x)?;
    let mut evaluations = 1;
    let mut iterations = 0;
    let mut message = String::from("maximum number of iterations reached");

    while iterations < opts.max_iterations {
        if norm(&g) <= tol {
            message = "gradient norm below tolerance".into();
            break;
        }
        let hess = evaluator.hessian(&x)?;
        let p = truncated_cg(&hess, &g, forcing_tolerance(norm(&g)));
        let slope = dot(&g, &p);

        let mut step = 1.0;
        let accepted = loop {
            let trial: Vec<f64> = x.iter().zip(&p).map(|(xi, pi)| xi + step * pi).collect();
            let f_trial = evaluator.loss(&trial)?;
            evaluations += 1;
            if f_trial <= f + ARMIJO_C1 * step * slope {
                break Some(trial);
            }
            step *= 0.5;
            if step < MIN_STEP {
                break None;
            }
        };
        iterations += 1;

        match accepted {
            Some(trial) => {
                x = trial;
                (f, g) = evaluator.value_and_gradient(&x)?;
                evaluations += 1;
                log::debug!("newton-cg iter {iterations}: loss={f:.6e}, |g|={:.3e}, step={step:.3e}", norm(&g));
            }
            None => {
                message = "line search could not decrease the loss".into();
                break;
            }
        }
    }

    finish(evaluator, x, iterations, evaluations, |gn| gn <= tol, message)
}

/// Steihaug-Toint CG on the model `m(p) = gᵀp + ½pᵀHp` inside
/// `‖p‖ ≤ radius`.  Returns the step and whether it ended on the boundary.
fn steihaug(hess: &Array2<f64>, grad: &[f64], radius: f64, tol: f64) -> (Array1<f64>, bool) {
    let n = grad.len();
    let mut p = Array1::<f64>::zeros(n);
    let mut r = ArrayView1::from(grad).to_owned();
    let mut d = r.mapv(|v| -v);
    let mut rr = r.dot(&r);

    for _ in 0..2 * n {
        if rr.sqrt() <= tol {
            break;
        }
        let hd = hess.dot(&d);
        let curvature = d.dot(&hd);
        if curvature <= 0.0 {
            return (to_boundary(&p, &d, radius), true);
        }
        let alpha = rr / curvature;
        let next = &p + &(&d * alpha);
        if next.dot(&next).sqrt() >= radius {
            return (to_boundary(&p, &d, radius), true);
        }
        p = next;
        r.scaled_add(alpha, &hd);
        let rr_new = r.dot(&r);
        d = &d * (rr_new / rr) - &r;
        rr = rr_new;
    }
    (p, false)
}

/// `p + τd` with `τ ≥ 0` and `‖p + τd‖ = radius`, for `‖p‖ ≤ radius`.
fn to_boundary(p: &Array1<f64>, d: &Array1<f64>, radius: f64) -> Array1<f64> {
    let dd = d.dot(d);
    let pd = p.dot(d);
    let pp = p.dot(p);
    let tau = (-pd + (pd * pd + dd * (radius * radius - pp).max(0.0)).sqrt()) / dd;
    p + &(d * tau)
}

fn trust_region(evaluator: &Evaluator, init: &[f64], opts: &SolverOptions) -> Result<FitResult, StencilError> {
    let tol = opts.gradient_tolerance;
    let mut radius = opts.trust_radius;
    let mut x = init.to_vec();
    let (mut f, mut g) = evaluator.value_and_gradient(&x)?;
    let mut evaluations = 1;
    let mut iterations = 0;
    let mut message = String::from("maximum number of iterations reached");

    while iterations < opts.max_iterations {
        let g_norm = norm(&g);
        if g_norm <= tol {
            message = "gradient norm below tolerance".into();
            break;
        }
        let hess = evaluator.hessian(&x)?;
        let (step, on_boundary) = steihaug(&hess, &g, radius, forcing_tolerance(g_norm));
        let predicted = -(ArrayView1::from(&g[..]).dot(&step) + 0.5 * step.dot(&hess.dot(&step)));
        if !(predicted > 0.0) {
            message = "trust-region model predicts no decrease".into();
            break;
        }

        let trial: Vec<f64> = x.iter().zip(step.iter()).map(|(xi, si)| xi + si).collect();
        let f_trial = evaluator.loss(&trial)?;
        evaluations += 1;
        iterations += 1;

        let rho = (f - f_trial) / predicted;
        if rho < 0.25 {
            radius *= 0.25;
        } else if rho > 0.75 && on_boundary {
            radius = (2.0 * radius).min(opts.max_trust_radius);
        }
        if rho > TRUST_ETA {
            x = trial;
            (f, g) = evaluator.value_and_gradient(&x)?;
            evaluations += 1;
        }
        log::debug!(
            "trust region iter {iterations}: loss={f:.6e}, |g|={:.3e}, rho={rho:.3}, radius={radius:.3e}",
            norm(&g)
        );
        if radius <= f64::EPSILON * (1.0 + norm(&x)) {
            message = "trust radius collapsed".into();
            break;
        }
    }

    finish(evaluator, x, iterations, evaluations, |gn| gn <= tol, message)
}

/// Solve `H s = -g` with a sparse LDLᵀ factorisation, requiring H to be
/// positive definite.  Pivots that are non-positive or negligible next
/// to the largest one report the matrix as singular.
fn newton_step(hess: &Array2<f64>, grad: &[f64]) -> Result<Vec<f64>, StencilError> {
    let n = grad.len();
    let mut tri = TriMat::new((n, n));
    for ((r, c), &v) in hess.indexed_iter() {
        if v != 0.0 || r == c {
            tri.add_triplet(r, c, v);
        }
    }
    let a = tri.to_csc();

    let ldl = Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(a.view())?;
    let d_max = ldl.d().iter().fold(0.0_f64, |m, &di| m.max(di));
    for (i, &di) in ldl.d().iter().enumerate() {
        if di <= PIVOT_TOLERANCE * d_max {
            return Err(sprs::errors::LinalgError::SingularMatrix(sprs::errors::SingularMatrixInfo {
                index: i,
                reason: "pivot of Hessian factorization not positive (not SPD)",
            })
            .into());
        }
    }

    let rhs: Vec<f64> = grad.iter().map(|v| -v).collect();
    let step = ldl.solve(&rhs[..]);
    if step.iter().any(|v| !v.is_finite()) {
        return Err(StencilError::NumericalInstability("Newton step is not finite".into()));
    }
    Ok(step)
}

fn direct_newton(evaluator: &Evaluator, init: &[f64], opts: &SolverOptions) -> Result<FitResult, StencilError> {
    let tol = opts.gradient_tolerance;
    let mut x = init.to_vec();
    let (_, mut g) = evaluator.value_and_gradient(&x)?;
    let mut evaluations = 1;
    let mut iterations = 0;
    let mut message = String::from("maximum number of iterations reached");

    while iterations < opts.max_iterations {
        if norm(&g) <= tol {
            message = "gradient norm below tolerance".into();
            break;
        }
        let hess = evaluator.hessian(&x)?;
        let step = match newton_step(&hess, &g) {
            Ok(step) => step,
            // Rank-deficient data (too few interior cells, a dead response
            // channel): solve the consistent singular system by CG instead.
            Err(StencilError::Linalg(e)) => {
                log::warn!("direct newton iter {}: {e}; using conjugate gradients", iterations + 1);
                truncated_cg(&hess, &g, FALLBACK_CG_TOLERANCE * norm(&g))
            }
            Err(e) => return Err(e),
        };
        for (xi, si) in x.iter_mut().zip(&step) {
            *xi += si;
        }
        iterations += 1;
        let (f, g_new) = evaluator.value_and_gradient(&x)?;
        g = g_new;
        evaluations += 1;
        log::debug!("direct newton iter {iterations}: loss={f:.6e}, |g|={:.3e}", norm(&g));
    }

    finish(evaluator, x, iterations, evaluations, |gn| gn <= tol, message)
}
