//! Integration tests: kernels, forward pass, loss, and full calibration
//! runs on synthetic problems with a known answer.

use ndarray::{arr2, s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stencilfit::forward::{apply_stencil, convolve_valid, pad_boundary, predict};
use stencilfit::gradients::Evaluator;
use stencilfit::objectives::{interior_mse, singularity_penalty, symmetry_penalty};
use stencilfit::optimizer;
use stencilfit::stencil::*;
use stencilfit::types::*;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn random_field(n: usize, rng: &mut StdRng) -> Field {
    Field::new(Array3::from_shape_fn((n, n, NUM_CHANNELS), |_| rng.gen_range(-1.0..1.0))).unwrap()
}

/// Load generated exactly by the reference kernels, so the optimum is
/// known and has zero loss.
fn make_synthetic_problem(n: usize, seed: u64) -> (CalibrationProblem, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let material = MaterialParams::steel();
    let response = random_field(n, &mut rng);
    let scaffold = CalibrationProblem::new(material, response.clone(), Field::zeros(n).unwrap()).unwrap();
    let truth = flatten_kernels(&reference_elastic_kernels(&material).unwrap());
    let load = predict(&scaffold, &truth).unwrap();
    (CalibrationProblem::new(material, response, load).unwrap(), truth)
}

fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
}

fn assert_close(a: &[f64], b: &[f64], tol: f64, what: &str) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "{what}[{i}]: {x:.9e} vs {y:.9e} (tol {tol:.3e})");
    }
}

// ─────────────────────────────────────────────────────────────
//  Test: known kernels
// ─────────────────────────────────────────────────────────────

#[test]
fn thermal_kernel_matches_closed_form() {
    let k = thermal_kernel(16.0);
    let c = -16.0 / 3.0;
    assert_eq!(k, arr2(&[[c, c, c], [c, -8.0 * c, c], [c, c, c]]));
    assert!(k.sum().abs() < 1e-12);
}

#[test]
fn coupling_and_reference_kernels_scale_linearly_with_youngs_modulus() {
    let base = MaterialParams::steel();
    let doubled = MaterialParams { youngs_modulus: 2.0 * base.youngs_modulus, ..base };

    assert_eq!(coupling_coefficient(&doubled), 2.0 * coupling_coefficient(&base));
    let (wxt1, wyt1) = coupling_kernels(&base);
    let (wxt2, wyt2) = coupling_kernels(&doubled);
    assert_eq!(wxt2, &wxt1 * 2.0);
    assert_eq!(wyt2, &wyt1 * 2.0);

    let r1 = reference_elastic_kernels(&base).unwrap();
    let r2 = reference_elastic_kernels(&doubled).unwrap();
    for (k1, k2) in r1.as_array().iter().zip(r2.as_array()) {
        assert_eq!(*k2, *k1 * 2.0);
    }

    // The thermal kernel does not depend on E.
    let known1 = known_kernels(&base).unwrap();
    let known2 = known_kernels(&doubled).unwrap();
    assert_eq!(known1.wtt, known2.wtt);
}

#[test]
fn steel_coupling_coefficient() {
    let expected = 212e3 * 12e-6 / (6.0 * (0.288 - 1.0)) / 400.0 * 1e6;
    assert!((coupling_coefficient(&MaterialParams::steel()) - expected).abs() < 1e-9);
    assert!(expected < 0.0);
}

#[test]
fn reference_kernels_are_symmetric_and_singular() {
    let material = MaterialParams::steel();
    let reference = reference_elastic_kernels(&material).unwrap();
    assert_eq!(reference.wyy, reference.wxx.t());
    assert_eq!(reference.wxy, reference.wyx);

    let theta = flatten_kernels(&reference);
    let c = material.youngs_modulus / 16.0 / (1.0 - 0.288 * 0.288);
    assert!(singularity_penalty(&theta) < 1e-9 * c);
    assert!(symmetry_penalty(&theta) < 1e-12 * c * c);
}

#[test]
fn degenerate_poisson_ratio_is_rejected() {
    let bad = MaterialParams { poisson_ratio: 1.0, ..MaterialParams::steel() };
    assert!(matches!(known_kernels(&bad), Err(StencilError::NumericalInstability(_))));
    assert!(matches!(reference_elastic_kernels(&bad), Err(StencilError::NumericalInstability(_))));

    let also_bad = MaterialParams { poisson_ratio: -1.0, ..MaterialParams::steel() };
    assert!(reference_elastic_kernels(&also_bad).is_err());

    let nan = MaterialParams { conductivity: f64::NAN, ..MaterialParams::steel() };
    assert!(matches!(known_kernels(&nan), Err(StencilError::NumericalInstability(_))));

    let n = 5;
    let err = CalibrationProblem::new(bad, Field::zeros(n).unwrap(), Field::zeros(n).unwrap());
    assert!(matches!(err, Err(StencilError::NumericalInstability(_))));
}

// ─────────────────────────────────────────────────────────────
//  Test: parameter embedding and assembly
// ─────────────────────────────────────────────────────────────

#[test]
fn parameter_order_is_wxx_wyy_wxy_wyx_row_major() {
    let theta: Vec<f64> = (0..NUM_PARAMS).map(|i| i as f64).collect();
    let k = split_parameters(&theta).unwrap();
    assert_eq!(k.wxx[[0, 0]], 0.0);
    assert_eq!(k.wxx[[0, 2]], 2.0);
    assert_eq!(k.wxx[[2, 2]], 8.0);
    assert_eq!(k.wyy[[0, 0]], 9.0);
    assert_eq!(k.wxy[[1, 1]], 22.0);
    assert_eq!(k.wyx[[2, 2]], 35.0);
    assert_eq!(param_index(2, 1, 1), 22);

    assert_eq!(flatten_kernels(&k), theta);
}

#[test]
fn split_rejects_wrong_length() {
    assert!(matches!(split_parameters(&[0.0; 35]), Err(StencilError::Shape(_))));
    assert!(matches!(split_parameters(&[0.0; 37]), Err(StencilError::Shape(_))));
    assert!(summarize(&[]).is_err());
}

#[test]
fn split_rejects_non_finite_parameters() {
    let mut theta = vec![1.0; NUM_PARAMS];
    theta[13] = f64::NAN;
    assert!(matches!(split_parameters(&theta), Err(StencilError::NumericalInstability(_))));
    theta[13] = f64::INFINITY;
    assert!(matches!(split_parameters(&theta), Err(StencilError::NumericalInstability(_))));

    let (problem, _) = make_synthetic_problem(5, 3);
    assert!(matches!(predict(&problem, &theta), Err(StencilError::NumericalInstability(_))));
    assert!(Evaluator::new(&problem).unwrap().loss(&theta).is_err());
}

#[test]
fn assembled_stencil_places_every_block() {
    let material = MaterialParams::steel();
    let known = known_kernels(&material).unwrap();
    let theta: Vec<f64> = (0..NUM_PARAMS).map(|i| i as f64 + 1.0).collect();
    let unknown = split_parameters(&theta).unwrap();
    let stencil = assemble_stencil(&known, &unknown);

    assert_eq!(stencil.weights().dim(), (3, 3, 3, 3));
    assert_eq!(stencil.block(CHANNEL_X, CHANNEL_X), unknown.wxx);
    assert_eq!(stencil.block(CHANNEL_Y, CHANNEL_Y), unknown.wyy);
    // wxy reads y-displacement and writes x-force.
    assert_eq!(stencil.block(CHANNEL_Y, CHANNEL_X), unknown.wxy);
    assert_eq!(stencil.block(CHANNEL_X, CHANNEL_Y), unknown.wyx);
    assert_eq!(stencil.block(CHANNEL_T, CHANNEL_X), known.wxt);
    assert_eq!(stencil.block(CHANNEL_T, CHANNEL_Y), known.wyt);
    assert_eq!(stencil.block(CHANNEL_T, CHANNEL_T), known.wtt);
    assert!(stencil.block(CHANNEL_X, CHANNEL_T).iter().all(|&v| v == 0.0));
    assert!(stencil.block(CHANNEL_Y, CHANNEL_T).iter().all(|&v| v == 0.0));

    let physics = known_stencil(&known);
    assert!(physics.block(CHANNEL_X, CHANNEL_X).iter().all(|&v| v == 0.0));
    assert_eq!(physics.block(CHANNEL_T, CHANNEL_T), known.wtt);
}

#[test]
fn stencil_rejects_wrong_shape() {
    assert!(matches!(Stencil::new(Array4::zeros((3, 3, 3, 2))), Err(StencilError::Shape(_))));
    assert!(Stencil::new(Array4::zeros((3, 3, 3, 3))).is_ok());
}

#[test]
fn summary_reports_sums() {
    let theta: Vec<f64> = (0..NUM_PARAMS).map(|i| i as f64).collect();
    let summary = summarize(&theta).unwrap();
    assert_eq!(summary.len(), NUM_UNKNOWN_KERNELS);
    assert_eq!(summary[0].name, "wxx");
    assert_eq!(summary[0].row_sums, [3.0, 12.0, 21.0]);
    assert_eq!(summary[0].col_sums, [9.0, 12.0, 15.0]);
    assert_eq!(summary[0].total, 36.0);
    assert_eq!(summary[3].name, "wyx");
    assert_eq!(summary[3].total, (27..36).sum::<usize>() as f64);
}

// ─────────────────────────────────────────────────────────────
//  Test: boundary padding and convolution
// ─────────────────────────────────────────────────────────────

#[test]
fn padding_reflects_second_cell_in() {
    let x = Array3::from_shape_fn((5, 5, 1), |(r, c, _)| (10 * r + c) as f64);
    let p = pad_boundary(x.view()).unwrap();
    assert_eq!(p.dim(), (7, 7, 1));

    // Interior is untouched.
    assert_eq!(p.slice(s![1..6, 1..6, ..]), x);
    // Corners hold the diagonal neighbour of the corner cell.
    assert_eq!(p[[0, 0, 0]], 11.0);
    assert_eq!(p[[0, 6, 0]], 13.0);
    assert_eq!(p[[6, 0, 0]], 31.0);
    assert_eq!(p[[6, 6, 0]], 33.0);
    // Edges.
    let top: Vec<f64> = p.slice(s![0, 1..6, 0]).to_vec();
    assert_eq!(top, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
    let bottom: Vec<f64> = p.slice(s![6, 1..6, 0]).to_vec();
    assert_eq!(bottom, vec![30.0, 31.0, 32.0, 33.0, 34.0]);
    let left: Vec<f64> = p.slice(s![1..6, 0, 0]).to_vec();
    assert_eq!(left, vec![1.0, 11.0, 21.0, 31.0, 41.0]);
    let right: Vec<f64> = p.slice(s![1..6, 6, 0]).to_vec();
    assert_eq!(right, vec![3.0, 13.0, 23.0, 33.0, 43.0]);
}

#[test]
fn padding_rejects_tiny_grids() {
    assert!(matches!(pad_boundary(Array3::<f64>::zeros((1, 4, 3)).view()), Err(StencilError::Shape(_))));
    assert!(pad_boundary(Array3::<f64>::zeros((2, 2, 3)).view()).is_ok());
}

#[test]
fn convolution_is_a_cross_correlation() {
    // A single 1 at the top-left of the kernel reads the top-left neighbour.
    let mut w = Array4::zeros((3, 3, 3, 3));
    w[[0, 0, CHANNEL_X, CHANNEL_Y]] = 1.0;
    let stencil = Stencil::new(w).unwrap();
    let input = Array3::from_shape_fn((5, 5, 3), |(r, c, k)| (100 * k + 10 * r + c) as f64);
    let out = convolve_valid(input.view(), &stencil).unwrap();
    assert_eq!(out.dim(), (3, 3, 3));
    for i in 0..3 {
        for j in 0..3 {
            assert_eq!(out[[i, j, CHANNEL_Y]], input[[i, j, CHANNEL_X]]);
            assert_eq!(out[[i, j, CHANNEL_X]], 0.0);
        }
    }

    assert!(convolve_valid(Array3::<f64>::zeros((2, 5, 3)).view(), &stencil).is_err());
    assert!(convolve_valid(Array3::<f64>::zeros((5, 5, 2)).view(), &stencil).is_err());
}

#[test]
fn convolution_propagates_infinite_weights_over_zero_input() {
    // 0 · inf is NaN and must reach the output rather than being skipped.
    let mut w = Array4::zeros((3, 3, 3, 3));
    w[[1, 1, CHANNEL_X, CHANNEL_X]] = f64::INFINITY;
    let stencil = Stencil::new(w).unwrap();
    let out = convolve_valid(Array3::<f64>::zeros((4, 4, 3)).view(), &stencil).unwrap();
    assert!(out.slice(s![.., .., CHANNEL_X]).iter().all(|v| v.is_nan()));
    assert!(out.slice(s![.., .., CHANNEL_Y]).iter().all(|&v| v == 0.0));
    assert!(convolve_valid(Array3::<f64>::zeros((5, 5, 2)).view(), &stencil).is_err());
}

#[test]
fn forward_pass_is_linear_in_the_stencil() {
    let mut rng = StdRng::seed_from_u64(42);
    let field = random_field(9, &mut rng);
    let rand_stencil = |rng: &mut StdRng| {
        Stencil::new(Array4::from_shape_fn((3, 3, 3, 3), |_| rng.gen_range(-1.0..1.0))).unwrap()
    };
    let s1 = rand_stencil(&mut rng);
    let s2 = rand_stencil(&mut rng);

    let lhs = apply_stencil(&field, &(&s1 + &s2)).unwrap();
    let rhs = apply_stencil(&field, &s1).unwrap().into_inner() + apply_stencil(&field, &s2).unwrap().data();
    assert_eq!(lhs.data().dim(), (9, 9, 3));
    for (a, b) in lhs.data().iter().zip(rhs.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn zero_response_predicts_zero_load() {
    let n = 37;
    let problem =
        CalibrationProblem::new(MaterialParams::steel(), Field::zeros(n).unwrap(), Field::zeros(n).unwrap()).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let theta: Vec<f64> = (0..NUM_PARAMS).map(|_| rng.gen_range(-1e5..1e5)).collect();

    let predicted = predict(&problem, &theta).unwrap();
    assert_eq!(predicted.size(), n);
    assert!(predicted.data().iter().all(|&v| v == 0.0));
}

// ─────────────────────────────────────────────────────────────
//  Test: fields and problem construction
// ─────────────────────────────────────────────────────────────

#[test]
fn field_shape_is_validated() {
    assert!(matches!(Field::new(Array3::zeros((4, 5, 3))), Err(StencilError::Shape(_))));
    assert!(matches!(Field::new(Array3::zeros((4, 4, 2))), Err(StencilError::Shape(_))));
    assert!(matches!(Field::new(Array3::zeros((2, 2, 3))), Err(StencilError::Shape(_))));
    assert_eq!(Field::new(Array3::zeros((3, 3, 3))).unwrap().size(), 3);

    let mismatched = CalibrationProblem::new(
        MaterialParams::steel(),
        Field::zeros(6).unwrap(),
        Field::zeros(7).unwrap(),
    );
    assert!(matches!(mismatched, Err(StencilError::Shape(_))));
}

#[test]
fn measurements_are_harmonised() {
    let ones = Array2::from_elem((4, 4), 1.0);
    let twos = Array2::from_elem((4, 4), 2.0);

    let load = Field::load_from_measurements(&ones, &twos, &ones).unwrap();
    assert!(load.channel(CHANNEL_X).iter().all(|&v| v == -1.0));
    assert!(load.channel(CHANNEL_Y).iter().all(|&v| v == -2.0));
    assert!(load.channel(CHANNEL_T).iter().all(|&v| v == 1.0));

    let micro = Array2::from_elem((4, 4), 3e-6);
    let response = Field::response_from_measurements(&micro, &micro, &twos).unwrap();
    assert!(response.channel(CHANNEL_X).iter().all(|&v| (v - 3.0).abs() < 1e-12));
    assert!(response.channel(CHANNEL_T).iter().all(|&v| v == 2.0));

    let wrong = Array2::zeros((4, 5));
    assert!(Field::from_channels(&ones, &wrong, &ones).is_err());
}

// ─────────────────────────────────────────────────────────────
//  Test: loss
// ─────────────────────────────────────────────────────────────

#[test]
fn boundary_mismatch_does_not_affect_loss() {
    let (problem, truth) = make_synthetic_problem(8, 3);
    let mut load = problem.load.clone().into_inner();
    let n = problem.grid_size();
    load.slice_mut(s![0, .., ..]).fill(1e9);
    load.slice_mut(s![n - 1, .., ..]).fill(-1e9);
    load.slice_mut(s![.., 0, ..]).fill(7.0);
    load.slice_mut(s![.., n - 1, ..]).fill(-7.0);
    let corrupted =
        CalibrationProblem::new(problem.material, problem.response.clone(), Field::new(load).unwrap()).unwrap();

    let evaluator = Evaluator::new(&corrupted).unwrap();
    assert_eq!(evaluator.loss(&truth).unwrap(), 0.0);
    assert!(evaluator.gradient(&truth).unwrap().iter().all(|&g| g == 0.0));

    // The full-grid residual still shows the boundary mismatch.
    let residual = evaluator.residual(&truth).unwrap();
    assert!(residual.data()[[0, 3, 0]].abs() > 1.0);
    assert_eq!(residual.data()[[3, 3, 0]], 0.0);
}

#[test]
fn loss_is_interior_mean_squared_error() {
    let predicted = Array3::from_elem((4, 4, 3), 1.0);
    let mut measured = Array3::zeros((4, 4, 3));
    measured[[0, 0, 0]] = 100.0;
    // Interior is 2×2×3 = 12 cells, all off by one.
    assert_eq!(interior_mse(predicted.view(), measured.view()).unwrap(), 1.0);
    assert!(interior_mse(predicted.view(), Array3::zeros((5, 5, 3)).view()).is_err());

    let (problem, _) = make_synthetic_problem(6, 8);
    let evaluator = Evaluator::new(&problem).unwrap();
    assert_eq!(evaluator.num_residuals(), 4 * 4 * 3);
    assert_eq!(evaluator.jacobian().cols(), NUM_PARAMS);
}

#[test]
fn penalties_are_off_by_default() {
    let (problem, _) = make_synthetic_problem(7, 12);
    assert!(!problem.options.penalties.is_active());

    let mut rng = StdRng::seed_from_u64(1);
    let theta: Vec<f64> = (0..NUM_PARAMS).map(|_| rng.gen_range(-1e4..1e4)).collect();
    let evaluator = Evaluator::new(&problem).unwrap();
    let predicted = evaluator.predict(&theta).unwrap();
    let mse = interior_mse(predicted.data().view(), problem.load.data().view()).unwrap();
    assert_eq!(evaluator.loss(&theta).unwrap(), mse);

    let weights = PenaltyWeights { singularity: 2.0, symmetry: 0.5 };
    let penalised = problem.clone().with_options(SolverOptions { penalties: weights, ..SolverOptions::default() });
    let evaluator = Evaluator::new(&penalised).unwrap();
    let expected = mse + 2.0 * singularity_penalty(&theta) + 0.5 * symmetry_penalty(&theta);
    assert!((evaluator.loss(&theta).unwrap() - expected).abs() <= 1e-12 * expected);
}

#[test]
fn non_finite_fields_are_rejected() {
    let (problem, _) = make_synthetic_problem(5, 0);
    let mut response = problem.response.clone().into_inner();
    response[[2, 2, 1]] = f64::NAN;
    let bad = CalibrationProblem::new(problem.material, Field::new(response).unwrap(), problem.load.clone()).unwrap();
    assert!(matches!(Evaluator::new(&bad), Err(StencilError::NumericalInstability(_))));
    assert!(optimizer::run_newton(&bad).is_err());
}

#[test]
fn overflowing_hessian_is_reported() {
    // Finite inputs whose squares overflow.
    let n = 6;
    let huge = Field::new(Array3::from_elem((n, n, NUM_CHANNELS), 1e200)).unwrap();
    let problem = CalibrationProblem::new(MaterialParams::steel(), huge, Field::zeros(n).unwrap()).unwrap();
    let evaluator = Evaluator::new(&problem).unwrap();
    assert!(matches!(evaluator.hessian(&[0.0; NUM_PARAMS]), Err(StencilError::NumericalInstability(_))));

    for method in [NewtonMethod::NewtonCg, NewtonMethod::TrustRegion, NewtonMethod::Direct] {
        let problem = problem.clone().with_options(SolverOptions { newton_method: method, ..SolverOptions::default() });
        assert!(
            matches!(optimizer::run_newton(&problem), Err(StencilError::NumericalInstability(_))),
            "{method:?} accepted an overflowing problem"
        );
    }
}

// ─────────────────────────────────────────────────────────────
//  Test: optimisation drivers
// ─────────────────────────────────────────────────────────────

fn check_recovers_truth(method: NewtonMethod) {
    let (problem, truth) = make_synthetic_problem(10, 17);
    let problem = problem.with_options(SolverOptions { newton_method: method, ..SolverOptions::default() });
    let initial = Evaluator::new(&problem).unwrap().loss(&[0.0; NUM_PARAMS]).unwrap();

    let result = optimizer::run_newton(&problem).unwrap();
    eprintln!(
        "{method:?}: {} iterations, {} evaluations, loss={:.3e}, |g|={:.3e}",
        result.iterations, result.evaluations, result.loss, result.gradient_norm
    );

    assert!(result.converged, "{method:?} did not converge: {}", result.message);
    assert!(result.gradient_norm <= problem.options.gradient_tolerance);
    assert!(result.loss <= 1e-9 * initial, "loss {:.3e} vs initial {initial:.3e}", result.loss);
    assert!(result.iterations > 0);
    assert!(result.iterations < problem.options.max_iterations, "{method:?} used the whole iteration budget");
    assert_close(&result.params, &truth, 1e-4 * max_abs(&truth), "params");

    let kernels = result.kernels().unwrap();
    assert_eq!(kernels.wxx.dim(), (3, 3));
    assert!(result.into_converged().is_ok());
}

#[test]
fn newton_cg_recovers_reference_kernels() {
    check_recovers_truth(NewtonMethod::NewtonCg);
}

#[test]
fn trust_region_recovers_reference_kernels() {
    check_recovers_truth(NewtonMethod::TrustRegion);
}

#[test]
fn direct_newton_recovers_reference_kernels() {
    check_recovers_truth(NewtonMethod::Direct);
}

/// Synthetic problem whose y-displacement channel is identically zero, so
/// wyy and wxy are unidentifiable and the Hessian is singular.
fn make_dead_channel_problem(n: usize, seed: u64) -> (CalibrationProblem, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let material = MaterialParams::steel();
    let mut response = random_field(n, &mut rng).into_inner();
    response.slice_mut(s![.., .., CHANNEL_Y]).fill(0.0);
    let response = Field::new(response).unwrap();
    let scaffold = CalibrationProblem::new(material, response.clone(), Field::zeros(n).unwrap()).unwrap();
    let truth = flatten_kernels(&reference_elastic_kernels(&material).unwrap());
    let load = predict(&scaffold, &truth).unwrap();
    (CalibrationProblem::new(material, response, load).unwrap(), truth)
}

#[test]
fn singular_hessian_from_dead_channel_still_converges() {
    let (problem, truth) = make_dead_channel_problem(12, 8);
    let hess = Evaluator::new(&problem).unwrap().hessian(&[0.0; NUM_PARAMS]).unwrap();
    assert!(hess.row(param_index(1, 1, 1)).iter().all(|&v| v == 0.0));

    for method in [NewtonMethod::NewtonCg, NewtonMethod::TrustRegion, NewtonMethod::Direct] {
        let problem = problem.clone().with_options(SolverOptions { newton_method: method, ..SolverOptions::default() });
        let initial = Evaluator::new(&problem).unwrap().loss(&[0.0; NUM_PARAMS]).unwrap();
        let result = optimizer::run_newton(&problem).unwrap();

        assert!(result.converged, "{method:?} did not converge: {}", result.message);
        assert!(result.loss <= 1e-9 * initial, "{method:?}: loss {:.3e}", result.loss);
        // Unidentifiable blocks stay at the minimum-norm value.
        assert!(result.params[KERNEL_LEN..3 * KERNEL_LEN].iter().all(|&v| v == 0.0));
        // wxx and wyx only read the live x-channel and are recovered.
        let tol = 1e-4 * max_abs(&truth);
        for block in [0, 3] {
            let range = block * KERNEL_LEN..(block + 1) * KERNEL_LEN;
            assert_close(&result.params[range.clone()], &truth[range], tol, "live kernel");
        }
    }
}

#[test]
fn direct_newton_handles_too_few_interior_cells() {
    // 3 × 3 interior cells per output against 18 unknowns per output.
    let (problem, _) = make_synthetic_problem(5, 12);
    let problem = problem.with_options(SolverOptions { newton_method: NewtonMethod::Direct, ..SolverOptions::default() });
    let initial = Evaluator::new(&problem).unwrap().loss(&[0.0; NUM_PARAMS]).unwrap();
    let result = optimizer::run_newton(&problem).unwrap();
    assert!(result.converged, "{}", result.message);
    assert!(result.loss <= 1e-9 * initial);
    assert!(result.params.iter().all(|v| v.is_finite()));
}

#[test]
fn newton_warm_start_at_optimum_returns_immediately() {
    let (problem, truth) = make_synthetic_problem(8, 4);
    let result = optimizer::run_newton_from(&problem, &truth).unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.params, truth);
    assert!(result.loss < 1e-12);
}

#[test]
fn zero_response_converges_without_iterating() {
    let n = 37;
    let mut rng = StdRng::seed_from_u64(9);
    let load = random_field(n, &mut rng);
    let problem = CalibrationProblem::new(MaterialParams::steel(), Field::zeros(n).unwrap(), load).unwrap();

    let result = optimizer::run_newton(&problem).unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations, 0);
    assert!(result.params.iter().all(|&v| v == 0.0));

    let bfgs = optimizer::run_bfgs(&problem).unwrap();
    assert!(bfgs.converged);
    assert_eq!(bfgs.iterations, 0);
}

#[test]
fn bfgs_reduces_loss() {
    let (problem, truth) = make_synthetic_problem(10, 23);
    let initial = Evaluator::new(&problem).unwrap().loss(&[0.0; NUM_PARAMS]).unwrap();

    let result = optimizer::run_bfgs(&problem).unwrap();
    eprintln!(
        "L-BFGS: {} iterations, {} evaluations, loss={:.3e} (initial {initial:.3e}), {}",
        result.iterations, result.evaluations, result.loss, result.message
    );
    assert!(result.loss < 1e-3 * initial);
    assert!(result.evaluations <= problem.options.max_evaluations);
    assert_eq!(result.params.len(), truth.len());
    assert!(result.params.iter().all(|v| v.is_finite()));
}

#[test]
fn bfgs_respects_evaluation_budget() {
    let (problem, _) = make_synthetic_problem(10, 31);
    let problem = problem.with_options(SolverOptions { max_evaluations: 3, ..SolverOptions::default() });
    let initial = Evaluator::new(&problem).unwrap().loss(&[0.0; NUM_PARAMS]).unwrap();

    let result = optimizer::run_bfgs(&problem).unwrap();
    assert!(!result.converged);
    assert!(result.evaluations <= 3);
    assert!(result.message.contains("budget"), "message: {}", result.message);
    // The best point seen is returned; at worst that is the start.
    assert!(result.loss <= initial * (1.0 + 1e-12));

    match result.into_converged() {
        Err(StencilError::NonConvergence { message, .. }) => assert!(message.contains("budget")),
        other => panic!("expected NonConvergence, got {other:?}"),
    }
}

#[test]
fn newton_iteration_limit_reports_non_convergence() {
    let (problem, _) = make_synthetic_problem(10, 2);
    let options = SolverOptions {
        max_iterations: 1,
        newton_method: NewtonMethod::NewtonCg,
        ..SolverOptions::default()
    };
    let result = optimizer::run_newton(&problem.with_options(options)).unwrap();
    assert_eq!(result.iterations, 1);
    assert!(!result.converged);
    assert!(result.into_converged().is_err());
}

#[test]
fn drivers_reject_wrong_initial_length() {
    let (problem, _) = make_synthetic_problem(5, 6);
    assert!(matches!(optimizer::run_newton_from(&problem, &[0.0; 10]), Err(StencilError::Shape(_))));
    assert!(matches!(optimizer::run_bfgs_from(&problem, &[0.0; 40]), Err(StencilError::Shape(_))));
}

#[test]
fn penalised_fit_still_converges() {
    let (problem, _) = make_synthetic_problem(9, 44);
    let options = SolverOptions {
        newton_method: NewtonMethod::Direct,
        penalties: PenaltyWeights { singularity: 0.0, symmetry: 1.0 },
        ..SolverOptions::default()
    };
    let result = optimizer::run_newton(&problem.with_options(options)).unwrap();
    assert!(result.converged, "{}", result.message);
}

// ─────────────────────────────────────────────────────────────
//  Test: configuration
// ─────────────────────────────────────────────────────────────

#[test]
fn solver_options_deserialise_with_defaults() {
    let opts: SolverOptions =
        serde_json::from_str(r#"{ "max_iterations": 50, "newton_method": "trust_region" }"#).unwrap();
    assert_eq!(opts.max_iterations, 50);
    assert_eq!(opts.newton_method, NewtonMethod::TrustRegion);
    assert_eq!(opts.max_evaluations, 200);
    assert_eq!(opts.gradient_tolerance, 1e-3);
    assert!(!opts.penalties.is_active());

    let opts: SolverOptions = serde_json::from_str(r#"{ "penalties": { "symmetry": 0.1 } }"#).unwrap();
    assert_eq!(opts.penalties.symmetry, 0.1);
    assert_eq!(opts.penalties.singularity, 0.0);
    assert_eq!(opts.newton_method, NewtonMethod::NewtonCg);
}

#[test]
fn material_accepts_short_names() {
    let m: MaterialParams =
        serde_json::from_str(r#"{ "E": 212000.0, "mu": 0.288, "k": 16.0, "alpha": 1.2e-5 }"#).unwrap();
    assert_eq!(m, MaterialParams::steel());
}

#[test]
fn fit_result_serialises() {
    let (problem, _) = make_synthetic_problem(6, 10);
    let result = optimizer::run_newton(&problem.with_options(SolverOptions {
        newton_method: NewtonMethod::Direct,
        ..SolverOptions::default()
    }))
    .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["params"].as_array().unwrap().len(), NUM_PARAMS);
    assert_eq!(json["converged"], serde_json::Value::Bool(true));
}
