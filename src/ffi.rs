//! C-compatible FFI.
//!
//! All functions are `#[no_mangle] extern "C"` so they can be called from
//! C or from C# via `[DllImport("stencilfit")]`.
//!
//! Memory convention:
//!   - Caller allocates flat arrays and passes pointers + lengths.
//!   - Fields are `N × N × 3` row-major, channel fastest: index
//!     `(row * N + col) * 3 + channel`.
//!   - Parameter vectors are 36 doubles (wxx, wyy, wxy, wyx, row-major).
//!   - Opaque handles are created by Rust and freed by Rust via
//!     `stencilfit_free`.
//!   - Fallible calls return 0 on success and 1 on error; the message of
//!     the last error on the calling thread is available through
//!     `stencilfit_last_error`.

use crate::forward::predict;
use crate::optimizer;
use crate::types::*;
use ndarray::Array3;
use std::cell::RefCell;
use std::ffi::{c_char, CString};
use std::ptr;
use std::slice;

/// Solver handle that owns the calibration problem.
pub struct StencilHandle {
    pub problem: CalibrationProblem,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(e: &StencilError) {
    let msg = CString::new(e.to_string().replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

/// Record `result`'s error (if any) and map it to a return code.
fn status(result: Result<(), StencilError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e);
            1
        }
    }
}

unsafe fn handle_ref<'a>(handle: *mut StencilHandle) -> Result<&'a mut StencilHandle, StencilError> {
    handle
        .as_mut()
        .ok_or_else(|| StencilError::Shape("null handle".into()))
}

unsafe fn read_field(ptr_in: *const f64, n: usize, what: &str) -> Result<Field, StencilError> {
    if ptr_in.is_null() {
        return Err(StencilError::Shape(format!("{what} pointer is null")));
    }
    let len = n
        .checked_mul(n)
        .and_then(|v| v.checked_mul(NUM_CHANNELS))
        .filter(|&len| len <= isize::MAX as usize / std::mem::size_of::<f64>())
        .ok_or_else(|| StencilError::Shape(format!("{what}: grid size {n} overflows the buffer length")))?;
    let values = slice::from_raw_parts(ptr_in, len).to_vec();
    let data = Array3::from_shape_vec((n, n, NUM_CHANNELS), values)
        .map_err(|e| StencilError::Shape(format!("{what}: {e}")))?;
    Field::new(data)
}

// ─────────────────────────────────────────────────────────────
//  Problem construction
// ─────────────────────────────────────────────────────────────

/// Create a new problem from raw arrays.  Returns null on error.
///
/// # Safety
/// `load` and `response` must each point to `n * n * 3` doubles.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_create(
    n: usize,
    youngs_modulus: f64,
    poisson_ratio: f64,
    conductivity: f64,
    thermal_expansion: f64,
    load: *const f64,     // n × n × 3
    response: *const f64, // n × n × 3
) -> *mut StencilHandle {
    let build = || -> Result<CalibrationProblem, StencilError> {
        let material = MaterialParams::new(youngs_modulus, poisson_ratio, conductivity, thermal_expansion);
        let load = read_field(load, n, "load")?;
        let response = read_field(response, n, "response")?;
        CalibrationProblem::new(material, response, load)
    };
    match build() {
        Ok(problem) => Box::into_raw(Box::new(StencilHandle { problem })),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Free a handle.
///
/// # Safety
/// `handle` must be a pointer returned by `stencilfit_create`.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_free(handle: *mut StencilHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Grid resolution N of the problem, 0 for a null handle.
///
/// # Safety
/// `handle` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_grid_size(handle: *const StencilHandle) -> usize {
    handle.as_ref().map_or(0, |h| h.problem.grid_size())
}

/// Message of the last error on this thread, or null.  The pointer stays
/// valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn stencilfit_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

/// Configure solver options.  `newton_method`: 0 = Newton-CG,
/// 1 = trust region, 2 = direct LDLᵀ.
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_set_solver_options(
    handle: *mut StencilHandle,
    max_iterations: usize,
    max_evaluations: usize,
    gradient_tolerance: f64,
    newton_method: i32,
) -> i32 {
    status((|| {
        let h = handle_ref(handle)?;
        let method = match newton_method {
            0 => NewtonMethod::NewtonCg,
            1 => NewtonMethod::TrustRegion,
            2 => NewtonMethod::Direct,
            other => {
                return Err(StencilError::Shape(format!("unknown newton method code {other}")));
            }
        };
        h.problem.options = SolverOptions {
            max_iterations,
            max_evaluations,
            gradient_tolerance,
            newton_method: method,
            ..h.problem.options.clone()
        };
        Ok(())
    })())
}

/// Set the optional regulariser weights (0 disables a term).
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_set_penalties(handle: *mut StencilHandle, singularity: f64, symmetry: f64) -> i32 {
    status((|| {
        let h = handle_ref(handle)?;
        h.problem.options.penalties = PenaltyWeights { singularity, symmetry };
        Ok(())
    })())
}

// ─────────────────────────────────────────────────────────────
//  Run optimisation
// ─────────────────────────────────────────────────────────────

unsafe fn write_result(
    result: &FitResult,
    out_params: *mut f64,
    out_loss: *mut f64,
    out_iterations: *mut usize,
    out_converged: *mut bool,
) -> Result<(), StencilError> {
    if out_params.is_null() || out_loss.is_null() || out_iterations.is_null() || out_converged.is_null() {
        return Err(StencilError::Shape("output pointer is null".into()));
    }
    slice::from_raw_parts_mut(out_params, NUM_PARAMS).copy_from_slice(&result.params);
    *out_loss = result.loss;
    *out_iterations = result.iterations;
    *out_converged = result.converged;
    Ok(())
}

/// Run L-BFGS from zero.  Results are written into caller-provided buffers.
///
/// # Safety
/// `out_params` must hold 36 doubles; the other outputs one value each.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_run_bfgs(
    handle: *mut StencilHandle,
    out_params: *mut f64,
    out_loss: *mut f64,
    out_iterations: *mut usize,
    out_converged: *mut bool,
) -> i32 {
    status((|| {
        let h = handle_ref(handle)?;
        let result = optimizer::run_bfgs(&h.problem)?;
        write_result(&result, out_params, out_loss, out_iterations, out_converged)
    })())
}

/// Run the configured second-order method from zero.
///
/// # Safety
/// `out_params` must hold 36 doubles; the other outputs one value each.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_run_newton(
    handle: *mut StencilHandle,
    out_params: *mut f64,
    out_loss: *mut f64,
    out_iterations: *mut usize,
    out_converged: *mut bool,
) -> i32 {
    status((|| {
        let h = handle_ref(handle)?;
        let result = optimizer::run_newton(&h.problem)?;
        write_result(&result, out_params, out_loss, out_iterations, out_converged)
    })())
}

// ─────────────────────────────────────────────────────────────
//  Forward pass only  (no optimisation)
// ─────────────────────────────────────────────────────────────

/// Predicted load for a given parameter vector.
///
/// # Safety
/// `params` must hold 36 doubles and `out_load` `N * N * 3` doubles.
#[no_mangle]
pub unsafe extern "C" fn stencilfit_predict(
    handle: *mut StencilHandle,
    params: *const f64,
    out_load: *mut f64,
) -> i32 {
    status((|| {
        let h = handle_ref(handle)?;
        if params.is_null() || out_load.is_null() {
            return Err(StencilError::Shape("params or output pointer is null".into()));
        }
        let theta = slice::from_raw_parts(params, NUM_PARAMS);
        let predicted = predict(&h.problem, theta)?;
        let n = h.problem.grid_size();
        let out = slice::from_raw_parts_mut(out_load, n * n * NUM_CHANNELS);
        for (dst, &src) in out.iter_mut().zip(predicted.data().iter()) {
            *dst = src;
        }
        Ok(())
    })())
}
