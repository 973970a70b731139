//! Stencil construction: closed-form physics kernels, the parameter
//! embedding of the four unknown elastic kernels, and assembly of the
//! full 3-in × 3-out stencil.
//!
//! Block layout (rows = output channel, columns = input channel):
//!
//! ```text
//!   x-force   [ wxx  wxy  wxt ]   ← x-displacement, y-displacement, temperature
//!   y-force   [ wyx  wyy  wyt ]
//!   heat flux [ wtx  wty  wtt ]
//! ```

use crate::types::{
    Kernel, KnownKernels, MaterialParams, Stencil, StencilError, UnknownKernels, CHANNEL_T,
    CHANNEL_X, CHANNEL_Y, KERNEL_LEN, KERNEL_SIZE, NUM_PARAMS, UNKNOWN_BLOCKS, UNKNOWN_NAMES,
};
use ndarray::{arr2, Array2};

// ─────────────────────────────────────────────────────────────
//  Known physics
// ─────────────────────────────────────────────────────────────

/// Thermal diffusion kernel `-(k/3)·[[1,1,1],[1,-8,1],[1,1,1]]`.
pub fn thermal_kernel(conductivity: f64) -> Kernel {
    arr2(&[[1.0, 1.0, 1.0], [1.0, -8.0, 1.0], [1.0, 1.0, 1.0]]) * (-conductivity / 3.0)
}

/// Scale of the temperature → force coupling kernels.
///
/// `E·α / (6(μ-1)) / 400 · 1e6`; the `1e6` matches the displacement
/// scaling of the response field.
pub fn coupling_coefficient(material: &MaterialParams) -> f64 {
    let e = material.youngs_modulus;
    let v = material.poisson_ratio;
    e * material.thermal_expansion / (6.0 * (v - 1.0)) / 400.0 * 1e6
}

/// `(wxt, wyt)`.
pub fn coupling_kernels(material: &MaterialParams) -> (Kernel, Kernel) {
    let coef = coupling_coefficient(material);
    let wxt = arr2(&[[1.0, 0.0, -1.0], [4.0, 0.0, -4.0], [1.0, 0.0, -1.0]]) * coef;
    let wyt = arr2(&[[-1.0, -4.0, -1.0], [0.0, 0.0, 0.0], [1.0, 4.0, 1.0]]) * coef;
    (wxt, wyt)
}

/// Kernels fixed by known physics.  Fails on non-finite results.
pub fn known_kernels(material: &MaterialParams) -> Result<KnownKernels, StencilError> {
    material.validate()?;
    let (wxt, wyt) = coupling_kernels(material);
    let known = KnownKernels {
        wtt: thermal_kernel(material.conductivity),
        wxt,
        wyt,
        wtx: Array2::zeros((KERNEL_SIZE, KERNEL_SIZE)),
        wty: Array2::zeros((KERNEL_SIZE, KERNEL_SIZE)),
    };
    for (name, k) in [("wtt", &known.wtt), ("wxt", &known.wxt), ("wyt", &known.wyt)] {
        ensure_finite(name, k)?;
    }
    Ok(known)
}

/// Plane-stress bilinear-element stiffness kernels.
///
/// Not part of the forward pass (the elastic kernels there are the
/// trainable ones); used as a reference baseline and for seeding.
pub fn reference_elastic_kernels(material: &MaterialParams) -> Result<UnknownKernels, StencilError> {
    material.validate()?;
    let mu = material.poisson_ratio;
    let c = material.youngs_modulus / 16.0 / (1.0 - mu * mu);

    let a = -4.0 * (1.0 - mu / 3.0);
    let b = 16.0 * mu / 3.0;
    let s = -8.0 * (1.0 + mu / 3.0);
    let d = 32.0 * (1.0 - mu / 3.0);
    let wxx = arr2(&[[a, b, a], [s, d, s], [a, b, a]]) * c;
    let wyy = arr2(&[[a, s, a], [b, d, b], [a, s, a]]) * c;

    let m = 2.0 * (mu + 1.0);
    let wxy = arr2(&[[m, 0.0, -m], [0.0, 0.0, 0.0], [-m, 0.0, m]]) * c;
    let wyx = wxy.clone();

    let kernels = UnknownKernels { wxx, wyy, wxy, wyx };
    for (name, k) in UNKNOWN_NAMES.iter().zip(kernels.as_array()) {
        ensure_finite(name, k)?;
    }
    Ok(kernels)
}

fn ensure_finite(name: &str, k: &Kernel) -> Result<(), StencilError> {
    if k.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(StencilError::NumericalInstability(format!("kernel {name} has non-finite entries")))
    }
}

// ─────────────────────────────────────────────────────────────
//  Parameter embedding
// ─────────────────────────────────────────────────────────────

/// Split a 36-vector into (wxx, wyy, wxy, wyx), each a row-major 3×3.
pub fn split_parameters(theta: &[f64]) -> Result<UnknownKernels, StencilError> {
    if theta.len() != NUM_PARAMS {
        return Err(StencilError::Shape(format!(
            "parameter vector must have {NUM_PARAMS} entries, got {}",
            theta.len()
        )));
    }
    if let Some(i) = theta.iter().position(|v| !v.is_finite()) {
        return Err(StencilError::NumericalInstability(format!("parameter {i} is {}", theta[i])));
    }
    let kernel = |b: usize| {
        Array2::from_shape_fn((KERNEL_SIZE, KERNEL_SIZE), |(r, c)| theta[b * KERNEL_LEN + r * KERNEL_SIZE + c])
    };
    Ok(UnknownKernels {
        wxx: kernel(0),
        wyy: kernel(1),
        wxy: kernel(2),
        wyx: kernel(3),
    })
}

/// Inverse of [`split_parameters`].
pub fn flatten_kernels(kernels: &UnknownKernels) -> Vec<f64> {
    kernels.as_array().iter().flat_map(|k| k.iter().copied()).collect()
}

/// Flat index of entry `(row, col)` of unknown kernel `block`.
#[inline]
pub fn param_index(block: usize, row: usize, col: usize) -> usize {
    block * KERNEL_LEN + row * KERNEL_SIZE + col
}

// ─────────────────────────────────────────────────────────────
//  Assembly
// ─────────────────────────────────────────────────────────────

/// Place known and unknown kernels into the full stencil.
pub fn assemble_stencil(known: &KnownKernels, unknown: &UnknownKernels) -> Stencil {
    let mut stencil = Stencil::zeros();
    for (&(input, output), kernel) in UNKNOWN_BLOCKS.iter().zip(unknown.as_array()) {
        stencil.set_block(input, output, kernel);
    }
    stencil.set_block(CHANNEL_T, CHANNEL_X, &known.wxt);
    stencil.set_block(CHANNEL_T, CHANNEL_Y, &known.wyt);
    stencil.set_block(CHANNEL_X, CHANNEL_T, &known.wtx);
    stencil.set_block(CHANNEL_Y, CHANNEL_T, &known.wty);
    stencil.set_block(CHANNEL_T, CHANNEL_T, &known.wtt);
    stencil
}

/// Stencil holding only the known physics (all unknown kernels zero).
pub fn known_stencil(known: &KnownKernels) -> Stencil {
    let zero = Array2::zeros((KERNEL_SIZE, KERNEL_SIZE));
    let unknown = UnknownKernels {
        wxx: zero.clone(),
        wyy: zero.clone(),
        wxy: zero.clone(),
        wyx: zero,
    };
    assemble_stencil(known, &unknown)
}

// ─────────────────────────────────────────────────────────────
//  Reporting
// ─────────────────────────────────────────────────────────────

/// A calibrated kernel with the sums used to eyeball conservation.
#[derive(Debug, Clone)]
pub struct KernelSummary {
    pub name: &'static str,
    pub kernel: Kernel,
    pub row_sums: [f64; KERNEL_SIZE],
    pub col_sums: [f64; KERNEL_SIZE],
    pub total: f64,
}

/// Summaries of wxx, wyy, wxy, wyx for a parameter vector.
pub fn summarize(theta: &[f64]) -> Result<Vec<KernelSummary>, StencilError> {
    let kernels = split_parameters(theta)?;
    Ok(UNKNOWN_NAMES
        .iter()
        .zip(kernels.as_array())
        .map(|(&name, k)| {
            let mut row_sums = [0.0; KERNEL_SIZE];
            let mut col_sums = [0.0; KERNEL_SIZE];
            for ((r, c), &v) in k.indexed_iter() {
                row_sums[r] += v;
                col_sums[c] += v;
            }
            KernelSummary {
                name,
                kernel: k.clone(),
                row_sums,
                col_sums,
                total: k.sum(),
            }
        })
        .collect())
}
