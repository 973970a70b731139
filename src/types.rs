use ndarray::{Array2, Array3, Array4, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, StencilError>`
/// instead of panicking.  The FFI layer translates these into integer
/// return codes + a thread-local error message.
#[derive(Debug)]
pub enum StencilError {
    /// Field or parameter-vector dimensions disagree with N, 3 channels
    /// or the 36-entry parameter contract.
    Shape(String),
    /// Non-finite values in kernels, loss, gradient or Hessian.
    NumericalInstability(String),
    /// Sparse factorisation failure (singular Hessian in the direct solve).
    Linalg(sprs::errors::LinalgError),
    /// Argmin solver returned an error.
    Solver(String),
    /// Produced by [`FitResult::into_converged`] only; the drivers report
    /// non-convergence through `FitResult::converged`.
    NonConvergence {
        iterations: usize,
        gradient_norm: f64,
        message: String,
    },
}

impl fmt::Display for StencilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
            Self::NumericalInstability(msg) => write!(f, "numerical instability: {msg}"),
            Self::Linalg(e) => write!(f, "linear algebra error: {e}"),
            Self::Solver(msg) => write!(f, "solver error: {msg}"),
            Self::NonConvergence { iterations, gradient_norm, message } => write!(
                f,
                "no convergence after {iterations} iterations (|g| = {gradient_norm:.3e}): {message}"
            ),
        }
    }
}

impl std::error::Error for StencilError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for StencilError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

impl From<argmin::core::Error> for StencilError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Channels per field: (x, y, temperature).
pub const NUM_CHANNELS: usize = 3;
/// Spatial kernel width / height.
pub const KERNEL_SIZE: usize = 3;
/// Entries per 3×3 kernel.
pub const KERNEL_LEN: usize = KERNEL_SIZE * KERNEL_SIZE;
/// Trainable kernels: wxx, wyy, wxy, wyx.
pub const NUM_UNKNOWN_KERNELS: usize = 4;
/// Length of the parameter vector.
pub const NUM_PARAMS: usize = NUM_UNKNOWN_KERNELS * KERNEL_LEN;
/// Smallest grid for which padding and the interior loss are defined.
pub const MIN_GRID_SIZE: usize = 3;

/// Unit-harmonisation factor applied to measured displacements.
pub const DISPLACEMENT_SCALE: f64 = 1e6;

pub const CHANNEL_X: usize = 0;
pub const CHANNEL_Y: usize = 1;
pub const CHANNEL_T: usize = 2;

/// `(input, output)` channel of each trainable kernel, in parameter order.
pub const UNKNOWN_BLOCKS: [(usize, usize); NUM_UNKNOWN_KERNELS] = [
    (CHANNEL_X, CHANNEL_X), // wxx
    (CHANNEL_Y, CHANNEL_Y), // wyy
    (CHANNEL_Y, CHANNEL_X), // wxy
    (CHANNEL_X, CHANNEL_Y), // wyx
];

/// Names matching `UNKNOWN_BLOCKS`.
pub const UNKNOWN_NAMES: [&str; NUM_UNKNOWN_KERNELS] = ["wxx", "wyy", "wxy", "wyx"];

/// A single 3×3 spatial kernel, indexed `[row, col]`.
pub type Kernel = Array2<f64>;

// ─────────────────────────────────────────────────────────────
//  Material
// ─────────────────────────────────────────────────────────────

/// Material constants that determine every known stencil entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialParams {
    /// Young's modulus E.
    #[serde(alias = "E")]
    pub youngs_modulus: f64,
    /// Poisson ratio μ.
    #[serde(alias = "mu")]
    pub poisson_ratio: f64,
    /// Thermal conductivity k.
    #[serde(alias = "k")]
    pub conductivity: f64,
    /// Thermal expansion coefficient α.
    #[serde(alias = "alpha")]
    pub thermal_expansion: f64,
}

impl MaterialParams {
    pub fn new(youngs_modulus: f64, poisson_ratio: f64, conductivity: f64, thermal_expansion: f64) -> Self {
        Self { youngs_modulus, poisson_ratio, conductivity, thermal_expansion }
    }

    /// The steel specimen the calibration data was measured on.
    pub fn steel() -> Self {
        Self::new(212e3, 0.288, 16.0, 12e-6)
    }

    /// Reject non-finite constants and Poisson ratios at which the
    /// closed-form coefficients blow up (`1 - μ² = 0`).
    pub fn validate(&self) -> Result<(), StencilError> {
        let values = [
            ("E", self.youngs_modulus),
            ("mu", self.poisson_ratio),
            ("k", self.conductivity),
            ("alpha", self.thermal_expansion),
        ];
        for (name, v) in values {
            if !v.is_finite() {
                return Err(StencilError::NumericalInstability(format!(
                    "material parameter {name} is not finite ({v})"
                )));
            }
        }
        if (1.0 - self.poisson_ratio * self.poisson_ratio).abs() < f64::EPSILON {
            return Err(StencilError::NumericalInstability(format!(
                "Poisson ratio {} makes 1 - mu^2 vanish",
                self.poisson_ratio
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Field  (N × N × 3 grid)
// ─────────────────────────────────────────────────────────────

/// A single-sample 3-channel square grid, indexed `[row, col, channel]`.
///
/// Load fields carry (x-force, y-force, heat flux); response fields carry
/// (x-displacement, y-displacement, temperature).
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    data: Array3<f64>,
}

impl Field {
    /// Wrap an `(N, N, 3)` array.  Fails fast on any other shape.
    pub fn new(data: Array3<f64>) -> Result<Self, StencilError> {
        let (rows, cols, channels) = data.dim();
        if rows != cols {
            return Err(StencilError::Shape(format!("field must be square, got {rows}×{cols}")));
        }
        if channels != NUM_CHANNELS {
            return Err(StencilError::Shape(format!(
                "field must have {NUM_CHANNELS} channels, got {channels}"
            )));
        }
        if rows < MIN_GRID_SIZE {
            return Err(StencilError::Shape(format!(
                "grid size {rows} is below the minimum of {MIN_GRID_SIZE}"
            )));
        }
        Ok(Self { data })
    }

    pub fn zeros(n: usize) -> Result<Self, StencilError> {
        Self::new(Array3::zeros((n, n, NUM_CHANNELS)))
    }

    /// Stack three `N × N` channel grids.
    pub fn from_channels(c0: &Array2<f64>, c1: &Array2<f64>, c2: &Array2<f64>) -> Result<Self, StencilError> {
        let dim = c0.dim();
        if c1.dim() != dim || c2.dim() != dim {
            return Err(StencilError::Shape(format!(
                "channel shapes differ: {:?}, {:?}, {:?}",
                c0.dim(),
                c1.dim(),
                c2.dim()
            )));
        }
        let stacked = ndarray::stack(Axis(2), &[c0.view(), c1.view(), c2.view()])
            .map_err(|e| StencilError::Shape(e.to_string()))?;
        Self::new(stacked)
    }

    /// Load field from raw measurements: forces are sign-flipped into the
    /// stencil convention, heat flux is kept as is.
    pub fn load_from_measurements(fx: &Array2<f64>, fy: &Array2<f64>, ftem: &Array2<f64>) -> Result<Self, StencilError> {
        Self::from_channels(&fx.mapv(|v| -v), &fy.mapv(|v| -v), ftem)
    }

    /// Response field from raw measurements: displacements are scaled by
    /// [`DISPLACEMENT_SCALE`], temperature is kept as is.
    pub fn response_from_measurements(ux: &Array2<f64>, uy: &Array2<f64>, utem: &Array2<f64>) -> Result<Self, StencilError> {
        Self::from_channels(
            &ux.mapv(|v| v * DISPLACEMENT_SCALE),
            &uy.mapv(|v| v * DISPLACEMENT_SCALE),
            utem,
        )
    }

    /// Grid resolution N.
    pub fn size(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn channel(&self, c: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(2), c)
    }

    pub fn into_inner(self) -> Array3<f64> {
        self.data
    }
}

// ─────────────────────────────────────────────────────────────
//  Kernels and the assembled stencil
// ─────────────────────────────────────────────────────────────

/// The five kernels fixed by known physics.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownKernels {
    /// Thermal self-coupling.
    pub wtt: Kernel,
    /// Temperature → x-force coupling.
    pub wxt: Kernel,
    /// Temperature → y-force coupling.
    pub wyt: Kernel,
    /// x-displacement → heat flux (zero).
    pub wtx: Kernel,
    /// y-displacement → heat flux (zero).
    pub wty: Kernel,
}

/// The four pure-elastic kernels, in parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownKernels {
    pub wxx: Kernel,
    pub wyy: Kernel,
    pub wxy: Kernel,
    pub wyx: Kernel,
}

impl UnknownKernels {
    /// Kernels in parameter order (wxx, wyy, wxy, wyx).
    pub fn as_array(&self) -> [&Kernel; NUM_UNKNOWN_KERNELS] {
        [&self.wxx, &self.wyy, &self.wxy, &self.wyx]
    }
}

/// Full 3-in × 3-out stencil, indexed `[row, col, input, output]`
/// (the layout of a cross-correlation filter bank).
#[derive(Debug, Clone, PartialEq)]
pub struct Stencil {
    weights: Array4<f64>,
}

impl Stencil {
    pub fn new(weights: Array4<f64>) -> Result<Self, StencilError> {
        let expected = (KERNEL_SIZE, KERNEL_SIZE, NUM_CHANNELS, NUM_CHANNELS);
        if weights.dim() != expected {
            return Err(StencilError::Shape(format!(
                "stencil must have shape {expected:?}, got {:?}",
                weights.dim()
            )));
        }
        Ok(Self { weights })
    }

    pub fn zeros() -> Self {
        Self { weights: Array4::zeros((KERNEL_SIZE, KERNEL_SIZE, NUM_CHANNELS, NUM_CHANNELS)) }
    }

    pub fn weights(&self) -> &Array4<f64> {
        &self.weights
    }

    /// The 3×3 kernel mapping `input` channel onto `output` channel.
    pub fn block(&self, input: usize, output: usize) -> ArrayView2<'_, f64> {
        self.weights.index_axis(Axis(3), output).index_axis_move(Axis(2), input)
    }

    pub fn set_block(&mut self, input: usize, output: usize, kernel: &Kernel) {
        self.weights
            .index_axis_mut(Axis(3), output)
            .index_axis_move(Axis(2), input)
            .assign(kernel);
    }
}

impl std::ops::Add<&Stencil> for &Stencil {
    type Output = Stencil;

    fn add(self, rhs: &Stencil) -> Stencil {
        Stencil { weights: &self.weights + &rhs.weights }
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver options
// ─────────────────────────────────────────────────────────────

/// Weights of the optional regularisers.  Both are off by default.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyWeights {
    /// Weight of Σ|Σ w| over the unknown kernels.
    pub singularity: f64,
    /// Weight of the mirror-symmetry mismatch.
    pub symmetry: f64,
}

impl PenaltyWeights {
    pub fn is_active(&self) -> bool {
        self.singularity != 0.0 || self.symmetry != 0.0
    }
}

/// Second-order method used by `optimizer::run_newton`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewtonMethod {
    /// Line-search Newton with a truncated conjugate-gradient inner solve.
    #[default]
    NewtonCg,
    /// Trust-region Newton with a Steihaug-Toint CG subproblem.
    TrustRegion,
    /// Full Newton steps through a sparse LDLᵀ factorisation of the Hessian.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Cost evaluations allowed to L-BFGS (line-search trial points included).
    pub max_evaluations: usize,
    /// ‖∇L‖₂ at which a Newton-type run counts as converged.
    pub gradient_tolerance: f64,
    pub lbfgs_gradient_tolerance: f64,
    pub lbfgs_cost_tolerance: f64,
    /// L-BFGS correction pairs.
    pub lbfgs_memory: usize,
    pub newton_method: NewtonMethod,
    /// Initial trust radius for `NewtonMethod::TrustRegion`.
    pub trust_radius: f64,
    pub max_trust_radius: f64,
    pub penalties: PenaltyWeights,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            max_evaluations: 200,
            gradient_tolerance: 1e-3,
            lbfgs_gradient_tolerance: 1e-5,
            lbfgs_cost_tolerance: 1e7 * f64::EPSILON,
            lbfgs_memory: 10,
            newton_method: NewtonMethod::NewtonCg,
            trust_radius: 1e3,
            max_trust_radius: 1e9,
            penalties: PenaltyWeights::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Problem definition  (immutable after construction)
// ─────────────────────────────────────────────────────────────

/// One measured load/response pair plus the physics that is known.
#[derive(Debug, Clone)]
pub struct CalibrationProblem {
    pub material: MaterialParams,
    pub response: Field,
    pub load: Field,
    pub known: KnownKernels,
    pub options: SolverOptions,
}

impl CalibrationProblem {
    /// Validate shapes and derive the known kernels once.
    pub fn new(material: MaterialParams, response: Field, load: Field) -> Result<Self, StencilError> {
        if response.size() != load.size() {
            return Err(StencilError::Shape(format!(
                "response is {n}×{n} but load is {m}×{m}",
                n = response.size(),
                m = load.size()
            )));
        }
        let known = crate::stencil::known_kernels(&material)?;
        Ok(Self {
            material,
            response,
            load,
            known,
            options: SolverOptions::default(),
        })
    }

    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Grid resolution N.
    pub fn grid_size(&self) -> usize {
        self.response.size()
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver result  (returned from the drivers)
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    /// Optimised parameter vector (wxx, wyy, wxy, wyx, row-major each).
    pub params: Vec<f64>,
    pub loss: f64,
    pub gradient_norm: f64,
    pub iterations: usize,
    /// Cost evaluations spent, line-search trial points included.
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

impl FitResult {
    pub fn kernels(&self) -> Result<UnknownKernels, StencilError> {
        crate::stencil::split_parameters(&self.params)
    }

    /// Turn a non-converged result into [`StencilError::NonConvergence`].
    pub fn into_converged(self) -> Result<Self, StencilError> {
        if self.converged {
            Ok(self)
        } else {
            Err(StencilError::NonConvergence {
                iterations: self.iterations,
                gradient_norm: self.gradient_norm,
                message: self.message,
            })
        }
    }
}
