//! **stencilfit**: calibration of thermo-elastic convolution stencils with
//! closed-form gradients and Hessians.
//!
//! Given one measured response field (displacements + temperature) and
//! the load field it produced, find the four unknown elastic 3×3 kernels
//! of the stencil that maps one onto the other.
//!
//! 1. **Stencil** (`stencil`): known thermal / coupling kernels, parameter
//!    embedding, stencil assembly.
//! 2. **Forward pass** (`forward`): mirror padding + valid convolution.
//! 3. **Objectives** (`objectives`): interior MSE and optional regularisers.
//! 4. **Gradients** (`gradients`): exact loss / gradient / Hessian oracle.
//! 5. **Optimiser** (`optimizer`): L-BFGS and Newton-type drivers.
//! 6. **FFI** (`ffi`): C-compatible API.

pub mod types;
pub mod stencil;
pub mod forward;
pub mod objectives;
pub mod gradients;
pub mod optimizer;
pub mod ffi;
