//! Solver configuration threaded explicitly through calibration and equilibrium solving.

use serde::{Deserialize, Serialize};

/// Controls the iterative calibration used by demand systems without a closed form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOptions {
    /// Starting parameter values in the variant's natural scale; `None` uses a
    /// data-driven guess.
    pub start: Option<Vec<f64>>,
    /// Nelder–Mead termination tolerance on the standard deviation of simplex costs.
    pub tolerance: f64,
    /// Maximum number of optimizer iterations per start.
    pub max_iterations: u64,
    /// Additional randomly perturbed starts tried after the first one.
    pub restarts: usize,
    /// Standard deviation of the perturbation applied to restart points.
    pub restart_scale: f64,
    /// Seed for the restart perturbations.
    pub seed: u64,
    /// Emit per-start progress through the `log` facade at info level.
    pub verbose: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            start: None,
            tolerance: 1e-14,
            max_iterations: 2_000,
            restarts: 0,
            restart_scale: 0.5,
            seed: 42,
            verbose: false,
        }
    }
}

impl CalibrationOptions {
    /// Override the starting parameter values.
    pub fn with_start(mut self, start: Vec<f64>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Request `restarts` extra starts drawn around the first one with `seed`.
    pub fn with_restarts(mut self, restarts: usize, seed: u64) -> Self {
        self.restarts = restarts;
        self.seed = seed;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Iterative method used for demand systems without a closed-form equilibrium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveMethod {
    /// Damped Newton iterations on a finite-difference Jacobian.
    Newton,
    /// Derivative-free spectral residual iterations (DF-SANE).
    Spectral,
}

/// Controls the equilibrium price solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumOptions {
    /// Supremum-norm tolerance on the first-order conditions divided by quantities.
    pub tolerance: f64,
    /// Maximum number of iterations for each method attempted.
    pub max_iterations: usize,
    pub method: SolveMethod,
    /// Retry with the other method when the first one fails.
    pub fallback: bool,
    /// Log every iteration at debug level.
    pub verbose: bool,
}

impl Default for EquilibriumOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 500,
            method: SolveMethod::Newton,
            fallback: true,
            verbose: false,
        }
    }
}

impl EquilibriumOptions {
    pub fn with_method(mut self, method: SolveMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Aggregated solver configuration used when simulating a
/// [`MergerProblem`](crate::MergerProblem).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    pub calibration: CalibrationOptions,
    pub equilibrium: EquilibriumOptions,
}

impl SimulationOptions {
    /// Override the calibration settings while preserving other defaults.
    pub fn with_calibration(mut self, calibration: CalibrationOptions) -> Self {
        self.calibration = calibration;
        self
    }

    /// Override the equilibrium settings while preserving other defaults.
    pub fn with_equilibrium(mut self, equilibrium: EquilibriumOptions) -> Self {
        self.equilibrium = equilibrium;
        self
    }
}
