//! Shared optimizer driver for demand systems calibrated by minimizing the
//! distance between implied and observed margins.
//!
//! Objectives are evaluated over an unconstrained parameter vector; variants
//! map it onto their admissible region (for example `alpha = -exp(theta)`).
//! Evaluations that fail, for instance because the markup system is singular
//! at a trial point, are scored with a large finite penalty so that the
//! simplex steps away from them instead of aborting the run.

use argmin::core::{CostFunction, Error, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{MergerError, Result};
use crate::options::CalibrationOptions;

const PENALTY: f64 = 1e10;

/// Diagnostics returned alongside calibrated demand parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    /// Calibrated free parameters in the variant's natural scale.
    pub parameters: Vec<f64>,
    /// Sum of squared deviations minimized by the calibration.
    pub objective: f64,
    /// Optimizer iterations of the winning start (zero for closed forms).
    pub iterations: u64,
    /// Number of optimizer starts attempted.
    pub starts: usize,
    /// Whether the parameters were obtained without iterating.
    pub closed_form: bool,
}

impl CalibrationSummary {
    pub(crate) fn closed_form(parameters: Vec<f64>, objective: f64) -> Self {
        Self {
            parameters,
            objective,
            iterations: 0,
            starts: 0,
            closed_form: true,
        }
    }
}

/// Exposes a crate objective as an `argmin` cost function.
struct ObjectiveAdapter<'a, F> {
    objective: &'a F,
}

impl<'a, F> CostFunction for ObjectiveAdapter<'a, F>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> std::result::Result<Self::Output, Error> {
        match (self.objective)(theta.as_slice()) {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Ok(PENALTY),
        }
    }
}

struct Run {
    parameters: Vec<f64>,
    objective: f64,
    iterations: u64,
    converged: bool,
}

/// Minimizes `objective` from `start` and from `options.restarts` perturbed
/// copies of it, returning the best converged run.
///
/// The returned summary carries the unconstrained parameters; callers convert
/// them back to their natural scale.
pub(crate) fn minimize<F>(
    variant: &'static str,
    objective: F,
    start: Vec<f64>,
    options: &CalibrationOptions,
) -> Result<CalibrationSummary>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    if start.is_empty() {
        let value = objective(start.as_slice())?;
        return Ok(CalibrationSummary {
            parameters: start,
            objective: value,
            iterations: 0,
            starts: 1,
            closed_form: false,
        });
    }
    if let Some(index) = start.iter().position(|value| !value.is_finite()) {
        return Err(MergerError::invalid_input(
            "calibration start",
            format!("starting value {index} is not finite"),
        ));
    }

    let mut starts = vec![start.clone()];
    if options.restarts > 0 {
        let noise = Normal::new(0.0, options.restart_scale)
            .map_err(|err| MergerError::invalid_input("calibration restarts", err.to_string()))?;
        let mut rng = SmallRng::seed_from_u64(options.seed);
        for _ in 0..options.restarts {
            starts.push(
                start
                    .iter()
                    .map(|value| value + noise.sample(&mut rng))
                    .collect(),
            );
        }
    }

    let attempts = starts.len();
    let mut best: Option<Run> = None;
    let mut lowest = f64::INFINITY;
    let mut last_iterations = 0;

    for (index, point) in starts.into_iter().enumerate() {
        let run = run_nelder_mead(&objective, point, options)?;
        if options.verbose {
            info!(
                "{variant} calibration start {index}: objective {:.3e} after {} iterations (converged: {})",
                run.objective, run.iterations, run.converged
            );
        } else {
            debug!(
                "{variant} calibration start {index}: objective {:.3e} after {} iterations",
                run.objective, run.iterations
            );
        }

        lowest = lowest.min(run.objective);
        last_iterations = run.iterations;
        let improves = best
            .as_ref()
            .map_or(true, |current| run.objective < current.objective);
        if run.converged && run.objective < PENALTY && improves {
            best = Some(run);
        }
    }

    match best {
        Some(run) => Ok(CalibrationSummary {
            parameters: run.parameters,
            objective: run.objective,
            iterations: run.iterations,
            starts: attempts,
            closed_form: false,
        }),
        None => Err(MergerError::Calibration {
            variant,
            iterations: last_iterations,
            objective: lowest,
        }),
    }
}

fn run_nelder_mead<F>(objective: &F, start: Vec<f64>, options: &CalibrationOptions) -> Result<Run>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    let simplex = initial_simplex(&start);
    let solver = NelderMead::new(simplex).with_sd_tolerance(options.tolerance)?;
    let problem = ObjectiveAdapter { objective };

    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()?;
    let state = result.state();

    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(
            TerminationReason::SolverConverged | TerminationReason::TargetCostReached
        )
    );
    let parameters = state.get_best_param().cloned().unwrap_or(start);

    Ok(Run {
        parameters,
        objective: state.get_best_cost(),
        iterations: state.get_iter(),
        converged,
    })
}

/// Start point plus one vertex displaced along each coordinate.
fn initial_simplex(start: &[f64]) -> Vec<Vec<f64>> {
    let mut simplex = Vec::with_capacity(start.len() + 1);
    simplex.push(start.to_vec());
    for index in 0..start.len() {
        let mut vertex = start.to_vec();
        let magnitude = vertex[index].abs();
        vertex[index] += if magnitude > 1e-3 { 0.2 * magnitude } else { 0.05 };
        simplex.push(vertex);
    }
    simplex
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn minimizes_shifted_quadratic() {
        let objective = |theta: &[f64]| -> Result<f64> {
            Ok((theta[0] - 1.5).powi(2) + 2.0 * (theta[1] + 0.5).powi(2))
        };
        let summary = minimize(
            "quadratic",
            objective,
            vec![0.0, 0.0],
            &CalibrationOptions::default(),
        )
        .unwrap();
        assert_relative_eq!(summary.parameters[0], 1.5, epsilon = 1e-4);
        assert_relative_eq!(summary.parameters[1], -0.5, epsilon = 1e-4);
        assert_eq!(summary.starts, 1);
        assert!(!summary.closed_form);
    }

    #[test]
    fn restarts_are_deterministic_for_a_seed() {
        let objective = |theta: &[f64]| -> Result<f64> { Ok((theta[0] - 0.3).powi(2)) };
        let options = CalibrationOptions::default().with_restarts(4, 11);
        let first = minimize("quadratic", objective, vec![2.0], &options).unwrap();
        let second = minimize("quadratic", objective, vec![2.0], &options).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.starts, 5);
    }

    #[test]
    fn failing_objective_reports_calibration_error() {
        let objective = |_: &[f64]| -> Result<f64> { Err(MergerError::singular("test system")) };
        let options = CalibrationOptions::default().with_max_iterations(20);
        let result = minimize("broken", objective, vec![1.0], &options);
        assert!(matches!(
            result,
            Err(MergerError::Calibration { variant: "broken", .. })
        ));
    }

    #[test]
    fn empty_parameter_vector_evaluates_once() {
        let objective = |theta: &[f64]| -> Result<f64> { Ok(theta.len() as f64 + 0.25) };
        let summary =
            minimize("fixed", objective, Vec::new(), &CalibrationOptions::default()).unwrap();
        assert_eq!(summary.objective, 0.25);
        assert_eq!(summary.iterations, 0);
    }
}
