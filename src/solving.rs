//! Bertrand equilibrium price solver and its diagnostics.
//!
//! Linear demand is solved in closed form, with an active set that pins the
//! quantity of any product priced out of the market to zero. Every other
//! variant is solved iteratively on the first-order conditions divided by
//! quantities: damped Newton steps on a finite-difference Jacobian, with the
//! derivative-free spectral method (DF-SANE) as a fallback.

use std::cell::RefCell;
use std::collections::VecDeque;

use finitediff::FiniteDiff;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::demand::{DemandModel, DemandSystem, LinearDemand};
use crate::error::{MergerError, Result};
use crate::options::{EquilibriumOptions, SolveMethod};
use crate::ownership::OwnershipMatrix;

const NEGATIVE_QUANTITY_TOLERANCE: f64 = 1e-12;
const SUFFICIENT_DECREASE: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;
const NONMONOTONE_MEMORY: usize = 10;
const SPECTRAL_BOUNDS: (f64, f64) = (1e-10, 1e10);

/// How the reported prices were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolvePath {
    /// Linear demand, unconstrained closed form.
    ClosedForm,
    /// Linear demand with some quantities pinned to zero.
    Constrained,
    Newton,
    Spectral,
}

/// Diagnostics returned alongside equilibrium prices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveSummary {
    pub path: SolvePath,
    /// Iterations of the method that produced the prices (zero for closed forms).
    pub iterations: usize,
    /// Supremum norm of the first-order conditions divided by quantities.
    pub residual_norm: f64,
    /// Whether the primary method failed and its fallback succeeded.
    pub fallback_used: bool,
    /// Products whose quantity would be negative, with that quantity.
    ///
    /// Indices refer to the full product list.
    pub negative_quantities: Vec<(usize, f64)>,
}

/// Solves `FOC(p) = 0` for the products flagged in `active`.
///
/// Inactive products are dropped from the market for the solve and reported
/// with `NaN` prices. `start` is used as the initial iterate by the iterative
/// methods and must be positive on active products.
pub fn solve_prices(
    model: &DemandModel,
    costs: &DVector<f64>,
    ownership: &OwnershipMatrix,
    active: &[bool],
    start: &DVector<f64>,
    options: &EquilibriumOptions,
) -> Result<(DVector<f64>, SolveSummary)> {
    let k = model.product_count();
    for (context, found) in [
        ("cost length", costs.len()),
        ("ownership dimension", ownership.dimension()),
        ("subset length", active.len()),
        ("price start length", start.len()),
    ] {
        if found != k {
            return Err(MergerError::dimension_mismatch(context, k, found));
        }
    }

    let indices: Vec<usize> = (0..k).filter(|&i| active[i]).collect();
    if indices.is_empty() {
        return Err(MergerError::invalid_input(
            "subset",
            "at least one product must be active",
        ));
    }

    let restricted = model.restrict(&indices);
    let costs = costs.select_rows(&indices);
    let ownership = ownership.restrict(&indices);
    let start = start.select_rows(&indices);

    let embed = |values: &DVector<f64>| {
        let mut full = DVector::from_element(k, f64::NAN);
        for (position, &index) in indices.iter().enumerate() {
            full[index] = values[position];
        }
        full
    };

    let (prices, mut summary) = match &restricted {
        DemandModel::Linear(linear) => solve_linear(linear, &costs, &ownership)?,
        other => match solve_iterative(other, &costs, &ownership, &start, options)? {
            Ok(found) => found,
            Err(failure) => {
                return Err(MergerError::PriceSolve {
                    iterations: failure.iterations,
                    residual_norm: failure.residual_norm,
                    last_iterate: embed(&failure.prices),
                })
            }
        },
    };

    for entry in &mut summary.negative_quantities {
        entry.0 = indices[entry.0];
    }
    if !summary.negative_quantities.is_empty() {
        warn!(
            "{} equilibrium has {} product(s) with negative demand",
            model.name(),
            summary.negative_quantities.len()
        );
    }
    debug!(
        "{} equilibrium via {:?}: {} iterations, residual {:.3e}",
        model.name(),
        summary.path,
        summary.iterations,
        summary.residual_norm
    );
    Ok((embed(&prices), summary))
}

fn solve_linear(
    model: &LinearDemand,
    costs: &DVector<f64>,
    ownership: &OwnershipMatrix,
) -> Result<(DVector<f64>, SolveSummary)> {
    let k = model.product_count();
    let demand = |prices: &DVector<f64>| model.intercepts() + model.slopes() * prices;

    let mut prices = model.bertrand_prices(costs, ownership)?;
    let mut pinned: Vec<usize> = Vec::new();
    let mut negative_quantities = Vec::new();
    // Each round pins at least one more product, so k rounds always suffice.
    for _ in 0..k {
        let quantities = demand(&prices);
        let newly: Vec<usize> = (0..k)
            .filter(|i| !pinned.contains(i) && quantities[*i] < -NEGATIVE_QUANTITY_TOLERANCE)
            .collect();
        if newly.is_empty() {
            break;
        }
        negative_quantities.extend(newly.iter().map(|&i| (i, quantities[i])));
        pinned.extend(newly);
        prices = model.constrained_prices(costs, ownership, &pinned)?;
    }

    let quantities = demand(&prices);
    let internal = ownership
        .matrix()
        .component_mul(&model.slopes().transpose());
    let foc =
        ownership.matrix().diagonal().component_mul(&quantities) + internal * (&prices - costs);
    // A product can sit exactly at zero demand without being pinned; its
    // condition is then reported unscaled.
    let residual_norm = (0..k)
        .filter(|i| !pinned.contains(i))
        .map(|i| {
            if quantities[i].abs() > NEGATIVE_QUANTITY_TOLERANCE {
                (foc[i] / quantities[i]).abs()
            } else {
                foc[i].abs()
            }
        })
        .fold(0.0, f64::max);

    let path = if pinned.is_empty() {
        SolvePath::ClosedForm
    } else {
        SolvePath::Constrained
    };
    Ok((
        prices,
        SolveSummary {
            path,
            iterations: 0,
            residual_norm,
            fallback_used: false,
            negative_quantities,
        },
    ))
}

/// Outcome of an iterative method that stopped without converging.
struct Failure {
    prices: DVector<f64>,
    iterations: usize,
    residual_norm: f64,
}

struct Iterate {
    prices: DVector<f64>,
    iterations: usize,
    residual_norm: f64,
    converged: bool,
}

type Attempt = std::result::Result<(DVector<f64>, SolveSummary), Failure>;

fn solve_iterative(
    model: &DemandModel,
    costs: &DVector<f64>,
    ownership: &OwnershipMatrix,
    start: &DVector<f64>,
    options: &EquilibriumOptions,
) -> Result<Attempt> {
    if start.iter().any(|price| !price.is_finite() || *price <= 0.0) {
        return Err(MergerError::invalid_input(
            "price start",
            "starting prices of active products must be positive",
        ));
    }

    let residual = |prices: &DVector<f64>| scaled_conditions(model, prices, costs, ownership);
    let first = options.method;
    let second = match first {
        SolveMethod::Newton => SolveMethod::Spectral,
        SolveMethod::Spectral => SolveMethod::Newton,
    };

    let mut iterate = run_method(first, &residual, start, options)?;
    let mut fallback_used = false;
    if !iterate.converged && options.fallback {
        warn!(
            "{first:?} price solve stalled at residual {:.3e} after {} iterations; trying {second:?}",
            iterate.residual_norm, iterate.iterations
        );
        let retry = run_method(second, &residual, start, options)?;
        if retry.converged || retry.residual_norm < iterate.residual_norm {
            fallback_used = retry.converged;
            iterate = retry;
        }
    }

    if !iterate.converged {
        return Ok(Err(Failure {
            prices: iterate.prices,
            iterations: iterate.iterations,
            residual_norm: iterate.residual_norm,
        }));
    }

    let path = match (fallback_used, first) {
        (false, SolveMethod::Newton) | (true, SolveMethod::Spectral) => SolvePath::Newton,
        _ => SolvePath::Spectral,
    };
    let quantities = model.quantities(&iterate.prices)?;
    let negative_quantities = quantities
        .iter()
        .enumerate()
        .filter(|(_, q)| **q < -NEGATIVE_QUANTITY_TOLERANCE)
        .map(|(i, q)| (i, *q))
        .collect();
    Ok(Ok((
        iterate.prices,
        SolveSummary {
            path,
            iterations: iterate.iterations,
            residual_norm: iterate.residual_norm,
            fallback_used,
            negative_quantities,
        },
    )))
}

fn run_method<F>(
    method: SolveMethod,
    residual: &F,
    start: &DVector<f64>,
    options: &EquilibriumOptions,
) -> Result<Iterate>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    match method {
        SolveMethod::Newton => newton(residual, start, options),
        SolveMethod::Spectral => spectral(residual, start, options),
    }
}

/// First-order conditions divided by quantities, so that every entry is a
/// relative deviation regardless of product size.
fn scaled_conditions(
    model: &DemandModel,
    prices: &DVector<f64>,
    costs: &DVector<f64>,
    ownership: &OwnershipMatrix,
) -> Result<DVector<f64>> {
    let foc = model.first_order_conditions(prices, costs, ownership)?;
    let quantities = model.quantities(prices)?;
    let scaled = foc.component_div(&quantities);
    if scaled.iter().any(|value| !value.is_finite()) {
        return Err(MergerError::NumericalError {
            context: "first-order conditions",
        });
    }
    Ok(scaled)
}

/// Residual at `prices` if they are admissible and the model evaluates there.
fn admissible<F>(residual: &F, prices: &DVector<f64>) -> Option<DVector<f64>>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    if prices.iter().any(|price| !price.is_finite() || *price <= 0.0) {
        return None;
    }
    residual(prices).ok()
}

/// Central-difference Jacobian `J[row, col] = ∂F_row/∂p_col`.
fn finite_difference_jacobian<F>(residual: &F, prices: &DVector<f64>) -> Result<DMatrix<f64>>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let n = prices.len();
    let captured: RefCell<Option<MergerError>> = RefCell::new(None);
    let evaluate = |point: &Vec<f64>| -> Vec<f64> {
        match residual(&DVector::from_column_slice(point)) {
            Ok(value) => value.as_slice().to_vec(),
            Err(err) => {
                captured.borrow_mut().get_or_insert(err);
                vec![f64::NAN; n]
            }
        }
    };
    let columns = prices.as_slice().to_vec().central_jacobian(&evaluate);
    if let Some(err) = captured.into_inner() {
        return Err(err);
    }
    let jacobian = DMatrix::from_fn(n, n, |row, col| columns[col][row]);
    if jacobian.iter().any(|value| !value.is_finite()) {
        return Err(MergerError::NumericalError {
            context: "equilibrium Jacobian",
        });
    }
    Ok(jacobian)
}

fn newton<F>(residual: &F, start: &DVector<f64>, options: &EquilibriumOptions) -> Result<Iterate>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let mut prices = start.clone();
    let mut current = residual(&prices)?;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        if current.amax() < options.tolerance {
            break;
        }
        let Ok(jacobian) = finite_difference_jacobian(residual, &prices) else {
            break;
        };
        let Some(step) = jacobian.lu().solve(&-&current) else {
            break;
        };

        let norm = current.norm();
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial = &prices + &step * scale;
            if let Some(value) = admissible(residual, &trial) {
                if value.norm() <= (1.0 - SUFFICIENT_DECREASE * scale) * norm {
                    accepted = Some((trial, value));
                    break;
                }
            }
            scale *= 0.5;
        }
        let Some((next, value)) = accepted else {
            break;
        };

        iterations += 1;
        prices = next;
        current = value;
        if options.verbose {
            debug!(
                "Newton iteration {iterations}: residual {:.3e}, step scale {scale}",
                current.amax()
            );
        }
    }

    let residual_norm = current.amax();
    Ok(Iterate {
        prices,
        iterations,
        residual_norm,
        converged: residual_norm < options.tolerance,
    })
}

/// Derivative-free spectral residual method with a nonmonotone line search.
fn spectral<F>(residual: &F, start: &DVector<f64>, options: &EquilibriumOptions) -> Result<Iterate>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let mut prices = start.clone();
    let mut current = residual(&prices)?;
    let mut merit = current.norm_squared();
    let initial_merit = merit;
    let mut history: VecDeque<f64> = VecDeque::from([merit]);
    let mut sigma = 1.0;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        if current.amax() < options.tolerance {
            break;
        }

        let direction = &current * -sigma;
        let ceiling = history.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let slack = initial_merit / ((iterations + 1) as f64).powi(2);
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let bound = ceiling + slack - SUFFICIENT_DECREASE * scale * scale * merit;
            for signed in [scale, -scale] {
                let trial = &prices + &direction * signed;
                if let Some(value) = admissible(residual, &trial) {
                    if value.norm_squared() <= bound {
                        accepted = Some((trial, value));
                        break;
                    }
                }
            }
            if accepted.is_some() {
                break;
            }
            scale *= 0.5;
        }
        let Some((next, value)) = accepted else {
            break;
        };

        let step = &next - &prices;
        let change = &value - &current;
        let curvature = step.dot(&change);
        sigma = step.norm_squared() / curvature;
        if !sigma.is_finite() || !(SPECTRAL_BOUNDS.0..=SPECTRAL_BOUNDS.1).contains(&sigma.abs()) {
            sigma = 1.0;
        }

        iterations += 1;
        prices = next;
        current = value;
        merit = current.norm_squared();
        history.push_back(merit);
        if history.len() > NONMONOTONE_MEMORY {
            history.pop_front();
        }
        if options.verbose {
            debug!(
                "spectral iteration {iterations}: residual {:.3e}, sigma {sigma:.3e}",
                current.amax()
            );
        }
    }

    let residual_norm = current.amax();
    Ok(Iterate {
        prices,
        iterations,
        residual_norm,
        converged: residual_norm < options.tolerance,
    })
}
