use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for `mergersim` operations.
#[derive(Debug, Error)]
pub enum MergerError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, usually the number of products.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when market data violates a basic domain restriction.
    #[error("invalid input for {context}: {detail}")]
    InputValidation {
        context: &'static str,
        detail: String,
    },

    /// Raised when an ownership vector or matrix is malformed.
    #[error("invalid ownership structure: {detail}")]
    InvalidOwnership { detail: String },

    /// Raised when the diversion/ownership combination makes a linear system degenerate.
    #[error("system in {context} is singular")]
    SingularSystem { context: &'static str },

    /// Raised when the iterative calibration does not converge.
    #[error(
        "{variant} calibration did not converge after {iterations} iterations; best objective {objective}"
    )]
    Calibration {
        /// Name of the demand system being calibrated.
        variant: &'static str,
        /// Iterations spent by the last optimizer run.
        iterations: u64,
        /// Smallest objective value reached across all starts.
        objective: f64,
    },

    /// Raised when the equilibrium price solve fails to converge.
    #[error(
        "equilibrium price solve did not converge after {iterations} iterations; residual norm {residual_norm}"
    )]
    PriceSolve {
        iterations: usize,
        /// Supremum norm of the scaled first-order conditions at the last iterate.
        residual_norm: f64,
        /// Last price iterate, full length with `NaN` for excluded products.
        last_iterate: DVector<f64>,
    },

    /// Raised when numerical routines produce NaN or infinite values.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the optimization backend rejects its configuration.
    #[error("optimizer backend error: {message}")]
    Optimizer { message: String },
}

impl MergerError {
    /// Helper to format a [`DimensionMismatch`](MergerError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for input validation failures.
    pub fn invalid_input(context: &'static str, detail: impl Into<String>) -> Self {
        Self::InputValidation {
            context,
            detail: detail.into(),
        }
    }

    /// Helper for malformed ownership structures.
    pub fn invalid_ownership(detail: impl Into<String>) -> Self {
        Self::InvalidOwnership {
            detail: detail.into(),
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularSystem { context }
    }
}

impl From<argmin::core::Error> for MergerError {
    fn from(err: argmin::core::Error) -> Self {
        Self::Optimizer {
            message: err.to_string(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, MergerError>;

/// Which side of the merger a quantity refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    PreMerger,
    PostMerger,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::PreMerger => f.write_str("pre-merger"),
            MarketState::PostMerger => f.write_str("post-merger"),
        }
    }
}

/// Non-fatal economic inconsistencies attached to a simulation result.
///
/// These never abort a simulation. They flag outputs an analyst should not
/// take at face value, typically because the observed margins and diversions
/// are hard to reconcile with the chosen demand system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValidityWarning {
    /// A recovered marginal cost is negative.
    NegativeMarginalCost {
        state: MarketState,
        index: usize,
        cost: f64,
    },
    /// The unconstrained linear equilibrium implies a negative quantity.
    NegativeQuantity {
        state: MarketState,
        index: usize,
        quantity: f64,
    },
}

impl fmt::Display for ValidityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidityWarning::NegativeMarginalCost { state, index, cost } => write!(
                f,
                "{state} marginal cost of product {index} is negative ({cost})"
            ),
            ValidityWarning::NegativeQuantity {
                state,
                index,
                quantity,
            } => write!(
                f,
                "{state} unconstrained equilibrium quantity of product {index} is negative ({quantity})"
            ),
        }
    }
}
