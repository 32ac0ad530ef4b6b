//! Calibrated merger simulation for differentiated-products Bertrand markets.
//!
//! Given observed prices, quantities, margins and (optionally) diversion ratios,
//! the crate calibrates a parametric demand system so that the pre-merger
//! first-order conditions reproduce the observed margins, recovers marginal
//! costs, and solves for the Bertrand equilibrium under a post-merger ownership
//! structure. It offers tools to
//!
//! - validate product-level market data (`data` module),
//! - resolve ownership and diversion inputs (`ownership`, `diversion`),
//! - calibrate Linear, Log-Linear, Logit, CES and AIDS demand (`demand`),
//! - recover costs and solve equilibria (`costs`, `solving`), and
//! - run the whole pipeline, singly or in parallel batches (`simulation`).
//!
//! # Quick start
//!
//! ```no_run
//! use mergersim::{DemandSpec, MarketObservation, MarketState, MergerProblem, Ownership};
//! use mergersim::SimulationOptions;
//! use nalgebra::DVector;
//!
//! let observation = MarketObservation::builder(
//!     DVector::from_vec(vec![2.9, 3.4, 2.2]),
//!     DVector::from_vec(vec![650.0, 998.0, 1801.0]),
//! )
//! .observed_margins(&[0.435, 0.417, 0.370])
//! .labels(vec!["Prod1", "Prod2", "Prod3"])
//! .build()
//! .expect("validated market data");
//!
//! let problem = MergerProblem::new(
//!     observation,
//!     DemandSpec::linear(),
//!     Ownership::firms(["F1", "F2", "F3"]),
//!     Ownership::firms(["F1", "F1", "F3"]),
//! )
//! .expect("well-formed problem");
//!
//! let result = problem
//!     .simulate(&SimulationOptions::default())
//!     .expect("calibrated and solved");
//! println!("post-merger prices: {}", result.prices(MarketState::PostMerger));
//! println!("price changes (%): {}", result.price_changes());
//! ```
//!
//! Problems that fail to calibrate or solve return a [`MergerError`]; economic
//! inconsistencies that do not prevent a solution, such as negative recovered
//! costs, are attached to the result as [`ValidityWarning`]s.

pub mod calibration;
pub mod costs;
pub mod data;
pub mod demand;
pub mod diversion;
pub mod error;
pub mod options;
pub mod ownership;
pub mod simulation;
pub mod solving;

pub use calibration::CalibrationSummary;
pub use data::{MarketObservation, MarketObservationBuilder};
pub use demand::{DemandModel, DemandSpec, DemandSystem};
pub use diversion::DiversionMatrix;
pub use error::{MarketState, MergerError, Result, ValidityWarning};
pub use options::{CalibrationOptions, EquilibriumOptions, SimulationOptions, SolveMethod};
pub use ownership::{Ownership, OwnershipMatrix};
pub use simulation::{simulate_batch, MergerProblem, MergerProblemBuilder, SimulationResult};
pub use solving::{SolvePath, SolveSummary};
