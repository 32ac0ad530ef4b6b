//! End-to-end merger simulation: calibrate demand on pre-merger data, recover
//! marginal costs, then solve pre- and post-merger Bertrand equilibria.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationSummary;
use crate::costs::recover_costs;
use crate::data::MarketObservation;
use crate::demand::{DemandModel, DemandSpec, DemandSystem};
use crate::diversion::DiversionMatrix;
use crate::error::{MarketState, MergerError, Result, ValidityWarning};
use crate::options::SimulationOptions;
use crate::ownership::{Ownership, OwnershipMatrix};
use crate::solving::{solve_prices, SolveSummary};

/// A fully validated merger simulation problem.
///
/// Construction resolves ownership and diversions and checks every optional
/// input against the product count, so [`simulate`](Self::simulate) only fails
/// for calibration or equilibrium reasons.
#[derive(Clone, Debug)]
pub struct MergerProblem {
    observation: MarketObservation,
    spec: DemandSpec,
    owner_pre: OwnershipMatrix,
    owner_post: OwnershipMatrix,
    diversion: DiversionMatrix,
    mc_delta: DVector<f64>,
    subset: Vec<bool>,
    price_start: DVector<f64>,
}

impl MergerProblem {
    /// Problem with default diversions, cost changes, subset and price start.
    pub fn new(
        observation: MarketObservation,
        spec: DemandSpec,
        owner_pre: Ownership,
        owner_post: Ownership,
    ) -> Result<Self> {
        Self::builder(observation, spec, owner_pre, owner_post).build()
    }

    pub fn builder(
        observation: MarketObservation,
        spec: DemandSpec,
        owner_pre: Ownership,
        owner_post: Ownership,
    ) -> MergerProblemBuilder {
        MergerProblemBuilder {
            observation,
            spec,
            owner_pre,
            owner_post,
            diversions: None,
            mc_delta: None,
            subset: None,
            price_start: None,
        }
    }

    pub fn observation(&self) -> &MarketObservation {
        &self.observation
    }

    pub fn spec(&self) -> &DemandSpec {
        &self.spec
    }

    pub fn diversion(&self) -> &DiversionMatrix {
        &self.diversion
    }

    /// Calibrates demand and solves both equilibria.
    pub fn simulate(&self, options: &SimulationOptions) -> Result<SimulationResult> {
        let k = self.observation.product_count();
        let prices = self.observation.prices();
        info!("simulating merger with {} demand over {k} products", self.spec.name());

        let (demand, calibration) = self.spec.calibrate(
            &self.observation,
            &self.diversion,
            &self.owner_pre,
            &options.calibration,
        )?;
        debug!(
            "{} calibration objective {:.3e} (parameters {:?})",
            demand.name(),
            calibration.objective,
            calibration.parameters
        );

        let costs_pre = recover_costs(&demand, prices, &self.owner_pre, None)?;
        let costs_post = costs_pre.component_mul(&self.mc_delta.add_scalar(1.0));

        let mut warnings = Vec::new();
        for (state, costs) in [
            (MarketState::PreMerger, &costs_pre),
            (MarketState::PostMerger, &costs_post),
        ] {
            warnings.extend(
                costs
                    .iter()
                    .enumerate()
                    .filter(|(_, cost)| **cost < 0.0)
                    .map(|(index, cost)| ValidityWarning::NegativeMarginalCost {
                        state,
                        index,
                        cost: *cost,
                    }),
            );
        }

        let everyone = vec![true; k];
        let (prices_pre, solve_pre) = solve_prices(
            &demand,
            &costs_pre,
            &self.owner_pre,
            &everyone,
            &self.price_start,
            &options.equilibrium,
        )?;
        let (prices_post, solve_post) = solve_prices(
            &demand,
            &costs_post,
            &self.owner_post,
            &self.subset,
            &self.price_start,
            &options.equilibrium,
        )?;
        for (state, summary) in [
            (MarketState::PreMerger, &solve_pre),
            (MarketState::PostMerger, &solve_post),
        ] {
            warnings.extend(summary.negative_quantities.iter().map(|&(index, quantity)| {
                ValidityWarning::NegativeQuantity {
                    state,
                    index,
                    quantity,
                }
            }));
        }
        for warning in &warnings {
            warn!("{warning}");
        }

        let result = SimulationResult {
            observation: self.observation.clone(),
            diversion: self.diversion.clone(),
            owner_pre: self.owner_pre.clone(),
            owner_post: self.owner_post.clone(),
            demand,
            calibration,
            costs_pre,
            costs_post,
            prices_pre,
            prices_post,
            subset: self.subset.clone(),
            warnings,
            solve_pre,
            solve_post,
        };
        info!(
            "simulation finished: mean price change {:.4}% over {} active products",
            result.mean_price_change(),
            result.subset.iter().filter(|active| **active).count()
        );
        Ok(result)
    }
}

/// Collects the optional inputs of a [`MergerProblem`].
#[derive(Clone, Debug)]
pub struct MergerProblemBuilder {
    observation: MarketObservation,
    spec: DemandSpec,
    owner_pre: Ownership,
    owner_post: Ownership,
    diversions: Option<DMatrix<f64>>,
    mc_delta: Option<DVector<f64>>,
    subset: Option<Vec<bool>>,
    price_start: Option<DVector<f64>>,
}

impl MergerProblemBuilder {
    /// Caller-supplied diversion ratios; synthesized from shares otherwise.
    pub fn diversions(mut self, diversions: DMatrix<f64>) -> Self {
        self.diversions = Some(diversions);
        self
    }

    /// Proportional post-merger change in marginal cost per product.
    pub fn mc_delta(mut self, mc_delta: DVector<f64>) -> Self {
        self.mc_delta = Some(mc_delta);
        self
    }

    /// Products that take part in the post-merger equilibrium.
    pub fn subset(mut self, subset: Vec<bool>) -> Self {
        self.subset = Some(subset);
        self
    }

    /// Starting prices for iterative equilibrium solves.
    pub fn price_start(mut self, price_start: DVector<f64>) -> Self {
        self.price_start = Some(price_start);
        self
    }

    pub fn build(self) -> Result<MergerProblem> {
        let k = self.observation.product_count();
        let owner_pre = self.owner_pre.resolve(k)?;
        let owner_post = self.owner_post.resolve(k)?;
        let diversion = DiversionMatrix::resolve(
            self.diversions.as_ref(),
            &self.observation.inside_shares(),
        )?;

        let mc_delta = self.mc_delta.unwrap_or_else(|| DVector::zeros(k));
        if mc_delta.len() != k {
            return Err(MergerError::dimension_mismatch(
                "mc_delta length",
                k,
                mc_delta.len(),
            ));
        }
        if let Some(index) = mc_delta.iter().position(|delta| !delta.is_finite()) {
            return Err(MergerError::invalid_input(
                "mc_delta",
                format!("cost change of product {index} is not finite"),
            ));
        }

        let subset = self.subset.unwrap_or_else(|| vec![true; k]);
        if subset.len() != k {
            return Err(MergerError::dimension_mismatch(
                "subset length",
                k,
                subset.len(),
            ));
        }
        if !subset.iter().any(|active| *active) {
            return Err(MergerError::invalid_input(
                "subset",
                "at least one product must be active",
            ));
        }

        let price_start = self
            .price_start
            .unwrap_or_else(|| self.observation.prices().clone());
        if price_start.len() != k {
            return Err(MergerError::dimension_mismatch(
                "price start length",
                k,
                price_start.len(),
            ));
        }
        if let Some(index) = price_start
            .iter()
            .position(|price| !price.is_finite() || *price <= 0.0)
        {
            return Err(MergerError::invalid_input(
                "price start",
                format!("starting price of product {index} must be positive"),
            ));
        }

        Ok(MergerProblem {
            observation: self.observation,
            spec: self.spec,
            owner_pre,
            owner_post,
            diversion,
            mc_delta,
            subset,
            price_start,
        })
    }
}

/// Outcome of a merger simulation. Entries of post-merger vectors that belong
/// to products outside the subset are `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    observation: MarketObservation,
    diversion: DiversionMatrix,
    owner_pre: OwnershipMatrix,
    owner_post: OwnershipMatrix,
    demand: DemandModel,
    calibration: CalibrationSummary,
    costs_pre: DVector<f64>,
    costs_post: DVector<f64>,
    prices_pre: DVector<f64>,
    prices_post: DVector<f64>,
    subset: Vec<bool>,
    warnings: Vec<ValidityWarning>,
    solve_pre: SolveSummary,
    solve_post: SolveSummary,
}

impl SimulationResult {
    pub fn observation(&self) -> &MarketObservation {
        &self.observation
    }

    /// Diversion ratios used for calibration, after perturbation.
    pub fn diversion(&self) -> &DiversionMatrix {
        &self.diversion
    }

    pub fn ownership(&self, state: MarketState) -> &OwnershipMatrix {
        match state {
            MarketState::PreMerger => &self.owner_pre,
            MarketState::PostMerger => &self.owner_post,
        }
    }

    /// Calibrated demand system.
    pub fn demand(&self) -> &DemandModel {
        &self.demand
    }

    pub fn calibration(&self) -> &CalibrationSummary {
        &self.calibration
    }

    pub fn costs(&self, state: MarketState) -> &DVector<f64> {
        match state {
            MarketState::PreMerger => &self.costs_pre,
            MarketState::PostMerger => &self.costs_post,
        }
    }

    /// Equilibrium prices.
    pub fn prices(&self, state: MarketState) -> &DVector<f64> {
        match state {
            MarketState::PreMerger => &self.prices_pre,
            MarketState::PostMerger => &self.prices_post,
        }
    }

    pub fn solve_summary(&self, state: MarketState) -> &SolveSummary {
        match state {
            MarketState::PreMerger => &self.solve_pre,
            MarketState::PostMerger => &self.solve_post,
        }
    }

    /// Products that took part in the post-merger equilibrium.
    pub fn subset(&self) -> &[bool] {
        &self.subset
    }

    pub fn warnings(&self) -> &[ValidityWarning] {
        &self.warnings
    }

    /// Equilibrium quantities predicted by the calibrated demand system.
    pub fn quantities(&self, state: MarketState) -> Result<DVector<f64>> {
        let active = self.active(state);
        let model = self.demand.restrict(&active);
        let prices = self.prices(state).select_rows(&active);
        let quantities = model.quantities(&prices)?;
        Ok(self.embed_vector(&active, &quantities))
    }

    /// Equilibrium price elasticities `∂ln q_i/∂ln p_j`.
    pub fn elasticities(&self, state: MarketState) -> Result<DMatrix<f64>> {
        let active = self.active(state);
        let model = self.demand.restrict(&active);
        let prices = self.prices(state).select_rows(&active);
        let elasticities = model.elasticities(&prices)?;
        Ok(self.embed_matrix(&active, &elasticities))
    }

    /// Diversion ratios implied by the calibrated demand system at equilibrium.
    pub fn implied_diversions(&self, state: MarketState) -> Result<DMatrix<f64>> {
        let active = self.active(state);
        let model = self.demand.restrict(&active);
        let prices = self.prices(state).select_rows(&active);
        let diversions = model.diversion_ratios(&prices)?;
        Ok(self.embed_matrix(&active, &diversions))
    }

    /// Percentage change from pre- to post-merger prices.
    pub fn price_changes(&self) -> DVector<f64> {
        self.prices_post
            .zip_map(&self.prices_pre, |post, pre| 100.0 * (post / pre - 1.0))
    }

    /// Unweighted mean percentage price change over active products.
    pub fn mean_price_change(&self) -> f64 {
        let changes: Vec<f64> = self
            .price_changes()
            .iter()
            .copied()
            .filter(|change| change.is_finite())
            .collect();
        if changes.is_empty() {
            return f64::NAN;
        }
        changes.iter().sum::<f64>() / changes.len() as f64
    }

    fn active(&self, state: MarketState) -> Vec<usize> {
        match state {
            MarketState::PreMerger => (0..self.subset.len()).collect(),
            MarketState::PostMerger => (0..self.subset.len())
                .filter(|&i| self.subset[i])
                .collect(),
        }
    }

    fn embed_vector(&self, active: &[usize], values: &DVector<f64>) -> DVector<f64> {
        let mut full = DVector::from_element(self.subset.len(), f64::NAN);
        for (position, &index) in active.iter().enumerate() {
            full[index] = values[position];
        }
        full
    }

    fn embed_matrix(&self, active: &[usize], values: &DMatrix<f64>) -> DMatrix<f64> {
        let k = self.subset.len();
        let mut full = DMatrix::from_element(k, k, f64::NAN);
        for (row, &i) in active.iter().enumerate() {
            for (col, &j) in active.iter().enumerate() {
                full[(i, j)] = values[(row, col)];
            }
        }
        full
    }
}

/// Simulates independent problems in parallel, one result per problem in order.
pub fn simulate_batch(
    problems: &[MergerProblem],
    options: &SimulationOptions,
) -> Vec<Result<SimulationResult>> {
    problems
        .par_iter()
        .map(|problem| problem.simulate(options))
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn observation() -> MarketObservation {
        MarketObservation::builder(
            DVector::from_vec(vec![2.9, 3.4, 2.2]),
            DVector::from_vec(vec![650.0, 998.0, 1801.0]),
        )
        .observed_margins(&[0.435, 0.417, 0.370])
        .build()
        .unwrap()
    }

    fn problem(spec: DemandSpec) -> MergerProblemBuilder {
        MergerProblem::builder(
            observation(),
            spec,
            Ownership::firms(["1", "2", "3"]),
            Ownership::firms(["1", "1", "3"]),
        )
    }

    #[test]
    fn builder_rejects_mismatched_optional_inputs() {
        let short_delta = problem(DemandSpec::linear())
            .mc_delta(DVector::zeros(2))
            .build();
        assert!(matches!(
            short_delta,
            Err(MergerError::DimensionMismatch { found: 2, .. })
        ));

        let nobody = problem(DemandSpec::linear())
            .subset(vec![false; 3])
            .build();
        assert!(matches!(nobody, Err(MergerError::InputValidation { .. })));

        let bad_start = problem(DemandSpec::linear())
            .price_start(DVector::from_vec(vec![1.0, 0.0, 1.0]))
            .build();
        assert!(matches!(bad_start, Err(MergerError::InputValidation { .. })));
    }

    #[test]
    fn cost_efficiencies_lower_post_merger_costs() {
        let result = problem(DemandSpec::linear())
            .mc_delta(DVector::from_vec(vec![-0.1, 0.0, 0.0]))
            .build()
            .unwrap()
            .simulate(&SimulationOptions::default())
            .unwrap();
        let pre = result.costs(MarketState::PreMerger);
        let post = result.costs(MarketState::PostMerger);
        assert_relative_eq!(post[0], 0.9 * pre[0], epsilon = 1e-12);
        assert_relative_eq!(post[1], pre[1], epsilon = 1e-12);
        assert!(result.warnings().is_empty());
    }

    #[test]
    fn accessors_report_nan_outside_the_subset() {
        let result = problem(DemandSpec::LogLinear)
            .subset(vec![true, true, false])
            .build()
            .unwrap()
            .simulate(&SimulationOptions::default())
            .unwrap();
        let quantities = result.quantities(MarketState::PostMerger).unwrap();
        assert!(quantities[2].is_nan());
        assert!(quantities[0] > 0.0);
        let elasticities = result.elasticities(MarketState::PostMerger).unwrap();
        assert!(elasticities[(2, 0)].is_nan());
        assert!(elasticities[(0, 0)] < 0.0);
        assert!(result.price_changes()[2].is_nan());
        assert!(result.mean_price_change().is_finite());
    }

    #[test]
    fn pre_merger_quantities_match_observation() {
        let result = problem(DemandSpec::linear())
            .build()
            .unwrap()
            .simulate(&SimulationOptions::default())
            .unwrap();
        let quantities = result.quantities(MarketState::PreMerger).unwrap();
        assert_relative_eq!(quantities, observation().quantities().clone(), epsilon = 1e-6);
        let diversions = result.implied_diversions(MarketState::PreMerger).unwrap();
        assert_relative_eq!(diversions[(0, 0)], -1.0, epsilon = 1e-12);
    }
}
