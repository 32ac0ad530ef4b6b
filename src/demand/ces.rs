//! Constant elasticity of substitution demand over revenue shares.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{
    check_prices, margin_deviation, normalized_exponentials, require_margin,
    require_positive_quantities, supplied_start, DemandSystem,
};
use crate::calibration::{minimize, CalibrationSummary};
use crate::costs::implied_margins;
use crate::data::MarketObservation;
use crate::error::{MergerError, Result};
use crate::options::CalibrationOptions;
use crate::ownership::OwnershipMatrix;

/// CES demand: revenue shares `r_j ∝ exp(δ_j) p_j^(1 - γ)` of a fixed budget `Y`,
/// so that `q_j = r_j Y / p_j`.
///
/// With an outside good, its revenue share is the complement of the inside ones.
/// Observed outside shares are read as expenditure shares for calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CesDemand {
    substitution: f64,
    mean_values: DVector<f64>,
    budget: f64,
    outside_good: bool,
}

impl CesDemand {
    pub fn new(
        substitution: f64,
        mean_values: DVector<f64>,
        budget: f64,
        outside_good: bool,
    ) -> Result<Self> {
        if !substitution.is_finite() || substitution <= 1.0 {
            return Err(MergerError::invalid_input(
                "CES substitution",
                format!("elasticity of substitution must exceed one, found {substitution}"),
            ));
        }
        if !budget.is_finite() || budget <= 0.0 {
            return Err(MergerError::invalid_input(
                "CES budget",
                format!("must be positive, found {budget}"),
            ));
        }
        Ok(Self {
            substitution,
            mean_values,
            budget,
            outside_good,
        })
    }

    /// Mean values and budget that reproduce observed revenues for a given `γ`.
    pub fn from_substitution(observation: &MarketObservation, substitution: f64) -> Result<Self> {
        require_positive_quantities(observation, "CES")?;
        let outside_share = observation.outside_share();
        let outside_good = observation.has_outside_good();
        let inside = 1.0 - outside_share;
        let revenue_shares = observation.revenue_shares() * inside;
        let budget = observation.revenues().sum() / inside;
        let offset = if outside_good { outside_share.ln() } else { 0.0 };

        let prices = observation.prices();
        let mean_values = DVector::from_fn(prices.len(), |j, _| {
            revenue_shares[j].ln() - offset - (1.0 - substitution) * prices[j].ln()
        });
        Self::new(substitution, mean_values, budget, outside_good)
    }

    /// Fits `γ` to the observed margins over `θ = ln(γ - 1)`.
    pub fn calibrate(
        observation: &MarketObservation,
        ownership: &OwnershipMatrix,
        options: &CalibrationOptions,
    ) -> Result<(Self, CalibrationSummary)> {
        let anchor = require_margin(observation, "CES")?;
        require_positive_quantities(observation, "CES")?;

        let start = match supplied_start(options, 1)? {
            Some(start) => start[0],
            None => {
                // Single-product firm: margin = 1 / (γ (1 - r) + r).
                let inside = 1.0 - observation.outside_share();
                let share = observation.revenue_shares()[anchor] * inside;
                let margin = observation.margins()[anchor].unwrap_or(0.0);
                ((1.0 / margin - share) / (1.0 - share)).max(1.5)
            }
        };
        if !start.is_finite() || start <= 1.0 {
            return Err(MergerError::invalid_input(
                "CES start",
                format!("substitution start must exceed one, found {start}"),
            ));
        }

        let objective = |theta: &[f64]| -> Result<f64> {
            let model = Self::from_substitution(observation, 1.0 + theta[0].exp())?;
            let implied = implied_margins(&model, observation.prices(), ownership)?;
            Ok(margin_deviation(observation, &implied))
        };
        let mut summary = minimize("CES", objective, vec![(start - 1.0).ln()], options)?;

        let substitution = 1.0 + summary.parameters[0].exp();
        summary.parameters = vec![substitution];
        let model = Self::from_substitution(observation, substitution)?;
        Ok((model, summary))
    }

    /// Elasticity of substitution `γ`.
    pub fn substitution(&self) -> f64 {
        self.substitution
    }

    pub fn mean_values(&self) -> &DVector<f64> {
        &self.mean_values
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    pub fn has_outside_good(&self) -> bool {
        self.outside_good
    }

    /// Revenue shares of the total budget at `prices`.
    pub fn revenue_shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        check_prices(prices, self.product_count())?;
        let exponents = &self.mean_values + prices.map(f64::ln) * (1.0 - self.substitution);
        normalized_exponentials(&exponents, self.outside_good)
    }
}

impl DemandSystem for CesDemand {
    fn name(&self) -> &'static str {
        "CES"
    }

    fn product_count(&self) -> usize {
        self.mean_values.len()
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        let shares = self.revenue_shares(prices)?;
        Ok(shares.component_div(prices) * self.budget)
    }

    fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        self.revenue_shares(prices)
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let elasticities = self.elasticities(prices)?;
        let quantities = self.quantities(prices)?;
        let k = quantities.len();
        Ok(DMatrix::from_fn(k, k, |i, j| {
            elasticities[(i, j)] * quantities[i] / prices[j]
        }))
    }

    /// `ε_ij = -γ δ_ij + (γ - 1) r_j`.
    fn elasticities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let shares = self.revenue_shares(prices)?;
        let k = shares.len();
        let gamma = self.substitution;
        Ok(DMatrix::from_fn(k, k, |i, j| {
            let own = if i == j { gamma } else { 0.0 };
            (gamma - 1.0) * shares[j] - own
        }))
    }

    fn restrict(&self, active: &[usize]) -> Self {
        Self {
            substitution: self.substitution,
            mean_values: self.mean_values.select_rows(active),
            budget: self.budget,
            outside_good: self.outside_good,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn recovers_the_substitution_elasticity() {
        let truth = CesDemand::new(3.0, DVector::from_vec(vec![0.4, 0.1, -0.2]), 5_000.0, true)
            .unwrap();
        let prices = DVector::from_vec(vec![4.0, 3.0, 5.0]);
        let owner = OwnershipMatrix::single_product_firms(3);
        let quantities = truth.quantities(&prices).unwrap();
        let margins = implied_margins(&truth, &prices, &owner).unwrap();
        let outside = 1.0 - truth.revenue_shares(&prices).unwrap().sum();
        let market_size = quantities.sum() / (1.0 - outside);

        let observation = MarketObservation::builder(prices.clone(), quantities.clone())
            .observed_margins(margins.as_slice())
            .market_size(market_size)
            .build()
            .unwrap();
        let (model, summary) =
            CesDemand::calibrate(&observation, &owner, &CalibrationOptions::default()).unwrap();

        assert_relative_eq!(model.substitution(), 3.0, epsilon = 1e-4);
        assert_relative_eq!(summary.parameters[0], model.substitution());
        assert_relative_eq!(model.budget(), 5_000.0, epsilon = 1e-6);
        assert_relative_eq!(model.quantities(&prices).unwrap(), quantities, epsilon = 1e-6);
    }

    #[test]
    fn single_product_margin_follows_closed_form() {
        let model = CesDemand::new(4.0, DVector::from_vec(vec![0.0, 0.0]), 100.0, false).unwrap();
        let prices = DVector::from_vec(vec![1.0, 1.0]);
        let owner = OwnershipMatrix::single_product_firms(2);
        let margins = implied_margins(&model, &prices, &owner).unwrap();
        // r = 0.5: margin = 1 / (γ (1 - r) + r).
        assert_relative_eq!(margins[0], 1.0 / (4.0 * 0.5 + 0.5), epsilon = 1e-12);
    }

    #[test]
    fn rejects_substitution_below_one() {
        let result = CesDemand::new(0.8, DVector::from_vec(vec![0.0]), 10.0, false);
        assert!(matches!(result, Err(MergerError::InputValidation { .. })));
    }
}
