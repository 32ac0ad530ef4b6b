//! Log-linear (constant elasticity) demand `ln q = a + E ln p`.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{
    check_prices, diversion_weighted_markups, margin_deviation, require_positive_quantities,
    DemandSystem, LinearDemand,
};
use crate::calibration::CalibrationSummary;
use crate::costs::implied_margins;
use crate::data::MarketObservation;
use crate::diversion::DiversionMatrix;
use crate::error::{MergerError, Result};
use crate::ownership::OwnershipMatrix;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogLinearDemand {
    intercepts: DVector<f64>,
    /// `E[i, j] = ∂ln q_i/∂ln p_j`, constant in prices.
    elasticities: DMatrix<f64>,
}

impl LogLinearDemand {
    pub fn new(intercepts: DVector<f64>, elasticities: DMatrix<f64>) -> Result<Self> {
        let k = intercepts.len();
        if elasticities.nrows() != k || elasticities.ncols() != k {
            return Err(MergerError::dimension_mismatch(
                "elasticity matrix dimension",
                k,
                elasticities.nrows(),
            ));
        }
        Ok(Self {
            intercepts,
            elasticities,
        })
    }

    pub fn intercepts(&self) -> &DVector<f64> {
        &self.intercepts
    }

    /// The constant elasticity matrix.
    pub fn elasticity_matrix(&self) -> &DMatrix<f64> {
        &self.elasticities
    }

    /// Closed-form calibration from margins and diversions.
    ///
    /// The own elasticity is `p_i / Σ_j Ω_ij D_ij m_j`; cross elasticities follow
    /// from `E[j, i] = -D[i, j] E[i, i] q_i / q_j`. Quantities must be positive.
    ///
    /// When some margins are unobserved, the Jacobian at the observed prices
    /// is taken from the symmetric linear fit and converted to elasticities.
    pub fn calibrate(
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
    ) -> Result<(Self, CalibrationSummary)> {
        let k = observation.product_count();
        let prices = observation.prices();
        let quantities = observation.quantities();
        require_positive_quantities(observation, "log-linear")?;
        if !observation.all_margins_observed() {
            debug!("log-linear calibration with missing margins uses an anchored symmetric fit");
            return Self::calibrate_anchored(observation, diversion, ownership);
        }

        let sums = diversion_weighted_markups(observation, diversion, ownership)?;
        let mut elasticities = DMatrix::zeros(k, k);
        for i in 0..k {
            let own = prices[i] / sums[i];
            for j in 0..k {
                elasticities[(j, i)] = -diversion.get(i, j) * own * quantities[i] / quantities[j];
            }
        }

        let log_prices = prices.map(f64::ln);
        let intercepts = quantities.map(f64::ln) - &elasticities * log_prices;
        let model = Self {
            intercepts,
            elasticities,
        };

        let implied = implied_margins(&model, prices, ownership)?;
        let objective = margin_deviation(observation, &implied);
        let own = model.elasticities.diagonal().iter().copied().collect();
        Ok((model, CalibrationSummary::closed_form(own, objective)))
    }

    /// `E[i, j] = B[i, j] p_j / q_i` with `B` the symmetric linear slopes, so
    /// both systems share quantities, derivatives and margins at the observation.
    fn calibrate_anchored(
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
    ) -> Result<(Self, CalibrationSummary)> {
        let (linear, summary) =
            LinearDemand::calibrate_symmetric(observation, diversion, ownership)?;
        let prices = observation.prices();
        let quantities = observation.quantities();
        let k = observation.product_count();
        let elasticities = DMatrix::from_fn(k, k, |i, j| {
            linear.slopes()[(i, j)] * prices[j] / quantities[i]
        });
        let intercepts = quantities.map(f64::ln) - &elasticities * prices.map(f64::ln);
        let model = Self {
            intercepts,
            elasticities,
        };
        Ok((model, summary))
    }
}

impl DemandSystem for LogLinearDemand {
    fn name(&self) -> &'static str {
        "LogLinear"
    }

    fn product_count(&self) -> usize {
        self.intercepts.len()
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        check_prices(prices, self.product_count())?;
        let log_quantities = &self.intercepts + &self.elasticities * prices.map(f64::ln);
        let quantities = log_quantities.map(f64::exp);
        if quantities.iter().any(|q| !q.is_finite()) {
            return Err(MergerError::NumericalError {
                context: "log-linear quantities",
            });
        }
        Ok(quantities)
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let quantities = self.quantities(prices)?;
        let k = quantities.len();
        Ok(DMatrix::from_fn(k, k, |i, j| {
            self.elasticities[(i, j)] * quantities[i] / prices[j]
        }))
    }

    fn elasticities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        check_prices(prices, self.product_count())?;
        Ok(self.elasticities.clone())
    }

    fn restrict(&self, active: &[usize]) -> Self {
        Self {
            intercepts: self.intercepts.select_rows(active),
            elasticities: self.elasticities.select_rows(active).select_columns(active),
        }
    }
}
