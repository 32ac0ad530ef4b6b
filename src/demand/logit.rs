//! Multinomial logit demand with a common price coefficient.

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

/// Logit demand: `q_j = M s_j` with `s_j ∝ exp(δ_j + α p_j)`.
///
/// With an outside good its utility is normalized to zero, so the choice
/// shares of inside products sum to less than one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogitDemand {
    price_coefficient: f64,
    mean_values: DVector<f64>,
    market_size: f64,
    outside_good: bool,
}

impl LogitDemand {
    pub fn new(
        price_coefficient: f64,
        mean_values: DVector<f64>,
        market_size: f64,
        outside_good: bool,
    ) -> Result<Self> {
        if !price_coefficient.is_finite() || price_coefficient >= 0.0 {
            return Err(MergerError::invalid_input(
                "logit price coefficient",
                format!("must be negative, found {price_coefficient}"),
            ));
        }
        if !market_size.is_finite() || market_size <= 0.0 {
            return Err(MergerError::invalid_input(
                "logit market size",
                format!("must be positive, found {market_size}"),
            ));
        }
        Ok(Self {
            price_coefficient,
            mean_values,
            market_size,
            outside_good,
        })
    }

    /// Mean utilities that reproduce the observed shares for a given `α`.
    pub fn from_price_coefficient(
        observation: &MarketObservation,
        price_coefficient: f64,
    ) -> Result<Self> {
        require_positive_quantities(observation, "Logit")?;
        let outside_good = observation.has_outside_good();
        let shares = observation.market_shares();
        let offset = if outside_good {
            observation.outside_share().ln()
        } else {
            0.0
        };
        let prices = observation.prices();
        let mean_values = DVector::from_fn(shares.len(), |j, _| {
            shares[j].ln() - offset - price_coefficient * prices[j]
        });
        let market_size = observation
            .market_size()
            .unwrap_or_else(|| observation.inside_quantity());
        Self::new(price_coefficient, mean_values, market_size, outside_good)
    }

    /// Fits `α` to the observed margins; mean utilities then match shares exactly.
    ///
    /// The optimizer works on `θ = ln(-α)`. The default start treats the first
    /// product with an observed margin as a single-product firm.
    pub fn calibrate(
        observation: &MarketObservation,
        ownership: &OwnershipMatrix,
        options: &CalibrationOptions,
    ) -> Result<(Self, CalibrationSummary)> {
        let anchor = require_margin(observation, "Logit")?;
        require_positive_quantities(observation, "Logit")?;

        let start = match supplied_start(options, 1)? {
            Some(start) => start[0],
            None => {
                let share = observation.market_shares()[anchor];
                let markup = observation.absolute_margins()[anchor].unwrap_or(0.0);
                -1.0 / (markup * (1.0 - share))
            }
        };
        if !start.is_finite() || start >= 0.0 {
            return Err(MergerError::invalid_input(
                "logit start",
                format!("price coefficient start must be negative and finite, found {start}"),
            ));
        }

        let objective = |theta: &[f64]| -> Result<f64> {
            let model = Self::from_price_coefficient(observation, -theta[0].exp())?;
            let implied = implied_margins(&model, observation.prices(), ownership)?;
            Ok(margin_deviation(observation, &implied))
        };
        let mut summary = minimize("Logit", objective, vec![(-start).ln()], options)?;

        let price_coefficient = -summary.parameters[0].exp();
        summary.parameters = vec![price_coefficient];
        let model = Self::from_price_coefficient(observation, price_coefficient)?;
        Ok((model, summary))
    }

    pub fn price_coefficient(&self) -> f64 {
        self.price_coefficient
    }

    pub fn mean_values(&self) -> &DVector<f64> {
        &self.mean_values
    }

    pub fn market_size(&self) -> f64 {
        self.market_size
    }

    pub fn has_outside_good(&self) -> bool {
        self.outside_good
    }

    fn choice_shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        check_prices(prices, self.product_count())?;
        let utilities = &self.mean_values + prices * self.price_coefficient;
        normalized_exponentials(&utilities, self.outside_good)
    }
}

impl DemandSystem for LogitDemand {
    fn name(&self) -> &'static str {
        "Logit"
    }

    fn product_count(&self) -> usize {
        self.mean_values.len()
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.choice_shares(prices)? * self.market_size)
    }

    /// Choice probabilities, including the outside good's complement.
    fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        self.choice_shares(prices)
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let shares = self.choice_shares(prices)?;
        let k = shares.len();
        let scale = self.market_size * self.price_coefficient;
        Ok(DMatrix::from_fn(k, k, |i, j| {
            let own = if i == j { 1.0 } else { 0.0 };
            scale * shares[i] * (own - shares[j])
        }))
    }

    fn restrict(&self, active: &[usize]) -> Self {
        Self {
            price_coefficient: self.price_coefficient,
            mean_values: self.mean_values.select_rows(active),
            market_size: self.market_size,
            outside_good: self.outside_good,
        }
    }
}
