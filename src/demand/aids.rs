//! Almost ideal demand system with price-independent expenditure coefficients.
//!
//! Budget shares are `w = α + Γ ln p` with `Γ` symmetric and every row summing
//! to zero, so demand is homogeneous of degree zero and shares add up. Total
//! expenditure responds to the share-weighted price index through the market
//! elasticity `ε_M`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{
    check_prices, margin_deviation, require_margin, require_positive_quantities, supplied_start,
    DemandSystem, LogLinearDemand,
};
use crate::calibration::{minimize, CalibrationSummary};
use crate::costs::implied_margins;
use crate::data::MarketObservation;
use crate::diversion::DiversionMatrix;
use crate::error::{MergerError, Result};
use crate::options::CalibrationOptions;
use crate::ownership::OwnershipMatrix;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AidsDemand {
    intercepts: DVector<f64>,
    gamma: DMatrix<f64>,
    market_elasticity: f64,
    base_prices: DVector<f64>,
    base_shares: DVector<f64>,
    base_expenditure: f64,
}

impl AidsDemand {
    /// Builds the system around an observation: intercepts are chosen so that
    /// budget shares at observed prices equal observed revenue shares.
    pub fn from_gamma(
        observation: &MarketObservation,
        gamma: DMatrix<f64>,
        market_elasticity: f64,
    ) -> Result<Self> {
        let k = observation.product_count();
        if gamma.nrows() != k || gamma.ncols() != k {
            return Err(MergerError::dimension_mismatch(
                "AIDS coefficient dimension",
                k,
                gamma.nrows(),
            ));
        }
        check_market_elasticity(market_elasticity)?;

        let base_prices = observation.prices().clone();
        let base_shares = observation.revenue_shares();
        let intercepts = &base_shares - &gamma * base_prices.map(f64::ln);
        Ok(Self {
            intercepts,
            gamma,
            market_elasticity,
            base_prices,
            base_shares,
            base_expenditure: observation.revenues().sum(),
        })
    }

    /// Fits the off-diagonal price coefficients (and `ε_M` when not fixed) to
    /// observed margins and diversion ratios.
    ///
    /// Parameters are the upper-triangular entries of `Γ` in row order followed
    /// by `ε_M` when it is free; the diagonal follows from the row sums.
    pub fn calibrate(
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
        market_elasticity: Option<f64>,
        options: &CalibrationOptions,
    ) -> Result<(Self, CalibrationSummary)> {
        require_margin(observation, "AIDS")?;
        require_positive_quantities(observation, "AIDS")?;
        let k = observation.product_count();
        if diversion.dimension() != k {
            return Err(MergerError::dimension_mismatch(
                "diversion dimension",
                k,
                diversion.dimension(),
            ));
        }
        if let Some(fixed) = market_elasticity {
            check_market_elasticity(fixed)?;
        }

        let pairs = k * (k - 1) / 2;
        let free_elasticity = market_elasticity.is_none();
        let count = pairs + usize::from(free_elasticity);

        let natural_start = match supplied_start(options, count)? {
            Some(start) => start.to_vec(),
            None => {
                let elasticity = market_elasticity.unwrap_or(-1.0);
                let gamma = starting_gamma(observation, diversion, ownership, elasticity);
                let mut start = upper_triangle(&gamma);
                if free_elasticity {
                    start.push(elasticity);
                }
                start
            }
        };
        let mut start = natural_start;
        if free_elasticity {
            let last = start[pairs];
            if !last.is_finite() || last >= 0.0 {
                return Err(MergerError::invalid_input(
                    "AIDS start",
                    format!("market elasticity start must be negative, found {last}"),
                ));
            }
            start[pairs] = (-last).ln();
        }

        let decode = |theta: &[f64]| -> (DMatrix<f64>, f64) {
            let gamma = gamma_from_upper(k, &theta[..pairs]);
            let elasticity = match market_elasticity {
                Some(fixed) => fixed,
                None => -theta[pairs].exp(),
            };
            (gamma, elasticity)
        };

        let observed = normalized_diversions(diversion);
        let objective = |theta: &[f64]| -> Result<f64> {
            let (gamma, elasticity) = decode(theta);
            let model = Self::from_gamma(observation, gamma, elasticity)?;
            let prices = observation.prices();
            let implied = implied_margins(&model, prices, ownership)?;
            let implied_diversion = model.diversion_ratios(prices)?;
            let mut deviation = margin_deviation(observation, &implied);
            for i in 0..k {
                for j in (0..k).filter(|&j| j != i) {
                    deviation += (observed[(i, j)] - implied_diversion[(i, j)]).powi(2);
                }
            }
            Ok(deviation)
        };
        let mut summary = minimize("AIDS", objective, start, options)?;

        let (gamma, elasticity) = decode(summary.parameters.as_slice());
        let mut parameters = upper_triangle(&gamma);
        if free_elasticity {
            parameters.push(elasticity);
        }
        summary.parameters = parameters;
        let model = Self::from_gamma(observation, gamma, elasticity)?;
        Ok((model, summary))
    }

    pub fn intercepts(&self) -> &DVector<f64> {
        &self.intercepts
    }

    /// Price coefficients `Γ`.
    pub fn gamma(&self) -> &DMatrix<f64> {
        &self.gamma
    }

    pub fn market_elasticity(&self) -> f64 {
        self.market_elasticity
    }

    /// Budget shares `α + Γ ln p`.
    pub fn budget_shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        check_prices(prices, self.product_count())?;
        Ok(&self.intercepts + &self.gamma * prices.map(f64::ln))
    }

    /// Total expenditure at `prices`, anchored at the observed expenditure.
    pub fn expenditure(&self, prices: &DVector<f64>) -> Result<f64> {
        check_prices(prices, self.product_count())?;
        let index: f64 = self
            .base_shares
            .iter()
            .zip(prices.iter().zip(self.base_prices.iter()))
            .map(|(share, (price, base))| share * (price / base).ln())
            .sum();
        let expenditure = self.base_expenditure * ((1.0 + self.market_elasticity) * index).exp();
        if !expenditure.is_finite() {
            return Err(MergerError::NumericalError {
                context: "AIDS expenditure",
            });
        }
        Ok(expenditure)
    }
}

impl DemandSystem for AidsDemand {
    fn name(&self) -> &'static str {
        "AIDS"
    }

    fn product_count(&self) -> usize {
        self.intercepts.len()
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        let shares = self.budget_shares(prices)?;
        let expenditure = self.expenditure(prices)?;
        Ok(shares.component_div(prices) * expenditure)
    }

    fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        self.budget_shares(prices)
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let elasticities = self.elasticities(prices)?;
        let quantities = self.quantities(prices)?;
        let k = quantities.len();
        Ok(DMatrix::from_fn(k, k, |i, j| {
            elasticities[(i, j)] * quantities[i] / prices[j]
        }))
    }

    /// `ε_ij = Γ_ij / w_i - δ_ij + (1 + ε_M) w0_j`.
    fn elasticities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let shares = self.budget_shares(prices)?;
        if shares.iter().any(|share| *share == 0.0) {
            return Err(MergerError::NumericalError {
                context: "AIDS elasticities",
            });
        }
        let k = shares.len();
        let income = 1.0 + self.market_elasticity;
        Ok(DMatrix::from_fn(k, k, |i, j| {
            let own = if i == j { 1.0 } else { 0.0 };
            self.gamma[(i, j)] / shares[i] - own + income * self.base_shares[j]
        }))
    }

    fn restrict(&self, active: &[usize]) -> Self {
        Self {
            intercepts: self.intercepts.select_rows(active),
            gamma: self.gamma.select_rows(active).select_columns(active),
            market_elasticity: self.market_elasticity,
            base_prices: self.base_prices.select_rows(active),
            base_shares: self.base_shares.select_rows(active),
            base_expenditure: self.base_expenditure,
        }
    }
}

fn check_market_elasticity(value: f64) -> Result<()> {
    if !value.is_finite() || value >= 0.0 {
        return Err(MergerError::invalid_input(
            "market elasticity",
            format!("must be negative, found {value}"),
        ));
    }
    Ok(())
}

/// Symmetric `Γ` from its upper triangle; each diagonal entry balances its row.
fn gamma_from_upper(k: usize, upper: &[f64]) -> DMatrix<f64> {
    let mut gamma = DMatrix::zeros(k, k);
    let mut values = upper.iter();
    for i in 0..k {
        for j in i + 1..k {
            let value = values.next().copied().unwrap_or(0.0);
            gamma[(i, j)] = value;
            gamma[(j, i)] = value;
        }
    }
    for i in 0..k {
        gamma[(i, i)] = -gamma.row(i).sum();
    }
    gamma
}

fn upper_triangle(gamma: &DMatrix<f64>) -> Vec<f64> {
    let k = gamma.nrows();
    (0..k)
        .flat_map(|i| (i + 1..k).map(move |j| (i, j)))
        .map(|(i, j)| gamma[(i, j)])
        .collect()
}

/// Observed diversions rescaled so that the diagonal is exactly `-1`.
fn normalized_diversions(diversion: &DiversionMatrix) -> DMatrix<f64> {
    let matrix = diversion.matrix();
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| {
        matrix[(i, j)] / -matrix[(i, i)]
    })
}

/// Start from the constant elasticities a log-linear system would imply,
/// translated to AIDS coefficients at observed shares and symmetrized.
/// Falls back to `Γ_ij = w_i w_j` when the log-linear system is unavailable.
fn starting_gamma(
    observation: &MarketObservation,
    diversion: &DiversionMatrix,
    ownership: &OwnershipMatrix,
    market_elasticity: f64,
) -> DMatrix<f64> {
    let k = observation.product_count();
    let shares = observation.revenue_shares();
    let Ok((loglinear, _)) = LogLinearDemand::calibrate(observation, diversion, ownership) else {
        return DMatrix::from_fn(k, k, |i, j| shares[i] * shares[j]);
    };

    let elasticities = loglinear.elasticity_matrix();
    let income = 1.0 + market_elasticity;
    let raw = DMatrix::from_fn(k, k, |i, j| {
        let own = if i == j { 1.0 } else { 0.0 };
        shares[i] * (elasticities[(i, j)] + own - income * shares[j])
    });
    (&raw + raw.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn observation() -> MarketObservation {
        MarketObservation::builder(
            DVector::from_vec(vec![2.0, 2.0, 2.0]),
            DVector::from_vec(vec![300.0, 200.0, 100.0]),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn gamma_rows_balance() {
        let gamma = gamma_from_upper(3, &[0.05, 0.03, 0.04]);
        for i in 0..3 {
            assert_relative_eq!(gamma.row(i).sum(), 0.0, epsilon = 1e-15);
        }
        assert_eq!(gamma, gamma.transpose());
        assert_eq!(upper_triangle(&gamma), vec![0.05, 0.03, 0.04]);
    }

    #[test]
    fn proportional_price_increase_moves_quantities_by_market_elasticity() {
        let gamma = gamma_from_upper(3, &[0.05, 0.03, 0.04]);
        let model = AidsDemand::from_gamma(&observation(), gamma, -1.5).unwrap();
        let elasticities = model.elasticities(observation().prices()).unwrap();
        for i in 0..3 {
            assert_relative_eq!(elasticities.row(i).sum(), -1.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn recovers_coefficients_from_margins_and_diversions() {
        let base = observation();
        let truth = AidsDemand::from_gamma(&base, gamma_from_upper(3, &[0.05, 0.03, 0.04]), -1.0)
            .unwrap();
        let owner = OwnershipMatrix::single_product_firms(3);
        let margins = implied_margins(&truth, base.prices(), &owner).unwrap();
        let diversion =
            DiversionMatrix::validated(truth.diversion_ratios(base.prices()).unwrap()).unwrap();

        let observation =
            MarketObservation::builder(base.prices().clone(), base.quantities().clone())
                .observed_margins(margins.as_slice())
                .build()
                .unwrap();
        let (model, summary) = AidsDemand::calibrate(
            &observation,
            &diversion,
            &owner,
            Some(-1.0),
            &CalibrationOptions::default(),
        )
        .unwrap();

        assert!(summary.objective < 1e-8);
        assert_eq!(summary.parameters.len(), 3);
        assert_relative_eq!(model.gamma().clone(), truth.gamma().clone(), epsilon = 1e-3);
        assert_relative_eq!(
            model.quantities(base.prices()).unwrap(),
            base.quantities().clone(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn rejects_non_negative_market_elasticity() {
        let result = AidsDemand::from_gamma(&observation(), DMatrix::zeros(3, 3), 0.5);
        assert!(matches!(result, Err(MergerError::InputValidation { .. })));
    }
}
