//! Product-level market observations and their validation.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{MergerError, Result};

/// Observed pre-merger market data for `k` products.
///
/// Prices are strictly positive, quantities non-negative and margins, when
/// present, lie in `[0, 1]`. Margins are relative: `(price - cost) / price`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketObservation {
    prices: DVector<f64>,
    quantities: DVector<f64>,
    margins: Vec<Option<f64>>,
    labels: Vec<String>,
    market_size: Option<f64>,
}

impl MarketObservation {
    /// Start building an observation from prices and quantities.
    pub fn builder(prices: DVector<f64>, quantities: DVector<f64>) -> MarketObservationBuilder {
        MarketObservationBuilder::new(prices, quantities)
    }

    /// Number of products in the market.
    pub fn product_count(&self) -> usize {
        self.prices.len()
    }

    pub fn prices(&self) -> &DVector<f64> {
        &self.prices
    }

    pub fn quantities(&self) -> &DVector<f64> {
        &self.quantities
    }

    /// Relative margins, `None` where unobserved.
    pub fn margins(&self) -> &[Option<f64>] {
        &self.margins
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Total market volume in units, including the outside good, when supplied.
    pub fn market_size(&self) -> Option<f64> {
        self.market_size
    }

    /// Whether an outside good absorbs part of the market.
    pub fn has_outside_good(&self) -> bool {
        self.market_size.is_some()
    }

    /// Sum of inside quantities.
    pub fn inside_quantity(&self) -> f64 {
        self.quantities.sum()
    }

    /// Quantity shares of the inside total; they always sum to one.
    pub fn inside_shares(&self) -> DVector<f64> {
        &self.quantities / self.inside_quantity()
    }

    /// Quantity shares of the whole market.
    ///
    /// Without a market size these equal [`inside_shares`](Self::inside_shares).
    pub fn market_shares(&self) -> DVector<f64> {
        let total = self.market_size.unwrap_or_else(|| self.inside_quantity());
        &self.quantities / total
    }

    /// Share of the market captured by the outside good (zero without one).
    pub fn outside_share(&self) -> f64 {
        match self.market_size {
            Some(size) => 1.0 - self.inside_quantity() / size,
            None => 0.0,
        }
    }

    /// Product revenues `p_j q_j`.
    pub fn revenues(&self) -> DVector<f64> {
        self.prices.component_mul(&self.quantities)
    }

    /// Revenue shares of inside expenditure.
    pub fn revenue_shares(&self) -> DVector<f64> {
        let revenues = self.revenues();
        let total = revenues.sum();
        revenues / total
    }

    /// Absolute margins `margin_j * p_j`, `None` where unobserved.
    pub fn absolute_margins(&self) -> Vec<Option<f64>> {
        self.margins
            .iter()
            .zip(self.prices.iter())
            .map(|(margin, price)| margin.map(|m| m * price))
            .collect()
    }

    /// Index of the first product with an observed margin.
    pub fn first_observed_margin(&self) -> Option<usize> {
        self.margins.iter().position(Option::is_some)
    }

    pub fn all_margins_observed(&self) -> bool {
        self.margins.iter().all(Option::is_some)
    }
}

/// Builder that validates dimensions and domain restrictions before constructing a
/// [`MarketObservation`].
#[derive(Debug)]
pub struct MarketObservationBuilder {
    prices: DVector<f64>,
    quantities: DVector<f64>,
    margins: Option<Vec<Option<f64>>>,
    labels: Option<Vec<String>>,
    market_size: Option<f64>,
}

impl MarketObservationBuilder {
    pub fn new(prices: DVector<f64>, quantities: DVector<f64>) -> Self {
        Self {
            prices,
            quantities,
            margins: None,
            labels: None,
            market_size: None,
        }
    }

    /// Sets relative margins; use `None` entries for unobserved products.
    pub fn margins(mut self, margins: Vec<Option<f64>>) -> Self {
        self.margins = Some(margins);
        self
    }

    /// Sets relative margins when every product's margin is observed.
    pub fn observed_margins(self, margins: &[f64]) -> Self {
        self.margins(margins.iter().copied().map(Some).collect())
    }

    pub fn labels<S: Into<String>>(mut self, labels: Vec<S>) -> Self {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the total market volume in units, introducing an outside good.
    pub fn market_size(mut self, size: f64) -> Self {
        self.market_size = Some(size);
        self
    }

    /// Finalizes construction after validating shapes and value ranges.
    pub fn build(self) -> Result<MarketObservation> {
        let k = self.prices.len();
        if k == 0 {
            return Err(MergerError::invalid_input(
                "market observation",
                "at least one product is required",
            ));
        }
        if self.quantities.len() != k {
            return Err(MergerError::dimension_mismatch(
                "quantities length",
                k,
                self.quantities.len(),
            ));
        }

        for (index, price) in self.prices.iter().enumerate() {
            if !price.is_finite() || *price <= 0.0 {
                return Err(MergerError::invalid_input(
                    "prices",
                    format!("price of product {index} must be positive, found {price}"),
                ));
            }
        }
        for (index, quantity) in self.quantities.iter().enumerate() {
            if !quantity.is_finite() || *quantity < 0.0 {
                return Err(MergerError::invalid_input(
                    "quantities",
                    format!("quantity of product {index} must be non-negative, found {quantity}"),
                ));
            }
        }
        let inside: f64 = self.quantities.sum();
        if inside <= 0.0 {
            return Err(MergerError::invalid_input(
                "quantities",
                "total quantity must be positive",
            ));
        }

        let margins = self.margins.unwrap_or_else(|| vec![None; k]);
        if margins.len() != k {
            return Err(MergerError::dimension_mismatch(
                "margins length",
                k,
                margins.len(),
            ));
        }
        for (index, margin) in margins.iter().enumerate() {
            if let Some(m) = margin {
                if !m.is_finite() || !(0.0..=1.0).contains(m) {
                    return Err(MergerError::invalid_input(
                        "margins",
                        format!("margin of product {index} must lie in [0, 1], found {m}"),
                    ));
                }
            }
        }

        let labels = self
            .labels
            .unwrap_or_else(|| (1..=k).map(|i| format!("Prod{i}")).collect());
        if labels.len() != k {
            return Err(MergerError::dimension_mismatch(
                "labels length",
                k,
                labels.len(),
            ));
        }

        if let Some(size) = self.market_size {
            if !size.is_finite() || size <= inside {
                return Err(MergerError::invalid_input(
                    "market size",
                    format!("market size must exceed the inside quantity {inside}, found {size}"),
                ));
            }
        }

        Ok(MarketObservation {
            prices: self.prices,
            quantities: self.quantities,
            margins,
            labels,
            market_size: self.market_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn builder_validates_and_derives_shares() {
        let observation = MarketObservation::builder(
            DVector::from_vec(vec![2.0, 4.0]),
            DVector::from_vec(vec![30.0, 10.0]),
        )
        .margins(vec![Some(0.5), None])
        .market_size(80.0)
        .build()
        .expect("valid observation");

        assert_eq!(observation.product_count(), 2);
        assert_eq!(observation.labels(), ["Prod1", "Prod2"]);
        assert_relative_eq!(observation.inside_shares()[0], 0.75, epsilon = 1e-12);
        assert_relative_eq!(observation.market_shares()[0], 0.375, epsilon = 1e-12);
        assert_relative_eq!(observation.outside_share(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(observation.revenue_shares()[1], 0.4, epsilon = 1e-12);
        assert_eq!(observation.absolute_margins(), vec![Some(1.0), None]);
        assert_eq!(observation.first_observed_margin(), Some(0));
    }

    #[test]
    fn builder_rejects_out_of_range_margin() {
        let result = MarketObservation::builder(
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![1.0, 1.0]),
        )
        .observed_margins(&[0.2, 1.3])
        .build();
        assert!(matches!(result, Err(MergerError::InputValidation { .. })));
    }

    #[test]
    fn builder_rejects_negative_quantity_and_length_mismatch() {
        let negative = MarketObservation::builder(
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![1.0, -1.0]),
        )
        .build();
        assert!(matches!(negative, Err(MergerError::InputValidation { .. })));

        let mismatch = MarketObservation::builder(
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![1.0]),
        )
        .build();
        assert!(matches!(
            mismatch,
            Err(MergerError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn market_size_must_exceed_inside_quantity() {
        let result = MarketObservation::builder(
            DVector::from_vec(vec![1.0]),
            DVector::from_vec(vec![10.0]),
        )
        .market_size(5.0)
        .build();
        assert!(matches!(result, Err(MergerError::InputValidation { .. })));
    }
}
