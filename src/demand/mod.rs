//! Demand systems: the capability set every variant implements and the registry
//! that selects a variant at construction time.
//!
//! Each variant knows how to
//!
//! - predict quantities and shares at arbitrary prices,
//! - differentiate demand (`J[i, j] = ∂q_i/∂p_j`) and report elasticities,
//! - evaluate the Bertrand first-order conditions, and
//! - calibrate its parameters from a [`MarketObservation`].
//!
//! The merger pipeline only talks to [`DemandSystem`] and [`DemandSpec`], so a new
//! variant is added by implementing those operations rather than by touching the
//! pipeline.

mod aids;
mod ces;
mod linear;
mod logit;
mod loglinear;

pub use aids::AidsDemand;
pub use ces::CesDemand;
pub use linear::LinearDemand;
pub use logit::LogitDemand;
pub use loglinear::LogLinearDemand;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationSummary;
use crate::costs::first_order_matrix;
use crate::data::MarketObservation;
use crate::diversion::DiversionMatrix;
use crate::error::{MergerError, Result};
use crate::options::CalibrationOptions;
use crate::ownership::OwnershipMatrix;

/// Operations shared by every calibrated demand system.
pub trait DemandSystem {
    /// Short human-readable name of the variant.
    fn name(&self) -> &'static str;

    /// Number of products the parameters describe.
    fn product_count(&self) -> usize;

    /// Quantities demanded at `prices`.
    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>>;

    /// Shares in the variant's natural unit (quantity, choice or budget shares).
    ///
    /// The default returns quantity shares of the inside total.
    fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        let quantities = self.quantities(prices)?;
        let total = quantities.sum();
        if total == 0.0 {
            return Err(MergerError::NumericalError {
                context: "share normalization",
            });
        }
        Ok(quantities / total)
    }

    /// Demand derivatives `J[i, j] = ∂q_i/∂p_j` at `prices`.
    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Price elasticities `E[i, j] = ∂ln q_i/∂ln p_j` at `prices`.
    fn elasticities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let quantities = self.quantities(prices)?;
        let jacobian = self.jacobian(prices)?;
        let k = quantities.len();
        Ok(DMatrix::from_fn(k, k, |i, j| {
            jacobian[(i, j)] * prices[j] / quantities[i]
        }))
    }

    /// Diversion ratios implied by the model: `D[i, j] = -J[j, i] / J[i, i]`.
    fn diversion_ratios(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let jacobian = self.jacobian(prices)?;
        let k = jacobian.nrows();
        Ok(DMatrix::from_fn(k, k, |i, j| {
            -jacobian[(j, i)] / jacobian[(i, i)]
        }))
    }

    /// Bertrand first-order conditions `diag(Ω) ∘ q + (Ω ∘ Jᵀ)(p - c)`.
    ///
    /// Every entry is zero at an equilibrium.
    fn first_order_conditions(
        &self,
        prices: &DVector<f64>,
        costs: &DVector<f64>,
        ownership: &OwnershipMatrix,
    ) -> Result<DVector<f64>> {
        let quantities = self.quantities(prices)?;
        let jacobian = self.jacobian(prices)?;
        let system = first_order_matrix(ownership, &jacobian);
        let own = ownership.matrix().diagonal().component_mul(&quantities);
        Ok(own + system * (prices - costs))
    }

    /// Model restricted to the `active` products, in the given order.
    fn restrict(&self, active: &[usize]) -> Self
    where
        Self: Sized;
}

/// Fails unless `prices` holds one positive entry per product.
pub(crate) fn check_prices(prices: &DVector<f64>, product_count: usize) -> Result<()> {
    if prices.len() != product_count {
        return Err(MergerError::dimension_mismatch(
            "prices length",
            product_count,
            prices.len(),
        ));
    }
    if prices.iter().any(|price| !price.is_finite() || *price <= 0.0) {
        return Err(MergerError::NumericalError {
            context: "price evaluation",
        });
    }
    Ok(())
}

/// Caller-supplied starting values, checked against the number of free parameters.
pub(crate) fn supplied_start(
    options: &CalibrationOptions,
    expected: usize,
) -> Result<Option<&[f64]>> {
    match &options.start {
        None => Ok(None),
        Some(start) if start.len() != expected => Err(MergerError::dimension_mismatch(
            "calibration start length",
            expected,
            start.len(),
        )),
        Some(start) => Ok(Some(start.as_slice())),
    }
}

/// Fails unless every observed quantity is strictly positive.
pub(crate) fn require_positive_quantities(
    observation: &MarketObservation,
    variant: &str,
) -> Result<()> {
    match observation.quantities().iter().position(|q| *q <= 0.0) {
        Some(index) => Err(MergerError::invalid_input(
            "quantities",
            format!("{variant} demand needs a positive quantity for product {index}"),
        )),
        None => Ok(()),
    }
}

/// `exp(x_j) / (w_0 + Σ_k exp(x_k))` evaluated with the log-sum-exp shift,
/// where the outside weight `w_0` is one when `outside` is set and zero otherwise.
pub(crate) fn normalized_exponentials(
    exponents: &DVector<f64>,
    outside: bool,
) -> Result<DVector<f64>> {
    let mut shift = exponents.max();
    if outside {
        shift = shift.max(0.0);
    }
    let scaled = exponents.map(|value| (value - shift).exp());
    let outside_weight = if outside { (-shift).exp() } else { 0.0 };
    let total = scaled.sum() + outside_weight;
    if !total.is_finite() || total <= 0.0 {
        return Err(MergerError::NumericalError {
            context: "share normalization",
        });
    }
    Ok(scaled / total)
}

/// Computes `Σ_j Ω_ij D_ij m_j` per product, with `m_j` the absolute margin.
///
/// This is the own-price scaling shared by the closed-form calibrations: for
/// product `i` the first-order condition pins `∂q_i/∂p_i = q_i / sum_i`.
/// Every margin of a product jointly owned with `i` must be observed.
pub(crate) fn diversion_weighted_markups(
    observation: &MarketObservation,
    diversion: &DiversionMatrix,
    ownership: &OwnershipMatrix,
) -> Result<DVector<f64>> {
    let k = observation.product_count();
    if diversion.dimension() != k {
        return Err(MergerError::dimension_mismatch(
            "diversion dimension",
            k,
            diversion.dimension(),
        ));
    }
    if ownership.dimension() != k {
        return Err(MergerError::dimension_mismatch(
            "ownership dimension",
            k,
            ownership.dimension(),
        ));
    }

    let margins = observation.absolute_margins();
    let mut sums = DVector::zeros(k);
    for i in 0..k {
        let mut sum = 0.0;
        for (j, margin) in margins.iter().enumerate() {
            let weight = ownership.get(i, j) * diversion.get(i, j);
            if weight == 0.0 {
                continue;
            }
            let margin = margin.ok_or_else(|| {
                MergerError::invalid_input(
                    "margins",
                    format!(
                        "margin of product {j} is required to calibrate product {i} \
                         without symmetry restrictions"
                    ),
                )
            })?;
            sum += weight * margin;
        }
        if sum.abs() < 1e-12 {
            return Err(MergerError::singular("own-price calibration"));
        }
        if sum > 0.0 {
            return Err(MergerError::invalid_input(
                "margins",
                format!("margins and diversions imply upward-sloping demand for product {i}"),
            ));
        }
        sums[i] = sum;
    }
    Ok(sums)
}

/// Sum of squared deviations between observed and implied relative margins,
/// over products whose margin is observed.
pub(crate) fn margin_deviation(observation: &MarketObservation, implied: &DVector<f64>) -> f64 {
    observation
        .margins()
        .iter()
        .zip(implied.iter())
        .filter_map(|(observed, implied)| observed.map(|m| (m - implied).powi(2)))
        .sum()
}

/// Fails unless at least one margin is observed, returning the first such product.
pub(crate) fn require_margin(observation: &MarketObservation, variant: &str) -> Result<usize> {
    observation.first_observed_margin().ok_or_else(|| {
        MergerError::invalid_input(
            "margins",
            format!("{variant} calibration needs at least one observed margin"),
        )
    })
}

/// Demand system selected by the caller, before calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DemandSpec {
    /// `q = a + B p`. With `symmetry`, `B` is constrained to be symmetric.
    ///
    /// Missing margins imply the symmetric fit whatever `symmetry` says.
    Linear { symmetry: bool },
    /// `ln q = a + E ln p`.
    ///
    /// Missing margins imply an anchored fit with a symmetric Jacobian at the
    /// observed prices.
    LogLinear,
    /// Multinomial logit with a common price coefficient.
    Logit,
    /// Constant elasticity of substitution over revenue shares.
    Ces,
    /// Almost ideal demand system with symmetric, adding-up price coefficients.
    ///
    /// `market_elasticity` fixes the aggregate elasticity; `None` calibrates it.
    Aids { market_elasticity: Option<f64> },
}

impl DemandSpec {
    /// Linear demand without symmetry restrictions.
    ///
    /// With some margins unobserved the slopes are still calibrated
    /// symmetric; see [`LinearDemand::calibrate`].
    pub fn linear() -> Self {
        DemandSpec::Linear { symmetry: false }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DemandSpec::Linear { .. } => "Linear",
            DemandSpec::LogLinear => "LogLinear",
            DemandSpec::Logit => "Logit",
            DemandSpec::Ces => "CES",
            DemandSpec::Aids { .. } => "AIDS",
        }
    }

    /// Calibrates the selected variant so that the pre-merger first-order
    /// conditions reproduce the observed margins.
    pub fn calibrate(
        &self,
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
        options: &CalibrationOptions,
    ) -> Result<(DemandModel, CalibrationSummary)> {
        match self {
            DemandSpec::Linear { symmetry } => {
                LinearDemand::calibrate(observation, diversion, ownership, *symmetry)
                    .map(|(model, summary)| (DemandModel::Linear(model), summary))
            }
            DemandSpec::LogLinear => LogLinearDemand::calibrate(observation, diversion, ownership)
                .map(|(model, summary)| (DemandModel::LogLinear(model), summary)),
            DemandSpec::Logit => LogitDemand::calibrate(observation, ownership, options)
                .map(|(model, summary)| (DemandModel::Logit(model), summary)),
            DemandSpec::Ces => CesDemand::calibrate(observation, ownership, options)
                .map(|(model, summary)| (DemandModel::Ces(model), summary)),
            DemandSpec::Aids { market_elasticity } => AidsDemand::calibrate(
                observation,
                diversion,
                ownership,
                *market_elasticity,
                options,
            )
            .map(|(model, summary)| (DemandModel::Aids(model), summary)),
        }
    }
}

/// Calibrated demand parameters of any supported variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DemandModel {
    Linear(LinearDemand),
    LogLinear(LogLinearDemand),
    Logit(LogitDemand),
    Ces(CesDemand),
    Aids(AidsDemand),
}

macro_rules! delegate {
    ($self:expr, $model:ident => $call:expr) => {
        match $self {
            DemandModel::Linear($model) => $call,
            DemandModel::LogLinear($model) => $call,
            DemandModel::Logit($model) => $call,
            DemandModel::Ces($model) => $call,
            DemandModel::Aids($model) => $call,
        }
    };
}

impl DemandSystem for DemandModel {
    fn name(&self) -> &'static str {
        delegate!(self, model => model.name())
    }

    fn product_count(&self) -> usize {
        delegate!(self, model => model.product_count())
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        delegate!(self, model => model.quantities(prices))
    }

    fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        delegate!(self, model => model.shares(prices))
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        delegate!(self, model => model.jacobian(prices))
    }

    fn elasticities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        delegate!(self, model => model.elasticities(prices))
    }

    fn restrict(&self, active: &[usize]) -> Self {
        match self {
            DemandModel::Linear(model) => DemandModel::Linear(model.restrict(active)),
            DemandModel::LogLinear(model) => DemandModel::LogLinear(model.restrict(active)),
            DemandModel::Logit(model) => DemandModel::Logit(model.restrict(active)),
            DemandModel::Ces(model) => DemandModel::Ces(model.restrict(active)),
            DemandModel::Aids(model) => DemandModel::Aids(model.restrict(active)),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::ownership::Ownership;

    fn observation() -> MarketObservation {
        MarketObservation::builder(
            DVector::from_vec(vec![2.9, 3.4, 2.2]),
            DVector::from_vec(vec![650.0, 998.0, 1801.0]),
        )
        .observed_margins(&[0.435, 0.417, 0.370])
        .build()
        .unwrap()
    }

    #[test]
    fn every_variant_reports_its_name_through_the_registry() {
        let observation = observation();
        let diversion = DiversionMatrix::from_shares(&observation.inside_shares()).unwrap();
        let owner = OwnershipMatrix::single_product_firms(3);
        let options = CalibrationOptions::default();
        for spec in [
            DemandSpec::linear(),
            DemandSpec::LogLinear,
            DemandSpec::Logit,
            DemandSpec::Ces,
            DemandSpec::Aids {
                market_elasticity: Some(-1.0),
            },
        ] {
            let (model, _) = spec
                .calibrate(&observation, &diversion, &owner, &options)
                .unwrap();
            assert_eq!(model.name(), spec.name());
            assert_eq!(model.product_count(), 3);
            let quantities = model.quantities(observation.prices()).unwrap();
            assert_relative_eq!(quantities, observation.quantities().clone(), epsilon = 1e-6);
        }
    }

    #[test]
    fn missing_co_owned_margin_is_reported() {
        let observation = MarketObservation::builder(
            DVector::from_vec(vec![2.9, 3.4, 2.2]),
            DVector::from_vec(vec![650.0, 998.0, 1801.0]),
        )
        .margins(vec![Some(0.435), None, Some(0.370)])
        .build()
        .unwrap();
        let diversion = DiversionMatrix::from_shares(&observation.inside_shares()).unwrap();
        let owner = Ownership::firms(["A", "A", "B"]).resolve(3).unwrap();
        let result = diversion_weighted_markups(&observation, &diversion, &owner);
        assert!(matches!(result, Err(MergerError::InputValidation { .. })));
    }

    #[test]
    fn first_order_conditions_vanish_at_recovered_costs() {
        let observation = observation();
        let diversion = DiversionMatrix::from_shares(&observation.inside_shares()).unwrap();
        let owner = OwnershipMatrix::single_product_firms(3);
        let (model, _) = DemandSpec::LogLinear
            .calibrate(&observation, &diversion, &owner, &CalibrationOptions::default())
            .unwrap();
        let costs =
            crate::costs::recover_costs(&model, observation.prices(), &owner, None).unwrap();
        let foc = model
            .first_order_conditions(observation.prices(), &costs, &owner)
            .unwrap();
        assert!(foc.amax() < 1e-8);
    }
}
