//! Linear demand `q = a + B p`.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{
    check_prices, diversion_weighted_markups, margin_deviation, require_margin, DemandSystem,
};
use crate::calibration::CalibrationSummary;
use crate::costs::{implied_margins, markups};
use crate::data::MarketObservation;
use crate::diversion::DiversionMatrix;
use crate::error::{MergerError, Result};
use crate::ownership::OwnershipMatrix;

/// Linear demand with intercepts `a` and slopes `B[i, j] = ∂q_i/∂p_j`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearDemand {
    intercepts: DVector<f64>,
    slopes: DMatrix<f64>,
}

impl LinearDemand {
    /// Creates a linear demand system from explicit parameters.
    pub fn new(intercepts: DVector<f64>, slopes: DMatrix<f64>) -> Result<Self> {
        let k = intercepts.len();
        if slopes.nrows() != k || slopes.ncols() != k {
            return Err(MergerError::dimension_mismatch(
                "slope matrix dimension",
                k,
                slopes.nrows(),
            ));
        }
        Ok(Self { intercepts, slopes })
    }

    pub fn intercepts(&self) -> &DVector<f64> {
        &self.intercepts
    }

    pub fn slopes(&self) -> &DMatrix<f64> {
        &self.slopes
    }

    /// Recovers slopes and intercepts from margins, diversions and ownership.
    ///
    /// Without `symmetry` the calibration is exact: column `i` of `B` is
    /// `-D[i, :]ᵀ · q_i / Σ_j Ω_ij D_ij m_j`. With `symmetry`, `B` is built
    /// symmetric around the first product with an observed margin and its
    /// scale is fitted to all observed margins by least squares.
    ///
    /// The exact form needs every margin, so a partially observed market is
    /// always calibrated with the symmetric fit.
    pub fn calibrate(
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
        symmetry: bool,
    ) -> Result<(Self, CalibrationSummary)> {
        if symmetry {
            return Self::calibrate_symmetric(observation, diversion, ownership);
        }
        if !observation.all_margins_observed() {
            debug!("linear calibration with missing margins falls back to symmetric slopes");
            return Self::calibrate_symmetric(observation, diversion, ownership);
        }

        let k = observation.product_count();
        let quantities = observation.quantities();
        let sums = diversion_weighted_markups(observation, diversion, ownership)?;

        let mut slopes = DMatrix::zeros(k, k);
        for i in 0..k {
            let own = quantities[i] / sums[i];
            for j in 0..k {
                slopes[(j, i)] = -diversion.get(i, j) * own;
            }
        }

        let model = Self::through_observation(observation, slopes);
        let implied = implied_margins(&model, observation.prices(), ownership)?;
        let objective = margin_deviation(observation, &implied);
        let own_slopes = model.slopes.diagonal().iter().copied().collect();
        Ok((model, CalibrationSummary::closed_form(own_slopes, objective)))
    }

    pub(crate) fn calibrate_symmetric(
        observation: &MarketObservation,
        diversion: &DiversionMatrix,
        ownership: &OwnershipMatrix,
    ) -> Result<(Self, CalibrationSummary)> {
        let k = observation.product_count();
        let anchor = require_margin(observation, "symmetric linear")?;

        // Slopes with B[anchor, anchor] = 1; the true matrix is a negative multiple.
        let mut unit = DMatrix::zeros(k, k);
        unit[(anchor, anchor)] = 1.0;
        for j in (0..k).filter(|&j| j != anchor) {
            let outward = diversion.get(anchor, j);
            let inward = diversion.get(j, anchor);
            if outward <= 0.0 || inward <= 0.0 {
                return Err(MergerError::singular("symmetric linear slopes"));
            }
            unit[(j, anchor)] = -outward;
            unit[(anchor, j)] = -outward;
            unit[(j, j)] = outward / inward;
        }
        for i in (0..k).filter(|&i| i != anchor) {
            for j in (i + 1..k).filter(|&j| j != anchor) {
                let cross = 0.5
                    * (-diversion.get(j, i) * unit[(j, j)] - diversion.get(i, j) * unit[(i, i)]);
                unit[(i, j)] = cross;
                unit[(j, i)] = cross;
            }
        }

        // Implied margins scale with 1 / scale, so the fit is a one-parameter regression.
        let unit_model = Self::through_observation(observation, unit.clone());
        let base = markups(&unit_model, observation.prices(), ownership)?
            .component_div(observation.prices());
        let (mut cross, mut norm) = (0.0, 0.0);
        for (observed, implied) in observation.margins().iter().zip(base.iter()) {
            if let Some(margin) = observed {
                cross += margin * implied;
                norm += implied * implied;
            }
        }
        let inverse_scale = cross / norm;
        if !inverse_scale.is_finite() || inverse_scale >= 0.0 {
            return Err(MergerError::Calibration {
                variant: "Linear",
                iterations: 0,
                objective: margin_deviation(observation, &base),
            });
        }

        let scale = 1.0 / inverse_scale;
        let model = Self::through_observation(observation, unit * scale);
        let objective = margin_deviation(observation, &(base * inverse_scale));
        Ok((model, CalibrationSummary::closed_form(vec![scale], objective)))
    }

    /// Completes `slopes` with the intercepts that reproduce observed quantities.
    fn through_observation(observation: &MarketObservation, slopes: DMatrix<f64>) -> Self {
        let intercepts = observation.quantities() - &slopes * observation.prices();
        Self { intercepts, slopes }
    }

    /// Unconstrained Bertrand equilibrium `(B + Ω ∘ Bᵀ) p = (Ω ∘ Bᵀ) c - a`.
    pub(crate) fn bertrand_prices(
        &self,
        costs: &DVector<f64>,
        ownership: &OwnershipMatrix,
    ) -> Result<DVector<f64>> {
        self.constrained_prices(costs, ownership, &[])
    }

    /// Equilibrium in which products in `pinned` have their first-order
    /// condition replaced by `q_i = 0`.
    pub(crate) fn constrained_prices(
        &self,
        costs: &DVector<f64>,
        ownership: &OwnershipMatrix,
        pinned: &[usize],
    ) -> Result<DVector<f64>> {
        let internal = ownership.matrix().component_mul(&self.slopes.transpose());
        let mut system = &self.slopes + &internal;
        let mut rhs = &internal * costs - &self.intercepts;
        for &index in pinned {
            system.set_row(index, &self.slopes.row(index));
            rhs[index] = -self.intercepts[index];
        }
        system
            .lu()
            .solve(&rhs)
            .ok_or_else(|| MergerError::singular("linear equilibrium system"))
    }
}

impl DemandSystem for LinearDemand {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn product_count(&self) -> usize {
        self.intercepts.len()
    }

    fn quantities(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        check_prices(prices, self.product_count())?;
        Ok(&self.intercepts + &self.slopes * prices)
    }

    fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        check_prices(prices, self.product_count())?;
        Ok(self.slopes.clone())
    }

    fn restrict(&self, active: &[usize]) -> Self {
        Self {
            intercepts: self.intercepts.select_rows(active),
            slopes: self.slopes.select_rows(active).select_columns(active),
        }
    }
}
