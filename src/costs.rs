//! Marginal-cost recovery by inverting the Bertrand first-order conditions.

use nalgebra::{DMatrix, DVector};

use crate::demand::DemandSystem;
use crate::error::{MergerError, Result};
use crate::ownership::OwnershipMatrix;

/// Matrix `Ω ∘ Jᵀ` whose row `i` collects how a change in `p_i` moves the
/// profits internalized by the owner of product `i`.
pub(crate) fn first_order_matrix(
    ownership: &OwnershipMatrix,
    jacobian: &DMatrix<f64>,
) -> DMatrix<f64> {
    ownership.matrix().component_mul(&jacobian.transpose())
}

/// Absolute markups `p - c` that satisfy the first-order conditions at `prices`.
///
/// Solves `(Ω ∘ Jᵀ) m = -diag(Ω) ∘ q`, where `J[i, j] = ∂q_i/∂p_j`.
pub fn markups<D>(
    model: &D,
    prices: &DVector<f64>,
    ownership: &OwnershipMatrix,
) -> Result<DVector<f64>>
where
    D: DemandSystem + ?Sized,
{
    let k = model.product_count();
    if ownership.dimension() != k {
        return Err(MergerError::dimension_mismatch(
            "ownership dimension",
            k,
            ownership.dimension(),
        ));
    }

    let quantities = model.quantities(prices)?;
    let jacobian = model.jacobian(prices)?;
    let system = first_order_matrix(ownership, &jacobian);
    let rhs = -ownership.matrix().diagonal().component_mul(&quantities);

    let markups = system
        .lu()
        .solve(&rhs)
        .ok_or_else(|| MergerError::singular("markup system"))?;
    if markups.iter().any(|value| !value.is_finite()) {
        return Err(MergerError::NumericalError {
            context: "markup recovery",
        });
    }
    Ok(markups)
}

/// Relative margins `(p - c) / p` implied by the model at `prices`.
pub fn implied_margins<D>(
    model: &D,
    prices: &DVector<f64>,
    ownership: &OwnershipMatrix,
) -> Result<DVector<f64>>
where
    D: DemandSystem + ?Sized,
{
    Ok(markups(model, prices, ownership)?.component_div(prices))
}

/// Marginal costs consistent with profit maximization at `prices`.
///
/// `cost_shift` applies a proportional change, `c · (1 + shift)`, used for
/// post-merger efficiencies. Negative costs are returned unchanged; callers
/// decide how to report them.
pub fn recover_costs<D>(
    model: &D,
    prices: &DVector<f64>,
    ownership: &OwnershipMatrix,
    cost_shift: Option<&DVector<f64>>,
) -> Result<DVector<f64>>
where
    D: DemandSystem + ?Sized,
{
    let costs = prices - markups(model, prices, ownership)?;
    match cost_shift {
        Some(shift) => {
            if shift.len() != costs.len() {
                return Err(MergerError::dimension_mismatch(
                    "cost shift length",
                    costs.len(),
                    shift.len(),
                ));
            }
            Ok(costs.component_mul(&shift.add_scalar(1.0)))
        }
        None => Ok(costs),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::demand::LinearDemand;
    use crate::ownership::Ownership;

    fn two_product_linear() -> LinearDemand {
        LinearDemand::new(
            DVector::from_vec(vec![100.0, 80.0]),
            DMatrix::from_row_slice(2, 2, &[-10.0, 2.0, 3.0, -8.0]),
        )
        .unwrap()
    }

    #[test]
    fn single_product_markup_is_inverse_slope() {
        let model = two_product_linear();
        let prices = DVector::from_vec(vec![5.0, 4.0]);
        let owner = OwnershipMatrix::single_product_firms(2);
        let markups = markups(&model, &prices, &owner).unwrap();
        let quantities = model.quantities(&prices).unwrap();
        assert_relative_eq!(markups[0], quantities[0] / 10.0, epsilon = 1e-12);
        assert_relative_eq!(markups[1], quantities[1] / 8.0, epsilon = 1e-12);
    }

    #[test]
    fn joint_ownership_raises_markups() {
        let model = two_product_linear();
        let prices = DVector::from_vec(vec![5.0, 4.0]);
        let separate = markups(&model, &prices, &OwnershipMatrix::single_product_firms(2)).unwrap();
        let joint_owner = Ownership::firms(["A", "A"]).resolve(2).unwrap();
        let joint = markups(&model, &prices, &joint_owner).unwrap();
        assert!(joint[0] > separate[0]);
        assert!(joint[1] > separate[1]);
    }

    #[test]
    fn cost_shift_scales_recovered_costs() {
        let model = two_product_linear();
        let prices = DVector::from_vec(vec![5.0, 4.0]);
        let owner = OwnershipMatrix::single_product_firms(2);
        let base = recover_costs(&model, &prices, &owner, None).unwrap();
        let shift = DVector::from_vec(vec![-0.1, 0.0]);
        let shifted = recover_costs(&model, &prices, &owner, Some(&shift)).unwrap();
        assert_relative_eq!(shifted[0], 0.9 * base[0], epsilon = 1e-12);
        assert_relative_eq!(shifted[1], base[1], epsilon = 1e-12);

        let bad_shift = DVector::from_vec(vec![0.0]);
        assert!(recover_costs(&model, &prices, &owner, Some(&bad_shift)).is_err());
    }
}
