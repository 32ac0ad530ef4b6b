//! Diversion-ratio matrices: validation of supplied matrices and synthesis from shares.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{MergerError, Result};

/// Distance from `-1` given to diagonal entries that would otherwise be exactly
/// `-1`, which makes some calibration systems singular.
///
/// Synthesized rows are scaled by `1 - DIAGONAL_PERTURBATION` as a whole so
/// their sums stay non-positive; supplied matrices only have exact `-1`
/// diagonal entries moved.
pub const DIAGONAL_PERTURBATION: f64 = 1e-9;

/// Accepted distance of a supplied diagonal entry from `-1`.
pub const DIAGONAL_TOLERANCE: f64 = 1e-6;

const ROW_SUM_TOLERANCE: f64 = 1e-8;

/// Diversion ratios: entry `(i, j)` is the fraction of product `i`'s lost sales
/// captured by product `j`. Rows summing to less than zero leak to an outside good.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiversionMatrix {
    matrix: DMatrix<f64>,
}

impl DiversionMatrix {
    /// Synthesizes diversions proportional to shares: `D[i, j] = s_j / (1 - s_i)`,
    /// with the row scaling described at [`DIAGONAL_PERTURBATION`].
    pub fn from_shares(shares: &DVector<f64>) -> Result<Self> {
        let k = shares.len();
        for (index, share) in shares.iter().enumerate() {
            if !share.is_finite() || !(0.0..=1.0).contains(share) {
                return Err(MergerError::invalid_input(
                    "diversion shares",
                    format!("share of product {index} must lie in [0, 1], found {share}"),
                ));
            }
        }

        let scale = 1.0 - DIAGONAL_PERTURBATION;
        let matrix = DMatrix::from_fn(k, k, |i, j| {
            if i == j {
                -scale
            } else if shares[i] >= 1.0 {
                0.0
            } else {
                scale * shares[j] / (1.0 - shares[i])
            }
        });
        Ok(Self { matrix })
    }

    /// Validates a caller-supplied matrix.
    ///
    /// Entries are kept as supplied, except that a diagonal entry of exactly
    /// `-1` becomes `-1 + DIAGONAL_PERTURBATION`.
    pub fn validated(matrix: DMatrix<f64>) -> Result<Self> {
        let k = matrix.nrows();
        if matrix.ncols() != k {
            return Err(MergerError::dimension_mismatch(
                "diversion columns",
                k,
                matrix.ncols(),
            ));
        }

        let mut matrix = matrix;
        for i in 0..k {
            let mut row_sum = 0.0;
            for j in 0..k {
                let value = matrix[(i, j)];
                if !value.is_finite() {
                    return Err(MergerError::NumericalError {
                        context: "diversion validation",
                    });
                }
                if i == j {
                    if (value + 1.0).abs() > DIAGONAL_TOLERANCE {
                        return Err(MergerError::invalid_input(
                            "diversions",
                            format!("diagonal entry {i} must be -1, found {value}"),
                        ));
                    }
                    row_sum -= 1.0;
                } else {
                    if value < 0.0 {
                        return Err(MergerError::invalid_input(
                            "diversions",
                            format!("entry ({i}, {j}) must be non-negative, found {value}"),
                        ));
                    }
                    row_sum += value;
                }
            }
            if row_sum > ROW_SUM_TOLERANCE {
                return Err(MergerError::invalid_input(
                    "diversions",
                    format!("row {i} diverts more than all lost sales (row sum {row_sum})"),
                ));
            }
            if matrix[(i, i)] == -1.0 {
                matrix[(i, i)] = -1.0 + DIAGONAL_PERTURBATION;
            }
        }

        Ok(Self { matrix })
    }

    /// Uses `supplied` when present, otherwise synthesizes from `shares`.
    pub fn resolve(supplied: Option<&DMatrix<f64>>, shares: &DVector<f64>) -> Result<Self> {
        match supplied {
            Some(matrix) => {
                if matrix.nrows() != shares.len() {
                    return Err(MergerError::dimension_mismatch(
                        "diversion rows",
                        shares.len(),
                        matrix.nrows(),
                    ));
                }
                Self::validated(matrix.clone())
            }
            None => Self::from_shares(shares),
        }
    }

    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.matrix[(i, j)]
    }
}
