//! Conversion of ownership descriptions into the matrix used by the pricing equations.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{MergerError, Result};

/// Ownership structure as supplied by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Ownership {
    /// One firm identifier per product; products sharing an identifier are jointly owned.
    Firms(Vec<String>),
    /// Explicit `k x k` matrix of profit shares in `[0, 1]` (partial ownership).
    Matrix(DMatrix<f64>),
}

impl Ownership {
    /// Convenience constructor from any iterable of firm identifiers.
    pub fn firms<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Firms(ids.into_iter().map(Into::into).collect())
    }

    /// Returns the firm vector obtained by folding `acquired` into `acquirer`.
    ///
    /// Only defined for firm-vector ownership; matrices must be edited directly.
    pub fn merged(&self, acquirer: &str, acquired: &str) -> Result<Self> {
        match self {
            Ownership::Firms(ids) => {
                if !ids.iter().any(|id| id == acquirer) || !ids.iter().any(|id| id == acquired) {
                    return Err(MergerError::invalid_ownership(format!(
                        "firms `{acquirer}` and `{acquired}` must both own products"
                    )));
                }
                Ok(Ownership::Firms(
                    ids.iter()
                        .map(|id| {
                            if id == acquired {
                                acquirer.to_string()
                            } else {
                                id.clone()
                            }
                        })
                        .collect(),
                ))
            }
            Ownership::Matrix(_) => Err(MergerError::invalid_ownership(
                "merging by firm identifier requires a firm vector",
            )),
        }
    }

    /// Normalizes this description into a validated `k x k` ownership matrix.
    pub fn resolve(&self, product_count: usize) -> Result<OwnershipMatrix> {
        match self {
            Ownership::Firms(ids) => {
                if ids.len() != product_count {
                    return Err(MergerError::invalid_ownership(format!(
                        "firm vector has {} entries for {product_count} products",
                        ids.len()
                    )));
                }
                let matrix = DMatrix::from_fn(product_count, product_count, |i, j| {
                    if ids[i] == ids[j] {
                        1.0
                    } else {
                        0.0
                    }
                });
                Ok(OwnershipMatrix { matrix })
            }
            Ownership::Matrix(matrix) => {
                if matrix.nrows() != product_count || matrix.ncols() != product_count {
                    return Err(MergerError::invalid_ownership(format!(
                        "ownership matrix is {}x{} for {product_count} products",
                        matrix.nrows(),
                        matrix.ncols()
                    )));
                }
                for i in 0..product_count {
                    for j in 0..product_count {
                        let value = matrix[(i, j)];
                        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                            return Err(MergerError::invalid_ownership(format!(
                                "entry ({i}, {j}) must lie in [0, 1], found {value}"
                            )));
                        }
                    }
                    if matrix[(i, i)] != 1.0 {
                        return Err(MergerError::invalid_ownership(format!(
                            "product {i} must fully own itself, found {}",
                            matrix[(i, i)]
                        )));
                    }
                }
                Ok(OwnershipMatrix {
                    matrix: matrix.clone(),
                })
            }
        }
    }
}

/// Validated ownership matrix: entry `(i, j)` is the fraction of product `j`'s
/// profit internalized when pricing product `i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnershipMatrix {
    matrix: DMatrix<f64>,
}

impl OwnershipMatrix {
    /// Every product owned by a distinct firm.
    pub fn single_product_firms(product_count: usize) -> Self {
        Self {
            matrix: DMatrix::identity(product_count, product_count),
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

    /// Sub-matrix over the `active` products, in the given order.
    pub fn restrict(&self, active: &[usize]) -> Self {
        Self {
            matrix: self.matrix.select_rows(active).select_columns(active),
        }
    }
}
