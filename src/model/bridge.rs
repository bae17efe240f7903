//! Assembly of the callback surface into `faer` sparse types.
//!
//! Solvers working on `Col` / `SparseColMat` can drive these instead of the
//! raw slice callbacks; values are evaluated fresh at `x` and scattered into
//! triplets against the structure fixed at analysis time. Duplicate
//! coordinates (possible across the linear / quadratic / nonlinear
//! subsystems of the Jacobian) are accumulated by the triplet assembler.

use faer::Col;
use faer::sparse::{SparseColMat, Triplet};

use problemo::Problem;
use problemo::common::IntoCommonProblem;

use crate::{E, I};

use super::NlpModel;

impl NlpModel {
    /// `c(x)` as a dense column in internal row order.
    pub fn constraint_values(&self, x: &[E]) -> Result<Col<E>, Problem> {
        let mut g = vec![0.0; self.n_constraints()];
        self.eval_constraints(x, &mut g)?;
        let mut col = Col::zeros(g.len());
        for (i, &value) in g.iter().enumerate() {
            col[i] = value;
        }
        Ok(col)
    }

    /// Dense `∇f(x)` scattered out of the sparse gradient.
    pub fn objective_gradient(&mut self, x: &[E]) -> Result<Col<E>, Problem> {
        let n = self.n_variables();
        let (indices, values) = self.eval_objective_gradient(x)?;
        let mut grad = Col::zeros(n);
        for (&col, &value) in indices.iter().zip(values) {
            grad[col] += value;
        }
        Ok(grad)
    }

    /// `∇c(x)` assembled as a sparse column-major matrix.
    pub fn jacobian_matrix(&self, x: &[E]) -> Result<SparseColMat<I, E>, Problem> {
        let mut values = vec![0.0; self.jacobian_nnz()];
        self.eval_constraints_jacobian(x, &mut values)?;

        let (rows, cols) = self.jacobian_structure();
        let triplets: Vec<Triplet<I, I, E>> = rows
            .iter()
            .zip(cols)
            .zip(&values)
            .map(|((&row, &col), &value)| Triplet::new(row, col, value))
            .collect();
        SparseColMat::try_new_from_triplets(self.n_constraints(), self.n_variables(), &triplets)
            .map_err(|_| "unable to assemble constraint Jacobian".gloss())
    }

    /// `∇²L(x, λ, σ)` assembled as a full symmetric sparse matrix; the
    /// stored triangle is mirrored across the diagonal.
    pub fn lagrangian_hessian_matrix(
        &self,
        x: &[E],
        lambda: &[E],
        sigma: E,
    ) -> Result<SparseColMat<I, E>, Problem> {
        let mut values = vec![0.0; self.hessian_nnz()];
        self.eval_lagrangian_hessian(x, lambda, sigma, &mut values)?;

        let (rows, cols) = self.hessian_structure();
        let n = self.n_variables();
        let mut triplets: Vec<Triplet<I, I, E>> = Vec::with_capacity(2 * values.len());
        for k in 0..values.len() {
            triplets.push(Triplet::new(rows[k], cols[k], values[k]));
            if rows[k] != cols[k] {
                triplets.push(Triplet::new(cols[k], rows[k], values[k]));
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|_| "unable to assemble Lagrangian Hessian".gloss())
    }
}
