//! Evaluator for quadratic constraint blocks.
//!
//! Each row is stored as three CSR-delimited segments (diagonal terms,
//! off-diagonal terms, linear terms) plus an optional constant. `add_row`
//! also builds the row's sparse Jacobian layout up front: the gradient
//! support of a row is the union of variables over all of its terms, each
//! variable owning one stable slot that every term scatters into at
//! evaluation time.

use std::collections::HashMap;

use crate::expr::func::ScalarQuadraticFunction;
use crate::{E, HessianSparsityType, I};

use super::{HessianIndexMap, RowEvaluator, intern_hessian_entry, reduce_to_triangle};

#[derive(Debug, Clone)]
pub struct QuadraticEvaluator {
    n_constraints: usize,

    diag_coefs: Vec<E>,
    diag_indices: Vec<I>,
    diag_intervals: Vec<I>,

    offdiag_coefs: Vec<E>,
    offdiag_rows: Vec<I>,
    offdiag_cols: Vec<I>,
    offdiag_intervals: Vec<I>,

    linear_coefs: Vec<E>,
    linear_indices: Vec<I>,
    linear_intervals: Vec<I>,

    linear_constant_values: Vec<E>,
    linear_constant_indices: Vec<I>,

    jacobian_nnz: usize,

    /// Constant (linear) part of each Jacobian slot, the starting value at
    /// evaluation time.
    jacobian_constant: Vec<E>,
    jacobian_variable_indices: Vec<I>,
    jacobian_constraint_intervals: Vec<I>,
    /// Jacobian slot of the variable of diagonal term `i`.
    jacobian_diag_indices: Vec<I>,
    /// Jacobian slots of the row/col variable of off-diagonal term `i`.
    jacobian_offdiag_row_indices: Vec<I>,
    jacobian_offdiag_col_indices: Vec<I>,

    /// Global Hessian slots, resolved by `analyze_hessian_structure`.
    hessian_diag_indices: Vec<I>,
    hessian_offdiag_indices: Vec<I>,
}

impl Default for QuadraticEvaluator {
    fn default() -> Self {
        Self {
            n_constraints: 0,
            diag_coefs: Vec::new(),
            diag_indices: Vec::new(),
            diag_intervals: vec![0],
            offdiag_coefs: Vec::new(),
            offdiag_rows: Vec::new(),
            offdiag_cols: Vec::new(),
            offdiag_intervals: vec![0],
            linear_coefs: Vec::new(),
            linear_indices: Vec::new(),
            linear_intervals: vec![0],
            linear_constant_values: Vec::new(),
            linear_constant_indices: Vec::new(),
            jacobian_nnz: 0,
            jacobian_constant: Vec::new(),
            jacobian_variable_indices: Vec::new(),
            jacobian_constraint_intervals: vec![0],
            jacobian_diag_indices: Vec::new(),
            jacobian_offdiag_row_indices: Vec::new(),
            jacobian_offdiag_col_indices: Vec::new(),
            hessian_diag_indices: Vec::new(),
            hessian_offdiag_indices: Vec::new(),
        }
    }
}

impl QuadraticEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, f: &ScalarQuadraticFunction) {
        for i in 0..f.size() {
            let coef = f.coefficients[i];
            let x1 = f.variable_1s[i] as I;
            let x2 = f.variable_2s[i] as I;

            if x1 == x2 {
                self.diag_coefs.push(coef);
                self.diag_indices.push(x1);
            } else {
                self.offdiag_coefs.push(coef);
                self.offdiag_rows.push(x1);
                self.offdiag_cols.push(x2);
            }
        }

        self.diag_intervals.push(self.diag_coefs.len());
        self.offdiag_intervals.push(self.offdiag_coefs.len());

        if let Some(affine) = &f.affine_part {
            self.linear_coefs.extend_from_slice(&affine.coefficients);
            self.linear_indices
                .extend(affine.variables.iter().map(|&v| v as I));

            if let Some(constant) = affine.constant {
                self.linear_constant_values.push(constant);
                self.linear_constant_indices.push(self.n_constraints);
            }
        }
        self.linear_intervals.push(self.linear_coefs.len());

        // Build this row's sparse Jacobian layout: one slot per distinct
        // variable, in first-appearance order.
        let mut variable_to_jacobian_slot: HashMap<I, I> = HashMap::new();

        for i in 0..f.size() {
            let x1 = f.variable_1s[i] as I;
            let x2 = f.variable_2s[i] as I;

            if x1 == x2 {
                let (slot, _) = self.intern_jacobian_slot(&mut variable_to_jacobian_slot, x1, 0.0);
                self.jacobian_diag_indices.push(slot);
            } else {
                let (slot, _) = self.intern_jacobian_slot(&mut variable_to_jacobian_slot, x1, 0.0);
                self.jacobian_offdiag_row_indices.push(slot);
                let (slot, _) = self.intern_jacobian_slot(&mut variable_to_jacobian_slot, x2, 0.0);
                self.jacobian_offdiag_col_indices.push(slot);
            }
        }

        if let Some(affine) = &f.affine_part {
            for i in 0..affine.size() {
                let coef = affine.coefficients[i];
                let x = affine.variables[i] as I;
                let (slot, inserted) =
                    self.intern_jacobian_slot(&mut variable_to_jacobian_slot, x, coef);
                if !inserted {
                    self.jacobian_constant[slot] += coef;
                }
            }
        }
        self.jacobian_constraint_intervals
            .push(self.jacobian_variable_indices.len());

        self.n_constraints += 1;
    }

    /// Returns the Jacobian slot of `variable` in the row under
    /// construction, creating it with the given starting constant on first
    /// sight. The second element reports whether the slot is new.
    fn intern_jacobian_slot(
        &mut self,
        variable_to_jacobian_slot: &mut HashMap<I, I>,
        variable: I,
        constant: E,
    ) -> (I, bool) {
        match variable_to_jacobian_slot.entry(variable) {
            std::collections::hash_map::Entry::Occupied(entry) => (*entry.get(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let slot = self.jacobian_nnz;
                entry.insert(slot);
                self.jacobian_constant.push(constant);
                self.jacobian_variable_indices.push(variable);
                self.jacobian_nnz += 1;
                (slot, true)
            }
        }
    }

    /// Resolves a global Hessian slot for every quadratic term, interning
    /// the triangle-reduced coordinates in the shared `hessian_index_map`.
    pub fn analyze_hessian_structure(
        &mut self,
        global_hessian_nnz: &mut I,
        global_hessian_rows: &mut Vec<I>,
        global_hessian_cols: &mut Vec<I>,
        hessian_index_map: &mut HessianIndexMap,
        hessian_type: HessianSparsityType,
    ) {
        self.hessian_diag_indices.clear();
        self.hessian_offdiag_indices.clear();

        for &x in &self.diag_indices {
            let slot = intern_hessian_entry(
                hessian_index_map,
                x,
                x,
                global_hessian_nnz,
                global_hessian_rows,
                global_hessian_cols,
            );
            self.hessian_diag_indices.push(slot);
        }

        for i in 0..self.offdiag_coefs.len() {
            let (row, col) =
                reduce_to_triangle(self.offdiag_rows[i], self.offdiag_cols[i], hessian_type);
            let slot = intern_hessian_entry(
                hessian_index_map,
                row,
                col,
                global_hessian_nnz,
                global_hessian_rows,
                global_hessian_cols,
            );
            self.hessian_offdiag_indices.push(slot);
        }
    }

    /// Accumulates `lambda[i] * ∇²row_i` into `hessian`. The caller zeroes
    /// the buffer.
    pub fn eval_lagrangian_hessian(&self, lambda: &[E], hessian: &mut [E]) {
        for i in 0..self.n_constraints {
            let multiplier = lambda[i];
            for j in self.diag_intervals[i]..self.diag_intervals[i + 1] {
                hessian[self.hessian_diag_indices[j]] += 2.0 * self.diag_coefs[j] * multiplier;
            }
        }
        for i in 0..self.n_constraints {
            let multiplier = lambda[i];
            for j in self.offdiag_intervals[i]..self.offdiag_intervals[i + 1] {
                hessian[self.hessian_offdiag_indices[j]] += self.offdiag_coefs[j] * multiplier;
            }
        }
    }
}

impl RowEvaluator for QuadraticEvaluator {
    fn n_rows(&self) -> usize {
        self.n_constraints
    }

    fn jacobian_nnz(&self) -> usize {
        self.jacobian_nnz
    }

    fn eval_function(&self, x: &[E], f: &mut [E]) {
        for i in 0..self.n_constraints {
            let mut sum = 0.0;
            for j in self.diag_intervals[i]..self.diag_intervals[i + 1] {
                let v = x[self.diag_indices[j]];
                sum += self.diag_coefs[j] * v * v;
            }
            f[i] = sum;
        }
        for i in 0..self.n_constraints {
            let mut sum = 0.0;
            for j in self.offdiag_intervals[i]..self.offdiag_intervals[i + 1] {
                sum += self.offdiag_coefs[j] * x[self.offdiag_rows[j]] * x[self.offdiag_cols[j]];
            }
            f[i] += sum;
        }
        for i in 0..self.n_constraints {
            let mut sum = 0.0;
            for j in self.linear_intervals[i]..self.linear_intervals[i + 1] {
                sum += self.linear_coefs[j] * x[self.linear_indices[j]];
            }
            f[i] += sum;
        }
        for (&index, &value) in self
            .linear_constant_indices
            .iter()
            .zip(&self.linear_constant_values)
        {
            f[index] += value;
        }
    }

    fn analyze_jacobian_structure(
        &self,
        row_base: I,
        global_jacobian_nnz: &mut I,
        global_jacobian_rows: &mut Vec<I>,
        global_jacobian_cols: &mut Vec<I>,
    ) {
        *global_jacobian_nnz += self.jacobian_nnz;
        for i in 0..self.n_constraints {
            let start = self.jacobian_constraint_intervals[i];
            let end = self.jacobian_constraint_intervals[i + 1];
            for _ in start..end {
                global_jacobian_rows.push(row_base + i);
            }
        }
        global_jacobian_cols.extend_from_slice(&self.jacobian_variable_indices);
    }

    fn eval_jacobian(&self, x: &[E], jacobian: &mut [E]) {
        jacobian[..self.jacobian_constant.len()].copy_from_slice(&self.jacobian_constant);

        for i in 0..self.diag_coefs.len() {
            jacobian[self.jacobian_diag_indices[i]] +=
                2.0 * self.diag_coefs[i] * x[self.diag_indices[i]];
        }

        for i in 0..self.offdiag_coefs.len() {
            let coef = self.offdiag_coefs[i];
            jacobian[self.jacobian_offdiag_row_indices[i]] += coef * x[self.offdiag_cols[i]];
            jacobian[self.jacobian_offdiag_col_indices[i]] += coef * x[self.offdiag_rows[i]];
        }
    }
}
