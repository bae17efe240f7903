//! Flat (affine / quadratic) function containers and their conversions into
//! [`ExpressionGraph`] trees, plus the canonical unpacking of comparison
//! expressions into `(expression, lower bound, upper bound)` triples.

use std::collections::BTreeMap;

use problemo::Problem;
use serde::{Deserialize, Serialize};

use crate::expr::graph::{
    BinaryOperator, EntityId, ExpressionGraph, ExpressionHandle, NaryOperator, NodeKind,
    UnaryOperator,
};
use crate::{E, ModelError};

/// Opaque reference to a decision variable of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableIndex {
    pub index: EntityId,
}

impl VariableIndex {
    pub fn new(index: EntityId) -> Self {
        Self { index }
    }
}

/// A weighted sum of variables with an optional constant term.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarAffineFunction {
    pub coefficients: Vec<E>,
    pub variables: Vec<EntityId>,
    pub constant: Option<E>,
}

impl ScalarAffineFunction {
    pub fn new(coefficients: Vec<E>, variables: Vec<EntityId>, constant: Option<E>) -> Self {
        debug_assert_eq!(coefficients.len(), variables.len());
        Self {
            coefficients,
            variables,
            constant,
        }
    }

    pub fn size(&self) -> usize {
        self.coefficients.len()
    }

    /// Evaluates the function with `x` indexed by variable identity.
    pub fn value(&self, x: &[E]) -> E {
        let mut sum = self.constant.unwrap_or(0.0);
        for (coef, var) in self.coefficients.iter().zip(&self.variables) {
            sum += coef * x[*var as usize];
        }
        sum
    }
}

impl From<VariableIndex> for ScalarAffineFunction {
    fn from(v: VariableIndex) -> Self {
        Self::new(vec![1.0], vec![v.index], None)
    }
}

/// A sum of bilinear terms `coef * x1 * x2` with an optional affine part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarQuadraticFunction {
    pub coefficients: Vec<E>,
    pub variable_1s: Vec<EntityId>,
    pub variable_2s: Vec<EntityId>,
    pub affine_part: Option<ScalarAffineFunction>,
}

impl ScalarQuadraticFunction {
    pub fn new(
        coefficients: Vec<E>,
        variable_1s: Vec<EntityId>,
        variable_2s: Vec<EntityId>,
        affine_part: Option<ScalarAffineFunction>,
    ) -> Self {
        debug_assert_eq!(coefficients.len(), variable_1s.len());
        debug_assert_eq!(coefficients.len(), variable_2s.len());
        Self {
            coefficients,
            variable_1s,
            variable_2s,
            affine_part,
        }
    }

    pub fn size(&self) -> usize {
        self.coefficients.len()
    }

    /// Evaluates the function with `x` indexed by variable identity.
    pub fn value(&self, x: &[E]) -> E {
        let mut sum = self.affine_part.as_ref().map_or(0.0, |a| a.value(x));
        for i in 0..self.size() {
            sum += self.coefficients[i]
                * x[self.variable_1s[i] as usize]
                * x[self.variable_2s[i] as usize];
        }
        sum
    }
}

/// An unordered pair of variables keying a quadratic term. The pair is stored
/// with `var_1 <= var_2` so that `x*y` and `y*x` accumulate together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariablePair {
    pub var_1: EntityId,
    pub var_2: EntityId,
}

impl VariablePair {
    pub fn new(a: EntityId, b: EntityId) -> Self {
        if a <= b {
            Self { var_1: a, var_2: b }
        } else {
            Self { var_1: b, var_2: a }
        }
    }
}

/// Incremental builder for affine and quadratic expressions.
///
/// Terms are keyed on variable (pairs) in ordered maps, so repeated additions
/// accumulate and the flattened term order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ExprBuilder {
    pub quadratic_terms: BTreeMap<VariablePair, E>,
    pub affine_terms: BTreeMap<EntityId, E>,
    pub constant_term: Option<E>,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_affine_term(&mut self, v: VariableIndex, coef: E) -> &mut Self {
        *self.affine_terms.entry(v.index).or_insert(0.0) += coef;
        self
    }

    pub fn add_quadratic_term(&mut self, v1: VariableIndex, v2: VariableIndex, coef: E) -> &mut Self {
        let pair = VariablePair::new(v1.index, v2.index);
        *self.quadratic_terms.entry(pair).or_insert(0.0) += coef;
        self
    }

    pub fn add_constant(&mut self, value: E) -> &mut Self {
        self.constant_term = Some(self.constant_term.unwrap_or(0.0) + value);
        self
    }

    /// Polynomial degree of the built expression: 0, 1 or 2.
    pub fn degree(&self) -> usize {
        if !self.quadratic_terms.is_empty() {
            2
        } else if !self.affine_terms.is_empty() {
            1
        } else {
            0
        }
    }

    pub fn to_affine(&self) -> Result<ScalarAffineFunction, Problem> {
        if !self.quadratic_terms.is_empty() {
            return ModelError::IncompatibleObjectiveDegree.raise();
        }
        let mut coefficients = Vec::with_capacity(self.affine_terms.len());
        let mut variables = Vec::with_capacity(self.affine_terms.len());
        for (&var, &coef) in &self.affine_terms {
            coefficients.push(coef);
            variables.push(var);
        }
        Ok(ScalarAffineFunction::new(
            coefficients,
            variables,
            self.constant_term,
        ))
    }

    pub fn to_quadratic(&self) -> Result<ScalarQuadraticFunction, Problem> {
        let mut coefficients = Vec::with_capacity(self.quadratic_terms.len());
        let mut variable_1s = Vec::with_capacity(self.quadratic_terms.len());
        let mut variable_2s = Vec::with_capacity(self.quadratic_terms.len());
        for (pair, &coef) in &self.quadratic_terms {
            coefficients.push(coef);
            variable_1s.push(pair.var_1);
            variable_2s.push(pair.var_2);
        }
        let affine_part = if self.affine_terms.is_empty() && self.constant_term.is_none() {
            None
        } else {
            let mut affine = self.clone();
            affine.quadratic_terms.clear();
            Some(affine.to_affine()?)
        };
        Ok(ScalarQuadraticFunction::new(
            coefficients,
            variable_1s,
            variable_2s,
            affine_part,
        ))
    }

    /// Evaluates the built expression with `x` indexed by variable identity.
    pub fn value(&self, x: &[E]) -> E {
        let mut sum = self.constant_term.unwrap_or(0.0);
        for (pair, coef) in &self.quadratic_terms {
            sum += coef * x[pair.var_1 as usize] * x[pair.var_2 as usize];
        }
        for (&var, coef) in &self.affine_terms {
            sum += coef * x[var as usize];
        }
        sum
    }
}

impl ExpressionGraph {
    /// Adds a coefficient-weighted variable term, with the shortcuts
    /// `1 -> x`, `-1 -> Neg(x)` and `c -> Mul(c, x)`.
    fn weighted_term(&mut self, coef: E, term: ExpressionHandle) -> ExpressionHandle {
        if coef == 1.0 {
            term
        } else if coef == -1.0 {
            self.add_unary(UnaryOperator::Neg, term)
        } else {
            let c = self.add_constant(coef);
            self.add_nary(NaryOperator::Mul, vec![c, term])
        }
    }

    fn sum_terms(&mut self, mut terms: Vec<ExpressionHandle>) -> ExpressionHandle {
        if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            self.add_nary(NaryOperator::Add, terms)
        }
    }

    pub fn merge_variable(&mut self, v: &VariableIndex) -> ExpressionHandle {
        self.add_variable(v.index)
    }

    /// Rewrites an affine function as an `Add`-of-`Mul` n-ary tree.
    pub fn merge_affine(&mut self, f: &ScalarAffineFunction) -> ExpressionHandle {
        let mut terms = Vec::with_capacity(f.size() + 1);
        for i in 0..f.size() {
            let x = self.add_variable(f.variables[i]);
            let term = self.weighted_term(f.coefficients[i], x);
            terms.push(term);
        }
        if let Some(constant) = f.constant {
            terms.push(self.add_constant(constant));
        }
        self.sum_terms(terms)
    }

    /// Rewrites a quadratic function as an `Add`-of-`Mul` n-ary tree.
    pub fn merge_quadratic(&mut self, f: &ScalarQuadraticFunction) -> ExpressionHandle {
        let mut terms = Vec::with_capacity(f.size() + 1);
        for i in 0..f.size() {
            let x1 = self.add_variable(f.variable_1s[i]);
            let x2 = if f.variable_1s[i] == f.variable_2s[i] {
                x1
            } else {
                self.add_variable(f.variable_2s[i])
            };
            let coef = f.coefficients[i];
            let term = if coef == 1.0 {
                self.add_nary(NaryOperator::Mul, vec![x1, x2])
            } else if coef == -1.0 {
                let product = self.add_nary(NaryOperator::Mul, vec![x1, x2]);
                self.add_unary(UnaryOperator::Neg, product)
            } else {
                let c = self.add_constant(coef);
                self.add_nary(NaryOperator::Mul, vec![c, x1, x2])
            };
            terms.push(term);
        }
        if let Some(affine) = &f.affine_part {
            terms.push(self.merge_affine(affine));
        }
        self.sum_terms(terms)
    }

    pub fn merge_expr_builder(&mut self, expr: &ExprBuilder) -> ExpressionHandle {
        let mut terms =
            Vec::with_capacity(expr.quadratic_terms.len() + expr.affine_terms.len() + 1);
        for (pair, &coef) in &expr.quadratic_terms {
            let x1 = self.add_variable(pair.var_1);
            let x2 = if pair.var_1 == pair.var_2 {
                x1
            } else {
                self.add_variable(pair.var_2)
            };
            let term = if coef == 1.0 {
                self.add_nary(NaryOperator::Mul, vec![x1, x2])
            } else if coef == -1.0 {
                let product = self.add_nary(NaryOperator::Mul, vec![x1, x2]);
                self.add_unary(UnaryOperator::Neg, product)
            } else {
                let c = self.add_constant(coef);
                self.add_nary(NaryOperator::Mul, vec![c, x1, x2])
            };
            terms.push(term);
        }
        for (&var, &coef) in &expr.affine_terms {
            let x = self.add_variable(var);
            let term = self.weighted_term(coef, x);
            terms.push(term);
        }
        if let Some(constant) = expr.constant_term {
            terms.push(self.add_constant(constant));
        }
        self.sum_terms(terms)
    }
}

/// Rewrites a comparison constraint `f <= g`, `f >= g` or `f == g` into a
/// canonical `(expression, lb, ub)` triple.
///
/// If one side is a constant, the other side becomes the expression and the
/// constant fills the bound; otherwise a fresh `Sub(f, g)` node is inserted
/// and compared against zero. `>=` is normalized by swapping the operands
/// into `<=` first.
pub fn unpack_comparison_expression(
    graph: &mut ExpressionGraph,
    expr: &ExpressionHandle,
) -> Result<(ExpressionHandle, E, E), Problem> {
    if expr.kind != NodeKind::Binary {
        return ModelError::InvalidComparisonExpression.raise();
    }

    let binary = graph.binaries[expr.id as usize];
    let mut op = binary.op;
    if op != BinaryOperator::LessEqual
        && op != BinaryOperator::GreaterEqual
        && op != BinaryOperator::Equal
    {
        return ModelError::InvalidComparisonExpression.raise();
    }

    let mut f = binary.left;
    let mut g = binary.right;

    if op == BinaryOperator::GreaterEqual {
        std::mem::swap(&mut f, &mut g);
        op = BinaryOperator::LessEqual;
    }

    let mut lb = E::NEG_INFINITY;
    let mut ub = E::INFINITY;

    let f_constant = (f.kind == NodeKind::Constant).then(|| graph.constants[f.id as usize].value);
    let g_constant = (g.kind == NodeKind::Constant).then(|| graph.constants[g.id as usize].value);

    let real_expr = if op == BinaryOperator::LessEqual {
        if let Some(value) = f_constant {
            lb = value;
            g
        } else if let Some(value) = g_constant {
            ub = value;
            f
        } else {
            ub = 0.0;
            graph.add_binary(BinaryOperator::Sub, f, g)
        }
    } else if let Some(value) = f_constant {
        lb = value;
        ub = value;
        g
    } else if let Some(value) = g_constant {
        lb = value;
        ub = value;
        f
    } else {
        lb = 0.0;
        ub = 0.0;
        graph.add_binary(BinaryOperator::Sub, f, g)
    };

    Ok((real_expr, lb, ub))
}
