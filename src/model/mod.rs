//! # NLP Driver
//!
//! [`NlpModel`] stitches the linear, quadratic and nonlinear evaluators into
//! the single callback surface an NLP solver consumes: `f(x)`, `c(x)`,
//! `∇f(x)` (sparse), `∇c(x)` (sparse COO) and the triangular `∇²L(x, λ, σ)`.
//!
//! Constraints are reordered internally as `[linear | quadratic | nonlinear
//! groups in group order]`; `nl_constraint_map_ext2int` recovers the external
//! (insertion-order) indexing for primal/dual getters. Structure analysis
//! runs once after modeling; the resulting index arrays are immutable and
//! every evaluation scatters against them.

pub mod bridge;

use std::collections::HashMap;

use problemo::Problem;
use serde::{Deserialize, Serialize};

use crate::ad::structure::autodiff;
use crate::ad::trace::trace_graph;
use crate::eval::kernel::{ConstraintKernel, ObjectiveKernel};
use crate::eval::nonlinear::{GroupKind, NonlinearEvaluator};
use crate::eval::{
    HessianIndexMap, LinearEvaluator, ObjectiveCore, QuadraticEvaluator, RowEvaluator,
};
use crate::expr::func::{
    ExprBuilder, ScalarAffineFunction, ScalarQuadraticFunction, VariableIndex,
    unpack_comparison_expression,
};
use crate::expr::graph::{EntityId, ExpressionGraph, ExpressionHandle};
use crate::{E, HessianSparsityType, I, ModelError};

/// Direction of a scalar comparison constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintSense {
    LessEqual,
    GreaterEqual,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveSense {
    #[default]
    Minimize,
    Maximize,
}

/// Which evaluator family a constraint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Linear,
    Quadratic,
    Nonlinear,
}

/// Opaque, kind-tagged constraint reference in external (insertion) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintIndex {
    pub kind: ConstraintKind,
    pub index: I,
}

/// Opaque reference to a model parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterIndex {
    pub index: EntityId,
}

/// Solution record installed by the embedding solver. `obj_value` is the
/// solver's internal (minimization) objective; the model re-applies the
/// objective sense when reporting it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlpSolution {
    pub x: Vec<E>,
    pub obj_value: E,
    /// Constraint activities in internal row order.
    pub g: Vec<E>,
    /// Constraint multipliers in internal row order.
    pub mult_g: Vec<E>,
    pub mult_x_lb: Vec<E>,
    pub mult_x_ub: Vec<E>,
}

/// Optimization model over linear, quadratic and expression-graph
/// constraints and objectives.
#[derive(Default)]
pub struct NlpModel {
    // variables
    var_lb: Vec<E>,
    var_ub: Vec<E>,
    var_init: Vec<E>,
    var_names: HashMap<I, String>,

    // parameters
    parameter_values: Vec<E>,

    // expression graphs, owned per instance once finalized
    graphs: Vec<Option<ExpressionGraph>>,

    linear_con_evaluator: LinearEvaluator,
    linear_con_lb: Vec<E>,
    linear_con_ub: Vec<E>,

    quadratic_con_evaluator: QuadraticEvaluator,
    quadratic_con_lb: Vec<E>,
    quadratic_con_ub: Vec<E>,

    nonlinear: NonlinearEvaluator,
    n_nl_constraints: usize,
    /// Which graph instance each external nonlinear constraint lives on,
    /// and its output rank within that instance.
    nl_constraint_graph_instance_indices: Vec<I>,
    nl_constraint_graph_instance_orders: Vec<I>,
    /// Bounds in external nonlinear order.
    nl_con_lb: Vec<E>,
    nl_con_ub: Vec<E>,
    /// External nonlinear index -> internal (global) constraint row.
    nl_constraint_map_ext2int: Vec<I>,

    objective_core: Option<ObjectiveCore>,
    objective_sense: ObjectiveSense,

    hessian_type: HessianSparsityType,

    // raw solver options, cached for the embedding solver
    options_int: HashMap<String, i64>,
    options_num: HashMap<String, E>,
    options_str: HashMap<String, String>,

    // structure-phase outputs
    structure_ready: bool,
    con_lb: Vec<E>,
    con_ub: Vec<E>,
    jacobian_nnz: usize,
    jacobian_rows: Vec<I>,
    jacobian_cols: Vec<I>,
    hessian_nnz: usize,
    hessian_rows: Vec<I>,
    hessian_cols: Vec<I>,
    hessian_index_map: HessianIndexMap,
    sparse_gradient_indices: Vec<I>,
    sparse_gradient_values: Vec<E>,
    /// Sparse-gradient slot of each objective-core Jacobian slot.
    gradient_core_slots: Vec<I>,
    core_jacobian_scratch: Vec<E>,

    result: Option<NlpSolution>,
}

impl NlpModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Hessian triangle; must match the embedding solver's
    /// expectation and be chosen before structure analysis.
    pub fn with_hessian_sparsity(mut self, hessian_type: HessianSparsityType) -> Self {
        self.hessian_type = hessian_type;
        self
    }

    pub fn hessian_sparsity_type(&self) -> HessianSparsityType {
        self.hessian_type
    }

    // ---- variables -------------------------------------------------------

    pub fn add_variable(&mut self, lb: E, ub: E, start: E, name: Option<&str>) -> VariableIndex {
        let index = self.var_lb.len();
        self.var_lb.push(lb);
        self.var_ub.push(ub);
        self.var_init.push(start);
        if let Some(name) = name {
            self.var_names.insert(index, name.to_string());
        }
        VariableIndex::new(index as EntityId)
    }

    pub fn n_variables(&self) -> usize {
        self.var_lb.len()
    }

    pub fn get_variable_lb(&self, variable: VariableIndex) -> E {
        self.var_lb[variable.index as usize]
    }

    pub fn get_variable_ub(&self, variable: VariableIndex) -> E {
        self.var_ub[variable.index as usize]
    }

    pub fn set_variable_lb(&mut self, variable: VariableIndex, lb: E) {
        self.var_lb[variable.index as usize] = lb;
    }

    pub fn set_variable_ub(&mut self, variable: VariableIndex, ub: E) {
        self.var_ub[variable.index as usize] = ub;
    }

    pub fn set_variable_bounds(&mut self, variable: VariableIndex, lb: E, ub: E) {
        self.set_variable_lb(variable, lb);
        self.set_variable_ub(variable, ub);
    }

    pub fn get_variable_start(&self, variable: VariableIndex) -> E {
        self.var_init[variable.index as usize]
    }

    pub fn set_variable_start(&mut self, variable: VariableIndex, start: E) {
        self.var_init[variable.index as usize] = start;
    }

    pub fn get_variable_name(&self, variable: VariableIndex) -> Option<&str> {
        self.var_names
            .get(&(variable.index as usize))
            .map(String::as_str)
    }

    pub fn set_variable_name(&mut self, variable: VariableIndex, name: &str) {
        self.var_names
            .insert(variable.index as usize, name.to_string());
    }

    /// `name` if set, otherwise a positional `x{i}` placeholder.
    pub fn pprint_variable(&self, variable: VariableIndex) -> String {
        match self.get_variable_name(variable) {
            Some(name) => name.to_string(),
            None => format!("x{}", variable.index),
        }
    }

    pub fn variable_lower_bounds(&self) -> &[E] {
        &self.var_lb
    }

    pub fn variable_upper_bounds(&self) -> &[E] {
        &self.var_ub
    }

    pub fn variable_start_values(&self) -> &[E] {
        &self.var_init
    }

    // ---- parameters ------------------------------------------------------

    /// Registers a model parameter with its current value. Graph instances
    /// snapshot parameter values when they are finalized.
    pub fn add_parameter(&mut self, value: E) -> ParameterIndex {
        self.parameter_values.push(value);
        ParameterIndex {
            index: (self.parameter_values.len() - 1) as EntityId,
        }
    }

    pub fn set_parameter(&mut self, parameter: ParameterIndex, value: E) {
        self.parameter_values[parameter.index as usize] = value;
    }

    pub fn get_parameter(&self, parameter: ParameterIndex) -> E {
        self.parameter_values[parameter.index as usize]
    }

    // ---- linear and quadratic constraints --------------------------------

    fn sense_bounds(sense: ConstraintSense, rhs: E) -> (E, E) {
        match sense {
            ConstraintSense::LessEqual => (E::NEG_INFINITY, rhs),
            ConstraintSense::GreaterEqual => (rhs, E::INFINITY),
            ConstraintSense::Equal => (rhs, rhs),
        }
    }

    pub fn add_linear_constraint(
        &mut self,
        f: &ScalarAffineFunction,
        sense: ConstraintSense,
        rhs: E,
    ) -> ConstraintIndex {
        let (lb, ub) = Self::sense_bounds(sense, rhs);
        self.add_linear_constraint_interval(f, lb, ub)
    }

    pub fn add_linear_constraint_interval(
        &mut self,
        f: &ScalarAffineFunction,
        lb: E,
        ub: E,
    ) -> ConstraintIndex {
        let index = self.linear_con_lb.len();
        self.linear_con_evaluator.add_row(f);
        self.linear_con_lb.push(lb);
        self.linear_con_ub.push(ub);
        ConstraintIndex {
            kind: ConstraintKind::Linear,
            index,
        }
    }

    pub fn add_quadratic_constraint(
        &mut self,
        f: &ScalarQuadraticFunction,
        sense: ConstraintSense,
        rhs: E,
    ) -> ConstraintIndex {
        let (lb, ub) = Self::sense_bounds(sense, rhs);
        self.add_quadratic_constraint_interval(f, lb, ub)
    }

    pub fn add_quadratic_constraint_interval(
        &mut self,
        f: &ScalarQuadraticFunction,
        lb: E,
        ub: E,
    ) -> ConstraintIndex {
        let index = self.quadratic_con_lb.len();
        self.quadratic_con_evaluator.add_row(f);
        self.quadratic_con_lb.push(lb);
        self.quadratic_con_ub.push(ub);
        ConstraintIndex {
            kind: ConstraintKind::Quadratic,
            index,
        }
    }

    // ---- nonlinear constraints and graph instances -----------------------

    /// Allocates a fresh graph-instance slot.
    pub fn add_graph_instance(&mut self) -> I {
        self.graphs.push(None);
        self.nonlinear.add_graph_instance()
    }

    /// Registers `expr` (an output of `graph`) as a nonlinear constraint
    /// with bounds `[lb, ub]`.
    pub fn add_single_nl_constraint(
        &mut self,
        graph_index: I,
        graph: &mut ExpressionGraph,
        expr: ExpressionHandle,
        lb: E,
        ub: E,
    ) -> ConstraintIndex {
        let order = graph.constraint_outputs().len();
        graph.add_constraint_output(expr);

        let index = self.n_nl_constraints;
        self.n_nl_constraints += 1;
        self.nl_constraint_graph_instance_indices.push(graph_index);
        self.nl_constraint_graph_instance_orders.push(order);
        self.nl_con_lb.push(lb);
        self.nl_con_ub.push(ub);

        ConstraintIndex {
            kind: ConstraintKind::Nonlinear,
            index,
        }
    }

    /// Sense/right-hand-side variant of [`Self::add_single_nl_constraint`].
    pub fn add_single_nl_constraint_with_sense(
        &mut self,
        graph_index: I,
        graph: &mut ExpressionGraph,
        expr: ExpressionHandle,
        sense: ConstraintSense,
        rhs: E,
    ) -> ConstraintIndex {
        let (lb, ub) = Self::sense_bounds(sense, rhs);
        self.add_single_nl_constraint(graph_index, graph, expr, lb, ub)
    }

    /// Registers a comparison expression (`f <= g`, `f >= g`, `f == g`) as a
    /// nonlinear constraint, unpacking it into `(expression, lb, ub)` first.
    pub fn add_nl_constraint_comparison(
        &mut self,
        graph_index: I,
        graph: &mut ExpressionGraph,
        compare: ExpressionHandle,
    ) -> Result<ConstraintIndex, Problem> {
        let (expr, lb, ub) = unpack_comparison_expression(graph, &compare)?;
        Ok(self.add_single_nl_constraint(graph_index, graph, expr, lb, ub))
    }

    /// Registers `expr` as an additive nonlinear objective contribution.
    pub fn add_nl_objective(&mut self, graph: &mut ExpressionGraph, expr: ExpressionHandle) {
        graph.add_objective_output(expr);
    }

    /// Seals a graph instance: snapshots its variable identities and
    /// parameter values and logs its structural hashes for aggregation.
    pub fn finalize_graph_instance(&mut self, graph_index: I, graph: ExpressionGraph) {
        let constants = graph
            .parameters()
            .iter()
            .map(|p| self.parameter_values[p.id as usize])
            .collect();
        self.nonlinear
            .finalize_graph_instance(graph_index, &graph, constants);
        self.graphs[graph_index] = Some(graph);
    }

    // ---- objective -------------------------------------------------------

    pub fn set_linear_objective(&mut self, f: &ScalarAffineFunction, sense: ObjectiveSense) {
        let mut evaluator = LinearEvaluator::new();
        evaluator.add_row(f);
        self.objective_core = Some(ObjectiveCore::Affine(evaluator));
        self.objective_sense = sense;
    }

    pub fn set_quadratic_objective(&mut self, f: &ScalarQuadraticFunction, sense: ObjectiveSense) {
        let mut evaluator = QuadraticEvaluator::new();
        evaluator.add_row(f);
        self.objective_core = Some(ObjectiveCore::Quadratic(evaluator));
        self.objective_sense = sense;
    }

    /// Installs an [`ExprBuilder`] objective on the affine or quadratic
    /// pathway according to its degree.
    pub fn set_objective(
        &mut self,
        expr: &ExprBuilder,
        sense: ObjectiveSense,
    ) -> Result<(), Problem> {
        match expr.degree() {
            0 | 1 => {
                let f = expr.to_affine()?;
                self.set_linear_objective(&f, sense);
            }
            2 => {
                let f = expr.to_quadratic()?;
                self.set_quadratic_objective(&f, sense);
            }
            _ => return ModelError::IncompatibleObjectiveDegree.raise(),
        }
        Ok(())
    }

    pub fn objective_sense(&self) -> ObjectiveSense {
        self.objective_sense
    }

    /// `+1` for minimization, `-1` for maximization; the solver always
    /// minimizes `obj_sign * f`.
    fn obj_sign(&self) -> E {
        match self.objective_sense {
            ObjectiveSense::Minimize => 1.0,
            ObjectiveSense::Maximize => -1.0,
        }
    }

    // ---- raw solver options ----------------------------------------------

    pub fn set_raw_option_int(&mut self, name: &str, value: i64) {
        self.options_int.insert(name.to_string(), value);
    }

    pub fn set_raw_option_double(&mut self, name: &str, value: E) {
        self.options_num.insert(name.to_string(), value);
    }

    pub fn set_raw_option_string(&mut self, name: &str, value: &str) {
        self.options_str.insert(name.to_string(), value.to_string());
    }

    pub fn raw_options_int(&self) -> &HashMap<String, i64> {
        &self.options_int
    }

    pub fn raw_options_double(&self) -> &HashMap<String, E> {
        &self.options_num
    }

    pub fn raw_options_string(&self) -> &HashMap<String, String> {
        &self.options_str
    }

    // ---- structure phase -------------------------------------------------

    fn n_linear_rows(&self) -> usize {
        self.linear_con_lb.len()
    }

    fn n_quadratic_rows(&self) -> usize {
        self.quadratic_con_lb.len()
    }

    /// Aggregates groups, compiles per-group AD programs and kernels, and
    /// builds the global constraint layout, Jacobian / Hessian sparsity and
    /// sparse-gradient layout. Must run once after modeling and before the
    /// first evaluation.
    pub fn analyze_structure(&mut self) -> Result<(), Problem> {
        self.nonlinear.aggregate_constraint_groups();
        self.nonlinear.aggregate_objective_groups();

        self.compile_groups()?;

        self.nonlinear.calculate_constraint_graph_instances_offset();

        let n_linear = self.n_linear_rows();
        let n_quadratic = self.n_quadratic_rows();
        let n_nonlinear = self.nonlinear.n_constraint_rows();
        let nl_base = n_linear + n_quadratic;

        // internal row order: [linear | quadratic | nonlinear groups]
        self.nl_constraint_map_ext2int = vec![0; self.n_nl_constraints];
        self.con_lb = vec![E::NEG_INFINITY; nl_base + n_nonlinear];
        self.con_ub = vec![E::INFINITY; nl_base + n_nonlinear];
        self.con_lb[..n_linear].copy_from_slice(&self.linear_con_lb);
        self.con_ub[..n_linear].copy_from_slice(&self.linear_con_ub);
        self.con_lb[n_linear..nl_base].copy_from_slice(&self.quadratic_con_lb);
        self.con_ub[n_linear..nl_base].copy_from_slice(&self.quadratic_con_ub);
        for ext in 0..self.n_nl_constraints {
            let instance = self.nl_constraint_graph_instance_indices[ext];
            let order = self.nl_constraint_graph_instance_orders[ext];
            let row = nl_base + self.nonlinear.constraint_indices_offset(instance) + order;
            self.nl_constraint_map_ext2int[ext] = row;
            self.con_lb[row] = self.nl_con_lb[ext];
            self.con_ub[row] = self.nl_con_ub[ext];
        }

        // global Jacobian: linear rows first, then quadratic, then nonlinear
        self.jacobian_nnz = 0;
        self.jacobian_rows.clear();
        self.jacobian_cols.clear();
        self.linear_con_evaluator.analyze_jacobian_structure(
            0,
            &mut self.jacobian_nnz,
            &mut self.jacobian_rows,
            &mut self.jacobian_cols,
        );
        self.quadratic_con_evaluator.analyze_jacobian_structure(
            n_linear,
            &mut self.jacobian_nnz,
            &mut self.jacobian_rows,
            &mut self.jacobian_cols,
        );
        self.nonlinear.analyze_constraints_jacobian_structure(
            nl_base,
            &mut self.jacobian_nnz,
            &mut self.jacobian_rows,
            &mut self.jacobian_cols,
        );

        // global Hessian: every contributor drives the shared index map
        self.hessian_nnz = 0;
        self.hessian_rows.clear();
        self.hessian_cols.clear();
        self.hessian_index_map.clear();
        if let Some(ObjectiveCore::Quadratic(quadratic)) = &mut self.objective_core {
            quadratic.analyze_hessian_structure(
                &mut self.hessian_nnz,
                &mut self.hessian_rows,
                &mut self.hessian_cols,
                &mut self.hessian_index_map,
                self.hessian_type,
            );
        }
        self.quadratic_con_evaluator.analyze_hessian_structure(
            &mut self.hessian_nnz,
            &mut self.hessian_rows,
            &mut self.hessian_cols,
            &mut self.hessian_index_map,
            self.hessian_type,
        );
        for kind in [GroupKind::Objective, GroupKind::Constraint] {
            self.nonlinear.analyze_hessian_structure(
                kind,
                &mut self.hessian_nnz,
                &mut self.hessian_rows,
                &mut self.hessian_cols,
                &mut self.hessian_index_map,
                self.hessian_type,
            );
        }

        // sparse objective gradient: objective core columns first, then the
        // nonlinear gradient map
        self.sparse_gradient_indices.clear();
        self.gradient_core_slots.clear();
        let mut sparse_gradient_map: HashMap<I, I> = HashMap::new();
        if let Some(core) = &self.objective_core {
            let mut nnz = 0;
            let mut rows = Vec::new();
            let mut cols = Vec::new();
            core.analyze_jacobian_structure(0, &mut nnz, &mut rows, &mut cols);
            for col in cols {
                let slot = *sparse_gradient_map.entry(col).or_insert_with(|| {
                    let slot = self.sparse_gradient_indices.len();
                    self.sparse_gradient_indices.push(col);
                    slot
                });
                self.gradient_core_slots.push(slot);
            }
            self.core_jacobian_scratch = vec![0.0; nnz];
        }
        self.nonlinear.analyze_objective_gradient_structure(
            &mut self.sparse_gradient_indices,
            &mut sparse_gradient_map,
        );
        self.sparse_gradient_values = vec![0.0; self.sparse_gradient_indices.len()];

        self.structure_ready = true;
        Ok(())
    }

    /// Traces the representative of every group and installs its symbolic
    /// structure and kernel block.
    fn compile_groups(&mut self) -> Result<(), Problem> {
        for group_index in 0..self.nonlinear.constraint_groups().len() {
            let representative = self
                .nonlinear
                .get_constraint_group_representative(group_index)?;
            let graph = self.graphs[representative]
                .as_ref()
                .ok_or_else(|| graph_not_finalized())?;
            let tape = trace_graph(graph, graph.constraint_outputs())?;
            let record = autodiff(tape, self.hessian_type);
            self.nonlinear
                .assign_constraint_group_autodiff_structure(group_index, record.structure.clone())?;
            let kernel = ConstraintKernel::from_record(record)?;
            self.nonlinear
                .assign_constraint_group_autodiff_evaluator(group_index, kernel)?;
        }

        for group_index in 0..self.nonlinear.objective_groups().len() {
            let representative = self
                .nonlinear
                .get_objective_group_representative(group_index)?;
            let graph = self.graphs[representative]
                .as_ref()
                .ok_or_else(|| graph_not_finalized())?;
            let tape = trace_graph(graph, graph.objective_outputs())?;
            let record = autodiff(tape, self.hessian_type);
            self.nonlinear
                .assign_objective_group_autodiff_structure(group_index, record.structure.clone())?;
            let kernel = ObjectiveKernel::from_record(record)?;
            self.nonlinear
                .assign_objective_group_autodiff_evaluator(group_index, kernel)?;
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), Problem> {
        if self.structure_ready {
            Ok(())
        } else {
            ModelError::StructureNotReady.raise()
        }
    }

    // ---- structure accessors ---------------------------------------------

    /// The underlying group engine; read-only.
    pub fn nonlinear(&self) -> &NonlinearEvaluator {
        &self.nonlinear
    }

    pub fn n_constraints(&self) -> usize {
        self.con_lb.len()
    }

    pub fn constraint_lower_bounds(&self) -> &[E] {
        &self.con_lb
    }

    pub fn constraint_upper_bounds(&self) -> &[E] {
        &self.con_ub
    }

    pub fn jacobian_nnz(&self) -> usize {
        self.jacobian_nnz
    }

    /// COO structure of `∇c`, fixed at structure time.
    pub fn jacobian_structure(&self) -> (&[I], &[I]) {
        (&self.jacobian_rows, &self.jacobian_cols)
    }

    pub fn hessian_nnz(&self) -> usize {
        self.hessian_nnz
    }

    /// COO structure of `∇²L` on the chosen triangle, fixed at structure
    /// time; free of duplicate coordinates.
    pub fn hessian_structure(&self) -> (&[I], &[I]) {
        (&self.hessian_rows, &self.hessian_cols)
    }

    /// Columns of the sparse objective gradient.
    pub fn gradient_structure(&self) -> &[I] {
        &self.sparse_gradient_indices
    }

    /// Internal row of an externally indexed constraint.
    pub fn constraint_internal_index(&self, constraint: ConstraintIndex) -> Result<I, Problem> {
        self.ensure_ready()?;
        match constraint.kind {
            ConstraintKind::Linear => Ok(constraint.index),
            ConstraintKind::Quadratic => Ok(self.n_linear_rows() + constraint.index),
            ConstraintKind::Nonlinear => Ok(self.nl_constraint_map_ext2int[constraint.index]),
        }
    }

    // ---- evaluation callbacks --------------------------------------------

    /// `f(x)`, sense-adjusted so the embedding solver always minimizes.
    pub fn eval_objective(&self, x: &[E]) -> Result<E, Problem> {
        self.ensure_ready()?;
        let mut objective = self.nonlinear.eval_objective(x)?;
        if let Some(core) = &self.objective_core {
            let mut row = [0.0];
            core.eval_function(x, &mut row);
            objective += row[0];
        }
        Ok(self.obj_sign() * objective)
    }

    /// `c(x)` in internal row order.
    pub fn eval_constraints(&self, x: &[E], g: &mut [E]) -> Result<(), Problem> {
        self.ensure_ready()?;
        let n_linear = self.n_linear_rows();
        let nl_base = n_linear + self.n_quadratic_rows();
        self.linear_con_evaluator
            .eval_function(x, &mut g[..n_linear]);
        self.quadratic_con_evaluator
            .eval_function(x, &mut g[n_linear..nl_base]);
        self.nonlinear.eval_constraints(x, &mut g[nl_base..])
    }

    /// Sparse `∇f(x)`: returns the column list and the matching values.
    pub fn eval_objective_gradient(&mut self, x: &[E]) -> Result<(&[I], &[E]), Problem> {
        self.ensure_ready()?;
        self.sparse_gradient_values.fill(0.0);
        if let Some(core) = &self.objective_core {
            core.eval_jacobian(x, &mut self.core_jacobian_scratch);
            for (k, &slot) in self.gradient_core_slots.iter().enumerate() {
                self.sparse_gradient_values[slot] += self.core_jacobian_scratch[k];
            }
        }
        self.nonlinear
            .eval_objective_gradient(x, &mut self.sparse_gradient_values)?;
        let sign = self.obj_sign();
        if sign != 1.0 {
            for value in &mut self.sparse_gradient_values {
                *value *= sign;
            }
        }
        Ok((&self.sparse_gradient_indices, &self.sparse_gradient_values))
    }

    /// `∇c(x)` values aligned with [`Self::jacobian_structure`].
    pub fn eval_constraints_jacobian(&self, x: &[E], values: &mut [E]) -> Result<(), Problem> {
        self.ensure_ready()?;
        let n_linear_nnz = self.linear_con_evaluator.jacobian_nnz();
        let n_quadratic_nnz = self.quadratic_con_evaluator.jacobian_nnz();
        let nl_base = n_linear_nnz + n_quadratic_nnz;
        self.linear_con_evaluator
            .eval_jacobian(x, &mut values[..n_linear_nnz]);
        self.quadratic_con_evaluator
            .eval_jacobian(x, &mut values[n_linear_nnz..nl_base]);
        self.nonlinear
            .eval_constraints_jacobian(x, &mut values[nl_base..])
    }

    /// `∇²L(x, λ, σ) = σ∇²f + Σᵢ λᵢ∇²cᵢ` on the chosen triangle, aligned
    /// with [`Self::hessian_structure`]. `lambda` is indexed by internal
    /// row order.
    pub fn eval_lagrangian_hessian(
        &self,
        x: &[E],
        lambda: &[E],
        sigma: E,
        values: &mut [E],
    ) -> Result<(), Problem> {
        self.ensure_ready()?;
        values.fill(0.0);
        let sigma = sigma * self.obj_sign();
        let n_linear = self.n_linear_rows();
        let nl_base = n_linear + self.n_quadratic_rows();

        if let Some(ObjectiveCore::Quadratic(quadratic)) = &self.objective_core {
            quadratic.eval_lagrangian_hessian(&[sigma], values);
        }
        self.quadratic_con_evaluator
            .eval_lagrangian_hessian(&lambda[n_linear..nl_base], values);
        self.nonlinear
            .eval_lagrangian_hessian(x, &lambda[nl_base..], sigma, values)
    }

    // ---- solution plumbing -----------------------------------------------

    /// Installs the solver's solution. `solution.obj_value` carries the
    /// internal (minimization) objective.
    pub fn set_solution(&mut self, solution: NlpSolution) {
        self.result = Some(solution);
    }

    pub fn solution(&self) -> Result<&NlpSolution, Problem> {
        match &self.result {
            Some(solution) => Ok(solution),
            None => ModelError::NoSolution.raise(),
        }
    }

    /// Objective value in the user's sense.
    pub fn get_obj_value(&self) -> Result<E, Problem> {
        Ok(self.obj_sign() * self.solution()?.obj_value)
    }

    pub fn get_variable_value(&self, variable: VariableIndex) -> Result<E, Problem> {
        Ok(self.solution()?.x[variable.index as usize])
    }

    pub fn get_constraint_primal(&self, constraint: ConstraintIndex) -> Result<E, Problem> {
        let row = self.constraint_internal_index(constraint)?;
        Ok(self.solution()?.g[row])
    }

    pub fn get_constraint_dual(&self, constraint: ConstraintIndex) -> Result<E, Problem> {
        let row = self.constraint_internal_index(constraint)?;
        Ok(self.solution()?.mult_g[row])
    }

    /// Copies the solution point into the variable start values so the next
    /// solve warm-starts from it.
    pub fn load_current_solution(&mut self) -> Result<(), Problem> {
        let x = self.solution()?.x.clone();
        self.var_init.copy_from_slice(&x);
        Ok(())
    }

    pub fn get_affine_expression_value(&self, f: &ScalarAffineFunction) -> Result<E, Problem> {
        Ok(f.value(&self.solution()?.x))
    }

    pub fn get_quadratic_expression_value(
        &self,
        f: &ScalarQuadraticFunction,
    ) -> Result<E, Problem> {
        Ok(f.value(&self.solution()?.x))
    }

    pub fn get_expr_builder_value(&self, expr: &ExprBuilder) -> Result<E, Problem> {
        Ok(expr.value(&self.solution()?.x))
    }
}

fn graph_not_finalized() -> Problem {
    use problemo::common::IntoCommonProblem;
    "graph instance was not finalized before structure analysis".gloss()
}
