//! Nonlinear evaluator and group engine.
//!
//! Graph instances accumulate during modeling; aggregation folds instances
//! with equal structural hashes into groups, and every group shares a single
//! AD program and kernel block built from its representative (first) instance.
//! Structure analysis then maps each instance's local Jacobian / Hessian
//! entries onto the global sparse arrays, and evaluation dispatches the
//! per-group kernels across instances, sliding output cursors in the same
//! order the analysis used.

use std::collections::HashMap;

use problemo::Problem;

use crate::ad::structure::AutodiffSymbolicStructure;
use crate::expr::graph::ExpressionGraph;
use crate::{E, HessianSparsityType, I, ModelError};

use super::kernel::{ConstraintKernel, ObjectiveKernel};
use super::{HessianIndexMap, intern_hessian_entry, reduce_to_triangle};

/// Per-instance data: the global indices of the instance's independent
/// variables (in trace order) and the values of its dynamic parameters.
#[derive(Debug, Clone, Default)]
pub struct GraphInput {
    pub variables: Vec<I>,
    pub constants: Vec<E>,
}

#[derive(Debug, Clone, Copy)]
struct GraphHash {
    hash: u64,
    index: I,
}

/// Hash log of finalized instances; aggregation consumes only the suffix
/// added since the previous call.
#[derive(Debug, Default)]
struct GraphHashLog {
    hashes: Vec<GraphHash>,
    n_hashes_since_last_aggregation: usize,
}

/// Which group an instance belongs to, and its rank inside that group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMembership {
    pub group: I,
    pub rank: I,
}

/// Equivalence class of constraint-carrying instances under structural hash.
#[derive(Debug, Default)]
pub struct ConstraintGroup {
    pub instance_indices: Vec<I>,
    pub structure: AutodiffSymbolicStructure,
    kernel: Option<ConstraintKernel>,
    /// Global Hessian slot of each local entry of each instance;
    /// length `n_instances * local_hessian_nnz`.
    pub hessian_indices: Vec<I>,
}

/// Equivalence class of objective-carrying instances under structural hash.
#[derive(Debug, Default)]
pub struct ObjectiveGroup {
    pub instance_indices: Vec<I>,
    pub structure: AutodiffSymbolicStructure,
    kernel: Option<ObjectiveKernel>,
    /// Global sparse-gradient slot of each local Jacobian entry of each
    /// instance; length `n_instances * local_jacobian_nnz`.
    pub gradient_indices: Vec<I>,
    /// As [`ConstraintGroup::hessian_indices`].
    pub hessian_indices: Vec<I>,
}

/// Selects which family of groups an operation applies to; constraint and
/// objective Hessian analysis share one routine parameterized on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Constraint,
    Objective,
}

#[derive(Debug, Default)]
pub struct NonlinearEvaluator {
    n_graph_instances: usize,
    graph_inputs: Vec<GraphInput>,

    constraint_hashes: GraphHashLog,
    objective_hashes: GraphHashLog,

    constraint_memberships: Vec<Option<GroupMembership>>,
    objective_memberships: Vec<Option<GroupMembership>>,

    /// First constraint row of each instance in the nonlinear block.
    constraint_indices_offsets: Vec<I>,
    /// Total number of nonlinear constraint rows; valid after
    /// [`Self::calculate_constraint_graph_instances_offset`].
    n_constraint_rows: usize,

    constraint_groups: Vec<ConstraintGroup>,
    hash_to_constraint_group: HashMap<u64, I>,

    objective_groups: Vec<ObjectiveGroup>,
    hash_to_objective_group: HashMap<u64, I>,
}

impl NonlinearEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_graph_instances(&self) -> usize {
        self.n_graph_instances
    }

    pub fn graph_input(&self, instance_index: I) -> &GraphInput {
        &self.graph_inputs[instance_index]
    }

    pub fn constraint_membership(&self, instance_index: I) -> Option<GroupMembership> {
        self.constraint_memberships.get(instance_index).copied().flatten()
    }

    pub fn objective_membership(&self, instance_index: I) -> Option<GroupMembership> {
        self.objective_memberships.get(instance_index).copied().flatten()
    }

    pub fn constraint_groups(&self) -> &[ConstraintGroup] {
        &self.constraint_groups
    }

    pub fn objective_groups(&self) -> &[ObjectiveGroup] {
        &self.objective_groups
    }

    pub fn constraint_indices_offset(&self, instance_index: I) -> I {
        self.constraint_indices_offsets[instance_index]
    }

    /// Total number of nonlinear constraint rows across all groups.
    pub fn n_constraint_rows(&self) -> usize {
        self.n_constraint_rows
    }

    /// Allocates a fresh instance slot and returns its index.
    pub fn add_graph_instance(&mut self) -> I {
        let index = self.n_graph_instances;
        self.n_graph_instances += 1;
        self.graph_inputs.push(GraphInput::default());
        index
    }

    /// Snapshots the instance's variable identities and dynamic parameter
    /// values and appends its structural hash to the constraint and/or
    /// objective logs, depending on which outputs the graph carries.
    pub fn finalize_graph_instance(
        &mut self,
        graph_index: I,
        graph: &ExpressionGraph,
        constants: Vec<E>,
    ) {
        let body_hash = graph.main_structure_hash();

        let input = &mut self.graph_inputs[graph_index];
        input.variables = graph.variables().iter().map(|v| v.id as I).collect();
        input.constants = constants;

        if graph.has_constraint_output() {
            self.constraint_hashes.hashes.push(GraphHash {
                hash: graph.constraint_structure_hash(body_hash),
                index: graph_index,
            });
        }

        if graph.has_objective_output() {
            self.objective_hashes.hashes.push(GraphHash {
                hash: graph.objective_structure_hash(body_hash),
                index: graph_index,
            });
        }
    }

    /// Assigns every not-yet-aggregated constraint instance to its group.
    /// Idempotent over previously aggregated prefixes; returns the total
    /// group count.
    pub fn aggregate_constraint_groups(&mut self) -> usize {
        aggregate(
            self.n_graph_instances,
            &mut self.constraint_hashes,
            &mut self.constraint_memberships,
            &mut self.hash_to_constraint_group,
            &mut self.constraint_groups,
            |group| &mut group.instance_indices,
        )
    }

    /// Objective mirror of [`Self::aggregate_constraint_groups`].
    pub fn aggregate_objective_groups(&mut self) -> usize {
        aggregate(
            self.n_graph_instances,
            &mut self.objective_hashes,
            &mut self.objective_memberships,
            &mut self.hash_to_objective_group,
            &mut self.objective_groups,
            |group| &mut group.instance_indices,
        )
    }

    /// First instance of the group; its variables and constants parameterize
    /// the group's AD program.
    pub fn get_constraint_group_representative(&self, group_index: I) -> Result<I, Problem> {
        match self.constraint_groups.get(group_index) {
            Some(group) => Ok(group.instance_indices[0]),
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    pub fn get_objective_group_representative(&self, group_index: I) -> Result<I, Problem> {
        match self.objective_groups.get(group_index) {
            Some(group) => Ok(group.instance_indices[0]),
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    pub fn assign_constraint_group_autodiff_structure(
        &mut self,
        group_index: I,
        structure: AutodiffSymbolicStructure,
    ) -> Result<(), Problem> {
        match self.constraint_groups.get_mut(group_index) {
            Some(group) => {
                group.structure = structure;
                Ok(())
            }
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    pub fn assign_constraint_group_autodiff_evaluator(
        &mut self,
        group_index: I,
        kernel: ConstraintKernel,
    ) -> Result<(), Problem> {
        match self.constraint_groups.get_mut(group_index) {
            Some(group) => {
                group.kernel = Some(kernel);
                Ok(())
            }
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    pub fn assign_objective_group_autodiff_structure(
        &mut self,
        group_index: I,
        structure: AutodiffSymbolicStructure,
    ) -> Result<(), Problem> {
        match self.objective_groups.get_mut(group_index) {
            Some(group) => {
                group.structure = structure;
                Ok(())
            }
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    pub fn assign_objective_group_autodiff_evaluator(
        &mut self,
        group_index: I,
        kernel: ObjectiveKernel,
    ) -> Result<(), Problem> {
        match self.objective_groups.get_mut(group_index) {
            Some(group) => {
                group.kernel = Some(kernel);
                Ok(())
            }
            None => ModelError::GroupIndexOutOfRange.raise(),
        }
    }

    /// Walks groups in storage order and assigns each constraint-carrying
    /// instance a contiguous block of `ny` output rows.
    pub fn calculate_constraint_graph_instances_offset(&mut self) {
        self.constraint_indices_offsets = vec![0; self.n_graph_instances];
        let mut counter = 0;
        for group in &self.constraint_groups {
            let ny = group.structure.ny;
            for &instance_index in &group.instance_indices {
                self.constraint_indices_offsets[instance_index] = counter;
                counter += ny;
            }
        }
        self.n_constraint_rows = counter;
    }

    /// Appends the COO structure of the nonlinear constraint Jacobian, with
    /// rows offset by `row_base` and local columns mapped through each
    /// instance's variables.
    pub fn analyze_constraints_jacobian_structure(
        &self,
        row_base: I,
        global_jacobian_nnz: &mut I,
        global_jacobian_rows: &mut Vec<I>,
        global_jacobian_cols: &mut Vec<I>,
    ) {
        let mut row_base = row_base;
        for group in &self.constraint_groups {
            let structure = &group.structure;
            if !structure.has_jacobian {
                // rows still advance past this group's outputs
                row_base += structure.ny * group.instance_indices.len();
                continue;
            }

            for &instance_index in &group.instance_indices {
                let variables = &self.graph_inputs[instance_index].variables;
                for k in 0..structure.jacobian_nnz {
                    global_jacobian_rows.push(structure.jacobian_rows[k] + row_base);
                    global_jacobian_cols.push(variables[structure.jacobian_cols[k]]);
                }
                row_base += structure.ny;
            }

            *global_jacobian_nnz += structure.jacobian_nnz * group.instance_indices.len();
        }
    }

    /// Interns every objective gradient column in `sparse_gradient_map`,
    /// recording for each instance the global slot of each local entry.
    pub fn analyze_objective_gradient_structure(
        &mut self,
        global_gradient_cols: &mut Vec<I>,
        sparse_gradient_map: &mut HashMap<I, I>,
    ) {
        for group in &mut self.objective_groups {
            let structure = &group.structure;
            if !structure.has_jacobian {
                continue;
            }

            group.gradient_indices.clear();
            group
                .gradient_indices
                .reserve(group.instance_indices.len() * structure.jacobian_nnz);

            for &instance_index in &group.instance_indices {
                let variables = &self.graph_inputs[instance_index].variables;
                for k in 0..structure.jacobian_nnz {
                    let col = variables[structure.jacobian_cols[k]];
                    let slot = *sparse_gradient_map.entry(col).or_insert_with(|| {
                        let slot = global_gradient_cols.len();
                        global_gradient_cols.push(col);
                        slot
                    });
                    group.gradient_indices.push(slot);
                }
            }
        }
    }

    /// Resolves the global Hessian slot of every local entry of every
    /// instance of the selected group family. Constraint and objective
    /// groups share the routine and the global index map, so symmetric
    /// contributions from either land in the same slot.
    pub fn analyze_hessian_structure(
        &mut self,
        kind: GroupKind,
        global_hessian_nnz: &mut I,
        global_hessian_rows: &mut Vec<I>,
        global_hessian_cols: &mut Vec<I>,
        hessian_index_map: &mut HessianIndexMap,
        hessian_type: HessianSparsityType,
    ) {
        match kind {
            GroupKind::Constraint => hessian_pass(
                self.constraint_groups.iter_mut().map(|group| {
                    let ConstraintGroup {
                        structure,
                        instance_indices,
                        hessian_indices,
                        ..
                    } = group;
                    (&*structure, &*instance_indices, hessian_indices)
                }),
                &self.graph_inputs,
                global_hessian_nnz,
                global_hessian_rows,
                global_hessian_cols,
                hessian_index_map,
                hessian_type,
            ),
            GroupKind::Objective => hessian_pass(
                self.objective_groups.iter_mut().map(|group| {
                    let ObjectiveGroup {
                        structure,
                        instance_indices,
                        hessian_indices,
                        ..
                    } = group;
                    (&*structure, &*instance_indices, hessian_indices)
                }),
                &self.graph_inputs,
                global_hessian_nnz,
                global_hessian_rows,
                global_hessian_cols,
                hessian_index_map,
                hessian_type,
            ),
        }
    }

    /// Evaluates all nonlinear constraint rows into `f`, ordered as in
    /// [`Self::calculate_constraint_graph_instances_offset`].
    pub fn eval_constraints(&self, x: &[E], f: &mut [E]) -> Result<(), Problem> {
        let mut cursor = f;
        for group in &self.constraint_groups {
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            let ny = group.structure.ny;
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                let (head, rest) = std::mem::take(&mut cursor).split_at_mut(ny);
                kernel.eval_function(x, &input.constants, head, &input.variables);
                cursor = rest;
            }
        }
        Ok(())
    }

    /// Sum of all objective instances at `x`.
    pub fn eval_objective(&self, x: &[E]) -> Result<E, Problem> {
        let mut objective = 0.0;
        for group in &self.objective_groups {
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                kernel.eval_function(x, &input.constants, &mut objective, &input.variables);
            }
        }
        Ok(objective)
    }

    /// Evaluates the nonlinear constraint Jacobian values, aligned with the
    /// COO layout of [`Self::analyze_constraints_jacobian_structure`].
    pub fn eval_constraints_jacobian(&self, x: &[E], jacobian: &mut [E]) -> Result<(), Problem> {
        let mut cursor = jacobian;
        for group in &self.constraint_groups {
            let structure = &group.structure;
            if !structure.has_jacobian {
                continue;
            }
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                let (head, rest) =
                    std::mem::take(&mut cursor).split_at_mut(structure.jacobian_nnz);
                kernel.eval_jacobian(x, &input.constants, head, &input.variables);
                cursor = rest;
            }
        }
        Ok(())
    }

    /// Scatter-adds the objective gradient into `grad_f` through each
    /// group's `gradient_indices`.
    pub fn eval_objective_gradient(&self, x: &[E], grad_f: &mut [E]) -> Result<(), Problem> {
        for group in &self.objective_groups {
            let structure = &group.structure;
            if !structure.has_jacobian {
                continue;
            }
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            let mut index_cursor = group.gradient_indices.as_slice();
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                let (head, rest) = index_cursor.split_at(structure.jacobian_nnz);
                kernel.eval_gradient(x, &input.constants, grad_f, &input.variables, head);
                index_cursor = rest;
            }
        }
        Ok(())
    }

    /// Scatter-adds `σ ∇²f_obj + Σᵢ λᵢ ∇²cᵢ` into `hessian`. The caller
    /// zeroes the buffer; `lambda` covers the nonlinear rows in internal
    /// order.
    pub fn eval_lagrangian_hessian(
        &self,
        x: &[E],
        lambda: &[E],
        obj_factor: E,
        hessian: &mut [E],
    ) -> Result<(), Problem> {
        for group in &self.objective_groups {
            let structure = &group.structure;
            if !structure.has_hessian {
                continue;
            }
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            let weights = vec![obj_factor; structure.ny];
            let mut index_cursor = group.hessian_indices.as_slice();
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                let (head, rest) = index_cursor.split_at(structure.hessian_nnz);
                kernel.eval_hessian(
                    x,
                    &input.constants,
                    &weights,
                    hessian,
                    &input.variables,
                    head,
                );
                index_cursor = rest;
            }
        }

        let mut lambda_cursor = lambda;
        for group in &self.constraint_groups {
            let structure = &group.structure;
            let ny = structure.ny;
            if !structure.has_hessian {
                // the multiplier cursor still advances past this group
                lambda_cursor = &lambda_cursor[ny * group.instance_indices.len()..];
                continue;
            }
            let Some(kernel) = &group.kernel else {
                return ModelError::StructureNotReady.raise();
            };
            let mut index_cursor = group.hessian_indices.as_slice();
            for &instance_index in &group.instance_indices {
                let input = &self.graph_inputs[instance_index];
                let (weights, lambda_rest) = lambda_cursor.split_at(ny);
                let (head, index_rest) = index_cursor.split_at(structure.hessian_nnz);
                kernel.eval_hessian(x, &input.constants, weights, hessian, &input.variables, head);
                lambda_cursor = lambda_rest;
                index_cursor = index_rest;
            }
        }
        Ok(())
    }
}

/// Shared aggregation walk over the unprocessed suffix of a hash log.
fn aggregate<G: Default>(
    n_graph_instances: usize,
    log: &mut GraphHashLog,
    memberships: &mut Vec<Option<GroupMembership>>,
    hash_to_group: &mut HashMap<u64, I>,
    groups: &mut Vec<G>,
    instance_indices: impl Fn(&mut G) -> &mut Vec<I>,
) -> usize {
    memberships.resize(n_graph_instances, None);

    for graph_hash in &log.hashes[log.n_hashes_since_last_aggregation..] {
        let group_index = *hash_to_group.entry(graph_hash.hash).or_insert_with(|| {
            groups.push(G::default());
            groups.len() - 1
        });
        let instances = instance_indices(&mut groups[group_index]);
        memberships[graph_hash.index] = Some(GroupMembership {
            group: group_index,
            rank: instances.len(),
        });
        instances.push(graph_hash.index);
    }

    log.n_hashes_since_last_aggregation = log.hashes.len();
    groups.len()
}

/// One Hessian structure pass over a family of groups; see
/// [`NonlinearEvaluator::analyze_hessian_structure`].
fn hessian_pass<'a>(
    groups: impl Iterator<Item = (&'a AutodiffSymbolicStructure, &'a Vec<I>, &'a mut Vec<I>)>,
    graph_inputs: &[GraphInput],
    global_hessian_nnz: &mut I,
    global_hessian_rows: &mut Vec<I>,
    global_hessian_cols: &mut Vec<I>,
    hessian_index_map: &mut HessianIndexMap,
    hessian_type: HessianSparsityType,
) {
    for (structure, instance_indices, hessian_indices) in groups {
        if !structure.has_hessian {
            continue;
        }

        hessian_indices.clear();
        hessian_indices.reserve(instance_indices.len() * structure.hessian_nnz);

        for &instance_index in instance_indices {
            let variables = &graph_inputs[instance_index].variables;
            for k in 0..structure.hessian_nnz {
                let row = variables[structure.hessian_rows[k]];
                let col = variables[structure.hessian_cols[k]];
                let (row, col) = reduce_to_triangle(row, col, hessian_type);
                let slot = intern_hessian_entry(
                    hessian_index_map,
                    row,
                    col,
                    global_hessian_nnz,
                    global_hessian_rows,
                    global_hessian_cols,
                );
                hessian_indices.push(slot);
            }
        }
    }
}
