//! # Expression Graphs
//!
//! A typed DAG of algebraic operators whose leaves are decision variables,
//! numeric constants and dynamic parameters. Nodes live in seven append-only
//! arrays (one per node kind) and are addressed by [`ExpressionHandle`], a
//! `(kind, id)` pair that stays valid for the lifetime of the graph.
//!
//! The graph also produces the structural hashes that the group engine uses
//! to detect structurally-identical graph instances: two graphs with the same
//! node layout, operator tags and output lists hash equal, independently of
//! which concrete variables or parameter values each instance binds.

use std::collections::HashMap;
use std::fmt;

use crate::E;

/// Stable identifier of a decision variable or parameter owned by the model.
pub type EntityId = u32;
/// Index of a node inside one of the per-kind arrays of a graph.
pub type NodeId = u32;

/// Discriminates the seven per-kind node arrays of an [`ExpressionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant,
    Variable,
    Parameter,
    Unary,
    Binary,
    Ternary,
    Nary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Neg,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Abs,
    Sqrt,
    Exp,
    Log,
    Log10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Sub,
    Div,
    Pow,

    // compare
    LessThan,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    GreaterThan,
}

impl BinaryOperator {
    /// Whether this operator compares its operands instead of computing a
    /// value. Comparison operators may only appear as the condition of an
    /// [`TernaryOperator::IfThenElse`] node.
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinaryOperator::LessThan
                | BinaryOperator::LessEqual
                | BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::GreaterEqual
                | BinaryOperator::GreaterThan
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOperator {
    IfThenElse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NaryOperator {
    Add,
    Mul,
}

/// Tagged reference to a node of an [`ExpressionGraph`].
///
/// Handles are only meaningful inside the graph that created them. Equality
/// is bitwise on `(kind, id)`, which makes the handle itself the memo key for
/// shared sub-expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpressionHandle {
    pub kind: NodeKind,
    pub id: NodeId,
}

impl ExpressionHandle {
    pub fn new(kind: NodeKind, id: NodeId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ExpressionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            NodeKind::Constant => 'c',
            NodeKind::Variable => 'v',
            NodeKind::Parameter => 'p',
            NodeKind::Unary => 'u',
            NodeKind::Binary => 'b',
            NodeKind::Ternary => 't',
            NodeKind::Nary => 'n',
        };
        write!(f, "{}{}", tag, self.id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VariableNode {
    pub id: EntityId,
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantNode {
    pub value: E,
}

#[derive(Debug, Clone, Copy)]
pub struct ParameterNode {
    pub id: EntityId,
}

#[derive(Debug, Clone, Copy)]
pub struct UnaryNode {
    pub op: UnaryOperator,
    pub operand: ExpressionHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryNode {
    pub op: BinaryOperator,
    pub left: ExpressionHandle,
    pub right: ExpressionHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct TernaryNode {
    pub op: TernaryOperator,
    /// Condition; must be a comparison [`BinaryNode`].
    pub condition: ExpressionHandle,
    pub if_true: ExpressionHandle,
    pub if_false: ExpressionHandle,
}

#[derive(Debug, Clone)]
pub struct NaryNode {
    pub op: NaryOperator,
    pub operands: Vec<ExpressionHandle>,
}

/// Append-only expression DAG.
///
/// Every handle stored anywhere in the graph refers to a node created earlier
/// in the same graph, so the graph is acyclic by construction and handles
/// never dangle.
#[derive(Debug, Clone, Default)]
pub struct ExpressionGraph {
    pub(crate) variables: Vec<VariableNode>,
    pub(crate) constants: Vec<ConstantNode>,
    pub(crate) parameters: Vec<ParameterNode>,
    pub(crate) unaries: Vec<UnaryNode>,
    pub(crate) binaries: Vec<BinaryNode>,
    pub(crate) ternaries: Vec<TernaryNode>,
    pub(crate) naries: Vec<NaryNode>,

    pub(crate) constraint_outputs: Vec<ExpressionHandle>,
    pub(crate) objective_outputs: Vec<ExpressionHandle>,

    /// Enforces at most one [`VariableNode`] per [`EntityId`].
    variable_index_map: HashMap<EntityId, NodeId>,
}

impl ExpressionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn n_constants(&self) -> usize {
        self.constants.len()
    }

    pub fn n_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn variables(&self) -> &[VariableNode] {
        &self.variables
    }

    pub fn parameters(&self) -> &[ParameterNode] {
        &self.parameters
    }

    /// Adds a variable leaf, or returns the existing handle if `id` is
    /// already referenced by this graph.
    pub fn add_variable(&mut self, id: EntityId) -> ExpressionHandle {
        if let Some(&index) = self.variable_index_map.get(&id) {
            return ExpressionHandle::new(NodeKind::Variable, index);
        }
        let index = self.variables.len() as NodeId;
        self.variables.push(VariableNode { id });
        self.variable_index_map.insert(id, index);
        ExpressionHandle::new(NodeKind::Variable, index)
    }

    /// Adds a constant leaf. Constants are not deduplicated by value; callers
    /// that want numeric sharing reuse the returned handle.
    pub fn add_constant(&mut self, value: E) -> ExpressionHandle {
        self.constants.push(ConstantNode { value });
        ExpressionHandle::new(NodeKind::Constant, (self.constants.len() - 1) as NodeId)
    }

    pub fn add_parameter(&mut self, id: EntityId) -> ExpressionHandle {
        self.parameters.push(ParameterNode { id });
        ExpressionHandle::new(NodeKind::Parameter, (self.parameters.len() - 1) as NodeId)
    }

    pub fn add_unary(&mut self, op: UnaryOperator, operand: ExpressionHandle) -> ExpressionHandle {
        self.unaries.push(UnaryNode { op, operand });
        ExpressionHandle::new(NodeKind::Unary, (self.unaries.len() - 1) as NodeId)
    }

    pub fn add_binary(
        &mut self,
        op: BinaryOperator,
        left: ExpressionHandle,
        right: ExpressionHandle,
    ) -> ExpressionHandle {
        self.binaries.push(BinaryNode { op, left, right });
        ExpressionHandle::new(NodeKind::Binary, (self.binaries.len() - 1) as NodeId)
    }

    pub fn add_ternary(
        &mut self,
        op: TernaryOperator,
        condition: ExpressionHandle,
        if_true: ExpressionHandle,
        if_false: ExpressionHandle,
    ) -> ExpressionHandle {
        debug_assert!(self.is_compare_expression(&condition));
        self.ternaries.push(TernaryNode {
            op,
            condition,
            if_true,
            if_false,
        });
        ExpressionHandle::new(NodeKind::Ternary, (self.ternaries.len() - 1) as NodeId)
    }

    pub fn add_nary(
        &mut self,
        op: NaryOperator,
        operands: Vec<ExpressionHandle>,
    ) -> ExpressionHandle {
        self.naries.push(NaryNode { op, operands });
        ExpressionHandle::new(NodeKind::Nary, (self.naries.len() - 1) as NodeId)
    }

    /// Adds an n-ary node with `n` copies of the same operand.
    pub fn add_repeat_nary(
        &mut self,
        op: NaryOperator,
        operand: ExpressionHandle,
        n: usize,
    ) -> ExpressionHandle {
        self.add_nary(op, vec![operand; n])
    }

    /// Grows the operand list of an existing n-ary node in place. Only
    /// permissible before the graph is traced.
    pub fn append_nary(&mut self, expression: &ExpressionHandle, operand: ExpressionHandle) {
        debug_assert_eq!(expression.kind, NodeKind::Nary);
        self.naries[expression.id as usize].operands.push(operand);
    }

    pub fn get_nary_operator(&self, expression: &ExpressionHandle) -> NaryOperator {
        debug_assert_eq!(expression.kind, NodeKind::Nary);
        self.naries[expression.id as usize].op
    }

    pub fn add_constraint_output(&mut self, expression: ExpressionHandle) {
        self.constraint_outputs.push(expression);
    }

    pub fn add_objective_output(&mut self, expression: ExpressionHandle) {
        self.objective_outputs.push(expression);
    }

    pub fn has_constraint_output(&self) -> bool {
        !self.constraint_outputs.is_empty()
    }

    pub fn has_objective_output(&self) -> bool {
        !self.objective_outputs.is_empty()
    }

    pub fn constraint_outputs(&self) -> &[ExpressionHandle] {
        &self.constraint_outputs
    }

    pub fn objective_outputs(&self) -> &[ExpressionHandle] {
        &self.objective_outputs
    }

    /// Whether `expr` is a binary node carrying a comparison operator.
    pub fn is_compare_expression(&self, expr: &ExpressionHandle) -> bool {
        if expr.kind != NodeKind::Binary {
            return false;
        }
        self.binaries[expr.id as usize].op.is_compare()
    }

    /// Hash of the node arrays: kinds, operator tags and child handles
    /// (compared as `(kind, id)`). Leaf values never enter the hash — only
    /// the leaf array sizes do — so graphs with the same shape hash equal
    /// regardless of the numeric data each instance binds. Two graphs that
    /// hash equal here (and on the output extensions below) are folded into
    /// the same group by the group engine.
    pub fn main_structure_hash(&self) -> u64 {
        let mut hash = 0u64;
        hash_combine(&mut hash, self.variables.len() as u64);
        hash_combine(&mut hash, self.constants.len() as u64);
        hash_combine(&mut hash, self.parameters.len() as u64);

        for unary in &self.unaries {
            hash_combine(&mut hash, unary.op as u64);
            hash_combine(&mut hash, handle_bits(&unary.operand));
        }
        for binary in &self.binaries {
            hash_combine(&mut hash, binary.op as u64);
            hash_combine(&mut hash, handle_bits(&binary.left));
            hash_combine(&mut hash, handle_bits(&binary.right));
        }
        for ternary in &self.ternaries {
            hash_combine(&mut hash, ternary.op as u64);
            hash_combine(&mut hash, handle_bits(&ternary.condition));
            hash_combine(&mut hash, handle_bits(&ternary.if_true));
            hash_combine(&mut hash, handle_bits(&ternary.if_false));
        }
        for nary in &self.naries {
            hash_combine(&mut hash, nary.op as u64);
            for operand in &nary.operands {
                hash_combine(&mut hash, handle_bits(operand));
            }
        }
        hash
    }

    /// Extends a base hash with the constraint output list.
    pub fn constraint_structure_hash(&self, mut hash: u64) -> u64 {
        for output in &self.constraint_outputs {
            hash_combine(&mut hash, handle_bits(output));
        }
        hash
    }

    /// Extends a base hash with the objective output list.
    pub fn objective_structure_hash(&self, mut hash: u64) -> u64 {
        for output in &self.objective_outputs {
            hash_combine(&mut hash, handle_bits(output));
        }
        hash
    }
}

fn handle_bits(expr: &ExpressionHandle) -> u64 {
    ((expr.kind as u64) << 32) | expr.id as u64
}

// wyhash-style mixer: multiply into 128 bits and fold the halves so that
// single-bit input changes avalanche across the whole word.
fn wymix(a: u64, b: u64) -> u64 {
    let r = u128::from(a).wrapping_mul(u128::from(b));
    (r as u64) ^ ((r >> 64) as u64)
}

fn hash_combine(hash: &mut u64, value: u64) {
    *hash = wymix(*hash ^ 0xa076_1d64_78bd_642f, value ^ 0xe703_7ed1_a0b4_28db);
}

impl fmt::Display for ExpressionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Variables: {}", self.variables.len())?;
        for (i, v) in self.variables.iter().enumerate() {
            writeln!(f, "\tv{}: {}", i, v.id)?;
        }
        writeln!(f, "Constants: {}", self.constants.len())?;
        for (i, c) in self.constants.iter().enumerate() {
            writeln!(f, "\tc{}: {}", i, c.value)?;
        }
        writeln!(f, "Parameters: {}", self.parameters.len())?;
        for (i, p) in self.parameters.iter().enumerate() {
            writeln!(f, "\tp{}: {}", i, p.id)?;
        }
        writeln!(f, "Unary: {}", self.unaries.len())?;
        for (i, u) in self.unaries.iter().enumerate() {
            writeln!(f, "\tu{}: {:?}({})", i, u.op, u.operand)?;
        }
        writeln!(f, "Binary: {}", self.binaries.len())?;
        for (i, b) in self.binaries.iter().enumerate() {
            writeln!(f, "\tb{}: {:?}({},{})", i, b.op, b.left, b.right)?;
        }
        writeln!(f, "Ternary: {}", self.ternaries.len())?;
        for (i, t) in self.ternaries.iter().enumerate() {
            writeln!(
                f,
                "\tt{}: {:?}({},{},{})",
                i, t.op, t.condition, t.if_true, t.if_false
            )?;
        }
        writeln!(f, "Nary: {}", self.naries.len())?;
        for (i, n) in self.naries.iter().enumerate() {
            write!(f, "\tn{}: {:?}(", i, n.op)?;
            for operand in &n.operands {
                write!(f, "{}, ", operand)?;
            }
            writeln!(f, ")")?;
        }
        writeln!(f, "Constraint outputs: {}", self.constraint_outputs.len())?;
        for (i, output) in self.constraint_outputs.iter().enumerate() {
            writeln!(f, "\tcon{}: {}", i, output)?;
        }
        writeln!(f, "Objective outputs: {}", self.objective_outputs.len())?;
        for (i, output) in self.objective_outputs.iter().enumerate() {
            writeln!(f, "\tobj{}: {}", i, output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sin_of_square(var: EntityId) -> ExpressionGraph {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(var);
        let sq = graph.add_nary(NaryOperator::Mul, vec![x, x]);
        let s = graph.add_unary(UnaryOperator::Sin, sq);
        graph.add_objective_output(s);
        graph
    }

    #[test]
    fn add_variable_is_idempotent_per_id() {
        let mut graph = ExpressionGraph::new();
        let a = graph.add_variable(7);
        let b = graph.add_variable(7);
        let c = graph.add_variable(8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(graph.n_variables(), 2);
    }

    #[test]
    fn identical_layouts_hash_equal_across_variable_identities() {
        let g1 = sin_of_square(0);
        let g2 = sin_of_square(123);
        let h1 = g1.objective_structure_hash(g1.main_structure_hash());
        let h2 = g2.objective_structure_hash(g2.main_structure_hash());
        assert_eq!(h1, h2);
    }

    #[test]
    fn operator_change_breaks_hash() {
        let mut g1 = ExpressionGraph::new();
        let x = g1.add_variable(0);
        g1.add_unary(UnaryOperator::Sin, x);

        let mut g2 = ExpressionGraph::new();
        let x = g2.add_variable(0);
        g2.add_unary(UnaryOperator::Cos, x);

        assert_ne!(g1.main_structure_hash(), g2.main_structure_hash());
    }

    #[test]
    fn constant_values_do_not_affect_hash() {
        let mut g1 = ExpressionGraph::new();
        let x = g1.add_variable(0);
        let c = g1.add_constant(3.0);
        g1.add_nary(NaryOperator::Mul, vec![c, x]);

        let mut g2 = ExpressionGraph::new();
        let x = g2.add_variable(0);
        let c = g2.add_constant(5.0);
        g2.add_nary(NaryOperator::Mul, vec![c, x]);

        // same layout, operators and child handles: the embedded literal is
        // instance data, not structure
        assert_eq!(g1.main_structure_hash(), g2.main_structure_hash());

        // an extra node is structure
        let extra = g2.add_constant(5.0);
        g2.append_nary(&ExpressionHandle::new(NodeKind::Nary, 0), extra);
        assert_ne!(g1.main_structure_hash(), g2.main_structure_hash());
    }

    #[test]
    fn output_lists_extend_the_base_hash() {
        let mut g1 = sin_of_square(0);
        let g2 = sin_of_square(0);
        let base1 = g1.main_structure_hash();
        let base2 = g2.main_structure_hash();
        assert_eq!(base1, base2);

        // An extra constraint output changes only the constraint extension.
        let extra = g1.add_variable(0);
        g1.add_constraint_output(extra);
        assert_eq!(
            g1.objective_structure_hash(g1.main_structure_hash()),
            g2.objective_structure_hash(base2)
        );
        assert_ne!(
            g1.constraint_structure_hash(g1.main_structure_hash()),
            g2.constraint_structure_hash(base2)
        );
    }

    #[test]
    fn append_nary_changes_hash() {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(0);
        let y = graph.add_variable(1);
        let sum = graph.add_nary(NaryOperator::Add, vec![x, y]);
        let before = graph.main_structure_hash();
        graph.append_nary(&sum, x);
        assert_ne!(before, graph.main_structure_hash());
    }

    #[test]
    fn display_lists_every_section() {
        let graph = sin_of_square(0);
        let dump = graph.to_string();
        assert!(dump.contains("Variables: 1"));
        assert!(dump.contains("Nary: 1"));
        assert!(dump.contains("Objective outputs: 1"));
    }
}
