//! Tracing expression graphs into tapes.
//!
//! The trace walks an output list of an [`ExpressionGraph`] and instantiates
//! a [`Tape`] over the graph's variables (in `variables[]` order) and dynamic
//! parameters (in `constants[]` order). A memo keyed on [`ExpressionHandle`]
//! keeps shared sub-expressions shared on the tape; without it the tape size
//! is exponential in certain n-ary trees.

use std::collections::HashMap;

use problemo::Problem;

use crate::ModelError;
use crate::expr::graph::{
    BinaryOperator, ExpressionGraph, ExpressionHandle, NaryOperator, NodeKind,
};

use super::tape::{ArithOperator, CompareOperator, Slot, Tape};

/// Traces `outputs` of `graph` into a fresh tape `f: (p, x) -> y`.
pub fn trace_graph(
    graph: &ExpressionGraph,
    outputs: &[ExpressionHandle],
) -> Result<Tape, Problem> {
    let mut tape = Tape::new(graph.n_parameters(), graph.n_variables());
    let mut memo: HashMap<ExpressionHandle, Slot> = HashMap::new();
    for output in outputs {
        let slot = trace_expression(graph, output, &mut tape, &mut memo)?;
        tape.push_output(slot);
    }
    Ok(tape)
}

fn trace_expression(
    graph: &ExpressionGraph,
    expression: &ExpressionHandle,
    tape: &mut Tape,
    memo: &mut HashMap<ExpressionHandle, Slot>,
) -> Result<Slot, Problem> {
    if let Some(&slot) = memo.get(expression) {
        return Ok(slot);
    }
    let id = expression.id as usize;
    let slot = match expression.kind {
        NodeKind::Variable => tape.var(expression.id),
        NodeKind::Constant => tape.constant(graph.constants[id].value),
        NodeKind::Parameter => tape.param(expression.id),
        NodeKind::Unary => {
            let unary = graph.unaries[id];
            let operand = trace_expression(graph, &unary.operand, tape, memo)?;
            let slot = tape.unary(unary.op, operand);
            memo.insert(*expression, slot);
            slot
        }
        NodeKind::Binary => {
            let binary = graph.binaries[id];
            let left = trace_expression(graph, &binary.left, tape, memo)?;
            let right = trace_expression(graph, &binary.right, tape, memo)?;
            let op = match binary.op {
                BinaryOperator::Sub => ArithOperator::Sub,
                BinaryOperator::Div => ArithOperator::Div,
                BinaryOperator::Pow => ArithOperator::Pow,
                // Comparison operators carry no value of their own; they are
                // only legal as the condition of an if-then-else node.
                _ => return ModelError::InvalidComparisonExpression.raise(),
            };
            let slot = tape.binary(op, left, right);
            memo.insert(*expression, slot);
            slot
        }
        NodeKind::Ternary => {
            let ternary = graph.ternaries[id];
            if ternary.condition.kind != NodeKind::Binary {
                return ModelError::InvalidComparisonExpression.raise();
            }
            let condition = graph.binaries[ternary.condition.id as usize];
            if !condition.op.is_compare() {
                return ModelError::InvalidComparisonExpression.raise();
            }

            let left = trace_expression(graph, &condition.left, tape, memo)?;
            let right = trace_expression(graph, &condition.right, tape, memo)?;
            let if_true = trace_expression(graph, &ternary.if_true, tape, memo)?;
            let if_false = trace_expression(graph, &ternary.if_false, tape, memo)?;

            let slot = match condition.op {
                BinaryOperator::LessThan => {
                    tape.cond(CompareOperator::LessThan, left, right, if_true, if_false)
                }
                BinaryOperator::LessEqual => {
                    tape.cond(CompareOperator::LessEqual, left, right, if_true, if_false)
                }
                BinaryOperator::Equal => {
                    tape.cond(CompareOperator::Equal, left, right, if_true, if_false)
                }
                // a != b selects the else branch of the equality conditional
                BinaryOperator::NotEqual => {
                    tape.cond(CompareOperator::Equal, left, right, if_false, if_true)
                }
                BinaryOperator::GreaterEqual => {
                    tape.cond(CompareOperator::GreaterEqual, left, right, if_true, if_false)
                }
                BinaryOperator::GreaterThan => {
                    tape.cond(CompareOperator::GreaterThan, left, right, if_true, if_false)
                }
                _ => return ModelError::UnknownOperator.raise(),
            };
            memo.insert(*expression, slot);
            slot
        }
        NodeKind::Nary => {
            let nary = graph.naries[id].clone();
            let mut operand_slots = Vec::with_capacity(nary.operands.len());
            for operand in &nary.operands {
                operand_slots.push(trace_expression(graph, operand, tape, memo)?);
            }
            let slot = match nary.op {
                NaryOperator::Add => {
                    // empty sum is the additive identity
                    let mut acc = tape.constant(0.0);
                    for operand in operand_slots {
                        acc = tape.binary(ArithOperator::Add, acc, operand);
                    }
                    acc
                }
                NaryOperator::Mul => {
                    // empty product is the multiplicative identity
                    let mut acc = tape.constant(1.0);
                    for operand in operand_slots {
                        acc = tape.binary(ArithOperator::Mul, acc, operand);
                    }
                    acc
                }
            };
            memo.insert(*expression, slot);
            slot
        }
    };
    Ok(slot)
}
