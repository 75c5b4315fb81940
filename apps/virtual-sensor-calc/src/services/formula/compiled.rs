use std::collections::HashMap;

use super::parser::{parse_expression, BinaryOp, Expr, Function, UnaryOp};
use crate::error::{CompileError, SlotEvaluationFailure};

/// A formula bound to an ordered tag list. Variables are resolved to argument
/// positions, so evaluation is a plain tree walk over a slice.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFormula {
    expression: String,
    tags: Vec<String>,
    tree: Expr<usize>,
}

pub fn compile_formula(
    expression: &str,
    ordered_tags: &[String],
) -> Result<CompiledFormula, CompileError> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(ordered_tags.len());
    for (idx, tag) in ordered_tags.iter().enumerate() {
        if positions.insert(tag.as_str(), idx).is_some() {
            return Err(CompileError::DuplicateTag { name: tag.clone() });
        }
    }

    let parsed = parse_expression(expression)?;
    let tree = parsed.try_map_variables(&mut |name: &String| {
        positions
            .get(name.as_str())
            .copied()
            .ok_or_else(|| CompileError::UnknownVariable { name: name.clone() })
    })?;

    Ok(CompiledFormula {
        expression: expression.to_string(),
        tags: ordered_tags.to_vec(),
        tree,
    })
}

impl CompiledFormula {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn arity(&self) -> usize {
        self.tags.len()
    }

    /// Evaluate with one argument per tag, in tag order.
    pub fn eval(&self, args: &[f64]) -> Result<f64, SlotEvaluationFailure> {
        if args.len() != self.arity() {
            return Err(SlotEvaluationFailure::Arity {
                expected: self.arity(),
                got: args.len(),
            });
        }
        eval_node(&self.tree, args)
    }
}

fn finite(value: f64) -> Result<f64, SlotEvaluationFailure> {
    if value.is_nan() {
        return Err(SlotEvaluationFailure::InvalidOperation("result is not a number"));
    }
    if value.is_infinite() {
        return Err(SlotEvaluationFailure::Overflow);
    }
    Ok(value)
}

fn checked_div(lhs: f64, rhs: f64) -> Result<f64, SlotEvaluationFailure> {
    if rhs == 0.0 {
        return Err(SlotEvaluationFailure::DivisionByZero);
    }
    finite(lhs / rhs)
}

fn checked_pow(base: f64, exponent: f64) -> Result<f64, SlotEvaluationFailure> {
    if base == 0.0 && exponent < 0.0 {
        return Err(SlotEvaluationFailure::DivisionByZero);
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(SlotEvaluationFailure::InvalidOperation(
            "negative base with fractional exponent",
        ));
    }
    finite(base.powf(exponent))
}

fn checked_log(value: f64, log: fn(f64) -> f64) -> Result<f64, SlotEvaluationFailure> {
    if value == 0.0 {
        return Err(SlotEvaluationFailure::DivisionByZero);
    }
    if value < 0.0 {
        return Err(SlotEvaluationFailure::InvalidOperation("logarithm of a negative number"));
    }
    finite(log(value))
}

fn eval_node(node: &Expr<usize>, args: &[f64]) -> Result<f64, SlotEvaluationFailure> {
    match node {
        Expr::Number(value) => Ok(*value),
        Expr::Variable(idx) => {
            let value = args.get(*idx).copied().ok_or(SlotEvaluationFailure::Arity {
                expected: idx + 1,
                got: args.len(),
            })?;
            if !value.is_finite() {
                return Err(SlotEvaluationFailure::InvalidOperation("non-finite input value"));
            }
            Ok(value)
        }
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => Ok(-eval_node(operand, args)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval_node(lhs, args)?;
            let rhs = eval_node(rhs, args)?;
            match op {
                BinaryOp::Add => finite(lhs + rhs),
                BinaryOp::Sub => finite(lhs - rhs),
                BinaryOp::Mul => finite(lhs * rhs),
                BinaryOp::Div => checked_div(lhs, rhs),
                BinaryOp::Pow => checked_pow(lhs, rhs),
            }
        }
        Expr::Call { func, args: call_args } => {
            let values = call_args
                .iter()
                .map(|arg| eval_node(arg, args))
                .collect::<Result<Vec<f64>, _>>()?;
            eval_call(*func, &values)
        }
    }
}

fn eval_call(func: Function, values: &[f64]) -> Result<f64, SlotEvaluationFailure> {
    let arg = |idx: usize| {
        values.get(idx).copied().ok_or(SlotEvaluationFailure::Arity {
            expected: idx + 1,
            got: values.len(),
        })
    };
    match func {
        Function::Abs => Ok(arg(0)?.abs()),
        Function::Sqrt => {
            let x = arg(0)?;
            if x < 0.0 {
                return Err(SlotEvaluationFailure::InvalidOperation(
                    "square root of a negative number",
                ));
            }
            Ok(x.sqrt())
        }
        Function::Ln => checked_log(arg(0)?, f64::ln),
        Function::Log10 => checked_log(arg(0)?, f64::log10),
        Function::Exp => finite(arg(0)?.exp()),
        Function::Min => values
            .iter()
            .copied()
            .reduce(f64::min)
            .ok_or(SlotEvaluationFailure::Arity {
                expected: 1,
                got: 0,
            }),
        Function::Max => values
            .iter()
            .copied()
            .reduce(f64::max)
            .ok_or(SlotEvaluationFailure::Arity {
                expected: 1,
                got: 0,
            }),
        Function::Pow => checked_pow(arg(0)?, arg(1)?),
        Function::Clamp => {
            let (x, lo, hi) = (arg(0)?, arg(1)?, arg(2)?);
            if lo > hi {
                return Err(SlotEvaluationFailure::InvalidOperation(
                    "clamp() lower bound exceeds upper bound",
                ));
            }
            Ok(x.max(lo).min(hi))
        }
        Function::Floor => Ok(arg(0)?.floor()),
        Function::Ceil => Ok(arg(0)?.ceil()),
    }
}
