use chrono::NaiveDate;
use thiserror::Error;

use crate::model::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid formula syntax at position {position}: {message}")]
pub struct FormulaSyntaxError {
    pub position: usize,
    pub message: String,
}

impl FormulaSyntaxError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Data missing for variables: {tags:?}")]
    MissingTags { tags: Vec<String> },

    #[error("Data contains missing values: factory {factory}, tag {tag}, {channel} slot {slot}")]
    IncompleteData {
        factory: String,
        tag: String,
        channel: Channel,
        slot: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] FormulaSyntaxError),

    #[error("Expression references unknown variable \"{name}\"")]
    UnknownVariable { name: String },

    #[error("Tag \"{name}\" appears more than once in the argument list")]
    DuplicateTag { name: String },
}

/// Per-slot numeric failure. Always recovered by the slot evaluator and
/// recorded as a null value with an anomalous quality code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotEvaluationFailure {
    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("numeric overflow")]
    Overflow,

    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
}

/// Reason a whole `(factory, date)` partition could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("no row for tag \"{tag}\"")]
    MissingRow { tag: String },

    #[error("{count} rows for tag \"{tag}\"")]
    DuplicateRows { tag: String, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalculationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Run-level failure for one `(formula, date)` invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Formula ID {formula_id} not found")]
    FormulaNotFound { formula_id: String },

    #[error("Formula ID {formula_id} is invalid: {reason}")]
    InvalidFormula { formula_id: String, reason: String },

    #[error("Formula ID {formula_id}: {source}")]
    Extraction {
        formula_id: String,
        source: FormulaSyntaxError,
    },

    #[error("Formula ID {formula_id}: {source}")]
    Calculation {
        formula_id: String,
        source: CalculationError,
    },

    #[error("Formula ID {formula_id}: store error: {source:#}")]
    Store {
        formula_id: String,
        source: anyhow::Error,
    },

    #[error("Failed to save calculation results for formula ID {formula_id} on {date}")]
    SaveFailed { formula_id: String, date: NaiveDate },
}

impl RunError {
    pub fn formula_id(&self) -> &str {
        match self {
            RunError::FormulaNotFound { formula_id }
            | RunError::InvalidFormula { formula_id, .. }
            | RunError::Extraction { formula_id, .. }
            | RunError::Calculation { formula_id, .. }
            | RunError::Store { formula_id, .. }
            | RunError::SaveFailed { formula_id, .. } => formula_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = ValidationError::MissingTags {
            tags: vec!["tagX".to_string()],
        };
        assert_eq!(err.to_string(), "Data missing for variables: [\"tagX\"]");

        let err = ValidationError::IncompleteData {
            factory: "A".to_string(),
            tag: "tag1".to_string(),
            channel: Channel::Secondary,
            slot: 3,
        };
        assert!(err.to_string().contains("secondary (d2) slot 3"));

        let err = RunError::Calculation {
            formula_id: "H3".to_string(),
            source: CalculationError::Compile(CompileError::UnknownVariable {
                name: "q".to_string(),
            }),
        };
        assert_eq!(err.formula_id(), "H3");
        assert!(err.to_string().starts_with("Formula ID H3:"));
    }
}
