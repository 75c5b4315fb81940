pub mod assembler;
pub mod calculation;
pub mod formula;
pub mod runner;
pub mod slot_eval;
pub mod validation;

pub use calculation::{calculate, CalculationOutput};
pub use runner::{process_formula, process_formulas, EngineOptions, RunOutcome, RunReport};
