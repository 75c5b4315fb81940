//! Formula front end: parsing, tag extraction and compilation to a
//! positional numeric function.

mod compiled;
mod parser;
mod tags;

pub use compiled::{compile_formula, CompiledFormula};
pub use parser::{parse_expression, BinaryOp, Expr, Function, UnaryOp};
pub use tags::{
    extract_tags, extract_tags_by_pattern, extract_tags_free_form, TagStrategy,
    DEFAULT_PATTERN_TAG_LENGTH,
};
