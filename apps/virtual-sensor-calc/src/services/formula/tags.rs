use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

use super::parser::parse_expression;
use crate::error::FormulaSyntaxError;

pub const DEFAULT_PATTERN_TAG_LENGTH: usize = 7;

/// Plant tag token: digits, one letter, digits (e.g. `1D13001`).
static TAG_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9]+[A-Za-z][0-9]+\b").expect("valid regex"));

/// How tags are pulled out of a formula string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagStrategy {
    /// Parse the whole expression and collect variable references. Also
    /// guarantees the formula is well formed.
    #[default]
    FreeForm,
    /// Scan for fixed-length plant tag tokens only; no syntax validation.
    Pattern { tag_length: usize },
}

fn dedupe_in_order<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

pub fn extract_tags_free_form(formula: &str) -> Result<Vec<String>, FormulaSyntaxError> {
    let expr = parse_expression(formula)?;
    Ok(dedupe_in_order(
        expr.variables().into_iter().map(String::as_str),
    ))
}

pub fn extract_tags_by_pattern(formula: &str, tag_length: usize) -> Vec<String> {
    dedupe_in_order(
        TAG_TOKEN_RE
            .find_iter(formula)
            .map(|found| found.as_str())
            .filter(|token| token.len() == tag_length),
    )
}

/// Distinct tags referenced by `formula`, in first-occurrence order.
pub fn extract_tags(
    formula: &str,
    strategy: TagStrategy,
) -> Result<Vec<String>, FormulaSyntaxError> {
    tracing::info!(formula, ?strategy, "parsing formula");
    let tags = match strategy {
        TagStrategy::FreeForm => extract_tags_free_form(formula).inspect_err(|err| {
            tracing::error!(formula, error = %err, "invalid formula syntax");
        })?,
        TagStrategy::Pattern { tag_length } => extract_tags_by_pattern(formula, tag_length),
    };
    tracing::info!(?tags, "extracted variables");
    Ok(tags)
}
