//! Engine entry point: validate, compile, evaluate and assemble one formula
//! against an already fetched dataset. No I/O.

use super::assembler::assemble_results;
use super::formula::compile_formula;
use super::slot_eval::{evaluate_dataset, SkippedPartition};
use super::validation::validate_tags_in_data;
use crate::error::CalculationError;
use crate::model::{CalculationResult, Formula, SensorReading};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculationOutput {
    pub results: Vec<CalculationResult>,
    pub skipped: Vec<SkippedPartition>,
    pub failed_slots: usize,
}

pub fn calculate(
    formula: &Formula,
    dataset: &[SensorReading],
    tags: &[String],
    parallel: bool,
) -> Result<CalculationOutput, CalculationError> {
    validate_tags_in_data(tags, dataset)?;
    let compiled = compile_formula(&formula.expression, tags)?;

    let evaluation = evaluate_dataset(dataset, &compiled, parallel);
    let failed_slots = evaluation.failed_slots();
    let results = assemble_results(formula, evaluation.partitions);

    tracing::info!(
        formula_id = %formula.id,
        rows = results.len(),
        failed_slots,
        skipped = evaluation.skipped.len(),
        "formula evaluated"
    );
    Ok(CalculationOutput {
        results,
        skipped: evaluation.skipped,
        failed_slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompileError, ValidationError};
    use crate::model::fixtures::reading;
    use crate::model::{QUALITY_ANOMALY, QUALITY_NORMAL};
    use crate::services::formula::{extract_tags, TagStrategy};

    fn formula(expression: &str) -> Formula {
        Formula {
            id: "H1".to_string(),
            expression: expression.to_string(),
            derived_sensor_name: "VirtualSensor_H1".to_string(),
        }
    }

    #[test]
    fn computes_one_row_per_factory() {
        let dataset = vec![
            reading("A", "x", [10.0, 20.0, 30.0]),
            reading("A", "y", [2.0, 5.0, 15.0]),
            reading("B", "x", [1.0, 1.0, 1.0]),
            reading("B", "y", [4.0, 4.0, 4.0]),
        ];
        let formula = formula("x / y");
        let tags = extract_tags(&formula.expression, TagStrategy::FreeForm).expect("tags");
        let output = calculate(&formula, &dataset, &tags, false).expect("calculate");

        assert_eq!(output.results.len(), 2);
        assert_eq!(output.failed_slots, 0);
        assert_eq!(output.results[0].factory, "A");
        assert_eq!(output.results[0].primary[0], Some(5.0));
        assert_eq!(output.results[1].factory, "B");
        assert_eq!(output.results[1].tertiary[29], Some(0.25));
        assert!(output.results[1].quality.iter().all(|code| *code == QUALITY_NORMAL));
    }

    #[test]
    fn missing_tag_aborts_before_evaluation() {
        let dataset = vec![reading("A", "x", [1.0, 1.0, 1.0])];
        let tags = vec!["x".to_string(), "tagX".to_string()];
        let err = calculate(&formula("x + tagX"), &dataset, &tags, false).expect_err("missing");
        assert_eq!(
            err,
            CalculationError::Validation(ValidationError::MissingTags {
                tags: vec!["tagX".to_string()]
            })
        );
    }

    #[test]
    fn expression_and_tag_list_must_agree() {
        let dataset = vec![reading("A", "x", [1.0, 1.0, 1.0])];
        let err =
            calculate(&formula("x + q"), &dataset, &["x".to_string()], false).expect_err("compile");
        assert!(matches!(
            err,
            CalculationError::Compile(CompileError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn constant_formula_over_empty_dataset_yields_no_rows() {
        let output = calculate(&formula("2 * 3"), &[], &[], false).expect("calculate");
        assert!(output.results.is_empty());
        assert!(output.skipped.is_empty());
    }

    #[test]
    fn exponent_shaped_tags_are_read_from_the_dataset() {
        let dataset = vec![
            reading("A", "2E00001", [5.0, 5.0, 5.0]),
            reading("A", "1D13001", [1.0, 2.0, 3.0]),
        ];
        let formula = formula("2E00001 + 1D13001");
        for strategy in [TagStrategy::FreeForm, TagStrategy::Pattern { tag_length: 7 }] {
            let tags = extract_tags(&formula.expression, strategy).expect("tags");
            assert_eq!(tags, vec!["2E00001", "1D13001"]);
            let output = calculate(&formula, &dataset, &tags, false).expect("calculate");
            assert_eq!(output.results[0].primary[0], Some(6.0));
            assert_eq!(output.results[0].tertiary[0], Some(8.0));
        }
    }

    #[test]
    fn failed_slots_are_counted_across_partitions() {
        let mut dataset = vec![
            reading("A", "x", [1.0, 1.0, 1.0]),
            reading("B", "x", [1.0, 1.0, 1.0]),
        ];
        dataset[0].primary[0] = Some(0.0);
        dataset[1].secondary[3] = Some(0.0);
        let output =
            calculate(&formula("1 / x"), &dataset, &["x".to_string()], true).expect("calculate");

        assert_eq!(output.failed_slots, 2);
        assert_eq!(output.results[0].quality[0], QUALITY_ANOMALY);
        assert_eq!(output.results[1].quality[3], QUALITY_ANOMALY);
        assert_eq!(output.results[1].quality[0], QUALITY_NORMAL);
    }
}
