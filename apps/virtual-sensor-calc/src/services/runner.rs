//! Runs a registered formula for one processing date: look it up, extract its
//! tags, fetch the rows, calculate and save.

use chrono::NaiveDate;
use serde::Serialize;

use super::calculation::calculate;
use super::formula::{extract_tags, TagStrategy};
use super::slot_eval::SkippedPartition;
use crate::config::CalcConfig;
use crate::error::RunError;
use crate::model::Formula;
use crate::store::{FormulaRegistry, SensorDataStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub tag_strategy: TagStrategy,
    pub parallel_partitions: bool,
}

impl From<&CalcConfig> for EngineOptions {
    fn from(config: &CalcConfig) -> Self {
        Self {
            tag_strategy: config.tag_strategy,
            parallel_partitions: config.parallel_partitions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    /// Rows were saved but some partitions were skipped.
    Partial,
    /// Nothing to calculate for this date; nothing saved.
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub formula_id: String,
    pub date: NaiveDate,
    pub tags: Vec<String>,
    pub rows_written: usize,
    pub failed_slots: usize,
    pub skipped_partitions: Vec<SkippedPartition>,
    pub outcome: RunOutcome,
}

async fn load_formula<R: FormulaRegistry>(
    registry: &R,
    formula_id: &str,
) -> Result<Formula, RunError> {
    let formula = registry
        .get_formula(formula_id)
        .await
        .map_err(|source| RunError::Store {
            formula_id: formula_id.to_string(),
            source,
        })?
        .ok_or_else(|| RunError::FormulaNotFound {
            formula_id: formula_id.to_string(),
        })?;

    let blank = if formula.expression.trim().is_empty() {
        Some("expression is empty")
    } else if formula.derived_sensor_name.trim().is_empty() {
        Some("derived sensor name is empty")
    } else {
        None
    };
    if let Some(reason) = blank {
        return Err(RunError::InvalidFormula {
            formula_id: formula_id.to_string(),
            reason: reason.to_string(),
        });
    }
    Ok(formula)
}

pub async fn process_formula<R, S>(
    registry: &R,
    store: &S,
    options: &EngineOptions,
    date: NaiveDate,
    formula_id: &str,
) -> Result<RunReport, RunError>
where
    R: FormulaRegistry,
    S: SensorDataStore,
{
    tracing::info!(formula_id, %date, "processing formula");
    let formula = load_formula(registry, formula_id).await?;

    let tags = extract_tags(&formula.expression, options.tag_strategy).map_err(|source| {
        RunError::Extraction {
            formula_id: formula_id.to_string(),
            source,
        }
    })?;

    let dataset = if tags.is_empty() {
        Vec::new()
    } else {
        store.fetch(&tags, date).await.map_err(|source| RunError::Store {
            formula_id: formula_id.to_string(),
            source,
        })?
    };

    let output = calculate(&formula, &dataset, &tags, options.parallel_partitions).map_err(
        |source| RunError::Calculation {
            formula_id: formula_id.to_string(),
            source,
        },
    )?;

    if output.results.is_empty() {
        tracing::warn!(formula_id, %date, "no data to save for formula");
        return Ok(RunReport {
            formula_id: formula.id,
            date,
            tags,
            rows_written: 0,
            failed_slots: 0,
            skipped_partitions: output.skipped,
            outcome: RunOutcome::NoData,
        });
    }

    let saved = store
        .save(&output.results)
        .await
        .map_err(|source| RunError::Store {
            formula_id: formula_id.to_string(),
            source,
        })?;
    if !saved {
        return Err(RunError::SaveFailed {
            formula_id: formula_id.to_string(),
            date,
        });
    }

    let outcome = if output.skipped.is_empty() {
        RunOutcome::Complete
    } else {
        RunOutcome::Partial
    };
    tracing::info!(
        formula_id,
        %date,
        rows = output.results.len(),
        failed_slots = output.failed_slots,
        ?outcome,
        "formula processed"
    );
    Ok(RunReport {
        formula_id: formula.id,
        date,
        tags,
        rows_written: output.results.len(),
        failed_slots: output.failed_slots,
        skipped_partitions: output.skipped,
        outcome,
    })
}

/// Process each id in turn. A failing formula is logged and does not stop
/// the ones after it.
pub async fn process_formulas<R, S>(
    registry: &R,
    store: &S,
    options: &EngineOptions,
    date: NaiveDate,
    formula_ids: &[String],
) -> Vec<Result<RunReport, RunError>>
where
    R: FormulaRegistry,
    S: SensorDataStore,
{
    let mut reports = Vec::with_capacity(formula_ids.len());
    for formula_id in formula_ids {
        let result = process_formula(registry, store, options, date, formula_id).await;
        if let Err(err) = &result {
            tracing::error!(
                formula_id = %err.formula_id(),
                error = %err,
                "error processing formula"
            );
        }
        reports.push(result);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CalculationError, ValidationError};
    use crate::model::fixtures::{date, reading};
    use crate::model::{QUALITY_ANOMALY, SLOT_COUNT};
    use crate::store::MemoryStore;

    fn formula(id: &str, expression: &str) -> Formula {
        Formula {
            id: id.to_string(),
            expression: expression.to_string(),
            derived_sensor_name: format!("VirtualSensor_{id}"),
        }
    }

    fn store() -> MemoryStore {
        let mut y = reading("A", "y", [0.0, 5.0, 15.0]);
        y.primary[0] = Some(4.0);
        MemoryStore::new(
            [
                formula("H1", "x / y"),
                formula("H2", "x + tagX"),
                formula("H3", "(x + ) * y"),
                formula("H4", "2 * 3"),
                formula("H5", "  "),
            ],
            vec![reading("A", "x", [10.0, 20.0, 30.0]), y, reading("B", "x", [1.0, 1.0, 1.0])],
        )
    }

    #[tokio::test]
    async fn saves_rows_and_reports_partial_outcome() {
        let store = store();
        let report = process_formula(
            &store,
            &store,
            &EngineOptions::default(),
            date("2024-12-02"),
            "H1",
        )
        .await
        .expect("run");

        assert_eq!(report.tags, vec!["x", "y"]);
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.failed_slots, SLOT_COUNT - 1);
        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.skipped_partitions[0].factory, "B");

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tag, "H1");
        assert_eq!(saved[0].display_name, "VirtualSensor_H1");
        assert_eq!(saved[0].primary[0], Some(2.5));
        assert_eq!(saved[0].primary[1], None);
        assert_eq!(saved[0].quality[1], QUALITY_ANOMALY);
        assert_eq!(saved[0].secondary[1], Some(4.0));
    }

    #[tokio::test]
    async fn complete_when_every_partition_evaluates() {
        let store = MemoryStore::new(
            [formula("H1", "x * 2")],
            vec![reading("A", "x", [1.0, 2.0, 3.0]), reading("B", "x", [4.0, 5.0, 6.0])],
        );
        let options = EngineOptions {
            parallel_partitions: true,
            ..EngineOptions::default()
        };
        let report = process_formula(&store, &store, &options, date("2024-12-02"), "H1")
            .await
            .expect("run");
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.rows_written, 2);
        assert_eq!(store.saved()[1].tertiary[0], Some(12.0));
    }

    #[tokio::test]
    async fn no_data_for_date_is_not_an_error() {
        let store = store();
        let report = process_formula(
            &store,
            &store,
            &EngineOptions::default(),
            date("2024-12-02"),
            "H4",
        )
        .await
        .expect("run");
        assert_eq!(report.outcome, RunOutcome::NoData);
        assert_eq!(report.rows_written, 0);
        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn run_level_failures_carry_the_formula_id() {
        let store = store();
        let day = date("2024-12-02");
        let options = EngineOptions::default();

        let err = process_formula(&store, &store, &options, day, "H9")
            .await
            .expect_err("not found");
        assert!(matches!(err, RunError::FormulaNotFound { .. }));
        assert_eq!(err.formula_id(), "H9");

        let err = process_formula(&store, &store, &options, day, "H2")
            .await
            .expect_err("missing tag");
        match err {
            RunError::Calculation {
                source: CalculationError::Validation(ValidationError::MissingTags { tags }),
                ..
            } => assert_eq!(tags, vec!["tagX"]),
            other => panic!("unexpected error: {other}"),
        }

        let err = process_formula(&store, &store, &options, day, "H3")
            .await
            .expect_err("syntax");
        assert!(matches!(err, RunError::Extraction { .. }));

        let err = process_formula(&store, &store, &options, day, "H5")
            .await
            .expect_err("blank");
        assert!(matches!(err, RunError::InvalidFormula { .. }));

        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn rejected_save_is_reported() {
        let store = MemoryStore::new([formula("H1", "x")], vec![reading("A", "x", [1.0, 1.0, 1.0])])
            .rejecting_saves();
        let err = process_formula(
            &store,
            &store,
            &EngineOptions::default(),
            date("2024-12-02"),
            "H1",
        )
        .await
        .expect_err("save failed");
        assert!(matches!(err, RunError::SaveFailed { .. }));
    }

    #[tokio::test]
    async fn pattern_strategy_runs_plant_tag_formulas() {
        let store = MemoryStore::new(
            [formula("H7", "1D13001 - 1D13002")],
            vec![
                reading("A", "1D13001", [5.0, 5.0, 5.0]),
                reading("A", "1D13002", [1.5, 2.0, 2.5]),
            ],
        );
        let options = EngineOptions {
            tag_strategy: TagStrategy::Pattern { tag_length: 7 },
            parallel_partitions: false,
        };
        let report = process_formula(&store, &store, &options, date("2024-12-02"), "H7")
            .await
            .expect("run");
        assert_eq!(report.tags, vec!["1D13001", "1D13002"]);
        assert_eq!(store.saved()[0].primary[0], Some(3.5));
        assert_eq!(store.saved()[0].tertiary[0], Some(2.5));
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let store = store();
        let ids: Vec<String> = ["H9", "H1", "H2"].iter().map(|id| id.to_string()).collect();
        let options = EngineOptions::default();
        let results = process_formulas(&store, &store, &options, date("2024-12-02"), &ids).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
        assert_eq!(store.saved().len(), 1);
    }
}
