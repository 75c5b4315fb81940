//! Per-slot evaluation of a compiled formula over one `(factory, date)`
//! partition at a time.
//!
//! Every (channel, slot) cell is evaluated independently. A numeric failure in
//! one cell becomes a null value plus an anomalous quality code for that hour
//! and never affects any other cell or partition. Quality is per hour: all
//! three channels at hour `i` share it, because the source assurance channel
//! (`d0`) is not channel specific.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

use super::formula::CompiledFormula;
use crate::error::{PartitionError, SlotEvaluationFailure};
use crate::model::{Channel, SensorReading, Slots, QUALITY_ANOMALY, QUALITY_NORMAL, SLOT_COUNT};

const ROUNDING_SCALE: f64 = 100.0;

/// Round to two decimal places, ties to even on the scaled value. Idempotent.
pub fn round_to_precision(value: f64) -> f64 {
    let scaled = value * ROUNDING_SCALE;
    if !scaled.is_finite() {
        // Magnitudes this large carry no fractional digits.
        return value;
    }
    let rounded = scaled.round_ties_even() / ROUNDING_SCALE;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub factory: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Partition<'a> {
    pub key: PartitionKey,
    pub rows: Vec<&'a SensorReading>,
}

/// Group the rows of the required tags by `(factory, date)`, in key order.
pub fn partition_dataset<'a>(dataset: &'a [SensorReading], tags: &[String]) -> Vec<Partition<'a>> {
    let mut groups: BTreeMap<PartitionKey, Vec<&'a SensorReading>> = BTreeMap::new();
    for row in dataset.iter().filter(|row| tags.contains(&row.tag)) {
        groups
            .entry(PartitionKey {
                factory: row.factory.clone(),
                date: row.date,
            })
            .or_default()
            .push(row);
    }
    groups
        .into_iter()
        .map(|(key, rows)| Partition { key, rows })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionEvaluation {
    pub key: PartitionKey,
    pub unit: String,
    pub data_division: String,
    pub quality: Slots<i32>,
    pub primary: Slots<Option<f64>>,
    pub secondary: Slots<Option<f64>>,
    pub tertiary: Slots<Option<f64>>,
    pub failed_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPartition {
    pub factory: String,
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub partitions: Vec<PartitionEvaluation>,
    pub skipped: Vec<SkippedPartition>,
}

impl Evaluation {
    pub fn failed_slots(&self) -> usize {
        self.partitions.iter().map(|p| p.failed_slots).sum()
    }
}

/// Rows of `partition` in `tags` order, one per tag.
fn bind_rows<'a>(
    partition: &Partition<'a>,
    tags: &[String],
) -> Result<Vec<&'a SensorReading>, PartitionError> {
    tags.iter()
        .map(|tag| {
            let mut matches = partition.rows.iter().filter(|row| &row.tag == tag);
            let first = matches
                .next()
                .ok_or_else(|| PartitionError::MissingRow { tag: tag.clone() })?;
            let extra = matches.count();
            if extra > 0 {
                return Err(PartitionError::DuplicateRows {
                    tag: tag.clone(),
                    count: extra + 1,
                });
            }
            Ok(*first)
        })
        .collect()
}

fn eval_cell(
    formula: &CompiledFormula,
    rows: &[&SensorReading],
    channel: Channel,
    slot: usize,
    args: &mut Vec<f64>,
) -> Result<f64, SlotEvaluationFailure> {
    args.clear();
    for row in rows {
        let value = row
            .measurement(channel)
            .and_then(|values| values[slot])
            .ok_or(SlotEvaluationFailure::InvalidOperation("missing input value"))?;
        args.push(value);
    }
    let value = formula.eval(args)?;
    let rounded = round_to_precision(value);
    if !rounded.is_finite() {
        return Err(SlotEvaluationFailure::Overflow);
    }
    Ok(rounded)
}

pub fn evaluate_partition(
    partition: &Partition<'_>,
    formula: &CompiledFormula,
) -> Result<PartitionEvaluation, PartitionError> {
    let rows = bind_rows(partition, formula.tags())?;

    let mut channels: [Slots<Option<f64>>; 3] = [[None; SLOT_COUNT]; 3];
    let mut failed = [false; SLOT_COUNT];
    let mut failed_slots = 0;
    let mut args = Vec::with_capacity(rows.len());

    for (values, channel) in channels.iter_mut().zip(Channel::MEASUREMENTS) {
        for (slot, out) in values.iter_mut().enumerate() {
            match eval_cell(formula, &rows, channel, slot, &mut args) {
                Ok(value) => *out = Some(value),
                Err(failure) => {
                    tracing::debug!(
                        factory = %partition.key.factory,
                        date = %partition.key.date,
                        channel = channel.as_str(),
                        slot,
                        error = %failure,
                        "slot evaluation failed"
                    );
                    failed[slot] = true;
                    failed_slots += 1;
                }
            }
        }
    }

    let mut quality = [QUALITY_ANOMALY; SLOT_COUNT];
    for (slot, code) in quality.iter_mut().enumerate() {
        let inputs_normal = rows
            .iter()
            .all(|row| row.quality[slot] == Some(QUALITY_NORMAL));
        if !failed[slot] && inputs_normal {
            *code = QUALITY_NORMAL;
        }
    }

    let (unit, data_division) = partition
        .rows
        .first()
        .map(|row| (row.unit.clone(), row.data_division.clone()))
        .unwrap_or_default();
    let [primary, secondary, tertiary] = channels;

    Ok(PartitionEvaluation {
        key: partition.key.clone(),
        unit,
        data_division,
        quality,
        primary,
        secondary,
        tertiary,
        failed_slots,
    })
}

/// Evaluate every partition of `dataset`. Partitions that cannot be bound
/// are logged and reported as skipped; the rest are always evaluated.
pub fn evaluate_dataset(
    dataset: &[SensorReading],
    formula: &CompiledFormula,
    parallel: bool,
) -> Evaluation {
    let partitions = partition_dataset(dataset, formula.tags());
    let outcomes: Vec<(PartitionKey, Result<PartitionEvaluation, PartitionError>)> = if parallel {
        partitions
            .par_iter()
            .map(|partition| (partition.key.clone(), evaluate_partition(partition, formula)))
            .collect()
    } else {
        partitions
            .iter()
            .map(|partition| (partition.key.clone(), evaluate_partition(partition, formula)))
            .collect()
    };

    let mut evaluation = Evaluation::default();
    for (key, outcome) in outcomes {
        match outcome {
            Ok(partition) => evaluation.partitions.push(partition),
            Err(err) => {
                tracing::warn!(
                    factory = %key.factory,
                    date = %key.date,
                    error = %err,
                    "error in calculation for group; skipping"
                );
                evaluation.skipped.push(SkippedPartition {
                    factory: key.factory,
                    date: key.date,
                    reason: err.to_string(),
                });
            }
        }
    }
    evaluation
}
