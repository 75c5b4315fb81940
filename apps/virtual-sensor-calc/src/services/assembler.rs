use super::slot_eval::PartitionEvaluation;
use crate::model::{CalculationResult, Formula};

/// Wrap evaluated partitions as derived sensor rows, keeping partition order.
/// The formula id doubles as the derived tag, local tag and local id.
pub fn assemble_results(
    formula: &Formula,
    partitions: Vec<PartitionEvaluation>,
) -> Vec<CalculationResult> {
    partitions
        .into_iter()
        .map(|partition| CalculationResult {
            factory: partition.key.factory,
            tag: formula.id.clone(),
            date: partition.key.date,
            local_tag: formula.id.clone(),
            local_id: formula.id.clone(),
            display_name: formula.derived_sensor_name.clone(),
            unit: partition.unit,
            data_division: partition.data_division,
            quality: partition.quality,
            primary: partition.primary,
            secondary: partition.secondary,
            tertiary: partition.tertiary,
        })
        .collect()
}
