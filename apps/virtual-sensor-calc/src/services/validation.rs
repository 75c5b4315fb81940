use std::collections::HashSet;

use crate::error::ValidationError;
use crate::model::SensorReading;

/// Check that every tag has data and that no row the formula reads has a
/// null slot. Pure; only logs.
pub fn validate_tags_in_data(
    tags: &[String],
    dataset: &[SensorReading],
) -> Result<(), ValidationError> {
    let available: HashSet<&str> = dataset.iter().map(|row| row.tag.as_str()).collect();
    let missing: Vec<String> = tags
        .iter()
        .filter(|tag| !available.contains(tag.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        tracing::error!(missing = ?missing, "missing data for variables");
        return Err(ValidationError::MissingTags { tags: missing });
    }

    let required: HashSet<&str> = tags.iter().map(String::as_str).collect();
    for row in dataset.iter().filter(|row| required.contains(row.tag.as_str())) {
        if let Some((channel, slot)) = row.first_missing() {
            tracing::error!(
                factory = %row.factory,
                tag = %row.tag,
                channel = channel.as_str(),
                slot,
                "data contains missing values"
            );
            return Err(ValidationError::IncompleteData {
                factory: row.factory.clone(),
                tag: row.tag.clone(),
                channel,
                slot,
            });
        }
    }

    tracing::info!(tags = tags.len(), rows = dataset.len(), "all required variables are available");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::reading;
    use crate::model::Channel;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn passes_when_every_tag_has_complete_rows() {
        let dataset = vec![
            reading("A", "tag1", [10.0, 20.0, 30.0]),
            reading("A", "tag2", [0.0, 5.0, 15.0]),
        ];
        assert_eq!(validate_tags_in_data(&tags(&["tag1", "tag2"]), &dataset), Ok(()));
    }

    #[test]
    fn lists_exactly_the_absent_tags() {
        let dataset = vec![
            reading("A", "tag1", [10.0, 20.0, 30.0]),
            reading("A", "tag2", [0.0, 5.0, 15.0]),
        ];
        let err = validate_tags_in_data(&tags(&["tag1", "tagX", "tag2", "tagY"]), &dataset)
            .expect_err("missing tags");
        assert_eq!(
            err,
            ValidationError::MissingTags {
                tags: tags(&["tagX", "tagY"])
            }
        );
    }

    #[test]
    fn empty_dataset_reports_every_tag_missing() {
        let err = validate_tags_in_data(&tags(&["tagX"]), &[]).expect_err("missing tags");
        assert_eq!(err, ValidationError::MissingTags { tags: tags(&["tagX"]) });
    }

    #[test]
    fn no_tags_and_no_data_is_valid() {
        assert_eq!(validate_tags_in_data(&[], &[]), Ok(()));
    }

    #[test]
    fn rejects_null_in_a_required_row() {
        let mut second = reading("A", "tag2", [0.0, 5.0, 15.0]);
        second.secondary[0] = None;
        let dataset = vec![reading("A", "tag1", [10.0, 20.0, 30.0]), second];

        let err =
            validate_tags_in_data(&tags(&["tag1", "tag2"]), &dataset).expect_err("incomplete");
        assert_eq!(
            err,
            ValidationError::IncompleteData {
                factory: "A".to_string(),
                tag: "tag2".to_string(),
                channel: Channel::Secondary,
                slot: 0,
            }
        );
    }

    #[test]
    fn ignores_nulls_in_rows_the_formula_does_not_read() {
        let mut unrelated = reading("A", "other", [1.0, 1.0, 1.0]);
        unrelated.quality[5] = None;
        let dataset = vec![reading("A", "tag1", [10.0, 20.0, 30.0]), unrelated];
        assert_eq!(validate_tags_in_data(&tags(&["tag1"]), &dataset), Ok(()));
    }
}
