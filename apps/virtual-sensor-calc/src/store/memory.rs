use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use super::{FormulaRegistry, SensorDataStore};
use crate::model::{CalculationResult, Formula, SensorReading};

#[derive(Debug, Deserialize)]
struct FormulaEntry {
    expression: String,
    derived_sensor_name: String,
}

/// `formulas.json` is either a list of formulas or a map keyed by formula id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FormulaFile {
    List(Vec<Formula>),
    Map(BTreeMap<String, FormulaEntry>),
}

impl FormulaFile {
    fn into_formulas(self) -> Vec<Formula> {
        match self {
            FormulaFile::List(formulas) => formulas,
            FormulaFile::Map(entries) => entries
                .into_iter()
                .map(|(id, entry)| Formula {
                    id,
                    expression: entry.expression,
                    derived_sensor_name: entry.derived_sensor_name,
                })
                .collect(),
        }
    }
}

fn read_formulas(path: &Path) -> Result<Vec<Formula>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let formulas: FormulaFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse formulas from {}", path.display()))?;
    Ok(formulas.into_formulas())
}

/// In-process registry and data store. Saved rows are kept, upserted on
/// `(factory, tag, date)`, so callers can inspect what a run wrote.
#[derive(Debug, Default)]
pub struct MemoryStore {
    formulas: BTreeMap<String, Formula>,
    readings: Vec<SensorReading>,
    saved: Mutex<Vec<CalculationResult>>,
    reject_saves: bool,
}

impl MemoryStore {
    pub fn new(formulas: impl IntoIterator<Item = Formula>, readings: Vec<SensorReading>) -> Self {
        Self {
            formulas: formulas
                .into_iter()
                .map(|formula| (formula.id.clone(), formula))
                .collect(),
            readings,
            ..Self::default()
        }
    }

    /// Formulas only, with no readings.
    pub fn from_formulas_file(formulas_path: &Path) -> Result<Self> {
        Ok(Self::new(read_formulas(formulas_path)?, Vec::new()))
    }

    pub fn from_json_files(formulas_path: &Path, readings_path: &Path) -> Result<Self> {
        let formulas = read_formulas(formulas_path)?;
        let raw = std::fs::read_to_string(readings_path)
            .with_context(|| format!("failed to read {}", readings_path.display()))?;
        let readings: Vec<SensorReading> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse readings from {}", readings_path.display()))?;

        let store = Self::new(formulas, readings);
        tracing::info!(
            formulas = store.formulas.len(),
            readings = store.readings.len(),
            "loaded file-backed store"
        );
        Ok(store)
    }

    /// Make every subsequent `save` report failure.
    pub fn rejecting_saves(mut self) -> Self {
        self.reject_saves = true;
        self
    }

    pub fn saved(&self) -> Vec<CalculationResult> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FormulaRegistry for MemoryStore {
    async fn get_formula(&self, formula_id: &str) -> Result<Option<Formula>> {
        Ok(self.formulas.get(formula_id).cloned())
    }

    async fn list_formulas(&self) -> Result<Vec<Formula>> {
        Ok(self.formulas.values().cloned().collect())
    }
}

impl SensorDataStore for MemoryStore {
    async fn fetch(&self, tags: &[String], date: NaiveDate) -> Result<Vec<SensorReading>> {
        Ok(self
            .readings
            .iter()
            .filter(|row| row.date == date && tags.contains(&row.tag))
            .cloned()
            .collect())
    }

    async fn save(&self, results: &[CalculationResult]) -> Result<bool> {
        if self.reject_saves {
            tracing::error!(rows = results.len(), "save rejected");
            return Ok(false);
        }
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        for result in results {
            let existing = saved.iter_mut().find(|row| {
                row.factory == result.factory && row.tag == result.tag && row.date == result.date
            });
            match existing {
                Some(row) => *row = result.clone(),
                None => saved.push(result.clone()),
            }
        }
        Ok(true)
    }

    async fn delete_results(&self, tags: &[String], date: NaiveDate) -> Result<u64> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let before = saved.len();
        saved.retain(|row| !(row.date == date && tags.contains(&row.tag)));
        Ok((before - saved.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{date, reading};
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[tokio::test]
    async fn loads_formula_map_and_readings_from_json() {
        let formulas = write_temp(
            r#"{"H3": {"expression": "x / y", "derived_sensor_name": "VirtualSensor_H3"}}"#,
        );
        let rows = vec![reading("A", "x", [1.0, 2.0, 3.0]), reading("A", "y", [1.0, 1.0, 1.0])];
        let readings = write_temp(&serde_json::to_string(&rows).expect("serialize"));

        let store = MemoryStore::from_json_files(formulas.path(), readings.path()).expect("load");
        let formula = store.get_formula("H3").await.expect("get").expect("present");
        assert_eq!(formula.expression, "x / y");
        assert_eq!(formula.derived_sensor_name, "VirtualSensor_H3");
        assert!(store.get_formula("H4").await.expect("get").is_none());

        let fetched = store
            .fetch(&["y".to_string()], date("2024-12-02"))
            .await
            .expect("fetch");
        assert_eq!(fetched, vec![rows[1].clone()]);
        assert!(store
            .fetch(&["y".to_string()], date("2024-12-03"))
            .await
            .expect("fetch")
            .is_empty());
    }

    #[tokio::test]
    async fn loads_formula_list() {
        let formulas = write_temp(
            r#"[{"id": "H1", "expression": "a", "derived_sensor_name": "S1"},
                {"id": "H0", "expression": "b", "derived_sensor_name": "S0"}]"#,
        );
        let readings = write_temp("[]");
        let store = MemoryStore::from_json_files(formulas.path(), readings.path()).expect("load");
        let ids: Vec<String> = store
            .list_formulas()
            .await
            .expect("list")
            .into_iter()
            .map(|formula| formula.id)
            .collect();
        assert_eq!(ids, vec!["H0", "H1"]);
    }

    #[test]
    fn malformed_files_name_the_path() {
        let formulas = write_temp("not json");
        let readings = write_temp("[]");
        let err = MemoryStore::from_json_files(formulas.path(), readings.path())
            .expect_err("malformed");
        assert!(format!("{err:#}").contains("failed to parse formulas"));
    }

    #[tokio::test]
    async fn save_upserts_on_factory_tag_and_date() {
        let store = MemoryStore::default();
        let mut row = CalculationResult {
            factory: "A".to_string(),
            tag: "H1".to_string(),
            date: date("2024-12-02"),
            local_tag: "H1".to_string(),
            local_id: "H1".to_string(),
            display_name: "VirtualSensor_H1".to_string(),
            unit: String::new(),
            data_division: String::new(),
            quality: [1; 30],
            primary: [Some(1.0); 30],
            secondary: [Some(1.0); 30],
            tertiary: [Some(1.0); 30],
        };
        assert!(store.save(std::slice::from_ref(&row)).await.expect("save"));
        row.primary[0] = Some(9.0);
        assert!(store.save(std::slice::from_ref(&row)).await.expect("save"));

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].primary[0], Some(9.0));

        let store = MemoryStore::default().rejecting_saves();
        assert!(!store.save(&[row]).await.expect("save"));
        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn delete_results_matches_tag_and_date() {
        let store = MemoryStore::default();
        let row = |tag: &str, day: &str| CalculationResult {
            factory: "A".to_string(),
            tag: tag.to_string(),
            date: date(day),
            local_tag: tag.to_string(),
            local_id: tag.to_string(),
            display_name: format!("VirtualSensor_{tag}"),
            unit: String::new(),
            data_division: String::new(),
            quality: [1; 30],
            primary: [Some(1.0); 30],
            secondary: [Some(1.0); 30],
            tertiary: [Some(1.0); 30],
        };
        let rows = [
            row("H1", "2024-12-02"),
            row("H1", "2024-12-03"),
            row("H2", "2024-12-02"),
            row("H3", "2024-12-02"),
        ];
        assert!(store.save(&rows).await.expect("save"));

        let tags = ["H1".to_string(), "H2".to_string()];
        let removed = store.delete_results(&tags, date("2024-12-02")).await.expect("delete");
        assert_eq!(removed, 2);

        let left: Vec<(String, NaiveDate)> =
            store.saved().into_iter().map(|row| (row.tag, row.date)).collect();
        assert_eq!(
            left,
            vec![
                ("H1".to_string(), date("2024-12-03")),
                ("H3".to_string(), date("2024-12-02")),
            ]
        );
        assert_eq!(store.delete_results(&tags, date("2024-12-02")).await.expect("delete"), 0);
    }
}
