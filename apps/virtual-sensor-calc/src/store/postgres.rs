use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::LazyLock;

use super::{FormulaRegistry, SensorDataStore};
use crate::model::{CalculationResult, Formula, SensorReading, Slots, SLOT_COUNT};

pub const DEFAULT_FORMULA_TABLE: &str = "batch.data_processing_calculation_formulas";
pub const DEFAULT_SENSOR_TABLE: &str = "batch.data_loader_data_load_temp";
pub const DEFAULT_RESULT_TABLE: &str = "batch.data_processing_calculation_temp";

static TABLE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

/// Table names are interpolated into SQL, so they are restricted to
/// `[schema.]table` identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    pub formulas: String,
    pub readings: String,
    pub results: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            formulas: DEFAULT_FORMULA_TABLE.to_string(),
            readings: DEFAULT_SENSOR_TABLE.to_string(),
            results: DEFAULT_RESULT_TABLE.to_string(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> Result<()> {
        for (label, name) in [
            ("formula table", &self.formulas),
            ("sensor table", &self.readings),
            ("result table", &self.results),
        ] {
            if !TABLE_NAME_RE.is_match(name) {
                anyhow::bail!("invalid {label} name {name:?}; expected [schema.]table");
            }
        }
        Ok(())
    }

    fn schemas(&self) -> Vec<&str> {
        let mut schemas: Vec<&str> = [&self.formulas, &self.readings, &self.results]
            .into_iter()
            .filter_map(|name| name.split_once('.').map(|(schema, _)| schema))
            .collect();
        schemas.sort_unstable();
        schemas.dedup();
        schemas
    }
}

#[derive(sqlx::FromRow)]
struct FormulaRow {
    calculate_pid: String,
    calculate_formula: Option<String>,
    calculate_name: Option<String>,
}

impl From<FormulaRow> for Formula {
    fn from(row: FormulaRow) -> Self {
        Formula {
            id: row.calculate_pid,
            expression: row.calculate_formula.unwrap_or_default(),
            derived_sensor_name: row.calculate_name.unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    factory: String,
    tag: String,
    date: NaiveDate,
    local_tag: Option<String>,
    local_id: Option<String>,
    display_name: Option<String>,
    unit: Option<String>,
    data_division: Option<String>,
    d0: Vec<Option<i32>>,
    d1: Vec<Option<f64>>,
    d2: Vec<Option<f64>>,
    d3: Vec<Option<f64>>,
}

/// Fit a stored array to the slot window. Short arrays are padded with nulls,
/// which validation then reports as missing data.
fn to_slots<T: Copy>(
    values: Vec<Option<T>>,
    factory: &str,
    tag: &str,
    column: &str,
) -> Slots<Option<T>> {
    if values.len() != SLOT_COUNT {
        tracing::warn!(
            factory,
            tag,
            column,
            len = values.len(),
            "stored slot array has unexpected length"
        );
    }
    let mut slots = [None; SLOT_COUNT];
    for (slot, value) in slots.iter_mut().zip(values) {
        *slot = value;
    }
    slots
}

impl From<ReadingRow> for SensorReading {
    fn from(row: ReadingRow) -> Self {
        let quality = to_slots(row.d0, &row.factory, &row.tag, "d0");
        let primary = to_slots(row.d1, &row.factory, &row.tag, "d1");
        let secondary = to_slots(row.d2, &row.factory, &row.tag, "d2");
        let tertiary = to_slots(row.d3, &row.factory, &row.tag, "d3");
        SensorReading {
            factory: row.factory,
            tag: row.tag,
            date: row.date,
            local_tag: row.local_tag.unwrap_or_default(),
            local_id: row.local_id.unwrap_or_default(),
            display_name: row.display_name.unwrap_or_default(),
            unit: row.unit.unwrap_or_default(),
            data_division: row.data_division.unwrap_or_default(),
            quality,
            primary,
            secondary,
            tertiary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Result<Self> {
        tables.validate()?;
        Ok(Self { pool, tables })
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Create the schemas and tables this store reads and writes, if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        for schema in self.tables.schemas() {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to create schema {schema}"))?;
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                calculate_pid text PRIMARY KEY,
                calculate_formula text NOT NULL,
                calculate_name text NOT NULL
            )
            "#,
            self.tables.formulas
        ))
        .execute(&self.pool)
        .await
        .context("failed to create formula table")?;

        for table in [&self.tables.readings, &self.tables.results] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    factory text NOT NULL,
                    tag text NOT NULL,
                    date date NOT NULL,
                    local_tag text NULL,
                    local_id text NULL,
                    display_name text NULL,
                    unit text NULL,
                    data_division text NULL,
                    d0 integer[] NOT NULL,
                    d1 double precision[] NOT NULL,
                    d2 double precision[] NOT NULL,
                    d3 double precision[] NOT NULL,
                    last_update timestamptz NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (factory, tag, date)
                )
                "#
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create table {table}"))?;
        }
        Ok(())
    }

    async fn upsert_results(&self, results: &[CalculationResult]) -> Result<(), sqlx::Error> {
        let statement = format!(
            r#"
            INSERT INTO {} (
              factory, tag, date, local_tag, local_id, display_name, unit, data_division,
              d0, d1, d2, d3, last_update
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,NOW())
            ON CONFLICT (factory, tag, date) DO UPDATE
              SET local_tag = EXCLUDED.local_tag,
                  local_id = EXCLUDED.local_id,
                  display_name = EXCLUDED.display_name,
                  unit = EXCLUDED.unit,
                  data_division = EXCLUDED.data_division,
                  d0 = EXCLUDED.d0,
                  d1 = EXCLUDED.d1,
                  d2 = EXCLUDED.d2,
                  d3 = EXCLUDED.d3,
                  last_update = NOW()
            "#,
            self.tables.results
        );

        let mut tx = self.pool.begin().await?;
        for row in results {
            sqlx::query(&statement)
                .bind(&row.factory)
                .bind(&row.tag)
                .bind(row.date)
                .bind(&row.local_tag)
                .bind(&row.local_id)
                .bind(&row.display_name)
                .bind(&row.unit)
                .bind(&row.data_division)
                .bind(row.quality.to_vec())
                .bind(row.primary.to_vec())
                .bind(row.secondary.to_vec())
                .bind(row.tertiary.to_vec())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }
}

impl FormulaRegistry for PgStore {
    async fn get_formula(&self, formula_id: &str) -> Result<Option<Formula>> {
        let row: Option<FormulaRow> = sqlx::query_as(&format!(
            r#"
            SELECT calculate_pid::text AS calculate_pid, calculate_formula, calculate_name
            FROM {}
            WHERE calculate_pid::text = $1
            LIMIT 1
            "#,
            self.tables.formulas
        ))
        .bind(formula_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to query formula {formula_id}"))?;
        Ok(row.map(Formula::from))
    }

    async fn list_formulas(&self) -> Result<Vec<Formula>> {
        let rows: Vec<FormulaRow> = sqlx::query_as(&format!(
            r#"
            SELECT calculate_pid::text AS calculate_pid, calculate_formula, calculate_name
            FROM {}
            ORDER BY calculate_pid
            "#,
            self.tables.formulas
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list formulas")?;
        Ok(rows.into_iter().map(Formula::from).collect())
    }
}

impl SensorDataStore for PgStore {
    async fn fetch(&self, tags: &[String], date: NaiveDate) -> Result<Vec<SensorReading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT factory, tag, date, local_tag, local_id, display_name, unit, data_division,
                   d0, d1, d2, d3
            FROM {}
            WHERE tag = ANY($1) AND date = $2
            ORDER BY factory, tag
            "#,
            self.tables.readings
        ))
        .bind(tags)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to fetch readings for {date}"))?;
        tracing::debug!(rows = rows.len(), tags = tags.len(), %date, "fetched sensor rows");
        Ok(rows.into_iter().map(SensorReading::from).collect())
    }

    async fn save(&self, results: &[CalculationResult]) -> Result<bool> {
        match self.upsert_results(results).await {
            Ok(()) => {
                tracing::info!(rows = results.len(), table = %self.tables.results, "saved results");
                Ok(true)
            }
            Err(err) => {
                tracing::error!(
                    rows = results.len(),
                    table = %self.tables.results,
                    error = %err,
                    "failed to save results; transaction rolled back"
                );
                Ok(false)
            }
        }
    }

    async fn delete_results(&self, tags: &[String], date: NaiveDate) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let res = sqlx::query(&format!(
            "DELETE FROM {} WHERE tag = ANY($1) AND date = $2",
            self.tables.results
        ))
        .bind(tags)
        .bind(date)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to delete results for {date}"))?;
        tx.commit().await.context("failed to commit transaction")?;
        tracing::info!(
            rows = res.rows_affected(),
            table = %self.tables.results,
            %date,
            "deleted results"
        );
        Ok(res.rows_affected())
    }
}
