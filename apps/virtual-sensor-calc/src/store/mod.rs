//! Collaborators the runner talks to: where formulas come from and where
//! sensor rows are read from and written to.

use anyhow::Result;
use chrono::NaiveDate;

use crate::model::{CalculationResult, Formula, SensorReading};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, TableNames};

#[allow(async_fn_in_trait)]
pub trait FormulaRegistry {
    async fn get_formula(&self, formula_id: &str) -> Result<Option<Formula>>;

    async fn list_formulas(&self) -> Result<Vec<Formula>>;
}

#[allow(async_fn_in_trait)]
pub trait SensorDataStore {
    /// Rows of `tags` for `date`. May be empty.
    async fn fetch(&self, tags: &[String], date: NaiveDate) -> Result<Vec<SensorReading>>;

    /// Upsert `results`. `Ok(false)` means the write was rejected and rolled back.
    async fn save(&self, results: &[CalculationResult]) -> Result<bool>;

    /// Remove saved results of `tags` on `date`; returns the number removed.
    async fn delete_results(&self, tags: &[String], date: NaiveDate) -> Result<u64>;
}
