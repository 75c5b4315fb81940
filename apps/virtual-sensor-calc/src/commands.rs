use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::io::Write;
use std::path::Path;

use crate::cli::{CheckArgs, ListArgs, RunArgs};
use crate::config::CalcConfig;
use crate::db;
use crate::error::RunError;
use crate::model::Formula;
use crate::services::formula::{extract_tags_by_pattern, extract_tags_free_form};
use crate::services::{process_formulas, EngineOptions, RunReport};
use crate::store::{FormulaRegistry, MemoryStore, PgStore, SensorDataStore};

fn pg_store(config: &CalcConfig) -> Result<PgStore> {
    let pool = db::connect_lazy(config.require_database_url()?, config.db_pool_size)?;
    PgStore::new(pool, config.tables.clone())
}

async fn selected_ids<R: FormulaRegistry>(registry: &R, args: &RunArgs) -> Result<Vec<String>> {
    if !args.all {
        return Ok(args.formula.clone());
    }
    let formulas = registry.list_formulas().await.context("failed to list formulas")?;
    Ok(formulas.into_iter().map(|formula| formula.id).collect())
}

async fn run_all<R, S>(
    registry: &R,
    store: &S,
    options: &EngineOptions,
    date: NaiveDate,
    formula_ids: &[String],
) -> (Vec<RunReport>, Vec<RunError>)
where
    R: FormulaRegistry,
    S: SensorDataStore,
{
    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for result in process_formulas(registry, store, options, date, formula_ids).await {
        match result {
            Ok(report) => reports.push(report),
            Err(err) => failures.push(err),
        }
    }
    (reports, failures)
}

async fn run_selected<S>(
    store: &S,
    options: &EngineOptions,
    args: &RunArgs,
) -> Result<(Vec<RunReport>, Vec<RunError>)>
where
    S: FormulaRegistry + SensorDataStore,
{
    let ids = selected_ids(store, args).await?;
    if args.replace {
        let removed = store
            .delete_results(&ids, args.date)
            .await
            .context("failed to clear previous results")?;
        tracing::info!(date = %args.date, removed, "cleared previous results");
    }
    Ok(run_all(store, store, options, args.date, &ids).await)
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")?;
            Ok(())
        }
    }
}

/// Returns whether every selected formula ran without a run-level error.
pub async fn run(args: RunArgs, config: &CalcConfig) -> Result<bool> {
    let options = EngineOptions::from(config);

    let (reports, failures) = match (&args.formulas, &args.readings) {
        (Some(formulas), Some(readings)) => {
            let store = MemoryStore::from_json_files(formulas, readings)?;
            let outcome = run_selected(&store, &options, &args).await?;
            write_json(&store.saved(), args.output.as_deref())?;
            outcome
        }
        _ => {
            let store = pg_store(config)?;
            let outcome = run_selected(&store, &options, &args).await?;
            write_json(&outcome.0, None)?;
            outcome
        }
    };

    tracing::info!(
        date = %args.date,
        succeeded = reports.len(),
        failed = failures.len(),
        "run finished"
    );
    Ok(failures.is_empty())
}

pub fn check(args: &CheckArgs) -> Result<bool> {
    let mut stdout = std::io::stdout().lock();
    let pattern = extract_tags_by_pattern(&args.expression, args.tag_length);
    match extract_tags_free_form(&args.expression) {
        Ok(tags) => {
            writeln!(stdout, "free_form: {}", tags.join(", "))?;
            writeln!(stdout, "pattern:   {}", pattern.join(", "))?;
            Ok(true)
        }
        Err(err) => {
            writeln!(stdout, "{err}")?;
            writeln!(stdout, "pattern:   {}", pattern.join(", "))?;
            Ok(false)
        }
    }
}

fn print_formulas(formulas: &[Formula]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for formula in formulas {
        writeln!(
            stdout,
            "{}\t{}\t{}",
            formula.id, formula.derived_sensor_name, formula.expression
        )?;
    }
    Ok(())
}

pub async fn list(args: &ListArgs, config: &CalcConfig) -> Result<()> {
    let formulas = match &args.formulas {
        Some(path) => MemoryStore::from_formulas_file(path)?.list_formulas().await?,
        None => pg_store(config)?.list_formulas().await?,
    };
    print_formulas(&formulas)
}
