use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::services::formula::{TagStrategy, DEFAULT_PATTERN_TAG_LENGTH};
use crate::store::TableNames;

const DEFAULT_DB_POOL_SIZE: u32 = 10;

fn setup_config_path() -> Option<PathBuf> {
    std::env::var("CALC_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    tag_strategy: Option<String>,
    #[serde(default)]
    pattern_tag_length: Option<usize>,
    #[serde(default)]
    parallel_partitions: Option<bool>,
    #[serde(default)]
    formula_table: Option<String>,
    #[serde(default)]
    sensor_table: Option<String>,
    #[serde(default)]
    result_table: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalcConfig {
    /// Only required when running against Postgres.
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub tag_strategy: TagStrategy,
    pub parallel_partitions: bool,
    pub tables: TableNames,
}

impl CalcConfig {
    /// `.env`, then process env, then the optional JSON setup file, then defaults.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = setup_config_path()
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();
        Self::resolve(&|key| std::env::var(key).ok(), &overrides)
    }

    fn resolve(
        env: &dyn Fn(&str) -> Option<String>,
        overrides: &SetupConfigOverrides,
    ) -> Result<Self> {
        let database_url = env_optional_string(env, "CALC_DATABASE_URL")
            .or_else(|| env_optional_string(env, "DATABASE_URL"))
            .or_else(|| non_empty(overrides.database_url.as_deref()));
        let db_pool_size = env_u32(env, "CALC_DB_POOL_SIZE")
            .or(overrides.db_pool_size)
            .unwrap_or(DEFAULT_DB_POOL_SIZE)
            .clamp(1, 64);

        let strategy = env_optional_string(env, "CALC_TAG_STRATEGY")
            .or_else(|| non_empty(overrides.tag_strategy.as_deref()))
            .unwrap_or_else(|| "free_form".to_string());
        let tag_length = env_usize(env, "CALC_PATTERN_TAG_LENGTH")
            .or(overrides.pattern_tag_length)
            .unwrap_or(DEFAULT_PATTERN_TAG_LENGTH);
        let tag_strategy = parse_tag_strategy(&strategy, tag_length)?;

        let parallel_partitions = env_bool(env, "CALC_PARALLEL_PARTITIONS")
            .or(overrides.parallel_partitions)
            .unwrap_or(false);

        let defaults = TableNames::default();
        let tables = TableNames {
            formulas: env_optional_string(env, "CALC_FORMULA_TABLE")
                .or_else(|| non_empty(overrides.formula_table.as_deref()))
                .unwrap_or(defaults.formulas),
            readings: env_optional_string(env, "CALC_SENSOR_TABLE")
                .or_else(|| non_empty(overrides.sensor_table.as_deref()))
                .unwrap_or(defaults.readings),
            results: env_optional_string(env, "CALC_RESULT_TABLE")
                .or_else(|| non_empty(overrides.result_table.as_deref()))
                .unwrap_or(defaults.results),
        };
        tables.validate()?;

        Ok(Self {
            database_url,
            db_pool_size,
            tag_strategy,
            parallel_partitions,
            tables,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("CALC_DATABASE_URL (or DATABASE_URL) must be set to run against Postgres")
    }
}

fn parse_tag_strategy(raw: &str, tag_length: usize) -> Result<TagStrategy> {
    match raw.trim().to_lowercase().replace('-', "_").as_str() {
        "free_form" | "freeform" => Ok(TagStrategy::FreeForm),
        "pattern" => {
            if tag_length == 0 {
                anyhow::bail!("CALC_PATTERN_TAG_LENGTH must be greater than zero");
            }
            Ok(TagStrategy::Pattern { tag_length })
        }
        other => {
            anyhow::bail!("unknown CALC_TAG_STRATEGY {other:?}; expected free_form or pattern")
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn env_optional_string(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    non_empty(env(key).as_deref())
}

fn env_bool(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    match env(key).map(|value| value.trim().to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" => Some(true),
        Some(value) if value == "0" || value == "false" || value == "no" => Some(false),
        _ => None,
    }
}

fn env_u32(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    env(key).and_then(|value| value.trim().parse::<u32>().ok())
}

fn env_usize(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    env(key).and_then(|value| value.trim().parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn resolve(vars: &[(&str, &str)], overrides: &SetupConfigOverrides) -> Result<CalcConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        CalcConfig::resolve(&|key| vars.get(key).cloned(), overrides)
    }

    #[test]
    fn defaults_without_env_or_setup_file() {
        let config = resolve(&[], &SetupConfigOverrides::default()).expect("config");
        assert_eq!(config.database_url, None);
        assert_eq!(config.db_pool_size, DEFAULT_DB_POOL_SIZE);
        assert_eq!(config.tag_strategy, TagStrategy::FreeForm);
        assert!(!config.parallel_partitions);
        assert_eq!(config.tables, TableNames::default());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn env_values_are_parsed() {
        let config = resolve(
            &[
                ("DATABASE_URL", "postgres://fallback"),
                ("CALC_DATABASE_URL", " postgres://calc "),
                ("CALC_DB_POOL_SIZE", "4"),
                ("CALC_TAG_STRATEGY", "Pattern"),
                ("CALC_PATTERN_TAG_LENGTH", "9"),
                ("CALC_PARALLEL_PARTITIONS", "yes"),
                ("CALC_RESULT_TABLE", "calc.results"),
            ],
            &SetupConfigOverrides::default(),
        )
        .expect("config");
        assert_eq!(config.require_database_url().expect("url"), "postgres://calc");
        assert_eq!(config.db_pool_size, 4);
        assert_eq!(config.tag_strategy, TagStrategy::Pattern { tag_length: 9 });
        assert!(config.parallel_partitions);
        assert_eq!(config.tables.results, "calc.results");
        assert_eq!(config.tables.formulas, TableNames::default().formulas);
    }

    #[test]
    fn env_wins_over_setup_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"database_url": "postgres://setup", "tag_strategy": "pattern",
                "pattern_tag_length": 8, "parallel_partitions": true,
                "sensor_table": "plant.readings"}}"#
        )
        .expect("write");
        let overrides = load_setup_config_overrides(file.path()).expect("overrides");

        let config = resolve(&[("CALC_PATTERN_TAG_LENGTH", "7")], &overrides).expect("config");
        assert_eq!(config.database_url.as_deref(), Some("postgres://setup"));
        assert_eq!(config.tag_strategy, TagStrategy::Pattern { tag_length: 7 });
        assert!(config.parallel_partitions);
        assert_eq!(config.tables.readings, "plant.readings");

        let config = resolve(&[("CALC_PARALLEL_PARTITIONS", "0")], &overrides).expect("config");
        assert!(!config.parallel_partitions);
    }

    #[test]
    fn unreadable_setup_file_falls_back_to_env() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write");
        assert!(load_setup_config_overrides(file.path()).is_none());
        assert!(load_setup_config_overrides(Path::new("/nonexistent/calc/config.json")).is_none());
    }

    #[test]
    fn rejects_bad_strategy_and_table_names() {
        let err = resolve(&[("CALC_TAG_STRATEGY", "regex")], &SetupConfigOverrides::default())
            .expect_err("strategy");
        assert!(err.to_string().contains("CALC_TAG_STRATEGY"));

        let err = resolve(
            &[("CALC_TAG_STRATEGY", "pattern"), ("CALC_PATTERN_TAG_LENGTH", "0")],
            &SetupConfigOverrides::default(),
        )
        .expect_err("zero length");
        assert!(err.to_string().contains("greater than zero"));

        let err = resolve(&[("CALC_FORMULA_TABLE", "x;y")], &SetupConfigOverrides::default())
            .expect_err("table");
        assert!(err.to_string().contains("formula table"));
    }
}
